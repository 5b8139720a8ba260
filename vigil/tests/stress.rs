//! Stress tests for the reclamation scheme.
//!
//! Every node carries a canary that its destructor overwrites, so a reader
//! that observes a freed node fails loudly instead of silently reading junk.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use vigil::{Atomic, Reclaimable, RetiredNode, Shared, flush, pin, retire};

const CANARY: u64 = 0x5EED_CAFE_F00D_D00D;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[repr(C)]
struct StressNode {
    retired: RetiredNode,
    canary: u64,
    value: usize,
    drops: Arc<AtomicUsize>,
}

unsafe impl Reclaimable for StressNode {
    fn retired_node(&self) -> &RetiredNode {
        &self.retired
    }
}

impl StressNode {
    fn new(value: usize, drops: &Arc<AtomicUsize>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            retired: RetiredNode::new(),
            canary: CANARY,
            value,
            drops: drops.clone(),
        }))
    }
}

impl Drop for StressNode {
    fn drop(&mut self) {
        assert_eq!(self.canary, CANARY, "node destroyed twice");
        self.canary = 0;
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Swaps `fresh` in and retires whatever was there.
fn replace(atomic: &Atomic<StressNode>, fresh: *mut StressNode) {
    let guard = pin();
    let old = atomic.swap(unsafe { Shared::from_raw(fresh) }, Ordering::AcqRel, &guard);
    if !old.is_null() {
        unsafe { retire(old.as_raw()) };
    }
}

fn drain(atomic: &Atomic<StressNode>, drops: &AtomicUsize, allocated: usize) {
    replace(atomic, std::ptr::null_mut());
    for _ in 0..100_000 {
        flush();
        if drops.load(Ordering::SeqCst) == allocated {
            break;
        }
        thread::yield_now();
    }
    assert_eq!(drops.load(Ordering::SeqCst), allocated, "retired nodes leaked");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_high_contention() {
    init_tracing();
    const NUM_THREADS: usize = 16;
    const ITERATIONS: usize = 20_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(Atomic::new(StressNode::new(0, &drops)));

    let start = Instant::now();
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let atomic = atomic.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    replace(&atomic, StressNode::new(tid * ITERATIONS + i, &drops));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    println!(
        "high contention: {} swaps in {:?}",
        NUM_THREADS * ITERATIONS,
        start.elapsed()
    );

    drain(&atomic, &drops, NUM_THREADS * ITERATIONS + 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_read_heavy_workload() {
    init_tracing();
    const NUM_THREADS: usize = 8;
    const ITERATIONS: usize = 50_000;
    const WRITE_RATIO: usize = 20;

    let drops = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(Atomic::new(StressNode::new(0, &drops)));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let atomic = atomic.clone();
            let drops = drops.clone();
            let writes = writes.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    if i % WRITE_RATIO == 0 {
                        replace(&atomic, StressNode::new(tid * ITERATIONS + i, &drops));
                        writes.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let guard = pin();
                        let ptr = atomic.load(Ordering::Acquire, &guard);
                        if let Some(node) = unsafe { ptr.as_ref() } {
                            assert_eq!(node.canary, CANARY, "read a freed node");
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    drain(&atomic, &drops, writes.load(Ordering::SeqCst) + 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_long_running_guards() {
    init_tracing();
    const NUM_LONG: usize = 2;
    const NUM_SHORT: usize = 6;
    const SHORT_ITERATIONS: usize = 10_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(Atomic::new(StressNode::new(0, &drops)));
    let done = Arc::new(AtomicBool::new(false));

    let long: Vec<_> = (0..NUM_LONG)
        .map(|_| {
            let atomic = atomic.clone();
            let done = done.clone();
            thread::spawn(move || {
                let guard = pin();
                let first = atomic.load(Ordering::Acquire, &guard);
                while !done.load(Ordering::Relaxed) {
                    // The first node must survive for as long as we stay pinned.
                    if let Some(node) = unsafe { first.as_ref() } {
                        assert_eq!(node.canary, CANARY, "pinned node was freed");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })
        })
        .collect();

    let short: Vec<_> = (0..NUM_SHORT)
        .map(|tid| {
            let atomic = atomic.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                for i in 0..SHORT_ITERATIONS {
                    replace(&atomic, StressNode::new(tid * SHORT_ITERATIONS + i, &drops));
                }
            })
        })
        .collect();

    for handle in short {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    for handle in long {
        handle.join().unwrap();
    }

    drain(&atomic, &drops, NUM_SHORT * SHORT_ITERATIONS + 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_oversubscription() {
    init_tracing();
    let num_cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let num_threads = num_cores * 4;
    const ITERATIONS: usize = 5_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(Atomic::new(StressNode::new(0, &drops)));

    let handles: Vec<_> = (0..num_threads)
        .map(|tid| {
            let atomic = atomic.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    replace(&atomic, StressNode::new(tid * ITERATIONS + i, &drops));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    drain(&atomic, &drops, num_threads * ITERATIONS + 1);
}

#[test]
fn test_small_swap_run() {
    // Sized for Miri.
    let drops = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(Atomic::new(StressNode::new(0, &drops)));

    let handles: Vec<_> = (0..2)
        .map(|tid| {
            let atomic = atomic.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                for i in 0..20 {
                    replace(&atomic, StressNode::new(tid * 20 + i, &drops));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    drain(&atomic, &drops, 41);
}
