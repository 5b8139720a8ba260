//! Multi-threaded properties: per-producer FIFO, no loss, no duplication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use vigil_queue::Queue;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `producers` threads enqueueing `per_producer` tagged values each while
/// `consumers` threads drain, and returns every value each consumer saw in
/// the order it saw them.
fn run_mpmc(producers: usize, consumers: usize, per_producer: usize) -> Vec<Vec<(usize, usize)>> {
    let q = Arc::new(Queue::new());
    let done = Arc::new(AtomicBool::new(false));

    let producer_handles: Vec<_> = (0..producers)
        .map(|p| {
            let q = q.clone();
            thread::spawn(move || {
                for seq in 0..per_producer {
                    q.enqueue((p, seq));
                }
            })
        })
        .collect();

    let consumer_handles: Vec<_> = (0..consumers)
        .map(|_| {
            let q = q.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match q.dequeue() {
                        Some(item) => seen.push(item),
                        // Check the flag before the final dequeue so nothing
                        // enqueued before shutdown is missed.
                        None if done.load(Ordering::Acquire) => match q.dequeue() {
                            Some(item) => seen.push(item),
                            None => break,
                        },
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for handle in producer_handles {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Release);

    consumer_handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect()
}

fn assert_exactly_once(seen: &[Vec<(usize, usize)>], producers: usize, per_producer: usize) {
    let mut bitmap = vec![false; producers * per_producer];
    for &(p, seq) in seen.iter().flatten() {
        let slot = &mut bitmap[p * per_producer + seq];
        assert!(!*slot, "value ({p}, {seq}) dequeued twice");
        *slot = true;
    }
    let missing = bitmap.iter().filter(|hit| !**hit).count();
    assert_eq!(missing, 0, "{missing} values were lost");
}

/// Each consumer must see any single producer's values in increasing order.
fn assert_per_producer_order(seen: &[Vec<(usize, usize)>], producers: usize) {
    for consumer in seen {
        let mut last = vec![None; producers];
        for &(p, seq) in consumer {
            if let Some(prev) = last[p] {
                assert!(seq > prev, "producer {p}: {seq} after {prev}");
            }
            last[p] = Some(seq);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_single_producer_fifo_with_concurrent_consumers() {
    init_tracing();
    let seen = run_mpmc(1, 4, 20_000);
    assert_exactly_once(&seen, 1, 20_000);
    assert_per_producer_order(&seen, 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_no_loss_no_duplication() {
    init_tracing();
    let seen = run_mpmc(4, 4, 10_000);
    assert_exactly_once(&seen, 4, 10_000);
    assert_per_producer_order(&seen, 4);
}

#[test]
fn test_small_mpmc() {
    // Sized for Miri.
    let seen = run_mpmc(2, 2, 50);
    assert_exactly_once(&seen, 2, 50);
    assert_per_producer_order(&seen, 2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_sum() {
    let q = Arc::new(Queue::new());
    let total = 40_000u64;
    let producers = 4u64;
    let consumers = 4u64;

    let mut handles = vec![];
    for p in 0..producers {
        let q = q.clone();
        handles.push(thread::spawn(move || {
            for i in 0..(total / producers) {
                q.enqueue(p * (total / producers) + i);
            }
        }));
    }

    let sum = Arc::new(AtomicU64::new(0));
    for _ in 0..consumers {
        let q = q.clone();
        let sum = sum.clone();
        handles.push(thread::spawn(move || {
            let mut local = 0u64;
            for _ in 0..(total / consumers) {
                loop {
                    if let Some(v) = q.dequeue() {
                        local += v;
                        break;
                    }
                    thread::yield_now();
                }
            }
            sum.fetch_add(local, Ordering::Relaxed);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(sum.load(Ordering::SeqCst), (0..total).sum::<u64>());
    assert!(q.dequeue().is_none());
}

/// Mixed enqueue/dequeue on every thread for a fixed time, with every value
/// that went in coming out exactly once.
#[test]
#[cfg_attr(miri, ignore)]
fn test_timed_stress() {
    init_tracing();
    const THREADS: usize = 8;
    let q = Arc::new(Queue::new());
    let enqueued = Arc::new(AtomicUsize::new(0));
    let dequeued = Arc::new(AtomicUsize::new(0));
    let deadline = Instant::now() + Duration::from_millis(500);

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let q = q.clone();
            let enqueued = enqueued.clone();
            let dequeued = dequeued.clone();
            thread::spawn(move || {
                let mut i = 0usize;
                while Instant::now() < deadline {
                    if (tid + i) % 3 == 0 {
                        if q.dequeue().is_some() {
                            dequeued.fetch_add(1, Ordering::Relaxed);
                        }
                    } else {
                        q.enqueue(tid);
                        enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    i += 1;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut left = 0;
    while q.dequeue().is_some() {
        left += 1;
    }
    assert_eq!(
        dequeued.load(Ordering::SeqCst) + left,
        enqueued.load(Ordering::SeqCst)
    );
}
