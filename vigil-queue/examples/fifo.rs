//! Runs the queue single-threaded, then with several producers and consumers.
//!
//! `RUST_LOG=vigil=trace,vigil_queue=trace cargo run --example fifo` shows the
//! reclamation events as threads come and go.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;
use vigil_queue::Queue;

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 4;
const PER_PRODUCER: usize = 100_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let queue = Queue::new();
    for i in 1..=3 {
        queue.enqueue(i);
    }
    while let Some(value) = queue.dequeue() {
        println!("dequeued {value}");
    }
    println!("empty: {}", queue.is_empty());

    let queue = Arc::new(Queue::new());
    let done = Arc::new(AtomicBool::new(false));
    let received = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            let received = received.clone();
            thread::spawn(move || {
                loop {
                    if queue.dequeue().is_some() {
                        received.fetch_add(1, Ordering::Relaxed);
                    } else if done.load(Ordering::Acquire) && queue.is_empty() {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer panicked");
    }
    done.store(true, Ordering::Release);
    for consumer in consumers {
        consumer.join().expect("consumer panicked");
    }

    println!(
        "{} values through {PRODUCERS} producers and {CONSUMERS} consumers in {:?}",
        received.load(Ordering::Relaxed),
        start.elapsed()
    );
    println!("reclaimed on main thread: {}", vigil::flush());
}
