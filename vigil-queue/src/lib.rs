//! Lock-free MPMC queue built on [`vigil`] epoch reclamation.
//!
//! [`Queue`] is the Michael–Scott queue: an unbounded linked list with a
//! sentinel, where producers CAS the last node's `next` link and consumers
//! CAS `head`. Neither side ever takes a lock, and a consumer finding the
//! queue empty returns `None` at once instead of waiting.
//!
//! ## Features
//!
//! - `census`: every queue counts the nodes it has allocated and not yet
//!   freed, exposed as `Queue::live_nodes`. Useful to check that drained
//!   queues give their memory back.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use vigil_queue::Queue;
//!
//! let queue = Arc::new(Queue::new());
//! let producers: Vec<_> = (0..4)
//!     .map(|p| {
//!         let queue = queue.clone();
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 queue.enqueue(p * 100 + i);
//!             }
//!         })
//!     })
//!     .collect();
//! for producer in producers {
//!     producer.join().unwrap();
//! }
//!
//! let mut seen = 0;
//! while queue.dequeue().is_some() {
//!     seen += 1;
//! }
//! assert_eq!(seen, 400);
//! ```

#![warn(missing_docs)]

mod backoff;
mod error;
pub mod ms_queue;
mod utils;

pub use backoff::BackoffConfig;
pub use error::AllocError;
pub use ms_queue::{IntoIter, Queue};
