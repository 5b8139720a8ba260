//! Vigil: epoch-based memory reclamation for lock-free data structures.
//!
//! A thread enters a critical section with [`pin`]. While the returned
//! [`Guard`] lives, nothing it could have observed is freed. Nodes unlinked
//! from a shared structure are handed to [`retire`] and destroyed once every
//! thread that might still see them has left its critical section.
//!
//! # Key Properties
//!
//! - **Cheap reads**: loading through an [`Atomic`] is a single atomic load
//! - **Lock-free**: pin, unpin and retire never block on other threads
//! - **No thread limit**: thread slots live in a growable page chain
//! - **Batched retirement**: retired nodes are sealed into bags of 64 and freed
//!   together, so retiring does not allocate
//!
//! # Reclamation policy
//!
//! Every pinned thread publishes the global epoch it observed. The global
//! epoch advances only when all pinned threads have observed the current
//! value, and a bag sealed at epoch `e` is freed once the global epoch
//! reaches `e + 2`. Garbage left behind by an exited thread is orphaned and
//! adopted by the next thread that collects.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::Ordering;
//! use vigil::{Atomic, Reclaimable, RetiredNode, Shared, pin, retire};
//!
//! #[repr(C)]
//! struct Node {
//!     retired: RetiredNode,
//!     value: u64,
//! }
//!
//! unsafe impl Reclaimable for Node {
//!     fn retired_node(&self) -> &RetiredNode {
//!         &self.retired
//!     }
//! }
//!
//! let slot = Atomic::new(Box::into_raw(Box::new(Node { retired: RetiredNode::new(), value: 1 })));
//! let fresh = Box::into_raw(Box::new(Node { retired: RetiredNode::new(), value: 2 }));
//!
//! let guard = pin();
//! let old = slot.swap(unsafe { Shared::from_raw(fresh) }, Ordering::AcqRel, &guard);
//! assert_eq!(unsafe { old.deref() }.value, 1);
//! unsafe { retire(old.as_raw()) };
//! drop(guard);
//!
//! let guard = pin();
//! let current = slot.load(Ordering::Acquire, &guard);
//! assert_eq!(unsafe { current.deref() }.value, 2);
//! # let raw = current.as_raw();
//! # drop(guard);
//! # unsafe { drop(Box::from_raw(raw)) };
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod atomic;
mod guard;
mod reclaim;
mod retired;
mod slot;
mod ttas;

pub use atomic::{Atomic, Shared};
pub use guard::{Guard, flush, pending, pin, retire};
pub use reclaim::Reclaimable;
pub use retired::RetiredNode;

pub use core::sync::atomic::Ordering;
