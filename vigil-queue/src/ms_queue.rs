//! Michael–Scott unbounded MPMC queue.
//!
//! The queue is a singly linked list that always starts with a sentinel node.
//! `head` points at the sentinel, and the front value lives in the node after
//! it. `tail` points at the last node or, briefly, at its predecessor. Any
//! thread that sees a lagging `tail` swings it forward before going on.
//!
//! Removed sentinels are handed to `vigil`, which frees them once no thread
//! that could still be reading them is pinned.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::AllocError;
use crate::utils::CacheAligned;
use std::alloc::{self, Layout};
use std::fmt;
use std::iter::FusedIterator;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;
use tracing::{trace, warn};
use vigil::{Atomic, Reclaimable, RetiredNode, Shared, pin, retire};

#[cfg(any(test, feature = "census"))]
use std::sync::Arc;
#[cfg(any(test, feature = "census"))]
use std::sync::atomic::AtomicUsize;

#[repr(C)]
struct Node<T> {
    retired: RetiredNode,
    /// Uninitialised in the sentinel, whose value has already been taken.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
    #[cfg(any(test, feature = "census"))]
    census: Arc<AtomicUsize>,
}

unsafe impl<T> Reclaimable for Node<T> {
    fn retired_node(&self) -> &RetiredNode {
        &self.retired
    }
}

#[cfg(any(test, feature = "census"))]
impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        self.census.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An unbounded lock-free multi-producer multi-consumer FIFO queue.
///
/// # Examples
///
/// ```
/// use vigil_queue::Queue;
///
/// let queue = Queue::new();
/// queue.enqueue(1);
/// queue.enqueue(2);
/// assert_eq!(queue.dequeue(), Some(1));
/// assert_eq!(queue.dequeue(), Some(2));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct Queue<T> {
    head: CacheAligned<Atomic<Node<T>>>,
    tail: CacheAligned<Atomic<Node<T>>>,
    backoff: BackoffConfig,
    #[cfg(any(test, feature = "census"))]
    census: Arc<AtomicUsize>,
}

// SAFETY: values are moved between threads but never shared; each one is
// read by exactly one dequeuer.
unsafe impl<T: Send> Send for Queue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T: 'static> Queue<T> {
    /// Creates an empty queue with the default backoff.
    pub fn new() -> Self {
        Self::with_backoff(BackoffConfig::default())
    }

    /// Creates an empty queue that backs off after a lost CAS according to
    /// `config`.
    pub fn with_backoff(config: BackoffConfig) -> Self {
        #[cfg(any(test, feature = "census"))]
        let census = Arc::new(AtomicUsize::new(0));

        let queue = Self {
            head: CacheAligned::new(Atomic::null()),
            tail: CacheAligned::new(Atomic::null()),
            backoff: config,
            #[cfg(any(test, feature = "census"))]
            census,
        };
        let sentinel = match queue.alloc_node(MaybeUninit::uninit()) {
            Ok(node) => node,
            Err(_) => alloc::handle_alloc_error(Layout::new::<Node<T>>()),
        };
        queue.head.store(unsafe { Shared::from_raw(sentinel) }, Ordering::Relaxed);
        queue.tail.store(unsafe { Shared::from_raw(sentinel) }, Ordering::Relaxed);
        queue
    }

    /// The backoff this queue was built with.
    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    /// Appends `value` to the back of the queue.
    ///
    /// Never blocks, and never fails for logical reasons. If the allocator
    /// cannot provide a node this reports through
    /// [`handle_alloc_error`](std::alloc::handle_alloc_error), which aborts
    /// by default. Use [`try_enqueue`](Self::try_enqueue) to recover instead.
    pub fn enqueue(&self, value: T) {
        if self.try_enqueue(value).is_err() {
            alloc::handle_alloc_error(Layout::new::<Node<T>>());
        }
    }

    /// Appends `value` to the back of the queue, or gives it back if no node
    /// could be allocated.
    pub fn try_enqueue(&self, value: T) -> Result<(), AllocError<T>> {
        let node = match self.alloc_node(MaybeUninit::new(value)) {
            Ok(node) => node,
            // SAFETY: handed back untouched, so still initialised.
            Err(value) => return Err(AllocError(unsafe { value.assume_init() })),
        };
        self.link(node);
        Ok(())
    }

    fn alloc_node(&self, value: MaybeUninit<T>) -> Result<*mut Node<T>, MaybeUninit<T>> {
        let layout = Layout::new::<Node<T>>();
        // SAFETY: `Node<T>` always contains a `RetiredNode`, so the layout is
        // never zero-sized.
        let node = unsafe { alloc::alloc(layout) }.cast::<Node<T>>();
        if node.is_null() {
            warn!(size = layout.size(), "queue node allocation failed");
            return Err(value);
        }

        #[cfg(any(test, feature = "census"))]
        self.census.fetch_add(1, Ordering::Relaxed);

        // SAFETY: `node` is freshly allocated for exactly this layout, which
        // matches what `Box::from_raw` expects when the node is freed.
        unsafe {
            node.write(Node {
                retired: RetiredNode::new(),
                value,
                next: Atomic::null(),
                #[cfg(any(test, feature = "census"))]
                census: self.census.clone(),
            });
        }
        Ok(node)
    }

    /// Links a fully initialised node after the current last node.
    fn link(&self, node: *mut Node<T>) {
        let guard = pin();
        // SAFETY: we own `node` until the CAS below publishes it.
        let new = unsafe { Shared::from_raw(node) };
        let mut backoff = Backoff::new(self.backoff);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: `tail` is never null and the guard keeps it alive.
            let t = unsafe { tail.deref() };
            let next = t.next.load(Ordering::Acquire, &guard);

            if tail != self.tail.load(Ordering::Acquire, &guard) {
                continue;
            }

            if !next.is_null() {
                // `tail` lags; help it along and retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            if t
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                return;
            }
            backoff.spin();
        }
    }

    /// Removes and returns the front value, or `None` if the queue was empty.
    ///
    /// Never blocks. An empty queue is left untouched.
    pub fn dequeue(&self) -> Option<T> {
        let guard = pin();
        let mut backoff = Backoff::new(self.backoff);

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: `head` is never null and the guard keeps it alive.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);

            if head != self.head.load(Ordering::Acquire, &guard) {
                continue;
            }

            if next.is_null() {
                return None;
            }

            if head == tail {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // Only the winner of the `head` CAS reads `next`'s value, and
                // `next` is now the sentinel, so nobody reads it again.
                let value = unsafe { next.deref().value.assume_init_read() };
                // SAFETY: `head` is unlinked and was removed exactly once.
                unsafe { retire(head.as_raw()) };
                return Some(value);
            }
            backoff.spin();
        }
    }

    /// Whether the queue looked empty at the moment of the call.
    ///
    /// Concurrent operations may change the answer before it is returned.
    pub fn is_empty(&self) -> bool {
        let guard = pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        // SAFETY: `head` is never null and the guard keeps it alive.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    /// Number of nodes allocated by this queue and not freed yet, sentinel
    /// included. Nodes still waiting for reclamation count as live.
    #[cfg(any(test, feature = "census"))]
    pub fn live_nodes(&self) -> usize {
        self.census.load(Ordering::Relaxed)
    }
}

impl<T> Queue<T> {
    /// Removes the front value through exclusive access. Unlinked nodes are
    /// freed on the spot since no other thread can be reading them.
    fn pop_exclusive(&mut self) -> Option<T> {
        let head = *self.head.get_mut();
        // SAFETY: `&mut self` rules out concurrent access, and every node
        // reachable from `head` is live.
        unsafe {
            let next = *(*head).next.get_mut();
            if next.is_null() {
                return None;
            }
            let value = (*next).value.assume_init_read();
            *self.head.get_mut() = next;
            if *self.tail.get_mut() == head {
                *self.tail.get_mut() = next;
            }
            drop(Box::from_raw(head));
            Some(value)
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut remaining = 0usize;
        while let Some(value) = self.pop_exclusive() {
            drop(value);
            remaining += 1;
        }
        let sentinel = *self.head.get_mut();
        // SAFETY: the sentinel's value was taken or never written, and nodes
        // retired earlier are no longer reachable from `head`.
        unsafe { drop(Box::from_raw(sentinel)) };
        trace!(remaining, "queue dropped");
    }
}

impl<T: 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("is_empty", &self.is_empty())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Extend<T> for Queue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.enqueue(value);
        }
    }
}

impl<T: 'static> FromIterator<T> for Queue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

/// Owning iterator that drains a [`Queue`] front to back.
pub struct IntoIter<T> {
    queue: Queue<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.pop_exclusive()
    }
}

impl<T> FusedIterator for IntoIter<T> {}

impl<T: 'static> fmt::Debug for IntoIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IntoIter").field(&self.queue).finish()
    }
}

impl<T> IntoIterator for Queue<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { queue: self }
    }
}
