//! Guards, the thread-local handle, and the retire/collect protocol.
//!
//! - Pin: publish the global epoch in the thread's slot (outermost guard only)
//! - Unpin: mark the slot quiescent when the outermost guard drops
//! - Retire: thread the node onto the local batch, seal full batches into bags
//! - Collect: try to advance the epoch, adopt orphans, free expired bags
//!
//! A thread whose handle is already destroyed (inside another thread-local's
//! destructor) still pins, through a temporary slot of its own.

use crate::reclaim::{self, Reclaimable};
use crate::retired::{Bag, RetiredNode};
use crate::slot::{self, BAG_CAPACITY, COLLECT_FREQ, Registry, ThreadSlot};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::ptr;

/// RAII guard for a critical section.
///
/// While a `Guard` is alive, no node that was reachable when it was created
/// is freed, so every `Shared<'g, T>` loaded through it stays valid. Guards
/// nest: only the outermost one publishes and clears the thread's epoch.
///
/// A `Guard` is tied to the thread that created it and is not `Send`.
pub struct Guard {
    tid: usize,
    slot: &'static ThreadSlot,
    /// Pinned through a slot of its own because the thread handle was gone.
    detached: bool,
    _not_send: PhantomData<*mut ()>,
}

impl Guard {
    #[inline]
    fn new(tid: usize, slot: &'static ThreadSlot, detached: bool) -> Self {
        Self {
            tid,
            slot,
            detached,
            _not_send: PhantomData,
        }
    }

    /// Pins a temporary slot, for threads whose handle is already destroyed
    /// (e.g. inside another thread-local's destructor).
    #[cold]
    fn detached() -> Self {
        let registry = slot::global();
        let (tid, slot) = registry.register();
        slot.pin(registry.epoch());
        tracing::trace!(tid, "pinned without a thread handle");
        Self::new(tid, slot, true)
    }

    fn release_slot(&self) {
        self.slot.unpin();
        slot::global().unregister(self.tid);
    }
}

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        if self.detached {
            self.release_slot();
            return;
        }
        match HANDLE.try_with(Handle::unpin) {
            Ok(()) => {}
            // The handle died first and left the slot pinned. The last guard
            // standing gives it back.
            Err(_) => {
                if self.slot.release_stray_guard() {
                    self.release_slot();
                }
            }
        }
    }
}

impl core::fmt::Debug for Guard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Guard { .. }")
    }
}

/// Per-thread reclamation state.
struct Handle {
    registry: Cell<Option<&'static Registry>>,
    /// Thread id and slot, registered on first pin.
    local: Cell<Option<(usize, &'static ThreadSlot)>>,
    /// Live guards on this thread.
    pin_count: Cell<usize>,
    pins_since_collect: Cell<usize>,
    /// Unsealed retirements, linked through their headers.
    batch_first: Cell<*mut RetiredNode>,
    batch_len: Cell<usize>,
    /// Sealed bags in the order they were sealed.
    bags: RefCell<VecDeque<Bag>>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            registry: Cell::new(None),
            local: Cell::new(None),
            pin_count: Cell::new(0),
            pins_since_collect: Cell::new(0),
            batch_first: Cell::new(ptr::null_mut()),
            batch_len: Cell::new(0),
            bags: RefCell::new(VecDeque::new()),
        }
    }

    #[inline]
    fn registry(&self) -> &'static Registry {
        match self.registry.get() {
            Some(registry) => registry,
            None => {
                let registry = slot::global();
                self.registry.set(Some(registry));
                registry
            }
        }
    }

    #[inline]
    fn local(&self) -> (usize, &'static ThreadSlot) {
        match self.local.get() {
            Some(local) => local,
            None => {
                let local = self.registry().register();
                self.local.set(Some(local));
                local
            }
        }
    }

    fn pin(&self) -> Guard {
        let (tid, slot) = self.local();
        let count = self.pin_count.get();
        self.pin_count.set(count + 1);
        if count > 0 {
            return Guard::new(tid, slot, false);
        }

        slot.pin(self.registry().epoch());

        let pins = self.pins_since_collect.get() + 1;
        if pins >= COLLECT_FREQ {
            self.pins_since_collect.set(0);
            self.collect();
        } else {
            self.pins_since_collect.set(pins);
        }
        Guard::new(tid, slot, false)
    }

    fn unpin(&self) {
        let count = self.pin_count.get();
        debug_assert!(count > 0, "guard dropped with pin_count == 0");
        self.pin_count.set(count - 1);
        if count == 1 {
            if let Some((_, slot)) = self.local.get() {
                slot.unpin();
            }
        }
    }
    /// # Safety
    ///
    /// See [`retire`].
    unsafe fn retire<T: Reclaimable>(&self, ptr: *mut T) {
        let node = ptr.cast::<RetiredNode>();
        unsafe { RetiredNode::prepare(node, self.batch_first.get(), reclaim::destroy::<T>) };
        self.batch_first.set(node);

        let len = self.batch_len.get() + 1;
        self.batch_len.set(len);
        if len >= BAG_CAPACITY {
            self.seal();
            self.collect();
        }
    }

    /// Moves the current batch into a bag stamped with the global epoch.
    fn seal(&self) {
        let len = self.batch_len.get();
        if len == 0 {
            return;
        }
        let first = self.batch_first.replace(ptr::null_mut());
        self.batch_len.set(0);

        let epoch = self.registry().seal_epoch();
        // SAFETY: the batch chain holds exactly `len` prepared nodes.
        let bag = unsafe { Bag::from_chain(epoch, first, len) };
        self.bags.borrow_mut().push_back(bag);
    }

    /// Frees every bag that has expired. Returns the number of nodes freed.
    fn collect(&self) -> usize {
        let registry = self.registry();
        let global = registry.try_advance();

        let expired: Vec<Bag> = {
            let mut bags = self.bags.borrow_mut();
            bags.extend(registry.adopt_orphans());

            let mut expired = Vec::new();
            for _ in 0..bags.len() {
                let Some(bag) = bags.pop_front() else { break };
                if bag.is_expired(global) {
                    expired.push(bag);
                } else {
                    bags.push_back(bag);
                }
            }
            expired
        };

        // Destructors may pin or retire again, so no borrow is held here.
        expired
            .into_iter()
            // SAFETY: expired bags are unreachable to every thread.
            .map(|bag| unsafe { bag.free() })
            .sum()
    }

    fn flush(&self) -> usize {
        self.seal();
        self.collect()
    }

    fn pending(&self) -> usize {
        self.batch_len.get() + self.bags.borrow().iter().map(Bag::len).sum::<usize>()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.seal();

        // Freeing here could run destructors that need this (dying) handle,
        // so whatever is left goes to the orphan list for other threads.
        let bags = core::mem::take(self.bags.get_mut());
        if !bags.is_empty() {
            self.registry().push_orphans(bags);
        }

        let Some((tid, slot)) = self.local.get() else {
            return;
        };
        let guards = self.pin_count.get();
        if guards > 0 {
            slot.hand_over_guards(guards);
            tracing::debug!(tid, guards, "thread handle dropped with live guards");
            return;
        }
        slot.unpin();
        self.registry().unregister(tid);
    }
}

/// Collection for a thread without a handle: frees expired orphans and puts
/// the rest back.
#[cold]
fn collect_detached() -> usize {
    let registry = slot::global();
    let global = registry.try_advance();
    let (expired, waiting): (Vec<Bag>, Vec<Bag>) = registry
        .adopt_orphans()
        .into_iter()
        .partition(|bag| bag.is_expired(global));
    if !waiting.is_empty() {
        registry.push_orphans(waiting);
    }
    expired
        .into_iter()
        // SAFETY: expired bags are unreachable to every thread.
        .map(|bag| unsafe { bag.free() })
        .sum()
}

std::thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Enters a critical section.
///
/// Every pointer loaded through the returned [`Guard`] stays valid until the
/// guard is dropped, even if another thread unlinks and retires it meanwhile.
///
/// # Examples
///
/// ```
/// let guard = vigil::pin();
/// // lock-free reads go here
/// drop(guard);
/// ```
#[inline]
pub fn pin() -> Guard {
    HANDLE
        .try_with(Handle::pin)
        .unwrap_or_else(|_| Guard::detached())
}

/// Retires a node: it is freed with [`Reclaimable::dealloc`] once no thread
/// can still hold a reference obtained before this call.
///
/// Retirement never fails. If the calling thread is already tearing down its
/// thread-locals, the node is handed straight to the orphan list.
///
/// # Safety
///
/// - `ptr` must be valid and already unlinked, so that threads pinning after
///   this call cannot reach it.
/// - `ptr` must not be retired more than once, and the caller must not use it
///   afterwards outside the guard it was loaded under.
#[inline]
pub unsafe fn retire<T: Reclaimable + 'static>(ptr: *mut T) {
    // SAFETY: the caller upholds the contract.
    if HANDLE.try_with(|handle| unsafe { handle.retire(ptr) }).is_err() {
        let node = ptr.cast::<RetiredNode>();
        let registry = slot::global();
        unsafe {
            RetiredNode::prepare(node, ptr::null_mut(), reclaim::destroy::<T>);
            registry.push_orphans([Bag::from_chain(registry.seal_epoch(), node, 1)]);
        }
    }
}

/// Seals this thread's pending retirements and frees whatever has expired.
///
/// Returns the number of nodes freed. Nodes retired while some thread is
/// still pinned stay pending; call again once that thread has moved on.
pub fn flush() -> usize {
    HANDLE
        .try_with(Handle::flush)
        .unwrap_or_else(|_| collect_detached())
}

/// Number of nodes this thread has retired that are not freed yet.
///
/// Zero once the thread's handle is destroyed, since its garbage has been
/// handed to other threads by then.
pub fn pending() -> usize {
    HANDLE.try_with(Handle::pending).unwrap_or(0)
}
