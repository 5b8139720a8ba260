//! Thread slots and the global registry.
//!
//! Each registered thread owns one [`ThreadSlot`] holding the epoch it is
//! pinned at, or [`QUIESCENT`] when it is outside every critical section.
//! Slots live in an append-only chain of pages that is never freed, so a slot
//! reference handed out at registration stays valid for the whole process and
//! the number of threads is bounded only by memory.

use crate::retired::Bag;
use crate::ttas::TTas;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};
use once_cell::race::OnceBox;
use portable_atomic::AtomicU64;

/// Slot value of a thread that is not pinned. Real epochs start at 1.
pub(crate) const QUIESCENT: u64 = 0;

/// Slots per registry page.
pub(crate) const SLOTS_PER_PAGE: usize = 64;

/// Retirements per thread before the batch is sealed into a bag.
pub(crate) const BAG_CAPACITY: usize = 64;

/// Outermost pins per thread between two collections.
pub(crate) const COLLECT_FREQ: usize = 128;

/// One thread's published epoch. Padded so neighbouring threads do not share
/// a cache line while pinning.
#[repr(align(128))]
pub(crate) struct ThreadSlot {
    epoch: AtomicU64,
    /// Guards still alive after their thread's handle was destroyed. The
    /// slot stays pinned and registered until the last of them drops.
    stray_guards: AtomicUsize,
}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(QUIESCENT),
            stray_guards: AtomicUsize::new(0),
        }
    }

    /// Called by a dying handle that still has `count` live guards.
    pub(crate) fn hand_over_guards(&self, count: usize) {
        self.stray_guards.store(count, Ordering::Relaxed);
    }

    /// Drops one stray guard. Returns `true` for the last one, whose owner
    /// must unpin and unregister the slot.
    pub(crate) fn release_stray_guard(&self) -> bool {
        let left = self.stray_guards.load(Ordering::Relaxed);
        debug_assert!(left > 0, "stray guard released on a slot without any");
        self.stray_guards.store(left.saturating_sub(1), Ordering::Relaxed);
        left <= 1
    }

    /// Publishes `epoch` as this thread's pinned epoch.
    ///
    /// The `SeqCst` fence orders the store before every pointer load of the
    /// critical section, and pairs with the fence in [`Registry::try_advance`].
    #[inline]
    pub(crate) fn pin(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        self.epoch.store(QUIESCENT, Ordering::Release);
    }

    #[inline]
    pub(crate) fn load(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

struct SlotPage {
    slots: [ThreadSlot; SLOTS_PER_PAGE],
    next: AtomicPtr<SlotPage>,
}

impl SlotPage {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ThreadSlot::new()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Global reclamation state.
pub(crate) struct Registry {
    /// Global epoch, starts at 1 and only grows.
    epoch: AtomicU64,
    pages: SlotPage,
    next_tid: AtomicUsize,
    free_tids: TTas<Vec<usize>>,
    /// Bags whose owner thread exited before they expired.
    orphans: TTas<Vec<Bag>>,
    orphan_count: AtomicUsize,
}

impl Registry {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(1),
            pages: SlotPage::new(),
            next_tid: AtomicUsize::new(0),
            free_tids: TTas::new(Vec::new()),
            orphans: TTas::new(Vec::new()),
            orphan_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Global epoch as seen by a retiring thread, ordered after the unlink
    /// that made the garbage unreachable.
    #[inline]
    pub(crate) fn seal_epoch(&self) -> u64 {
        fence(Ordering::SeqCst);
        self.epoch.load(Ordering::Relaxed)
    }

    /// Hands out a thread id and its slot, recycling ids of exited threads.
    pub(crate) fn register(&'static self) -> (usize, &'static ThreadSlot) {
        let recycled = self.free_tids.lock().pop();
        let tid = recycled.unwrap_or_else(|| self.next_tid.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(tid, recycled = recycled.is_some(), "registered thread slot");
        (tid, self.slot(tid))
    }

    /// Returns `tid` to the pool. The slot must already be quiescent.
    pub(crate) fn unregister(&self, tid: usize) {
        self.free_tids.lock().push(tid);
        tracing::trace!(tid, "released thread slot");
    }

    /// Slot for `tid`, growing the page chain on demand.
    fn slot(&'static self, tid: usize) -> &'static ThreadSlot {
        let mut page = &self.pages;
        for _ in 0..tid / SLOTS_PER_PAGE {
            let mut next = page.next.load(Ordering::Acquire);
            if next.is_null() {
                let fresh = Box::into_raw(Box::new(SlotPage::new()));
                match page.next.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => next = fresh,
                    Err(winner) => {
                        // SAFETY: `fresh` was never published.
                        unsafe { drop(Box::from_raw(fresh)) };
                        next = winner;
                    }
                }
            }
            // SAFETY: pages are leaked for the lifetime of the registry.
            page = unsafe { &*next };
        }
        &page.slots[tid % SLOTS_PER_PAGE]
    }

    fn slots(&'static self) -> impl Iterator<Item = &'static ThreadSlot> {
        let mut page = Some(&self.pages);
        core::iter::from_fn(move || {
            let current = page?;
            let next = current.next.load(Ordering::Acquire);
            // SAFETY: pages are leaked for the lifetime of the registry.
            page = unsafe { next.as_ref() };
            Some(current.slots.iter())
        })
        .flatten()
    }

    /// Advances the global epoch if every pinned thread has observed the
    /// current one. Returns the global epoch after the attempt.
    pub(crate) fn try_advance(&'static self) -> u64 {
        let global = self.epoch.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);

        for slot in self.slots() {
            let local = slot.load();
            if local != QUIESCENT && local != global {
                return global;
            }
        }
        fence(Ordering::Acquire);

        match self.epoch.compare_exchange(
            global,
            global + 1,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                tracing::trace!(epoch = global + 1, "advanced global epoch");
                global + 1
            }
            Err(current) => current,
        }
    }

    pub(crate) fn push_orphans(&self, bags: impl IntoIterator<Item = Bag>) {
        let mut orphans = self.orphans.lock();
        let before = orphans.len();
        orphans.extend(bags);
        let added = orphans.len() - before;
        if added > 0 {
            self.orphan_count.fetch_add(added, Ordering::Release);
            tracing::debug!(bags = added, "orphaned garbage bags");
        }
    }

    /// Takes every orphaned bag, or nothing if another thread is adopting.
    pub(crate) fn adopt_orphans(&self) -> Vec<Bag> {
        if self.orphan_count.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let Some(mut orphans) = self.orphans.try_lock() else {
            return Vec::new();
        };
        let adopted = core::mem::take(&mut *orphans);
        self.orphan_count.fetch_sub(adopted.len(), Ordering::Release);
        drop(orphans);
        tracing::debug!(bags = adopted.len(), "adopted orphaned garbage bags");
        adopted
    }
}

static GLOBAL: OnceBox<Registry> = OnceBox::new();

#[inline]
pub(crate) fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| Box::new(Registry::new()))
}
