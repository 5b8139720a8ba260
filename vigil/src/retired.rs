//! Retired node header and sealed bags.
//!
//! Every reclaimable type starts with a [`RetiredNode`]. Retirement threads the
//! header onto an intrusive thread-local batch, so retiring never allocates.
//! A full batch is sealed into a [`Bag`] stamped with the global epoch.

use core::cell::UnsafeCell;
use core::ptr;

/// Type-erased destructor stored in the header at retire time.
pub(crate) type DestructorFn = unsafe fn(*mut RetiredNode);

/// Header embedded at offset 0 of every reclaimable node.
///
/// The owner never touches these fields; they are written once when the node
/// is retired and read once when it is freed.
#[repr(C)]
pub struct RetiredNode {
    /// Next node in the same batch or bag.
    next: UnsafeCell<*mut RetiredNode>,
    /// Set by `retire`, consumed by `Bag::free`.
    destructor: UnsafeCell<Option<DestructorFn>>,
}

impl RetiredNode {
    /// Creates an empty header. Embed it as the first field of a
    /// `#[repr(C)]` node type.
    pub const fn new() -> Self {
        Self {
            next: UnsafeCell::new(ptr::null_mut()),
            destructor: UnsafeCell::new(None),
        }
    }

    /// Links `node` in front of `next` and records its destructor.
    ///
    /// # Safety
    ///
    /// `node` must be valid and retired exactly once. Only the retiring thread
    /// may call this, and readers never look at the header.
    #[inline]
    pub(crate) unsafe fn prepare(
        node: *mut RetiredNode,
        next: *mut RetiredNode,
        destructor: DestructorFn,
    ) {
        unsafe {
            *(*node).next.get() = next;
            *(*node).destructor.get() = Some(destructor);
        }
    }

    #[inline]
    unsafe fn next(node: *mut RetiredNode) -> *mut RetiredNode {
        unsafe { *(*node).next.get() }
    }

    #[inline]
    unsafe fn destructor(node: *mut RetiredNode) -> Option<DestructorFn> {
        unsafe { *(*node).destructor.get() }
    }
}

impl Default for RetiredNode {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RetiredNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("RetiredNode")
    }
}

// SAFETY: the header is only written by the retiring thread before the node
// becomes garbage, and only read by the single thread that frees the bag.
unsafe impl Send for RetiredNode {}
// SAFETY: see above; concurrent readers of the node never access the header.
unsafe impl Sync for RetiredNode {}

/// A sealed batch of retired nodes.
///
/// `epoch` is the global epoch observed after the nodes became unreachable.
pub(crate) struct Bag {
    pub(crate) epoch: u64,
    first: *mut RetiredNode,
    len: usize,
}

// SAFETY: a bag exclusively owns its nodes; moving it between threads moves
// that ownership (thread exit hands bags to the orphan list).
unsafe impl Send for Bag {}

impl Bag {
    /// # Safety
    ///
    /// `first` must head a chain of exactly `len` prepared nodes that nothing
    /// else owns.
    pub(crate) unsafe fn from_chain(epoch: u64, first: *mut RetiredNode, len: usize) -> Self {
        Self { epoch, first, len }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// A pinned thread witnesses at most one epoch advance, so garbage sealed
    /// at `e` is unreachable to everyone once the global epoch reaches `e + 2`.
    #[inline]
    pub(crate) fn is_expired(&self, global_epoch: u64) -> bool {
        global_epoch.wrapping_sub(self.epoch) >= 2
    }

    /// Runs every destructor in the bag and returns how many nodes were freed.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference to any node in the bag.
    pub(crate) unsafe fn free(self) -> usize {
        let mut curr = self.first;
        let mut freed = 0;
        while !curr.is_null() {
            // Read the link before the destructor releases the allocation.
            let next = unsafe { RetiredNode::next(curr) };
            if let Some(destroy) = unsafe { RetiredNode::destructor(curr) } {
                unsafe { destroy(curr) };
            }
            freed += 1;
            curr = next;
        }
        debug_assert_eq!(freed, self.len, "bag chain length drifted");
        freed
    }
}
