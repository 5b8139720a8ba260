//! The `Reclaimable` contract and the destructor glue `retire` installs.

use crate::retired::RetiredNode;
use alloc::boxed::Box;

/// Types that can be handed to [`retire`](crate::retire).
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`RetiredNode`] as their first
/// field, so a pointer to `Self` is also a valid pointer to that header, and
/// `dealloc` must release exactly the allocation the node lives in.
pub unsafe trait Reclaimable: Sized {
    /// The embedded header.
    fn retired_node(&self) -> &RetiredNode;

    /// Releases the node once no thread can reach it.
    ///
    /// The default assumes the node came from `Box::into_raw` (or an
    /// allocation with `Layout::new::<Self>()` from the global allocator).
    ///
    /// # Safety
    ///
    /// Called once, after the node became unreachable to every thread.
    unsafe fn dealloc(ptr: *mut Self) {
        unsafe { drop(Box::from_raw(ptr)) }
    }
}

/// Monomorphised per node type and stored type-erased in the header.
pub(crate) unsafe fn destroy<T: Reclaimable>(node: *mut RetiredNode) {
    unsafe { T::dealloc(node.cast::<T>()) }
}
