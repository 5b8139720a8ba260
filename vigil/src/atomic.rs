//! Guard-scoped atomic pointers.
//!
//! [`Atomic<T>`] is an `AtomicPtr<T>` whose loads hand out [`Shared<'g, T>`],
//! a pointer that cannot outlive the [`Guard`] it was loaded under.

use crate::guard::Guard;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// An atomic pointer to a heap node managed by the reclamation scheme.
pub struct Atomic<T> {
    ptr: AtomicPtr<T>,
}

// SAFETY: `Atomic<T>` hands out pointers to `T` across threads.
unsafe impl<T: Send + Sync> Send for Atomic<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Wraps a raw pointer, usually from `Box::into_raw`.
    #[inline]
    pub const fn new(ptr: *mut T) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr),
        }
    }

    /// A null atomic pointer.
    #[inline]
    pub const fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Loads the pointer. The result is valid for as long as `guard` lives.
    #[inline]
    pub fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared::new(self.ptr.load(order))
    }

    /// Stores `new`.
    #[inline]
    pub fn store(&self, new: Shared<'_, T>, order: Ordering) {
        self.ptr.store(new.ptr, order);
    }

    /// Swaps in `new` and returns the previous pointer.
    #[inline]
    pub fn swap<'g>(&self, new: Shared<'_, T>, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared::new(self.ptr.swap(new.ptr, order))
    }

    /// Stores `new` if the current value is `current`.
    ///
    /// Returns the previous value on success and the actual value on failure.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.ptr
            .compare_exchange(current.ptr, new.ptr, success, failure)
            .map(Shared::new)
            .map_err(Shared::new)
    }

    /// Reads the pointer through exclusive access, without a guard.
    #[inline]
    pub fn get_mut(&mut self) -> &mut *mut T {
        self.ptr.get_mut()
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atomic({:p})", self.ptr.load(Ordering::Relaxed))
    }
}

/// A pointer loaded under a guard, valid for the guard's lifetime `'g`.
pub struct Shared<'g, T> {
    ptr: *mut T,
    _guard: PhantomData<(&'g Guard, *mut T)>,
}

impl<'g, T> Shared<'g, T> {
    #[inline]
    fn new(ptr: *mut T) -> Self {
        Self {
            ptr,
            _guard: PhantomData,
        }
    }

    /// The null pointer.
    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Wraps a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or stay valid for `'g`, typically because the
    /// caller owns it or loaded it under the same guard.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self::new(ptr)
    }

    /// The raw pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.ptr
    }

    /// Whether the pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrows the target, or `None` for null.
    ///
    /// # Safety
    ///
    /// A non-null pointer must point to an initialised `T`.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        unsafe { self.ptr.as_ref() }
    }

    /// Borrows the target without a null check.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and point to an initialised `T`.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        unsafe { &*self.ptr }
    }
}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.ptr, other.ptr)
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:p})", self.ptr)
    }
}
