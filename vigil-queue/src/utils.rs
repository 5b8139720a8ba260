use core::ops::{Deref, DerefMut};

/// Pads and aligns `T` to a cache line so that `head` and `tail` do not
/// false-share.
///
/// Line sizes: 256B on s390x, 128B on aarch64 (Apple M-series, Neoverse),
/// 64B elsewhere.
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(target_arch = "aarch64", repr(align(128)))]
#[cfg_attr(not(any(target_arch = "s390x", target_arch = "aarch64")), repr(align(64)))]
#[derive(Default, Debug)]
pub(crate) struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
