use core::fmt;

/// Returned by [`Queue::try_enqueue`](crate::Queue::try_enqueue) when the
/// allocator could not provide a node. The value is handed back unchanged.
pub struct AllocError<T>(pub(crate) T);

impl<T> AllocError<T> {
    /// Recovers the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AllocError { .. }")
    }
}

impl<T> fmt::Display for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate a queue node")
    }
}

impl<T> std::error::Error for AllocError<T> {}
