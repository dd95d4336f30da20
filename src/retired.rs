use std::ptr::NonNull;

/// A reclaimed-but-not-yet-freed allocation: the object address plus the function
/// that knows how to destroy it.
///
/// Created when a container unlinks a node; consumed only after a sweep proves no
/// guard anywhere announces the address.
#[derive(Debug)]
pub(crate) struct Retired {
    ptr: NonNull<u8>,
    drop_fn: unsafe fn(*mut u8),
}

// A `Retired` entry owns its allocation exclusively; the address inside is only
// ever compared against guard announcements, never dereferenced by the collector.
unsafe impl Send for Retired {}

impl Retired {
    /// Wraps a `Box`-allocated object of type `T`.
    #[inline]
    pub(crate) fn new<T>(ptr: NonNull<T>) -> Self {
        Self {
            ptr: ptr.cast(),
            drop_fn: drop_boxed::<T>,
        }
    }

    /// Wraps an address with a caller-provided deleter.
    #[inline]
    pub(crate) fn with_deleter(ptr: NonNull<u8>, drop_fn: unsafe fn(*mut u8)) -> Self {
        Self { ptr, drop_fn }
    }

    /// The announced address this entry must be checked against.
    #[inline]
    pub(crate) fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Destroys the object.
    ///
    /// # Safety
    ///
    /// No guard may announce [`Retired::address`] at this point, and the entry must
    /// not be reclaimed twice.
    #[inline]
    pub(crate) unsafe fn reclaim(self) {
        (self.drop_fn)(self.ptr.as_ptr());
    }
}

unsafe fn drop_boxed<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr.cast::<T>()));
}
