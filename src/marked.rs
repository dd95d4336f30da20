use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::Ordering;

use crate::maybe_std::AtomicUsize;

/// The number of low pointer bits repurposed as mark flags.
///
/// Every type stored behind a [`MarkedPtr`] must be aligned to at least
/// `1 << MARK_BITS` bytes so that the mark bits never collide with address bits.
pub const MARK_BITS: usize = 2;

/// The mask covering all mark bits.
const MARK_MASK: usize = (1 << MARK_BITS) - 1;

/// A pointer whose two least significant bits carry auxiliary flags.
///
/// Containers use the first bit as a logical-deletion flag and the second as a
/// "node is changing" flag; a single compare-exchange on the whole tagged word then
/// atomically pairs a flag flip with the check that the pointer has not moved.
/// Mark bits are never part of the address: every dereference goes through
/// [`MarkedPtr::ptr`] or [`MarkedPtr::as_ref`], which strip them first.
///
/// # Examples
///
/// ```
/// use smr::MarkedPtr;
///
/// let boxed = Box::new(31_u64);
/// let raw = Box::into_raw(boxed);
///
/// let marked = MarkedPtr::new(raw).mark(0b01);
/// assert!(marked.is_marked(0b01));
/// assert!(!marked.is_marked(0b10));
/// assert_eq!(marked.ptr(), raw);
/// assert_eq!(marked.unmark(0b01).into_raw(), raw);
///
/// drop(unsafe { Box::from_raw(raw) });
/// ```
pub struct MarkedPtr<T> {
    value: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> MarkedPtr<T> {
    /// Creates a null [`MarkedPtr`] with no mark bits set.
    ///
    /// # Examples
    ///
    /// ```
    /// use smr::MarkedPtr;
    ///
    /// let ptr: MarkedPtr<u64> = MarkedPtr::null();
    /// assert!(ptr.is_null());
    /// assert_eq!(ptr.mark_bits(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn null() -> Self {
        Self::check_alignment();
        Self {
            value: 0,
            _marker: PhantomData,
        }
    }

    /// Creates a [`MarkedPtr`] from a raw, possibly tagged pointer value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not aligned to at least `1 << MARK_BITS` bytes; such a type
    /// cannot spare its low address bits.
    #[inline]
    #[must_use]
    pub fn new(ptr: *mut T) -> Self {
        Self::check_alignment();
        Self {
            value: ptr as usize,
            _marker: PhantomData,
        }
    }

    /// Creates a [`MarkedPtr`] from an unmarked pointer and an initial mark.
    ///
    /// # Panics
    ///
    /// Panics if `mark` has bits outside the mark mask. A misaligned `ptr` is a
    /// precondition violation checked in debug builds only.
    #[inline]
    #[must_use]
    pub fn compose(ptr: *mut T, mark: usize) -> Self {
        Self::check_alignment();
        assert!(mark <= MARK_MASK, "mark {mark:#b} exceeds the mark mask");
        debug_assert_eq!(
            ptr as usize & MARK_MASK,
            0,
            "pointer is misaligned or already tagged"
        );
        Self {
            value: ptr as usize | mark,
            _marker: PhantomData,
        }
    }

    /// Returns the address with all mark bits stripped.
    #[inline]
    #[must_use]
    pub fn ptr(self) -> *mut T {
        (self.value & !MARK_MASK) as *mut T
    }

    /// Returns the raw tagged value as a pointer, mark bits included.
    #[inline]
    #[must_use]
    pub fn into_raw(self) -> *mut T {
        self.value as *mut T
    }

    /// Returns the raw tagged value as an integer.
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.value
    }

    /// Returns `true` if the address part is null, regardless of mark bits.
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    /// Returns the mark bits.
    #[inline]
    #[must_use]
    pub fn mark_bits(self) -> usize {
        self.value & MARK_MASK
    }

    /// Returns a copy with the given mark bits additionally set.
    ///
    /// Idempotent: marking an already-marked pointer is a no-op.
    #[inline]
    #[must_use]
    pub fn mark(self, mask: usize) -> Self {
        debug_assert!(mask <= MARK_MASK);
        Self {
            value: self.value | (mask & MARK_MASK),
            _marker: PhantomData,
        }
    }

    /// Returns a copy with the given mark bits cleared.
    ///
    /// Idempotent: unmarking an unmarked pointer is a no-op.
    #[inline]
    #[must_use]
    pub fn unmark(self, mask: usize) -> Self {
        debug_assert!(mask <= MARK_MASK);
        Self {
            value: self.value & !(mask & MARK_MASK),
            _marker: PhantomData,
        }
    }

    /// Returns a copy with every mark bit cleared.
    #[inline]
    #[must_use]
    pub fn clear_marks(self) -> Self {
        Self {
            value: self.value & !MARK_MASK,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if any of the given mark bits is set.
    #[inline]
    #[must_use]
    pub fn is_marked(self, mask: usize) -> bool {
        debug_assert!(mask <= MARK_MASK);
        self.value & mask & MARK_MASK != 0
    }

    /// Dereferences the address part.
    ///
    /// # Safety
    ///
    /// The pointee must be alive for the duration of `'a`; the caller typically
    /// guarantees this by holding a hazard guard announcing this address.
    #[inline]
    #[must_use]
    pub unsafe fn as_ref<'a>(self) -> Option<&'a T> {
        self.ptr().as_ref()
    }

    #[inline]
    fn check_alignment() {
        assert!(
            mem::align_of::<T>() >= 1 << MARK_BITS,
            "type alignment too small to carry {MARK_BITS} mark bits"
        );
    }
}

impl<T> Clone for MarkedPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MarkedPtr<T> {}

impl<T> Default for MarkedPtr<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for MarkedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> fmt::Debug for MarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkedPtr")
            .field("ptr", &self.ptr())
            .field("mark", &self.mark_bits())
            .finish()
    }
}

/// An atomic cell holding a [`MarkedPtr`].
///
/// Every operation acts on the whole tagged word and takes explicit
/// [`Ordering`] parameters, so a compare-exchange observes pointer movement and
/// flag changes as one event.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::Ordering::{AcqRel, Acquire};
/// use smr::{AtomicMarkedPtr, MarkedPtr};
///
/// let raw = Box::into_raw(Box::new(7_u64));
/// let link = AtomicMarkedPtr::new(MarkedPtr::new(raw));
///
/// // Logically delete: flip the mark while verifying the pointer is unchanged.
/// let current = link.load(Acquire);
/// assert!(link
///     .compare_exchange(current, current.mark(0b01), AcqRel, Acquire)
///     .is_ok());
/// assert!(link.load(Acquire).is_marked(0b01));
///
/// drop(unsafe { Box::from_raw(raw) });
/// ```
pub struct AtomicMarkedPtr<T> {
    inner: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

impl<T> AtomicMarkedPtr<T> {
    /// Creates a null [`AtomicMarkedPtr`].
    #[inline]
    #[must_use]
    pub fn null() -> Self {
        Self::new(MarkedPtr::null())
    }

    /// Creates an [`AtomicMarkedPtr`] holding the given value.
    #[inline]
    #[must_use]
    pub fn new(ptr: MarkedPtr<T>) -> Self {
        Self {
            inner: AtomicUsize::new(ptr.as_usize()),
            _marker: PhantomData,
        }
    }

    /// Loads the current value.
    #[inline]
    #[must_use]
    pub fn load(&self, order: Ordering) -> MarkedPtr<T> {
        MarkedPtr {
            value: self.inner.load(order),
            _marker: PhantomData,
        }
    }

    /// Stores a new value.
    #[inline]
    pub fn store(&self, ptr: MarkedPtr<T>, order: Ordering) {
        self.inner.store(ptr.as_usize(), order);
    }

    /// Stores a new value and returns the previous one.
    #[inline]
    pub fn swap(&self, ptr: MarkedPtr<T>, order: Ordering) -> MarkedPtr<T> {
        MarkedPtr {
            value: self.inner.swap(ptr.as_usize(), order),
            _marker: PhantomData,
        }
    }

    /// Stores `new` if the current value equals `current`, tag bits included.
    ///
    /// # Errors
    ///
    /// Returns the actual value when the comparison fails.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T>, MarkedPtr<T>> {
        self.inner
            .compare_exchange(current.as_usize(), new.as_usize(), success, failure)
            .map(|value| MarkedPtr {
                value,
                _marker: PhantomData,
            })
            .map_err(|value| MarkedPtr {
                value,
                _marker: PhantomData,
            })
    }

    /// Weak variant of [`AtomicMarkedPtr::compare_exchange`] that may fail
    /// spuriously.
    ///
    /// # Errors
    ///
    /// Returns the actual value when the comparison fails.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T>, MarkedPtr<T>> {
        self.inner
            .compare_exchange_weak(current.as_usize(), new.as_usize(), success, failure)
            .map(|value| MarkedPtr {
                value,
                _marker: PhantomData,
            })
            .map_err(|value| MarkedPtr {
                value,
                _marker: PhantomData,
            })
    }

    /// Sets mark bits on the current value if it still equals `current`.
    ///
    /// Returns `true` on success; the single compare-exchange both verifies the
    /// pointer and publishes the flag.
    #[inline]
    pub fn try_mark(
        &self,
        current: MarkedPtr<T>,
        mask: usize,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.compare_exchange(current, current.mark(mask), success, failure)
            .is_ok()
    }
}

// Like `AtomicPtr`, the cell only transfers the pointer value, never the pointee.
unsafe impl<T> Send for AtomicMarkedPtr<T> {}
unsafe impl<T> Sync for AtomicMarkedPtr<T> {}

impl<T> Default for AtomicMarkedPtr<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicMarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicMarkedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}
