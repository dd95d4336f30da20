//! Classic hazard pointers: per-thread announcement slots and a threshold-driven
//! scan that frees retired objects no slot refers to.
//!
//! A reader announces the address it is about to dereference, re-reads the shared
//! location to validate the announcement, and only then uses the value. A writer
//! unlinks a node, retires it, and the scan frees it once no announcement matches.
//! The unlink-then-scan-then-free ordering is what makes the announcement
//! sufficient: retirement always happens after the node became unreachable.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::maybe_std::{fence, AtomicBool, AtomicPtr, AtomicUsize};
use crate::retired::Retired;
use crate::{AtomicMarkedPtr, Backoff, Error, MarkedPtr};

/// Construction knobs for an [`HpDomain`].
///
/// # Examples
///
/// ```
/// use smr::HpOptions;
///
/// let options = HpOptions {
///     hazard_ptr_count: 4,
///     ..HpOptions::default()
/// };
/// assert_eq!(options.hazard_ptr_count, 4);
/// ```
#[derive(Clone, Debug)]
pub struct HpOptions {
    /// Guard slots available to each attached thread.
    pub hazard_ptr_count: usize,
    /// Upper bound on concurrently attached threads; records of detached threads
    /// are recycled and do not count against it.
    pub max_thread_count: usize,
    /// Number of locally retired objects that triggers a scan.
    pub scan_threshold: usize,
}

impl Default for HpOptions {
    fn default() -> Self {
        Self {
            hazard_ptr_count: 8,
            max_thread_count: 128,
            scan_threshold: 64,
        }
    }
}

/// A per-thread array of hazard slots, linked into the domain's append-only
/// record list. Records are recycled through the `active` flag rather than ever
/// being unlinked, which keeps the list safe to traverse without locks.
struct ThreadRecord {
    slots: Box<[AtomicUsize]>,
    active: AtomicBool,
    next: AtomicPtr<ThreadRecord>,
}

/// The shared state of one hazard pointer instance.
///
/// A domain owns the thread record list, the orphaned retirements of threads that
/// detached before their last scan succeeded, and the configuration. Containers
/// receive the domain by [`Arc`] instead of through a process-wide global, so its
/// lifetime is an ordinary scope.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
/// use std::sync::atomic::Ordering::AcqRel;
/// use std::sync::Arc;
/// use smr::{AtomicMarkedPtr, HpDomain, MarkedPtr};
///
/// let domain = Arc::new(HpDomain::with_defaults());
/// let thread = domain.attach().unwrap();
///
/// let link = AtomicMarkedPtr::new(MarkedPtr::new(Box::into_raw(Box::new(42_u64))));
/// let guard = thread.guard().unwrap();
/// let ptr = guard.protect(&link);
/// assert_eq!(unsafe { *ptr.as_ref().unwrap() }, 42);
///
/// // Unlink first, then retire; the scan frees it once the guard is gone.
/// let old = link.swap(MarkedPtr::null(), AcqRel);
/// unsafe { thread.retire(NonNull::new(old.ptr()).unwrap()) };
/// drop(guard);
/// thread.scan();
/// ```
#[derive(Debug)]
pub struct HpDomain {
    head: AtomicPtr<ThreadRecord>,
    registered: AtomicUsize,
    orphans: Mutex<Vec<Retired>>,
    options: HpOptions,
}

impl HpDomain {
    /// Creates a domain with the given options.
    ///
    /// # Panics
    ///
    /// Panics if `hazard_ptr_count` is zero.
    #[must_use]
    pub fn new(options: HpOptions) -> Self {
        assert!(options.hazard_ptr_count > 0, "at least one slot is required");
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            registered: AtomicUsize::new(0),
            orphans: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Creates a domain with [`HpOptions::default`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(HpOptions::default())
    }

    /// Returns the options the domain was built with.
    #[must_use]
    pub fn options(&self) -> &HpOptions {
        &self.options
    }

    /// Verifies that a container needing `required` guard slots per thread fits
    /// this domain.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyHazardPointers`] if `required` exceeds the configured slot
    /// count; asking late for more slots than exist is a configuration error, never
    /// silently truncated.
    pub fn check_hazard_count(&self, required: usize) -> Result<(), Error> {
        if required > self.options.hazard_ptr_count {
            return Err(Error::TooManyHazardPointers {
                requested: required,
                capacity: self.options.hazard_ptr_count,
            });
        }
        Ok(())
    }

    /// Attaches the calling thread, claiming a recycled record or appending a new
    /// one.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadLimitExceeded`] if `max_thread_count` records exist and all
    /// of them are live.
    pub fn attach(self: &Arc<Self>) -> Result<HpThread, Error> {
        let mut record_ptr = self.head.load(Acquire);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            if !record.active.load(Relaxed)
                && record
                    .active
                    .compare_exchange(false, true, Acquire, Relaxed)
                    .is_ok()
            {
                for slot in record.slots.iter() {
                    slot.store(0, Relaxed);
                }
                return Ok(HpThread::new(self.clone(), unsafe {
                    NonNull::new_unchecked(record_ptr)
                }));
            }
            record_ptr = record.next.load(Acquire);
        }

        let mut count = self.registered.load(Relaxed);
        loop {
            if count >= self.options.max_thread_count {
                return Err(Error::ThreadLimitExceeded {
                    max: self.options.max_thread_count,
                });
            }
            match self
                .registered
                .compare_exchange_weak(count, count + 1, Relaxed, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }

        let record = Box::new(ThreadRecord {
            slots: (0..self.options.hazard_ptr_count)
                .map(|_| AtomicUsize::new(0))
                .collect(),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        let raw = Box::into_raw(record);
        let mut head = self.head.load(Relaxed);
        let mut backoff = Backoff::new();
        loop {
            unsafe { (*raw).next.store(head, Relaxed) };
            match self.head.compare_exchange_weak(head, raw, Release, Relaxed) {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
        Ok(HpThread::new(self.clone(), unsafe {
            NonNull::new_unchecked(raw)
        }))
    }

    /// Snapshots every announced address across all records, sorted for binary
    /// search. Must run after the `SeqCst` fence that orders it against concurrent
    /// announcements.
    fn collect_hazards(&self) -> Vec<usize> {
        fence(SeqCst);
        let mut hazards = Vec::with_capacity(self.registered.load(Relaxed) * 2);
        let mut record_ptr = self.head.load(Acquire);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            for slot in record.slots.iter() {
                let address = slot.load(Acquire);
                if address != 0 {
                    hazards.push(address);
                }
            }
            record_ptr = record.next.load(Acquire);
        }
        hazards.sort_unstable();
        hazards.dedup();
        hazards
    }

    fn take_orphans(&self) -> Vec<Retired> {
        std::mem::take(&mut *self.orphans.lock())
    }
}

impl Drop for HpDomain {
    fn drop(&mut self) {
        // No thread handle can outlive the domain, so nothing is guarded anymore.
        for entry in self.orphans.get_mut().drain(..) {
            unsafe { entry.reclaim() };
        }
        let mut record_ptr = self.head.load(Relaxed);
        while !record_ptr.is_null() {
            let record = unsafe { Box::from_raw(record_ptr) };
            record_ptr = record.next.load(Relaxed);
        }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("active", &self.active.load(Relaxed))
            .finish_non_exhaustive()
    }
}

/// The per-thread face of an [`HpDomain`].
///
/// Obtained from [`HpDomain::attach`]; not [`Send`]. Dropping it is the detach:
/// slots are released, a final scan runs, and whatever is still guarded elsewhere
/// is handed to the domain for adoption by a later scan on any thread.
pub struct HpThread {
    domain: Arc<HpDomain>,
    record: NonNull<ThreadRecord>,
    free_slots: RefCell<Vec<usize>>,
    retired: RefCell<Vec<Retired>>,
    scanning: Cell<bool>,
}

impl HpThread {
    fn new(domain: Arc<HpDomain>, record: NonNull<ThreadRecord>) -> Self {
        let slot_count = domain.options.hazard_ptr_count;
        Self {
            domain,
            record,
            free_slots: RefCell::new((0..slot_count).rev().collect()),
            retired: RefCell::new(Vec::new()),
            scanning: Cell::new(false),
        }
    }

    /// Returns the domain this thread is attached to.
    #[must_use]
    pub fn domain(&self) -> &Arc<HpDomain> {
        &self.domain
    }

    /// Claims a free hazard slot.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyHazardPointers`] when all `hazard_ptr_count` slots are
    /// already claimed by live guards of this thread.
    pub fn guard(&self) -> Result<HpGuard<'_>, Error> {
        let index = self.free_slots.borrow_mut().pop();
        match index {
            Some(index) => Ok(HpGuard {
                thread: self,
                index,
            }),
            None => Err(Error::TooManyHazardPointers {
                requested: self.domain.options.hazard_ptr_count + 1,
                capacity: self.domain.options.hazard_ptr_count,
            }),
        }
    }

    /// Claims `N` slots at once.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyHazardPointers`] if fewer than `N` slots are free; any
    /// partially claimed slots are released again.
    pub fn guards<const N: usize>(&self) -> Result<[HpGuard<'_>; N], Error> {
        let mut claimed = Vec::with_capacity(N);
        for _ in 0..N {
            claimed.push(self.guard()?);
        }
        match claimed.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!("exactly N guards were claimed"),
        }
    }

    /// Retires a `Box`-allocated object for deferred destruction.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`Box::into_raw`], must already be unreachable
    /// from the shared structure, and must not be retired twice.
    pub unsafe fn retire<T>(&self, ptr: NonNull<T>) {
        self.retire_entry(Retired::new(ptr));
    }

    /// Retires an address with an explicit deleter.
    ///
    /// # Safety
    ///
    /// Same contract as [`HpThread::retire`]; additionally, `deleter` must be safe
    /// to call on `ptr` exactly once.
    pub unsafe fn retire_with(&self, ptr: NonNull<u8>, deleter: unsafe fn(*mut u8)) {
        self.retire_entry(Retired::with_deleter(ptr, deleter));
    }

    fn retire_entry(&self, entry: Retired) {
        let len = {
            let mut retired = self.retired.borrow_mut();
            retired.push(entry);
            retired.len()
        };
        if len >= self.domain.options.scan_threshold {
            self.scan();
        }
    }

    /// Sweeps the retired list, freeing every entry no hazard slot announces.
    ///
    /// Also adopts retirements orphaned by detached threads. Runs automatically at
    /// the scan threshold; calling it early is allowed and merely shifts work.
    pub fn scan(&self) {
        // A deleter running below may retire more objects through this same
        // thread; those land in the emptied list and must not recurse into scan.
        if self.scanning.replace(true) {
            return;
        }
        let mut candidates = self.retired.replace(Vec::new());
        candidates.extend(self.domain.take_orphans());
        let before = candidates.len();

        let hazards = self.domain.collect_hazards();
        let mut kept = Vec::new();
        for entry in candidates {
            if hazards.binary_search(&entry.address()).is_ok() {
                kept.push(entry);
            } else {
                unsafe { entry.reclaim() };
            }
        }

        let freed = before - kept.len();
        {
            let mut retired = self.retired.borrow_mut();
            kept.append(&mut retired);
            *retired = kept;
        }
        self.scanning.set(false);
        if freed > 0 {
            trace!("hp scan freed {freed} of {before} retired objects");
        }
    }

    /// Number of objects retired by this thread and not yet freed.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Nulls every slot of this thread, including ones claimed by live guards.
    ///
    /// Intended for tearing down mid-operation; a live guard whose slot was
    /// cleared no longer protects anything.
    pub fn clear(&self) {
        let record = unsafe { self.record.as_ref() };
        for slot in record.slots.iter() {
            slot.store(0, Release);
        }
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        &unsafe { self.record.as_ref() }.slots[index]
    }
}

impl Drop for HpThread {
    fn drop(&mut self) {
        // All guards are gone (they borrow this thread), so the slots are clear.
        self.scanning.set(false);
        self.scan();
        let leftovers = std::mem::take(&mut *self.retired.borrow_mut());
        if !leftovers.is_empty() {
            trace!("hp detach orphaning {} retired objects", leftovers.len());
            self.domain.orphans.lock().extend(leftovers);
        }
        unsafe { self.record.as_ref() }.active.store(false, Release);
    }
}

impl fmt::Debug for HpThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpThread")
            .field("retired", &self.retired.borrow().len())
            .field("free_slots", &self.free_slots.borrow().len())
            .finish_non_exhaustive()
    }
}

/// An owned hazard slot, released on drop.
///
/// The announce-validate loop in [`HpGuard::protect`] is the read-side protocol:
/// load the shared pointer, announce it, re-load and confirm it is unchanged.
/// Only then may the address be dereferenced; on a mismatch the loop retries and
/// never proceeds with the stale value.
pub struct HpGuard<'t> {
    thread: &'t HpThread,
    index: usize,
}

impl HpGuard<'_> {
    /// Announces and validates the pointer held by `src`, returning the validated
    /// value with its mark bits intact.
    #[must_use]
    pub fn protect<T>(&self, src: &AtomicMarkedPtr<T>) -> MarkedPtr<T> {
        let mut backoff = Backoff::new();
        let mut current = src.load(Acquire);
        loop {
            self.announce(current.ptr() as usize);
            let verified = src.load(Acquire);
            if verified.ptr() == current.ptr() {
                return verified;
            }
            current = verified;
            backoff.spin();
        }
    }

    /// Announces a pointer obtained elsewhere, without validation.
    ///
    /// The caller must re-validate the source location itself before
    /// dereferencing; prefer [`HpGuard::protect`] when the source is available.
    pub fn protect_ptr<T>(&self, ptr: MarkedPtr<T>) {
        self.announce(ptr.ptr() as usize);
    }

    /// Clears the announcement, keeping the slot claimed.
    pub fn clear(&self) {
        self.thread.slot(self.index).store(0, Release);
    }

    /// The currently announced address, for introspection.
    #[must_use]
    pub fn address(&self) -> usize {
        self.thread.slot(self.index).load(Relaxed)
    }

    fn announce(&self, address: usize) {
        announce(self.thread.slot(self.index), address);
    }
}

/// Publishes `address` into a hazard slot with full-barrier semantics, so that a
/// subsequent validating load is globally ordered against concurrent sweeps.
pub(crate) fn announce(slot: &AtomicUsize, address: usize) {
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        // `lock xchg` acts as a full barrier and beats `mfence`; the same trick
        // the epoch-based reclaimers use when pinning a thread.
        slot.swap(address, SeqCst);
    } else {
        slot.store(address, Relaxed);
        fence(SeqCst);
    }
}

impl Drop for HpGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.clear();
        self.thread.free_slots.borrow_mut().push(self.index);
    }
}

impl fmt::Debug for HpGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpGuard")
            .field("slot", &self.index)
            .finish()
    }
}
