//! Pass-The-Buck: hazard guards drawn from a shared, recyclable pool, a lock-free
//! buffer of retired pointers, and a `liberate` sweep serialized by a try-lock.
//!
//! Unlike the fixed per-thread arrays of [`hp`](crate::hp), guard cells live in a
//! global append-only list and flow through a free list, so a thread can hold as
//! many guards as it asks for; the pool grows instead of failing. The free list is
//! deliberately lock-protected: making it lock-free would reintroduce the ABA
//! problem the rest of the scheme exists to avoid, for no measurable gain on this
//! cold path.
//!
//! A thread that finds the reclamation lock busy simply moves on; reclamation is
//! someone else's problem at that moment, and no mutator ever blocks on it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::hp::announce;
use crate::maybe_std::{fence, AtomicPtr, AtomicUsize};
use crate::retired::Retired;
use crate::{AtomicMarkedPtr, Backoff, MarkedPtr};

/// Construction knobs for a [`PtbDomain`].
#[derive(Clone, Debug)]
pub struct PtbOptions {
    /// Approximate number of pending retirements that triggers a liberate attempt.
    ///
    /// This is a trigger, not a cap: while every candidate object is guarded, the
    /// buffer keeps growing. That unbounded growth under sustained guarding is an
    /// accepted property of the scheme.
    pub liberate_threshold: usize,
    /// Guard cells a thread pulls from the shared pool the first time it needs
    /// one, to keep later acquisitions off the pool lock.
    pub initial_thread_guard_count: usize,
}

impl Default for PtbOptions {
    fn default() -> Self {
        Self {
            liberate_threshold: 256,
            initial_thread_guard_count: 8,
        }
    }
}

/// A reusable guard slot in the global guard list.
///
/// Cells are appended once and never unlinked, which makes the list traversable
/// during a sweep without any lock; reuse goes through the domain's free list.
struct GuardCell {
    value: AtomicUsize,
    next: AtomicPtr<GuardCell>,
}

/// A node of the retired-pointer buffer, recycled through the node pool once its
/// entry has been taken out by a sweep.
struct BufferNode {
    entry: Option<Retired>,
    next: AtomicPtr<BufferNode>,
}

/// The shared state of one Pass-The-Buck instance.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
/// use std::sync::atomic::Ordering::AcqRel;
/// use std::sync::Arc;
/// use smr::{AtomicMarkedPtr, MarkedPtr, PtbDomain};
///
/// let domain = Arc::new(PtbDomain::with_defaults());
/// let thread = domain.attach();
///
/// let link = AtomicMarkedPtr::new(MarkedPtr::new(Box::into_raw(Box::new(7_u64))));
/// let guard = thread.guard();
/// let ptr = guard.protect(&link);
/// assert_eq!(unsafe { *ptr.as_ref().unwrap() }, 7);
///
/// let old = link.swap(MarkedPtr::null(), AcqRel);
/// unsafe { thread.retire(NonNull::new(old.ptr()).unwrap()) };
/// drop(guard);
/// assert!(domain.try_liberate());
/// assert_eq!(domain.retired_count(), 0);
/// ```
pub struct PtbDomain {
    guards_head: AtomicPtr<GuardCell>,
    guard_free: Mutex<Vec<NonNull<GuardCell>>>,
    buffer_head: AtomicPtr<BufferNode>,
    buffer_len: AtomicUsize,
    node_pool: Mutex<Vec<NonNull<BufferNode>>>,
    liberate_lock: Mutex<()>,
    options: PtbOptions,
}

// The raw cell and node pointers held in the free lists address memory owned by
// this domain for its whole lifetime.
unsafe impl Send for PtbDomain {}
unsafe impl Sync for PtbDomain {}

impl PtbDomain {
    /// Creates a domain with the given options.
    ///
    /// # Panics
    ///
    /// Panics if `liberate_threshold` is zero.
    #[must_use]
    pub fn new(options: PtbOptions) -> Self {
        assert!(options.liberate_threshold > 0, "threshold must be non-zero");
        Self {
            guards_head: AtomicPtr::new(ptr::null_mut()),
            guard_free: Mutex::new(Vec::new()),
            buffer_head: AtomicPtr::new(ptr::null_mut()),
            buffer_len: AtomicUsize::new(0),
            node_pool: Mutex::new(Vec::new()),
            liberate_lock: Mutex::new(()),
            options,
        }
    }

    /// Creates a domain with [`PtbOptions::default`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(PtbOptions::default())
    }

    /// Returns the options the domain was built with.
    #[must_use]
    pub fn options(&self) -> &PtbOptions {
        &self.options
    }

    /// Attaches the calling thread. Guard cells are only pulled from the pool on
    /// first use, so attaching is free.
    #[must_use]
    pub fn attach(self: &Arc<Self>) -> PtbThread {
        PtbThread {
            domain: self.clone(),
            cache: RefCell::new(Vec::new()),
            warmed: Cell::new(false),
        }
    }

    /// Retires a `Box`-allocated object, triggering a liberate attempt once the
    /// buffer reaches the threshold.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`Box::into_raw`], must already be unreachable
    /// from the shared structure, and must not be retired twice.
    pub unsafe fn retire_ptr<T>(&self, ptr: NonNull<T>) {
        self.retire_entry(Retired::new(ptr));
    }

    /// Retires an address with an explicit deleter.
    ///
    /// # Safety
    ///
    /// Same contract as [`PtbDomain::retire_ptr`]; additionally, `deleter` must be
    /// safe to call on `ptr` exactly once.
    pub unsafe fn retire_with(&self, ptr: NonNull<u8>, deleter: unsafe fn(*mut u8)) {
        self.retire_entry(Retired::with_deleter(ptr, deleter));
    }

    /// Attempts a liberate sweep; returns `false` without blocking if another
    /// thread is already sweeping.
    pub fn try_liberate(&self) -> bool {
        match self.liberate_lock.try_lock() {
            Some(_token) => {
                self.liberate();
                true
            }
            None => false,
        }
    }

    /// Approximate number of pending retirements.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.buffer_len.load(Relaxed)
    }

    fn retire_entry(&self, entry: Retired) {
        self.push_retired(entry);
        if self.buffer_len.load(Relaxed) >= self.options.liberate_threshold {
            self.try_liberate();
        }
    }

    /// Steals the whole retired buffer, frees every entry no guard cell holds, and
    /// hands still-guarded entries back to the buffer.
    ///
    /// Callers must hold `liberate_lock`, or otherwise have exclusive access.
    fn liberate(&self) -> usize {
        let mut node_ptr = self.buffer_head.swap(ptr::null_mut(), AcqRel);

        let mut entries = Vec::new();
        while let Some(node) = NonNull::new(node_ptr) {
            let node_ref = unsafe { &mut *node.as_ptr() };
            if let Some(entry) = node_ref.entry.take() {
                entries.push(entry);
            }
            node_ptr = node_ref.next.load(Relaxed);
            self.node_pool.lock().push(node);
        }
        // Subtract exactly the stolen nodes: a push that races with the steal
        // lands on the emptied buffer and its increment must survive.
        self.buffer_len.fetch_sub(entries.len(), Relaxed);
        if entries.is_empty() {
            return 0;
        }

        let guarded = self.collect_guarded();
        let total = entries.len();
        let mut freed = 0;
        for entry in entries {
            if guarded.binary_search(&entry.address()).is_ok() {
                // Hand-off: the buck is passed back for a later sweep.
                self.push_retired(entry);
            } else {
                unsafe { entry.reclaim() };
                freed += 1;
            }
        }
        debug!("ptb liberate freed {freed} of {total} retired objects");
        freed
    }

    fn push_retired(&self, entry: Retired) {
        let node = self.acquire_node(entry);
        let mut head = self.buffer_head.load(Relaxed);
        let mut backoff = Backoff::new();
        loop {
            unsafe { node.as_ref() }.next.store(head, Relaxed);
            match self
                .buffer_head
                .compare_exchange_weak(head, node.as_ptr(), Release, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
        self.buffer_len.fetch_add(1, Relaxed);
    }

    fn acquire_node(&self, entry: Retired) -> NonNull<BufferNode> {
        if let Some(node) = self.node_pool.lock().pop() {
            unsafe { &mut *node.as_ptr() }.entry = Some(entry);
            return node;
        }
        let node = Box::new(BufferNode {
            entry: Some(entry),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    fn collect_guarded(&self) -> Vec<usize> {
        fence(SeqCst);
        let mut guarded = Vec::new();
        let mut cell_ptr = self.guards_head.load(Acquire);
        while let Some(cell) = unsafe { cell_ptr.as_ref() } {
            let address = cell.value.load(Acquire);
            if address != 0 {
                guarded.push(address);
            }
            cell_ptr = cell.next.load(Acquire);
        }
        guarded.sort_unstable();
        guarded.dedup();
        guarded
    }

    /// Moves up to `want` cells from the shared free list into `cache`, allocating
    /// fresh cells for the remainder.
    fn acquire_cells(&self, want: usize, cache: &mut Vec<NonNull<GuardCell>>) {
        {
            let mut free = self.guard_free.lock();
            for _ in 0..want {
                match free.pop() {
                    Some(cell) => cache.push(cell),
                    None => break,
                }
            }
        }
        while cache.len() < want {
            cache.push(self.alloc_cell());
        }
    }

    fn alloc_cell(&self) -> NonNull<GuardCell> {
        let cell = Box::new(GuardCell {
            value: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        let raw = Box::into_raw(cell);
        let mut head = self.guards_head.load(Relaxed);
        let mut backoff = Backoff::new();
        loop {
            unsafe { (*raw).next.store(head, Relaxed) };
            match self
                .guards_head
                .compare_exchange_weak(head, raw, Release, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
        unsafe { NonNull::new_unchecked(raw) }
    }

    fn release_cells(&self, cells: &mut Vec<NonNull<GuardCell>>) {
        if !cells.is_empty() {
            self.guard_free.lock().append(cells);
        }
    }
}

impl Drop for PtbDomain {
    fn drop(&mut self) {
        // No thread handle can outlive the domain; every guard cell is clear, so
        // each sweep frees all current entries. Deleters may retire more, hence
        // draining the chain itself rather than the approximate counter.
        while !self.buffer_head.load(Relaxed).is_null() {
            self.liberate();
        }
        for node in self.node_pool.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
        let mut cell_ptr = self.guards_head.load(Relaxed);
        while !cell_ptr.is_null() {
            let cell = unsafe { Box::from_raw(cell_ptr) };
            cell_ptr = cell.next.load(Relaxed);
        }
    }
}

impl fmt::Debug for PtbDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtbDomain")
            .field("retired", &self.buffer_len.load(Relaxed))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The per-thread face of a [`PtbDomain`].
///
/// Keeps a private cache of guard cells so the shared free list is only touched
/// when the cache runs dry; the whole cache is returned to the free list on
/// detach, never per guard.
pub struct PtbThread {
    domain: Arc<PtbDomain>,
    cache: RefCell<Vec<NonNull<GuardCell>>>,
    warmed: Cell<bool>,
}

impl PtbThread {
    /// Returns the domain this thread is attached to.
    #[must_use]
    pub fn domain(&self) -> &Arc<PtbDomain> {
        &self.domain
    }

    /// Claims a guard cell.
    ///
    /// Never fails: the shared pool grows on demand, which is the scheme's answer
    /// to a thread needing more guards than any fixed per-thread budget.
    #[must_use]
    pub fn guard(&self) -> PtbGuard<'_> {
        let mut cache = self.cache.borrow_mut();
        if !self.warmed.replace(true) {
            self.domain
                .acquire_cells(self.domain.options.initial_thread_guard_count, &mut cache);
        }
        let cell = match cache.pop() {
            Some(cell) => cell,
            None => {
                self.domain.acquire_cells(1, &mut cache);
                cache.pop().expect("a cell was just acquired")
            }
        };
        drop(cache);
        PtbGuard { thread: self, cell }
    }

    /// Retires a `Box`-allocated object.
    ///
    /// # Safety
    ///
    /// Same contract as [`PtbDomain::retire_ptr`].
    pub unsafe fn retire<T>(&self, ptr: NonNull<T>) {
        self.domain.retire_ptr(ptr);
    }

    /// Retires an address with an explicit deleter.
    ///
    /// # Safety
    ///
    /// Same contract as [`PtbDomain::retire_with`].
    pub unsafe fn retire_with(&self, ptr: NonNull<u8>, deleter: unsafe fn(*mut u8)) {
        self.domain.retire_with(ptr, deleter);
    }
}

impl Drop for PtbThread {
    fn drop(&mut self) {
        self.domain.release_cells(&mut self.cache.borrow_mut());
    }
}

impl fmt::Debug for PtbThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtbThread")
            .field("cached_guards", &self.cache.borrow().len())
            .finish_non_exhaustive()
    }
}

/// A guard cell claimed from the shared pool, returned to the owning thread's
/// cache on drop.
///
/// Follows the same announce-validate protocol as [`HpGuard`](crate::HpGuard).
pub struct PtbGuard<'t> {
    thread: &'t PtbThread,
    cell: NonNull<GuardCell>,
}

impl PtbGuard<'_> {
    /// Announces and validates the pointer held by `src`, returning the validated
    /// value with its mark bits intact.
    #[must_use]
    pub fn protect<T>(&self, src: &AtomicMarkedPtr<T>) -> MarkedPtr<T> {
        let mut backoff = Backoff::new();
        let mut current = src.load(Acquire);
        loop {
            announce(self.slot(), current.ptr() as usize);
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
    /// dereferencing; prefer [`PtbGuard::protect`] when the source is available.
    pub fn protect_ptr<T>(&self, ptr: MarkedPtr<T>) {
        announce(self.slot(), ptr.ptr() as usize);
    }

    /// Clears the announcement, keeping the cell claimed.
    pub fn clear(&self) {
        self.slot().store(0, Release);
    }

    /// The currently announced address, for introspection.
    #[must_use]
    pub fn address(&self) -> usize {
        self.slot().load(Relaxed)
    }

    fn slot(&self) -> &AtomicUsize {
        &unsafe { self.cell.as_ref() }.value
    }
}

impl Drop for PtbGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.clear();
        self.thread.cache.borrow_mut().push(self.cell);
    }
}

impl fmt::Debug for PtbGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtbGuard")
            .field("address", &self.address())
            .finish()
    }
}
