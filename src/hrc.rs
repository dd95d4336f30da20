//! Hazard pointers combined with per-node reference counting.
//!
//! Hazard slots make short traversals safe; the embedded counts keep nodes alive
//! across longer-lived references such as iterators. A node is destroyed only when
//! it is marked deleted, its reference count is zero, and no hazard slot announces
//! it. Link fields must be mutated exclusively through [`HrcDomain::cas_ref`],
//! [`HrcDomain::store_ref`] and [`HrcDomain::xchg_ref`] so the counts always match
//! the number of live links.
//!
//! A thread whose retired set fills up escalates through increasingly global (and
//! increasingly expensive) relief tiers: compress its own tombstone chains, sweep,
//! adopt the leftovers of detached threads, and finally compress every retired
//! chain in the domain. The escalation is retried a bounded number of times and
//! then aborts the process; an undrainable retired set means links are being
//! mutated outside the counted helpers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::hp::announce;
use crate::maybe_std::{fence, AtomicBool, AtomicPtr, AtomicUsize};
use crate::{AtomicMarkedPtr, Backoff, Error, MarkedPtr};

/// Construction knobs for an [`HrcDomain`].
#[derive(Clone, Debug)]
pub struct HrcOptions {
    /// Hazard slots available to each attached thread.
    pub hazard_ptr_count: usize,
    /// Upper bound on concurrently attached threads; records of detached threads
    /// are recycled and do not count against it.
    pub max_thread_count: usize,
    /// Capacity of the per-thread retired set; reaching it triggers the relief
    /// escalation.
    pub max_retired_count: usize,
}

impl Default for HrcOptions {
    fn default() -> Self {
        Self {
            hazard_ptr_count: 8,
            max_thread_count: 128,
            max_retired_count: 64,
        }
    }
}

/// The bookkeeping embedded in every node participating in reference-counted
/// reclamation.
///
/// `rc == 0 && deleted` is necessary for destruction but not sufficient: the
/// hazard overlay must also show no announcement of the node.
#[derive(Debug)]
pub struct NodeHeader {
    rc: AtomicUsize,
    trace: AtomicBool,
    deleted: AtomicBool,
}

impl NodeHeader {
    /// Creates the header for a freshly allocated, not yet linked node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rc: AtomicUsize::new(0),
            trace: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    /// The number of counted links currently pointing at the node.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.rc.load(Acquire)
    }

    /// Returns `true` once the node has been retired.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Acquire)
    }
}

impl Default for NodeHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A node type managed by an [`HrcDomain`].
///
/// The two hooks are the per-algorithm customization points of the scheme:
///
/// * [`HrcNode::clean_up`] re-points any link of this node that currently passes
///   through an already-deleted node directly to the next live one, compressing
///   chains of tombstones so their counts can drop.
/// * [`HrcNode::terminate`] nulls out every counted link of a node about to be
///   destroyed, so destruction does not leave dangling counts on live neighbors.
///   When `concurrent` is `false` the node is exclusively owned and plain stores
///   through [`HrcDomain::store_ref`] suffice; otherwise links must be cleared
///   with [`HrcDomain::cas_ref`].
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
/// use std::sync::Arc;
/// use smr::{AtomicMarkedPtr, HrcDomain, HrcNode, HrcThread, MarkedPtr, NodeHeader};
///
/// struct Node {
///     next: AtomicMarkedPtr<Node>,
///     header: NodeHeader,
/// }
///
/// impl HrcNode for Node {
///     fn header(&self) -> &NodeHeader {
///         &self.header
///     }
///     fn clean_up(&self, _thread: &HrcThread) {}
///     fn terminate(&self, domain: &HrcDomain, _concurrent: bool) {
///         unsafe { domain.store_ref(&self.next, MarkedPtr::null()) };
///     }
/// }
///
/// let domain = Arc::new(HrcDomain::with_defaults());
/// let thread = domain.attach().unwrap();
///
/// let node = NonNull::from(Box::leak(Box::new(Node {
///     next: AtomicMarkedPtr::null(),
///     header: NodeHeader::new(),
/// })));
/// let head: AtomicMarkedPtr<Node> = AtomicMarkedPtr::null();
/// unsafe { domain.store_ref(&head, MarkedPtr::new(node.as_ptr())) };
/// assert_eq!(unsafe { node.as_ref() }.header().ref_count(), 1);
///
/// // Unlink, retire, sweep: the count is back to zero, so the node is freed.
/// unsafe { domain.store_ref(&head, MarkedPtr::null()) };
/// unsafe { thread.retire_node(node) };
/// thread.scan();
/// ```
pub trait HrcNode: 'static {
    /// Returns the embedded reclamation header.
    fn header(&self) -> &NodeHeader;

    /// Re-points links passing through deleted nodes to the next live node.
    fn clean_up(&self, thread: &HrcThread);

    /// Clears all counted links prior to destruction.
    fn terminate(&self, domain: &HrcDomain, concurrent: bool);
}

/// A retired node awaiting destruction.
struct DynNode(NonNull<dyn HrcNode>);

// Retired nodes are unreachable from the structure; the pointer only travels to
// whichever thread performs the sweep.
unsafe impl Send for DynNode {}

impl DynNode {
    fn address(&self) -> usize {
        self.0.as_ptr().cast::<u8>() as usize
    }

    fn header(&self) -> &NodeHeader {
        unsafe { self.0.as_ref() }.header()
    }
}

/// A per-thread hazard array plus the retired set, linked into the domain's
/// append-only record list.
///
/// The retired set lives in the record, not the thread handle, so that detached
/// threads leave it behind for adoption and `clean_up_all` can reach every set.
struct HrcRecord {
    slots: Box<[AtomicUsize]>,
    retired: Mutex<Vec<DynNode>>,
    active: AtomicBool,
    next: AtomicPtr<HrcRecord>,
}

/// The shared state of one HRC instance.
///
/// The counted link operations live here rather than on the thread handle
/// because they carry no per-thread state; [`HrcNode::terminate`] in particular
/// runs in contexts where no thread handle exists anymore.
pub struct HrcDomain {
    head: AtomicPtr<HrcRecord>,
    registered: AtomicUsize,
    options: HrcOptions,
}

impl HrcDomain {
    /// Bound on relief escalation rounds before the process is aborted.
    const DRAIN_ATTEMPTS: usize = 8;

    /// Creates a domain with the given options.
    ///
    /// # Panics
    ///
    /// Panics if `hazard_ptr_count` or `max_retired_count` is zero.
    #[must_use]
    pub fn new(options: HrcOptions) -> Self {
        assert!(options.hazard_ptr_count > 0, "at least one slot is required");
        assert!(options.max_retired_count > 0, "retired set cannot be empty");
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            registered: AtomicUsize::new(0),
            options,
        }
    }

    /// Creates a domain with [`HrcOptions::default`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(HrcOptions::default())
    }

    /// Returns the options the domain was built with.
    #[must_use]
    pub fn options(&self) -> &HrcOptions {
        &self.options
    }

    /// Verifies that a container needing `required` guard slots per thread fits
    /// this domain.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyHazardPointers`] if `required` exceeds the configured slot
    /// count.
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
    /// one. A recycled record may still hold retired nodes of its previous owner;
    /// they simply become this thread's responsibility.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadLimitExceeded`] if `max_thread_count` records exist and all
    /// of them are live.
    pub fn attach(self: &Arc<Self>) -> Result<HrcThread, Error> {
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
                return Ok(HrcThread::new(self.clone(), unsafe {
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

        let record = Box::new(HrcRecord {
            slots: (0..self.options.hazard_ptr_count)
                .map(|_| AtomicUsize::new(0))
                .collect(),
            retired: Mutex::new(Vec::new()),
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
        Ok(HrcThread::new(self.clone(), unsafe {
            NonNull::new_unchecked(raw)
        }))
    }

    /// Swaps `link` from `expected` to `new`, adjusting both reference counts.
    ///
    /// Returns `false` and changes nothing if `link` no longer holds `expected`.
    ///
    /// # Safety
    ///
    /// Both `expected` and `new`, when non-null, must point to live nodes; the
    /// caller guarantees this with hazard guards or ownership.
    pub unsafe fn cas_ref<N: HrcNode>(
        &self,
        link: &AtomicMarkedPtr<N>,
        expected: MarkedPtr<N>,
        new: MarkedPtr<N>,
    ) -> bool {
        if link.compare_exchange(expected, new, AcqRel, Acquire).is_ok() {
            self.count_link_change(expected, new);
            true
        } else {
            false
        }
    }

    /// Unconditionally replaces the value of `link`, adjusting both reference
    /// counts, and returns the previous value.
    ///
    /// # Safety
    ///
    /// Same contract as [`HrcDomain::cas_ref`]; additionally the caller must be
    /// the only writer of `link` at this moment, which is the case for freshly
    /// allocated nodes and for exclusively owned ones.
    pub unsafe fn xchg_ref<N: HrcNode>(
        &self,
        link: &AtomicMarkedPtr<N>,
        new: MarkedPtr<N>,
    ) -> MarkedPtr<N> {
        let old = link.swap(new, AcqRel);
        self.count_link_change(old, new);
        old
    }

    /// [`HrcDomain::xchg_ref`] discarding the previous value.
    ///
    /// # Safety
    ///
    /// Same contract as [`HrcDomain::xchg_ref`].
    pub unsafe fn store_ref<N: HrcNode>(&self, link: &AtomicMarkedPtr<N>, new: MarkedPtr<N>) {
        let _ = self.xchg_ref(link, new);
    }

    /// Transfers one counted reference from `old` to `new` after a successful
    /// pointer swap.
    unsafe fn count_link_change<N: HrcNode>(&self, old: MarkedPtr<N>, new: MarkedPtr<N>) {
        if let Some(node) = new.as_ref() {
            let header = node.header();
            header.rc.fetch_add(1, AcqRel);
            header.trace.store(false, Release);
        }
        if let Some(node) = old.as_ref() {
            let previous = node.header().rc.fetch_sub(1, AcqRel);
            debug_assert_ne!(previous, 0, "reference count underflow");
        }
    }

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
}

impl Drop for HrcDomain {
    fn drop(&mut self) {
        // No thread handle can outlive the domain. Terminate everything first so
        // cross-links between retired nodes never dangle mid-destruction.
        let mut leftovers = Vec::new();
        let mut record_ptr = self.head.load(Relaxed);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            leftovers.append(&mut record.retired.lock());
            record_ptr = record.next.load(Relaxed);
        }
        for node in &leftovers {
            unsafe { node.0.as_ref() }.terminate(self, false);
        }
        for node in leftovers {
            drop(unsafe { Box::from_raw(node.0.as_ptr()) });
        }

        let mut record_ptr = self.head.load(Relaxed);
        while !record_ptr.is_null() {
            let record = unsafe { Box::from_raw(record_ptr) };
            record_ptr = record.next.load(Relaxed);
        }
    }
}

impl fmt::Debug for HrcDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrcDomain")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The per-thread face of an [`HrcDomain`].
///
/// Obtained from [`HrcDomain::attach`]; not [`Send`]. Dropping it is the detach:
/// a final sweep runs and whatever survives stays in the thread's record, where
/// [`HrcThread::help_scan`] on any other thread adopts it.
pub struct HrcThread {
    domain: Arc<HrcDomain>,
    record: NonNull<HrcRecord>,
    free_slots: RefCell<Vec<usize>>,
    scanning: Cell<bool>,
}

impl HrcThread {
    fn new(domain: Arc<HrcDomain>, record: NonNull<HrcRecord>) -> Self {
        let slot_count = domain.options.hazard_ptr_count;
        Self {
            domain,
            record,
            free_slots: RefCell::new((0..slot_count).rev().collect()),
            scanning: Cell::new(false),
        }
    }

    /// Returns the domain this thread is attached to.
    #[must_use]
    pub fn domain(&self) -> &Arc<HrcDomain> {
        &self.domain
    }

    /// Claims a free hazard slot.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyHazardPointers`] when all `hazard_ptr_count` slots are
    /// already claimed by live guards of this thread.
    pub fn guard(&self) -> Result<HrcGuard<'_>, Error> {
        let index = self.free_slots.borrow_mut().pop();
        match index {
            Some(index) => Ok(HrcGuard {
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
    pub fn guards<const N: usize>(&self) -> Result<[HrcGuard<'_>; N], Error> {
        let mut claimed = Vec::with_capacity(N);
        for _ in 0..N {
            claimed.push(self.guard()?);
        }
        match claimed.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!("exactly N guards were claimed"),
        }
    }

    /// Announces and validates `link` through `guard`, returning the validated
    /// value with its mark bits intact.
    #[must_use]
    pub fn deref_link<N: HrcNode>(
        &self,
        guard: &HrcGuard<'_>,
        link: &AtomicMarkedPtr<N>,
    ) -> MarkedPtr<N> {
        guard.protect(link)
    }

    /// Releases the announcement held by `guard`, keeping the slot claimed.
    pub fn release_ref(&self, guard: &HrcGuard<'_>) {
        guard.clear();
    }

    /// Marks the node deleted and defers its destruction.
    ///
    /// When the retired set is full this escalates through local clean-up, a
    /// sweep, adoption of detached threads' leftovers, and a domain-wide
    /// clean-up, bounded by [`HrcDomain::DRAIN_ATTEMPTS`] rounds.
    ///
    /// # Safety
    ///
    /// `node` must originate from [`Box::into_raw`], must already be logically
    /// removed from the structure, and must not be retired twice.
    ///
    /// # Panics
    ///
    /// Panics if the retired set cannot be drained after the bounded number of
    /// escalation rounds, which indicates links mutated outside the counted
    /// helpers.
    pub unsafe fn retire_node<N: HrcNode>(&self, node: NonNull<N>) {
        let header = node.as_ref().header();
        header.deleted.store(true, Release);
        header.trace.store(false, Release);
        let len = {
            let mut retired = self.record().retired.lock();
            retired.push(DynNode(node));
            retired.len()
        };
        if len >= self.domain.options.max_retired_count {
            self.relieve();
        }
    }

    /// Sweeps this thread's retired set, destroying every node that is deleted,
    /// unreferenced and unannounced; the rest is re-queued.
    pub fn scan(&self) {
        // Deleters running below may retire more nodes through this same thread;
        // those land in the emptied set and must not recurse into scan.
        if self.scanning.replace(true) {
            return;
        }
        let candidates = std::mem::take(&mut *self.record().retired.lock());

        // First pass: flag candidates with no counted references. The re-check
        // catches a reference that appeared while the flag was being raised.
        for node in &candidates {
            let header = node.header();
            if header.rc.load(Acquire) == 0 {
                header.trace.store(true, SeqCst);
                if header.rc.load(SeqCst) != 0 {
                    header.trace.store(false, SeqCst);
                }
            }
        }

        let hazards = self.domain.collect_hazards();
        let before = candidates.len();
        let mut kept = Vec::new();
        for node in candidates {
            let header = node.header();
            if header.deleted.load(Acquire)
                && header.rc.load(Acquire) == 0
                && header.trace.load(Acquire)
                && hazards.binary_search(&node.address()).is_err()
            {
                unsafe {
                    let raw = node.0.as_ptr();
                    (*raw).terminate(&self.domain, false);
                    drop(Box::from_raw(raw));
                }
            } else {
                kept.push(node);
            }
        }

        let freed = before - kept.len();
        {
            let mut retired = self.record().retired.lock();
            kept.append(&mut retired);
            *retired = kept;
        }
        self.scanning.set(false);
        if freed > 0 {
            trace!("hrc scan freed {freed} of {before} retired nodes");
        }
    }

    /// Runs [`HrcNode::clean_up`] on every node in this thread's retired set,
    /// compressing chains through tombstones so their counts can drop.
    pub fn clean_up_local(&self) {
        // Only this thread's scan destroys nodes of this record, so the snapshot
        // stays valid without guarding each node.
        let snapshot: Vec<NonNull<dyn HrcNode>> = self
            .record()
            .retired
            .lock()
            .iter()
            .map(|node| node.0)
            .collect();
        for node in snapshot {
            unsafe { node.as_ref() }.clean_up(self);
        }
    }

    /// Adopts the retired nodes of every detached thread, so threads that exited
    /// without a successful final sweep never leak.
    pub fn help_scan(&self) {
        let mut adopted = 0;
        let mut record_ptr = self.domain.head.load(Acquire);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            record_ptr = record.next.load(Acquire);
            if ptr::eq(record, self.record()) || record.active.load(Acquire) {
                continue;
            }
            let mut theirs = record.retired.lock();
            if theirs.is_empty() {
                continue;
            }
            adopted += theirs.len();
            self.record().retired.lock().append(&mut theirs);
        }
        if adopted > 0 {
            debug!("hrc help_scan adopted {adopted} retired nodes");
        }
    }

    /// Runs [`HrcNode::clean_up`] on every retired node of every thread in the
    /// domain.
    ///
    /// Each foreign node is announced in a hazard slot while its membership in
    /// the owner's retired set is re-verified under the set's lock; the owner's
    /// sweep therefore either misses the node entirely or observes the
    /// announcement and keeps it.
    pub fn clean_up_all(&self) {
        let Ok(guard) = self.guard() else {
            // Every slot is claimed by a live guard; the remaining tiers still
            // make progress without the domain-wide pass.
            return;
        };
        let mut record_ptr = self.domain.head.load(Acquire);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            record_ptr = record.next.load(Acquire);
            let snapshot: Vec<NonNull<dyn HrcNode>> =
                record.retired.lock().iter().map(|node| node.0).collect();
            for node in snapshot {
                let announced = {
                    let retired = record.retired.lock();
                    let address = node.as_ptr().cast::<u8>() as usize;
                    if retired.iter().any(|candidate| candidate.address() == address) {
                        guard.protect_raw(address);
                        true
                    } else {
                        false
                    }
                };
                if announced {
                    unsafe { node.as_ref() }.clean_up(self);
                    guard.clear();
                }
            }
        }
    }

    /// Number of nodes retired through this thread's record and not yet freed.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.record().retired.lock().len()
    }

    /// Escalating relief: each tier is more global and more expensive, so a
    /// single thread's retirement burst cannot grow memory without bound.
    fn relieve(&self) {
        if self.scanning.get() {
            return;
        }
        for attempt in 0..HrcDomain::DRAIN_ATTEMPTS {
            self.clean_up_local();
            self.scan();
            if !self.is_full() {
                return;
            }
            debug!("hrc relief attempt {attempt}: adopting detached threads");
            self.help_scan();
            self.scan();
            if !self.is_full() {
                return;
            }
            debug!("hrc relief attempt {attempt}: domain-wide clean-up");
            self.clean_up_all();
            self.scan();
            if !self.is_full() {
                return;
            }
        }
        panic!(
            "hrc retired set cannot be drained after {} escalation rounds; \
             counted links are being mutated outside cas_ref/store_ref/xchg_ref",
            HrcDomain::DRAIN_ATTEMPTS
        );
    }

    fn is_full(&self) -> bool {
        self.record().retired.lock().len() >= self.domain.options.max_retired_count
    }

    fn record(&self) -> &HrcRecord {
        unsafe { self.record.as_ref() }
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        &self.record().slots[index]
    }
}

impl Drop for HrcThread {
    fn drop(&mut self) {
        // All guards are gone (they borrow this thread), so the slots are clear.
        self.scanning.set(false);
        self.scan();
        // Survivors stay in the record for adoption via help_scan.
        self.record().active.store(false, Release);
    }
}

impl fmt::Debug for HrcThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrcThread")
            .field("retired", &self.retired_count())
            .field("free_slots", &self.free_slots.borrow().len())
            .finish_non_exhaustive()
    }
}

/// An owned hazard slot of an [`HrcThread`], released on drop.
pub struct HrcGuard<'t> {
    thread: &'t HrcThread,
    index: usize,
}

impl HrcGuard<'_> {
    /// Announces and validates the pointer held by `src`, returning the validated
    /// value with its mark bits intact.
    #[must_use]
    pub fn protect<T>(&self, src: &AtomicMarkedPtr<T>) -> MarkedPtr<T> {
        let mut backoff = Backoff::new();
        let mut current = src.load(Acquire);
        loop {
            announce(self.thread.slot(self.index), current.ptr() as usize);
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
    /// dereferencing; prefer [`HrcGuard::protect`] when the source is available.
    pub fn protect_ptr<T>(&self, ptr: MarkedPtr<T>) {
        announce(self.thread.slot(self.index), ptr.ptr() as usize);
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

    pub(crate) fn protect_raw(&self, address: usize) {
        announce(self.thread.slot(self.index), address);
    }
}

impl Drop for HrcGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.clear();
        self.thread.free_slots.borrow_mut().push(self.index);
    }
}

impl fmt::Debug for HrcGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrcGuard")
            .field("slot", &self.index)
            .finish()
    }
}
