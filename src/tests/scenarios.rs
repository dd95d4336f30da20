use std::ptr::NonNull;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Barrier};
use std::thread;

use crate::{
    AtomicMarkedPtr, Backoff, HpDomain, HrcDomain, HrcNode, HrcThread, MarkedPtr, NodeHeader,
    PtbDomain, PtbOptions,
};

/// A Treiber stack protected by classic hazard pointers. The pop path exercises
/// the full protocol: protect the head, verify it via compare-exchange, read
/// through it, retire it after the unlink.
mod hp_stack {
    use super::*;

    pub struct Node {
        pub value: usize,
        pub counter: &'static AtomicUsize,
        pub next: AtomicMarkedPtr<Node>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.counter.fetch_sub(1, Relaxed);
        }
    }

    pub struct Stack {
        pub head: AtomicMarkedPtr<Node>,
    }

    impl Stack {
        pub fn new() -> Self {
            Self {
                head: AtomicMarkedPtr::null(),
            }
        }

        pub fn push(&self, value: usize, counter: &'static AtomicUsize) {
            counter.fetch_add(1, Relaxed);
            let node = Box::into_raw(Box::new(Node {
                value,
                counter,
                next: AtomicMarkedPtr::null(),
            }));
            let mut backoff = Backoff::new();
            let mut head = self.head.load(Acquire);
            loop {
                unsafe { (*node).next.store(head, Relaxed) };
                match self.head.compare_exchange_weak(
                    head,
                    MarkedPtr::new(node),
                    AcqRel,
                    Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        head = actual;
                        backoff.spin();
                    }
                }
            }
        }

        pub fn pop(&self, thread: &crate::HpThread) -> Option<usize> {
            let guard = thread.guard().unwrap();
            let mut backoff = Backoff::new();
            loop {
                let head = guard.protect(&self.head);
                let node = unsafe { head.as_ref() }?;
                let next = node.next.load(Acquire);
                if self
                    .head
                    .compare_exchange(head, next, AcqRel, Acquire)
                    .is_ok()
                {
                    let value = node.value;
                    unsafe { thread.retire(NonNull::new(head.ptr()).unwrap()) };
                    return Some(value);
                }
                backoff.spin();
            }
        }
    }
}

#[test]
fn hp_stack_stress() {
    static INST_CNT: AtomicUsize = AtomicUsize::new(0);

    let num_threads = 4;
    let workload_size = 1024;

    let domain = Arc::new(HpDomain::with_defaults());
    let stack = Arc::new(hp_stack::Stack::new());
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let barrier = Arc::new(Barrier::new(num_threads));
    let mut threads = Vec::with_capacity(num_threads);
    for thread_id in 0..num_threads {
        let domain = domain.clone();
        let stack = stack.clone();
        let pushed = pushed.clone();
        let popped = popped.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let thread = domain.attach().unwrap();
            barrier.wait();
            for seq in 0..workload_size {
                let value = thread_id * workload_size + seq;
                stack.push(value, &INST_CNT);
                pushed.fetch_add(value, Relaxed);
                if seq % 2 == 0 {
                    if let Some(value) = stack.pop(&thread) {
                        popped.fetch_add(value, Relaxed);
                    }
                }
            }
        }));
    }
    for t in threads {
        assert!(t.join().is_ok());
    }

    // Drain the survivors; every value pushed must come back exactly once.
    let thread = domain.attach().unwrap();
    while let Some(value) = stack.pop(&thread) {
        popped.fetch_add(value, Relaxed);
    }
    assert_eq!(pushed.load(Relaxed), popped.load(Relaxed));

    thread.scan();
    drop(thread);
    drop(domain);
    assert_eq!(INST_CNT.load(Relaxed), 0);
}

#[test]
fn ptb_stack_stress() {
    static INST_CNT: AtomicUsize = AtomicUsize::new(0);

    struct Node {
        value: usize,
        next: AtomicMarkedPtr<Node>,
    }
    impl Drop for Node {
        fn drop(&mut self) {
            INST_CNT.fetch_sub(1, Relaxed);
        }
    }

    struct Stack {
        head: AtomicMarkedPtr<Node>,
    }

    impl Stack {
        fn push(&self, value: usize) {
            INST_CNT.fetch_add(1, Relaxed);
            let node = Box::into_raw(Box::new(Node {
                value,
                next: AtomicMarkedPtr::null(),
            }));
            let mut backoff = Backoff::new();
            let mut head = self.head.load(Acquire);
            loop {
                unsafe { (*node).next.store(head, Relaxed) };
                match self.head.compare_exchange_weak(
                    head,
                    MarkedPtr::new(node),
                    AcqRel,
                    Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        head = actual;
                        backoff.spin();
                    }
                }
            }
        }

        fn pop(&self, thread: &crate::PtbThread) -> Option<usize> {
            let guard = thread.guard();
            let mut backoff = Backoff::new();
            loop {
                let head = guard.protect(&self.head);
                let node = unsafe { head.as_ref() }?;
                let next = node.next.load(Acquire);
                if self
                    .head
                    .compare_exchange(head, next, AcqRel, Acquire)
                    .is_ok()
                {
                    let value = node.value;
                    unsafe { thread.retire(NonNull::new(head.ptr()).unwrap()) };
                    return Some(value);
                }
                backoff.spin();
            }
        }
    }

    let num_threads = 4;
    let workload_size = 1024;

    let domain = Arc::new(PtbDomain::with_defaults());
    let stack = Arc::new(Stack {
        head: AtomicMarkedPtr::null(),
    });
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let barrier = Arc::new(Barrier::new(num_threads));
    let mut threads = Vec::with_capacity(num_threads);
    for thread_id in 0..num_threads {
        let domain = domain.clone();
        let stack = stack.clone();
        let pushed = pushed.clone();
        let popped = popped.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let thread = domain.attach();
            barrier.wait();
            for seq in 0..workload_size {
                let value = thread_id * workload_size + seq;
                stack.push(value);
                pushed.fetch_add(value, Relaxed);
                if seq % 2 == 0 {
                    if let Some(value) = stack.pop(&thread) {
                        popped.fetch_add(value, Relaxed);
                    }
                }
            }
        }));
    }
    for t in threads {
        assert!(t.join().is_ok());
    }

    let thread = domain.attach();
    while let Some(value) = stack.pop(&thread) {
        popped.fetch_add(value, Relaxed);
    }
    assert_eq!(pushed.load(Relaxed), popped.load(Relaxed));

    drop(thread);
    // All guards are clear, so the final sweeps in the domain destructor free
    // everything that is still buffered.
    drop(stack);
    drop(domain);
    assert_eq!(INST_CNT.load(Relaxed), 0);
}

#[test]
fn ptb_concurrent_retire_and_liberate() {
    static INST_CNT: AtomicUsize = AtomicUsize::new(0);

    struct Victim(&'static AtomicUsize);
    impl Drop for Victim {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    let num_threads = 4;
    let workload_size = 1024;

    // A tiny threshold keeps sweeps and pushes constantly racing, so steals of
    // the buffer overlap concurrent retirements throughout the run.
    let domain = Arc::new(PtbDomain::new(PtbOptions {
        liberate_threshold: 8,
        ..PtbOptions::default()
    }));

    let barrier = Arc::new(Barrier::new(num_threads));
    let mut threads = Vec::with_capacity(num_threads);
    for _ in 0..num_threads {
        let domain = domain.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let thread = domain.attach();
            barrier.wait();
            for seq in 0..workload_size {
                INST_CNT.fetch_add(1, Relaxed);
                let ptr = NonNull::from(Box::leak(Box::new(Victim(&INST_CNT))));
                unsafe { thread.retire(ptr) };
                if seq % 3 == 0 {
                    domain.try_liberate();
                }
            }
        }));
    }
    for t in threads {
        assert!(t.join().is_ok());
    }

    // The destructor must drain the buffer chain completely, including entries
    // whose counter update raced with a sweep's steal.
    drop(domain);
    assert_eq!(INST_CNT.load(Relaxed), 0);
}

/// A sorted singly linked list protected by hazard pointers, with the first mark
/// bit on a node's `next` link flagging the node as logically deleted. Removal
/// is mark-then-unlink; any traversal unlinks the tombstones it runs into.
mod hp_list {
    use super::*;
    use crate::{HpGuard, HpThread};

    const DELETED: usize = 0b01;

    pub struct Node {
        pub key: usize,
        pub counter: &'static AtomicUsize,
        pub next: AtomicMarkedPtr<Node>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.counter.fetch_sub(1, Relaxed);
        }
    }

    pub struct List {
        head: AtomicMarkedPtr<Node>,
    }

    impl List {
        pub fn new() -> Self {
            Self {
                head: AtomicMarkedPtr::null(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.head.load(Acquire).is_null()
        }

        /// Positions `(prev, curr)` around `key`: `prev` is the link whose
        /// target is the first node with `node.key >= key` (or null), and that
        /// target is returned as `curr`, unmarked and guarded by `g_curr`.
        /// Tombstones encountered on the way are unlinked and retired.
        fn find<'l>(
            &'l self,
            thread: &HpThread,
            g_prev: &HpGuard<'_>,
            g_curr: &HpGuard<'_>,
            key: usize,
        ) -> (bool, &'l AtomicMarkedPtr<Node>, MarkedPtr<Node>) {
            'retry: loop {
                g_prev.clear();
                let mut prev: &'l AtomicMarkedPtr<Node> = &self.head;
                let mut curr = g_curr.protect(prev).clear_marks();
                loop {
                    let curr_node: Option<&'l Node> = unsafe { curr.as_ref() };
                    let Some(curr_node) = curr_node else {
                        return (false, prev, curr);
                    };
                    let next = curr_node.next.load(Acquire);
                    // Re-validate: the link must still hold `curr`, unmarked.
                    // A mark here means the predecessor itself was deleted.
                    if prev.load(Acquire) != curr {
                        continue 'retry;
                    }
                    if next.is_marked(DELETED) {
                        if prev
                            .compare_exchange(curr, next.clear_marks(), AcqRel, Acquire)
                            .is_err()
                        {
                            continue 'retry;
                        }
                        unsafe { thread.retire(NonNull::new_unchecked(curr.ptr())) };
                        curr = g_curr.protect(prev).clear_marks();
                        continue;
                    }
                    if curr_node.key >= key {
                        return (curr_node.key == key, prev, curr);
                    }
                    g_prev.protect_ptr(curr);
                    prev = &curr_node.next;
                    curr = g_curr.protect(prev).clear_marks();
                }
            }
        }

        pub fn insert(
            &self,
            thread: &HpThread,
            key: usize,
            counter: &'static AtomicUsize,
        ) -> bool {
            counter.fetch_add(1, Relaxed);
            let node = Box::into_raw(Box::new(Node {
                key,
                counter,
                next: AtomicMarkedPtr::null(),
            }));
            let [g_prev, g_curr] = thread.guards::<2>().unwrap();
            let mut backoff = Backoff::new();
            loop {
                let (found, prev, curr) = self.find(thread, &g_prev, &g_curr, key);
                if found {
                    drop(unsafe { Box::from_raw(node) });
                    return false;
                }
                unsafe { (*node).next.store(curr, Relaxed) };
                if prev
                    .compare_exchange(curr, MarkedPtr::new(node), AcqRel, Acquire)
                    .is_ok()
                {
                    return true;
                }
                backoff.spin();
            }
        }

        pub fn remove(&self, thread: &HpThread, key: usize) -> bool {
            let [g_prev, g_curr] = thread.guards::<2>().unwrap();
            let mut backoff = Backoff::new();
            loop {
                let (found, prev, curr) = self.find(thread, &g_prev, &g_curr, key);
                if !found {
                    return false;
                }
                let curr_node = unsafe { curr.as_ref() }.unwrap();
                let next = curr_node.next.load(Acquire);
                if next.is_marked(DELETED) {
                    // Another remover won the logical delete; retry to observe
                    // the outcome.
                    backoff.spin();
                    continue;
                }
                // Logical deletion: one compare-exchange flips the mark and
                // verifies the successor pointer at the same time.
                if !curr_node.next.try_mark(next, DELETED, AcqRel, Acquire) {
                    backoff.spin();
                    continue;
                }
                // Physical unlink; on failure some later traversal does it.
                if prev
                    .compare_exchange(curr, next.clear_marks(), AcqRel, Acquire)
                    .is_ok()
                {
                    unsafe { thread.retire(NonNull::new_unchecked(curr.ptr())) };
                }
                return true;
            }
        }

        pub fn contains(&self, thread: &HpThread, key: usize) -> bool {
            let [g_prev, g_curr] = thread.guards::<2>().unwrap();
            let (found, _, _) = self.find(thread, &g_prev, &g_curr, key);
            found
        }
    }
}

#[test]
fn hp_ordered_list_scenario() {
    static INST_CNT: AtomicUsize = AtomicUsize::new(0);

    let num_writers = 2;
    let keys_per_writer = 256;

    let domain = Arc::new(HpDomain::with_defaults());
    let list = Arc::new(hp_list::List::new());
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    // Writer w owns keys with `key % num_writers == w`; it inserts them all and
    // removes every other one, while a reader traverses concurrently.
    let mut threads = Vec::new();
    for writer_id in 0..num_writers {
        let domain = domain.clone();
        let list = list.clone();
        threads.push(thread::spawn(move || {
            let thread = domain.attach().unwrap();
            for seq in 0..keys_per_writer {
                let key = seq * num_writers + writer_id;
                assert!(list.insert(&thread, key, &INST_CNT));
                if seq % 2 == 0 {
                    assert!(list.remove(&thread, key));
                }
            }
        }));
    }
    let reader = {
        let domain = domain.clone();
        let list = list.clone();
        let running = running.clone();
        thread::spawn(move || {
            let thread = domain.attach().unwrap();
            while running.load(Relaxed) {
                for key in 0..num_writers * keys_per_writer {
                    // Traversal must never crash or observe a freed node; the
                    // result itself is racy and carries no assertion.
                    let _ = list.contains(&thread, key);
                }
            }
        })
    };

    for t in threads {
        assert!(t.join().is_ok());
    }
    running.store(false, Relaxed);
    assert!(reader.join().is_ok());

    let thread = domain.attach().unwrap();
    for seq in 0..keys_per_writer {
        for writer_id in 0..num_writers {
            let key = seq * num_writers + writer_id;
            assert_eq!(list.contains(&thread, key), seq % 2 != 0);
        }
    }
    // Key `num_writers` (seq 1, writer 0) survived the writers; inserting it
    // again must fail.
    assert!(!list.insert(&thread, num_writers, &INST_CNT));

    for seq in (1..keys_per_writer).step_by(2) {
        for writer_id in 0..num_writers {
            assert!(list.remove(&thread, seq * num_writers + writer_id));
        }
    }
    assert!(list.is_empty());

    thread.scan();
    drop(thread);
    drop(list);
    drop(domain);
    assert_eq!(INST_CNT.load(Relaxed), 0);
}

/// A Treiber stack on counted links: push and pop go through `cas_ref`, popped
/// nodes are retired, and `clean_up` re-points chains of popped nodes so their
/// counts can fall.
mod hrc_stack {
    use super::*;

    pub struct Node {
        pub value: usize,
        pub counter: &'static AtomicUsize,
        pub next: AtomicMarkedPtr<Node>,
        pub header: NodeHeader,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.counter.fetch_sub(1, Relaxed);
        }
    }

    impl HrcNode for Node {
        fn header(&self) -> &NodeHeader {
            &self.header
        }

        fn clean_up(&self, thread: &HrcThread) {
            let Ok(guard) = thread.guard() else { return };
            loop {
                let next = thread.deref_link(&guard, &self.next);
                let Some(node) = (unsafe { next.as_ref() }) else {
                    break;
                };
                if !node.header().is_deleted() {
                    break;
                }
                // The tombstone is guarded and its own next link counts the
                // successor, so the successor cannot go away mid-splice.
                let skipped = node.next.load(Acquire);
                if !unsafe { thread.domain().cas_ref(&self.next, next, skipped) } {
                    break;
                }
            }
        }

        fn terminate(&self, domain: &HrcDomain, _concurrent: bool) {
            unsafe { domain.store_ref(&self.next, MarkedPtr::null()) };
        }
    }

    pub struct Stack {
        pub head: AtomicMarkedPtr<Node>,
    }

    impl Stack {
        pub fn push(&self, thread: &HrcThread, value: usize, counter: &'static AtomicUsize) {
            counter.fetch_add(1, Relaxed);
            let node = NonNull::from(Box::leak(Box::new(Node {
                value,
                counter,
                next: AtomicMarkedPtr::null(),
                header: NodeHeader::new(),
            })));
            let domain = thread.domain().clone();
            let guard = thread.guard().unwrap();
            let mut backoff = Backoff::new();
            loop {
                let head = thread.deref_link(&guard, &self.head);
                unsafe {
                    domain.store_ref(&node.as_ref().next, head);
                    if domain.cas_ref(&self.head, head, MarkedPtr::new(node.as_ptr())) {
                        return;
                    }
                }
                backoff.spin();
            }
        }

        pub fn pop(&self, thread: &HrcThread) -> Option<usize> {
            let domain = thread.domain().clone();
            let [head_guard, next_guard] = thread.guards::<2>().unwrap();
            let mut backoff = Backoff::new();
            loop {
                let head = thread.deref_link(&head_guard, &self.head);
                let node = unsafe { head.as_ref() }?;
                let next = thread.deref_link(&next_guard, &node.next);
                if unsafe { domain.cas_ref(&self.head, head, next) } {
                    let value = node.value;
                    unsafe { thread.retire_node(NonNull::new_unchecked(head.ptr())) };
                    return Some(value);
                }
                backoff.spin();
            }
        }
    }
}

#[test]
fn hrc_stack_stress() {
    static INST_CNT: AtomicUsize = AtomicUsize::new(0);

    let num_threads = 4;
    let workload_size = 512;

    let domain = Arc::new(HrcDomain::with_defaults());
    let stack = Arc::new(hrc_stack::Stack {
        head: AtomicMarkedPtr::null(),
    });
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let barrier = Arc::new(Barrier::new(num_threads));
    let mut threads = Vec::with_capacity(num_threads);
    for thread_id in 0..num_threads {
        let domain = domain.clone();
        let stack = stack.clone();
        let pushed = pushed.clone();
        let popped = popped.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let thread = domain.attach().unwrap();
            barrier.wait();
            for seq in 0..workload_size {
                let value = thread_id * workload_size + seq;
                stack.push(&thread, value, &INST_CNT);
                pushed.fetch_add(value, Relaxed);
                if seq % 2 == 0 {
                    if let Some(value) = stack.pop(&thread) {
                        popped.fetch_add(value, Relaxed);
                    }
                }
            }
        }));
    }
    for t in threads {
        assert!(t.join().is_ok());
    }

    let thread = domain.attach().unwrap();
    while let Some(value) = stack.pop(&thread) {
        popped.fetch_add(value, Relaxed);
    }
    assert_eq!(pushed.load(Relaxed), popped.load(Relaxed));

    // Adopt whatever detached threads left behind, then let the domain
    // destructor terminate and free the remainder.
    thread.help_scan();
    thread.clean_up_local();
    thread.scan();
    drop(thread);
    drop(stack);
    drop(domain);
    assert_eq!(INST_CNT.load(Relaxed), 0);
}
