// These models exhaustively explore the atomic protocols only: the hazard
// announce/validate handshake and the buffer steal. The domains' orphan and
// free-list locks are `parking_lot` mutexes, which loom does not instrument,
// so interleavings inside those cold paths are exercised by the stress tests
// instead.

use std::ptr::NonNull;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};

use loom::thread::spawn;

use crate::{AtomicMarkedPtr, HpDomain, HpOptions, MarkedPtr, PtbDomain};

struct Payload(Arc<AtomicBool>);
impl Drop for Payload {
    fn drop(&mut self) {
        self.0.store(true, Relaxed);
    }
}

static SERIALIZER: Mutex<()> = Mutex::new(());

#[test]
fn hp_protect_vs_retire() {
    let _lock = SERIALIZER.lock().unwrap();
    loom::model(|| {
        let dropped = Arc::new(AtomicBool::new(false));
        let domain = Arc::new(HpDomain::new(HpOptions {
            hazard_ptr_count: 1,
            max_thread_count: 2,
            scan_threshold: usize::MAX,
        }));
        let link = Arc::new(AtomicMarkedPtr::new(MarkedPtr::new(Box::into_raw(
            Box::new(Payload(dropped.clone())),
        ))));

        let reader = {
            let domain = domain.clone();
            let link = link.clone();
            spawn(move || {
                let thread = domain.attach().unwrap();
                let guard = thread.guard().unwrap();
                let ptr = guard.protect(&link);
                // A validated announcement means the payload has not been
                // dropped, no matter how the writer interleaves.
                if let Some(payload) = unsafe { ptr.as_ref() } {
                    assert!(!payload.0.load(Relaxed));
                }
            })
        };

        let thread = domain.attach().unwrap();
        let old = link.swap(MarkedPtr::null(), AcqRel);
        unsafe { thread.retire(NonNull::new(old.ptr()).unwrap()) };
        thread.scan();

        assert!(reader.join().is_ok());
        drop(thread);
        drop(domain);
        assert!(dropped.load(Relaxed));
    });
}

#[test]
fn ptb_protect_vs_liberate() {
    let _lock = SERIALIZER.lock().unwrap();
    loom::model(|| {
        let dropped = Arc::new(AtomicBool::new(false));
        let domain = Arc::new(PtbDomain::with_defaults());
        let link = Arc::new(AtomicMarkedPtr::new(MarkedPtr::new(Box::into_raw(
            Box::new(Payload(dropped.clone())),
        ))));

        let reader = {
            let domain = domain.clone();
            let link = link.clone();
            spawn(move || {
                let thread = domain.attach();
                let guard = thread.guard();
                let ptr = guard.protect(&link);
                if let Some(payload) = unsafe { ptr.as_ref() } {
                    assert!(!payload.0.load(Relaxed));
                }
            })
        };

        let thread = domain.attach();
        let old = link.swap(MarkedPtr::null(), AcqRel);
        unsafe { thread.retire(NonNull::new(old.ptr()).unwrap()) };
        domain.try_liberate();

        assert!(reader.join().is_ok());
        drop(thread);
        drop(domain);
        assert!(dropped.load(Relaxed));
    });
}

#[test]
fn marked_try_mark_single_winner() {
    let _lock = SERIALIZER.lock().unwrap();
    loom::model(|| {
        let address = Box::into_raw(Box::new(0_u64)) as usize;
        let link = Arc::new(AtomicMarkedPtr::new(MarkedPtr::new(address as *mut u64)));
        let wins = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let link = link.clone();
                let wins = wins.clone();
                spawn(move || {
                    let expected = MarkedPtr::new(address as *mut u64);
                    if link.try_mark(expected, 0b01, AcqRel, Acquire) {
                        wins.fetch_add(1, Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            assert!(t.join().is_ok());
        }

        // Exactly one thread observed the unmarked word.
        assert_eq!(wins.load(Relaxed), 1);
        assert!(link.load(Acquire).is_marked(0b01));
        drop(unsafe { Box::from_raw(address as *mut u64) });
    });
}
