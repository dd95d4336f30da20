#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod marked;
pub use marked::{AtomicMarkedPtr, MarkedPtr, MARK_BITS};

mod backoff;
pub use backoff::Backoff;

mod error;
pub use error::Error;

pub mod hp;
pub use hp::{HpDomain, HpGuard, HpOptions, HpThread};

pub mod ptb;
pub use ptb::{PtbDomain, PtbGuard, PtbOptions, PtbThread};

pub mod hrc;
pub use hrc::{HrcDomain, HrcGuard, HrcNode, HrcOptions, HrcThread, NodeHeader};

mod retired;

#[cfg(feature = "loom")]
mod maybe_std {
    pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize};
    pub(crate) use loom::thread::yield_now;
}

#[cfg(not(feature = "loom"))]
mod maybe_std {
    pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize};
    pub(crate) use std::thread::yield_now;
}

#[cfg(test)]
mod tests;
