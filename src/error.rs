use thiserror::Error;

/// Configuration misuse detected by a reclamation domain.
///
/// Every variant is a programmer error: transient contention (a failed
/// compare-exchange, a busy reclamation lock, a full retired buffer) is always
/// resolved internally and never surfaces through this type.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// More hazard pointer slots were requested than the domain was built with.
    #[error("not enough hazard pointer slots: requested {requested}, capacity {capacity}")]
    TooManyHazardPointers {
        /// The number of slots the caller asked for.
        requested: usize,
        /// The per-thread slot capacity the domain was constructed with.
        capacity: usize,
    },

    /// The domain already has `max` registered thread records, all of them live.
    #[error("thread limit exceeded: the domain supports at most {max} concurrent threads")]
    ThreadLimitExceeded {
        /// The thread record capacity the domain was constructed with.
        max: usize,
    },
}
