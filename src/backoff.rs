use std::hint;

use crate::maybe_std::yield_now;

/// [`Backoff`] performs exponential backoff inside compare-exchange retry loops.
///
/// Spinning doubles on every step up to a limit; past the limit, [`Backoff::snooze`]
/// yields the time slice to the scheduler instead of burning cycles. Retry loops own
/// a fresh instance each, so contention on one location never throttles another.
///
/// # Examples
///
/// ```
/// use smr::Backoff;
///
/// let mut backoff = Backoff::new();
/// while !backoff.is_completed() {
///     backoff.snooze();
/// }
/// ```
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    /// Creates a new [`Backoff`] in its initial state.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Resets the backoff to its initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Spins for a bounded number of iterations.
    ///
    /// Suited to loops that are expected to succeed within a few retries, such as
    /// a failed weak compare-exchange.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1_u32 << self.step.min(Self::SPIN_LIMIT) {
            hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Spins while the budget lasts, then yields the time slice.
    ///
    /// Suited to loops waiting on progress made by another thread, such as the
    /// announce-validate retry of a hazard pointer.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1_u32 << self.step {
                hint::spin_loop();
            }
        } else {
            yield_now();
        }
        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Returns `true` once spinning stopped being productive.
    ///
    /// Callers that can park or restructure their work should do so when this
    /// returns `true`.
    #[inline]
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}
