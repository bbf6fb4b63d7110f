//! Backoff strategies for scheduling retries.
//!
//! The webhook dispatcher's default schedule is
//! `BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(32))`,
//! which yields 2s, 4s, 8s, 16s, and 32s for attempts 1 through 5.
//!
//! All of the constructors and configuration functions other than
//! [`BackoffStrategy::with_jitter`] are `const`.

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the attempt number, returns the [`TimeDelta`] to wait before
    /// retrying.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// Always returns the same delay no matter what the attempt is. Constructed
/// via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// Grows exponentially with each attempt: `base^attempt`, capped at the
/// maximum when one is set via [`BackoffStrategy::with_max`]. Constructed via
/// [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt.into())
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter added to the backoff in the range
    /// `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// A random jitter added as a proportion of the current backoff.
    Relative(f64),
}

/// A backoff strategy optionally modified by jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T> {
    strategy: T,
    jitter: Option<Jitter>,
}

impl BackoffStrategy<Constant> {
    /// Creates a constant backoff strategy.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self {
            strategy: Constant { delay },
            jitter: None,
        }
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates an exponential backoff strategy with the given base.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self {
            strategy: Exponential { base, max: None },
            jitter: None,
        }
    }

    /// Sets the maximum backoff.
    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            strategy: Exponential {
                base: self.strategy.base,
                max: Some(max),
            },
            jitter: self.jitter,
        }
    }
}

impl<T> BackoffStrategy<T> {
    /// Applies jitter to the computed backoff.
    pub fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            jitter: Some(jitter),
            ..self
        }
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        let jittered = match self.jitter {
            None => backoff,
            Some(Jitter::Absolute(delta)) => {
                let millis = delta.num_milliseconds().abs();
                backoff
                    + TimeDelta::milliseconds(rand::thread_rng().gen_range(-millis..=millis))
            }
            Some(Jitter::Relative(factor)) => {
                let scale = rand::thread_rng().gen_range(-factor.abs()..=factor.abs());
                backoff
                    + TimeDelta::milliseconds(
                        (backoff.num_milliseconds() as f64 * scale) as i64,
                    )
            }
        };
        jittered.max(TimeDelta::zero())
    }
}
