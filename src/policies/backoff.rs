//! # Relaunch backoff for engines.
//!
//! The delay before relaunch attempt `n` (0-indexed, counted since the last
//! successful launch) is `first × factor^n`, clamped to `max`, then jittered.
//! The base is derived from `n` alone, so jitter never feeds back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use enginevisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(2),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(3), Duration::from_millis(800));
//! assert_eq!(backoff.next(9), Duration::from_secs(2));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Delay schedule for relaunching a worker that failed to start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first relaunch.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth per attempt (`1.0` = constant).
    pub factor: f64,
    /// Randomization applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `first = 100ms`, `factor = 2.0`, `max = 5s`, `jitter = Equal`.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Delay before relaunch attempt `attempt`.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if secs.is_finite() && secs >= 0.0 && secs <= self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let p = plain(50, 1000, 2.0);
        let delays: Vec<u64> = (0..7).map(|n| p.next(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn first_above_max_is_capped() {
        assert_eq!(plain(9000, 500, 1.0).next(0), Duration::from_millis(500));
    }

    #[test]
    fn overflow_clamps_to_max() {
        assert_eq!(plain(100, 3000, 10.0).next(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn default_jitter_keeps_at_least_half() {
        let p = BackoffPolicy::default();
        for n in 0..8 {
            let base = plain(100, 5000, 2.0).next(n);
            let d = p.next(n);
            assert!(d >= base / 2 && d <= base, "attempt {n}: {d:?} vs {base:?}");
        }
    }
}
