use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A point on the monotonic clock, in microseconds.
///
/// All expiry comparisons and the timestamps handed to read callbacks use
/// this type. It is not related to wall-clock time and survives clock
/// adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// The current monotonic time.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
        Timestamp {
            micros: ts.tv_sec * MICROS_PER_SECOND + ts.tv_nsec / 1_000,
        }
    }

    /// The zero timestamp, ordered before every `now()`.
    pub fn invalid() -> Self {
        Timestamp { micros: 0 }
    }

    pub fn is_valid(self) -> bool {
        self.micros > 0
    }

    /// Microseconds since the monotonic epoch.
    pub fn micros_since_epoch(self) -> i64 {
        self.micros
    }

    #[cfg(test)]
    pub(crate) fn from_micros(micros: i64) -> Self {
        Timestamp { micros }
    }

    /// Microseconds from `self` until `later`; negative if `later` is earlier.
    pub fn micros_until(self, later: Timestamp) -> i64 {
        later.micros - self.micros
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    /// Saturates to zero if `rhs` is later than `self`.
    fn sub(self, rhs: Timestamp) -> Duration {
        let diff = self.micros - rhs.micros;
        if diff <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(diff as u64)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SECOND,
            self.micros % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
        assert!(a.is_valid());
    }

    #[test]
    fn invalid_orders_before_now() {
        assert!(Timestamp::invalid() < Timestamp::now());
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn duration_arithmetic() {
        let t = Timestamp::from_micros(1_500_000);
        let later = t + Duration::from_millis(250);
        assert_eq!(later.micros_since_epoch(), 1_750_000);
        assert_eq!(later - t, Duration::from_micros(250_000));
        assert_eq!(t - later, Duration::ZERO);
        assert_eq!(t.micros_until(later), 250_000);
        assert_eq!(later.micros_until(t), -250_000);
    }

    #[test]
    fn display_pads_micros() {
        assert_eq!(Timestamp::from_micros(3_000_042).to_string(), "3.000042");
    }
}
