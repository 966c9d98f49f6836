//! Media time and clocks
//!
//! Every media message carries a capture or playout time expressed as a
//! signed microsecond count on its stream's timeline. Components that make
//! time-based decisions read "now" from a [`Clock`] so that the same code
//! runs against the system clock in production and a [`ManualClock`] in tests.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::{Duration, Instant};

/// Signed time value in microseconds
///
/// Used both for points on a playout timeline and for offsets between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaTime(i64);

impl MediaTime {
    /// The zero point of a timeline
    pub const ZERO: MediaTime = MediaTime(0);

    /// Create a time value from microseconds
    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        MediaTime(micros)
    }

    /// Create a time value from milliseconds
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        MediaTime(millis * 1_000)
    }

    /// Create a time value from whole seconds
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        MediaTime(secs * 1_000_000)
    }

    /// Create a time value from fractional seconds (rounded to the nearest microsecond)
    pub fn from_secs_f64(secs: f64) -> Self {
        MediaTime((secs * 1_000_000.0).round() as i64)
    }

    /// Create a time value from a (non-negative) duration, saturating at `i64::MAX`
    pub fn from_duration(duration: Duration) -> Self {
        MediaTime(duration.as_micros().try_into().unwrap_or(i64::MAX))
    }

    /// Raw microsecond value
    #[inline]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Value in fractional seconds
    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to a duration; negative values yield `None`
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_micros)
    }

    /// True if the value is strictly below zero
    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Absolute value
    #[inline]
    pub fn abs(self) -> Self {
        MediaTime(self.0.saturating_abs())
    }

    /// Clamp into `[min, max]`
    pub fn clamp(self, min: MediaTime, max: MediaTime) -> Self {
        MediaTime(self.0.clamp(min.0, max.0))
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self = *self + rhs;
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        *self = *self - rhs;
    }
}

impl Neg for MediaTime {
    type Output = MediaTime;

    fn neg(self) -> MediaTime {
        MediaTime(self.0.saturating_neg())
    }
}

/// Source of "now" for time-driven components
pub trait Clock: Send + Sync {
    /// Current time on this clock's timeline
    fn now(&self) -> MediaTime;
}

/// Monotonic clock measuring time since its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose zero point is the moment of creation
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }

    /// The instant corresponding to this clock's zero point
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MediaTime {
        MediaTime::from_duration(self.origin.elapsed())
    }
}

/// Clock that only moves when told to
///
/// Lets tests step through time-dependent behaviour without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<MediaTime>,
}

impl ManualClock {
    /// Create a manual clock reading `start`
    pub fn new(start: MediaTime) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: MediaTime) {
        *self.now.lock() = now;
    }

    /// Move forward by `delta`
    pub fn advance(&self, delta: MediaTime) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MediaTime {
        *self.now.lock()
    }
}

/// Timer for periodic housekeeping
///
/// Driven by explicit `now` values so it can share a [`Clock`] with its owner.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: MediaTime,
    last_fire: Option<MediaTime>,
}

impl Timer {
    /// Create a new timer with the given interval
    ///
    /// A fresh timer fires on its first check.
    pub fn new(interval: MediaTime) -> Self {
        Timer {
            interval,
            last_fire: None,
        }
    }

    /// Timer interval
    pub fn interval(&self) -> MediaTime {
        self.interval
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: MediaTime) -> bool {
        match self.last_fire {
            Some(last) => now - last >= self.interval,
            None => true,
        }
    }

    /// Reset the timer
    pub fn reset(&mut self, now: MediaTime) {
        self.last_fire = Some(now);
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: MediaTime) -> MediaTime {
        match self.last_fire {
            Some(last) => (last + self.interval - now).clamp(MediaTime::ZERO, self.interval),
            None => MediaTime::ZERO,
        }
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: MediaTime) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}
