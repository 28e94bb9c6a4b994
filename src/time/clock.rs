//! [`Clock`]s provide a mechanism for tracking the current time.
use super::Duration;
use crate::util::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A monotonic time source definition.
///
/// A `Clock` consists of a function that returns the current timestamp in
/// [`Ticks`] (`now()`), and a [`Duration`] that defines the amount of time
/// represented by a single tick. A `Clock` must be provided when
/// [constructing a `Timer`](super::Timer::new); the timer uses it to decide
/// which sleeps are due when it is [turned](super::Timer::turn).
///
/// # Monotonicity
///
/// Implementations of `now()` MUST be monotonically non-decreasing: a call to
/// `now()` must never return a value less than a value returned by a previous
/// call. Timestamps are also expected not to overflow for any realistic
/// uptime of the system; if the underlying hardware counter is narrower than
/// 64 bits, the `now()` implementation is responsible for extending it.
#[derive(Clone, Debug)]
pub struct Clock {
    now: fn() -> Ticks,
    tick_duration: Duration,
    name: &'static str,
}

/// A measurement of a monotonically nondecreasing [`Clock`], opaque and
/// useful only with [`Duration`].
///
/// Provided that the [`Clock`] implementation is correct, `Instant`s are
/// always no less than any previously measured instant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

/// [`Clock`] ticks are always counted by a 64-bit unsigned integer.
pub type Ticks = u64;

// === impl Clock ===

impl Clock {
    /// Returns a new [`Clock`] with the provided tick [`Duration`] and
    /// `now()` function.
    #[must_use]
    pub const fn new(tick_duration: Duration, now: fn() -> Ticks) -> Self {
        Self {
            now,
            tick_duration,
            name: "<unnamed clock>",
        }
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the time source used by the `now()`
    /// function.
    #[must_use]
    pub const fn named(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Returns the current timestamp in [`Ticks`] of this clock's base tick
    /// duration.
    #[must_use]
    pub fn now_ticks(&self) -> Ticks {
        (self.now)()
    }

    /// Returns the [`Duration`] of one tick of this clock.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Returns an [`Instant`] representing the current timestamp according to
    /// this [`Clock`].
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant(ticks_to_dur(self.tick_duration, self.now_ticks()))
    }

    /// Returns the maximum duration representable by this clock.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        self.tick_duration.saturating_mul(u32::MAX)
    }

    /// Returns this `Clock`'s name, if it was given one using
    /// [`Clock::named`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[track_caller]
#[inline]
#[must_use]
fn ticks_to_dur(tick_duration: Duration, ticks: Ticks) -> Duration {
    const NANOS_PER_SEC: u64 = 1_000_000_000;
    // Multiply nanoseconds as u64, because it cannot overflow that way.
    let total_nanos = tick_duration.subsec_nanos() as u64 * ticks;
    let extra_secs = total_nanos / NANOS_PER_SEC;
    let nanos = (total_nanos % NANOS_PER_SEC) as u32;
    let Some(secs) = tick_duration.as_secs().checked_mul(ticks) else {
        panic!("ticks_to_dur({tick_duration:?}, {ticks}): tick duration seconds times ticks would overflow");
    };
    let Some(secs) = secs.checked_add(extra_secs) else {
        panic!("ticks_to_dur({tick_duration:?}, {ticks}): total seconds would overflow");
    };
    Duration::new(secs, nanos)
}

// === impl Instant ===

impl Instant {
    /// The latest representable `Instant`.
    ///
    /// A wait deadline of `Instant::MAX` never elapses; timed waits treat it
    /// as equivalent to an untimed wait.
    pub const MAX: Self = Self(Duration::MAX);

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    #[must_use]
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or [`None`] if that instant is later than this one.
    #[must_use]
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    /// Returns `Some(t)` where `t` is `self + duration`, or [`None`] if the
    /// sum cannot be represented.
    #[must_use]
    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_add(duration).map(Instant)
    }

    /// Returns `Some(t)` where `t` is `self - duration`, or [`None`] if the
    /// difference cannot be represented.
    #[must_use]
    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_sub(duration).map(Instant)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// If the resulting point in time cannot be represented. See
    /// [`Instant::checked_add`] for a version without panics.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, other: Duration) -> Instant {
        self.checked_sub(other)
            .expect("overflow when subtracting duration from instant")
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the amount of time elapsed from `other` to `self`, or zero
    /// duration if `other` is later.
    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Display for Instant {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
