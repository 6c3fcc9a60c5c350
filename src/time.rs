//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the mesh stack and are not meant to be general-purpose. The APIs here
//! have millisecond resolution (the resolution of every timer the mesh bearer layers use) and use
//! 32-bit arithmetic wherever possible.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with millisecond resolution.
///
/// This can represent a maximum duration of about 49 days. Overflows will result in a panic, but
/// shouldn't happen since the mesh stack doesn't deal with durations that large (the longest
/// timeout in use is the 60-second link establishment timer).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u32);

impl Duration {
    /// Creates a [`Duration`] from a number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns the number of milliseconds represented by `self`.
    pub fn as_millis(&self) -> u32 {
        self.0
    }

    /// Returns the fractional part of milliseconds in `self`.
    pub fn subsec_millis(&self) -> u32 {
        self.0 % 1_000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000 {
            let (secs, subsec_millis) = (self.whole_secs(), self.subsec_millis());
            if subsec_millis == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:03}s", secs, subsec_millis)
            }
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// This has millisecond resolution and may wrap around after about 49 days. Apart from the
/// wraparound, it is monotonic.
///
/// `Instant`s are obtained from an implementation of [`Timer`]. `Instant`s created from different
/// [`Timer`] instances (even when using the same implementation) are not compatible, and mixing
/// them in operations causes unspecified results. [`Duration`]s are independent of the [`Timer`]
/// implementation and thus can be mixed freely.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// The maximum time between two `Instant`s that can be handled by [`Instant::duration_since`].
    ///
    /// This is defined to be a few minutes, sufficient for every deadline the stack arms (60 s
    /// link establishment being the longest).
    pub const MAX_TIME_BETWEEN: Duration = Duration(1_000 * 60 * 10); // 10 minutes

    /// Creates an `Instant` from raw milliseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub fn from_raw_millis(millis: u32) -> Self {
        Instant(millis)
    }

    /// Returns the raw value from which this `Instant` was created.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub fn raw_millis(&self) -> u32 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// The maximum duration that can be calculated by this method is defined as
    /// [`Instant::MAX_TIME_BETWEEN`]. Calling this method when the `Instant`s are further apart is
    /// an error and may panic. This is done as a safeguard, since `Instant`s can wrap around,
    /// which can cause the result of this function to be incorrect. It does not prevent that from
    /// happening, but makes unexpected durations show up much earlier.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let millis_passed = self.0.wrapping_sub(earlier.0);
        debug_assert!(
            millis_passed <= Self::MAX_TIME_BETWEEN.0,
            "{}ms between instants {} and {}",
            millis_passed,
            earlier,
            self
        );

        Duration(millis_passed)
    }

    /// Returns whether `self` lies at or before `other` on the timeline.
    ///
    /// Uses wrapping arithmetic, so the two `Instant`s must be less than half the wraparound
    /// period apart (which any pair of live deadlines is).
    pub fn is_at_or_before(&self, other: Instant) -> bool {
        other.0.wrapping_sub(self.0) < u32::max_value() / 2
    }

    /// Returns the earlier of two optional deadlines.
    pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a.is_at_or_before(b) { a } else { b }),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_millis()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving the [`Instant`] backwards in time.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_millis()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000 {
            let (secs, subsec_millis) = (self.0 / 1_000, self.0 % 1_000);
            if subsec_millis == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:03}s", secs, subsec_millis)
            }
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The hardware interface has to provide an implementation of `Timer` to the stack. The
/// implementation must have millisecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing.
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_ordering() {
        let base = Instant::from_raw_millis(1_000);
        assert!(base.is_at_or_before(base));
        assert!(base.is_at_or_before(base + Duration::from_millis(1)));
        assert!(!(base + Duration::from_millis(1)).is_at_or_before(base));

        // Ordering survives the wraparound.
        let near_wrap = Instant::from_raw_millis(u32::max_value() - 5);
        let after_wrap = near_wrap + Duration::from_millis(10);
        assert!(near_wrap.is_at_or_before(after_wrap));
        assert_eq!(after_wrap.duration_since(near_wrap), Duration::from_millis(10));
    }

    #[test]
    fn earliest_deadline() {
        let a = Instant::from_raw_millis(100);
        let b = Instant::from_raw_millis(200);
        assert_eq!(Instant::earliest(Some(a), Some(b)), Some(a));
        assert_eq!(Instant::earliest(Some(b), Some(a)), Some(a));
        assert_eq!(Instant::earliest(None, Some(b)), Some(b));
        assert_eq!(Instant::earliest(None, None), None);
    }
}
