//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::Debug,
    ops::{Add, AddAssign, Div, Mul, Sub, SubAssign},
};

/// A wrapper around [`std::time::Instant`] that does not expose panicking `duration_since`
/// operations.
///
/// Instead of subtraction, use `checked_duration_since` or `saturating_duration_since`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

impl Instant {
    pub fn now() -> Instant {
        Instant(std::time::Instant::now())
    }

    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_duration_since(earlier.0).map(Duration)
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_duration_since(earlier.0))
    }
}

impl From<std::time::Instant> for Instant {
    fn from(instant: std::time::Instant) -> Self {
        Self(instant)
    }
}

impl From<Instant> for std::time::Instant {
    fn from(instant: Instant) -> Self {
        instant.0
    }
}

impl Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// A wrapper around [`std::time::Duration`] that does not expose panicking difference
/// operations.
///
/// Only the methods of `std::time::Duration` used in this project are exposed here.
/// If you need another one, add a wrapper rather than converting to the underlying value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration::from_secs(0);
    pub const MILLISECOND: Duration = Duration::from_millis(1);
    pub const SECOND: Duration = Duration::from_secs(1);

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(std::time::Duration::from_secs(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(std::time::Duration::from_millis(millis))
    }

    pub const fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub const fn from_micros(micros: u64) -> Duration {
        Duration(std::time::Duration::from_micros(micros))
    }

    pub const fn as_micros(&self) -> u128 {
        self.0.as_micros()
    }

    pub fn from_secs_f64(secs: f64) -> Duration {
        Duration(std::time::Duration::from_secs_f64(secs))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn checked_sub(&self, rhs: Duration) -> Option<Duration> {
        self.0.checked_sub(rhs.0).map(Duration)
    }

    pub fn saturating_sub(&self, rhs: Duration) -> Duration {
        self.checked_sub(rhs).unwrap_or_default()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

impl Debug for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Self::Output {
        Duration(self.0 - rhs.0)
    }
}

impl SubAssign<Duration> for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Self::Output {
        Duration(self.0 * rhs)
    }
}

impl Mul<Duration> for u32 {
    type Output = Duration;

    fn mul(self, rhs: Duration) -> Self::Output {
        rhs * self
    }
}

impl Div<u32> for Duration {
    type Output = Duration;

    fn div(self, rhs: u32) -> Self::Output {
        Duration(self.0 / rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let now = std::time::Instant::now();
        assert_eq!(now, Instant::from(now).into());

        let duration = std::time::Duration::new(5, 10);
        assert_eq!(duration, Duration::from(duration).into());
    }

    #[test]
    fn duration_arithmetic() {
        let short = Duration::from_millis(2);
        let long = Duration::from_secs(5);
        let sum = Duration::from_millis(5002);

        assert_eq!(sum, short + long);
        assert_eq!(Some(long), sum.checked_sub(short));
        assert_eq!(None, short.checked_sub(sum));
        assert_eq!(long, sum.saturating_sub(short));
        assert_eq!(Duration::ZERO, short.saturating_sub(sum));
        assert_eq!(long, short * 2500);
        assert_eq!(short, long / 2500);
    }

    #[test]
    fn instant_arithmetic() {
        let now = Instant::now();
        let duration = Duration::from_millis(2);
        let soon = now + duration;

        assert_eq!(now, soon - duration);
        assert_eq!(Some(duration), soon.checked_duration_since(now));
        assert_eq!(None, now.checked_duration_since(soon));
        assert_eq!(duration, soon.saturating_duration_since(now));
        assert_eq!(Duration::ZERO, now.saturating_duration_since(soon));
    }
}
