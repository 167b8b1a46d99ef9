//! Time-related traits. The TCP state is generic over the clock so that the
//! simulator can drive it with simulated time and tests can drive it with a
//! mock clock.

use std::fmt::Debug;

/// An instant in time, analogous to `std::time::Instant`.
pub trait Instant: Copy + Clone + Debug + Eq + PartialEq + Ord + PartialOrd + Sized {
    type Duration: Duration;

    fn duration_since(&self, earlier: Self) -> Self::Duration;
    fn saturating_duration_since(&self, earlier: Self) -> Self::Duration;
    fn checked_duration_since(&self, earlier: Self) -> Option<Self::Duration>;
    fn checked_add(&self, duration: Self::Duration) -> Option<Self>;
    fn checked_sub(&self, duration: Self::Duration) -> Option<Self>;
}

/// A time span, analogous to `std::time::Duration`.
pub trait Duration: Copy + Clone + Debug + Eq + PartialEq + Ord + PartialOrd + Sized {
    const MAX: Self;
    const NANOSECOND: Self;
    const MICROSECOND: Self;
    const MILLISECOND: Self;
    const SECOND: Self;
    const ZERO: Self;

    fn as_micros(&self) -> u128;
    fn as_millis(&self) -> u128;
    fn as_nanos(&self) -> u128;
    fn as_secs(&self) -> u64;
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn checked_sub(self, rhs: Self) -> Option<Self>;
    fn checked_div(self, rhs: u32) -> Option<Self>;
    fn checked_mul(self, rhs: u32) -> Option<Self>;
    fn from_micros(micros: u64) -> Self;
    fn from_millis(millis: u64) -> Self;
    fn from_nanos(nanos: u64) -> Self;
    fn from_secs(secs: u64) -> Self;
    fn is_zero(&self) -> bool;
    fn saturating_add(self, rhs: Self) -> Self;
    fn saturating_mul(self, rhs: u32) -> Self;
    fn saturating_sub(self, rhs: Self) -> Self;
}

impl Instant for std::time::Instant {
    type Duration = std::time::Duration;

    fn duration_since(&self, earlier: Self) -> Self::Duration {
        std::time::Instant::duration_since(self, earlier)
    }

    fn saturating_duration_since(&self, earlier: Self) -> Self::Duration {
        std::time::Instant::saturating_duration_since(self, earlier)
    }

    fn checked_duration_since(&self, earlier: Self) -> Option<Self::Duration> {
        std::time::Instant::checked_duration_since(self, earlier)
    }

    fn checked_add(&self, duration: Self::Duration) -> Option<Self> {
        std::time::Instant::checked_add(self, duration)
    }

    fn checked_sub(&self, duration: Self::Duration) -> Option<Self> {
        std::time::Instant::checked_sub(self, duration)
    }
}

impl Duration for std::time::Duration {
    const MAX: Self = std::time::Duration::MAX;
    const NANOSECOND: Self = std::time::Duration::from_nanos(1);
    const MICROSECOND: Self = std::time::Duration::from_micros(1);
    const MILLISECOND: Self = std::time::Duration::from_millis(1);
    const SECOND: Self = std::time::Duration::from_secs(1);
    const ZERO: Self = std::time::Duration::ZERO;

    fn as_micros(&self) -> u128 {
        std::time::Duration::as_micros(self)
    }

    fn as_millis(&self) -> u128 {
        std::time::Duration::as_millis(self)
    }

    fn as_nanos(&self) -> u128 {
        std::time::Duration::as_nanos(self)
    }

    fn as_secs(&self) -> u64 {
        std::time::Duration::as_secs(self)
    }

    fn checked_add(self, rhs: Self) -> Option<Self> {
        std::time::Duration::checked_add(self, rhs)
    }

    fn checked_sub(self, rhs: Self) -> Option<Self> {
        std::time::Duration::checked_sub(self, rhs)
    }

    fn checked_div(self, rhs: u32) -> Option<Self> {
        std::time::Duration::checked_div(self, rhs)
    }

    fn checked_mul(self, rhs: u32) -> Option<Self> {
        std::time::Duration::checked_mul(self, rhs)
    }

    fn from_micros(micros: u64) -> Self {
        std::time::Duration::from_micros(micros)
    }

    fn from_millis(millis: u64) -> Self {
        std::time::Duration::from_millis(millis)
    }

    fn from_nanos(nanos: u64) -> Self {
        std::time::Duration::from_nanos(nanos)
    }

    fn from_secs(secs: u64) -> Self {
        std::time::Duration::from_secs(secs)
    }

    fn is_zero(&self) -> bool {
        std::time::Duration::is_zero(self)
    }

    fn saturating_add(self, rhs: Self) -> Self {
        std::time::Duration::saturating_add(self, rhs)
    }

    fn saturating_mul(self, rhs: u32) -> Self {
        std::time::Duration::saturating_mul(self, rhs)
    }

    fn saturating_sub(self, rhs: Self) -> Self {
        std::time::Duration::saturating_sub(self, rhs)
    }
}
