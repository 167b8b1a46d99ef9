/*!
Values for working with a simulated duration. Use [`EmulatedTime`] to
represent an instant in time.

[`EmulatedTime`]: crate::emulated_time::EmulatedTime
*/

use std::time::Duration;

/// A simulated duration: a nonnegative number of nanoseconds. Ordering is
/// total. A distinguished invalid sentinel exists at the representation level
/// ([`SIMTIME_INVALID`]) and is excluded from the valid range.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SimulationTime(CSimulationTime);

/// The raw representation of a simulated duration, in nanoseconds.
pub type CSimulationTime = u64;

/// An invalid duration.
pub const SIMTIME_INVALID: CSimulationTime = u64::MAX;
/// Maximum valid duration.
pub const SIMTIME_MAX: CSimulationTime = u64::MAX - 1;
pub const SIMTIME_MIN: CSimulationTime = 0;

pub const SIMTIME_ONE_SECOND: CSimulationTime = 1_000_000_000;
pub const SIMTIME_ONE_MILLISECOND: CSimulationTime = 1_000_000;
pub const SIMTIME_ONE_MICROSECOND: CSimulationTime = 1_000;
pub const SIMTIME_ONE_NANOSECOND: CSimulationTime = 1;

impl SimulationTime {
    pub const MAX: SimulationTime = SimulationTime(SIMTIME_MAX);
    pub const ZERO: SimulationTime = SimulationTime(0);
    pub const SECOND: SimulationTime = SimulationTime(SIMTIME_ONE_SECOND);
    pub const MILLISECOND: SimulationTime = SimulationTime(SIMTIME_ONE_MILLISECOND);
    pub const MICROSECOND: SimulationTime = SimulationTime(SIMTIME_ONE_MICROSECOND);
    pub const NANOSECOND: SimulationTime = SimulationTime(SIMTIME_ONE_NANOSECOND);

    pub const fn from_c_simtime(val: CSimulationTime) -> Option<Self> {
        if val == SIMTIME_INVALID || val > SIMTIME_MAX {
            return None;
        }

        Some(Self(val))
    }

    pub const fn to_c_simtime(val: Option<Self>) -> CSimulationTime {
        match val {
            Some(v) => v.0,
            None => SIMTIME_INVALID,
        }
    }

    /// Convert a [`Duration`] to a [`SimulationTime`]. Panics if the duration
    /// is too large.
    pub const fn from_duration(val: Duration) -> Self {
        let val = val.as_nanos();
        if val > SIMTIME_MAX as u128 {
            panic!("Duration is larger than SIMTIME_MAX");
        }

        Self(val as u64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / SIMTIME_ONE_SECOND
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / SIMTIME_ONE_MILLISECOND
    }

    pub fn as_micros(&self) -> u64 {
        self.0 / SIMTIME_ONE_MICROSECOND
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.into()
    }

    pub fn as_nanos_f64(&self) -> f64 {
        self.0 as f64
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(sum) => SimulationTime::from_c_simtime(sum),
            None => None,
        }
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(difference) => SimulationTime::from_c_simtime(difference),
            None => None,
        }
    }

    pub fn checked_mul(self, other: u64) -> Option<Self> {
        match self.0.checked_mul(other) {
            Some(product) => SimulationTime::from_c_simtime(product),
            None => None,
        }
    }

    pub fn checked_div(self, other: u64) -> Option<Self> {
        match self.0.checked_div(other) {
            Some(quotient) => SimulationTime::from_c_simtime(quotient),
            None => None,
        }
    }

    pub fn checked_rem(self, other: Self) -> Option<Self> {
        match self.0.checked_rem(other.0) {
            Some(rem) => SimulationTime::from_c_simtime(rem),
            None => None,
        }
    }

    pub fn saturating_add(self, other: Self) -> Self {
        let sum = self.0.checked_add(other.0).unwrap_or(SIMTIME_MAX);
        SimulationTime::from_c_simtime(sum.min(SIMTIME_MAX)).unwrap()
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        let difference = self.0.checked_sub(other.0).unwrap_or(SIMTIME_MIN);
        SimulationTime::from_c_simtime(difference).unwrap()
    }

    pub fn saturating_mul(self, other: u64) -> Self {
        let product = self.0.checked_mul(other).unwrap_or(SIMTIME_MAX);
        SimulationTime::from_c_simtime(product.min(SIMTIME_MAX)).unwrap()
    }

    pub fn try_from_secs(s: u64) -> Option<Self> {
        Self::SECOND.checked_mul(s)
    }

    pub fn from_secs(s: u64) -> Self {
        Self::try_from_secs(s).unwrap()
    }

    pub fn try_from_millis(s: u64) -> Option<Self> {
        Self::MILLISECOND.checked_mul(s)
    }

    pub fn from_millis(s: u64) -> Self {
        Self::try_from_millis(s).unwrap()
    }

    pub fn try_from_micros(s: u64) -> Option<Self> {
        Self::MICROSECOND.checked_mul(s)
    }

    pub fn from_micros(s: u64) -> Self {
        Self::try_from_micros(s).unwrap()
    }

    pub fn try_from_nanos(s: u64) -> Option<Self> {
        Self::NANOSECOND.checked_mul(s)
    }

    pub fn from_nanos(s: u64) -> Self {
        Self::try_from_nanos(s).unwrap()
    }

    pub fn subsec_millis(&self) -> u32 {
        (self.as_millis() % 1_000).try_into().unwrap()
    }

    pub fn subsec_micros(&self) -> u32 {
        (self.as_micros() % 1_000_000).try_into().unwrap()
    }

    pub fn subsec_nanos(&self) -> u32 {
        (self.0 % 1_000_000_000).try_into().unwrap()
    }
}

impl std::ops::Add<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn add(self, other: Self) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for SimulationTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn sub(self, other: Self) -> Self::Output {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::SubAssign<SimulationTime> for SimulationTime {
    fn sub_assign(&mut self, rhs: SimulationTime) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<u32> for SimulationTime {
    type Output = SimulationTime;

    fn mul(self, other: u32) -> Self::Output {
        self.checked_mul(other.into()).unwrap()
    }
}

impl std::ops::Div<u32> for SimulationTime {
    type Output = SimulationTime;

    fn div(self, other: u32) -> Self::Output {
        self.checked_div(other.into()).unwrap()
    }
}

impl std::ops::Rem<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn rem(self, other: SimulationTime) -> Self::Output {
        self.checked_rem(other).unwrap()
    }
}

impl std::convert::TryFrom<Duration> for SimulationTime {
    type Error = ();

    fn try_from(val: Duration) -> Result<Self, Self::Error> {
        let val = val.as_nanos();
        if val > SIMTIME_MAX.into() {
            Err(())
        } else {
            Ok(Self(val.try_into().unwrap()))
        }
    }
}

impl std::convert::From<SimulationTime> for Duration {
    fn from(val: SimulationTime) -> Duration {
        Duration::from_nanos(val.0)
    }
}

impl std::convert::From<SimulationTime> for CSimulationTime {
    fn from(val: SimulationTime) -> CSimulationTime {
        val.0
    }
}

impl std::convert::TryFrom<libc::timespec> for SimulationTime {
    type Error = ();

    fn try_from(value: libc::timespec) -> Result<Self, Self::Error> {
        if value.tv_sec < 0 || value.tv_nsec < 0 || value.tv_nsec > 999_999_999 {
            return Err(());
        }
        let secs = Duration::from_secs(value.tv_sec.try_into().unwrap());
        let nanos = Duration::from_nanos(value.tv_nsec.try_into().unwrap());
        Self::try_from(secs + nanos)
    }
}

impl std::convert::TryFrom<SimulationTime> for libc::timespec {
    type Error = ();

    fn try_from(value: SimulationTime) -> Result<Self, Self::Error> {
        let value = Duration::from(value);
        let tv_sec = value.as_secs().try_into().map_err(|_| ())?;
        let tv_nsec = value.subsec_nanos().try_into().map_err(|_| ())?;
        Ok(libc::timespec { tv_sec, tv_nsec })
    }
}

impl std::convert::TryFrom<libc::timeval> for SimulationTime {
    type Error = ();

    fn try_from(value: libc::timeval) -> Result<Self, Self::Error> {
        if value.tv_sec < 0 || value.tv_usec < 0 || value.tv_usec > 999_999 {
            return Err(());
        }
        let secs = Duration::from_secs(value.tv_sec.try_into().unwrap());
        let micros = Duration::from_micros(value.tv_usec.try_into().unwrap());
        Self::try_from(secs + micros)
    }
}

impl std::convert::TryFrom<SimulationTime> for libc::timeval {
    type Error = ();

    fn try_from(value: SimulationTime) -> Result<Self, Self::Error> {
        let value = Duration::from(value);
        let tv_sec = value.as_secs().try_into().map_err(|_| ())?;
        let tv_usec = value.subsec_micros().try_into().map_err(|_| ())?;
        Ok(libc::timeval { tv_sec, tv_usec })
    }
}

impl tcp::util::time::Duration for SimulationTime {
    const MAX: Self = Self::MAX;
    const NANOSECOND: Self = Self::NANOSECOND;
    const MICROSECOND: Self = Self::MICROSECOND;
    const MILLISECOND: Self = Self::MILLISECOND;
    const SECOND: Self = Self::SECOND;
    const ZERO: Self = Self::ZERO;

    #[inline]
    fn as_micros(&self) -> u128 {
        self.as_micros().into()
    }

    #[inline]
    fn as_millis(&self) -> u128 {
        self.as_millis().into()
    }

    #[inline]
    fn as_nanos(&self) -> u128 {
        self.as_nanos()
    }

    #[inline]
    fn as_secs(&self) -> u64 {
        self.as_secs()
    }

    #[inline]
    fn checked_add(self, rhs: Self) -> Option<Self> {
        self.checked_add(rhs)
    }

    #[inline]
    fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.checked_sub(rhs)
    }

    #[inline]
    fn checked_div(self, rhs: u32) -> Option<Self> {
        self.checked_div(rhs.into())
    }

    #[inline]
    fn checked_mul(self, rhs: u32) -> Option<Self> {
        self.checked_mul(rhs.into())
    }

    #[inline]
    fn from_micros(micros: u64) -> Self {
        Self::from_micros(micros)
    }

    #[inline]
    fn from_millis(millis: u64) -> Self {
        Self::from_millis(millis)
    }

    #[inline]
    fn from_nanos(nanos: u64) -> Self {
        Self::from_nanos(nanos)
    }

    #[inline]
    fn from_secs(secs: u64) -> Self {
        Self::from_secs(secs)
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.is_zero()
    }

    #[inline]
    fn saturating_add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }

    #[inline]
    fn saturating_mul(self, rhs: u32) -> Self {
        self.saturating_mul(rhs.into())
    }

    #[inline]
    fn saturating_sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time() {
        let sim_time = 5 * SIMTIME_ONE_MINUTE_TEST + 7 * SIMTIME_ONE_MILLISECOND;
        let rust_time = SimulationTime::from_c_simtime(sim_time).unwrap();

        assert_eq!(rust_time.as_secs(), 5 * 60);
        assert_eq!(rust_time.as_millis(), 5 * 60 * 1_000 + 7);
    }

    const SIMTIME_ONE_MINUTE_TEST: CSimulationTime = 60 * SIMTIME_ONE_SECOND;

    #[test]
    fn test_invalid_sentinel() {
        assert_eq!(SimulationTime::from_c_simtime(SIMTIME_INVALID), None);
        assert_eq!(
            SimulationTime::to_c_simtime(None),
            SIMTIME_INVALID
        );
    }

    #[test]
    fn test_from_timespec() {
        let ts = libc::timespec {
            tv_sec: 3,
            tv_nsec: 500,
        };
        assert_eq!(
            SimulationTime::try_from(ts).unwrap(),
            SimulationTime::from_secs(3) + SimulationTime::from_nanos(500)
        );

        let bad = libc::timespec {
            tv_sec: -1,
            tv_nsec: 0,
        };
        assert!(SimulationTime::try_from(bad).is_err());

        let bad = libc::timespec {
            tv_sec: 0,
            tv_nsec: 1_000_000_000,
        };
        assert!(SimulationTime::try_from(bad).is_err());
    }

    #[test]
    fn test_to_timespec() {
        let t = SimulationTime::from_millis(1500);
        let ts = libc::timespec::try_from(t).unwrap();
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_saturating() {
        assert_eq!(
            SimulationTime::MAX.saturating_add(SimulationTime::SECOND),
            SimulationTime::MAX
        );
        assert_eq!(
            SimulationTime::ZERO.saturating_sub(SimulationTime::SECOND),
            SimulationTime::ZERO
        );
    }
}
