//! A mock clock for driving the TCP state in tests.

use std::time::Duration;

/// A mock instant: time elapsed since an arbitrary test epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Instant {
    since_epoch: Duration,
}

impl Instant {
    pub const EPOCH: Self = Self {
        since_epoch: Duration::ZERO,
    };

    pub fn from_epoch(since_epoch: Duration) -> Self {
        Self { since_epoch }
    }
}

impl crate::util::time::Instant for Instant {
    type Duration = Duration;

    fn duration_since(&self, earlier: Self) -> Self::Duration {
        self.since_epoch - earlier.since_epoch
    }

    fn saturating_duration_since(&self, earlier: Self) -> Self::Duration {
        self.since_epoch.saturating_sub(earlier.since_epoch)
    }

    fn checked_duration_since(&self, earlier: Self) -> Option<Self::Duration> {
        self.since_epoch.checked_sub(earlier.since_epoch)
    }

    fn checked_add(&self, duration: Self::Duration) -> Option<Self> {
        Some(Self {
            since_epoch: self.since_epoch.checked_add(duration)?,
        })
    }

    fn checked_sub(&self, duration: Self::Duration) -> Option<Self> {
        Some(Self {
            since_epoch: self.since_epoch.checked_sub(duration)?,
        })
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self {
            since_epoch: self.since_epoch + rhs,
        }
    }
}
