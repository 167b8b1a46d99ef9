use crate::util::time::Duration;

/// Smoothed round-trip-time estimation and retransmission timeout
/// calculation, in the style of Jacobson/Karels: `srtt` and `rttvar` are
/// exponentially weighted moving averages, and `rto = srtt + 4 * rttvar`,
/// clamped between the configured minimum and maximum. Each back-to-back
/// expiration doubles the timeout (bounded by the maximum).
#[derive(Debug)]
pub(crate) struct RttEstimator<D: Duration> {
    srtt: Option<D>,
    rttvar: D,
    rto: D,
    backoff_shift: u32,
    min_rto: D,
    max_rto: D,
}

impl<D: Duration> RttEstimator<D> {
    pub fn new(initial_rto: D, min_rto: D, max_rto: D) -> Self {
        Self {
            srtt: None,
            rttvar: D::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            backoff_shift: 0,
            min_rto,
            max_rto,
        }
    }

    /// Incorporate a new round-trip-time sample. Samples must come from
    /// segments that were not retransmitted (Karn's rule); the caller is
    /// responsible for filtering those out.
    pub fn add_sample(&mut self, rtt: D) {
        match self.srtt {
            Some(srtt) => {
                // rttvar = 3/4 * rttvar + 1/4 * |srtt - rtt|
                let delta = if srtt > rtt {
                    srtt.saturating_sub(rtt)
                } else {
                    rtt.saturating_sub(srtt)
                };
                self.rttvar = self
                    .rttvar
                    .saturating_mul(3)
                    .checked_div(4)
                    .unwrap()
                    .saturating_add(delta.checked_div(4).unwrap());

                // srtt = 7/8 * srtt + 1/8 * rtt
                self.srtt = Some(
                    srtt.saturating_mul(7)
                        .checked_div(8)
                        .unwrap()
                        .saturating_add(rtt.checked_div(8).unwrap()),
                );
            }
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt.checked_div(2).unwrap();
            }
        }

        let srtt = self.srtt.unwrap();
        self.rto = srtt
            .saturating_add(self.rttvar.saturating_mul(4))
            .clamp(self.min_rto, self.max_rto);

        // a valid sample ends any backoff
        self.backoff_shift = 0;
    }

    /// The current retransmission timeout, including any backoff.
    pub fn rto(&self) -> D {
        self.rto
            .saturating_mul(1u32 << self.backoff_shift.min(16))
            .clamp(self.min_rto, self.max_rto)
    }

    pub fn srtt(&self) -> Option<D> {
        self.srtt
    }

    /// Double the timeout after an expiration (capped by the maximum).
    pub fn backoff(&mut self) {
        self.backoff_shift = self.backoff_shift.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type D = std::time::Duration;

    fn estimator() -> RttEstimator<D> {
        RttEstimator::new(D::from_secs(1), D::from_millis(200), D::from_secs(60))
    }

    #[test]
    fn test_first_sample() {
        let mut est = estimator();
        assert_eq!(est.rto(), D::from_secs(1));

        est.add_sample(D::from_millis(100));
        // srtt = 100ms, rttvar = 50ms, rto = 100 + 4*50 = 300ms
        assert_eq!(est.srtt(), Some(D::from_millis(100)));
        assert_eq!(est.rto(), D::from_millis(300));
    }

    #[test]
    fn test_smoothing() {
        let mut est = estimator();
        est.add_sample(D::from_millis(100));
        est.add_sample(D::from_millis(100));
        // steady samples shouldn't move srtt
        assert_eq!(est.srtt(), Some(D::from_millis(100)));
    }

    #[test]
    fn test_min_clamp() {
        let mut est = estimator();
        for _ in 0..20 {
            est.add_sample(D::from_millis(1));
        }
        assert_eq!(est.rto(), D::from_millis(200));
    }

    #[test]
    fn test_backoff() {
        let mut est = estimator();
        est.add_sample(D::from_millis(100));
        let base = est.rto();

        est.backoff();
        assert_eq!(est.rto(), base * 2);
        est.backoff();
        assert_eq!(est.rto(), base * 4);

        // capped at the maximum
        for _ in 0..20 {
            est.backoff();
        }
        assert_eq!(est.rto(), D::from_secs(60));

        // a new sample resets the backoff
        est.add_sample(D::from_millis(100));
        assert_eq!(est.rto(), base);
    }
}
