//! Congestion control. The controller owns the congestion window and the
//! slow-start threshold; the connection reports acknowledgements, duplicate
//! acknowledgements, and timeouts, and asks how much data may be outstanding.
//!
//! The variants are a tagged enum with a common operation set rather than a
//! trait object, so the connection stays `Debug` and freely movable.

use crate::util::time::{Duration, Instant};

/// Which congestion-control algorithm a connection should use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    /// AIMD with fast retransmit and fast recovery.
    #[default]
    Reno,
    /// Cubic window growth.
    Cubic,
}

/// Acks seen for the same left edge before loss is inferred.
pub(crate) const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub(crate) enum Congestion<I: Instant> {
    Reno(Reno),
    Cubic(Cubic<I>),
}

impl<I: Instant> Congestion<I> {
    pub fn new(algorithm: CongestionAlgorithm, mss: u32) -> Self {
        match algorithm {
            CongestionAlgorithm::Reno => Self::Reno(Reno::new(mss)),
            CongestionAlgorithm::Cubic => Self::Cubic(Cubic::new(mss)),
        }
    }

    /// The congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        match self {
            Self::Reno(x) => x.cwnd,
            Self::Cubic(x) => x.cwnd,
        }
    }

    pub fn ssthresh(&self) -> u32 {
        match self {
            Self::Reno(x) => x.ssthresh,
            Self::Cubic(x) => x.ssthresh,
        }
    }

    pub fn in_recovery(&self) -> bool {
        match self {
            Self::Reno(x) => x.in_recovery,
            Self::Cubic(x) => x.in_recovery,
        }
    }

    /// A cumulative acknowledgement advanced the window by `acked` bytes
    /// while `flight` bytes remain outstanding.
    pub fn on_ack(&mut self, acked: u32, flight: u32, now: I) {
        match self {
            Self::Reno(x) => x.on_ack(acked, flight),
            Self::Cubic(x) => x.on_ack(acked, flight, now),
        }
    }

    /// Loss was inferred from duplicate acknowledgements (or SACK); enter
    /// fast retransmit/recovery.
    pub fn on_loss_detected(&mut self, flight: u32, now: I) {
        match self {
            Self::Reno(x) => x.on_loss_detected(flight),
            Self::Cubic(x) => x.on_loss_detected(flight, now),
        }
    }

    /// The retransmission timer expired.
    pub fn on_retransmission_timeout(&mut self, flight: u32) {
        match self {
            Self::Reno(x) => x.on_retransmission_timeout(flight),
            Self::Cubic(x) => x.on_retransmission_timeout(flight),
        }
    }
}

/// Classic AIMD: exponential growth to `ssthresh`, then one segment per
/// round trip; on inferred loss, halve and enter recovery; on timeout, back
/// to one segment.
#[derive(Debug)]
pub(crate) struct Reno {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    in_recovery: bool,
    /// Accumulates acked bytes during congestion avoidance.
    avoidance_acc: u32,
}

const INITIAL_WINDOW_SEGMENTS: u32 = 10;

impl Reno {
    fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: INITIAL_WINDOW_SEGMENTS * mss,
            ssthresh: u32::MAX,
            in_recovery: false,
            avoidance_acc: 0,
        }
    }

    fn on_ack(&mut self, acked: u32, flight: u32) {
        if self.in_recovery {
            // the ack covers new data, so the hole was repaired
            self.in_recovery = false;
            self.cwnd = self.ssthresh;
            return;
        }

        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd = self.cwnd.saturating_add(acked.min(self.mss));
        } else {
            // congestion avoidance: one segment per window's worth of acks
            self.avoidance_acc = self.avoidance_acc.saturating_add(acked);
            if self.avoidance_acc >= self.cwnd {
                self.avoidance_acc -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(self.mss);
            }
        }

        let _ = flight;
    }

    fn on_loss_detected(&mut self, flight: u32) {
        if self.in_recovery {
            return;
        }

        self.in_recovery = true;
        self.ssthresh = (flight / 2).max(2 * self.mss);
        // fast recovery: deflate to the threshold plus the three segments
        // that left the network as duplicate acks
        self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD * self.mss;
        self.avoidance_acc = 0;
    }

    fn on_retransmission_timeout(&mut self, flight: u32) {
        self.ssthresh = (flight / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.in_recovery = false;
        self.avoidance_acc = 0;
    }
}

/// Cubic window growth (RFC 8312 shape): after a loss at window `w_max`, the
/// window follows `w(t) = c * (t - k)^3 + w_max`, concave up to the previous
/// maximum and convex beyond it. Falls back to slow start below `ssthresh`.
#[derive(Debug)]
pub(crate) struct Cubic<I: Instant> {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    in_recovery: bool,
    /// Window size when the last loss event occurred, in segments.
    w_max: f64,
    /// Time of the last loss event.
    epoch_start: Option<I>,
}

/// Standard constants: scaling factor and multiplicative decrease.
const CUBIC_C: f64 = 0.4;
const CUBIC_BETA: f64 = 0.7;

impl<I: Instant> Cubic<I> {
    fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: INITIAL_WINDOW_SEGMENTS * mss,
            ssthresh: u32::MAX,
            in_recovery: false,
            w_max: 0.0,
            epoch_start: None,
        }
    }

    fn on_ack(&mut self, acked: u32, flight: u32, now: I) {
        if self.in_recovery {
            self.in_recovery = false;
            self.cwnd = self.ssthresh;
            return;
        }

        if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_add(acked.min(self.mss));
            return;
        }

        let Some(epoch_start) = self.epoch_start else {
            // no loss epoch yet; grow like avoidance from the current point
            self.epoch_start = Some(now);
            self.w_max = (self.cwnd / self.mss) as f64;
            return;
        };

        // elapsed time since the loss epoch, in seconds
        let t = now.saturating_duration_since(epoch_start);
        let t = t.as_millis() as f64 / 1000.0;

        // k: time to grow back to w_max
        let k = (self.w_max * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt();
        let w_cubic = CUBIC_C * (t - k).powi(3) + self.w_max;

        let target = ((w_cubic * self.mss as f64) as u32).max(2 * self.mss);
        if target > self.cwnd {
            // approach the cubic target over the next round trip
            let increment = ((target - self.cwnd) as f64 / (self.cwnd / self.mss).max(1) as f64)
                .max(1.0) as u32;
            self.cwnd = self.cwnd.saturating_add(increment.min(self.mss));
        }

        let _ = flight;
    }

    fn on_loss_detected(&mut self, flight: u32, now: I) {
        if self.in_recovery {
            return;
        }

        self.in_recovery = true;
        self.w_max = (self.cwnd / self.mss) as f64;
        self.epoch_start = Some(now);
        self.ssthresh = ((flight as f64 * CUBIC_BETA) as u32).max(2 * self.mss);
        self.cwnd = self.ssthresh;
    }

    fn on_retransmission_timeout(&mut self, flight: u32) {
        self.w_max = (self.cwnd / self.mss) as f64;
        self.epoch_start = None;
        self.ssthresh = ((flight as f64 * CUBIC_BETA) as u32).max(2 * self.mss);
        self.cwnd = self.mss;
        self.in_recovery = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1500;

    #[test]
    fn test_reno_slow_start() {
        let mut reno = Reno::new(MSS);
        let start = reno.cwnd;

        // each full-segment ack grows the window by one segment
        reno.on_ack(MSS, 10 * MSS);
        reno.on_ack(MSS, 10 * MSS);
        assert_eq!(reno.cwnd, start + 2 * MSS);
    }

    #[test]
    fn test_reno_loss_halves() {
        let mut reno = Reno::new(MSS);
        let flight = 20 * MSS;
        reno.cwnd = flight;

        reno.on_loss_detected(flight);
        assert!(reno.in_recovery);
        assert_eq!(reno.ssthresh, flight / 2);
        assert_eq!(reno.cwnd, flight / 2 + DUP_ACK_THRESHOLD * MSS);

        // recovery ends on the next new ack
        reno.on_ack(MSS, flight / 2);
        assert!(!reno.in_recovery);
        assert_eq!(reno.cwnd, flight / 2);
    }

    #[test]
    fn test_reno_timeout_collapses() {
        let mut reno = Reno::new(MSS);
        reno.cwnd = 20 * MSS;

        reno.on_retransmission_timeout(20 * MSS);
        assert_eq!(reno.cwnd, MSS);
        assert_eq!(reno.ssthresh, 10 * MSS);
    }

    #[test]
    fn test_reno_avoidance_linear() {
        let mut reno = Reno::new(MSS);
        reno.cwnd = 10 * MSS;
        reno.ssthresh = 10 * MSS;

        // a full window of acks grows the window by exactly one segment
        for _ in 0..10 {
            reno.on_ack(MSS, 10 * MSS);
        }
        assert_eq!(reno.cwnd, 11 * MSS);
    }

    #[test]
    fn test_cubic_recovery() {
        let now = std::time::Instant::now();
        let mut cubic: Cubic<std::time::Instant> = Cubic::new(MSS);
        cubic.cwnd = 20 * MSS;
        cubic.ssthresh = 10 * MSS;

        cubic.on_loss_detected(20 * MSS, now);
        assert!(cubic.in_recovery);
        assert_eq!(cubic.cwnd, (20.0 * MSS as f64 * CUBIC_BETA) as u32);

        cubic.on_ack(MSS, 10 * MSS, now);
        assert!(!cubic.in_recovery);
    }
}
