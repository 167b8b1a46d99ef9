use crate::seq::{Seq, SeqRange};

/// The per-byte state of transmitted data, as driven by incoming cumulative
/// and selective acknowledgements. Bytes that have never been transmitted are
/// not tracked here (they are implicitly "unsent" in the send queue).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ByteState {
    /// Transmitted once and not yet acknowledged.
    InFlight,
    /// Reported received by a selective acknowledgement.
    Sacked,
    /// Presumed dropped; eligible for retransmission.
    Lost,
    /// Retransmitted and not yet acknowledged.
    Retransmitted,
}

/// A retransmit scoreboard: a partition of the transmitted-but-unacknowledged
/// sequence space `[start, end)` into maximal ranges of equal [`ByteState`].
///
/// Ranges are kept ordered and contiguous. All positions are compared by
/// their wrapping offset from `start`, so the scoreboard is correct across
/// the 32-bit wrap.
#[derive(Debug)]
pub(crate) struct Scoreboard {
    ranges: Vec<(SeqRange, ByteState)>,
    start: Seq,
}

impl Scoreboard {
    pub fn new(start: Seq) -> Self {
        Self {
            ranges: Vec::new(),
            start,
        }
    }

    /// The transmitted-but-unacknowledged length in bytes.
    pub fn len(&self) -> u32 {
        self.ranges.iter().map(|(r, _)| r.len()).sum()
    }

    /// End of the tracked space (`snd_nxt` from the scoreboard's view).
    pub fn end(&self) -> Seq {
        self.ranges
            .last()
            .map(|(r, _)| r.end)
            .unwrap_or(self.start)
    }

    /// Bytes considered in the network: transmitted minus sacked minus lost.
    pub fn pipe(&self) -> u32 {
        self.ranges
            .iter()
            .filter(|(_, s)| matches!(s, ByteState::InFlight | ByteState::Retransmitted))
            .map(|(r, _)| r.len())
            .sum()
    }

    pub fn sacked_bytes(&self) -> u32 {
        self.bytes_in(ByteState::Sacked)
    }

    fn bytes_in(&self, state: ByteState) -> u32 {
        self.ranges
            .iter()
            .filter(|(_, s)| *s == state)
            .map(|(r, _)| r.len())
            .sum()
    }

    /// Record a transmission of new data extending the tracked space.
    pub fn on_transmit(&mut self, range: SeqRange) {
        if range.is_empty() {
            return;
        }

        assert_eq!(range.start, self.end(), "transmissions must be in order");
        self.push_range(range, ByteState::InFlight);
    }

    /// Record a retransmission of already-tracked data.
    pub fn on_retransmit(&mut self, range: SeqRange) {
        self.set_state(range, ByteState::Retransmitted);
    }

    /// Advance the left edge for a cumulative acknowledgement.
    pub fn on_ack(&mut self, new_start: Seq) {
        let advance = new_start - self.start;
        if advance == 0 || advance > self.len() {
            return;
        }

        self.ranges.retain_mut(|(r, _)| {
            if (new_start - r.end) < (1 << 31) || new_start == r.end {
                // range entirely acknowledged
                false
            } else if r.contains(new_start) {
                r.start = new_start;
                true
            } else {
                true
            }
        });
        self.start = new_start;
    }

    /// Apply selective-acknowledgement ranges from an incoming ACK.
    pub fn on_sack(&mut self, sacked: &[(u32, u32)]) {
        for &(start, end) in sacked {
            let range = SeqRange::new(Seq::new(start), Seq::new(end));
            let Some(range) = range.overlap(&SeqRange::new(self.start, self.end())) else {
                continue;
            };
            self.set_state(range, ByteState::Sacked);
        }
    }

    /// Mark every non-sacked byte below `up_to` as lost. Used on entry to
    /// fast retransmit, with `up_to` the highest selectively-acked sequence.
    pub fn mark_lost_below(&mut self, up_to: Seq) {
        let limit = up_to - self.start;

        let to_mark: Vec<SeqRange> = self
            .ranges
            .iter()
            .filter(|(r, s)| {
                matches!(s, ByteState::InFlight | ByteState::Retransmitted)
                    && (r.start - self.start) < limit
            })
            .map(|(r, _)| *r)
            .collect();

        for range in to_mark {
            let end = if (range.end - self.start) <= limit {
                range.end
            } else {
                up_to
            };
            self.set_state(SeqRange::new(range.start, end), ByteState::Lost);
        }
    }

    /// A retransmission timeout: everything outstanding is presumed lost.
    pub fn on_rto(&mut self) {
        let all = SeqRange::new(self.start, self.end());
        if all.is_empty() {
            return;
        }

        let to_mark: Vec<SeqRange> = self
            .ranges
            .iter()
            .filter(|(_, s)| !matches!(s, ByteState::Sacked))
            .map(|(r, _)| *r)
            .collect();

        for range in to_mark {
            self.set_state(range, ByteState::Lost);
        }
    }

    /// The oldest range marked lost, if any. The caller retransmits it and
    /// reports the transmission with [`on_retransmit`](Self::on_retransmit).
    pub fn next_lost(&self) -> Option<SeqRange> {
        self.ranges
            .iter()
            .find(|(_, s)| *s == ByteState::Lost)
            .map(|(r, _)| *r)
    }

    /// The right edge of the highest selectively-acknowledged range.
    pub fn highest_sacked_end(&self) -> Option<Seq> {
        self.ranges
            .iter()
            .rev()
            .find(|(_, s)| *s == ByteState::Sacked)
            .map(|(r, _)| r.end)
    }

    fn push_range(&mut self, range: SeqRange, state: ByteState) {
        if let Some((last, last_state)) = self.ranges.last_mut() {
            if *last_state == state && last.end == range.start {
                last.end = range.end;
                return;
            }
        }
        self.ranges.push((range, state));
    }

    /// Overwrite the state of `range`, splitting existing ranges as needed.
    fn set_state(&mut self, range: SeqRange, state: ByteState) {
        if range.is_empty() {
            return;
        }

        let mut new_ranges: Vec<(SeqRange, ByteState)> = Vec::with_capacity(self.ranges.len() + 2);

        for (r, s) in self.ranges.drain(..) {
            match r.overlap(&range) {
                None => new_ranges.push((r, s)),
                Some(hit) => {
                    let left = SeqRange::new(r.start, hit.start);
                    let right = SeqRange::new(hit.end, r.end);
                    if !left.is_empty() {
                        new_ranges.push((left, s));
                    }
                    // sacked bytes stay sacked; the peer has them
                    let new_state = if s == ByteState::Sacked { s } else { state };
                    new_ranges.push((hit, new_state));
                    if !right.is_empty() {
                        new_ranges.push((right, s));
                    }
                }
            }
        }

        // merge adjacent ranges with equal state
        let mut merged: Vec<(SeqRange, ByteState)> = Vec::with_capacity(new_ranges.len());
        for (r, s) in new_ranges {
            if let Some((last, last_state)) = merged.last_mut() {
                if *last_state == s && last.end == r.start {
                    last.end = r.end;
                    continue;
                }
            }
            merged.push((r, s));
        }

        self.ranges = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(x: u32) -> Seq {
        Seq::new(x)
    }

    fn range(start: u32, end: u32) -> SeqRange {
        SeqRange::new(seq(start), seq(end))
    }

    #[test]
    fn test_transmit_and_ack() {
        let mut sb = Scoreboard::new(seq(0));
        sb.on_transmit(range(0, 1000));
        sb.on_transmit(range(1000, 2000));

        assert_eq!(sb.len(), 2000);
        assert_eq!(sb.pipe(), 2000);
        assert_eq!(sb.end(), seq(2000));

        sb.on_ack(seq(500));
        assert_eq!(sb.len(), 1500);
        assert_eq!(sb.pipe(), 1500);

        sb.on_ack(seq(2000));
        assert_eq!(sb.len(), 0);
        assert_eq!(sb.pipe(), 0);
    }

    #[test]
    fn test_sack_and_lost() {
        let mut sb = Scoreboard::new(seq(0));
        sb.on_transmit(range(0, 3000));

        // segments [1000, 2000) arrive out of order at the peer
        sb.on_sack(&[(1000, 2000)]);
        assert_eq!(sb.sacked_bytes(), 1000);
        assert_eq!(sb.pipe(), 2000);

        // everything below the sacked range is presumed lost
        sb.mark_lost_below(seq(2000));
        assert_eq!(sb.next_lost(), Some(range(0, 1000)));
        assert_eq!(sb.pipe(), 1000);

        // retransmit the hole
        sb.on_retransmit(range(0, 1000));
        assert_eq!(sb.next_lost(), None);
        assert_eq!(sb.pipe(), 2000);

        // cumulative ack past the hole
        sb.on_ack(seq(2000));
        assert_eq!(sb.len(), 1000);
    }

    #[test]
    fn test_rto_marks_lost() {
        let mut sb = Scoreboard::new(seq(0));
        sb.on_transmit(range(0, 2000));
        sb.on_sack(&[(500, 1000)]);

        sb.on_rto();

        // sacked bytes stay sacked, everything else is lost
        assert_eq!(sb.sacked_bytes(), 500);
        assert_eq!(sb.next_lost(), Some(range(0, 500)));
        assert_eq!(sb.pipe(), 0);
    }

    #[test]
    fn test_wrapping() {
        let start = u32::MAX - 500;
        let mut sb = Scoreboard::new(seq(start));
        sb.on_transmit(SeqRange::new(seq(start), seq(start) + 1000));

        assert_eq!(sb.len(), 1000);
        sb.on_ack(seq(start) + 600);
        assert_eq!(sb.len(), 400);
        assert_eq!(sb.end(), seq(start) + 1000);
    }
}
