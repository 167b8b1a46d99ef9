use std::collections::LinkedList;

use bytes::Bytes;

use crate::seq::{Seq, SeqRange};

/// The sender's view of the byte stream. Holds the SYN, payload data, and FIN
/// as sequence-numbered segments; bytes stay in the queue until they are
/// cumulatively acknowledged.
#[derive(Debug)]
pub(crate) struct SendQueue {
    segments: LinkedList<Segment>,
    // inclusive; the oldest unacknowledged sequence number
    start_seq: Seq,
    // exclusive
    end_seq: Seq,
    fin_added: bool,
}

impl SendQueue {
    pub fn new(initial_seq: Seq) -> Self {
        let mut queue = Self {
            segments: LinkedList::new(),
            start_seq: initial_seq,
            end_seq: initial_seq,
            fin_added: false,
        };

        queue.add_segment(Segment::Syn);

        queue
    }

    pub fn add_fin(&mut self) {
        self.add_segment(Segment::Fin);
    }

    pub fn add_data(&mut self, data: Bytes) {
        self.add_segment(Segment::Data(data));
    }

    fn add_segment(&mut self, seg: Segment) {
        assert!(!self.fin_added);

        if matches!(seg, Segment::Fin) {
            self.fin_added = true;
        }

        if seg.len() == 0 {
            return;
        }

        self.end_seq += seg.len();
        self.segments.push_back(seg);
    }

    pub fn start_seq(&self) -> Seq {
        self.start_seq
    }

    pub fn next_seq(&self) -> Seq {
        self.end_seq
    }

    pub fn fin_added(&self) -> bool {
        self.fin_added
    }

    pub fn contains(&self, seq: Seq) -> bool {
        SeqRange::new(self.start_seq, self.end_seq).contains(seq)
    }

    pub fn len(&self) -> u32 {
        self.end_seq - self.start_seq
    }

    /// Drop acknowledged bytes from the front of the queue.
    pub fn advance_start(&mut self, new_start: Seq) {
        assert!(self.contains(new_start) || new_start == self.end_seq);

        while self.start_seq != new_start {
            // this shouldn't panic due to the assertion above
            let front = self.segments.front_mut().unwrap();

            let advance_by = new_start - self.start_seq;

            // if the whole segment was acknowledged
            if front.len() <= advance_by {
                self.start_seq += front.len();
                self.segments.pop_front();
                continue;
            }

            let Segment::Data(data) = front else {
                unreachable!();
            };

            let advance_by_usize: usize = advance_by.try_into().unwrap();
            *data = data.slice(advance_by_usize..);

            assert!(!data.is_empty());

            self.start_seq = new_start;
        }
    }

    /// Copy out the bytes in `[start, start + len)`. The range must be data
    /// bytes only (no SYN/FIN) and must be contained in the queue.
    pub fn get_data(&self, start: Seq, len: u32) -> Bytes {
        assert!(len > 0);
        assert!(self.contains(start));

        let mut seq_cursor = self.start_seq;
        for seg in &self.segments {
            let range = SeqRange::new(seq_cursor, seq_cursor + seg.len());

            if range.contains(start) {
                let Segment::Data(data) = seg else {
                    panic!("Requested data bytes from a {seg:?} segment");
                };

                let offset: usize = (start - range.start).try_into().unwrap();
                let avail = data.len() - offset;
                let take = std::cmp::min(avail, len.try_into().unwrap());
                return data.slice(offset..offset + take);
            }

            seq_cursor = range.end;
        }

        unreachable!();
    }

    /// The kind of byte at the given sequence number.
    pub fn kind_at(&self, seq: Seq) -> Option<SegmentKind> {
        if !self.contains(seq) {
            return None;
        }

        let mut seq_cursor = self.start_seq;
        for seg in &self.segments {
            let range = SeqRange::new(seq_cursor, seq_cursor + seg.len());
            if range.contains(seq) {
                return Some(match seg {
                    Segment::Syn => SegmentKind::Syn,
                    Segment::Fin => SegmentKind::Fin,
                    Segment::Data(_) => SegmentKind::Data,
                });
            }
            seq_cursor = range.end;
        }

        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Syn,
    Data,
    Fin,
}

#[derive(Debug)]
enum Segment {
    Data(Bytes),
    Syn,
    Fin,
}

impl Segment {
    pub fn len(&self) -> u32 {
        match self {
            Segment::Syn | Segment::Fin => 1,
            Segment::Data(data) => data.len().try_into().unwrap(),
        }
    }
}

/// The receiver's reassembly state: an ordered buffer of bytes ready for the
/// application, plus a set of out-of-order segments waiting for the gaps
/// before them to fill.
#[derive(Debug)]
pub(crate) struct RecvQueue {
    ordered: LinkedList<Bytes>,
    // inclusive; the next byte the application will read
    start_seq: Seq,
    // exclusive; `rcv_nxt`, the next in-order sequence number expected
    end_seq: Seq,
    // out-of-order segments; small in practice, so linear scans are fine
    reassembly: Vec<(Seq, Bytes)>,
}

// distances at least this far "ahead" are interpreted as behind (serial
// number arithmetic)
const SEQ_HALF: u32 = 1 << 31;

impl RecvQueue {
    pub fn new(initial_seq: Seq) -> Self {
        Self {
            ordered: LinkedList::new(),
            start_seq: initial_seq,
            end_seq: initial_seq,
            reassembly: Vec::new(),
        }
    }

    /// Number of contiguous bytes available to the application.
    pub fn len(&self) -> u32 {
        self.end_seq - self.start_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next in-order sequence number expected from the peer.
    pub fn next_seq(&self) -> Seq {
        self.end_seq
    }

    /// The out-of-order ranges currently buffered, most recently received
    /// first. Used for generating selective acknowledgements.
    pub fn reassembly_ranges(&self) -> impl Iterator<Item = SeqRange> + '_ {
        self.reassembly
            .iter()
            .rev()
            .map(|(seq, data)| SeqRange::new(*seq, *seq + data.len() as u32))
    }

    /// Returns the number of bytes buffered out-of-order.
    pub fn reassembly_len(&self) -> u32 {
        self.reassembly.iter().map(|(_, x)| x.len() as u32).sum()
    }

    /// Add a segment received with the given sequence number. Returns the
    /// number of new bytes that became available in-order (0 if the segment
    /// was buffered out-of-order or was entirely duplicate).
    pub fn add(&mut self, seq: Seq, data: Bytes) -> u32 {
        if data.is_empty() {
            return 0;
        }

        let len: u32 = data.len().try_into().unwrap();
        let ahead = seq - self.end_seq;

        // trim bytes we've already received in-order
        let (seq, data) = if ahead >= SEQ_HALF {
            let behind = self.end_seq - seq;
            if behind >= len {
                // entirely duplicate
                return 0;
            }
            (self.end_seq, data.slice(TryInto::<usize>::try_into(behind).unwrap()..))
        } else {
            (seq, data)
        };

        if seq == self.end_seq {
            // in-order: append, then migrate any adjacent reassembly data
            let added = self.append_ordered(data);
            added + self.drain_reassembly()
        } else {
            // out-of-order: hold in the gap set
            self.reassembly.push((seq, data));
            0
        }
    }

    fn append_ordered(&mut self, data: Bytes) -> u32 {
        let len: u32 = data.len().try_into().unwrap();
        self.end_seq += len;
        self.ordered.push_back(data);
        len
    }

    /// Migrate reassembly segments that are now adjacent to the ordered
    /// buffer, trimming any overlap. Returns the number of bytes migrated.
    fn drain_reassembly(&mut self) -> u32 {
        let mut migrated = 0;

        loop {
            let mut progressed = false;
            let mut i = 0;

            while i < self.reassembly.len() {
                let (seg_seq, ref data) = self.reassembly[i];
                let len: u32 = data.len().try_into().unwrap();
                // wrapping distance from the segment's start back to end_seq
                let into = self.end_seq - seg_seq;

                if into < SEQ_HALF && into < len {
                    // segment begins at or before end_seq and extends past it
                    let (seg_seq, data) = self.reassembly.remove(i);
                    let skip: usize = (self.end_seq - seg_seq).try_into().unwrap();
                    migrated += self.append_ordered(data.slice(skip..));
                    progressed = true;
                    // end_seq moved; restart the scan
                    i = 0;
                } else if into < SEQ_HALF {
                    // entirely duplicate of already-ordered data
                    self.reassembly.remove(i);
                } else {
                    i += 1;
                }
            }

            if !progressed {
                break;
            }
        }

        migrated
    }

    /// Pop up to `len` contiguous bytes as a single chunk.
    pub fn pop(&mut self, len: u32) -> Option<(Seq, Bytes)> {
        let seq = self.start_seq;

        let chunk_len: u32 = self.ordered.front()?.len().try_into().unwrap();

        let segment = if len < chunk_len {
            // want fewer bytes than the next chunk, so split the chunk
            let mut front = self.ordered.pop_front().unwrap();
            let rest = front.split_off(len.try_into().unwrap());
            self.ordered.push_front(rest);
            front
        } else {
            self.ordered.pop_front().unwrap()
        };

        // only return an empty chunk if len was 0
        assert!(!segment.is_empty() || len == 0);

        let advance_by: u32 = segment.len().try_into().unwrap();
        self.start_seq += advance_by;

        Some((seq, segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(x: u32) -> Seq {
        Seq::new(x)
    }

    #[test]
    fn test_send_queue_syn_and_data() {
        let mut queue = SendQueue::new(seq(100));
        // the SYN occupies one sequence number
        assert_eq!(queue.next_seq(), seq(101));

        queue.add_data(Bytes::from_static(b"hello"));
        assert_eq!(queue.next_seq(), seq(106));
        assert_eq!(queue.len(), 6);

        assert_eq!(queue.kind_at(seq(100)), Some(SegmentKind::Syn));
        assert_eq!(queue.kind_at(seq(101)), Some(SegmentKind::Data));

        // ack the SYN
        queue.advance_start(seq(101));
        assert_eq!(queue.len(), 5);
        assert_eq!(&queue.get_data(seq(101), 5)[..], b"hello");
        assert_eq!(&queue.get_data(seq(103), 2)[..], b"ll");

        // partial ack mid-segment
        queue.advance_start(seq(103));
        assert_eq!(&queue.get_data(seq(103), 3)[..], b"llo");

        queue.add_fin();
        assert_eq!(queue.kind_at(seq(106)), Some(SegmentKind::Fin));
    }

    #[test]
    fn test_recv_queue_in_order() {
        let mut queue = RecvQueue::new(seq(500));

        assert_eq!(queue.add(seq(500), Bytes::from_static(b"abc")), 3);
        assert_eq!(queue.next_seq(), seq(503));
        assert_eq!(queue.len(), 3);

        let (popped_seq, data) = queue.pop(2).unwrap();
        assert_eq!(popped_seq, seq(500));
        assert_eq!(&data[..], b"ab");

        let (popped_seq, data) = queue.pop(10).unwrap();
        assert_eq!(popped_seq, seq(502));
        assert_eq!(&data[..], b"c");

        assert!(queue.pop(10).is_none());
    }

    #[test]
    fn test_recv_queue_gap_fill() {
        let mut queue = RecvQueue::new(seq(0));

        // "def" arrives before "abc"
        assert_eq!(queue.add(seq(3), Bytes::from_static(b"def")), 0);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.reassembly_len(), 3);

        let ranges: Vec<_> = queue.reassembly_ranges().collect();
        assert_eq!(ranges, vec![SeqRange::new(seq(3), seq(6))]);

        // gap fills; both segments become readable
        assert_eq!(queue.add(seq(0), Bytes::from_static(b"abc")), 6);
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.reassembly_len(), 0);

        let (_, a) = queue.pop(6).unwrap();
        let (_, b) = queue.pop(6).unwrap();
        assert_eq!([&a[..], &b[..]].concat(), b"abcdef");
    }

    #[test]
    fn test_recv_queue_duplicate() {
        let mut queue = RecvQueue::new(seq(0));

        assert_eq!(queue.add(seq(0), Bytes::from_static(b"abc")), 3);
        // full duplicate
        assert_eq!(queue.add(seq(0), Bytes::from_static(b"abc")), 0);
        // partial duplicate: only "d" is new
        assert_eq!(queue.add(seq(2), Bytes::from_static(b"cd")), 1);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_recv_queue_wrapping() {
        let start = u32::MAX - 1;
        let mut queue = RecvQueue::new(seq(start));

        assert_eq!(queue.add(seq(start), Bytes::from_static(b"abcd")), 4);
        assert_eq!(queue.next_seq(), seq(2));

        let (popped_seq, data) = queue.pop(4).unwrap();
        assert_eq!(popped_seq, seq(start));
        assert_eq!(&data[..], b"abcd");
    }
}
