//! The per-connection data path shared by the connected states: segmentation
//! and pacing on the send side, reassembly and acknowledgement generation on
//! the receive side, and the timers that drive retransmission.

use std::io::{Read, Write};
use std::net::SocketAddrV4;

use bytes::BytesMut;

use crate::buffer::{RecvQueue, SegmentKind, SendQueue};
use crate::cong::{Congestion, DUP_ACK_THRESHOLD};
use crate::rtt::RttEstimator;
use crate::scoreboard::Scoreboard;
use crate::seq::{Seq, SeqRange};
use crate::util::time::{Duration, Instant};
use crate::util::SmallArrayBackedSlice;
use crate::window_scaling::WindowScaling;
use crate::{
    Dependencies, Ipv4Header, Payload, RecvError, SendError, TcpConfig, TcpFlags, TcpHeader,
};

/// Maximum number of back-to-back retransmission timeouts before the
/// connection is declared dead.
pub(crate) const MAX_RETRANSMIT_ATTEMPTS: u32 = 15;

/// Maximum number of SYN (re)transmissions while connecting.
pub(crate) const MAX_SYN_ATTEMPTS: u32 = 6;

#[derive(Debug)]
pub(crate) struct Connection<X: Dependencies> {
    config: TcpConfig,
    local_addr: SocketAddrV4,
    remote_addr: SocketAddrV4,

    /// Our initial send sequence number (consumed by our SYN).
    iss: Seq,
    send: SendQueue,
    /// `None` until we've seen the peer's SYN.
    recv: Option<RecvQueue>,

    scoreboard: Scoreboard,
    congestion: Congestion<X::Instant>,
    rtt: RttEstimator<X::Duration>,
    window_scaling: WindowScaling,

    /// The peer's announced receive window, scaled.
    snd_wnd: u32,
    dup_ack_count: u32,

    /// Sample for RTT estimation: the cumulative ack that completes the
    /// sample, and the transmit time. Discarded on retransmission (Karn).
    rtt_sample: Option<(Seq, X::Instant)>,
    retransmit_deadline: Option<X::Instant>,
    /// Consecutive expirations without forward progress.
    retransmit_attempts: u32,

    /// An acknowledgement must be sent as soon as possible.
    ack_now: bool,
    delayed_ack_deadline: Option<X::Instant>,
    /// Segments received since the last acknowledgement we sent.
    unacked_segments: u32,

    /// Timestamp option clock (monotonic per segment) and last peer value.
    ts_clock: u32,
    last_ts_echo: Option<u32>,

    /// Sequence number of the peer's FIN, once seen.
    peer_fin_seq: Option<Seq>,
    /// The peer's FIN was received in order (all prior data arrived).
    fin_received: bool,
    our_syn_acked: bool,
    peer_syn_seen: bool,
}

impl<X: Dependencies> Connection<X> {
    pub fn new(
        config: TcpConfig,
        local_addr: SocketAddrV4,
        remote_addr: SocketAddrV4,
        iss: u32,
    ) -> Self {
        let iss = Seq::new(iss);
        let min_rto = X::Duration::from_millis(config.effective_min_rto_ms());
        let max_rto = X::Duration::from_secs(60);
        let initial_rto = X::Duration::from_secs(1).clamp(min_rto, max_rto);

        Self {
            window_scaling: WindowScaling::new(config.window_scaling_enabled),
            congestion: Congestion::new(config.congestion, config.mss),
            rtt: RttEstimator::new(initial_rto, min_rto, max_rto),
            config,
            local_addr,
            remote_addr,
            iss,
            send: SendQueue::new(iss),
            recv: None,
            scoreboard: Scoreboard::new(iss),
            snd_wnd: config.mss,
            dup_ack_count: 0,
            rtt_sample: None,
            retransmit_deadline: None,
            retransmit_attempts: 0,
            ack_now: false,
            delayed_ack_deadline: None,
            unacked_segments: 0,
            ts_clock: 0,
            last_ts_echo: None,
            peer_fin_seq: None,
            fin_received: false,
            our_syn_acked: false,
            peer_syn_seen: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote_addr
    }

    pub fn conn_id(&self) -> (SocketAddrV4, SocketAddrV4) {
        (self.local_addr, self.remote_addr)
    }

    /// Our SYN was acknowledged and the peer's SYN was seen.
    pub fn established(&self) -> bool {
        self.our_syn_acked && self.peer_syn_seen
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// All queued data including the FIN has been acknowledged.
    pub fn fin_acked(&self) -> bool {
        self.send.fin_added() && self.send.len() == 0
    }

    pub fn fin_queued(&self) -> bool {
        self.send.fin_added()
    }

    pub fn timed_out(&self) -> bool {
        self.retransmit_attempts >= MAX_RETRANSMIT_ATTEMPTS
    }

    pub fn syn_attempts_exhausted(&self) -> bool {
        !self.our_syn_acked && self.retransmit_attempts >= MAX_SYN_ATTEMPTS
    }

    pub fn recv_buffer_len(&self) -> u32 {
        self.recv.as_ref().map(|x| x.len()).unwrap_or(0)
    }

    /// Free space in the send buffer.
    pub fn send_buffer_space(&self) -> u32 {
        self.config.send_buffer_max.saturating_sub(self.send.len())
    }

    /// The receive window we announce: buffer capacity not yet consumed by
    /// ordered or out-of-order data.
    fn recv_space(&self) -> u32 {
        let used = self
            .recv
            .as_ref()
            .map(|x| x.len() + x.reassembly_len())
            .unwrap_or(0);
        self.config.recv_buffer_max.saturating_sub(used)
    }

    /// Record the peer's SYN (either a fresh SYN for a passive open or a
    /// SYN-ACK for an active open).
    pub fn on_peer_syn(&mut self, header: &TcpHeader) {
        assert!(header.flags.contains(TcpFlags::SYN));
        assert!(!self.peer_syn_seen);

        self.peer_syn_seen = true;
        self.recv = Some(RecvQueue::new(Seq::new(header.seq) + 1));
        self.window_scaling
            .negotiate(header.window_scale, self.config.recv_buffer_max);
        self.snd_wnd = self.window_scaling.apply(header.window_size, true);
        if let Some(ts) = header.timestamp {
            self.last_ts_echo = Some(ts);
        }
        // the SYN consumes a sequence number and must be acknowledged
        self.ack_now = true;
    }

    /// Process an incoming segment. Returns the number of payload bytes that
    /// became readable in order.
    pub fn push_packet(&mut self, header: &TcpHeader, payload: Payload, now: X::Instant) -> u32 {
        if header.flags.contains(TcpFlags::SYN) && !self.peer_syn_seen {
            self.on_peer_syn(header);
        }

        if let Some(ts) = header.timestamp {
            self.last_ts_echo = Some(ts);
        }

        let payload_len = payload.len();

        if header.flags.contains(TcpFlags::ACK) {
            self.process_ack(header, payload_len == 0, now);
        }

        let mut added = 0;

        if self.recv.is_some() && payload_len > 0 {
            added = self.receive_payload(header, &payload, now);
        }

        if header.flags.contains(TcpFlags::FIN) {
            let data_start = Seq::new(header.seq)
                + u32::from(header.flags.contains(TcpFlags::SYN));
            self.peer_fin_seq = Some(data_start + payload_len);
        }

        // the FIN is in order only once all data before it has arrived
        if let (Some(fin_seq), Some(recv), false) =
            (self.peer_fin_seq, self.recv.as_ref(), self.fin_received)
        {
            if recv.next_seq() == fin_seq {
                self.fin_received = true;
                self.ack_now = true;
            }
        }

        added
    }

    fn receive_payload(&mut self, header: &TcpHeader, payload: &Payload, now: X::Instant) -> u32 {
        let recv_space = self.recv_space();
        let recv = self.recv.as_mut().unwrap();

        // data starts one past the SYN if the segment carries one
        let mut cursor =
            Seq::new(header.seq) + u32::from(header.flags.contains(TcpFlags::SYN));

        // ignore data entirely beyond our announced window (a window probe's
        // single byte passes this check when the buffer empties)
        let window_right = recv.next_seq() + recv_space;
        let mut added = 0;

        for chunk in &payload.0 {
            let len: u32 = chunk.len().try_into().unwrap();
            let seg = SeqRange::new(cursor, cursor + len);
            cursor = seg.end;

            if seg.is_empty() {
                continue;
            }

            // trim to the window
            let allowed = SeqRange::new(recv.next_seq() - recv.len(), window_right);
            let Some(fit) = seg.overlap(&allowed) else {
                continue;
            };
            let skip: usize = (fit.start - seg.start).try_into().unwrap();
            let take: usize = fit.len().try_into().unwrap();

            added += recv.add(fit.start, chunk.slice(skip..skip + take));
        }

        self.unacked_segments += 1;

        if added == 0 || recv.reassembly_len() > 0 {
            // duplicate or out-of-order data: acknowledge immediately so the
            // sender sees duplicate acks and our latest SACK blocks
            self.ack_now = true;
        } else if self.unacked_segments >= 2 {
            // delayed ack covers at most one full segment
            self.ack_now = true;
        } else if self.delayed_ack_deadline.is_none() {
            let delay = X::Duration::from_millis(self.config.delayed_ack_ms);
            self.delayed_ack_deadline = now.checked_add(delay);
        }

        added
    }

    fn process_ack(&mut self, header: &TcpHeader, payload_empty: bool, now: X::Instant) {
        let ack = Seq::new(header.ack);
        let una = self.send.start_seq();
        let snd_nxt = self.scoreboard.end();

        // update the usable window from every valid ack
        self.snd_wnd = self
            .window_scaling
            .apply(header.window_size, header.flags.contains(TcpFlags::SYN));

        if let Some(sacks) = &header.selective_acks {
            self.scoreboard.on_sack(sacks.as_slice());
        }

        // `ack` acknowledges new data if it's in (una, snd_nxt]
        let acks_new = ack != una && SeqRange::new(una, snd_nxt + 1).contains(ack);

        if acks_new {
            let acked_bytes = ack - una;

            // Karn: only sample if the acked range was never retransmitted
            if let Some((expect, sent_at)) = self.rtt_sample {
                if (ack - expect) < (1 << 31) {
                    self.rtt.add_sample(now.saturating_duration_since(sent_at));
                    self.rtt_sample = None;
                }
            }

            self.scoreboard.on_ack(ack);
            self.send.advance_start(ack);

            if !self.our_syn_acked && (ack - self.iss) >= 1 {
                self.our_syn_acked = true;
            }

            self.congestion
                .on_ack(acked_bytes, self.scoreboard.pipe(), now);
            self.dup_ack_count = 0;
            self.retransmit_attempts = 0;

            // restart the retransmission timer for remaining data
            self.retransmit_deadline = if self.scoreboard.len() > 0 {
                now.checked_add(self.rtt.rto())
            } else {
                None
            };
        } else if ack == una && payload_empty && self.scoreboard.len() > 0 {
            self.dup_ack_count += 1;

            if self.dup_ack_count == DUP_ACK_THRESHOLD {
                // infer loss: everything below the highest selectively-acked
                // byte (or the first outstanding segment) is lost
                let up_to = self
                    .scoreboard
                    .highest_sacked_end()
                    .unwrap_or(una + self.config.mss);
                self.scoreboard.mark_lost_below(up_to);
                self.congestion
                    .on_loss_detected(self.scoreboard.pipe(), now);
            }
        }
    }

    /// Append application data to the send buffer.
    pub fn send(&mut self, mut reader: impl Read, len: usize) -> Result<usize, SendError> {
        if self.send.fin_added() {
            return Err(SendError::StreamClosed);
        }

        let space: usize = self.send_buffer_space().try_into().unwrap();
        let len = len.min(space);

        if len == 0 {
            return Err(SendError::Full);
        }

        let mut data = BytesMut::zeroed(len);
        reader.read_exact(&mut data).map_err(SendError::Io)?;
        self.send.add_data(data.freeze());

        Ok(len)
    }

    /// Move ordered bytes from the receive buffer to the application.
    pub fn recv(&mut self, mut writer: impl Write, len: usize) -> Result<usize, RecvError> {
        let Some(recv) = self.recv.as_mut() else {
            return Err(RecvError::NotConnected);
        };

        if recv.is_empty() {
            if self.fin_received {
                return Err(RecvError::StreamClosed);
            }
            return Err(RecvError::Empty);
        }

        let announced_before = self.recv_space();

        let mut copied: usize = 0;
        let recv = self.recv.as_mut().unwrap();
        while copied < len {
            let remaining: u32 = (len - copied).try_into().unwrap_or(u32::MAX);
            let Some((_seq, chunk)) = recv.pop(remaining) else {
                break;
            };
            writer.write_all(&chunk).map_err(RecvError::Io)?;
            copied += chunk.len();
        }

        // reading reopened a closed window; let the peer know
        if announced_before == 0 && self.recv_space() > 0 {
            self.ack_now = true;
        }

        Ok(copied)
    }

    /// Queue a FIN after any pending data.
    pub fn send_fin(&mut self) {
        if !self.send.fin_added() {
            self.send.add_fin();
        }
    }

    /// The next instant at which [`on_time_passed`](Self::on_time_passed)
    /// needs to run.
    pub fn next_timer_due(&self) -> Option<X::Instant> {
        [self.retransmit_deadline, self.delayed_ack_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Expire any due timers.
    pub fn on_time_passed(&mut self, now: X::Instant) {
        if let Some(deadline) = self.retransmit_deadline {
            if now >= deadline {
                self.retransmit_deadline = None;
                self.retransmit_attempts += 1;

                let flight = self.scoreboard.pipe();
                self.scoreboard.on_rto();
                self.congestion.on_retransmission_timeout(flight);
                self.rtt.backoff();
                // an eventual ack of retransmitted data must not be sampled
                self.rtt_sample = None;
            }
        }

        if let Some(deadline) = self.delayed_ack_deadline {
            if now >= deadline {
                self.delayed_ack_deadline = None;
                self.ack_now = true;
            }
        }
    }

    /// True if `pop_packet` would produce a segment.
    pub fn wants_to_send(&self) -> bool {
        if self.scoreboard.next_lost().is_some() {
            return true;
        }

        if self.next_transmit_range().is_some() {
            return true;
        }

        self.ack_now && self.peer_syn_seen
    }

    /// The range of new data (or SYN/FIN) that could be transmitted next,
    /// honoring the congestion window and the peer's receive window.
    fn next_transmit_range(&self) -> Option<(SeqRange, SegmentKind)> {
        let nxt = self.scoreboard.end();

        if !self.send.contains(nxt) {
            return None;
        }

        let kind = self.send.kind_at(nxt).unwrap();

        // control segments ignore flow-control windows
        if matches!(kind, SegmentKind::Syn | SegmentKind::Fin) {
            return Some((SeqRange::new(nxt, nxt + 1), kind));
        }

        let una = self.send.start_seq();
        let in_flight_from_una = nxt - una;

        // peer's window, with a one-byte probe allowance when it's closed
        // and nothing is outstanding
        let usable_window = if self.snd_wnd == 0 && self.scoreboard.pipe() == 0 {
            1
        } else {
            self.snd_wnd.saturating_sub(in_flight_from_una)
        };

        let cwnd_budget = self
            .congestion
            .cwnd()
            .saturating_sub(self.scoreboard.pipe());

        let budget = usable_window
            .min(cwnd_budget)
            .min(self.config.mss);

        if budget == 0 {
            return None;
        }

        // don't run past the end of queued data or into the FIN
        let mut len = budget.min(self.send.next_seq() - nxt);
        if self.send.fin_added() {
            // the FIN occupies the last sequence number in the queue
            let data_end = self.send.next_seq() - 1;
            len = len.min(data_end - nxt);
        }

        if len == 0 {
            return None;
        }

        Some((SeqRange::new(nxt, nxt + len), kind))
    }

    /// Clamp a desired transmission range to a single contiguous chunk of the
    /// send queue (a control segment, or one `Bytes` run of data).
    fn clamp_to_chunk(&self, range: SeqRange, kind: SegmentKind) -> SeqRange {
        match kind {
            SegmentKind::Syn | SegmentKind::Fin => SeqRange::new(range.start, range.start + 1),
            SegmentKind::Data => {
                let want = range.len().min(self.config.mss);
                let data = self.send.get_data(range.start, want);
                SeqRange::new(range.start, range.start + data.len() as u32)
            }
        }
    }

    /// Produce the next outgoing segment, if any.
    pub fn pop_packet(&mut self, now: X::Instant) -> Option<(TcpHeader, Payload)> {
        // retransmissions take priority
        if let Some(lost) = self.scoreboard.next_lost() {
            let kind = self.send.kind_at(lost.start).unwrap();
            let range = self.clamp_to_chunk(lost, kind);

            let segment = self.make_segment(range, kind, now);
            self.scoreboard.on_retransmit(range);
            self.rtt_sample = None;
            self.arm_retransmit_timer(now);
            return Some(segment);
        }

        // new data, SYN, or FIN
        if let Some((range, kind)) = self.next_transmit_range() {
            let range = self.clamp_to_chunk(range, kind);
            let segment = self.make_segment(range, kind, now);
            self.scoreboard.on_transmit(range);

            if self.rtt_sample.is_none() {
                self.rtt_sample = Some((range.end, now));
            }
            self.arm_retransmit_timer(now);
            return Some(segment);
        }

        // a pure acknowledgement
        if self.ack_now && self.peer_syn_seen {
            let nxt = self.scoreboard.end();
            let header = self.make_header(u32::from(nxt), TcpFlags::ACK, false);
            self.note_ack_sent();
            return Some((header, Payload::default()));
        }

        None
    }

    fn arm_retransmit_timer(&mut self, now: X::Instant) {
        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = now.checked_add(self.rtt.rto());
        }
    }

    fn make_segment(
        &mut self,
        range: SeqRange,
        kind: SegmentKind,
        _now: X::Instant,
    ) -> (TcpHeader, Payload) {
        let (flags, payload) = match kind {
            SegmentKind::Syn => (TcpFlags::SYN, Payload::default()),
            SegmentKind::Fin => (TcpFlags::FIN, Payload::default()),
            SegmentKind::Data => {
                let data = self.send.get_data(range.start, range.len());
                assert_eq!(data.len() as u32, range.len());
                (TcpFlags::empty(), Payload::from(data))
            }
        };

        let is_syn = kind == SegmentKind::Syn;

        // everything except an initial SYN acknowledges the peer
        let flags = if self.peer_syn_seen {
            flags | TcpFlags::ACK
        } else {
            flags
        };

        let header = self.make_header(u32::from(range.start), flags, is_syn);

        if flags.contains(TcpFlags::ACK) {
            self.note_ack_sent();
        }

        (header, payload)
    }

    fn make_header(&mut self, seq: u32, flags: TcpFlags, is_syn: bool) -> TcpHeader {
        self.ts_clock = self.ts_clock.wrapping_add(1);

        // our acknowledgement covers ordered data plus the peer's SYN/FIN
        let ack = match &self.recv {
            Some(recv) => u32::from(recv.next_seq() + u32::from(self.fin_received)),
            None => 0,
        };

        // include up to four of the most recently received out-of-order
        // ranges so the peer can fill the holes precisely
        let selective_acks = self.recv.as_ref().and_then(|recv| {
            let mut list: SmallArrayBackedSlice<4, (u32, u32)> = SmallArrayBackedSlice::empty();
            for range in recv.reassembly_ranges().take(4) {
                list.push((u32::from(range.start), u32::from(range.end)));
            }
            (!list.is_empty()).then_some(list)
        });

        TcpHeader {
            ip: Ipv4Header {
                src: *self.local_addr.ip(),
                dst: *self.remote_addr.ip(),
            },
            flags,
            src_port: self.local_addr.port(),
            dst_port: self.remote_addr.port(),
            seq,
            ack,
            window_size: self.window_scaling.announce(self.recv_space(), is_syn),
            selective_acks,
            window_scale: if is_syn {
                self.window_scaling.syn_option(self.config.recv_buffer_max)
            } else {
                None
            },
            timestamp: Some(self.ts_clock),
            timestamp_echo: self.last_ts_echo,
        }
    }

    fn note_ack_sent(&mut self) {
        self.ack_now = false;
        self.delayed_ack_deadline = None;
        self.unacked_segments = 0;
    }
}
