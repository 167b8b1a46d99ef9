//! The individual TCP states. Each state is its own type; operations take the
//! state by value and return the (possibly different) successor state, so
//! transitions are explicit moves rather than flag changes.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::SocketAddrV4;

use crate::connection::Connection;
use crate::util::time::{Duration, Instant};
use crate::{
    AcceptError, AcceptedTcpState, CloseError, ConnId, ConnectError, Dependencies, Ipv4Header,
    ListenError, Payload, PollState, PopPacketError, PushPacketError, RecvError, SendError,
    Shutdown, ShutdownError, TcpConfig, TcpError, TcpFlags, TcpHeader, TcpStateEnum,
    TcpStateTrait, TimerRegisteredBy,
};

slotmap::new_key_type! { pub(crate) struct ChildKey; }

/// Fixed initial send sequence number. Connections in the simulation are
/// isolated from each other, so randomizing the ISN buys nothing and a fixed
/// value keeps runs reproducible.
const INITIAL_SEND_SEQUENCE: u32 = 0;

/// State shared by all TCP states for one socket: the external dependencies,
/// the configuration, and any pending error.
#[derive(Debug)]
pub(crate) struct Common<X: Dependencies> {
    pub(crate) deps: X,
    pub(crate) config: TcpConfig,
    pub(crate) error: Option<TcpError>,
    /// The earliest time a wakeup timer is already registered for, to avoid
    /// registering redundant timers.
    timer_armed: Option<X::Instant>,
}

impl<X: Dependencies> Common<X> {
    fn new(deps: X, config: TcpConfig) -> Self {
        Self {
            deps,
            config,
            error: None,
            timer_armed: None,
        }
    }

    fn now(&self) -> X::Instant {
        self.deps.current_time()
    }

    /// Make sure a wakeup timer will fire at (or before) `due`.
    fn arm_timer(&mut self, due: X::Instant, target: Option<ConnId>) {
        if let Some(armed) = self.timer_armed {
            if armed <= due {
                return;
            }
        }

        self.timer_armed = Some(due);
        self.deps.register_timer(due, move |state, registered_by| {
            state.timer_fired(target, registered_by);
        });
    }

    /// Arm a wakeup for the connection's next deadline, if it has one.
    fn sync_conn_timer(&mut self, conn: &Connection<X>) {
        if let Some(due) = conn.next_timer_due() {
            self.arm_timer(due, Some(conn.conn_id()));
        }
    }
}

/// Common handling for a RST segment arriving on a connection-bearing state.
fn reset_received<X: Dependencies>(mut common: Common<X>) -> TcpStateEnum<X> {
    common.error = Some(TcpError::ResetReceived);
    RstState::new(common, None).into()
}

// ===== Init =====

/// A newly created socket; no connection activity yet.
#[derive(Debug)]
pub(crate) struct InitState<X: Dependencies> {
    pub(crate) common: Common<X>,
}

impl<X: Dependencies> InitState<X> {
    pub fn new(deps: X, config: TcpConfig) -> Self {
        Self {
            common: Common::new(deps, config),
        }
    }
}

impl<X: Dependencies> TcpStateTrait<X> for InitState<X> {
    fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (ClosedState::new(self.common).into(), Ok(()))
    }

    fn listen<T, E>(
        self,
        backlog: u32,
        associate_fn: impl FnOnce() -> Result<T, E>,
    ) -> (TcpStateEnum<X>, Result<T, ListenError<E>>) {
        let associated = match associate_fn() {
            Ok(x) => x,
            Err(e) => return (self.into(), Err(ListenError::FailedAssociation(e))),
        };

        let state = ListenState::new(self.common, backlog);
        (state.into(), Ok(associated))
    }

    fn connect<T, E>(
        self,
        remote_addr: SocketAddrV4,
        associate_fn: impl FnOnce() -> Result<(SocketAddrV4, T), E>,
    ) -> (TcpStateEnum<X>, Result<T, ConnectError<E>>) {
        let (local_addr, associated) = match associate_fn() {
            Ok(x) => x,
            Err(e) => return (self.into(), Err(ConnectError::FailedAssociation(e))),
        };

        let connection = Connection::new(
            self.common.config,
            local_addr,
            remote_addr,
            INITIAL_SEND_SEQUENCE,
        );

        let state = SynSentState {
            common: self.common,
            connection,
        };

        (state.into(), Ok(associated))
    }

    fn clear_error(&mut self) -> Option<TcpError> {
        self.common.error.take()
    }

    fn poll(&self) -> PollState {
        PollState::empty()
    }

    fn wants_to_send(&self) -> bool {
        false
    }

    fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        None
    }
}

// ===== Listen =====

/// A passive socket accepting new connections. Child connections live here
/// (keyed by their address tuple) until they are accept()ed.
#[derive(Debug)]
pub(crate) struct ListenState<X: Dependencies> {
    common: Common<X>,
    backlog: u32,
    // `Option` so children can be taken out, operated on, and replaced
    children: slotmap::SlotMap<ChildKey, Option<TcpStateEnum<X>>>,
    conn_map: HashMap<ConnId, ChildKey>,
    accept_queue: VecDeque<ChildKey>,
    /// Reply segments (RSTs for refused connections) waiting to be sent.
    to_send: VecDeque<TcpHeader>,
}

impl<X: Dependencies> ListenState<X> {
    fn new(common: Common<X>, backlog: u32) -> Self {
        Self {
            common,
            backlog: backlog.max(1),
            children: slotmap::SlotMap::with_key(),
            conn_map: HashMap::new(),
            accept_queue: VecDeque::new(),
            to_send: VecDeque::new(),
        }
    }

    /// Run `f` on the identified child, then handle any transition it made.
    fn with_child(
        &mut self,
        key: ChildKey,
        f: impl FnOnce(TcpStateEnum<X>) -> TcpStateEnum<X>,
    ) {
        let Some(slot) = self.children.get_mut(key) else {
            return;
        };
        let child = slot.take().unwrap();

        let child = f(child);

        match &child {
            TcpStateEnum::Closed(_) | TcpStateEnum::Rst(_) => {
                // the connection died before it was accepted
                self.children.remove(key);
                self.conn_map.retain(|_, v| *v != key);
                self.accept_queue.retain(|x| *x != key);
            }
            TcpStateEnum::Established(_) | TcpStateEnum::CloseWait(_) => {
                if !self.accept_queue.contains(&key) {
                    self.accept_queue.push_back(key);
                }
                *self.children.get_mut(key).unwrap() = Some(child);
            }
            _ => {
                *self.children.get_mut(key).unwrap() = Some(child);
            }
        }
    }

    /// Build a RST in reply to a segment that doesn't belong to any
    /// connection.
    fn rst_reply_for(header: &TcpHeader) -> TcpHeader {
        let seg_len = u32::from(header.flags.contains(TcpFlags::SYN))
            + u32::from(header.flags.contains(TcpFlags::FIN));

        TcpHeader {
            ip: Ipv4Header {
                src: header.ip.dst,
                dst: header.ip.src,
            },
            flags: TcpFlags::RST | TcpFlags::ACK,
            src_port: header.dst_port,
            dst_port: header.src_port,
            seq: if header.flags.contains(TcpFlags::ACK) {
                header.ack
            } else {
                0
            },
            ack: header.seq.wrapping_add(seg_len),
            window_size: 0,
            selective_acks: None,
            window_scale: None,
            timestamp: None,
            timestamp_echo: header.timestamp,
        }
    }
}

impl<X: Dependencies> TcpStateTrait<X> for ListenState<X> {
    fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        // pending children are dropped; their peers will retransmit and
        // eventually give up
        (ClosedState::new(self.common).into(), Ok(()))
    }

    fn accept(mut self) -> (TcpStateEnum<X>, Result<AcceptedTcpState<X>, AcceptError>) {
        while let Some(key) = self.accept_queue.pop_front() {
            let Some(slot) = self.children.get_mut(key) else {
                continue;
            };
            let child = slot.take().unwrap();

            match AcceptedTcpState::try_from(child) {
                Ok(accepted) => {
                    self.children.remove(key);
                    self.conn_map
                        .remove(&(accepted.local_addr(), accepted.remote_addr()));
                    return (self.into(), Ok(accepted));
                }
                Err(child) => {
                    // the child left an acceptable state since it was queued
                    *self.children.get_mut(key).unwrap() = Some(child);
                }
            }
        }

        (self.into(), Err(AcceptError::NothingToAccept))
    }

    fn push_packet(
        mut self,
        header: &TcpHeader,
        payload: Payload,
    ) -> (TcpStateEnum<X>, Result<u32, PushPacketError>) {
        let conn_id = (header.dst(), header.src());

        // an existing child connection?
        if let Some(key) = self.conn_map.get(&conn_id).copied() {
            let mut added = 0;
            self.with_child(key, |child| {
                let (child, rv) = child.push_packet(header, payload);
                added = rv.unwrap_or(0);
                child
            });
            return (self.into(), Ok(added));
        }

        if header.flags.contains(TcpFlags::RST) {
            // no connection to reset
            return (self.into(), Ok(0));
        }

        if !header.flags.contains(TcpFlags::SYN) || header.flags.contains(TcpFlags::ACK) {
            // not a connection attempt; tell the peer there's nothing here
            self.to_send.push_back(Self::rst_reply_for(header));
            return (self.into(), Ok(0));
        }

        // a new connection attempt
        if self.children.len() >= self.backlog as usize {
            self.to_send.push_back(Self::rst_reply_for(header));
            return (self.into(), Ok(0));
        }

        let connection = Connection::new(
            self.common.config,
            conn_id.0,
            conn_id.1,
            INITIAL_SEND_SEQUENCE,
        );

        let child = SynReceivedState {
            common: Common::new(self.common.deps.fork(), self.common.config),
            connection,
        };

        let key = self.children.insert(Some(child.into()));
        self.conn_map.insert(conn_id, key);

        // deliver the SYN to the new child
        let mut added = 0;
        self.with_child(key, |child| {
            let (child, rv) = child.push_packet(header, payload);
            added = rv.unwrap_or(0);
            child
        });

        (self.into(), Ok(added))
    }

    fn pop_packet(
        mut self,
    ) -> (
        TcpStateEnum<X>,
        Result<(TcpHeader, Payload), PopPacketError>,
    ) {
        if let Some(header) = self.to_send.pop_front() {
            return (self.into(), Ok((header, Payload::default())));
        }

        // slotmap iteration order is deterministic for a deterministic
        // sequence of insertions and removals
        let keys: Vec<ChildKey> = self.children.keys().collect();
        for key in keys {
            let wants = self.children[key].as_ref().unwrap().wants_to_send();
            if !wants {
                continue;
            }

            let mut popped = None;
            self.with_child(key, |child| {
                let (child, rv) = child.pop_packet();
                popped = rv.ok();
                child
            });

            if let Some(segment) = popped {
                return (self.into(), Ok(segment));
            }
        }

        (self.into(), Err(PopPacketError::NoPacket))
    }

    fn timer_fired(
        mut self,
        target: Option<ConnId>,
        _registered_by: TimerRegisteredBy,
    ) -> TcpStateEnum<X> {
        self.common.timer_armed = None;

        let Some(conn_id) = target else {
            return self.into();
        };

        if let Some(key) = self.conn_map.get(&conn_id).copied() {
            self.with_child(key, |child| {
                child.timer_fired(Some(conn_id), TimerRegisteredBy::Parent)
            });
        }

        self.into()
    }

    fn clear_error(&mut self) -> Option<TcpError> {
        self.common.error.take()
    }

    fn poll(&self) -> PollState {
        let mut state = PollState::LISTENING;
        if !self.accept_queue.is_empty() {
            state.insert(PollState::READY_TO_ACCEPT);
        }
        state
    }

    fn wants_to_send(&self) -> bool {
        if !self.to_send.is_empty() {
            return true;
        }

        self.children
            .values()
            .any(|child| child.as_ref().unwrap().wants_to_send())
    }

    fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        None
    }
}

// ===== connection-bearing states =====

/// The states that carry a live [`Connection`] all process packets and timers
/// the same way and differ only in their transitions, so the repetitive parts
/// are generated here. `$transition` inspects the state after the connection
/// has processed the input and returns the successor.
macro_rules! impl_connected_state {
    ($name:ident, $transition:expr, can_send: $can_send:expr, can_recv: $can_recv:expr, poll_extra: $poll_extra:expr) => {
        impl<X: Dependencies> TcpStateTrait<X> for $name<X> {
            fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
                $name::<X>::close_impl(self)
            }

            fn shutdown(self, how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
                $name::<X>::shutdown_impl(self, how)
            }

            fn send(
                mut self,
                reader: impl Read,
                len: usize,
            ) -> (TcpStateEnum<X>, Result<usize, SendError>) {
                if !$can_send {
                    return (self.into(), Err(SendError::StreamClosed));
                }

                let rv = self.connection.send(reader, len);
                self.common.sync_conn_timer(&self.connection);
                (self.into(), rv)
            }

            fn recv(
                mut self,
                writer: impl Write,
                len: usize,
            ) -> (TcpStateEnum<X>, Result<usize, RecvError>) {
                if !$can_recv {
                    return (self.into(), Err(RecvError::StreamClosed));
                }

                let rv = self.connection.recv(writer, len);
                self.common.sync_conn_timer(&self.connection);
                (self.into(), rv)
            }

            fn push_packet(
                mut self,
                header: &TcpHeader,
                payload: Payload,
            ) -> (TcpStateEnum<X>, Result<u32, PushPacketError>) {
                if header.flags.contains(TcpFlags::RST) {
                    return (reset_received(self.common), Ok(0));
                }

                let now = self.common.now();
                let added = self.connection.push_packet(header, payload, now);
                self.common.sync_conn_timer(&self.connection);

                let state = ($transition)(self);
                (state, Ok(added))
            }

            fn pop_packet(
                mut self,
            ) -> (
                TcpStateEnum<X>,
                Result<(TcpHeader, Payload), PopPacketError>,
            ) {
                let now = self.common.now();
                let rv = self
                    .connection
                    .pop_packet(now)
                    .ok_or(PopPacketError::NoPacket);
                self.common.sync_conn_timer(&self.connection);

                let state = ($transition)(self);
                (state, rv)
            }

            fn timer_fired(
                mut self,
                _target: Option<ConnId>,
                _registered_by: TimerRegisteredBy,
            ) -> TcpStateEnum<X> {
                self.common.timer_armed = None;

                let now = self.common.now();
                self.connection.on_time_passed(now);

                if self.connection.syn_attempts_exhausted() || self.connection.timed_out() {
                    self.common.error = Some(TcpError::TimedOut);
                    return ClosedState::new(self.common).into();
                }

                self.common.sync_conn_timer(&self.connection);
                ($transition)(self)
            }

            fn clear_error(&mut self) -> Option<TcpError> {
                self.common.error.take()
            }

            fn poll(&self) -> PollState {
                let mut state = $poll_extra;

                if $can_recv && self.connection.recv_buffer_len() > 0 {
                    state.insert(PollState::READABLE);
                }
                if self.connection.fin_received() {
                    state.insert(PollState::RECV_CLOSED);
                    // a closed receive stream is always "readable": the next
                    // read returns end-of-stream
                    state.insert(PollState::READABLE);
                }
                if $can_send
                    && self.connection.established()
                    && !self.connection.fin_queued()
                    && self.connection.send_buffer_space() > 0
                {
                    state.insert(PollState::WRITABLE);
                }
                if self.connection.fin_queued() {
                    state.insert(PollState::SEND_CLOSED);
                }
                if self.common.error.is_some() {
                    state.insert(PollState::ERROR);
                }

                state
            }

            fn wants_to_send(&self) -> bool {
                self.connection.wants_to_send()
            }

            fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
                Some(self.connection.conn_id())
            }
        }
    };
}

/// An active open: our SYN is queued or in flight.
#[derive(Debug)]
pub(crate) struct SynSentState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> SynSentState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.established() {
            return EstablishedState {
                common: self.common,
                connection: self.connection,
            }
            .into();
        }

        self.into()
    }

    fn close_impl(mut self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        self.common.error = Some(TcpError::ClosedWhileConnecting);
        (ClosedState::new(self.common).into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Err(ShutdownError::NotConnected))
    }
}

impl_connected_state!(
    SynSentState,
    SynSentState::transition,
    can_send: false,
    can_recv: false,
    poll_extra: PollState::CONNECTING
);

/// A passive open in progress: the peer's SYN arrived, our SYN-ACK is queued
/// or in flight.
#[derive(Debug)]
pub(crate) struct SynReceivedState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> SynReceivedState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.established() {
            if self.connection.fin_received() {
                return CloseWaitState {
                    common: self.common,
                    connection: self.connection,
                }
                .into();
            }
            return EstablishedState {
                common: self.common,
                connection: self.connection,
            }
            .into();
        }

        self.into()
    }

    fn close_impl(mut self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        self.connection.send_fin();
        let state = FinWaitOneState {
            common: self.common,
            connection: self.connection,
        };
        (state.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Err(ShutdownError::NotConnected))
    }
}

impl_connected_state!(
    SynReceivedState,
    SynReceivedState::transition,
    can_send: false,
    can_recv: false,
    poll_extra: PollState::CONNECTING
);

/// The steady state: both directions open.
#[derive(Debug)]
pub(crate) struct EstablishedState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> EstablishedState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.fin_received() {
            return CloseWaitState {
                common: self.common,
                connection: self.connection,
            }
            .into();
        }

        self.into()
    }

    fn close_impl(mut self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        self.connection.send_fin();
        let state = FinWaitOneState {
            common: self.common,
            connection: self.connection,
        };
        (state.into(), Ok(()))
    }

    fn shutdown_impl(mut self, how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        match how {
            Shutdown::Read => (self.into(), Ok(())),
            Shutdown::Write | Shutdown::Both => {
                self.connection.send_fin();
                let state = FinWaitOneState {
                    common: self.common,
                    connection: self.connection,
                };
                (state.into(), Ok(()))
            }
        }
    }
}

impl_connected_state!(
    EstablishedState,
    EstablishedState::transition,
    can_send: true,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// We closed first: our FIN is queued or in flight, nothing from the peer.
#[derive(Debug)]
pub(crate) struct FinWaitOneState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> FinWaitOneState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        match (self.connection.fin_acked(), self.connection.fin_received()) {
            (true, true) => enter_time_wait(self.common, self.connection),
            (true, false) => FinWaitTwoState {
                common: self.common,
                connection: self.connection,
            }
            .into(),
            (false, true) => ClosingState {
                common: self.common,
                connection: self.connection,
            }
            .into(),
            (false, false) => self.into(),
        }
    }

    fn close_impl(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        // already closing
        (self.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }
}

impl_connected_state!(
    FinWaitOneState,
    FinWaitOneState::transition,
    can_send: false,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// Our FIN was acknowledged; waiting for the peer's FIN.
#[derive(Debug)]
pub(crate) struct FinWaitTwoState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> FinWaitTwoState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.fin_received() {
            return enter_time_wait(self.common, self.connection);
        }

        self.into()
    }

    fn close_impl(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (self.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }
}

impl_connected_state!(
    FinWaitTwoState,
    FinWaitTwoState::transition,
    can_send: false,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// Simultaneous close: both FINs seen, ours not yet acknowledged.
#[derive(Debug)]
pub(crate) struct ClosingState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> ClosingState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.fin_acked() {
            return enter_time_wait(self.common, self.connection);
        }

        self.into()
    }

    fn close_impl(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (self.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }
}

impl_connected_state!(
    ClosingState,
    ClosingState::transition,
    can_send: false,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// The peer closed first; the application may still send.
#[derive(Debug)]
pub(crate) struct CloseWaitState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> CloseWaitState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        self.into()
    }

    fn close_impl(mut self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        self.connection.send_fin();
        let state = LastAckState {
            common: self.common,
            connection: self.connection,
        };
        (state.into(), Ok(()))
    }

    fn shutdown_impl(mut self, how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        match how {
            Shutdown::Read => (self.into(), Ok(())),
            Shutdown::Write | Shutdown::Both => {
                self.connection.send_fin();
                let state = LastAckState {
                    common: self.common,
                    connection: self.connection,
                };
                (state.into(), Ok(()))
            }
        }
    }
}

impl_connected_state!(
    CloseWaitState,
    CloseWaitState::transition,
    can_send: true,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// Both sides have closed; waiting for our FIN to be acknowledged.
#[derive(Debug)]
pub(crate) struct LastAckState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
}

impl<X: Dependencies> LastAckState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        if self.connection.fin_acked() {
            return ClosedState::new(self.common).into();
        }

        self.into()
    }

    fn close_impl(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (self.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }
}

impl_connected_state!(
    LastAckState,
    LastAckState::transition,
    can_send: false,
    can_recv: true,
    poll_extra: PollState::CONNECTED
);

/// Entered after both FINs are exchanged with ours acknowledged last; lingers
/// so that a retransmitted FIN from the peer can still be acknowledged.
#[derive(Debug)]
pub(crate) struct TimeWaitState<X: Dependencies> {
    pub(crate) common: Common<X>,
    pub(crate) connection: Connection<X>,
    expire_at: X::Instant,
}

fn enter_time_wait<X: Dependencies>(
    mut common: Common<X>,
    connection: Connection<X>,
) -> TcpStateEnum<X> {
    let lifetime = X::Duration::from_secs(common.config.time_wait_secs);
    let expire_at = common.now().checked_add(lifetime).unwrap();

    // the expiry wakeup; the state re-checks the deadline when it fires
    common.timer_armed = None;
    common.arm_timer(expire_at, Some(connection.conn_id()));

    TimeWaitState {
        common,
        connection,
        expire_at,
    }
    .into()
}

impl<X: Dependencies> TimeWaitState<X> {
    fn transition(self) -> TcpStateEnum<X> {
        self.into()
    }

    fn close_impl(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (self.into(), Ok(()))
    }

    fn shutdown_impl(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }
}

impl<X: Dependencies> TcpStateTrait<X> for TimeWaitState<X> {
    fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        self.close_impl()
    }

    fn shutdown(self, how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        self.shutdown_impl(how)
    }

    fn recv(
        mut self,
        writer: impl Write,
        len: usize,
    ) -> (TcpStateEnum<X>, Result<usize, RecvError>) {
        // data received before the close may still be buffered
        let rv = self.connection.recv(writer, len);
        (self.into(), rv)
    }

    fn push_packet(
        mut self,
        header: &TcpHeader,
        payload: Payload,
    ) -> (TcpStateEnum<X>, Result<u32, PushPacketError>) {
        if header.flags.contains(TcpFlags::RST) {
            return (reset_received(self.common), Ok(0));
        }

        // a retransmitted FIN must be acknowledged again
        let now = self.common.now();
        let added = self.connection.push_packet(header, payload, now);
        (self.into(), Ok(added))
    }

    fn pop_packet(
        mut self,
    ) -> (
        TcpStateEnum<X>,
        Result<(TcpHeader, Payload), PopPacketError>,
    ) {
        let now = self.common.now();
        let rv = self
            .connection
            .pop_packet(now)
            .ok_or(PopPacketError::NoPacket);
        (self.into(), rv)
    }

    fn timer_fired(
        mut self,
        _target: Option<ConnId>,
        _registered_by: TimerRegisteredBy,
    ) -> TcpStateEnum<X> {
        self.common.timer_armed = None;

        if self.common.now() >= self.expire_at {
            return ClosedState::new(self.common).into();
        }

        // a stale wakeup; re-arm for the real deadline
        let expire_at = self.expire_at;
        let conn_id = self.connection.conn_id();
        self.common.arm_timer(expire_at, Some(conn_id));
        self.into()
    }

    fn clear_error(&mut self) -> Option<TcpError> {
        self.common.error.take()
    }

    fn poll(&self) -> PollState {
        let mut state = PollState::CONNECTED | PollState::RECV_CLOSED | PollState::SEND_CLOSED;
        if self.connection.recv_buffer_len() > 0 {
            state.insert(PollState::READABLE);
        }
        state
    }

    fn wants_to_send(&self) -> bool {
        self.connection.wants_to_send()
    }

    fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        Some(self.connection.conn_id())
    }
}

// ===== Rst =====

/// The connection was aborted, either because we received a RST or because we
/// sent one.
#[derive(Debug)]
pub(crate) struct RstState<X: Dependencies> {
    common: Common<X>,
    /// A RST segment that still needs to be transmitted, if we're the side
    /// that reset the connection.
    rst_to_send: Option<TcpHeader>,
}

impl<X: Dependencies> RstState<X> {
    pub(crate) fn new(common: Common<X>, rst_to_send: Option<TcpHeader>) -> Self {
        Self {
            common,
            rst_to_send,
        }
    }
}

impl<X: Dependencies> TcpStateTrait<X> for RstState<X> {
    fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (ClosedState::new(self.common).into(), Ok(()))
    }

    fn shutdown(self, _how: Shutdown) -> (TcpStateEnum<X>, Result<(), ShutdownError>) {
        (self.into(), Ok(()))
    }

    fn recv(
        self,
        _writer: impl Write,
        _len: usize,
    ) -> (TcpStateEnum<X>, Result<usize, RecvError>) {
        (self.into(), Err(RecvError::StreamClosed))
    }

    fn send(self, _reader: impl Read, _len: usize) -> (TcpStateEnum<X>, Result<usize, SendError>) {
        (self.into(), Err(SendError::StreamClosed))
    }

    fn push_packet(
        self,
        _header: &TcpHeader,
        _payload: Payload,
    ) -> (TcpStateEnum<X>, Result<u32, PushPacketError>) {
        // the connection is gone; drop everything
        (self.into(), Ok(0))
    }

    fn pop_packet(
        mut self,
    ) -> (
        TcpStateEnum<X>,
        Result<(TcpHeader, Payload), PopPacketError>,
    ) {
        let rv = self
            .rst_to_send
            .take()
            .map(|header| (header, Payload::default()))
            .ok_or(PopPacketError::NoPacket);
        (self.into(), rv)
    }

    fn clear_error(&mut self) -> Option<TcpError> {
        self.common.error.take()
    }

    fn poll(&self) -> PollState {
        let mut state = PollState::CONNECTED
            | PollState::RECV_CLOSED
            | PollState::SEND_CLOSED
            | PollState::READABLE;
        if self.common.error.is_some() {
            state.insert(PollState::ERROR);
        }
        state
    }

    fn wants_to_send(&self) -> bool {
        self.rst_to_send.is_some()
    }

    fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        None
    }
}

// ===== Closed =====

/// The terminal state.
#[derive(Debug)]
pub(crate) struct ClosedState<X: Dependencies> {
    common: Common<X>,
}

impl<X: Dependencies> ClosedState<X> {
    pub(crate) fn new(common: Common<X>) -> Self {
        Self { common }
    }
}

impl<X: Dependencies> TcpStateTrait<X> for ClosedState<X> {
    fn close(self) -> (TcpStateEnum<X>, Result<(), CloseError>) {
        (self.into(), Ok(()))
    }

    fn recv(
        self,
        _writer: impl Write,
        _len: usize,
    ) -> (TcpStateEnum<X>, Result<usize, RecvError>) {
        (self.into(), Err(RecvError::StreamClosed))
    }

    fn send(self, _reader: impl Read, _len: usize) -> (TcpStateEnum<X>, Result<usize, SendError>) {
        (self.into(), Err(SendError::StreamClosed))
    }

    fn push_packet(
        self,
        _header: &TcpHeader,
        _payload: Payload,
    ) -> (TcpStateEnum<X>, Result<u32, PushPacketError>) {
        (self.into(), Ok(0))
    }

    fn clear_error(&mut self) -> Option<TcpError> {
        self.common.error.take()
    }

    fn poll(&self) -> PollState {
        let mut state = PollState::CLOSED | PollState::RECV_CLOSED | PollState::SEND_CLOSED;
        if self.common.error.is_some() {
            state.insert(PollState::ERROR);
        }
        state
    }

    fn wants_to_send(&self) -> bool {
        false
    }

    fn local_remote_addrs(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        None
    }
}
