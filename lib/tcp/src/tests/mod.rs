//! A test harness that wires two TCP states together with a mock clock and a
//! lossy in-memory wire.

use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::{Payload, PollState, TcpConfig, TcpFlags, TcpHeader, TcpState, TimerRegisteredBy};

mod util {
    pub(crate) mod time;
}

mod send_recv;
mod transitions;

use util::time::Instant;

type TimerCallback = Box<dyn FnOnce(&mut TcpState<TestDeps>, TimerRegisteredBy) + Send + Sync>;

/// The timers registered by one socket, ordered by (time, registration
/// sequence) when fired.
type TimerList = Rc<RefCell<Vec<(Instant, TimerRegisteredBy, TimerCallback)>>>;

pub(crate) struct TestDeps {
    clock: Rc<Cell<Instant>>,
    timers: TimerList,
    registered_by: TimerRegisteredBy,
}

impl std::fmt::Debug for TestDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDeps")
            .field("now", &self.clock.get())
            .field("pending_timers", &self.timers.borrow().len())
            .finish()
    }
}

impl crate::Dependencies for TestDeps {
    type Instant = Instant;
    type Duration = Duration;

    fn register_timer(
        &self,
        time: Self::Instant,
        f: impl FnOnce(&mut TcpState<Self>, TimerRegisteredBy) + Send + Sync + 'static,
    ) {
        self.timers
            .borrow_mut()
            .push((time, self.registered_by, Box::new(f)));
    }

    fn current_time(&self) -> Self::Instant {
        self.clock.get()
    }

    fn fork(&self) -> Self {
        Self {
            clock: Rc::clone(&self.clock),
            timers: Rc::clone(&self.timers),
            registered_by: TimerRegisteredBy::Child,
        }
    }
}

/// One endpoint: a TCP state plus its timer list.
pub(crate) struct TestHost {
    pub state: TcpState<TestDeps>,
    pub addr: SocketAddrV4,
    timers: TimerList,
    clock: Rc<Cell<Instant>>,
}

impl TestHost {
    fn new(clock: Rc<Cell<Instant>>, addr: SocketAddrV4, config: TcpConfig) -> Self {
        let timers: TimerList = Rc::new(RefCell::new(Vec::new()));
        let deps = TestDeps {
            clock: Rc::clone(&clock),
            timers: Rc::clone(&timers),
            registered_by: TimerRegisteredBy::Parent,
        };

        Self {
            state: TcpState::new(deps, config),
            addr,
            timers,
            clock,
        }
    }

    /// Fire every timer due at or before the current time, oldest first.
    fn run_due_timers(&mut self) {
        loop {
            let now = self.clock.get();
            let mut timers = self.timers.borrow_mut();

            let due = timers
                .iter()
                .enumerate()
                .filter(|(_, (t, _, _))| *t <= now)
                .map(|(i, (t, _, _))| (*t, i))
                .min();

            let Some((_, index)) = due else {
                break;
            };

            let (_, registered_by, callback) = timers.remove(index);
            drop(timers);

            callback(&mut self.state, registered_by);
        }
    }
}

/// Two hosts, a shared clock, and the packets in flight between them.
pub(crate) struct TestEnv {
    pub clock: Rc<Cell<Instant>>,
    pub client: TestHost,
    pub server: TestHost,
    /// Returns false to drop the packet. Applied to client->server packets.
    pub drop_fn: Option<Box<dyn FnMut(&TcpHeader) -> bool>>,
}

pub(crate) const CLIENT_ADDR: &str = "10.0.0.1:20000";
pub(crate) const SERVER_ADDR: &str = "10.0.0.2:80";

impl TestEnv {
    pub fn new(config: TcpConfig) -> Self {
        let clock = Rc::new(Cell::new(Instant::EPOCH));

        let client_addr: SocketAddrV4 = CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddrV4 = SERVER_ADDR.parse().unwrap();

        Self {
            client: TestHost::new(Rc::clone(&clock), client_addr, config),
            server: TestHost::new(Rc::clone(&clock), server_addr, config),
            clock,
            drop_fn: None,
        }
    }

    /// Set up a listening server and a connecting client.
    pub fn start_connect(&mut self) {
        let server_addr = self.server.addr;
        let client_addr = self.client.addr;

        self.server
            .state
            .listen(10, || Ok::<(), ()>(()))
            .unwrap();

        self.client
            .state
            .connect(server_addr, || Ok::<_, ()>((client_addr, ())))
            .unwrap();
    }

    /// Exchange packets in both directions until neither side has anything
    /// left to send. Returns the number of packets moved.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;

        loop {
            let mut progressed = false;

            while self.client.state.wants_to_send() {
                let Ok((header, payload)) = self.client.state.pop_packet() else {
                    break;
                };
                moved += 1;
                progressed = true;

                let keep = match &mut self.drop_fn {
                    Some(f) => f(&header),
                    None => true,
                };
                if keep {
                    let _ = self.server.state.push_packet(&header, payload);
                }
            }

            while self.server.state.wants_to_send() {
                let Ok((header, payload)) = self.server.state.pop_packet() else {
                    break;
                };
                moved += 1;
                progressed = true;
                let _ = self.client.state.push_packet(&header, payload);
            }

            if !progressed {
                break;
            }
        }

        moved
    }

    /// Advance the clock, firing timers in order, pumping packets after each
    /// step.
    pub fn advance(&mut self, how_long: Duration) {
        const STEP: Duration = Duration::from_millis(1);

        let target = self.clock.get() + how_long;

        while self.clock.get() < target {
            let next = (self.clock.get() + STEP).min(target);
            self.clock.set(next);

            self.client.run_due_timers();
            self.server.run_due_timers();
            self.pump();
        }
    }

    /// Establish the connection and accept on the server, returning the
    /// accepted state in place of the listener-owned child.
    pub fn establish(&mut self) -> TcpState<TestDeps> {
        self.start_connect();
        self.pump();

        let accepted = self.server.state.accept().unwrap();
        let timers = Rc::clone(&self.server.timers);
        let clock = Rc::clone(&self.server.clock);
        let accepted = accepted.finalize(move |deps| {
            *deps = TestDeps {
                clock,
                timers,
                registered_by: TimerRegisteredBy::Parent,
            };
        });

        assert!(self.client.state.as_established().is_some());
        accepted
    }
}

#[test]
fn test_connect_handshake() {
    let mut env = TestEnv::new(TcpConfig::default());
    env.start_connect();

    // client sends SYN
    assert!(env.client.state.wants_to_send());
    let (header, payload) = env.client.state.pop_packet().unwrap();
    assert!(header.flags.contains(TcpFlags::SYN));
    assert!(!header.flags.contains(TcpFlags::ACK));
    assert_eq!(header.dst(), env.server.addr);
    assert!(payload.is_empty());
    assert!(env.client.state.as_syn_sent().is_some());

    // server replies with SYN-ACK
    env.server.state.push_packet(&header, payload).unwrap();
    let (header, payload) = env.server.state.pop_packet().unwrap();
    assert!(header.flags.contains(TcpFlags::SYN));
    assert!(header.flags.contains(TcpFlags::ACK));

    // client completes with an ACK
    env.client.state.push_packet(&header, payload).unwrap();
    assert!(env.client.state.as_established().is_some());

    let (header, payload) = env.client.state.pop_packet().unwrap();
    assert!(header.flags.contains(TcpFlags::ACK));
    assert!(!header.flags.contains(TcpFlags::SYN));
    env.server.state.push_packet(&header, payload).unwrap();

    // the server side is now ready to accept
    assert!(env
        .server
        .state
        .poll()
        .contains(PollState::READY_TO_ACCEPT));
}

#[test]
fn test_accept() {
    let mut env = TestEnv::new(TcpConfig::default());
    let accepted = env.establish();

    assert!(accepted.as_established().is_some());
    assert_eq!(
        accepted.local_remote_addrs(),
        Some((env.server.addr, env.client.addr))
    );
}

#[test]
fn test_backlog_refuses_excess_connections() {
    let clock = Rc::new(Cell::new(Instant::EPOCH));

    let mut server = TestHost::new(
        Rc::clone(&clock),
        SERVER_ADDR.parse().unwrap(),
        TcpConfig::default(),
    );
    server.state.listen(1, || Ok::<(), ()>(())).unwrap();

    let mut first = TestHost::new(
        Rc::clone(&clock),
        "10.0.0.1:1111".parse().unwrap(),
        TcpConfig::default(),
    );
    let mut second = TestHost::new(
        Rc::clone(&clock),
        "10.0.0.1:2222".parse().unwrap(),
        TcpConfig::default(),
    );

    let server_addr = server.addr;
    let first_addr = first.addr;
    let second_addr = second.addr;
    first
        .state
        .connect(server_addr, || Ok::<_, ()>((first_addr, ())))
        .unwrap();
    second
        .state
        .connect(server_addr, || Ok::<_, ()>((second_addr, ())))
        .unwrap();

    // both SYNs race in; the first wins the backlog slot
    let (syn1, payload1) = first.state.pop_packet().unwrap();
    let (syn2, payload2) = second.state.pop_packet().unwrap();
    server.state.push_packet(&syn1, payload1).unwrap();
    server.state.push_packet(&syn2, payload2).unwrap();

    // the server answers the first with SYN-ACK and the second with RST
    let mut saw_syn_ack = false;
    let mut saw_rst = false;
    while server.state.wants_to_send() {
        let (header, payload) = server.state.pop_packet().unwrap();
        if header.flags.contains(TcpFlags::RST) {
            saw_rst = true;
            assert_eq!(header.dst(), second.addr);
            second.state.push_packet(&header, payload).unwrap();
        } else if header.flags.contains(TcpFlags::SYN) {
            saw_syn_ack = true;
            assert_eq!(header.dst(), first.addr);
            first.state.push_packet(&header, payload).unwrap();
        }
    }
    assert!(saw_syn_ack);
    assert!(saw_rst);

    assert!(first.state.as_established().is_some());
    assert!(second.state.as_rst().is_some());
    assert!(matches!(
        second.state.clear_error(),
        Some(crate::TcpError::ResetReceived)
    ));
}

#[test]
fn test_rst_to_non_listening_segment() {
    let clock = Rc::new(Cell::new(Instant::EPOCH));
    let mut server = TestHost::new(
        Rc::clone(&clock),
        SERVER_ADDR.parse().unwrap(),
        TcpConfig::default(),
    );
    server.state.listen(1, || Ok::<(), ()>(())).unwrap();

    // a stray data segment (no SYN) for an unknown connection
    let header = TcpHeader {
        ip: crate::Ipv4Header {
            src: "10.0.0.9".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
        },
        flags: TcpFlags::ACK,
        src_port: 5555,
        dst_port: 80,
        seq: 1234,
        ack: 777,
        window_size: 1000,
        selective_acks: None,
        window_scale: None,
        timestamp: None,
        timestamp_echo: None,
    };
    server
        .state
        .push_packet(&header, Payload(vec![Bytes::from_static(b"x")]))
        .unwrap();

    let (reply, _) = server.state.pop_packet().unwrap();
    assert!(reply.flags.contains(TcpFlags::RST));
    assert_eq!(reply.dst_port, 5555);
}

#[test]
fn test_close_sequence() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    // client closes first
    env.client.state.close().unwrap();
    assert!(env.client.state.as_fin_wait_one().is_some());

    // FIN reaches the server
    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();
        accepted.push_packet(&header, payload).unwrap();
    }
    assert!(accepted.as_close_wait().is_some());

    // the server's ack moves the client to FIN_WAIT_2
    while accepted.wants_to_send() {
        let (header, payload) = accepted.pop_packet().unwrap();
        env.client.state.push_packet(&header, payload).unwrap();
    }
    assert!(env.client.state.as_fin_wait_two().is_some());

    // server closes; its FIN moves the client to TIME_WAIT
    accepted.close().unwrap();
    assert!(accepted.as_last_ack().is_some());
    while accepted.wants_to_send() {
        let (header, payload) = accepted.pop_packet().unwrap();
        env.client.state.push_packet(&header, payload).unwrap();
    }
    assert!(env.client.state.as_time_wait().is_some());

    // the client's final ack closes the server side
    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();
        accepted.push_packet(&header, payload).unwrap();
    }
    assert!(accepted.as_closed().is_some());

    // TIME_WAIT expires after the configured lifetime
    env.advance(Duration::from_secs(61));
    assert!(env.client.state.as_closed().is_some());
}

#[test]
fn test_window_scale_negotiated() {
    let mut env = TestEnv::new(TcpConfig::default());
    env.start_connect();

    let (syn, payload) = env.client.state.pop_packet().unwrap();
    assert!(syn.window_scale.is_some());

    env.server.state.push_packet(&syn, payload).unwrap();
    let (syn_ack, _) = env.server.state.pop_packet().unwrap();
    assert!(syn_ack.window_scale.is_some());
}

#[test]
fn test_window_scale_disabled() {
    let mut config = TcpConfig::default();
    config.window_scaling(false);

    let mut env = TestEnv::new(config);
    env.start_connect();

    let (syn, _) = env.client.state.pop_packet().unwrap();
    assert!(syn.window_scale.is_none());
}
