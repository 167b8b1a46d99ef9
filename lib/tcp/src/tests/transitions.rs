//! Connection lifecycle transitions outside the data path.

use std::time::Duration;

use crate::tests::TestEnv;
use crate::{Shutdown, TcpConfig, TcpError, TcpFlags};

#[test]
fn test_close_from_init() {
    let mut env = TestEnv::new(TcpConfig::default());
    env.client.state.close().unwrap();
    assert!(env.client.state.as_closed().is_some());
}

#[test]
fn test_close_while_connecting() {
    let mut env = TestEnv::new(TcpConfig::default());
    env.start_connect();

    env.client.state.close().unwrap();
    assert!(env.client.state.as_closed().is_some());
    assert!(matches!(
        env.client.state.clear_error(),
        Some(TcpError::ClosedWhileConnecting)
    ));
}

#[test]
fn test_connect_timeout() {
    let mut env = TestEnv::new(TcpConfig::default());

    let server_addr = env.server.addr;
    let client_addr = env.client.addr;
    env.client
        .state
        .connect(server_addr, || Ok::<_, ()>((client_addr, ())))
        .unwrap();

    // discard every outgoing SYN so the connect can never complete
    env.drop_fn = Some(Box::new(|_| false));

    // run long enough for the SYN retries to be exhausted under exponential
    // backoff
    for _ in 0..200 {
        env.advance(Duration::from_secs(2));
        if env.client.state.as_closed().is_some() {
            break;
        }
    }

    assert!(env.client.state.as_closed().is_some());
    assert!(matches!(
        env.client.state.clear_error(),
        Some(TcpError::TimedOut)
    ));
}

#[test]
fn test_shutdown_write_sends_fin() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    env.client.state.shutdown(Shutdown::Write).unwrap();
    assert!(env.client.state.as_fin_wait_one().is_some());

    let (header, payload) = env.client.state.pop_packet().unwrap();
    assert!(header.flags.contains(TcpFlags::FIN));
    accepted.push_packet(&header, payload).unwrap();
    assert!(accepted.as_close_wait().is_some());
}

#[test]
fn test_simultaneous_close() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    // both sides close before either FIN is delivered
    env.client.state.close().unwrap();
    accepted.close().unwrap();
    assert!(env.client.state.as_fin_wait_one().is_some());
    assert!(accepted.as_last_ack().is_none()); // server initiated its own close

    let (client_fin, client_payload) = env.client.state.pop_packet().unwrap();
    let (server_fin, server_payload) = accepted.pop_packet().unwrap();
    assert!(client_fin.flags.contains(TcpFlags::FIN));
    assert!(server_fin.flags.contains(TcpFlags::FIN));

    // cross-deliver the FINs
    env.client.state.push_packet(&server_fin, server_payload).unwrap();
    accepted.push_packet(&client_fin, client_payload).unwrap();

    assert!(env.client.state.as_closing().is_some());
    assert!(accepted.as_closing().is_some());

    // cross-deliver the acks; both sides reach TIME_WAIT
    let (client_ack, client_payload) = env.client.state.pop_packet().unwrap();
    let (server_ack, server_payload) = accepted.pop_packet().unwrap();
    env.client.state.push_packet(&server_ack, server_payload).unwrap();
    accepted.push_packet(&client_ack, client_payload).unwrap();

    assert!(env.client.state.as_time_wait().is_some());
    assert!(accepted.as_time_wait().is_some());
}

#[test]
fn test_reset_received_in_established() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    // fabricate a RST from the server side
    let (mut header, payload) = {
        accepted.send(&b"x"[..], 1).unwrap();
        accepted.pop_packet().unwrap()
    };
    header.flags = TcpFlags::RST | TcpFlags::ACK;

    env.client.state.push_packet(&header, payload).unwrap();
    assert!(env.client.state.as_rst().is_some());
    assert!(matches!(
        env.client.state.clear_error(),
        Some(TcpError::ResetReceived)
    ));
}

#[test]
fn test_fin_with_buffered_data_still_readable() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    // data followed by a close: the receiver must see the data first, then
    // end-of-stream
    env.client.state.send(&b"tail"[..], 4).unwrap();
    env.client.state.close().unwrap();

    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();
        let _ = accepted.push_packet(&header, payload);
    }

    let mut buf = Vec::new();
    let n = accepted.recv(&mut buf, 100).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"tail");

    assert!(matches!(
        accepted.recv(&mut Vec::new(), 100),
        Err(crate::RecvError::StreamClosed)
    ));
}
