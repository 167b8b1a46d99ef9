//! Data-transfer behaviour: segmentation, reassembly, retransmission, and
//! selective acknowledgements.

use std::time::Duration;

use crate::tests::TestEnv;
use crate::{TcpConfig, TcpFlags};

fn read_all(state: &mut crate::TcpState<super::TestDeps>, max: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut buf = Vec::new();
        match state.recv(&mut buf, max) {
            Ok(n) if n > 0 => out.extend_from_slice(&buf),
            _ => break,
        }
    }
    out
}

#[test]
fn test_send_recv_roundtrip() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    let n = env.client.state.send(&b"hello"[..], 5).unwrap();
    assert_eq!(n, 5);

    env.pump();

    let mut buf = Vec::new();
    let n = accepted.recv(&mut buf, 100).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    // nothing more to read
    assert!(matches!(
        accepted.recv(&mut buf, 100),
        Err(crate::RecvError::Empty)
    ));
}

#[test]
fn test_segmentation_by_mss() {
    let mut config = TcpConfig::default();
    config.mss(1000);

    let mut env = TestEnv::new(config);
    let mut accepted = env.establish();

    let data: Vec<u8> = (0..5000u32).map(|x| x as u8).collect();
    env.client.state.send(&data[..], data.len()).unwrap();

    // no emitted segment may exceed the mss
    let mut received = Vec::new();
    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();
        assert!(payload.len() <= 1000);
        let _ = accepted.push_packet(&header, payload);
    }
    // acks flow back so the client can keep sending
    while accepted.wants_to_send() || env.client.state.wants_to_send() {
        while accepted.wants_to_send() {
            let (header, payload) = accepted.pop_packet().unwrap();
            let _ = env.client.state.push_packet(&header, payload);
        }
        while env.client.state.wants_to_send() {
            let (header, payload) = env.client.state.pop_packet().unwrap();
            assert!(payload.len() <= 1000);
            let _ = accepted.push_packet(&header, payload);
        }
    }

    let mut buf = Vec::new();
    while let Ok(n) = accepted.recv(&mut buf, 10000) {
        received.extend_from_slice(&buf);
        buf.clear();
        if n == 0 {
            break;
        }
    }

    assert_eq!(received, data);
}

#[test]
fn test_retransmit_after_timeout() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    env.client.state.send(&b"payload"[..], 7).unwrap();

    // lose the data segment on the wire
    let (header, _payload) = env.client.state.pop_packet().unwrap();
    assert!(!header.flags.contains(TcpFlags::SYN));
    assert_eq!(header.seq, 1); // first byte after the SYN

    // run past the retransmission timeout; the segment is sent again and
    // delivered this time
    let mut redelivered = false;
    for _ in 0..30 {
        env.advance(Duration::from_millis(100));
        while env.client.state.wants_to_send() {
            let (header, payload) = env.client.state.pop_packet().unwrap();
            if !payload.is_empty() {
                assert_eq!(header.seq, 1);
                redelivered = true;
            }
            let _ = accepted.push_packet(&header, payload);
        }
        if redelivered {
            break;
        }
    }
    assert!(redelivered);

    let mut buf = Vec::new();
    accepted.recv(&mut buf, 100).unwrap();
    assert_eq!(&buf, b"payload");
}

#[test]
fn test_out_of_order_reassembly_and_sack() {
    let mut config = TcpConfig::default();
    config.mss(100);

    let mut env = TestEnv::new(config);
    let mut accepted = env.establish();

    let data: Vec<u8> = (0..400u32).map(|x| x as u8).collect();
    env.client.state.send(&data[..], data.len()).unwrap();

    // pop all four segments, deliver all but the first
    let mut segments = Vec::new();
    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();
        if !payload.is_empty() {
            segments.push((header, payload));
        }
    }
    assert_eq!(segments.len(), 4);

    let (first, rest) = segments.split_first().unwrap();
    for (header, payload) in rest {
        accepted.push_packet(header, payload.clone()).unwrap();
    }

    // out-of-order data is not readable yet
    let mut buf = Vec::new();
    assert!(accepted.recv(&mut buf, 1000).is_err());

    // the receiver advertises the held ranges via SACK
    assert!(accepted.wants_to_send());
    let (ack_header, _) = accepted.pop_packet().unwrap();
    assert!(ack_header.flags.contains(TcpFlags::ACK));
    let sacks = ack_header.selective_acks.expect("expected SACK blocks");
    assert!(!sacks.is_empty());

    // delivering the missing segment fills the gap
    accepted.push_packet(&first.0, first.1.clone()).unwrap();
    let got = read_all(&mut accepted, 1000);
    assert_eq!(got, data);
}

#[test]
fn test_fast_retransmit_on_dup_acks() {
    let mut config = TcpConfig::default();
    config.mss(100);

    let mut env = TestEnv::new(config);
    let mut accepted = env.establish();

    let data: Vec<u8> = (0..400u32).map(|x| x as u8).collect();
    env.client.state.send(&data[..], data.len()).unwrap();

    // drop the first data segment, deliver the other three one at a time so
    // the receiver acknowledges each arrival separately; the resulting
    // duplicate acks must trigger a retransmission without waiting for the
    // timer (the clock never advances in this test)
    let mut dropped_seq = None;
    let mut dup_acks = 0;
    let mut retransmitted = false;
    while env.client.state.wants_to_send() {
        let (header, payload) = env.client.state.pop_packet().unwrap();

        if !payload.is_empty() && dropped_seq.is_none() {
            dropped_seq = Some(header.seq);
            continue;
        }
        if !payload.is_empty() && Some(header.seq) == dropped_seq {
            retransmitted = true;
        }
        let _ = accepted.push_packet(&header, payload);

        // each out-of-order segment produces an immediate duplicate ack
        while accepted.wants_to_send() {
            let (header, payload) = accepted.pop_packet().unwrap();
            assert!(header.flags.contains(TcpFlags::ACK));
            dup_acks += 1;
            let _ = env.client.state.push_packet(&header, payload);
        }
    }
    assert!(dup_acks >= 3);
    assert!(retransmitted);

    let got = read_all(&mut accepted, 1000);
    assert_eq!(got, data);
}

#[test]
fn test_send_buffer_fills() {
    let mut config = TcpConfig::default();
    config.buffer_sizes(1000, 174760);

    let mut env = TestEnv::new(config);
    let _accepted = env.establish();

    let data = vec![0u8; 4000];

    // the send buffer accepts only its capacity
    let n = env.client.state.send(&data[..], data.len()).unwrap();
    assert!(n <= 1000);

    // and rejects further writes while full
    let err = env.client.state.send(&data[..], data.len());
    assert!(matches!(err, Err(crate::SendError::Full)));
}

#[test]
fn test_delayed_ack_timer() {
    let mut env = TestEnv::new(TcpConfig::default());
    let mut accepted = env.establish();

    env.client.state.send(&b"x"[..], 1).unwrap();
    let (header, payload) = env.client.state.pop_packet().unwrap();
    accepted.push_packet(&header, payload).unwrap();

    // a single small segment is not acknowledged immediately
    assert!(!accepted.wants_to_send());

    // the delayed-ack timer (40 ms default) forces it out
    let deadline = env.clock.get() + Duration::from_millis(50);
    while env.clock.get() < deadline {
        env.clock.set(env.clock.get() + Duration::from_millis(1));
        // run the accepted socket's timers by hand; it's not owned by a host
        accepted_run_timers(&mut accepted, &env);
        if accepted.wants_to_send() {
            break;
        }
    }

    assert!(accepted.wants_to_send());
    let (header, _) = accepted.pop_packet().unwrap();
    assert!(header.flags.contains(TcpFlags::ACK));
}

fn accepted_run_timers(state: &mut crate::TcpState<super::TestDeps>, env: &TestEnv) {
    // the accepted socket shares the server host's timer list
    let now = env.clock.get();
    loop {
        let mut timers = env.server.timers.borrow_mut();
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

        callback(state, registered_by);
    }
}
