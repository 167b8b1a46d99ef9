//! End-to-end simulations driving whole scenarios through the syscall layer.

mod common;

use std::sync::{Arc, Mutex};

use mirage::host::managed::apps;

use common::{builder, millis, secs, ONE_NET, TWO_NET_10MS, TWO_NET_50MS};

const NANOS_PER_MILLI: i64 = 1_000_000;

#[test]
fn test_tcp_echo_across_50ms_edge() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(TWO_NET_50MS, 1, secs(10), dir.path());

    let server = builder.add_host("beta", 2).unwrap();
    let client = builder.add_host("alpha", 1).unwrap();

    builder.spawn_process(server, "echo-server", millis(0), |api| {
        apps::tcp_echo_server(api, 80);
    });

    let outcome = Arc::new(Mutex::new(None));
    let outcome_clone = Arc::clone(&outcome);

    builder.spawn_process(client, "client", millis(100), move |api| {
        let send_done = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let reply = apps::tcp_client(api, "10.0.0.2:80".parse().unwrap(), b"hello");
        let recv_done = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        *outcome_clone.lock().unwrap() = Some((reply, send_done, recv_done));
    });

    builder.build().unwrap().run().unwrap();

    let outcome = outcome.lock().unwrap().take().expect("client never finished");
    let (reply, send_done, recv_done) = outcome;

    // the echo made it back intact
    assert_eq!(reply, b"hello");

    // one round trip to the server and back costs at least 100 ms of virtual
    // time on a 50 ms edge (plus the handshake before it)
    let elapsed = recv_done - send_done;
    assert!(
        elapsed >= 100 * NANOS_PER_MILLI,
        "echo finished after only {elapsed} ns"
    );
}

#[test]
fn test_udp_ping_replies_at_expected_times() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(TWO_NET_10MS, 1, secs(10), dir.path());

    let pinger = builder.add_host("alpha", 1).unwrap();
    let server = builder.add_host("gamma", 2).unwrap();

    builder.spawn_process(server, "udp-echo", millis(0), |api| {
        apps::udp_echo_server(api, 9000);
    });

    let times = Arc::new(Mutex::new(Vec::new()));
    let times_clone = Arc::clone(&times);

    builder.spawn_process(pinger, "udp-ping", millis(0), move |api| {
        let exchanges = apps::udp_ping(api, "10.0.0.3:9000".parse().unwrap(), 3, 100);
        *times_clone.lock().unwrap() = exchanges;
    });

    builder.build().unwrap().run().unwrap();

    let times = times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);

    let first_send = times[0].0;
    for (i, (send_time, recv_time)) in times.iter().enumerate() {
        // pings go out at 0, 100, 200 ms
        let expected_send = first_send + (i as i64) * 100 * NANOS_PER_MILLI;
        assert_eq!(*send_time, expected_send, "ping {i} send pacing");

        // each reply arrives one 10 ms-edge round trip later
        let rtt = recv_time - send_time;
        assert_eq!(rtt, 20 * NANOS_PER_MILLI, "ping {i} round trip");
    }
}

#[test]
fn test_nanosleep_advances_virtual_time_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(ONE_NET, 1, secs(5), dir.path());

    let host = builder.add_host("alpha", 1).unwrap();

    let observed = Arc::new(Mutex::new(None));
    let observed_clone = Arc::clone(&observed);

    builder.spawn_process(host, "sleeper", millis(0), move |api| {
        let before = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let rv = api.sys_nanosleep(std::time::Duration::from_secs(1));
        let after = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        // a zero sleep completes without advancing time
        let before_zero = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let rv_zero = api.sys_nanosleep(std::time::Duration::ZERO);
        let after_zero = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        *observed_clone.lock().unwrap() = Some((rv, after - before, rv_zero, after_zero - before_zero));
    });

    builder.build().unwrap().run().unwrap();

    let (rv, elapsed, rv_zero, elapsed_zero) = observed.lock().unwrap().take().unwrap();
    assert_eq!(rv, 0);
    assert_eq!(elapsed, 1_000_000_000);
    assert_eq!(rv_zero, 0);
    assert_eq!(elapsed_zero, 0);
}

#[test]
fn test_etc_hosts_is_the_simulators_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(ONE_NET, 1, secs(5), dir.path());

    let host = builder.add_host("alpha", 1).unwrap();

    let contents = Arc::new(Mutex::new(None));
    let contents_clone = Arc::clone(&contents);

    builder.spawn_process(host, "reader", millis(0), move |api| {
        let fd = api.sys_open("/etc/hosts", libc::O_RDONLY, 0);
        assert!(fd >= 0, "open failed: {fd}");

        let (n, data) = api.sys_read(fd, 1024);
        assert!(n > 0, "read failed: {n}");
        api.sys_close(fd);

        *contents_clone.lock().unwrap() = Some(String::from_utf8(data).unwrap());
    });

    builder.build().unwrap().run().unwrap();

    let contents = contents.lock().unwrap().take().unwrap();

    // the managed process sees the simulator's address book, not the real
    // machine's hosts file
    assert!(contents.contains("10.0.0.1 alpha"));
    assert!(contents.contains("127.0.0.1 localhost"));
    assert!(!contents.contains("ip6"));
}

#[test]
fn test_tcp_bulk_transfer_with_slow_reader() {
    const TOTAL: usize = 1024 * 1024;
    const CHUNK: usize = 16384;
    const READ_SIZE: usize = 4096;

    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(TWO_NET_10MS, 1, secs(60), dir.path());

    let receiver = builder.add_host("beta", 2).unwrap();
    let sender = builder.add_host("alpha", 1).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);

    // reads 4 KiB at a time with a 5 ms think time per read
    builder.spawn_process(receiver, "slow-reader", millis(0), move |api| {
        let listener = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(listener >= 0);
        assert_eq!(api.sys_bind(listener, "0.0.0.0:7000".parse().unwrap()), 0);
        assert_eq!(api.sys_listen(listener, 1), 0);

        let conn = api.sys_accept(listener);
        assert!(conn >= 0, "accept failed: {conn}");

        let mut data = Vec::with_capacity(TOTAL);
        loop {
            let (n, chunk) = api.sys_read(conn, READ_SIZE);
            if n == 0 {
                break;
            }
            assert!(n > 0, "read failed: {n}");
            data.extend_from_slice(&chunk);

            api.sys_nanosleep(std::time::Duration::from_millis(5));
        }

        api.sys_close(conn);
        api.sys_close(listener);
        *received_clone.lock().unwrap() = data;
    });

    builder.spawn_process(sender, "bulk-sender", millis(100), move |api| {
        let fd = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert_eq!(api.sys_connect(fd, "10.0.0.2:7000".parse().unwrap()), 0);

        // a patterned payload so reordering would be visible
        let mut sent = 0usize;
        while sent < TOTAL {
            let len = CHUNK.min(TOTAL - sent);
            let chunk: Vec<u8> = (sent..sent + len).map(|i| (i % 251) as u8).collect();

            let mut offset = 0;
            while offset < chunk.len() {
                let rv = api.sys_write(fd, &chunk[offset..]);
                assert!(rv > 0, "write failed: {rv}");
                offset += rv as usize;
            }
            sent += len;
        }

        api.sys_close(fd);
    });

    builder.build().unwrap().run().unwrap();

    let received = received.lock().unwrap();

    // every byte arrived, in order
    assert_eq!(received.len(), TOTAL);
    for (i, byte) in received.iter().enumerate() {
        assert_eq!(*byte, (i % 251) as u8, "byte {i} out of order");
    }
}

#[test]
fn test_backlog_race_is_deterministic() {
    fn run_race(seed: u64) -> Vec<(String, i64)> {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(TWO_NET_10MS, seed, secs(10), dir.path());

        let server = builder.add_host("beta", 2).unwrap();
        let first = builder.add_host("alpha", 1).unwrap();
        let second = builder.add_host("gamma", 1).unwrap();

        // a listener that never accepts, with the smallest backlog
        builder.spawn_process(server, "lazy-server", millis(0), |api| {
            let listener = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(listener >= 0);
            assert_eq!(api.sys_bind(listener, "0.0.0.0:7100".parse().unwrap()), 0);
            assert_eq!(api.sys_listen(listener, 1), 0);
            api.sys_nanosleep(std::time::Duration::from_secs(5));
        });

        let results = Arc::new(Mutex::new(Vec::new()));

        for (host, name) in [(first, "alpha"), (second, "gamma")] {
            let results = Arc::clone(&results);
            let name = name.to_string();
            builder.spawn_process(host, "racer", millis(100), move |api| {
                let fd = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let rv = api.sys_connect(fd, "10.0.0.2:7100".parse().unwrap());
                results.lock().unwrap().push((name, rv));
            });
        }

        builder.build().unwrap().run().unwrap();

        let mut results = results.lock().unwrap().clone();
        results.sort();
        results
    }

    let outcome = run_race(1);

    // exactly one connection wins the single backlog slot; the other is
    // refused
    let winners = outcome.iter().filter(|(_, rv)| *rv == 0).count();
    let refused = outcome
        .iter()
        .filter(|(_, rv)| *rv == -(libc::ECONNREFUSED as i64))
        .count();
    assert_eq!((winners, refused), (1, 1), "outcome: {outcome:?}");

    // and the race resolves identically on a re-run with the same seed
    assert_eq!(outcome, run_race(1));
}

#[test]
fn test_identical_runs_produce_identical_event_sequences() {
    fn run_once() -> Vec<Vec<(u128, String)>> {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(TWO_NET_10MS, 7, secs(2), dir.path());
        builder.record_event_traces(true);

        let pinger = builder.add_host("alpha", 1).unwrap();
        let server = builder.add_host("gamma", 2).unwrap();

        builder.spawn_process(server, "udp-echo", millis(0), |api| {
            apps::udp_echo_server(api, 9000);
        });
        builder.spawn_process(pinger, "udp-ping", millis(0), move |api| {
            apps::udp_ping(api, "10.0.0.3:9000".parse().unwrap(), 5, 50);
        });

        let hosts = builder.build().unwrap().run().unwrap();

        let mut traces: Vec<(u32, Vec<(u128, String)>)> = hosts
            .iter()
            .map(|host| {
                let trace = host
                    .event_trace()
                    .into_iter()
                    .map(|(time, kind)| (time.to_abs_simtime().as_nanos(), format!("{kind:?}")))
                    .collect();
                (u32::from(host.id()), trace)
            })
            .collect();
        traces.sort_by_key(|(id, _)| *id);
        traces.into_iter().map(|(_, trace)| trace).collect()
    }

    let first = run_once();
    let second = run_once();

    assert!(!first.iter().all(|trace| trace.is_empty()));
    assert_eq!(first, second);
}
