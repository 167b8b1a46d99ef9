//! Single-host scenarios exercising the emulated POSIX surface end to end.

mod common;

use std::sync::{Arc, Mutex};

use common::{builder, millis, secs, ONE_NET};

/// Run one application on a lone host and return what it left behind.
fn run_app<T: Send + 'static>(
    app: impl FnOnce(&mirage::host::managed::ProcessApi) -> T + Send + 'static,
) -> T {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder(ONE_NET, 1, secs(30), dir.path());

    let host = builder.add_host("alpha", 1).unwrap();

    let result = Arc::new(Mutex::new(None));
    let result_clone = Arc::clone(&result);

    builder.spawn_process(host, "app", millis(0), move |api| {
        *result_clone.lock().unwrap() = Some(app(api));
    });

    builder.build().unwrap().run().unwrap();

    let mut result = result.lock().unwrap();
    result.take().expect("application never finished")
}

#[test]
fn test_pipe_roundtrip_and_eof() {
    let (write_rv, data, eof_rv) = run_app(|api| {
        let (rv, read_fd, write_fd) = api.sys_pipe2(0);
        assert_eq!(rv, 0);

        let write_rv = api.sys_write(write_fd, b"through the pipe");
        let (read_rv, data) = api.sys_read(read_fd, 100);
        assert_eq!(read_rv, write_rv);

        // closing the write end makes further reads return end-of-file
        api.sys_close(write_fd);
        let (eof_rv, _) = api.sys_read(read_fd, 100);
        api.sys_close(read_fd);

        (write_rv, data, eof_rv)
    });

    assert_eq!(write_rv, 16);
    assert_eq!(data, b"through the pipe");
    assert_eq!(eof_rv, 0);
}

#[test]
fn test_eventfd_counter_semantics() {
    let (first, second, empty_rv) = run_app(|api| {
        let fd = api.sys_eventfd2(3, libc::EFD_NONBLOCK);
        assert!(fd >= 0);

        // add 4; the counter reads 7 and resets
        let add: u64 = 4;
        assert_eq!(api.sys_write(fd, &add.to_ne_bytes()), 8);

        let (rv, data) = api.sys_read(fd, 8);
        assert_eq!(rv, 8);
        let first = u64::from_ne_bytes(data.try_into().unwrap());

        let add: u64 = 1;
        assert_eq!(api.sys_write(fd, &add.to_ne_bytes()), 8);
        let (rv, data) = api.sys_read(fd, 8);
        assert_eq!(rv, 8);
        let second = u64::from_ne_bytes(data.try_into().unwrap());

        // the counter is empty now; a nonblocking read fails
        let (empty_rv, _) = api.sys_read(fd, 8);
        api.sys_close(fd);

        (first, second, empty_rv)
    });

    assert_eq!(first, 7);
    assert_eq!(second, 1);
    assert_eq!(empty_rv, -(libc::EAGAIN as i64));
}

#[test]
fn test_epoll_wait_reports_readiness() {
    let (empty_rv, ready, data) = run_app(|api| {
        let epfd = api.sys_epoll_create1(0);
        assert!(epfd >= 0);

        let (rv, read_fd, write_fd) = api.sys_pipe2(0);
        assert_eq!(rv, 0);

        assert_eq!(
            api.sys_epoll_ctl(epfd, libc::EPOLL_CTL_ADD, read_fd, libc::EPOLLIN as u32, 42),
            0
        );

        // nothing readable and a zero timeout: returns immediately with 0
        let (empty_rv, _) = api.sys_epoll_wait(epfd, 8, 0);

        // make the pipe readable; epoll reports it
        api.sys_write(write_fd, b"y");
        let (ready, events) = api.sys_epoll_wait(epfd, 8, -1);
        assert_eq!(events.len(), 1);

        api.sys_close(epfd);
        api.sys_close(read_fd);
        api.sys_close(write_fd);

        (empty_rv, ready, events[0])
    });

    assert_eq!(empty_rv, 0);
    assert_eq!(ready, 1);
    assert_eq!(data.0 & libc::EPOLLIN as u32, libc::EPOLLIN as u32);
    assert_eq!(data.1, 42);
}

#[test]
fn test_epoll_wait_blocks_until_timeout() {
    let (rv, elapsed) = run_app(|api| {
        let epfd = api.sys_epoll_create1(0);
        assert!(epfd >= 0);

        let (prv, read_fd, write_fd) = api.sys_pipe2(0);
        assert_eq!(prv, 0);
        assert_eq!(
            api.sys_epoll_ctl(epfd, libc::EPOLL_CTL_ADD, read_fd, libc::EPOLLIN as u32, 0),
            0
        );

        // nothing ever becomes readable; the wait expires after its timeout
        let before = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let (rv, _) = api.sys_epoll_wait(epfd, 8, 25);
        let after = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        api.sys_close(epfd);
        api.sys_close(read_fd);
        api.sys_close(write_fd);

        (rv, after - before)
    });

    assert_eq!(rv, 0);
    assert_eq!(elapsed, 25_000_000);
}

#[test]
fn test_timerfd_expires_in_virtual_time() {
    let (expirations, elapsed) = run_app(|api| {
        let fd = api.syscall(
            libc::SYS_timerfd_create,
            [
                (libc::CLOCK_MONOTONIC as i64).into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
            ],
        );
        assert!(fd >= 0, "timerfd_create failed: {fd}");

        // arm for 30 ms from now, no interval
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 30_000_000,
            },
        };
        let mut bytes = Vec::with_capacity(32);
        for ts in [spec.it_interval, spec.it_value] {
            bytes.extend_from_slice(&ts.tv_sec.to_ne_bytes());
            bytes.extend_from_slice(&ts.tv_nsec.to_ne_bytes());
        }
        let spec_ptr = api.malloc_and_write(&bytes);

        let rv = api.syscall(
            libc::SYS_timerfd_settime,
            [
                fd.into(),
                0i64.into(),
                spec_ptr.into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
            ],
        );
        assert_eq!(rv, 0, "timerfd_settime failed: {rv}");

        // a blocking read waits for the expiration
        let before = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let (n, data) = api.sys_read(fd, 8);
        let after = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        assert_eq!(n, 8);

        api.sys_close(fd);

        let expirations = u64::from_ne_bytes(data.try_into().unwrap());
        (expirations, after - before)
    });

    assert_eq!(expirations, 1);
    assert_eq!(elapsed, 30_000_000);
}

#[test]
fn test_dup_and_fcntl_flags() {
    run_app(|api| {
        let (rv, read_fd, write_fd) = api.sys_pipe2(0);
        assert_eq!(rv, 0);

        // dup points at the same pipe end
        let dup_fd = api.syscall(
            libc::SYS_dup,
            [write_fd.into(), 0i64.into(), 0i64.into(), 0i64.into(), 0i64.into(), 0i64.into()],
        );
        assert!(dup_fd >= 0);
        assert_ne!(dup_fd, write_fd);

        api.sys_write(dup_fd, b"via dup");
        let (n, data) = api.sys_read(read_fd, 100);
        assert_eq!(n, 7);
        assert_eq!(data, b"via dup");

        // F_SETFL toggles O_NONBLOCK, observable through F_GETFL
        let rv = api.syscall(
            libc::SYS_fcntl,
            [
                read_fd.into(),
                (libc::F_SETFL as i64).into(),
                (libc::O_NONBLOCK as i64).into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
            ],
        );
        assert_eq!(rv, 0);
        let flags = api.syscall(
            libc::SYS_fcntl,
            [
                read_fd.into(),
                (libc::F_GETFL as i64).into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
                0i64.into(),
            ],
        );
        assert_ne!(flags & libc::O_NONBLOCK as i64, 0);

        // and the nonblocking read on the empty pipe now fails immediately
        let (empty_rv, _) = api.sys_read(read_fd, 1);
        assert_eq!(empty_rv, -(libc::EAGAIN as i64));

        api.sys_close(read_fd);
        api.sys_close(write_fd);
        api.sys_close(dup_fd);
    });
}

#[test]
fn test_file_io_in_data_directory() {
    let contents = run_app(|api| {
        // relative paths resolve against the process working directory
        let fd = api.sys_open("scratch.txt", libc::O_CREAT | libc::O_RDWR, 0o644);
        assert!(fd >= 0, "open failed: {fd}");

        assert_eq!(api.sys_write(fd, b"persisted"), 9);
        api.sys_close(fd);

        // re-open and read back
        let fd = api.sys_open("scratch.txt", libc::O_RDONLY, 0);
        assert!(fd >= 0);
        let (n, data) = api.sys_read(fd, 100);
        assert_eq!(n, 9);
        api.sys_close(fd);

        data
    });

    assert_eq!(contents, b"persisted");
}

#[test]
fn test_getrandom_is_deterministic_per_seed() {
    fn draw() -> Vec<u8> {
        run_app(|api| {
            let (rv, data) = api.sys_getrandom(32);
            assert_eq!(rv, 32);
            data
        })
    }

    let first = draw();
    let second = draw();

    assert_eq!(first.len(), 32);
    // the same host seed yields the same "random" bytes
    assert_eq!(first, second);
}

#[test]
fn test_gettimeofday_matches_monotonic_clock() {
    run_app(|api| {
        let monotonic = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        let tv_ptr = api.malloc(16);
        let rv = api.syscall(
            libc::SYS_gettimeofday,
            [tv_ptr.into(), 0i64.into(), 0i64.into(), 0i64.into(), 0i64.into(), 0i64.into()],
        );
        assert_eq!(rv, 0);

        let bytes = api.read_mem(tv_ptr, 16);
        let sec = i64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        let usec = i64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        let gtod_nanos = sec * 1_000_000_000 + usec * 1_000;

        // no virtual time passed between the calls, so the clocks agree
        // to the microsecond granularity of timeval
        let diff = (gtod_nanos - monotonic).abs();
        assert!(diff < 1_000, "clocks diverge by {diff} ns");
    });
}
