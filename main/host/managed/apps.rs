//! Syscall wrappers for application code, plus the built-in applications
//! that scenario files can launch.

use std::net::{Ipv4Addr, SocketAddrV4};

use sim_support::syscall_types::{ForeignPtr, SyscallReg};

use crate::host::managed::ProcessApi;

const SOCKADDR_IN_LEN: usize = 16;

/// Serialize a `sockaddr_in` the way the kernel ABI lays it out.
fn sockaddr_in_bytes(addr: SocketAddrV4) -> [u8; SOCKADDR_IN_LEN] {
    let mut bytes = [0u8; SOCKADDR_IN_LEN];
    bytes[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
    bytes[2..4].copy_from_slice(&addr.port().to_be_bytes());
    bytes[4..8].copy_from_slice(&addr.ip().octets());
    bytes
}

fn sockaddr_in_from_bytes(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() < SOCKADDR_IN_LEN {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    if family != libc::AF_INET as u16 {
        return None;
    }
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Some(SocketAddrV4::new(ip, port))
}

fn reg(val: impl Into<SyscallReg>) -> SyscallReg {
    val.into()
}

fn zero() -> SyscallReg {
    SyscallReg::from(0u64)
}

/// Convenience syscall wrappers for application code. These marshal
/// arguments into the emulated address space and issue raw syscalls through
/// the driver.
impl ProcessApi {
    pub fn sys_socket(&self, domain: i32, sock_type: i32, protocol: i32) -> i64 {
        self.syscall(
            libc::SYS_socket,
            [reg(domain), reg(sock_type), reg(protocol), zero(), zero(), zero()],
        )
    }

    pub fn sys_bind(&self, fd: i64, addr: SocketAddrV4) -> i64 {
        let ptr = self.malloc_and_write(&sockaddr_in_bytes(addr));
        self.syscall(
            libc::SYS_bind,
            [reg(fd), reg(ptr), reg(SOCKADDR_IN_LEN), zero(), zero(), zero()],
        )
    }

    pub fn sys_listen(&self, fd: i64, backlog: i32) -> i64 {
        self.syscall(
            libc::SYS_listen,
            [reg(fd), reg(backlog), zero(), zero(), zero(), zero()],
        )
    }

    pub fn sys_accept(&self, fd: i64) -> i64 {
        self.syscall(
            libc::SYS_accept,
            [reg(fd), reg(ForeignPtr::<u8>::null()), reg(ForeignPtr::<u8>::null()), zero(), zero(), zero()],
        )
    }

    pub fn sys_connect(&self, fd: i64, addr: SocketAddrV4) -> i64 {
        let ptr = self.malloc_and_write(&sockaddr_in_bytes(addr));
        self.syscall(
            libc::SYS_connect,
            [reg(fd), reg(ptr), reg(SOCKADDR_IN_LEN), zero(), zero(), zero()],
        )
    }

    pub fn sys_send(&self, fd: i64, data: &[u8], flags: i32) -> i64 {
        let ptr = self.malloc_and_write(data);
        self.syscall(
            libc::SYS_sendto,
            [reg(fd), reg(ptr), reg(data.len()), reg(flags), reg(ForeignPtr::<u8>::null()), zero()],
        )
    }

    pub fn sys_sendto(&self, fd: i64, data: &[u8], flags: i32, dst: SocketAddrV4) -> i64 {
        let ptr = self.malloc_and_write(data);
        let addr_ptr = self.malloc_and_write(&sockaddr_in_bytes(dst));
        self.syscall(
            libc::SYS_sendto,
            [
                reg(fd),
                reg(ptr),
                reg(data.len()),
                reg(flags),
                reg(addr_ptr),
                reg(SOCKADDR_IN_LEN),
            ],
        )
    }

    pub fn sys_recv(&self, fd: i64, len: usize, flags: i32) -> (i64, Vec<u8>) {
        let ptr = self.malloc(len);
        let rv = self.syscall(
            libc::SYS_recvfrom,
            [reg(fd), reg(ptr), reg(len), reg(flags), reg(ForeignPtr::<u8>::null()), zero()],
        );

        let data = if rv > 0 {
            self.read_mem(ptr, rv as usize)
        } else {
            Vec::new()
        };
        (rv, data)
    }

    pub fn sys_recvfrom(&self, fd: i64, len: usize, flags: i32) -> (i64, Vec<u8>, Option<SocketAddrV4>) {
        let ptr = self.malloc(len);
        let addr_ptr = self.malloc(SOCKADDR_IN_LEN);
        let addrlen_ptr = self.malloc_and_write(&(SOCKADDR_IN_LEN as u32).to_ne_bytes());

        let rv = self.syscall(
            libc::SYS_recvfrom,
            [reg(fd), reg(ptr), reg(len), reg(flags), reg(addr_ptr), reg(addrlen_ptr)],
        );

        let data = if rv > 0 {
            self.read_mem(ptr, rv as usize)
        } else {
            Vec::new()
        };
        let addr = sockaddr_in_from_bytes(&self.read_mem(addr_ptr, SOCKADDR_IN_LEN));
        (rv, data, addr)
    }

    pub fn sys_read(&self, fd: i64, len: usize) -> (i64, Vec<u8>) {
        let ptr = self.malloc(len);
        let rv = self.syscall(
            libc::SYS_read,
            [reg(fd), reg(ptr), reg(len), zero(), zero(), zero()],
        );

        let data = if rv > 0 {
            self.read_mem(ptr, rv as usize)
        } else {
            Vec::new()
        };
        (rv, data)
    }

    pub fn sys_write(&self, fd: i64, data: &[u8]) -> i64 {
        let ptr = self.malloc_and_write(data);
        self.syscall(
            libc::SYS_write,
            [reg(fd), reg(ptr), reg(data.len()), zero(), zero(), zero()],
        )
    }

    pub fn sys_close(&self, fd: i64) -> i64 {
        self.syscall(libc::SYS_close, [reg(fd), zero(), zero(), zero(), zero(), zero()])
    }

    pub fn sys_open(&self, path: &str, flags: i32, mode: u32) -> i64 {
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        let ptr = self.malloc_and_write(&bytes);
        self.syscall(
            libc::SYS_open,
            [reg(ptr), reg(flags), reg(mode), zero(), zero(), zero()],
        )
    }

    pub fn sys_nanosleep(&self, duration: std::time::Duration) -> i64 {
        let ts = libc::timespec {
            tv_sec: duration.as_secs() as i64,
            tv_nsec: duration.subsec_nanos() as i64,
        };
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&ts.tv_sec.to_ne_bytes());
        bytes.extend_from_slice(&ts.tv_nsec.to_ne_bytes());
        let ptr = self.malloc_and_write(&bytes);

        self.syscall(
            libc::SYS_nanosleep,
            [reg(ptr), reg(ForeignPtr::<u8>::null()), zero(), zero(), zero(), zero()],
        )
    }

    /// The current `CLOCK_MONOTONIC` time, in nanoseconds.
    pub fn sys_clock_gettime_nanos(&self, clock: i32) -> i64 {
        let ptr = self.malloc(16);
        let rv = self.syscall(
            libc::SYS_clock_gettime,
            [reg(clock), reg(ptr), zero(), zero(), zero(), zero()],
        );
        assert_eq!(rv, 0, "clock_gettime failed: {rv}");

        let bytes = self.read_mem(ptr, 16);
        let sec = i64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        let nsec = i64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        sec * 1_000_000_000 + nsec
    }

    pub fn sys_pipe2(&self, flags: i32) -> (i64, i64, i64) {
        let ptr = self.malloc(8);
        let rv = self.syscall(
            libc::SYS_pipe2,
            [reg(ptr), reg(flags), zero(), zero(), zero(), zero()],
        );
        if rv != 0 {
            return (rv, -1, -1);
        }
        let bytes = self.read_mem(ptr, 8);
        let read_fd = i32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        let write_fd = i32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        (0, read_fd.into(), write_fd.into())
    }

    pub fn sys_epoll_create1(&self, flags: i32) -> i64 {
        self.syscall(
            libc::SYS_epoll_create1,
            [reg(flags), zero(), zero(), zero(), zero(), zero()],
        )
    }

    pub fn sys_epoll_ctl(&self, epfd: i64, op: i32, fd: i64, events: u32, data: u64) -> i64 {
        // struct epoll_event { u32 events; u64 data; }, packed on x86-64
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&events.to_ne_bytes());
        bytes.extend_from_slice(&data.to_ne_bytes());
        let ptr = self.malloc_and_write(&bytes);

        self.syscall(
            libc::SYS_epoll_ctl,
            [reg(epfd), reg(op), reg(fd), reg(ptr), zero(), zero()],
        )
    }

    /// Returns the ready `(events, data)` pairs.
    pub fn sys_epoll_wait(&self, epfd: i64, max_events: usize, timeout_ms: i32) -> (i64, Vec<(u32, u64)>) {
        let ptr = self.malloc(12 * max_events);
        let rv = self.syscall(
            libc::SYS_epoll_wait,
            [reg(epfd), reg(ptr), reg(max_events), reg(timeout_ms), zero(), zero()],
        );

        let mut events = Vec::new();
        if rv > 0 {
            let bytes = self.read_mem(ptr, 12 * rv as usize);
            for chunk in bytes.chunks_exact(12) {
                let ev = u32::from_ne_bytes(chunk[0..4].try_into().unwrap());
                let data = u64::from_ne_bytes(chunk[4..12].try_into().unwrap());
                events.push((ev, data));
            }
        }
        (rv, events)
    }

    pub fn sys_eventfd2(&self, init: u32, flags: i32) -> i64 {
        self.syscall(
            libc::SYS_eventfd2,
            [reg(init), reg(flags), zero(), zero(), zero(), zero()],
        )
    }

    pub fn sys_getrandom(&self, len: usize) -> (i64, Vec<u8>) {
        let ptr = self.malloc(len);
        let rv = self.syscall(
            libc::SYS_getrandom,
            [reg(ptr), reg(len), zero(), zero(), zero(), zero()],
        );
        let data = if rv > 0 {
            self.read_mem(ptr, rv as usize)
        } else {
            Vec::new()
        };
        (rv, data)
    }
}

/// The type of a built-in application body.
pub type AppFn = Box<dyn FnOnce(&ProcessApi) + Send + 'static>;

/// Resolve a scenario `app` name and its arguments to an application body.
pub fn lookup(name: &str, args: &[String]) -> anyhow::Result<AppFn> {
    use anyhow::Context;

    match name {
        "tcp-echo-server" => {
            let port: u16 = args.first().context("tcp-echo-server needs a port")?.parse()?;
            Ok(Box::new(move |api| tcp_echo_server(api, port)))
        }
        "tcp-client" => {
            let addr: SocketAddrV4 = args.first().context("tcp-client needs an address")?.parse()?;
            let message = args.get(1).cloned().unwrap_or_else(|| "hello".to_string());
            Ok(Box::new(move |api| {
                tcp_client(api, addr, message.as_bytes());
            }))
        }
        "udp-echo-server" => {
            let port: u16 = args.first().context("udp-echo-server needs a port")?.parse()?;
            Ok(Box::new(move |api| udp_echo_server(api, port)))
        }
        "udp-ping" => {
            let addr: SocketAddrV4 = args.first().context("udp-ping needs an address")?.parse()?;
            let count: u32 = args.get(1).map(|x| x.parse()).transpose()?.unwrap_or(3);
            let interval_ms: u64 = args.get(2).map(|x| x.parse()).transpose()?.unwrap_or(100);
            Ok(Box::new(move |api| {
                udp_ping(api, addr, count, interval_ms);
            }))
        }
        "sleeper" => {
            let secs: u64 = args.first().map(|x| x.parse()).transpose()?.unwrap_or(1);
            Ok(Box::new(move |api| {
                api.sys_nanosleep(std::time::Duration::from_secs(secs));
            }))
        }
        other => anyhow::bail!("unknown application '{other}'"),
    }
}

/// Accepts connections and echoes every byte back until the peer closes.
pub fn tcp_echo_server(api: &ProcessApi, port: u16) {
    let listener = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(listener >= 0, "socket failed: {listener}");

    let rv = api.sys_bind(listener, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    assert_eq!(rv, 0, "bind failed: {rv}");

    let rv = api.sys_listen(listener, 10);
    assert_eq!(rv, 0, "listen failed: {rv}");

    loop {
        let conn = api.sys_accept(listener);
        if conn < 0 {
            break;
        }

        loop {
            let (n, data) = api.sys_read(conn, 16384);
            if n <= 0 {
                break;
            }
            let mut sent = 0;
            while sent < data.len() {
                let rv = api.sys_write(conn, &data[sent..]);
                assert!(rv > 0, "echo write failed: {rv}");
                sent += rv as usize;
            }
        }

        api.sys_close(conn);
    }
}

/// Connects, sends `message`, and expects it echoed back.
pub fn tcp_client(api: &ProcessApi, server: SocketAddrV4, message: &[u8]) -> Vec<u8> {
    let fd = api.sys_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed: {fd}");

    let rv = api.sys_connect(fd, server);
    assert_eq!(rv, 0, "connect failed: {rv}");

    let mut sent = 0;
    while sent < message.len() {
        let rv = api.sys_write(fd, &message[sent..]);
        assert!(rv > 0, "send failed: {rv}");
        sent += rv as usize;
    }

    let mut reply = Vec::new();
    while reply.len() < message.len() {
        let (n, data) = api.sys_read(fd, message.len() - reply.len());
        if n <= 0 {
            break;
        }
        reply.extend_from_slice(&data);
    }

    api.sys_close(fd);
    reply
}

/// Echoes datagrams back to their source.
pub fn udp_echo_server(api: &ProcessApi, port: u16) {
    let fd = api.sys_socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    assert!(fd >= 0, "socket failed: {fd}");

    let rv = api.sys_bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    assert_eq!(rv, 0, "bind failed: {rv}");

    loop {
        let (n, data, src) = api.sys_recvfrom(fd, 65536, 0);
        if n < 0 {
            break;
        }
        if let Some(src) = src {
            api.sys_sendto(fd, &data, 0, src);
        }
    }
}

/// Sends `count` pings spaced `interval_ms` apart and waits for each reply.
/// Returns the virtual send/receive time in nanoseconds of each exchange.
pub fn udp_ping(api: &ProcessApi, dst: SocketAddrV4, count: u32, interval_ms: u64) -> Vec<(i64, i64)> {
    let fd = api.sys_socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    assert!(fd >= 0, "socket failed: {fd}");

    let start = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
    let mut times = Vec::new();

    for i in 0..count {
        // pace sends at start + i * interval
        let target = start + (i as i64) * (interval_ms as i64) * 1_000_000;
        let now = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        if target > now {
            api.sys_nanosleep(std::time::Duration::from_nanos((target - now) as u64));
        }

        let send_time = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);
        let rv = api.sys_sendto(fd, format!("ping-{i}").as_bytes(), 0, dst);
        assert!(rv > 0, "sendto failed: {rv}");

        let (n, _data, _src) = api.sys_recvfrom(fd, 1024, 0);
        assert!(n > 0, "recvfrom failed: {n}");
        let recv_time = api.sys_clock_gettime_nanos(libc::CLOCK_MONOTONIC);

        times.push((send_time, recv_time));
    }

    api.sys_close(fd);
    times
}
