// src/syscalls.rs
//
// Thin libc wrappers: listener setup, accept, non-blocking I/O and the
// event poller. Everything above this module speaks `Option<usize>`
// for I/O (`None` = would-block) and never sees errno directly.

use crate::error::{EngineError, RavelResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::ptr;

// ---- Listener ----

/// Create a non-blocking TCP listener with SO_REUSEPORT so every worker
/// binds its own copy of the port and the kernel spreads accepts.
///
/// Linux additionally gets TCP_NODELAY on the listener (inherited by
/// accepted sockets) and TCP_DEFER_ACCEPT to skip wakeups for
/// connections that have not sent data yet.
pub fn create_listener(host: &str, port: u16) -> RavelResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str.parse().map_err(|_| EngineError::Listen {
        addr: addr_str.clone(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "invalid address"),
    })?;

    let domain = match addr {
        std::net::SocketAddr::V4(_) => libc::AF_INET,
        std::net::SocketAddr::V6(_) => libc::AF_INET6,
    };

    let listen_err = |source: io::Error| EngineError::Listen {
        addr: addr_str.clone(),
        source,
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(listen_err(io::Error::last_os_error()));
        }

        #[cfg(not(target_os = "linux"))]
        if set_nonblocking(fd).is_err() {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(listen_err(err));
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(listen_err(err));
        }

        // Inherited by accepted sockets, so no per-accept setsockopt.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        #[cfg(target_os = "linux")]
        {
            let defer_secs: c_int = 1;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &defer_secs as *const _ as *const c_void,
                mem::size_of_val(&defer_secs) as socklen_t,
            );
        }

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(listen_err(err));
        }

        if libc::listen(fd, 8192) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(listen_err(err));
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> io::Result<()> {
    unsafe {
        let rc = match addr {
            std::net::SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            std::net::SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` when the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );
        #[cfg(not(target_os = "linux"))]
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());

        if fd < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            };
        }

        #[cfg(not(target_os = "linux"))]
        if let Err(err) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(err);
        }

        Ok(Some(fd))
    }
}

// ---- Non-blocking I/O ----
//
// `None` means would-block; `Some(0)` on read means the peer closed.

pub fn read_nb(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

pub fn write_nb(fd: c_int, buf: &[u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Scatter/gather write, at most 8 segments per syscall.
pub fn writev_nb(fd: c_int, bufs: &[&[u8]]) -> io::Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Half-close the write side, leaving the read side open for the
/// lingering drain.
pub fn shutdown_write(fd: c_int) -> io::Result<()> {
    unsafe {
        if libc::shutdown(fd, libc::SHUT_WR) < 0 {
            let err = io::Error::last_os_error();
            // Already reset by the peer: nothing left to half-close.
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// TCP_CORK around header+body writes (Linux only; no-op elsewhere).
pub fn set_tcp_cork(fd: c_int, on: bool) {
    #[cfg(target_os = "linux")]
    unsafe {
        let v: c_int = if on { 1 } else { 0 };
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &v as *const _ as *const c_void,
            mem::size_of_val(&v) as socklen_t,
        );
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (fd, on);
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Event poller ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};
    use libc::EPOLLET;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> RavelResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(EngineError::Poll(io::Error::last_os_error()));
                }
                Ok(Self { fd })
            }
        }

        /// Register edge-triggered interest for `fd` under `token`.
        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> RavelResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> RavelResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> RavelResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(EngineError::Poll(io::Error::last_os_error()));
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> RavelResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(EngineError::Poll(err));
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> RavelResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(EngineError::Poll(err));
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// kqueue shim so macOS development keeps the epoll-shaped API.
#[cfg(not(target_os = "linux"))]
pub use kqueue_poll::*;

#[cfg(not(target_os = "linux"))]
mod kqueue_poll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> RavelResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(EngineError::Poll(io::Error::last_os_error()));
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> RavelResult<()> {
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> RavelResult<()> {
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> RavelResult<()> {
            self.apply(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn apply(&self, fd: c_int, token: u64, interests: i32, action: u16) -> RavelResult<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                // EV_DELETE on filters that were never added is harmless.
                if res < 0 && action != EV_DELETE {
                    return Err(EngineError::Poll(io::Error::last_os_error()));
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> RavelResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch as c_int,
                    ts_ptr,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(EngineError::Poll(err));
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
