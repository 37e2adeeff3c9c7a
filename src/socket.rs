// src/socket.rs
use crate::syscalls;
use std::io;

/// Outcome of one non-blocking I/O attempt.
///
/// Would-block and EOF are distinct variants: conflating them is how a
/// closed peer turns into a busy-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ready(usize),
    WouldBlock,
    Eof,
}

/// Byte transport owned by one connection.
///
/// Object-safe so a TLS driver can wrap any transport, and so tests can
/// drive the whole phase machine through a scripted in-memory impl.
pub trait Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<IoStatus>;

    fn write(&mut self, buf: &[u8]) -> io::Result<IoStatus>;

    /// Scatter/gather write. The default issues sequential `write`
    /// calls for transports without a vectored path.
    fn writev(&mut self, bufs: &[&[u8]]) -> io::Result<IoStatus> {
        let mut total = 0;
        for buf in bufs {
            match self.write(buf)? {
                IoStatus::Ready(n) => {
                    total += n;
                    if n < buf.len() {
                        return Ok(IoStatus::Ready(total));
                    }
                }
                IoStatus::WouldBlock => {
                    return Ok(if total > 0 {
                        IoStatus::Ready(total)
                    } else {
                        IoStatus::WouldBlock
                    });
                }
                IoStatus::Eof => return Ok(IoStatus::Eof),
            }
        }
        Ok(IoStatus::Ready(total))
    }

    /// Half-close the write side; reads stay possible for lingering.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Hint to coalesce small writes (TCP_CORK). Optional.
    fn set_cork(&mut self, _on: bool) {}
}

/// Production transport: a non-blocking TCP socket owning its fd.
/// Dropping it closes the descriptor.
pub struct TcpSocket {
    fd: i32,
}

impl TcpSocket {
    pub fn from_fd(fd: i32) -> Self {
        Self { fd }
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<IoStatus> {
        match syscalls::read_nb(self.fd, buf)? {
            None => Ok(IoStatus::WouldBlock),
            Some(0) => Ok(IoStatus::Eof),
            Some(n) => Ok(IoStatus::Ready(n)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<IoStatus> {
        match syscalls::write_nb(self.fd, buf)? {
            None => Ok(IoStatus::WouldBlock),
            Some(n) => Ok(IoStatus::Ready(n)),
        }
    }

    fn writev(&mut self, bufs: &[&[u8]]) -> io::Result<IoStatus> {
        match syscalls::writev_nb(self.fd, bufs)? {
            None => Ok(IoStatus::WouldBlock),
            Some(n) => Ok(IoStatus::Ready(n)),
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        syscalls::shutdown_write(self.fd)
    }

    fn set_cork(&mut self, on: bool) {
        syscalls::set_tcp_cork(self.fd, on);
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}
