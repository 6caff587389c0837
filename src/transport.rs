//! Transport: byte-level read/write of the remote socket, plaintext or TLS.
//!
//! Both directions block-until-complete from the caller's point of view: the
//! underlying fd is non-blocking and a would-block/EINTR result is retried
//! after waiting for readiness on that fd. The transport is allowed to
//! monopolize the thread for the duration of a single frame read or write —
//! nothing else is polled while a `read_exact`/`write_all` call is in flight.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rand::Rng;
use socket2::{Domain, Socket, Type};

use crate::config::Config;
use crate::constants::MINIMUM_MESSAGE_SIZE;
use crate::error::{BrokerError, Result};

/// Direction a caller should wait on before retrying a would-block I/O call.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitDir {
    Read,
    Write,
}

/// Abstracts over the plaintext and TLS backends. The broker holds one of
/// these behind a trait object and never touches the socket directly.
pub trait Transport {
    fn raw_fd(&self) -> RawFd;
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

pub struct PlainTransport {
    stream: TcpStream,
}

impl PlainTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Transport for PlainTransport {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}

pub struct TlsTransport {
    stream: native_tls::TlsStream<TcpStream>,
    fd: RawFd,
}

impl TlsTransport {
    /// Completes a TLS handshake as the connecting side. The underlying
    /// socket is already non-blocking; handshake want-read/want-write is
    /// serviced by waiting on the fd, same as steady-state I/O.
    pub fn connect(stream: TcpStream, domain: &str) -> Result<Self> {
        let fd = stream.as_raw_fd();
        stream.set_nonblocking(true)?;
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true) // cert pinning is an external collaborator's job, not the broker's.
            .build()
            .map_err(|e| BrokerError::Tls(e.to_string()))?;

        let mut handshake = connector.connect(domain, stream);
        loop {
            match handshake {
                Ok(stream) => return Ok(Self { stream, fd }),
                Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                    wait_for_either(fd)?;
                    handshake = mid.handshake();
                }
                Err(native_tls::HandshakeError::Failure(e)) => {
                    return Err(BrokerError::Tls(e.to_string()))
                }
            }
        }
    }

    pub fn accept(stream: TcpStream, identity: native_tls::Identity) -> Result<Self> {
        let fd = stream.as_raw_fd();
        stream.set_nonblocking(true)?;
        let acceptor = native_tls::TlsAcceptor::builder(identity)
            .build()
            .map_err(|e| BrokerError::Tls(e.to_string()))?;

        let mut handshake = acceptor.accept(stream);
        loop {
            match handshake {
                Ok(stream) => return Ok(Self { stream, fd }),
                Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                    wait_for_either(fd)?;
                    handshake = mid.handshake();
                }
                Err(native_tls::HandshakeError::Failure(e)) => {
                    return Err(BrokerError::Tls(e.to_string()))
                }
            }
        }
    }
}

fn wait_for_either(fd: RawFd) -> Result<()> {
    loop {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN | PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(BrokerError::Io(io::Error::from(e))),
        }
    }
}

impl Transport for TlsTransport {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}

fn wait_for(fd: RawFd, dir: WaitDir) -> Result<()> {
    let flags = match dir {
        WaitDir::Read => PollFlags::POLLIN,
        WaitDir::Write => PollFlags::POLLOUT,
    };
    loop {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(BrokerError::Io(io::Error::from(e))),
        }
    }
}

/// Block until `buf` is fully read, retrying EINTR/WouldBlock transparently.
/// A zero-byte read marks EOF and fails with `Closed`.
pub fn remote_read(t: &mut dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match t.try_read(&mut buf[filled..]) {
            Ok(0) => return Err(BrokerError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_for(t.raw_fd(), WaitDir::Read)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BrokerError::Io(e)),
        }
    }
    Ok(())
}

/// Block until `buf` is fully written, retrying EINTR/WouldBlock transparently.
pub fn remote_write(t: &mut dyn Transport, buf: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match t.try_write(&buf[sent..]) {
            Ok(0) => return Err(BrokerError::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_for(t.raw_fd(), WaitDir::Write)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BrokerError::Io(e)),
        }
    }
    Ok(())
}

/// Result of `negotiate_protocol`: the agreed-upon max payload size for every
/// frame on this session.
pub fn negotiate_protocol(t: &mut dyn Transport) -> Result<usize> {
    let local_max: u16 = {
        let page = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .unwrap_or(4096);
        page.clamp(1, u16::MAX as i64) as u16
    };

    remote_write(t, &local_max.to_be_bytes())?;

    let mut remote_buf = [0u8; 2];
    remote_read(t, &mut remote_buf)?;
    let remote_max = u16::from_be_bytes(remote_buf) as usize;

    if remote_max < MINIMUM_MESSAGE_SIZE {
        return Err(BrokerError::Protocol(format!(
            "peer proposed max payload {remote_max}, below minimum {MINIMUM_MESSAGE_SIZE}"
        )));
    }

    Ok((local_max as usize).min(remote_max))
}

/// Controller-side connect: listen on `addr` and accept exactly one peer
/// (reverse shell), or connect out if running in bindshell mode.
pub fn controller_listen(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "controller: accepted connection");
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if std::time::Instant::now() >= deadline {
                    return Err(BrokerError::Io(io::Error::from(io::ErrorKind::TimedOut)));
                }
                let fd = listener.as_raw_fd();
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                let _ = poll(&mut fds, PollTimeout::from(100u16));
            }
            Err(e) => return Err(BrokerError::Io(e)),
        }
    }
}

/// Target-side connect: dial `addr`, retrying on refusal/timeout in
/// `[retry_start, retry_stop)` seconds if a retry window is configured.
///
/// Bounded by the caller's armed startup alarm (`signals::arm_startup_alarm`):
/// this loop can retry indefinitely on its own, so it has to check the sticky
/// `SIGALRM` flag itself rather than rely on the handler to do anything more
/// than set it (the handler runs async-signal-context and must stay trivial).
pub fn target_connect(addr: SocketAddr, config: &Config) -> Result<TcpStream> {
    loop {
        if crate::signals::alarm_fired() {
            return Err(BrokerError::Io(io::Error::from(io::ErrorKind::TimedOut)));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        match socket.connect(&addr.into()) {
            Ok(()) => return Ok(socket.into()),
            Err(e)
                if config.retry_start > 0
                    && matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
                    ) =>
            {
                let retry = if config.retry_stop > config.retry_start {
                    rand::rng().random_range(config.retry_start..config.retry_stop)
                } else {
                    config.retry_start
                };
                tracing::info!(retry, "target: connect failed, retrying");
                sleep_checking_alarm(Duration::from_secs(retry))?;
            }
            Err(e) => return Err(BrokerError::Io(e)),
        }
    }
}

/// Sleeps for `total`, polling the sticky alarm flag every second so a
/// startup timeout firing mid-retry is noticed promptly instead of only
/// after the full retry interval elapses.
fn sleep_checking_alarm(total: Duration) -> Result<()> {
    let step = Duration::from_secs(1);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if crate::signals::alarm_fired() {
            return Err(BrokerError::Io(io::Error::from(io::ErrorKind::TimedOut)));
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
    if crate::signals::alarm_fired() {
        return Err(BrokerError::Io(io::Error::from(io::ErrorKind::TimedOut)));
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, on);
    fcntl(borrowed, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}
