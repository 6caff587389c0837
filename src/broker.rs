//! The broker: the single-threaded, cooperative event loop that multiplexes
//! terminal I/O, window-resize notifications, keep-alive frames, SOCKS/local
//! proxy listeners, and tunneled connection lifecycles onto one transport.

use std::collections::VecDeque;
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rand::Rng;

use crate::config::{Config, ProxyKind, Role};
use crate::connection::{ConState, ConnKey, ConnectionNode, ConnectionTable};
use crate::constants::{MESSAGE_DEPTH_MAX, ORIGIN_CONTROLLER, ORIGIN_TARGET};
use crate::error::{BrokerError, Result};
use crate::message::{connection_ht, proxy_ht, DataType, Message};
use crate::proxy::{ProxyListeners, ProxyNode};
use crate::socks::{self, SocksOutcome};
use crate::transport::Transport;

/// Readiness-set capacity. Mirrors the classic `FD_SETSIZE` admission bound
/// named in the resource model; listeners are elided first as it's approached.
const READINESS_CAPACITY: usize = 1024;

/// Largest single `poll()` timeout we ask for, in seconds. `PollTimeout`
/// only carries a `u16` of milliseconds (~65s); keep-alive windows longer
/// than this are serviced as consecutive chunks of this size.
const MAX_POLL_CHUNK_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    LocalOut,
    LocalIn,
    Transport,
    Listener(RawFd),
    ConnRead(ConnKey),
    ConnWrite(ConnKey),
}

pub struct Broker {
    role: Role,
    transport: Box<dyn Transport>,
    max_payload: usize,
    origin: u16,
    next_id: u16,

    connections: ConnectionTable,
    listeners: ProxyListeners,

    local_in_fd: RawFd,
    local_out_fd: RawFd,
    tty_write_queue: VecDeque<Vec<u8>>,

    interactive: bool,
    keepalive_window: Option<(u64, u64)>,

    /// Target only: pty master fd, reused as both `local_in_fd`/`local_out_fd`,
    /// and the child's process group for SIGWINCH delivery.
    child_pgid: Option<i32>,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        transport: Box<dyn Transport>,
        max_payload: usize,
        local_in_fd: RawFd,
        local_out_fd: RawFd,
        interactive: bool,
        config: &Config,
        child_pgid: Option<i32>,
    ) -> Self {
        let origin = match role {
            Role::Controller => ORIGIN_CONTROLLER,
            Role::Target => ORIGIN_TARGET,
        };
        let keepalive_window = if config.non_interactive {
            Some((config.retry_start, config.retry_stop))
        } else {
            None
        };

        Self {
            role,
            transport,
            max_payload,
            origin,
            next_id: 1,
            connections: ConnectionTable::new(),
            listeners: ProxyListeners::new(),
            local_in_fd,
            local_out_fd,
            tty_write_queue: VecDeque::new(),
            interactive,
            keepalive_window,
            child_pgid,
        }
    }

    pub fn add_listener(&mut self, node: ProxyNode) {
        self.listeners.push(node);
    }

    fn alloc_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Runs until transport EOF (clean exit) or a session-fatal error.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if crate::signals::take_winch() {
                if self.role == Role::Controller && self.interactive {
                    self.send_winresize()?;
                }
                continue;
            }

            let watch = self.build_watch_set();
            let timeout_secs = self.poll_timeout_secs();
            let ready = match self.poll_once(&watch, timeout_secs) {
                Ok(r) => r,
                Err(BrokerError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if ready.is_empty() {
                // Timed out: non-interactive keep-alive.
                if self.keepalive_window.is_some() {
                    self.send_nop()?;
                }
                continue;
            }

            if self.dispatch_one(&ready)? {
                continue;
            }
        }
    }

    /// Picks the next keep-alive NOP deadline, uniformly in the configured
    /// `[retry_start, retry_stop)` window. `None` means block indefinitely
    /// (interactive sessions, which have no keep-alive timer).
    fn poll_timeout_secs(&self) -> Option<u64> {
        self.keepalive_window.map(|(start, stop)| {
            if stop > start {
                rand::rng().random_range(start..stop)
            } else {
                start
            }
        })
    }

    fn build_watch_set(&self) -> Vec<(Tag, RawFd, PollFlags)> {
        let mut watch = Vec::new();

        if !self.tty_write_queue.is_empty() {
            watch.push((Tag::LocalOut, self.local_out_fd, PollFlags::POLLOUT));
        }
        watch.push((Tag::LocalIn, self.local_in_fd, PollFlags::POLLIN));
        watch.push((Tag::Transport, self.transport.raw_fd(), PollFlags::POLLIN));

        for node in self.connections.iter() {
            if !matches!(node.state, ConState::Dormant | ConState::Ready | ConState::EInProgress) {
                watch.push((Tag::ConnRead(node.key), node.fd, PollFlags::POLLIN));
            }
            if !node.write_queue.is_empty() || node.state == ConState::EInProgress {
                watch.push((Tag::ConnWrite(node.key), node.fd, PollFlags::POLLOUT));
            }
        }

        let eligible = self.listeners.eligible_fds(watch.len(), READINESS_CAPACITY);
        for fd in eligible {
            watch.push((Tag::Listener(fd), fd, PollFlags::POLLIN));
        }

        watch
    }

    /// Polls `watch`, honoring a keep-alive window of any size even though a
    /// single `nix` poll call can only carry a `u16` millisecond timeout
    /// (~65s): a window longer than `MAX_POLL_CHUNK_SECS` is serviced as a
    /// series of bounded poll calls, returning early the moment any fd is
    /// actually ready and only reporting "nothing ready" once the whole
    /// window has elapsed.
    fn poll_once(&self, watch: &[(Tag, RawFd, PollFlags)], timeout_secs: Option<u64>) -> Result<Vec<(Tag, PollFlags)>> {
        let mut fds: Vec<PollFd> = watch
            .iter()
            .map(|(_, fd, flags)| {
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, *flags)
            })
            .collect();

        let mut remaining = timeout_secs;
        loop {
            let chunk = match remaining {
                None => PollTimeout::NONE,
                Some(secs) => {
                    let capped = secs.min(MAX_POLL_CHUNK_SECS);
                    PollTimeout::from((capped * 1000) as u16)
                }
            };

            match poll(&mut fds, chunk) {
                Ok(0) => match remaining {
                    None => continue,
                    Some(secs) => {
                        let capped = secs.min(MAX_POLL_CHUNK_SECS);
                        let left = secs - capped;
                        if left == 0 {
                            return Ok(Vec::new());
                        }
                        remaining = Some(left);
                        continue;
                    }
                },
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(BrokerError::Io(std::io::Error::from(e))),
            }
        }

        let mut ready = Vec::new();
        for (pfd, (tag, _, _)) in fds.iter().zip(watch.iter()) {
            if let Some(revents) = pfd.revents() {
                if !revents.is_empty() {
                    ready.push((*tag, revents));
                }
            }
        }
        Ok(ready)
    }

    /// Handles exactly one class of work from `ready`, in dispatch-order
    /// priority, and returns whether any work was performed.
    fn dispatch_one(&mut self, ready: &[(Tag, PollFlags)]) -> Result<bool> {
        if ready.iter().any(|(t, f)| *t == Tag::LocalOut && f.contains(PollFlags::POLLOUT)) {
            self.drain_tty_queue()?;
            return Ok(true);
        }

        if ready.iter().any(|(t, f)| *t == Tag::LocalIn && f.contains(PollFlags::POLLIN)) {
            self.read_local_input()?;
            return Ok(true);
        }

        if ready.iter().any(|(t, f)| *t == Tag::Transport && f.contains(PollFlags::POLLIN)) {
            self.read_one_frame()?;
            return Ok(true);
        }

        for (tag, flags) in ready {
            if let Tag::Listener(fd) = tag {
                if flags.contains(PollFlags::POLLIN) {
                    self.accept_on_listener(*fd)?;
                    return Ok(true);
                }
            }
        }

        for (tag, flags) in ready {
            if let Tag::ConnWrite(key) = tag {
                if flags.contains(PollFlags::POLLOUT) {
                    self.handle_conn_writable(*key)?;
                    return Ok(true);
                }
            }
        }

        for (tag, flags) in ready {
            if let Tag::ConnRead(key) = tag {
                if flags.contains(PollFlags::POLLIN) {
                    self.handle_conn_readable(*key)?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    // ---- local terminal I/O ----

    fn drain_tty_queue(&mut self) -> Result<()> {
        if let Some(front) = self.tty_write_queue.front_mut() {
            match write_fd(self.local_out_fd, front) {
                Ok(n) => {
                    front.drain(..n);
                    if front.is_empty() {
                        self.tty_write_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(BrokerError::Io(e)),
            }
        }
        Ok(())
    }

    fn read_local_input(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.max_payload];
        match read_fd(self.local_in_fd, &mut buf) {
            Ok(0) => Err(BrokerError::Closed),
            Ok(n) => {
                buf.truncate(n);
                let mut msg = Message::new(DataType::Tty);
                msg.data = buf;
                msg.push(self.transport.as_mut())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Err(BrokerError::Closed),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(BrokerError::Io(e)),
        }
    }

    fn send_winresize(&mut self) -> Result<()> {
        if let Some((rows, cols)) = crate::term::current_size(self.local_in_fd) {
            let mut msg = Message::new(DataType::WinResize);
            msg.data = [rows.to_be_bytes(), cols.to_be_bytes()].concat();
            msg.push(self.transport.as_mut())?;
        }
        Ok(())
    }

    fn send_nop(&mut self) -> Result<()> {
        Message::new(DataType::Nop).push(self.transport.as_mut())
    }

    // ---- remote transport frame dispatch ----

    fn read_one_frame(&mut self) -> Result<()> {
        let msg = Message::pull(self.transport.as_mut(), self.max_payload)?;
        match msg.data_type {
            DataType::Tty => self.on_tty(msg),
            DataType::WinResize => self.on_winresize(msg),
            DataType::Proxy => self.on_proxy(msg),
            DataType::Connection => self.on_connection(msg),
            DataType::Nop => Ok(()),
            DataType::Error => {
                tracing::warn!(payload = %String::from_utf8_lossy(&msg.data), "peer reported error");
                Ok(())
            }
            DataType::Init => Err(BrokerError::Protocol("unexpected INIT frame after handshake".into())),
        }
    }

    fn on_tty(&mut self, msg: Message) -> Result<()> {
        if self.tty_write_queue.is_empty() {
            match write_fd(self.local_out_fd, &msg.data) {
                Ok(n) if n == msg.data.len() => return Ok(()),
                Ok(n) => {
                    self.tty_write_queue.push_back(msg.data[n..].to_vec());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.tty_write_queue.push_back(msg.data);
                    return Ok(());
                }
                Err(e) => return Err(BrokerError::Io(e)),
            }
        }
        self.tty_write_queue.push_back(msg.data);
        Ok(())
    }

    fn on_winresize(&mut self, msg: Message) -> Result<()> {
        if self.role != Role::Target || msg.data.len() < 4 {
            return Ok(());
        }
        let rows = u16::from_be_bytes([msg.data[0], msg.data[1]]);
        let cols = u16::from_be_bytes([msg.data[2], msg.data[3]]);
        crate::pty::apply_winsize(self.local_in_fd, rows, cols)?;
        if let Some(pgid) = self.child_pgid {
            crate::signals::winch_process_group(pgid);
        }
        Ok(())
    }

    fn on_proxy(&mut self, msg: Message) -> Result<()> {
        let key = ConnKey {
            origin: msg.header_origin,
            id: msg.header_id,
        };
        match msg.header_type {
            proxy_ht::CREATE => self.on_proxy_create(key, &msg.data),
            proxy_ht::DESTROY => {
                self.connections.delete(key);
                Ok(())
            }
            proxy_ht::RESPONSE => self.on_proxy_response(key, msg.data),
            other => Err(BrokerError::Protocol(format!("unknown PROXY header_type {other}"))),
        }
    }

    fn on_proxy_create(&mut self, key: ConnKey, data: &[u8]) -> Result<()> {
        if data.len() < 2 {
            return self.destroy_remote(key, 0);
        }
        let ver = data[0];
        let cmd = data[1];
        let rhost_rport = String::from_utf8_lossy(&data[2..]).to_string();

        match connect_nonblocking(&rhost_rport) {
            Ok((fd, in_progress)) => {
                let mut node = ConnectionNode::new(
                    key,
                    fd,
                    if in_progress { ConState::EInProgress } else { ConState::Active },
                    false,
                );
                node.ver = ver;
                node.cmd = cmd;
                node.rhost_rport = rhost_rport;
                self.connections.insert(node);
                if !in_progress {
                    self.activate(key)?;
                }
                Ok(())
            }
            Err(errno) => self.destroy_remote(key, errno as u16),
        }
    }

    fn on_proxy_response(&mut self, key: ConnKey, data: Vec<u8>) -> Result<()> {
        let fd = match self.connections.find(key) {
            Some(n) => n.fd,
            None => return self.destroy_remote(key, 0),
        };

        match write_fd(fd, &data) {
            Ok(n) if n < data.len() => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.enqueue_write(data[n..].to_vec());
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.enqueue_write(data);
                }
            }
            Err(_) => {
                self.connections.delete(key);
                return Ok(());
            }
        }

        let pipelined = if let Some(node) = self.connections.find_mut(key) {
            node.state = ConState::Active;
            if node.scratch_ptr < node.scratch.len() {
                let tail = node.scratch[node.scratch_ptr..].to_vec();
                node.scratch_ptr = node.scratch.len();
                Some(tail)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(tail) = pipelined {
            let frame = crate::connection::data_frame(key, tail);
            frame.push(self.transport.as_mut())?;
        }
        Ok(())
    }

    fn on_connection(&mut self, msg: Message) -> Result<()> {
        let key = ConnKey {
            origin: msg.header_origin,
            id: msg.header_id,
        };
        match msg.header_type {
            connection_ht::DATA => self.on_connection_data(key, msg.data),
            connection_ht::DORMANT => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.state = ConState::Dormant;
                }
                Ok(())
            }
            connection_ht::ACTIVE => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.state = ConState::Active;
                }
                Ok(())
            }
            other => Err(BrokerError::Protocol(format!("unknown CONNECTION header_type {other}"))),
        }
    }

    fn on_connection_data(&mut self, key: ConnKey, data: Vec<u8>) -> Result<()> {
        let fd = match self.connections.find(key) {
            Some(n) => n.fd,
            None => return self.destroy_remote(key, 0),
        };

        match write_fd(fd, &data) {
            Ok(n) if n < data.len() => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.enqueue_write(data[n..].to_vec());
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.enqueue_write(data);
                }
            }
            Err(_) => {
                self.connections.delete(key);
                return Ok(());
            }
        }

        let depth = self.connections.find(key).map(|n| n.queue_depth()).unwrap_or(0);
        if depth >= MESSAGE_DEPTH_MAX {
            let already_dormant = self.connections.find(key).map(|n| n.peer_dormant).unwrap_or(true);
            if !already_dormant {
                let msg = Message::connection(connection_ht::DORMANT, key.origin, key.id);
                msg.push(self.transport.as_mut())?;
                if let Some(node) = self.connections.find_mut(key) {
                    node.peer_dormant = true;
                }
            }
        }
        Ok(())
    }

    fn destroy_remote(&mut self, key: ConnKey, errno: u16) -> Result<()> {
        Message::proxy_destroy(key.origin, key.id, errno).push(self.transport.as_mut())
    }

    // ---- listeners ----

    fn accept_on_listener(&mut self, fd: RawFd) -> Result<()> {
        let Some(listener) = self.listeners.find_by_fd(fd) else {
            return Ok(());
        };
        let kind = listener.kind;
        let rhost_rport = listener.rhost_rport.clone();

        let Some((stream, _peer)) = listener.try_accept().map_err(BrokerError::Io)? else {
            return Ok(());
        };
        let client_fd = stream.into_raw_fd(); // ownership transfers to the ConnectionNode

        let id = self.alloc_id();
        let key = ConnKey { origin: self.origin, id };

        let state = match kind {
            ProxyKind::Dynamic => ConState::SocksNoHandshake,
            ProxyKind::Local => ConState::Active,
        };
        let mut node = ConnectionNode::new(key, client_fd, state, true);
        if let Some(rhost) = rhost_rport {
            node.rhost_rport = rhost;
        }
        self.connections.insert(node);
        Ok(())
    }

    // ---- connection fd readiness ----

    fn activate(&mut self, key: ConnKey) -> Result<()> {
        let (accepted_locally, ver) = match self.connections.find(key) {
            Some(n) => (n.accepted_locally, n.ver),
            None => return Ok(()),
        };

        if accepted_locally {
            // We accepted the client; peer just connected out. Nothing to do
            // here until the peer's PROXY_RESPONSE with the SOCKS reply
            // arrives (handled in `on_proxy_response`).
            return Ok(());
        }

        // We connected out on behalf of an inbound PROXY_CREATE: report
        // success back to the peer as a PROXY_RESPONSE carrying the SOCKS
        // success reply, then go ACTIVE immediately.
        let reply = socks_success_reply(ver);
        let mut msg = Message::new(DataType::Proxy);
        msg.header_type = proxy_ht::RESPONSE;
        msg.header_origin = key.origin;
        msg.header_id = key.id;
        msg.data = reply;
        msg.push(self.transport.as_mut())?;

        if let Some(node) = self.connections.find_mut(key) {
            node.state = ConState::Active;
        }
        Ok(())
    }

    fn handle_conn_writable(&mut self, key: ConnKey) -> Result<()> {
        let state = match self.connections.find(key) {
            Some(n) => n.state,
            None => return Ok(()),
        };

        if state == ConState::EInProgress {
            let fd = self.connections.find(key).unwrap().fd;
            match retrieve_socket_error(fd) {
                Ok(0) => self.activate(key),
                Ok(errno) => {
                    self.connections.delete(key);
                    self.destroy_remote(key, errno as u16)
                }
                Err(e) => {
                    self.connections.delete(key);
                    Err(BrokerError::Io(e))
                }
            }
        } else {
            self.drain_conn_queue(key)
        }
    }

    fn drain_conn_queue(&mut self, key: ConnKey) -> Result<()> {
        let fd = match self.connections.find(key) {
            Some(n) => n.fd,
            None => return Ok(()),
        };

        let front = match self.connections.find_mut(key).and_then(|n| n.write_queue.front().cloned()) {
            Some(f) => f,
            None => return Ok(()),
        };

        match write_fd(fd, &front) {
            Ok(n) => {
                if let Some(node) = self.connections.find_mut(key) {
                    if let Some(head) = node.write_queue.front_mut() {
                        head.drain(..n);
                        if head.is_empty() {
                            node.write_queue.pop_front();
                        }
                    }
                    if node.write_queue.is_empty() && node.peer_dormant {
                        node.peer_dormant = false;
                        let mut msg = Message::connection(connection_ht::ACTIVE, key.origin, key.id);
                        msg.push(self.transport.as_mut())?;
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(_) => {
                self.connections.delete(key);
                self.destroy_remote(key, 0)
            }
        }
    }

    fn handle_conn_readable(&mut self, key: ConnKey) -> Result<()> {
        let (fd, state) = match self.connections.find(key) {
            Some(n) => (n.fd, n.state),
            None => return Ok(()),
        };

        match state {
            ConState::Active => {
                let mut buf = vec![0u8; self.max_payload];
                match read_fd(fd, &mut buf) {
                    Ok(0) => {
                        self.connections.delete(key);
                        self.destroy_remote(key, 0)
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        let frame = crate::connection::data_frame(key, buf);
                        frame.push(self.transport.as_mut())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                    Err(_) => {
                        self.connections.delete(key);
                        self.destroy_remote(key, 0)
                    }
                }
            }
            ConState::SocksNoHandshake | ConState::SocksV5Auth => self.handle_socks_negotiation(key, fd),
            _ => Ok(()),
        }
    }

    fn handle_socks_negotiation(&mut self, key: ConnKey, fd: RawFd) -> Result<()> {
        let mut buf = vec![0u8; self.max_payload];
        let n = match read_fd(fd, &mut buf) {
            Ok(0) => {
                self.connections.delete(key);
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(_) => {
                self.connections.delete(key);
                return Ok(());
            }
        };

        let Some(node) = self.connections.find_mut(key) else {
            return Ok(());
        };
        node.scratch.extend_from_slice(&buf[..n]);
        let state = node.state;
        let scratch = node.scratch.clone();
        let ptr = node.scratch_ptr;

        let result = if state == ConState::SocksNoHandshake {
            socks::parse(&scratch, ptr)
        } else {
            socks::parse_socks5_request(&scratch, ptr)
        };

        let (outcome, new_ptr) = match result {
            Ok(v) => v,
            Err(BrokerError::Malformed(_)) => {
                self.connections.delete(key);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(node) = self.connections.find_mut(key) {
            node.scratch_ptr = new_ptr;
        }

        match outcome {
            SocksOutcome::Incomplete => Ok(()),
            SocksOutcome::V5Auth { auth_method } => {
                write_fd(fd, &[0x05, auth_method]).map_err(BrokerError::Io)?;
                if let Some(node) = self.connections.find_mut(key) {
                    node.state = ConState::SocksV5Auth;
                }
                Ok(())
            }
            SocksOutcome::Ready { ver, cmd, rhost_rport } => {
                if let Some(node) = self.connections.find_mut(key) {
                    node.state = ConState::Ready;
                    node.ver = ver;
                    node.cmd = cmd;
                    node.rhost_rport = rhost_rport.clone();
                }
                let mut payload = vec![ver, cmd];
                payload.extend_from_slice(rhost_rport.as_bytes());
                let mut msg = Message::new(DataType::Proxy);
                msg.header_type = proxy_ht::CREATE;
                msg.header_origin = key.origin;
                msg.header_id = key.id;
                msg.data = payload;
                msg.push(self.transport.as_mut())
            }
        }
    }
}

fn socks_success_reply(ver: u8) -> Vec<u8> {
    if ver == 0x05 {
        vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    } else {
        vec![0x00, 0x5A, 0, 0, 0, 0, 0, 0]
    }
}

/// Starts a non-blocking connect. Returns `(fd, in_progress)` on success, or
/// the connect errno on immediate hard failure.
fn connect_nonblocking(rhost_rport: &str) -> std::result::Result<(RawFd, bool), i32> {
    use socket2::{Domain, Socket, Type};

    let addr: std::net::SocketAddr = rhost_rport.parse().map_err(|_| libc::EINVAL)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
    socket.set_nonblocking(true).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;

    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket.into_raw_fd(), false)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket.into_raw_fd(), true)),
        Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

/// Reads the pending error on a connecting socket. Initializes `optlen`
/// correctly before the call (the source's bug: an uninitialized `optlen`
/// passed to `getsockopt` makes the result undefined).
fn retrieve_socket_error(fd: RawFd) -> std::io::Result<i32> {
    let mut errno: libc::c_int = 0;
    let mut optlen: libc::socklen_t = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(errno)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4_success_reply_shape() {
        let reply = socks_success_reply(0x04);
        assert_eq!(reply.len(), 8);
        assert_eq!(reply[0], 0x00);
        assert_eq!(reply[1], 0x5A);
    }

    #[test]
    fn socks5_success_reply_shape() {
        let reply = socks_success_reply(0x05);
        assert_eq!(reply.len(), 10);
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], 0x00);
    }

    #[test]
    fn retrieve_socket_error_on_bad_fd_errs() {
        assert!(retrieve_socket_error(-1).is_err());
    }
}
