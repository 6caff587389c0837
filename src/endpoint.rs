//! Endpoint wiring: controller vs target initialization.
//!
//! Both sides establish the transport, negotiate the wire protocol, exchange
//! the `INIT` handshake, then hand off to the broker. This module is the
//! only place that runs before the broker's event loop is entered.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use crate::broker::Broker;
use crate::config::{Config, Role};
use crate::constants::DEFAULT_ENV;
use crate::error::{BrokerError, Result};
use crate::message::{DataType, Message};
use crate::proxy::ProxyNode;
use crate::transport::{self, PlainTransport, Transport, TlsTransport};

/// Runs the controller side: listen for (or optionally dial) the target,
/// put the local terminal in raw mode, and drive the broker until the
/// session ends, restoring terminal state on the way out.
pub fn run_controller(config: &Config) -> Result<i32> {
    crate::signals::install(true)?;
    crate::signals::arm_startup_alarm(config.timeout_secs);

    let stream = transport::controller_listen(config.address, Duration::from_secs(config.timeout_secs))?;
    crate::signals::disarm_startup_alarm();

    let mut transport = open_transport(stream, config, true)?;
    let max_payload = transport::negotiate_protocol(transport.as_mut())?;

    let interactive_local = !config.non_interactive;
    send_init_flag(transport.as_mut(), interactive_local)?;
    let interactive_remote = recv_init_flag(transport.as_mut(), max_payload)?;
    let interactive = interactive_local && interactive_remote;

    if interactive {
        send_shell_handshake(transport.as_mut(), config)?;
    }

    let stdin_fd = crate::term::stdin_fd();
    let stdout_fd = crate::term::stdout_fd();
    let orig_termios = if interactive { Some(crate::term::enter_raw_mode(stdin_fd)?) } else { None };

    if interactive {
        send_rc_file(transport.as_mut(), &config.rc_file, max_payload)?;
    }

    let mut broker = Broker::new(
        Role::Controller,
        transport,
        max_payload,
        stdin_fd,
        stdout_fd,
        interactive,
        config,
        None,
    );

    for spec in &config.proxies {
        match ProxyNode::bind(spec, format!("{spec:?}")) {
            Ok(node) => broker.add_listener(node),
            Err(e) => tracing::warn!(error = %e, "failed to bind declared proxy listener"),
        }
    }

    let result = broker.run();

    if let Some(orig) = orig_termios {
        let _ = crate::term::restore_mode(stdin_fd, &orig);
    }

    match result {
        Ok(()) => Ok(0),
        Err(BrokerError::Closed) => Ok(0),
        Err(e) => {
            tracing::error!(error = %e, "session ended with error");
            Ok(1)
        }
    }
}

/// Runs the target side: connect (or optionally listen for a bindshell), spawn
/// the shell in a pty, and drive the broker until the session ends.
///
/// Bindshell `-k` keep-alive re-listens for a fresh controller after each
/// session ends cleanly; any other mode runs exactly one session.
pub fn run_target(config: &Config) -> Result<i32> {
    loop {
        let code = run_target_once(config)?;
        if !(config.bindshell && config.keep_alive) {
            return Ok(code);
        }
        tracing::info!("keep-alive: re-listening for next controller");
    }
}

fn run_target_once(config: &Config) -> Result<i32> {
    crate::signals::install(true)?;
    crate::signals::arm_startup_alarm(config.timeout_secs);

    let stream = if config.bindshell {
        transport::controller_listen(config.address, Duration::from_secs(config.timeout_secs))?
    } else {
        transport::target_connect(config.address, config)?
    };
    crate::signals::disarm_startup_alarm();

    let mut transport = open_transport(stream, config, false)?;
    let max_payload = transport::negotiate_protocol(transport.as_mut())?;

    let interactive_local = !config.non_interactive;
    send_init_flag(transport.as_mut(), interactive_local)?;
    let interactive_remote = recv_init_flag(transport.as_mut(), max_payload)?;
    let interactive = interactive_local && interactive_remote;

    let (master_fd, child_pgid) = if interactive {
        let (shell, env, winsize) = recv_shell_handshake(transport.as_mut(), config, max_payload)?;
        let spawned = crate::pty::spawn(&shell, &env, winsize)?;
        (spawned.master_fd, Some(spawned.child.as_raw()))
    } else {
        let spawned = crate::pty::spawn(&config.shell, &[], None)?;
        (spawned.master_fd, Some(spawned.child.as_raw()))
    };

    transport::set_nonblocking(master_fd, true)?;

    let mut broker = Broker::new(
        Role::Target,
        transport,
        max_payload,
        master_fd,
        master_fd,
        interactive,
        config,
        child_pgid,
    );

    for spec in &config.proxies {
        match ProxyNode::bind(spec, format!("{spec:?}")) {
            Ok(node) => broker.add_listener(node),
            Err(e) => tracing::warn!(error = %e, "failed to bind declared proxy listener"),
        }
    }

    let result = broker.run();
    if let Some(pid) = child_pgid {
        let _ = crate::pty::reap(nix::unistd::Pid::from_raw(pid));
    }

    match result {
        Ok(()) => Ok(0),
        Err(BrokerError::Closed) => Ok(0),
        Err(e) => {
            tracing::error!(error = %e, "session ended with error");
            Ok(1)
        }
    }
}

fn open_transport(stream: TcpStream, config: &Config, is_controller: bool) -> Result<Box<dyn Transport>> {
    if config.keys_dir.is_some() && !config.anon_dh {
        let domain = "wyrmshell";
        if is_controller {
            let identity_path = config.keys_dir.as_ref().unwrap().join("identity.pfx");
            let identity_bytes = std::fs::read(&identity_path)?;
            let identity = native_tls::Identity::from_pkcs12(&identity_bytes, "")
                .map_err(|e| BrokerError::Tls(e.to_string()))?;
            Ok(Box::new(TlsTransport::accept(stream, identity)?))
        } else {
            Ok(Box::new(TlsTransport::connect(stream, domain)?))
        }
    } else {
        Ok(Box::new(PlainTransport::new(stream)?))
    }
}

fn send_init_flag(transport: &mut dyn Transport, interactive: bool) -> Result<()> {
    let mut msg = Message::new(DataType::Init);
    msg.data = vec![interactive as u8];
    msg.push(transport)
}

fn recv_init_flag(transport: &mut dyn Transport, max_payload: usize) -> Result<bool> {
    let msg = Message::pull(transport, max_payload)?;
    if msg.data_type != DataType::Init || msg.data.is_empty() {
        return Err(BrokerError::Protocol("expected INIT interactive flag".into()));
    }
    Ok(msg.data[0] != 0)
}

/// Controller → target: shell name, then whitelisted env assignments, then
/// the current terminal size.
fn send_shell_handshake(transport: &mut dyn Transport, config: &Config) -> Result<()> {
    let mut shell_msg = Message::new(DataType::Init);
    shell_msg.data = config.shell.clone().into_bytes();
    shell_msg.push(transport)?;

    let assignments: Vec<String> = DEFAULT_ENV
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| format!("{name}={v}")))
        .collect();
    let mut env_msg = Message::new(DataType::Init);
    env_msg.data = assignments.join(" ").into_bytes();
    env_msg.push(transport)?;

    let (rows, cols) = crate::term::current_size(crate::term::stdin_fd()).unwrap_or((24, 80));
    let mut winsize_msg = Message::new(DataType::Init);
    winsize_msg.data = [rows.to_be_bytes(), cols.to_be_bytes()].concat();
    winsize_msg.push(transport)
}

/// Streams the rc-file's bytes to the target as `DT_TTY` frames — simulated
/// keystrokes the target's shell reads exactly like interactive typing. The
/// target has no rc-file concept of its own; a missing or unreadable file is
/// silently skipped, matching the original's `open() != -1` guard.
fn send_rc_file(transport: &mut dyn Transport, rc_file: &str, max_payload: usize) -> Result<()> {
    let path = expand_tilde(rc_file);
    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };

    let mut buf = vec![0u8; max_payload];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut msg = Message::new(DataType::Tty);
        msg.data = buf[..n].to_vec();
        msg.push(transport)?;
    }
    Ok(())
}

fn expand_tilde(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::Path::new(&home).join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

fn recv_shell_handshake(
    transport: &mut dyn Transport,
    config: &Config,
    max_payload: usize,
) -> Result<(String, Vec<(String, String)>, Option<nix::pty::Winsize>)> {
    let shell_msg = Message::pull(transport, max_payload)?;
    let shell = if shell_msg.data.is_empty() {
        config.shell.clone()
    } else {
        String::from_utf8_lossy(&shell_msg.data).to_string()
    };

    let env_msg = Message::pull(transport, max_payload)?;
    let env_str = String::from_utf8_lossy(&env_msg.data);
    let env: Vec<(String, String)> = env_str
        .split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let winsize_msg = Message::pull(transport, max_payload)?;
    let winsize = if winsize_msg.data.len() >= 4 {
        Some(nix::pty::Winsize {
            ws_row: u16::from_be_bytes([winsize_msg.data[0], winsize_msg.data[1]]),
            ws_col: u16::from_be_bytes([winsize_msg.data[2], winsize_msg.data[3]]),
            ws_xpixel: 0,
            ws_ypixel: 0,
        })
    } else {
        None
    };

    Ok((shell, env, winsize))
}
