//! Launch-time configuration: CLI parsing and the frozen `Config` it produces.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::constants::{
    DEFAULT_ADDRESS, DEFAULT_RC_FILE, DEFAULT_RETRY, DEFAULT_SHELL, DEFAULT_TIMEOUT_SECS,
};
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Dynamic,
    Local,
}

/// A `-D`/`-L` spec declared at launch, resolved against a listen address and
/// (for `Local`) a fixed remote destination.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub listen: SocketAddr,
    pub remote: Option<String>,
}

impl ProxySpec {
    fn parse_dynamic(raw: &str) -> Result<Self> {
        let listen = raw
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("bad -D listen address: {raw}")))?;
        Ok(Self {
            kind: ProxyKind::Dynamic,
            listen,
            remote: None,
        })
    }

    fn parse_local(raw: &str) -> Result<Self> {
        // listen_host:listen_port:remote_host:remote_port
        let mut parts = raw.rsplitn(3, ':');
        let remote_port = parts
            .next()
            .ok_or_else(|| BrokerError::Protocol(format!("bad -L spec: {raw}")))?;
        let remote_host = parts
            .next()
            .ok_or_else(|| BrokerError::Protocol(format!("bad -L spec: {raw}")))?;
        let listen_part = parts
            .next()
            .ok_or_else(|| BrokerError::Protocol(format!("bad -L spec: {raw}")))?;

        let listen = listen_part
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("bad -L listen address: {listen_part}")))?;

        Ok(Self {
            kind: ProxyKind::Local,
            listen,
            remote: Some(format!("{remote_host}:{remote_port}")),
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "wyrmshell", about = "Reverse/bind shell broker with an embedded SOCKS proxy")]
struct Cli {
    /// Run as controller (drives the interactive session).
    #[arg(short = 'c', long)]
    controller: bool,

    /// Run as bindshell target: listen for the controller instead of dialing it.
    #[arg(short = 'b', long)]
    bindshell: bool,

    /// Bindshell keep-alive: re-listen after the controller disconnects.
    #[arg(short = 'k', long)]
    keep_alive: bool,

    /// Shell to spawn on the target.
    #[arg(short = 's', long, default_value = DEFAULT_SHELL)]
    shell: String,

    /// Directory holding TLS keys/certificates.
    #[arg(short = 'd', long)]
    keys_dir: Option<PathBuf>,

    /// rc-file injected into the spawned shell on the target.
    #[arg(short = 'f', long, default_value = DEFAULT_RC_FILE)]
    rc_file: String,

    /// Startup timeout in seconds (connect/accept deadline).
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Retry/keep-alive window "min[,max]" in seconds.
    #[arg(short = 'r', long, default_value = DEFAULT_RETRY)]
    retry: String,

    /// Non-interactive mode: raw byte pipe, no PTY/winsize negotiation.
    #[arg(short = 'n', long)]
    non_interactive: bool,

    /// Anonymous Diffie-Hellman: skip certificate-based authentication.
    #[arg(short = 'a', long)]
    anon_dh: bool,

    /// Verbose logging.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dynamic (SOCKS) proxy listener, "listen_host:listen_port".
    #[arg(short = 'D', long = "dynamic-proxy")]
    dynamic: Vec<String>,

    /// Local forward listener, "listen_host:listen_port:remote_host:remote_port".
    #[arg(short = 'L', long = "local-proxy")]
    local: Vec<String>,

    /// Controller: address to listen on. Target: address to dial.
    address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub bindshell: bool,
    pub keep_alive: bool,
    pub address: SocketAddr,
    pub retry_start: u64,
    pub retry_stop: u64,
    pub timeout_secs: u64,
    pub rc_file: String,
    pub shell: String,
    pub keys_dir: Option<PathBuf>,
    pub anon_dh: bool,
    pub non_interactive: bool,
    pub verbose: u8,
    pub proxies: Vec<ProxySpec>,
}

impl Config {
    pub fn from_args() -> Result<Self> {
        let bindshell_by_name = std::env::args()
            .next()
            .and_then(|arg0| {
                std::path::Path::new(&arg0)
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("bindsh"))
            })
            .unwrap_or(false);
        Self::from_cli(Cli::parse(), bindshell_by_name)
    }

    fn from_cli(cli: Cli, bindshell_by_name: bool) -> Result<Self> {
        let role = if cli.controller {
            Role::Controller
        } else {
            Role::Target
        };

        let address_str = cli.address.as_deref().unwrap_or(DEFAULT_ADDRESS);
        let address = address_str
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("bad address: {address_str}")))?;

        let (retry_start, retry_stop) = parse_retry(&cli.retry)?;

        let mut proxies = Vec::with_capacity(cli.dynamic.len() + cli.local.len());
        for raw in &cli.dynamic {
            proxies.push(ProxySpec::parse_dynamic(raw)?);
        }
        for raw in &cli.local {
            proxies.push(ProxySpec::parse_local(raw)?);
        }

        Ok(Self {
            role,
            bindshell: cli.bindshell || bindshell_by_name,
            keep_alive: cli.keep_alive,
            address,
            retry_start,
            retry_stop,
            timeout_secs: cli.timeout,
            rc_file: cli.rc_file,
            shell: cli.shell,
            keys_dir: cli.keys_dir,
            anon_dh: cli.anon_dh,
            non_interactive: cli.non_interactive,
            verbose: cli.verbose,
            proxies,
        })
    }
}

/// Parses a `-r` retry window: "min" or "min,max". A bare "min" yields a
/// fixed, non-randomized retry of `min` seconds (stop == start).
fn parse_retry(raw: &str) -> Result<(u64, u64)> {
    let mut parts = raw.splitn(2, ',');
    let start = parts
        .next()
        .ok_or_else(|| BrokerError::Protocol(format!("bad retry window: {raw}")))?
        .trim()
        .parse::<u64>()
        .map_err(|_| BrokerError::Protocol(format!("bad retry window: {raw}")))?;
    let stop = match parts.next() {
        Some(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| BrokerError::Protocol(format!("bad retry window: {raw}")))?,
        None => start,
    };
    Ok((start, stop))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_window_pair() {
        assert_eq!(parse_retry("10,30").unwrap(), (10, 30));
    }

    #[test]
    fn parses_bare_retry_as_fixed() {
        assert_eq!(parse_retry("5").unwrap(), (5, 5));
    }

    #[test]
    fn rejects_garbage_retry() {
        assert!(parse_retry("nope").is_err());
    }

    #[test]
    fn parses_local_proxy_spec() {
        let spec = ProxySpec::parse_local("127.0.0.1:1080:example.com:80").unwrap();
        assert_eq!(spec.kind, ProxyKind::Local);
        assert_eq!(spec.remote.as_deref(), Some("example.com:80"));
    }

    #[test]
    fn parses_dynamic_proxy_spec() {
        let spec = ProxySpec::parse_dynamic("127.0.0.1:1080").unwrap();
        assert_eq!(spec.kind, ProxyKind::Dynamic);
        assert!(spec.remote.is_none());
    }
}
