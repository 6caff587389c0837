//! Error taxonomy for the broker.
//!
//! The broker distinguishes session-fatal failures (which unwind out of the
//! event loop and end the process) from connection-scoped failures (which
//! only destroy the offending tunnel). See `Broker::run` for how each variant
//! is handled at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Peer EOF on the transport. Not an error condition; ends the session cleanly.
    #[error("remote endpoint closed the connection")]
    Closed,

    /// A local syscall failed. Connection-scoped unless it occurs on the transport fd.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing, size-negotiation, or unknown-type violation. Always session-fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Bad SOCKS input on a single tunnel. Destroys only that tunnel.
    #[error("malformed socks request: {0}")]
    Malformed(String),

    /// Outbound tunnel connect() failed; reported to the peer via PROXY_DESTROY.
    #[error("connect failed: errno {0}")]
    ConnectFailed(i32),

    /// Allocation or fd-limit pressure on listener admission. Listener is skipped.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// TLS handshake or record-layer failure.
    #[error("tls error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
