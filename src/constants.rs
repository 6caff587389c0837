//! Wire and session constants.

/// Lower bound on the negotiated max payload size. Has to be large enough to
/// carry a full SOCKS4/5 request in a single frame.
pub const MINIMUM_MESSAGE_SIZE: usize = 512;

/// Per-stream outbound queue depth that triggers a `CONNECTION/DORMANT`
/// backpressure notice to the peer.
pub const MESSAGE_DEPTH_MAX: usize = 64;

/// Environment variables forwarded from controller to target at session start.
pub const DEFAULT_ENV: &[&str] = &["TERM", "LANG", "LC_ALL"];

pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_RC_FILE: &str = "~/.wyrmshellrc";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY: &str = "10,30";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:4444";

/// `header_origin` tags: which endpoint allocated a given `(origin, id)` key.
pub const ORIGIN_CONTROLLER: u16 = 0;
pub const ORIGIN_TARGET: u16 = 1;
