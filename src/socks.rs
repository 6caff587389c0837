//! Incremental SOCKS4/4a/5 parser.
//!
//! Operates on a growing scratch buffer owned by a `ConnectionNode`: each
//! call consumes as much of `buffer[ptr..]` as forms a complete structure and
//! advances `ptr`, leaving any pipelined trailing bytes (e.g. the first
//! bytes of application data that arrived packed behind the SOCKS request)
//! untouched for the caller to forward on.

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksOutcome {
    /// Not enough bytes yet; try again once more arrive.
    Incomplete,
    /// SOCKS5 greeting consumed; `auth_method` (0x00 no-auth, 0xFF none
    /// acceptable) has been selected and must be written back to the client.
    V5Auth { auth_method: u8 },
    /// A complete CONNECT request was parsed.
    Ready { ver: u8, cmd: u8, rhost_rport: String },
}

const SOCKS4: u8 = 0x04;
const SOCKS5: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// Parses as much as possible of `buf` starting from `ptr`. Returns the
/// outcome and the new `ptr` (bytes consumed from the front).
pub fn parse(buf: &[u8], ptr: usize) -> Result<(SocksOutcome, usize)> {
    let input = &buf[ptr..];
    if input.is_empty() {
        return Ok((SocksOutcome::Incomplete, ptr));
    }

    match input[0] {
        SOCKS4 => parse_socks4(input, ptr),
        SOCKS5 => parse_socks5(input, ptr),
        other => Err(BrokerError::Malformed(format!("unsupported SOCKS version {other:#x}"))),
    }
}

/// SOCKS4/4a CONNECT: `ver:1 cmd:1 port:2 ip:4 userid:nul [hostname:nul if 4a]`.
fn parse_socks4(input: &[u8], ptr: usize) -> Result<(SocksOutcome, usize)> {
    if input.len() < 9 {
        return Ok((SocksOutcome::Incomplete, ptr));
    }
    let cmd = input[1];
    if cmd != CMD_CONNECT {
        return Err(BrokerError::Malformed(format!("unsupported SOCKS4 cmd {cmd:#x}")));
    }
    let port = u16::from_be_bytes([input[2], input[3]]);
    let ip = [input[4], input[5], input[6], input[7]];

    let rest = &input[8..];
    let userid_end = match rest.iter().position(|&b| b == 0) {
        Some(p) => p,
        None => return Ok((SocksOutcome::Incomplete, ptr)),
    };

    let is_4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
    let mut consumed = 8 + userid_end + 1;

    let host = if is_4a {
        let after_userid = &rest[userid_end + 1..];
        let hostname_end = match after_userid.iter().position(|&b| b == 0) {
            Some(p) => p,
            None => return Ok((SocksOutcome::Incomplete, ptr)),
        };
        consumed += hostname_end + 1;
        String::from_utf8(after_userid[..hostname_end].to_vec())
            .map_err(|_| BrokerError::Malformed("non-utf8 SOCKS4a hostname".into()))?
    } else {
        format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])
    };

    Ok((
        SocksOutcome::Ready {
            ver: SOCKS4,
            cmd,
            rhost_rport: format!("{host}:{port}"),
        },
        ptr + consumed,
    ))
}

/// SOCKS5 is two frames: a greeting (`ver:1 nmethods:1 methods[nmethods]`)
/// then, after we reply, a request (`ver:1 cmd:1 rsv:1 atyp:1 addr port:2`).
/// Both may arrive in the same read, so this function handles whichever one
/// `ptr` is currently positioned at by inspecting the second octet's shape:
/// callers track which phase a node is in and do not re-enter the greeting
/// parse after it has succeeded once.
fn parse_socks5(input: &[u8], ptr: usize) -> Result<(SocksOutcome, usize)> {
    if input.len() < 2 {
        return Ok((SocksOutcome::Incomplete, ptr));
    }
    let nmethods = input[1] as usize;
    if input.len() < 2 + nmethods {
        return Ok((SocksOutcome::Incomplete, ptr));
    }
    let methods = &input[2..2 + nmethods];
    let auth_method = if methods.contains(&0x00) { 0x00 } else { 0xFF };

    Ok((SocksOutcome::V5Auth { auth_method }, ptr + 2 + nmethods))
}

/// Parses a SOCKS5 CONNECT request, called once the greeting has been
/// acknowledged. `ver:1 cmd:1 rsv:1 atyp:1 addr port:2`.
pub fn parse_socks5_request(buf: &[u8], ptr: usize) -> Result<(SocksOutcome, usize)> {
    let input = &buf[ptr..];
    if input.len() < 4 {
        return Ok((SocksOutcome::Incomplete, ptr));
    }
    let ver = input[0];
    if ver != SOCKS5 {
        return Err(BrokerError::Malformed(format!("expected SOCKS5 request, got ver {ver:#x}")));
    }
    let cmd = input[1];
    if cmd != CMD_CONNECT {
        return Err(BrokerError::Malformed(format!("unsupported SOCKS5 cmd {cmd:#x}")));
    }
    let atyp = input[3];

    let (host, addr_len) = match atyp {
        0x01 => {
            if input.len() < 4 + 4 {
                return Ok((SocksOutcome::Incomplete, ptr));
            }
            let ip = &input[4..8];
            (format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]), 4)
        }
        0x03 => {
            if input.len() < 5 {
                return Ok((SocksOutcome::Incomplete, ptr));
            }
            let len = input[4] as usize;
            if input.len() < 5 + len {
                return Ok((SocksOutcome::Incomplete, ptr));
            }
            let name = String::from_utf8(input[5..5 + len].to_vec())
                .map_err(|_| BrokerError::Malformed("non-utf8 SOCKS5 hostname".into()))?;
            (name, 1 + len)
        }
        0x04 => {
            return Err(BrokerError::Malformed("IPv6 SOCKS5 requests are unsupported".into()));
        }
        other => return Err(BrokerError::Malformed(format!("unsupported SOCKS5 atyp {other:#x}"))),
    };

    let port_off = 4 + addr_len;
    if input.len() < port_off + 2 {
        return Ok((SocksOutcome::Incomplete, ptr));
    }
    let port = u16::from_be_bytes([input[port_off], input[port_off + 1]]);

    Ok((
        SocksOutcome::Ready {
            ver: SOCKS5,
            cmd,
            rhost_rport: format!("{host}:{port}"),
        },
        ptr + port_off + 2,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4_ip_connect() {
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34];
        req.push(0); // empty userid
        let (outcome, consumed) = parse(&req, 0).unwrap();
        assert_eq!(consumed, req.len());
        match outcome {
            SocksOutcome::Ready { ver, cmd, rhost_rport } => {
                assert_eq!(ver, SOCKS4);
                assert_eq!(cmd, CMD_CONNECT);
                assert_eq!(rhost_rport, "93.184.216.34:80");
            }
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn socks4a_hostname_connect() {
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        req.push(0); // empty userid
        req.extend_from_slice(b"example.com\0");
        let (outcome, consumed) = parse(&req, 0).unwrap();
        assert_eq!(consumed, req.len());
        match outcome {
            SocksOutcome::Ready { rhost_rport, .. } => {
                assert_eq!(rhost_rport, "example.com:80");
            }
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn socks4_incomplete_waits_for_more() {
        let req = vec![0x04, 0x01, 0x00];
        let (outcome, consumed) = parse(&req, 0).unwrap();
        assert_eq!(outcome, SocksOutcome::Incomplete);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn socks5_greeting_selects_noauth() {
        let greeting = vec![0x05, 0x02, 0x00, 0x02];
        let (outcome, consumed) = parse(&greeting, 0).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(outcome, SocksOutcome::V5Auth { auth_method: 0x00 });
    }

    #[test]
    fn socks5_greeting_rejects_when_no_method_matches() {
        let greeting = vec![0x05, 0x01, 0x02];
        let (outcome, _) = parse(&greeting, 0).unwrap();
        assert_eq!(outcome, SocksOutcome::V5Auth { auth_method: 0xFF });
    }

    #[test]
    fn socks5_request_with_domain_name() {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        let (outcome, consumed) = parse_socks5_request(&req, 0).unwrap();
        assert_eq!(consumed, req.len());
        match outcome {
            SocksOutcome::Ready { rhost_rport, .. } => assert_eq!(rhost_rport, "example.com:80"),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn preserves_pipelined_trailing_bytes() {
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34, 0];
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let (outcome, consumed) = parse(&buf, 0).unwrap();
        assert!(matches!(outcome, SocksOutcome::Ready { .. }));
        assert_eq!(&buf[consumed..], b"GET / HTTP/1.1\r\n");
    }
}
