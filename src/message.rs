//! Wire framing: a fixed 11-byte header followed by a variable payload.
//!
//! ```text
//! [ data_type:1 | header_type:2 | header_origin:2 | header_id:2 | header_errno:2 | data_len:2 | data[0..data_len] ]
//! ```
//! All multi-octet fields are big-endian. `data_len` is bounded by the
//! session's negotiated max payload; there is no resync on corruption — a
//! malformed header is a fatal protocol violation.

use crate::error::{BrokerError, Result};
use crate::transport::{remote_read, remote_write, Transport};

pub const HEADER_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Init = 0,
    Tty = 1,
    WinResize = 2,
    Proxy = 3,
    Connection = 4,
    Nop = 5,
    Error = 6,
}

impl DataType {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => DataType::Init,
            1 => DataType::Tty,
            2 => DataType::WinResize,
            3 => DataType::Proxy,
            4 => DataType::Connection,
            5 => DataType::Nop,
            6 => DataType::Error,
            other => return Err(BrokerError::Protocol(format!("unknown data_type {other}"))),
        })
    }
}

/// `header_type` values for `DataType::Proxy` frames.
pub mod proxy_ht {
    pub const CREATE: u16 = 0;
    pub const DESTROY: u16 = 1;
    pub const RESPONSE: u16 = 2;
}

/// `header_type` values for `DataType::Connection` frames.
pub mod connection_ht {
    pub const DATA: u16 = 0;
    pub const DORMANT: u16 = 1;
    pub const ACTIVE: u16 = 2;
}

#[derive(Debug, Clone)]
pub struct Message {
    pub data_type: DataType,
    pub header_type: u16,
    pub header_origin: u16,
    pub header_id: u16,
    pub header_errno: u16,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            header_type: 0,
            header_origin: 0,
            header_id: 0,
            header_errno: 0,
            data: Vec::new(),
        }
    }

    pub fn proxy_destroy(origin: u16, id: u16, errno: u16) -> Self {
        Self {
            header_type: proxy_ht::DESTROY,
            header_origin: origin,
            header_id: id,
            header_errno: errno,
            ..Self::new(DataType::Proxy)
        }
    }

    pub fn connection(header_type: u16, origin: u16, id: u16) -> Self {
        Self {
            header_type,
            header_origin: origin,
            header_id: id,
            ..Self::new(DataType::Connection)
        }
    }

    /// Serialize and send this message on `transport`.
    pub fn push(&self, transport: &mut dyn Transport) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.push(self.data_type as u8);
        buf.extend_from_slice(&self.header_type.to_be_bytes());
        buf.extend_from_slice(&self.header_origin.to_be_bytes());
        buf.extend_from_slice(&self.header_id.to_be_bytes());
        buf.extend_from_slice(&self.header_errno.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        remote_write(transport, &buf)
    }

    /// Read one complete frame from `transport`. `max_payload` is the
    /// session-negotiated bound; a `data_len` exceeding it is a protocol
    /// violation.
    pub fn pull(transport: &mut dyn Transport, max_payload: usize) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        remote_read(transport, &mut header)?;

        let data_type = DataType::from_u8(header[0])?;
        let header_type = u16::from_be_bytes([header[1], header[2]]);
        let header_origin = u16::from_be_bytes([header[3], header[4]]);
        let header_id = u16::from_be_bytes([header[5], header[6]]);
        let header_errno = u16::from_be_bytes([header[7], header[8]]);
        let data_len = u16::from_be_bytes([header[9], header[10]]) as usize;

        if data_len > max_payload {
            return Err(BrokerError::Protocol(format!(
                "data_len {data_len} exceeds negotiated max {max_payload}"
            )));
        }

        let mut data = vec![0u8; data_len];
        remote_read(transport, &mut data)?;

        Ok(Self {
            data_type,
            header_type,
            header_origin,
            header_id,
            header_errno,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::os::fd::RawFd;

    /// An in-memory transport for exercising push/pull without a real socket.
    struct MemTransport {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Transport for MemTransport {
        fn raw_fd(&self) -> RawFd {
            -1
        }
        fn try_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
        fn try_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.write(buf)
        }
    }

    #[test]
    fn round_trip_preserves_header_and_payload() {
        let msg = Message {
            data_type: DataType::Connection,
            header_type: connection_ht::DATA,
            header_origin: 1,
            header_id: 42,
            header_errno: 0,
            data: b"hello tunnel".to_vec(),
        };

        let mut sink = MemTransport {
            inbound: Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };
        msg.push(&mut sink).unwrap();

        let mut source = MemTransport {
            inbound: Cursor::new(sink.outbound),
            outbound: Vec::new(),
        };
        let pulled = Message::pull(&mut source, 4096).unwrap();

        assert_eq!(pulled.data_type, msg.data_type);
        assert_eq!(pulled.header_type, msg.header_type);
        assert_eq!(pulled.header_origin, msg.header_origin);
        assert_eq!(pulled.header_id, msg.header_id);
        assert_eq!(pulled.header_errno, msg.header_errno);
        assert_eq!(pulled.data, msg.data);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut header = vec![DataType::Tty as u8];
        header.extend_from_slice(&0u16.to_be_bytes()); // header_type
        header.extend_from_slice(&0u16.to_be_bytes()); // origin
        header.extend_from_slice(&0u16.to_be_bytes()); // id
        header.extend_from_slice(&0u16.to_be_bytes()); // errno
        header.extend_from_slice(&9000u16.to_be_bytes()); // data_len, way over max

        let mut source = MemTransport {
            inbound: Cursor::new(header),
            outbound: Vec::new(),
        };

        let err = Message::pull(&mut source, 512).unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
    }

    #[test]
    fn unknown_data_type_is_a_protocol_violation() {
        let mut header = vec![0xEEu8];
        header.extend_from_slice(&[0u8; 10]);

        let mut source = MemTransport {
            inbound: Cursor::new(header),
            outbound: Vec::new(),
        };

        let err = Message::pull(&mut source, 512).unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
    }
}
