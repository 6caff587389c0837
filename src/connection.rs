//! ConnectionTable: the set of live tunneled streams, keyed by `(origin, id)`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::fd::RawFd;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConState {
    SocksNoHandshake,
    SocksV5Auth,
    Ready,
    EInProgress,
    Active,
    Dormant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub origin: u16,
    pub id: u16,
}

/// One tunneled TCP stream. Exclusively owned and mutated by the broker.
pub struct ConnectionNode {
    pub key: ConnKey,
    pub fd: RawFd,
    pub rhost_rport: String,
    pub state: ConState,

    /// SOCKS scratch buffer: bytes read so far, with `ptr` marking how much
    /// has been consumed by the parser.
    pub scratch: Vec<u8>,
    pub scratch_ptr: usize,
    pub ver: u8,
    pub cmd: u8,

    /// Partial-write FIFO: whole frames' worth of bytes still to be written
    /// to `fd`, in order. The front element may be partially written.
    pub write_queue: VecDeque<Vec<u8>>,

    /// True once this side has sent `CONNECTION/DORMANT` for this stream and
    /// is waiting on `CONNECTION/ACTIVE` before resuming sends.
    pub peer_dormant: bool,

    /// Which side originated the accept: true if this node was created from
    /// a local listener accept (we hold the client), false if it came from
    /// an inbound `PROXY_CREATE` (we hold the outbound connect).
    pub accepted_locally: bool,
}

impl ConnectionNode {
    pub fn new(key: ConnKey, fd: RawFd, state: ConState, accepted_locally: bool) -> Self {
        Self {
            key,
            fd,
            rhost_rport: String::new(),
            state,
            scratch: Vec::new(),
            scratch_ptr: 0,
            ver: 0,
            cmd: 0,
            write_queue: VecDeque::new(),
            peer_dormant: false,
            accepted_locally,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.write_queue.len()
    }

    pub fn enqueue_write(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.write_queue.push_back(data);
        }
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    nodes: HashMap<ConnKey, ConnectionNode>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node`, destroying and replacing any existing node with the
    /// same key (inbound `PROXY_CREATE` colliding with a stale id).
    pub fn insert(&mut self, node: ConnectionNode) {
        if let Some(old) = self.nodes.insert(node.key, node) {
            close_fd(old.fd);
        }
    }

    pub fn find(&self, key: ConnKey) -> Option<&ConnectionNode> {
        self.nodes.get(&key)
    }

    pub fn find_mut(&mut self, key: ConnKey) -> Option<&mut ConnectionNode> {
        self.nodes.get_mut(&key)
    }

    /// Closes the fd, drops the write queue and scratch buffers, and unlinks
    /// the node. No-op if the key is already gone.
    pub fn delete(&mut self, key: ConnKey) {
        if let Some(node) = self.nodes.remove(&key) {
            close_fd(node.fd);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionNode> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionNode> {
        self.nodes.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = ConnKey> + '_ {
        self.nodes.keys().copied()
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Builds the `CONNECTION/DATA` frame carrying `payload` for `key`.
pub fn data_frame(key: ConnKey, payload: Vec<u8>) -> Message {
    let mut msg = Message::connection(crate::message::connection_ht::DATA, key.origin, key.id);
    msg.data = payload;
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(o: u16, id: u16) -> ConnKey {
        ConnKey { origin: o, id }
    }

    #[test]
    fn insert_and_find_round_trips() {
        let mut table = ConnectionTable::new();
        table.insert(ConnectionNode::new(key(1, 1), -1, ConState::Active, true));
        assert!(table.find(key(1, 1)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn colliding_insert_replaces_and_closes_old() {
        let mut table = ConnectionTable::new();
        table.insert(ConnectionNode::new(key(1, 1), -1, ConState::Ready, true));
        table.insert(ConnectionNode::new(key(1, 1), -1, ConState::Active, true));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(key(1, 1)).unwrap().state, ConState::Active);
    }

    #[test]
    fn delete_removes_node() {
        let mut table = ConnectionTable::new();
        table.insert(ConnectionNode::new(key(2, 5), -1, ConState::Active, false));
        table.delete(key(2, 5));
        assert!(table.find(key(2, 5)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn delete_of_missing_key_is_a_no_op() {
        let mut table = ConnectionTable::new();
        table.delete(key(9, 9));
        assert!(table.is_empty());
    }

    #[test]
    fn write_queue_tracks_depth() {
        let mut node = ConnectionNode::new(key(1, 1), -1, ConState::Active, true);
        for _ in 0..3 {
            node.enqueue_write(vec![1, 2, 3]);
        }
        assert_eq!(node.queue_depth(), 3);
    }
}
