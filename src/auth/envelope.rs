//! Unauthenticated Message Envelope
//!
//! Wraps a raw inbound packet that arrived before its connection finished the
//! handshake. Only the handshake protocol consumes envelopes, so nothing inside
//! one can be confused with verified application traffic.

use std::net::SocketAddr;

use super::connection::ConnectionState;
use crate::SocketId;

/// Inbound pre-authentication packet.
#[derive(Debug)]
pub struct UnauthenticatedMessage<'c> {
    buffer: Vec<u8>,
    len: usize,
    socket: SocketId,
    remote: SocketAddr,
    connection: &'c ConnectionState,
}

impl<'c> UnauthenticatedMessage<'c> {
    /// Wrap `buffer`, of which the first `len` bytes were received.
    pub fn new(
        buffer: Vec<u8>,
        len: usize,
        socket: SocketId,
        remote: SocketAddr,
        connection: &'c ConnectionState,
    ) -> Self {
        Self {
            buffer,
            len,
            socket,
            remote,
            connection,
        }
    }

    /// Wrap a buffer holding exactly one packet.
    pub fn from_packet(
        packet: &[u8],
        socket: SocketId,
        remote: SocketAddr,
        connection: &'c ConnectionState,
    ) -> Self {
        Self::new(packet.to_vec(), packet.len(), socket, remote, connection)
    }

    /// Received bytes, or `None` when the declared length exceeds the buffer.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.buffer.get(..self.len)
    }

    /// Declared length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the declared length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Originating socket.
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Remote address the packet came from.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// State of the connection the packet belongs to.
    pub fn connection(&self) -> &'c ConnectionState {
        self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "192.168.1.5:9000".parse().unwrap()
    }

    #[test]
    fn test_accessors() {
        let state = ConnectionState::new();
        let msg = UnauthenticatedMessage::new(vec![1, 2, 3, 0, 0], 3, 11, remote(), &state);

        assert_eq!(msg.bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(msg.len(), 3);
        assert!(!msg.is_empty());
        assert_eq!(msg.socket(), 11);
        assert_eq!(msg.remote(), remote());
        assert!(std::ptr::eq(msg.connection(), &state));
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let state = ConnectionState::new();
        let msg = UnauthenticatedMessage::new(vec![1, 2], 10, 1, remote(), &state);
        assert_eq!(msg.bytes(), None);
    }

    #[test]
    fn test_from_packet() {
        let state = ConnectionState::new();
        let msg = UnauthenticatedMessage::from_packet(b"abc", 2, remote(), &state);
        assert_eq!(msg.bytes(), Some(&b"abc"[..]));
        assert_eq!(msg.len(), 3);
    }
}
