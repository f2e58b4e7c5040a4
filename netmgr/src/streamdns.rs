//! DNS stream framing: two-octet length-prefixed messages over a TCP or
//! TLS connected socket. The framer accumulates carrier bytes and yields
//! one complete message at a time; sends get the prefix prepended.

use bytes::{Buf, Bytes, BytesMut};

/// Reassembles length-prefixed DNS messages from a byte stream.
#[derive(Debug, Default)]
pub(crate) struct DnsFramer {
    buf: BytesMut,
}

impl DnsFramer {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if one is buffered. A zero-length
    /// frame yields an empty message.
    pub(crate) fn next_message(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }
}

/// Prefix `data` with its length. Fails for messages above u16::MAX.
pub(crate) fn frame_message(data: &[u8]) -> Option<Bytes> {
    if data.len() > u16::MAX as usize {
        return None;
    }
    let mut framed = BytesMut::with_capacity(2 + data.len());
    framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
    framed.extend_from_slice(data);
    Some(framed.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_message() {
        let mut framer = DnsFramer::new();
        framer.feed(&[0x00, 0x03, b'a', b'b', b'c']);
        assert_eq!(framer.next_message().unwrap(), Bytes::from_static(b"abc"));
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn message_split_across_feeds() {
        let mut framer = DnsFramer::new();
        framer.feed(&[0x00]);
        assert!(framer.next_message().is_none());
        framer.feed(&[0x04, b'w', b'x']);
        assert!(framer.next_message().is_none());
        framer.feed(&[b'y', b'z']);
        assert_eq!(framer.next_message().unwrap(), Bytes::from_static(b"wxyz"));
    }

    #[test]
    fn back_to_back_messages() {
        let mut framer = DnsFramer::new();
        framer.feed(&[0x00, 0x01, b'a', 0x00, 0x02, b'b', b'c']);
        assert_eq!(framer.next_message().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(framer.next_message().unwrap(), Bytes::from_static(b"bc"));
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn zero_length_frame_is_empty_message() {
        let mut framer = DnsFramer::new();
        framer.feed(&[0x00, 0x00]);
        let msg = framer.next_message().unwrap();
        assert!(msg.is_empty());
    }

    #[test]
    fn frame_roundtrip() {
        let framed = frame_message(b"hello").unwrap();
        assert_eq!(&framed[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

        let mut framer = DnsFramer::new();
        framer.feed(&framed);
        assert_eq!(framer.next_message().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn oversized_message_rejected() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(frame_message(&big).is_none());
        assert!(frame_message(&big[..u16::MAX as usize]).is_some());
    }
}
