//! HTTP/2 frame layer (RFC 9113 section 4).
//!
//! The decoder consumes bytes from a [`BytesMut`] and yields one parsed
//! [`Frame`] at a time; the encoder appends the wire form of a frame to an
//! output buffer. Frame types that the DoH transport never exchanges
//! (PUSH_PROMISE, CONTINUATION) are rejected at this layer, PRIORITY and
//! unrecognized types are surfaced as [`Frame::Unknown`] so the session can
//! ignore them.

use bytes::{Buf, Bytes, BytesMut};

/// Client connection preface (RFC 9113 section 3.4).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header in octets.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Default SETTINGS_INITIAL_WINDOW_SIZE.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Default SETTINGS_MAX_CONCURRENT_STREAMS advertised by the server side.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Frame type octets.
mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// Frame flag bits.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Known SETTINGS identifiers (RFC 9113 section 6.5.2).
pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Stream identifier; 31 bits, the high bit is reserved on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    /// The connection control stream (stream zero).
    pub const ZERO: StreamId = StreamId(0);

    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Client-initiated streams carry odd identifiers.
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }
}

/// HTTP/2 error codes (RFC 9113 section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Other(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Other(code) => code,
        }
    }
}

/// Frame-layer error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} octets exceeds the maximum frame size")]
    TooLarge(u32),
    #[error("malformed {0} frame")]
    Malformed(&'static str),
    #[error("{0} frame on unexpected stream")]
    WrongStream(&'static str),
    #[error("unsupported frame type {0:#x}")]
    Unsupported(u8),
}

/// A single SETTINGS parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: u16,
    pub value: u32,
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream: StreamId,
        end_stream: bool,
        data: Bytes,
        /// Octets the peer's flow-control window was charged for, including
        /// any padding stripped during decode.
        flow_len: u32,
    },
    Headers {
        stream: StreamId,
        end_stream: bool,
        end_headers: bool,
        block: Bytes,
    },
    RstStream {
        stream: StreamId,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<Setting>,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    /// PRIORITY and frame types this implementation does not recognize.
    Unknown {
        frame_type: u8,
        stream: StreamId,
    },
}

/// Streaming frame decoder.
///
/// Holds no partial state beyond the caller's input buffer: decode returns
/// `Ok(None)` until a complete frame is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Raise the acceptable frame size after a SETTINGS exchange.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Decode one frame from `buf`, consuming its bytes on success.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let frame_type = buf[3];
        let frame_flags = buf[4];
        let stream = StreamId::new(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]));

        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length));
        }
        if buf.len() < FRAME_HEADER_SIZE + length as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let mut payload = buf.split_to(length as usize);

        let frame = match frame_type {
            frame_type::DATA => {
                if stream.is_zero() {
                    return Err(FrameError::WrongStream("DATA"));
                }
                let flow_len = length;
                let data = strip_padding(&mut payload, frame_flags, "DATA")?;
                Frame::Data {
                    stream,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    data,
                    flow_len,
                }
            }
            frame_type::HEADERS => {
                if stream.is_zero() {
                    return Err(FrameError::WrongStream("HEADERS"));
                }
                let mut block = strip_padding(&mut payload, frame_flags, "HEADERS")?;
                if frame_flags & flags::PRIORITY != 0 {
                    // Exclusivity bit, 31-bit dependency and one weight octet.
                    if block.len() < 5 {
                        return Err(FrameError::Malformed("HEADERS"));
                    }
                    block.advance(5);
                }
                Frame::Headers {
                    stream,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    end_headers: frame_flags & flags::END_HEADERS != 0,
                    block,
                }
            }
            frame_type::RST_STREAM => {
                if stream.is_zero() || payload.len() != 4 {
                    return Err(FrameError::Malformed("RST_STREAM"));
                }
                Frame::RstStream {
                    stream,
                    code: ErrorCode::from_u32(payload.get_u32()),
                }
            }
            frame_type::SETTINGS => {
                if !stream.is_zero() {
                    return Err(FrameError::WrongStream("SETTINGS"));
                }
                let ack = frame_flags & flags::ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(FrameError::Malformed("SETTINGS"));
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::Malformed("SETTINGS"));
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    settings.push(Setting {
                        id: payload.get_u16(),
                        value: payload.get_u32(),
                    });
                }
                Frame::Settings { ack, settings }
            }
            frame_type::PING => {
                if !stream.is_zero() || payload.len() != 8 {
                    return Err(FrameError::Malformed("PING"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    ack: frame_flags & flags::ACK != 0,
                    payload: data,
                }
            }
            frame_type::GOAWAY => {
                if !stream.is_zero() || payload.len() < 8 {
                    return Err(FrameError::Malformed("GOAWAY"));
                }
                let last_stream = StreamId::new(payload.get_u32());
                let code = ErrorCode::from_u32(payload.get_u32());
                Frame::GoAway {
                    last_stream,
                    code,
                    debug: payload.freeze(),
                }
            }
            frame_type::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(FrameError::Malformed("WINDOW_UPDATE"));
                }
                let increment = payload.get_u32() & 0x7FFF_FFFF;
                if increment == 0 {
                    return Err(FrameError::Malformed("WINDOW_UPDATE"));
                }
                Frame::WindowUpdate { stream, increment }
            }
            frame_type::PUSH_PROMISE | frame_type::CONTINUATION => {
                return Err(FrameError::Unsupported(frame_type));
            }
            other => Frame::Unknown {
                frame_type: other,
                stream,
            },
        };

        Ok(Some(frame))
    }
}

/// Strip pad length and trailing padding if the PADDED flag is set.
fn strip_padding(
    payload: &mut BytesMut,
    frame_flags: u8,
    kind: &'static str,
) -> Result<Bytes, FrameError> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(payload.split().freeze());
    }
    if payload.is_empty() {
        return Err(FrameError::Malformed(kind));
    }
    let pad = payload.get_u8() as usize;
    if pad >= payload.len() + 1 {
        return Err(FrameError::Malformed(kind));
    }
    let data = payload.split_to(payload.len() - pad);
    Ok(data.freeze())
}

/// Frame encoder; appends wire bytes to the caller's buffer.
#[derive(Debug)]
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    fn header(buf: &mut BytesMut, length: usize, frame_type: u8, frame_flags: u8, stream: StreamId) {
        debug_assert!(length <= 0x00FF_FFFF);
        let len = (length as u32).to_be_bytes();
        buf.extend_from_slice(&[len[1], len[2], len[3], frame_type, frame_flags]);
        buf.extend_from_slice(&stream.value().to_be_bytes());
    }

    /// Encode a DATA frame. `data` must not exceed the max frame size;
    /// chunking to the peer's limit is the session's job.
    pub fn data(&self, buf: &mut BytesMut, stream: StreamId, data: &[u8], end_stream: bool) {
        debug_assert!(data.len() <= self.max_frame_size as usize);
        let f = if end_stream { flags::END_STREAM } else { 0 };
        Self::header(buf, data.len(), frame_type::DATA, f, stream);
        buf.extend_from_slice(data);
    }

    /// Encode a HEADERS frame carrying a complete header block.
    pub fn headers(&self, buf: &mut BytesMut, stream: StreamId, block: &[u8], end_stream: bool) {
        let mut f = flags::END_HEADERS;
        if end_stream {
            f |= flags::END_STREAM;
        }
        Self::header(buf, block.len(), frame_type::HEADERS, f, stream);
        buf.extend_from_slice(block);
    }

    pub fn rst_stream(&self, buf: &mut BytesMut, stream: StreamId, code: ErrorCode) {
        Self::header(buf, 4, frame_type::RST_STREAM, 0, stream);
        buf.extend_from_slice(&code.to_u32().to_be_bytes());
    }

    pub fn settings(&self, buf: &mut BytesMut, settings: &[Setting]) {
        Self::header(buf, settings.len() * 6, frame_type::SETTINGS, 0, StreamId::ZERO);
        for s in settings {
            buf.extend_from_slice(&s.id.to_be_bytes());
            buf.extend_from_slice(&s.value.to_be_bytes());
        }
    }

    pub fn settings_ack(&self, buf: &mut BytesMut) {
        Self::header(buf, 0, frame_type::SETTINGS, flags::ACK, StreamId::ZERO);
    }

    pub fn ping(&self, buf: &mut BytesMut, payload: [u8; 8], ack: bool) {
        let f = if ack { flags::ACK } else { 0 };
        Self::header(buf, 8, frame_type::PING, f, StreamId::ZERO);
        buf.extend_from_slice(&payload);
    }

    pub fn goaway(&self, buf: &mut BytesMut, last_stream: StreamId, code: ErrorCode, debug: &[u8]) {
        Self::header(buf, 8 + debug.len(), frame_type::GOAWAY, 0, StreamId::ZERO);
        buf.extend_from_slice(&last_stream.value().to_be_bytes());
        buf.extend_from_slice(&code.to_u32().to_be_bytes());
        buf.extend_from_slice(debug);
    }

    pub fn window_update(&self, buf: &mut BytesMut, stream: StreamId, increment: u32) {
        Self::header(buf, 4, frame_type::WINDOW_UPDATE, 0, stream);
        buf.extend_from_slice(&(increment & 0x7FFF_FFFF).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(buf: &mut BytesMut) -> Frame {
        let mut dec = FrameDecoder::new();
        let frame = dec.decode(buf).unwrap().unwrap();
        assert!(buf.is_empty());
        frame
    }

    #[test]
    fn data_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.data(&mut buf, StreamId::new(1), b"payload", true);

        match roundtrip(&mut buf) {
            Frame::Data {
                stream,
                end_stream,
                data,
                flow_len,
            } => {
                assert_eq!(stream.value(), 1);
                assert!(end_stream);
                assert_eq!(&data[..], b"payload");
                assert_eq!(flow_len, 7);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn data_padding_stripped() {
        // Hand-built padded DATA: pad length 3, body "ab", 3 zero pad octets.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x06, 0x00, 0x09, 0x00, 0x00, 0x00, 0x01, 0x03, b'a', b'b', 0, 0, 0,
        ]);

        match roundtrip(&mut buf) {
            Frame::Data { data, flow_len, .. } => {
                assert_eq!(&data[..], b"ab");
                assert_eq!(flow_len, 6);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn data_padding_overrun_rejected() {
        // Pad length claims more octets than the payload holds.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x02, 0x00, 0x09, 0x00, 0x00, 0x00, 0x01, 0x05, b'a']);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&mut buf).is_err());
    }

    #[test]
    fn headers_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.headers(&mut buf, StreamId::new(3), &[0x82, 0x86], false);

        match roundtrip(&mut buf) {
            Frame::Headers {
                stream,
                end_stream,
                end_headers,
                block,
            } => {
                assert_eq!(stream.value(), 3);
                assert!(!end_stream);
                assert!(end_headers);
                assert_eq!(&block[..], &[0x82, 0x86]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn headers_priority_fields_skipped() {
        // HEADERS with PRIORITY flag: 5 priority octets then one block octet.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x06, 0x01, 0x24, 0x00, 0x00, 0x00, 0x05, 0x80, 0x00, 0x00, 0x01, 0x10,
            0x82,
        ]);

        match roundtrip(&mut buf) {
            Frame::Headers { block, .. } => assert_eq!(&block[..], &[0x82]),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn settings_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.settings(
            &mut buf,
            &[
                Setting {
                    id: setting::MAX_CONCURRENT_STREAMS,
                    value: 100,
                },
                Setting {
                    id: setting::INITIAL_WINDOW_SIZE,
                    value: 65_535,
                },
            ],
        );

        match roundtrip(&mut buf) {
            Frame::Settings { ack, settings } => {
                assert!(!ack);
                assert_eq!(settings.len(), 2);
                assert_eq!(settings[0].id, setting::MAX_CONCURRENT_STREAMS);
                assert_eq!(settings[1].value, 65_535);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn settings_ack_with_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x06, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
            0x64,
        ]);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&mut buf).is_err());
    }

    #[test]
    fn ping_on_nonzero_stream_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x00, 0x00, 0x01, 1, 2, 3, 4, 5, 6, 7, 8,
        ]);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&mut buf).is_err());
    }

    #[test]
    fn ping_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.ping(&mut buf, [9, 8, 7, 6, 5, 4, 3, 2], false);

        match roundtrip(&mut buf) {
            Frame::Ping { ack, payload } => {
                assert!(!ack);
                assert_eq!(payload, [9, 8, 7, 6, 5, 4, 3, 2]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn goaway_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.goaway(&mut buf, StreamId::new(7), ErrorCode::EnhanceYourCalm, b"bye");

        match roundtrip(&mut buf) {
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => {
                assert_eq!(last_stream.value(), 7);
                assert_eq!(code, ErrorCode::EnhanceYourCalm);
                assert_eq!(&debug[..], b"bye");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn window_update_zero_increment_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&mut buf).is_err());
    }

    #[test]
    fn rst_stream_roundtrip() {
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.rst_stream(&mut buf, StreamId::new(5), ErrorCode::RefusedStream);

        match roundtrip(&mut buf) {
            Frame::RstStream { stream, code } => {
                assert_eq!(stream.value(), 5);
                assert_eq!(code, ErrorCode::RefusedStream);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let enc = FrameEncoder::new();
        let mut full = BytesMut::new();
        enc.ping(&mut full, [0; 8], false);

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..full.len() - 1]);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(dec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        // Claims a 1 MiB payload against the 16 KiB default limit.
        buf.extend_from_slice(&[0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);

        let mut dec = FrameDecoder::new();
        assert!(matches!(dec.decode(&mut buf), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn push_promise_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x04, 0x05, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
        ]);

        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.decode(&mut buf),
            Err(FrameError::Unsupported(0x5))
        ));
    }

    #[test]
    fn priority_surfaced_as_unknown() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            0x00, 0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x10,
        ]);

        let mut dec = FrameDecoder::new();
        match dec.decode(&mut buf).unwrap().unwrap() {
            Frame::Unknown { frame_type, stream } => {
                assert_eq!(frame_type, 0x2);
                assert_eq!(stream.value(), 3);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
