//! http2 - completion-based HTTP/2 for event-loop applications.
//!
//! This crate implements the subset of HTTP/2 needed to carry DNS queries
//! over HTTPS: frame encoding and decoding, HPACK header compression, and
//! client/server session state machines with connection- and stream-level
//! flow control. It does not use async/await or an I/O runtime; a session
//! is a pure state machine that is fed bytes from the transport
//! ([`ServerSession::feed`] / [`ClientSession::feed`]), drained for events
//! ([`ServerSession::poll_events`]), and drained for output bytes
//! ([`ServerSession::pending_send`]).
//!
//! # Restrictions
//!
//! Header blocks are always emitted in a single HEADERS frame with
//! END_HEADERS set. CONTINUATION and PUSH_PROMISE frames from the peer are
//! treated as connection errors. String literals are encoded without
//! Huffman coding; Huffman-coded literals from the peer are rejected.

pub mod frame;
pub mod hpack;

mod client;
mod flow;
mod server;
mod settings;
mod stream;

pub use client::{ClientEvent, ClientSession};
pub use frame::{
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, ErrorCode, Frame, FrameDecoder, FrameEncoder, FrameError, StreamId,
};
pub use hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};
pub use server::{ServerEvent, ServerSession};
pub use settings::SessionSettings;
pub use stream::{Stream, StreamState};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for (server) or about to send (client) the preface.
    Preface,
    /// Preface handled; waiting for the peer's SETTINGS.
    Settings,
    /// Ready for request/response exchange.
    Open,
    /// GOAWAY seen or sent; existing streams drain, no new ones.
    Draining,
    /// Session is dead.
    Closed,
}

/// Session-level error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Frame-layer violation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// HPACK decoding failure.
    #[error("header compression error: {0}")]
    Hpack(#[from] HpackError),
    /// Peer violated the HTTP/2 protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
