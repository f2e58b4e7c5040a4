//! HPACK header compression (RFC 7541).
//!
//! String literals are always emitted in plain form; Huffman-coded
//! literals from the peer are rejected with [`HpackError::Huffman`].

mod codec;
mod table;

pub use codec::{HpackDecoder, HpackEncoder};
pub use table::HeaderField;

/// Default SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// HPACK decoding error.
#[derive(Debug, thiserror::Error)]
pub enum HpackError {
    #[error("truncated header block")]
    Incomplete,
    #[error("integer overflow in prefixed integer")]
    IntegerOverflow,
    #[error("Huffman-coded string literal is not supported")]
    Huffman,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("dynamic table size update above the negotiated maximum")]
    TableSizeUpdate,
}
