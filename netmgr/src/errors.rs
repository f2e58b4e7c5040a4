//! The transport error taxonomy.

use std::io;

/// Result alias used across the crate.
pub type NmResult<T> = Result<T, NmError>;

/// Errors surfaced to transport consumers.
///
/// The policy is uniform: errors local to one stream fail only that
/// stream's callbacks; carrier-fatal errors fail every dependent stream
/// and close the carrier. A failed handshake fails the consumer's
/// connect/accept callback exactly once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NmError {
    /// Shutdown, cancel_read, or a closing listener ended the operation.
    #[error("operation canceled")]
    Canceled,
    /// A connect or read timer fired and was not deferred.
    #[error("operation timed out")]
    TimedOut,
    /// Accept failed because the quota is exhausted.
    #[error("quota exhausted")]
    Quota,
    /// Accept succeeded but the quota soft threshold was crossed.
    #[error("quota soft limit reached")]
    SoftQuota,
    /// The peer closed the stream.
    #[error("end of stream")]
    Eof,
    /// The transport was reset.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Bind failed even after the reuse-address/reuse-port fallback.
    #[error("address in use")]
    AddrInUse,
    /// Bind failed even after the freebind fallback.
    #[error("address not available")]
    AddrNotAvail,
    /// The operation needs a carrier the socket does not have.
    #[error("socket is not connected")]
    NotConnected,
    /// Handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(String),
    /// The peer certificate was rejected.
    #[error("peer certificate rejected")]
    TlsBadPeerCert,
    /// ALPN did not negotiate the DoT protocol.
    #[error("ALPN negotiation did not select dot")]
    DotAlpn,
    /// ALPN did not negotiate h2.
    #[error("ALPN negotiation did not select h2")]
    Http2Alpn,
    /// HTTP/2 framing or content-type violation.
    #[error("protocol violation")]
    InvalidProto,
    /// Anything the taxonomy does not classify.
    #[error("unclassified failure")]
    Failure,
}

impl NmError {
    /// Classify an I/O error from the socket layer.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => NmError::ConnectionReset,
            io::ErrorKind::UnexpectedEof => NmError::Eof,
            io::ErrorKind::AddrInUse => NmError::AddrInUse,
            io::ErrorKind::AddrNotAvailable => NmError::AddrNotAvail,
            io::ErrorKind::NotConnected => NmError::NotConnected,
            io::ErrorKind::TimedOut => NmError::TimedOut,
            _ => NmError::Failure,
        }
    }

    /// Classify a TLS-layer failure.
    pub fn from_tls(err: &rustls::Error) -> Self {
        match err {
            rustls::Error::InvalidCertificate(_) => NmError::TlsBadPeerCert,
            rustls::Error::NoApplicationProtocol => NmError::Http2Alpn,
            other => NmError::Tls(other.to_string()),
        }
    }
}
