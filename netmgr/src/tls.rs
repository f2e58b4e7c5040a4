//! TLS wrapper layer.
//!
//! A TLS socket is a state machine layered on a TCP carrier. The rustls
//! connection plays the role of the record layer; the `incoming` buffer
//! carries ciphertext from the carrier into rustls and [`TlsLayer::drive`]
//! moves ciphertext the other way into the carrier's write buffer. The
//! drive loop is run whenever either side may have work: carrier bytes
//! arrived, a plaintext send was queued, or the carrier drained.
//!
//! Plaintext sends are queued FIFO and completed in order; a send callback
//! fires once its ciphertext has been handed to the carrier, not when the
//! peer acknowledges it.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::errors::{NmError, NmResult};
use crate::event::{AcceptCb, ConnectCb, SendCb};
use crate::metrics::TLS_HANDSHAKES;
use crate::socket::{Handle, Socket};

/// Largest plaintext region handed to a consumer in one callback.
const MAX_PLAINTEXT_CHUNK: usize = 64 * 1024;

/// TLS socket states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsState {
    Init,
    Handshake,
    Io,
    Closing,
    Closed,
    Error,
}

/// Consumer callback fired exactly once at handshake completion.
pub(crate) enum TlsReadyCb {
    Accept(AcceptCb),
    Connect(ConnectCb),
    /// Overlay protocols (DoH) react to readiness themselves.
    None,
}

struct TlsSend {
    data: Bytes,
    offset: usize,
    cb: Option<SendCb>,
    handle: Option<Handle>,
}

/// Outcome of one drive pass.
#[derive(Default)]
pub(crate) struct TlsDrive {
    /// Handshake completed during this pass.
    pub(crate) newly_ready: bool,
    /// Fatal failure; the carrier must be closed.
    pub(crate) error: Option<NmError>,
}

/// Per-connection TLS state machine.
pub(crate) struct TlsLayer {
    conn: rustls::Connection,
    state: TlsState,
    /// The TLS overlay socket identity.
    sock: Arc<Socket>,
    /// Anchor on the TCP carrier; present while state is Init/Handshake/Io.
    outer: Option<Handle>,
    /// Ciphertext from the carrier, not yet consumed by rustls.
    incoming: BytesMut,
    /// Decrypted bytes awaiting the consumer.
    plaintext: BytesMut,
    sendq: VecDeque<TlsSend>,
    ready_cb: Option<TlsReadyCb>,
    /// ALPN protocols the handshake must negotiate one of, if any.
    required_alpn: Vec<Vec<u8>>,
}

impl TlsLayer {
    pub(crate) fn server(
        config: Arc<rustls::ServerConfig>,
        sock: Arc<Socket>,
        carrier: &Arc<Socket>,
        ready_cb: TlsReadyCb,
    ) -> NmResult<Box<TlsLayer>> {
        let required_alpn = config.alpn_protocols.clone();
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| NmError::from_tls(&e))?;
        Ok(Box::new(TlsLayer {
            conn: rustls::Connection::Server(conn),
            state: TlsState::Init,
            sock,
            outer: Some(Handle::new(carrier)),
            incoming: BytesMut::with_capacity(16 * 1024),
            plaintext: BytesMut::with_capacity(16 * 1024),
            sendq: VecDeque::new(),
            ready_cb: Some(ready_cb),
            required_alpn,
        }))
    }

    pub(crate) fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        sock: Arc<Socket>,
        carrier: &Arc<Socket>,
        ready_cb: TlsReadyCb,
    ) -> NmResult<Box<TlsLayer>> {
        let required_alpn = config.alpn_protocols.clone();
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| NmError::from_tls(&e))?;
        Ok(Box::new(TlsLayer {
            conn: rustls::Connection::Client(conn),
            state: TlsState::Init,
            sock,
            outer: Some(Handle::new(carrier)),
            incoming: BytesMut::with_capacity(16 * 1024),
            plaintext: BytesMut::with_capacity(16 * 1024),
            sendq: VecDeque::new(),
            ready_cb: Some(ready_cb),
            required_alpn,
        }))
    }

    pub(crate) fn overlay_socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    pub(crate) fn state(&self) -> TlsState {
        self.state
    }

    /// Take the once-only readiness callback.
    pub(crate) fn take_ready_cb(&mut self) -> Option<TlsReadyCb> {
        self.ready_cb.take()
    }

    /// Buffer ciphertext received on the carrier.
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Queue a plaintext send. FIFO-ordered; at most the queue head is in
    /// flight against the record layer at any time.
    pub(crate) fn queue_send(&mut self, data: Bytes, cb: Option<SendCb>, handle: Option<Handle>) {
        self.sendq.push_back(TlsSend {
            data,
            offset: 0,
            cb,
            handle,
        });
    }

    /// Decrypted bytes waiting for the consumer, in bounded chunks.
    pub(crate) fn take_plaintext_chunk(&mut self) -> Option<Bytes> {
        if self.plaintext.is_empty() {
            return None;
        }
        let n = self.plaintext.len().min(MAX_PLAINTEXT_CHUNK);
        Some(self.plaintext.split_to(n).freeze())
    }

    /// Advance the state machine; ciphertext for the carrier is appended
    /// to `out`.
    pub(crate) fn drive(&mut self, out: &mut BytesMut) -> TlsDrive {
        let mut result = TlsDrive::default();
        if matches!(self.state, TlsState::Closed | TlsState::Error) {
            return result;
        }
        if self.state == TlsState::Init {
            self.state = TlsState::Handshake;
        }

        // Ciphertext in.
        while !self.incoming.is_empty() {
            let mut cursor = std::io::Cursor::new(&self.incoming[..]);
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => {
                    self.incoming.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    result.error = Some(self.fail(NmError::from_io(&e)));
                    return result;
                }
            }

            let io_state = match self.conn.process_new_packets() {
                Ok(s) => s,
                Err(e) => {
                    result.error = Some(self.fail(NmError::from_tls(&e)));
                    return result;
                }
            };

            // Plaintext out of the record layer.
            let mut to_read = io_state.plaintext_bytes_to_read();
            let mut chunk = [0u8; 16 * 1024];
            while to_read > 0 {
                match self.conn.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.plaintext.extend_from_slice(&chunk[..n]);
                        to_read = to_read.saturating_sub(n);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        result.error = Some(self.fail(NmError::from_io(&e)));
                        return result;
                    }
                }
            }
        }

        // Handshake completion, checked after I/O has advanced the session.
        if self.state == TlsState::Handshake && !self.conn.is_handshaking() {
            debug_assert!(self.outer.is_some(), "handshake without a carrier anchor");
            if !self.required_alpn.is_empty() {
                let negotiated = self.conn.alpn_protocol();
                let ok = negotiated
                    .map(|p| self.required_alpn.iter().any(|want| want == p))
                    .unwrap_or(false);
                if !ok {
                    result.error = Some(self.fail(alpn_error(&self.required_alpn)));
                    return result;
                }
            }
            self.state = TlsState::Io;
            TLS_HANDSHAKES.increment();
            result.newly_ready = true;
        }

        // Plaintext send queue, head-of-line.
        let mut completed: Vec<(Option<SendCb>, Option<Handle>)> = Vec::new();
        if self.state == TlsState::Io {
            while let Some(head) = self.sendq.front_mut() {
                match self.conn.writer().write(&head.data[head.offset..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        head.offset += n;
                        if head.offset == head.data.len() {
                            let done = self.sendq.pop_front().unwrap();
                            completed.push((done.cb, done.handle));
                        } else {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        result.error = Some(self.fail(NmError::from_io(&e)));
                        return result;
                    }
                }
            }
        }

        // Ciphertext out to the carrier.
        if self.conn.wants_write() {
            let mut records = Vec::with_capacity(4096);
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut records) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        result.error = Some(self.fail(NmError::from_io(&e)));
                        return result;
                    }
                }
            }
            out.extend_from_slice(&records);
        }

        // Completions fire only after their ciphertext reached the carrier
        // buffer above.
        for (cb, handle) in completed {
            if let (Some(cb), Some(handle)) = (cb, handle) {
                cb(&handle, Ok(()));
            }
        }

        result
    }

    /// Transition to Error, shedding the carrier anchor and all queued
    /// work. Returns the error for the caller to propagate to dependents.
    pub(crate) fn fail(&mut self, err: NmError) -> NmError {
        if self.state == TlsState::Closed {
            return err;
        }
        self.state = TlsState::Error;
        self.outer = None;
        self.fail_queue(&err);
        err
    }

    /// Graceful close: emit close_notify ciphertext into `out`, then drop
    /// the carrier anchor. Idempotent.
    pub(crate) fn close(&mut self, out: &mut BytesMut) {
        if matches!(self.state, TlsState::Closed | TlsState::Error) {
            return;
        }
        self.state = TlsState::Closing;
        self.conn.send_close_notify();
        let mut records = Vec::with_capacity(512);
        while self.conn.wants_write() {
            if !matches!(self.conn.write_tls(&mut records), Ok(1..)) {
                break;
            }
        }
        out.extend_from_slice(&records);
        self.state = TlsState::Closed;
        self.outer = None;
        self.fail_queue(&NmError::Canceled);
    }

    /// A failed element fails the rest of the queue with the same error.
    fn fail_queue(&mut self, err: &NmError) {
        while let Some(entry) = self.sendq.pop_front() {
            if let (Some(cb), Some(handle)) = (entry.cb, entry.handle) {
                cb(&handle, Err(err.clone()));
            }
        }
    }
}

/// Map an ALPN mismatch to the protocol-specific error kind.
fn alpn_error(required: &[Vec<u8>]) -> NmError {
    if required.iter().any(|p| p.as_slice() == b"h2") {
        NmError::Http2Alpn
    } else {
        NmError::DotAlpn
    }
}

/// Build a server-side TLS context from a certificate chain and key.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> NmResult<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NmError::from_tls(&e))?;
    Ok(Arc::new(config))
}

/// Server context with `h2` ALPN for DoH listeners.
pub fn server_config_h2(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> NmResult<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NmError::from_tls(&e))?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Client context trusting the platform webpki roots.
pub fn client_config() -> Arc<rustls::ClientConfig> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Client context with `h2` ALPN for DoH.
pub fn client_config_h2() -> Arc<rustls::ClientConfig> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

/// Add `h2` ALPN to a caller-built client context.
pub fn with_h2_alpn(config: &rustls::ClientConfig) -> Arc<rustls::ClientConfig> {
    let mut config = config.clone();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_has_no_alpn() {
        let config = client_config();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn client_config_h2_sets_alpn() {
        let config = client_config_h2();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn alpn_error_kinds() {
        assert_eq!(alpn_error(&[b"h2".to_vec()]), NmError::Http2Alpn);
        assert_eq!(alpn_error(&[b"dot".to_vec()]), NmError::DotAlpn);
    }
}
