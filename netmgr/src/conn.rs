//! Worker-local state for one TCP connection and the layers above it.
//!
//! The carrier is always a TCP stream; `Transport` optionally wraps it in
//! TLS, and `Proto` decides what the decrypted byte stream means: a raw
//! stream for the consumer, length-prefixed DNS messages, or an HTTP/2
//! DoH session. Overlay sockets (TLS, HTTP) share this state and route to
//! it through the worker's id table.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use crate::errors::NmError;
use crate::event::{AcceptSetup, ConnSetup, RecvCb, SendCb, SharedRecvCb};
use crate::http::{H2ClientConn, H2ServerConn};
use crate::manager::MgrShared;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, READ_TIMEOUTS};
use crate::quota::QuotaRef;
use crate::socket::{Handle, SockKind, Socket};
use crate::streamdns::{DnsFramer, frame_message};
use crate::tls::{TlsLayer, TlsReadyCb, TlsState};

/// Why a connection is being torn down.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    /// Orderly shutdown; outstanding work fails with `Canceled`.
    Graceful,
    /// Failure; outstanding work fails with this error.
    Error(NmError),
}

impl CloseReason {
    pub(crate) fn error(&self) -> NmError {
        match self {
            CloseReason::Graceful => NmError::Canceled,
            CloseReason::Error(e) => e.clone(),
        }
    }
}

/// Crypto layer on the carrier.
pub(crate) enum Transport {
    Plain,
    Tls(Box<TlsLayer>),
}

/// Meaning of the (decrypted) byte stream.
pub(crate) enum Proto {
    /// Raw stream delivered to a consumer read callback.
    Stream { recv_cb: Option<RecvCb> },
    /// Two-octet length-prefixed DNS messages.
    StreamDns {
        recv_cb: SharedRecvCb,
        framer: DnsFramer,
    },
    H2Server(Box<H2ServerConn>),
    H2Client(Box<H2ClientConn>),
}

/// Completion accounting for bytes sitting in the carrier write buffer.
struct OutAccount {
    remaining: usize,
    cb: Option<SendCb>,
    handle: Option<Handle>,
}

/// An outbound connection waiting for writability.
pub(crate) struct PendingConnect {
    pub(crate) setup: ConnSetup,
    pub(crate) deadline: Instant,
}

/// A drive pass either leaves the connection running or asks the worker
/// to tear it down; the worker applies the close after its borrow on the
/// connection ends.
pub(crate) type DriveOutcome = Option<CloseReason>;

pub(crate) struct ConnState {
    pub(crate) sock: Arc<Socket>,
    pub(crate) stream: mio::net::TcpStream,
    pub(crate) transport: Transport,
    pub(crate) proto: Proto,
    out: BytesMut,
    outq: VecDeque<OutAccount>,
    pub(crate) static_handle: Option<Handle>,
    pub(crate) quota: Option<QuotaRef>,
    pub(crate) connect: Option<PendingConnect>,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) read_timeout: Duration,
    keepalive_timeout: Duration,
    /// The consumer called `set_timeout`; the keepalive flag no longer
    /// selects the timeout.
    pub(crate) timeout_overridden: bool,
    pub(crate) reading: bool,
    eof_delivered: bool,
    /// Close once the write buffer drains (DoH client after delivery).
    finish_after_flush: bool,
}

impl ConnState {
    pub(crate) fn new(
        sock: Arc<Socket>,
        stream: mio::net::TcpStream,
        read_timeout: Duration,
        keepalive_timeout: Duration,
    ) -> Self {
        Self {
            sock,
            stream,
            transport: Transport::Plain,
            proto: Proto::Stream { recv_cb: None },
            out: BytesMut::with_capacity(16 * 1024),
            outq: VecDeque::new(),
            static_handle: None,
            quota: None,
            connect: None,
            read_deadline: None,
            read_timeout,
            keepalive_timeout,
            timeout_overridden: false,
            reading: false,
            eof_delivered: false,
            finish_after_flush: false,
        }
    }

    /// The read timeout in effect: keepalive sockets get the longer
    /// keepalive timeout unless the consumer overrode it.
    fn effective_read_timeout(&self) -> Duration {
        if !self.timeout_overridden && self.consumer_socket().is_keepalive() {
            self.keepalive_timeout
        } else {
            self.read_timeout
        }
    }

    /// The socket a consumer's handle refers to: the top overlay when one
    /// exists, the carrier otherwise.
    pub(crate) fn consumer_socket(&self) -> Arc<Socket> {
        match &self.proto {
            Proto::H2Server(h2) => Arc::clone(h2.overlay_socket()),
            Proto::H2Client(h2) => Arc::clone(h2.overlay_socket()),
            _ => match &self.transport {
                Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                Transport::Plain => Arc::clone(&self.sock),
            },
        }
    }

    fn consumer_handle(&self) -> Handle {
        Handle::new(&self.consumer_socket())
    }

    /// Every socket id this connection answers to.
    pub(crate) fn socket_ids(&self) -> Vec<crate::socket::SocketId> {
        let mut ids = vec![self.sock.id()];
        if let Transport::Tls(tls) = &self.transport {
            ids.push(tls.overlay_socket().id());
        }
        match &self.proto {
            Proto::H2Server(h2) => ids.push(h2.overlay_socket().id()),
            Proto::H2Client(h2) => ids.push(h2.overlay_socket().id()),
            _ => {}
        }
        ids
    }

    // -- Accept-side construction -------------------------------------

    /// Layer an accepted connection according to the listener's setup.
    /// Fires the consumer accept callback for layers with no handshake.
    pub(crate) fn apply_accept_setup(
        &mut self,
        mgr: &Arc<MgrShared>,
        setup: AcceptSetup,
        soft_quota: bool,
    ) -> Result<(), CloseReason> {
        if soft_quota {
            tracing::warn!(
                peer = ?self.sock.peer_addr(),
                "accepting under soft quota pressure"
            );
        }
        match setup {
            AcceptSetup::Tcp { accept_cb } => {
                self.static_handle = Some(Handle::new(&self.sock));
                accept_cb(Handle::new(&self.sock), Ok(()));
                Ok(())
            }
            AcceptSetup::Tls { accept_cb, tls } => {
                self.layer_tls_server(mgr, tls, TlsReadyCb::Accept(accept_cb))
            }
            AcceptSetup::StreamDns {
                accept_cb,
                recv_cb,
                tls,
            } => {
                match tls {
                    Some(tls) => {
                        self.proto = Proto::StreamDns {
                            recv_cb,
                            framer: DnsFramer::new(),
                        };
                        self.layer_tls_server(mgr, tls, TlsReadyCb::Accept(accept_cb))?;
                    }
                    None => {
                        self.proto = Proto::StreamDns {
                            recv_cb,
                            framer: DnsFramer::new(),
                        };
                        self.start_stream_read();
                        self.static_handle = Some(self.consumer_handle());
                        accept_cb(self.consumer_handle(), Ok(()));
                    }
                }
                Ok(())
            }
            AcceptSetup::Http {
                endpoints,
                tls,
                max_streams,
            } => {
                let overlay = Socket::new(mgr, SockKind::HttpConnected, self.sock.worker);
                self.mirror_addrs(&overlay);
                overlay.set_connected();
                self.proto = Proto::H2Server(Box::new(H2ServerConn::new(
                    Arc::clone(&overlay),
                    endpoints,
                    max_streams,
                )));
                self.static_handle = Some(Handle::new(&overlay));
                match tls {
                    Some(tls) => {
                        self.layer_tls_server(mgr, tls, TlsReadyCb::None)?;
                    }
                    None => {
                        // Plain DoH: the session waits for the client
                        // preface; nothing to send yet.
                        self.reading = true;
                    }
                }
                Ok(())
            }
        }
    }

    fn layer_tls_server(
        &mut self,
        mgr: &Arc<MgrShared>,
        config: Arc<rustls::ServerConfig>,
        ready_cb: TlsReadyCb,
    ) -> Result<(), CloseReason> {
        let overlay = Socket::new(mgr, SockKind::TlsConnected, self.sock.worker);
        self.mirror_addrs(&overlay);
        overlay.set_connected();
        let tls = TlsLayer::server(config, Arc::clone(&overlay), &self.sock, ready_cb)
            .map_err(CloseReason::Error)?;
        self.transport = Transport::Tls(tls);
        self.reading = true;
        Ok(())
    }

    fn mirror_addrs(&self, overlay: &Arc<Socket>) {
        if let Some(addr) = self.sock.local_addr() {
            overlay.set_local(addr);
        }
        if let Some(addr) = self.sock.peer_addr() {
            overlay.set_peer(addr);
        }
    }

    fn start_stream_read(&mut self) {
        self.reading = true;
        self.read_deadline = Some(Instant::now() + self.effective_read_timeout());
    }

    // -- Connect-side completion --------------------------------------

    /// Writability while a connect is pending: either completion or a
    /// deferred error via SO_ERROR.
    fn finish_connect(&mut self, mgr: &Arc<MgrShared>) -> Result<(), CloseReason> {
        match self.stream.take_error() {
            Ok(Some(e)) => return Err(CloseReason::Error(NmError::from_io(&e))),
            Ok(None) => {}
            Err(e) => return Err(CloseReason::Error(NmError::from_io(&e))),
        }
        // The peer name is authoritative; it may differ from the
        // requested address on dual-stack hosts.
        let peer = match self.stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(CloseReason::Error(NmError::from_io(&e))),
        };
        self.sock.set_peer(peer);
        if let Ok(local) = self.stream.local_addr() {
            self.sock.set_local(local);
        }
        self.sock.set_connected();

        let pending = self.connect.take().expect("pending connect");
        self.apply_connect_setup(mgr, pending.setup)
    }

    fn apply_connect_setup(
        &mut self,
        mgr: &Arc<MgrShared>,
        setup: ConnSetup,
    ) -> Result<(), CloseReason> {
        match setup {
            ConnSetup::Tcp { cb } => {
                self.static_handle = Some(Handle::new(&self.sock));
                cb(Handle::new(&self.sock), Ok(()));
                Ok(())
            }
            ConnSetup::Tls {
                cb,
                tls,
                server_name,
            } => self.layer_tls_client(mgr, tls, server_name, TlsReadyCb::Connect(cb)),
            ConnSetup::StreamDns { cb, recv_cb, tls } => {
                self.proto = Proto::StreamDns {
                    recv_cb,
                    framer: DnsFramer::new(),
                };
                match tls {
                    Some((config, server_name)) => {
                        self.layer_tls_client(mgr, config, server_name, TlsReadyCb::Connect(cb))
                    }
                    None => {
                        self.start_stream_read();
                        self.static_handle = Some(self.consumer_handle());
                        cb(self.consumer_handle(), Ok(()));
                        Ok(())
                    }
                }
            }
            ConnSetup::Http {
                tls,
                request,
                resp_cb,
            } => {
                let overlay = Socket::new(mgr, SockKind::HttpConnected, self.sock.worker);
                self.mirror_addrs(&overlay);
                overlay.set_connected();
                self.proto = Proto::H2Client(Box::new(H2ClientConn::new(
                    Arc::clone(&overlay),
                    request,
                    resp_cb,
                )));
                self.static_handle = Some(Handle::new(&overlay));
                self.reading = true;
                self.read_deadline = Some(Instant::now() + self.read_timeout);
                match tls {
                    Some((config, server_name)) => {
                        self.layer_tls_client(mgr, config, server_name, TlsReadyCb::None)?;
                    }
                    None => {
                        if let Proto::H2Client(h2) = &mut self.proto {
                            h2.start();
                        }
                        self.flush_proto_output()?;
                    }
                }
                Ok(())
            }
        }
    }

    fn layer_tls_client(
        &mut self,
        mgr: &Arc<MgrShared>,
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
        ready_cb: TlsReadyCb,
    ) -> Result<(), CloseReason> {
        let overlay = Socket::new(mgr, SockKind::TlsConnected, self.sock.worker);
        self.mirror_addrs(&overlay);
        overlay.set_connected();
        let tls = TlsLayer::client(config, server_name, Arc::clone(&overlay), &self.sock, ready_cb)
            .map_err(CloseReason::Error)?;
        self.transport = Transport::Tls(tls);
        self.reading = true;
        Ok(())
    }

    // -- Read path -----------------------------------------------------

    /// Whether the carrier should be pulled from right now.
    fn should_read_carrier(&self) -> bool {
        if self.connect.is_some() {
            return false;
        }
        if self.consumer_socket().is_read_paused() {
            // During a TLS handshake the carrier keeps flowing; consumer
            // pause only gates application data.
            if let Transport::Tls(tls) = &self.transport {
                return tls.state() == TlsState::Handshake || tls.state() == TlsState::Init;
            }
            return false;
        }
        match (&self.transport, &self.proto) {
            (Transport::Tls(tls), _)
                if matches!(tls.state(), TlsState::Init | TlsState::Handshake) =>
            {
                true
            }
            (_, Proto::Stream { recv_cb }) => self.reading && recv_cb.is_some(),
            (_, Proto::StreamDns { .. }) => self.reading,
            (_, Proto::H2Server(_) | Proto::H2Client(_)) => true,
        }
    }

    /// Whether plaintext may be delivered to the consumer right now.
    fn consumer_reading(&self) -> bool {
        if self.consumer_socket().is_read_paused() {
            return false;
        }
        match &self.proto {
            Proto::Stream { recv_cb } => self.reading && recv_cb.is_some(),
            Proto::StreamDns { .. } => self.reading,
            Proto::H2Server(_) | Proto::H2Client(_) => true,
        }
    }

    /// Drain the carrier into the layers. `recvbuf` is the worker's
    /// shared receive buffer and is exclusively owned for each OS read.
    pub(crate) fn on_readable(
        &mut self,
        mgr: &Arc<MgrShared>,
        recvbuf: &mut [u8],
        recvbuf_inuse: &mut bool,
    ) -> DriveOutcome {
        let mut close = None;
        loop {
            if !self.should_read_carrier() {
                break;
            }
            debug_assert!(!*recvbuf_inuse, "receive buffer already loaned out");
            *recvbuf_inuse = true;
            let read = self.stream.read(recvbuf);
            *recvbuf_inuse = false;

            match read {
                Ok(0) => {
                    close = Some(self.on_eof());
                    break;
                }
                Ok(n) => {
                    BYTES_RECEIVED.add(n as u64);
                    if let Err(reason) = self.feed(mgr, &recvbuf[..n]) {
                        close = Some(reason);
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    close = Some(CloseReason::Error(NmError::from_io(&e)));
                    break;
                }
            }
        }

        if close.is_none()
            && let Err(reason) = self.flush_out()
        {
            close = Some(reason);
        }
        close
    }

    /// Feed carrier bytes into the transport and protocol layers.
    fn feed(&mut self, mgr: &Arc<MgrShared>, data: &[u8]) -> Result<(), CloseReason> {
        match &mut self.transport {
            Transport::Plain => self.proto_feed(data),
            Transport::Tls(tls) => {
                tls.feed(data);
                self.drive_tls(mgr)
            }
        }
    }

    /// Run the TLS drive loop until it stops making progress: records in,
    /// plaintext to the consumer, queued plaintext out, records out.
    pub(crate) fn drive_tls(&mut self, _mgr: &Arc<MgrShared>) -> Result<(), CloseReason> {
        loop {
            let drive = match &mut self.transport {
                Transport::Tls(tls) => tls.drive(&mut self.out),
                Transport::Plain => return Ok(()),
            };
            if let Some(err) = drive.error {
                return Err(CloseReason::Error(err));
            }

            let mut progress = false;
            if drive.newly_ready {
                self.on_tls_ready()?;
                progress = true;
            }

            while self.consumer_reading() {
                let chunk = match &mut self.transport {
                    Transport::Tls(tls) => tls.take_plaintext_chunk(),
                    Transport::Plain => None,
                };
                let Some(chunk) = chunk else { break };
                self.proto_feed(&chunk)?;
                progress = true;
            }

            if self.flush_proto_output()? {
                progress = true;
            }
            if !progress {
                return Ok(());
            }
        }
    }

    /// Handshake completed: check for the consumer callback and kick the
    /// overlay protocol.
    fn on_tls_ready(&mut self) -> Result<(), CloseReason> {
        let ready_cb = match &mut self.transport {
            Transport::Tls(tls) => tls.take_ready_cb(),
            Transport::Plain => None,
        };

        match ready_cb {
            Some(TlsReadyCb::Accept(cb)) => {
                if self.static_handle.is_none() {
                    self.static_handle = Some(self.consumer_handle());
                }
                if matches!(self.proto, Proto::StreamDns { .. }) {
                    self.start_stream_read();
                }
                cb(self.consumer_handle(), Ok(()));
            }
            Some(TlsReadyCb::Connect(cb)) => {
                if self.static_handle.is_none() {
                    self.static_handle = Some(self.consumer_handle());
                }
                if matches!(self.proto, Proto::StreamDns { .. }) {
                    self.start_stream_read();
                }
                cb(self.consumer_handle(), Ok(()));
            }
            Some(TlsReadyCb::None) | None => {}
        }

        if let Proto::H2Client(h2) = &mut self.proto {
            h2.start();
        }
        Ok(())
    }

    /// Hand decrypted (or plain) bytes to the protocol layer.
    fn proto_feed(&mut self, data: &[u8]) -> Result<(), CloseReason> {
        let timeout = self.effective_read_timeout();
        match &mut self.proto {
            Proto::Stream { recv_cb } => {
                if let Some(cb) = recv_cb {
                    self.read_deadline = Some(Instant::now() + timeout);
                    let handle = Handle::new(&match &self.transport {
                        Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                        Transport::Plain => Arc::clone(&self.sock),
                    });
                    cb(&handle, Ok(data));
                }
                Ok(())
            }
            Proto::StreamDns { recv_cb, framer } => {
                framer.feed(data);
                let handle = Handle::new(&match &self.transport {
                    Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                    Transport::Plain => Arc::clone(&self.sock),
                });
                while let Some(msg) = framer.next_message() {
                    self.read_deadline = Some(Instant::now() + timeout);
                    recv_cb(&handle, Ok(&msg));
                }
                Ok(())
            }
            Proto::H2Server(h2) => {
                h2.feed(data)
                    .map_err(|e| CloseReason::Error(e))?;
                self.flush_proto_output()?;
                Ok(())
            }
            Proto::H2Client(h2) => {
                let finished = h2.feed(data).map_err(CloseReason::Error)?;
                self.flush_proto_output()?;
                if finished {
                    self.finish_after_flush = true;
                }
                Ok(())
            }
        }
    }

    /// Move HTTP session output into the transport. Returns whether any
    /// bytes moved.
    fn flush_proto_output(&mut self) -> Result<bool, CloseReason> {
        let output = match &mut self.proto {
            Proto::H2Server(h2) => h2.take_output(),
            Proto::H2Client(h2) => h2.take_output(),
            _ => None,
        };
        match output {
            Some(data) => {
                self.send_transport(data, None, None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- Write path ----------------------------------------------------

    /// Queue application bytes on the transport.
    fn send_transport(&mut self, data: Bytes, cb: Option<SendCb>, handle: Option<Handle>) {
        match &mut self.transport {
            Transport::Plain => {
                self.outq.push_back(OutAccount {
                    remaining: data.len(),
                    cb,
                    handle,
                });
                self.out.extend_from_slice(&data);
            }
            Transport::Tls(tls) => {
                tls.queue_send(data, cb, handle);
            }
        }
    }

    /// Entry point for a consumer `send`.
    pub(crate) fn send_app(
        &mut self,
        mgr: &Arc<MgrShared>,
        stream: Option<u32>,
        data: Bytes,
        cb: Option<SendCb>,
    ) -> DriveOutcome {
        let handle = self.consumer_handle();

        if self.connect.is_some() || !self.sock.is_connected() {
            if let Some(cb) = cb {
                cb(&handle, Err(NmError::NotConnected));
            }
            return None;
        }

        match &mut self.proto {
            Proto::Stream { .. } => {
                self.send_transport(data, cb, Some(handle));
            }
            Proto::StreamDns { .. } => match frame_message(&data) {
                Some(framed) => self.send_transport(framed, cb, Some(handle)),
                None => {
                    if let Some(cb) = cb {
                        cb(&handle, Err(NmError::Failure));
                    }
                    return None;
                }
            },
            Proto::H2Server(h2) => match stream {
                Some(stream_id) => {
                    h2.respond(stream_id, data, cb);
                    if let Err(reason) = self.flush_proto_output() {
                        return Some(reason);
                    }
                }
                None => {
                    if let Some(cb) = cb {
                        cb(&handle, Err(NmError::Failure));
                    }
                    return None;
                }
            },
            Proto::H2Client(_) => {
                // The DoH client composes its own request; there is no
                // consumer-driven send surface.
                if let Some(cb) = cb {
                    cb(&handle, Err(NmError::Failure));
                }
                return None;
            }
        }

        if let Err(reason) = self.drive_tls(mgr) {
            return Some(reason);
        }
        if let Err(reason) = self.flush_out() {
            return Some(reason);
        }
        None
    }

    /// Push the carrier write buffer into the kernel.
    fn flush_out(&mut self) -> Result<(), CloseReason> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(CloseReason::Error(NmError::ConnectionReset)),
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                    self.out.advance(n);
                    self.account_out(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Error(NmError::from_io(&e))),
            }
        }
        if self.finish_after_flush && self.out.is_empty() {
            return Err(CloseReason::Graceful);
        }
        Ok(())
    }

    /// Fire completion callbacks for fully written sends, in order.
    fn account_out(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.outq.front_mut() else {
                break;
            };
            if front.remaining > written {
                front.remaining -= written;
                break;
            }
            written -= front.remaining;
            let done = self.outq.pop_front().unwrap();
            if let (Some(cb), Some(handle)) = (done.cb, done.handle) {
                cb(&handle, Ok(()));
            }
        }
    }

    /// Writability: connect completion, then buffered output.
    pub(crate) fn on_writable(&mut self, mgr: &Arc<MgrShared>) -> DriveOutcome {
        if self.connect.is_some()
            && let Err(reason) = self.finish_connect(mgr)
        {
            return Some(reason);
        }

        if let Err(reason) = self.drive_tls(mgr) {
            return Some(reason);
        }
        if let Err(reason) = self.flush_out() {
            return Some(reason);
        }
        None
    }

    // -- Consumer read control ----------------------------------------

    /// Install a read callback and start streaming.
    pub(crate) fn start_read(&mut self, mgr: &Arc<MgrShared>, cb: RecvCb) -> DriveOutcome {
        if let Proto::Stream { recv_cb } = &mut self.proto {
            *recv_cb = Some(cb);
            self.start_stream_read();
            if self.static_handle.is_none() {
                self.static_handle = Some(self.consumer_handle());
            }
        }
        // Deliver anything the TLS layer already decrypted.
        if let Err(reason) = self.drive_tls(mgr) {
            return Some(reason);
        }
        None
    }

    /// Fail the consumer read with EOF and stop streaming. Idempotent.
    pub(crate) fn cancel_read(&mut self) {
        if let Proto::Stream { recv_cb } = &mut self.proto {
            if let Some(mut cb) = recv_cb.take() {
                let handle = self.consumer_handle();
                cb(&handle, Err(NmError::Eof));
            }
        }
        self.reading = false;
        self.read_deadline = None;
        self.eof_delivered = true;
    }

    // -- EOF, timers, teardown ----------------------------------------

    /// The peer closed the stream.
    fn on_eof(&mut self) -> CloseReason {
        self.eof_delivered = true;
        let handle = self.consumer_handle();
        match &mut self.proto {
            Proto::Stream { recv_cb } => {
                if let Some(cb) = recv_cb {
                    cb(&handle, Err(NmError::Eof));
                }
            }
            Proto::StreamDns { recv_cb, .. } => {
                if self.reading {
                    recv_cb(&handle, Err(NmError::Eof));
                }
            }
            Proto::H2Client(h2) => h2.fail(NmError::Eof),
            Proto::H2Server(_) => {}
        }
        CloseReason::Graceful
    }

    /// Timer sweep; may deliver a timeout or ask for a close.
    pub(crate) fn check_timers(&mut self, now: Instant) -> Option<CloseReason> {
        if let Some(pending) = &self.connect {
            if now >= pending.deadline {
                return Some(CloseReason::Error(NmError::TimedOut));
            }
        }

        let Some(deadline) = self.read_deadline else {
            return None;
        };
        if now < deadline {
            return None;
        }

        // A consumer marked mid-request gets a fresh grace period.
        if self.consumer_socket().is_processing() {
            self.read_deadline = Some(now + self.effective_read_timeout());
            return None;
        }

        READ_TIMEOUTS.increment();
        self.read_deadline = None;
        match &mut self.proto {
            Proto::Stream { recv_cb } => {
                // Streaming reads surface the timeout; the consumer
                // decides whether to resume or close.
                self.reading = false;
                if let Some(cb) = recv_cb {
                    let handle = Handle::new(&match &self.transport {
                        Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                        Transport::Plain => Arc::clone(&self.sock),
                    });
                    cb(&handle, Err(NmError::TimedOut));
                }
                None
            }
            Proto::StreamDns { recv_cb, .. } => {
                self.reading = false;
                let handle = Handle::new(&match &self.transport {
                    Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                    Transport::Plain => Arc::clone(&self.sock),
                });
                recv_cb(&handle, Err(NmError::TimedOut));
                None
            }
            Proto::H2Client(_) | Proto::H2Server(_) => {
                Some(CloseReason::Error(NmError::TimedOut))
            }
        }
    }

    /// Fail everything outstanding; runs once, as the connection is torn
    /// out of the worker tables.
    pub(crate) fn teardown(&mut self, reason: &CloseReason) {
        let err = reason.error();

        // An orderly close says goodbye at the record layer; the flush is
        // best-effort since the fd is about to go away.
        if matches!(reason, CloseReason::Graceful) {
            if let Transport::Tls(tls) = &mut self.transport {
                tls.close(&mut self.out);
            }
            let _ = self.flush_out();
        }

        if let Some(pending) = self.connect.take() {
            let handle = Handle::new(&self.sock);
            match pending.setup {
                ConnSetup::Tcp { cb } => cb(handle, Err(err.clone())),
                ConnSetup::Tls { cb, .. } => cb(handle, Err(err.clone())),
                ConnSetup::StreamDns { cb, .. } => cb(handle, Err(err.clone())),
                ConnSetup::Http { resp_cb, .. } => resp_cb(&handle, Err(err.clone())),
            }
        }

        // Sends that never reached the kernel.
        while let Some(entry) = self.outq.pop_front() {
            if let (Some(cb), Some(handle)) = (entry.cb, entry.handle) {
                cb(&handle, Err(err.clone()));
            }
        }

        // The TLS layer fails its own queue and fires a pending
        // handshake callback exactly once.
        let ready_cb = match &mut self.transport {
            Transport::Tls(tls) => {
                let cb = tls.take_ready_cb();
                tls.fail(err.clone());
                cb
            }
            Transport::Plain => None,
        };
        if let Some(cb) = ready_cb {
            let handle = self.consumer_handle();
            match cb {
                TlsReadyCb::Accept(cb) => cb(handle, Err(err.clone())),
                TlsReadyCb::Connect(cb) => cb(handle, Err(err.clone())),
                TlsReadyCb::None => {}
            }
        }

        match &mut self.proto {
            Proto::Stream { recv_cb } => {
                if !self.eof_delivered
                    && let Some(cb) = recv_cb
                {
                    let handle = Handle::new(&match &self.transport {
                        Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                        Transport::Plain => Arc::clone(&self.sock),
                    });
                    cb(&handle, Err(err.clone()));
                }
                *recv_cb = None;
            }
            Proto::StreamDns { recv_cb, .. } => {
                if !self.eof_delivered && self.reading {
                    let handle = Handle::new(&match &self.transport {
                        Transport::Tls(tls) => Arc::clone(tls.overlay_socket()),
                        Transport::Plain => Arc::clone(&self.sock),
                    });
                    recv_cb(&handle, Err(err.clone()));
                }
            }
            Proto::H2Client(h2) => h2.fail(err.clone()),
            Proto::H2Server(_) => {}
        }

        if let Proto::H2Server(h2) = &mut self.proto {
            h2.fail_pending(&err);
        }

        // The static handle and the quota slot release on drop.
        self.static_handle = None;
        self.reading = false;

        // Flag transitions: carrier and overlays all reach closed, and
        // the worker's creation reference on each is released.
        if let Transport::Tls(tls) = &self.transport {
            let overlay = tls.overlay_socket();
            overlay.mark_closed();
            overlay.detach();
        }
        match &self.proto {
            Proto::H2Server(h2) => {
                let overlay = h2.overlay_socket();
                overlay.mark_closed();
                overlay.detach();
            }
            Proto::H2Client(h2) => {
                let overlay = h2.overlay_socket();
                overlay.mark_closed();
                overlay.detach();
            }
            _ => {}
        }
        self.sock.mark_closed();
        self.sock.detach();
    }
}
