//! Socket identity, lifecycle flags, and the handle discipline.
//!
//! A [`Socket`] is the durable identity of an endpoint. Transport state
//! (the mio stream, TLS session, HTTP/2 session) lives on the owning
//! worker; the `Socket` carries what must be visible across threads: the
//! flag set, the reference count, addresses, and the listener
//! backpointer. A [`Handle`] is one counted borrow of a socket; the last
//! detach after close tears the socket down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::errors::{NmError, NmResult};
use crate::event::{NetEvent, RecvCb, SendCb};
use crate::manager::MgrShared;
use crate::metrics::SOCKETS_ACTIVE;

/// Process-unique socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

impl SocketId {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Socket variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    TcpListener,
    TcpConnected,
    TlsListener,
    TlsConnected,
    HttpListener,
    HttpConnected,
}

impl SockKind {
    pub fn is_listener(self) -> bool {
        matches!(
            self,
            SockKind::TcpListener | SockKind::TlsListener | SockKind::HttpListener
        )
    }
}

/// The atomic flag set; a close is a monotonic walk through these.
#[derive(Debug, Default)]
struct Flags {
    active: AtomicBool,
    connecting: AtomicBool,
    connected: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    destroyed: AtomicBool,
    listening: AtomicBool,
    listen_error: AtomicBool,
    read_paused: AtomicBool,
    accepting: AtomicBool,
    /// Consumer is mid-request; read timers re-arm instead of firing.
    processing: AtomicBool,
    /// Long-lived consumer connection; reads use the keepalive timeout.
    keepalive: AtomicBool,
}

/// Completion slot for callers that originate work off the owning worker
/// and need the setup result synchronously.
pub(crate) struct WaitPoint {
    slot: Mutex<Option<NmResult<()>>>,
    cv: Condvar,
}

impl WaitPoint {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn post(&self, result: NmResult<()>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) -> NmResult<()> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.cv.wait(&mut slot);
        }
        slot.take().unwrap()
    }
}

/// The durable identity of a transport endpoint.
pub struct Socket {
    pub(crate) id: SocketId,
    pub(crate) kind: SockKind,
    /// Owning worker index; immutable after assignment.
    pub(crate) worker: usize,
    pub(crate) mgr: Weak<MgrShared>,
    flags: Flags,
    refs: AtomicUsize,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    /// Listener backpointer on accepted children.
    server: Mutex<Option<Arc<Socket>>>,
    pub(crate) wait: WaitPoint,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("worker", &self.worker)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket {
    /// Create a socket attached to the manager with one creation reference.
    pub(crate) fn new(mgr: &Arc<MgrShared>, kind: SockKind, worker: usize) -> Arc<Socket> {
        SOCKETS_ACTIVE.increment();
        let sock = Arc::new(Socket {
            id: mgr.next_socket_id(),
            kind,
            worker,
            mgr: Arc::downgrade(mgr),
            flags: Flags::default(),
            refs: AtomicUsize::new(1),
            local: Mutex::new(None),
            peer: Mutex::new(None),
            server: Mutex::new(None),
            wait: WaitPoint::new(),
        });
        sock.flags.active.store(true, Ordering::Release);
        sock
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SockKind {
        self.kind
    }

    /// The thread index this socket is pinned to.
    pub fn owner_worker(&self) -> usize {
        self.worker
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub(crate) fn set_local(&self, addr: SocketAddr) {
        *self.local.lock() = Some(addr);
    }

    pub(crate) fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = Some(addr);
    }

    pub(crate) fn set_server(&self, listener: Arc<Socket>) {
        *self.server.lock() = Some(listener);
    }

    pub fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    pub fn is_listening(&self) -> bool {
        self.flags.listening.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.flags.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.destroyed.load(Ordering::Acquire)
    }

    pub fn is_read_paused(&self) -> bool {
        self.flags.read_paused.load(Ordering::Acquire)
    }

    pub fn is_processing(&self) -> bool {
        self.flags.processing.load(Ordering::Acquire)
    }

    pub(crate) fn set_connecting(&self, on: bool) {
        self.flags.connecting.store(on, Ordering::Release);
    }

    pub(crate) fn set_connected(&self) {
        self.flags.connecting.store(false, Ordering::Release);
        self.flags.connected.store(true, Ordering::Release);
    }

    pub(crate) fn set_listening(&self, on: bool) {
        self.flags.listening.store(on, Ordering::Release);
    }

    pub(crate) fn set_listen_error(&self) {
        self.flags.listen_error.store(true, Ordering::Release);
    }

    pub(crate) fn set_accepting(&self, on: bool) {
        self.flags.accepting.store(on, Ordering::Release);
    }

    pub(crate) fn set_read_paused(&self, on: bool) {
        self.flags.read_paused.store(on, Ordering::Release);
    }

    pub(crate) fn set_processing(&self, on: bool) {
        self.flags.processing.store(on, Ordering::Release);
    }

    pub fn is_keepalive(&self) -> bool {
        self.flags.keepalive.load(Ordering::Acquire)
    }

    pub(crate) fn set_keepalive(&self, on: bool) {
        self.flags.keepalive.store(on, Ordering::Release);
    }

    /// First caller wins; later closes are no-ops.
    pub(crate) fn begin_close(&self) -> bool {
        self.flags
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Terminal flag transition; drops the listener backpointer and tears
    /// the socket down if no references remain.
    pub(crate) fn mark_closed(self: &Arc<Self>) {
        self.flags.closing.store(true, Ordering::Release);
        self.flags.connected.store(false, Ordering::Release);
        self.flags.connecting.store(false, Ordering::Release);
        self.flags.listening.store(false, Ordering::Release);
        self.flags.accepting.store(false, Ordering::Release);
        self.flags.active.store(false, Ordering::Release);
        self.flags.closed.store(true, Ordering::Release);
        *self.server.lock() = None;
        self.prep_destroy();
    }

    /// Bump the reference count for a new borrow. Late events may attach
    /// to an already-closed socket; the memory is pinned by the Arc and
    /// the detach re-runs the destroy check.
    pub(crate) fn attach(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one borrow; the last one after close destroys the socket.
    pub(crate) fn detach(self: &Arc<Self>) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "detach underflow");
        if prev == 1 {
            self.prep_destroy();
        }
    }

    /// Current reference count; diagnostic only.
    pub fn current_refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Destroy once both conditions hold: `closed` and zero references.
    fn prep_destroy(self: &Arc<Self>) {
        if self.refs.load(Ordering::Acquire) != 0 || !self.is_closed() {
            return;
        }
        if self
            .flags
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            SOCKETS_ACTIVE.decrement();
            tracing::trace!(id = self.id.0, kind = ?self.kind, "socket destroyed");
        }
    }

    pub(crate) fn route(&self, event: NetEvent) -> NmResult<()> {
        let mgr = self.mgr.upgrade().ok_or(NmError::Canceled)?;
        mgr.enqueue(self.worker, event);
        Ok(())
    }
}

/// A reference-counted, consumer-facing view of an open socket.
///
/// For DoH request handles, `stream` pins the response to its HTTP/2
/// stream so each request has exactly one response path.
pub struct Handle {
    sock: Arc<Socket>,
    stream: Option<u32>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("sock", &self.sock.id)
            .field("stream", &self.stream)
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(sock: &Arc<Socket>) -> Handle {
        sock.attach();
        Handle {
            sock: Arc::clone(sock),
            stream: None,
        }
    }

    pub(crate) fn with_stream(sock: &Arc<Socket>, stream: u32) -> Handle {
        sock.attach();
        Handle {
            sock: Arc::clone(sock),
            stream: Some(stream),
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    pub(crate) fn stream_id(&self) -> Option<u32> {
        self.stream
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    /// Start a streaming read; `cb` fires once per delivered region and
    /// must consume the region within the call.
    pub fn read(&self, cb: RecvCb) -> NmResult<()> {
        self.sock.route(NetEvent::StartRead {
            sock: Arc::clone(&self.sock),
            cb,
        })
    }

    /// Stop pulling from the carrier without dropping the read callback.
    pub fn pause_read(&self) {
        let _ = self.sock.route(NetEvent::PauseRead {
            sock: Arc::clone(&self.sock),
        });
    }

    /// Undo [`pause_read`](Self::pause_read); idempotent.
    pub fn resume_read(&self) {
        let _ = self.sock.route(NetEvent::ResumeRead {
            sock: Arc::clone(&self.sock),
        });
    }

    /// Stop the read and fail the consumer callback with EOF. Idempotent.
    pub fn cancel_read(&self) {
        let _ = self.sock.route(NetEvent::CancelRead {
            sock: Arc::clone(&self.sock),
        });
    }

    /// Replace the read timeout for this socket.
    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.sock.route(NetEvent::SetTimeout {
            sock: Arc::clone(&self.sock),
            timeout,
        });
    }

    /// Queue `data` for transmission; `cb` fires once the bytes have been
    /// handed to the carrier.
    pub fn send(&self, data: &[u8], cb: SendCb) {
        let event = NetEvent::Send {
            sock: Arc::clone(&self.sock),
            stream: self.stream,
            data: Bytes::copy_from_slice(data),
            cb: Some(cb),
        };
        if self.sock.route(event).is_err() {
            // Manager is gone; there is no worker left to fail the send.
            tracing::debug!(id = self.sock.id.0, "send after manager shutdown");
        }
    }

    /// Deactivate the socket and fail outstanding work with `Canceled`.
    pub fn close(&self) {
        let _ = self.sock.route(NetEvent::Close {
            sock: Arc::clone(&self.sock),
        });
    }

    /// Mark the consumer as mid-request; read timers re-arm while set.
    pub fn set_processing(&self, on: bool) {
        self.sock.set_processing(on);
    }

    /// Mark the connection long-lived; reads use the keepalive timeout
    /// instead of the idle timeout until a `set_timeout` overrides both.
    pub fn set_keepalive(&self, on: bool) {
        self.sock.set_keepalive(on);
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.sock.attach();
        Handle {
            sock: Arc::clone(&self.sock),
            stream: self.stream,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.sock.detach();
    }
}
