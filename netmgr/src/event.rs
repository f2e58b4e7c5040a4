//! Cross-thread net-events and consumer callback signatures.
//!
//! Any call that needs to mutate a socket and originates off the socket's
//! owning worker is marshalled as a [`NetEvent`] onto that worker's queue.
//! The worker drains the queue in FIFO order between poll cycles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::errors::NmResult;
use crate::http::{DohRequest, Endpoints};
use crate::quota::{Quota, QuotaRef};
use crate::socket::{Handle, Socket};

/// Listener accept callback; fires once per accepted connection (for TLS
/// and DoH listeners, once the handshake has completed).
pub type AcceptCb = Arc<dyn Fn(Handle, NmResult<()>) + Send + Sync>;

/// Client connect completion callback.
pub type ConnectCb = Box<dyn FnOnce(Handle, NmResult<()>) + Send>;

/// Streaming read callback. The region borrows the worker's receive
/// buffer and must be consumed within the call.
pub type RecvCb = Box<dyn FnMut(&Handle, NmResult<&[u8]>) + Send>;

/// Shared read callback, used where one callback serves many connections
/// (DNS stream listeners, DoH endpoints).
pub type SharedRecvCb = Arc<dyn Fn(&Handle, NmResult<&[u8]>) + Send + Sync>;

/// Send completion callback; fires exactly once, after the bytes have
/// been handed to the carrier.
pub type SendCb = Box<dyn FnOnce(&Handle, NmResult<()>) + Send>;

/// DoH client response callback; fires exactly once with the decoded
/// response body or the failure.
pub type ResponseCb = Box<dyn FnOnce(&Handle, NmResult<&[u8]>) + Send>;

/// Layer configuration a listener applies to accepted children.
#[derive(Clone)]
pub(crate) enum AcceptSetup {
    Tcp {
        accept_cb: AcceptCb,
    },
    Tls {
        accept_cb: AcceptCb,
        tls: Arc<rustls::ServerConfig>,
    },
    StreamDns {
        accept_cb: AcceptCb,
        recv_cb: SharedRecvCb,
        tls: Option<Arc<rustls::ServerConfig>>,
    },
    Http {
        endpoints: Arc<Endpoints>,
        tls: Option<Arc<rustls::ServerConfig>>,
        max_streams: u32,
    },
}

/// Listener-side options, held by the owning worker.
#[derive(Clone)]
pub(crate) struct ListenOpts {
    pub(crate) accept: AcceptSetup,
    pub(crate) quota: Option<Arc<Quota>>,
}

/// Layer configuration for an outbound connection.
pub(crate) enum ConnSetup {
    Tcp {
        cb: ConnectCb,
    },
    Tls {
        cb: ConnectCb,
        tls: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    },
    StreamDns {
        cb: ConnectCb,
        recv_cb: SharedRecvCb,
        tls: Option<(Arc<rustls::ClientConfig>, rustls::pki_types::ServerName<'static>)>,
    },
    Http {
        tls: Option<(Arc<rustls::ClientConfig>, rustls::pki_types::ServerName<'static>)>,
        request: DohRequest,
        resp_cb: ResponseCb,
    },
}

/// Work marshalled to a socket's owning worker.
pub(crate) enum NetEvent {
    /// Bind and start listening; result posted to the socket's wait slot.
    Listen {
        sock: Arc<Socket>,
        iface: SocketAddr,
        backlog: u32,
        opts: ListenOpts,
    },
    /// Idempotent, asynchronous listener stop. Re-enqueues itself while
    /// the manager interlock is held elsewhere.
    StopListening {
        sock: Arc<Socket>,
    },
    /// An accepted fd arriving at the child's owning worker.
    ChildAccept {
        child: Arc<Socket>,
        fd: std::os::fd::RawFd,
        peer: SocketAddr,
        setup: AcceptSetup,
        quota: Option<QuotaRef>,
    },
    /// A freed quota slot re-triggering accept on the listener worker.
    AcceptRetry {
        listener: Arc<Socket>,
        slot: QuotaRef,
    },
    /// Initiate an outbound connection; setup result posted to the wait
    /// slot, completion via the setup's callback.
    Connect {
        sock: Arc<Socket>,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
        setup: ConnSetup,
    },
    StartRead {
        sock: Arc<Socket>,
        cb: RecvCb,
    },
    PauseRead {
        sock: Arc<Socket>,
    },
    ResumeRead {
        sock: Arc<Socket>,
    },
    CancelRead {
        sock: Arc<Socket>,
    },
    SetTimeout {
        sock: Arc<Socket>,
        timeout: Duration,
    },
    Send {
        sock: Arc<Socket>,
        stream: Option<u32>,
        data: Bytes,
        cb: Option<SendCb>,
    },
    Close {
        sock: Arc<Socket>,
    },
    /// Manager shutdown: close everything on this worker and quiesce.
    Stop,
}
