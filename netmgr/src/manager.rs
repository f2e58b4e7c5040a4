//! The network manager: owner of the worker pool and the public
//! listener/connect surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use rustls::pki_types::ServerName;

use crate::config::NetMgrConfig;
use crate::errors::{NmError, NmResult};
use crate::event::{
    AcceptCb, AcceptSetup, ConnSetup, ConnectCb, ListenOpts, NetEvent, ResponseCb, SharedRecvCb,
};
use crate::http::{DohRequest, Endpoints, HttpMethod, url::Url};
use crate::quota::Quota;
use crate::socket::{SockKind, Socket, SocketId};
use crate::worker::worker_main;

/// State shared between the manager front end and its workers.
pub(crate) struct MgrShared {
    pub(crate) config: NetMgrConfig,
    workers: Vec<Sender<NetEvent>>,
    closing: AtomicBool,
    /// Serializes listener teardown against accept processing.
    interlock: AtomicBool,
    next_id: AtomicU64,
}

impl MgrShared {
    pub(crate) fn enqueue(&self, worker: usize, event: NetEvent) {
        // A send only fails once the worker has quiesced during shutdown.
        let _ = self.workers[worker].send(event);
    }

    pub(crate) fn next_socket_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn nworkers(&self) -> usize {
        self.workers.len()
    }

    /// Uniform random worker choice; used for client connects and for
    /// spreading accepted children independent of the listener's worker.
    pub(crate) fn random_worker(&self) -> usize {
        rand::rng().random_range(0..self.workers.len())
    }

    pub(crate) fn acquire_interlock(&self) -> bool {
        self.interlock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_interlock(&self) {
        self.interlock.store(false, Ordering::Release);
    }
}

/// A running listener. Stopping is idempotent and asynchronous; dropping
/// the value releases its reference without stopping it.
pub struct Listener {
    sock: Arc<Socket>,
    endpoints: Option<Arc<Endpoints>>,
}

impl Listener {
    /// The bound address, including the resolved port for ephemeral binds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    /// Stop accepting and tear the listener down.
    pub fn stop(&self) {
        let _ = self.sock.route(NetEvent::StopListening {
            sock: Arc::clone(&self.sock),
        });
    }

    /// Register a DoH endpoint path on an HTTP listener. New connections
    /// and streams see the endpoint immediately.
    pub fn add_doh_endpoint(&self, path: &str, recv_cb: SharedRecvCb) -> NmResult<()> {
        match &self.endpoints {
            Some(endpoints) => {
                endpoints.add(path, recv_cb);
                Ok(())
            }
            None => Err(NmError::Failure),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.sock.detach();
    }
}

/// The process-wide transport manager.
pub struct NetMgr {
    shared: Arc<MgrShared>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl NetMgr {
    /// Create the manager and spawn its worker threads.
    pub fn new(config: NetMgrConfig) -> Arc<NetMgr> {
        let nworkers = config.workers.max(1);
        let mut senders = Vec::with_capacity(nworkers);
        let mut receivers = Vec::with_capacity(nworkers);
        for _ in 0..nworkers {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let shared = Arc::new(MgrShared {
            config,
            workers: senders,
            closing: AtomicBool::new(false),
            interlock: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let mut joins = Vec::with_capacity(nworkers);
        for (index, rx) in receivers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("netmgr-{}", index))
                .spawn(move || worker_main(index, shared, rx))
                .expect("failed to spawn netmgr worker");
            joins.push(handle);
        }

        Arc::new(NetMgr {
            shared,
            joins: Mutex::new(joins),
        })
    }

    pub fn with_defaults() -> Arc<NetMgr> {
        Self::new(NetMgrConfig::default())
    }

    pub fn nworkers(&self) -> usize {
        self.shared.nworkers()
    }

    // -- Listener management -------------------------------------------

    /// Listen for plain TCP connections.
    pub fn listen_tcp(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        backlog: u32,
        quota: Option<Arc<Quota>>,
    ) -> NmResult<Listener> {
        self.listen_with(
            iface,
            backlog,
            SockKind::TcpListener,
            ListenOpts {
                accept: AcceptSetup::Tcp { accept_cb },
                quota,
            },
            None,
        )
    }

    /// Listen for TLS connections; the listener owns the server context
    /// and accepted connections share it. The accept callback fires once
    /// the handshake completes.
    pub fn listen_tls(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        tls: Arc<rustls::ServerConfig>,
    ) -> NmResult<Listener> {
        self.listen_with(
            iface,
            backlog,
            SockKind::TlsListener,
            ListenOpts {
                accept: AcceptSetup::Tls { accept_cb, tls },
                quota,
            },
            None,
        )
    }

    /// Listen for length-prefixed DNS streams, optionally over TLS.
    /// `recv_cb` fires once per complete DNS message on every accepted
    /// connection.
    pub fn listen_streamdns(
        &self,
        iface: SocketAddr,
        accept_cb: AcceptCb,
        recv_cb: SharedRecvCb,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> NmResult<Listener> {
        let kind = if tls.is_some() {
            SockKind::TlsListener
        } else {
            SockKind::TcpListener
        };
        self.listen_with(
            iface,
            backlog,
            kind,
            ListenOpts {
                accept: AcceptSetup::StreamDns {
                    accept_cb,
                    recv_cb,
                    tls,
                },
                quota,
            },
            None,
        )
    }

    /// Listen for DoH connections. Endpoints are registered on the
    /// returned listener with [`Listener::add_doh_endpoint`]. With a TLS
    /// context the handshake must negotiate `h2`.
    pub fn listen_http(
        &self,
        iface: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
        backlog: u32,
        quota: Option<Arc<Quota>>,
    ) -> NmResult<Listener> {
        let endpoints = Endpoints::new();
        self.listen_with(
            iface,
            backlog,
            SockKind::HttpListener,
            ListenOpts {
                accept: AcceptSetup::Http {
                    endpoints: Arc::clone(&endpoints),
                    tls,
                    max_streams: self.shared.config.http_max_concurrent_streams,
                },
                quota,
            },
            Some(endpoints),
        )
    }

    fn listen_with(
        &self,
        iface: SocketAddr,
        backlog: u32,
        kind: SockKind,
        opts: ListenOpts,
        endpoints: Option<Arc<Endpoints>>,
    ) -> NmResult<Listener> {
        if self.shared.is_closing() {
            return Err(NmError::Canceled);
        }
        let worker = self.shared.random_worker();
        let sock = Socket::new(&self.shared, kind, worker);
        self.shared.enqueue(
            worker,
            NetEvent::Listen {
                sock: Arc::clone(&sock),
                iface,
                backlog,
                opts,
            },
        );
        match sock.wait.wait() {
            Ok(()) => Ok(Listener { sock, endpoints }),
            Err(e) => {
                sock.detach();
                Err(e)
            }
        }
    }

    /// Stop a listener; idempotent and asynchronous.
    pub fn stop_listening(&self, listener: &Listener) {
        listener.stop();
    }

    // -- Client establishment ------------------------------------------

    /// Open a plain TCP connection; `cb` fires with the connected handle
    /// or the failure.
    pub fn connect_tcp(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        timeout: Duration,
    ) -> NmResult<()> {
        self.connect_with(local, peer, timeout, ConnSetup::Tcp { cb })
    }

    /// Open a TLS connection; `cb` fires after the handshake completes.
    pub fn connect_tls(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        server_name: &str,
        cb: ConnectCb,
        tls: Arc<rustls::ClientConfig>,
        timeout: Duration,
    ) -> NmResult<()> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| NmError::Failure)?;
        self.connect_with(
            local,
            peer,
            timeout,
            ConnSetup::Tls {
                cb,
                tls,
                server_name,
            },
        )
    }

    /// Open a DNS stream connection, optionally over TLS. `recv_cb`
    /// fires once per complete response message.
    pub fn connect_streamdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCb,
        recv_cb: SharedRecvCb,
        tls: Option<(Arc<rustls::ClientConfig>, String)>,
        timeout: Duration,
    ) -> NmResult<()> {
        let tls = match tls {
            Some((config, name)) => {
                let name = ServerName::try_from(name).map_err(|_| NmError::Failure)?;
                Some((config, name))
            }
            None => None,
        };
        self.connect_with(
            local,
            peer,
            timeout,
            ConnSetup::StreamDns { cb, recv_cb, tls },
        )
    }

    /// Compose and send one DoH request; `resp_cb` fires exactly once
    /// with the decoded response body or the failure.
    ///
    /// `https` URLs require an `h2` ALPN negotiation; a context without
    /// ALPN protocols gets `h2` added.
    pub fn http_connect_send_request(
        &self,
        url: &str,
        method: HttpMethod,
        body: &[u8],
        resp_cb: ResponseCb,
        tls: Option<Arc<rustls::ClientConfig>>,
        timeout: Duration,
    ) -> NmResult<()> {
        let url = Url::parse(url)?;
        let peer = url.socket_addr()?;

        let tls = if url.scheme.is_tls() {
            let config = match tls {
                Some(config) if !config.alpn_protocols.is_empty() => config,
                Some(config) => crate::tls::with_h2_alpn(&config),
                None => crate::tls::client_config_h2(),
            };
            let server_name =
                ServerName::try_from(url.host.clone()).map_err(|_| NmError::Failure)?;
            Some((config, server_name))
        } else {
            None
        };

        let request = DohRequest {
            method,
            https: url.scheme.is_tls(),
            authority: url.authority(),
            path: url.path.clone(),
            body: body.to_vec(),
        };

        self.connect_with(None, peer, timeout, ConnSetup::Http {
            tls,
            request,
            resp_cb,
        })
    }

    fn connect_with(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
        setup: ConnSetup,
    ) -> NmResult<()> {
        if self.shared.is_closing() {
            return Err(NmError::Canceled);
        }
        let worker = self.shared.random_worker();
        let sock = Socket::new(&self.shared, SockKind::TcpConnected, worker);
        self.shared.enqueue(
            worker,
            NetEvent::Connect {
                sock: Arc::clone(&sock),
                local,
                peer,
                timeout,
                setup,
            },
        );
        // The worker owns the creation reference from here; it posts the
        // setup result once the connect is in flight.
        sock.wait.wait()
    }

    // -- Shutdown -------------------------------------------------------

    /// Initiate shutdown of every socket on every worker.
    pub fn closedown(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in 0..self.shared.nworkers() {
            self.shared.enqueue(worker, NetEvent::Stop);
        }
    }

    /// Shut down and wait for the workers to quiesce.
    pub fn destroy(&self) {
        self.closedown();
        let joins: Vec<JoinHandle<()>> = std::mem::take(&mut *self.joins.lock());
        for handle in joins {
            let _ = handle.join();
        }
    }
}

impl Drop for NetMgr {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interlock_is_exclusive() {
        let mgr = NetMgr::new(NetMgrConfig {
            workers: 1,
            ..NetMgrConfig::default()
        });
        assert!(mgr.shared.acquire_interlock());
        assert!(!mgr.shared.acquire_interlock());
        mgr.shared.release_interlock();
        assert!(mgr.shared.acquire_interlock());
        mgr.shared.release_interlock();
    }

    #[test]
    fn random_worker_stays_in_range() {
        let mgr = NetMgr::new(NetMgrConfig {
            workers: 3,
            ..NetMgrConfig::default()
        });
        for _ in 0..64 {
            assert!(mgr.shared.random_worker() < 3);
        }
    }

    #[test]
    fn socket_ids_are_unique() {
        let mgr = NetMgr::new(NetMgrConfig {
            workers: 1,
            ..NetMgrConfig::default()
        });
        let a = mgr.shared.next_socket_id();
        let b = mgr.shared.next_socket_id();
        assert_ne!(a, b);
    }

    #[test]
    fn listen_after_closedown_is_canceled() {
        let mgr = NetMgr::new(NetMgrConfig {
            workers: 1,
            ..NetMgrConfig::default()
        });
        mgr.closedown();
        let err = mgr
            .listen_tcp(
                "127.0.0.1:0".parse().unwrap(),
                Arc::new(|_, _| {}),
                16,
                None,
            )
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, NmError::Canceled);
    }
}
