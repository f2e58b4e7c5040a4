//! The I/O worker: one thread, one poll loop, one inbound event queue.
//!
//! Each loop iteration drains the cross-thread event queue, polls for
//! socket readiness, dispatches it, and expires timers. All state for a
//! socket lives here, on its owning worker; nothing below the manager
//! takes a lock on the hot path.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::conn::{CloseReason, ConnState, PendingConnect};
use crate::errors::NmError;
use crate::event::{AcceptSetup, ListenOpts, NetEvent};
use crate::manager::MgrShared;
use crate::metrics::{ACCEPT_QUOTA_DROPS, ACCEPTS, CONNECTS};
use crate::quota::{QuotaAttach, QuotaRef};
use crate::socket::{Handle, SockKind, Socket, SocketId};
use crate::tcp;

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// Poll granularity; cross-thread events and timers are observed at this
/// cadence when the loop is otherwise idle.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Route {
    Conn(usize),
    Listener(usize),
}

struct ListenerState {
    sock: Arc<Socket>,
    listener: mio::net::TcpListener,
    opts: ListenOpts,
}

pub(crate) fn worker_main(index: usize, mgr: Arc<MgrShared>, rx: Receiver<NetEvent>) {
    let recv_buffer_size = mgr.config.recv_buffer_size;
    let mut state = WorkerState {
        index,
        mgr,
        poll: match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                tracing::error!(worker = index, error = %e, "poll creation failed");
                return;
            }
        },
        rx,
        conns: Slab::with_capacity(256),
        listeners: Slab::with_capacity(8),
        routes: HashMap::new(),
        recvbuf: vec![0u8; recv_buffer_size],
        recvbuf_inuse: false,
        stopping: false,
    };
    state.run();
    tracing::debug!(worker = index, "worker quiesced");
}

struct WorkerState {
    index: usize,
    mgr: Arc<MgrShared>,
    poll: Poll,
    rx: Receiver<NetEvent>,
    conns: Slab<ConnState>,
    listeners: Slab<ListenerState>,
    routes: HashMap<SocketId, Route>,
    recvbuf: Vec<u8>,
    recvbuf_inuse: bool,
    stopping: bool,
}

impl WorkerState {
    fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.handle_event(event);
            }
            if self.stopping && self.conns.is_empty() && self.listeners.is_empty() {
                break;
            }

            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(worker = self.index, error = %e, "poll failed");
                    break;
                }
            }

            let ready: Vec<(usize, bool, bool)> = events
                .iter()
                .map(|e| (e.token().0, e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                if token >= LISTENER_TOKEN_OFFSET {
                    if readable {
                        self.accept_pending(token - LISTENER_TOKEN_OFFSET);
                    }
                } else {
                    if writable {
                        self.conn_writable(token);
                    }
                    if readable {
                        self.conn_readable(token);
                    }
                }
            }

            self.sweep_timers();
        }
    }

    // -- Event queue ---------------------------------------------------

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Listen {
                sock,
                iface,
                backlog,
                opts,
            } => self.start_listening(sock, iface, backlog, opts),
            NetEvent::StopListening { sock } => self.stop_listening(sock),
            NetEvent::ChildAccept {
                child,
                fd,
                peer,
                setup,
                quota,
            } => self.child_accept(child, fd, peer, setup, quota),
            NetEvent::AcceptRetry { listener, slot } => {
                match self.routes.get(&listener.id()) {
                    Some(Route::Listener(key)) => {
                        let key = *key;
                        if self.accept_one(key, Some(slot)) {
                            self.accept_pending(key);
                        }
                    }
                    // Listener went away; the slot releases on drop.
                    _ => drop(slot),
                }
            }
            NetEvent::Connect {
                sock,
                local,
                peer,
                timeout,
                setup,
            } => self.start_connect(sock, local, peer, timeout, setup),
            NetEvent::StartRead { sock, cb } => {
                let Some(key) = self.conn_key(&sock) else {
                    tracing::debug!(id = sock.id().value(), "read on a vanished socket");
                    return;
                };
                let outcome = {
                    let Self { conns, mgr, .. } = self;
                    conns.get_mut(key).and_then(|conn| conn.start_read(mgr, cb))
                };
                if let Some(reason) = outcome {
                    self.close_conn(key, reason);
                } else {
                    // There may be carrier bytes already waiting.
                    self.conn_readable(key);
                }
            }
            NetEvent::PauseRead { sock } => sock.set_read_paused(true),
            NetEvent::ResumeRead { sock } => {
                sock.set_read_paused(false);
                if let Some(key) = self.conn_key(&sock) {
                    let outcome = {
                        let Self { conns, mgr, .. } = self;
                        conns.get_mut(key).and_then(|conn| conn.drive_tls(mgr).err())
                    };
                    if let Some(reason) = outcome {
                        self.close_conn(key, reason);
                    } else {
                        self.conn_readable(key);
                    }
                }
            }
            NetEvent::CancelRead { sock } => {
                if let Some(key) = self.conn_key(&sock)
                    && let Some(conn) = self.conns.get_mut(key)
                {
                    conn.cancel_read();
                }
            }
            NetEvent::SetTimeout { sock, timeout } => {
                if let Some(key) = self.conn_key(&sock)
                    && let Some(conn) = self.conns.get_mut(key)
                {
                    conn.read_timeout = timeout;
                    conn.timeout_overridden = true;
                    if conn.reading {
                        conn.read_deadline = Some(Instant::now() + timeout);
                    }
                }
            }
            NetEvent::Send {
                sock,
                stream,
                data,
                cb,
            } => {
                let Some(key) = self.conn_key(&sock) else {
                    if let Some(cb) = cb {
                        cb(&Handle::new(&sock), Err(NmError::Canceled));
                    }
                    return;
                };
                let outcome = {
                    let Self { conns, mgr, .. } = self;
                    conns
                        .get_mut(key)
                        .and_then(|conn| conn.send_app(mgr, stream, data, cb))
                };
                if let Some(reason) = outcome {
                    self.close_conn(key, reason);
                }
            }
            NetEvent::Close { sock } => match self.routes.get(&sock.id()) {
                Some(Route::Conn(key)) => {
                    let key = *key;
                    self.close_conn(key, CloseReason::Graceful);
                }
                Some(Route::Listener(_)) => self.stop_listening(sock),
                None => {}
            },
            NetEvent::Stop => self.stop_worker(),
        }
    }

    fn conn_key(&self, sock: &Arc<Socket>) -> Option<usize> {
        match self.routes.get(&sock.id()) {
            Some(Route::Conn(key)) => Some(*key),
            _ => None,
        }
    }

    // -- Listeners -----------------------------------------------------

    fn start_listening(
        &mut self,
        sock: Arc<Socket>,
        iface: std::net::SocketAddr,
        backlog: u32,
        opts: ListenOpts,
    ) {
        if self.stopping || self.mgr.is_closing() {
            sock.wait.post(Err(NmError::Canceled));
            return;
        }
        let std_listener = match tcp::bind_listen(iface, backlog) {
            Ok(listener) => listener,
            Err(e) => {
                sock.set_listen_error();
                sock.mark_closed();
                sock.wait.post(Err(e));
                return;
            }
        };
        let local = std_listener.local_addr().ok();
        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let entry = self.listeners.vacant_entry();
        let key = entry.key();
        if let Err(e) = self.poll.registry().register(
            &mut listener,
            Token(key + LISTENER_TOKEN_OFFSET),
            Interest::READABLE,
        ) {
            sock.set_listen_error();
            sock.mark_closed();
            sock.wait.post(Err(NmError::from_io(&e)));
            return;
        }

        if let Some(local) = local {
            sock.set_local(local);
        }
        sock.set_listening(true);
        sock.set_accepting(true);
        self.routes.insert(sock.id(), Route::Listener(key));
        entry.insert(ListenerState {
            sock: Arc::clone(&sock),
            listener,
            opts,
        });
        tracing::debug!(worker = self.index, ?local, "listening");
        sock.wait.post(Ok(()));
    }

    /// Stop a listener. Serialized against accept processing through the
    /// manager interlock; when the interlock is busy the event re-enqueues
    /// itself, bounded by the shutdown flag.
    fn stop_listening(&mut self, sock: Arc<Socket>) {
        if !self.mgr.acquire_interlock() {
            if !self.mgr.is_closing() {
                let target = sock.worker;
                self.mgr.enqueue(target, NetEvent::StopListening { sock });
            }
            return;
        }

        if let Some(Route::Listener(key)) = self.routes.remove(&sock.id()) {
            let mut state = self.listeners.remove(key);
            let _ = self.poll.registry().deregister(&mut state.listener);
            state.sock.begin_close();
            state.sock.mark_closed();
            tracing::debug!(worker = self.index, id = sock.id().value(), "listener stopped");
        }

        self.mgr.release_interlock();
    }

    fn accept_pending(&mut self, key: usize) {
        loop {
            let Some(listener) = self.listeners.get(key) else {
                return;
            };

            if self.mgr.is_closing() {
                // Shed the backlog; new connections are canceled.
                while listener.listener.accept().is_ok() {}
                return;
            }

            let slot = match &listener.opts.quota {
                Some(quota) => {
                    let retry_sock = Arc::clone(&listener.sock);
                    let mgr = Arc::downgrade(&self.mgr);
                    match quota.attach_cb(Box::new(move |slot| {
                        if let Some(mgr) = mgr.upgrade() {
                            mgr.enqueue(
                                retry_sock.owner_worker(),
                                NetEvent::AcceptRetry {
                                    listener: retry_sock,
                                    slot,
                                },
                            );
                        }
                    })) {
                        QuotaAttach::Granted(slot) | QuotaAttach::Soft(slot) => Some(slot),
                        QuotaAttach::Queued => {
                            // Leave the connection in the backlog; the
                            // quota fires the retry when a slot frees.
                            ACCEPT_QUOTA_DROPS.increment();
                            return;
                        }
                    }
                }
                None => None,
            };

            if !self.accept_one(key, slot) {
                return;
            }
        }
    }

    /// Accept one connection and hand it to a uniformly random worker.
    /// Returns whether the accept loop should continue.
    fn accept_one(&mut self, key: usize, slot: Option<QuotaRef>) -> bool {
        let Some(listener) = self.listeners.get(key) else {
            return false;
        };
        match listener.listener.accept() {
            Ok((stream, peer)) => {
                let target = self.mgr.random_worker();
                let child = Socket::new(&self.mgr, SockKind::TcpConnected, target);
                child.set_server(Arc::clone(&listener.sock));
                child.set_peer(peer);
                let setup = listener.opts.accept.clone();
                let fd = stream.into_raw_fd();
                self.mgr.enqueue(
                    target,
                    NetEvent::ChildAccept {
                        child,
                        fd,
                        peer,
                        setup,
                        quota: slot,
                    },
                );
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                tracing::warn!(worker = self.index, error = %e, "accept failed");
                false
            }
        }
    }

    /// An accepted fd arriving at its owning worker.
    fn child_accept(
        &mut self,
        child: Arc<Socket>,
        fd: std::os::fd::RawFd,
        peer: std::net::SocketAddr,
        setup: AcceptSetup,
        quota: Option<QuotaRef>,
    ) {
        // The fd was exported by the accepting worker; this worker owns
        // it from here on.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let mut stream = mio::net::TcpStream::from_std(std_stream);

        if self.stopping || self.mgr.is_closing() {
            child.mark_closed();
            child.detach();
            return;
        }

        let entry = self.conns.vacant_entry();
        let key = entry.key();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(worker = self.index, error = %e, "child registration failed");
            child.mark_closed();
            child.detach();
            return;
        }

        child.set_peer(peer);
        if let Ok(local) = stream.local_addr() {
            child.set_local(local);
        }
        child.set_connected();

        let soft = quota.as_ref().map(|q| q.is_soft()).unwrap_or(false);
        let mut conn = ConnState::new(
            Arc::clone(&child),
            stream,
            self.mgr.config.idle_timeout(),
            self.mgr.config.keepalive_timeout(),
        );
        conn.quota = quota;

        match conn.apply_accept_setup(&self.mgr, setup, soft) {
            Ok(()) => {
                ACCEPTS.increment();
                entry.insert(conn);
                self.refresh_routes(key);
                // The client may already have bytes in flight.
                self.conn_readable(key);
                self.conn_writable(key);
            }
            Err(reason) => {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                conn.teardown(&reason);
            }
        }
    }

    // -- Outbound connections -------------------------------------------

    fn start_connect(
        &mut self,
        sock: Arc<Socket>,
        local: Option<std::net::SocketAddr>,
        peer: std::net::SocketAddr,
        timeout: Duration,
        setup: crate::event::ConnSetup,
    ) {
        if self.stopping || self.mgr.is_closing() {
            sock.wait.post(Err(NmError::Canceled));
            sock.mark_closed();
            sock.detach();
            return;
        }

        let std_stream = match tcp::connect_start(local, peer) {
            Ok(stream) => stream,
            Err(e) => {
                let err = NmError::from_io(&e);
                sock.mark_closed();
                sock.detach();
                sock.wait.post(Err(err));
                return;
            }
        };
        let mut stream = mio::net::TcpStream::from_std(std_stream);

        let entry = self.conns.vacant_entry();
        let key = entry.key();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            let err = NmError::from_io(&e);
            sock.mark_closed();
            sock.detach();
            sock.wait.post(Err(err));
            return;
        }

        sock.set_connecting(true);
        let mut conn = ConnState::new(
            Arc::clone(&sock),
            stream,
            self.mgr.config.idle_timeout(),
            self.mgr.config.keepalive_timeout(),
        );
        // A DoH request's timeout covers the whole exchange, not just the
        // connect.
        if matches!(setup, crate::event::ConnSetup::Http { .. }) {
            conn.read_timeout = timeout;
            conn.timeout_overridden = true;
        }
        conn.connect = Some(PendingConnect {
            setup,
            deadline: Instant::now() + timeout,
        });
        entry.insert(conn);
        self.routes.insert(sock.id(), Route::Conn(key));
        CONNECTS.increment();
        sock.wait.post(Ok(()));
    }

    // -- Readiness dispatch ---------------------------------------------

    fn conn_readable(&mut self, key: usize) {
        let outcome = {
            let Self {
                conns,
                mgr,
                recvbuf,
                recvbuf_inuse,
                ..
            } = self;
            let Some(conn) = conns.get_mut(key) else {
                return;
            };
            conn.on_readable(mgr, recvbuf.as_mut_slice(), recvbuf_inuse)
        };
        if let Some(reason) = outcome {
            self.close_conn(key, reason);
        }
    }

    fn conn_writable(&mut self, key: usize) {
        let outcome = {
            let Self { conns, mgr, .. } = self;
            let Some(conn) = conns.get_mut(key) else {
                return;
            };
            conn.on_writable(mgr)
        };
        // Connect completion may have layered new overlay sockets.
        self.refresh_routes(key);
        if let Some(reason) = outcome {
            self.close_conn(key, reason);
        }
    }

    fn refresh_routes(&mut self, key: usize) {
        let ids = match self.conns.get(key) {
            Some(conn) => conn.socket_ids(),
            None => return,
        };
        for id in ids {
            self.routes.insert(id, Route::Conn(key));
        }
    }

    // -- Timers and teardown -------------------------------------------

    fn sweep_timers(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (key, conn) in self.conns.iter_mut() {
            if let Some(reason) = conn.check_timers(now) {
                expired.push((key, reason));
            }
        }
        for (key, reason) in expired {
            self.close_conn(key, reason);
        }
    }

    fn close_conn(&mut self, key: usize, reason: CloseReason) {
        let Some(mut conn) = self.conns.try_remove(key) else {
            return;
        };
        // First closing transition wins; teardown still runs because the
        // state is leaving the table now either way.
        conn.sock.begin_close();
        for id in conn.socket_ids() {
            self.routes.remove(&id);
        }
        let _ = self.poll.registry().deregister(&mut conn.stream);
        conn.teardown(&reason);
    }

    /// Manager shutdown: everything on this worker fails with Canceled.
    fn stop_worker(&mut self) {
        self.stopping = true;

        let conn_keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in conn_keys {
            self.close_conn(key, CloseReason::Error(NmError::Canceled));
        }

        let listener_keys: Vec<usize> = self.listeners.iter().map(|(key, _)| key).collect();
        for key in listener_keys {
            let mut state = self.listeners.remove(key);
            let _ = self.poll.registry().deregister(&mut state.listener);
            self.routes.remove(&state.sock.id());
            state.sock.mark_closed();
        }
    }
}
