//! netmgr - event-driven DNS transport core.
//!
//! A multi-threaded transport subsystem that multiplexes DNS traffic
//! across TCP, TLS, and HTTP/2 (DNS-over-HTTPS). A fixed pool of worker
//! threads each runs a poll-based event loop; every socket is pinned to
//! one worker for its lifetime and cross-thread work travels as events
//! on the owning worker's queue. Admission is gated by a counting
//! [`Quota`] with a waiter queue.
//!
//! The crate makes no interpretation of DNS payloads beyond framing:
//! length prefixes on DNS streams, HTTP/2 on DoH.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netmgr::{NetMgr, NetMgrConfig, Quota};
//!
//! let mgr = NetMgr::new(NetMgrConfig::default());
//! let quota = Quota::with_max(1024);
//!
//! // Echo server: every accepted connection reads and writes back.
//! let listener = mgr
//!     .listen_tcp(
//!         "127.0.0.1:5300".parse().unwrap(),
//!         Arc::new(|handle, result| {
//!             if result.is_err() {
//!                 return;
//!             }
//!             let _ = handle.read(Box::new(|handle, region| {
//!                 if let Ok(region) = region {
//!                     handle.send(region, Box::new(|_, _| {}));
//!                 }
//!             }));
//!         }),
//!         128,
//!         Some(quota),
//!     )
//!     .unwrap();
//!
//! // ... serve ...
//! listener.stop();
//! mgr.destroy();
//! ```

mod config;
mod conn;
mod errors;
mod event;
pub mod http;
mod manager;
pub mod metrics;
mod quota;
mod socket;
mod streamdns;
mod tcp;
pub mod tls;
mod worker;

pub use config::NetMgrConfig;
pub use errors::{NmError, NmResult};
pub use event::{AcceptCb, ConnectCb, RecvCb, ResponseCb, SendCb, SharedRecvCb};
pub use http::{DNS_MESSAGE_CONTENT_TYPE, Endpoints, HttpMethod};
pub use manager::{Listener, NetMgr};
pub use quota::{Quota, QuotaAttach, QuotaCb, QuotaRef};
pub use socket::{Handle, SockKind, Socket, SocketId};
