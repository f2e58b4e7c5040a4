//! Transport metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "netmgr_sockets_active",
    description = "Sockets that are created and not yet destroyed"
)]
pub static SOCKETS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "netmgr_accepts", description = "Connections accepted")]
pub static ACCEPTS: Counter = Counter::new();

#[metric(
    name = "netmgr_accept_quota_drops",
    description = "Accepts deferred because the quota was exhausted"
)]
pub static ACCEPT_QUOTA_DROPS: Counter = Counter::new();

#[metric(
    name = "netmgr_bind_retries",
    description = "Bind attempts retried with reuse or freebind options"
)]
pub static BIND_RETRIES: Counter = Counter::new();

#[metric(name = "netmgr_connects", description = "Outbound connections initiated")]
pub static CONNECTS: Counter = Counter::new();

#[metric(name = "netmgr_bytes_received", description = "Bytes read from carriers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "netmgr_bytes_sent", description = "Bytes written to carriers")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "netmgr_tls_handshakes",
    description = "TLS handshakes completed"
)]
pub static TLS_HANDSHAKES: Counter = Counter::new();

#[metric(name = "netmgr_http_requests", description = "DoH requests dispatched")]
pub static HTTP_REQUESTS: Counter = Counter::new();

#[metric(
    name = "netmgr_read_timeouts",
    description = "Reads failed with a timeout"
)]
pub static READ_TIMEOUTS: Counter = Counter::new();
