//! DoH transport integration tests: GET and POST exchanges over plain
//! TCP and TLS carriers, endpoint routing, and failure mapping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use netmgr::{HttpMethod, NetMgr, NetMgrConfig, NmError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

fn test_mgr(workers: usize) -> Arc<NetMgr> {
    let config = NetMgrConfig {
        workers,
        ..NetMgrConfig::default()
    };
    NetMgr::new(config)
}

fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (vec![CertificateDer::from(cert.cert)], key.into())
}

fn client_h2_trusting(certs: &[CertificateDer<'static>]) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

/// A token DNS query and its "answer" (the payload is opaque to the
/// transport; any bytes do).
const QUERY: &[u8] = &[
    0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, b'a', 0x00,
    0x00, 0x01, 0x00, 0x01,
];
const ANSWER: &[u8] = &[
    0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, b'a', 0x00,
    0x00, 0x01, 0x00, 0x01, 0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3c, 0x00,
    0x04, 192, 0, 2, 1,
];

fn doh_exchange(method: HttpMethod, tls: bool) {
    let mgr = test_mgr(2);

    let (certs, server_tls) = if tls {
        let (certs, key) = self_signed();
        let config = netmgr::tls::server_config_h2(certs.clone(), key).unwrap();
        (Some(certs), Some(config))
    } else {
        (None, None)
    };

    let listener = mgr
        .listen_http("127.0.0.1:0".parse().unwrap(), server_tls, 16, None)
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // The endpoint answers every query with the canned response.
    let queries = Arc::new(AtomicUsize::new(0));
    let queries2 = queries.clone();
    listener
        .add_doh_endpoint(
            "/dns-query",
            Arc::new(move |handle, region| {
                let region = region.expect("request payload");
                assert_eq!(region, QUERY);
                queries2.fetch_add(1, Ordering::SeqCst);
                handle.send(ANSWER, Box::new(|_, result| result.unwrap()));
            }),
        )
        .unwrap();

    let scheme = if tls { "https" } else { "http" };
    let url = format!("{}://127.0.0.1:{}/dns-query", scheme, addr.port());

    let (tx, rx) = channel();
    mgr.http_connect_send_request(
        &url,
        method,
        QUERY,
        Box::new(move |_, result| {
            let _ = tx.send(result.map(|r| r.to_vec()));
        }),
        certs.as_ref().map(|c| client_h2_trusting(c)),
        Duration::from_secs(5),
    )
    .unwrap();

    let body = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(body, ANSWER);
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    listener.stop();
    mgr.destroy();
}

#[test]
fn doh_get_over_tls() {
    doh_exchange(HttpMethod::Get, true);
}

#[test]
fn doh_post_over_tls() {
    doh_exchange(HttpMethod::Post, true);
}

#[test]
fn doh_get_plain_tcp() {
    doh_exchange(HttpMethod::Get, false);
}

#[test]
fn doh_post_plain_tcp() {
    doh_exchange(HttpMethod::Post, false);
}

#[test]
fn unknown_path_fails_with_invalid_proto() {
    let mgr = test_mgr(1);

    let listener = mgr
        .listen_http("127.0.0.1:0".parse().unwrap(), None, 16, None)
        .unwrap();
    let addr = listener.local_addr().unwrap();
    listener
        .add_doh_endpoint("/dns-query", Arc::new(|_, _| {}))
        .unwrap();

    let url = format!("http://127.0.0.1:{}/other-path", addr.port());
    let (tx, rx) = channel();
    mgr.http_connect_send_request(
        &url,
        HttpMethod::Get,
        QUERY,
        Box::new(move |_, result| {
            let _ = tx.send(result.map(|r| r.to_vec()));
        }),
        None,
        Duration::from_secs(5),
    )
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(result.unwrap_err(), NmError::InvalidProto);

    listener.stop();
    mgr.destroy();
}

#[test]
fn concurrent_requests_each_get_one_response() {
    let mgr = test_mgr(2);

    let listener = mgr
        .listen_http("127.0.0.1:0".parse().unwrap(), None, 16, None)
        .unwrap();
    let addr = listener.local_addr().unwrap();
    listener
        .add_doh_endpoint(
            "/dns-query",
            Arc::new(|handle, region| {
                // Echo the query back as the answer.
                let region = region.expect("request payload");
                handle.send(region, Box::new(|_, _| {}));
            }),
        )
        .unwrap();

    let url = format!("http://127.0.0.1:{}/dns-query", addr.port());
    let (tx, rx) = channel();
    for i in 0..8u8 {
        let tx = tx.clone();
        let query = vec![i; 24];
        let sent = query.clone();
        mgr.http_connect_send_request(
            &url,
            if i % 2 == 0 {
                HttpMethod::Get
            } else {
                HttpMethod::Post
            },
            &query,
            Box::new(move |_, result| {
                let _ = tx.send((sent, result.map(|r| r.to_vec())));
            }),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
    }
    drop(tx);

    for _ in 0..8 {
        let (sent, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result.unwrap(), sent);
    }

    listener.stop();
    mgr.destroy();
}

#[test]
fn bad_url_is_rejected_synchronously() {
    let mgr = test_mgr(1);

    let err = mgr
        .http_connect_send_request(
            "ftp://127.0.0.1/dns-query",
            HttpMethod::Get,
            QUERY,
            Box::new(|_, _| {}),
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
    assert_eq!(err, NmError::Failure);

    let err = mgr
        .http_connect_send_request(
            "https://dns.example/dns-query",
            HttpMethod::Get,
            QUERY,
            Box::new(|_, _| {}),
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
    assert_eq!(err, NmError::Failure);

    mgr.destroy();
}
