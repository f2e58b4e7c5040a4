//! TLS wrapper integration tests: handshake-gated accept, echo with
//! read/send accounting, and ALPN verification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netmgr::{NetMgr, NetMgrConfig, NmError};
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

fn client_config_trusting(
    certs: &[CertificateDer<'static>],
    alpn: &[&[u8]],
) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn tls_echo_single_request() {
    let mgr = test_mgr(2);
    let (certs, key) = self_signed();
    let server_tls = netmgr::tls::server_config(certs.clone(), key).unwrap();
    let client_tls = client_config_trusting(&certs, &[]);

    let sreads = Arc::new(AtomicUsize::new(0));
    let ssends = Arc::new(AtomicUsize::new(0));
    let creads = Arc::new(AtomicUsize::new(0));
    let csends = Arc::new(AtomicUsize::new(0));

    // Server: accept fires only after the handshake; echo one region.
    let sreads2 = sreads.clone();
    let ssends2 = ssends.clone();
    let listener = mgr
        .listen_tls(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |handle, result| {
                if result.is_err() {
                    return;
                }
                let sreads = sreads2.clone();
                let ssends = ssends2.clone();
                let _ = handle.read(Box::new(move |handle, region| {
                    if let Ok(region) = region {
                        sreads.fetch_add(1, Ordering::SeqCst);
                        let ssends = ssends.clone();
                        handle.send(
                            region,
                            Box::new(move |_, result| {
                                result.unwrap();
                                ssends.fetch_add(1, Ordering::SeqCst);
                            }),
                        );
                    }
                }));
            }),
            16,
            None,
            server_tls,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (done_tx, done_rx) = channel();
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let creads2 = creads.clone();
    let csends2 = csends.clone();
    mgr.connect_tls(
        None,
        addr,
        "localhost",
        Box::new(move |handle, result| {
            result.unwrap();
            let received = received2.clone();
            let creads = creads2.clone();
            let done_tx = done_tx.clone();
            let _ = handle.read(Box::new(move |_, region| {
                if let Ok(region) = region {
                    creads.fetch_add(1, Ordering::SeqCst);
                    let mut received = received.lock().unwrap();
                    received.extend_from_slice(region);
                    if received.len() >= 13 {
                        let _ = done_tx.send(());
                    }
                }
            }));
            let csends = csends2.clone();
            handle.send(
                b"ping over tls",
                Box::new(move |_, result| {
                    result.unwrap();
                    csends.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }),
        client_tls,
        Duration::from_secs(5),
    )
    .unwrap();

    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(&*received.lock().unwrap(), b"ping over tls");
    assert_eq!(creads.load(Ordering::SeqCst), 1);
    assert_eq!(csends.load(Ordering::SeqCst), 1);
    assert_eq!(sreads.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        ssends.load(Ordering::SeqCst) == 1
    }));

    listener.stop();
    mgr.destroy();
}

#[test]
fn tls_plaintext_ordering_across_many_sends() {
    let mgr = test_mgr(2);
    let (certs, key) = self_signed();
    let server_tls = netmgr::tls::server_config(certs.clone(), key).unwrap();
    let client_tls = client_config_trusting(&certs, &[]);

    // Server: concatenate everything received and echo nothing.
    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected2 = collected.clone();
    let listener = mgr
        .listen_tls(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |handle, result| {
                if result.is_err() {
                    return;
                }
                let collected = collected2.clone();
                let _ = handle.read(Box::new(move |_, region| {
                    if let Ok(region) = region {
                        collected.lock().unwrap().extend_from_slice(region);
                    }
                }));
            }),
            16,
            None,
            server_tls,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // Client: 32 queued sends; the peer must observe the concatenation
    // in order.
    let mut expected = Vec::new();
    for i in 0..32u8 {
        expected.extend_from_slice(&[i; 64]);
    }
    let expected2 = expected.clone();
    mgr.connect_tls(
        None,
        addr,
        "localhost",
        Box::new(move |handle, result| {
            result.unwrap();
            for i in 0..32u8 {
                handle.send(&[i; 64], Box::new(|_, result| {
                    result.unwrap();
                }));
            }
        }),
        client_tls,
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        collected.lock().unwrap().len() == expected2.len()
    }));
    assert_eq!(&*collected.lock().unwrap(), &expected);

    listener.stop();
    mgr.destroy();
}

#[test]
fn alpn_mismatch_fails_connect() {
    let mgr = test_mgr(1);
    let (certs, key) = self_signed();
    // Server negotiates no ALPN at all.
    let server_tls = netmgr::tls::server_config(certs.clone(), key).unwrap();
    // Client demands the DoT protocol.
    let client_tls = client_config_trusting(&certs, &[b"dot"]);

    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted2 = accepted.clone();
    let listener = mgr
        .listen_tls(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(move |_, result| {
                if result.is_ok() {
                    accepted2.fetch_add(1, Ordering::SeqCst);
                }
            }),
            16,
            None,
            server_tls,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = channel();
    mgr.connect_tls(
        None,
        addr,
        "localhost",
        Box::new(move |_, result| {
            let _ = tx.send(result);
        }),
        client_tls,
        Duration::from_secs(5),
    )
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err(), NmError::DotAlpn);

    listener.stop();
    mgr.destroy();
}

#[test]
fn untrusted_certificate_fails_handshake() {
    let mgr = test_mgr(1);
    let (certs, key) = self_signed();
    let server_tls = netmgr::tls::server_config(certs, key).unwrap();

    // A client trusting a different issuer rejects the peer certificate.
    let (other_certs, _) = self_signed();
    let client_tls = client_config_trusting(&other_certs, &[]);

    let listener = mgr
        .listen_tls(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(|_, _| {}),
            16,
            None,
            server_tls,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = channel();
    mgr.connect_tls(
        None,
        addr,
        "localhost",
        Box::new(move |_, result| {
            let _ = tx.send(result);
        }),
        client_tls,
        Duration::from_secs(5),
    )
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err(), NmError::TlsBadPeerCert);

    listener.stop();
    mgr.destroy();
}
