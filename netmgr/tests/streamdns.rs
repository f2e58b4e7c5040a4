//! DNS stream framing integration tests.

use std::io::{Read, Write};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use netmgr::{NetMgr, NetMgrConfig};

fn test_mgr(workers: usize) -> Arc<NetMgr> {
    let config = NetMgrConfig {
        workers,
        ..NetMgrConfig::default()
    };
    NetMgr::new(config)
}

#[test]
fn message_roundtrip() {
    let mgr = test_mgr(2);

    // Server: echo each complete DNS message.
    let listener = mgr
        .listen_streamdns(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(|_, result| {
                result.unwrap();
            }),
            Arc::new(|handle, region| {
                if let Ok(region) = region {
                    handle.send(region, Box::new(|_, _| {}));
                }
            }),
            16,
            None,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx_msgs, rx) = channel();
    mgr.connect_streamdns(
        None,
        addr,
        Box::new(move |handle, result| {
            result.unwrap();
            // Two pipelined messages; each echoes back whole.
            handle.send(b"\x12\x34first-message", Box::new(|_, r| r.unwrap()));
            handle.send(b"\x56\x78second", Box::new(|_, r| r.unwrap()));
        }),
        Arc::new(move |_, region| {
            if let Ok(region) = region {
                let _ = tx_msgs.send(region.to_vec());
            }
        }),
        None,
        Duration::from_secs(5),
    )
    .unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, b"\x12\x34first-message");
    assert_eq!(second, b"\x56\x78second");

    listener.stop();
    mgr.destroy();
}

#[test]
fn reassembles_messages_split_across_segments() {
    let mgr = test_mgr(1);

    let (tx, rx) = channel();
    let listener = mgr
        .listen_streamdns(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(|_, _| {}),
            Arc::new(move |handle, region| {
                if let Ok(region) = region {
                    let _ = tx.send(region.to_vec());
                    // Echo so the raw client can verify framing too.
                    handle.send(region, Box::new(|_, _| {}));
                }
            }),
            16,
            None,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // Raw client dribbling one frame across three segments.
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.write_all(&[0x00]).unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(&[0x05, b'd', b'n']).unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(&[b's', b'!', b'!']).unwrap();
    stream.flush().unwrap();

    let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(message, b"dns!!");

    // The echo comes back with the length prefix intact.
    let mut response = [0u8; 7];
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.read_exact(&mut response).unwrap();
    assert_eq!(&response, &[0x00, 0x05, b'd', b'n', b's', b'!', b'!']);

    listener.stop();
    mgr.destroy();
}

#[test]
fn oversized_send_fails() {
    let mgr = test_mgr(1);

    let listener = mgr
        .listen_streamdns(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(|_, _| {}),
            Arc::new(|_, _| {}),
            16,
            None,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = channel();
    mgr.connect_streamdns(
        None,
        addr,
        Box::new(move |handle, result| {
            result.unwrap();
            let big = vec![0u8; u16::MAX as usize + 1];
            let tx2 = tx.clone();
            handle.send(
                &big,
                Box::new(move |_, result| {
                    let _ = tx2.send(result);
                }),
            );
        }),
        Arc::new(|_, _| {}),
        None,
        Duration::from_secs(5),
    )
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_err());

    listener.stop();
    mgr.destroy();
}
