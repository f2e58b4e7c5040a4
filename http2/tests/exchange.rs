//! Full session-to-session exchanges with bytes shuttled in memory.

use http2::{
    ClientEvent, ClientSession, HeaderField, ServerEvent, ServerSession, SessionSettings, StreamId,
};

/// Move pending output from each side to the other until both are idle.
fn shuttle(client: &mut ClientSession, server: &mut ServerSession) {
    loop {
        let mut moved = false;
        if client.has_pending_send() {
            let bytes = client.pending_send().to_vec();
            client.advance_send(bytes.len());
            server.feed(&bytes);
            moved = true;
        }
        if server.has_pending_send() {
            let bytes = server.pending_send().to_vec();
            server.advance_send(bytes.len());
            client.feed(&bytes);
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

#[test]
fn handshake_then_request_response() {
    let mut client = ClientSession::new(SessionSettings::default());
    let mut server = ServerSession::new(SessionSettings::default());

    client.start();
    shuttle(&mut client, &mut server);
    assert!(client.is_ready());
    assert!(server.is_ready());
    client.poll_events();
    server.poll_events();

    // POST-style request with a body.
    let stream = client
        .start_request(
            &[
                HeaderField::new(":method", "POST"),
                HeaderField::new(":scheme", "https"),
                HeaderField::new(":authority", "dns.example"),
                HeaderField::new(":path", "/dns-query"),
                HeaderField::new("content-type", "application/dns-message"),
            ],
            false,
        )
        .unwrap();
    client.send_data(stream, b"\x00\x01query", true).unwrap();
    shuttle(&mut client, &mut server);

    let mut request_stream = None;
    let mut body = Vec::new();
    for event in server.poll_events() {
        match event {
            ServerEvent::Request {
                stream, headers, ..
            } => {
                assert!(headers.contains(&HeaderField::new(":path", "/dns-query")));
                request_stream = Some(stream);
            }
            ServerEvent::Data {
                data, end_stream, ..
            } => {
                body.extend_from_slice(&data);
                assert!(end_stream);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    let request_stream = request_stream.expect("request event");
    assert_eq!(body, b"\x00\x01query");

    // Respond.
    server
        .send_headers(
            request_stream,
            &[
                HeaderField::new(":status", "200"),
                HeaderField::new("content-type", "application/dns-message"),
            ],
            false,
        )
        .unwrap();
    server
        .send_data(request_stream, b"\x00\x01answer", true)
        .unwrap();
    shuttle(&mut client, &mut server);

    let mut status_seen = false;
    let mut response = Vec::new();
    for event in client.poll_events() {
        match event {
            ClientEvent::Headers { headers, .. } => {
                assert!(headers.contains(&HeaderField::new(":status", "200")));
                status_seen = true;
            }
            ClientEvent::Data { data, .. } => response.extend_from_slice(&data),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(status_seen);
    assert_eq!(response, b"\x00\x01answer");
}

#[test]
fn multiplexed_requests_keep_their_streams() {
    let mut client = ClientSession::new(SessionSettings::default());
    let mut server = ServerSession::new(SessionSettings::default());
    client.start();
    shuttle(&mut client, &mut server);
    client.poll_events();
    server.poll_events();

    let s1 = client.start_request(&[HeaderField::new(":path", "/a")], true).unwrap();
    let s2 = client.start_request(&[HeaderField::new(":path", "/b")], true).unwrap();
    shuttle(&mut client, &mut server);

    let mut seen = Vec::new();
    for event in server.poll_events() {
        if let ServerEvent::Request { stream, headers, .. } = event {
            seen.push((stream, headers));
        }
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, s1);
    assert_eq!(seen[1].0, s2);

    // Answer in reverse order; each response lands on its own stream.
    for &(stream, tag) in &[(s2, b"B" as &[u8]), (s1, b"A")] {
        server
            .send_headers(stream, &[HeaderField::new(":status", "200")], false)
            .unwrap();
        server.send_data(stream, tag, true).unwrap();
    }
    shuttle(&mut client, &mut server);

    let mut responses: Vec<(StreamId, Vec<u8>)> = Vec::new();
    for event in client.poll_events() {
        if let ClientEvent::Data { stream, data, .. } = event {
            responses.push((stream, data.to_vec()));
        }
    }
    assert_eq!(responses.len(), 2);
    assert!(responses.contains(&(s1, b"A".to_vec())));
    assert!(responses.contains(&(s2, b"B".to_vec())));
}

#[test]
fn large_body_crosses_flow_control_window() {
    let mut client = ClientSession::new(SessionSettings::default());
    let mut server = ServerSession::new(SessionSettings::default());
    client.start();
    shuttle(&mut client, &mut server);
    client.poll_events();
    server.poll_events();

    let stream = client.start_request(&[HeaderField::new(":path", "/big")], true).unwrap();
    shuttle(&mut client, &mut server);
    let request_stream = match &server.poll_events()[..] {
        [ServerEvent::Request { stream, .. }] => *stream,
        other => panic!("unexpected events: {:?}", other),
    };
    assert_eq!(request_stream, stream);

    // 100 KiB response: exceeds both the 64 KiB default window and the
    // 16 KiB frame limit, so it needs WINDOW_UPDATEs shuttled back.
    let body: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    server
        .send_headers(stream, &[HeaderField::new(":status", "200")], false)
        .unwrap();

    let mut offset = 0;
    let mut spins = 0;
    while offset < body.len() {
        offset += server.send_data(stream, &body[offset..], true).unwrap();
        shuttle(&mut client, &mut server);
        spins += 1;
        assert!(spins < 64, "flow control never opened");
    }

    let mut received = Vec::new();
    let mut ended = false;
    for event in client.poll_events() {
        if let ClientEvent::Data { data, end_stream, .. } = event {
            received.extend_from_slice(&data);
            ended |= end_stream;
        }
    }
    assert_eq!(received, body);
    assert!(ended);
}
