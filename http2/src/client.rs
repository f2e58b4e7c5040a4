//! Client-side HTTP/2 session.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::flow::RecvWindow;
use crate::frame::{
    CONNECTION_PREFACE, ErrorCode, Frame, FrameDecoder, FrameEncoder, Setting, StreamId, setting,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackEncoder};
use crate::settings::SessionSettings;
use crate::stream::Stream;
use crate::{SessionError, SessionState};

/// Events surfaced by [`ClientSession::poll_events`].
#[derive(Debug)]
pub enum ClientEvent {
    /// Preface and SETTINGS exchange complete; requests may be started.
    Ready,
    /// Response headers for a stream.
    Headers {
        stream: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Response body bytes.
    Data {
        stream: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The server reset a stream.
    StreamReset { stream: StreamId, code: ErrorCode },
    /// The server is going away.
    GoAway { last_stream: StreamId, code: ErrorCode },
    /// Fatal session error; the carrier should be closed.
    Error(SessionError),
}

/// Client half of an HTTP/2 session.
pub struct ClientSession {
    state: SessionState,
    local: SessionSettings,
    remote: SessionSettings,
    got_settings: bool,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    hpack_enc: HpackEncoder,
    hpack_dec: HpackDecoder,
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    send_window: i64,
    recv_window: RecvWindow,
    input: BytesMut,
    out: BytesMut,
    events: Vec<ClientEvent>,
}

impl ClientSession {
    pub fn new(local: SessionSettings) -> Self {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(local.max_frame_size);
        Self {
            state: SessionState::Preface,
            local,
            remote: SessionSettings::default(),
            got_settings: false,
            encoder: FrameEncoder::new(),
            decoder,
            hpack_enc: HpackEncoder::new(),
            hpack_dec: HpackDecoder::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
            send_window: crate::frame::DEFAULT_INITIAL_WINDOW_SIZE as i64,
            recv_window: RecvWindow::new(local.initial_window_size),
            input: BytesMut::with_capacity(16_384),
            out: BytesMut::with_capacity(16_384),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Queue the connection preface and our SETTINGS. Call once, as soon as
    /// the carrier is ready for application data.
    pub fn start(&mut self) {
        if self.state != SessionState::Preface {
            return;
        }
        self.out.extend_from_slice(CONNECTION_PREFACE);
        self.encoder
            .settings(&mut self.out, &self.local.to_settings());
        self.state = SessionState::Settings;
    }

    /// Feed bytes received from the carrier and process them.
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
        loop {
            if self.state == SessionState::Closed {
                return;
            }
            match self.decoder.decode(&mut self.input) {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => return,
                Err(e) => {
                    self.fail(SessionError::Frame(e));
                    return;
                }
            }
        }
    }

    fn fail(&mut self, err: SessionError) {
        self.state = SessionState::Closed;
        self.events.push(ClientEvent::Error(err));
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Settings { ack, settings } => self.on_settings(ack, settings),
            Frame::Ping { ack, payload } => {
                if !ack {
                    self.encoder.ping(&mut self.out, payload, true);
                }
            }
            Frame::GoAway { last_stream, code, .. } => {
                self.state = SessionState::Draining;
                self.events.push(ClientEvent::GoAway { last_stream, code });
            }
            Frame::WindowUpdate { stream, increment } => {
                if stream.is_zero() {
                    self.send_window += increment as i64;
                } else if let Some(s) = self.streams.get_mut(&stream.value()) {
                    s.grow_send_window(increment);
                }
            }
            Frame::Headers {
                stream,
                end_stream,
                end_headers,
                block,
            } => {
                if !end_headers {
                    self.fail(SessionError::Protocol("fragmented header block"));
                    return;
                }
                let headers = match self.hpack_dec.decode(&block) {
                    Ok(h) => h,
                    Err(e) => {
                        self.fail(SessionError::Hpack(e));
                        return;
                    }
                };
                if end_stream && let Some(s) = self.streams.get_mut(&stream.value()) {
                    s.remote_end();
                }
                self.events.push(ClientEvent::Headers {
                    stream,
                    headers,
                    end_stream,
                });
            }
            Frame::Data {
                stream,
                end_stream,
                data,
                flow_len,
            } => {
                let live = match self.streams.get_mut(&stream.value()) {
                    Some(s) => {
                        if end_stream {
                            s.remote_end();
                        }
                        !end_stream && !s.is_closed()
                    }
                    None => false,
                };
                self.recv_window.consume(flow_len);
                if let Some(increment) = self.recv_window.take_update() {
                    self.encoder
                        .window_update(&mut self.out, StreamId::ZERO, increment);
                }
                // Keep the stream window topped up so the sender never
                // stalls on it.
                if live && flow_len > 0 {
                    self.encoder.window_update(&mut self.out, stream, flow_len);
                }
                self.events.push(ClientEvent::Data {
                    stream,
                    data,
                    end_stream,
                });
            }
            Frame::RstStream { stream, code } => {
                if let Some(s) = self.streams.get_mut(&stream.value()) {
                    s.reset();
                }
                self.events.push(ClientEvent::StreamReset { stream, code });
            }
            Frame::Unknown { .. } => {}
        }
    }

    fn on_settings(&mut self, ack: bool, settings: Vec<Setting>) {
        if ack {
            return;
        }
        for s in &settings {
            match s.id {
                setting::HEADER_TABLE_SIZE => {
                    self.remote.header_table_size = s.value;
                    self.hpack_enc.set_table_size(s.value as usize);
                }
                setting::MAX_CONCURRENT_STREAMS => {
                    self.remote.max_concurrent_streams = s.value;
                }
                setting::INITIAL_WINDOW_SIZE => {
                    let delta = s.value as i64 - self.remote.initial_window_size as i64;
                    self.remote.initial_window_size = s.value;
                    for stream in self.streams.values_mut() {
                        stream.adjust_send_window(delta);
                    }
                }
                setting::MAX_FRAME_SIZE => {
                    self.remote.max_frame_size = s.value;
                    self.encoder.set_max_frame_size(s.value);
                }
                setting::MAX_HEADER_LIST_SIZE => {
                    self.remote.max_header_list_size = s.value;
                }
                _ => {}
            }
        }
        self.encoder.settings_ack(&mut self.out);

        if !self.got_settings {
            self.got_settings = true;
            self.state = SessionState::Open;
            self.events.push(ClientEvent::Ready);
        }
    }

    /// Open a new request stream carrying `headers`.
    pub fn start_request(
        &mut self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<StreamId, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::Protocol("session not ready"));
        }
        if self.streams.len() >= self.remote.max_concurrent_streams as usize {
            return Err(SessionError::Protocol("concurrent stream limit reached"));
        }

        let stream = StreamId::new(self.next_stream_id);
        self.next_stream_id += 2;

        let mut s = Stream::new(stream, self.remote.initial_window_size);
        if end_stream {
            s.local_end();
        }
        self.streams.insert(stream.value(), s);

        let mut block = Vec::new();
        self.hpack_enc.encode(headers, &mut block);
        self.encoder.headers(&mut self.out, stream, &block, end_stream);
        Ok(stream)
    }

    /// Send request body bytes; returns how many were accepted under the
    /// current flow-control windows.
    pub fn send_data(
        &mut self,
        stream: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize, SessionError> {
        let max_frame = self.encoder.max_frame_size() as usize;
        let s = self
            .streams
            .get_mut(&stream.value())
            .ok_or(SessionError::Protocol("unknown stream"))?;

        let mut sent = 0;
        while sent < data.len() {
            let window = self.send_window.min(s.send_window());
            if window <= 0 {
                break;
            }
            let n = (data.len() - sent).min(window as usize).min(max_frame);
            let is_end = end_stream && sent + n == data.len();
            self.encoder
                .data(&mut self.out, stream, &data[sent..sent + n], is_end);
            s.consume_send_window(n as u32);
            self.send_window -= n as i64;
            sent += n;
            if is_end {
                s.local_end();
            }
        }

        if data.is_empty() && end_stream {
            self.encoder.data(&mut self.out, stream, &[], true);
            s.local_end();
        }
        Ok(sent)
    }

    /// Reset a stream.
    pub fn reset_stream(&mut self, stream: StreamId, code: ErrorCode) {
        self.encoder.rst_stream(&mut self.out, stream, code);
        if let Some(s) = self.streams.get_mut(&stream.value()) {
            s.reset();
        }
    }

    /// Drop bookkeeping for a finished stream.
    pub fn remove_stream(&mut self, stream: StreamId) {
        self.streams.remove(&stream.value());
    }

    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_send(&self) -> &[u8] {
        &self.out
    }

    pub fn advance_send(&mut self, n: usize) {
        let _ = self.out.split_to(n);
    }

    pub fn has_pending_send(&self) -> bool {
        !self.out.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_client() -> ClientSession {
        let mut client = ClientSession::new(SessionSettings::default());
        client.start();

        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.settings(&mut buf, &SessionSettings::default().to_settings());
        client.feed(&buf);
        client
    }

    #[test]
    fn start_queues_preface() {
        let mut client = ClientSession::new(SessionSettings::default());
        client.start();
        assert!(client.pending_send().starts_with(CONNECTION_PREFACE));
        assert_eq!(client.state(), SessionState::Settings);
    }

    #[test]
    fn settings_exchange_opens_session() {
        let mut client = open_client();
        assert!(client.is_ready());
        assert!(client
            .poll_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::Ready)));
    }

    #[test]
    fn requests_use_odd_increasing_ids() {
        let mut client = open_client();
        let first = client
            .start_request(&[HeaderField::new(":method", "GET")], true)
            .unwrap();
        let second = client
            .start_request(&[HeaderField::new(":method", "GET")], true)
            .unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 3);
    }

    #[test]
    fn request_before_ready_fails() {
        let mut client = ClientSession::new(SessionSettings::default());
        client.start();
        assert!(client.start_request(&[], true).is_err());
    }

    #[test]
    fn response_events_surface() {
        let mut client = open_client();
        let stream = client.start_request(&[], false).unwrap();
        client.send_data(stream, b"query", true).unwrap();

        let enc = FrameEncoder::new();
        let mut hpack = HpackEncoder::new();
        let mut block = Vec::new();
        hpack.encode(&[HeaderField::new(":status", "200")], &mut block);
        let mut buf = BytesMut::new();
        enc.headers(&mut buf, stream, &block, false);
        enc.data(&mut buf, stream, b"answer", true);
        client.feed(&buf);

        let events = client.poll_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Headers { headers, .. }
                if headers.contains(&HeaderField::new(":status", "200"))
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Data { data, end_stream: true, .. } if &data[..] == b"answer"
        )));
    }

    #[test]
    fn flow_control_stalls_large_sends() {
        let mut client = open_client();

        // Shrink the stream window to 10 via a new SETTINGS from the peer.
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.settings(
            &mut buf,
            &[Setting {
                id: setting::INITIAL_WINDOW_SIZE,
                value: 10,
            }],
        );
        client.feed(&buf);

        let stream = client.start_request(&[], false).unwrap();
        let sent = client.send_data(stream, &[0u8; 64], true).unwrap();
        assert_eq!(sent, 10);

        // A WINDOW_UPDATE lets the rest through.
        let mut buf = BytesMut::new();
        enc.window_update(&mut buf, stream, 100);
        client.feed(&buf);
        let sent = client.send_data(stream, &[0u8; 54], true).unwrap();
        assert_eq!(sent, 54);
    }

    #[test]
    fn goaway_drains_session() {
        let mut client = open_client();
        let enc = FrameEncoder::new();
        let mut buf = BytesMut::new();
        enc.goaway(&mut buf, StreamId::ZERO, ErrorCode::NoError, b"");
        client.feed(&buf);

        assert_eq!(client.state(), SessionState::Draining);
        assert!(client
            .poll_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::GoAway { .. })));
    }
}
