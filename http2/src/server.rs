//! Server-side HTTP/2 session.

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

/// Events surfaced by [`ServerSession::poll_events`].
#[derive(Debug)]
pub enum ServerEvent {
    /// Preface and SETTINGS exchange complete.
    Ready,
    /// A client opened a new request stream.
    Request {
        stream: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Request body bytes.
    Data {
        stream: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The client reset a stream.
    StreamReset { stream: StreamId, code: ErrorCode },
    /// The client is going away.
    GoAway { last_stream: StreamId, code: ErrorCode },
    /// Fatal session error; the carrier should be closed.
    Error(SessionError),
}

/// Server half of an HTTP/2 session.
///
/// Feed carrier bytes with [`feed`](Self::feed), drain output with
/// [`pending_send`](Self::pending_send)/[`advance_send`](Self::advance_send),
/// and consume [`ServerEvent`]s. Streams above the configured concurrent
/// limit are refused with RST_STREAM/REFUSED_STREAM before any event is
/// surfaced for them.
pub struct ServerSession {
    state: SessionState,
    local: SessionSettings,
    remote: SessionSettings,
    got_settings: bool,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    hpack_enc: HpackEncoder,
    hpack_dec: HpackDecoder,
    streams: HashMap<u32, Stream>,
    /// Connection-level window the peer has granted us.
    send_window: i64,
    recv_window: RecvWindow,
    input: BytesMut,
    out: BytesMut,
    events: Vec<ServerEvent>,
    last_client_stream: u32,
}

impl ServerSession {
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
            send_window: crate::frame::DEFAULT_INITIAL_WINDOW_SIZE as i64,
            recv_window: RecvWindow::new(local.initial_window_size),
            input: BytesMut::with_capacity(16_384),
            out: BytesMut::with_capacity(16_384),
            events: Vec::new(),
            last_client_stream: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Number of streams that are still live.
    pub fn active_streams(&self) -> usize {
        self.streams.values().filter(|s| !s.is_closed()).count()
    }

    /// Feed bytes received from the carrier and process them.
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);

        if self.state == SessionState::Preface {
            if self.input.len() < CONNECTION_PREFACE.len() {
                return;
            }
            if &self.input[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                self.fail(SessionError::Protocol("bad connection preface"));
                return;
            }
            let _ = self.input.split_to(CONNECTION_PREFACE.len());
            self.encoder
                .settings(&mut self.out, &self.local.to_settings());
            self.state = SessionState::Settings;
        }

        self.process_frames();
    }

    fn process_frames(&mut self) {
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
        self.events.push(ServerEvent::Error(err));
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
                self.events.push(ServerEvent::GoAway { last_stream, code });
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
            } => self.on_headers(stream, end_stream, end_headers, block),
            Frame::Data {
                stream,
                end_stream,
                data,
                flow_len,
            } => self.on_data(stream, end_stream, data, flow_len),
            Frame::RstStream { stream, code } => {
                if let Some(s) = self.streams.get_mut(&stream.value()) {
                    s.reset();
                }
                self.events.push(ServerEvent::StreamReset { stream, code });
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
            self.events.push(ServerEvent::Ready);
        }
    }

    fn on_headers(&mut self, stream: StreamId, end_stream: bool, end_headers: bool, block: Bytes) {
        if !end_headers {
            self.fail(SessionError::Protocol("fragmented header block"));
            return;
        }
        if !stream.is_client_initiated() {
            self.fail(SessionError::Protocol("even client stream id"));
            return;
        }
        if stream.value() <= self.last_client_stream {
            self.fail(SessionError::Protocol("stream id went backwards"));
            return;
        }
        self.last_client_stream = stream.value();

        let headers = match self.hpack_dec.decode(&block) {
            Ok(h) => h,
            Err(e) => {
                self.fail(SessionError::Hpack(e));
                return;
            }
        };

        if self.active_streams() >= self.local.max_concurrent_streams as usize {
            self.encoder
                .rst_stream(&mut self.out, stream, ErrorCode::RefusedStream);
            return;
        }

        let mut s = Stream::new(stream, self.remote.initial_window_size);
        if end_stream {
            s.remote_end();
        }
        self.streams.insert(stream.value(), s);

        self.events.push(ServerEvent::Request {
            stream,
            headers,
            end_stream,
        });
    }

    fn on_data(&mut self, stream: StreamId, end_stream: bool, data: Bytes, flow_len: u32) {
        let (known, live) = match self.streams.get_mut(&stream.value()) {
            Some(s) => {
                if end_stream {
                    s.remote_end();
                }
                (true, !end_stream && !s.is_closed())
            }
            None => (false, false),
        };

        self.recv_window.consume(flow_len);
        if let Some(increment) = self.recv_window.take_update() {
            self.encoder
                .window_update(&mut self.out, StreamId::ZERO, increment);
        }
        // Keep the stream window topped up so the sender never stalls on it.
        if live && flow_len > 0 {
            self.encoder.window_update(&mut self.out, stream, flow_len);
        }

        if known {
            self.events.push(ServerEvent::Data {
                stream,
                data,
                end_stream,
            });
        }
    }

    /// Send response headers on a stream.
    pub fn send_headers(
        &mut self,
        stream: StreamId,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), SessionError> {
        let s = self
            .streams
            .get_mut(&stream.value())
            .ok_or(SessionError::Protocol("unknown stream"))?;

        let mut block = Vec::new();
        self.hpack_enc.encode(headers, &mut block);
        self.encoder.headers(&mut self.out, stream, &block, end_stream);
        if end_stream {
            s.local_end();
        }
        Ok(())
    }

    /// Send response body bytes; returns how many were accepted under the
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

    /// Send GOAWAY and stop accepting new streams.
    pub fn goaway(&mut self, code: ErrorCode) {
        self.encoder.goaway(
            &mut self.out,
            StreamId::new(self.last_client_stream),
            code,
            &[],
        );
        self.state = SessionState::Draining;
    }

    /// Drop bookkeeping for a finished stream.
    pub fn remove_stream(&mut self, stream: StreamId) {
        self.streams.remove(&stream.value());
    }

    pub fn stream_closed(&self, stream: StreamId) -> bool {
        self.streams
            .get(&stream.value())
            .map(|s| s.is_closed())
            .unwrap_or(true)
    }

    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
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
