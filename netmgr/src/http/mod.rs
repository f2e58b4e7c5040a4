//! HTTP/2 DoH transport.
//!
//! A DoH socket multiplexes DNS request/response pairs over one HTTP/2
//! session on a TLS or plain TCP carrier. The server side demultiplexes
//! requests by `:path` into registered endpoints; the client side
//! composes one request per connection and delivers the decoded response
//! body to its callback exactly once.

pub mod url;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http2::{
    ClientEvent, ClientSession, ErrorCode, HeaderField, ServerEvent, ServerSession,
    SessionSettings, StreamId,
};
use parking_lot::RwLock;

use crate::errors::{NmError, NmResult};
use crate::event::{ResponseCb, SendCb, SharedRecvCb};
use crate::metrics::HTTP_REQUESTS;
use crate::socket::{Handle, Socket};

/// The DoH media type.
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Request method for [`crate::NetMgr::http_connect_send_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Path-keyed DoH endpoint registry shared by a listener's connections.
#[derive(Default)]
pub struct Endpoints {
    map: RwLock<HashMap<String, SharedRecvCb>>,
}

impl Endpoints {
    pub fn new() -> Arc<Endpoints> {
        Arc::new(Endpoints::default())
    }

    /// Register `recv_cb` for requests whose `:path` matches `path`.
    pub fn add(&self, path: &str, recv_cb: SharedRecvCb) {
        self.map.write().insert(path.to_string(), recv_cb);
    }

    fn lookup(&self, path: &str) -> Option<SharedRecvCb> {
        self.map.read().get(path).cloned()
    }
}

/// A composed DoH client request.
pub(crate) struct DohRequest {
    pub(crate) method: HttpMethod,
    pub(crate) https: bool,
    pub(crate) authority: String,
    pub(crate) path: String,
    pub(crate) body: Vec<u8>,
}

// ---------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------

struct ServerRequest {
    handler: Option<SharedRecvCb>,
    body: BytesMut,
    /// Decoded `dns=` payload for GET requests.
    get_payload: Option<Vec<u8>>,
    /// Error status to answer with instead of dispatching.
    error_status: Option<&'static str>,
    responded: bool,
}

struct PendingBody {
    data: Bytes,
    offset: usize,
    cb: Option<SendCb>,
    handle: Handle,
}

/// Server half of one DoH connection.
pub(crate) struct H2ServerConn {
    sock: Arc<Socket>,
    session: ServerSession,
    endpoints: Arc<Endpoints>,
    requests: HashMap<u32, ServerRequest>,
    pending: Vec<PendingBody>,
}

impl H2ServerConn {
    pub(crate) fn new(sock: Arc<Socket>, endpoints: Arc<Endpoints>, max_streams: u32) -> Self {
        let settings = SessionSettings {
            max_concurrent_streams: max_streams,
            ..SessionSettings::default()
        };
        Self {
            sock,
            session: ServerSession::new(settings),
            endpoints,
            requests: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn overlay_socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    /// Feed carrier plaintext; dispatches completed requests to their
    /// endpoints. Returns a carrier-fatal error when the session died.
    pub(crate) fn feed(&mut self, data: &[u8]) -> NmResult<()> {
        self.session.feed(data);
        self.drain_pending();

        for event in self.session.poll_events() {
            match event {
                ServerEvent::Ready | ServerEvent::GoAway { .. } => {}
                ServerEvent::Request {
                    stream,
                    headers,
                    end_stream,
                } => self.on_request(stream, headers, end_stream),
                ServerEvent::Data {
                    stream,
                    data,
                    end_stream,
                } => self.on_data(stream, &data, end_stream),
                ServerEvent::StreamReset { stream, .. } => {
                    self.requests.remove(&stream.value());
                    self.session.remove_stream(stream);
                }
                ServerEvent::Error(err) => {
                    tracing::debug!(error = %err, "http session failed");
                    return Err(NmError::InvalidProto);
                }
            }
        }
        Ok(())
    }

    fn header<'a>(headers: &'a [HeaderField], name: &[u8]) -> Option<&'a [u8]> {
        headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }

    fn on_request(&mut self, stream: StreamId, headers: Vec<HeaderField>, end_stream: bool) {
        let method = Self::header(&headers, b":method").unwrap_or(b"");
        let path_full = Self::header(&headers, b":path").unwrap_or(b"");
        let path_full = String::from_utf8_lossy(path_full).into_owned();
        let (path, query) = match path_full.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_full.as_str(), None),
        };

        let mut request = ServerRequest {
            handler: self.endpoints.lookup(path),
            body: BytesMut::new(),
            get_payload: None,
            error_status: None,
            responded: false,
        };

        if request.handler.is_none() {
            request.error_status = Some("404");
        } else {
            match method {
                b"GET" => {
                    let payload = query
                        .and_then(url::parse_http_query)
                        .and_then(|v| url::decode_dns_param(v).ok());
                    match payload {
                        Some(p) => request.get_payload = Some(p),
                        None => request.error_status = Some("400"),
                    }
                }
                b"POST" => {
                    let content_type = Self::header(&headers, b"content-type");
                    if content_type != Some(DNS_MESSAGE_CONTENT_TYPE.as_bytes()) {
                        request.error_status = Some("415");
                    }
                }
                _ => request.error_status = Some("405"),
            }
        }

        self.requests.insert(stream.value(), request);
        if end_stream {
            self.finish_request(stream);
        }
    }

    fn on_data(&mut self, stream: StreamId, data: &[u8], end_stream: bool) {
        if let Some(request) = self.requests.get_mut(&stream.value()) {
            request.body.extend_from_slice(data);
        }
        if end_stream {
            self.finish_request(stream);
        }
    }

    /// The request is complete: answer an error status or hand the DNS
    /// payload to the endpoint.
    fn finish_request(&mut self, stream: StreamId) {
        let Some(request) = self.requests.get_mut(&stream.value()) else {
            return;
        };

        if let Some(status) = request.error_status.take() {
            request.responded = true;
            let _ = self.session.send_headers(
                stream,
                &[HeaderField::new(":status", status)],
                true,
            );
            self.session.remove_stream(stream);
            self.requests.remove(&stream.value());
            return;
        }

        let payload: Bytes = match request.get_payload.take() {
            Some(p) => p.into(),
            None => request.body.split().freeze(),
        };
        let handler = request.handler.clone();

        if let Some(handler) = handler {
            HTTP_REQUESTS.increment();
            let handle = Handle::with_stream(&self.sock, stream.value());
            handler(&handle, Ok(&payload));
        }
    }

    /// Queue the DNS response for a request stream. Exactly one response
    /// per request; a second attempt fails the send callback.
    pub(crate) fn respond(&mut self, stream_id: u32, data: Bytes, cb: Option<SendCb>) {
        let stream = StreamId::new(stream_id);
        let handle = Handle::with_stream(&self.sock, stream_id);

        let ok = match self.requests.get_mut(&stream_id) {
            Some(request) if !request.responded => {
                request.responded = true;
                true
            }
            _ => false,
        };
        if !ok {
            if let Some(cb) = cb {
                cb(&handle, Err(NmError::Failure));
            }
            return;
        }

        let headers = [
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", DNS_MESSAGE_CONTENT_TYPE),
        ];
        if self.session.send_headers(stream, &headers, false).is_err() {
            if let Some(cb) = cb {
                cb(&handle, Err(NmError::Canceled));
            }
            return;
        }

        self.pending.push(PendingBody {
            data,
            offset: 0,
            cb,
            handle,
        });
        self.drain_pending();
    }

    /// Push queued response bodies as far as flow control allows.
    fn drain_pending(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            let entry = &mut self.pending[i];
            let stream = StreamId::new(entry.handle.stream_id().unwrap_or(0));
            match self
                .session
                .send_data(stream, &entry.data[entry.offset..], true)
            {
                Ok(n) => {
                    entry.offset += n;
                    if entry.offset == entry.data.len() {
                        let done = self.pending.remove(i);
                        if let Some(cb) = done.cb {
                            cb(&done.handle, Ok(()));
                        }
                        self.session.remove_stream(stream);
                        self.requests.remove(&stream.value());
                        continue;
                    }
                }
                Err(_) => {
                    let done = self.pending.remove(i);
                    if let Some(cb) = done.cb {
                        cb(&done.handle, Err(NmError::Canceled));
                    }
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Take session output bound for the carrier.
    pub(crate) fn take_output(&mut self) -> Option<Bytes> {
        if !self.session.has_pending_send() {
            return None;
        }
        let data = Bytes::copy_from_slice(self.session.pending_send());
        self.session.advance_send(data.len());
        Some(data)
    }

    /// Fail queued response sends; runs once at connection teardown.
    pub(crate) fn fail_pending(&mut self, err: &NmError) {
        for entry in self.pending.drain(..) {
            if let Some(cb) = entry.cb {
                cb(&entry.handle, Err(err.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------

/// Client half of one DoH connection: a single request/response pair.
pub(crate) struct H2ClientConn {
    sock: Arc<Socket>,
    session: ClientSession,
    request: Option<DohRequest>,
    resp_cb: Option<ResponseCb>,
    stream: Option<StreamId>,
    body: BytesMut,
    /// POST body bytes still stalled on flow control.
    request_body: Option<(Bytes, usize)>,
}

impl H2ClientConn {
    pub(crate) fn new(sock: Arc<Socket>, request: DohRequest, resp_cb: ResponseCb) -> Self {
        Self {
            sock,
            session: ClientSession::new(SessionSettings::default()),
            request: Some(request),
            resp_cb: Some(resp_cb),
            stream: None,
            body: BytesMut::new(),
            request_body: None,
        }
    }

    pub(crate) fn overlay_socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    /// Begin the session once the carrier is ready for application data.
    pub(crate) fn start(&mut self) {
        self.session.start();
    }

    /// Feed carrier plaintext. Returns `Ok(true)` once the response has
    /// been delivered and the connection may close.
    pub(crate) fn feed(&mut self, data: &[u8]) -> NmResult<bool> {
        self.session.feed(data);

        for event in self.session.poll_events() {
            match event {
                ClientEvent::Ready => self.submit_request()?,
                ClientEvent::Headers {
                    stream,
                    headers,
                    end_stream,
                } => {
                    if Some(stream) != self.stream {
                        continue;
                    }
                    let status = headers
                        .iter()
                        .find(|h| h.name == b":status")
                        .map(|h| h.value.clone());
                    if status.as_deref() != Some(b"200".as_slice()) {
                        self.fail(NmError::InvalidProto);
                        return Err(NmError::InvalidProto);
                    }
                    let content_type = headers
                        .iter()
                        .find(|h| h.name == b"content-type")
                        .map(|h| h.value.clone());
                    if content_type.as_deref() != Some(DNS_MESSAGE_CONTENT_TYPE.as_bytes()) {
                        self.fail(NmError::InvalidProto);
                        return Err(NmError::InvalidProto);
                    }
                    if end_stream {
                        self.deliver();
                        return Ok(true);
                    }
                }
                ClientEvent::Data {
                    stream,
                    data,
                    end_stream,
                } => {
                    if Some(stream) != self.stream {
                        continue;
                    }
                    self.body.extend_from_slice(&data);
                    if end_stream {
                        self.deliver();
                        return Ok(true);
                    }
                }
                ClientEvent::StreamReset { stream, code } => {
                    if Some(stream) == self.stream {
                        let err = match code {
                            ErrorCode::Cancel => NmError::Canceled,
                            _ => NmError::InvalidProto,
                        };
                        self.fail(err.clone());
                        return Err(err);
                    }
                }
                ClientEvent::GoAway { .. } => {
                    self.fail(NmError::Canceled);
                    return Err(NmError::Canceled);
                }
                ClientEvent::Error(err) => {
                    tracing::debug!(error = %err, "http session failed");
                    self.fail(NmError::InvalidProto);
                    return Err(NmError::InvalidProto);
                }
            }
        }

        self.push_request_body()?;
        Ok(false)
    }

    /// Compose and submit the request once the session is ready.
    fn submit_request(&mut self) -> NmResult<()> {
        let Some(req) = self.request.take() else {
            return Ok(());
        };
        let scheme = if req.https { "https" } else { "http" };

        match req.method {
            HttpMethod::Get => {
                let param = url::encode_dns_param(&req.body).ok_or(NmError::Failure)?;
                let path = format!("{}?dns={}", req.path, param);
                let headers = [
                    HeaderField::new(":method", "GET"),
                    HeaderField::new(":scheme", scheme),
                    HeaderField::new(":authority", req.authority.as_str()),
                    HeaderField::new(":path", path.as_str()),
                    HeaderField::new("accept", DNS_MESSAGE_CONTENT_TYPE),
                ];
                let stream = self
                    .session
                    .start_request(&headers, true)
                    .map_err(|_| NmError::Failure)?;
                self.stream = Some(stream);
            }
            HttpMethod::Post => {
                let length = req.body.len().to_string();
                let headers = [
                    HeaderField::new(":method", "POST"),
                    HeaderField::new(":scheme", scheme),
                    HeaderField::new(":authority", req.authority.as_str()),
                    HeaderField::new(":path", req.path.as_str()),
                    HeaderField::new("content-type", DNS_MESSAGE_CONTENT_TYPE),
                    HeaderField::new("content-length", length.as_str()),
                    HeaderField::new("accept", DNS_MESSAGE_CONTENT_TYPE),
                ];
                let stream = self
                    .session
                    .start_request(&headers, false)
                    .map_err(|_| NmError::Failure)?;
                self.stream = Some(stream);
                self.request_body = Some((Bytes::from(req.body), 0));
                self.push_request_body()?;
            }
        }
        Ok(())
    }

    /// Push as much of the POST body as flow control allows.
    fn push_request_body(&mut self) -> NmResult<()> {
        let Some((data, offset)) = self.request_body.as_mut() else {
            return Ok(());
        };
        let stream = self.stream.expect("request body without a stream");
        let n = self
            .session
            .send_data(stream, &data[*offset..], true)
            .map_err(|_| NmError::Failure)?;
        *offset += n;
        if *offset == data.len() {
            self.request_body = None;
        }
        Ok(())
    }

    /// Deliver the response body; the callback fires at most once.
    fn deliver(&mut self) {
        if let Some(cb) = self.resp_cb.take() {
            let handle = Handle::with_stream(
                &self.sock,
                self.stream.map(|s| s.value()).unwrap_or(0),
            );
            let body = self.body.split().freeze();
            cb(&handle, Ok(&body));
        }
    }

    /// Fail the response callback exactly once.
    pub(crate) fn fail(&mut self, err: NmError) {
        if let Some(cb) = self.resp_cb.take() {
            let handle = Handle::with_stream(
                &self.sock,
                self.stream.map(|s| s.value()).unwrap_or(0),
            );
            cb(&handle, Err(err));
        }
    }

    /// Take session output bound for the carrier.
    pub(crate) fn take_output(&mut self) -> Option<Bytes> {
        if !self.session.has_pending_send() {
            return None;
        }
        let data = Bytes::copy_from_slice(self.session.pending_send());
        self.session.advance_send(data.len());
        Some(data)
    }
}
