//! Per-stream state.

use crate::frame::StreamId;

/// Stream lifecycle states (RFC 9113 section 5.1, reduced to the states a
/// request/response exchange can reach).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

/// One HTTP/2 stream: state plus the peer-granted send window.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    send_window: i64,
}

impl Stream {
    pub fn new(id: StreamId, initial_send_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            send_window: initial_send_window as i64,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Reset)
    }

    /// Octets we may still send on this stream.
    pub fn send_window(&self) -> i64 {
        self.send_window
    }

    pub fn consume_send_window(&mut self, n: u32) {
        self.send_window -= n as i64;
    }

    pub fn grow_send_window(&mut self, n: u32) {
        self.send_window += n as i64;
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta; may drive the window
    /// negative, which stalls sends until updates arrive.
    pub fn adjust_send_window(&mut self, delta: i64) {
        self.send_window += delta;
    }

    pub fn local_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub fn remote_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Reset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_close_the_stream() {
        let mut s = Stream::new(StreamId::new(1), 65_535);
        assert_eq!(s.state(), StreamState::Open);

        s.local_end();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.remote_end();
        assert_eq!(s.state(), StreamState::Closed);
        assert!(s.is_closed());
    }

    #[test]
    fn window_accounting() {
        let mut s = Stream::new(StreamId::new(1), 100);
        s.consume_send_window(60);
        assert_eq!(s.send_window(), 40);
        s.grow_send_window(10);
        assert_eq!(s.send_window(), 50);
        s.adjust_send_window(-75);
        assert_eq!(s.send_window(), -25);
    }

    #[test]
    fn reset_is_terminal() {
        let mut s = Stream::new(StreamId::new(3), 100);
        s.reset();
        s.local_end();
        assert_eq!(s.state(), StreamState::Reset);
    }
}
