//! Per-stream state for HTTP/2 (RFC 7540 Section 5.1).

use crate::spdy::frame::ErrorCode;
use crate::spdy::hpack::HeaderField;
use bytes::BytesMut;

/// Default stream weight (RFC 7540 Section 5.3.5).
pub const DEFAULT_WEIGHT: u16 = 16;

/// State of an HTTP/2 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Stream created but no frames sent.
    #[default]
    Idle,
    /// HEADERS sent, waiting for response.
    Open,
    /// We sent END_STREAM (no more outgoing data).
    HalfClosedLocal,
    /// Peer sent END_STREAM (no more incoming data).
    HalfClosedRemote,
    /// Both sides done, or RST_STREAM/GOAWAY received.
    Closed,
}

impl StreamState {
    /// Whether the peer has finished sending on this stream.
    pub fn is_remote_done(self) -> bool {
        matches!(self, StreamState::HalfClosedRemote | StreamState::Closed)
    }
}

/// Stream dependency and weight.
///
/// `weight` is the effective weight 1..=256; the wire carries `weight - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub dependency: u32,
    pub weight: u16,
    pub exclusive: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self {
            dependency: 0,
            weight: DEFAULT_WEIGHT,
            exclusive: false,
        }
    }
}

impl StreamPriority {
    pub fn new(dependency: u32, weight: u16, exclusive: bool) -> Self {
        Self {
            dependency,
            weight: weight.clamp(1, 256),
            exclusive,
        }
    }

    pub fn from_wire(dependency: u32, wire_weight: u8, exclusive: bool) -> Self {
        Self {
            dependency,
            weight: u16::from(wire_weight) + 1,
            exclusive,
        }
    }

    pub fn wire_weight(&self) -> u8 {
        (self.weight.clamp(1, 256) - 1) as u8
    }
}

/// One request/response exchange on a connection.
#[derive(Debug, Clone)]
pub struct H2Stream {
    pub id: u32,
    pub state: StreamState,
    /// Response headers, pseudo-headers included, in arrival order.
    pub headers: Vec<HeaderField>,
    pub body: BytesMut,
    /// Opened by the server through PUSH_PROMISE.
    pub pushed: bool,
    /// `:path` of the promised request, for pushed streams.
    pub path: Option<String>,
    /// Bytes we may still send on this stream. Signed: a SETTINGS change can
    /// push it below zero.
    pub send_window: i64,
    pub priority: StreamPriority,
    /// Why the stream was cut short, if the peer reset it or went away.
    pub reset: Option<ErrorCode>,
    /// The body outgrew the connection's limit and the stream was cancelled.
    pub body_too_big: bool,
}

impl H2Stream {
    pub fn new(id: u32, initial_send_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            headers: Vec::new(),
            body: BytesMut::new(),
            pushed: false,
            path: None,
            send_window: initial_send_window,
            priority: StreamPriority::default(),
            reset: None,
            body_too_big: false,
        }
    }

    /// A server-pushed stream. Nothing is ever sent on it, so it starts
    /// half-closed (local).
    pub fn pushed(id: u32, path: Option<String>, initial_send_window: i64) -> Self {
        Self {
            state: StreamState::HalfClosedLocal,
            pushed: true,
            path,
            ..Self::new(id, initial_send_window)
        }
    }

    /// HEADERS went out.
    pub fn open(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    /// We sent END_STREAM.
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// The peer sent END_STREAM on a header block.
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Final state after DATA with END_STREAM.
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Forced close from RST_STREAM or GOAWAY.
    pub fn reset(&mut self, code: ErrorCode) {
        self.state = StreamState::Closed;
        self.reset = Some(code);
    }

    /// Status code from the `:status` pseudo-header.
    pub fn status(&self) -> Option<u16> {
        self.headers
            .iter()
            .find(|h| h.name == ":status")
            .and_then(|h| h.value.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle() {
        let mut s = H2Stream::new(1, 65535);
        assert_eq!(s.state, StreamState::Idle);
        s.open();
        assert_eq!(s.state, StreamState::Open);
        s.close_local();
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.close_remote();
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn test_remote_finishes_first() {
        let mut s = H2Stream::new(3, 65535);
        s.open();
        s.close_remote();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(s.state.is_remote_done());
        s.close_local();
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn test_pushed_stream_starts_half_closed_local() {
        let s = H2Stream::pushed(2, Some("/style.css".into()), 65535);
        assert!(s.pushed);
        assert_eq!(s.state, StreamState::HalfClosedLocal);
    }

    #[test]
    fn test_priority_weight_mapping() {
        assert_eq!(StreamPriority::default().wire_weight(), 15);
        assert_eq!(StreamPriority::from_wire(0, 255, false).weight, 256);
        assert_eq!(StreamPriority::new(1, 0, true).weight, 1);
        assert_eq!(StreamPriority::new(1, 999, true).weight, 256);
    }

    #[test]
    fn test_status_from_pseudo_header() {
        let mut s = H2Stream::new(1, 65535);
        s.headers.push(HeaderField::new(":status", "204"));
        assert_eq!(s.status(), Some(204));
    }
}
