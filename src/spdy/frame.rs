//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|                 Stream Identifier (31)      |
//! +-+---------------------------------------------+
//! ```
//!
//! Known frame types with a malformed payload decode to [`Frame::Unknown`]
//! and are ignored by the connection, the same as unknown types.

use crate::base::neterror::NetError;
use crate::spdy::stream::StreamPriority;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Client connection preface (RFC 7540 Section 3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`, or `None` if fewer than 9 bytes.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let mut b = &buf[..FRAME_HEADER_LEN];
        let length = (u32::from(b.get_u8()) << 16) | u32::from(b.get_u16());
        let frame_type = b.get_u8();
        let flags = b.get_u8();
        let stream_id = b.get_u32() & STREAM_ID_MASK;
        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u16(self.length as u16);
        dst.put_u8(self.frame_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
    }
}

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Full payload length including padding; what flow control counts.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<StreamPriority>,
    },
    Priority {
        stream_id: u32,
        priority: StreamPriority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown type or a payload that does not fit its type.
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

fn put_priority(dst: &mut BytesMut, priority: &StreamPriority) {
    let mut dep = priority.dependency & STREAM_ID_MASK;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    dst.put_u32(dep);
    dst.put_u8(priority.wire_weight());
}

fn get_priority(b: &mut &[u8]) -> StreamPriority {
    let raw = b.get_u32();
    let weight = b.get_u8();
    StreamPriority::from_wire(raw & STREAM_ID_MASK, weight, raw & 0x8000_0000 != 0)
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame (header and payload) onto `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let header = |length: usize, frame_type: u8, flags: u8, stream_id: u32| FrameHeader {
            length: length as u32,
            frame_type,
            flags,
            stream_id,
        };

        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                header(payload.len(), FRAME_DATA, flags, *stream_id).encode(dst);
                dst.put_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                let mut len = block.len();
                if priority.is_some() {
                    flags |= FLAG_PRIORITY;
                    len += 5;
                }
                header(len, FRAME_HEADERS, flags, *stream_id).encode(dst);
                if let Some(p) = priority {
                    put_priority(dst, p);
                }
                dst.put_slice(block);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                header(5, FRAME_PRIORITY, 0, *stream_id).encode(dst);
                put_priority(dst, priority);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                header(4, FRAME_RST_STREAM, 0, *stream_id).encode(dst);
                dst.put_u32(*error_code as u32);
            }
            Frame::Settings { ack, params } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                let len = if *ack { 0 } else { params.len() * 6 };
                header(len, FRAME_SETTINGS, flags, 0).encode(dst);
                if !*ack {
                    for (id, value) in params {
                        dst.put_u16(*id);
                        dst.put_u32(*value);
                    }
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                header(4 + block.len(), FRAME_PUSH_PROMISE, flags, *stream_id).encode(dst);
                dst.put_u32(*promised_stream_id & STREAM_ID_MASK);
                dst.put_slice(block);
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                header(8, FRAME_PING, flags, 0).encode(dst);
                dst.put_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                header(8 + debug_data.len(), FRAME_GOAWAY, 0, 0).encode(dst);
                dst.put_u32(*last_stream_id & STREAM_ID_MASK);
                dst.put_u32(*error_code as u32);
                dst.put_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                header(4, FRAME_WINDOW_UPDATE, 0, *stream_id).encode(dst);
                dst.put_u32(*increment & STREAM_ID_MASK);
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                header(block.len(), FRAME_CONTINUATION, flags, *stream_id).encode(dst);
                dst.put_slice(block);
            }
            Frame::Unknown { .. } => {}
        }
    }
}

/// Strip the PADDED prefix/suffix. `None` when the pad length is impossible.
fn strip_padding(payload: &[u8], flags: u8) -> Option<&[u8]> {
    if flags & FLAG_PADDED == 0 {
        return Some(payload);
    }
    let (&pad_len, rest) = payload.split_first()?;
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return None;
    }
    Some(&rest[..rest.len() - pad_len])
}

/// Try to take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame has been buffered. A declared
/// length above `max_frame_size` fails before any payload is buffered.
pub fn decode_frame(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, NetError> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };
    if header.length > max_frame_size {
        tracing::warn!(
            length = header.length,
            max_frame_size,
            frame_type = header.frame_type,
            "frame exceeds MAX_FRAME_SIZE"
        );
        return Err(NetError::Http2FrameSizeError);
    }

    let total = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut raw = buf.split_to(total);
    raw.advance(FRAME_HEADER_LEN);
    let payload = raw.freeze();
    Ok(Some(parse_payload(header, payload)))
}

fn parse_payload(header: FrameHeader, payload: Bytes) -> Frame {
    let FrameHeader {
        length,
        frame_type,
        flags,
        stream_id,
    } = header;
    let unknown = Frame::Unknown {
        frame_type,
        stream_id,
    };

    match frame_type {
        FRAME_DATA => match strip_padding(&payload, flags) {
            Some(data) => Frame::Data {
                stream_id,
                payload: payload.slice_ref(data),
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_len: length,
            },
            None => unknown,
        },
        FRAME_HEADERS => {
            let Some(mut data) = strip_padding(&payload, flags) else {
                return unknown;
            };
            let priority = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return unknown;
                }
                Some(get_priority(&mut data))
            } else {
                None
            };
            Frame::Headers {
                stream_id,
                block: payload.slice_ref(data),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY if payload.len() == 5 => {
            let mut data = &payload[..];
            Frame::Priority {
                stream_id,
                priority: get_priority(&mut data),
            }
        }
        FRAME_RST_STREAM if payload.len() == 4 => Frame::RstStream {
            stream_id,
            error_code: ErrorCode::from_u32((&payload[..]).get_u32()),
        },
        FRAME_SETTINGS if payload.len() % 6 == 0 => {
            let ack = flags & FLAG_ACK != 0;
            let mut data = &payload[..];
            let mut params = Vec::with_capacity(data.len() / 6);
            while data.has_remaining() {
                params.push((data.get_u16(), data.get_u32()));
            }
            Frame::Settings { ack, params }
        }
        FRAME_PUSH_PROMISE => {
            let Some(mut data) = strip_padding(&payload, flags) else {
                return unknown;
            };
            if data.len() < 4 {
                return unknown;
            }
            let promised_stream_id = data.get_u32() & STREAM_ID_MASK;
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block: payload.slice_ref(data),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING if payload.len() == 8 => {
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        FRAME_GOAWAY if payload.len() >= 8 => {
            let mut data = &payload[..];
            let last_stream_id = data.get_u32() & STREAM_ID_MASK;
            let error_code = ErrorCode::from_u32(data.get_u32());
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data: payload.slice(8..),
            }
        }
        FRAME_WINDOW_UPDATE if payload.len() == 4 => Frame::WindowUpdate {
            stream_id,
            increment: (&payload[..]).get_u32() & STREAM_ID_MASK,
        },
        FRAME_CONTINUATION => Frame::Continuation {
            stream_id,
            block: payload,
            end_headers: flags & FLAG_END_HEADERS != 0,
        },
        _ => unknown,
    }
}
