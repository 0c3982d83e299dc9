//! Client side of one HTTP/2 connection.
//!
//! `Http2Connection` owns the transport, an HPACK context per direction, the
//! stream table and both levels of send flow control. It is driven by its
//! caller: frames are only read while [`Http2Connection::receive`] (or a
//! flow-control wait inside [`Http2Connection::send_data`]) is running.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::http::http1::DEFAULT_MAX_BODY_SIZE;
use crate::socket::client::{read_with_idle_timeout, StreamSocket};
use crate::spdy::frame::{decode_frame, ErrorCode, Frame, CONNECTION_PREFACE};
use crate::spdy::h2settings::{
    H2Settings, MAX_WINDOW_SIZE, SETTINGS_HEADER_TABLE_SIZE, SETTINGS_INITIAL_WINDOW_SIZE,
};
use crate::spdy::hpack::{HPackContext, HeaderField};
use crate::spdy::pushcache::{PushCache, PushedResponse};
use crate::spdy::stream::{H2Stream, StreamPriority, StreamState};
use bytes::{Bytes, BytesMut};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Default wait for the next byte while blocked on flow control.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest header block accumulated across HEADERS + CONTINUATION frames.
const MAX_HEADER_BLOCK: usize = 256 * 1024;

const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Headers that only make sense on an HTTP/1.1 connection.
const CONNECTION_SPECIFIC_HEADERS: [&str; 6] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Methods whose request carries no body, so HEADERS ends the stream.
pub fn is_bodyless_method(method: &str) -> bool {
    ["GET", "HEAD", "DELETE", "OPTIONS", "TRACE"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

/// A header block split across HEADERS/PUSH_PROMISE and CONTINUATION frames.
#[derive(Debug)]
struct PendingHeaderBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
    promised_stream_id: Option<u32>,
}

#[derive(Debug)]
pub struct Http2Connection<S> {
    socket: S,
    secure: bool,
    read_buf: BytesMut,
    encoder: HPackContext,
    decoder: HPackContext,
    local_settings: H2Settings,
    remote_settings: H2Settings,
    settings_acked: bool,
    streams: HashMap<u32, H2Stream>,
    next_stream_id: u32,
    /// Highest server-initiated (pushed) stream id seen.
    last_peer_stream_id: u32,
    conn_send_window: i64,
    pending: Option<PendingHeaderBlock>,
    push_cache: PushCache,
    /// Last stream id from a received GOAWAY.
    going_away: Option<u32>,
    idle_timeout: Duration,
    max_body_size: usize,
}

impl<S: StreamSocket> Http2Connection<S> {
    /// Write the client preface and an empty SETTINGS frame.
    pub async fn connect(socket: S, secure: bool) -> Result<Self, NetError> {
        Self::connect_with_settings(socket, secure, H2Settings::default()).await
    }

    /// Like [`connect`](Self::connect), advertising every non-default value in
    /// `local`.
    pub async fn connect_with_settings(
        socket: S,
        secure: bool,
        local: H2Settings,
    ) -> Result<Self, NetError> {
        let mut decoder = HPackContext::new(local.header_table_size as usize);
        if let Some(limit) = local.max_header_list_size {
            decoder.set_max_header_list_size(limit as usize);
        }

        let mut conn = Self {
            socket,
            secure,
            read_buf: BytesMut::with_capacity(16 * 1024),
            encoder: HPackContext::default(),
            decoder,
            local_settings: local,
            remote_settings: H2Settings::default(),
            settings_acked: false,
            streams: HashMap::new(),
            next_stream_id: 1,
            last_peer_stream_id: 0,
            conn_send_window: i64::from(H2Settings::default().initial_window_size),
            pending: None,
            push_cache: PushCache::new(),
            going_away: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        };

        let mut out = BytesMut::with_capacity(CONNECTION_PREFACE.len() + 64);
        out.extend_from_slice(CONNECTION_PREFACE);
        Frame::Settings {
            ack: false,
            params: local.to_params(),
        }
        .encode(&mut out);
        conn.socket.write_all(&out).await.net_context()?;
        conn.socket.flush().await.net_context()?;

        tracing::debug!(secure, "HTTP/2 preface sent");
        Ok(conn)
    }

    /// Open a stream for a request. `END_STREAM` is set on HEADERS only for
    /// bodyless methods.
    pub async fn request(
        &mut self,
        method: &str,
        path: &str,
        authority: &str,
        extra_headers: &[HeaderField],
    ) -> Result<u32, NetError> {
        let end_stream = is_bodyless_method(method);
        self.open_stream(method, path, authority, extra_headers, end_stream)
            .await
    }

    /// Open a stream, leaving it open for DATA unless `end_stream`.
    pub async fn open_stream(
        &mut self,
        method: &str,
        path: &str,
        authority: &str,
        extra_headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<u32, NetError> {
        if let Some(last_stream_id) = self.going_away {
            tracing::debug!(last_stream_id, "session is going away, refusing new stream");
            return Err(NetError::Http2GoingAway);
        }
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(NetError::Http2GoingAway);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let scheme = if self.secure { "https" } else { "http" };
        let mut fields = Vec::with_capacity(4 + extra_headers.len());
        fields.push(HeaderField::new(":method", method));
        fields.push(HeaderField::new(":path", path));
        fields.push(HeaderField::new(":scheme", scheme));
        fields.push(HeaderField::new(":authority", authority));
        for header in extra_headers {
            let name = header.name.to_ascii_lowercase();
            if name.starts_with(':') || CONNECTION_SPECIFIC_HEADERS.contains(&name.as_str()) {
                continue;
            }
            fields.push(HeaderField::new(name, header.value.clone()));
        }

        let block = Bytes::from(self.encoder.encode(&fields));
        let frames = header_frames(
            stream_id,
            block,
            end_stream,
            self.remote_settings.max_frame_size as usize,
        );

        let mut stream = H2Stream::new(stream_id, i64::from(self.remote_settings.initial_window_size));
        stream.open();
        if end_stream {
            stream.close_local();
        }
        self.streams.insert(stream_id, stream);

        self.write_frames(&frames).await?;
        tracing::debug!(stream_id, method, path, end_stream, "HEADERS sent");
        Ok(stream_id)
    }

    /// Send request body bytes, split at the peer's MAX_FRAME_SIZE.
    ///
    /// Each frame first takes its size out of the send windows; when they are
    /// exhausted this reads frames until a WINDOW_UPDATE makes room.
    pub async fn send_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), NetError> {
        match self.streams.get(&stream_id) {
            Some(s) if matches!(s.state, StreamState::Open | StreamState::HalfClosedRemote) => {}
            _ => return Err(NetError::Http2StreamClosed),
        }
        if data.is_empty() && !end_stream {
            return Ok(());
        }

        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut remaining = data;
        loop {
            let mut len = remaining.len().min(max_frame);
            if len > 0 {
                let available = self.available_send_window(stream_id);
                if available <= 0 {
                    self.wait_for_send_window(stream_id).await?;
                    continue;
                }
                len = len.min(available as usize);
            }
            if !self.consume_send_window(stream_id, len) {
                return Err(NetError::Http2FlowControlError);
            }

            let (chunk, rest) = remaining.split_at(len);
            let last = rest.is_empty();
            let frame = Frame::Data {
                stream_id,
                payload: Bytes::copy_from_slice(chunk),
                end_stream: end_stream && last,
                flow_len: len as u32,
            };
            self.write_frames(std::slice::from_ref(&frame)).await?;
            tracing::trace!(stream_id, len, end_stream = end_stream && last, "DATA sent");

            remaining = rest;
            if last {
                break;
            }
        }

        if end_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.close_local();
            }
        }
        Ok(())
    }

    /// Take `bytes` out of both the stream and the connection send window.
    ///
    /// Returns `false`, changing nothing, if either window is too small.
    pub fn consume_send_window(&mut self, stream_id: u32, bytes: usize) -> bool {
        let bytes = bytes as i64;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if bytes > stream.send_window || bytes > self.conn_send_window {
            return false;
        }
        stream.send_window -= bytes;
        self.conn_send_window -= bytes;
        true
    }

    fn available_send_window(&self, stream_id: u32) -> i64 {
        self.streams
            .get(&stream_id)
            .map_or(0, |s| s.send_window.min(self.conn_send_window))
    }

    async fn wait_for_send_window(&mut self, stream_id: u32) -> Result<(), NetError> {
        tracing::trace!(stream_id, "send window exhausted, waiting for WINDOW_UPDATE");
        loop {
            let n = read_with_idle_timeout(&mut self.socket, &mut self.read_buf, self.idle_timeout)
                .await?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            self.process_buffered().await?;
            match self.streams.get(&stream_id) {
                Some(s) if s.reset.is_some() => return Err(NetError::Http2StreamClosed),
                Some(_) => {}
                None => return Err(NetError::Http2StreamClosed),
            }
            if self.available_send_window(stream_id) > 0 {
                return Ok(());
            }
        }
    }

    /// Read and dispatch frames until `stream_id` has been finished by the
    /// peer. Fails when `idle` passes without any bytes arriving.
    pub async fn receive(&mut self, stream_id: u32, idle: Duration) -> Result<&H2Stream, NetError> {
        loop {
            self.process_buffered().await?;
            match self.streams.get(&stream_id) {
                Some(s) if s.state.is_remote_done() => break,
                Some(_) => {}
                None => return Err(NetError::Http2StreamClosed),
            }

            let n = read_with_idle_timeout(&mut self.socket, &mut self.read_buf, idle).await?;
            if n == 0 {
                tracing::debug!(stream_id, "connection closed while waiting for stream");
                return Err(NetError::ConnectionClosed);
            }
        }

        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(NetError::Http2StreamClosed)?;
        if stream.body_too_big {
            return Err(NetError::ResponseBodyTooBig);
        }
        match stream.reset {
            None | Some(ErrorCode::NoError) => Ok(stream),
            Some(ErrorCode::RefusedStream) => Err(NetError::Http2ServerRefusedStream),
            Some(ErrorCode::FlowControlError) => Err(NetError::Http2FlowControlError),
            Some(_) => Err(NetError::Http2StreamClosed),
        }
    }

    async fn process_buffered(&mut self) -> Result<(), NetError> {
        while let Some(frame) = decode_frame(&mut self.read_buf, self.local_settings.max_frame_size)? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), NetError> {
        match frame {
            Frame::Settings { ack: true, .. } => {
                tracing::trace!("SETTINGS acknowledged");
                self.settings_acked = true;
            }
            Frame::Settings { ack: false, params } => {
                self.apply_remote_settings(&params);
                self.write_frames(&[Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                }])
                .await?;
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                if let (Some(priority), Some(stream)) = (priority, self.streams.get_mut(&stream_id)) {
                    stream.priority = priority;
                }
                self.start_header_block(stream_id, &block, end_stream, None, end_headers)?;
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                self.start_header_block(stream_id, &block, false, Some(promised_stream_id), end_headers)?;
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                match self.pending.as_mut() {
                    Some(pending) if pending.stream_id == stream_id => {
                        if pending.block.len() + block.len() > MAX_HEADER_BLOCK {
                            tracing::warn!(stream_id, "header block too large");
                            return Err(NetError::ResponseHeadersTooBig);
                        }
                        pending.block.extend_from_slice(&block);
                    }
                    _ => {
                        tracing::debug!(stream_id, "ignoring CONTINUATION without a header block");
                        return Ok(());
                    }
                }
                if end_headers {
                    if let Some(pending) = self.pending.take() {
                        self.finish_header_block(pending)?;
                    }
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_len,
            } => {
                self.on_data(stream_id, payload, end_stream, flow_len).await?;
            }
            Frame::Ping { ack: false, payload } => {
                self.write_frames(&[Frame::Ping { ack: true, payload }]).await?;
            }
            Frame::Ping { ack: true, .. } => {
                tracing::trace!("PING acknowledged");
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                tracing::debug!(stream_id, ?error_code, "RST_STREAM received");
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.reset(error_code);
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                tracing::debug!(
                    last_stream_id,
                    ?error_code,
                    debug = %String::from_utf8_lossy(&debug_data),
                    "GOAWAY received"
                );
                self.going_away = Some(last_stream_id);
                for stream in self.streams.values_mut() {
                    if stream.id > last_stream_id && stream.id % 2 == 1 && stream.state != StreamState::Closed {
                        stream.reset(ErrorCode::RefusedStream);
                    }
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if increment == 0 {
                    tracing::debug!(stream_id, "ignoring zero WINDOW_UPDATE");
                } else if stream_id == 0 {
                    let window = self.conn_send_window + i64::from(increment);
                    if window > i64::from(MAX_WINDOW_SIZE) {
                        tracing::warn!(window, "connection send window overflow");
                        self.going_away = Some(self.last_peer_stream_id);
                        self.write_frames(&[Frame::GoAway {
                            last_stream_id: self.last_peer_stream_id,
                            error_code: ErrorCode::FlowControlError,
                            debug_data: Bytes::new(),
                        }])
                        .await?;
                        return Err(NetError::Http2FlowControlError);
                    }
                    self.conn_send_window = window;
                } else if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let window = stream.send_window + i64::from(increment);
                    if window > i64::from(MAX_WINDOW_SIZE) {
                        tracing::warn!(stream_id, window, "stream send window overflow");
                        stream.reset(ErrorCode::FlowControlError);
                        self.write_frames(&[Frame::RstStream {
                            stream_id,
                            error_code: ErrorCode::FlowControlError,
                        }])
                        .await?;
                    } else {
                        stream.send_window = window;
                    }
                }
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.priority = priority;
                }
            }
            Frame::Unknown {
                frame_type,
                stream_id,
            } => {
                tracing::trace!(frame_type, stream_id, "ignoring frame");
            }
        }
        Ok(())
    }

    fn apply_remote_settings(&mut self, params: &[(u16, u32)]) {
        for &(id, value) in params {
            let old_window = self.remote_settings.initial_window_size;
            if !self.remote_settings.apply(id, value) {
                tracing::warn!(id, value, "ignoring invalid SETTINGS value");
                continue;
            }
            match id {
                SETTINGS_HEADER_TABLE_SIZE => self.encoder.update_max_size(value as usize),
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    let delta = i64::from(value) - i64::from(old_window);
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                _ => {}
            }
        }
        tracing::debug!(settings = ?self.remote_settings, "applied peer SETTINGS");
    }

    fn start_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        promised_stream_id: Option<u32>,
        end_headers: bool,
    ) -> Result<(), NetError> {
        let pending = PendingHeaderBlock {
            stream_id,
            block: BytesMut::from(block),
            end_stream,
            promised_stream_id,
        };
        if end_headers {
            self.finish_header_block(pending)
        } else {
            self.pending = Some(pending);
            Ok(())
        }
    }

    /// Decode a complete header block. Blocks for unknown streams are still
    /// decoded so the dynamic table stays in step with the peer.
    fn finish_header_block(&mut self, pending: PendingHeaderBlock) -> Result<(), NetError> {
        let fields = self.decoder.decode(&pending.block)?;
        let stream_id = pending.stream_id;

        if let Some(promised) = pending.promised_stream_id {
            let path = fields
                .iter()
                .find(|f| f.name == ":path")
                .map(|f| f.value.clone());
            tracing::debug!(stream_id, promised_stream_id = promised, path = ?path, "PUSH_PROMISE received");
            self.last_peer_stream_id = self.last_peer_stream_id.max(promised);
            self.streams.insert(
                promised,
                H2Stream::pushed(promised, path, i64::from(self.remote_settings.initial_window_size)),
            );
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            tracing::trace!(stream_id, "header block for unknown stream");
            return Ok(());
        };
        stream.headers.extend(fields);
        if pending.end_stream {
            stream.close_remote();
        }
        tracing::trace!(stream_id, state = ?stream.state, "HEADERS received");
        self.complete_pushed(stream_id);
        Ok(())
    }

    async fn on_data(
        &mut self,
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), NetError> {
        let mut updates = Vec::with_capacity(2);
        if flow_len > 0 {
            updates.push(Frame::WindowUpdate {
                stream_id: 0,
                increment: flow_len,
            });
        }

        let limit = self.max_body_size;
        match self.streams.get_mut(&stream_id) {
            Some(stream)
                if !stream.state.is_remote_done() && stream.body.len() + payload.len() > limit =>
            {
                tracing::warn!(stream_id, limit, "response body too big, cancelling stream");
                stream.body.clear();
                stream.reset(ErrorCode::Cancel);
                stream.body_too_big = true;
                updates.push(Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::Cancel,
                });
            }
            Some(stream) if !stream.state.is_remote_done() => {
                stream.body.extend_from_slice(&payload);
                if end_stream {
                    stream.close();
                } else if flow_len > 0 {
                    updates.push(Frame::WindowUpdate {
                        stream_id,
                        increment: flow_len,
                    });
                }
                tracing::trace!(stream_id, len = payload.len(), end_stream, "DATA received");
            }
            _ => tracing::trace!(stream_id, "DATA for unknown or finished stream"),
        }

        if end_stream {
            self.complete_pushed(stream_id);
        }
        if !updates.is_empty() {
            self.write_frames(&updates).await?;
        }
        Ok(())
    }

    /// Move a finished pushed stream into the push cache.
    fn complete_pushed(&mut self, stream_id: u32) {
        let finished = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.pushed && s.state == StreamState::Closed && s.reset.is_none());
        if !finished {
            return;
        }
        if let Some(stream) = self.streams.remove(&stream_id) {
            if let Some(path) = stream.path {
                self.push_cache.insert(path, stream.headers, stream.body.freeze());
            }
        }
    }

    /// Record a stream's priority and send it to the peer.
    pub async fn set_priority(
        &mut self,
        stream_id: u32,
        dependency: u32,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), NetError> {
        let priority = StreamPriority::new(dependency, weight, exclusive);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.priority = priority;
        }
        self.write_frames(&[Frame::Priority {
            stream_id,
            priority,
        }])
        .await
    }

    /// Order `ids` by descending weight, keeping the given order among equals.
    pub fn sort_by_priority(&self, ids: &[u32]) -> Vec<u32> {
        let mut sorted = ids.to_vec();
        sorted.sort_by_key(|id| {
            Reverse(
                self.streams
                    .get(id)
                    .map_or(StreamPriority::default().weight, |s| s.priority.weight),
            )
        });
        sorted
    }

    /// Send GOAWAY and shut the transport down.
    pub async fn close(&mut self) -> Result<(), NetError> {
        self.write_frames(&[Frame::GoAway {
            last_stream_id: self.last_peer_stream_id,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        }])
        .await?;
        self.socket.shutdown().await.net_context()
    }

    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), NetError> {
        let mut out = BytesMut::new();
        for frame in frames {
            frame.encode(&mut out);
        }
        self.socket.write_all(&out).await.net_context()?;
        self.socket.flush().await.net_context()
    }

    pub fn stream(&self, stream_id: u32) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Drop a finished stream from the table, returning it.
    pub fn remove_stream(&mut self, stream_id: u32) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn active_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.state != StreamState::Closed)
            .count()
    }

    pub fn push_cache(&self) -> &PushCache {
        &self.push_cache
    }

    /// Expect pushes for the `rel=preload` targets of a `Link` header.
    pub fn seed_push_cache(&mut self, link: &str) -> Vec<String> {
        self.push_cache.seed_from_link(link)
    }

    pub fn take_pushed(&mut self, path: &str) -> Option<PushedResponse> {
        self.push_cache.take(path)
    }

    pub fn local_settings(&self) -> &H2Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &H2Settings {
        &self.remote_settings
    }

    pub fn settings_acked(&self) -> bool {
        self.settings_acked
    }

    pub fn conn_send_window(&self) -> i64 {
        self.conn_send_window
    }

    pub fn encoder(&self) -> &HPackContext {
        &self.encoder
    }

    pub fn is_going_away(&self) -> bool {
        self.going_away.is_some()
    }

    /// Whether new streams may still be opened.
    pub fn is_usable(&self) -> bool {
        self.going_away.is_none() && self.next_stream_id <= MAX_STREAM_ID && self.socket.is_connected()
    }

    pub fn set_idle_timeout(&mut self, idle: Duration) {
        self.idle_timeout = idle;
    }

    /// Cap on the body buffered for any one stream.
    pub fn set_max_body_size(&mut self, limit: usize) {
        self.max_body_size = limit;
    }
}

/// HEADERS followed by as many CONTINUATION frames as `max_frame` requires.
fn header_frames(stream_id: u32, mut block: Bytes, end_stream: bool, max_frame: usize) -> Vec<Frame> {
    let first = block.split_to(block.len().min(max_frame));
    let mut frames = vec![Frame::Headers {
        stream_id,
        block: first,
        end_stream,
        end_headers: block.is_empty(),
        priority: None,
    }];
    while !block.is_empty() {
        let chunk = block.split_to(block.len().min(max_frame));
        frames.push(Frame::Continuation {
            stream_id,
            block: chunk,
            end_headers: block.is_empty(),
        });
    }
    frames
}
