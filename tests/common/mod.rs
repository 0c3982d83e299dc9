//! Scripted in-memory servers for integration tests.
//!
//! Each connector hands out one end of a `tokio::io::duplex` pipe and runs a
//! server task on the other end that answers requests from a queue.

#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wirenet::socket::{ConnectTarget, Connector};
use wirenet::spdy::frame::{decode_frame, Frame};
use wirenet::spdy::{HPackContext, HeaderField};
use wirenet::NetError;

enum Reply {
    Respond { bytes: Vec<u8>, close: bool },
    /// Drop the connection without answering.
    HangUp,
    /// Keep the connection open and never answer.
    Silent,
}

#[derive(Default)]
struct H1State {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<String>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

/// HTTP/1.1 server answering from a reply queue.
#[derive(Clone, Default)]
pub struct H1Connector {
    state: Arc<H1State>,
}

impl H1Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response; the connection stays open afterwards.
    pub fn reply(&self, raw: &str) {
        self.push(Reply::Respond {
            bytes: raw.as_bytes().to_vec(),
            close: false,
        });
    }

    /// Queue a raw response, then close the connection.
    pub fn reply_and_close(&self, raw: &str) {
        self.push(Reply::Respond {
            bytes: raw.as_bytes().to_vec(),
            close: true,
        });
    }

    pub fn hang_up(&self) {
        self.push(Reply::HangUp);
    }

    pub fn stay_silent(&self) {
        self.push(Reply::Silent);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every request seen so far, head and body as text.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    fn push(&self, reply: Reply) {
        self.state.replies.lock().unwrap().push_back(reply);
    }
}

impl Connector for H1Connector {
    type Socket = DuplexStream;

    async fn connect(&self, _target: &ConnectTarget) -> Result<DuplexStream, NetError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(NetError::ConnectionRefused);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_h1(Arc::clone(&self.state), server));
        Ok(client)
    }
}

async fn serve_h1(state: Arc<H1State>, mut io: DuplexStream) {
    let mut buf = BytesMut::new();
    loop {
        let Some(request) = read_h1_request(&mut io, &mut buf).await else {
            return;
        };
        state.requests.lock().unwrap().push(request);

        let reply = state.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Respond { bytes, close }) => {
                if io.write_all(&bytes).await.is_err() || close {
                    return;
                }
            }
            Some(Reply::Silent) => {}
            Some(Reply::HangUp) | None => return,
        }
    }
}

async fn read_h1_request(io: &mut DuplexStream, buf: &mut BytesMut) -> Option<String> {
    let head_len = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if io.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
    let body_len = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_len + body_len {
        if io.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    }
    let request = String::from_utf8_lossy(&buf[..head_len + body_len]).to_string();
    buf.advance(head_len + body_len);
    Some(request)
}

/// One scripted HTTP/2 response.
#[derive(Debug, Clone)]
pub struct H2Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl H2Reply {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A request as the HTTP/2 server saw it.
#[derive(Debug, Clone)]
pub struct H2Request {
    pub stream_id: u32,
    pub headers: Vec<HeaderField>,
    pub body: Bytes,
}

impl H2Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

#[derive(Default)]
struct H2State {
    replies: Mutex<VecDeque<H2Reply>>,
    requests: Mutex<Vec<H2Request>>,
    connects: AtomicUsize,
}

/// HTTP/2 server answering each stream from a reply queue.
#[derive(Clone, Default)]
pub struct H2Connector {
    state: Arc<H2State>,
}

impl H2Connector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, reply: H2Reply) {
        self.state.replies.lock().unwrap().push_back(reply);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<H2Request> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Connector for H2Connector {
    type Socket = DuplexStream;

    async fn connect(&self, _target: &ConnectTarget) -> Result<DuplexStream, NetError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(serve_h2(Arc::clone(&self.state), server));
        Ok(client)
    }
}

async fn write_frames(io: &mut DuplexStream, frames: &[Frame]) -> bool {
    let mut out = BytesMut::new();
    for frame in frames {
        frame.encode(&mut out);
    }
    io.write_all(&out).await.is_ok()
}

async fn serve_h2(state: Arc<H2State>, mut io: DuplexStream) {
    let mut preface = [0u8; 24];
    if io.read_exact(&mut preface).await.is_err() {
        return;
    }
    let mut buf = BytesMut::new();
    let mut encoder = HPackContext::default();
    let mut decoder = HPackContext::default();
    let mut open: HashMap<u32, (Vec<HeaderField>, BytesMut)> = HashMap::new();

    let settings = Frame::Settings {
        ack: false,
        params: vec![],
    };
    if !write_frames(&mut io, &[settings]).await {
        return;
    }

    loop {
        let frame = loop {
            match decode_frame(&mut buf, 1 << 20) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => return,
            }
            match io.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        let finished = match frame {
            Frame::Settings { ack: false, .. } => {
                let ack = Frame::Settings {
                    ack: true,
                    params: vec![],
                };
                if !write_frames(&mut io, &[ack]).await {
                    return;
                }
                None
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                ..
            } => {
                let Ok(fields) = decoder.decode(&block) else {
                    return;
                };
                if end_stream {
                    Some((stream_id, fields, Bytes::new()))
                } else {
                    open.insert(stream_id, (fields, BytesMut::new()));
                    None
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                if let Some((_, body)) = open.get_mut(&stream_id) {
                    body.extend_from_slice(&payload);
                }
                if end_stream {
                    open.remove(&stream_id)
                        .map(|(fields, body)| (stream_id, fields, body.freeze()))
                } else {
                    None
                }
            }
            Frame::GoAway { .. } => return,
            _ => None,
        };

        let Some((stream_id, headers, body)) = finished else {
            continue;
        };
        state.requests.lock().unwrap().push(H2Request {
            stream_id,
            headers,
            body,
        });

        let reply = state.replies.lock().unwrap().pop_front();
        let Some(reply) = reply else {
            return;
        };
        let mut fields = vec![HeaderField::new(":status", reply.status.to_string())];
        fields.extend(reply.headers.iter().map(|(n, v)| HeaderField::new(n.as_str(), v.as_str())));
        let mut frames = vec![Frame::Headers {
            stream_id,
            block: Bytes::from(encoder.encode(&fields)),
            end_stream: reply.body.is_empty(),
            end_headers: true,
            priority: None,
        }];
        if !reply.body.is_empty() {
            frames.push(Frame::Data {
                stream_id,
                payload: Bytes::from(reply.body.clone()),
                end_stream: true,
                flow_len: reply.body.len() as u32,
            });
        }
        if !write_frames(&mut io, &frames).await {
            return;
        }
    }
}
