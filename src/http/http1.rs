//! HTTP/1.1 request serialization and response parsing.
//!
//! Responses are parsed incrementally out of a read buffer: the head first,
//! then a body delimited by Content-Length, chunked transfer coding or the
//! connection closing.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::client::read_with_idle_timeout;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Version};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Largest accepted response head.
pub const MAX_HEAD_SIZE: usize = 256 * 1024;

/// Most header lines accepted in one response head.
pub const MAX_HEADERS: usize = 128;

/// Default cap on a buffered response body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Longest chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// Serialize a request. `Host` and `Connection` come from the arguments and
/// replace any caller-supplied values.
pub fn build_request(
    method: &Method,
    path: &str,
    host: &str,
    headers: &HeaderMap,
    keep_alive: bool,
    body: Option<&[u8]>,
) -> BytesMut {
    let mut out = BytesMut::with_capacity(256 + body.map_or(0, <[u8]>::len));
    out.extend_from_slice(method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(if path.is_empty() { &b"/"[..] } else { path.as_bytes() });
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b"\r\nConnection: ");
    out.extend_from_slice(if keep_alive { &b"keep-alive"[..] } else { &b"close"[..] });
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == http::header::HOST || name == http::header::CONNECTION {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    let needs_length = body.is_some()
        || matches!(*method, Method::POST | Method::PUT | Method::PATCH);
    if needs_length
        && !headers.contains_key(http::header::CONTENT_LENGTH)
        && !headers.contains_key(http::header::TRANSFER_ENCODING)
    {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(body.map_or(0, <[u8]>::len).to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    /// Case-insensitive; repeated headers such as Set-Cookie keep every value.
    pub headers: HeaderMap,
}

/// Parse a response head from the front of `buf`.
///
/// Returns the head and the number of bytes it occupied, or `None` if the
/// blank line ending it has not arrived yet.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, NetError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) if n > MAX_HEAD_SIZE => {
            return Err(NetError::ResponseHeadersTooBig)
        }
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            return Err(NetError::ResponseHeadersTooBig)
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(NetError::ResponseHeadersTooBig),
        Err(httparse::Error::HeaderName | httparse::Error::HeaderValue) => {
            return Err(NetError::InvalidHeader)
        }
        Err(e) => {
            tracing::debug!(error = %e, "malformed response head");
            return Err(NetError::InvalidHttpResponse);
        }
    };

    let version = match parsed.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        _ => return Err(NetError::InvalidHttpResponse),
    };
    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(NetError::InvalidHttpResponse)?;
    let reason = parsed.reason.unwrap_or("").trim().to_string();

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| NetError::InvalidHeader)?;
        let value = HeaderValue::from_bytes(header.value.trim_ascii()).map_err(|_| NetError::InvalidHeader)?;
        headers.append(name, value);
    }

    Ok(Some((
        ResponseHead {
            version,
            status,
            reason,
            headers,
        },
        consumed,
    )))
}

/// How the body of a response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body (HEAD, 1xx, 204, 304).
    Empty,
    ContentLength(u64),
    Chunked,
    /// Everything until the server closes the connection.
    UntilClose,
}

pub fn body_framing(method: &Method, head: &ResponseHead) -> Result<BodyFraming, NetError> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }

    let chunked = head
        .headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut length = None;
    for value in head.headers.get_all(http::header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(NetError::InvalidHttpResponse)?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(NetError::ResponseHeadersMultipleContentLength)
            }
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(len) => BodyFraming::ContentLength(len),
        None => BodyFraming::UntilClose,
    })
}

/// Whether the connection may carry another request after this response.
pub fn is_keep_alive(head: &ResponseHead, framing: BodyFraming) -> bool {
    if framing == BodyFraming::UntilClose {
        return false;
    }
    let tokens: Vec<String> = head
        .headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    head.version == Version::HTTP_11 || tokens.iter().any(|t| t == "keep-alive")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
///
/// Fails with [`NetError::ResponseBodyTooBig`] as soon as a chunk header
/// announces more data than the limit leaves room for.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    decoded: u64,
    limit: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: ChunkState::Size,
            decoded: 0,
            limit: limit as u64,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume what can be decoded from `input`, appending chunk data to
    /// `out`. Returns `true` once the terminating chunk and trailers are read.
    pub fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<bool, NetError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(input)? else {
                        return Ok(false);
                    };
                    let size_str = line.split(|&b| b == b';').next().unwrap_or_default();
                    let size_str = std::str::from_utf8(size_str)
                        .map_err(|_| NetError::InvalidChunkedEncoding)?
                        .trim();
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| NetError::InvalidChunkedEncoding)?;
                    if size > self.limit - self.decoded {
                        tracing::debug!(size, limit = self.limit, "chunked body over limit");
                        return Err(NetError::ResponseBodyTooBig);
                    }
                    self.decoded += size;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let n = remaining.min(input.len() as u64) as usize;
                    out.extend_from_slice(&input.split_to(n));
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd => {
                    let Some(line) = take_line(input)? else {
                        return Ok(false);
                    };
                    if !line.is_empty() {
                        return Err(NetError::InvalidChunkedEncoding);
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line) = take_line(input)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

/// Take one CRLF (or bare LF) terminated line, without the terminator.
fn take_line(input: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
    let Some(pos) = input.iter().position(|&b| b == b'\n') else {
        if input.len() > MAX_CHUNK_LINE {
            return Err(NetError::InvalidChunkedEncoding);
        }
        return Ok(None);
    };
    if pos > MAX_CHUNK_LINE {
        return Err(NetError::InvalidChunkedEncoding);
    }
    let mut line = input.split_to(pos + 1).freeze();
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Ok(Some(line))
}

/// A fully read response.
#[derive(Debug)]
pub struct Http1Response {
    pub head: ResponseHead,
    pub body: Bytes,
    /// The connection can be pooled.
    pub keep_alive: bool,
}

pub async fn write_request<S>(socket: &mut S, request: &[u8]) -> Result<(), NetError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    socket.write_all(request).await.net_context()?;
    socket.flush().await.net_context()
}

/// Read one response off `socket`.
///
/// Interim 1xx responses are skipped. Every read waits at most `idle` for
/// data, so a slow but steady server is never cut off. Bodies larger than
/// `max_body` fail with [`NetError::ResponseBodyTooBig`].
pub async fn read_response<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    method: &Method,
    idle: Duration,
    max_body: usize,
) -> Result<Http1Response, NetError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let head = read_response_head(socket, buf, idle).await?;
    let (body, keep_alive) = read_body(socket, buf, method, &head, idle, max_body).await?;
    Ok(Http1Response {
        head,
        body,
        keep_alive,
    })
}

/// Read up to the end of the first final (non-1xx) response head.
pub async fn read_response_head<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    idle: Duration,
) -> Result<ResponseHead, NetError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some((head, consumed)) = parse_response_head(buf)? {
            buf.advance(consumed);
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                tracing::trace!(status = %head.status, "skipping interim response");
                continue;
            }
            tracing::trace!(status = %head.status, "response head parsed");
            return Ok(head);
        }
        let n = read_with_idle_timeout(socket, buf, idle).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                NetError::EmptyResponse
            } else {
                NetError::ConnectionClosed
            });
        }
    }
}

/// Read the body that follows `head`, at most `max_body` bytes of it. Also
/// reports whether the connection can carry another request.
pub async fn read_body<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    method: &Method,
    head: &ResponseHead,
    idle: Duration,
    max_body: usize,
) -> Result<(Bytes, bool), NetError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let framing = body_framing(method, head)?;
    let body = match framing {
        BodyFraming::Empty => Bytes::new(),
        BodyFraming::ContentLength(len) => {
            let len = usize::try_from(len)
                .ok()
                .filter(|&len| len <= max_body)
                .ok_or(NetError::ResponseBodyTooBig)?;
            while buf.len() < len {
                let n = read_with_idle_timeout(socket, buf, idle).await?;
                if n == 0 {
                    return Err(NetError::ContentLengthMismatch);
                }
            }
            buf.split_to(len).freeze()
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::with_limit(max_body);
            let mut body = BytesMut::new();
            while !decoder.decode(buf, &mut body)? {
                let n = read_with_idle_timeout(socket, buf, idle).await?;
                if n == 0 {
                    return Err(NetError::IncompleteChunkedEncoding);
                }
            }
            body.freeze()
        }
        BodyFraming::UntilClose => {
            loop {
                if buf.len() > max_body {
                    return Err(NetError::ResponseBodyTooBig);
                }
                if read_with_idle_timeout(socket, buf, idle).await? == 0 {
                    break;
                }
            }
            buf.split().freeze()
        }
    };

    // Bytes past the end of the response mean the stream is out of step.
    let keep_alive = is_keep_alive(head, framing) && buf.is_empty();
    Ok((body, keep_alive))
}
