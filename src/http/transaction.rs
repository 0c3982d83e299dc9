//! One request's trip over an already connected socket or HTTP/2 session.
//!
//! The transaction walks a small state machine and publishes every step as a
//! [`LoadState`] so callers can watch progress from another task.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::http::http1;
use crate::http::response::HttpResponse;
use crate::socket::client::{ConnectTarget, ProtocolVersion, StreamSocket};
use crate::socket::pool::PoolKey;
use crate::spdy::h2connection::Http2Connection;
use crate::spdy::hpack::HeaderField;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, LINK};
use http::{HeaderMap, Method, StatusCode, Version};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// A request as handed to the engine.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overrides the engine's default protocol.
    pub protocol: Option<ProtocolVersion>,
    /// Overrides the engine's read idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Caller-resolved address; the host name is still used for `Host`.
    pub resolved_addr: Option<IpAddr>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            protocol: None,
            idle_timeout: None,
            resolved_addr: None,
        }
    }

    /// Reject URLs the engine cannot serve.
    pub fn validate(&self) -> Result<(), NetError> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => {
                tracing::debug!(scheme = other, "unsupported URL scheme");
                return Err(NetError::UnknownUrlScheme);
            }
        }
        if self.url.host_str().map_or(true, str::is_empty) {
            return Err(NetError::InvalidUrl);
        }
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn host(&self) -> Result<&str, NetError> {
        self.url.host_str().ok_or(NetError::InvalidUrl)
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// `host[:port]`, with the port left out when it is the scheme default.
    pub fn authority(&self) -> Result<String, NetError> {
        let host = self.host()?;
        Ok(match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Request target: path plus query, never the fragment.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn pool_key(&self) -> Result<PoolKey, NetError> {
        Ok(PoolKey::new(self.host()?, self.port(), self.is_secure()))
    }

    pub fn connect_target(&self) -> Result<ConnectTarget, NetError> {
        Ok(ConnectTarget {
            host: self.host()?.to_string(),
            port: self.port(),
            secure: self.is_secure(),
            addr: self.resolved_addr,
        })
    }
}

/// Internal state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    CacheLookup,
    AcquireSocket,
    Connect,
    SendRequest,
    ReadHeaders,
    ReadBody,
    Done,
}

impl State {
    /// Map internal state to public LoadState.
    fn to_load_state(self) -> LoadState {
        match self {
            State::Idle | State::Done => LoadState::Idle,
            State::CacheLookup => LoadState::WaitingForCache,
            State::AcquireSocket => LoadState::WaitingForAvailableSocket,
            State::Connect => LoadState::Connecting,
            State::SendRequest => LoadState::SendingRequest,
            State::ReadHeaders => LoadState::WaitingForResponse,
            State::ReadBody => LoadState::ReadingResponse,
        }
    }
}

/// Result of an HTTP/1.1 exchange: the response plus whether the socket may
/// go back to the pool.
#[derive(Debug)]
pub struct Http1Outcome {
    pub response: HttpResponse,
    pub keep_alive: bool,
}

pub struct HttpTransaction {
    request: HttpRequest,
    state: State,
    load_state: watch::Sender<LoadState>,
    max_body_size: usize,
}

impl HttpTransaction {
    pub fn new(request: HttpRequest) -> Self {
        let (load_state, _) = watch::channel(LoadState::Idle);
        Self {
            request,
            state: State::Idle,
            load_state,
            max_body_size: http1::DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Fail with [`NetError::ResponseBodyTooBig`] past `limit` body bytes.
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Get the current load state (for progress reporting).
    pub fn load_state(&self) -> LoadState {
        *self.load_state.borrow()
    }

    /// Watch load state changes from another task.
    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.load_state.subscribe()
    }

    pub(crate) fn enter(&mut self, state: State) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, url = %self.request.url, "transaction state");
        }
        self.state = state;
        self.load_state.send_replace(state.to_load_state());
    }

    /// Send the request over an HTTP/1.1 connection and read the response.
    pub async fn send_http1<S: StreamSocket>(
        &mut self,
        socket: &mut S,
        idle: Duration,
    ) -> Result<Http1Outcome, NetError> {
        let result = self.exchange_http1(socket, idle).await;
        self.enter(State::Done);
        result
    }

    async fn exchange_http1<S: StreamSocket>(
        &mut self,
        socket: &mut S,
        idle: Duration,
    ) -> Result<Http1Outcome, NetError> {
        self.enter(State::SendRequest);
        let authority = self.request.authority()?;
        let wire = http1::build_request(
            &self.request.method,
            &self.request.path_and_query(),
            &authority,
            &self.request.headers,
            true,
            self.request.body.as_deref(),
        );
        http1::write_request(socket, &wire).await?;

        self.enter(State::ReadHeaders);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let head = http1::read_response_head(socket, &mut buf, idle).await?;

        self.enter(State::ReadBody);
        let (body, keep_alive) =
            http1::read_body(socket, &mut buf, &self.request.method, &head, idle, self.max_body_size)
                .await?;

        tracing::debug!(
            url = %self.request.url,
            status = %head.status,
            body_len = body.len(),
            keep_alive,
            "HTTP/1.1 response"
        );
        let response = HttpResponse::new(
            self.request.url.clone(),
            head.status,
            head.version,
            head.headers,
            body,
        );
        Ok(Http1Outcome {
            response,
            keep_alive,
        })
    }

    /// Send the request as a new stream on `session` and wait for it to finish.
    ///
    /// A GET whose path already sits complete in the session's push cache is
    /// answered from there without opening a stream.
    pub async fn send_http2<S: StreamSocket>(
        &mut self,
        session: &mut Http2Connection<S>,
        idle: Duration,
    ) -> Result<HttpResponse, NetError> {
        let result = self.exchange_http2(session, idle).await;
        self.enter(State::Done);
        result
    }

    async fn exchange_http2<S: StreamSocket>(
        &mut self,
        session: &mut Http2Connection<S>,
        idle: Duration,
    ) -> Result<HttpResponse, NetError> {
        let path = self.request.path_and_query();

        if self.request.method == Method::GET {
            if let Some(pushed) = session.take_pushed(&path) {
                tracing::debug!(path = %path, "serving request from pushed stream");
                let (status, headers) = split_pseudo_headers(&pushed.headers)?;
                return Ok(HttpResponse::new(
                    self.request.url.clone(),
                    status,
                    Version::HTTP_2,
                    headers,
                    pushed.body,
                ));
            }
        }

        self.enter(State::SendRequest);
        let authority = self.request.authority()?;
        let extras: Vec<HeaderField> = self
            .request
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| HeaderField::new(name.as_str(), v))
            })
            .collect();
        let body = self.request.body.clone();
        let stream_id = session
            .open_stream(
                self.request.method.as_str(),
                &path,
                &authority,
                &extras,
                body.is_none(),
            )
            .await?;
        if let Some(body) = body {
            session.send_data(stream_id, &body, true).await?;
        }

        self.enter(State::ReadHeaders);
        let received = session.receive(stream_id, idle).await;
        let stream = match received {
            Ok(_) => session.remove_stream(stream_id),
            Err(e) => {
                session.remove_stream(stream_id);
                return Err(e);
            }
        };
        let stream = stream.ok_or(NetError::Http2StreamClosed)?;

        self.enter(State::ReadBody);
        let (status, headers) = split_pseudo_headers(&stream.headers)?;
        for link in headers.get_all(LINK) {
            if let Ok(link) = link.to_str() {
                session.seed_push_cache(link);
            }
        }

        tracing::debug!(
            url = %self.request.url,
            stream_id,
            status = %status,
            body_len = stream.body.len(),
            "HTTP/2 response"
        );
        Ok(HttpResponse::new(
            self.request.url.clone(),
            status,
            Version::HTTP_2,
            headers,
            stream.body.freeze(),
        ))
    }
}

/// Pull `:status` out of a decoded header list and collect the regular
/// fields into a `HeaderMap`.
fn split_pseudo_headers(fields: &[HeaderField]) -> Result<(StatusCode, HeaderMap), NetError> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    for field in fields {
        if field.name == ":status" {
            status = Some(
                field
                    .value
                    .parse::<u16>()
                    .ok()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(NetError::InvalidHttpResponse)?,
            );
            continue;
        }
        if field.name.starts_with(':') {
            continue;
        }
        let name =
            HeaderName::from_bytes(field.name.as_bytes()).map_err(|_| NetError::InvalidHeader)?;
        let value = HeaderValue::from_str(&field.value).map_err(|_| NetError::InvalidHeader)?;
        headers.append(name, value);
    }
    let status = status.ok_or(NetError::InvalidHttpResponse)?;
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request(url: &str) -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse(url).unwrap())
    }

    #[test]
    fn test_request_parts() {
        let req = request("https://Example.com:8443/a/b?q=1#frag");
        assert!(req.is_secure());
        assert_eq!(req.port(), 8443);
        assert_eq!(req.authority().unwrap(), "example.com:8443");
        assert_eq!(req.path_and_query(), "/a/b?q=1");
        assert_eq!(req.pool_key().unwrap(), PoolKey::new("example.com", 8443, true));

        let req = request("http://example.com/");
        assert_eq!(req.port(), 80);
        assert_eq!(req.authority().unwrap(), "example.com");
    }

    #[test]
    fn test_validate_scheme() {
        assert!(request("http://example.com/").validate().is_ok());
        assert_eq!(
            request("ftp://example.com/").validate().unwrap_err(),
            NetError::UnknownUrlScheme
        );
    }

    #[test]
    fn test_split_pseudo_headers() {
        let fields = vec![
            HeaderField::new(":status", "404"),
            HeaderField::new("set-cookie", "a=1"),
            HeaderField::new("set-cookie", "b=2"),
        ];
        let (status, headers) = split_pseudo_headers(&fields).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);

        let missing = vec![HeaderField::new("server", "x")];
        assert_eq!(
            split_pseudo_headers(&missing).unwrap_err(),
            NetError::InvalidHttpResponse
        );
    }

    #[tokio::test]
    async fn test_http1_exchange_reports_load_states() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            text
        });

        let mut txn = HttpTransaction::new(request("http://example.com/index?x=1"));
        let mut states = txn.subscribe();
        assert_eq!(txn.load_state(), LoadState::Idle);

        let outcome = txn
            .send_http1(&mut client, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.response.status(), StatusCode::OK);
        assert_eq!(&outcome.response.body()[..], b"hello");
        assert!(outcome.keep_alive);
        assert_eq!(txn.load_state(), LoadState::Idle);
        assert!(states.has_changed().unwrap());

        let sent = server_task.await.unwrap();
        assert!(sent.starts_with("GET /index?x=1 HTTP/1.1\r\nHost: example.com\r\n"));
    }

    #[tokio::test]
    async fn test_http1_body_over_limit() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut txn = HttpTransaction::new(request("http://example.com/")).with_max_body_size(4);
        let err = txn
            .send_http1(&mut client, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, NetError::ResponseBodyTooBig);
        assert_eq!(txn.load_state(), LoadState::Idle);
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_http1_silence_times_out() {
        let (mut client, _server) = tokio::io::duplex(4096);
        let mut txn = HttpTransaction::new(request("http://example.com/"));
        let err = txn
            .send_http1(&mut client, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, NetError::TimedOut);
        assert_eq!(txn.load_state(), LoadState::Idle);
    }
}
