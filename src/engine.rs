//! Request engine with builder pattern.
//!
//! The engine ties the pieces together: cache lookup, pooled or fresh
//! connection, HTTP/1.1 or HTTP/2 exchange, then cookie and cache
//! bookkeeping on the way out.
//!
//! # Example
//!
//! ```rust,no_run
//! use wirenet::RequestEngine;
//!
//! # async fn run() -> Result<(), wirenet::NetError> {
//! let engine = RequestEngine::builder()
//!     .user_agent("my-app/1.0")
//!     .build();
//!
//! let resp = engine.get("http://example.com/").send().await?;
//! println!("{} from_cache={}", resp.status(), resp.is_from_cache());
//! # Ok(())
//! # }
//! ```

use crate::base::neterror::NetError;
use crate::cookies::jar::CookieJar;
use crate::http::http1::DEFAULT_MAX_BODY_SIZE;
use crate::http::httpcache::{CacheMode, HttpCache, DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::http::response::HttpResponse;
use crate::http::transaction::{HttpRequest, HttpTransaction, State};
use crate::socket::client::{Connector, ProtocolVersion, StreamSocket, TcpConnector};
use crate::socket::pool::{ConnectionPool, PoolKey, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_IDLE};
use crate::spdy::h2connection::Http2Connection;
use crate::spdy::h2settings::H2Settings;
use bytes::Bytes;
use http::header::{HeaderValue, COOKIE, SET_COOKIE, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

/// `User-Agent` sent when the caller sets none.
pub const DEFAULT_USER_AGENT: &str = concat!("wirenet/", env!("CARGO_PKG_VERSION"));

/// Default read idle timeout.
pub const DEFAULT_READ_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

type SharedSession<S> = Arc<Mutex<Http2Connection<S>>>;

/// Engine-wide settings. Every field has a default; see [`EngineBuilder`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle keep-alive connections kept across all hosts.
    pub pool_max_idle: usize,
    /// How long an idle connection stays reusable.
    pub pool_idle_timeout: Duration,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    /// Freshness for responses with neither `max-age` nor `Expires`.
    pub cache_default_ttl: Duration,
    pub cache_mode: CacheMode,
    /// Longest silence tolerated while reading a response.
    pub idle_timeout: Duration,
    /// Largest response body buffered before the request fails.
    pub max_body_size: usize,
    /// Protocol used when a request does not pick one.
    pub protocol: ProtocolVersion,
    pub user_agent: Option<String>,
    /// SETTINGS sent after the HTTP/2 preface.
    pub h2_settings: H2Settings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_max_idle: DEFAULT_MAX_IDLE,
            pool_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            cache_max_bytes: DEFAULT_MAX_BYTES,
            cache_default_ttl: DEFAULT_TTL,
            cache_mode: CacheMode::Normal,
            idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            protocol: ProtocolVersion::Http11,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            h2_settings: H2Settings::default(),
        }
    }
}

struct EngineInner<C: Connector> {
    connector: C,
    config: EngineConfig,
    pool: Arc<ConnectionPool<C::Socket>>,
    cache: Arc<HttpCache>,
    cookies: Arc<CookieJar>,
    sessions: Mutex<HashMap<PoolKey, SharedSession<C::Socket>>>,
}

/// Issues requests. Cheap to clone; clones share pool, cache, cookies and
/// HTTP/2 sessions.
pub struct RequestEngine<C: Connector = TcpConnector> {
    inner: Arc<EngineInner<C>>,
}

impl<C: Connector> Clone for RequestEngine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for RequestEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("cache_entries", &self.inner.cache.len())
            .field("cookies", &self.inner.cookies.len())
            .finish()
    }
}

impl Default for RequestEngine<TcpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestEngine<TcpConnector> {
    /// Create an engine over plain TCP with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder<TcpConnector> {
        EngineBuilder::new(TcpConnector::default())
    }
}

impl<C: Connector> RequestEngine<C> {
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C::Socket>> {
        &self.inner.pool
    }

    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.inner.cache
    }

    pub fn cookies(&self) -> &Arc<CookieJar> {
        &self.inner.cookies
    }

    /// Number of HTTP/2 sessions currently held open.
    pub async fn h2_session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Start building a GET request.
    pub fn get<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::GET, url)
    }

    /// Start building a POST request.
    pub fn post<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::POST, url)
    }

    /// Start building a PUT request.
    pub fn put<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::PUT, url)
    }

    /// Start building a DELETE request.
    pub fn delete<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::DELETE, url)
    }

    /// Start building a HEAD request.
    pub fn head<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::HEAD, url)
    }

    /// Start building a PATCH request.
    pub fn patch<U: AsRef<str>>(&self, url: U) -> RequestBuilder<C> {
        self.request(Method::PATCH, url)
    }

    /// Start building a request with custom method.
    pub fn request<U: AsRef<str>>(&self, method: Method, url: U) -> RequestBuilder<C> {
        RequestBuilder {
            engine: self.clone(),
            method,
            url: url.as_ref().to_string(),
            headers: HeaderMap::new(),
            body: None,
            protocol: None,
            idle_timeout: None,
            resolved_addr: None,
        }
    }

    /// Run one request to completion.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, NetError> {
        let mut txn = HttpTransaction::new(request).with_max_body_size(self.inner.config.max_body_size);
        self.execute_transaction(&mut txn).await
    }

    /// Run a transaction created by the caller, who may be watching its
    /// load state.
    ///
    /// A transport failure on a GET falls back to a stale cached copy when
    /// the entry's Cache-Control allows it. Nothing is retried.
    pub async fn execute_transaction(
        &self,
        txn: &mut HttpTransaction,
    ) -> Result<HttpResponse, NetError> {
        txn.request().validate()?;
        self.add_default_headers(txn.request_mut());

        let url = txn.request().url.clone();
        let method = txn.request().method.clone();
        let cacheable = method == Method::GET;
        // Vary values are captured from the request as sent, minus the
        // conditional headers added below.
        let key_headers = txn.request().headers.clone();
        let cache = &self.inner.cache;

        let mut revalidating = false;
        if cacheable {
            txn.enter(State::CacheLookup);
            if let Some(lookup) = cache.get(&url, &key_headers) {
                if !lookup.needs_revalidation {
                    tracing::debug!(url = %url, "serving fresh response from cache");
                    txn.enter(State::Done);
                    return Ok(HttpResponse::from_cache_entry(url, lookup.entry));
                }
                tracing::debug!(url = %url, "revalidating stale cache entry");
                HttpCache::add_conditional_headers(&lookup.entry, &mut txn.request_mut().headers);
                revalidating = true;
            }
        }

        let dispatched = self.dispatch(txn).await;
        txn.enter(State::Done);
        let response = match dispatched {
            Ok(response) => response,
            Err(e) if cacheable && e.is_transport_error() => {
                return match cache.get_stale(&url, &key_headers) {
                    Some(entry) => {
                        tracing::warn!(url = %url, error = %e, "network failed, serving stale cached response");
                        Ok(HttpResponse::from_cache_entry(url, entry))
                    }
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        self.store_cookies(&url, response.headers());

        let status = response.status();
        if revalidating && status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cache.handle_not_modified(&url, &key_headers, response.headers()) {
                return Ok(HttpResponse::from_cache_entry(url, entry));
            }
        }

        if cacheable && status == StatusCode::OK {
            cache.put(
                &url,
                &key_headers,
                status,
                response.headers(),
                response.body().clone(),
            );
        } else if !method.is_safe() && (status.is_success() || status.is_redirection()) {
            cache.invalidate(&url);
        }

        Ok(response)
    }

    fn add_default_headers(&self, request: &mut HttpRequest) {
        if !request.headers.contains_key(COOKIE) {
            let cookies = self.inner.cookies.cookie_header_for_url(&request.url);
            if !cookies.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&cookies) {
                    request.headers.insert(COOKIE, value);
                }
            }
        }
        if !request.headers.contains_key(USER_AGENT) {
            if let Some(ua) = self.inner.config.user_agent.as_deref() {
                if let Ok(value) = HeaderValue::from_str(ua) {
                    request.headers.insert(USER_AGENT, value);
                }
            }
        }
    }

    fn store_cookies(&self, url: &Url, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(line) => {
                    self.inner.cookies.set_cookie(line, url);
                }
                Err(_) => tracing::debug!(url = %url, "ignoring non-ASCII Set-Cookie"),
            }
        }
    }

    async fn dispatch(&self, txn: &mut HttpTransaction) -> Result<HttpResponse, NetError> {
        let protocol = txn.request().protocol.unwrap_or(self.inner.config.protocol);
        let idle = txn
            .request()
            .idle_timeout
            .unwrap_or(self.inner.config.idle_timeout);
        let key = txn.request().pool_key()?;

        match protocol {
            ProtocolVersion::Http11 => self.send_http1(txn, key, idle).await,
            ProtocolVersion::Http2 => {
                let session = self.h2_session(txn, &key).await?;
                self.send_on_session(txn, &key, session, idle).await
            }
        }
    }

    async fn send_http1(
        &self,
        txn: &mut HttpTransaction,
        key: PoolKey,
        idle: Duration,
    ) -> Result<HttpResponse, NetError> {
        txn.enter(State::AcquireSocket);
        let mut socket = match self.inner.pool.acquire(&key) {
            Some(socket) => socket,
            None => {
                txn.enter(State::Connect);
                let target = txn.request().connect_target()?;
                let socket = self.inner.connector.connect(&target).await?;

                // TLS picked h2 and the caller left the choice to us.
                if txn.request().protocol.is_none()
                    && socket.negotiated_protocol() == Some(ProtocolVersion::Http2)
                {
                    tracing::debug!(key = %key, "ALPN selected h2");
                    let session = self.install_session(&key, socket).await?;
                    return self.send_on_session(txn, &key, session, idle).await;
                }
                socket
            }
        };

        let outcome = txn.send_http1(&mut socket, idle).await?;
        if outcome.keep_alive {
            self.inner.pool.release(key, socket);
        } else {
            tracing::trace!(key = %key, "closing connection after response");
        }
        Ok(outcome.response)
    }

    /// The live session for `key`, connecting one if needed. The map lock is
    /// held across the connect so one key never gets two sessions at once.
    async fn h2_session(
        &self,
        txn: &mut HttpTransaction,
        key: &PoolKey,
    ) -> Result<SharedSession<C::Socket>, NetError> {
        txn.enter(State::AcquireSocket);
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get(key) {
            // A session busy with another request is in use, hence alive.
            let usable = session.try_lock().map_or(true, |conn| conn.is_usable());
            if usable {
                tracing::trace!(key = %key, "reusing HTTP/2 session");
                return Ok(Arc::clone(session));
            }
            tracing::debug!(key = %key, "discarding unusable HTTP/2 session");
            sessions.remove(key);
        }

        txn.enter(State::Connect);
        let target = txn.request().connect_target()?;
        let socket = self.inner.connector.connect(&target).await?;
        let session = self.new_session(key, socket).await?;
        sessions.insert(key.clone(), Arc::clone(&session));
        Ok(session)
    }

    async fn install_session(
        &self,
        key: &PoolKey,
        socket: C::Socket,
    ) -> Result<SharedSession<C::Socket>, NetError> {
        let session = self.new_session(key, socket).await?;
        self.inner
            .sessions
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&session));
        Ok(session)
    }

    async fn new_session(
        &self,
        key: &PoolKey,
        socket: C::Socket,
    ) -> Result<SharedSession<C::Socket>, NetError> {
        let mut conn =
            Http2Connection::connect_with_settings(socket, key.secure, self.inner.config.h2_settings)
                .await?;
        conn.set_idle_timeout(self.inner.config.idle_timeout);
        conn.set_max_body_size(self.inner.config.max_body_size);
        tracing::debug!(key = %key, "opened HTTP/2 session");
        Ok(Arc::new(Mutex::new(conn)))
    }

    async fn send_on_session(
        &self,
        txn: &mut HttpTransaction,
        key: &PoolKey,
        session: SharedSession<C::Socket>,
        idle: Duration,
    ) -> Result<HttpResponse, NetError> {
        let (result, usable) = {
            let mut conn = session.lock().await;
            let result = txn.send_http2(&mut *conn, idle).await;
            (result, conn.is_usable())
        };

        let broken = result.as_ref().is_err_and(NetError::is_transport_error);
        if broken || !usable {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                sessions.remove(key);
                tracing::debug!(key = %key, "dropped HTTP/2 session");
            }
        }
        result
    }

    /// One maintenance pass: expired idle sockets, cache entries and cookies
    /// go, as do HTTP/2 sessions that can no longer open streams.
    pub async fn run_maintenance(&self) {
        let sockets = self.inner.pool.cleanup_idle();
        let entries = self.inner.cache.purge_expired();
        let cookies = self.inner.cookies.purge_expired();

        let mut sessions = self.inner.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.try_lock().map_or(true, |conn| conn.is_usable()));
        let dead_sessions = before - sessions.len();

        tracing::debug!(sockets, entries, cookies, dead_sessions, "maintenance pass");
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval`.
    /// The task stops once the last engine handle is dropped.
    pub fn start_maintenance_task(&self, interval: Duration) -> JoinHandle<()> {
        let inner: Weak<EngineInner<C>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                RequestEngine { inner }.run_maintenance().await;
            }
        })
    }
}

/// Builder for creating a [`RequestEngine`].
pub struct EngineBuilder<C: Connector = TcpConnector> {
    connector: C,
    config: EngineConfig,
    pool: Option<Arc<ConnectionPool<C::Socket>>>,
    cache: Option<Arc<HttpCache>>,
    cookies: Option<Arc<CookieJar>>,
}

impl<C: Connector> EngineBuilder<C> {
    /// Start from defaults with a custom transport.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: EngineConfig::default(),
            pool: None,
            cache: None,
            cookies: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool_capacity(mut self, max_idle: usize) -> Self {
        self.config.pool_max_idle = max_idle;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    pub fn cache_limits(mut self, max_entries: usize, max_bytes: usize) -> Self {
        self.config.cache_max_entries = max_entries;
        self.config.cache_max_bytes = max_bytes;
        self
    }

    pub fn cache_default_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_default_ttl = ttl;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.config.cache_mode = mode;
        self
    }

    /// Set the read idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Cap on a buffered response body, for HTTP/1.1 and HTTP/2 alike.
    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.config.max_body_size = limit;
        self
    }

    /// Protocol for requests that do not choose one.
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Send no `User-Agent` unless a request sets one.
    pub fn no_user_agent(mut self) -> Self {
        self.config.user_agent = None;
        self
    }

    /// Set HTTP/2 SETTINGS announced on new sessions.
    pub fn h2_settings(mut self, settings: H2Settings) -> Self {
        self.config.h2_settings = settings;
        self
    }

    /// Share an existing pool. Pool limits in the config are then unused.
    pub fn pool(mut self, pool: Arc<ConnectionPool<C::Socket>>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Share an existing cache. Cache limits in the config are then unused.
    pub fn cache(mut self, cache: Arc<HttpCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set cookie store.
    pub fn cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.cookies = Some(jar);
        self
    }

    /// Build the engine.
    pub fn build(self) -> RequestEngine<C> {
        let config = self.config;
        let pool = self.pool.unwrap_or_else(|| {
            Arc::new(ConnectionPool::with_limits(
                config.pool_max_idle,
                config.pool_idle_timeout,
            ))
        });
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(
                HttpCache::with_limits(config.cache_max_entries, config.cache_max_bytes)
                    .with_default_ttl(config.cache_default_ttl)
                    .with_mode(config.cache_mode),
            )
        });
        let cookies = self.cookies.unwrap_or_default();

        RequestEngine {
            inner: Arc::new(EngineInner {
                connector: self.connector,
                config,
                pool,
                cache,
                cookies,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Builder for a single request.
pub struct RequestBuilder<C: Connector = TcpConnector> {
    engine: RequestEngine<C>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    protocol: Option<ProtocolVersion>,
    idle_timeout: Option<Duration>,
    resolved_addr: Option<IpAddr>,
}

impl<C: Connector> RequestBuilder<C> {
    /// Add a header. Invalid values are skipped.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: http::header::IntoHeaderName,
        V: TryInto<HeaderValue>,
    {
        if let Ok(val) = value.try_into() {
            self.headers.insert(key, val);
        }
        self
    }

    /// Set request body.
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set JSON body.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize>(mut self, json: &T) -> Self {
        if let Ok(bytes) = serde_json::to_vec(json) {
            self.body = Some(Bytes::from(bytes));
            self.headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        self
    }

    /// Force HTTP/1.1 or HTTP/2 for this request.
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Override the read idle timeout for this request.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Connect to this address instead of resolving the host.
    pub fn resolved_addr(mut self, addr: IpAddr) -> Self {
        self.resolved_addr = Some(addr);
        self
    }

    /// Build the request without sending it.
    pub fn build(&self) -> Result<HttpRequest, NetError> {
        let url = Url::parse(&self.url).map_err(|_| NetError::InvalidUrl)?;
        let mut request = HttpRequest::new(self.method.clone(), url);
        request.headers = self.headers.clone();
        request.body = self.body.clone();
        request.protocol = self.protocol;
        request.idle_timeout = self.idle_timeout;
        request.resolved_addr = self.resolved_addr;
        request.validate()?;
        Ok(request)
    }

    /// A transaction to pass to [`RequestEngine::execute_transaction`], for
    /// callers that want to watch its load state.
    pub fn into_transaction(self) -> Result<HttpTransaction, NetError> {
        let limit = self.engine.inner.config.max_body_size;
        Ok(HttpTransaction::new(self.build()?).with_max_body_size(limit))
    }

    /// Send the request.
    pub async fn send(self) -> Result<HttpResponse, NetError> {
        let request = self.build()?;
        self.engine.execute(request).await
    }
}
