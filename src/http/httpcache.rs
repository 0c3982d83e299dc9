//! HTTP Cache implementation.
//!
//! Chromium mapping: net/http/http_cache.h (simplified in-memory version)
//!
//! Provides RFC 7234 style caching with:
//! - Cache-Control header parsing (max-age, no-store, no-cache,
//!   stale-while-revalidate, must-revalidate)
//! - Vary-aware keys: one URL may hold several variants
//! - ETag/If-None-Match and Last-Modified/If-Modified-Since revalidation
//! - Entry and byte bounds with oldest-inserted eviction

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::time::Instant;
use url::Url;

/// Default entry bound.
pub const DEFAULT_MAX_ENTRIES: usize = 256;
/// Default bound on the summed body size of all entries.
pub const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;
/// Freshness lifetime when a response carries neither max-age nor Expires.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Delta-seconds beyond this are treated as this (RFC 9111 §1.2.2).
pub const MAX_DELTA_SECONDS: u64 = 1 << 31;

/// Cache mode for controlling behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal caching behavior (RFC 7234)
    #[default]
    Normal,
    /// Bypass cache for reads and writes
    Disabled,
    /// Only read from cache, don't write
    ReadOnly,
    /// Force refresh (ignore cached responses, still store new ones)
    ForceRefresh,
}

/// Parsed Cache-Control directives.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
}

impl CacheControl {
    /// Parse every Cache-Control header in `headers`.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = CacheControl::default();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                let directive = directive.trim().to_ascii_lowercase();
                let (name, arg) = match directive.split_once('=') {
                    Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                    None => (directive.as_str(), None),
                };
                match name {
                    "no-store" => cc.no_store = true,
                    "no-cache" => cc.no_cache = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    "max-age" => cc.max_age = arg.and_then(delta_seconds),
                    "stale-while-revalidate" => cc.stale_while_revalidate = arg.and_then(delta_seconds),
                    _ => {}
                }
            }
        }
        cc
    }
}

/// Non-negative integer seconds, saturating at [`MAX_DELTA_SECONDS`].
fn delta_seconds(arg: &str) -> Option<u64> {
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(arg.parse::<u64>().map_or(MAX_DELTA_SECONDS, |n| n.min(MAX_DELTA_SECONDS)))
}

/// Cached response entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// URL plus captured Vary values.
    pub key: String,
    /// URL without fragment.
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// When the entry stops being fresh.
    pub expires: Instant,
    pub stored_at: Instant,
    /// Lowercased request header names from the response's Vary header.
    pub vary: Vec<String>,
    /// Request header values that produced this entry, parallel to `vary`.
    pub vary_values: Vec<Option<String>>,
    seq: u64,
}

impl CacheEntry {
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires
    }

    /// Whether the stale entry may stand in for a failed network fetch.
    ///
    /// `must-revalidate` forbids it. A `stale-while-revalidate` window, when
    /// present, bounds how long past expiry it stays usable.
    pub fn can_serve_stale(&self, now: Instant) -> bool {
        let cc = self.cache_control();
        if cc.must_revalidate {
            return false;
        }
        match cc.stale_while_revalidate {
            Some(secs) => now < self.expires + Duration::from_secs(secs),
            None => true,
        }
    }

    fn matches_request(&self, request_headers: &HeaderMap) -> bool {
        self.vary
            .iter()
            .zip(&self.vary_values)
            .all(|(name, stored)| header_value(request_headers, name) == *stored)
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: CacheEntry,
    pub needs_revalidation: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Variants per URL.
    entries: HashMap<String, Vec<CacheEntry>>,
    /// Insertion order: sequence number to (url, key).
    order: BTreeMap<u64, (String, String)>,
    next_seq: u64,
    size_bytes: usize,
}

impl CacheState {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn remove(&mut self, url: &str, key: &str) -> Option<CacheEntry> {
        let variants = self.entries.get_mut(url)?;
        let pos = variants.iter().position(|e| e.key == key)?;
        let entry = variants.swap_remove(pos);
        if variants.is_empty() {
            self.entries.remove(url);
        }
        self.order.remove(&entry.seq);
        self.size_bytes -= entry.body.len();
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((url, key)) = self.order.values().next().cloned() else {
            return false;
        };
        tracing::trace!(key = %key, "evicting oldest cache entry");
        self.remove(&url, &key).is_some()
    }
}

/// In-memory HTTP cache.
///
/// Shared behind an `Arc`; a single mutex covers each operation so a lookup
/// and the store that follows it never interleave with another writer.
#[derive(Debug)]
pub struct HttpCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    max_size_bytes: usize,
    default_ttl: Duration,
    mode: CacheMode,
}

impl Default for HttpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCache {
    /// Create a new cache with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }

    /// Create a cache with custom limits.
    pub fn with_limits(max_entries: usize, max_size_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries,
            max_size_bytes,
            default_ttl: DEFAULT_TTL,
            mode: CacheMode::Normal,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cache mode.
    pub fn set_mode(&mut self, mode: CacheMode) {
        self.mode = mode;
    }

    /// Get the current cache mode.
    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a 200 response.
    ///
    /// Refused (returning `false`) for `no-store`, `Vary: *`, bodies larger
    /// than the byte bound, and in `Disabled`/`ReadOnly` mode. An existing
    /// entry with the same key is replaced.
    pub fn put(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: &HeaderMap,
        body: Bytes,
    ) -> bool {
        if matches!(self.mode, CacheMode::Disabled | CacheMode::ReadOnly) {
            return false;
        }
        if status != StatusCode::OK {
            return false;
        }

        let cc = CacheControl::parse(response_headers);
        if cc.no_store {
            tracing::trace!(url = %url, "not caching no-store response");
            return false;
        }
        let Some(vary) = vary_names(response_headers) else {
            tracing::trace!(url = %url, "not caching Vary: * response");
            return false;
        };
        if body.len() > self.max_size_bytes {
            return false;
        }

        let url = cache_url(url);
        let vary_values: Vec<_> = vary.iter().map(|n| header_value(request_headers, n)).collect();
        let key = vary_key(&url, &vary, &vary_values);
        let now = Instant::now();
        let expires = now + freshness_lifetime(response_headers, &cc, self.default_ttl);

        let mut state = self.lock();
        state.remove(&url, &key);
        while state.len() >= self.max_entries || state.size_bytes + body.len() > self.max_size_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = CacheEntry {
            key: key.clone(),
            url: url.clone(),
            status,
            headers: response_headers.clone(),
            body,
            etag: header_value(response_headers, "etag"),
            last_modified: header_value(response_headers, "last-modified"),
            expires,
            stored_at: now,
            vary,
            vary_values,
            seq,
        };
        state.size_bytes += entry.body.len();
        state.order.insert(seq, (url.clone(), key.clone()));
        state.entries.entry(url).or_default().push(entry);

        tracing::debug!(key = %key, "stored response in cache");
        true
    }

    /// Find the variant of `url` matching `request_headers`.
    ///
    /// A hit is fresh unless `no-cache` is present or `expires` has passed, in
    /// which case it is returned flagged for revalidation.
    pub fn get(&self, url: &Url, request_headers: &HeaderMap) -> Option<CacheLookup> {
        if matches!(self.mode, CacheMode::Disabled | CacheMode::ForceRefresh) {
            return None;
        }
        let entry = self.find(url, request_headers)?;
        let needs_revalidation = entry.cache_control().no_cache || !entry.is_fresh(Instant::now());
        tracing::trace!(key = %entry.key, needs_revalidation, "cache hit");
        Some(CacheLookup {
            entry,
            needs_revalidation,
        })
    }

    /// A matching entry that may be served in place of a failed fetch.
    pub fn get_stale(&self, url: &Url, request_headers: &HeaderMap) -> Option<CacheEntry> {
        if self.mode == CacheMode::Disabled {
            return None;
        }
        self.find(url, request_headers)
            .filter(|e| e.can_serve_stale(Instant::now()))
    }

    fn find(&self, url: &Url, request_headers: &HeaderMap) -> Option<CacheEntry> {
        let url = cache_url(url);
        let state = self.lock();
        state
            .entries
            .get(&url)?
            .iter()
            .find(|e| e.matches_request(request_headers))
            .cloned()
    }

    /// Add `If-None-Match` / `If-Modified-Since` for revalidating `entry`.
    pub fn add_conditional_headers(entry: &CacheEntry, headers: &mut HeaderMap) {
        if let Some(value) = entry.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(http::header::IF_NONE_MATCH, value);
        }
        if let Some(value) = entry
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(http::header::IF_MODIFIED_SINCE, value);
        }
    }

    /// Fold a 304 response into the stored entry and extend its lifetime.
    ///
    /// Returns the refreshed entry, or `None` if it is no longer cached.
    pub fn handle_not_modified(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        response_headers: &HeaderMap,
    ) -> Option<CacheEntry> {
        let url = cache_url(url);
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(&url)?
            .iter_mut()
            .find(|e| e.matches_request(request_headers))?;

        for name in response_headers.keys() {
            if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
                continue;
            }
            entry.headers.remove(name);
            for value in response_headers.get_all(name) {
                entry.headers.append(name.clone(), value.clone());
            }
        }
        entry.etag = header_value(&entry.headers, "etag");
        entry.last_modified = header_value(&entry.headers, "last-modified");

        let cc = CacheControl::parse(&entry.headers);
        entry.expires = Instant::now() + freshness_lifetime(&entry.headers, &cc, self.default_ttl);
        tracing::debug!(key = %entry.key, "revalidated cache entry");
        Some(entry.clone())
    }

    /// Drop every variant of `url`. Returns how many were removed.
    pub fn invalidate(&self, url: &Url) -> usize {
        let url = cache_url(url);
        let mut state = self.lock();
        let keys: Vec<String> = state
            .entries
            .get(&url)
            .map(|v| v.iter().map(|e| e.key.clone()).collect())
            .unwrap_or_default();
        for key in &keys {
            state.remove(&url, key);
        }
        if !keys.is_empty() {
            tracing::debug!(url = %url, removed = keys.len(), "invalidated cache entries");
        }
        keys.len()
    }

    /// Remove every entry past its `expires`. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<(String, String)> = state
            .entries
            .values()
            .flatten()
            .filter(|e| !e.is_fresh(now))
            .map(|e| (e.url.clone(), e.key.clone()))
            .collect();
        for (url, key) in &expired {
            state.remove(url, key);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "purged expired cache entries");
        }
        expired.len()
    }

    /// Clear all cached entries.
    pub fn clear(&self) {
        *self.lock() = CacheState::default();
    }

    /// Get the number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current cache size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }
}

/// URL used in cache keys: the fragment never matters.
fn cache_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// All values of `name`, joined as they would be on one line.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// Lowercased header names from Vary, or `None` for `Vary: *`.
fn vary_names(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for value in headers.get_all(http::header::VARY) {
        for name in value.to_str().unwrap_or_default().split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name == "*" {
                return None;
            }
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Some(names)
}

fn vary_key(url: &str, vary: &[String], values: &[Option<String>]) -> String {
    let mut key = url.to_string();
    for (name, value) in vary.iter().zip(values) {
        key.push('|');
        key.push_str(name);
        key.push('=');
        key.push_str(value.as_deref().unwrap_or(""));
    }
    key
}

/// max-age, else Expires (relative to Date when present), else `default_ttl`.
fn freshness_lifetime(headers: &HeaderMap, cc: &CacheControl, default_ttl: Duration) -> Duration {
    if let Some(max_age) = cc.max_age {
        return Duration::from_secs(max_age);
    }
    let Some(expires) = header_value(headers, "expires") else {
        return default_ttl;
    };
    // An unparseable Expires (commonly "0") means already expired.
    let Some(expires) = parse_http_date(&expires) else {
        return Duration::ZERO;
    };
    let base = header_value(headers, "date")
        .and_then(|d| parse_http_date(&d))
        .unwrap_or_else(OffsetDateTime::now_utc);
    let delta = expires - base;
    if delta.is_positive() {
        Duration::try_from(delta)
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_secs(MAX_DELTA_SECONDS))
    } else {
        Duration::ZERO
    }
}

/// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let format = time::format_description::parse(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT",
    )
    .ok()?;
    PrimitiveDateTime::parse(value.trim(), &format)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
