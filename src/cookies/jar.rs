use crate::cookies::canonicalcookie::{default_path, CanonicalCookie, SameSite};
use crate::cookies::psl::cookie_scope;
use cookie::{Cookie, Expiration};
use dashmap::DashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use url::Url;

/// Maximum cookies per domain (Chromium default).
pub const MAX_COOKIES_PER_DOMAIN: usize = 50;

/// Maximum total cookies.
pub const MAX_COOKIES_TOTAL: usize = 3000;

/// Longest lifetime a cookie can ask for (RFC 6265bis caps it at 400 days).
const MAX_COOKIE_LIFETIME: time::Duration = time::Duration::days(400);

/// In-memory cookie store.
/// Modeled after Chromium's `net::CookieMonster`.
pub struct CookieJar {
    // Domain -> cookies set on that domain.
    store: DashMap<String, Vec<CanonicalCookie>>,
    max_per_domain: usize,
    max_total: usize,
    // Creation times are kept strictly increasing so "oldest" is never a tie.
    last_creation: Mutex<OffsetDateTime>,
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("cookies", &self.len())
            .field("max_per_domain", &self.max_per_domain)
            .field("max_total", &self.max_total)
            .finish()
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::with_limits(MAX_COOKIES_PER_DOMAIN, MAX_COOKIES_TOTAL)
    }

    pub fn with_limits(max_per_domain: usize, max_total: usize) -> Self {
        Self {
            store: DashMap::new(),
            max_per_domain: max_per_domain.max(1),
            max_total: max_total.max(1),
            last_creation: Mutex::new(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Store a cookie from a `Set-Cookie` header received for `url`.
    /// Returns whether a cookie was stored; deletions and rejections
    /// return false.
    pub fn set_cookie(&self, header: &str, url: &Url) -> bool {
        self.parse_and_store(header, url, false)
    }

    /// Store a cookie written by page script (`document.cookie = ...`).
    /// Such writes can never create or replace an httpOnly cookie.
    pub fn set_from_page(&self, cookie_line: &str, url: &Url) -> bool {
        self.parse_and_store(cookie_line, url, true)
    }

    fn parse_and_store(&self, line: &str, url: &Url, from_page: bool) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let parsed = match Cookie::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, host, "rejecting unparseable cookie");
                return false;
            }
        };

        let scope = match cookie_scope(host, parsed.domain()) {
            Ok(scope) => scope,
            Err(_) => return false,
        };
        let path = match parsed.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_path(url.path()),
        };

        let now = self.creation_time();
        let expiration_time = match (parsed.max_age(), parsed.expires()) {
            (Some(max_age), _) => {
                if max_age <= time::Duration::ZERO {
                    self.expire(parsed.name(), scope.domain(), &path, from_page);
                    return false;
                }
                Some(now + max_age.min(MAX_COOKIE_LIFETIME))
            }
            (None, Some(Expiration::DateTime(at))) => {
                if at <= now {
                    self.expire(parsed.name(), scope.domain(), &path, from_page);
                    return false;
                }
                Some(at.min(now + MAX_COOKIE_LIFETIME))
            }
            (None, _) => None,
        };

        let cookie = CanonicalCookie {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain: scope.domain().to_string(),
            path,
            creation_time: now,
            expiration_time,
            secure: parsed.secure().unwrap_or(false),
            http_only: !from_page && parsed.http_only().unwrap_or(false),
            host_only: scope.is_host_only(),
            same_site: SameSite::from(parsed.same_site()),
        };

        if !cookie.has_valid_prefix(url.scheme() == "https") {
            tracing::debug!(name = %cookie.name, host, "cookie prefix requirements not met");
            return false;
        }

        self.insert(cookie, from_page)
    }

    /// Insert a cookie, replacing any with the same (name, domain, path).
    /// The replacement keeps the original creation time.
    pub fn set_canonical_cookie(&self, cookie: CanonicalCookie) -> bool {
        self.insert(cookie, false)
    }

    fn insert(&self, mut cookie: CanonicalCookie, from_page: bool) -> bool {
        {
            let mut entry = self.store.entry(cookie.domain.clone()).or_default();

            if let Some(idx) = entry.iter().position(|c| c.is_equivalent(&cookie)) {
                if from_page && entry[idx].http_only {
                    tracing::debug!(name = %cookie.name, domain = %cookie.domain, "page cannot overwrite httpOnly cookie");
                    return false;
                }
                cookie.creation_time = entry.remove(idx).creation_time;
            }

            // Per-domain limit: evict oldest first.
            while entry.len() >= self.max_per_domain {
                let Some(oldest) = oldest_index(&entry) else {
                    break;
                };
                let evicted = entry.remove(oldest);
                tracing::debug!(name = %evicted.name, domain = %evicted.domain, "evicted cookie over per-domain limit");
            }

            tracing::trace!(name = %cookie.name, domain = %cookie.domain, path = %cookie.path, "cookie stored");
            entry.push(cookie);
        }

        self.enforce_global_limit();
        true
    }

    /// Evict globally-oldest cookies until the total is back under the limit.
    fn enforce_global_limit(&self) {
        while self.len() > self.max_total {
            let mut oldest: Option<(String, OffsetDateTime)> = None;
            for entry in self.store.iter() {
                for cookie in entry.value() {
                    if oldest.as_ref().map_or(true, |(_, t)| cookie.creation_time < *t) {
                        oldest = Some((entry.key().clone(), cookie.creation_time));
                    }
                }
            }

            let Some((domain, created)) = oldest else {
                break;
            };
            if let Some(mut entry) = self.store.get_mut(&domain) {
                entry.retain(|c| c.creation_time != created);
            }
            tracing::debug!(domain = %domain, "evicted cookie over global limit");
        }
        self.store.retain(|_, cookies| !cookies.is_empty());
    }

    /// Deletion requested through an already-expired cookie. Page script
    /// cannot remove an httpOnly cookie this way.
    fn expire(&self, name: &str, domain: &str, path: &str, from_page: bool) {
        if from_page {
            let protected = self.store.get(domain).is_some_and(|entry| {
                entry
                    .iter()
                    .any(|c| c.name == name && c.path == path && c.http_only)
            });
            if protected {
                tracing::debug!(name, domain, "page cannot delete httpOnly cookie");
                return;
            }
        }
        self.delete(name, domain, path);
    }

    /// Remove the cookie with this identity. Returns whether one existed.
    pub fn delete(&self, name: &str, domain: &str, path: &str) -> bool {
        let Some(mut entry) = self.store.get_mut(domain) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|c| !(c.name == name && c.path == path));
        before != entry.len()
    }

    /// Cookies sent with a request, longest path first, then oldest first.
    pub fn cookies_for(
        &self,
        host: &str,
        path: &str,
        secure: bool,
        include_http_only: bool,
    ) -> Vec<CanonicalCookie> {
        let host = host.to_ascii_lowercase();
        let now = OffsetDateTime::now_utc();
        let mut result = Vec::new();

        for domain in candidate_domains(&host) {
            if let Some(entry) = self.store.get(domain) {
                result.extend(
                    entry
                        .iter()
                        .filter(|c| include_http_only || !c.http_only)
                        .filter(|c| c.is_visible_to(&host, path, secure, now))
                        .cloned(),
                );
            }
        }

        result.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.creation_time.cmp(&b.creation_time))
        });
        result
    }

    /// The `Cookie` request header value for `host` + `path`; empty when
    /// nothing matches.
    pub fn get_cookie_header(&self, host: &str, path: &str, secure: bool) -> String {
        join_pairs(&self.cookies_for(host, path, secure, true))
    }

    /// What page script sees in `document.cookie`: the request cookies
    /// minus httpOnly ones.
    pub fn get_document_cookies(&self, host: &str, path: &str, secure: bool) -> String {
        join_pairs(&self.cookies_for(host, path, secure, false))
    }

    /// `Cookie` header value for a URL.
    pub fn cookie_header_for_url(&self, url: &Url) -> String {
        match url.host_str() {
            Some(host) => self.get_cookie_header(host, url.path(), url.scheme() == "https"),
            None => String::new(),
        }
    }

    /// Drop every expired cookie. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut removed = 0;
        for mut entry in self.store.iter_mut() {
            let before = entry.len();
            entry.retain(|c| !c.is_expired(now));
            removed += before - entry.len();
        }
        self.store.retain(|_, cookies| !cookies.is_empty());
        if removed > 0 {
            tracing::debug!(removed, "purged expired cookies");
        }
        removed
    }

    /// Snapshot of every stored cookie.
    pub fn all_cookies(&self) -> Vec<CanonicalCookie> {
        self.store.iter().flat_map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.store.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    fn creation_time(&self) -> OffsetDateTime {
        let mut last = self
            .last_creation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = OffsetDateTime::now_utc().max(*last + time::Duration::nanoseconds(1));
        *last = now;
        now
    }
}

fn oldest_index(cookies: &[CanonicalCookie]) -> Option<usize> {
    cookies
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| c.creation_time)
        .map(|(i, _)| i)
}

/// The host itself and every parent domain with at least two labels:
/// "a.b.example.com" gives "a.b.example.com", "b.example.com", "example.com".
fn candidate_domains(host: &str) -> Vec<&str> {
    let mut domains = vec![host];
    let mut rest = host;
    while let Some(idx) = rest.find('.') {
        rest = &rest[idx + 1..];
        if !rest.contains('.') {
            break;
        }
        domains.push(rest);
    }
    domains
}

fn join_pairs(cookies: &[CanonicalCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}
