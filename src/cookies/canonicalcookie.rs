use crate::cookies::psl::domain_match;
use time::OffsetDateTime;

/// A single stored cookie.
/// Modeled after Chromium's `net::CanonicalCookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCookie {
    pub name: String,
    pub value: String,
    /// Canonical domain, lowercase, no leading dot.
    pub domain: String,
    pub path: String,
    pub creation_time: OffsetDateTime,
    /// `None` for a session cookie.
    pub expiration_time: Option<OffsetDateTime>,
    pub secure: bool,
    pub http_only: bool,
    pub host_only: bool,
    pub same_site: SameSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Unspecified,
    NoRestriction,
    Lax,
    Strict,
}

impl From<Option<cookie::SameSite>> for SameSite {
    fn from(value: Option<cookie::SameSite>) -> Self {
        match value {
            Some(cookie::SameSite::Lax) => SameSite::Lax,
            Some(cookie::SameSite::Strict) => SameSite::Strict,
            Some(cookie::SameSite::None) => SameSite::NoRestriction,
            None => SameSite::Unspecified,
        }
    }
}

impl CanonicalCookie {
    /// A host-only session cookie with path `/`.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        creation_time: OffsetDateTime,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into().trim_start_matches('.').to_ascii_lowercase(),
            path: "/".to_string(),
            creation_time,
            expiration_time: None,
            secure: false,
            http_only: false,
            host_only: true,
            same_site: SameSite::Unspecified,
        }
    }

    pub fn is_session(&self) -> bool {
        self.expiration_time.is_none()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expiration_time.is_some_and(|expiry| expiry <= now)
    }

    /// Same (name, domain, path) identity; a new cookie with the same
    /// identity replaces the old one.
    pub fn is_equivalent(&self, other: &CanonicalCookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    /// Host-only cookies need an exact host, domain cookies a domain-match.
    pub fn matches_host(&self, host: &str) -> bool {
        if self.host_only {
            self.domain.eq_ignore_ascii_case(host)
        } else {
            domain_match(host, &self.domain)
        }
    }

    /// RFC 6265 §5.1.4 path-match.
    pub fn matches_path(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if !request_path.starts_with(&self.path) {
            return false;
        }
        self.path.ends_with('/') || request_path.as_bytes().get(self.path.len()) == Some(&b'/')
    }

    /// Whether this cookie goes out with a request to `host` + `path`.
    pub fn is_visible_to(&self, host: &str, path: &str, secure: bool, now: OffsetDateTime) -> bool {
        (!self.secure || secure)
            && !self.is_expired(now)
            && self.matches_host(host)
            && self.matches_path(path)
    }

    /// `__Secure-` cookies need the Secure attribute from a secure origin.
    /// `__Host-` cookies additionally need `Path=/` and no `Domain`.
    pub fn has_valid_prefix(&self, secure_origin: bool) -> bool {
        if self.name.starts_with("__Secure-") && !(self.secure && secure_origin) {
            return false;
        }
        if self.name.starts_with("__Host-") {
            return self.secure && secure_origin && self.path == "/" && self.host_only;
        }
        true
    }
}

/// RFC 6265 §5.1.4 default-path: the request path up to, not including,
/// its last `/`.
pub fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(domain: &str, path: &str, host_only: bool) -> CanonicalCookie {
        let mut c = CanonicalCookie::new("id", "1", domain, OffsetDateTime::now_utc());
        c.path = path.to_string();
        c.host_only = host_only;
        c
    }

    #[test]
    fn test_host_matching() {
        let host_only = cookie("example.com", "/", true);
        assert!(host_only.matches_host("example.com"));
        assert!(!host_only.matches_host("sub.example.com"));

        let domain = cookie(".Example.com", "/", false);
        assert_eq!(domain.domain, "example.com");
        assert!(domain.matches_host("sub.example.com"));
        assert!(!domain.matches_host("other.com"));
    }

    #[test]
    fn test_path_matching() {
        let c = cookie("example.com", "/docs", true);
        assert!(c.matches_path("/docs"));
        assert!(c.matches_path("/docs/a"));
        assert!(!c.matches_path("/docsx"));
        assert!(!c.matches_path("/"));
        assert!(cookie("example.com", "/", true).matches_path("/anything"));
    }

    #[test]
    fn test_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut c = cookie("example.com", "/", true);
        assert!(c.is_session());
        assert!(!c.is_expired(now));
        c.expiration_time = Some(now - time::Duration::seconds(1));
        assert!(c.is_expired(now));
        assert!(!c.is_visible_to("example.com", "/", true, now));
    }

    #[test]
    fn test_secure_visibility() {
        let now = OffsetDateTime::now_utc();
        let mut c = cookie("example.com", "/", true);
        c.secure = true;
        assert!(!c.is_visible_to("example.com", "/", false, now));
        assert!(c.is_visible_to("example.com", "/", true, now));
    }

    #[test]
    fn test_prefixes() {
        let mut c = cookie("example.com", "/", true);
        c.name = "__Secure-id".into();
        assert!(!c.has_valid_prefix(true));
        c.secure = true;
        assert!(c.has_valid_prefix(true));
        assert!(!c.has_valid_prefix(false));

        c.name = "__Host-id".into();
        assert!(c.has_valid_prefix(true));
        c.host_only = false;
        assert!(!c.has_valid_prefix(true));
    }

    #[test]
    fn test_default_path() {
        assert_eq!(default_path("/"), "/");
        assert_eq!(default_path("/a"), "/");
        assert_eq!(default_path("/a/b/c"), "/a/b");
        assert_eq!(default_path("relative"), "/");
    }
}
