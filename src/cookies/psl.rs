//! Public Suffix List (PSL) checks and RFC 6265 domain matching.
//!
//! A `Domain` attribute naming a public suffix (`com`, `co.uk`, `github.io`)
//! would let one site plant cookies for every site under it, so such cookies
//! are refused. Uses Mozilla's list via the `psl` crate.

use crate::base::neterror::NetError;
use psl::{List, Psl};
use std::net::IpAddr;

/// Where a cookie may be sent, decided from the origin host and its
/// `Domain` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieScope {
    /// Only the exact origin host.
    HostOnly(String),
    /// The named domain and all of its subdomains.
    Domain(String),
}

impl CookieScope {
    pub fn domain(&self) -> &str {
        match self {
            CookieScope::HostOnly(d) | CookieScope::Domain(d) => d,
        }
    }

    pub fn is_host_only(&self) -> bool {
        matches!(self, CookieScope::HostOnly(_))
    }
}

/// Check if a domain is a public suffix (e.g., "com", "co.uk").
pub fn is_public_suffix(domain: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    match List.suffix(domain.as_bytes()) {
        Some(suffix) => suffix.is_known() && suffix.as_bytes() == domain.as_bytes(),
        None => false,
    }
}

/// Get the registrable domain (eTLD+1): "sub.example.com" gives
/// "example.com", a bare public suffix gives `None`.
pub fn registrable_domain(domain: &str) -> Option<String> {
    let domain = domain.to_ascii_lowercase();
    psl::domain(domain.as_bytes())
        .and_then(|d| std::str::from_utf8(d.as_bytes()).ok())
        .map(str::to_string)
}

/// RFC 6265 §5.1.3 domain-match: identical, or `host` ends with
/// `.domain` and is not an IP address.
pub fn domain_match(host: &str, domain: &str) -> bool {
    if host.eq_ignore_ascii_case(domain) {
        return true;
    }
    if host.parse::<IpAddr>().is_ok() || host.len() <= domain.len() {
        return false;
    }
    let split = host.len() - domain.len();
    host.as_bytes()[split - 1] == b'.'
        && host.is_char_boundary(split)
        && host[split..].eq_ignore_ascii_case(domain)
}

/// Decide a cookie's scope.
///
/// A `Domain` attribute is honored only when the origin host domain-matches
/// it. Otherwise the cookie stays host-only. A `Domain` naming a public
/// suffix other than the host itself is refused outright.
pub fn cookie_scope(host: &str, domain_attr: Option<&str>) -> Result<CookieScope, NetError> {
    let host = host.to_ascii_lowercase();
    let attr = domain_attr
        .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty());

    let Some(domain) = attr else {
        return Ok(CookieScope::HostOnly(host));
    };

    if is_public_suffix(&domain) {
        if domain == host {
            return Ok(CookieScope::HostOnly(host));
        }
        tracing::debug!(host = %host, domain = %domain, "cookie domain is a public suffix");
        return Err(NetError::CookiePublicSuffix);
    }

    if domain_match(&host, &domain) {
        Ok(CookieScope::Domain(domain))
    } else {
        tracing::debug!(host = %host, domain = %domain, "cookie domain does not match host, keeping host-only");
        Ok(CookieScope::HostOnly(host))
    }
}
