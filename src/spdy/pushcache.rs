//! Server-pushed responses, indexed by the promised request's `:path`.
//!
//! Entries can be announced ahead of time from `Link: rel=preload` response
//! headers. Such an entry stays pending until a pushed stream for the same
//! path completes, and pending entries are never served.

use crate::spdy::hpack::HeaderField;
use bytes::Bytes;
use std::collections::HashMap;

/// A pushed response body and its headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushedResponse {
    pub headers: Vec<HeaderField>,
    pub body: Bytes,
    pub complete: bool,
}

#[derive(Debug, Default)]
pub struct PushCache {
    entries: HashMap<String, PushedResponse>,
}

impl PushCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every `rel=preload` target from a `Link` header value as a
    /// pending entry. Returns the paths that were newly registered.
    pub fn seed_from_link(&mut self, link: &str) -> Vec<String> {
        let mut seeded = Vec::new();
        for path in preload_targets(link) {
            if self.entries.contains_key(&path) {
                continue;
            }
            tracing::trace!(path = %path, "expecting pushed resource");
            self.entries.insert(path.clone(), PushedResponse::default());
            seeded.push(path);
        }
        seeded
    }

    /// Store a fully received pushed response, replacing any pending entry.
    pub fn insert(&mut self, path: impl Into<String>, headers: Vec<HeaderField>, body: Bytes) {
        let path = path.into();
        tracing::debug!(path = %path, bytes = body.len(), "cached pushed response");
        self.entries.insert(
            path,
            PushedResponse {
                headers,
                body,
                complete: true,
            },
        );
    }

    /// A completed pushed response for `path`.
    pub fn get(&self, path: &str) -> Option<&PushedResponse> {
        self.entries.get(path).filter(|e| e.complete)
    }

    /// Remove and return a completed pushed response.
    pub fn take(&mut self, path: &str) -> Option<PushedResponse> {
        if self.get(path).is_none() {
            return None;
        }
        self.entries.remove(path)
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.entries.get(path).is_some_and(|e| !e.complete)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Paths named by `rel=preload` links, e.g.
/// `</app.css>; rel=preload; as=style, <https://h/app.js>; rel="preload"`.
pub fn preload_targets(link: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for link_value in link.split(',') {
        let mut parts = link_value.split(';').map(str::trim);
        let Some(target) = parts
            .next()
            .and_then(|t| t.strip_prefix('<'))
            .and_then(|t| t.strip_suffix('>'))
        else {
            continue;
        };

        let is_preload = parts.any(|param| {
            let Some((key, value)) = param.split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_ascii_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("preload"))
        });
        if !is_preload {
            continue;
        }

        if target.starts_with('/') {
            targets.push(target.to_string());
        } else if let Ok(url) = url::Url::parse(target) {
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            targets.push(path);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preload_targets() {
        let link = r#"</app.css>; rel=preload; as=style, </next>; rel=prefetch, <https://cdn.example.com/app.js?v=2>; rel="preload""#;
        assert_eq!(preload_targets(link), vec!["/app.css", "/app.js?v=2"]);
    }

    #[test]
    fn test_seeded_entries_are_pending() {
        let mut cache = PushCache::new();
        assert_eq!(cache.seed_from_link("</a.css>; rel=preload"), vec!["/a.css"]);
        assert!(cache.is_pending("/a.css"));
        assert!(cache.get("/a.css").is_none());
        assert!(cache.take("/a.css").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_completed_push_replaces_pending() {
        let mut cache = PushCache::new();
        cache.seed_from_link("</a.css>; rel=preload");
        cache.insert("/a.css", vec![HeaderField::new(":status", "200")], Bytes::from_static(b"body{}"));

        assert!(!cache.is_pending("/a.css"));
        assert_eq!(&cache.get("/a.css").unwrap().body[..], b"body{}");

        // Seeding again does not clobber a completed entry.
        assert!(cache.seed_from_link("</a.css>; rel=preload").is_empty());
        let taken = cache.take("/a.css").unwrap();
        assert!(taken.complete);
        assert!(cache.is_empty());
    }
}
