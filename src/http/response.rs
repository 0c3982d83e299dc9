//! HTTP Response with body access.

use crate::base::neterror::NetError;
use crate::http::httpcache::CacheEntry;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

/// A complete response, read from the network or served from the cache.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    url: Url,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    from_cache: bool,
}

impl HttpResponse {
    pub fn new(url: Url, status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            version,
            headers,
            body,
            from_cache: false,
        }
    }

    /// Build a response out of a cached entry.
    pub fn from_cache_entry(url: Url, entry: CacheEntry) -> Self {
        Self {
            url,
            status: entry.status,
            version: Version::HTTP_11,
            headers: entry.headers,
            body: entry.body,
            from_cache: true,
        }
    }

    /// The URL this response answers.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the body came out of the HTTP cache (fresh, revalidated, or a
    /// stale fallback).
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response, returning the body bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Decode the body as UTF-8 text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|_| NetError::HttpBodyError)
    }

    /// Decode the body as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            tracing::debug!(error = %e, "response body is not valid JSON");
            NetError::HttpBodyError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &'static [u8]) -> HttpResponse {
        HttpResponse::new(
            Url::parse("http://example.com/").unwrap(),
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::from_static(body),
        )
    }

    #[test]
    fn test_text() {
        assert_eq!(response(b"hi").text().unwrap(), "hi");
        assert_eq!(response(&[0xff, 0xfe]).text().unwrap_err(), NetError::HttpBodyError);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Msg {
            ok: bool,
        }
        assert_eq!(response(br#"{"ok":true}"#).json::<Msg>().unwrap(), Msg { ok: true });
        assert!(response(b"nope").json::<Msg>().is_err());
    }
}
