//! HTTP/1.1 wire handling, the response cache and per-request transactions.

pub mod http1;
pub mod httpcache;
pub mod response;
pub mod transaction;

// Re-exports for convenience
pub use httpcache::{CacheEntry, CacheLookup, CacheMode, HttpCache};
pub use response::HttpResponse;
pub use transaction::{HttpRequest, HttpTransaction};
