//! HTTP/2 framing, header compression and stream multiplexing.

pub mod frame;
pub mod h2connection;
pub mod h2settings;
pub mod hpack;
pub mod pushcache;
pub mod stream;

pub use h2connection::Http2Connection;
pub use h2settings::H2Settings;
pub use hpack::{HPackContext, HeaderField, HpackError};
pub use pushcache::{PushCache, PushedResponse};
pub use stream::{H2Stream, StreamPriority, StreamState};
