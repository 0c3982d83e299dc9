//! # wirenet
//!
//! A client-side HTTP protocol engine modeled on Chromium's network stack.
//!
//! `wirenet` speaks HTTP/1.1 and HTTP/2 over any async byte stream, keeps
//! idle keep-alive connections for reuse, caches responses with Vary-aware
//! keys and conditional revalidation, and manages cookies with public
//! suffix checks.
//!
//! ## Features
//!
//! - **HTTP/1.1**: Content-Length, chunked and read-until-close bodies
//! - **HTTP/2**: HPACK, stream states, flow control, priorities, server push
//! - **Connection Pooling**: idle expiry, capacity overflow closes the newcomer
//! - **HTTP Cache**: max-age/Expires freshness, ETag/Last-Modified revalidation
//! - **Cookie Management**: RFC 6265 matching with PSL validation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wirenet::RequestEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wirenet::NetError> {
//!     let engine = RequestEngine::new();
//!     let response = engine.get("http://example.com/").send().await?;
//!     println!("Status: {}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types and error definitions
//! - [`socket`] - Transport traits and connection pooling
//! - [`spdy`] - HTTP/2 framing, HPACK and sessions
//! - [`http`] - HTTP/1.1 wire format, cache and transactions
//! - [`cookies`] - Cookie storage and public suffix checks
//! - [`engine`] - The request engine and its builders
//!
//! ## Known gaps
//!
//! Huffman-coded HPACK strings are not decoded; a peer that sends them gets
//! a compression error. DNS and TLS are left to the [`Connector`].

pub mod base;
pub mod cookies;
pub mod engine;
pub mod http;
pub mod socket;
pub mod spdy;

pub use base::loadstate::LoadState;
pub use base::neterror::NetError;
pub use cookies::CookieJar;
pub use engine::{EngineBuilder, EngineConfig, RequestBuilder, RequestEngine};
pub use crate::http::{CacheMode, HttpCache, HttpRequest, HttpResponse, HttpTransaction};
pub use socket::{ConnectionPool, Connector, ProtocolVersion, StreamSocket, TcpConnector};
pub use spdy::{H2Settings, Http2Connection};
