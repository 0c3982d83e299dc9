//! Cookie storage.
//!
//! | Chromium (C++) | wirenet (Rust) | Responsibility |
//! |----------------|----------------|----------------|
//! | `net::CookieMonster` | [`CookieJar`](jar::CookieJar) | Cookie jar with oldest-first eviction |
//! | `net::CanonicalCookie` | [`CanonicalCookie`](canonicalcookie::CanonicalCookie) | Single cookie representation |
//! | `net::registry_controlled_domains` | [`psl`] | Public suffix checks |
//!
//! ```rust
//! use wirenet::cookies::CookieJar;
//! use url::Url;
//!
//! let jar = CookieJar::new();
//! let origin = Url::parse("https://www.example.com/").unwrap();
//! jar.set_cookie("id=42; Domain=example.com; Secure", &origin);
//! assert_eq!(jar.get_cookie_header("api.example.com", "/", true), "id=42");
//! assert_eq!(jar.get_cookie_header("api.example.com", "/", false), "");
//! ```

pub mod canonicalcookie;
pub mod jar;
pub mod psl;

pub use canonicalcookie::{CanonicalCookie, SameSite};
pub use jar::CookieJar;
