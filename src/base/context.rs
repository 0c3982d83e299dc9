//! Ergonomic error context helpers.
//!
//! Provides an extension trait for converting IO errors coming out of the
//! transport into `NetError` variants.

use crate::base::neterror::NetError;
use std::io::{self, ErrorKind};

/// Map an IO error kind onto the closest network error.
pub fn map_io_error(err: &io::Error) -> NetError {
    match err.kind() {
        ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        ErrorKind::ConnectionReset => NetError::ConnectionReset,
        ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        ErrorKind::NotConnected => NetError::SocketNotConnected,
        ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
        ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        _ => NetError::ConnectionFailed,
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Convert an IO error raised while talking to `host:port`.
    ///
    /// # Example
    /// ```ignore
    /// use wirenet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Convert an IO error raised on an established connection.
    fn net_context(self) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, port, error = %e, "connect failed");
            match map_io_error(&e) {
                NetError::ConnectionClosed => NetError::ConnectionFailed,
                other => other,
            }
        })
    }

    fn net_context(self) -> Result<T, NetError> {
        self.map_err(|e| map_io_error(&e))
    }
}
