use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Timed out")]
    TimedOut,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Response body too big")]
    ResponseBodyTooBig,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Response headers multiple Content-Length")]
    ResponseHeadersMultipleContentLength,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,
    #[error("Invalid header")]
    InvalidHeader,
    #[error("HTTP body error")]
    HttpBodyError,

    // HTTP/2 Errors
    #[error("HTTP/2 server refused stream")]
    Http2ServerRefusedStream,
    #[error("HTTP/2 flow control error")]
    Http2FlowControlError,
    #[error("HTTP/2 frame size error")]
    Http2FrameSizeError,
    #[error("HTTP/2 compression error")]
    Http2CompressionError,
    #[error("HTTP/2 stream closed")]
    Http2StreamClosed,

    // Edge case errors (custom codes starting at -900)
    #[error("Cookie domain is a public suffix")]
    CookiePublicSuffix,
    #[error("HTTP/2 session is going away")]
    Http2GoingAway,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::TimedOut => -7,
            NetError::SocketNotConnected => -112,
            NetError::AddressInvalid => -108,
            NetError::ConnectionTimedOut => -118,

            NetError::InvalidUrl => -300,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidChunkedEncoding => -321,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ResponseBodyTooBig => -345,
            NetError::ResponseHeadersMultipleContentLength => -346,
            NetError::Http2ServerRefusedStream => -351,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::Http2FlowControlError => -361,
            NetError::Http2FrameSizeError => -362,
            NetError::Http2CompressionError => -363,
            NetError::InvalidHttpResponse => -370,
            NetError::Http2StreamClosed => -376,

            NetError::CookiePublicSuffix => -904,
            NetError::InvalidHeader => -905,
            NetError::HttpBodyError => -906,
            NetError::Http2GoingAway => -907,
            NetError::Unknown(code) => *code,
        }
    }

    /// Whether the error came from the transport rather than from the peer's
    /// protocol output. Transport failures allow a stale cache fallback.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionClosed
                | NetError::ConnectionReset
                | NetError::ConnectionRefused
                | NetError::ConnectionAborted
                | NetError::ConnectionFailed
                | NetError::SocketNotConnected
                | NetError::AddressInvalid
                | NetError::ConnectionTimedOut
                | NetError::TimedOut
                | NetError::EmptyResponse
        )
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -7 => NetError::TimedOut,
            -112 => NetError::SocketNotConnected,
            -108 => NetError::AddressInvalid,
            -118 => NetError::ConnectionTimedOut,

            -300 => NetError::InvalidUrl,
            -302 => NetError::UnknownUrlScheme,
            -321 => NetError::InvalidChunkedEncoding,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -345 => NetError::ResponseBodyTooBig,
            -346 => NetError::ResponseHeadersMultipleContentLength,
            -351 => NetError::Http2ServerRefusedStream,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -361 => NetError::Http2FlowControlError,
            -362 => NetError::Http2FrameSizeError,
            -363 => NetError::Http2CompressionError,
            -370 => NetError::InvalidHttpResponse,
            -376 => NetError::Http2StreamClosed,

            -904 => NetError::CookiePublicSuffix,
            -905 => NetError::InvalidHeader,
            -906 => NetError::HttpBodyError,
            -907 => NetError::Http2GoingAway,
            _ => NetError::Unknown(code),
        }
    }
}
