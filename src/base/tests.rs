use crate::base::neterror::NetError;

#[test]
fn test_net_error_roundtrip() {
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionRefused));

    let custom = NetError::Http2GoingAway;
    let custom_converted = NetError::from(custom.as_i32());
    assert!(matches!(custom_converted, NetError::Http2GoingAway));
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
}

#[test]
fn test_transport_errors_classified() {
    assert!(NetError::ConnectionReset.is_transport_error());
    assert!(NetError::ConnectionTimedOut.is_transport_error());
    assert!(!NetError::Http2CompressionError.is_transport_error());
    assert!(!NetError::InvalidChunkedEncoding.is_transport_error());
}

#[test]
fn test_body_limit_code() {
    assert_eq!(NetError::ResponseBodyTooBig.as_i32(), -345);
    assert_eq!(NetError::from(-345), NetError::ResponseBodyTooBig);
    assert!(!NetError::ResponseBodyTooBig.is_transport_error());
}

#[test]
fn test_codes_the_engine_never_returns_are_unknown() {
    // Name resolution, generic HTTP/2 protocol error, cache miss.
    for code in [-105, -337, -400] {
        assert_eq!(NetError::from(code), NetError::Unknown(code));
    }
}

#[test]
fn test_every_variant_roundtrips() {
    let all = [
        NetError::ConnectionClosed,
        NetError::ConnectionReset,
        NetError::ConnectionRefused,
        NetError::ConnectionAborted,
        NetError::ConnectionFailed,
        NetError::SocketNotConnected,
        NetError::AddressInvalid,
        NetError::ConnectionTimedOut,
        NetError::TimedOut,
        NetError::InvalidUrl,
        NetError::UnknownUrlScheme,
        NetError::InvalidChunkedEncoding,
        NetError::EmptyResponse,
        NetError::ResponseHeadersTooBig,
        NetError::ResponseBodyTooBig,
        NetError::ContentLengthMismatch,
        NetError::IncompleteChunkedEncoding,
        NetError::ResponseHeadersMultipleContentLength,
        NetError::InvalidHttpResponse,
        NetError::InvalidHeader,
        NetError::HttpBodyError,
        NetError::Http2ServerRefusedStream,
        NetError::Http2FlowControlError,
        NetError::Http2FrameSizeError,
        NetError::Http2CompressionError,
        NetError::Http2StreamClosed,
        NetError::CookiePublicSuffix,
        NetError::Http2GoingAway,
    ];
    for err in all {
        assert_eq!(NetError::from(err.as_i32()), err);
    }
}
