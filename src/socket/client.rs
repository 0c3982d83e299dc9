use crate::base::context::{map_io_error, IoResultExt};
use crate::base::neterror::NetError;
use bytes::BytesMut;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

/// Wire protocol spoken over a connection.
///
/// Chosen by the caller per request, or reported by the transport when TLS
/// negotiated it through ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    #[default]
    Http11,
    Http2,
}

impl ProtocolVersion {
    /// Map an ALPN protocol id onto a version.
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"h2" => Some(ProtocolVersion::Http2),
            b"http/1.1" => Some(ProtocolVersion::Http11),
            _ => None,
        }
    }

    pub fn as_http_version(self) -> http::Version {
        match self {
            ProtocolVersion::Http11 => http::Version::HTTP_11,
            ProtocolVersion::Http2 => http::Version::HTTP_2,
        }
    }
}

/// Represents a connected byte stream (plain TCP or TLS-wrapped).
/// Mimics net::StreamSocket.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug + 'static {
    /// Returns true if the socket is still connected.
    /// Note: This does a non-blocking check, not a full liveness check.
    fn is_connected(&self) -> bool;

    /// Protocol agreed during the TLS handshake, if any.
    fn negotiated_protocol(&self) -> Option<ProtocolVersion> {
        None
    }
}

impl StreamSocket for TcpStream {
    fn is_connected(&self) -> bool {
        // peer_addr() returns Err once the socket is disconnected
        self.peer_addr().is_ok()
    }
}

impl StreamSocket for tokio::io::DuplexStream {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Where a connection should go. DNS resolution happens outside the engine;
/// `addr` carries the caller-resolved IP when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub addr: Option<IpAddr>,
}

/// Opens new transport connections.
///
/// TLS is a separate collaborator: a secure connector wraps the plain stream
/// and reports the ALPN result through [`StreamSocket::negotiated_protocol`].
pub trait Connector: Send + Sync + 'static {
    type Socket: StreamSocket;

    fn connect(
        &self,
        target: &ConnectTarget,
    ) -> impl Future<Output = Result<Self::Socket, NetError>> + Send;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    type Socket = TcpStream;

    async fn connect(&self, target: &ConnectTarget) -> Result<TcpStream, NetError> {
        if target.secure {
            tracing::warn!(host = %target.host, "plain TCP connector cannot open a secure connection");
            return Err(NetError::UnknownUrlScheme);
        }

        let connect = async {
            match target.addr {
                Some(ip) => TcpStream::connect((ip, target.port)).await,
                None => TcpStream::connect((target.host.as_str(), target.port)).await,
            }
        };

        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| NetError::ConnectionTimedOut)?
            .connection_context(&target.host, target.port)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(host = %target.host, error = %e, "failed to set TCP_NODELAY");
        }

        tracing::debug!(host = %target.host, port = target.port, "connected");
        Ok(stream)
    }
}

/// Read whatever is available within one idle window.
///
/// Each call waits at most `idle` for the next chunk. Callers loop on it, so
/// the window restarts whenever bytes arrive: the effective limit is `idle` of
/// silence, not `idle` in total. Returns `Ok(0)` on EOF and
/// `Err(NetError::TimedOut)` when the window passes without data.
pub async fn read_with_idle_timeout<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    idle: Duration,
) -> Result<usize, NetError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match tokio::time::timeout(idle, socket.read_buf(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(map_io_error(&e)),
        Err(_) => Err(NetError::TimedOut),
    }
}
