//! Transport sockets and keep-alive connection pooling.

pub mod client;
pub mod pool;

pub use client::{ConnectTarget, Connector, ProtocolVersion, StreamSocket, TcpConnector};
pub use pool::{ConnectionPool, PoolKey};
