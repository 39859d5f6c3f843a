use std::net::SocketAddr;

use courier_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolution {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {host}:{port} after {attempts} attempts: {source}")]
    ConnectFailure {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),
    #[error("node already started")]
    AlreadyStarted,
    #[error("node not started")]
    NotStarted,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
