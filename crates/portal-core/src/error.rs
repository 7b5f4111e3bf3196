use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the portal gateway.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("permission denied binding {addr}: ports below 1024 need elevated privileges")]
    PermissionDenied { addr: SocketAddr },

    #[error("address {addr} already in use: is another server running on this port?")]
    AddrInUse { addr: SocketAddr },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("timeout")]
    Timeout,

    #[error("template error: {0}")]
    Template(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PortalError {
    /// Classify a bind failure so an operator can tell permissions from port conflicts.
    pub fn bind(addr: SocketAddr, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => PortalError::PermissionDenied { addr },
            std::io::ErrorKind::AddrInUse => PortalError::AddrInUse { addr },
            _ => PortalError::Transport(format!("bind {addr} failed: {err}")),
        }
    }
}

pub type PortalResult<T> = Result<T, PortalError>;
