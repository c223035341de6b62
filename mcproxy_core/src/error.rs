//! Typed error taxonomy for the proxy core.
//!
//! Boundary calls return one of these variants; the session engine and
//! controller decide case-by-case whether a variant means a silent
//! close, a user-visible disconnect, or a log-and-continue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("outbound not found: {0}")]
    OutboundNotFound(String),
    #[error("outbound already exists: {0}")]
    OutboundExists(String),
    #[error("outbound unhealthy: {0}")]
    OutboundUnhealthy(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("no healthy nodes for selector: {0}")]
    NoHealthyNodes(String),
    #[error("all failover candidates exhausted for selector: {0}")]
    AllFailoversFailed(String),
    #[error("all retries failed: {0}")]
    AllRetriesFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("access denied: {0}")]
    AclDenied(String),
    #[error("could not dial remote: {0}")]
    RemoteDialFailed(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("operation cancelled")]
    ContextCancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
