//! Unified error handling for CXLMemSim
//!
//! This module provides a centralized error type for the distributed
//! simulator core, ensuring consistent error handling across all components.

use thiserror::Error;

/// Main error type for CXLMemSim operations
#[derive(Debug, Error)]
pub enum CxlError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared memory specific errors (shm_open, mmap, ftruncate, msync)
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// Message fabric errors
    #[error("Fabric error: {0}")]
    Fabric(String),

    /// Outgoing message queue to a peer is full
    #[error("Message queue to node {0} is full")]
    QueueFull(u32),

    /// Malformed or unknown wire messages
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Address does not decode to any target
    #[error("Address 0x{0:x} is not mapped by any HDM range")]
    Address(u64),

    /// Coherency protocol failure
    #[error("Coherency error: {0}")]
    Coherency(String),

    /// Forwarded request timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Remote peer is marked offline
    #[error("Peer node {0} is offline")]
    PeerOffline(u32),

    /// Remote node reported a failure status for a forwarded op
    #[error("Remote node {node} failed: status {status}")]
    Remote { node: u32, status: u32 },

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Initialization errors
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Internal invariant violations (treat as fatal)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Catch-all for other error types
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using CxlError
pub type CxlResult<T> = Result<T, CxlError>;

impl From<toml::de::Error> for CxlError {
    fn from(err: toml::de::Error) -> Self {
        CxlError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<std::num::ParseIntError> for CxlError {
    fn from(err: std::num::ParseIntError) -> Self {
        CxlError::Config(format!("Integer parse error: {}", err))
    }
}

// Allow conversion from &str / String for convenient error creation
impl From<&str> for CxlError {
    fn from(msg: &str) -> Self {
        CxlError::Other(msg.to_string())
    }
}

impl From<String> for CxlError {
    fn from(msg: String) -> Self {
        CxlError::Other(msg)
    }
}

impl CxlError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CxlError::Config(msg.into())
    }

    /// Create a shared memory error
    pub fn shm<S: Into<String>>(msg: S) -> Self {
        CxlError::SharedMemory(msg.into())
    }

    /// Create a fabric error
    pub fn fabric<S: Into<String>>(msg: S) -> Self {
        CxlError::Fabric(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        CxlError::Timeout(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        CxlError::InvalidInput(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, CxlError::Timeout(_))
    }

    /// Check if this is an unmapped-address error
    pub fn is_address(&self) -> bool {
        matches!(self, CxlError::Address(_))
    }

    /// Check if this is a peer-offline error
    pub fn is_peer_offline(&self) -> bool {
        matches!(self, CxlError::PeerOffline(_))
    }
}
