//! Common error types for devmux
//!
//! This module defines all error types used across the devmux scheduler.
//! Backend execution errors are captured on worker slots and re-raised only
//! when the logical caller fetches its result.

use thiserror::Error;

/// Main error type for devmux
#[derive(Error, Debug)]
pub enum DevMuxError {
    /// Configuration errors (malformed target string, bad batch size, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single candidate device failed to load; recoverable by falling
    /// back to the next candidate
    #[error("Device load error: {0}")]
    DeviceLoad(String),

    /// Every candidate device failed to load; fatal for request creation
    #[error("All candidate devices failed to load: {0}")]
    AllDevicesFailed(String),

    /// Error captured from a backend completion callback
    #[error("Backend execution error: {0}")]
    Backend(String),

    /// A referenced device or blob is not known to the scheduler
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is already running an inference
    #[error("Request is busy: {0}")]
    Busy(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parsing errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Generic internal error; indicates a broken invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DevMuxError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        DevMuxError::Config(msg.into())
    }

    /// Create a device load error
    pub fn device_load(msg: impl Into<String>) -> Self {
        DevMuxError::DeviceLoad(msg.into())
    }

    /// Create a backend execution error
    pub fn backend(msg: impl Into<String>) -> Self {
        DevMuxError::Backend(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        DevMuxError::NotFound(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        DevMuxError::Busy(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        DevMuxError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        DevMuxError::Internal(msg.into())
    }
}

/// Result type alias for devmux operations
pub type Result<T> = std::result::Result<T, DevMuxError>;
