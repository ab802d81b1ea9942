//! Error types for vzbridge.

use crate::engine::{EngineError, Platform};
use crate::snapshot::SnapshotKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vzbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bad input to a device configuration constructor.
///
/// Always synchronous and always recoverable by correcting the input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// File descriptor is closed, of the wrong type, or not opened for the requested access
    #[error("invalid file descriptor: {0}")]
    InvalidDescriptor(String),

    /// Synchronization mode is unknown or not accepted by this attachment
    #[error("invalid synchronization mode: {0}")]
    InvalidSyncMode(String),

    /// URL does not describe a network block device endpoint
    #[error("invalid NBD URL: {0}")]
    InvalidUrl(String),

    /// Connection timeout must be a positive, finite number of seconds
    #[error("invalid timeout: {0} seconds")]
    InvalidTimeout(f64),

    /// Abstract socket name exceeds the engine limit
    #[error("abstract socket name is {len} bytes, maximum is {max}")]
    NameTooLong { len: usize, max: usize },

    /// Unix socket path exceeds the engine limit
    #[error("unix socket path is {len} bytes, maximum is {max}")]
    PathTooLong { len: usize, max: usize },

    /// Block device identifier is not ASCII or longer than 20 bytes
    #[error("invalid block device identifier: {0}")]
    InvalidIdentifier(String),

    /// Disk image does not exist on the host
    #[error("disk image not found: {0}")]
    MissingDiskImage(PathBuf),

    /// Machine-level resource bounds (vCPU, memory)
    #[error("invalid machine configuration: {0}")]
    InvalidMachine(String),
}

/// Errors returned by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration input was rejected
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The machine cannot save or restore its state
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Device variant is not available on this architecture
    #[error("{feature} is not supported on {platform}")]
    UnsupportedOnPlatform {
        feature: &'static str,
        platform: Platform,
    },

    /// A save or restore is already running on this machine
    #[error("{kind} already in progress for {}", path.display())]
    OperationInProgress { kind: SnapshotKind, path: PathBuf },

    /// The engine reported a failed save or restore
    #[error("snapshot failed: {0}")]
    SnapshotFailed(EngineError),

    /// The engine released a snapshot operation without reporting an outcome
    #[error("snapshot operation abandoned by the engine")]
    OperationAbandoned,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether retrying the same call later can succeed without changing input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationInProgress { .. } => true,
            Self::SnapshotFailed(e) => e.is_transient(),
            _ => false,
        }
    }
}
