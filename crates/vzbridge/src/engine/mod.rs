//! The seam between the bridge and the virtualization engine.
//!
//! The engine is treated as an opaque executor: the bridge hands it immutable
//! configuration, submits save/restore requests, and receives outcomes through
//! callbacks that may arrive on any engine-owned thread.

mod simulated;

pub use simulated::{SimulatedEngine, SnapshotMode, Submission};

use crate::machine::{MachineConfiguration, MachineId};
use crate::snapshot::SnapshotCompletion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// CPU architecture the engine runs guests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Arm64,
    X86_64,
}

impl Platform {
    /// Architecture of the running host process.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::Arm64
        } else {
            Self::X86_64
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Arm64 => write!(f, "arm64"),
            Platform::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// Error codes of the engine's error domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorCode {
    Internal,
    InvalidVirtualMachineConfiguration,
    InvalidVirtualMachineState,
    InvalidVirtualMachineStateTransition,
    InvalidDiskImage,
    VirtualMachineLimitExceeded,
    NetworkError,
    OutOfDiskSpace,
    OperationCancelled,
    NotSupported,
    Save,
    Restore,
    NetworkBlockDeviceNegotiationFailed,
    NetworkBlockDeviceDisconnected,
    /// A code this bridge does not know about
    Other(i64),
}

impl EngineErrorCode {
    /// Map the engine's numeric code.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Internal,
            2 => Self::InvalidVirtualMachineConfiguration,
            3 => Self::InvalidVirtualMachineState,
            4 => Self::InvalidVirtualMachineStateTransition,
            5 => Self::InvalidDiskImage,
            6 => Self::VirtualMachineLimitExceeded,
            7 => Self::NetworkError,
            8 => Self::OutOfDiskSpace,
            9 => Self::OperationCancelled,
            10 => Self::NotSupported,
            11 => Self::Save,
            12 => Self::Restore,
            20001 => Self::NetworkBlockDeviceNegotiationFailed,
            20002 => Self::NetworkBlockDeviceDisconnected,
            other => Self::Other(other),
        }
    }

    /// The engine's numeric code.
    pub fn code(&self) -> i64 {
        match self {
            Self::Internal => 1,
            Self::InvalidVirtualMachineConfiguration => 2,
            Self::InvalidVirtualMachineState => 3,
            Self::InvalidVirtualMachineStateTransition => 4,
            Self::InvalidDiskImage => 5,
            Self::VirtualMachineLimitExceeded => 6,
            Self::NetworkError => 7,
            Self::OutOfDiskSpace => 8,
            Self::OperationCancelled => 9,
            Self::NotSupported => 10,
            Self::Save => 11,
            Self::Restore => 12,
            Self::NetworkBlockDeviceNegotiationFailed => 20001,
            Self::NetworkBlockDeviceDisconnected => 20002,
            Self::Other(code) => *code,
        }
    }
}

/// An error reported by the engine, either synchronously or via a callback.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (code {})", code.code())]
pub struct EngineError {
    pub code: EngineErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: EngineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether the condition may clear up without changing configuration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            EngineErrorCode::NetworkError | EngineErrorCode::NetworkBlockDeviceDisconnected
        )
    }
}

/// Operations the bridge needs from the virtualization engine.
///
/// Implementations must accept calls from any thread. Snapshot submissions
/// return immediately; the engine reports the outcome later, from whatever
/// thread it likes, by consuming the [`SnapshotCompletion`] it was given.
pub trait Engine: Send + Sync {
    /// Architecture guests run on.
    fn platform(&self) -> Platform;

    /// Longest abstract socket name accepted for Rosetta caching.
    fn max_abstract_socket_name_length(&self) -> usize;

    /// Longest unix socket path accepted for Rosetta caching.
    fn max_unix_socket_path_length(&self) -> usize;

    /// Check whether a machine with this configuration can save and restore state.
    fn validate_save_restore_support(
        &self,
        config: &MachineConfiguration,
    ) -> std::result::Result<(), EngineError>;

    /// Start writing the machine's state to `path`.
    fn save_machine_state(&self, machine: MachineId, path: &Path, completion: SnapshotCompletion);

    /// Start restoring the machine's state from `path`.
    fn restore_machine_state(
        &self,
        machine: MachineId,
        path: &Path,
        completion: SnapshotCompletion,
    );
}
