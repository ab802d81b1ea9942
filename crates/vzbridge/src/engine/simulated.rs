//! In-process engine used for dry runs and tests.

use super::{Engine, EngineError, EngineErrorCode, Platform};
use crate::devices::{StorageAttachment, StorageDeviceConfig};
use crate::machine::{MachineConfiguration, MachineId};
use crate::snapshot::{SnapshotCompletion, SnapshotKind};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

const DEFAULT_MAX_NAME_LENGTH: usize = 107;
const DEFAULT_MAX_PATH_LENGTH: usize = 104;

/// Leading bytes of every state file the simulated engine writes.
const STATE_MAGIC: &[u8; 8] = b"VZSIMST1";

/// How the simulated engine handles snapshot submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Hold completions until the test takes and completes them.
    #[default]
    Manual,
    /// Write or read a state file on a worker thread, then complete.
    WriteFile,
}

/// A snapshot request captured in [`SnapshotMode::Manual`].
#[derive(Debug)]
pub struct Submission {
    pub machine: MachineId,
    pub kind: SnapshotKind,
    pub path: PathBuf,
    pub completion: SnapshotCompletion,
}

/// Engine stand-in with configurable limits and save/restore rules.
///
/// Save/restore is only supported on arm64, and never for machines with
/// network block attachments or USB mass storage devices.
#[derive(Debug)]
pub struct SimulatedEngine {
    platform: Platform,
    max_name_length: usize,
    max_path_length: usize,
    mode: SnapshotMode,
    rejection: Option<String>,
    validations: AtomicUsize,
    submitted: AtomicUsize,
    pending: Mutex<Vec<Submission>>,
}

impl SimulatedEngine {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
            mode: SnapshotMode::default(),
            rejection: None,
            validations: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Override the Rosetta caching limits.
    pub fn with_limits(mut self, max_name_length: usize, max_path_length: usize) -> Self {
        self.max_name_length = max_name_length;
        self.max_path_length = max_path_length;
        self
    }

    pub fn with_snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.mode = mode;
        self
    }

    /// Refuse save/restore for every configuration.
    pub fn reject_save_restore(mut self, reason: impl Into<String>) -> Self {
        self.rejection = Some(reason.into());
        self
    }

    /// Number of times save/restore support was validated.
    pub fn validation_count(&self) -> usize {
        self.validations.load(Ordering::Relaxed)
    }

    /// Number of snapshot operations submitted so far.
    pub fn submission_count(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Take the submissions held in manual mode.
    pub fn take_submissions(&self) -> Vec<Submission> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn submit(
        &self,
        machine: MachineId,
        kind: SnapshotKind,
        path: &Path,
        completion: SnapshotCompletion,
    ) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            SnapshotMode::Manual => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Submission {
                        machine,
                        kind,
                        path: path.to_path_buf(),
                        completion,
                    });
            }
            SnapshotMode::WriteFile => {
                let path = path.to_path_buf();
                std::thread::spawn(move || {
                    let result = match kind {
                        SnapshotKind::Save => write_state(machine, &path),
                        SnapshotKind::Restore => read_state(&path),
                    };
                    completion.complete(result);
                });
            }
        }
    }
}

fn write_state(machine: MachineId, path: &Path) -> std::result::Result<(), EngineError> {
    let mut file = std::fs::File::create(path)
        .map_err(|e| EngineError::new(EngineErrorCode::Save, format!("create state file: {e}")))?;
    file.write_all(STATE_MAGIC)
        .and_then(|_| file.write_all(machine.as_uuid().as_bytes()))
        .and_then(|_| file.sync_all())
        .map_err(|e| match e.raw_os_error() {
            Some(nix::libc::ENOSPC) => EngineError::new(EngineErrorCode::OutOfDiskSpace, e.to_string()),
            _ => EngineError::new(EngineErrorCode::Save, format!("write state file: {e}")),
        })
}

fn read_state(path: &Path) -> std::result::Result<(), EngineError> {
    let mut magic = [0u8; 8];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| EngineError::new(EngineErrorCode::Restore, format!("read state file: {e}")))?;
    if &magic != STATE_MAGIC {
        return Err(EngineError::new(
            EngineErrorCode::Restore,
            "incompatible saved state format",
        ));
    }
    Ok(())
}

impl Engine for SimulatedEngine {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn max_abstract_socket_name_length(&self) -> usize {
        self.max_name_length
    }

    fn max_unix_socket_path_length(&self) -> usize {
        self.max_path_length
    }

    fn validate_save_restore_support(
        &self,
        config: &MachineConfiguration,
    ) -> std::result::Result<(), EngineError> {
        self.validations.fetch_add(1, Ordering::Relaxed);

        let unsupported = |message: String| EngineError::new(EngineErrorCode::NotSupported, message);

        if let Some(reason) = &self.rejection {
            return Err(unsupported(reason.clone()));
        }
        if config.platform() != Platform::Arm64 {
            return Err(unsupported(format!(
                "save/restore is not available on {}",
                config.platform()
            )));
        }
        for device in config.storage_devices() {
            if matches!(device, StorageDeviceConfig::UsbMassStorage(_)) {
                return Err(unsupported(
                    "USB mass storage devices cannot be saved".to_string(),
                ));
            }
            if matches!(device.attachment(), StorageAttachment::NetworkBlock(_)) {
                return Err(unsupported(
                    "network block device attachments cannot be saved".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn save_machine_state(&self, machine: MachineId, path: &Path, completion: SnapshotCompletion) {
        self.submit(machine, SnapshotKind::Save, path, completion);
    }

    fn restore_machine_state(
        &self,
        machine: MachineId,
        path: &Path,
        completion: SnapshotCompletion,
    ) {
        self.submit(machine, SnapshotKind::Restore, path, completion);
    }
}
