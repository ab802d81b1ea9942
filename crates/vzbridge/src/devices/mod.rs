//! Device configuration values.
//!
//! Every constructor here is a pure validation step: it either returns an
//! immutable descriptor or a [`ValidationError`](crate::ValidationError), and
//! never touches a running machine. The only side effect is registering a
//! handle for network block attachments, whose connection is reported later
//! through the [`AttachmentBridge`](crate::AttachmentBridge).

mod keyboard;
mod rosetta;
mod storage;

pub use keyboard::KeyboardConfig;
pub use rosetta::{RosettaCachingKind, RosettaCachingOptions, RosettaDirectoryShare};
pub use storage::{
    CachingMode, DiskBlockAttachment, DiskImageAttachment, NetworkBlockAttachment,
    NvmeControllerConfig, StorageAttachment, StorageDeviceConfig, SyncMode,
    UsbMassStorageConfig, VirtioBlockConfig,
};

use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::machine::MachineConfiguration;

/// Ask the engine whether `config` can save and restore machine state.
///
/// # Errors
/// `UnsupportedConfiguration` with the engine's reason.
pub fn validate_save_restore_support(engine: &dyn Engine, config: &MachineConfiguration) -> Result<()> {
    engine.validate_save_restore_support(config).map_err(|e| {
        tracing::info!(reason = %e.message, "Save/restore not supported");
        BridgeError::UnsupportedConfiguration(e.message)
    })
}
