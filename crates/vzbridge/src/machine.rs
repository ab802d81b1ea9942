//! Machine configuration and the host-side machine object.

use crate::attachment::AttachmentBridge;
use crate::devices::{KeyboardConfig, RosettaDirectoryShare, StorageDeviceConfig};
use crate::engine::{Engine, Platform};
use crate::error::{Result, ValidationError};
use crate::handle::AttachmentHandle;
use crate::snapshot::{PendingSnapshot, SnapshotController, SnapshotOperation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Minimum guest memory accepted by [`MachineBuilder`].
const MIN_MEMORY_MIB: u64 = 128;

/// Unique identifier for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(Uuid);

impl MachineId {
    /// Create a new random machine ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MachineId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Immutable description of a machine's resources and devices.
#[derive(Debug, Clone)]
pub struct MachineConfiguration {
    platform: Platform,
    vcpu_count: u8,
    memory_mib: u64,
    storage: Vec<StorageDeviceConfig>,
    keyboards: Vec<KeyboardConfig>,
    directory_shares: Vec<RosettaDirectoryShare>,
}

impl MachineConfiguration {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn vcpu_count(&self) -> u8 {
        self.vcpu_count
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    pub fn storage_devices(&self) -> &[StorageDeviceConfig] {
        &self.storage
    }

    pub fn keyboards(&self) -> &[KeyboardConfig] {
        &self.keyboards
    }

    pub fn directory_shares(&self) -> &[RosettaDirectoryShare] {
        &self.directory_shares
    }

    /// Handles of every attachment that reports connection events.
    pub fn attachment_handles(&self) -> Vec<AttachmentHandle> {
        self.storage
            .iter()
            .filter_map(|device| device.attachment().event_handle())
            .collect()
    }
}

/// Fluent builder for [`MachineConfiguration`].
///
/// # Example
///
/// ```
/// use vzbridge::{MachineBuilder, Platform};
///
/// let config = MachineBuilder::new(Platform::Arm64)
///     .vcpus(4)
///     .memory_mib(2048)
///     .build()
///     .unwrap();
/// assert_eq!(config.vcpu_count(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    config: MachineConfiguration,
}

impl MachineBuilder {
    /// Create a builder with 2 vCPUs, 512 MiB and no devices.
    pub fn new(platform: Platform) -> Self {
        Self {
            config: MachineConfiguration {
                platform,
                vcpu_count: 2,
                memory_mib: 512,
                storage: Vec::new(),
                keyboards: Vec::new(),
                directory_shares: Vec::new(),
            },
        }
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Add a storage device.
    pub fn storage(mut self, device: impl Into<StorageDeviceConfig>) -> Self {
        self.config.storage.push(device.into());
        self
    }

    /// Add a keyboard.
    pub fn keyboard(mut self, keyboard: KeyboardConfig) -> Self {
        self.config.keyboards.push(keyboard);
        self
    }

    /// Add a Rosetta directory share.
    pub fn directory_share(mut self, share: RosettaDirectoryShare) -> Self {
        self.config.directory_shares.push(share);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// `InvalidMachine` for zero vCPUs, too little memory, or duplicate share tags.
    pub fn build(self) -> std::result::Result<MachineConfiguration, ValidationError> {
        let config = self.config;
        if config.vcpu_count == 0 {
            return Err(ValidationError::InvalidMachine(
                "vcpu_count must be at least 1".into(),
            ));
        }
        if config.memory_mib < MIN_MEMORY_MIB {
            return Err(ValidationError::InvalidMachine(format!(
                "memory_mib must be at least {MIN_MEMORY_MIB}, got {}",
                config.memory_mib
            )));
        }
        let mut tags: Vec<&str> = config.directory_shares.iter().map(|s| s.tag()).collect();
        tags.sort_unstable();
        if let Some(pair) = tags.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ValidationError::InvalidMachine(format!(
                "duplicate directory share tag: {}",
                pair[0]
            )));
        }
        Ok(config)
    }
}

/// Host-side owner of one machine executing on the engine.
///
/// Owns the machine's snapshot controller and the attachment handles its
/// configuration registered, and releases them when destroyed or dropped.
pub struct VirtualMachine {
    id: MachineId,
    config: Arc<MachineConfiguration>,
    bridge: AttachmentBridge,
    snapshots: SnapshotController,
}

impl VirtualMachine {
    /// Take ownership of `config`, whose network attachments were registered on `bridge`.
    pub fn new(engine: Arc<dyn Engine>, bridge: AttachmentBridge, config: MachineConfiguration) -> Self {
        let id = MachineId::new();
        let config = Arc::new(config);
        tracing::info!(
            machine_id = %id,
            platform = %config.platform(),
            storage = config.storage_devices().len(),
            "Machine created"
        );

        Self {
            id,
            snapshots: SnapshotController::new(id, engine, Arc::clone(&config)),
            config,
            bridge,
        }
    }

    /// Get the unique ID of this machine.
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Get the configuration the machine runs with.
    pub fn config(&self) -> &MachineConfiguration {
        &self.config
    }

    /// Get the bridge the engine reports attachment events through.
    pub fn bridge(&self) -> &AttachmentBridge {
        &self.bridge
    }

    /// Check, once per machine, that save/restore is supported.
    pub fn validate_save_restore_support(&self) -> Result<()> {
        self.snapshots.ensure_supported()
    }

    /// Save machine state to `path`.
    pub fn save(&self, path: impl Into<PathBuf>) -> Result<PendingSnapshot> {
        self.snapshots.save(path)
    }

    /// Restore machine state from `path`.
    pub fn restore(&self, path: impl Into<PathBuf>) -> Result<PendingSnapshot> {
        self.snapshots.restore(path)
    }

    /// The snapshot operation in flight, if any.
    pub fn current_snapshot(&self) -> Option<SnapshotOperation> {
        self.snapshots.current()
    }

    /// The most recent snapshot operation to finish, with its final status.
    pub fn last_snapshot(&self) -> Option<SnapshotOperation> {
        self.snapshots.last_finished()
    }

    /// Tear down the host side of the machine.
    ///
    /// Events for its attachments that arrive afterwards are dropped. An
    /// in-flight snapshot still completes, but nobody observes the result.
    /// Dropping the machine has the same effect.
    pub fn destroy(self) {
        tracing::info!(machine_id = %self.id, "Destroying machine");
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        let handles = self.config.attachment_handles();
        for handle in &handles {
            self.bridge.release(*handle);
        }
        tracing::debug!(machine_id = %self.id, released = handles.len(), "Machine dropped");
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.id)
            .field("platform", &self.config.platform())
            .finish()
    }
}
