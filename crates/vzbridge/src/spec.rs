//! Declarative machine descriptions loaded from JSON.
//!
//! ```json
//! {
//!   "platform": "arm64",
//!   "vcpus": 2,
//!   "memory_mib": 1024,
//!   "storage": [
//!     { "controller": "virtio", "identifier": "root",
//!       "attachment": { "type": "disk_image", "path": "/var/lib/vm/root.img", "sync": "fsync" } },
//!     { "attachment": { "type": "network_block", "url": "nbd://nas.local/data", "timeout_secs": 10 } }
//!   ],
//!   "rosetta": { "tag": "rosetta", "unix_socket": "/run/rosettad.sock" },
//!   "keyboards": ["usb"]
//! }
//! ```

use crate::attachment::{AttachmentBridge, AttachmentEvents};
use crate::devices::{
    CachingMode, DiskBlockAttachment, DiskImageAttachment, KeyboardConfig,
    NetworkBlockAttachment, NvmeControllerConfig, RosettaCachingOptions, RosettaDirectoryShare,
    StorageAttachment, StorageDeviceConfig, SyncMode, UsbMassStorageConfig, VirtioBlockConfig,
};
use crate::engine::{Engine, Platform};
use crate::error::{Result, ValidationError};
use crate::machine::{MachineBuilder, MachineConfiguration};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

fn default_vcpus() -> u8 {
    2
}

fn default_memory_mib() -> u64 {
    512
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_rosetta_tag() -> String {
    "rosetta".to_string()
}

/// Serializable description of a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineSpec {
    /// Platform the description targets. Defaults to the engine's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(default = "default_vcpus")]
    pub vcpus: u8,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,

    #[serde(default)]
    pub storage: Vec<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rosetta: Option<RosettaSpec>,

    #[serde(default)]
    pub keyboards: Vec<KeyboardConfig>,
}

/// Controller a storage attachment is exposed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Nvme,
    Virtio,
    Usb,
}

/// One storage device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSpec {
    #[serde(default)]
    pub controller: ControllerKind,

    /// Virtio block identifier. Only valid with the `virtio` controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    pub attachment: AttachmentSpec,
}

/// Backing storage of a device.
///
/// Sync and caching modes stay strings until [`MachineSpec::build`] so that
/// unknown values surface as validation errors rather than parse errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AttachmentSpec {
    DiskBlock {
        path: PathBuf,
        #[serde(default)]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync: Option<String>,
    },
    DiskImage {
        path: PathBuf,
        #[serde(default)]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caching: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync: Option<String>,
    },
    NetworkBlock {
        url: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: f64,
        #[serde(default)]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync: Option<String>,
    },
}

/// Rosetta directory share with at most one caching socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RosettaSpec {
    #[serde(default = "default_rosetta_tag")]
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_socket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
}

/// A validated configuration and the event receivers of its network attachments.
#[derive(Debug)]
pub struct BuiltMachine {
    pub config: MachineConfiguration,
    pub events: Vec<AttachmentEvents>,
}

impl MachineSpec {
    /// Read a description from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate every device and assemble the configuration.
    ///
    /// Network attachments are registered on `bridge`. If any later step
    /// fails, the attachments built so far are dropped, which releases
    /// their handles again.
    pub fn build(&self, engine: &dyn Engine, bridge: &AttachmentBridge) -> Result<BuiltMachine> {
        let mut events = Vec::new();
        let config = self.assemble(engine, bridge, &mut events)?;
        Ok(BuiltMachine { config, events })
    }

    fn assemble(
        &self,
        engine: &dyn Engine,
        bridge: &AttachmentBridge,
        events: &mut Vec<AttachmentEvents>,
    ) -> Result<MachineConfiguration> {
        let platform = engine.platform();
        if let Some(wanted) = self.platform {
            if wanted != platform {
                return Err(ValidationError::InvalidMachine(format!(
                    "machine targets {wanted} but the engine runs {platform}"
                ))
                .into());
            }
        }

        let mut builder = MachineBuilder::new(platform)
            .vcpus(self.vcpus)
            .memory_mib(self.memory_mib);

        for storage in &self.storage {
            let attachment = storage.attachment.build(bridge, events)?;
            builder = builder.storage(storage.device(attachment)?);
        }

        if let Some(rosetta) = &self.rosetta {
            builder = builder.directory_share(rosetta.build(engine)?);
        }

        for keyboard in &self.keyboards {
            let keyboard = match keyboard {
                KeyboardConfig::Usb => KeyboardConfig::usb(),
                KeyboardConfig::Mac => KeyboardConfig::mac(engine)?,
            };
            builder = builder.keyboard(keyboard);
        }

        Ok(builder.build()?)
    }
}

fn parse_sync(raw: Option<&str>) -> std::result::Result<SyncMode, ValidationError> {
    raw.map_or(Ok(SyncMode::Full), str::parse)
}

impl AttachmentSpec {
    fn build(
        &self,
        bridge: &AttachmentBridge,
        events: &mut Vec<AttachmentEvents>,
    ) -> Result<StorageAttachment> {
        let attachment = match self {
            AttachmentSpec::DiskBlock {
                path,
                read_only,
                sync,
            } => {
                let sync = parse_sync(sync.as_deref())?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(!read_only)
                    .open(path)?;
                DiskBlockAttachment::new(file.as_raw_fd(), *read_only, sync)?.into()
            }
            AttachmentSpec::DiskImage {
                path,
                read_only,
                caching,
                sync,
            } => {
                let caching = caching
                    .as_deref()
                    .map_or(Ok(CachingMode::default()), str::parse)?;
                let sync = parse_sync(sync.as_deref())?;
                DiskImageAttachment::new(path, *read_only, caching, sync)?.into()
            }
            AttachmentSpec::NetworkBlock {
                url,
                timeout_secs,
                read_only,
                sync,
            } => {
                let sync = parse_sync(sync.as_deref())?;
                let (nbd, receiver) =
                    NetworkBlockAttachment::new(bridge, url, *timeout_secs, *read_only, sync)?;
                events.push(receiver);
                nbd.into()
            }
        };
        Ok(attachment)
    }
}

impl StorageSpec {
    fn device(&self, attachment: StorageAttachment) -> Result<StorageDeviceConfig> {
        let device = match (self.controller, &self.identifier) {
            (ControllerKind::Virtio, Some(id)) => {
                VirtioBlockConfig::new(attachment).with_identifier(id.as_str())?.into()
            }
            (ControllerKind::Virtio, None) => VirtioBlockConfig::new(attachment).into(),
            (_, Some(_)) => {
                return Err(ValidationError::InvalidMachine(
                    "identifier is only supported on virtio controllers".into(),
                )
                .into())
            }
            (ControllerKind::Nvme, None) => NvmeControllerConfig::new(attachment).into(),
            (ControllerKind::Usb, None) => UsbMassStorageConfig::new(attachment).into(),
        };
        Ok(device)
    }
}

impl RosettaSpec {
    fn build(&self, engine: &dyn Engine) -> Result<RosettaDirectoryShare> {
        let share = RosettaDirectoryShare::new(self.tag.as_str());
        let options = match (&self.abstract_socket, &self.unix_socket) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::InvalidMachine(
                    "rosetta accepts either abstract_socket or unix_socket, not both".into(),
                )
                .into())
            }
            (Some(name), None) => Some(RosettaCachingOptions::abstract_socket(engine, name.as_str())?),
            (None, Some(path)) => Some(RosettaCachingOptions::unix_socket(engine, path.as_path())?),
            (None, None) => None,
        };
        Ok(match options {
            Some(options) => share.with_caching_options(options),
            None => share,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;
    use crate::error::BridgeError;
    use std::io::Write;

    fn parse(json: &str) -> MachineSpec {
        serde_json::from_str(json).expect("spec should deserialize")
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"vcpus": 4, "memory_mib": 2048}}"#).unwrap();

        let spec = MachineSpec::load(file.path()).unwrap();
        assert_eq!(spec.vcpus, 4);
        assert_eq!(spec.memory_mib, 2048);
        assert!(spec.storage.is_empty());
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"vcpu": 4}}"#).unwrap();
        assert!(matches!(
            MachineSpec::load(file.path()),
            Err(BridgeError::Json(_))
        ));
    }

    #[test]
    fn test_build_all_storage_kinds() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let block = tempfile::NamedTempFile::new().unwrap();
        let spec = parse(&format!(
            r#"{{
                "storage": [
                    {{ "controller": "virtio", "identifier": "root",
                       "attachment": {{ "type": "disk_image", "path": "{}", "sync": "fsync", "caching": "cached" }} }},
                    {{ "controller": "usb",
                       "attachment": {{ "type": "disk_block", "path": "{}", "read_only": true }} }},
                    {{ "attachment": {{ "type": "network_block", "url": "nbd://localhost/export" }} }}
                ]
            }}"#,
            image.path().display(),
            block.path().display()
        ));

        let engine = SimulatedEngine::new(Platform::Arm64);
        let bridge = AttachmentBridge::new();
        let built = spec.build(&engine, &bridge).unwrap();

        let devices = built.config.storage_devices();
        assert_eq!(devices.len(), 3);
        assert!(matches!(devices[0], StorageDeviceConfig::VirtioBlock(_)));
        assert!(matches!(devices[1], StorageDeviceConfig::UsbMassStorage(_)));
        assert!(matches!(devices[2], StorageDeviceConfig::Nvme(_)));
        assert_eq!(built.events.len(), 1);
        assert_eq!(bridge.live_attachments(), 1);
    }

    #[test]
    fn test_unknown_sync_mode() {
        let spec = parse(
            r#"{ "storage": [ { "attachment":
                { "type": "network_block", "url": "nbd://localhost/export", "sync": "sometimes" } } ] }"#,
        );
        let engine = SimulatedEngine::new(Platform::Arm64);
        let bridge = AttachmentBridge::new();

        assert!(matches!(
            spec.build(&engine, &bridge),
            Err(BridgeError::Validation(ValidationError::InvalidSyncMode(_)))
        ));
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let spec = parse(
            r#"{ "storage": [ { "attachment":
                { "type": "network_block", "url": "nbd://localhost/export", "timeout_secs": 1e300 } } ] }"#,
        );
        let engine = SimulatedEngine::new(Platform::Arm64);
        let bridge = AttachmentBridge::new();

        assert!(matches!(
            spec.build(&engine, &bridge),
            Err(BridgeError::Validation(ValidationError::InvalidTimeout(_)))
        ));
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_failure_releases_registered_handles() {
        let spec = parse(
            r#"{ "storage": [
                { "attachment": { "type": "network_block", "url": "nbd://a.local/x" } },
                { "attachment": { "type": "network_block", "url": "nbds://b.local/y" } },
                { "attachment": { "type": "disk_image", "path": "/nonexistent/disk.img" } }
            ] }"#,
        );
        let engine = SimulatedEngine::new(Platform::Arm64);
        let bridge = AttachmentBridge::new();

        assert!(matches!(
            spec.build(&engine, &bridge),
            Err(BridgeError::Validation(ValidationError::MissingDiskImage(_)))
        ));
        assert_eq!(bridge.live_attachments(), 0);

        let invalid_machine = parse(
            r#"{ "vcpus": 0, "storage": [
                { "attachment": { "type": "network_block", "url": "nbd://a.local/x" } }
            ] }"#,
        );
        assert!(invalid_machine.build(&engine, &bridge).is_err());
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_identifier_requires_virtio() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let spec = parse(&format!(
            r#"{{ "storage": [ {{ "controller": "nvme", "identifier": "root",
                "attachment": {{ "type": "disk_image", "path": "{}" }} }} ] }}"#,
            image.path().display()
        ));
        let engine = SimulatedEngine::new(Platform::Arm64);

        assert!(matches!(
            spec.build(&engine, &AttachmentBridge::new()),
            Err(BridgeError::Validation(ValidationError::InvalidMachine(_)))
        ));
    }

    #[test]
    fn test_rosetta_socket_choice() {
        let engine = SimulatedEngine::new(Platform::Arm64);
        let bridge = AttachmentBridge::new();

        let both = parse(
            r#"{ "rosetta": { "abstract_socket": "cache", "unix_socket": "/run/cache.sock" } }"#,
        );
        assert!(both.build(&engine, &bridge).is_err());

        let unix = parse(r#"{ "rosetta": { "unix_socket": "/run/cache.sock" } }"#);
        let built = unix.build(&engine, &bridge).unwrap();
        let share = &built.config.directory_shares()[0];
        assert_eq!(share.tag(), "rosetta");
        assert_eq!(share.socket_path(), Some(Path::new("/run/cache.sock")));
    }

    #[test]
    fn test_platform_guards() {
        let engine = SimulatedEngine::new(Platform::X86_64);
        let bridge = AttachmentBridge::new();

        let mismatch = parse(r#"{ "platform": "arm64" }"#);
        assert!(matches!(
            mismatch.build(&engine, &bridge),
            Err(BridgeError::Validation(ValidationError::InvalidMachine(_)))
        ));

        let mac = parse(r#"{ "keyboards": ["usb", "mac"] }"#);
        assert!(matches!(
            mac.build(&engine, &bridge),
            Err(BridgeError::UnsupportedOnPlatform { .. })
        ));
    }
}
