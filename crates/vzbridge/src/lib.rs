//! # vzbridge
//!
//! Host-side bridge between an application and a virtualization engine.
//! Validates storage, Rosetta and keyboard device configuration, routes
//! asynchronous attachment events from engine threads to host receivers,
//! and runs save/restore of machine state one operation at a time.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vzbridge::{
//!     AttachmentBridge, MachineBuilder, NetworkBlockAttachment, NvmeControllerConfig,
//!     Platform, SimulatedEngine, SyncMode, VirtualMachine,
//! };
//!
//! # async fn example() -> vzbridge::Result<()> {
//! let engine = Arc::new(SimulatedEngine::new(Platform::Arm64));
//! let bridge = AttachmentBridge::new();
//!
//! let (nbd, mut events) =
//!     NetworkBlockAttachment::new(&bridge, "nbd://nas.local/data", 10.0, false, SyncMode::Full)?;
//! let config = MachineBuilder::new(Platform::Arm64)
//!     .storage(NvmeControllerConfig::new(nbd))
//!     .build()?;
//!
//! let vm = VirtualMachine::new(engine, bridge, config);
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! vm.destroy();
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Typed handles**: Attachment and operation handles can't be mixed up
//! - **Device validation**: Descriptors, NBD URLs, timeouts, sync modes, socket limits
//! - **Event bridge**: Engine callbacks on any thread become an ordered `Stream`
//! - **Snapshots**: Single-flight save/restore with awaitable outcomes
//! - **Declarative specs**: JSON machine descriptions via `MachineSpec`

mod attachment;
mod devices;
mod engine;
mod error;
mod handle;
mod machine;
mod snapshot;
mod spec;

pub use attachment::{AttachmentBridge, AttachmentEvent, AttachmentEvents, ConnectionState};
pub use devices::{
    validate_save_restore_support, CachingMode, DiskBlockAttachment, DiskImageAttachment,
    KeyboardConfig, NetworkBlockAttachment, NvmeControllerConfig, RosettaCachingKind,
    RosettaCachingOptions, RosettaDirectoryShare, StorageAttachment, StorageDeviceConfig,
    SyncMode, UsbMassStorageConfig, VirtioBlockConfig,
};
pub use engine::{
    Engine, EngineError, EngineErrorCode, Platform, SimulatedEngine, SnapshotMode, Submission,
};
pub use error::{BridgeError, Result, ValidationError};
pub use handle::{
    AttachmentHandle, AttachmentKind, Handle, HandleKind, HandleRegistry, OperationHandle,
    OperationKind, RegistryMiss,
};
pub use machine::{MachineBuilder, MachineConfiguration, MachineId, VirtualMachine};
pub use snapshot::{
    PendingSnapshot, SnapshotCompletion, SnapshotController, SnapshotKind, SnapshotOperation,
    SnapshotReport, SnapshotStatus,
};
pub use spec::{
    AttachmentSpec, BuiltMachine, ControllerKind, MachineSpec, RosettaSpec, StorageSpec,
};
