//! Storage attachments and the controllers that expose them to the guest.

use crate::attachment::{AttachmentBridge, AttachmentEvents, AttachmentLease};
use crate::error::ValidationError;
use crate::handle::AttachmentHandle;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::{close, dup};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Longest identifier a Virtio block device accepts, in bytes.
const MAX_BLOCK_DEVICE_IDENTIFIER_LEN: usize = 20;

/// How guest flush requests reach the backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Forward every flush and barrier to the backing store.
    Full,
    /// Flush with `fsync` only. Disk images only.
    Fsync,
    /// Never synchronize.
    None,
}

impl SyncMode {
    /// Decode the engine's block attachment encoding.
    pub fn from_block_raw(raw: i64) -> Result<Self, ValidationError> {
        match raw {
            0 => Ok(Self::Full),
            1 => Ok(Self::None),
            other => Err(ValidationError::InvalidSyncMode(format!(
                "unknown block synchronization mode {other}"
            ))),
        }
    }

    /// Decode the engine's disk image encoding.
    pub fn from_image_raw(raw: i64) -> Result<Self, ValidationError> {
        match raw {
            1 => Ok(Self::Full),
            2 => Ok(Self::Fsync),
            3 => Ok(Self::None),
            other => Err(ValidationError::InvalidSyncMode(format!(
                "unknown disk image synchronization mode {other}"
            ))),
        }
    }

    /// Accept only the modes block attachments support.
    fn for_block_attachment(self) -> Result<Self, ValidationError> {
        match self {
            SyncMode::Full | SyncMode::None => Ok(self),
            SyncMode::Fsync => Err(ValidationError::InvalidSyncMode(
                "fsync is only available for disk images".into(),
            )),
        }
    }
}

impl FromStr for SyncMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "fsync" => Ok(Self::Fsync),
            "none" => Ok(Self::None),
            other => Err(ValidationError::InvalidSyncMode(format!(
                "unknown mode {other:?}"
            ))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Fsync => write!(f, "fsync"),
            SyncMode::None => write!(f, "none"),
        }
    }
}

/// Host caching policy for disk images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingMode {
    #[default]
    Automatic,
    Uncached,
    Cached,
}

impl FromStr for CachingMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" => Ok(Self::Automatic),
            "uncached" => Ok(Self::Uncached),
            "cached" => Ok(Self::Cached),
            other => Err(ValidationError::InvalidMachine(format!(
                "unknown caching mode {other:?}"
            ))),
        }
    }
}

/// A descriptor duplicated from the caller's, closed on drop.
#[derive(Debug)]
struct DuplicatedFd(RawFd);

impl Drop for DuplicatedFd {
    fn drop(&mut self) {
        if let Err(e) = close(self.0) {
            tracing::debug!(fd = self.0, error = %e, "Failed to close duplicated descriptor");
        }
    }
}

/// Storage backed by an open block device or file descriptor.
///
/// Holds its own duplicate of the descriptor, so the caller may close theirs.
#[derive(Debug, Clone)]
pub struct DiskBlockAttachment {
    fd: Arc<DuplicatedFd>,
    read_only: bool,
    sync_mode: SyncMode,
}

impl DiskBlockAttachment {
    /// Validate `fd` and wrap it as an attachment.
    ///
    /// # Errors
    /// `InvalidDescriptor` if `fd` is closed, not seekable, or not open for the
    /// requested access; `InvalidSyncMode` for [`SyncMode::Fsync`].
    pub fn new(fd: RawFd, read_only: bool, sync_mode: SyncMode) -> Result<Self, ValidationError> {
        let owned = dup(fd)
            .map(DuplicatedFd)
            .map_err(|e| ValidationError::InvalidDescriptor(format!("descriptor {fd} is not open: {e}")))?;

        let flags = fcntl(owned.0, FcntlArg::F_GETFL).map_err(|e| {
            ValidationError::InvalidDescriptor(format!("cannot read flags of descriptor {fd}: {e}"))
        })?;
        let access = OFlag::from_bits_truncate(flags) & OFlag::O_ACCMODE;
        if access == OFlag::O_WRONLY {
            return Err(ValidationError::InvalidDescriptor(format!(
                "descriptor {fd} is write-only"
            )));
        }
        if !read_only && access == OFlag::O_RDONLY {
            return Err(ValidationError::InvalidDescriptor(format!(
                "descriptor {fd} is read-only but the attachment is writable"
            )));
        }

        let stat = fstat(owned.0).map_err(|e| {
            ValidationError::InvalidDescriptor(format!("cannot stat descriptor {fd}: {e}"))
        })?;
        let file_type = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
        if ![SFlag::S_IFBLK, SFlag::S_IFCHR, SFlag::S_IFREG].contains(&file_type) {
            return Err(ValidationError::InvalidDescriptor(format!(
                "descriptor {fd} is not a disk or regular file"
            )));
        }

        let sync_mode = sync_mode.for_block_attachment()?;

        Ok(Self {
            fd: Arc::new(owned),
            read_only,
            sync_mode,
        })
    }

    /// The attachment's own descriptor, valid while any clone is alive.
    pub fn fd(&self) -> RawFd {
        self.fd.0
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }
}

impl AsRawFd for DiskBlockAttachment {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.0
    }
}

/// Storage served by a remote NBD server.
///
/// Construction does not connect. The engine connects when the machine
/// starts and reports progress on the attachment's [`AttachmentEvents`].
#[derive(Debug, Clone)]
pub struct NetworkBlockAttachment {
    url: Url,
    timeout: Duration,
    forced_read_only: bool,
    sync_mode: SyncMode,
    lease: Arc<AttachmentLease>,
}

impl NetworkBlockAttachment {
    /// Validate the endpoint and register for its connection events.
    ///
    /// No handle is registered if validation fails. The handle is released
    /// once the attachment and every clone of it are dropped.
    ///
    /// # Errors
    /// `InvalidUrl`, `InvalidTimeout` or `InvalidSyncMode`.
    pub fn new(
        bridge: &AttachmentBridge,
        url: &str,
        timeout_secs: f64,
        forced_read_only: bool,
        sync_mode: SyncMode,
    ) -> Result<(Self, AttachmentEvents), ValidationError> {
        let url = parse_nbd_url(url)?;
        if timeout_secs <= 0.0 {
            return Err(ValidationError::InvalidTimeout(timeout_secs));
        }
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|_| ValidationError::InvalidTimeout(timeout_secs))?;
        let sync_mode = sync_mode.for_block_attachment()?;

        let (handle, events) = bridge.register();
        tracing::info!(%handle, url = %url, timeout_secs, "Network block attachment configured");

        Ok((
            Self {
                url,
                timeout,
                forced_read_only,
                sync_mode,
                lease: Arc::new(bridge.lease(handle)),
            },
            events,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn forced_read_only(&self) -> bool {
        self.forced_read_only
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Handle the engine reports this attachment's events under.
    pub fn handle(&self) -> AttachmentHandle {
        self.lease.handle()
    }
}

/// Parse an NBD URI: `nbd[s]://host[:port][/export]` or
/// `nbd[s]+unix:///[export]?socket=/path`.
fn parse_nbd_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "nbd" | "nbds" => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err(ValidationError::InvalidUrl(format!("{raw}: missing host")));
            }
        }
        "nbd+unix" | "nbds+unix" => {
            let has_socket = url
                .query_pairs()
                .any(|(key, value)| key == "socket" && !value.is_empty());
            if !has_socket {
                return Err(ValidationError::InvalidUrl(format!(
                    "{raw}: unix transport requires a socket parameter"
                )));
            }
        }
        other => {
            return Err(ValidationError::InvalidUrl(format!(
                "{raw}: unsupported scheme {other:?}"
            )));
        }
    }
    Ok(url)
}

/// Storage backed by a raw disk image file on the host.
#[derive(Debug, Clone)]
pub struct DiskImageAttachment {
    path: PathBuf,
    read_only: bool,
    caching_mode: CachingMode,
    sync_mode: SyncMode,
}

impl DiskImageAttachment {
    /// # Errors
    /// `MissingDiskImage` if `path` does not exist.
    pub fn new(
        path: impl Into<PathBuf>,
        read_only: bool,
        caching_mode: CachingMode,
        sync_mode: SyncMode,
    ) -> Result<Self, ValidationError> {
        let path = path.into();
        if !path.exists() {
            return Err(ValidationError::MissingDiskImage(path));
        }
        Ok(Self {
            path,
            read_only,
            caching_mode,
            sync_mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn caching_mode(&self) -> CachingMode {
        self.caching_mode
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }
}

/// Any storage attachment.
#[derive(Debug, Clone)]
pub enum StorageAttachment {
    DiskBlock(DiskBlockAttachment),
    NetworkBlock(NetworkBlockAttachment),
    DiskImage(DiskImageAttachment),
}

impl StorageAttachment {
    /// Event handle, for attachments that report connection events.
    pub fn event_handle(&self) -> Option<AttachmentHandle> {
        match self {
            Self::NetworkBlock(nbd) => Some(nbd.handle()),
            _ => None,
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            Self::DiskBlock(disk) => disk.read_only(),
            Self::NetworkBlock(nbd) => nbd.forced_read_only(),
            Self::DiskImage(image) => image.read_only(),
        }
    }
}

impl From<DiskBlockAttachment> for StorageAttachment {
    fn from(attachment: DiskBlockAttachment) -> Self {
        Self::DiskBlock(attachment)
    }
}

impl From<NetworkBlockAttachment> for StorageAttachment {
    fn from(attachment: NetworkBlockAttachment) -> Self {
        Self::NetworkBlock(attachment)
    }
}

impl From<DiskImageAttachment> for StorageAttachment {
    fn from(attachment: DiskImageAttachment) -> Self {
        Self::DiskImage(attachment)
    }
}

/// NVM Express controller wrapping one attachment.
#[derive(Debug, Clone)]
pub struct NvmeControllerConfig {
    attachment: StorageAttachment,
}

impl NvmeControllerConfig {
    /// Wrap an already validated attachment.
    pub fn new(attachment: impl Into<StorageAttachment>) -> Self {
        Self {
            attachment: attachment.into(),
        }
    }

    pub fn attachment(&self) -> &StorageAttachment {
        &self.attachment
    }
}

/// Virtio block device wrapping one attachment.
#[derive(Debug, Clone)]
pub struct VirtioBlockConfig {
    attachment: StorageAttachment,
    identifier: Option<String>,
}

impl VirtioBlockConfig {
    pub fn new(attachment: impl Into<StorageAttachment>) -> Self {
        Self {
            attachment: attachment.into(),
            identifier: None,
        }
    }

    /// Set the identifier the guest reads with `VIRTIO_BLK_T_GET_ID`.
    ///
    /// # Errors
    /// `InvalidIdentifier` unless the identifier is ASCII and at most 20 bytes.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Result<Self, ValidationError> {
        let identifier = identifier.into();
        if !identifier.is_ascii() || identifier.len() > MAX_BLOCK_DEVICE_IDENTIFIER_LEN {
            return Err(ValidationError::InvalidIdentifier(identifier));
        }
        self.identifier = Some(identifier);
        Ok(self)
    }

    pub fn attachment(&self) -> &StorageAttachment {
        &self.attachment
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }
}

/// USB mass storage device wrapping one attachment.
#[derive(Debug, Clone)]
pub struct UsbMassStorageConfig {
    attachment: StorageAttachment,
}

impl UsbMassStorageConfig {
    pub fn new(attachment: impl Into<StorageAttachment>) -> Self {
        Self {
            attachment: attachment.into(),
        }
    }

    pub fn attachment(&self) -> &StorageAttachment {
        &self.attachment
    }
}

/// A storage device as the guest sees it.
#[derive(Debug, Clone)]
pub enum StorageDeviceConfig {
    Nvme(NvmeControllerConfig),
    VirtioBlock(VirtioBlockConfig),
    UsbMassStorage(UsbMassStorageConfig),
}

impl StorageDeviceConfig {
    pub fn attachment(&self) -> &StorageAttachment {
        match self {
            Self::Nvme(c) => c.attachment(),
            Self::VirtioBlock(c) => c.attachment(),
            Self::UsbMassStorage(c) => c.attachment(),
        }
    }
}

impl From<NvmeControllerConfig> for StorageDeviceConfig {
    fn from(config: NvmeControllerConfig) -> Self {
        Self::Nvme(config)
    }
}

impl From<VirtioBlockConfig> for StorageDeviceConfig {
    fn from(config: VirtioBlockConfig) -> Self {
        Self::VirtioBlock(config)
    }
}

impl From<UsbMassStorageConfig> for StorageDeviceConfig {
    fn from(config: UsbMassStorageConfig) -> Self {
        Self::UsbMassStorage(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    fn scratch_file(writable: bool) -> (tempfile::NamedTempFile, std::fs::File) {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(temp.path())
            .unwrap();
        (temp, file)
    }

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("full".parse::<SyncMode>(), Ok(SyncMode::Full));
        assert_eq!("FSYNC".parse::<SyncMode>(), Ok(SyncMode::Fsync));
        assert_eq!("none".parse::<SyncMode>(), Ok(SyncMode::None));
        assert!(matches!(
            "eventually".parse::<SyncMode>(),
            Err(ValidationError::InvalidSyncMode(_))
        ));
    }

    #[test]
    fn test_sync_mode_raw_encodings() {
        assert_eq!(SyncMode::from_block_raw(0), Ok(SyncMode::Full));
        assert_eq!(SyncMode::from_block_raw(1), Ok(SyncMode::None));
        assert!(SyncMode::from_block_raw(2).is_err());

        assert_eq!(SyncMode::from_image_raw(2), Ok(SyncMode::Fsync));
        assert!(matches!(
            SyncMode::from_image_raw(0),
            Err(ValidationError::InvalidSyncMode(_))
        ));
    }

    #[test]
    fn test_disk_block_read_only() {
        let (_temp, file) = scratch_file(false);
        let disk = DiskBlockAttachment::new(file.as_raw_fd(), true, SyncMode::None)
            .expect("read-only descriptor should be accepted");
        assert!(disk.read_only());
        assert_eq!(disk.sync_mode(), SyncMode::None);
    }

    #[test]
    fn test_disk_block_outlives_caller_descriptor() {
        let (_temp, file) = scratch_file(true);
        let disk = DiskBlockAttachment::new(file.as_raw_fd(), false, SyncMode::Full).unwrap();
        let raw = file.as_raw_fd();
        drop(file);

        assert_ne!(disk.fd(), raw);
        assert!(fcntl(disk.fd(), FcntlArg::F_GETFL).is_ok());

        let copy = disk.clone();
        assert_eq!(copy.as_raw_fd(), disk.fd());
        drop(disk);
        assert!(fcntl(copy.fd(), FcntlArg::F_GETFL).is_ok());
    }

    #[test]
    fn test_disk_block_invalid_descriptor() {
        let err = DiskBlockAttachment::new(-1, true, SyncMode::None).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_disk_block_writable_needs_writable_descriptor() {
        let (_temp, file) = scratch_file(false);
        let err = DiskBlockAttachment::new(file.as_raw_fd(), false, SyncMode::Full).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_disk_block_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let handle = std::fs::File::open(dir.path()).unwrap();
        let err = DiskBlockAttachment::new(handle.as_raw_fd(), true, SyncMode::None).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_disk_block_rejects_fsync() {
        let (_temp, file) = scratch_file(false);
        let err = DiskBlockAttachment::new(file.as_raw_fd(), true, SyncMode::Fsync).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSyncMode(_)));
    }

    #[test]
    fn test_network_block_valid_urls() {
        let bridge = AttachmentBridge::new();
        let mut attachments = Vec::new();
        for url in [
            "nbd://localhost:10809/export",
            "nbds://storage.example.com/disk0",
            "nbd+unix:///export?socket=/var/run/nbd.sock",
        ] {
            let (nbd, events) = NetworkBlockAttachment::new(&bridge, url, 5.0, false, SyncMode::Full)
                .unwrap_or_else(|e| panic!("{url} rejected: {e}"));
            assert_eq!(events.handle(), nbd.handle());
            assert_eq!(nbd.timeout(), Duration::from_secs(5));
            attachments.push(nbd);
        }
        assert_eq!(bridge.live_attachments(), 3);

        drop(attachments);
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_network_block_invalid_urls() {
        let bridge = AttachmentBridge::new();
        for url in [
            "not a url",
            "http://localhost/export",
            "nbd+unix:///export",
        ] {
            let err = NetworkBlockAttachment::new(&bridge, url, 5.0, false, SyncMode::Full)
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidUrl(_)), "{url}: {err}");
        }
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_network_block_invalid_timeout() {
        let bridge = AttachmentBridge::new();
        for timeout in [-1.0, 0.0, f64::NAN, f64::INFINITY, 1e20] {
            let err = NetworkBlockAttachment::new(
                &bridge,
                "nbd://localhost/export",
                timeout,
                true,
                SyncMode::None,
            )
            .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidTimeout(_)));
        }
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_network_block_released_with_last_clone() {
        let bridge = AttachmentBridge::new();
        let (nbd, mut events) =
            NetworkBlockAttachment::new(&bridge, "nbd://localhost/export", 1.0, false, SyncMode::Full)
                .unwrap();
        let handle = nbd.handle();
        let device: StorageDeviceConfig = NvmeControllerConfig::new(nbd.clone()).into();

        drop(nbd);
        assert_eq!(bridge.live_attachments(), 1);

        drop(device);
        assert_eq!(bridge.live_attachments(), 0);
        bridge.on_connected(handle);
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_network_block_rejects_fsync() {
        let bridge = AttachmentBridge::new();
        let err = NetworkBlockAttachment::new(
            &bridge,
            "nbd://localhost/export",
            1.0,
            false,
            SyncMode::Fsync,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSyncMode(_)));
        assert_eq!(bridge.live_attachments(), 0);
    }

    #[test]
    fn test_disk_image_requires_existing_path() {
        let err = DiskImageAttachment::new(
            "/nonexistent/disk.img",
            false,
            CachingMode::Automatic,
            SyncMode::Fsync,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::MissingDiskImage(_)));

        let temp = tempfile::NamedTempFile::new().unwrap();
        let image =
            DiskImageAttachment::new(temp.path(), true, CachingMode::Cached, SyncMode::Fsync)
                .unwrap();
        assert_eq!(image.sync_mode(), SyncMode::Fsync);
        assert_eq!(image.caching_mode(), CachingMode::Cached);
    }

    #[test]
    fn test_nvme_wraps_attachment() {
        let bridge = AttachmentBridge::new();
        let (nbd, _events) =
            NetworkBlockAttachment::new(&bridge, "nbd://localhost/export", 1.0, true, SyncMode::Full)
                .unwrap();
        let handle = nbd.handle();

        let device: StorageDeviceConfig = NvmeControllerConfig::new(nbd).into();
        assert_eq!(device.attachment().event_handle(), Some(handle));
        assert!(device.attachment().read_only());
    }

    #[test]
    fn test_virtio_block_identifier() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let image =
            DiskImageAttachment::new(temp.path(), false, CachingMode::default(), SyncMode::Full)
                .unwrap();

        let config = VirtioBlockConfig::new(image.clone())
            .with_identifier("boot-disk")
            .unwrap();
        assert_eq!(config.identifier(), Some("boot-disk"));

        let err = VirtioBlockConfig::new(image.clone())
            .with_identifier("a-very-long-identifier-string")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier(_)));

        assert!(VirtioBlockConfig::new(image).with_identifier("diskü").is_err());
    }
}
