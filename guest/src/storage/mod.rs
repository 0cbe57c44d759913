//! Storage attachment.
//!
//! One backend per resource kind, all behind the [`Storage`] trait:
//! - SCSI: virtual disks found through sysfs by (controller, lun)
//! - PMEM: persistent memory devices, optionally dm-verity protected
//! - 9p: host directory shares served over a transport port
//! - Loopback: image files attached to loop devices
//! - Overlay: union of already-mounted layers

mod loopback;
mod mount;
mod overlay;
mod plan9;
mod pmem;
mod scsi;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gcs_shared::constants::devices::{DEV_ROOT, SYSFS_ROOT};
use gcs_shared::constants::retry;
use gcs_shared::{GcsResult, Transport};
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;

pub use overlay::overlay_options;

/// A SCSI disk attached by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiDisk {
    pub controller: u8,
    pub lun: u8,
    pub read_only: bool,
}

/// A 9p share served by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan9Share {
    pub share_name: String,
    pub port: u32,
    pub read_only: bool,
}

/// An overlay mount. Without an upper directory the mount is read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    /// Lower layers, topmost first
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub target: PathBuf,
}

impl OverlaySpec {
    pub fn read_only(&self) -> bool {
        self.upper_dir.is_none()
    }
}

/// An image file to expose through `/dev/loop{device_number}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackImage {
    pub device_number: u32,
    pub backing_file: PathBuf,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Device node of the SCSI disk at (controller, lun).
    async fn resolve_scsi(&self, controller: u8, lun: u8) -> GcsResult<PathBuf>;

    /// Mount a SCSI disk at `mount_path`. Returns the device mounted.
    async fn mount_scsi(&self, mount_path: &Path, disk: &ScsiDisk) -> GcsResult<PathBuf>;

    /// Ask the kernel to detach the SCSI disk at (controller, lun).
    async fn unplug_scsi(&self, controller: u8, lun: u8) -> GcsResult<()>;

    /// Mount `/dev/pmem{device_number}` read-only. Returns the device mounted.
    async fn mount_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<PathBuf>;

    /// Unmount a PMEM device and release any verity mapping built for it.
    async fn remove_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<()>;

    async fn mount_plan9(&self, mount_path: &Path, share: &Plan9Share) -> GcsResult<()>;

    async fn mount_overlay(&self, overlay: &OverlaySpec) -> GcsResult<()>;

    /// Attach and mount an image file. Returns the loop device mounted.
    async fn mount_loopback(&self, mount_path: &Path, image: &LoopbackImage) -> GcsResult<PathBuf>;

    /// Detach the backing file and release the loop device.
    async fn teardown_loopback(&self, device_number: u32) -> GcsResult<()>;

    /// Unmount `path` if it exists, optionally removing the directory.
    async fn unmount(&self, path: &Path, remove_dir: bool) -> GcsResult<()>;
}

/// Storage backends for a Linux guest.
#[derive(Debug, Clone)]
pub struct LinuxStorage {
    transport: Transport,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    verity: bool,
    scsi_retry: RetryPolicy,
    loop_retry: RetryPolicy,
    cancel: CancellationToken,
}

impl LinuxStorage {
    /// `transport` is used to reach 9p servers on the host.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            sysfs_root: PathBuf::from(SYSFS_ROOT),
            dev_root: PathBuf::from(DEV_ROOT),
            verity: true,
            scsi_retry: RetryPolicy::new(retry::SCSI_ATTEMPTS, retry::SCSI_DELAY),
            loop_retry: RetryPolicy::new(retry::LOOP_ATTEMPTS, retry::LOOP_DELAY),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_dev_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dev_root = root.into();
        self
    }

    /// Build a dm-verity hash tree for PMEM devices before mounting them.
    pub fn with_verity(mut self, verity: bool) -> Self {
        self.verity = verity;
        self
    }

    pub fn with_scsi_retry(mut self, policy: RetryPolicy) -> Self {
        self.scsi_retry = policy;
        self
    }

    /// Token that aborts in-flight retries, e.g. on agent shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Storage for LinuxStorage {
    async fn resolve_scsi(&self, controller: u8, lun: u8) -> GcsResult<PathBuf> {
        self.scsi_device(controller, lun).await
    }

    async fn mount_scsi(&self, mount_path: &Path, disk: &ScsiDisk) -> GcsResult<PathBuf> {
        self.mount_scsi_disk(mount_path, disk).await
    }

    async fn unplug_scsi(&self, controller: u8, lun: u8) -> GcsResult<()> {
        self.unplug_scsi_disk(controller, lun).await
    }

    async fn mount_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<PathBuf> {
        self.mount_pmem_device(mount_path, device_number).await
    }

    async fn remove_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<()> {
        self.remove_pmem_device(mount_path, device_number).await
    }

    async fn mount_plan9(&self, mount_path: &Path, share: &Plan9Share) -> GcsResult<()> {
        self.mount_plan9_share(mount_path, share).await
    }

    async fn mount_overlay(&self, spec: &OverlaySpec) -> GcsResult<()> {
        overlay::mount_overlay(spec)
    }

    async fn mount_loopback(&self, mount_path: &Path, image: &LoopbackImage) -> GcsResult<PathBuf> {
        self.mount_loopback_image(mount_path, image).await
    }

    async fn teardown_loopback(&self, device_number: u32) -> GcsResult<()> {
        self.teardown_loop_device(device_number).await
    }

    async fn unmount(&self, path: &Path, remove_dir: bool) -> GcsResult<()> {
        mount::unmount_path(path, remove_dir)
    }
}
