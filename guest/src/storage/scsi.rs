//! SCSI virtual disks.

use std::io;
use std::path::{Path, PathBuf};

use gcs_shared::constants::devices::SCSI_DEVICES_DIR;
use gcs_shared::constants::mount::{DEFAULT_FS_TYPE, OPT_NOLOAD};
use gcs_shared::{GcsError, GcsResult};
use nix::mount::MsFlags;
use tracing::info;

use super::mount::{create_dir, mount_fs_with_retry};
use super::{LinuxStorage, ScsiDisk};

fn scsi_id(controller: u8, lun: u8) -> String {
    format!("0:0:{}:{}", controller, lun)
}

impl LinuxStorage {
    fn scsi_device_dir(&self, controller: u8, lun: u8) -> PathBuf {
        self.sysfs_root
            .join(SCSI_DEVICES_DIR)
            .join(scsi_id(controller, lun))
    }

    /// Wait for the kernel to publish the block device for (controller, lun).
    pub(super) async fn scsi_device(&self, controller: u8, lun: u8) -> GcsResult<PathBuf> {
        let block_dir = self.scsi_device_dir(controller, lun).join("block");

        let name = self
            .scsi_retry
            .run(Some(&self.cancel), || async { block_device_name(&block_dir) })
            .await
            .map_err(|e| {
                GcsError::storage(
                    format!(
                        "failed to find block device for SCSI {}",
                        scsi_id(controller, lun)
                    ),
                    e,
                )
            })?;
        Ok(self.dev_root.join(name))
    }

    pub(super) async fn mount_scsi_disk(
        &self,
        mount_path: &Path,
        disk: &ScsiDisk,
    ) -> GcsResult<PathBuf> {
        let device = self.scsi_device(disk.controller, disk.lun).await?;
        create_dir(mount_path)?;

        let (flags, data) = if disk.read_only {
            (MsFlags::MS_RDONLY, OPT_NOLOAD)
        } else {
            (MsFlags::empty(), "")
        };
        mount_fs_with_retry(
            &self.scsi_retry,
            &self.cancel,
            &device,
            mount_path,
            DEFAULT_FS_TYPE,
            flags,
            data,
        )
        .await?;

        info!(
            scsi = %scsi_id(disk.controller, disk.lun),
            device = %device.display(),
            mount_path = %mount_path.display(),
            read_only = disk.read_only,
            "mounted SCSI disk"
        );
        Ok(device)
    }

    pub(super) async fn unplug_scsi_disk(&self, controller: u8, lun: u8) -> GcsResult<()> {
        let delete = self.scsi_device_dir(controller, lun).join("delete");
        tokio::fs::write(&delete, b"1").await.map_err(|e| {
            GcsError::storage(
                format!("failed to unplug SCSI {}", scsi_id(controller, lun)),
                e,
            )
        })?;
        info!(scsi = %scsi_id(controller, lun), "unplugged SCSI disk");
        Ok(())
    }
}

/// The single entry of a sysfs `block` directory.
fn block_device_name(block_dir: &Path) -> io::Result<String> {
    let mut names = match std::fs::read_dir(block_dir) {
        Ok(entries) => entries
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };

    match names.len() {
        0 => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no block device under {}", block_dir.display()),
        )),
        1 => Ok(names.remove(0)),
        _ => Err(io::Error::other(format!(
            "more than one block device under {}",
            block_dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use gcs_shared::Transport;
    use std::time::Duration;

    fn storage(sysfs: &Path) -> LinuxStorage {
        LinuxStorage::new(Transport::vsock(0))
            .with_sysfs_root(sysfs)
            .with_dev_root("/dev")
            .with_scsi_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_resolves_device_from_sysfs() {
        let sysfs = tempfile::tempdir().unwrap();
        let block = sysfs.path().join("bus/scsi/devices/0:0:0:2/block/sdc");
        std::fs::create_dir_all(&block).unwrap();

        let device = storage(sysfs.path()).scsi_device(0, 2).await.unwrap();
        assert_eq!(device, PathBuf::from("/dev/sdc"));
    }

    #[tokio::test]
    async fn test_missing_device_times_out() {
        let sysfs = tempfile::tempdir().unwrap();
        let err = storage(sysfs.path()).scsi_device(1, 4).await.unwrap_err();
        assert!(err.to_string().contains("SCSI 0:0:1:4"));
    }

    #[tokio::test]
    async fn test_ambiguous_device_is_rejected() {
        let sysfs = tempfile::tempdir().unwrap();
        let block = sysfs.path().join("bus/scsi/devices/0:0:0:1/block");
        std::fs::create_dir_all(block.join("sda")).unwrap();
        std::fs::create_dir_all(block.join("sdb")).unwrap();

        let err = storage(sysfs.path()).scsi_device(0, 1).await.unwrap_err();
        assert!(err.to_string().contains("more than one block device"));
    }

    #[tokio::test]
    async fn test_unplug_writes_delete() {
        let sysfs = tempfile::tempdir().unwrap();
        let dev = sysfs.path().join("bus/scsi/devices/0:0:3:0");
        std::fs::create_dir_all(&dev).unwrap();

        storage(sysfs.path()).unplug_scsi_disk(3, 0).await.unwrap();
        assert_eq!(std::fs::read_to_string(dev.join("delete")).unwrap(), "1");
    }
}
