//! Loop-device backed image files.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use gcs_shared::constants::devices::{LOOP_CONTROL, LOOP_PREFIX};
use gcs_shared::constants::mount::{DEFAULT_FS_TYPE, OPT_NOLOAD};
use gcs_shared::{GcsError, GcsResult};
use nix::libc;
use nix::mount::MsFlags;
use tracing::{debug, error, info};

use super::mount::{create_dir, discard_dir, mount_fs};
use super::{LinuxStorage, LoopbackImage};

// Every loop request takes an integer argument, never a pointer.
nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
nix::ioctl_write_int_bad!(loop_clr_fd, 0x4C01);
nix::ioctl_write_int_bad!(loop_ctl_add, 0x4C80);
nix::ioctl_write_int_bad!(loop_ctl_remove, 0x4C81);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopRequest {
    SetFd,
    ClearFd,
    ControlAdd,
    ControlRemove,
}

fn loop_ioctl(file: &File, request: LoopRequest, arg: libc::c_int) -> io::Result<libc::c_int> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is open for the lifetime of `file` and each request
    // reads only its integer argument.
    let ret = unsafe {
        match request {
            LoopRequest::SetFd => loop_set_fd(fd, arg),
            LoopRequest::ClearFd => loop_clr_fd(fd, arg),
            LoopRequest::ControlAdd => loop_ctl_add(fd, arg),
            LoopRequest::ControlRemove => loop_ctl_remove(fd, arg),
        }
    };
    ret.map_err(io::Error::from)
}

fn device_arg(device_number: u32) -> GcsResult<libc::c_int> {
    libc::c_int::try_from(device_number).map_err(|_| {
        GcsError::InvalidRequest(format!("loop device number {} is out of range", device_number))
    })
}

impl LinuxStorage {
    fn loop_device(&self, device_number: u32) -> PathBuf {
        self.dev_root
            .join(format!("{}{}", LOOP_PREFIX, device_number))
    }

    async fn open_with_retry(&self, path: &Path, write: bool) -> GcsResult<File> {
        self.loop_retry
            .run(Some(&self.cancel), || async {
                OpenOptions::new().read(true).write(write).open(path)
            })
            .await
            .map_err(|e| GcsError::storage(format!("failed to open {}", path.display()), e))
    }

    async fn ioctl_with_retry(
        &self,
        file: &File,
        request: LoopRequest,
        arg: libc::c_int,
        what: &str,
    ) -> GcsResult<libc::c_int> {
        self.loop_retry
            .run(Some(&self.cancel), || async { loop_ioctl(file, request, arg) })
            .await
            .map_err(|e| GcsError::storage(what.to_string(), e))
    }

    pub(super) async fn mount_loopback_image(
        &self,
        mount_path: &Path,
        image: &LoopbackImage,
    ) -> GcsResult<PathBuf> {
        create_dir(mount_path)?;
        match self.attach_and_mount(mount_path, image).await {
            Ok(device) => {
                info!(
                    device = %device.display(),
                    backing_file = %image.backing_file.display(),
                    mount_path = %mount_path.display(),
                    "mounted loopback image"
                );
                Ok(device)
            }
            Err(e) => {
                discard_dir(mount_path);
                Err(e)
            }
        }
    }

    async fn attach_and_mount(&self, mount_path: &Path, image: &LoopbackImage) -> GcsResult<PathBuf> {
        let device = self.loop_device(image.device_number);
        let number = device_arg(image.device_number)?;

        if !device.exists() {
            let control = self
                .open_with_retry(&self.dev_root.join(LOOP_CONTROL), true)
                .await?;
            match loop_ioctl(&control, LoopRequest::ControlAdd, number) {
                Ok(_) => debug!(device = %device.display(), "allocated loop device"),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {}
                Err(e) => {
                    return Err(GcsError::storage(
                        format!("failed to provision loop device {}", device.display()),
                        e,
                    ))
                }
            }
        }

        let backing = self.open_with_retry(&image.backing_file, false).await?;
        let loop_file = self.open_with_retry(&device, false).await?;
        self.ioctl_with_retry(
            &loop_file,
            LoopRequest::SetFd,
            backing.as_raw_fd(),
            &format!(
                "failed to pair {} with {}",
                image.backing_file.display(),
                device.display()
            ),
        )
        .await?;

        mount_fs(&device, mount_path, DEFAULT_FS_TYPE, MsFlags::MS_RDONLY, OPT_NOLOAD)?;
        Ok(device)
    }

    pub(super) async fn teardown_loop_device(&self, device_number: u32) -> GcsResult<()> {
        let device = self.loop_device(device_number);
        let number = device_arg(device_number)?;

        let loop_file = self.open_with_retry(&device, false).await?;
        self.ioctl_with_retry(
            &loop_file,
            LoopRequest::ClearFd,
            0,
            &format!("failed to clear backing file of {}", device.display()),
        )
        .await?;
        drop(loop_file);

        let control = self
            .open_with_retry(&self.dev_root.join(LOOP_CONTROL), true)
            .await?;
        match loop_ioctl(&control, LoopRequest::ControlRemove, number) {
            Ok(_) => debug!(device = %device.display(), "removed loop device"),
            // Still referenced elsewhere; the backing file is already released.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                error!(device = %device.display(), "loop device is busy")
            }
            Err(e) => {
                return Err(GcsError::storage(
                    format!("failed to remove loop device {}", device.display()),
                    e,
                ))
            }
        }
        Ok(())
    }
}
