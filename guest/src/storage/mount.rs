//! Mount syscall helpers shared by the backends.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use gcs_shared::{GcsError, GcsResult};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

/// Create `path` and its parents with mode 0700.
pub(super) fn create_dir(path: &Path) -> GcsResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| GcsError::storage(format!("failed to create directory {}", path.display()), e))
}

pub(super) fn mount_fs(
    source: &Path,
    target: &Path,
    fs_type: &str,
    flags: MsFlags,
    data: &str,
) -> GcsResult<()> {
    let data = (!data.is_empty()).then_some(data);
    mount(Some(source), target, Some(fs_type), flags, data).map_err(|e| {
        GcsError::storage(
            format!(
                "failed to mount {} ({}) at {}",
                source.display(),
                fs_type,
                target.display()
            ),
            e,
        )
    })?;
    debug!(
        source = %source.display(),
        target = %target.display(),
        fs_type,
        "mounted"
    );
    Ok(())
}

/// `mount_fs`, retried while the device settles.
pub(super) async fn mount_fs_with_retry(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    source: &Path,
    target: &Path,
    fs_type: &str,
    flags: MsFlags,
    data: &str,
) -> GcsResult<()> {
    policy
        .run(Some(cancel), || async {
            mount_fs(source, target, fs_type, flags, data)
        })
        .await
}

/// Unmount `path`. A missing path or one that is not a mount point is
/// not an error.
pub(crate) fn unmount_path(path: &Path, remove_dir: bool) -> GcsResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(GcsError::storage(
                format!("failed to stat {}", path.display()),
                e,
            ))
        }
    }

    match umount2(path, MntFlags::empty()) {
        Ok(()) => debug!(path = %path.display(), "unmounted"),
        Err(Errno::EINVAL) => debug!(path = %path.display(), "not a mount point"),
        Err(e) => {
            return Err(GcsError::storage(
                format!("failed to unmount {}", path.display()),
                e,
            ))
        }
    }

    if remove_dir {
        std::fs::remove_dir_all(path).map_err(|e| {
            GcsError::storage(format!("failed to remove {}", path.display()), e)
        })?;
    }
    Ok(())
}

/// Remove a mount point created for a mount that then failed.
pub(super) fn discard_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "failed to remove mount point");
    }
}
