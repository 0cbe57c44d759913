//! Overlayfs mounting.

use std::path::Path;

use gcs_shared::constants::mount::OVERLAY_FS_TYPE;
use gcs_shared::{GcsError, GcsResult};
use nix::mount::MsFlags;

use super::mount::{create_dir, mount_fs};
use super::OverlaySpec;

/// Mount data for `spec`.
///
/// Layers keep their request order: overlayfs lowerdir is
/// topmost:...:bottommost and so is the layer list.
pub fn overlay_options(spec: &OverlaySpec) -> String {
    let lowerdir = spec
        .lower_dirs
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":");

    let mut data = format!("lowerdir={}", lowerdir);
    if let (Some(upper), Some(work)) = (&spec.upper_dir, &spec.work_dir) {
        data.push_str(&format!(
            ",upperdir={},workdir={}",
            upper.display(),
            work.display()
        ));
    }
    data
}

pub(super) fn mount_overlay(spec: &OverlaySpec) -> GcsResult<()> {
    if spec.lower_dirs.is_empty() {
        return Err(GcsError::InvalidRequest(
            "cannot mount overlayfs with no lower directories".into(),
        ));
    }
    if spec.upper_dir.is_some() != spec.work_dir.is_some() {
        return Err(GcsError::InvalidRequest(
            "overlayfs upper and work directories must be given together".into(),
        ));
    }

    if let Some(upper) = &spec.upper_dir {
        create_dir(upper)?;
    }
    if let Some(work) = &spec.work_dir {
        create_dir(work)?;
    }
    create_dir(&spec.target)?;

    let flags = if spec.read_only() {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };

    tracing::info!(
        target = %spec.target.display(),
        layers = spec.lower_dirs.len(),
        read_only = spec.read_only(),
        "mounting overlayfs"
    );
    mount_fs(
        Path::new(OVERLAY_FS_TYPE),
        &spec.target,
        OVERLAY_FS_TYPE,
        flags,
        &overlay_options(spec),
    )
}
