//! Resource add/remove dispatch.

use std::path::{Path, PathBuf};

use gcs_shared::layout::ScratchLayout;
use gcs_shared::settings::{
    BulkCombineLayers, CombinedLayers, LayerMount, LoopbackDisk, MappedDirectory,
    MappedVirtualDisk, MappedVpmemDevice,
};
use gcs_shared::{GcsError, GcsResult, ModifySettingRequest, RequestType, ResourceSettings, ResultExt};
use tracing::{debug, info, warn};

use super::Host;
use crate::storage::{LoopbackImage, OverlaySpec, Plan9Share, ScsiDisk};

/// Device behind one bulk-overlay mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerDevice {
    Scsi { controller: u8, lun: u8, read_only: bool },
    Pmem { device_number: u32 },
}

#[derive(Debug)]
struct MountedLayer {
    path: PathBuf,
    device: LayerDevice,
}

fn layer_device(layer: &LayerMount) -> GcsResult<LayerDevice> {
    if layer.mount_path.is_empty() {
        return Err(GcsError::InvalidRequest(
            "failed to mount layer with empty mount path".into(),
        ));
    }
    match (&layer.scsi, &layer.pmem) {
        (Some(scsi), None) => {
            if scsi.writable {
                return Err(GcsError::InvalidRequest(format!(
                    "SCSI layer {} must not be writable",
                    layer.mount_path
                )));
            }
            Ok(LayerDevice::Scsi {
                controller: scsi.controller,
                lun: scsi.lun,
                read_only: true,
            })
        }
        (None, Some(pmem)) => Ok(LayerDevice::Pmem {
            device_number: pmem.device_number,
        }),
        _ => Err(GcsError::InvalidRequest(format!(
            "layer {} must specify exactly one of Scsi or PMem",
            layer.mount_path
        ))),
    }
}

fn scratch_device(scratch: &LayerMount) -> GcsResult<LayerDevice> {
    if scratch.pmem.is_some() {
        return Err(GcsError::Unsupported(
            "failed to mount scratch, pmem mount not currently supported".into(),
        ));
    }
    let scsi = scratch.scsi.as_ref().ok_or_else(|| {
        GcsError::InvalidRequest("failed to mount scratch, no scsi mount provided".into())
    })?;
    Ok(LayerDevice::Scsi {
        controller: scsi.controller,
        lun: scsi.lun,
        read_only: !scsi.writable,
    })
}

impl Host {
    /// Apply one resource add/remove/update request.
    pub async fn modify_settings(&self, request: &ModifySettingRequest) -> GcsResult<()> {
        let kind = request.resource_type();
        let op = request.request_type;
        debug!(resource = %kind, request = %op, "modifying host settings");

        let result = match (&request.settings, op) {
            (ResourceSettings::MappedVirtualDisk(disk), RequestType::Add) => {
                self.add_virtual_disk(disk).await
            }
            (ResourceSettings::MappedVirtualDisk(disk), RequestType::Remove) => {
                self.remove_scsi(Path::new(&disk.mount_path), disk.controller, disk.lun)
                    .await
            }
            (ResourceSettings::MappedVpmemDevice(pmem), RequestType::Add) => {
                self.add_pmem(pmem).await
            }
            (ResourceSettings::MappedVpmemDevice(pmem), RequestType::Remove) => {
                self.storage
                    .remove_pmem(Path::new(&pmem.mount_path), pmem.device_number)
                    .await
            }
            (ResourceSettings::MappedDirectory(dir), RequestType::Add) => {
                self.add_directory(dir).await
            }
            (ResourceSettings::MappedDirectory(dir), RequestType::Remove) => {
                self.storage.unmount(Path::new(&dir.mount_path), true).await
            }
            (ResourceSettings::CombinedLayers(layers), RequestType::Add) => {
                self.combine_layers(layers).await
            }
            (ResourceSettings::CombinedLayers(layers), RequestType::Remove) => {
                self.storage
                    .unmount(Path::new(&layers.container_root_path), true)
                    .await
            }
            (ResourceSettings::BulkCombineLayers(bulk), RequestType::Add) => {
                self.bulk_combine_layers(bulk).await
            }
            (ResourceSettings::LoopbackDisk(disk), RequestType::Add) => {
                self.add_loopback(disk).await
            }
            (ResourceSettings::LoopbackDisk(disk), RequestType::Remove) => {
                self.remove_loopback(disk).await
            }
            (_, op) => Err(GcsError::Unsupported(format!(
                "the request type \"{}\" is not supported",
                op
            ))),
        };

        result.with_context(|| format!("failed to modify resource {} ({})", kind, op))
    }

    async fn add_virtual_disk(&self, disk: &MappedVirtualDisk) -> GcsResult<()> {
        if disk.mount_path.is_empty() {
            // Attach only; the disk is consumed by a later request.
            let device = self.storage.resolve_scsi(disk.controller, disk.lun).await?;
            info!(device = %device.display(), "SCSI disk attached without mount");
            return Ok(());
        }
        let scsi = ScsiDisk {
            controller: disk.controller,
            lun: disk.lun,
            read_only: disk.read_only,
        };
        self.storage
            .mount_scsi(Path::new(&disk.mount_path), &scsi)
            .await?;
        Ok(())
    }

    /// Unmount (when mounted) and detach a SCSI disk. Detach is attempted
    /// even when the unmount fails.
    async fn remove_scsi(&self, mount_path: &Path, controller: u8, lun: u8) -> GcsResult<()> {
        let mut errors = Vec::new();
        if !mount_path.as_os_str().is_empty() {
            if let Err(e) = self.storage.unmount(mount_path, true).await {
                errors.push(e);
            }
        }
        if let Err(e) = self.storage.unplug_scsi(controller, lun).await {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(GcsError::Multiple(errors)),
        }
    }

    async fn add_pmem(&self, pmem: &MappedVpmemDevice) -> GcsResult<()> {
        if pmem.mount_path.is_empty() {
            return Err(GcsError::InvalidRequest(
                "cannot mount PMEM device with empty mount path".into(),
            ));
        }
        self.storage
            .mount_pmem(Path::new(&pmem.mount_path), pmem.device_number)
            .await?;
        Ok(())
    }

    async fn add_directory(&self, dir: &MappedDirectory) -> GcsResult<()> {
        if dir.mount_path.is_empty() {
            return Err(GcsError::InvalidRequest(
                "cannot mount directory share with empty mount path".into(),
            ));
        }
        let share = Plan9Share {
            share_name: dir.share_name.clone(),
            port: dir.port,
            read_only: dir.read_only,
        };
        self.storage
            .mount_plan9(Path::new(&dir.mount_path), &share)
            .await
    }

    async fn combine_layers(&self, layers: &CombinedLayers) -> GcsResult<()> {
        if layers.container_root_path.is_empty() {
            return Err(GcsError::InvalidRequest(
                "cannot combine layers with empty container root path".into(),
            ));
        }

        let lower_dirs = layers.layers.iter().map(|l| PathBuf::from(&l.path)).collect();
        let scratch = (!layers.scratch_path.is_empty())
            .then(|| ScratchLayout::new(&layers.scratch_path));
        let spec = OverlaySpec {
            lower_dirs,
            upper_dir: scratch.as_ref().map(ScratchLayout::upper_dir),
            work_dir: scratch.as_ref().map(ScratchLayout::work_dir),
            target: PathBuf::from(&layers.container_root_path),
        };
        self.storage.mount_overlay(&spec).await
    }

    /// Mount every layer device, the scratch device and the overlay.
    ///
    /// On failure every device mounted by this call is torn down again,
    /// in reverse order. The rootfs itself was never mounted and is left
    /// alone.
    async fn bulk_combine_layers(&self, bulk: &BulkCombineLayers) -> GcsResult<()> {
        if bulk.rootfs_path.is_empty() {
            return Err(GcsError::InvalidRequest(
                "cannot bulk combine layers with empty rootfs".into(),
            ));
        }

        let mut plan = bulk
            .layers
            .iter()
            .map(|layer| {
                Ok(MountedLayer {
                    path: PathBuf::from(&layer.mount_path),
                    device: layer_device(layer)?,
                })
            })
            .collect::<GcsResult<Vec<_>>>()?;
        let lower_dirs = plan.iter().map(|l| l.path.clone()).collect();

        let scratch = if bulk.scratch.mount_path.is_empty() {
            None
        } else {
            let scratch = MountedLayer {
                path: PathBuf::from(&bulk.scratch.mount_path),
                device: scratch_device(&bulk.scratch)?,
            };
            plan.push(scratch);
            Some(ScratchLayout::new(&bulk.scratch.mount_path))
        };

        let mut mounted = Vec::with_capacity(plan.len());
        let result = self
            .mount_bulk(plan, &mut mounted, lower_dirs, scratch, &bulk.rootfs_path)
            .await;

        let Err(err) = result else {
            return Ok(());
        };
        if mounted.is_empty() {
            return Err(err);
        }

        let rolled_back = mounted.len();
        for layer in mounted.iter().rev() {
            if let Err(e) = self.remove_layer(layer).await {
                warn!(
                    path = %layer.path.display(),
                    error = %e,
                    "failed to roll back layer mount"
                );
            }
        }
        Err(GcsError::PartialFailure {
            message: format!(
                "bulk layer mount failed; rolled back {} mount(s)",
                rolled_back
            ),
            source: Box::new(err),
        })
    }

    async fn mount_bulk(
        &self,
        plan: Vec<MountedLayer>,
        mounted: &mut Vec<MountedLayer>,
        lower_dirs: Vec<PathBuf>,
        scratch: Option<ScratchLayout>,
        rootfs: &str,
    ) -> GcsResult<()> {
        for layer in plan {
            self.mount_layer(&layer).await?;
            mounted.push(layer);
        }

        let spec = OverlaySpec {
            lower_dirs,
            upper_dir: scratch.as_ref().map(ScratchLayout::upper_dir),
            work_dir: scratch.as_ref().map(ScratchLayout::work_dir),
            target: PathBuf::from(rootfs),
        };
        self.storage.mount_overlay(&spec).await
    }

    async fn mount_layer(&self, layer: &MountedLayer) -> GcsResult<()> {
        match layer.device {
            LayerDevice::Scsi {
                controller,
                lun,
                read_only,
            } => {
                let disk = ScsiDisk {
                    controller,
                    lun,
                    read_only,
                };
                self.storage.mount_scsi(&layer.path, &disk).await?;
            }
            LayerDevice::Pmem { device_number } => {
                self.storage.mount_pmem(&layer.path, device_number).await?;
            }
        }
        Ok(())
    }

    async fn remove_layer(&self, layer: &MountedLayer) -> GcsResult<()> {
        match layer.device {
            LayerDevice::Scsi {
                controller, lun, ..
            } => {
                self.remove_scsi(&layer.path, controller, lun).await
            }
            LayerDevice::Pmem { device_number } => {
                self.storage.remove_pmem(&layer.path, device_number).await
            }
        }
    }

    async fn add_loopback(&self, disk: &LoopbackDisk) -> GcsResult<()> {
        if disk.mount_path.is_empty() || disk.backing_file.is_empty() {
            return Err(GcsError::InvalidRequest(
                "loopback disk needs a mount path and a backing file".into(),
            ));
        }
        let image = LoopbackImage {
            device_number: disk.device_number,
            backing_file: PathBuf::from(&disk.backing_file),
        };
        self.storage
            .mount_loopback(Path::new(&disk.mount_path), &image)
            .await?;
        Ok(())
    }

    async fn remove_loopback(&self, disk: &LoopbackDisk) -> GcsResult<()> {
        self.storage
            .unmount(Path::new(&disk.mount_path), true)
            .await?;
        self.storage.teardown_loopback(disk.device_number).await
    }
}
