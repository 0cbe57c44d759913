//! Persistent memory devices.
//!
//! With verity enabled the device is mapped through dm-verity before it
//! is mounted, so reads are checked against a hash tree built at attach
//! time.

use std::io;
use std::path::{Path, PathBuf};

use gcs_shared::constants::devices::{
    DEVICE_MAPPER_DIR, PMEM_PREFIX, VERITY_HASH_DIR, VERITY_PREFIX,
};
use gcs_shared::constants::mount::{DEFAULT_FS_TYPE, OPT_DAX, OPT_NOLOAD};
use gcs_shared::{GcsError, GcsResult};
use nix::mount::MsFlags;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::mount::{create_dir, discard_dir, mount_fs, unmount_path};
use super::LinuxStorage;

const ZERO_SALT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Block geometry of an ext4 filesystem as reported by `dumpe2fs -h`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct BlockGeometry {
    pub block_size: String,
    pub block_count: String,
}

impl LinuxStorage {
    pub(super) async fn mount_pmem_device(
        &self,
        mount_path: &Path,
        device_number: u32,
    ) -> GcsResult<PathBuf> {
        create_dir(mount_path)?;
        match self.mount_pmem_inner(mount_path, device_number).await {
            Ok(source) => {
                info!(
                    device = %source.display(),
                    mount_path = %mount_path.display(),
                    "mounted PMEM device"
                );
                Ok(source)
            }
            Err(e) => {
                discard_dir(mount_path);
                Err(e)
            }
        }
    }

    async fn mount_pmem_inner(&self, mount_path: &Path, device_number: u32) -> GcsResult<PathBuf> {
        let device = self
            .dev_root
            .join(format!("{}{}", PMEM_PREFIX, device_number));

        if !self.verity {
            let data = format!("{},{}", OPT_NOLOAD, OPT_DAX);
            mount_fs(&device, mount_path, DEFAULT_FS_TYPE, MsFlags::MS_RDONLY, &data)?;
            return Ok(device);
        }

        let source = self.map_verity(&device, device_number).await?;
        mount_fs(&source, mount_path, DEFAULT_FS_TYPE, MsFlags::MS_RDONLY, OPT_NOLOAD)?;
        Ok(source)
    }

    /// Build a hash tree for `device` and map it as `/dev/mapper/verity{n}`.
    async fn map_verity(&self, device: &Path, device_number: u32) -> GcsResult<PathBuf> {
        let device_arg = device.to_string_lossy().into_owned();

        let dump = run_tool("dumpe2fs", &["-h", &device_arg]).await?;
        let geometry = parse_block_geometry(&dump).ok_or_else(|| {
            GcsError::storage(
                format!("failed to read block geometry of {}", device.display()),
                io::Error::new(io::ErrorKind::InvalidData, "dumpe2fs output incomplete"),
            )
        })?;
        debug!(device = %device.display(), ?geometry, "read block geometry");

        let hash_file = hash_file(device_number);
        let hash_arg = hash_file.to_string_lossy().into_owned();
        let format = run_tool(
            "veritysetup",
            &[
                "format",
                &format!("--salt={}", ZERO_SALT),
                &format!("--data-block-size={}", geometry.block_size),
                &format!("--data-blocks={}", geometry.block_count),
                &device_arg,
                &hash_arg,
            ],
        )
        .await?;
        let root_hash = parse_root_hash(&format).ok_or_else(|| {
            GcsError::storage(
                format!("failed to build hash tree for {}", device.display()),
                io::Error::new(io::ErrorKind::InvalidData, "no root hash in veritysetup output"),
            )
        })?;

        let name = verity_name(device_number);
        run_tool("veritysetup", &["create", &name, &device_arg, &hash_arg, &root_hash]).await?;

        Ok(self.verity_device(device_number))
    }

    fn verity_device(&self, device_number: u32) -> PathBuf {
        self.dev_root
            .join(DEVICE_MAPPER_DIR)
            .join(verity_name(device_number))
    }

    /// Unmount a PMEM device and release its verity mapping, if any.
    ///
    /// The mapping is looked up by name rather than by the current verity
    /// setting so a mapping left by an earlier mount is released too.
    pub(super) async fn remove_pmem_device(
        &self,
        mount_path: &Path,
        device_number: u32,
    ) -> GcsResult<()> {
        if !mount_path.as_os_str().is_empty() {
            unmount_path(mount_path, true)?;
        }

        let mapping = self.verity_device(device_number);
        if mapping.exists() {
            let name = verity_name(device_number);
            run_tool("veritysetup", &["remove", &name]).await?;
            info!(mapping = %mapping.display(), "removed verity mapping");
        }

        let hash_file = hash_file(device_number);
        match std::fs::remove_file(&hash_file) {
            Ok(()) => debug!(hash_file = %hash_file.display(), "removed verity hash tree"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(hash_file = %hash_file.display(), error = %e, "failed to remove verity hash tree"),
        }
        Ok(())
    }
}

fn verity_name(device_number: u32) -> String {
    format!("{}{}", VERITY_PREFIX, device_number)
}

fn hash_file(device_number: u32) -> PathBuf {
    Path::new(VERITY_HASH_DIR).join(format!("hash{}", device_number))
}

async fn run_tool(program: &str, args: &[&str]) -> GcsResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| GcsError::storage(format!("failed to run {}", program), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GcsError::storage(
            format!("{} {} failed ({})", program, args.join(" "), output.status),
            io::Error::other(stderr.trim().to_string()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub(super) fn parse_block_geometry(dumpe2fs: &str) -> Option<BlockGeometry> {
    Some(BlockGeometry {
        block_size: field(dumpe2fs, "Block size:")?.to_string(),
        block_count: field(dumpe2fs, "Block count:")?.to_string(),
    })
}

pub(super) fn parse_root_hash(veritysetup: &str) -> Option<String> {
    field(veritysetup, "Root hash:").map(str::to_string)
}
