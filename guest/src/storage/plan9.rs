//! 9p directory shares.
//!
//! The agent connects to the host's 9p server and hands the connected
//! socket to the kernel with `trans=fd`.

use std::os::fd::AsRawFd;
use std::path::Path;

use gcs_shared::constants::mount::{OPT_NOLOAD, PLAN9_FS_TYPE, PLAN9_MSIZE};
use gcs_shared::{GcsError, GcsResult};
use nix::mount::MsFlags;
use tracing::info;

use super::mount::{create_dir, discard_dir, mount_fs};
use super::{LinuxStorage, Plan9Share};
use crate::stdio::dial;

/// Mount data for a 9p share carried over `fd`.
pub(super) fn plan9_options(fd: i32, share: &Plan9Share) -> String {
    let mut data = format!("trans=fd,rfdno={fd},wfdno={fd},msize={}", PLAN9_MSIZE);
    if share.read_only {
        data.push(',');
        data.push_str(OPT_NOLOAD);
    }
    if !share.share_name.is_empty() {
        data.push_str(",aname=");
        data.push_str(&share.share_name);
    }
    data
}

impl LinuxStorage {
    pub(super) async fn mount_plan9_share(
        &self,
        mount_path: &Path,
        share: &Plan9Share,
    ) -> GcsResult<()> {
        create_dir(mount_path)?;

        let endpoint = self
            .transport
            .with_port(share.port)
            .map_err(GcsError::InvalidRequest)?;
        let conn = match dial(&endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                discard_dir(mount_path);
                return Err(GcsError::storage(
                    format!(
                        "could not connect to plan9 server for {}",
                        mount_path.display()
                    ),
                    e,
                ));
            }
        };

        let flags = if share.read_only {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        };
        let data = plan9_options(conn.as_raw_fd(), share);

        // The kernel holds its own reference to the socket once mounted.
        let result = mount_fs(mount_path, mount_path, PLAN9_FS_TYPE, flags, &data);
        drop(conn);
        if let Err(e) = result {
            discard_dir(mount_path);
            return Err(e);
        }

        info!(
            share = %share.share_name,
            port = share.port,
            mount_path = %mount_path.display(),
            "mounted 9p share"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan9_options() {
        let share = Plan9Share {
            share_name: "share".into(),
            port: 564,
            read_only: true,
        };
        assert_eq!(
            plan9_options(7, &share),
            "trans=fd,rfdno=7,wfdno=7,msize=65536,noload,aname=share"
        );

        let share = Plan9Share {
            share_name: String::new(),
            port: 564,
            read_only: false,
        };
        assert_eq!(plan9_options(3, &share), "trans=fd,rfdno=3,wfdno=3,msize=65536");
    }
}
