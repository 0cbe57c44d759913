//! Shared constants between host and guest
//!
//! These constants must be identical on both sides of the host-guest boundary.

/// Agent transport constants
pub mod network {
    /// CID of the host as seen from inside the guest.
    pub const VMADDR_CID_HOST: u32 = 2;
}

/// Mount options used by the storage backends
pub mod mount {
    /// Filesystem type of SCSI, PMEM and loopback disks.
    pub const DEFAULT_FS_TYPE: &str = "ext4";

    /// Skip journal replay on read-only ext4 mounts.
    pub const OPT_NOLOAD: &str = "noload";

    /// Direct access for persistent memory.
    pub const OPT_DAX: &str = "dax";

    pub const OVERLAY_FS_TYPE: &str = "overlay";

    pub const PLAN9_FS_TYPE: &str = "9p";

    /// Payload size negotiated with the 9p server.
    pub const PLAN9_MSIZE: u32 = 65536;
}

/// Device and sysfs paths
pub mod devices {
    pub const SYSFS_ROOT: &str = "/sys";

    pub const DEV_ROOT: &str = "/dev";

    /// SCSI devices live under `{sysfs}/bus/scsi/devices/0:0:{controller}:{lun}`.
    pub const SCSI_DEVICES_DIR: &str = "bus/scsi/devices";

    pub const PMEM_PREFIX: &str = "pmem";

    pub const LOOP_PREFIX: &str = "loop";

    pub const LOOP_CONTROL: &str = "loop-control";

    /// dm-verity devices are mapped under `/dev/mapper/verity{n}`.
    pub const VERITY_PREFIX: &str = "verity";

    pub const DEVICE_MAPPER_DIR: &str = "mapper";

    /// Hash trees for verity-protected PMEM devices are written here.
    pub const VERITY_HASH_DIR: &str = "/tmp";
}

/// Bounded retry parameters for device discovery and mounting
pub mod retry {
    use std::time::Duration;

    /// SCSI discovery and mount: 200 x 10ms, a 2s ceiling.
    pub const SCSI_ATTEMPTS: u32 = 200;
    pub const SCSI_DELAY: Duration = Duration::from_millis(10);

    /// Loop device open/ioctl: 20 x 250ms, a 5s ceiling.
    pub const LOOP_ATTEMPTS: u32 = 20;
    pub const LOOP_DELAY: Duration = Duration::from_millis(250);
}

/// Process exit codes
pub mod exit {
    /// Recorded when the runtime fails to report a process's exit.
    pub const WAIT_FAILED: i32 = -1;

    /// Exit code offset for processes terminated by a signal.
    pub const SIGNAL_OFFSET: i32 = 128;
}
