//! In-guest container agent.
//!
//! [`host::Host`] keeps the registry of containers and their processes,
//! broadcasts process exits to any number of waiters, and attaches host
//! provided storage (SCSI, PMEM, 9p shares, loop devices, overlays).

#[cfg(not(target_os = "linux"))]
compile_error!("the GCS guest agent is Linux-only; build with a Linux target");

#[cfg(target_os = "linux")]
pub mod container;
#[cfg(target_os = "linux")]
pub mod host;
#[cfg(target_os = "linux")]
pub mod relay;
#[cfg(target_os = "linux")]
pub mod retry;
#[cfg(target_os = "linux")]
pub mod runtime;
#[cfg(target_os = "linux")]
pub mod stdio;
#[cfg(target_os = "linux")]
pub mod storage;
#[cfg(target_os = "linux")]
pub mod sync;
