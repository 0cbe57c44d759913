//! Execution runtime interface.
//!
//! The host registry drives containers through these traits; the
//! libcontainer-backed implementation lives in [`crate::container`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gcs_shared::constants::exit::SIGNAL_OFFSET;
use gcs_shared::GcsResult;
use nix::sys::signal::Signal;
use oci_spec::runtime::Process as ProcessSpec;

use crate::relay::{PipeRelay, TtyRelay};
use crate::stdio::StdioSet;

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited normally with the given code
    Exited(i32),
    /// Terminated by the given signal number
    Signaled(i32),
}

impl ExitState {
    /// Shell-style exit code: signalled processes report `128 + signal`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitState::Exited(code) => *code,
            ExitState::Signaled(signal) => SIGNAL_OFFSET + signal,
        }
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create (but do not start) a container from the bundle at `bundle_path`.
    async fn create_container(
        &self,
        id: &str,
        bundle_path: &Path,
    ) -> GcsResult<Arc<dyn RuntimeContainer>>;
}

#[async_trait]
pub trait RuntimeContainer: Send + Sync {
    /// Pid of the container's initial process.
    fn pid(&self) -> u32;

    fn init_process(&self) -> Arc<dyn RuntimeProcess>;

    /// Terminal relay, present when the initial process has a terminal.
    fn tty(&self) -> Option<Arc<TtyRelay>>;

    /// Pipe relay, present when the initial process has no terminal.
    fn pipe_relay(&self) -> Option<Arc<PipeRelay>>;

    async fn start(&self) -> GcsResult<()>;

    /// Run an additional process inside the container, wired to `stdio`.
    async fn exec_process(
        &self,
        spec: &ProcessSpec,
        stdio: StdioSet,
    ) -> GcsResult<Arc<dyn RuntimeProcess>>;

    async fn kill(&self, signal: Signal) -> GcsResult<()>;
}

#[async_trait]
pub trait RuntimeProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Block until the process terminates.
    async fn wait(&self) -> GcsResult<ExitState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitState::Exited(0).exit_code(), 0);
        assert_eq!(ExitState::Exited(3).exit_code(), 3);
        assert_eq!(ExitState::Signaled(9).exit_code(), 137);
        assert_eq!(ExitState::Signaled(15).exit_code(), 143);
    }
}
