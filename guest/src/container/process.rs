//! OS process handles reaped with `waitpid`.

use std::sync::Arc;

use async_trait::async_trait;
use gcs_shared::{GcsError, GcsResult};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::relay::{PipeRelay, TtyRelay};
use crate::runtime::{ExitState, RuntimeProcess};

/// Relay kept alive for as long as its process is tracked.
pub(super) enum ProcessRelay {
    Pipes(Arc<PipeRelay>),
    Tty(Arc<TtyRelay>),
}

impl ProcessRelay {
    fn close(&self) {
        match self {
            ProcessRelay::Pipes(relay) => relay.close(),
            ProcessRelay::Tty(relay) => relay.close(),
        }
    }
}

pub(super) struct OsProcess {
    pid: Pid,
    relay: Option<ProcessRelay>,
}

impl OsProcess {
    pub fn new(pid: Pid, relay: Option<ProcessRelay>) -> Self {
        Self { pid, relay }
    }
}

impl Drop for OsProcess {
    fn drop(&mut self) {
        // Host connections close with the handle.
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
    }
}

#[async_trait]
impl RuntimeProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    async fn wait(&self) -> GcsResult<ExitState> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitState::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ExitState::Signaled(signal as i32))
                }
                // Stopped/continued: keep waiting for termination.
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(GcsError::Runtime(format!("waitpid({}) failed: {}", pid, e)))
                }
            }
        })
        .await
        .map_err(|e| GcsError::Internal(format!("wait task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::{Connection, StdioSet};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_dropping_process_closes_host_connections() {
        let (relay, _child) = PipeRelay::new().unwrap();
        let (agent_out, mut host_out) = UnixStream::pair().unwrap();
        relay.replace_connections(StdioSet {
            stdin: None,
            stdout: Some(Connection::Unix(agent_out)),
            stderr: None,
        });
        relay.close_unused_pipes();
        relay.start();

        let relay = Arc::new(relay);
        let process = OsProcess::new(Pid::this(), Some(ProcessRelay::Pipes(relay.clone())));
        drop(process);

        // The relay is still referenced here, yet its connection is gone.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), host_out.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(Arc::strong_count(&relay), 1);
    }
}
