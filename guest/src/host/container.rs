//! A container hosted in the VM and its processes.

use std::collections::HashMap;
use std::sync::Arc;

use gcs_shared::constants::exit::WAIT_FAILED;
use gcs_shared::{GcsError, GcsResult, ResultExt};
use nix::sys::signal::Signal;
use oci_spec::runtime::{Process as ProcessSpec, Spec};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::process::Process;
use crate::runtime::RuntimeContainer;
use crate::stdio::{ConnectionSettings, StdioConnector};
use crate::sync::WaitGroup;

/// Exec'd processes of one container plus the barrier that counts every
/// running process, the initial one included.
///
/// The barrier is only moved while `processes` is locked.
#[derive(Debug, Default)]
pub(crate) struct ProcessTable {
    processes: Mutex<HashMap<u32, Arc<Process>>>,
    finished: WaitGroup,
}

impl ProcessTable {
    /// Count a process that is about to exist.
    pub(crate) fn reserve(&self) {
        let _guard = self.processes.lock();
        self.finished.add(1);
    }

    /// Release a reservation whose process never came to exist, or whose
    /// process has exited.
    pub(crate) fn process_finished(&self) {
        let _guard = self.processes.lock();
        self.finished.done();
    }

    fn insert(&self, process: Arc<Process>) {
        self.processes.lock().insert(process.pid(), process);
    }

    fn get(&self, pid: u32) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Remove `process`, unless its pid has since been reused by another.
    pub(crate) fn remove(&self, process: &Arc<Process>) {
        let mut processes = self.processes.lock();
        if processes
            .get(&process.pid())
            .is_some_and(|p| Arc::ptr_eq(p, process))
        {
            processes.remove(&process.pid());
        }
    }

    fn pids(&self) -> Vec<u32> {
        self.processes.lock().keys().copied().collect()
    }
}

pub struct Container {
    id: String,
    spec: Spec,
    runtime_container: Arc<dyn RuntimeContainer>,
    stdio: Arc<dyn StdioConnector>,
    init_process: Arc<Process>,
    table: Arc<ProcessTable>,
}

impl Container {
    pub(crate) fn new(
        id: String,
        spec: Spec,
        runtime_container: Arc<dyn RuntimeContainer>,
        stdio: Arc<dyn StdioConnector>,
    ) -> Self {
        let table = Arc::new(ProcessTable::default());
        table.reserve();

        let init_spec = spec.process().clone().unwrap_or_default();
        let init_process = Process::spawn(
            table.clone(),
            init_spec,
            runtime_container.init_process(),
        );

        Self {
            id,
            spec,
            runtime_container,
            stdio,
            init_process,
            table,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn init_process(&self) -> &Arc<Process> {
        &self.init_process
    }

    /// Wire stdio to the initial process and start it. Returns its pid.
    pub async fn start(&self, settings: &ConnectionSettings) -> GcsResult<u32> {
        let stdio = self
            .stdio
            .connect(settings)
            .await
            .context("failed to connect stdio for container start")?;

        let tty = self.runtime_container.tty();
        let pipes = self.runtime_container.pipe_relay();
        if let Some(tty) = &tty {
            tty.replace_connections(stdio);
            if let Err(e) = tty.start() {
                tty.close();
                return Err(GcsError::from(e).context("failed to start terminal relay"));
            }
        } else if let Some(pipes) = &pipes {
            pipes.replace_connections(stdio);
            pipes.close_unused_pipes();
            pipes.start();
        } else if !stdio.is_empty() {
            warn!(container_id = %self.id, "container has no stdio relay; dropping connections");
        }

        if let Err(e) = self.runtime_container.start().await {
            if let Some(tty) = &tty {
                tty.close();
            }
            if let Some(pipes) = &pipes {
                pipes.close();
            }
            return Err(e.context(format!("failed to start container {}", self.id)));
        }

        let pid = self.init_process.pid();
        info!(container_id = %self.id, pid, "container started");
        Ok(pid)
    }

    /// Run an additional process in the container. Returns its pid.
    pub async fn exec_process(
        &self,
        spec: ProcessSpec,
        settings: &ConnectionSettings,
    ) -> GcsResult<u32> {
        let stdio = self
            .stdio
            .connect(settings)
            .await
            .context("failed to connect stdio for exec")?;

        // Counted before the runtime call so `wait` cannot complete while
        // the exec is in flight.
        self.table.reserve();

        let handle = match self.runtime_container.exec_process(&spec, stdio).await {
            Ok(handle) => handle,
            Err(e) => {
                self.table.process_finished();
                return Err(e.context(format!("failed to exec process in container {}", self.id)));
            }
        };

        let process = Process::spawn(self.table.clone(), spec, handle);
        let pid = process.pid();
        self.table.insert(process);
        debug!(container_id = %self.id, pid, "process executed");
        Ok(pid)
    }

    pub fn get_process(&self, pid: u32) -> GcsResult<Arc<Process>> {
        if self.init_process.pid() == pid {
            return Ok(self.init_process.clone());
        }
        self.table.get(pid).ok_or(GcsError::ProcessNotFound(pid))
    }

    /// Signal the whole container through the runtime.
    pub async fn kill(&self, signal: Signal) -> GcsResult<()> {
        self.runtime_container
            .kill(signal)
            .await
            .with_context(|| format!("failed to send {} to container {}", signal, self.id))
    }

    /// Wait until every process has exited, then return the initial
    /// process's exit code.
    pub async fn wait(&self) -> i32 {
        self.table.finished.wait().await;
        // The watcher records the exit code before releasing the barrier.
        self.init_process.exit_code().unwrap_or(WAIT_FAILED)
    }

    /// Pids of the initial process and every exec'd process still tracked.
    pub fn process_ids(&self) -> Vec<u32> {
        let mut pids = vec![self.init_process.pid()];
        pids.extend(self.table.pids());
        pids
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("init_pid", &self.init_process.pid())
            .finish()
    }
}
