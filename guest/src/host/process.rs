//! A process inside a container and its exit broadcast.
//!
//! Any number of observers may call [`Process::wait`], before or after
//! the process exits. Each one that is still listening when the exit is
//! recorded receives the exit code. The process is removed from its
//! container only once it has exited and at least one observer has
//! acknowledged delivery.
//!
//! Bookkeeping:
//! - `writers` starts at 1, a reservation held for the exit watcher.
//! - every `wait()` adds 1; its observer task removes it when the caller
//!   is done (acknowledged or cancelled).
//! - the first acknowledged delivery also releases the watcher's
//!   reservation (guarded by `writers_called`).
//! - a finalizer removes the process once `writers` reaches zero.

use std::sync::Arc;

use gcs_shared::constants::exit::WAIT_FAILED;
use gcs_shared::{GcsError, GcsResult};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use oci_spec::runtime::Process as ProcessSpec;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::container::ProcessTable;
use crate::runtime::RuntimeProcess;
use crate::sync::{OnceSignal, WaitGroup};

pub struct Process {
    pid: u32,
    spec: ProcessSpec,
    handle: Arc<dyn RuntimeProcess>,
    exited: OnceSignal<i32>,
    writers: WaitGroup,
    writers_called: Mutex<bool>,
}

impl Process {
    /// Wrap `handle` and start watching for its exit.
    ///
    /// The caller must already have counted this process in the table's
    /// completion barrier; the watcher releases that count on exit.
    pub(crate) fn spawn(
        table: Arc<ProcessTable>,
        spec: ProcessSpec,
        handle: Arc<dyn RuntimeProcess>,
    ) -> Arc<Self> {
        let process = Arc::new(Self {
            pid: handle.pid(),
            spec,
            handle,
            exited: OnceSignal::new(),
            writers: WaitGroup::with_count(1),
            writers_called: Mutex::new(false),
        });
        tokio::spawn(watch_exit(process.clone(), table));
        process
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exited.get()
    }

    /// Send `signal` directly to the process.
    pub fn kill(&self, signal: Signal) -> GcsResult<()> {
        let pid = i32::try_from(self.pid)
            .map_err(|_| GcsError::Internal(format!("pid {} out of range", self.pid)))?;
        signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| GcsError::Runtime(format!("failed to signal process {}: {}", self.pid, e)))
    }

    /// Register an observer of this process's exit.
    ///
    /// The returned waiter yields the exit code once. Call
    /// [`ExitWaiter::done`] (or drop the waiter) after consuming it; doing
    /// so before the exit cancels the observation.
    pub fn wait(self: &Arc<Self>) -> ExitWaiter {
        let (code_tx, code_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        {
            let _guard = self.writers_called.lock();
            self.writers.add(1);
        }

        tokio::spawn(observe_exit(self.clone(), code_tx, done_rx));

        ExitWaiter {
            exit_code: Some(code_rx),
            done: done_tx,
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code())
            .field("writers", &self.writers.count())
            .finish()
    }
}

async fn observe_exit(
    process: Arc<Process>,
    code_tx: oneshot::Sender<i32>,
    mut done_rx: oneshot::Receiver<()>,
) {
    let code = tokio::select! {
        biased;
        _ = &mut done_rx => None,
        code = process.exited.wait() => Some(code),
    };

    match code {
        Some(code) => {
            // A caller that already went away is treated as acknowledged.
            let _ = code_tx.send(code);
            let _ = done_rx.await;

            let mut called = process.writers_called.lock();
            process.writers.done();
            if !*called {
                *called = true;
                process.writers.done();
            }
        }
        None => {
            let _guard = process.writers_called.lock();
            process.writers.done();
        }
    }
}

async fn watch_exit(process: Arc<Process>, table: Arc<ProcessTable>) {
    let pid = process.pid;
    let code = match process.handle.wait().await {
        Ok(state) => state.exit_code(),
        Err(e) => {
            error!(pid, error = %e, "failed to wait for process");
            WAIT_FAILED
        }
    };
    debug!(pid, exit_code = code, "process exited");

    process.exited.set(code);
    table.process_finished();

    tokio::spawn(async move {
        process.writers.wait().await;
        table.remove(&process);
        debug!(pid, "process cleaned up");
    });
}

/// One observer's view of a process exit.
#[derive(Debug)]
pub struct ExitWaiter {
    exit_code: Option<oneshot::Receiver<i32>>,
    done: oneshot::Sender<()>,
}

impl ExitWaiter {
    /// Wait for the exit code. Returns `None` if the observation was
    /// already finished; the first successful call consumes the code.
    pub async fn exit_code(&mut self) -> Option<i32> {
        let rx = self.exit_code.as_mut()?;
        let code = rx.await.ok();
        self.exit_code = None;
        code
    }

    /// Acknowledge delivery, or cancel if the code has not arrived yet.
    pub fn done(self) {
        let _ = self.done.send(());
    }
}
