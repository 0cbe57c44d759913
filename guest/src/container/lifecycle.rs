//! OCI container lifecycle on top of libcontainer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use gcs_shared::layout::BundleLayout;
use gcs_shared::{GcsError, GcsResult};
use libcontainer::container::builder::ContainerBuilder;
use libcontainer::container::Container as LibContainer;
use libcontainer::signal::Signal as LibSignal;
use libcontainer::syscall::syscall::SyscallType;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use oci_spec::runtime::{Process as ProcessSpec, Spec};

use super::command::ExecCommand;
use super::console_socket::ConsoleSocket;
use super::process::OsProcess;
use crate::relay::{ChildPipes, PipeRelay, TtyRelay};
use crate::runtime::{RuntimeContainer, RuntimeProcess};
use crate::stdio::StdioSet;

/// Stdio plumbing of the initial process.
enum InitRelay {
    Pipes(Arc<PipeRelay>),
    Tty(Arc<TtyRelay>),
}

pub(super) struct LibcontainerContainer {
    id: String,
    state_root: PathBuf,
    init: Arc<OsProcess>,
    relay: InitRelay,
}

impl LibcontainerContainer {
    /// Create the container from `bundle_path` without starting it.
    ///
    /// Blocking; run on the blocking pool.
    pub fn create(id: &str, state_root: &Path, bundle_path: &Path) -> GcsResult<Self> {
        let bundle = BundleLayout::new(bundle_path);
        let spec = Spec::load(bundle.config_file()).map_err(|e| {
            GcsError::Runtime(format!(
                "failed to load OCI spec {}: {}",
                bundle.config_file().display(),
                e
            ))
        })?;
        let terminal = spec
            .process()
            .as_ref()
            .map(|p| matches!(p.terminal(), Some(true)))
            .unwrap_or(false);

        let (pid, relay) = if terminal {
            let socket = ConsoleSocket::new(state_root, id)?;
            let pid = build_init(id, state_root, bundle_path, None, Some(socket.path()))?;
            let master = socket.receive_pty_master()?;
            (pid, InitRelay::Tty(Arc::new(TtyRelay::new(master))))
        } else {
            let (relay, child) = PipeRelay::new()
                .map_err(|e| GcsError::Runtime(format!("failed to create stdio pipes: {}", e)))?;
            let pid = build_init(id, state_root, bundle_path, Some(child), None)?;
            (pid, InitRelay::Pipes(Arc::new(relay)))
        };

        tracing::debug!(container_id = %id, pid = pid.as_raw(), terminal, "Container created");
        Ok(Self {
            id: id.to_string(),
            state_root: state_root.to_path_buf(),
            init: Arc::new(OsProcess::new(pid, None)),
            relay,
        })
    }

    fn load(&self) -> GcsResult<LibContainer> {
        LibContainer::load(self.state_root.join(&self.id)).map_err(|e| {
            GcsError::Runtime(format!(
                "failed to load container {} state: {}",
                self.id, e
            ))
        })
    }
}

fn build_init(
    id: &str,
    state_root: &Path,
    bundle_path: &Path,
    pipes: Option<ChildPipes>,
    console_socket: Option<String>,
) -> GcsResult<Pid> {
    let mut builder = ContainerBuilder::new(id.to_string(), SyscallType::default())
        .with_root_path(state_root)
        .map_err(|e| GcsError::Runtime(format!("failed to set container root path: {}", e)))?
        .with_console_socket(console_socket)
        .validate_id()
        .map_err(|e| GcsError::Runtime(format!("invalid container id {}: {}", id, e)))?;

    if let Some(pipes) = pipes {
        builder = builder
            .with_stdin(pipes.stdin)
            .with_stdout(pipes.stdout)
            .with_stderr(pipes.stderr);
    }

    let container = builder
        .as_init(bundle_path)
        .with_systemd(false)
        .with_detach(true)
        .build()
        .map_err(|e| GcsError::Runtime(format!("failed to create container {}: {}", id, e)))?;

    container
        .pid()
        .ok_or_else(|| GcsError::Runtime(format!("container {} has no init pid", id)))
}

async fn blocking<T, F>(f: F) -> GcsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> GcsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GcsError::Internal(format!("runtime task failed: {}", e)))?
}

#[async_trait]
impl RuntimeContainer for LibcontainerContainer {
    fn pid(&self) -> u32 {
        self.init.pid()
    }

    fn init_process(&self) -> Arc<dyn RuntimeProcess> {
        self.init.clone()
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        match &self.relay {
            InitRelay::Tty(tty) => Some(tty.clone()),
            InitRelay::Pipes(_) => None,
        }
    }

    fn pipe_relay(&self) -> Option<Arc<PipeRelay>> {
        match &self.relay {
            InitRelay::Pipes(pipes) => Some(pipes.clone()),
            InitRelay::Tty(_) => None,
        }
    }

    async fn start(&self) -> GcsResult<()> {
        let mut container = self.load()?;
        let id = self.id.clone();
        blocking(move || {
            container
                .start()
                .map_err(|e| GcsError::Runtime(format!("failed to start container {}: {}", id, e)))
        })
        .await
    }

    async fn exec_process(
        &self,
        spec: &ProcessSpec,
        stdio: StdioSet,
    ) -> GcsResult<Arc<dyn RuntimeProcess>> {
        let command = ExecCommand::new(&self.id, self.state_root.clone(), spec)?;
        let process = blocking(move || command.spawn(stdio)).await?;
        Ok(Arc::new(process))
    }

    async fn kill(&self, signal: Signal) -> GcsResult<()> {
        let mut container = self.load()?;
        let signal = LibSignal::try_from(signal as i32)
            .map_err(|e| GcsError::InvalidRequest(format!("invalid signal {}: {}", signal, e)))?;
        let id = self.id.clone();
        blocking(move || {
            container
                .kill(signal, true)
                .map_err(|e| GcsError::Runtime(format!("failed to signal container {}: {}", id, e)))
        })
        .await
    }
}

impl Drop for LibcontainerContainer {
    fn drop(&mut self) {
        let Ok(mut container) = LibContainer::load(self.state_root.join(&self.id)) else {
            return;
        };
        tracing::debug!(container_id = %self.id, "Deleting container state");
        let force = !container.can_delete();
        if let Err(e) = container.delete(force) {
            tracing::warn!(container_id = %self.id, error = %e, "Failed to delete container");
        }
    }
}
