//! Executing additional processes in a running container.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gcs_shared::{GcsError, GcsResult};
use libcontainer::container::builder::ContainerBuilder;
use libcontainer::syscall::syscall::SyscallType;
use nix::unistd::Pid;
use oci_spec::runtime::Process as ProcessSpec;

use super::console_socket::ConsoleSocket;
use super::process::{OsProcess, ProcessRelay};
use crate::relay::{ChildPipes, PipeRelay, TtyRelay};
use crate::stdio::StdioSet;

/// Parse `KEY=VALUE` entries, skipping malformed ones.
pub(super) fn env_map(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A tenant process to run inside container `id`.
pub(super) struct ExecCommand {
    id: String,
    state_root: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: PathBuf,
    terminal: bool,
    no_new_privs: bool,
}

impl ExecCommand {
    pub fn new(id: &str, state_root: PathBuf, spec: &ProcessSpec) -> GcsResult<Self> {
        let args = spec.args().clone().unwrap_or_default();
        if args.is_empty() {
            return Err(GcsError::InvalidRequest(
                "exec process needs at least one argument".into(),
            ));
        }
        let env = env_map(&spec.env().clone().unwrap_or_default());
        let cwd = PathBuf::from(spec.cwd());
        let cwd = if cwd.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            cwd
        };

        Ok(Self {
            id: id.to_string(),
            state_root,
            args,
            env,
            cwd,
            terminal: matches!(spec.terminal(), Some(true)),
            no_new_privs: spec.no_new_privileges().unwrap_or(false),
        })
    }

    /// Spawn the process and start relaying `stdio` to it.
    pub fn spawn(self, stdio: StdioSet) -> GcsResult<OsProcess> {
        if self.terminal {
            self.spawn_with_pty(stdio)
        } else {
            self.spawn_with_pipes(stdio)
        }
    }

    fn spawn_with_pipes(self, stdio: StdioSet) -> GcsResult<OsProcess> {
        let (relay, child) = PipeRelay::new()
            .map_err(|e| GcsError::Runtime(format!("failed to create stdio pipes: {}", e)))?;

        tracing::debug!(container_id = %self.id, "Spawning with pipes");
        let pid = self.build_and_spawn(Some(child), None)?;

        let relay = Arc::new(relay);
        relay.replace_connections(stdio);
        relay.close_unused_pipes();
        relay.start();

        tracing::debug!(pid = pid.as_raw(), "Spawned with pipes");
        Ok(OsProcess::new(pid, Some(ProcessRelay::Pipes(relay))))
    }

    fn spawn_with_pty(self, stdio: StdioSet) -> GcsResult<OsProcess> {
        let exec_id = uuid::Uuid::new_v4().to_string();
        let socket = ConsoleSocket::new(&self.state_root, &exec_id)?;

        tracing::debug!(
            container_id = %self.id,
            console_socket = %socket.path(),
            "Spawning with PTY"
        );
        let pid = self.build_and_spawn(None, Some(socket.path()))?;
        let master = socket.receive_pty_master()?;

        let relay = Arc::new(TtyRelay::new(master));
        relay.replace_connections(stdio);
        relay
            .start()
            .map_err(|e| GcsError::Runtime(format!("failed to start terminal relay: {}", e)))?;

        tracing::debug!(pid = pid.as_raw(), "Spawned with PTY");
        Ok(OsProcess::new(pid, Some(ProcessRelay::Tty(relay))))
    }

    fn build_and_spawn(
        &self,
        pipes: Option<ChildPipes>,
        console_socket: Option<String>,
    ) -> GcsResult<Pid> {
        let mut builder = ContainerBuilder::new(self.id.clone(), SyscallType::default())
            .with_root_path(self.state_root.clone())
            .map_err(|e| GcsError::Runtime(format!("failed to set container root path: {}", e)))?
            .with_console_socket(console_socket)
            .validate_id()
            .map_err(|e| GcsError::Runtime(format!("invalid container id: {}", e)))?;

        if let Some(pipes) = pipes {
            builder = builder
                .with_stdin(pipes.stdin)
                .with_stdout(pipes.stdout)
                .with_stderr(pipes.stderr);
        }

        builder
            .as_tenant()
            .with_no_new_privs(self.no_new_privs)
            .with_detach(false)
            .with_cwd(Some(self.cwd.clone()))
            .with_env(self.env.clone())
            .with_container_args(self.args.clone())
            .build()
            .map_err(|e| {
                GcsError::Runtime(format!(
                    "failed to exec {:?} in container {}: {}",
                    self.args, self.id, e
                ))
            })
    }
}
