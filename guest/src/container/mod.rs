//! OCI container runtime backed by libcontainer.
//!
//! - [`LibcontainerRuntime`]: creates containers from OCI bundles
//! - `LibcontainerContainer`: start, signal and exec into one container
//! - `ExecCommand`: spawns an additional process with pipes or a PTY
//!
//! libcontainer detaches the initial process, so the agent must be a child
//! subreaper to reap it.

mod command;
mod console_socket;
mod lifecycle;
mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use gcs_shared::{GcsError, GcsResult, ResultExt};

use crate::runtime::{Runtime, RuntimeContainer};
use lifecycle::LibcontainerContainer;

#[derive(Debug, Clone)]
pub struct LibcontainerRuntime {
    state_root: PathBuf,
}

impl LibcontainerRuntime {
    /// Use `state_root` for container state and console sockets.
    pub fn new(state_root: impl Into<PathBuf>) -> GcsResult<Self> {
        let state_root = state_root.into();
        std::fs::create_dir_all(&state_root).with_context(|| {
            format!(
                "failed to create container state directory {}",
                state_root.display()
            )
        })?;
        Ok(Self { state_root })
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }
}

#[async_trait]
impl Runtime for LibcontainerRuntime {
    async fn create_container(
        &self,
        id: &str,
        bundle_path: &Path,
    ) -> GcsResult<Arc<dyn RuntimeContainer>> {
        let id = id.to_string();
        let state_root = self.state_root.clone();
        let bundle_path = bundle_path.to_path_buf();
        let container = tokio::task::spawn_blocking(move || {
            LibcontainerContainer::create(&id, &state_root, &bundle_path)
        })
        .await
        .map_err(|e| GcsError::Internal(format!("container create task failed: {}", e)))??;
        Ok(Arc::new(container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creates_state_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("state").join("nested");
        let runtime = LibcontainerRuntime::new(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(runtime.state_root(), root.as_path());
    }
}
