//! The VM host: registry of containers and owner of attached storage.

mod container;
mod process;
mod settings;

use std::collections::HashMap;
use std::fs::DirBuilder;
use std::io::{BufWriter, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;

use gcs_shared::layout::BundleLayout;
use gcs_shared::{GcsError, GcsResult, ResultExt};
use oci_spec::runtime::Spec;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::runtime::Runtime;
use crate::stdio::StdioConnector;
use crate::storage::Storage;

pub use container::Container;
pub use process::{ExitWaiter, Process};

/// Parameters for creating a container.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Directory the OCI bundle is written to
    pub oci_bundle_path: PathBuf,
    pub oci_specification: Spec,
}

pub struct Host {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    runtime: Arc<dyn Runtime>,
    storage: Arc<dyn Storage>,
    stdio: Arc<dyn StdioConnector>,
}

impl Host {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        storage: Arc<dyn Storage>,
        stdio: Arc<dyn StdioConnector>,
    ) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            runtime,
            storage,
            stdio,
        }
    }

    /// Create the container `id`, or return it if it already exists.
    pub async fn create_container(
        &self,
        id: &str,
        settings: &ContainerSettings,
    ) -> GcsResult<Arc<Container>> {
        let mut containers = self.containers.lock().await;
        if let Some(existing) = containers.get(id) {
            debug!(container_id = %id, "container already exists");
            return Ok(existing.clone());
        }

        let bundle = BundleLayout::new(&settings.oci_bundle_path);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(bundle.root())
            .with_context(|| {
                format!(
                    "failed to create OCI bundle directory {}",
                    bundle.root().display()
                )
            })?;
        write_config(&bundle, &settings.oci_specification)?;

        let runtime_container = self
            .runtime
            .create_container(id, bundle.root())
            .await
            .with_context(|| format!("failed to create container {}", id))?;

        let container = Arc::new(Container::new(
            id.to_string(),
            settings.oci_specification.clone(),
            runtime_container,
            self.stdio.clone(),
        ));
        containers.insert(id.to_string(), container.clone());

        info!(
            container_id = %id,
            pid = container.init_process().pid(),
            bundle = %bundle.root().display(),
            "container created"
        );
        Ok(container)
    }

    pub async fn get_container(&self, id: &str) -> GcsResult<Arc<Container>> {
        self.containers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GcsError::ContainerNotFound(id.to_string()))
    }

    /// Pids of every process in every container.
    pub async fn list_all_process_ids(&self) -> Vec<u32> {
        let containers = self.containers.lock().await;
        containers
            .values()
            .flat_map(|c| c.process_ids())
            .collect()
    }
}

fn write_config(bundle: &BundleLayout, spec: &Spec) -> GcsResult<()> {
    let path = bundle.config_file();
    let write = || -> GcsResult<()> {
        let file = std::fs::File::create(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, spec)?;
        writer.flush()?;
        Ok(())
    };
    write().with_context(|| format!("failed to write OCI spec to {}", path.display()))
}
