#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gcs_guest::host::{ContainerSettings, Host};
use gcs_guest::relay::{PipeRelay, TtyRelay};
use gcs_guest::runtime::{ExitState, Runtime, RuntimeContainer, RuntimeProcess};
use gcs_guest::stdio::{ConnectionSettings, StdioConnector, StdioSet};
use gcs_guest::storage::{LoopbackImage, OverlaySpec, Plan9Share, ScsiDisk, Storage};
use gcs_guest::sync::OnceSignal;
use gcs_shared::{GcsError, GcsResult};
use nix::sys::signal::Signal;
use oci_spec::runtime::{Process as ProcessSpec, ProcessBuilder, Spec};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Notify;

// ============================================================================
// RUNTIME FAKES
// ============================================================================

/// A process whose exit the test decides.
pub struct FakeProcess {
    pid: u32,
    exit: OnceSignal<ExitState>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exit: OnceSignal::new(),
        })
    }

    pub fn exit(&self, code: i32) {
        self.exit.set(ExitState::Exited(code));
    }

    pub fn signal(&self, signal: i32) {
        self.exit.set(ExitState::Signaled(signal));
    }
}

#[async_trait]
impl RuntimeProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&self) -> GcsResult<ExitState> {
        Ok(self.exit.wait().await)
    }
}

pub struct FakeContainer {
    init: Arc<FakeProcess>,
    next_pid: AtomicU32,
    execs: Mutex<Vec<Arc<FakeProcess>>>,
    /// When set, each exec blocks until the gate is notified.
    exec_gate: Mutex<Option<Arc<Notify>>>,
    fail_exec: AtomicBool,
    started: AtomicBool,
    kills: Mutex<Vec<Signal>>,
}

impl FakeContainer {
    fn new(init_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            init: FakeProcess::new(init_pid),
            next_pid: AtomicU32::new(init_pid + 1),
            execs: Mutex::new(Vec::new()),
            exec_gate: Mutex::new(None),
            fail_exec: AtomicBool::new(false),
            started: AtomicBool::new(false),
            kills: Mutex::new(Vec::new()),
        })
    }

    pub fn init(&self) -> &Arc<FakeProcess> {
        &self.init
    }

    pub fn exec(&self, pid: u32) -> Arc<FakeProcess> {
        self.execs
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .unwrap_or_else(|| panic!("no exec'd process {}", pid))
    }

    pub fn gate_execs(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.exec_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn fail_execs(&self) {
        self.fail_exec.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> Vec<Signal> {
        self.kills.lock().clone()
    }
}

#[async_trait]
impl RuntimeContainer for FakeContainer {
    fn pid(&self) -> u32 {
        self.init.pid
    }

    fn init_process(&self) -> Arc<dyn RuntimeProcess> {
        self.init.clone()
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        None
    }

    fn pipe_relay(&self) -> Option<Arc<PipeRelay>> {
        None
    }

    async fn start(&self) -> GcsResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn exec_process(
        &self,
        _spec: &ProcessSpec,
        _stdio: StdioSet,
    ) -> GcsResult<Arc<dyn RuntimeProcess>> {
        let gate = self.exec_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(GcsError::Runtime("exec refused".into()));
        }
        let process = FakeProcess::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.execs.lock().push(process.clone());
        Ok(process)
    }

    async fn kill(&self, signal: Signal) -> GcsResult<()> {
        self.kills.lock().push(signal);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    creates: AtomicUsize,
    fail_create: AtomicBool,
    next_pid: AtomicU32,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
}

impl FakeRuntime {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn container(&self, id: &str) -> Arc<FakeContainer> {
        self.containers
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no runtime container {}", id))
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create_container(
        &self,
        id: &str,
        _bundle_path: &Path,
    ) -> GcsResult<Arc<dyn RuntimeContainer>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GcsError::Runtime(format!("cannot create {}", id)));
        }
        // Leave room between containers for exec'd pids.
        let pid = 100 + self.next_pid.fetch_add(1, Ordering::SeqCst) * 100;
        let container = FakeContainer::new(pid);
        self.containers
            .lock()
            .insert(id.to_string(), container.clone());
        Ok(container)
    }
}

/// Hands out empty stdio sets.
pub struct NullStdio;

#[async_trait]
impl StdioConnector for NullStdio {
    async fn connect(&self, _settings: &ConnectionSettings) -> GcsResult<StdioSet> {
        Ok(StdioSet::default())
    }
}

// ============================================================================
// STORAGE FAKE
// ============================================================================

/// Records every storage call as a line like `mount_scsi /layers/a 0:1`.
#[derive(Default)]
pub struct RecordingStorage {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Vec<String>>,
    overlays: Mutex<Vec<OverlaySpec>>,
}

impl RecordingStorage {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn overlays(&self) -> Vec<OverlaySpec> {
        self.overlays.lock().clone()
    }

    /// Make the call recorded as `call` fail.
    pub fn fail_on(&self, call: &str) {
        self.fail_on.lock().push(call.to_string());
    }

    fn record(&self, call: String) -> GcsResult<()> {
        let fail = self.fail_on.lock().contains(&call);
        self.calls.lock().push(call.clone());
        if fail {
            return Err(GcsError::storage(
                format!("{} failed", call),
                io::Error::other("injected failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn resolve_scsi(&self, controller: u8, lun: u8) -> GcsResult<PathBuf> {
        self.record(format!("resolve_scsi {}:{}", controller, lun))?;
        Ok(PathBuf::from("/dev/sdb"))
    }

    async fn mount_scsi(&self, mount_path: &Path, disk: &ScsiDisk) -> GcsResult<PathBuf> {
        let mode = if disk.read_only { "ro" } else { "rw" };
        self.record(format!(
            "mount_scsi {} {}:{} {}",
            mount_path.display(),
            disk.controller,
            disk.lun,
            mode
        ))?;
        Ok(PathBuf::from("/dev/sdb"))
    }

    async fn unplug_scsi(&self, controller: u8, lun: u8) -> GcsResult<()> {
        self.record(format!("unplug_scsi {}:{}", controller, lun))
    }

    async fn mount_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<PathBuf> {
        self.record(format!(
            "mount_pmem {} {}",
            mount_path.display(),
            device_number
        ))?;
        Ok(PathBuf::from(format!("/dev/pmem{}", device_number)))
    }

    async fn remove_pmem(&self, mount_path: &Path, device_number: u32) -> GcsResult<()> {
        self.record(format!(
            "remove_pmem {} {}",
            mount_path.display(),
            device_number
        ))
    }

    async fn mount_plan9(&self, mount_path: &Path, share: &Plan9Share) -> GcsResult<()> {
        self.record(format!(
            "mount_plan9 {} {}",
            mount_path.display(),
            share.port
        ))
    }

    async fn mount_overlay(&self, overlay: &OverlaySpec) -> GcsResult<()> {
        self.overlays.lock().push(overlay.clone());
        self.record(format!("mount_overlay {}", overlay.target.display()))
    }

    async fn mount_loopback(&self, mount_path: &Path, image: &LoopbackImage) -> GcsResult<PathBuf> {
        self.record(format!(
            "mount_loopback {} {}",
            mount_path.display(),
            image.device_number
        ))?;
        Ok(PathBuf::from(format!("/dev/loop{}", image.device_number)))
    }

    async fn teardown_loopback(&self, device_number: u32) -> GcsResult<()> {
        self.record(format!("teardown_loopback {}", device_number))
    }

    async fn unmount(&self, path: &Path, _remove_dir: bool) -> GcsResult<()> {
        self.record(format!("unmount {}", path.display()))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// A host wired to fakes, with bundles written under a temp dir.
pub struct TestContext {
    pub host: Host,
    pub runtime: Arc<FakeRuntime>,
    pub storage: Arc<RecordingStorage>,
    temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let storage = Arc::new(RecordingStorage::default());
        let host = Host::new(runtime.clone(), storage.clone(), Arc::new(NullStdio));
        Self {
            host,
            runtime,
            storage,
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn settings(&self, id: &str) -> ContainerSettings {
        ContainerSettings {
            oci_bundle_path: self.temp_dir.path().join("bundles").join(id),
            oci_specification: Spec::default(),
        }
    }
}

pub fn process_spec(args: &[&str]) -> ProcessSpec {
    ProcessBuilder::default()
        .terminal(false)
        .args(args.iter().map(|a| a.to_string()).collect::<Vec<_>>())
        .cwd("/")
        .build()
        .expect("valid process spec")
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
