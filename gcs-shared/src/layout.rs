//! Filesystem layout definitions shared between host and guest.
//!
//! - `BundleLayout`: an OCI bundle directory written by the agent
//! - `ScratchLayout`: writable overlay directories beneath a scratch mount
//! - `GuestLayout`: the agent's own state directories

use std::path::{Path, PathBuf};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Directory and file names.
pub mod dirs {
    /// OCI runtime configuration inside a bundle
    pub const CONFIG_FILE: &str = "config.json";

    /// Overlayfs upper directory name
    pub const UPPER: &str = "upper";

    /// Overlayfs work directory name
    pub const WORK: &str = "work";

    /// Runtime state directory name
    pub const STATE: &str = "state";
}

/// Guest base path (FHS-compliant).
pub const GUEST_BASE: &str = "/run/gcs";

// ============================================================================
// BUNDLE LAYOUT
// ============================================================================

/// An OCI bundle directory:
/// ```text
/// {root}/
/// └── config.json
/// ```
#[derive(Clone, Debug)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runtime configuration: {root}/config.json
    pub fn config_file(&self) -> PathBuf {
        self.root.join(dirs::CONFIG_FILE)
    }
}

// ============================================================================
// SCRATCH LAYOUT
// ============================================================================

/// Writable overlay directories beneath a scratch area:
/// ```text
/// {scratch}/
/// ├── upper/
/// └── work/
/// ```
#[derive(Clone, Debug)]
pub struct ScratchLayout {
    root: PathBuf,
}

impl ScratchLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upper directory: {root}/upper
    pub fn upper_dir(&self) -> PathBuf {
        self.root.join(dirs::UPPER)
    }

    /// Work directory: {root}/work
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(dirs::WORK)
    }
}

// ============================================================================
// GUEST LAYOUT
// ============================================================================

/// Agent state directories:
/// ```text
/// /run/gcs/
/// └── state/      # container runtime state root
/// ```
#[derive(Clone, Debug)]
pub struct GuestLayout {
    base: PathBuf,
}

impl GuestLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Runtime state root: {base}/state
    pub fn state_dir(&self) -> PathBuf {
        self.base.join(dirs::STATE)
    }
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self::new(GUEST_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_config_path() {
        let bundle = BundleLayout::new("/run/gcs/bundles/abc");
        assert_eq!(
            bundle.config_file(),
            PathBuf::from("/run/gcs/bundles/abc/config.json")
        );
    }

    #[test]
    fn test_scratch_paths() {
        let scratch = ScratchLayout::new("/mnt/scratch");
        assert_eq!(scratch.upper_dir(), PathBuf::from("/mnt/scratch/upper"));
        assert_eq!(scratch.work_dir(), PathBuf::from("/mnt/scratch/work"));
    }

    #[test]
    fn test_guest_layout_default() {
        let layout = GuestLayout::default();
        assert_eq!(layout.state_dir(), PathBuf::from("/run/gcs/state"));
    }
}
