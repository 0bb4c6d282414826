//! Shared directory layout.
//!
//! Every process in the fleet derives its paths from one state directory so
//! that workers, the launcher, the sentinel and the healing stages agree on
//! where the file bus lives:
//!
//! ```text
//! <state>/workflows/<agent>/<workflow-id>.json
//! <state>/evidence/<workflow-id>--<timestamp>.json
//! <state>/evidence/screenshots/
//! <state>/status/<worker>.json
//! <state>/logs/<worker>.log
//! <state>/reverts/
//! <state>/healing/<queue>/{pending,processing,done,rejected}/
//! ```

use std::path::{Path, PathBuf};

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".fleet";

/// Default base URL of the application under test.
pub const DEFAULT_BASE_URL: &str = "http://localhost:3002";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPaths {
    root: PathBuf,
}

impl FleetPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join("evidence")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.evidence_dir().join("screenshots")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn reverts_dir(&self) -> PathBuf {
        self.root.join("reverts")
    }

    pub fn healing_dir(&self) -> PathBuf {
        self.root.join("healing")
    }

    /// Create every directory of the layout. Safe to call repeatedly.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.workflows_dir(),
            self.evidence_dir(),
            self.screenshots_dir(),
            self.status_dir(),
            self.logs_dir(),
            self.reverts_dir(),
            self.healing_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for FleetPaths {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }
}
