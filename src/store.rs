use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{FRAMEWORK_DIR, FormId};
use crate::error::SyncError;

/// Name of the form definition file every installable form directory carries.
pub const DEFINITION_FILE: &str = "formDef.json";

/// Subdirectory holding completed records; carried over across form updates.
pub const INSTANCES_DIR: &str = "instances";

/// App-scoped filesystem layout: the live forms tree, the staging scratch
/// area, and the stale holding area used for swaps and quarantine.
#[derive(Debug, Clone)]
pub struct FormsStore {
    forms_root: Utf8PathBuf,
    staging_root: Utf8PathBuf,
    stale_root: Utf8PathBuf,
}

impl FormsStore {
    pub fn new(app_root: &Utf8Path) -> Self {
        Self {
            forms_root: app_root.join("forms"),
            staging_root: app_root.join("staging"),
            stale_root: app_root.join("stale"),
        }
    }

    pub fn forms_root(&self) -> &Utf8Path {
        &self.forms_root
    }

    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    pub fn stale_root(&self) -> &Utf8Path {
        &self.stale_root
    }

    pub fn form_dir(&self, id: &FormId) -> Utf8PathBuf {
        if id.is_framework() {
            self.framework_dir()
        } else {
            self.forms_root.join(id.as_str())
        }
    }

    pub fn framework_dir(&self) -> Utf8PathBuf {
        self.forms_root.join(FRAMEWORK_DIR)
    }

    pub fn definition_path(form_dir: &Utf8Path) -> Utf8PathBuf {
        form_dir.join(DEFINITION_FILE)
    }

    pub fn ensure_roots(&self) -> Result<(), SyncError> {
        for root in [&self.forms_root, &self.staging_root, &self.stale_root] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Allocate an unused scratch directory name in the staging root and
    /// create it. Base-name collisions get an incrementing numeric suffix.
    pub fn allocate_staging_dir(&self, base: &str) -> Result<Utf8PathBuf, SyncError> {
        let path = unique_child(&self.staging_root, base);
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(path)
    }

    /// Reserve (but do not create) an unused holding path in the stale root.
    pub fn allocate_stale_path(&self, base: &str) -> Result<Utf8PathBuf, SyncError> {
        fs::create_dir_all(self.stale_root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(unique_child(&self.stale_root, base))
    }

    /// Move a directory into the stale holding area under a fresh name.
    pub fn quarantine_dir(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, SyncError> {
        let base = dir.file_name().unwrap_or("quarantined");
        let dest = self.allocate_stale_path(base)?;
        fs::rename(dir.as_std_path(), dest.as_std_path()).map_err(|err| {
            SyncError::Filesystem(format!("quarantine {dir}: {err}"))
        })?;
        Ok(dest)
    }

    /// Candidate form directories: immediate children of the forms root that
    /// contain a definition file.
    pub fn list_form_dirs(&self) -> Result<Vec<Utf8PathBuf>, SyncError> {
        if !self.forms_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let entries = fs::read_dir(self.forms_root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| SyncError::Filesystem(format!("non-utf8 path {}", path.display())))?;
            if path.is_dir() && Self::definition_path(&path).as_std_path().is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

}

fn unique_child(root: &Utf8Path, base: &str) -> Utf8PathBuf {
    let candidate = root.join(base);
    if !candidate.as_std_path().exists() {
        return candidate;
    }
    let mut suffix = 2usize;
    loop {
        let candidate = root.join(format!("{base}_{suffix}"));
        if !candidate.as_std_path().exists() {
            return candidate;
        }
        suffix += 1;
    }
}

pub fn rename_dir(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path())?;
    }
    fs::rename(from.as_std_path(), to.as_std_path())
}
