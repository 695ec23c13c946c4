/// Run-scoped workspace
///
/// Every run gets a private directory under the configured workspace root,
/// named by its run id, so concurrent runs never share files. Anything a
/// script writes through a `workspace_path` input lives here and the whole
/// directory is removed when the run ends.
use crate::config::types::{HarnessError, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Workspace for one run's files
#[derive(Debug)]
pub struct Workspace {
    run_id: Uuid,
    run_dir: PathBuf,
    /// Files handed out to the script
    temp_files: Vec<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    /// Create the run directory `<base_dir>/<run_id>`.
    pub fn new(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir).map_err(|e| {
            HarnessError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                run_dir.display(),
                e
            ))
        })?;
        debug!("workspace {} created", run_dir.display());

        Ok(Self {
            run_id,
            run_dir,
            temp_files: Vec::new(),
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Resolve a script-supplied file name inside the run directory.
    ///
    /// Only plain relative names are accepted; anything that could escape the
    /// directory (absolute paths, `..`) is rejected.
    pub fn path_for(&mut self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(HarnessError::Workspace(format!(
                "workspace file name must be relative and stay inside the run directory: {:?}",
                name
            )));
        }
        let path = self.run_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.register_temp_file(path.clone());
        Ok(path)
    }

    /// Register temporary file for cleanup
    pub fn register_temp_file(&mut self, path: PathBuf) {
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path);
        }
    }

    /// Create an empty temporary file in the workspace
    pub fn create_temp_file(&mut self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        fs::write(&path, b"").map_err(|e| {
            HarnessError::Workspace(format!(
                "Failed to create temp file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(path)
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        &self.temp_files
    }

    /// Remove every file and the run directory (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        for temp_file in &self.temp_files {
            if temp_file.exists() {
                if let Err(e) = fs::remove_file(temp_file) {
                    warn!("Failed to remove temp file {}: {}", temp_file.display(), e);
                }
            }
        }
        if self.run_dir.exists() {
            fs::remove_dir_all(&self.run_dir).map_err(|e| {
                HarnessError::Workspace(format!(
                    "Failed to remove run directory {}: {}",
                    self.run_dir.display(),
                    e
                ))
            })?;
        }
        self.cleaned = true;
        debug!("workspace {} removed", self.run_dir.display());
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_creation_and_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::new(base.path(), Uuid::new_v4()).unwrap();
        assert!(workspace.run_dir().exists());

        let file = workspace.create_temp_file("out.gz").unwrap();
        assert!(file.exists());
        assert_eq!(workspace.temp_files().len(), 1);

        workspace.cleanup().unwrap();
        assert!(!file.exists());
        assert!(!workspace.run_dir().exists());
        workspace.cleanup().unwrap();
    }

    #[test]
    fn test_path_for_rejects_escapes() {
        let base = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::new(base.path(), Uuid::new_v4()).unwrap();
        assert!(workspace.path_for("../etc/passwd").is_err());
        assert!(workspace.path_for("/tmp/x").is_err());
        assert!(workspace.path_for("").is_err());
        let nested = workspace.path_for("sub/data.bin").unwrap();
        assert!(nested.starts_with(workspace.run_dir()));
    }

    #[test]
    fn test_concurrent_runs_get_distinct_directories() {
        let base = tempfile::tempdir().unwrap();
        let a = Workspace::new(base.path(), Uuid::new_v4()).unwrap();
        let b = Workspace::new(base.path(), Uuid::new_v4()).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
    }

    #[test]
    fn test_drop_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = {
            let workspace = Workspace::new(base.path(), Uuid::new_v4()).unwrap();
            workspace.run_dir().to_path_buf()
        };
        assert!(!run_dir.exists());
    }
}
