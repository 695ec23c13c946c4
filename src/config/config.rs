/// Configuration loading from config.json
use crate::config::presets::{self, CodeTable};
use crate::config::types::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_op_timeout_ms() -> u64 {
    5_000
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("seqbox")
}

fn default_true() -> bool {
    true
}

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Fail fast on validation errors instead of warning
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    /// Bound applied to operations that declare no timeout of their own
    #[serde(default = "default_op_timeout_ms")]
    pub default_op_timeout_ms: u64,
    /// Whole-run deadline, checked at phase boundaries
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    /// Parent directory of run-scoped workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// JSON-lines audit trail destination
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    /// Keep the ownership journal in run reports
    #[serde(default = "default_true")]
    pub keep_journal: bool,
    /// Per-library overrides of the built-in code tables
    #[serde(default)]
    pub code_tables: BTreeMap<String, CodeTable>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            default_op_timeout_ms: default_op_timeout_ms(),
            run_timeout_ms: None,
            workspace_root: default_workspace_root(),
            audit_log: None,
            keep_journal: true,
            code_tables: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            HarnessError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Load from `path` when given, otherwise defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Code table for a library: config override, then preset, then generic.
    pub fn code_table(&self, library: &str) -> CodeTable {
        if let Some(table) = self.code_tables.get(library) {
            return table.clone();
        }
        presets::preset_for(library).unwrap_or_else(|| CodeTable::generic(library))
    }

    pub fn op_timeout(&self, declared_ms: Option<u64>) -> Duration {
        Duration::from_millis(declared_ms.unwrap_or(self.default_op_timeout_ms))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }
}
