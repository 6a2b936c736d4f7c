use crate::infrastructure::config::{ensure_default_configs, load_configs};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "daily-logger.sqlite";

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub database_path: PathBuf,
}

impl WorkspaceLayout {
    pub fn under(workspace_root: &Path) -> Self {
        let state_dir = workspace_root.join("state");
        Self {
            workspace_root: workspace_root.to_path_buf(),
            config_dir: workspace_root.join("config"),
            logs_dir: workspace_root.join("logs"),
            database_path: state_dir.join(DATABASE_FILE),
            state_dir,
        }
    }
}

/// Creates the directory tree, default config files and database schema.
/// Safe to run on every start.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<WorkspaceLayout, InfraError> {
    let layout = WorkspaceLayout::under(workspace_root);

    fs::create_dir_all(&layout.config_dir)?;
    fs::create_dir_all(&layout.logs_dir)?;
    fs::create_dir_all(&layout.state_dir)?;

    ensure_default_configs(&layout.config_dir)?;
    let _ = load_configs(&layout.config_dir)?;
    initialize_database(&layout.database_path)?;

    Ok(layout)
}
