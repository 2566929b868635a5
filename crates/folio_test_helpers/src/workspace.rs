//! Workspace initialization utilities for tests

use assert_fs::TempDir;
use std::fs;

/// Create a temporary directory, removed on drop
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Temp directory with an empty `.folio/state` tree
///
/// ```rust
/// use folio_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".folio/state").is_dir());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    fs::create_dir_all(temp.path().join(".folio").join("state"))
        .expect("Failed to create .folio/state directory");
    temp
}

/// Workspace whose `.folio/config.toml` holds `toml`
pub fn workspace_with_config(toml: &str) -> TempDir {
    let workspace = init_workspace();
    fs::write(workspace.path().join(".folio").join("config.toml"), toml)
        .expect("Failed to write config file");
    workspace
}

/// Workspace with a persisted state record at the default location
pub fn workspace_with_state(json: &str) -> TempDir {
    let workspace = init_workspace();
    fs::write(
        workspace.path().join(".folio").join("state").join("filters.json"),
        json,
    )
    .expect("Failed to write state file");
    workspace
}
