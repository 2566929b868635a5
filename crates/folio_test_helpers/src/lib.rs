//! Shared test utilities for Folio test suites
//!
//! # Modules
//!
//! - [`workspace`]: temporary workspaces with a `.folio` directory
//! - [`cli`]: command builders with a quiet, isolated environment
//! - [`logging`]: test logging configuration
//! - [`assertions`]: output predicates
//!
//! # Example
//!
//! ```rust,no_run
//! use folio_test_helpers::prelude::*;
//!
//! let workspace = init_workspace();
//! folio_command()
//!     .current_dir(workspace.path())
//!     .args(["state", "check"])
//!     .assert()
//!     .success();
//! ```

pub mod assertions;
pub mod cli;
pub mod logging;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::folio_command;
    pub use crate::logging::{init_test_logging, suppress_logs};
    pub use crate::workspace::{init_workspace, temp_dir, workspace_with_config, workspace_with_state};
}
