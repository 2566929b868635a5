//! CLI command builders for tests

use assert_cmd::Command;

/// The `folio` binary with `RUST_LOG=error`
///
/// ```rust,no_run
/// use folio_test_helpers::cli::folio_command;
///
/// folio_command().arg("--version").assert().success();
/// ```
#[allow(deprecated)]
pub fn folio_command() -> Command {
    let mut cmd = Command::cargo_bin("folio").expect("Failed to find folio binary");
    cmd.env("RUST_LOG", "error");
    cmd.env_remove("FOLIO_LOG_JSON");
    cmd
}
