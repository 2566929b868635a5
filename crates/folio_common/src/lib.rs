//! Common types and errors for Folio
//!
//! This crate provides the identifiers and the error taxonomy shared by the
//! sync engine, the configuration loader and the CLI.

pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core error types for Folio operations
///
/// The enum is `Clone` because a single reload failure is fanned out to every
/// caller that was waiting on the same fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FolioError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Filter not found: {0}")]
    NotFound(FilterId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Server unavailable: {0}")]
    TransientServer(String),

    #[error("Server rejected request ({code}): {message}")]
    TerminalServer { code: i32, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl FolioError {
    pub fn validation(message: impl Into<String>) -> Self {
        FolioError::Validation(message.into())
    }

    /// True for errors that a retry may cure
    pub fn is_transient(&self) -> bool {
        matches!(self, FolioError::TransientServer(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FolioError>;

/// Identifier of a dialog filter (folder)
///
/// Real filters use ids in `MIN..=MAX`. [`FilterId::MAIN_LIST`] stands for the
/// unfiltered main list and never appears in a filter collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(i32);

impl FilterId {
    pub const MAIN_LIST: FilterId = FilterId(0);
    pub const MIN: i32 = 2;
    pub const MAX: i32 = 255;

    pub const fn new(raw: i32) -> Self {
        FilterId(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        (Self::MIN..=Self::MAX).contains(&self.0)
    }

    /// All ids a newly created filter may receive, smallest first
    pub fn allocatable() -> impl Iterator<Item = FilterId> {
        (Self::MIN..=Self::MAX).map(FilterId)
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogId(i64);

impl DialogId {
    pub const fn new(raw: i64) -> Self {
        DialogId(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a dialog as stored inside a filter
///
/// The access hash is opaque to the engine; two references denote the same
/// dialog whenever their `dialog_id` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputDialogId {
    pub dialog_id: DialogId,
    #[serde(default)]
    pub access_hash: i64,
}

impl InputDialogId {
    pub const fn new(dialog_id: DialogId, access_hash: i64) -> Self {
        Self {
            dialog_id,
            access_hash,
        }
    }
}

impl From<DialogId> for InputDialogId {
    fn from(dialog_id: DialogId) -> Self {
        Self::new(dialog_id, 0)
    }
}

/// Exit code constants for the `folio` binary
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFIG_ERROR: i32 = 101;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_id_range() {
        assert!(!FilterId::MAIN_LIST.is_valid());
        assert!(!FilterId::new(1).is_valid());
        assert!(FilterId::new(2).is_valid());
        assert!(FilterId::new(255).is_valid());
        assert!(!FilterId::new(256).is_valid());
        assert_eq!(FilterId::allocatable().next(), Some(FilterId::new(2)));
        assert_eq!(FilterId::allocatable().count(), 254);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&FilterId::new(7)).unwrap();
        assert_eq!(json, "7");

        let input: InputDialogId = serde_json::from_str(r#"{"dialog_id":42}"#).unwrap();
        assert_eq!(input, InputDialogId::from(DialogId::new(42)));
    }

    #[test]
    fn test_error_display() {
        let err = FolioError::TerminalServer {
            code: 400,
            message: "FILTER_INCLUDE_TOO_MUCH".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Server rejected request (400): FILTER_INCLUDE_TOO_MUCH"
        );
        assert!(!err.is_transient());
        assert!(FolioError::TransientServer("timeout".into()).is_transient());
    }
}
