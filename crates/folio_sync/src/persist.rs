//! Durable filter state
//!
//! The record is a single JSON document holding the local list, the server
//! snapshot and the pending ledger. Writes whose content hash matches the
//! previous write are skipped.

use crate::model::DialogFilter;
use crate::pending::{PendingLedger, PendingOperation};
use crate::store::{FilterStore, ServerSnapshot};
use chrono::{DateTime, Utc};
use folio_common::FolioError;
use folio_config::FolioConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported state version {0}")]
    UnsupportedVersion(u32),
}

impl From<PersistError> for FolioError {
    fn from(err: PersistError) -> Self {
        FolioError::Persistence(err.to_string())
    }
}

fn default_version() -> u32 {
    STATE_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    /// When the server snapshot was fetched
    pub updated_at: Option<DateTime<Utc>>,
    pub main_position: usize,
    pub filters: Vec<DialogFilter>,
    pub server_main_position: usize,
    pub server_filters: Vec<DialogFilter>,
    #[serde(default)]
    pub pending: Vec<PendingOperation>,
}

impl PersistedState {
    pub fn new(local: &FilterStore, server: &ServerSnapshot, ledger: &PendingLedger) -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: server.fetched_at(),
            main_position: local.main_position(),
            filters: local.filters().to_vec(),
            server_main_position: server.main_position(),
            server_filters: server.filters().to_vec(),
            pending: ledger.to_persisted(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let state: Self = serde_json::from_slice(bytes)?;
        if state.version != STATE_VERSION {
            return Err(PersistError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    /// Structural check of both lists
    pub fn check(&self) -> Result<(), String> {
        FilterStore::check(&self.filters, self.main_position).map_err(|e| format!("local: {}", e))?;
        FilterStore::check(&self.server_filters, self.server_main_position)
            .map_err(|e| format!("server: {}", e))
    }
}

/// Byte-level storage for the state record
pub trait StateStore: Send {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError>;
    fn write(&mut self, record: &[u8]) -> Result<(), PersistError>;
}

/// State file on disk, replaced atomically on every write
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &FolioConfig) -> Self {
        Self::new(config.state_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, record: &[u8]) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, record)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRecord {
    bytes: Option<Vec<u8>>,
    writes: usize,
}

/// In-memory store; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(bytes: Vec<u8>) -> Self {
        let store = Self::default();
        store.lock().bytes = Some(bytes);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRecord> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn record(&self) -> Option<Vec<u8>> {
        self.lock().bytes.clone()
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.record())
    }

    fn write(&mut self, record: &[u8]) -> Result<(), PersistError> {
        let mut inner = self.lock();
        inner.bytes = Some(record.to_vec());
        inner.writes += 1;
        Ok(())
    }
}

/// Writes state records, skipping ones identical to the last write
pub struct StateWriter {
    store: Box<dyn StateStore>,
    last_digest: Option<String>,
}

impl StateWriter {
    pub fn new(store: Box<dyn StateStore>) -> Self {
        Self {
            store,
            last_digest: None,
        }
    }

    fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    pub fn load(&mut self) -> Result<Option<PersistedState>, PersistError> {
        let Some(bytes) = self.store.read()? else {
            return Ok(None);
        };
        let state = PersistedState::decode(&bytes)?;
        self.last_digest = Some(Self::digest(&bytes));
        Ok(Some(state))
    }

    /// Returns whether anything was written
    pub fn write(&mut self, state: &PersistedState) -> Result<bool, PersistError> {
        let bytes = state.encode()?;
        let digest = Self::digest(&bytes);
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            tracing::trace!("State unchanged, skipping write");
            return Ok(false);
        }
        self.store.write(&bytes)?;
        tracing::debug!("Persisted filter state ({} bytes)", bytes.len());
        self.last_digest = Some(digest);
        Ok(true)
    }
}

/// Read and validate the state file at `path`, if present
pub fn read_state_file(path: &Path) -> Result<Option<PersistedState>, PersistError> {
    FileStateStore::new(path)
        .read()?
        .map(|bytes| PersistedState::decode(&bytes))
        .transpose()
}
