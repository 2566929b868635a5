//! # Folio Sync Engine
//!
//! Client-side management of dialog filters (chat folders) kept in sync with
//! a remote server.
//!
//! ## Architecture
//!
//! - **Local state**: ordered filters plus the main list position, changed
//!   optimistically and shown to the user at once
//! - **Server snapshot**: the last fetched list, replaced wholesale
//! - **Pending ledger**: mutations awaiting confirmation, sent one at a time
//! - **Scheduler**: single-flight reloads with periodic refresh and jittered
//!   retry
//! - **Service**: a tokio task that owns all of the above and drives the
//!   transport
//!
//! ## Usage
//!
//! ```rust,no_run
//! use folio_sync::{FilterService, FilterSpec, FileStateStore, AllAvailable};
//! use folio_config::FolioConfig;
//! use std::sync::Arc;
//!
//! # async fn run(transport: Arc<dyn folio_sync::FilterTransport>) -> anyhow::Result<()> {
//! let config = FolioConfig::load(std::path::Path::new("."))?;
//! let store = FileStateStore::from_config(&config);
//! let client = FilterService::spawn(config, transport, Arc::new(AllAvailable), Box::new(store));
//!
//! client.reload().await?;
//! let info = client.create_filter(FilterSpec::new("Work"), false).await?;
//! println!("created filter {}", info.id);
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod invite;
pub mod manager;
pub mod model;
pub mod pending;
pub mod persist;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

pub use invite::{parse_invite_link, InviteLink, InviteLinkCreated, InviteLinkPreview};
pub use manager::{Effect, FilterManager, SyncRequest};
pub use model::{
    DialogFilter, FilterFlags, FilterInfo, FilterSpec, FiltersUpdate, RecommendedFilter, ServerFilterList,
    ShareState,
};
pub use pending::{OperationKind, PendingLedger, PendingOperation};
pub use persist::{FileStateStore, MemoryStateStore, PersistError, PersistedState, StateStore, StateWriter};
pub use reconcile::{reconcile, NotificationGate};
pub use scheduler::{SchedulerState, SyncScheduler};
pub use service::{FilterClient, FilterService};
pub use store::{FilterStore, InsertAt, ServerSnapshot};
pub use transport::{AllAvailable, Backoff, DialogResolver, FilterTransport, ResolvedDialogs, TransportError};
