//! Server and dialog-resolver seams

use crate::invite::{InviteLink, InviteLinkCreated, InviteLinkPreview};
use crate::model::{DialogFilter, RecommendedFilter, ServerFilterList};
use async_trait::async_trait;
use folio_common::{DialogId, FilterId, FolioError, InputDialogId};
use folio_config::SyncConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Rejected ({code}): {message}")]
    Rejected { code: i32, message: String },
}

impl TransportError {
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        TransportError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

impl From<TransportError> for FolioError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { code, message } => FolioError::TerminalServer { code, message },
            other => FolioError::TransientServer(other.to_string()),
        }
    }
}

/// Remote filter API
#[async_trait]
pub trait FilterTransport: Send + Sync {
    async fn list_filters(&self) -> Result<ServerFilterList, TransportError>;

    /// Create or replace a filter definition
    async fn save_filter(&self, filter: &DialogFilter) -> Result<(), TransportError>;

    async fn delete_filter(&self, filter_id: FilterId) -> Result<(), TransportError>;

    async fn reorder_filters(&self, ids: &[FilterId], main_position: usize) -> Result<(), TransportError>;

    async fn create_invite_link(
        &self,
        filter_id: FilterId,
        name: &str,
        dialog_ids: &[DialogId],
    ) -> Result<InviteLinkCreated, TransportError>;

    async fn get_invite_links(&self, filter_id: FilterId) -> Result<Vec<InviteLink>, TransportError>;

    async fn edit_invite_link(
        &self,
        filter_id: FilterId,
        slug: &str,
        name: &str,
        dialog_ids: &[DialogId],
    ) -> Result<InviteLink, TransportError>;

    async fn delete_invite_link(&self, filter_id: FilterId, slug: &str) -> Result<(), TransportError>;

    async fn check_invite_link(&self, slug: &str) -> Result<InviteLinkPreview, TransportError>;

    /// Import dialogs from a link; returns the filter as stored on the server
    async fn join_invite_link(&self, slug: &str, dialog_ids: &[DialogId]) -> Result<DialogFilter, TransportError>;

    async fn get_recommended_filters(&self) -> Result<Vec<RecommendedFilter>, TransportError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDialogs {
    pub available: Vec<DialogId>,
    pub unavailable: Vec<DialogId>,
}

/// Loads dialog metadata so that filter members can be displayed
#[async_trait]
pub trait DialogResolver: Send + Sync {
    async fn resolve(&self, dialogs: &[InputDialogId]) -> Result<ResolvedDialogs, TransportError>;
}

/// Resolver that reports every dialog as available
#[derive(Debug, Default, Clone, Copy)]
pub struct AllAvailable;

#[async_trait]
impl DialogResolver for AllAvailable {
    async fn resolve(&self, dialogs: &[InputDialogId]) -> Result<ResolvedDialogs, TransportError> {
        Ok(ResolvedDialogs {
            available: dialogs.iter().map(|d| d.dialog_id).collect(),
            unavailable: Vec::new(),
        })
    }
}

/// Exponential delay between retries of a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self { initial, cap }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.retry_initial(), config.retry_cap())
    }

    /// Delay before retry number `attempt`, counting from zero
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// Run `call` until it succeeds or fails terminally
pub async fn retry_transient<T, F, Fut>(backoff: Backoff, what: &str, mut call: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_transient() => {
                let delay = backoff.delay(attempt);
                tracing::warn!("{} failed: {}; retry {} in {:?}", what, e, attempt + 1, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_error_mapping() {
        assert!(TransportError::Timeout.is_transient());
        assert!(!TransportError::rejected(400, "FILTER_ID_INVALID").is_transient());

        let terminal: FolioError = TransportError::rejected(400, "FILTER_ID_INVALID").into();
        assert_eq!(
            terminal,
            FolioError::TerminalServer {
                code: 400,
                message: "FILTER_ID_INVALID".to_string()
            }
        );
        let transient: FolioError = TransportError::Disconnected("reset".into()).into();
        assert!(transient.is_transient());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(4));
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(40), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));
        let result = retry_transient(backoff, "save", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(TransportError::Timeout)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));
        let result: Result<(), _> = retry_transient(backoff, "delete", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::rejected(403, "denied"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_available_resolver() {
        let resolved = AllAvailable
            .resolve(&[InputDialogId::from(DialogId::new(3))])
            .await
            .unwrap();
        assert_eq!(resolved.available, vec![DialogId::new(3)]);
        assert!(resolved.unavailable.is_empty());
    }
}
