//! In-process fake server for service tests

#![allow(dead_code)]

use async_trait::async_trait;
use folio_common::{DialogId, FilterId, InputDialogId};
use folio_config::FolioConfig;
use folio_sync::{
    DialogFilter, DialogResolver, FilterSpec, FilterTransport, InviteLink, InviteLinkCreated, InviteLinkPreview,
    RecommendedFilter, ResolvedDialogs, ServerFilterList, TransportError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Default)]
struct ServerState {
    filters: Vec<DialogFilter>,
    main_position: usize,
    list_calls: usize,
    saves: Vec<DialogFilter>,
    deletes: Vec<FilterId>,
    reorders: Vec<Vec<FilterId>>,
    mutation_failures: VecDeque<TransportError>,
    preview: Option<InviteLinkPreview>,
    links: Vec<InviteLink>,
    recommended: Vec<RecommendedFilter>,
}

/// Fake filter server
///
/// Fetches and mutations can be held back with a gate to observe requests
/// while they are in flight.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    fetch_gate: Option<Arc<Semaphore>>,
    mutation_gate: Option<Arc<Semaphore>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filters(filters: Vec<DialogFilter>) -> Self {
        let server = Self::default();
        server.state.lock().unwrap().filters = filters;
        server
    }

    /// Hold every fetch until `release_fetches` is called
    pub fn gate_fetches(mut self) -> Self {
        self.fetch_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn gate_mutations(mut self) -> Self {
        self.mutation_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release_fetches(&self, count: usize) {
        if let Some(gate) = &self.fetch_gate {
            gate.add_permits(count);
        }
    }

    pub fn release_mutations(&self, count: usize) {
        if let Some(gate) = &self.mutation_gate {
            gate.add_permits(count);
        }
    }

    pub fn fail_next_mutation(&self, error: TransportError) {
        self.state.lock().unwrap().mutation_failures.push_back(error);
    }

    pub fn set_preview(&self, preview: InviteLinkPreview) {
        self.state.lock().unwrap().preview = Some(preview);
    }

    pub fn set_invite_links(&self, links: Vec<InviteLink>) {
        self.state.lock().unwrap().links = links;
    }

    pub fn set_recommended(&self, recommended: Vec<RecommendedFilter>) {
        self.state.lock().unwrap().recommended = recommended;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn saves(&self) -> Vec<DialogFilter> {
        self.state.lock().unwrap().saves.clone()
    }

    pub fn deletes(&self) -> Vec<FilterId> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn server_ids(&self) -> Vec<FilterId> {
        self.state.lock().unwrap().filters.iter().map(|f| f.id).collect()
    }

    async fn pass(gate: &Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
    }

    async fn mutate<T>(&self, apply: impl FnOnce(&mut ServerState) -> T) -> Result<T, TransportError> {
        Self::pass(&self.mutation_gate).await;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.mutation_failures.pop_front() {
            return Err(error);
        }
        Ok(apply(&mut state))
    }
}

#[async_trait]
impl FilterTransport for MockServer {
    async fn list_filters(&self) -> Result<ServerFilterList, TransportError> {
        self.state.lock().unwrap().list_calls += 1;
        Self::pass(&self.fetch_gate).await;
        let state = self.state.lock().unwrap();
        Ok(ServerFilterList {
            filters: state.filters.clone(),
            main_position: state.main_position,
        })
    }

    async fn save_filter(&self, filter: &DialogFilter) -> Result<(), TransportError> {
        let filter = filter.clone();
        self.mutate(move |state| {
            state.saves.push(filter.clone());
            match state.filters.iter_mut().find(|f| f.id == filter.id) {
                Some(existing) => *existing = filter,
                None => state.filters.push(filter),
            }
        })
        .await
    }

    async fn delete_filter(&self, filter_id: FilterId) -> Result<(), TransportError> {
        self.mutate(move |state| {
            state.deletes.push(filter_id);
            state.filters.retain(|f| f.id != filter_id);
        })
        .await
    }

    async fn reorder_filters(&self, ids: &[FilterId], main_position: usize) -> Result<(), TransportError> {
        let ids = ids.to_vec();
        self.mutate(move |state| {
            state.reorders.push(ids.clone());
            let mut reordered: Vec<DialogFilter> = ids
                .iter()
                .filter_map(|id| state.filters.iter().find(|f| f.id == *id).cloned())
                .collect();
            reordered.extend(state.filters.iter().filter(|f| !ids.contains(&f.id)).cloned());
            state.filters = reordered;
            state.main_position = main_position.min(state.filters.len());
        })
        .await
    }

    async fn create_invite_link(
        &self,
        filter_id: FilterId,
        name: &str,
        dialog_ids: &[DialogId],
    ) -> Result<InviteLinkCreated, TransportError> {
        let state = self.state.lock().unwrap();
        let filter = state
            .filters
            .iter()
            .find(|f| f.id == filter_id)
            .cloned()
            .ok_or_else(|| TransportError::rejected(400, "FILTER_ID_INVALID"))?;
        Ok(InviteLinkCreated {
            filter,
            link: InviteLink {
                slug: "shared".to_string(),
                url: "https://t.me/addlist/shared".to_string(),
                name: name.to_string(),
                dialog_ids: dialog_ids.to_vec(),
            },
        })
    }

    async fn get_invite_links(&self, _filter_id: FilterId) -> Result<Vec<InviteLink>, TransportError> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn edit_invite_link(
        &self,
        _filter_id: FilterId,
        slug: &str,
        name: &str,
        dialog_ids: &[DialogId],
    ) -> Result<InviteLink, TransportError> {
        let edited = InviteLink {
            slug: slug.to_string(),
            url: format!("https://t.me/addlist/{}", slug),
            name: name.to_string(),
            dialog_ids: dialog_ids.to_vec(),
        };
        let mut state = self.state.lock().unwrap();
        let existing = state
            .links
            .iter_mut()
            .find(|link| link.slug == slug)
            .ok_or_else(|| TransportError::rejected(400, "INVITE_SLUG_EXPIRED"))?;
        *existing = edited.clone();
        Ok(edited)
    }

    async fn delete_invite_link(&self, _filter_id: FilterId, slug: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().links.retain(|link| link.slug != slug);
        Ok(())
    }

    async fn check_invite_link(&self, slug: &str) -> Result<InviteLinkPreview, TransportError> {
        let state = self.state.lock().unwrap();
        match &state.preview {
            Some(preview) if preview.slug == slug => Ok(preview.clone()),
            _ => Err(TransportError::rejected(400, "INVITE_SLUG_EXPIRED")),
        }
    }

    async fn join_invite_link(&self, slug: &str, dialog_ids: &[DialogId]) -> Result<DialogFilter, TransportError> {
        let mut state = self.state.lock().unwrap();
        let preview = state
            .preview
            .clone()
            .filter(|p| p.slug == slug)
            .ok_or_else(|| TransportError::rejected(400, "INVITE_SLUG_EXPIRED"))?;
        let used: Vec<FilterId> = state.filters.iter().map(|f| f.id).collect();
        let id = preview
            .filter_id
            .or_else(|| (2..=255).map(FilterId::new).find(|id| !used.contains(id)))
            .ok_or_else(|| TransportError::rejected(400, "FILTERS_TOO_MUCH"))?;
        let mut filter = FilterSpec::new(preview.title.clone())
            .with_included(dialog_ids.iter().map(|d| InputDialogId::from(*d)))
            .into_filter(id, Some(Default::default()));
        filter.icon_name = preview.icon_name.clone();
        if !used.contains(&id) {
            state.filters.push(filter.clone());
        }
        Ok(filter)
    }

    async fn get_recommended_filters(&self) -> Result<Vec<RecommendedFilter>, TransportError> {
        Ok(self.state.lock().unwrap().recommended.clone())
    }
}

/// Resolver whose dialog lookups always time out
#[derive(Clone, Copy, Default)]
pub struct FailingResolver;

#[async_trait]
impl DialogResolver for FailingResolver {
    async fn resolve(&self, _dialogs: &[InputDialogId]) -> Result<ResolvedDialogs, TransportError> {
        Err(TransportError::Timeout)
    }
}

/// Resolver that can't find the listed dialogs
#[derive(Clone, Default)]
pub struct MissingDialogs(pub Vec<DialogId>);

#[async_trait]
impl DialogResolver for MissingDialogs {
    async fn resolve(&self, dialogs: &[InputDialogId]) -> Result<ResolvedDialogs, TransportError> {
        let (unavailable, available): (Vec<DialogId>, Vec<DialogId>) = dialogs
            .iter()
            .map(|d| d.dialog_id)
            .partition(|id| self.0.contains(id));
        Ok(ResolvedDialogs { available, unavailable })
    }
}

pub fn dialog(raw: i64) -> InputDialogId {
    InputDialogId::from(DialogId::new(raw))
}

pub fn filter(id: i32, title: &str) -> DialogFilter {
    FilterSpec::new(title)
        .with_included([dialog(id as i64 * 10)])
        .into_filter(FilterId::new(id), None)
}

/// Defaults with millisecond retry backoff
pub fn fast_config() -> FolioConfig {
    let mut config = FolioConfig::default();
    config.sync.retry_initial_ms = 1;
    config.sync.retry_cap_ms = 4;
    config
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
