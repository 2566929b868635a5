//! Merging a fetched server list into local state

use crate::model::{DialogFilter, FiltersUpdate};
use crate::pending::PendingLedger;
use crate::store::{FilterStore, ServerSnapshot};
use folio_common::FilterId;
use std::collections::{HashMap, HashSet};

/// Compute the next local state from the current one and a fresh snapshot
///
/// Server content wins unless a save for the filter is pending; a pending
/// delete suppresses resurrection; local-only filters survive only while a
/// save for them is pending. A pending reorder keeps the local order and main
/// position.
pub fn reconcile(local: &FilterStore, server: &ServerSnapshot, ledger: &PendingLedger) -> FilterStore {
    let mut content: HashMap<FilterId, DialogFilter> = HashMap::new();

    for remote in server.filters() {
        if ledger.has_pending_delete(remote.id) {
            tracing::debug!("Filter {} is being deleted, ignoring server copy", remote.id);
            continue;
        }
        let kept = if ledger.has_pending_save(remote.id) {
            local.get(remote.id).cloned().unwrap_or_else(|| remote.clone())
        } else {
            remote.clone()
        };
        content.insert(remote.id, kept);
    }

    for filter in local.filters() {
        if server.contains(filter.id) {
            continue;
        }
        if ledger.has_pending_save(filter.id) {
            content.insert(filter.id, filter.clone());
        } else {
            tracing::debug!("Filter {} was deleted elsewhere", filter.id);
        }
    }

    let order = if ledger.has_pending_reorder() {
        local_order(local, server, &content)
    } else {
        server_order(local, server, &content)
    };

    let main_position = if ledger.has_pending_reorder() {
        local.main_position()
    } else {
        server.main_position()
    }
    .min(order.len());

    let filters = order
        .into_iter()
        .filter_map(|id| content.remove(&id))
        .collect();
    FilterStore::from_parts(filters, main_position)
}

/// Server order, with local-only filters placed after the filter they
/// followed locally
fn server_order(
    local: &FilterStore,
    server: &ServerSnapshot,
    content: &HashMap<FilterId, DialogFilter>,
) -> Vec<FilterId> {
    let mut order: Vec<FilterId> = server
        .ids()
        .into_iter()
        .filter(|id| content.contains_key(id))
        .collect();

    let local_ids = local.ids();
    for (index, id) in local_ids.iter().enumerate() {
        if server.contains(*id) || !content.contains_key(id) {
            continue;
        }
        let predecessor = local_ids[..index]
            .iter()
            .rev()
            .find_map(|prev| order.iter().position(|placed| placed == prev));
        match predecessor {
            Some(at) => order.insert(at + 1, *id),
            None => order.insert(0, *id),
        }
    }
    order
}

/// Local order, with filters new from the server appended in server order
fn local_order(
    local: &FilterStore,
    server: &ServerSnapshot,
    content: &HashMap<FilterId, DialogFilter>,
) -> Vec<FilterId> {
    let mut order: Vec<FilterId> = local
        .ids()
        .into_iter()
        .filter(|id| content.contains_key(id))
        .collect();
    let placed: HashSet<FilterId> = order.iter().copied().collect();
    order.extend(
        server
            .ids()
            .into_iter()
            .filter(|id| content.contains_key(id) && !placed.contains(id)),
    );
    order
}

/// Relative order of the ids both sides know
pub fn common_order(local: &[FilterId], server: &[FilterId]) -> (Vec<FilterId>, Vec<FilterId>) {
    let local_set: HashSet<&FilterId> = local.iter().collect();
    let server_set: HashSet<&FilterId> = server.iter().collect();
    (
        local.iter().filter(|id| server_set.contains(id)).copied().collect(),
        server.iter().filter(|id| local_set.contains(id)).copied().collect(),
    )
}

/// Suppresses notifications that would repeat the last one sent
#[derive(Debug, Default)]
pub struct NotificationGate {
    last_sent: Option<FiltersUpdate>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the update if it differs from the last one let through
    pub fn offer(&mut self, update: FiltersUpdate) -> Option<FiltersUpdate> {
        if self.last_sent.as_ref() == Some(&update) {
            return None;
        }
        self.last_sent = Some(update.clone());
        Some(update)
    }

    pub fn last_sent(&self) -> Option<&FiltersUpdate> {
        self.last_sent.as_ref()
    }
}
