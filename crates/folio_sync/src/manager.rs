//! Optimistic mutation orchestration
//!
//! [`FilterManager`] is the single owner of local state, the server snapshot
//! and the pending ledger. It never performs I/O: every outbound request,
//! persistence write and notification is queued as an [`Effect`] that the
//! service drains after each event.

use crate::model::{DialogFilter, FilterInfo, FilterSpec, FiltersUpdate, RecommendedFilter, ServerFilterList};
use crate::pending::{Confirmed, OperationKind, PendingLedger, PendingOperation};
use crate::persist::PersistedState;
use crate::reconcile::{common_order, reconcile, NotificationGate};
use crate::scheduler::{ReloadWaiter, SchedulerState, SyncScheduler};
use crate::store::{FilterStore, InsertAt, ServerSnapshot};
use chrono::Utc;
use folio_common::{DialogId, FilterId, FolioError, InputDialogId, Result};
use folio_config::{FolioConfig, LimitsConfig};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Deferred server mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Save(DialogFilter),
    Delete(FilterId),
    Reorder {
        ids: Vec<FilterId>,
        main_position: usize,
    },
}

/// Work the owner of a [`FilterManager`] must carry out
#[derive(Debug)]
pub enum Effect {
    /// Fetch the full filter list; report back with the same epoch
    Fetch { epoch: u64 },
    /// Send a pending operation; report back with the same sequence number
    Sync { seq: u64, request: SyncRequest },
    Persist(PersistedState),
    Notify(FiltersUpdate),
    /// Hydrate dialogs through the resolver, removing the unavailable ones
    LoadDialogs {
        filter_id: FilterId,
        dialogs: Vec<InputDialogId>,
    },
}

pub struct FilterManager {
    limits: LimitsConfig,
    local: FilterStore,
    server: ServerSnapshot,
    ledger: PendingLedger,
    scheduler: SyncScheduler,
    gate: NotificationGate,
    outbox: Vec<Effect>,
}

impl FilterManager {
    /// Create the manager from persisted state and arm the first reload
    ///
    /// Queued operations left over from a previous session are sent again.
    pub fn new(config: &FolioConfig, persisted: Option<PersistedState>, now: Instant) -> Self {
        let mut manager = Self {
            limits: config.limits.clone(),
            local: FilterStore::new(),
            server: ServerSnapshot::default(),
            ledger: PendingLedger::new(),
            scheduler: SyncScheduler::new(&config.sync),
            gate: NotificationGate::new(),
            outbox: Vec::new(),
        };

        if let Some(state) = persisted {
            manager.restore(state);
        }
        let _ = manager.gate.offer(manager.local.to_update());
        manager.schedule_first_reload(now);
        manager.pump();
        manager
    }

    fn restore(&mut self, state: PersistedState) {
        if let Err(violation) = state.check() {
            tracing::warn!("Discarding persisted filter state: {}", violation);
            return;
        }
        self.local = FilterStore::from_parts(state.filters, state.main_position);
        self.server = ServerSnapshot::from_list(
            ServerFilterList {
                filters: state.server_filters,
                main_position: state.server_main_position,
            },
            state.updated_at,
        );
        self.ledger = PendingLedger::restore(state.pending);
        tracing::info!(
            "Restored {} filters and {} pending operations",
            self.local.len(),
            self.ledger.len()
        );
    }

    fn schedule_first_reload(&mut self, now: Instant) {
        let interval = self.scheduler.refresh_interval();
        let delay = match self.server.fetched_at() {
            None => Duration::ZERO,
            Some(fetched_at) => {
                let elapsed = (Utc::now() - fetched_at).to_std().unwrap_or(Duration::ZERO);
                interval.saturating_sub(elapsed)
            }
        };
        tracing::debug!("First filter reload in {:?}", delay);
        self.scheduler.arm(now + delay);
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn local(&self) -> &FilterStore {
        &self.local
    }

    pub fn server(&self) -> &ServerSnapshot {
        &self.server
    }

    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    pub fn get_filter(&self, id: FilterId) -> Option<&DialogFilter> {
        self.local.get(id)
    }

    pub(crate) fn require_filter(&self, id: FilterId) -> Result<&DialogFilter> {
        self.local.get(id).ok_or(FolioError::NotFound(id))
    }

    /// Snapshot for a newly attached observer
    pub fn current_state(&self) -> FiltersUpdate {
        self.local.to_update()
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.outbox.push(effect);
    }

    /// Local state differs from the server snapshot somewhere the server has
    /// not acknowledged yet
    pub fn need_synchronize(&self) -> bool {
        let mut ids = self.local.ids();
        ids.extend(self.server.ids().into_iter().filter(|id| !self.local.contains(*id)));
        for id in ids {
            if self.ledger.has_acknowledged(id) {
                continue;
            }
            if self.local.get(id) != self.server.get(id) {
                return true;
            }
        }
        if self.ledger.has_acknowledged_reorder() {
            return false;
        }
        let (local_order, server_order) = common_order(&self.local.ids(), &self.server.ids());
        local_order != server_order || self.local.main_position() != self.server.main_position()
    }

    pub fn persisted_state(&self) -> PersistedState {
        PersistedState::new(&self.local, &self.server, &self.ledger)
    }

    // ----- mutations -----

    pub fn create(&mut self, spec: FilterSpec, at_beginning: bool) -> Result<FilterInfo> {
        if self.local.len() >= self.limits.max_filters {
            return Err(FolioError::Validation(format!(
                "Maximum number of filters ({}) reached",
                self.limits.max_filters
            )));
        }
        spec.validate(&self.limits, false)?;
        let id = self
            .allocate_id()
            .ok_or_else(|| FolioError::validation("No free filter identifier left"))?;

        let filter = spec.into_filter(id, None);
        let info = filter.info();
        let at = if at_beginning {
            InsertAt::Beginning
        } else {
            InsertAt::End
        };
        self.local.insert(filter, at);
        self.ledger.push(OperationKind::Create(id));
        if at_beginning {
            self.ledger.push(OperationKind::Reorder);
        }
        tracing::info!(filter_id = %id, "Created filter");
        self.changed();
        Ok(info)
    }

    /// Smallest id nobody uses, including filters whose deletion is pending
    fn allocate_id(&self) -> Option<FilterId> {
        FilterId::allocatable().find(|id| {
            !self.local.contains(*id)
                && !self.server.contains(*id)
                && !self.ledger.operations().iter().any(|op| op.touches(*id))
        })
    }

    pub fn edit(&mut self, id: FilterId, spec: FilterSpec) -> Result<FilterInfo> {
        let current = self.require_filter(id)?;
        spec.validate(&self.limits, current.is_shareable())?;
        let filter = spec.into_filter(id, current.share);
        if &filter == current {
            return Ok(filter.info());
        }
        Ok(self.commit_edit(filter))
    }

    fn commit_edit(&mut self, filter: DialogFilter) -> FilterInfo {
        let info = filter.info();
        let id = filter.id;
        self.local.replace(filter);
        self.ledger.push(OperationKind::Edit(id));
        tracing::debug!(filter_id = %id, "Edited filter");
        self.changed();
        info
    }

    /// Re-validate an edited membership and record it
    fn apply_membership(&mut self, filter: DialogFilter) -> Result<()> {
        filter.spec().validate(&self.limits, filter.is_shareable())?;
        if self.local.get(filter.id) == Some(&filter) {
            return Ok(());
        }
        self.commit_edit(filter);
        Ok(())
    }

    pub fn delete(&mut self, id: FilterId) -> Result<()> {
        if !self.remove_filter(id) {
            tracing::debug!(filter_id = %id, "Delete of unknown filter ignored");
        }
        Ok(())
    }

    /// Remove a filter locally and queue its deletion; false if unknown
    fn remove_filter(&mut self, id: FilterId) -> bool {
        let Some(removed) = self.local.remove(id) else {
            return false;
        };
        self.ledger.drop_queued_saves(id);
        if self.server.contains(id) || self.ledger.server_may_know(id) {
            self.ledger.push(OperationKind::Delete(id));
        }
        if removed.is_shareable() {
            tracing::info!(filter_id = %id, "Deleting shareable filter revokes its invite links");
        }
        tracing::info!(filter_id = %id, "Deleted filter");
        self.changed();
        true
    }

    pub fn reorder(&mut self, ids: Vec<FilterId>, main_position: usize) -> Result<()> {
        let requested: HashSet<FilterId> = ids.iter().copied().collect();
        if requested.len() != ids.len() {
            return Err(FolioError::Conflict(
                "Filter order lists a filter more than once".to_string(),
            ));
        }
        let current: HashSet<FilterId> = self.local.ids().into_iter().collect();
        if requested != current {
            return Err(FolioError::Conflict(
                "Filter order must list exactly the current filters".to_string(),
            ));
        }
        if main_position > ids.len() {
            return Err(FolioError::Validation(format!(
                "Main list position {} is out of range 0..={}",
                main_position,
                ids.len()
            )));
        }
        if ids == self.local.ids() && main_position == self.local.main_position() {
            return Ok(());
        }
        self.local.reorder(&ids, main_position);
        self.ledger.push(OperationKind::Reorder);
        self.changed();
        Ok(())
    }

    pub fn set_pinned(&mut self, id: FilterId, pinned: Vec<InputDialogId>) -> Result<()> {
        let mut filter = self.require_filter(id)?.clone();
        for dialog in &pinned {
            include_dialog(&mut filter, *dialog);
        }
        filter.pinned = pinned;
        self.apply_membership(filter)
    }

    pub fn set_is_pinned(&mut self, id: FilterId, dialog: InputDialogId, is_pinned: bool) -> Result<()> {
        let mut filter = self.require_filter(id)?.clone();
        if is_pinned {
            if filter.is_pinned(dialog.dialog_id) {
                return Ok(());
            }
            include_dialog(&mut filter, dialog);
            filter.pinned.insert(0, dialog);
        } else {
            filter.pinned.retain(|d| d.dialog_id != dialog.dialog_id);
        }
        self.apply_membership(filter)
    }

    pub fn add_dialog(&mut self, id: FilterId, dialog: InputDialogId) -> Result<()> {
        let mut filter = self.require_filter(id)?.clone();
        if filter.includes(dialog.dialog_id) {
            return Ok(());
        }
        include_dialog(&mut filter, dialog);
        self.apply_membership(filter)
    }

    /// Filters the dialog could still be added to without passing the
    /// per-filter dialog ceiling
    pub fn filters_to_add_dialog(&self, dialog: DialogId) -> Vec<FilterId> {
        self.local
            .filters()
            .iter()
            .filter(|filter| !filter.includes(dialog))
            .filter(|filter| {
                let total = filter.included.len() + filter.excluded.len()
                    - usize::from(filter.excludes(dialog));
                total < self.limits.max_filter_dialogs
            })
            .map(|filter| filter.id)
            .collect()
    }

    // ----- dialog loading -----

    /// Every dialog reference of a filter, for hydration
    pub fn dialogs_to_load(&self, id: FilterId) -> Result<Vec<InputDialogId>> {
        Ok(self.require_filter(id)?.dialogs())
    }

    /// Check that the given references belong to the filter
    pub fn check_filter_dialogs(&self, id: FilterId, dialogs: &[InputDialogId]) -> Result<()> {
        let filter = self.require_filter(id)?;
        let known: HashSet<DialogId> = filter.dialogs().iter().map(|d| d.dialog_id).collect();
        match dialogs.iter().find(|d| !known.contains(&d.dialog_id)) {
            Some(stray) => Err(FolioError::Validation(format!(
                "Dialog {} doesn't belong to filter {}",
                stray.dialog_id, id
            ))),
            None => Ok(()),
        }
    }

    /// Drop dialogs the resolver could not find; a filter left selecting
    /// nothing is deleted
    pub fn on_dialogs_loaded(&mut self, id: FilterId, unavailable: &[DialogId]) {
        if unavailable.is_empty() {
            return;
        }
        let Some(mut filter) = self.local.get(id).cloned() else {
            return;
        };
        let gone: HashSet<DialogId> = unavailable.iter().copied().collect();
        if !filter.remove_dialogs(&gone) {
            return;
        }
        tracing::info!(filter_id = %id, "Removing {} unavailable dialogs", gone.len());
        if filter.included.is_empty() && !filter.flags.includes_any_category() {
            tracing::info!(filter_id = %id, "Filter became empty, deleting it");
            self.remove_filter(id);
            return;
        }
        self.commit_edit(filter);
    }

    // ----- reloads -----

    pub fn request_reload(&mut self, waiter: Option<ReloadWaiter>) {
        if self.scheduler.request(waiter) {
            self.issue_fetch();
        }
    }

    /// Server pushed a "filters changed" signal
    pub fn on_update_filters(&mut self) {
        if self.scheduler.request_follow_up() {
            self.issue_fetch();
        }
    }

    pub fn on_authorization_success(&mut self) {
        self.request_reload(None);
    }

    pub fn on_timer(&mut self, now: Instant) {
        if self.scheduler.on_timer(now) {
            self.issue_fetch();
        }
    }

    fn issue_fetch(&mut self) {
        let epoch = self.ledger.epoch();
        tracing::debug!("Fetching filter list at epoch {}", epoch);
        self.outbox.push(Effect::Fetch { epoch });
    }

    pub fn on_fetch_result(&mut self, epoch: u64, result: Result<ServerFilterList>, now: Instant) {
        match result {
            Ok(list) => {
                self.server = ServerSnapshot::from_list(list, Some(Utc::now()));
                let retired = self.ledger.retire_acknowledged(epoch);
                self.local = reconcile(&self.local, &self.server, &self.ledger);
                tracing::info!(
                    "Reloaded {} server filters, retired {} acknowledged operations",
                    self.server.filters().len(),
                    retired
                );
                self.changed();
                if self.scheduler.on_success(now) {
                    self.issue_fetch();
                }
            }
            Err(error) => self.scheduler.on_failure(now, &error),
        }
    }

    // ----- deferred round trips -----

    /// Send the oldest queued operation unless one is already in flight
    fn pump(&mut self) {
        while let Some(op) = self.ledger.next_to_send().cloned() {
            let (request, sent) = match op.kind {
                OperationKind::Create(id) | OperationKind::Edit(id) => match self.local.get(id) {
                    Some(filter) => (
                        SyncRequest::Save(filter.clone()),
                        Confirmed::Filter {
                            filter: filter.clone(),
                        },
                    ),
                    None => {
                        self.ledger.fail(op.seq);
                        continue;
                    }
                },
                OperationKind::Delete(id) => {
                    (SyncRequest::Delete(id), Confirmed::Deleted { filter_id: id })
                }
                OperationKind::Reorder => {
                    let ids = self.local.ids();
                    let main_position = self.local.main_position();
                    (
                        SyncRequest::Reorder {
                            ids: ids.clone(),
                            main_position,
                        },
                        Confirmed::Order { ids, main_position },
                    )
                }
            };
            self.ledger.mark_in_flight(op.seq, sent);
            self.outbox.push(Effect::Sync {
                seq: op.seq,
                request,
            });
            return;
        }
    }

    /// Outcome of a deferred round trip after transient retries
    ///
    /// A rejection rolls the optimistic change back to the last state the
    /// server confirmed and notifies observers.
    pub fn on_sync_result(&mut self, seq: u64, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Some(op) = self.ledger.acknowledge(seq) {
                    tracing::debug!("Server acknowledged {:?}", op.kind);
                }
            }
            Err(FolioError::Cancelled) => {
                self.ledger.requeue(seq);
                return;
            }
            Err(error) => {
                let removed = self.ledger.fail(seq);
                if let Some(failed) = removed.first() {
                    tracing::warn!(
                        "Server rejected {:?}: {}; rolling back {} operation(s)",
                        failed.kind,
                        error,
                        removed.len()
                    );
                    self.roll_back(failed);
                }
            }
        }
        self.changed();
    }

    /// Later queued intent wins over the rollback: a queued delete keeps the
    /// filter gone and a queued reorder keeps the local order
    fn roll_back(&mut self, failed: &PendingOperation) {
        match failed.kind {
            OperationKind::Create(id) | OperationKind::Edit(id) | OperationKind::Delete(id) => {
                if !self.ledger.has_queued_delete(id) {
                    self.restore_confirmed_filter(id);
                } else if !self.server.contains(id) && !self.ledger.server_may_know(id) {
                    self.ledger.drop_queued_delete(id);
                }
            }
            OperationKind::Reorder => {
                if !self.ledger.has_queued_reorder() {
                    self.restore_confirmed_order();
                }
            }
        }
    }

    fn restore_confirmed_filter(&mut self, id: FilterId) {
        let target = match self.ledger.confirmed_filter(id) {
            Some(confirmed) => confirmed.cloned(),
            None => self.server.get(id).cloned(),
        };
        match (target, self.local.contains(id)) {
            (Some(filter), true) => {
                self.local.replace(filter);
            }
            (Some(filter), false) => {
                let at = self
                    .server
                    .position(id)
                    .map(InsertAt::Index)
                    .unwrap_or(InsertAt::End);
                self.local.insert(filter, at);
            }
            (None, true) => {
                self.local.remove(id);
            }
            (None, false) => {}
        }
    }

    fn restore_confirmed_order(&mut self) {
        let (target, target_main) = match self.ledger.confirmed_order() {
            Some((ids, main_position)) => (ids.to_vec(), main_position),
            None => (self.server.ids(), self.server.main_position()),
        };
        let local_ids = self.local.ids();
        let present: HashSet<FilterId> = local_ids.iter().copied().collect();
        let mut order: Vec<FilterId> = target.into_iter().filter(|id| present.contains(id)).collect();
        let placed: HashSet<FilterId> = order.iter().copied().collect();
        order.extend(local_ids.into_iter().filter(|id| !placed.contains(id)));
        let main_position = target_main.min(order.len());
        self.local.reorder(&order, main_position);
    }

    // ----- server pushed definitions -----

    /// A single definition pushed by the server
    ///
    /// Adopted unless local intent for the filter is pending, and recorded as
    /// acknowledged so that a stale fetch can't revert it.
    pub fn on_remote_filter(&mut self, filter: DialogFilter) {
        if !filter.id.is_valid() {
            tracing::warn!("Ignoring remote filter with invalid id {}", filter.id);
            return;
        }
        let filter = filter.normalized();
        let id = filter.id;
        if self.ledger.has_pending_delete(id) {
            tracing::debug!(filter_id = %id, "Ignoring remote copy of a filter being deleted");
            return;
        }

        match self.local.get(id).cloned() {
            Some(mut existing) if self.ledger.has_pending_save(id) => {
                if existing.share != filter.share {
                    existing.share = filter.share;
                    self.local.replace(existing);
                }
            }
            Some(_) => {
                self.local.replace(filter.clone());
            }
            None => self.local.insert(filter.clone(), InsertAt::End),
        }
        self.ledger
            .push_acknowledged(OperationKind::Edit(id), Confirmed::Filter { filter });
        self.changed();
    }

    /// Route an imported filter through the create-or-append path
    ///
    /// Returns the id of the local filter that received the dialogs.
    pub fn on_joined_filter(&mut self, remote: DialogFilter, chosen: &[DialogId]) -> Result<FilterId> {
        if !remote.id.is_valid() {
            return Err(FolioError::TerminalServer {
                code: 500,
                message: format!("Joined filter has invalid id {}", remote.id),
            });
        }
        let remote = remote.normalized();
        let id = remote.id;
        let chosen_set: HashSet<DialogId> = chosen.iter().copied().collect();
        let mut imported: Vec<InputDialogId> = remote
            .included
            .iter()
            .filter(|d| chosen_set.contains(&d.dialog_id))
            .copied()
            .collect();
        for dialog_id in chosen {
            if !imported.iter().any(|d| d.dialog_id == *dialog_id) {
                imported.push(InputDialogId::from(*dialog_id));
            }
        }

        match self.local.get(id).cloned() {
            Some(mut existing) => {
                for dialog in &imported {
                    include_dialog(&mut existing, *dialog);
                }
                if remote.share.is_some() {
                    existing.share = remote.share;
                }
                if self.local.get(id) != Some(&existing) {
                    tracing::info!(filter_id = %id, "Appending {} joined dialogs", imported.len());
                    self.commit_edit(existing);
                }
            }
            None => {
                let mut created = remote;
                created.included = imported.clone();
                created
                    .pinned
                    .retain(|d| chosen_set.contains(&d.dialog_id));
                tracing::info!(filter_id = %id, "Imported filter from invite link");
                self.local.insert(created.clone(), InsertAt::End);
                self.ledger
                    .push_acknowledged(OperationKind::Create(id), Confirmed::Filter { filter: created });
                self.changed();
            }
        }

        self.outbox.push(Effect::LoadDialogs {
            filter_id: id,
            dialogs: imported,
        });
        self.on_update_filters();
        Ok(id)
    }

    // ----- recommendations -----

    /// Drop suggestions that match a filter the user already has
    pub fn filter_recommended(&self, recommended: Vec<RecommendedFilter>) -> Vec<RecommendedFilter> {
        recommended
            .into_iter()
            .filter(|candidate| {
                !self
                    .local
                    .filters()
                    .iter()
                    .any(|existing| same_selection(&existing.spec(), &candidate.filter))
            })
            .collect()
    }

    // ----- lifecycle -----

    /// Resolve every waiting continuation with a cancellation
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.outbox.push(Effect::Persist(self.persisted_state()));
    }

    /// Queue persistence and a deduplicated notification after a state change
    fn changed(&mut self) {
        self.pump();
        self.outbox.push(Effect::Persist(self.persisted_state()));
        if let Some(update) = self.gate.offer(self.local.to_update()) {
            self.outbox.push(Effect::Notify(update));
        }
    }
}

fn include_dialog(filter: &mut DialogFilter, dialog: InputDialogId) {
    if filter.includes(dialog.dialog_id) {
        return;
    }
    filter.excluded.retain(|d| d.dialog_id != dialog.dialog_id);
    filter.included.push(dialog);
}

fn same_selection(a: &FilterSpec, b: &FilterSpec) -> bool {
    fn ids(dialogs: &[InputDialogId]) -> HashSet<DialogId> {
        dialogs.iter().map(|d| d.dialog_id).collect()
    }
    a.flags == b.flags
        && ids(&a.included) == ids(&b.included)
        && ids(&a.excluded) == ids(&b.excluded)
}
