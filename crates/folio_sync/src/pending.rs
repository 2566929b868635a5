//! Ledger of optimistic mutations awaiting server confirmation

use crate::model::DialogFilter;
use folio_common::FilterId;
use serde::{Deserialize, Serialize};

/// What a pending operation does on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "filter_id", rename_all = "snake_case")]
pub enum OperationKind {
    Create(FilterId),
    Edit(FilterId),
    Delete(FilterId),
    Reorder,
}

impl OperationKind {
    pub fn filter_id(&self) -> Option<FilterId> {
        match self {
            OperationKind::Create(id) | OperationKind::Edit(id) | OperationKind::Delete(id) => {
                Some(*id)
            }
            OperationKind::Reorder => None,
        }
    }

    pub fn is_save(&self) -> bool {
        matches!(self, OperationKind::Create(_) | OperationKind::Edit(_))
    }
}

/// Server-side effect of an operation, as sent and later confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Confirmed {
    Filter { filter: DialogFilter },
    Deleted { filter_id: FilterId },
    Order { ids: Vec<FilterId>, main_position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationState {
    Queued,
    InFlight { sent: Confirmed },
    /// Confirmed by the server; retired by the first fetch issued at or
    /// after `epoch`
    Acknowledged { epoch: u64, confirmed: Confirmed },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub seq: u64,
    pub kind: OperationKind,
    pub state: OperationState,
}

impl PendingOperation {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self.state, OperationState::Acknowledged { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, OperationState::InFlight { .. })
    }

    pub fn touches(&self, id: FilterId) -> bool {
        self.kind.filter_id() == Some(id)
    }
}

/// Operations in issue order
///
/// Only the oldest unacknowledged operation may be in flight, so operations on
/// one filter resolve in the order they were issued.
#[derive(Debug, Clone, Default)]
pub struct PendingLedger {
    operations: Vec<PendingOperation>,
    next_seq: u64,
    epoch: u64,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted list; anything in flight is sent again
    pub fn restore(operations: Vec<PendingOperation>) -> Self {
        let next_seq = operations.iter().map(|op| op.seq + 1).max().unwrap_or(0);
        let operations = operations
            .into_iter()
            .map(|mut op| {
                if op.is_in_flight() {
                    op.state = OperationState::Queued;
                }
                if let OperationState::Acknowledged { confirmed, .. } = op.state {
                    op.state = OperationState::Acknowledged { epoch: 0, confirmed };
                }
                op
            })
            .collect();
        Self {
            operations,
            next_seq,
            epoch: 0,
        }
    }

    pub fn operations(&self) -> &[PendingOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_queued_duplicate(&self, kind: OperationKind) -> bool {
        self.operations
            .iter()
            .filter(|op| op.state == OperationState::Queued)
            .any(|op| match (op.kind, kind) {
                (OperationKind::Create(a), OperationKind::Edit(b)) => a == b,
                (existing, new) => existing == new,
            })
    }

    /// Record a new operation
    ///
    /// A save or reorder that is already queued and not yet sent is not
    /// duplicated: requests carry the latest local state when they go out.
    pub fn push(&mut self, kind: OperationKind) -> Option<u64> {
        if self.is_queued_duplicate(kind) {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.operations.push(PendingOperation {
            seq,
            kind,
            state: OperationState::Queued,
        });
        Some(seq)
    }

    /// Record an operation the server has already applied, such as a joined
    /// filter
    pub fn push_acknowledged(&mut self, kind: OperationKind, confirmed: Confirmed) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.epoch += 1;
        self.operations.push(PendingOperation {
            seq,
            kind,
            state: OperationState::Acknowledged {
                epoch: self.epoch,
                confirmed,
            },
        });
        seq
    }

    pub fn in_flight(&self) -> Option<&PendingOperation> {
        self.operations.iter().find(|op| op.is_in_flight())
    }

    /// Oldest queued operation, if nothing is in flight
    pub fn next_to_send(&self) -> Option<&PendingOperation> {
        if self.in_flight().is_some() {
            return None;
        }
        self.operations
            .iter()
            .find(|op| op.state == OperationState::Queued)
    }

    pub fn mark_in_flight(&mut self, seq: u64, sent: Confirmed) {
        if let Some(op) = self.operations.iter_mut().find(|op| op.seq == seq) {
            op.state = OperationState::InFlight { sent };
        }
    }

    /// Return an in-flight operation to the queue
    pub fn requeue(&mut self, seq: u64) {
        if let Some(op) = self.operations.iter_mut().find(|op| op.seq == seq) {
            if op.is_in_flight() {
                op.state = OperationState::Queued;
            }
        }
    }

    pub fn acknowledge(&mut self, seq: u64) -> Option<&PendingOperation> {
        let epoch = self.epoch + 1;
        let op = self
            .operations
            .iter_mut()
            .find(|op| op.seq == seq && op.is_in_flight())?;
        let state = std::mem::replace(&mut op.state, OperationState::Queued);
        if let OperationState::InFlight { sent } = state {
            op.state = OperationState::Acknowledged {
                epoch,
                confirmed: sent,
            };
        }
        self.epoch = epoch;
        Some(op)
    }

    /// Remove a rejected operation together with the later queued saves on
    /// the same filter
    ///
    /// A queued delete of that filter survives, since the user's latest
    /// intent is still to remove it.
    pub fn fail(&mut self, seq: u64) -> Vec<PendingOperation> {
        let Some(index) = self.operations.iter().position(|op| op.seq == seq) else {
            return Vec::new();
        };
        let failed = self.operations.remove(index);
        let mut removed = vec![failed];
        if let Some(id) = removed[0].kind.filter_id() {
            let (dropped, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.operations)
                    .into_iter()
                    .partition(|op| {
                        op.seq > seq
                            && op.touches(id)
                            && op.kind.is_save()
                            && op.state == OperationState::Queued
                    });
            self.operations = kept;
            removed.extend(dropped);
        }
        removed
    }

    /// Drop queued saves for a filter that is being deleted
    pub fn drop_queued_saves(&mut self, id: FilterId) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| {
            !(op.touches(id) && op.kind.is_save() && op.state == OperationState::Queued)
        });
        before - self.operations.len()
    }

    /// Drop a queued delete the server has nothing to apply to
    pub fn drop_queued_delete(&mut self, id: FilterId) -> bool {
        let before = self.operations.len();
        self.operations.retain(|op| {
            !(op.kind == OperationKind::Delete(id) && op.state == OperationState::Queued)
        });
        before != self.operations.len()
    }

    /// Retire acknowledged operations that a fetch issued at `fetch_epoch`
    /// already reflects
    pub fn retire_acknowledged(&mut self, fetch_epoch: u64) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| match op.state {
            OperationState::Acknowledged { epoch, .. } => epoch > fetch_epoch,
            _ => true,
        });
        before - self.operations.len()
    }

    pub fn has_pending_save(&self, id: FilterId) -> bool {
        self.operations
            .iter()
            .any(|op| op.touches(id) && op.kind.is_save())
    }

    pub fn has_pending_delete(&self, id: FilterId) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Delete(id))
    }

    pub fn has_queued_delete(&self, id: FilterId) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Delete(id) && op.state == OperationState::Queued)
    }

    pub fn has_queued_reorder(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Reorder && op.state == OperationState::Queued)
    }

    pub fn has_pending_reorder(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Reorder)
    }

    pub fn has_acknowledged(&self, id: FilterId) -> bool {
        self.operations
            .iter()
            .any(|op| op.touches(id) && op.is_acknowledged())
    }

    pub fn has_acknowledged_reorder(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.kind == OperationKind::Reorder && op.is_acknowledged())
    }

    /// True when the server may already know this filter: it was sent or
    /// confirmed by an earlier save
    pub fn server_may_know(&self, id: FilterId) -> bool {
        self.operations
            .iter()
            .any(|op| op.touches(id) && op.kind.is_save() && op.state != OperationState::Queued)
    }

    /// Latest confirmed server state of a filter: `Some(None)` if its deletion
    /// was confirmed
    pub fn confirmed_filter(&self, id: FilterId) -> Option<Option<&DialogFilter>> {
        self.operations
            .iter()
            .rev()
            .find_map(|op| match &op.state {
                OperationState::Acknowledged { confirmed, .. } if op.touches(id) => {
                    match confirmed {
                        Confirmed::Filter { filter } => Some(Some(filter)),
                        Confirmed::Deleted { .. } => Some(None),
                        Confirmed::Order { .. } => None,
                    }
                }
                _ => None,
            })
    }

    pub fn confirmed_order(&self) -> Option<(&[FilterId], usize)> {
        self.operations.iter().rev().find_map(|op| match &op.state {
            OperationState::Acknowledged {
                confirmed: Confirmed::Order { ids, main_position },
                ..
            } => Some((ids.as_slice(), *main_position)),
            _ => None,
        })
    }

    /// Operations worth keeping across a restart
    pub fn to_persisted(&self) -> Vec<PendingOperation> {
        self.operations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i32) -> FilterId {
        FilterId::new(raw)
    }

    fn deleted(raw: i32) -> Confirmed {
        Confirmed::Deleted { filter_id: id(raw) }
    }

    #[test]
    fn test_one_in_flight_at_a_time() {
        let mut ledger = PendingLedger::new();
        let first = ledger.push(OperationKind::Delete(id(2))).unwrap();
        let second = ledger.push(OperationKind::Delete(id(3))).unwrap();

        assert_eq!(ledger.next_to_send().map(|op| op.seq), Some(first));
        ledger.mark_in_flight(first, deleted(2));
        assert!(ledger.next_to_send().is_none());

        ledger.acknowledge(first);
        assert_eq!(ledger.next_to_send().map(|op| op.seq), Some(second));
    }

    #[test]
    fn test_queued_saves_coalesce() {
        let mut ledger = PendingLedger::new();
        assert!(ledger.push(OperationKind::Create(id(2))).is_some());
        assert!(ledger.push(OperationKind::Edit(id(2))).is_none());
        assert!(ledger.push(OperationKind::Reorder).is_some());
        assert!(ledger.push(OperationKind::Reorder).is_none());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_edit_after_send_is_kept() {
        let mut ledger = PendingLedger::new();
        let seq = ledger.push(OperationKind::Edit(id(2))).unwrap();
        ledger.mark_in_flight(seq, deleted(2));
        assert!(ledger.push(OperationKind::Edit(id(2))).is_some());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_retire_respects_epoch() {
        let mut ledger = PendingLedger::new();
        let seq = ledger.push(OperationKind::Delete(id(2))).unwrap();
        let stale_fetch_epoch = ledger.epoch();
        ledger.mark_in_flight(seq, deleted(2));
        ledger.acknowledge(seq);

        assert_eq!(ledger.retire_acknowledged(stale_fetch_epoch), 0);
        assert!(ledger.has_pending_delete(id(2)));

        let fresh_fetch_epoch = ledger.epoch();
        assert_eq!(ledger.retire_acknowledged(fresh_fetch_epoch), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_fail_drops_later_saves_on_same_filter() {
        let mut ledger = PendingLedger::new();
        let create = ledger.push(OperationKind::Create(id(2))).unwrap();
        ledger.mark_in_flight(create, deleted(2));
        ledger.push(OperationKind::Edit(id(2)));
        ledger.push(OperationKind::Reorder);
        ledger.push(OperationKind::Edit(id(3)));

        let removed = ledger.fail(create);
        assert_eq!(removed.len(), 2);
        let kinds: Vec<_> = ledger.operations().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Reorder, OperationKind::Edit(id(3))]);
    }

    #[test]
    fn test_fail_keeps_queued_delete() {
        let mut ledger = PendingLedger::new();
        let edit = ledger.push(OperationKind::Edit(id(2))).unwrap();
        ledger.mark_in_flight(edit, deleted(2));
        let delete = ledger.push(OperationKind::Delete(id(2))).unwrap();

        let removed = ledger.fail(edit);
        assert_eq!(removed.len(), 1);
        assert!(ledger.has_queued_delete(id(2)));
        assert_eq!(ledger.next_to_send().map(|op| op.seq), Some(delete));

        assert!(ledger.drop_queued_delete(id(2)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_restore_requeues_in_flight() {
        let mut ledger = PendingLedger::new();
        let seq = ledger.push(OperationKind::Delete(id(4))).unwrap();
        ledger.mark_in_flight(seq, deleted(4));

        let restored = PendingLedger::restore(ledger.to_persisted());
        assert_eq!(restored.next_to_send().map(|op| op.seq), Some(seq));
        let mut restored = restored;
        assert_eq!(restored.push(OperationKind::Reorder), Some(seq + 1));
    }

    #[test]
    fn test_confirmed_filter_prefers_latest() {
        let mut ledger = PendingLedger::new();
        let seq = ledger.push(OperationKind::Delete(id(5))).unwrap();
        ledger.mark_in_flight(seq, deleted(5));
        ledger.acknowledge(seq);
        assert_eq!(ledger.confirmed_filter(id(5)), Some(None));
        assert_eq!(ledger.confirmed_filter(id(6)), None);
    }
}
