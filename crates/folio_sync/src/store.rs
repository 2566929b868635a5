//! Ordered filter collections: the local store and the server snapshot

use crate::model::{DialogFilter, FiltersUpdate, ServerFilterList};
use chrono::{DateTime, Utc};
use folio_common::FilterId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Where a new filter lands in the order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    Beginning,
    End,
    Index(usize),
}

/// Local truth: the filters as currently shown to the user
///
/// Mutations assert the structural invariants (distinct valid ids, pinned
/// dialogs included, main position within `0..=len`). Callers validate user
/// input first, so a failed assertion is a bug in the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStore {
    filters: Vec<DialogFilter>,
    main_position: usize,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from parts that are known to be consistent
    pub fn from_parts(filters: Vec<DialogFilter>, main_position: usize) -> Self {
        if let Err(violation) = Self::check(&filters, main_position) {
            panic!("filter store invariant violated: {}", violation);
        }
        Self {
            filters,
            main_position,
        }
    }

    /// Non-panicking invariant check, used for data from disk
    pub fn check(filters: &[DialogFilter], main_position: usize) -> Result<(), String> {
        let mut ids = HashSet::with_capacity(filters.len());
        for filter in filters {
            if !filter.id.is_valid() {
                return Err(format!("filter id {} is outside the filter id range", filter.id));
            }
            if !ids.insert(filter.id) {
                return Err(format!("filter id {} appears more than once", filter.id));
            }
            if !filter.pinned_subset_of_included() {
                return Err(format!(
                    "filter {} pins a dialog it doesn't include",
                    filter.id
                ));
            }
        }
        if main_position > filters.len() {
            return Err(format!(
                "main list position {} exceeds filter count {}",
                main_position,
                filters.len()
            ));
        }
        Ok(())
    }

    fn commit(&mut self, filters: Vec<DialogFilter>, main_position: usize) {
        *self = Self::from_parts(filters, main_position);
    }

    pub fn get(&self, id: FilterId) -> Option<&DialogFilter> {
        self.filters.iter().find(|f| f.id == id)
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: FilterId) -> Option<usize> {
        self.filters.iter().position(|f| f.id == id)
    }

    pub fn ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|f| f.id).collect()
    }

    pub fn filters(&self) -> &[DialogFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn main_position(&self) -> usize {
        self.main_position
    }

    pub fn insert(&mut self, filter: DialogFilter, at: InsertAt) {
        let index = match at {
            InsertAt::Beginning => 0,
            InsertAt::End => self.filters.len(),
            InsertAt::Index(index) => index.min(self.filters.len()),
        };
        let mut main_position = self.main_position;
        if index < main_position {
            main_position += 1;
        }
        let mut filters = self.filters.clone();
        filters.insert(index, filter);
        self.commit(filters, main_position);
    }

    /// Replace content in place, keeping the position
    pub fn replace(&mut self, filter: DialogFilter) -> DialogFilter {
        let index = self
            .position(filter.id)
            .unwrap_or_else(|| panic!("replace of unknown filter {}", filter.id));
        let mut filters = self.filters.clone();
        let old = std::mem::replace(&mut filters[index], filter);
        self.commit(filters, self.main_position);
        old
    }

    pub fn remove(&mut self, id: FilterId) -> Option<DialogFilter> {
        let index = self.position(id)?;
        let mut filters = self.filters.clone();
        let removed = filters.remove(index);
        let mut main_position = self.main_position;
        if index < main_position {
            main_position -= 1;
        }
        self.commit(filters, main_position);
        Some(removed)
    }

    /// Replace the entire order; `ids` must be a permutation of the current ids
    pub fn reorder(&mut self, ids: &[FilterId], main_position: usize) {
        assert_eq!(ids.len(), self.filters.len(), "reorder must keep every filter");
        let filters = ids
            .iter()
            .map(|id| {
                self.get(*id)
                    .cloned()
                    .unwrap_or_else(|| panic!("reorder names unknown filter {}", id))
            })
            .collect();
        self.commit(filters, main_position);
    }

    pub fn set_main_position(&mut self, main_position: usize) {
        self.commit(self.filters.clone(), main_position);
    }

    pub fn to_update(&self) -> FiltersUpdate {
        FiltersUpdate {
            filters: self.filters.clone(),
            main_position: self.main_position,
        }
    }
}

/// Last authoritative filter list fetched from the server
///
/// Replaced wholesale after every successful fetch and never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    filters: Vec<DialogFilter>,
    main_position: usize,
    fetched_at: Option<DateTime<Utc>>,
}

impl ServerSnapshot {
    /// Snapshot from a fetch response, repairing malformed server data
    pub fn from_list(list: ServerFilterList, fetched_at: Option<DateTime<Utc>>) -> Self {
        let mut seen = HashSet::new();
        let mut filters = Vec::with_capacity(list.filters.len());
        for filter in list.filters {
            if !filter.id.is_valid() {
                tracing::warn!("Ignoring server filter with invalid id {}", filter.id);
                continue;
            }
            if !seen.insert(filter.id) {
                tracing::warn!("Ignoring duplicate server filter {}", filter.id);
                continue;
            }
            filters.push(filter.normalized());
        }
        let main_position = list.main_position.min(filters.len());
        Self {
            filters,
            main_position,
            fetched_at,
        }
    }

    pub fn get(&self, id: FilterId) -> Option<&DialogFilter> {
        self.filters.iter().find(|f| f.id == id)
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: FilterId) -> Option<usize> {
        self.filters.iter().position(|f| f.id == id)
    }

    pub fn ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|f| f.id).collect()
    }

    pub fn filters(&self) -> &[DialogFilter] {
        &self.filters
    }

    pub fn main_position(&self) -> usize {
        self.main_position
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FilterSpec;
    use folio_common::{DialogId, InputDialogId};

    fn filter(id: i32) -> DialogFilter {
        FilterSpec::new(format!("F{}", id))
            .with_included([InputDialogId::from(DialogId::new(id as i64))])
            .into_filter(FilterId::new(id), None)
    }

    fn ids(raw: &[i32]) -> Vec<FilterId> {
        raw.iter().map(|r| FilterId::new(*r)).collect()
    }

    #[test]
    fn test_insert_positions() {
        let mut store = FilterStore::new();
        store.insert(filter(2), InsertAt::End);
        store.insert(filter(3), InsertAt::End);
        store.insert(filter(4), InsertAt::Beginning);
        store.insert(filter(5), InsertAt::Index(1));
        assert_eq!(store.ids(), ids(&[4, 5, 2, 3]));
    }

    #[test]
    fn test_main_position_follows_neighbours() {
        let mut store = FilterStore::from_parts(vec![filter(2), filter(3)], 1);
        store.insert(filter(4), InsertAt::Beginning);
        assert_eq!(store.main_position(), 2);

        store.remove(FilterId::new(4));
        assert_eq!(store.main_position(), 1);

        store.remove(FilterId::new(3));
        assert_eq!(store.main_position(), 1);
        store.remove(FilterId::new(2));
        assert_eq!(store.main_position(), 0);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut store = FilterStore::from_parts(vec![filter(2), filter(3), filter(4)], 0);
        let mut edited = filter(3);
        edited.title = "Edited".to_string();
        let old = store.replace(edited);
        assert_eq!(old.title, "F3");
        assert_eq!(store.position(FilterId::new(3)), Some(1));
        assert_eq!(store.get(FilterId::new(3)).unwrap().title, "Edited");
    }

    #[test]
    fn test_reorder() {
        let mut store = FilterStore::from_parts(vec![filter(2), filter(3), filter(4)], 0);
        store.reorder(&ids(&[4, 2, 3]), 3);
        assert_eq!(store.ids(), ids(&[4, 2, 3]));
        assert_eq!(store.main_position(), 3);
    }

    #[test]
    #[should_panic(expected = "appears more than once")]
    fn test_duplicate_insert_is_fatal() {
        let mut store = FilterStore::new();
        store.insert(filter(2), InsertAt::End);
        store.insert(filter(2), InsertAt::End);
    }

    #[test]
    #[should_panic(expected = "pins a dialog")]
    fn test_pinned_outside_included_is_fatal() {
        let mut bad = filter(2);
        bad.pinned.push(InputDialogId::from(DialogId::new(99)));
        FilterStore::from_parts(vec![bad], 0);
    }

    #[test]
    fn test_check_reports_main_position() {
        let err = FilterStore::check(&[filter(2)], 2).unwrap_err();
        assert!(err.contains("main list position"));
    }

    #[test]
    fn test_snapshot_sanitizes_server_list() {
        let mut bad_id = filter(2);
        bad_id.id = FilterId::new(1);
        let list = ServerFilterList {
            filters: vec![filter(3), bad_id, filter(3), filter(4)],
            main_position: 9,
        };
        let snapshot = ServerSnapshot::from_list(list, None);
        assert_eq!(snapshot.ids(), ids(&[3, 4]));
        assert_eq!(snapshot.main_position(), 2);
    }
}
