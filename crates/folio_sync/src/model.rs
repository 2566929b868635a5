//! Dialog filter data model and input validation

use folio_common::{DialogId, FilterId, FolioError, InputDialogId, Result};
use folio_config::LimitsConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which dialog categories a filter pulls in or leaves out besides its
/// explicit membership lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterFlags {
    #[serde(default)]
    pub exclude_muted: bool,
    #[serde(default)]
    pub exclude_read: bool,
    #[serde(default)]
    pub exclude_archived: bool,
    #[serde(default)]
    pub include_contacts: bool,
    #[serde(default)]
    pub include_non_contacts: bool,
    #[serde(default)]
    pub include_bots: bool,
    #[serde(default)]
    pub include_groups: bool,
    #[serde(default)]
    pub include_channels: bool,
}

impl FilterFlags {
    pub fn includes_any_category(&self) -> bool {
        self.include_contacts
            || self.include_non_contacts
            || self.include_bots
            || self.include_groups
            || self.include_channels
    }

    pub fn is_empty(&self) -> bool {
        *self == FilterFlags::default()
    }
}

/// Present on filters that can be shared through invite links
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareState {
    #[serde(default)]
    pub has_my_invite_links: bool,
}

/// A dialog filter (folder)
///
/// `pinned` is ordered and always a subset of `included`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogFilter {
    pub id: FilterId,
    pub title: String,
    #[serde(default)]
    pub icon_name: String,
    #[serde(default)]
    pub color_id: Option<i32>,
    #[serde(default)]
    pub included: Vec<InputDialogId>,
    #[serde(default)]
    pub excluded: Vec<InputDialogId>,
    #[serde(default)]
    pub pinned: Vec<InputDialogId>,
    #[serde(default)]
    pub flags: FilterFlags,
    #[serde(default)]
    pub share: Option<ShareState>,
}

impl DialogFilter {
    pub fn is_shareable(&self) -> bool {
        self.share.is_some()
    }

    pub fn includes(&self, dialog_id: DialogId) -> bool {
        self.included.iter().any(|d| d.dialog_id == dialog_id)
    }

    pub fn excludes(&self, dialog_id: DialogId) -> bool {
        self.excluded.iter().any(|d| d.dialog_id == dialog_id)
    }

    pub fn is_pinned(&self, dialog_id: DialogId) -> bool {
        self.pinned.iter().any(|d| d.dialog_id == dialog_id)
    }

    /// Every dialog reference the filter mentions, included ones first
    pub fn dialogs(&self) -> Vec<InputDialogId> {
        let mut seen = HashSet::new();
        self.included
            .iter()
            .chain(self.excluded.iter())
            .filter(|d| seen.insert(d.dialog_id))
            .copied()
            .collect()
    }

    pub fn pinned_subset_of_included(&self) -> bool {
        let included: HashSet<DialogId> = self.included.iter().map(|d| d.dialog_id).collect();
        self.pinned.iter().all(|d| included.contains(&d.dialog_id))
    }

    /// User-facing definition of this filter
    pub fn spec(&self) -> FilterSpec {
        FilterSpec {
            title: self.title.clone(),
            icon_name: self.icon_name.clone(),
            color_id: self.color_id,
            included: self.included.clone(),
            excluded: self.excluded.clone(),
            pinned: self.pinned.clone(),
            flags: self.flags,
        }
    }

    pub fn info(&self) -> FilterInfo {
        FilterInfo {
            id: self.id,
            title: self.title.clone(),
            icon_name: self.icon_name.clone(),
            color_id: self.color_id,
            is_shareable: self.is_shareable(),
            has_my_invite_links: self.share.map(|s| s.has_my_invite_links).unwrap_or(false),
        }
    }

    /// Repair a definition received from the server
    ///
    /// Removes duplicate references, drops excluded dialogs that are also
    /// included and adds pinned dialogs missing from `included`.
    pub fn normalized(mut self) -> Self {
        dedup_dialogs(&mut self.included);
        dedup_dialogs(&mut self.pinned);
        dedup_dialogs(&mut self.excluded);

        for pinned in &self.pinned {
            if !self.included.iter().any(|d| d.dialog_id == pinned.dialog_id) {
                self.included.push(*pinned);
            }
        }
        let included: HashSet<DialogId> = self.included.iter().map(|d| d.dialog_id).collect();
        self.excluded.retain(|d| !included.contains(&d.dialog_id));
        self
    }

    /// Drop every reference to the given dialogs
    pub fn remove_dialogs(&mut self, dialog_ids: &HashSet<DialogId>) -> bool {
        let before = self.included.len() + self.excluded.len() + self.pinned.len();
        self.included.retain(|d| !dialog_ids.contains(&d.dialog_id));
        self.excluded.retain(|d| !dialog_ids.contains(&d.dialog_id));
        self.pinned.retain(|d| !dialog_ids.contains(&d.dialog_id));
        before != self.included.len() + self.excluded.len() + self.pinned.len()
    }
}

fn dedup_dialogs(dialogs: &mut Vec<InputDialogId>) {
    let mut seen = HashSet::new();
    dialogs.retain(|d| seen.insert(d.dialog_id));
}

/// Filter definition supplied by the user for create and edit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub title: String,
    #[serde(default)]
    pub icon_name: String,
    #[serde(default)]
    pub color_id: Option<i32>,
    #[serde(default)]
    pub included: Vec<InputDialogId>,
    #[serde(default)]
    pub excluded: Vec<InputDialogId>,
    #[serde(default)]
    pub pinned: Vec<InputDialogId>,
    #[serde(default)]
    pub flags: FilterFlags,
}

impl FilterSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_included(mut self, dialogs: impl IntoIterator<Item = InputDialogId>) -> Self {
        self.included.extend(dialogs);
        self
    }

    pub fn with_excluded(mut self, dialogs: impl IntoIterator<Item = InputDialogId>) -> Self {
        self.excluded.extend(dialogs);
        self
    }

    pub fn with_pinned(mut self, dialogs: impl IntoIterator<Item = InputDialogId>) -> Self {
        self.pinned.extend(dialogs);
        self
    }

    pub fn with_flags(mut self, flags: FilterFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check the definition against the configured ceilings
    ///
    /// `shareable` applies the extra rules for filters with invite links:
    /// no excluded dialogs and no category flags.
    pub fn validate(&self, limits: &LimitsConfig, shareable: bool) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(FolioError::validation("Filter title must be non-empty"));
        }
        if self.title.chars().count() > limits.max_title_length {
            return Err(FolioError::Validation(format!(
                "Filter title must not exceed {} characters",
                limits.max_title_length
            )));
        }
        if self.icon_name.chars().count() > limits.max_icon_length {
            return Err(FolioError::Validation(format!(
                "Icon name must not exceed {} characters",
                limits.max_icon_length
            )));
        }

        let included = distinct_ids(&self.included, "included")?;
        let excluded = distinct_ids(&self.excluded, "excluded")?;
        let pinned = distinct_ids(&self.pinned, "pinned")?;

        if let Some(dialog) = included.intersection(&excluded).next() {
            return Err(FolioError::Validation(format!(
                "Dialog {} can't be both included and excluded",
                dialog
            )));
        }
        if let Some(dialog) = pinned.difference(&included).next() {
            return Err(FolioError::Validation(format!(
                "Pinned dialog {} must also be included",
                dialog
            )));
        }
        let total = included.len() + excluded.len();
        if total > limits.max_filter_dialogs {
            return Err(FolioError::Validation(format!(
                "Filter can contain at most {} dialogs, got {}",
                limits.max_filter_dialogs, total
            )));
        }
        if included.is_empty() && !self.flags.includes_any_category() {
            return Err(FolioError::validation(
                "Filter must include at least one dialog or dialog category",
            ));
        }
        if shareable && (!excluded.is_empty() || !self.flags.is_empty()) {
            return Err(FolioError::validation(
                "Shareable filter can't exclude dialogs or use dialog categories",
            ));
        }
        Ok(())
    }

    pub fn into_filter(self, id: FilterId, share: Option<ShareState>) -> DialogFilter {
        DialogFilter {
            id,
            title: self.title,
            icon_name: self.icon_name,
            color_id: self.color_id,
            included: self.included,
            excluded: self.excluded,
            pinned: self.pinned,
            flags: self.flags,
            share,
        }
    }
}

fn distinct_ids(dialogs: &[InputDialogId], list: &str) -> Result<HashSet<DialogId>> {
    let mut ids = HashSet::with_capacity(dialogs.len());
    for dialog in dialogs {
        if !ids.insert(dialog.dialog_id) {
            return Err(FolioError::Validation(format!(
                "Dialog {} is listed twice in {} dialogs",
                dialog.dialog_id, list
            )));
        }
    }
    Ok(ids)
}

/// Summary returned by create and edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub id: FilterId,
    pub title: String,
    pub icon_name: String,
    pub color_id: Option<i32>,
    pub is_shareable: bool,
    pub has_my_invite_links: bool,
}

/// "Filters changed" notification; always the full ordered state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiltersUpdate {
    pub filters: Vec<DialogFilter>,
    pub main_position: usize,
}

impl FiltersUpdate {
    pub fn ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|f| f.id).collect()
    }

    pub fn infos(&self) -> Vec<FilterInfo> {
        self.filters.iter().map(DialogFilter::info).collect()
    }
}

/// Filter list as returned by a full fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFilterList {
    pub filters: Vec<DialogFilter>,
    pub main_position: usize,
}

/// Server-suggested filter definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedFilter {
    pub filter: FilterSpec,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(raw: i64) -> InputDialogId {
        InputDialogId::from(DialogId::new(raw))
    }

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    #[test]
    fn test_valid_spec() {
        let spec = FilterSpec::new("Work")
            .with_included([dialog(1), dialog(2)])
            .with_excluded([dialog(3)])
            .with_pinned([dialog(2)]);
        assert!(spec.validate(&limits(), false).is_ok());
    }

    #[test]
    fn test_title_rules() {
        let blank = FilterSpec::new("   ").with_included([dialog(1)]);
        assert!(matches!(
            blank.validate(&limits(), false),
            Err(FolioError::Validation(_))
        ));

        let long = FilterSpec::new("A title that is too long").with_included([dialog(1)]);
        let err = long.validate(&limits(), false).unwrap_err();
        assert!(err.to_string().contains("12 characters"));

        // character count, not bytes
        let cyrillic = FilterSpec::new("Работа").with_included([dialog(1)]);
        assert!(cyrillic.validate(&limits(), false).is_ok());
    }

    #[test]
    fn test_pinned_must_be_included() {
        let spec = FilterSpec::new("Work")
            .with_included([dialog(1)])
            .with_pinned([dialog(2)]);
        let err = spec.validate(&limits(), false).unwrap_err();
        assert!(err.to_string().contains("Pinned dialog 2"));
    }

    #[test]
    fn test_included_and_excluded_overlap() {
        let spec = FilterSpec::new("Work")
            .with_included([dialog(1)])
            .with_excluded([dialog(1)]);
        assert!(spec.validate(&limits(), false).is_err());
    }

    #[test]
    fn test_dialog_ceiling() {
        let mut limits = limits();
        limits.max_filter_dialogs = 3;
        let spec = FilterSpec::new("Big")
            .with_included([dialog(1), dialog(2)])
            .with_excluded([dialog(3), dialog(4)]);
        let err = spec.validate(&limits, false).unwrap_err();
        assert!(err.to_string().contains("at most 3"));
    }

    #[test]
    fn test_must_select_something() {
        let empty = FilterSpec::new("Empty");
        assert!(empty.validate(&limits(), false).is_err());

        let by_category = FilterSpec::new("Bots").with_flags(FilterFlags {
            include_bots: true,
            ..FilterFlags::default()
        });
        assert!(by_category.validate(&limits(), false).is_ok());
        assert!(by_category.validate(&limits(), true).is_err());
    }

    #[test]
    fn test_duplicate_dialogs_rejected() {
        let spec = FilterSpec::new("Dups").with_included([dialog(1), dialog(1)]);
        assert!(spec.validate(&limits(), false).is_err());
    }

    #[test]
    fn test_normalize_server_definition() {
        let filter = DialogFilter {
            id: FilterId::new(5),
            title: "Remote".to_string(),
            icon_name: String::new(),
            color_id: None,
            included: vec![dialog(1), dialog(1)],
            excluded: vec![dialog(1), dialog(4)],
            pinned: vec![dialog(3)],
            flags: FilterFlags::default(),
            share: None,
        }
        .normalized();

        assert_eq!(filter.included, vec![dialog(1), dialog(3)]);
        assert_eq!(filter.excluded, vec![dialog(4)]);
        assert!(filter.pinned_subset_of_included());
    }

    #[test]
    fn test_spec_round_trip() {
        let spec = FilterSpec::new("Friends")
            .with_included([dialog(10), dialog(11)])
            .with_pinned([dialog(11)]);
        let filter = spec.clone().into_filter(FilterId::new(2), None);
        assert_eq!(filter.spec(), spec);
        assert_eq!(filter.info().title, "Friends");
        assert!(!filter.info().is_shareable);
    }
}
