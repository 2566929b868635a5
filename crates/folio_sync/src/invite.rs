//! Shareable filters and invite links

use crate::manager::FilterManager;
use crate::model::DialogFilter;
use folio_common::{DialogId, FilterId, FolioError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

lazy_static! {
    static ref HTTPS_LINK: Regex =
        Regex::new(r"^(?:https?://)?(?:www\.)?(?:t\.me|telegram\.me)/addlist/([A-Za-z0-9_-]+)/?$")
            .expect("invalid invite link regex");
    static ref DEEP_LINK: Regex =
        Regex::new(r"^tg://addlist\?slug=([A-Za-z0-9_-]+)$").expect("invalid deep link regex");
    static ref BARE_SLUG: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("invalid slug regex");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteLink {
    pub slug: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    pub dialog_ids: Vec<DialogId>,
}

/// Response to link creation: the link plus the filter as the server now
/// sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteLinkCreated {
    pub filter: DialogFilter,
    pub link: InviteLink,
}

/// What a link offers before joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteLinkPreview {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub icon_name: String,
    pub dialog_ids: Vec<DialogId>,
    /// Dialogs of the link that are already in the local filter
    #[serde(default)]
    pub already_added: Vec<DialogId>,
    /// Set when the filter was joined before
    #[serde(default)]
    pub filter_id: Option<FilterId>,
}

/// Extract the slug from a link, a deep link or a bare slug
pub fn parse_invite_link(link: &str) -> Result<String> {
    let link = link.trim();
    let captured = HTTPS_LINK
        .captures(link)
        .or_else(|| DEEP_LINK.captures(link))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    match captured {
        Some(slug) => Ok(slug),
        None if BARE_SLUG.is_match(link) => Ok(link.to_string()),
        None => Err(FolioError::Validation(format!("Invalid invite link '{}'", link))),
    }
}

pub fn invite_link_url(slug: &str) -> String {
    format!("https://t.me/addlist/{}", slug)
}

fn check_distinct(dialog_ids: &[DialogId]) -> Result<()> {
    let mut seen = HashSet::with_capacity(dialog_ids.len());
    match dialog_ids.iter().find(|d| !seen.insert(**d)) {
        Some(dup) => Err(FolioError::Validation(format!("Dialog {} is listed twice", dup))),
        None => Ok(()),
    }
}

/// Validate the choice of dialogs to import from a link
pub fn check_join_choice(preview: &InviteLinkPreview, chosen: &[DialogId]) -> Result<()> {
    if chosen.is_empty() {
        return Err(FolioError::validation("Choose at least one dialog to join"));
    }
    check_distinct(chosen)?;
    let offered: HashSet<DialogId> = preview.dialog_ids.iter().copied().collect();
    if let Some(stray) = chosen.iter().find(|d| !offered.contains(*d)) {
        return Err(FolioError::Validation(format!(
            "Dialog {} is not offered by invite link {}",
            stray, preview.slug
        )));
    }
    Ok(())
}

impl FilterManager {
    /// Validate a create or edit of an invite link for a filter
    pub fn check_invite_link_request(&self, id: FilterId, name: &str, dialog_ids: &[DialogId]) -> Result<()> {
        let filter = self.require_filter(id)?;
        let max_name = self.limits().max_invite_link_name_length;
        if name.chars().count() > max_name {
            return Err(FolioError::Validation(format!(
                "Invite link name must not exceed {} characters",
                max_name
            )));
        }
        if dialog_ids.is_empty() {
            return Err(FolioError::validation("Invite link must share at least one dialog"));
        }
        check_distinct(dialog_ids)?;
        if let Some(stray) = dialog_ids.iter().find(|d| !filter.includes(**d)) {
            return Err(FolioError::Validation(format!(
                "Dialog {} is not included in filter {}",
                stray, id
            )));
        }
        if !filter.excluded.is_empty() || !filter.flags.is_empty() {
            return Err(FolioError::validation(
                "Filter with excluded dialogs or dialog categories can't be shared",
            ));
        }
        Ok(())
    }

    /// Validate a request that only names an existing filter
    pub fn check_filter_exists(&self, id: FilterId) -> Result<()> {
        self.require_filter(id).map(|_| ())
    }

    /// Record the server's view of a filter after a link was created
    pub fn on_invite_link_created(&mut self, created: &InviteLinkCreated) {
        let mut filter = created.filter.clone();
        if filter.share.is_none() {
            filter.share = Some(Default::default());
        }
        if let Some(share) = filter.share.as_mut() {
            share.has_my_invite_links = true;
        }
        self.on_remote_filter(filter);
    }

    /// Links were listed, edited or deleted; the server's list changed
    pub fn on_invite_links_changed(&mut self, id: FilterId) {
        tracing::debug!(filter_id = %id, "Invite links changed, refreshing filters");
        self.on_update_filters();
    }

    /// Mark which offered dialogs the matching local filter already has
    pub fn annotate_preview(&self, mut preview: InviteLinkPreview) -> InviteLinkPreview {
        if let Some(filter) = preview.filter_id.and_then(|id| self.get_filter(id)) {
            preview.already_added = preview
                .dialog_ids
                .iter()
                .copied()
                .filter(|d| filter.includes(*d))
                .collect();
        }
        preview
    }
}
