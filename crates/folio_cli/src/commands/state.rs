//! `folio state` subcommands

use crate::load_config;
use anyhow::{bail, Context, Result};
use folio_sync::pending::{OperationKind, OperationState, PendingOperation};
use folio_sync::persist::read_state_file;
use folio_sync::PersistedState;
use serde_json::json;

fn load_state() -> Result<Option<PersistedState>> {
    let config = load_config()?;
    let path = config.state_path();
    tracing::debug!("Reading filter state from {:?}", path);
    read_state_file(&path).with_context(|| format!("Failed to read {}", path.display()))
}

fn describe_kind(kind: &OperationKind) -> String {
    match kind {
        OperationKind::Create(id) => format!("create {}", id),
        OperationKind::Edit(id) => format!("edit {}", id),
        OperationKind::Delete(id) => format!("delete {}", id),
        OperationKind::Reorder => "reorder".to_string(),
    }
}

fn describe_state(op: &PendingOperation) -> &'static str {
    match op.state {
        OperationState::Queued => "queued",
        OperationState::InFlight { .. } => "in flight",
        OperationState::Acknowledged { .. } => "acknowledged",
    }
}

pub fn show(json: bool) -> Result<()> {
    let state = load_state()?;

    if json {
        let output = match &state {
            Some(state) => json!({
                "updated_at": state.updated_at,
                "main_position": state.main_position,
                "filters": state.filters.iter().map(|f| f.info()).collect::<Vec<_>>(),
                "pending": state.pending.iter().map(|op| json!({
                    "seq": op.seq,
                    "op": describe_kind(&op.kind),
                    "state": describe_state(op),
                })).collect::<Vec<_>>(),
            }),
            None => json!({
                "updated_at": null,
                "main_position": 0,
                "filters": [],
                "pending": [],
            }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let Some(state) = state else {
        println!("No persisted filter state");
        return Ok(());
    };

    match state.updated_at {
        Some(at) => println!("Last fetched: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last fetched: never"),
    }
    println!("Main list position: {}", state.main_position);
    println!("Filters: {}", state.filters.len());
    for filter in &state.filters {
        let shared = if filter.is_shareable() { ", shared" } else { "" };
        println!(
            "  [{}] {} ({} included, {} pinned{})",
            filter.id,
            filter.title,
            filter.included.len(),
            filter.pinned.len(),
            shared
        );
    }
    if !state.pending.is_empty() {
        println!("Pending operations: {}", state.pending.len());
        for op in &state.pending {
            println!("  #{} {} ({})", op.seq, describe_kind(&op.kind), describe_state(op));
        }
    }
    Ok(())
}

pub fn check() -> Result<()> {
    let Some(state) = load_state()? else {
        eprintln!("✓ No persisted filter state");
        return Ok(());
    };

    if let Err(violation) = state.check() {
        eprintln!("✗ Persisted filter state is inconsistent");
        bail!("{}", violation);
    }
    eprintln!(
        "✓ Persisted filter state is consistent ({} filters, {} pending operations)",
        state.filters.len(),
        state.pending.len()
    );
    Ok(())
}
