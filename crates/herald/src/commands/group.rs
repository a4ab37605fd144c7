use super::App;
use crate::output::Output;
use anyhow::{Context, Result};
use herald_core::GroupDelta;

pub fn list(app: &App, account: Option<&str>, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account)?;
    let account = app.registry.get(&handle)?;
    output.success("groups", account.group_store().list_groups()?);
    Ok(())
}

pub fn show(app: &App, account: Option<&str>, group_id: &str, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account)?;
    let account = app.registry.get(&handle)?;
    match account.group_store().get_group(group_id)? {
        Some(group) => output.success("group", group),
        None => output.error(&format!("Unknown group {}", group_id)),
    }
    Ok(())
}

/// Apply a delta batch at a revision and distribute it to the members.
/// Deltas are given as a JSON array of operations.
pub fn update(
    app: &App,
    account: Option<&str>,
    group_id: &str,
    revision: u64,
    deltas_json: &str,
    output: &Output,
) -> Result<()> {
    let deltas: Vec<GroupDelta> =
        serde_json::from_str(deltas_json).context("parsing delta operations")?;
    let (pipeline, events) = app.pipeline(account)?;
    let (outcome, report) = pipeline.send_group_update(group_id, revision, deltas)?;
    while let Ok(event) = events.try_recv() {
        output.event(event);
    }
    output.success(
        "group-update",
        serde_json::json!({ "outcome": outcome, "report": report }),
    );
    Ok(())
}

pub fn send(
    app: &App,
    account: Option<&str>,
    group_id: &str,
    text: &str,
    output: &Output,
) -> Result<()> {
    let (pipeline, events) = app.pipeline(account)?;
    let report = pipeline.send_group_message(group_id, text)?;
    while let Ok(event) = events.try_recv() {
        output.event(event);
    }
    output.success("group-send", report);
    Ok(())
}
