use super::App;
use crate::output::Output;
use anyhow::{Context, Result};
use herald_core::PreKeyBundle;

/// Import a peer's published pre-key bundle (JSON from the peer's
/// `prekeys publish`) so sessions to that device can be established.
pub fn add_bundle(
    app: &App,
    peer: &str,
    device_id: u32,
    bundle_json: &str,
    output: &Output,
) -> Result<()> {
    let bundle: PreKeyBundle = serde_json::from_str(bundle_json).context("parsing bundle")?;
    app.directory.add_bundle(peer, device_id, bundle)?;
    output.success_message(
        "contact-add-bundle",
        &format!("Stored bundle for {}.{}", peer, device_id),
    );
    Ok(())
}

pub fn list(app: &App, output: &Output) -> Result<()> {
    let contacts: Vec<_> = app
        .directory
        .list_contacts()?
        .into_iter()
        .map(|(peer, devices)| serde_json::json!({ "peer": peer, "devices": devices }))
        .collect();
    output.success("contacts", contacts);
    Ok(())
}
