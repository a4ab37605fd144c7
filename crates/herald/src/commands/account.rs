use super::App;
use crate::output::Output;
use anyhow::Result;
use herald_core::ProvisioningRequest;
use serde_json::json;

pub fn register(app: &mut App, id: &str, output: &Output) -> Result<()> {
    let flow = app.registry.register(id)?;
    // The SMS/voice leg is an external collaborator; surface its code on
    // stderr so operators can complete the flow.
    if let Some(code) = app.registry.issued_code(&flow) {
        eprintln!("Verification code for {}: {}", id, code);
    }
    output.success(
        "register",
        json!({ "flowId": flow, "state": "awaitingVerification" }),
    );
    Ok(())
}

pub fn verify(app: &mut App, flow: &str, code: &str, output: &Output) -> Result<()> {
    app.registry.verify(flow, code)?;
    let account = app.registry.complete_registration(flow)?;

    if app.config.default_account.is_none() {
        app.config.set_default_account(&account.handle())?;
    }

    output.success(
        "verify",
        json!({
            "account": account.handle(),
            "deviceId": account.device_id(),
            "state": "active",
        }),
    );
    Ok(())
}

pub fn link(app: &App, account_id: &str, output: &Output) -> Result<()> {
    let request = ProvisioningRequest::new(account_id);
    let token = request.token.clone();
    let flow = app.registry.link_device(request)?;
    // The token travels over the provisioning channel (QR scan) out of band.
    eprintln!("Provisioning token for {}: {}", account_id, token);
    output.success(
        "link",
        json!({ "flowId": flow, "state": "awaitingLinkConfirmation" }),
    );
    Ok(())
}

pub fn confirm_link(app: &App, flow: &str, token: &str, output: &Output) -> Result<()> {
    let account = app.registry.confirm_link(flow, token)?;
    output.success(
        "confirm-link",
        json!({
            "account": account.handle(),
            "deviceId": account.device_id(),
            "state": "linked",
        }),
    );
    Ok(())
}

pub fn abort(app: &App, flow: &str, output: &Output) -> Result<()> {
    app.registry.abort(flow)?;
    output.success_message("abort", "Flow aborted");
    Ok(())
}

pub fn unlink(app: &App, handle: &str, output: &Output) -> Result<()> {
    app.registry.unlink(handle)?;
    output.success_message("unlink", &format!("Removed account {}", handle));
    Ok(())
}

pub fn list(app: &App, output: &Output) -> Result<()> {
    let accounts: Vec<_> = app
        .registry
        .list_accounts()
        .iter()
        .map(|a| {
            json!({
                "account": a.handle(),
                "id": a.id(),
                "deviceId": a.device_id(),
                "state": a.registration_state(),
            })
        })
        .collect();
    output.success("accounts", accounts);
    Ok(())
}

pub fn devices(app: &App, account_flag: Option<&str>, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account_flag)?;
    let account = app.registry.get(&handle)?;
    output.success("devices", account.linked_devices()?);
    Ok(())
}

pub fn prekey_status(app: &App, account_flag: Option<&str>, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account_flag)?;
    let account = app.registry.get(&handle)?;
    let store = account.identity_store();
    output.success(
        "prekeys",
        json!({
            "oneTimeRemaining": store.pre_key_count()?,
            "signedPreKeyId": store.signed_pre_key()?.id,
        }),
    );
    Ok(())
}

pub fn prekey_replenish(
    app: &App,
    account_flag: Option<&str>,
    min: u32,
    batch: u32,
    output: &Output,
) -> Result<()> {
    let handle = app.config.resolve_account(account_flag)?;
    let account = app.registry.get(&handle)?;
    let added = account.identity_store().replenish_pre_keys(min, batch)?;
    output.success(
        "prekeys-replenish",
        json!({ "added": added.len(), "remaining": account.identity_store().pre_key_count()? }),
    );
    Ok(())
}

/// Consume one one-time pre-key and emit the resulting bundle, for the peer
/// side to import with `contact add-bundle`.
pub fn prekey_publish(app: &App, account_flag: Option<&str>, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account_flag)?;
    let account = app.registry.get(&handle)?;
    let bundle = account.identity_store().publish_bundle()?;
    output.success("prekeys-publish", bundle);
    Ok(())
}

pub fn rotate_signed_prekey(app: &App, account_flag: Option<&str>, output: &Output) -> Result<()> {
    let handle = app.config.resolve_account(account_flag)?;
    let account = app.registry.get(&handle)?;
    let record = account.identity_store().rotate_signed_pre_key()?;
    output.success(
        "prekeys-rotate",
        json!({ "signedPreKeyId": record.id, "createdAt": record.created_at }),
    );
    Ok(())
}
