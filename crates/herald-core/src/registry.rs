use crate::account::{Account, AccountManifest};
use crate::types::{now_secs, RegistrationState, MIN_PRE_KEYS, VERIFICATION_WINDOW_SECS};
use crate::{Error, Result, StorageAdapter};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    Aborted,
    Expired,
    WrongCode,
}

/// Registration and device-link flows, as explicit states with guarded
/// transitions. There is no silent retry: a failed flow stays failed until
/// the caller starts a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Started,
    AwaitingVerification,
    Verified,
    Active,
    AwaitingLinkConfirmation,
    Linked,
    Failed(FailureReason),
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Active | FlowState::Linked | FlowState::Failed(_))
    }
}

/// What a linking device presents to join an existing account identity.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub account_id: String,
    pub token: String,
}

impl ProvisioningRequest {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

enum FlowKind {
    Register { account_id: String, code: String },
    Link { request: ProvisioningRequest },
}

struct Flow {
    kind: FlowKind,
    state: FlowState,
    issued_at: u64,
}

/// Owns the set of local accounts; the only component that creates or
/// deletes one. Constructed explicitly and passed down, never ambient, so
/// several registries coexist in one process.
pub struct AccountRegistry {
    storage: Arc<dyn StorageAdapter>,
    accounts: Mutex<BTreeMap<String, Arc<Account>>>,
    flows: Mutex<HashMap<String, Flow>>,
}

impl AccountRegistry {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let registry = Self {
            storage,
            accounts: Mutex::new(BTreeMap::new()),
            flows: Mutex::new(HashMap::new()),
        };
        registry.load_accounts()?;
        Ok(registry)
    }

    fn load_accounts(&self) -> Result<()> {
        let keys = self.storage.list("acct/")?;
        let mut accounts = self.accounts.lock().unwrap();
        for key in keys {
            if !key.ends_with("/manifest") {
                continue;
            }
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let manifest: AccountManifest = serde_json::from_str(&raw)
                .map_err(|e| Error::StoreCorruption(format!("account {}: {}", key, e)))?;
            let account = Arc::new(Account::open(self.storage.clone(), manifest));
            accounts.insert(account.handle(), account);
        }
        Ok(())
    }

    /// Look up by handle (`id`, or `id#device` for a local linked device).
    pub fn get(&self, handle: &str) -> Result<Arc<Account>> {
        self.accounts
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::UnknownAccount(handle.to_string()))
    }

    /// Ordered by account id, stable across calls.
    pub fn list_accounts(&self) -> Vec<Arc<Account>> {
        self.accounts.lock().unwrap().values().cloned().collect()
    }

    pub fn flow_state(&self, flow_id: &str) -> Option<FlowState> {
        self.flows.lock().unwrap().get(flow_id).map(|f| f.state.clone())
    }

    #[cfg(test)]
    fn backdate_flow(&self, flow_id: &str, secs: u64) {
        if let Some(flow) = self.flows.lock().unwrap().get_mut(flow_id) {
            flow.issued_at = flow.issued_at.saturating_sub(secs);
        }
    }

    /// Begin registering `account_id`. Returns the flow id; the flow is left
    /// in `AwaitingVerification`.
    pub fn register(&self, account_id: &str) -> Result<String> {
        if self.accounts.lock().unwrap().contains_key(account_id) {
            return Err(Error::AlreadyRegistered(account_id.to_string()));
        }

        let flow_id = uuid::Uuid::new_v4().to_string();
        let code = format!("{:06}", rand::random::<u32>() % 1_000_000);
        info!(account = account_id, flow = %flow_id, "registration started, verification pending");

        self.flows.lock().unwrap().insert(
            flow_id.clone(),
            Flow {
                kind: FlowKind::Register {
                    account_id: account_id.to_string(),
                    code,
                },
                state: FlowState::AwaitingVerification,
                issued_at: now_secs(),
            },
        );
        Ok(flow_id)
    }

    /// The code the verification channel delivered for this flow. Stands in
    /// for the SMS/voice leg, which is an external collaborator.
    pub fn issued_code(&self, flow_id: &str) -> Option<String> {
        let flows = self.flows.lock().unwrap();
        match flows.get(flow_id).map(|f| &f.kind) {
            Some(FlowKind::Register { code, .. }) => Some(code.clone()),
            _ => None,
        }
    }

    /// Submit the verification code. Wrong codes and lapsed windows fail the
    /// flow; the caller must start over explicitly.
    pub fn verify(&self, flow_id: &str, code: &str) -> Result<FlowState> {
        let mut flows = self.flows.lock().unwrap();
        let flow = flows
            .get_mut(flow_id)
            .ok_or_else(|| Error::InvalidFlow(format!("unknown flow {}", flow_id)))?;

        if flow.state != FlowState::AwaitingVerification {
            return Err(Error::InvalidFlow(format!(
                "flow is not awaiting verification: {:?}",
                flow.state
            )));
        }

        if now_secs().saturating_sub(flow.issued_at) > VERIFICATION_WINDOW_SECS {
            flow.state = FlowState::Failed(FailureReason::Expired);
            return Err(Error::VerificationExpired);
        }

        let expected = match &flow.kind {
            FlowKind::Register { code, .. } => code.clone(),
            FlowKind::Link { .. } => {
                return Err(Error::InvalidFlow("link flows are not code-verified".to_string()))
            }
        };

        if expected != code {
            warn!(flow = flow_id, "verification code mismatch");
            flow.state = FlowState::Failed(FailureReason::WrongCode);
            return Err(Error::InvalidFlow("verification code mismatch".to_string()));
        }

        flow.state = FlowState::Verified;
        Ok(flow.state.clone())
    }

    /// Finish a verified registration: create the account, its identity, and
    /// an initial pre-key inventory. The flow becomes `Active`.
    pub fn complete_registration(&self, flow_id: &str) -> Result<Arc<Account>> {
        let account_id = {
            let mut flows = self.flows.lock().unwrap();
            let flow = flows
                .get_mut(flow_id)
                .ok_or_else(|| Error::InvalidFlow(format!("unknown flow {}", flow_id)))?;
            if flow.state != FlowState::Verified {
                return Err(Error::InvalidFlow(format!(
                    "flow is not verified: {:?}",
                    flow.state
                )));
            }
            flow.state = FlowState::Active;
            match &flow.kind {
                FlowKind::Register { account_id, .. } => account_id.clone(),
                FlowKind::Link { .. } => unreachable!("link flows never reach Verified"),
            }
        };

        self.create_account(&account_id, 1, RegistrationState::Registered)
    }

    /// Begin linking a new device into an existing account identity.
    pub fn link_device(&self, request: ProvisioningRequest) -> Result<String> {
        let flow_id = uuid::Uuid::new_v4().to_string();
        info!(account = %request.account_id, flow = %flow_id, "device link started, awaiting confirmation");
        self.flows.lock().unwrap().insert(
            flow_id.clone(),
            Flow {
                kind: FlowKind::Link { request },
                state: FlowState::AwaitingLinkConfirmation,
                issued_at: now_secs(),
            },
        );
        Ok(flow_id)
    }

    /// The primary device approved the provisioning token: create the linked
    /// account and record the device on the primary, if it is local.
    pub fn confirm_link(&self, flow_id: &str, token: &str) -> Result<Arc<Account>> {
        let (account_id, expected_token) = {
            let mut flows = self.flows.lock().unwrap();
            let flow = flows
                .get_mut(flow_id)
                .ok_or_else(|| Error::InvalidFlow(format!("unknown flow {}", flow_id)))?;

            if flow.state != FlowState::AwaitingLinkConfirmation {
                return Err(Error::InvalidFlow(format!(
                    "flow is not awaiting link confirmation: {:?}",
                    flow.state
                )));
            }

            if now_secs().saturating_sub(flow.issued_at) > VERIFICATION_WINDOW_SECS {
                flow.state = FlowState::Failed(FailureReason::Expired);
                return Err(Error::VerificationExpired);
            }

            match &flow.kind {
                FlowKind::Link { request } => {
                    (request.account_id.clone(), request.token.clone())
                }
                FlowKind::Register { .. } => {
                    return Err(Error::InvalidFlow(
                        "registration flows are not link-confirmed".to_string(),
                    ))
                }
            }
        };

        if expected_token != token {
            let mut flows = self.flows.lock().unwrap();
            if let Some(flow) = flows.get_mut(flow_id) {
                flow.state = FlowState::Failed(FailureReason::WrongCode);
            }
            return Err(Error::InvalidFlow("provisioning token mismatch".to_string()));
        }

        // The provisioning channel hands over the account identity; a linked
        // device never mints its own.
        let (device_id, identity) = match self.accounts.lock().unwrap().get(&account_id) {
            Some(primary) => (
                primary
                    .linked_devices()?
                    .last()
                    .map(|d| d.device_id + 1)
                    .unwrap_or(2),
                Some(primary.identity_store().identity()?),
            ),
            None => (2, None),
        };

        let account = self.create_account_with_identity(
            &account_id,
            device_id,
            RegistrationState::LinkedDevice,
            identity,
        )?;

        if let Some(flow) = self.flows.lock().unwrap().get_mut(flow_id) {
            flow.state = FlowState::Linked;
        }

        // Each side records the other, so sync flows both ways.
        account.add_linked_device(1)?;
        if let Ok(primary) = self.get(&account_id) {
            primary.add_linked_device(device_id)?;
        }

        Ok(account)
    }

    /// Caller-initiated abort; allowed from any non-terminal state.
    pub fn abort(&self, flow_id: &str) -> Result<()> {
        let mut flows = self.flows.lock().unwrap();
        let flow = flows
            .get_mut(flow_id)
            .ok_or_else(|| Error::InvalidFlow(format!("unknown flow {}", flow_id)))?;
        if flow.state.is_terminal() {
            return Err(Error::InvalidFlow(format!(
                "flow already terminal: {:?}",
                flow.state
            )));
        }
        flow.state = FlowState::Failed(FailureReason::Aborted);
        Ok(())
    }

    pub fn unlink(&self, handle: &str) -> Result<()> {
        let account = {
            let mut accounts = self.accounts.lock().unwrap();
            accounts
                .remove(handle)
                .ok_or_else(|| Error::UnknownAccount(handle.to_string()))?
        };

        // A linked device also disappears from its primary's device list.
        if account.device_id() != 1 {
            if let Ok(primary) = self.get(account.id()) {
                primary.remove_linked_device(account.device_id())?;
            }
        }

        info!(account = handle, "account unlinked, purging records");
        account.purge()
    }

    fn create_account(
        &self,
        id: &str,
        device_id: u32,
        registration_state: RegistrationState,
    ) -> Result<Arc<Account>> {
        self.create_account_with_identity(id, device_id, registration_state, None)
    }

    fn create_account_with_identity(
        &self,
        id: &str,
        device_id: u32,
        registration_state: RegistrationState,
        identity: Option<crate::identity::IdentityKeyPair>,
    ) -> Result<Arc<Account>> {
        let manifest = AccountManifest {
            id: id.to_string(),
            device_id,
            registration_state,
            created_at: now_secs(),
        };
        let account = Arc::new(Account::open(self.storage.clone(), manifest));
        account.persist_manifest()?;
        match identity {
            Some(pair) => account.identity_store().import_identity(&pair)?,
            None => {
                account.identity_store().create_identity()?;
            }
        }
        account.identity_store().rotate_signed_pre_key()?;
        account
            .identity_store()
            .generate_pre_keys(MIN_PRE_KEYS, 1)?;

        self.accounts
            .lock()
            .unwrap()
            .insert(account.handle(), account.clone());
        info!(account = id, device = device_id, "account created");
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn registry() -> AccountRegistry {
        AccountRegistry::new(Arc::new(InMemoryStorage::new())).unwrap()
    }

    fn register_active(registry: &AccountRegistry, id: &str) -> Arc<Account> {
        let flow = registry.register(id).unwrap();
        let code = registry.issued_code(&flow).unwrap();
        registry.verify(&flow, &code).unwrap();
        registry.complete_registration(&flow).unwrap()
    }

    #[test]
    fn registration_walks_the_state_machine() {
        let registry = registry();
        let flow = registry.register("+15550100").unwrap();
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::AwaitingVerification)
        );

        let code = registry.issued_code(&flow).unwrap();
        assert_eq!(registry.verify(&flow, &code).unwrap(), FlowState::Verified);

        let account = registry.complete_registration(&flow).unwrap();
        assert_eq!(registry.flow_state(&flow), Some(FlowState::Active));
        assert_eq!(account.registration_state(), RegistrationState::Registered);
        assert!(account.identity_store().pre_key_count().unwrap() > 0);
    }

    #[test]
    fn wrong_code_fails_the_flow_without_retry() {
        let registry = registry();
        let flow = registry.register("+15550100").unwrap();
        assert!(registry.verify(&flow, "000000a").is_err());
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::Failed(FailureReason::WrongCode))
        );
        // no silent retry: the failed flow rejects further verification
        assert!(registry.verify(&flow, "anything").is_err());
    }

    #[test]
    fn lapsed_verification_window_expires_the_flow() {
        let registry = registry();
        let flow = registry.register("+15550100").unwrap();
        let code = registry.issued_code(&flow).unwrap();

        registry.backdate_flow(&flow, VERIFICATION_WINDOW_SECS + 1);
        assert!(matches!(
            registry.verify(&flow, &code),
            Err(Error::VerificationExpired)
        ));
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::Failed(FailureReason::Expired))
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry();
        register_active(&registry, "+15550100");
        assert!(matches!(
            registry.register("+15550100"),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn abort_fails_a_pending_flow() {
        let registry = registry();
        let flow = registry.register("+15550100").unwrap();
        registry.abort(&flow).unwrap();
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::Failed(FailureReason::Aborted))
        );
        assert!(registry.abort(&flow).is_err());
    }

    #[test]
    fn linking_creates_secondary_and_records_device() {
        let registry = registry();
        let primary = register_active(&registry, "+15550100");

        let request = ProvisioningRequest::new("+15550100");
        let token = request.token.clone();
        let flow = registry.link_device(request).unwrap();
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::AwaitingLinkConfirmation)
        );

        let linked = registry.confirm_link(&flow, &token).unwrap();
        assert_eq!(registry.flow_state(&flow), Some(FlowState::Linked));
        assert_eq!(linked.registration_state(), RegistrationState::LinkedDevice);
        assert_eq!(linked.device_id(), 2);

        let devices = primary.linked_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, 2);
    }

    #[test]
    fn linked_device_shares_the_account_identity() {
        let registry = registry();
        let primary = register_active(&registry, "+15550100");

        let request = ProvisioningRequest::new("+15550100");
        let token = request.token.clone();
        let flow = registry.link_device(request).unwrap();
        let linked = registry.confirm_link(&flow, &token).unwrap();

        let primary_identity = primary.identity_store().identity().unwrap();
        let linked_identity = linked.identity_store().identity().unwrap();
        assert_eq!(primary_identity.public, linked_identity.public);
    }

    #[test]
    fn bad_provisioning_token_fails_the_flow() {
        let registry = registry();
        register_active(&registry, "+15550100");
        let flow = registry
            .link_device(ProvisioningRequest::new("+15550100"))
            .unwrap();
        assert!(registry.confirm_link(&flow, "wrong").is_err());
        assert_eq!(
            registry.flow_state(&flow),
            Some(FlowState::Failed(FailureReason::WrongCode))
        );
    }

    #[test]
    fn accounts_reload_from_storage() {
        let storage: Arc<InMemoryStorage> = Arc::new(InMemoryStorage::new());
        {
            let registry = AccountRegistry::new(storage.clone()).unwrap();
            let flow = registry.register("+15550100").unwrap();
            let code = registry.issued_code(&flow).unwrap();
            registry.verify(&flow, &code).unwrap();
            registry.complete_registration(&flow).unwrap();
        }

        let reopened = AccountRegistry::new(storage).unwrap();
        let accounts = reopened.list_accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id(), "+15550100");
    }

    #[test]
    fn unlink_removes_account_and_device_row() {
        let registry = registry();
        let primary = register_active(&registry, "+15550100");

        let request = ProvisioningRequest::new("+15550100");
        let token = request.token.clone();
        let flow = registry.link_device(request).unwrap();
        let linked = registry.confirm_link(&flow, &token).unwrap();

        registry.unlink(&linked.handle()).unwrap();
        assert!(registry.get(&linked.handle()).is_err());
        assert!(registry.get(primary.id()).is_ok());
        assert!(primary.linked_devices().unwrap().is_empty());
    }

    #[test]
    fn list_accounts_is_ordered() {
        let registry = registry();
        register_active(&registry, "bbb");
        register_active(&registry, "aaa");
        let ids: Vec<String> = registry
            .list_accounts()
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }
}
