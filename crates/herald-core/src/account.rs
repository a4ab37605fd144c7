use crate::group_store::GroupStateStore;
use crate::identity::{IdentityKeyStore, TrustDecision};
use crate::session_store::SessionStore;
use crate::types::{now_secs, LinkedDevice, RegistrationState};
use crate::{Error, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Durable account manifest; session/group/key material hangs off its own
/// keys under the account prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountManifest {
    pub id: String,
    pub device_id: u32,
    pub registration_state: RegistrationState,
    pub created_at: u64,
}

/// One local account: identity, sessions, groups, and linked-device records,
/// all exclusively owned. Accounts are created and destroyed only by the
/// registry.
pub struct Account {
    manifest: AccountManifest,
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
    identity: IdentityKeyStore,
    sessions: SessionStore,
    groups: GroupStateStore,
}

impl Account {
    pub(crate) fn open(storage: Arc<dyn StorageAdapter>, manifest: AccountManifest) -> Self {
        let prefix = Self::prefix_for(&manifest.id, manifest.device_id);
        Self {
            identity: IdentityKeyStore::new(storage.clone(), prefix.clone()),
            sessions: SessionStore::new(storage.clone(), prefix.clone()),
            groups: GroupStateStore::new(storage.clone(), prefix.clone()),
            manifest,
            storage,
            prefix,
        }
    }

    pub(crate) fn prefix_for(id: &str, device_id: u32) -> String {
        format!("acct/{}/{}/", id, device_id)
    }

    /// Registry handle: the bare id for a primary, `id#device` for a linked
    /// device living in the same process.
    pub fn handle(&self) -> String {
        if self.manifest.device_id == 1 {
            self.manifest.id.clone()
        } else {
            format!("{}#{}", self.manifest.id, self.manifest.device_id)
        }
    }

    pub(crate) fn persist_manifest(&self) -> Result<()> {
        self.storage.put(
            &format!("{}manifest", self.prefix),
            serde_json::to_string(&self.manifest)?,
        )
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn device_id(&self) -> u32 {
        self.manifest.device_id
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.manifest.registration_state
    }

    pub fn manifest(&self) -> &AccountManifest {
        &self.manifest
    }

    pub fn identity_store(&self) -> &IdentityKeyStore {
        &self.identity
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn group_store(&self) -> &GroupStateStore {
        &self.groups
    }

    pub(crate) fn storage(&self) -> Arc<dyn StorageAdapter> {
        self.storage.clone()
    }

    pub(crate) fn record_prefix(&self) -> &str {
        &self.prefix
    }

    /// Record a peer identity key. On `Changed`, every session with the peer
    /// is invalidated before the decision is returned; the caller surfaces
    /// the trust change, it is never auto-accepted.
    pub fn save_peer_identity(&self, peer: &str, key: [u8; 32]) -> Result<TrustDecision> {
        let decision = self.identity.save_identity(peer, key)?;
        if decision == TrustDecision::Changed {
            warn!(account = %self.manifest.id, peer, "peer identity key changed; dropping all sessions");
            self.sessions.delete_all_sessions(peer)?;
        }
        Ok(decision)
    }

    fn device_key(&self, device_id: u32) -> String {
        format!("{}device/{:010}", self.prefix, device_id)
    }

    pub fn linked_devices(&self) -> Result<Vec<LinkedDevice>> {
        let prefix = format!("{}device/", self.prefix);
        let mut devices = Vec::new();
        for key in self.storage.list(&prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let device: LinkedDevice = serde_json::from_str(&raw)
                .map_err(|e| Error::StoreCorruption(format!("device {}: {}", key, e)))?;
            devices.push(device);
        }
        devices.sort_by_key(|d| d.device_id);
        Ok(devices)
    }

    pub fn add_linked_device(&self, device_id: u32) -> Result<LinkedDevice> {
        let device = LinkedDevice {
            device_id,
            created_at: now_secs(),
            last_sync: None,
        };
        self.storage.put(
            &self.device_key(device_id),
            serde_json::to_string(&device)?,
        )?;
        Ok(device)
    }

    pub fn remove_linked_device(&self, device_id: u32) -> Result<()> {
        self.storage.del(&self.device_key(device_id))
    }

    pub fn mark_device_synced(&self, device_id: u32) -> Result<()> {
        let key = self.device_key(device_id);
        let Some(raw) = self.storage.get(&key)? else {
            return Ok(());
        };
        let mut device: LinkedDevice = serde_json::from_str(&raw)
            .map_err(|e| Error::StoreCorruption(format!("device {}: {}", key, e)))?;
        device.last_sync = Some(now_secs());
        self.storage.put(&key, serde_json::to_string(&device)?)
    }

    /// Remove every record belonging to this account.
    pub(crate) fn purge(&self) -> Result<()> {
        self.storage.del_prefix(&self.prefix)
    }
}
