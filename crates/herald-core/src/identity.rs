use crate::crypto::{kdf, random_bytes};
use crate::types::{now_secs, serde_bytes_array, serde_option_bytes_array};
use crate::{Error, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Long-term identity key pair, owned exclusively by one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKeyPair {
    #[serde(with = "serde_bytes_array")]
    pub public: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub private: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let private = random_bytes();
        let public = kdf(&private, b"herald-identity-public", 1)[0];
        Self { public, private }
    }
}

/// One-time pre-key; published at most once, then consumed exactly once on
/// session establishment and deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyRecord {
    pub id: u32,
    #[serde(with = "serde_bytes_array")]
    pub public: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub private: [u8; 32],
    /// Handed out in a bundle; the private half stays until the matching
    /// establishment message consumes it.
    #[serde(default)]
    pub published: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyRecord {
    pub id: u32,
    #[serde(with = "serde_bytes_array")]
    pub public: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub private: [u8; 32],
    pub created_at: u64,
}

/// What a peer publishes so sessions can be established while it is offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    #[serde(with = "serde_bytes_array")]
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    #[serde(with = "serde_bytes_array")]
    pub signed_pre_key: [u8; 32],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
    #[serde(with = "serde_option_bytes_array", default)]
    pub one_time_pre_key: Option<[u8; 32]>,
}

/// Outcome of recording a peer's identity key.
///
/// `Changed` is a trust-boundary event: every session with that peer must be
/// invalidated by the caller, and the change surfaced, never auto-accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    New,
    Unchanged,
    Changed,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedPreKeySlots {
    current: SignedPreKeyRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<SignedPreKeyRecord>,
}

pub struct IdentityKeyStore {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
}

impl IdentityKeyStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn pre_key_key(&self, id: u32) -> String {
        self.key(&format!("prekey/{:010}", id))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StoreCorruption(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.storage.put(key, serde_json::to_string(value)?)
    }

    /// Generate and persist the account identity. Idempotent: an existing
    /// identity is returned unchanged.
    pub fn create_identity(&self) -> Result<IdentityKeyPair> {
        if let Some(existing) = self.read::<IdentityKeyPair>(&self.key("identity"))? {
            return Ok(existing);
        }
        let pair = IdentityKeyPair::generate();
        self.write(&self.key("identity"), &pair)?;
        Ok(pair)
    }

    /// Install identity material received over a provisioning handshake. A
    /// linked device carries the account identity, never its own.
    pub fn import_identity(&self, pair: &IdentityKeyPair) -> Result<()> {
        self.write(&self.key("identity"), pair)
    }

    pub fn identity(&self) -> Result<IdentityKeyPair> {
        self.read(&self.key("identity"))?
            .ok_or_else(|| Error::StoreCorruption("identity material missing".to_string()))
    }

    pub fn generate_pre_keys(&self, count: u32, start_id: u32) -> Result<Vec<PreKeyRecord>> {
        let mut records = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let private = random_bytes();
            let record = PreKeyRecord {
                id: start_id + offset,
                public: kdf(&private, b"herald-prekey-public", 1)[0],
                private,
                published: false,
            };
            self.write(&self.pre_key_key(record.id), &record)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Consume a one-time pre-key. The record is deleted before it is
    /// returned, so no counter of it can ever be consumed twice.
    pub fn take_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>> {
        let key = self.pre_key_key(id);
        let Some(record) = self.read::<PreKeyRecord>(&key)? else {
            return Ok(None);
        };
        self.storage.del(&key)?;
        Ok(Some(record))
    }

    /// Keys still available for publication; published-but-unconsumed keys
    /// are not counted.
    pub fn pre_key_count(&self) -> Result<u32> {
        let mut count = 0;
        for key in self.storage.list(&self.key("prekey/"))? {
            if let Some(record) = self.read::<PreKeyRecord>(&key)? {
                if !record.published {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn next_pre_key_id(&self) -> Result<u32> {
        let keys = self.storage.list(&self.key("prekey/"))?;
        let max = keys
            .iter()
            .filter_map(|k| k.rsplit('/').next())
            .filter_map(|s| s.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Top the one-time pool back up when it runs low.
    pub fn replenish_pre_keys(&self, min: u32, batch: u32) -> Result<Vec<PreKeyRecord>> {
        if self.pre_key_count()? >= min {
            return Ok(Vec::new());
        }
        let start = self.next_pre_key_id()?;
        self.generate_pre_keys(batch, start)
    }

    /// Rotate the signed pre-key. The outgoing key stays in the previous
    /// slot so already-in-flight messages still decrypt.
    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyRecord> {
        let slots = self.read::<SignedPreKeySlots>(&self.key("signed-prekey"))?;
        let next_id = slots.as_ref().map(|s| s.current.id + 1).unwrap_or(1);

        let private = random_bytes();
        let record = SignedPreKeyRecord {
            id: next_id,
            public: kdf(&private, b"herald-signed-prekey-public", 1)[0],
            private,
            created_at: now_secs(),
        };

        let new_slots = SignedPreKeySlots {
            current: record.clone(),
            previous: slots.map(|s| s.current),
        };
        self.write(&self.key("signed-prekey"), &new_slots)?;
        Ok(record)
    }

    pub fn signed_pre_key(&self) -> Result<SignedPreKeyRecord> {
        let slots = self
            .read::<SignedPreKeySlots>(&self.key("signed-prekey"))?
            .ok_or_else(|| Error::StoreCorruption("signed pre-key missing".to_string()))?;
        Ok(slots.current)
    }

    pub fn signed_pre_key_by_id(&self, id: u32) -> Result<Option<SignedPreKeyRecord>> {
        let Some(slots) = self.read::<SignedPreKeySlots>(&self.key("signed-prekey"))? else {
            return Ok(None);
        };
        if slots.current.id == id {
            return Ok(Some(slots.current));
        }
        Ok(slots.previous.filter(|p| p.id == id))
    }

    pub fn get_trusted_identity(&self, peer: &str) -> Result<Option<[u8; 32]>> {
        let record = self.read::<TrustedIdentity>(&self.key(&format!("trust/{}", peer)))?;
        Ok(record.map(|r| r.identity_key))
    }

    /// Record a peer's identity key and report how it relates to what we
    /// already trusted. On `Changed` the caller must drop every session with
    /// the peer; this store only records the new key.
    pub fn save_identity(&self, peer: &str, identity_key: [u8; 32]) -> Result<TrustDecision> {
        let key = self.key(&format!("trust/{}", peer));
        let decision = match self.read::<TrustedIdentity>(&key)? {
            None => TrustDecision::New,
            Some(existing) if existing.identity_key == identity_key => TrustDecision::Unchanged,
            Some(_) => TrustDecision::Changed,
        };
        if decision != TrustDecision::Unchanged {
            self.write(
                &key,
                &TrustedIdentity {
                    identity_key,
                    recorded_at: now_secs(),
                },
            )?;
        }
        Ok(decision)
    }

    /// Bundle for publication: current signed pre-key plus one one-time key.
    /// The one-time key is marked published so no later bundle hands it out
    /// again; its private half stays until establishment consumes it.
    pub fn publish_bundle(&self) -> Result<PreKeyBundle> {
        let identity = self.identity()?;
        let signed = self.signed_pre_key()?;

        let mut one_time = None;
        for key in self.storage.list(&self.key("prekey/"))? {
            if let Some(record) = self.read::<PreKeyRecord>(&key)? {
                if !record.published {
                    one_time = Some(record);
                    break;
                }
            }
        }

        let mut one_time = one_time.ok_or(Error::ExhaustedPreKeys)?;
        one_time.published = true;
        self.write(&self.pre_key_key(one_time.id), &one_time)?;

        Ok(PreKeyBundle {
            identity_key: identity.public,
            signed_pre_key_id: signed.id,
            signed_pre_key: signed.public,
            one_time_pre_key_id: Some(one_time.id),
            one_time_pre_key: Some(one_time.public),
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedIdentity {
    #[serde(with = "serde_bytes_array")]
    identity_key: [u8; 32],
    recorded_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn store() -> IdentityKeyStore {
        IdentityKeyStore::new(Arc::new(InMemoryStorage::new()), "acct/test/")
    }

    #[test]
    fn create_identity_is_idempotent() {
        let store = store();
        let first = store.create_identity().unwrap();
        let second = store.create_identity().unwrap();
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn pre_keys_are_consumed_exactly_once() {
        let store = store();
        store.generate_pre_keys(3, 1).unwrap();
        assert_eq!(store.pre_key_count().unwrap(), 3);

        let taken = store.take_pre_key(2).unwrap().unwrap();
        assert_eq!(taken.id, 2);
        assert!(store.take_pre_key(2).unwrap().is_none());
        assert_eq!(store.pre_key_count().unwrap(), 2);
    }

    #[test]
    fn publish_bundle_drains_the_pool_then_fails() {
        let store = store();
        store.create_identity().unwrap();
        store.rotate_signed_pre_key().unwrap();
        store.generate_pre_keys(5, 1).unwrap();

        for _ in 0..5 {
            store.publish_bundle().unwrap();
        }
        assert!(matches!(
            store.publish_bundle(),
            Err(Error::ExhaustedPreKeys)
        ));
    }

    #[test]
    fn replenish_only_below_min() {
        let store = store();
        store.generate_pre_keys(5, 1).unwrap();

        assert!(store.replenish_pre_keys(5, 10).unwrap().is_empty());

        store.take_pre_key(1).unwrap();
        let added = store.replenish_pre_keys(5, 10).unwrap();
        assert_eq!(added.len(), 10);
        assert_eq!(added[0].id, 6);
        assert_eq!(store.pre_key_count().unwrap(), 14);
    }

    #[test]
    fn rotation_keeps_one_previous_slot() {
        let store = store();
        let first = store.rotate_signed_pre_key().unwrap();
        let second = store.rotate_signed_pre_key().unwrap();
        let third = store.rotate_signed_pre_key().unwrap();

        assert_eq!(store.signed_pre_key().unwrap().id, third.id);
        assert!(store.signed_pre_key_by_id(second.id).unwrap().is_some());
        assert!(store.signed_pre_key_by_id(first.id).unwrap().is_none());
    }

    #[test]
    fn save_identity_reports_new_unchanged_changed() {
        let store = store();
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];

        assert_eq!(store.save_identity("bob", key_a).unwrap(), TrustDecision::New);
        assert_eq!(
            store.save_identity("bob", key_a).unwrap(),
            TrustDecision::Unchanged
        );
        assert_eq!(
            store.save_identity("bob", key_b).unwrap(),
            TrustDecision::Changed
        );
        assert_eq!(store.get_trusted_identity("bob").unwrap(), Some(key_b));
    }

    #[test]
    fn corrupt_identity_record_surfaces_store_corruption() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .put("acct/test/identity", "not-json".to_string())
            .unwrap();
        let store = IdentityKeyStore::new(storage, "acct/test/");
        assert!(matches!(
            store.identity(),
            Err(Error::StoreCorruption(_))
        ));
    }
}
