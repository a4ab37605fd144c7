use crate::crypto::{CryptoEngine, MessageFrame};
use crate::session::PeerSession;
use crate::types::Address;
use crate::{Error, Result, StorageAdapter};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-(peer, device) session persistence with serialized ratchet access.
///
/// All encrypt/decrypt goes through a per-address lock: two messages for the
/// same peer device never advance the ratchet concurrently. The advanced
/// state is persisted before plaintext or ciphertext leaves this store, so a
/// crash can lose a message but can never rewind a ratchet.
pub struct SessionStore {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
    locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_key(&self, address: &Address) -> String {
        format!("{}session/{}/{:010}", self.prefix, address.peer, address.device_id)
    }

    fn peer_prefix(&self, peer: &str) -> String {
        format!("{}session/{}/", self.prefix, peer)
    }

    fn lock_for(&self, address: &Address) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn load_session(&self, address: &Address) -> Result<Option<PeerSession>> {
        match self.storage.get(&self.session_key(address))? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StoreCorruption(format!("session {}: {}", address, e))),
            None => Ok(None),
        }
    }

    pub fn store_session(&self, session: &PeerSession) -> Result<()> {
        let key = self.session_key(&session.address);
        self.storage.put(&key, serde_json::to_string(session)?)
    }

    pub fn contains_session(&self, address: &Address) -> Result<bool> {
        Ok(self.storage.get(&self.session_key(address))?.is_some())
    }

    pub fn delete_session(&self, address: &Address) -> Result<()> {
        self.storage.del(&self.session_key(address))
    }

    /// Drop every session with the peer, across all their devices. This is
    /// the identity-change path; the caller surfaces `TrustChanged`.
    pub fn delete_all_sessions(&self, peer: &str) -> Result<()> {
        self.storage.del_prefix(&self.peer_prefix(peer))
    }

    pub fn sub_device_sessions(&self, peer: &str) -> Result<BTreeSet<u32>> {
        let prefix = self.peer_prefix(peer);
        let keys = self.storage.list(&prefix)?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|s| s.parse::<u32>().ok())
            .collect())
    }

    pub fn list_sessions(&self) -> Result<Vec<Address>> {
        let prefix = format!("{}session/", self.prefix);
        let mut addresses = Vec::new();
        for key in self.storage.list(&prefix)? {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((peer, device)) = rest.rsplit_once('/') else {
                continue;
            };
            if let Ok(device_id) = device.parse::<u32>() {
                addresses.push(Address::new(peer, device_id));
            }
        }
        Ok(addresses)
    }

    /// Encrypt under the session for `address`. Fails with `SessionNotFound`
    /// when none exists; establishment is the pipeline's job.
    pub fn encrypt_with(
        &self,
        engine: &dyn CryptoEngine,
        address: &Address,
        plaintext: &[u8],
    ) -> Result<MessageFrame> {
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap();

        let mut session = self
            .load_session(address)?
            .ok_or_else(|| Error::SessionNotFound(address.to_string()))?;

        let frame = engine.encrypt(&mut session.current, plaintext)?;
        session.touch();
        self.store_session(&session)?;
        Ok(frame)
    }

    /// Decrypt a frame addressed to `address`, trying the current state
    /// first and then the bounded history. The state that succeeds is
    /// persisted (and promoted) before the plaintext is returned.
    pub fn decrypt_with(
        &self,
        engine: &dyn CryptoEngine,
        address: &Address,
        frame: &MessageFrame,
    ) -> Result<Vec<u8>> {
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap();

        let mut session = self
            .load_session(address)?
            .ok_or_else(|| Error::SessionNotFound(address.to_string()))?;

        match engine.decrypt(&mut session.current, frame) {
            Ok(plaintext) => {
                session.touch();
                self.store_session(&session)?;
                return Ok(plaintext);
            }
            Err(Error::Replay(counter)) => return Err(Error::Replay(counter)),
            Err(first_err) => {
                for idx in 0..session.previous.len() {
                    if let Ok(plaintext) = engine.decrypt(&mut session.previous[idx], frame) {
                        debug!(address = %address, index = idx, "previous session state decrypted; promoting");
                        session.promote(idx);
                        self.store_session(&session)?;
                        return Ok(plaintext);
                    }
                }
                Err(first_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChainKdfEngine, CryptoEngine};
    use crate::identity::{IdentityKeyPair, PreKeyBundle};
    use crate::InMemoryStorage;

    fn engine_pair(
        store_a: &SessionStore,
        store_b: &SessionStore,
        engine: &ChainKdfEngine,
    ) -> (Address, Address) {
        let alice_addr = Address::new("alice", 1);
        let bob_addr = Address::new("bob", 1);

        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let spk = crate::crypto::random_bytes();

        let bundle = PreKeyBundle {
            identity_key: bob_identity.public,
            signed_pre_key_id: 1,
            signed_pre_key: spk,
            one_time_pre_key_id: None,
            one_time_pre_key: None,
        };

        let alice_state = engine
            .establish_initiator(&alice_identity, &alice_addr, &bundle)
            .unwrap();
        let init = alice_state.pending_init.clone().unwrap();
        let bob_state = engine
            .establish_responder(&bob_identity, spk, None, &init)
            .unwrap();

        store_a
            .store_session(&PeerSession::new(bob_addr.clone(), alice_state))
            .unwrap();
        store_b
            .store_session(&PeerSession::new(alice_addr.clone(), bob_state))
            .unwrap();

        (alice_addr, bob_addr)
    }

    #[test]
    fn contains_and_delete() {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/a/");
        let engine = ChainKdfEngine::new();
        let other = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/b/");
        let (_, bob_addr) = engine_pair(&store, &other, &engine);

        assert!(store.contains_session(&bob_addr).unwrap());
        store.delete_session(&bob_addr).unwrap();
        assert!(!store.contains_session(&bob_addr).unwrap());
    }

    #[test]
    fn delete_all_sessions_clears_every_device() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = SessionStore::new(storage, "acct/a/");
        let engine = ChainKdfEngine::new();
        let other = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/b/");
        let (_, bob_addr) = engine_pair(&store, &other, &engine);

        // second device for the same peer
        let mut second = store.load_session(&bob_addr).unwrap().unwrap();
        second.address = Address::new("bob", 2);
        store.store_session(&second).unwrap();

        assert_eq!(store.sub_device_sessions("bob").unwrap().len(), 2);
        store.delete_all_sessions("bob").unwrap();
        assert!(store.sub_device_sessions("bob").unwrap().is_empty());
    }

    #[test]
    fn decrypt_persists_before_release() {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/a/");
        let other = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/b/");
        let engine = ChainKdfEngine::new();
        let (alice_addr, bob_addr) = engine_pair(&store, &other, &engine);

        let frame = store.encrypt_with(&engine, &bob_addr, b"hello").unwrap();
        let plaintext = other.decrypt_with(&engine, &alice_addr, &frame).unwrap();
        assert_eq!(plaintext, b"hello");

        // the persisted state has consumed counter 0: replay must fail even
        // through a fresh load
        assert!(matches!(
            other.decrypt_with(&engine, &alice_addr, &frame),
            Err(Error::Replay(0))
        ));
    }

    #[test]
    fn encrypt_without_session_fails() {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/a/");
        let engine = ChainKdfEngine::new();
        assert!(matches!(
            store.encrypt_with(&engine, &Address::new("nobody", 1), b"x"),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn concurrent_decrypts_never_interleave_ratchet_state() {
        let store = Arc::new(SessionStore::new(
            Arc::new(InMemoryStorage::new()),
            "acct/a/",
        ));
        let other = Arc::new(SessionStore::new(
            Arc::new(InMemoryStorage::new()),
            "acct/b/",
        ));
        let engine = ChainKdfEngine::new();
        let (alice_addr, bob_addr) = engine_pair(&store, &other, &engine);

        let frames: Vec<_> = (0..8)
            .map(|i| {
                store
                    .encrypt_with(&engine, &bob_addr, format!("m{}", i).as_bytes())
                    .unwrap()
            })
            .collect();

        let mut handles = Vec::new();
        for frame in frames.clone() {
            let other = other.clone();
            let alice_addr = alice_addr.clone();
            handles.push(std::thread::spawn(move || {
                let engine = ChainKdfEngine::new();
                other.decrypt_with(&engine, &alice_addr, &frame)
            }));
        }

        let mut decrypted = Vec::new();
        for handle in handles {
            decrypted.push(handle.join().unwrap().unwrap());
        }
        decrypted.sort();
        let expected: Vec<Vec<u8>> = (0..8).map(|i| format!("m{}", i).into_bytes()).collect();
        assert_eq!(decrypted, expected);

        // every counter was consumed exactly once
        for frame in &frames {
            assert!(matches!(
                other.decrypt_with(&engine, &alice_addr, frame),
                Err(Error::Replay(_))
            ));
        }
    }

    #[test]
    fn list_sessions_parses_addresses() {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/a/");
        let other = SessionStore::new(Arc::new(InMemoryStorage::new()), "acct/b/");
        let engine = ChainKdfEngine::new();
        let (_, bob_addr) = engine_pair(&store, &other, &engine);

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions, vec![bob_addr]);
    }
}
