use crate::identity::{IdentityKeyPair, PreKeyBundle};
use crate::types::{serde_bytes_array, serde_hashmap_u64_bytes, Address, MAX_SKIP};
use crate::{Error, Result};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const TAG_LEN: usize = 16;

pub fn kdf(input: &[u8], salt: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        hk.expand(&[i as u8], &mut okm)
            .expect("32 bytes is valid length");
        outputs.push(okm);
    }
    outputs
}

pub fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Establishment data carried on frames until the responder has replied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    #[serde(with = "serde_bytes_array")]
    pub base_key: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub initiator_identity: [u8; 32],
    pub initiator: Address,
    pub signed_pre_key_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_key_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeader {
    pub counter: u64,
    pub previous_counter: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_init: Option<SessionInit>,
}

/// One encrypted message as handed to the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub header: FrameHeader,
    pub body: String,
}

/// Symmetric ratchet state for one direction pair with a peer device.
///
/// Message keys are derived per counter and deleted once used; skipped
/// counters park their keys in `skipped_keys` until consumed or evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetState {
    #[serde(with = "serde_bytes_array")]
    pub root_key: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub sending_chain_key: [u8; 32],
    #[serde(with = "serde_bytes_array")]
    pub receiving_chain_key: [u8; 32],
    pub send_counter: u64,
    pub recv_counter: u64,
    pub previous_send_counter: u64,
    #[serde(with = "serde_hashmap_u64_bytes")]
    pub skipped_keys: HashMap<u64, [u8; 32]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_init: Option<SessionInit>,
}

/// The narrow interface the core consumes for all cryptographic work.
///
/// Implementations are stateless apart from the `RatchetState` they advance.
pub trait CryptoEngine: Send + Sync {
    fn establish_initiator(
        &self,
        our_identity: &IdentityKeyPair,
        our_address: &Address,
        bundle: &PreKeyBundle,
    ) -> Result<RatchetState>;

    fn establish_responder(
        &self,
        our_identity: &IdentityKeyPair,
        signed_pre_key_public: [u8; 32],
        one_time_pre_key_public: Option<[u8; 32]>,
        init: &SessionInit,
    ) -> Result<RatchetState>;

    fn encrypt(&self, state: &mut RatchetState, plaintext: &[u8]) -> Result<MessageFrame>;

    fn decrypt(&self, state: &mut RatchetState, frame: &MessageFrame) -> Result<Vec<u8>>;
}

/// Default engine: HKDF-SHA256 chain steps, one message key per counter.
pub struct ChainKdfEngine;

impl ChainKdfEngine {
    pub fn new() -> Self {
        Self
    }

    fn shared_secret(
        base_key: &[u8; 32],
        responder_identity: &[u8; 32],
        signed_pre_key: &[u8; 32],
        one_time_pre_key: Option<&[u8; 32]>,
    ) -> [u8; 32] {
        let mut transcript = Vec::with_capacity(128);
        transcript.extend_from_slice(responder_identity);
        transcript.extend_from_slice(signed_pre_key);
        if let Some(otpk) = one_time_pre_key {
            transcript.extend_from_slice(otpk);
        }
        kdf(base_key, &transcript, 1)[0]
    }

    fn chains(shared: &[u8; 32]) -> ([u8; 32], [u8; 32], [u8; 32]) {
        let out = kdf(shared, b"herald-session-chains", 3);
        (out[0], out[1], out[2])
    }

    fn message_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let out = kdf(chain_key, b"herald-chain-step", 2);
        (out[0], out[1])
    }

    // expand is limited to 255 * 32 bytes per call; chunk long messages
    fn keystream(message_key: &[u8; 32], len: usize) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(Some(b"herald-keystream"), message_key);
        let mut out = Vec::with_capacity(len);
        let mut block: u32 = 0;
        while out.len() < len {
            let take = (len - out.len()).min(4096);
            let mut chunk = vec![0u8; take];
            hk.expand(&block.to_be_bytes(), &mut chunk)
                .expect("chunk length is valid");
            out.extend_from_slice(&chunk);
            block += 1;
        }
        out
    }

    fn tag(message_key: &[u8; 32], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(message_key);
        hasher.update(ciphertext);
        let digest = hasher.finalize();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }

    /// Derive the message key for `counter`, advancing a scratch copy of the
    /// receiving chain. State is committed only after the tag verifies.
    fn receive_key(state: &RatchetState, counter: u64) -> Result<([u8; 32], [u8; 32], u64)> {
        if counter < state.recv_counter {
            return match state.skipped_keys.get(&counter) {
                Some(key) => Ok((*key, state.receiving_chain_key, state.recv_counter)),
                None => Err(Error::Replay(counter)),
            };
        }

        if counter - state.recv_counter > MAX_SKIP {
            return Err(Error::TooManySkippedMessages);
        }

        let mut chain_key = state.receiving_chain_key;
        let mut cursor = state.recv_counter;
        let mut message_key = [0u8; 32];
        while cursor <= counter {
            let (mk, next) = Self::message_key(&chain_key);
            message_key = mk;
            chain_key = next;
            cursor += 1;
        }
        Ok((message_key, chain_key, counter + 1))
    }
}

impl Default for ChainKdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoEngine for ChainKdfEngine {
    fn establish_initiator(
        &self,
        our_identity: &IdentityKeyPair,
        our_address: &Address,
        bundle: &PreKeyBundle,
    ) -> Result<RatchetState> {
        let base_key = random_bytes();
        let shared = Self::shared_secret(
            &base_key,
            &bundle.identity_key,
            &bundle.signed_pre_key,
            bundle.one_time_pre_key.as_ref(),
        );
        let (root_key, initiator_chain, responder_chain) = Self::chains(&shared);

        Ok(RatchetState {
            root_key,
            sending_chain_key: initiator_chain,
            receiving_chain_key: responder_chain,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped_keys: HashMap::new(),
            pending_init: Some(SessionInit {
                base_key,
                initiator_identity: our_identity.public,
                initiator: our_address.clone(),
                signed_pre_key_id: bundle.signed_pre_key_id,
                pre_key_id: bundle.one_time_pre_key_id,
            }),
        })
    }

    fn establish_responder(
        &self,
        our_identity: &IdentityKeyPair,
        signed_pre_key_public: [u8; 32],
        one_time_pre_key_public: Option<[u8; 32]>,
        init: &SessionInit,
    ) -> Result<RatchetState> {
        let shared = Self::shared_secret(
            &init.base_key,
            &our_identity.public,
            &signed_pre_key_public,
            one_time_pre_key_public.as_ref(),
        );
        let (root_key, initiator_chain, responder_chain) = Self::chains(&shared);

        Ok(RatchetState {
            root_key,
            sending_chain_key: responder_chain,
            receiving_chain_key: initiator_chain,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped_keys: HashMap::new(),
            pending_init: None,
        })
    }

    fn encrypt(&self, state: &mut RatchetState, plaintext: &[u8]) -> Result<MessageFrame> {
        let (message_key, next_chain) = Self::message_key(&state.sending_chain_key);

        let stream = Self::keystream(&message_key, plaintext.len());
        let mut ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(stream.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        ciphertext.extend_from_slice(&Self::tag(&message_key, &ciphertext[..]));

        let header = FrameHeader {
            counter: state.send_counter,
            previous_counter: state.previous_send_counter,
            session_init: state.pending_init.clone(),
        };

        state.sending_chain_key = next_chain;
        state.send_counter += 1;

        Ok(MessageFrame {
            header,
            body: base64::engine::general_purpose::STANDARD.encode(&ciphertext),
        })
    }

    fn decrypt(&self, state: &mut RatchetState, frame: &MessageFrame) -> Result<Vec<u8>> {
        let body = base64::engine::general_purpose::STANDARD
            .decode(&frame.body)
            .map_err(|e| Error::Decryption(format!("Invalid body encoding: {}", e)))?;
        if body.len() < TAG_LEN {
            return Err(Error::Decryption("Body shorter than tag".to_string()));
        }
        let (ciphertext, tag) = body.split_at(body.len() - TAG_LEN);

        let counter = frame.header.counter;
        let (message_key, next_chain, next_counter) = Self::receive_key(state, counter)?;

        if Self::tag(&message_key, ciphertext) != tag {
            return Err(Error::Decryption("Tag mismatch".to_string()));
        }

        let stream = Self::keystream(&message_key, ciphertext.len());
        let plaintext: Vec<u8> = ciphertext
            .iter()
            .zip(stream.iter())
            .map(|(c, s)| c ^ s)
            .collect();

        // Commit: record keys for counters we skipped over, consume this one.
        if counter >= state.recv_counter {
            let mut chain_key = state.receiving_chain_key;
            let mut cursor = state.recv_counter;
            while cursor < counter {
                let (mk, next) = Self::message_key(&chain_key);
                state.skipped_keys.insert(cursor, mk);
                chain_key = next;
                cursor += 1;
            }
            state.receiving_chain_key = next_chain;
            state.recv_counter = next_counter;
        } else {
            state.skipped_keys.remove(&counter);
        }
        state.pending_init = None;

        Ok(plaintext)
    }
}
