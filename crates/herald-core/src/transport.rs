use crate::account::Account;
use crate::crypto::MessageFrame;
use crate::identity::PreKeyBundle;
use crate::types::Address;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One ciphertext in flight: what the transport collaborator carries.
///
/// Sealed envelopes omit the outer sender; the receiver recovers it from the
/// session that decrypts the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub recipient: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Address>,
    pub sealed: bool,
    pub frame: MessageFrame,
    pub sent_at: u64,
}

/// Transport verdict for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ack,
    /// Worth retrying: network trouble, service hiccup.
    Retryable(String),
    /// Not worth retrying: unregistered recipient, rejected payload.
    Terminal(String),
}

/// Outbound leg of the transport collaborator.
pub trait Transport: Send + Sync {
    fn send_ciphertext(&self, envelope: &Envelope) -> SendOutcome;
}

/// Service directory: recipient device lists and pre-key bundles.
pub trait PeerDirectory: Send + Sync {
    fn device_ids(&self, peer: &str) -> Result<Vec<u32>>;
    fn fetch_pre_key_bundle(&self, address: &Address) -> Result<PreKeyBundle>;
}

/// In-process transport: collects envelopes per recipient and can be told
/// to fail. Serves tests and the loopback demo mode of the CLI.
pub struct InMemoryTransport {
    delivered: Mutex<Vec<Envelope>>,
    retryable_failures: Mutex<u32>,
    terminal: Mutex<bool>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            retryable_failures: Mutex::new(0),
            terminal: Mutex::new(false),
        }
    }

    /// The next `count` sends fail as retryable before deliveries resume.
    pub fn fail_retryable(&self, count: u32) {
        *self.retryable_failures.lock().unwrap() = count;
    }

    /// All further sends fail terminally.
    pub fn fail_terminal(&self, on: bool) {
        *self.terminal.lock().unwrap() = on;
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn take_delivered(&self) -> Vec<Envelope> {
        std::mem::take(&mut self.delivered.lock().unwrap())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryTransport {
    fn send_ciphertext(&self, envelope: &Envelope) -> SendOutcome {
        if *self.terminal.lock().unwrap() {
            return SendOutcome::Terminal("recipient unregistered".to_string());
        }
        let mut failures = self.retryable_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return SendOutcome::Retryable("connection reset".to_string());
        }
        self.delivered.lock().unwrap().push(envelope.clone());
        SendOutcome::Ack
    }
}

/// In-process directory backed by locally registered accounts. Fetching a
/// bundle consumes one of the target's one-time pre-keys, the way the
/// service hands each bundle out exactly once.
pub struct InMemoryDirectory {
    devices: Mutex<HashMap<String, Vec<(u32, Arc<Account>)>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, account: Arc<Account>) {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices.entry(account.id().to_string()).or_default();
        entry.retain(|(device, _)| *device != account.device_id());
        entry.push((account.device_id(), account));
        entry.sort_by_key(|(device, _)| *device);
    }

    pub fn withdraw(&self, peer: &str, device_id: u32) {
        if let Some(entry) = self.devices.lock().unwrap().get_mut(peer) {
            entry.retain(|(device, _)| *device != device_id);
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory for InMemoryDirectory {
    fn device_ids(&self, peer: &str) -> Result<Vec<u32>> {
        let devices = self.devices.lock().unwrap();
        let entry = devices
            .get(peer)
            .ok_or_else(|| Error::TerminalTransport(format!("unknown recipient {}", peer)))?;
        Ok(entry.iter().map(|(device, _)| *device).collect())
    }

    fn fetch_pre_key_bundle(&self, address: &Address) -> Result<PreKeyBundle> {
        let account = {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&address.peer)
                .and_then(|entry| {
                    entry
                        .iter()
                        .find(|(device, _)| *device == address.device_id)
                        .map(|(_, account)| account.clone())
                })
                .ok_or_else(|| {
                    Error::TerminalTransport(format!("unknown recipient {}", address))
                })?
        };
        account.identity_store().publish_bundle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FrameHeader;
    use crate::types::now_secs;

    fn envelope() -> Envelope {
        Envelope {
            id: "e1".to_string(),
            recipient: Address::new("bob", 1),
            sender: Some(Address::new("alice", 1)),
            sealed: false,
            frame: MessageFrame {
                header: FrameHeader {
                    counter: 0,
                    previous_counter: 0,
                    session_init: None,
                },
                body: "AAAA".to_string(),
            },
            sent_at: now_secs(),
        }
    }

    #[test]
    fn transport_acks_then_records() {
        let transport = InMemoryTransport::new();
        assert_eq!(transport.send_ciphertext(&envelope()), SendOutcome::Ack);
        assert_eq!(transport.delivered().len(), 1);
    }

    #[test]
    fn injected_failures_come_first() {
        let transport = InMemoryTransport::new();
        transport.fail_retryable(2);
        assert!(matches!(
            transport.send_ciphertext(&envelope()),
            SendOutcome::Retryable(_)
        ));
        assert!(matches!(
            transport.send_ciphertext(&envelope()),
            SendOutcome::Retryable(_)
        ));
        assert_eq!(transport.send_ciphertext(&envelope()), SendOutcome::Ack);
    }

    #[test]
    fn sealed_envelope_serializes_without_sender() {
        let mut env = envelope();
        env.sender = None;
        env.sealed = true;
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"sender\""));
        assert!(json.contains("\"sealed\":true"));
    }
}
