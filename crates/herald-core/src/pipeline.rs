use crate::account::Account;
use crate::crypto::CryptoEngine;
use crate::group::GroupDelta;
use crate::group_store::UpdateOutcome;
use crate::identity::TrustDecision;
use crate::session::PeerSession;
use crate::sync::{SyncChange, SyncCoordinator, SyncRecord};
use crate::transport::{Envelope, PeerDirectory, SendOutcome, Transport};
use crate::types::{now_secs, Address};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decrypted message body, dispatched by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    Direct {
        message_id: String,
        text: String,
    },
    Group {
        message_id: String,
        group_id: String,
        text: String,
    },
    GroupUpdate {
        group_id: String,
        revision: u64,
        deltas: Vec<GroupDelta>,
    },
    Receipt {
        receipt: String,
        message_ids: Vec<String>,
    },
    Typing,
    Sync {
        record: SyncRecord,
    },
}

/// Normalized event surfaced to the control-surface collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum InboundEvent {
    Message {
        sender: Address,
        message_id: String,
        text: String,
        envelope_id: String,
    },
    GroupMessage {
        sender: Address,
        group_id: String,
        message_id: String,
        text: String,
        envelope_id: String,
    },
    GroupUpdated {
        group_id: String,
        proposer: String,
        #[serde(flatten)]
        outcome: UpdateOutcome,
    },
    Receipt {
        sender: Address,
        receipt: String,
        message_ids: Vec<String>,
    },
    Typing {
        sender: Address,
    },
    SyncApplied {
        record: SyncRecord,
    },
    ResyncRequested {
        source_device: String,
    },
    TrustChanged {
        peer: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeliveryStatus {
    Sent { attempts: u32 },
    Failed { reason: String, retryable: bool },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub address: Address,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

/// One logical send: one entry per recipient device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub message_id: String,
    pub deliveries: Vec<DeliveryReport>,
}

impl SendReport {
    pub fn all_sent(&self) -> bool {
        self.deliveries
            .iter()
            .all(|d| matches!(d.status, DeliveryStatus::Sent { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded retry: total attempts per envelope, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Sealed framing hides the outer sender from the transport.
    pub sealed_sender: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(50),
            sealed_sender: true,
        }
    }
}

/// Summary of one inbound batch; per-envelope failures are logged and
/// counted, they never abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped_duplicates: usize,
}

/// Orchestrates encrypt/send and receive/decrypt over one account's stores.
///
/// Inbound envelopes may be handled from several workers; ratchet access is
/// serialized per (peer, device) by the session store underneath. Outbound
/// sends for the account go through `&self` methods and are serialized by
/// the caller.
pub struct MessagePipeline {
    account: Arc<Account>,
    engine: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
    sync: SyncCoordinator,
    events: crossbeam_channel::Sender<InboundEvent>,
    config: PipelineConfig,
}

impl MessagePipeline {
    pub fn new(
        account: Arc<Account>,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        config: PipelineConfig,
    ) -> (Self, crossbeam_channel::Receiver<InboundEvent>) {
        let (events, receiver) = crossbeam_channel::unbounded();
        let sync = SyncCoordinator::new(account.storage(), account.record_prefix().to_string());
        (
            Self {
                account,
                engine,
                transport,
                directory,
                sync,
                events,
                config,
            },
            receiver,
        )
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    fn our_address(&self) -> Address {
        Address::new(self.account.id(), self.account.device_id())
    }

    fn emit_event(&self, event: InboundEvent) {
        let _ = self.events.send(event);
    }

    // === outbound ===

    /// Send a direct message; every device of the peer gets its own
    /// independently encrypted ciphertext.
    pub fn send_message(&self, peer: &str, text: &str) -> Result<SendReport> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let payload = Payload::Direct {
            message_id: message_id.clone(),
            text: text.to_string(),
        };

        let devices = self.directory.device_ids(peer)?;
        let addresses: Vec<Address> = devices
            .into_iter()
            .map(|device| Address::new(peer, device))
            .collect();
        let deliveries = self.fan_out(&addresses, &payload)?;

        self.propagate_to_siblings(SyncChange::SentMessage {
            peer: peer.to_string(),
            text: text.to_string(),
            timestamp: now_secs(),
        });

        Ok(SendReport {
            message_id,
            deliveries,
        })
    }

    /// Send a message to every active member of a group (client-side
    /// fan-out; each member device gets its own ciphertext).
    pub fn send_group_message(&self, group_id: &str, text: &str) -> Result<SendReport> {
        let group = self
            .account
            .group_store()
            .get_group(group_id)?
            .ok_or_else(|| Error::UnknownGroup(group_id.to_string()))?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let payload = Payload::Group {
            message_id: message_id.clone(),
            group_id: group_id.to_string(),
            text: text.to_string(),
        };

        let mut addresses = Vec::new();
        for peer in group.members.keys().filter(|m| *m != self.account.id()) {
            match self.directory.device_ids(peer) {
                Ok(devices) => {
                    addresses.extend(devices.into_iter().map(|d| Address::new(peer, d)))
                }
                Err(e) => warn!(peer = %peer, error = %e, "skipping unreachable group member"),
            }
        }

        let deliveries = self.fan_out(&addresses, &payload)?;
        Ok(SendReport {
            message_id,
            deliveries,
        })
    }

    /// Apply a group update locally, then distribute it to the members.
    pub fn send_group_update(
        &self,
        group_id: &str,
        revision: u64,
        deltas: Vec<GroupDelta>,
    ) -> Result<(UpdateOutcome, SendReport)> {
        let our_id = self.account.id().to_string();
        let outcome =
            self.account
                .group_store()
                .apply_update(group_id, revision, &our_id, &deltas)?;

        let group = self
            .account
            .group_store()
            .get_group(group_id)?
            .ok_or_else(|| Error::UnknownGroup(group_id.to_string()))?;

        let payload = Payload::GroupUpdate {
            group_id: group_id.to_string(),
            revision,
            deltas,
        };

        let mut addresses = Vec::new();
        for peer in group.members.keys().filter(|m| *m != self.account.id()) {
            match self.directory.device_ids(peer) {
                Ok(devices) => {
                    addresses.extend(devices.into_iter().map(|d| Address::new(peer, d)))
                }
                Err(e) => warn!(peer = %peer, error = %e, "skipping unreachable group member"),
            }
        }

        let deliveries = self.fan_out(&addresses, &payload)?;

        self.propagate_to_siblings(SyncChange::GroupChanged {
            group_id: group_id.to_string(),
            revision,
        });

        Ok((
            outcome,
            SendReport {
                message_id: uuid::Uuid::new_v4().to_string(),
                deliveries,
            },
        ))
    }

    pub fn send_receipt(
        &self,
        peer: &str,
        receipt: &str,
        message_ids: Vec<String>,
    ) -> Result<SendReport> {
        if message_ids.is_empty() {
            return Ok(SendReport {
                message_id: String::new(),
                deliveries: Vec::new(),
            });
        }
        let payload = Payload::Receipt {
            receipt: receipt.to_string(),
            message_ids,
        };
        let devices = self.directory.device_ids(peer)?;
        let addresses: Vec<Address> = devices
            .into_iter()
            .map(|device| Address::new(peer, device))
            .collect();
        let deliveries = self.fan_out(&addresses, &payload)?;
        Ok(SendReport {
            message_id: uuid::Uuid::new_v4().to_string(),
            deliveries,
        })
    }

    /// Record that the conversation with `peer` was read here, so other
    /// linked devices can clear their unread state.
    pub fn mark_read(&self, peer: &str) {
        self.propagate_to_siblings(SyncChange::ReadMarker {
            peer: peer.to_string(),
            timestamp: now_secs(),
        });
    }

    pub fn send_typing(&self, peer: &str) -> Result<SendReport> {
        let devices = self.directory.device_ids(peer)?;
        let addresses: Vec<Address> = devices
            .into_iter()
            .map(|device| Address::new(peer, device))
            .collect();
        let deliveries = self.fan_out(&addresses, &Payload::Typing)?;
        Ok(SendReport {
            message_id: uuid::Uuid::new_v4().to_string(),
            deliveries,
        })
    }

    fn fan_out(&self, addresses: &[Address], payload: &Payload) -> Result<Vec<DeliveryReport>> {
        let plaintext = serde_json::to_vec(payload)?;
        let mut deliveries = Vec::with_capacity(addresses.len());

        for address in addresses {
            let status = match self.deliver_to(address, &plaintext) {
                Ok(attempts) => DeliveryStatus::Sent { attempts },
                Err(e) => {
                    warn!(address = %address, error = %e, "delivery failed");
                    DeliveryStatus::Failed {
                        retryable: matches!(e, Error::RetryableTransport(_)),
                        reason: e.to_string(),
                    }
                }
            };
            deliveries.push(DeliveryReport {
                address: address.clone(),
                status,
            });
        }
        Ok(deliveries)
    }

    fn deliver_to(&self, address: &Address, plaintext: &[u8]) -> Result<u32> {
        self.ensure_session(address)?;
        let frame = self
            .account
            .session_store()
            .encrypt_with(self.engine.as_ref(), address, plaintext)?;

        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            recipient: address.clone(),
            sender: if self.config.sealed_sender {
                None
            } else {
                Some(self.our_address())
            },
            sealed: self.config.sealed_sender,
            frame,
            sent_at: now_secs(),
        };

        self.send_with_retry(&envelope)
    }

    /// Establish a session by fetching the peer's pre-key bundle, consuming
    /// one of their one-time pre-keys. An identity change discovered here is
    /// surfaced as `TrustChanged` and the send fails; it is never accepted
    /// silently.
    fn ensure_session(&self, address: &Address) -> Result<()> {
        if self.account.session_store().contains_session(address)? {
            return Ok(());
        }

        let bundle = self.directory.fetch_pre_key_bundle(address)?;
        let decision = self
            .account
            .save_peer_identity(&address.peer, bundle.identity_key)?;
        if decision == TrustDecision::Changed {
            self.emit_event(InboundEvent::TrustChanged {
                peer: address.peer.clone(),
            });
            return Err(Error::TrustChanged(address.peer.clone()));
        }

        let identity = self.account.identity_store().identity()?;
        let state = self
            .engine
            .establish_initiator(&identity, &self.our_address(), &bundle)?;
        self.account
            .session_store()
            .store_session(&PeerSession::new(address.clone(), state))?;
        debug!(address = %address, "session established as initiator");

        self.propagate_to_siblings(SyncChange::SessionEstablished {
            peer: address.peer.clone(),
            device_id: address.device_id,
        });
        Ok(())
    }

    fn send_with_retry(&self, envelope: &Envelope) -> Result<u32> {
        let mut attempt = 1;
        loop {
            match self.transport.send_ciphertext(envelope) {
                SendOutcome::Ack => return Ok(attempt),
                SendOutcome::Terminal(reason) => {
                    return Err(Error::TerminalTransport(reason));
                }
                SendOutcome::Retryable(reason) => {
                    if attempt >= self.config.max_attempts {
                        return Err(Error::RetryableTransport(format!(
                            "{} ({} attempts)",
                            reason, attempt
                        )));
                    }
                    let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        envelope = %envelope.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "retryable transport failure, backing off"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Best-effort propagation of a local mutation to the account's other
    /// linked devices. Only existing sibling sessions are used; failures are
    /// logged, never surfaced to the triggering operation.
    fn propagate_to_siblings(&self, change: SyncChange) {
        let devices = match self.account.linked_devices() {
            Ok(devices) if !devices.is_empty() => devices,
            _ => return,
        };

        let record = match self.sync.emit(self.account.device_id(), change) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "failed to stamp sync record");
                return;
            }
        };
        let payload = Payload::Sync { record };
        let plaintext = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode sync record");
                return;
            }
        };

        for device in devices {
            let address = Address::new(self.account.id(), device.device_id);
            if let Err(e) = self.deliver_to(&address, &plaintext) {
                warn!(address = %address, error = %e, "sync propagation failed");
            } else {
                let _ = self.account.mark_device_synced(device.device_id);
            }
        }
    }

    // === inbound ===

    fn processed_key(&self, envelope_id: &str) -> String {
        format!("{}processed/{}", self.account.record_prefix(), envelope_id)
    }

    /// Handle one inbound envelope: decrypt, classify, dispatch, surface.
    pub fn receive(&self, envelope: &Envelope) -> Result<()> {
        let storage = self.account.storage();
        if storage.get(&self.processed_key(&envelope.id))?.is_some() {
            debug!(envelope = %envelope.id, "duplicate envelope ignored");
            return Ok(());
        }

        let (sender, plaintext) = self.decrypt_envelope(envelope)?;

        let payload: Payload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::InvalidEnvelope(format!("payload: {}", e)))?;

        storage.put(&self.processed_key(&envelope.id), now_secs().to_string())?;

        self.dispatch(sender, payload, &envelope.id);
        Ok(())
    }

    /// Process a batch; one bad envelope never stops the rest.
    pub fn receive_batch(
        &self,
        envelopes: &[Envelope],
        max_messages: Option<usize>,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for envelope in envelopes {
            if let Some(max) = max_messages {
                if summary.processed >= max {
                    break;
                }
            }
            match self.receive(envelope) {
                Ok(()) => summary.processed += 1,
                Err(Error::Replay(counter)) => {
                    debug!(envelope = %envelope.id, counter, "replayed envelope skipped");
                    summary.skipped_duplicates += 1;
                }
                Err(e) => {
                    warn!(envelope = %envelope.id, error = %e, "failed to process envelope");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn decrypt_envelope(&self, envelope: &Envelope) -> Result<(Address, Vec<u8>)> {
        // Establishment rides the first frames of a new session.
        if let Some(init) = &envelope.frame.header.session_init {
            let sender = init.initiator.clone();
            let freshly_established = if self.account.session_store().contains_session(&sender)? {
                false
            } else {
                self.establish_as_responder(envelope)?;
                true
            };
            return match self.account.session_store().decrypt_with(
                self.engine.as_ref(),
                &sender,
                &envelope.frame,
            ) {
                Ok(plaintext) => Ok((sender, plaintext)),
                // The peer re-established over an existing session; accept
                // the new establishment and keep the old state in history.
                Err(Error::Decryption(_)) if !freshly_established => {
                    self.establish_as_responder(envelope)?;
                    let plaintext = self.account.session_store().decrypt_with(
                        self.engine.as_ref(),
                        &sender,
                        &envelope.frame,
                    )?;
                    Ok((sender, plaintext))
                }
                Err(e) => Err(e),
            };
        }

        if !envelope.sealed {
            let sender = envelope
                .sender
                .clone()
                .ok_or_else(|| Error::InvalidEnvelope("unsealed envelope without sender".to_string()))?;
            let plaintext = self.account.session_store().decrypt_with(
                self.engine.as_ref(),
                &sender,
                &envelope.frame,
            )?;
            return Ok((sender, plaintext));
        }

        // Sealed without establishment data: the addressed session is
        // whichever one decrypts the frame.
        for address in self.account.session_store().list_sessions()? {
            match self.account.session_store().decrypt_with(
                self.engine.as_ref(),
                &address,
                &envelope.frame,
            ) {
                Ok(plaintext) => return Ok((address, plaintext)),
                Err(Error::Replay(counter)) => return Err(Error::Replay(counter)),
                Err(_) => continue,
            }
        }
        Err(Error::Decryption(
            "no session decrypted the sealed envelope".to_string(),
        ))
    }

    fn establish_as_responder(&self, envelope: &Envelope) -> Result<()> {
        let init = envelope
            .frame
            .header
            .session_init
            .as_ref()
            .ok_or_else(|| Error::InvalidEnvelope("missing session init".to_string()))?;

        let decision = self
            .account
            .save_peer_identity(&init.initiator.peer, init.initiator_identity)?;
        if decision == TrustDecision::Changed {
            self.emit_event(InboundEvent::TrustChanged {
                peer: init.initiator.peer.clone(),
            });
        }

        let identity = self.account.identity_store().identity()?;
        let signed = self
            .account
            .identity_store()
            .signed_pre_key_by_id(init.signed_pre_key_id)?
            .ok_or_else(|| {
                Error::Decryption(format!("unknown signed pre-key {}", init.signed_pre_key_id))
            })?;

        let one_time = match init.pre_key_id {
            Some(id) => Some(
                self.account
                    .identity_store()
                    .take_pre_key(id)?
                    .ok_or_else(|| {
                        Error::Decryption(format!("one-time pre-key {} already consumed", id))
                    })?,
            ),
            None => None,
        };

        let state = self.engine.establish_responder(
            &identity,
            signed.public,
            one_time.as_ref().map(|k| k.public),
            init,
        )?;
        let session = match self.account.session_store().load_session(&init.initiator)? {
            Some(mut existing) => {
                existing.archive_current(state);
                existing
            }
            None => PeerSession::new(init.initiator.clone(), state),
        };
        self.account.session_store().store_session(&session)?;
        info!(address = %init.initiator, "session established as responder");

        // Keep the one-time pool healthy after consuming a key.
        let replenished = self
            .account
            .identity_store()
            .replenish_pre_keys(crate::types::MIN_PRE_KEYS / 2, crate::types::MIN_PRE_KEYS)?;
        if !replenished.is_empty() {
            info!(count = replenished.len(), "replenished one-time pre-keys");
        }

        Ok(())
    }

    fn dispatch(&self, sender: Address, payload: Payload, envelope_id: &str) {
        match payload {
            Payload::Direct { message_id, text } => {
                self.emit_event(InboundEvent::Message {
                    sender,
                    message_id,
                    text,
                    envelope_id: envelope_id.to_string(),
                });
            }
            Payload::Group {
                message_id,
                group_id,
                text,
            } => {
                self.emit_event(InboundEvent::GroupMessage {
                    sender,
                    group_id,
                    message_id,
                    text,
                    envelope_id: envelope_id.to_string(),
                });
            }
            Payload::GroupUpdate {
                group_id,
                revision,
                deltas,
            } => {
                // The proposer is the authenticated sender, not a payload field.
                match self.account.group_store().apply_update(
                    &group_id,
                    revision,
                    &sender.peer,
                    &deltas,
                ) {
                    Ok(outcome) => {
                        if outcome != UpdateOutcome::Applied {
                            info!(group = %group_id, revision, ?outcome, "group update reconciled");
                        }
                        self.emit_event(InboundEvent::GroupUpdated {
                            group_id,
                            proposer: sender.peer,
                            outcome,
                        });
                    }
                    Err(e) => {
                        warn!(group = %group_id, revision, error = %e, "group update rejected");
                    }
                }
            }
            Payload::Receipt {
                receipt,
                message_ids,
            } => {
                self.emit_event(InboundEvent::Receipt {
                    sender,
                    receipt,
                    message_ids,
                });
            }
            Payload::Typing => {
                self.emit_event(InboundEvent::Typing { sender });
            }
            Payload::Sync { record } => {
                if sender.peer != self.account.id() {
                    warn!(sender = %sender, "sync record from foreign sender dropped");
                    return;
                }
                match self.sync.accept(record) {
                    Ok(ready) => {
                        for record in ready {
                            self.emit_event(InboundEvent::SyncApplied { record });
                        }
                    }
                    Err(Error::SyncGap { device, .. }) => {
                        self.emit_event(InboundEvent::ResyncRequested {
                            source_device: device,
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "sync record rejected");
                    }
                }
            }
        }
    }
}
