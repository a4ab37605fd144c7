use herald_core::{
    Address, Envelope, Error, PeerDirectory, PreKeyBundle, Result, SendOutcome, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// File-spool transport: outbound envelopes land in `outbox/` as JSON, one
/// file each, for an external bridge to carry to the service. Inbound
/// envelopes are dropped into `inbox/` by the same bridge and consumed by
/// the `receive` command.
pub struct SpoolTransport {
    outbox: PathBuf,
    counter: Mutex<u64>,
}

impl SpoolTransport {
    pub fn new(data_dir: &std::path::Path) -> anyhow::Result<Self> {
        let outbox = data_dir.join("outbox");
        std::fs::create_dir_all(&outbox)?;
        Ok(Self {
            outbox,
            counter: Mutex::new(0),
        })
    }
}

impl Transport for SpoolTransport {
    fn send_ciphertext(&self, envelope: &Envelope) -> SendOutcome {
        let seq = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            *counter
        };
        let name = format!("{:016}-{:04}-{}.json", envelope.sent_at, seq, envelope.id);
        let body = match serde_json::to_string_pretty(envelope) {
            Ok(body) => body,
            Err(e) => return SendOutcome::Terminal(format!("encode failed: {}", e)),
        };
        match std::fs::write(self.outbox.join(name), body) {
            Ok(()) => SendOutcome::Ack,
            Err(e) => SendOutcome::Retryable(format!("outbox write failed: {}", e)),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactRecord {
    #[serde(default)]
    devices: BTreeMap<u32, Vec<PreKeyBundle>>,
}

/// Peer directory backed by contact files: device lists and pre-key bundles
/// imported out of band (`contact add-bundle`). Fetching a bundle consumes
/// it, mirroring the service handing each one out exactly once.
pub struct ContactDirectory {
    dir: PathBuf,
}

impl ContactDirectory {
    pub fn new(data_dir: &std::path::Path) -> anyhow::Result<Self> {
        let dir = data_dir.join("contacts");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, peer: &str) -> PathBuf {
        let sanitized = peer.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("{}.json", sanitized))
    }

    fn load(&self, peer: &str) -> Result<Option<ContactRecord>> {
        match std::fs::read_to_string(self.path_for(peer)) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StoreCorruption(format!("contact {}: {}", peer, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("contact read failed: {}", e))),
        }
    }

    fn store(&self, peer: &str, record: &ContactRecord) -> Result<()> {
        let raw = serde_json::to_string_pretty(record)?;
        std::fs::write(self.path_for(peer), raw)
            .map_err(|e| Error::Storage(format!("contact write failed: {}", e)))
    }

    pub fn add_bundle(&self, peer: &str, device_id: u32, bundle: PreKeyBundle) -> Result<()> {
        let mut record = self.load(peer)?.unwrap_or_default();
        record.devices.entry(device_id).or_default().push(bundle);
        self.store(peer, &record)
    }

    pub fn list_contacts(&self) -> Result<Vec<(String, Vec<u32>)>> {
        let mut contacts = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::Storage(format!("contacts dir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(format!("contacts dir: {}", e)))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(peer) = name.strip_suffix(".json") else {
                continue;
            };
            let record = self.load(peer)?.unwrap_or_default();
            contacts.push((peer.to_string(), record.devices.keys().copied().collect()));
        }
        contacts.sort();
        Ok(contacts)
    }
}

impl PeerDirectory for ContactDirectory {
    fn device_ids(&self, peer: &str) -> Result<Vec<u32>> {
        let record = self
            .load(peer)?
            .ok_or_else(|| Error::TerminalTransport(format!("unknown recipient {}", peer)))?;
        Ok(record.devices.keys().copied().collect())
    }

    fn fetch_pre_key_bundle(&self, address: &Address) -> Result<PreKeyBundle> {
        let mut record = self
            .load(&address.peer)?
            .ok_or_else(|| Error::TerminalTransport(format!("unknown recipient {}", address)))?;
        let bundles = record
            .devices
            .get_mut(&address.device_id)
            .ok_or_else(|| Error::TerminalTransport(format!("unknown device {}", address)))?;
        if bundles.is_empty() {
            return Err(Error::ExhaustedPreKeys);
        }
        let bundle = bundles.remove(0);
        self.store(&address.peer, &record)?;
        Ok(bundle)
    }
}
