use crate::types::SYNC_REORDER_LIMIT;
use crate::{Error, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A local state mutation propagated to the account's other devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum SyncChange {
    SentMessage {
        peer: String,
        text: String,
        timestamp: u64,
    },
    GroupChanged {
        group_id: String,
        revision: u64,
    },
    ContactChange {
        peer: String,
    },
    SessionEstablished {
        peer: String,
        device_id: u32,
    },
    ReadMarker {
        peer: String,
        timestamp: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub seq: u64,
    pub source_device: u32,
    #[serde(flatten)]
    pub change: SyncChange,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundCursor {
    next: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    buffered: BTreeMap<u64, SyncRecord>,
}

/// Orders sync records between the devices of one account.
///
/// Outbound records carry a monotonic per-device sequence number. Inbound
/// records apply strictly in sequence; early arrivals are buffered up to
/// `SYNC_REORDER_LIMIT`, beyond which the gap is surfaced and a full resync
/// must be requested.
pub struct SyncCoordinator {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
    // serializes seq assignment and cursor advancement
    guard: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            guard: Mutex::new(()),
        }
    }

    fn out_seq_key(&self) -> String {
        format!("{}sync/out-seq", self.prefix)
    }

    fn cursor_key(&self, source_device: u32) -> String {
        format!("{}sync/in/{:010}", self.prefix, source_device)
    }

    /// Stamp a change with the next outbound sequence number.
    pub fn emit(&self, source_device: u32, change: SyncChange) -> Result<SyncRecord> {
        let _guard = self.guard.lock().unwrap();

        let seq = match self.storage.get(&self.out_seq_key())? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| Error::StoreCorruption(format!("sync sequence: {}", e)))?,
            None => 0,
        } + 1;
        self.storage.put(&self.out_seq_key(), seq.to_string())?;

        Ok(SyncRecord {
            seq,
            source_device,
            change,
        })
    }

    fn load_cursor(&self, source_device: u32) -> Result<InboundCursor> {
        match self.storage.get(&self.cursor_key(source_device))? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::StoreCorruption(format!("sync cursor: {}", e))),
            None => Ok(InboundCursor {
                next: 1,
                buffered: BTreeMap::new(),
            }),
        }
    }

    fn store_cursor(&self, source_device: u32, cursor: &InboundCursor) -> Result<()> {
        self.storage.put(
            &self.cursor_key(source_device),
            serde_json::to_string(cursor)?,
        )
    }

    /// Accept one inbound record; returns the records now ready to apply,
    /// in sequence order. Duplicates yield an empty list. A gap past the
    /// buffer bound drops the buffered run and reports `SyncGap`; the caller
    /// requests a full resync.
    pub fn accept(&self, record: SyncRecord) -> Result<Vec<SyncRecord>> {
        let _guard = self.guard.lock().unwrap();

        let source_device = record.source_device;
        let mut cursor = self.load_cursor(source_device)?;

        if record.seq < cursor.next {
            debug!(
                device = source_device,
                seq = record.seq,
                "duplicate sync record ignored"
            );
            return Ok(Vec::new());
        }

        if record.seq > cursor.next {
            if cursor.buffered.len() >= SYNC_REORDER_LIMIT {
                let expected = cursor.next;
                warn!(
                    device = source_device,
                    expected, "sync reorder buffer overflow; requesting full resync"
                );
                cursor.buffered.clear();
                self.store_cursor(source_device, &cursor)?;
                return Err(Error::SyncGap {
                    device: source_device.to_string(),
                    expected,
                });
            }
            cursor.buffered.insert(record.seq, record);
            self.store_cursor(source_device, &cursor)?;
            return Ok(Vec::new());
        }

        let mut ready = vec![record];
        cursor.next += 1;
        while let Some(buffered) = cursor.buffered.remove(&cursor.next) {
            ready.push(buffered);
            cursor.next += 1;
        }
        self.store_cursor(source_device, &cursor)?;
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new(Arc::new(InMemoryStorage::new()), "acct/a/1/")
    }

    fn read_marker(seq: u64) -> SyncRecord {
        SyncRecord {
            seq,
            source_device: 2,
            change: SyncChange::ReadMarker {
                peer: "bob".to_string(),
                timestamp: seq,
            },
        }
    }

    #[test]
    fn emit_assigns_monotonic_sequence() {
        let sync = coordinator();
        let first = sync
            .emit(1, SyncChange::ContactChange { peer: "bob".to_string() })
            .unwrap();
        let second = sync
            .emit(1, SyncChange::ContactChange { peer: "carol".to_string() })
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn in_order_records_apply_immediately() {
        let sync = coordinator();
        assert_eq!(sync.accept(read_marker(1)).unwrap().len(), 1);
        assert_eq!(sync.accept(read_marker(2)).unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_records_are_reordered() {
        let sync = coordinator();
        assert!(sync.accept(read_marker(3)).unwrap().is_empty());
        assert!(sync.accept(read_marker(2)).unwrap().is_empty());

        let ready = sync.accept(read_marker(1)).unwrap();
        let seqs: Vec<u64> = ready.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let sync = coordinator();
        sync.accept(read_marker(1)).unwrap();
        assert!(sync.accept(read_marker(1)).unwrap().is_empty());
    }

    #[test]
    fn buffer_overflow_reports_gap() {
        let sync = coordinator();
        // seq 1 never arrives; fill the buffer
        for seq in 2..(2 + SYNC_REORDER_LIMIT as u64) {
            assert!(sync.accept(read_marker(seq)).unwrap().is_empty());
        }
        let overflow = sync.accept(read_marker(500));
        assert!(matches!(overflow, Err(Error::SyncGap { .. })));
    }

    #[test]
    fn cursor_survives_reload() {
        let storage: Arc<InMemoryStorage> = Arc::new(InMemoryStorage::new());
        {
            let sync = SyncCoordinator::new(storage.clone(), "acct/a/1/");
            sync.accept(read_marker(1)).unwrap();
        }
        let sync = SyncCoordinator::new(storage, "acct/a/1/");
        assert!(sync.accept(read_marker(1)).unwrap().is_empty());
        assert_eq!(sync.accept(read_marker(2)).unwrap().len(), 1);
    }
}
