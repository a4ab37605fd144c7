use crate::group::{GroupDelta, GroupState};
use crate::{Error, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Bound on delta batches parked while waiting for a revision gap to fill.
const MAX_PENDING_UPDATES: usize = 32;

/// Result of offering a group update to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum UpdateOutcome {
    Applied,
    /// The proposed revision is not newer than the stored one; discarded.
    Stale,
    /// Two updates carried the same revision; `winner` names the proposer
    /// the deterministic tie-break selected.
    Conflict { winner: String },
    /// The revision leaves a gap; the batch is parked until the gap fills.
    Deferred,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingUpdate {
    proposer: String,
    deltas: Vec<GroupDelta>,
}

/// Durable record: current state, the state the newest revision was applied
/// onto (for same-revision conflict re-resolution), and parked batches.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredGroup {
    state: GroupState,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<GroupState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pending: BTreeMap<u64, PendingUpdate>,
}

/// Group state with revision reconciliation.
///
/// Revisions apply in order. The immediately-next revision applies at once;
/// a revision past a gap is parked and drained when the gap fills, so any
/// arrival order converges to the revision-order state. Revisions at or
/// below the stored one are discarded as duplicates of at-least-once
/// delivery, except equal revisions, which resolve by the stable tie-break:
/// the lexicographically smallest proposer id wins, independent of arrival
/// order. All deltas of one revision persist as a single record write.
pub struct GroupStateStore {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GroupStateStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn group_key(&self, id: &str) -> String {
        format!("{}group/{}", self.prefix, id)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, id: &str) -> Result<Option<StoredGroup>> {
        match self.storage.get(&self.group_key(id))? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StoreCorruption(format!("group {}: {}", id, e))),
            None => Ok(None),
        }
    }

    fn persist(&self, record: &StoredGroup) -> Result<()> {
        self.storage.put(
            &self.group_key(&record.state.id),
            serde_json::to_string(record)?,
        )
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupState>> {
        Ok(self.load(id)?.map(|r| r.state))
    }

    /// Stable listing, ordered by group id.
    pub fn list_groups(&self) -> Result<Vec<GroupState>> {
        let prefix = format!("{}group/", self.prefix);
        let mut groups = Vec::new();
        for key in self.storage.list(&prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let record: StoredGroup = serde_json::from_str(&raw)
                .map_err(|e| Error::StoreCorruption(format!("group {}: {}", key, e)))?;
            groups.push(record.state);
        }
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    pub fn delete_group(&self, id: &str) -> Result<()> {
        self.storage.del(&self.group_key(id))
    }

    /// Offer one revision's delta batch.
    ///
    /// An unknown group id bootstraps from genesis (the proposer of revision
    /// 1 becomes the founding admin), so creation is revision 1 like any
    /// other update.
    pub fn apply_update(
        &self,
        id: &str,
        proposed_revision: u64,
        proposer: &str,
        deltas: &[GroupDelta],
    ) -> Result<UpdateOutcome> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();

        let mut record = match self.load(id)? {
            Some(record) => record,
            None => StoredGroup {
                state: GroupState::genesis(id, proposer),
                base: None,
                pending: BTreeMap::new(),
            },
        };

        let stored_revision = record.state.revision;

        if proposed_revision < stored_revision
            || (proposed_revision == stored_revision && stored_revision == 0)
        {
            debug!(
                group = id,
                proposed_revision, stored_revision, "discarding stale group update"
            );
            return Ok(UpdateOutcome::Stale);
        }

        if proposed_revision == stored_revision {
            return self.resolve_conflict(record, proposed_revision, proposer, deltas);
        }

        if proposed_revision > stored_revision + 1 {
            return self.defer(record, proposed_revision, proposer, deltas);
        }

        // The immediately-next revision: apply, then drain anything parked.
        // Revision 1 always applies onto a genesis seeded with its own
        // proposer, even when a later revision was parked first.
        if stored_revision == 0 {
            record.state = GroupState::genesis(id, proposer);
        }
        let base = record.state.clone();
        let next = Self::apply_batch(&record.state, proposed_revision, proposer, deltas)?;
        record.base = Some(base);
        record.state = next;
        Self::drain_pending(&mut record);
        self.persist(&record)?;
        Ok(UpdateOutcome::Applied)
    }

    fn resolve_conflict(
        &self,
        mut record: StoredGroup,
        revision: u64,
        proposer: &str,
        deltas: &[GroupDelta],
    ) -> Result<UpdateOutcome> {
        let stored_proposer = record.state.last_proposer.clone();
        let group_id = record.state.id.clone();

        if proposer >= stored_proposer.as_str() {
            warn!(
                group = %group_id,
                revision,
                loser = proposer,
                winner = %stored_proposer,
                "conflicting group update lost tie-break"
            );
            return Ok(UpdateOutcome::Conflict {
                winner: stored_proposer,
            });
        }

        let Some(base) = record.base.clone() else {
            // No pre-revision state survives; the stored update keeps
            // winning so the outcome stays deterministic.
            return Ok(UpdateOutcome::Conflict {
                winner: stored_proposer,
            });
        };

        let next = Self::apply_batch(&base, revision, proposer, deltas)?;
        warn!(
            group = %group_id,
            revision,
            winner = proposer,
            loser = %stored_proposer,
            "conflicting group update won tie-break; replacing revision"
        );
        record.state = next;
        Self::drain_pending(&mut record);
        self.persist(&record)?;
        Ok(UpdateOutcome::Conflict {
            winner: proposer.to_string(),
        })
    }

    fn defer(
        &self,
        mut record: StoredGroup,
        revision: u64,
        proposer: &str,
        deltas: &[GroupDelta],
    ) -> Result<UpdateOutcome> {
        if let Some(parked) = record.pending.get(&revision) {
            // Same-revision race among parked updates: smaller proposer id
            // wins here too.
            if proposer >= parked.proposer.as_str() {
                return Ok(UpdateOutcome::Conflict {
                    winner: parked.proposer.clone(),
                });
            }
        }

        if record.pending.len() >= MAX_PENDING_UPDATES
            && !record.pending.contains_key(&revision)
        {
            warn!(
                group = %record.state.id,
                revision,
                "pending group updates over limit; discarding"
            );
            return Ok(UpdateOutcome::Stale);
        }

        let had_conflict = record.pending.contains_key(&revision);
        record.pending.insert(
            revision,
            PendingUpdate {
                proposer: proposer.to_string(),
                deltas: deltas.to_vec(),
            },
        );
        debug!(group = %record.state.id, revision, "parking group update past a revision gap");
        self.persist(&record)?;
        if had_conflict {
            return Ok(UpdateOutcome::Conflict {
                winner: proposer.to_string(),
            });
        }
        Ok(UpdateOutcome::Deferred)
    }

    /// Apply parked batches that became contiguous. A parked batch that no
    /// longer validates is an absorbed protocol anomaly: logged, discarded.
    fn drain_pending(record: &mut StoredGroup) {
        loop {
            let next_revision = record.state.revision + 1;
            let Some(parked) = record.pending.remove(&next_revision) else {
                break;
            };
            match Self::apply_batch(&record.state, next_revision, &parked.proposer, &parked.deltas)
            {
                Ok(next) => {
                    record.base = Some(record.state.clone());
                    record.state = next;
                }
                Err(e) => {
                    warn!(
                        group = %record.state.id,
                        revision = next_revision,
                        error = %e,
                        "discarding parked group update that no longer applies"
                    );
                }
            }
        }
        // Anything parked at or below the applied revision is now stale.
        let applied = record.state.revision;
        record.pending.retain(|rev, _| *rev > applied);
    }

    /// Apply all deltas of one revision onto a clone. Any failing delta
    /// rejects the whole batch; the stored state is untouched.
    fn apply_batch(
        current: &GroupState,
        revision: u64,
        proposer: &str,
        deltas: &[GroupDelta],
    ) -> Result<GroupState> {
        if !current.is_admin(proposer) {
            return Err(Error::InvalidFlow(format!(
                "proposer {} is not a group admin",
                proposer
            )));
        }

        let mut next = current.clone();
        for delta in deltas {
            next.apply_delta(delta)?;
        }
        next.revision = revision;
        next.last_proposer = proposer.to_string();
        Ok(next)
    }
}
