use crate::crypto::RatchetState;
use crate::types::{now_secs, Address, MAX_PREVIOUS_SESSIONS};
use serde::{Deserialize, Serialize};

/// Ratchet session with one peer device.
///
/// Holds the current state plus a bounded history of previous states so
/// messages encrypted against an older state still decrypt after the peer
/// re-established. A state that decrypts is promoted back to current.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSession {
    pub address: Address,
    pub current: RatchetState,
    #[serde(default)]
    pub previous: Vec<RatchetState>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<u64>,
}

impl PeerSession {
    pub fn new(address: Address, state: RatchetState) -> Self {
        let now = now_secs();
        Self {
            address,
            current: state,
            previous: Vec::new(),
            created_at: now,
            last_activity: Some(now),
        }
    }

    /// Replace the current state, keeping the old one in bounded history.
    pub fn archive_current(&mut self, state: RatchetState) {
        let old = std::mem::replace(&mut self.current, state);
        self.previous.insert(0, old);
        self.previous.truncate(MAX_PREVIOUS_SESSIONS);
        self.last_activity = Some(now_secs());
    }

    /// Promote a previous state to current after it decrypted a message.
    pub fn promote(&mut self, index: usize) {
        if index >= self.previous.len() {
            return;
        }
        let state = self.previous.remove(index);
        let old = std::mem::replace(&mut self.current, state);
        self.previous.insert(0, old);
        self.previous.truncate(MAX_PREVIOUS_SESSIONS);
        self.last_activity = Some(now_secs());
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(now_secs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RatchetState;
    use std::collections::HashMap;

    fn state(marker: u8) -> RatchetState {
        RatchetState {
            root_key: [marker; 32],
            sending_chain_key: [marker; 32],
            receiving_chain_key: [marker; 32],
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped_keys: HashMap::new(),
            pending_init: None,
        }
    }

    #[test]
    fn archive_bounds_history() {
        let mut session = PeerSession::new(Address::new("bob", 1), state(0));
        for i in 1..=(MAX_PREVIOUS_SESSIONS as u8 + 3) {
            session.archive_current(state(i));
        }
        assert_eq!(session.previous.len(), MAX_PREVIOUS_SESSIONS);
        // newest archived state sits at the front
        assert_eq!(
            session.previous[0].root_key,
            [MAX_PREVIOUS_SESSIONS as u8 + 2; 32]
        );
    }

    #[test]
    fn promote_swaps_current_and_previous() {
        let mut session = PeerSession::new(Address::new("bob", 1), state(1));
        session.archive_current(state(2));
        assert_eq!(session.current.root_key, [2; 32]);

        session.promote(0);
        assert_eq!(session.current.root_key, [1; 32]);
        assert_eq!(session.previous[0].root_key, [2; 32]);
    }

    #[test]
    fn promote_out_of_range_is_a_no_op() {
        let mut session = PeerSession::new(Address::new("bob", 1), state(1));
        session.promote(5);
        assert_eq!(session.current.root_key, [1; 32]);
    }
}
