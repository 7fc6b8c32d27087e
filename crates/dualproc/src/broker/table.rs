//! Bookkeeping of outstanding and completed calls.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::envelope::{CallKey, ResultEnvelope};

/// Where a key stands from a waiter's point of view.
#[derive(Debug)]
pub(crate) enum KeyState {
    /// Submitted, result not yet received.
    Outstanding,
    /// Result received; it has now been claimed by the caller.
    Claimed(ResultEnvelope),
    /// Never submitted, or already claimed.
    Absent,
}

/// Outstanding keys and completed-but-unclaimed results.
///
/// A key is in at most one of the two collections, and a claimed key is in
/// neither. Pings carry no key; the worker answers them in order, so the
/// n-th pong answers the n-th ping.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    outstanding: FxHashSet<CallKey>,
    completed: FxHashMap<CallKey, ResultEnvelope>,
    pings_sent: u64,
    pongs_received: u64,
}

impl PendingTable {
    /// Record a submitted key. Returns false if the key is already known.
    pub(crate) fn submit(&mut self, key: CallKey) -> bool {
        if self.completed.contains_key(&key) {
            return false;
        }
        self.outstanding.insert(key)
    }

    /// Forget a key whose call never reached the channel.
    pub(crate) fn retract(&mut self, key: &CallKey) {
        self.outstanding.remove(key);
    }

    /// Move an arrived result from outstanding to completed.
    ///
    /// Results for keys that are not outstanding are handed back.
    pub(crate) fn complete(&mut self, result: ResultEnvelope) -> Result<(), ResultEnvelope> {
        if !self.outstanding.remove(&result.key) {
            return Err(result);
        }
        self.completed.insert(result.key, result);
        Ok(())
    }

    /// Check `key`, claiming its result if it has arrived.
    pub(crate) fn claim(&mut self, key: &CallKey) -> KeyState {
        if self.outstanding.contains(key) {
            return KeyState::Outstanding;
        }
        match self.completed.remove(key) {
            Some(result) => KeyState::Claimed(result),
            None => KeyState::Absent,
        }
    }

    /// Count a ping about to be queued and return its sequence number.
    pub(crate) fn record_ping(&mut self) -> u64 {
        self.pings_sent += 1;
        self.pings_sent
    }

    pub(crate) fn record_pong(&mut self) {
        if self.pongs_received < self.pings_sent {
            self.pongs_received += 1;
        }
    }

    /// Whether the ping with sequence number `seq` has been answered.
    pub(crate) fn is_answered(&self, seq: u64) -> bool {
        self.pongs_received >= seq
    }

    pub(crate) fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub(crate) fn completed_len(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_lifecycle() {
        let mut table = PendingTable::default();
        let key = CallKey::new();

        assert!(matches!(table.claim(&key), KeyState::Absent));

        assert!(table.submit(key));
        assert!(matches!(table.claim(&key), KeyState::Outstanding));
        assert_eq!(table.outstanding_len(), 1);
        assert_eq!(table.completed_len(), 0);

        table
            .complete(ResultEnvelope::success(key, json!("done")))
            .unwrap();
        assert_eq!(table.outstanding_len(), 0);
        assert_eq!(table.completed_len(), 1);

        match table.claim(&key) {
            KeyState::Claimed(result) => assert_eq!(result.value(), Some(&json!("done"))),
            other => panic!("expected claimed result, got {:?}", other),
        }
        assert_eq!(table.completed_len(), 0);

        // A second claim finds nothing.
        assert!(matches!(table.claim(&key), KeyState::Absent));
    }

    #[test]
    fn test_unexpected_result_is_rejected() {
        let mut table = PendingTable::default();
        let stray = ResultEnvelope::success(CallKey::new(), json!(null));

        assert!(table.complete(stray).is_err());
        assert_eq!(table.completed_len(), 0);
    }

    #[test]
    fn test_duplicate_result_is_rejected() {
        let mut table = PendingTable::default();
        let key = CallKey::new();
        table.submit(key);

        table.complete(ResultEnvelope::success(key, json!(1))).unwrap();
        assert!(table.complete(ResultEnvelope::success(key, json!(2))).is_err());

        match table.claim(&key) {
            KeyState::Claimed(result) => assert_eq!(result.value(), Some(&json!(1))),
            other => panic!("expected first result, got {:?}", other),
        }
    }

    #[test]
    fn test_resubmitting_known_key_is_refused() {
        let mut table = PendingTable::default();
        let key = CallKey::new();

        assert!(table.submit(key));
        assert!(!table.submit(key));

        table.complete(ResultEnvelope::success(key, json!(0))).unwrap();
        assert!(!table.submit(key));
    }

    #[test]
    fn test_pongs_answer_pings_in_order() {
        let mut table = PendingTable::default();

        // A stray pong before any ping is not counted.
        table.record_pong();

        let first = table.record_ping();
        let second = table.record_ping();
        assert!(!table.is_answered(first));

        table.record_pong();
        assert!(table.is_answered(first));
        assert!(!table.is_answered(second));

        table.record_pong();
        assert!(table.is_answered(second));
    }

    #[test]
    fn test_retract() {
        let mut table = PendingTable::default();
        let key = CallKey::new();
        table.submit(key);
        table.retract(&key);

        assert_eq!(table.outstanding_len(), 0);
        assert!(matches!(table.claim(&key), KeyState::Absent));
    }
}
