//! Bounded announce table with change notification
//!
//! Ingestion upserts one record per relay id and prunes the table to a
//! configured capacity by recency. Observers watch a version counter; the
//! granularity is deliberately coarse (any row change bumps it), which is
//! why consumers sit behind the debouncer.

use super::types::{validate_relay_id, CandidateRelay};
use crate::store::StorageBackend;
use crate::RelayControlError;
use std::sync::Arc;
use tokio::sync::watch;

const ANNOUNCE_PREFIX: &[u8] = b"announce/";

/// Durable, observable table of relay candidates.
pub struct AnnounceStore {
    backend: Arc<dyn StorageBackend>,
    version: watch::Sender<u64>,
    capacity: usize,
}

impl AnnounceStore {
    /// Create a store holding at most `capacity` candidates by recency.
    pub fn new(backend: Arc<dyn StorageBackend>, capacity: usize) -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            backend,
            version,
            capacity,
        }
    }

    fn key(relay_id: &str) -> Vec<u8> {
        let mut key = ANNOUNCE_PREFIX.to_vec();
        key.extend_from_slice(relay_id.as_bytes());
        key
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Upsert a candidate from an announce, pruning past capacity.
    pub fn record_announce(&self, relay: CandidateRelay) -> Result<(), RelayControlError> {
        validate_relay_id(&relay.relay_id)?;

        // Keep the favorite flag sticky across re-announces
        let mut relay = relay;
        if let Some(existing) = self.get(&relay.relay_id)? {
            relay.favorite = relay.favorite || existing.favorite;
        }

        let value =
            serde_json::to_vec(&relay).map_err(|e| RelayControlError::Storage(e.to_string()))?;
        self.backend
            .put(&Self::key(&relay.relay_id), &value)
            .map_err(RelayControlError::Storage)?;

        self.prune()?;
        self.bump_version();
        tracing::trace!(relay = %relay.relay_id, hops = relay.hops, "announce recorded");
        Ok(())
    }

    /// Flag or unflag a candidate as a user favorite.
    ///
    /// Returns `false` if the relay is not currently in the table.
    pub fn set_favorite(&self, relay_id: &str, favorite: bool) -> Result<bool, RelayControlError> {
        validate_relay_id(relay_id)?;
        let Some(mut relay) = self.get(relay_id)? else {
            return Ok(false);
        };
        relay.favorite = favorite;
        let value =
            serde_json::to_vec(&relay).map_err(|e| RelayControlError::Storage(e.to_string()))?;
        self.backend
            .put(&Self::key(relay_id), &value)
            .map_err(RelayControlError::Storage)?;
        self.bump_version();
        Ok(true)
    }

    /// Remove a candidate (e.g. after its path expired).
    pub fn remove(&self, relay_id: &str) -> Result<(), RelayControlError> {
        self.backend
            .remove(&Self::key(relay_id))
            .map_err(RelayControlError::Storage)?;
        self.bump_version();
        Ok(())
    }

    fn get(&self, relay_id: &str) -> Result<Option<CandidateRelay>, RelayControlError> {
        let raw = self
            .backend
            .get(&Self::key(relay_id))
            .map_err(RelayControlError::QueryFailed)?;
        Ok(raw.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// Immutable snapshot, deduplicated by id, most recently seen first.
    pub fn snapshot(&self) -> Result<Vec<CandidateRelay>, RelayControlError> {
        let rows = self
            .backend
            .scan_prefix(ANNOUNCE_PREFIX)
            .map_err(RelayControlError::QueryFailed)?;

        let mut relays: Vec<CandidateRelay> = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            match serde_json::from_slice::<CandidateRelay>(&value) {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), error = %e,
                        "skipping unreadable announce record");
                }
            }
        }
        relays.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.relay_id.cmp(&b.relay_id)));
        Ok(relays)
    }

    /// Number of candidates currently in the table.
    pub fn len(&self) -> Result<usize, RelayControlError> {
        Ok(self
            .backend
            .scan_prefix(ANNOUNCE_PREFIX)
            .map_err(RelayControlError::QueryFailed)?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, RelayControlError> {
        Ok(self.len()? == 0)
    }

    /// Observe table changes as a monotonically increasing version.
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn prune(&self) -> Result<(), RelayControlError> {
        let mut relays = self.snapshot()?;
        if relays.len() <= self.capacity {
            return Ok(());
        }
        // snapshot() is recency-sorted, so everything past capacity is oldest
        for stale in relays.split_off(self.capacity) {
            self.backend
                .remove(&Self::key(&stale.relay_id))
                .map_err(RelayControlError::Storage)?;
            tracing::debug!(relay = %stale.relay_id, "pruned stale announce");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn store(capacity: usize) -> AnnounceStore {
        AnnounceStore::new(Arc::new(MemoryStorage::new()), capacity)
    }

    fn relay(id_byte: u8, last_seen: u64) -> CandidateRelay {
        let mut relay = CandidateRelay::new(format!("{:032x}", id_byte), 2);
        relay.last_seen = last_seen;
        relay
    }

    #[test]
    fn test_record_and_snapshot_recency_order() {
        let store = store(10);
        store.record_announce(relay(1, 100)).unwrap();
        store.record_announce(relay(2, 300)).unwrap();
        store.record_announce(relay(3, 200)).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].relay_id, format!("{:032x}", 2));
        assert_eq!(snapshot[1].relay_id, format!("{:032x}", 3));
        assert_eq!(snapshot[2].relay_id, format!("{:032x}", 1));
    }

    #[test]
    fn test_reannounce_deduplicates() {
        let store = store(10);
        store.record_announce(relay(1, 100)).unwrap();
        let mut updated = relay(1, 200);
        updated.hops = 5;
        store.record_announce(updated).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].hops, 5);
        assert_eq!(snapshot[0].last_seen, 200);
    }

    #[test]
    fn test_capacity_prunes_oldest() {
        let store = store(2);
        store.record_announce(relay(1, 100)).unwrap();
        store.record_announce(relay(2, 200)).unwrap();
        store.record_announce(relay(3, 300)).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|r| r.last_seen >= 200));
    }

    #[test]
    fn test_invalid_relay_id_rejected() {
        let store = store(10);
        let bad = CandidateRelay::new("not-hex", 1);
        assert!(store.record_announce(bad).is_err());
    }

    #[test]
    fn test_favorite_survives_reannounce() {
        let store = store(10);
        store.record_announce(relay(1, 100)).unwrap();
        assert!(store.set_favorite(&format!("{:032x}", 1), true).unwrap());

        store.record_announce(relay(1, 200)).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot[0].favorite);
    }

    #[test]
    fn test_set_favorite_unknown_relay() {
        let store = store(10);
        assert!(!store
            .set_favorite("00112233445566778899aabbccddeeff", true)
            .unwrap());
    }

    #[test]
    fn test_version_bumps_on_change() {
        let store = store(10);
        let rx = store.watch_changes();
        let before = *rx.borrow();

        store.record_announce(relay(1, 100)).unwrap();
        assert!(*rx.borrow() > before);
    }

    #[test]
    fn test_remove_candidate() {
        let store = store(10);
        store.record_announce(relay(1, 100)).unwrap();
        store.remove(&format!("{:032x}", 1)).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_snapshot_skips_corrupt_records() {
        let backend = Arc::new(MemoryStorage::new());
        backend.put(b"announce/garbage", b"{not json").unwrap();
        let store = AnnounceStore::new(backend, 10);
        store.record_announce(relay(1, 100)).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
