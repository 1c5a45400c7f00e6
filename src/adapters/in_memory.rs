//! In-memory claim cache
//!
//! A [`ClaimCache`] that tests fill by hand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::domain::{ClaimCache, ObjectKey, Volume, VolumeClaim};

#[derive(Debug)]
pub struct InMemoryClaimCache {
    claims: RwLock<BTreeMap<ObjectKey, VolumeClaim>>,
    volumes: RwLock<BTreeMap<String, Volume>>,
    synced: AtomicBool,
}

impl Default for InMemoryClaimCache {
    fn default() -> Self {
        Self {
            claims: RwLock::default(),
            volumes: RwLock::default(),
            synced: AtomicBool::new(true),
        }
    }
}

impl InMemoryClaimCache {
    /// An empty cache that reports itself as synced.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_claim(&self, claim: VolumeClaim) {
        self.claims.write().insert(claim.key.clone(), claim);
    }

    pub fn remove_claim(&self, key: &ObjectKey) -> Option<VolumeClaim> {
        self.claims.write().remove(key)
    }

    pub fn upsert_volume(&self, volume: Volume) {
        self.volumes.write().insert(volume.name.clone(), volume);
    }

    pub fn remove_volume(&self, name: &str) -> Option<Volume> {
        self.volumes.write().remove(name)
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }
}

impl ClaimCache for InMemoryClaimCache {
    fn claim(&self, key: &ObjectKey) -> Option<VolumeClaim> {
        self.claims.read().get(key).cloned()
    }

    fn volume(&self, name: &str) -> Option<Volume> {
        self.volumes.read().get(name).cloned()
    }

    fn claim_keys(&self) -> Vec<ObjectKey> {
        self.claims.read().keys().cloned().collect()
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClaimPhase;

    #[test]
    fn test_upsert_and_remove() {
        let cache = InMemoryClaimCache::new();
        let key = ObjectKey::new("apps", "data-0");
        cache.upsert_claim(VolumeClaim {
            key: key.clone(),
            uid: None,
            resource_version: None,
            phase: ClaimPhase::Pending,
            volume_name: None,
            deleting: false,
            annotations: BTreeMap::new(),
        });
        cache.upsert_volume(Volume {
            name: "pv-1".into(),
            ..Default::default()
        });

        assert_eq!(cache.claim_keys(), vec![key.clone()]);
        assert!(cache.volume("pv-1").is_some());

        assert!(cache.remove_claim(&key).is_some());
        assert!(cache.claim(&key).is_none());
        assert!(cache.remove_volume("pv-1").is_some());
    }

    #[test]
    fn test_sync_flag() {
        let cache = InMemoryClaimCache::new();
        assert!(cache.is_synced());
        cache.set_synced(false);
        assert!(!cache.is_synced());
    }
}
