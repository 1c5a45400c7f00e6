//! Kubernetes Claim Source and Cache
//!
//! Watches PersistentVolumeClaims and PersistentVolumes through kube-runtime
//! reflectors. The reflector stores back the [`ClaimCache`] port; the claim
//! watch stream is turned into [`ClaimEvent`]s for the controller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::{ClaimCache, ClaimEvent, ObjectKey, Volume, VolumeClaim};
use crate::error::Result;

/// Initial-list completion flags for both watches.
#[derive(Debug, Default)]
struct SyncState {
    claims: AtomicBool,
    volumes: AtomicBool,
}

impl SyncState {
    fn is_synced(&self) -> bool {
        self.claims.load(Ordering::Acquire) && self.volumes.load(Ordering::Acquire)
    }
}

fn claim_key(pvc: &PersistentVolumeClaim) -> ObjectKey {
    ObjectKey::new(pvc.namespace().unwrap_or_default(), pvc.name_any())
}

// =============================================================================
// Cache
// =============================================================================

/// [`ClaimCache`] backed by reflector stores.
#[derive(Clone)]
pub struct KubeClaimCache {
    claims: Store<PersistentVolumeClaim>,
    volumes: Store<PersistentVolume>,
    synced: Arc<SyncState>,
}

impl std::fmt::Debug for KubeClaimCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClaimCache")
            .field("claims", &self.claims.state().len())
            .field("volumes", &self.volumes.state().len())
            .field("synced", &self.synced.is_synced())
            .finish()
    }
}

impl ClaimCache for KubeClaimCache {
    fn claim(&self, key: &ObjectKey) -> Option<VolumeClaim> {
        let reference = ObjectRef::<PersistentVolumeClaim>::new(&key.name).within(&key.namespace);
        self.claims
            .get(&reference)
            .map(|pvc| VolumeClaim::from(pvc.as_ref()))
    }

    fn volume(&self, name: &str) -> Option<Volume> {
        self.volumes
            .get(&ObjectRef::<PersistentVolume>::new(name))
            .map(|pv| Volume::from(pv.as_ref()))
    }

    fn claim_keys(&self) -> Vec<ObjectKey> {
        self.claims
            .state()
            .iter()
            .map(|pvc| claim_key(pvc))
            .collect()
    }

    fn is_synced(&self) -> bool {
        self.synced.is_synced()
    }
}

// =============================================================================
// Event source
// =============================================================================

/// Turns watch notifications into [`ClaimEvent`]s, dropping updates that
/// carry an unchanged resource version (periodic relists).
///
/// A relist (`Init` .. `InitDone`) replaces the tracked set: keys that were
/// not listed again are dropped and reported as deletions.
#[derive(Debug, Default)]
pub struct ResourceVersionTracker {
    seen: DashMap<ObjectKey, Option<String>>,
    relisted: Mutex<Option<HashSet<ObjectKey>>>,
}

impl ResourceVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an add or update. `None` means nothing changed.
    pub fn observe(&self, key: ObjectKey, resource_version: Option<String>) -> Option<ClaimEvent> {
        if let Some(relisted) = self.relisted.lock().as_mut() {
            relisted.insert(key.clone());
        }
        match self.seen.insert(key.clone(), resource_version.clone()) {
            None => Some(ClaimEvent::Added(key)),
            Some(Some(previous)) if resource_version.as_ref() == Some(&previous) => {
                debug!(claim = %key, resource_version = %previous, "Unchanged resource version");
                None
            }
            Some(_) => Some(ClaimEvent::Updated(key)),
        }
    }

    /// Record a deletion.
    pub fn forget(&self, key: ObjectKey) -> ClaimEvent {
        self.seen.remove(&key);
        ClaimEvent::Deleted(key)
    }

    /// A relist started; collect the keys it delivers.
    pub fn begin_relist(&self) {
        *self.relisted.lock() = Some(HashSet::new());
    }

    /// A relist finished; forget every key it did not deliver.
    pub fn finish_relist(&self) -> Vec<ClaimEvent> {
        let Some(relisted) = self.relisted.lock().take() else {
            return Vec::new();
        };
        let stale: Vec<ObjectKey> = self
            .seen
            .iter()
            .filter(|entry| !relisted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        if !stale.is_empty() {
            debug!(stale = stale.len(), "Dropping claims missing from relist");
        }
        stale.into_iter().map(|key| self.forget(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Drives the PVC and PV watches and emits claim events.
pub struct KubeClaimSource {
    client: Client,
    claims: reflector::store::Writer<PersistentVolumeClaim>,
    volumes: reflector::store::Writer<PersistentVolume>,
    synced: Arc<SyncState>,
    tracker: ResourceVersionTracker,
}

impl KubeClaimSource {
    /// Create the source together with the cache it fills.
    pub fn new(client: Client) -> (Self, KubeClaimCache) {
        let (claim_store, claim_writer) = reflector::store();
        let (volume_store, volume_writer) = reflector::store();
        let synced = Arc::new(SyncState::default());

        let cache = KubeClaimCache {
            claims: claim_store,
            volumes: volume_store,
            synced: synced.clone(),
        };
        let source = Self {
            client,
            claims: claim_writer,
            volumes: volume_writer,
            synced,
            tracker: ResourceVersionTracker::new(),
        };
        (source, cache)
    }

    /// Run both watches until cancelled or until the receiver goes away.
    pub async fn run(self, events: mpsc::Sender<ClaimEvent>, cancel: CancellationToken) -> Result<()> {
        let Self {
            client,
            claims,
            volumes,
            synced,
            tracker,
        } = self;

        let claim_api: Api<PersistentVolumeClaim> = Api::all(client.clone());
        let volume_api: Api<PersistentVolume> = Api::all(client);

        let claim_stream =
            reflector::reflector(claims, watcher::watcher(claim_api, watcher::Config::default()))
                .default_backoff();
        let volume_stream =
            reflector::reflector(volumes, watcher::watcher(volume_api, watcher::Config::default()))
                .default_backoff();
        tokio::pin!(claim_stream);
        tokio::pin!(volume_stream);

        info!("Starting PersistentVolumeClaim and PersistentVolume watches");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Claim source cancelled");
                    break;
                }
                event = claim_stream.next() => match event {
                    Some(Ok(event)) => {
                        if !forward(&events, on_claim_event(&tracker, &synced, event)) {
                            debug!("Event channel closed, stopping claim source");
                            break;
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "PersistentVolumeClaim watch error"),
                    None => break,
                },
                event = volume_stream.next() => match event {
                    Some(Ok(Event::InitDone)) => {
                        synced.volumes.store(true, Ordering::Release);
                        debug!("PersistentVolume cache synced");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(error = %e, "PersistentVolume watch error"),
                    None => break,
                },
            }
        }

        info!("Claim source stopped");
        Ok(())
    }
}

impl std::fmt::Debug for KubeClaimSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClaimSource")
            .field("tracked", &self.tracker.len())
            .finish()
    }
}

/// Hand events to the controller without waiting on a full channel, so the
/// watch keeps feeding the cache. Dropped keys are picked up by the sweep of
/// every cached claim when the controller starts and by periodic resyncs.
///
/// Returns `false` once the receiver is gone.
fn forward(events: &mpsc::Sender<ClaimEvent>, batch: Vec<ClaimEvent>) -> bool {
    for event in batch {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                trace!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}

fn on_claim_event(
    tracker: &ResourceVersionTracker,
    synced: &SyncState,
    event: Event<PersistentVolumeClaim>,
) -> Vec<ClaimEvent> {
    match event {
        Event::Apply(pvc) | Event::InitApply(pvc) => tracker
            .observe(claim_key(&pvc), pvc.resource_version())
            .into_iter()
            .collect(),
        Event::Delete(pvc) => vec![tracker.forget(claim_key(&pvc))],
        Event::Init => {
            tracker.begin_relist();
            Vec::new()
        }
        Event::InitDone => {
            synced.claims.store(true, Ordering::Release);
            debug!("PersistentVolumeClaim cache synced");
            tracker.finish_relist()
        }
    }
}
