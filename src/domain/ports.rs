//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the reconciliation core depends on. Infrastructure adapters
//! in [`crate::adapters`] implement them against Kubernetes, and in-memory
//! versions back the tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Domain Layer                        │
//! │     ClaimCache │ EventRecorder │ ClaimEvent (channel)     │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                    │
//! │  KubeClaimCache │ KubeClaimSource │ KubeEventRecorder    │
//! └──────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use super::claim::{ObjectKey, Volume, VolumeClaim};
use super::events::ClaimNotice;

/// Capacity of the bounded claim event channel.
pub const CLAIM_EVENT_CAPACITY: usize = 1024;

/// Change notification produced by the event source.
///
/// Only the key travels; the reconciler always re-reads the latest state
/// from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    Added(ObjectKey),
    Updated(ObjectKey),
    Deleted(ObjectKey),
}

impl ClaimEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ClaimEvent::Added(k) | ClaimEvent::Updated(k) | ClaimEvent::Deleted(k) => k,
        }
    }

    pub fn into_key(self) -> ObjectKey {
        match self {
            ClaimEvent::Added(k) | ClaimEvent::Updated(k) | ClaimEvent::Deleted(k) => k,
        }
    }
}

/// Read-only view of the local object cache.
///
/// Lookups are synchronous: the cache is populated in the background by the
/// event source and reads never touch the network.
pub trait ClaimCache: Send + Sync {
    /// Current snapshot of a claim, `None` if it is gone.
    fn claim(&self, key: &ObjectKey) -> Option<VolumeClaim>;

    /// Current snapshot of a volume, `None` if it is not cached.
    fn volume(&self, name: &str) -> Option<Volume>;

    /// Keys of every cached claim (used for periodic resync).
    fn claim_keys(&self) -> Vec<ObjectKey>;

    /// Whether the initial listing has completed.
    fn is_synced(&self) -> bool;
}

/// Sink for claim notices.
///
/// Implementations are fire-and-forget: failures are logged, never returned.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, claim: &VolumeClaim, notice: ClaimNotice);
}
