//! Event Recorder Adapters
//!
//! Implements the `EventRecorder` port on top of
//! `kube::runtime::events::Recorder`, plus an in-memory collector for tests.
//!
//! Events are fire-and-forget: a failed publish is logged and never
//! propagates into reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{debug, warn};

use crate::domain::{ClaimNotice, EventRecorder, NoticeType, ObjectKey, VolumeClaim};

/// Reporting component shown on published Events.
pub const CONTROLLER_NAME: &str = "volume-qos-controller";

/// Action recorded on every Event.
const ACTION_RECONCILE: &str = "Reconcile";

/// Publishes claim notices as Kubernetes Events.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// `instance` distinguishes replicas (usually the leader identity).
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

/// Reference to the claim an Event is attached to.
pub fn claim_reference(claim: &VolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: Some(claim.key.namespace.clone()),
        name: Some(claim.key.name.clone()),
        uid: claim.uid.clone(),
        resource_version: claim.resource_version.clone(),
        ..Default::default()
    }
}

fn event_type(notice_type: NoticeType) -> EventType {
    match notice_type {
        NoticeType::Normal => EventType::Normal,
        NoticeType::Warning => EventType::Warning,
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, claim: &VolumeClaim, notice: ClaimNotice) {
        let event = Event {
            type_: event_type(notice.notice_type),
            reason: notice.reason.to_string(),
            note: Some(notice.note),
            action: ACTION_RECONCILE.to_string(),
            secondary: None,
        };
        match self.recorder.publish(&event, &claim_reference(claim)).await {
            Ok(()) => debug!(claim = %claim.key, reason = notice.reason, "Published event"),
            Err(e) => warn!(
                claim = %claim.key,
                reason = notice.reason,
                error = %e,
                "Failed to publish Kubernetes event"
            ),
        }
    }
}

/// In-memory notice collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    notices: parking_lot::RwLock<Vec<(ObjectKey, ClaimNotice)>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notices in publish order.
    pub fn notices(&self) -> Vec<(ObjectKey, ClaimNotice)> {
        self.notices.read().clone()
    }

    /// Notices recorded for one claim.
    pub fn notices_for(&self, key: &ObjectKey) -> Vec<ClaimNotice> {
        self.notices
            .read()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Notices with a given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<(ObjectKey, ClaimNotice)> {
        self.notices
            .read()
            .iter()
            .filter(|(_, n)| n.reason == reason)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.notices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.read().is_empty()
    }

    pub fn clear(&self) {
        self.notices.write().clear();
    }
}

#[async_trait]
impl EventRecorder for InMemoryEventRecorder {
    async fn record(&self, claim: &VolumeClaim, notice: ClaimNotice) {
        self.notices.write().push((claim.key.clone(), notice));
    }
}
