//! Claim Reconciler
//!
//! Converges the QoS rules of the volume behind one claim:
//!
//! ```text
//! Fetch → Filter → ExtractDesired → ResolveBackend → Validate → Apply → Report
//! ```
//!
//! `sync` never returns an error. Every attempt ends in a [`SyncOutcome`]
//! that tells the worker whether to forget the key or retry it.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::backend::BackendRegistry;
use crate::domain::{ClaimCache, ClaimNotice, EventRecorder, ObjectKey, QosSettings, VolumeClaim};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::ControllerMetrics;

/// Why a claim needed no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ClaimGone,
    NotBound,
    Deleting,
    NoVolumeName,
    NoProvisioner,
    UnsupportedProvisioner,
}

/// Result of one reconciliation attempt.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The backend matches the annotations
    Converged,
    /// Nothing to do for this claim
    Skipped(SkipReason),
    /// Will not succeed until the claim changes
    Rejected(Error),
    /// Try again with backoff
    Retry(Error),
}

impl SyncOutcome {
    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Converged => "converged",
            SyncOutcome::Skipped(_) => "skipped",
            SyncOutcome::Rejected(_) => "rejected",
            SyncOutcome::Retry(_) => "retry",
        }
    }

    /// Whether the key should be requeued with backoff.
    pub fn needs_retry(&self) -> bool {
        matches!(self, SyncOutcome::Retry(_))
    }
}

/// Stateless reconciliation logic shared by every worker.
pub struct Reconciler {
    cache: Arc<dyn ClaimCache>,
    backends: Arc<BackendRegistry>,
    recorder: Arc<dyn EventRecorder>,
    metrics: ControllerMetrics,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn ClaimCache>,
        backends: Arc<BackendRegistry>,
        recorder: Arc<dyn EventRecorder>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            cache,
            backends,
            recorder,
            metrics,
        }
    }

    /// Reconcile the claim identified by a `namespace/name` key.
    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> SyncOutcome {
        let key = match ObjectKey::parse(key) {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Dropping malformed key");
                return SyncOutcome::Rejected(e);
            }
        };

        let claim = match self.fetch(&key) {
            Ok(claim) => claim,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Claim no longer exists");
                return SyncOutcome::Skipped(SkipReason::ClaimGone);
            }
            Err(e) => return SyncOutcome::Retry(e),
        };

        if !claim.is_eligible() {
            if claim.deleting {
                debug!("Claim is being deleted");
                return SyncOutcome::Skipped(SkipReason::Deleting);
            }
            debug!(phase = %claim.phase, "Claim is not bound");
            return SyncOutcome::Skipped(SkipReason::NotBound);
        }
        let Some(volume_name) = claim.volume_name.clone() else {
            warn!("Bound claim has no volume name");
            return SyncOutcome::Skipped(SkipReason::NoVolumeName);
        };

        let settings = QosSettings::from_annotations(&claim.annotations);

        let Some(provisioner) = claim.provisioner() else {
            warn!("Claim has no storage provisioner annotation");
            return SyncOutcome::Skipped(SkipReason::NoProvisioner);
        };
        let Some(backend) = self.backends.get(provisioner) else {
            warn!(provisioner = %provisioner, "No backend for provisioner");
            self.recorder
                .record(&claim, ClaimNotice::unsupported_provisioner(provisioner))
                .await;
            return SyncOutcome::Skipped(SkipReason::UnsupportedProvisioner);
        };

        if let Err(e) = backend.validate(&settings) {
            warn!(error = %e, "Invalid QoS annotation");
            self.recorder
                .record(&claim, ClaimNotice::invalid_qos_annotation(&e))
                .await;
            return SyncOutcome::Rejected(e);
        }

        self.apply(&claim, &volume_name, backend.as_ref(), &settings).await
    }

    fn fetch(&self, key: &ObjectKey) -> Result<VolumeClaim> {
        self.cache
            .claim(key)
            .ok_or_else(|| Error::ClaimNotFound(key.to_string()))
    }

    async fn apply(
        &self,
        claim: &VolumeClaim,
        volume_name: &str,
        backend: &dyn crate::backend::VolumeBackend,
        settings: &QosSettings,
    ) -> SyncOutcome {
        let Some(volume) = self.cache.volume(volume_name) else {
            debug!(volume = %volume_name, "Bound volume not cached yet");
            return SyncOutcome::Retry(Error::VolumeNotFound(volume_name.to_string()));
        };

        match backend.set_qos(&volume, settings).await {
            Ok(report) => {
                self.metrics
                    .record_backend_ops(backend.name(), report.set.len(), report.removed.len());
                if !report.is_noop() {
                    info!(
                        volume = %volume.name,
                        set = report.set.len(),
                        removed = report.removed.len(),
                        "QoS rules updated"
                    );
                    self.recorder
                        .record(
                            claim,
                            ClaimNotice::qos_applied(report.set.len(), report.removed.len()),
                        )
                        .await;
                }
                SyncOutcome::Converged
            }
            Err(e) => {
                self.recorder
                    .record(claim, ClaimNotice::setting_qos_failed(&e))
                    .await;
                match e.kind() {
                    ErrorKind::Transient => {
                        warn!(volume = %volume.name, error = %e, "Failed to set QoS, will retry");
                        SyncOutcome::Retry(e)
                    }
                    _ => {
                        error!(volume = %volume.name, error = %e, "Backend rejected QoS settings");
                        SyncOutcome::Rejected(e)
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryClaimCache, InMemoryEventRecorder};
    use crate::backend::{ApplyReport, VolumeBackend};
    use crate::domain::claim::ANN_STORAGE_PROVISIONER;
    use crate::domain::events::reasons;
    use crate::domain::{ClaimPhase, NoticeType, Volume};
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROVISIONER: &str = "rbd.csi.ceph.com";

    /// Backend that records calls and returns a scripted result.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: AtomicUsize,
        failure: Mutex<Option<ErrorKind>>,
        report: Mutex<ApplyReport>,
    }

    #[async_trait]
    impl VolumeBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}

        fn validate(&self, settings: &QosSettings) -> Result<()> {
            crate::backend::rbd::rules::validate_settings(settings)
        }

        async fn set_qos(&self, _volume: &Volume, _settings: &QosSettings) -> Result<ApplyReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match *self.failure.lock() {
                Some(ErrorKind::InvalidArgument) => {
                    Err(Error::InvalidArgument("(22) Invalid argument".into()))
                }
                Some(_) => Err(Error::Backend("(110) Connection timed out".into())),
                None => Ok(self.report.lock().clone()),
            }
        }
    }

    struct Harness {
        cache: Arc<InMemoryClaimCache>,
        recorder: Arc<InMemoryEventRecorder>,
        backend: Arc<ScriptedBackend>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let cache = Arc::new(InMemoryClaimCache::new());
        let recorder = Arc::new(InMemoryEventRecorder::new());
        let backend = Arc::new(ScriptedBackend::default());
        let mut registry = BackendRegistry::new();
        registry.register(PROVISIONER, backend.clone()).unwrap();

        let reconciler = Reconciler::new(
            cache.clone(),
            Arc::new(registry),
            recorder.clone(),
            ControllerMetrics::new().unwrap(),
        );
        Harness {
            cache,
            recorder,
            backend,
            reconciler,
        }
    }

    fn claim(phase: ClaimPhase, annotations: &[(&str, &str)]) -> VolumeClaim {
        VolumeClaim {
            key: ObjectKey::new("apps", "data-0"),
            uid: Some("uid-1".into()),
            resource_version: Some("1".into()),
            phase,
            volume_name: Some("pv-1".into()),
            deleting: false,
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn volume() -> Volume {
        Volume {
            name: "pv-1".into(),
            driver: Some(PROVISIONER.into()),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_malformed_key_is_rejected() {
        let h = harness();
        for key in ["no-slash", "a/b/c", "/name", "ns/"] {
            let outcome = h.reconciler.sync(key).await;
            assert!(matches!(outcome, SyncOutcome::Rejected(Error::InvalidKey(_))), "{key}");
        }
    }

    #[tokio::test]
    async fn test_missing_claim_is_skipped() {
        let h = harness();
        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::ClaimGone)));
        assert!(h.recorder.is_empty());
    }

    #[tokio::test]
    async fn test_pending_claim_never_reaches_backend() {
        let h = harness();
        h.cache.upsert_claim(claim(
            ClaimPhase::Pending,
            &[
                (ANN_STORAGE_PROVISIONER, PROVISIONER),
                ("pv.kubernetes.io/qos-iops-limit", "100"),
            ],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::NotBound)));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert!(h.recorder.is_empty());
    }

    #[tokio::test]
    async fn test_deleting_claim_is_skipped() {
        let h = harness();
        let mut c = claim(ClaimPhase::Bound, &[(ANN_STORAGE_PROVISIONER, PROVISIONER)]);
        c.deleting = true;
        h.cache.upsert_claim(c);

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Deleting)));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bound_claim_without_volume_name_is_skipped() {
        let h = harness();
        let mut c = claim(
            ClaimPhase::Bound,
            &[
                (ANN_STORAGE_PROVISIONER, PROVISIONER),
                ("pv.kubernetes.io/qos-iops-limit", "100"),
            ],
        );
        c.volume_name = None;
        h.cache.upsert_claim(c);

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::NoVolumeName)));
        assert!(!outcome.needs_retry());
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fetch_classifies_missing_claim_as_not_found() {
        let h = harness();
        let err = h.reconciler.fetch(&ObjectKey::new("apps", "gone")).unwrap_err();
        assert!(matches!(err, Error::ClaimNotFound(ref k) if k == "apps/gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_missing_provisioner_is_skipped_silently() {
        let h = harness();
        h.cache.upsert_claim(claim(ClaimPhase::Bound, &[]));

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::NoProvisioner)));
        assert!(h.recorder.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_provisioner_records_warning() {
        let h = harness();
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[(ANN_STORAGE_PROVISIONER, "ebs.csi.aws.com")],
        ));

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(
            outcome,
            SyncOutcome::Skipped(SkipReason::UnsupportedProvisioner)
        ));
        let notices = h.recorder.with_reason(reasons::UNSUPPORTED_PROVISIONER);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].1.note.contains("ebs.csi.aws.com"));
    }

    #[tokio::test]
    async fn test_invalid_annotation_is_rejected_with_warning() {
        let h = harness();
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[
                (ANN_STORAGE_PROVISIONER, PROVISIONER),
                ("pv.kubernetes.io/qos-iops-limit", "100Mi"),
            ],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        match outcome {
            SyncOutcome::Rejected(e) => assert_eq!(e.kind(), ErrorKind::Validation),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.recorder.with_reason(reasons::INVALID_QOS_ANNOTATION).len(), 1);
    }

    #[tokio::test]
    async fn test_uncached_volume_is_retried() {
        let h = harness();
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[(ANN_STORAGE_PROVISIONER, PROVISIONER)],
        ));

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Retry(Error::VolumeNotFound(ref v)) if v == "pv-1"));
        assert!(outcome.needs_retry());
    }

    #[tokio::test]
    async fn test_applied_changes_record_normal_event() {
        let h = harness();
        *h.backend.report.lock() = ApplyReport {
            set: vec!["conf_rbd_qos_iops_limit".into()],
            removed: vec![],
        };
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[
                (ANN_STORAGE_PROVISIONER, PROVISIONER),
                ("pv.kubernetes.io/qos-iops-limit", "100"),
            ],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Converged));

        let notices = h.recorder.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1.reason, reasons::QOS_APPLIED);
        assert_eq!(notices[0].1.notice_type, NoticeType::Normal);
    }

    #[tokio::test]
    async fn test_noop_apply_records_nothing() {
        let h = harness();
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[(ANN_STORAGE_PROVISIONER, PROVISIONER)],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Converged));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert!(h.recorder.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_argument_is_terminal_with_one_warning() {
        let h = harness();
        *h.backend.failure.lock() = Some(ErrorKind::InvalidArgument);
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[
                (ANN_STORAGE_PROVISIONER, PROVISIONER),
                ("pv.kubernetes.io/qos-iops-limit", "999999999999T"),
            ],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Rejected(Error::InvalidArgument(_))));
        assert!(!outcome.needs_retry());

        let notices = h.recorder.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1.reason, reasons::SETTING_QOS_FAILED);
        assert!(notices[0].1.is_warning());
    }

    #[tokio::test]
    async fn test_transient_backend_error_is_retried() {
        let h = harness();
        *h.backend.failure.lock() = Some(ErrorKind::Transient);
        h.cache.upsert_claim(claim(
            ClaimPhase::Bound,
            &[(ANN_STORAGE_PROVISIONER, PROVISIONER)],
        ));
        h.cache.upsert_volume(volume());

        let outcome = h.reconciler.sync("apps/data-0").await;
        assert!(matches!(outcome, SyncOutcome::Retry(Error::Backend(_))));
        assert_eq!(h.recorder.with_reason(reasons::SETTING_QOS_FAILED).len(), 1);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(SyncOutcome::Converged.label(), "converged");
        assert_eq!(SyncOutcome::Skipped(SkipReason::NotBound).label(), "skipped");
        assert_eq!(
            SyncOutcome::Rejected(Error::InvalidKey("x".into())).label(),
            "rejected"
        );
        assert_eq!(
            SyncOutcome::Retry(Error::VolumeNotFound("pv".into())).label(),
            "retry"
        );
    }
}
