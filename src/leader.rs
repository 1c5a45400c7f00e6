//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! controller. Writes go through `replace` with the lease's resourceVersion,
//! so two candidates racing for an expired lease cannot both win: the loser
//! gets 409 Conflict and goes back to waiting.
//!
//! The leader renews every `retryPeriod`. If no renewal succeeds within
//! `renewDeadline`, leadership is considered lost and the leading token is
//! cancelled. On graceful shutdown the lease is released so a standby can
//! take over without waiting for expiry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;

/// Unique identity of this replica: `<hostname>-<uuid>`.
pub fn identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "qos-controller".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

/// What a candidate should do with the lease it just read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease object yet
    Create,
    /// We hold it; extend it
    Renew,
    /// Someone else held it but let it expire
    TakeOver { transitions: i32 },
    /// Held by someone else and still valid
    Wait,
}

/// Whether a lease has run past `renewTime + leaseDurationSeconds`.
/// A lease without either field, or without a holder, counts as expired.
pub fn lease_is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(seconds))
        }
        _ => true,
    }
}

/// Decide how to proceed given the current lease (if any).
pub fn decide(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = existing else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }
    if lease_is_expired(spec, now) {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

/// Lease-based leader elector.
pub struct LeaderElector {
    client: Client,
    config: LeaderElectionConfig,
    identity: String,
    metrics: ControllerMetrics,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        config: LeaderElectionConfig,
        identity: impl Into<String>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            config,
            identity: identity.into(),
            metrics,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Wait for leadership, then run `lead` with a token that is cancelled
    /// when leadership is lost or `cancel` fires.
    ///
    /// Returns `Ok` if cancelled (before or after acquiring), the result of
    /// `lead` if it finishes on its own, and an error if leadership is lost.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, lead: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.acquire(&cancel).await {
            info!(identity = %self.identity, "Cancelled while waiting for leadership");
            return Ok(());
        }

        let leading = cancel.child_token();
        let lost = Arc::new(AtomicBool::new(false));

        let lead_fut = lead(leading.clone());
        tokio::pin!(lead_fut);
        let finished = tokio::select! {
            res = &mut lead_fut => Some(res),
            _ = self.renew_until_lost(&leading, &lost) => None,
        };
        leading.cancel();
        // Let the leader wind down before reporting the loss
        let result = match finished {
            Some(res) => res,
            None => lead_fut.await,
        };

        self.is_leader.store(false, Ordering::SeqCst);
        self.metrics.set_leader(false);

        if lost.load(Ordering::SeqCst) {
            return Err(Error::LeaderElection(format!(
                "leadership lost by {}",
                self.identity
            )));
        }
        if let Err(e) = self.release().await {
            warn!(identity = %self.identity, error = %e, "Failed to release lease");
        }
        result
    }

    /// Returns `false` if cancelled first.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(
            identity = %self.identity,
            lease = %self.config.resource_name,
            namespace = %self.config.resource_namespace,
            "Waiting for leadership"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    self.metrics.set_leader(true);
                    return true;
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "Failed to acquire lease"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every retry period until the renew deadline passes without a
    /// successful renewal, or until `leading` is cancelled.
    async fn renew_until_lost(&self, leading: &CancellationToken, lost: &AtomicBool) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = leading.cancelled() => {
                    // Parked until the lead future observes the cancellation
                    std::future::pending::<()>().await;
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease");
                    if last_renewed.elapsed() >= self.config.renew_deadline {
                        break;
                    }
                }
            }
        }
        warn!(identity = %self.identity, "Leadership lost");
        lost.store(true, Ordering::SeqCst);
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.config.resource_namespace)
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api = self.api();
        let now = Utc::now();

        let existing = match api.get(&self.config.resource_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match decide(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Create => self.create(&api, now).await,
            LeaseDecision::Renew => {
                let mut updated = existing.unwrap_or_default();
                if let Some(spec) = updated.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                    spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                }
                self.replace(&api, &updated).await
            }
            LeaseDecision::TakeOver { transitions } => {
                let resource_version = existing.and_then(|l| l.metadata.resource_version);
                let lease = self.lease(resource_version, now, transitions + 1);
                let taken = self.replace(&api, &lease).await?;
                if taken {
                    info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                }
                Ok(taken)
            }
            LeaseDecision::Wait => Ok(false),
        }
    }

    fn lease(&self, resource_version: Option<String>, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.resource_name.clone()),
                namespace: Some(self.config.resource_namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn create(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        match api.create(&PostParams::default(), &self.lease(None, now, 0)).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap write; `false` on conflict.
    async fn replace(&self, api: &Api<Lease>, lease: &Lease) -> Result<bool> {
        match api
            .replace(&self.config.resource_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a standby can acquire immediately.
    async fn release(&self) -> Result<()> {
        let api = self.api();
        let mut lease = match api.get(&self.config.resource_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));

        if self.replace(&api, &lease).await? {
            info!(identity = %self.identity, "Lease released");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.identity)
            .field("lease", &self.config.resource_name)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, seconds: i32, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("qos-controller-leader-lock".into()),
                resource_version: Some("10".into()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(seconds),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_identity_format() {
        let id = identity();
        let (host, uuid) = id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(uuid.len(), 12);
        assert_ne!(identity(), id);
    }

    #[test]
    fn test_decide_create_when_missing() {
        assert_eq!(decide(None, "me", Utc::now()), LeaseDecision::Create);
    }

    #[test]
    fn test_decide_renew_own_lease() {
        let now = Utc::now();
        let held = lease(Some("me"), now - chrono::Duration::seconds(300), 30, 2);
        assert_eq!(decide(Some(&held), "me", now), LeaseDecision::Renew);
    }

    #[test]
    fn test_decide_wait_on_valid_foreign_lease() {
        let now = Utc::now();
        let held = lease(Some("other"), now - chrono::Duration::seconds(10), 30, 2);
        assert_eq!(decide(Some(&held), "me", now), LeaseDecision::Wait);
    }

    #[test]
    fn test_decide_take_over_expired_lease() {
        let now = Utc::now();
        let held = lease(Some("other"), now - chrono::Duration::seconds(31), 30, 2);
        assert_eq!(
            decide(Some(&held), "me", now),
            LeaseDecision::TakeOver { transitions: 2 }
        );
    }

    #[test]
    fn test_released_lease_is_expired() {
        let now = Utc::now();
        let released = lease(None, now, 30, 4);
        assert!(lease_is_expired(released.spec.as_ref(), now));
        assert_eq!(
            decide(Some(&released), "me", now),
            LeaseDecision::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn test_lease_without_timing_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("other".into()),
            ..Default::default()
        };
        assert!(lease_is_expired(Some(&spec), Utc::now()));
        assert!(lease_is_expired(None, Utc::now()));
    }
}
