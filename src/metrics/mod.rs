//! Metrics module
//!
//! Prometheus instruments for the controller. Each [`ControllerMetrics`]
//! owns its registry so tests can create as many as they like.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::Result;

const NAMESPACE: &str = "volume_qos";

/// Controller-wide Prometheus instruments.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    backend_ops_total: IntCounterVec,
    queue_depth: IntGauge,
    is_leader: IntGauge,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "Claim syncs by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Time spent syncing one claim")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["outcome"],
        )?;
        let backend_ops_total = IntCounterVec::new(
            Opts::new("backend_operations_total", "QoS rules changed on storage backends")
                .namespace(NAMESPACE),
            &["backend", "operation"],
        )?;
        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Keys waiting in the work queue").namespace(NAMESPACE),
        )?;
        let is_leader = IntGauge::with_opts(
            Opts::new("is_leader", "1 while this replica holds the leader lease")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(backend_ops_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(is_leader.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
            backend_ops_total,
            queue_depth,
            is_leader,
        })
    }

    pub fn observe_sync(&self, outcome: &str, seconds: f64) {
        self.reconcile_total.with_label_values(&[outcome]).inc();
        self.reconcile_duration
            .with_label_values(&[outcome])
            .observe(seconds);
    }

    pub fn record_backend_ops(&self, backend: &str, set: usize, removed: usize) {
        if set > 0 {
            self.backend_ops_total
                .with_label_values(&[backend, "set"])
                .inc_by(set as u64);
        }
        if removed > 0 {
            self.backend_ops_total
                .with_label_values(&[backend, "remove"])
                .inc_by(removed as u64);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.set(i64::from(leader));
    }

    pub fn sync_count(&self, outcome: &str) -> u64 {
        self.reconcile_total.with_label_values(&[outcome]).get()
    }

    /// Render all instruments in the Prometheus text format.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_instruments() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.observe_sync("converged", 0.02);
        metrics.record_backend_ops("ceph-rbd", 2, 1);
        metrics.set_queue_depth(3);

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("volume_qos_reconcile_total{outcome=\"converged\"} 1"));
        assert!(body.contains("volume_qos_backend_operations_total{backend=\"ceph-rbd\",operation=\"set\"} 2"));
        assert!(body.contains("volume_qos_queue_depth 3"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ControllerMetrics::new().unwrap();
        let b = ControllerMetrics::new().unwrap();
        a.observe_sync("retry", 0.1);
        assert_eq!(a.sync_count("retry"), 1);
        assert_eq!(b.sync_count("retry"), 0);
    }
}
