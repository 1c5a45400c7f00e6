//! Backend Registry
//!
//! Maps provisioner identifiers to backend instances. Built once, then only
//! read, so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::{RbdBackend, VolumeBackend};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};

/// Provisioner → backend lookup table.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn VolumeBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every configured backend with a non-empty provisioner.
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(rbd) = config.ceph_rbd.as_ref().filter(|c| c.has_provisioner()) {
            registry.register(rbd.provisioner.clone(), Arc::new(RbdBackend::new(rbd.clone())))?;
        }

        if registry.is_empty() {
            warn!("No storage backends configured; every claim will be skipped");
        }
        Ok(registry)
    }

    /// Add a backend. At most one backend per provisioner.
    pub fn register(
        &mut self,
        provisioner: impl Into<String>,
        backend: Arc<dyn VolumeBackend>,
    ) -> Result<()> {
        let provisioner = provisioner.into();
        if provisioner.is_empty() {
            return Err(Error::Config("backend provisioner must not be empty".into()));
        }
        if self.backends.contains_key(&provisioner) {
            return Err(Error::DuplicateBackend(provisioner));
        }
        info!(provisioner = %provisioner, backend = backend.name(), "Registered storage backend");
        self.backends.insert(provisioner, backend);
        Ok(())
    }

    pub fn get(&self, provisioner: &str) -> Option<&Arc<dyn VolumeBackend>> {
        self.backends.get(provisioner)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Connect every backend, stopping at the first failure.
    pub async fn connect_all(&self) -> Result<()> {
        for (provisioner, backend) in &self.backends {
            backend.connect().await.map_err(|e| Error::BackendConnect {
                provisioner: provisioner.clone(),
                reason: e.to_string(),
            })?;
            info!(provisioner = %provisioner, "Backend connected");
        }
        Ok(())
    }

    /// Close every backend. Never fails.
    pub async fn close_all(&self) {
        for (provisioner, backend) in &self.backends {
            backend.close().await;
            info!(provisioner = %provisioner, "Backend closed");
        }
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("provisioners", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ApplyReport;
    use crate::config::RbdConfig;
    use crate::domain::{QosSettings, Volume};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        fail_connect: bool,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl VolumeBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(Error::Backend("monitors unreachable".into()));
            }
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn validate(&self, _settings: &QosSettings) -> Result<()> {
            Ok(())
        }

        async fn set_qos(&self, _volume: &Volume, _settings: &QosSettings) -> Result<ApplyReport> {
            Ok(ApplyReport::default())
        }
    }

    #[test]
    fn test_from_config_registers_rbd() {
        let config = ControllerConfig::default();
        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("rbd.csi.ceph.com").is_some());
        assert!(registry.get("ebs.csi.aws.com").is_none());
    }

    #[test]
    fn test_from_config_skips_empty_provisioner() {
        let config = ControllerConfig {
            ceph_rbd: Some(RbdConfig {
                provisioner: String::new(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(BackendRegistry::from_config(&config).unwrap().is_empty());

        let config = ControllerConfig {
            ceph_rbd: None,
            ..Default::default()
        };
        assert!(BackendRegistry::from_config(&config).unwrap().is_empty());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = BackendRegistry::new();
        registry
            .register("a.csi", Arc::new(CountingBackend::default()))
            .unwrap();
        let err = registry
            .register("a.csi", Arc::new(CountingBackend::default()))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateBackend(p) if p == "a.csi"));
    }

    #[tokio::test]
    async fn test_connect_all_reports_failing_provisioner() {
        let mut registry = BackendRegistry::new();
        registry
            .register(
                "bad.csi",
                Arc::new(CountingBackend {
                    fail_connect: true,
                    ..Default::default()
                }),
            )
            .unwrap();

        let err = registry.connect_all().await.unwrap_err();
        assert!(matches!(err, Error::BackendConnect { ref provisioner, .. } if provisioner == "bad.csi"));
    }

    #[tokio::test]
    async fn test_close_all_closes_every_backend() {
        let a = Arc::new(CountingBackend::default());
        let b = Arc::new(CountingBackend::default());
        let mut registry = BackendRegistry::new();
        registry.register("a.csi", a.clone()).unwrap();
        registry.register("b.csi", b.clone()).unwrap();

        registry.close_all().await;
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }
}
