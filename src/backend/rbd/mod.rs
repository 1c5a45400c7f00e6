//! Ceph RBD backend
//!
//! QoS on RBD is configured through per-image metadata keys
//! (`conf_rbd_qos_*`). Convergence lists the image metadata, diffs it
//! against the desired rules, upserts what changed and removes what is no
//! longer wanted. Non-QoS metadata is never touched.

mod client;
pub mod rules;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{ApplyReport, VolumeBackend};
use crate::config::RbdConfig;
use crate::domain::{QosSettings, Volume};
use crate::error::{Error, Result};

pub use client::{ImageSpec, RbdCli, RbdClient};
pub use rules::RuleSet;

/// Volume attribute naming the pool that holds the image.
pub const ATTR_POOL: &str = "pool";
/// Volume attribute naming the image.
pub const ATTR_IMAGE_NAME: &str = "imageName";
/// Optional volume attribute naming the RADOS namespace.
pub const ATTR_RADOS_NAMESPACE: &str = "radosNamespace";

/// QoS backend for Ceph RBD images.
pub struct RbdBackend<C: RbdClient = RbdCli> {
    provisioner: String,
    client: C,
}

impl RbdBackend<RbdCli> {
    pub fn new(config: RbdConfig) -> Self {
        let provisioner = config.provisioner.clone();
        Self {
            provisioner,
            client: RbdCli::new(config),
        }
    }
}

impl<C: RbdClient> RbdBackend<C> {
    pub fn with_client(provisioner: impl Into<String>, client: C) -> Self {
        Self {
            provisioner: provisioner.into(),
            client,
        }
    }

    pub fn provisioner(&self) -> &str {
        &self.provisioner
    }

    /// Resolve the image a volume is backed by.
    pub fn image_spec(volume: &Volume) -> Result<ImageSpec> {
        let image = volume.require_attribute(ATTR_IMAGE_NAME)?;
        let pool = volume.require_attribute(ATTR_POOL)?;
        let mut spec = ImageSpec::new(pool, image);
        if let Some(ns) = volume.attribute(ATTR_RADOS_NAMESPACE) {
            spec = spec.with_namespace(ns);
        }
        Ok(spec)
    }
}

/// Prefix a backend error with context while keeping its kind.
fn with_context(err: Error, context: String) -> Error {
    match err {
        Error::InvalidArgument(msg) => Error::InvalidArgument(format!("{}: {}", context, msg)),
        Error::Backend(msg) => Error::Backend(format!("{}: {}", context, msg)),
        other => other,
    }
}

#[async_trait]
impl<C: RbdClient> VolumeBackend for RbdBackend<C> {
    fn name(&self) -> &str {
        "ceph-rbd"
    }

    async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    async fn close(&self) {
        self.client.shutdown().await;
    }

    fn validate(&self, settings: &QosSettings) -> Result<()> {
        rules::validate_settings(settings)
    }

    #[instrument(skip(self, settings), fields(volume = %volume.name))]
    async fn set_qos(&self, volume: &Volume, settings: &QosSettings) -> Result<ApplyReport> {
        let image = Self::image_spec(volume)?;
        debug!(image = %image, "Resolved RBD image");

        let meta = self.client.list_metadata(&image).await.map_err(|e| {
            with_context(e, format!("failed to list metadata of volume {}", volume.name))
        })?;

        let current = rules::rules_from_metadata(&meta);
        let desired = rules::rules_from_settings(settings);
        let to_set = rules::rules_to_set(&current, &desired);
        let to_remove = rules::rules_to_remove(&current, &desired);

        let mut report = ApplyReport::default();

        for (key, value) in &to_set {
            self.client
                .set_metadata(&image, key, value)
                .await
                .map_err(|e| {
                    with_context(
                        e,
                        format!("failed to set metadata {}={} for volume {}", key, value, volume.name),
                    )
                })?;
            info!(key = %key, value = %value, "Set RBD QoS metadata");
            report.set.push(key.clone());
        }

        for (key, value) in &to_remove {
            self.client.remove_metadata(&image, key).await.map_err(|e| {
                with_context(
                    e,
                    format!("failed to remove metadata {}={} for volume {}", key, value, volume.name),
                )
            })?;
            info!(key = %key, value = %value, "Removed RBD QoS metadata");
            report.removed.push(key.clone());
        }

        Ok(report)
    }
}
