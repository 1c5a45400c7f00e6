//! Storage Backends
//!
//! A backend knows how to validate and apply QoS settings on one storage
//! engine. Backends are selected by the provisioner recorded on the claim,
//! through a [`BackendRegistry`] built once at startup.
//!
//! ```text
//! claim provisioner ──▶ BackendRegistry ──▶ dyn VolumeBackend ──▶ engine
//!                         (immutable)        (RbdBackend, ...)
//! ```

pub mod rbd;
mod registry;

use async_trait::async_trait;

use crate::domain::{QosSettings, Volume};
use crate::error::Result;

pub use rbd::RbdBackend;
pub use registry::BackendRegistry;

/// Summary of what a convergence call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Backend keys that were added or updated
    pub set: Vec<String>,
    /// Backend keys that were removed
    pub removed: Vec<String>,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }
}

/// Capability interface every storage backend implements.
///
/// One instance serves all workers; implementations must tolerate concurrent
/// `set_qos` calls for different volumes.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Open the session. Called once at startup; failure is fatal.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Best effort, called at shutdown.
    async fn close(&self);

    /// Check every value without touching the engine.
    fn validate(&self, settings: &QosSettings) -> Result<()>;

    /// Converge the volume's QoS rules to exactly `settings`. Idempotent.
    async fn set_qos(&self, volume: &Volume, settings: &QosSettings) -> Result<ApplyReport>;
}
