//! Claim and volume snapshots
//!
//! Point-in-time, read-only views of the Kubernetes objects the reconciler
//! works on. They are built from the cache on every attempt and never kept.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;

use crate::error::{Error, Result};

/// Annotation carrying the provisioner that created the claim's volume.
pub const ANN_STORAGE_PROVISIONER: &str = "volume.kubernetes.io/storage-provisioner";

/// Pre-1.23 spelling of [`ANN_STORAGE_PROVISIONER`].
pub const ANN_BETA_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";

/// Queue key identifying a claim (`namespace/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Split a `namespace/name` key. A key without a slash is cluster scoped
    /// and rejected, since claims are always namespaced.
    pub fn parse(key: &str) -> Result<Self> {
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(*namespace, *name))
            }
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Binding phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl ClaimPhase {
    fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Bound") => ClaimPhase::Bound,
            Some("Lost") => ClaimPhase::Lost,
            _ => ClaimPhase::Pending,
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

/// Snapshot of a PersistentVolumeClaim.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeClaim {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub phase: ClaimPhase,
    pub volume_name: Option<String>,
    pub deleting: bool,
    pub annotations: BTreeMap<String, String>,
}

impl VolumeClaim {
    /// Only bound claims that are not being deleted are reconciled.
    pub fn is_eligible(&self) -> bool {
        self.phase == ClaimPhase::Bound && !self.deleting
    }

    /// Provisioner recorded on the claim, if any.
    pub fn provisioner(&self) -> Option<&str> {
        self.annotations
            .get(ANN_STORAGE_PROVISIONER)
            .or_else(|| self.annotations.get(ANN_BETA_STORAGE_PROVISIONER))
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

impl From<&PersistentVolumeClaim> for VolumeClaim {
    fn from(pvc: &PersistentVolumeClaim) -> Self {
        Self {
            key: ObjectKey::new(pvc.namespace().unwrap_or_default(), pvc.name_any()),
            uid: pvc.uid(),
            resource_version: pvc.resource_version(),
            phase: ClaimPhase::from_status(
                pvc.status.as_ref().and_then(|s| s.phase.as_deref()),
            ),
            volume_name: pvc
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.clone())
                .filter(|n| !n.is_empty()),
            deleting: pvc.metadata.deletion_timestamp.is_some(),
            annotations: pvc.annotations().clone(),
        }
    }
}

/// Snapshot of a PersistentVolume's backend addressing data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Volume {
    pub name: String,
    pub driver: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Volume {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Look up an attribute the backend cannot work without.
    pub fn require_attribute(&self, name: &str) -> Result<&str> {
        self.attribute(name)
            .ok_or_else(|| Error::MissingVolumeAttribute {
                volume: self.name.clone(),
                attribute: name.to_string(),
            })
    }
}

impl From<&PersistentVolume> for Volume {
    fn from(pv: &PersistentVolume) -> Self {
        let csi = pv.spec.as_ref().and_then(|s| s.csi.as_ref());
        Self {
            name: pv.name_any(),
            driver: csi.map(|c| c.driver.clone()),
            attributes: csi
                .and_then(|c| c.volume_attributes.clone())
                .unwrap_or_default(),
        }
    }
}
