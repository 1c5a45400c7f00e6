//! Claim notifications
//!
//! Advisory notices attached to a claim (surfaced as Kubernetes Events).
//! They never influence control flow.

use serde::Serialize;

/// Well-known notice reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A QoS annotation value failed validation
    pub const INVALID_QOS_ANNOTATION: &str = "InvalidQoSAnnotation";
    /// The claim's provisioner has no registered backend
    pub const UNSUPPORTED_PROVISIONER: &str = "UnsupportedProvisioner";
    /// The backend failed to apply the QoS rules
    pub const SETTING_QOS_FAILED: &str = "SettingQoSFailed";
    /// The backend changed at least one QoS rule
    pub const QOS_APPLIED: &str = "QoSApplied";
}

/// Severity of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeType {
    Normal,
    Warning,
}

/// A notice about one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimNotice {
    pub notice_type: NoticeType,
    pub reason: &'static str,
    pub note: String,
}

impl ClaimNotice {
    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            notice_type: NoticeType::Warning,
            reason,
            note: note.into(),
        }
    }

    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            notice_type: NoticeType::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn invalid_qos_annotation(err: &crate::error::Error) -> Self {
        Self::warning(reasons::INVALID_QOS_ANNOTATION, err.to_string())
    }

    pub fn unsupported_provisioner(provisioner: &str) -> Self {
        Self::warning(
            reasons::UNSUPPORTED_PROVISIONER,
            format!("CSI driver {provisioner} is not supported"),
        )
    }

    pub fn setting_qos_failed(err: &crate::error::Error) -> Self {
        Self::warning(reasons::SETTING_QOS_FAILED, err.to_string())
    }

    pub fn qos_applied(set: usize, removed: usize) -> Self {
        Self::normal(
            reasons::QOS_APPLIED,
            format!("updated {set} QoS rule(s), removed {removed}"),
        )
    }

    pub fn is_warning(&self) -> bool {
        self.notice_type == NoticeType::Warning
    }
}
