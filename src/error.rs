//! Error types for the Volume QoS Controller

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, used by the reconciler to decide between
/// retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object is gone; nothing left to do
    NotFound,
    /// User input failed local validation
    Validation,
    /// The storage engine rejected a well-formed request
    InvalidArgument,
    /// Anything that may succeed on a later attempt
    Transient,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::InvalidArgument => write!(f, "invalid-argument"),
            ErrorKind::Transient => write!(f, "transient"),
        }
    }
}

/// Errors that can occur in the Volume QoS Controller
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// Queue key is not of the form namespace/name
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// Claim no longer exists
    #[error("claim {0} no longer exists")]
    ClaimNotFound(String),

    /// Bound volume is not (yet) in the cache
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// Annotation value failed validation
    #[error("invalid value {value:?} for QoS key {key:?}")]
    InvalidQosValue { key: String, value: String },

    /// Volume lacks an attribute the backend needs to address it
    #[error("volume {volume} is missing {attribute} in volumeAttributes")]
    MissingVolumeAttribute { volume: String, attribute: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Storage engine rejected the request as malformed
    #[error("{0}")]
    InvalidArgument(String),

    /// Storage engine call failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Storage engine call did not finish in time
    #[error("command '{command}' timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    /// Backend session is not open
    #[error("backend {0} is not connected")]
    NotConnected(String),

    /// Backend session could not be established
    #[error("failed to connect backend {provisioner}: {reason}")]
    BackendConnect { provisioner: String, reason: String },

    /// Two backends claim the same provisioner
    #[error("duplicate backend for provisioner {0}")]
    DuplicateBackend(String),

    /// Leader election failure
    #[error("leader election error: {0}")]
    LeaderElection(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ClaimNotFound(_) => ErrorKind::NotFound,
            Error::InvalidKey(_) | Error::InvalidQosValue { .. } => ErrorKind::Validation,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::ClaimNotFound("ns/a".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::InvalidQosValue {
                key: "k".into(),
                value: "01".into()
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::InvalidArgument("bad".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Error::Backend("timeout".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::VolumeNotFound("pv-1".into()).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::MissingVolumeAttribute {
            volume: "pv-1".into(),
            attribute: "pool".into(),
        };
        assert_eq!(
            err.to_string(),
            "volume pv-1 is missing pool in volumeAttributes"
        );
    }
}
