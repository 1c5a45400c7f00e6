//! QoS dimensions and claim-facing settings
//!
//! IOPS: number of I/Os per second (any type of I/O)
//! read IOPS: number of read I/Os per second
//! write IOPS: number of write I/Os per second
//! bps: bytes per second (any type of I/O)
//! read bps: bytes per second read
//! write bps: bytes per second written

use std::collections::BTreeMap;

/// Prefix shared by every QoS annotation on a claim.
pub const QOS_ANNOTATION_PREFIX: &str = "pv.kubernetes.io/";

/// One throttling axis that can be configured on a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QosKey {
    LimitIops,
    LimitReadIops,
    LimitWriteIops,
    BurstIops,
    BurstReadIops,
    BurstWriteIops,
    LimitBps,
    LimitReadBps,
    LimitWriteBps,
    BurstBps,
    BurstReadBps,
    BurstWriteBps,
}

impl QosKey {
    /// Every dimension, in annotation order.
    pub const ALL: [QosKey; 12] = [
        QosKey::LimitIops,
        QosKey::LimitReadIops,
        QosKey::LimitWriteIops,
        QosKey::BurstIops,
        QosKey::BurstReadIops,
        QosKey::BurstWriteIops,
        QosKey::LimitBps,
        QosKey::LimitReadBps,
        QosKey::LimitWriteBps,
        QosKey::BurstBps,
        QosKey::BurstReadBps,
        QosKey::BurstWriteBps,
    ];

    /// Full annotation key, e.g. `pv.kubernetes.io/qos-iops-limit`.
    pub fn annotation(&self) -> &'static str {
        match self {
            QosKey::LimitIops => "pv.kubernetes.io/qos-iops-limit",
            QosKey::LimitReadIops => "pv.kubernetes.io/qos-read-iops-limit",
            QosKey::LimitWriteIops => "pv.kubernetes.io/qos-write-iops-limit",
            QosKey::BurstIops => "pv.kubernetes.io/qos-iops-burst",
            QosKey::BurstReadIops => "pv.kubernetes.io/qos-read-iops-burst",
            QosKey::BurstWriteIops => "pv.kubernetes.io/qos-write-iops-burst",
            QosKey::LimitBps => "pv.kubernetes.io/qos-bps-limit",
            QosKey::LimitReadBps => "pv.kubernetes.io/qos-read-bps-limit",
            QosKey::LimitWriteBps => "pv.kubernetes.io/qos-write-bps-limit",
            QosKey::BurstBps => "pv.kubernetes.io/qos-bps-burst",
            QosKey::BurstReadBps => "pv.kubernetes.io/qos-read-bps-burst",
            QosKey::BurstWriteBps => "pv.kubernetes.io/qos-write-bps-burst",
        }
    }

    /// Reverse lookup from an annotation key.
    pub fn from_annotation(key: &str) -> Option<QosKey> {
        QosKey::ALL.into_iter().find(|k| k.annotation() == key)
    }
}

impl std::fmt::Display for QosKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.annotation())
    }
}

/// QoS settings requested by a claim.
///
/// Only dimensions present as annotations are included; an absent key means
/// "not specified", never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QosSettings(BTreeMap<QosKey, String>);

impl QosSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the QoS subset of a claim's annotations.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let settings = QosKey::ALL
            .into_iter()
            .filter_map(|key| {
                annotations
                    .get(key.annotation())
                    .map(|value| (key, value.clone()))
            })
            .collect();
        Self(settings)
    }

    pub fn insert(&mut self, key: QosKey, value: impl Into<String>) -> Option<String> {
        self.0.insert(key, value.into())
    }

    pub fn get(&self, key: QosKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (QosKey, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(QosKey, String)> for QosSettings {
    fn from_iter<I: IntoIterator<Item = (QosKey, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
