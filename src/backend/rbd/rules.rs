//! RBD QoS rules
//!
//! Translation between claim-facing [`QosSettings`] and RBD image metadata
//! keys, plus the diff that decides which metadata to upsert or remove.

use std::collections::BTreeMap;

use crate::domain::{QosKey, QosSettings};
use crate::error::{Error, Result};

/// Backend-native rule set: RBD metadata key → value.
pub type RuleSet = BTreeMap<String, String>;

/// Unit suffixes the RBD QoS options understand.
const UNIT_SUFFIXES: [char; 3] = ['M', 'G', 'T'];

/// RBD image metadata key for a QoS dimension.
pub fn rbd_key(key: QosKey) -> &'static str {
    match key {
        QosKey::LimitIops => "conf_rbd_qos_iops_limit",
        QosKey::LimitReadIops => "conf_rbd_qos_read_iops_limit",
        QosKey::LimitWriteIops => "conf_rbd_qos_write_iops_limit",
        QosKey::BurstIops => "conf_rbd_qos_iops_burst",
        QosKey::BurstReadIops => "conf_rbd_qos_read_iops_burst",
        QosKey::BurstWriteIops => "conf_rbd_qos_write_iops_burst",
        QosKey::LimitBps => "conf_rbd_qos_bps_limit",
        QosKey::LimitReadBps => "conf_rbd_qos_read_bps_limit",
        QosKey::LimitWriteBps => "conf_rbd_qos_write_bps_limit",
        QosKey::BurstBps => "conf_rbd_qos_bps_burst",
        QosKey::BurstReadBps => "conf_rbd_qos_read_bps_burst",
        QosKey::BurstWriteBps => "conf_rbd_qos_write_bps_burst",
    }
}

/// Whether `key` is one of the twelve RBD QoS metadata keys.
pub fn is_rbd_qos_key(key: &str) -> bool {
    QosKey::ALL.into_iter().any(|k| rbd_key(k) == key)
}

/// Keep only the QoS rules from an image's metadata.
pub fn rules_from_metadata(meta: &BTreeMap<String, String>) -> RuleSet {
    meta.iter()
        .filter(|(k, _)| is_rbd_qos_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Translate claim settings into RBD rules.
pub fn rules_from_settings(settings: &QosSettings) -> RuleSet {
    settings
        .iter()
        .map(|(k, v)| (rbd_key(k).to_string(), v.to_string()))
        .collect()
}

/// Rules in `desired` that are missing from `current` or differ.
pub fn rules_to_set(current: &RuleSet, desired: &RuleSet) -> RuleSet {
    desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Rules in `current` that are no longer desired.
pub fn rules_to_remove(current: &RuleSet, desired: &RuleSet) -> RuleSet {
    current
        .iter()
        .filter(|(k, _)| !desired.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `[1-9][0-9]*` optionally followed by exactly one of `M`, `G`, `T`.
pub fn is_valid_value(value: &str) -> bool {
    let digits = match value.strip_suffix(UNIT_SUFFIXES) {
        Some(rest) => rest,
        None => value,
    };
    let mut chars = digits.chars();
    match chars.next() {
        Some('1'..='9') => chars.all(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Check every value in `settings`.
pub fn validate_settings(settings: &QosSettings) -> Result<()> {
    for (key, value) in settings.iter() {
        if !is_valid_value(value) {
            return Err(Error::InvalidQosValue {
                key: key.annotation().to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMIT_IOPS: &str = "conf_rbd_qos_iops_limit";
    const LIMIT_READ_IOPS: &str = "conf_rbd_qos_read_iops_limit";
    const LIMIT_WRITE_IOPS: &str = "conf_rbd_qos_write_iops_limit";
    const BURST_IOPS: &str = "conf_rbd_qos_iops_burst";
    const LIMIT_BPS: &str = "conf_rbd_qos_bps_limit";

    fn rules(pairs: &[(&str, &str)]) -> RuleSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_table_is_injective() {
        let keys: std::collections::HashSet<_> = QosKey::ALL.into_iter().map(rbd_key).collect();
        assert_eq!(keys.len(), QosKey::ALL.len());
        assert!(keys.iter().all(|k| k.starts_with("conf_rbd_qos_")));
    }

    #[test]
    fn test_rules_from_metadata_filters_foreign_keys() {
        assert!(rules_from_metadata(&rules(&[("foo", "bar")])).is_empty());

        let meta = rules(&[
            ("foo", "bar"),
            (LIMIT_IOPS, "1"),
            (LIMIT_READ_IOPS, "1"),
            (LIMIT_WRITE_IOPS, "1"),
        ]);
        assert_eq!(
            rules_from_metadata(&meta),
            rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1"), (LIMIT_WRITE_IOPS, "1")])
        );
    }

    #[test]
    fn test_rules_from_settings() {
        let settings: QosSettings = [
            (QosKey::LimitIops, "1".to_string()),
            (QosKey::LimitReadIops, "1".to_string()),
            (QosKey::LimitWriteIops, "1".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            rules_from_settings(&settings),
            rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1"), (LIMIT_WRITE_IOPS, "1")])
        );
    }

    #[test]
    fn test_diff_add_all() {
        let desired = rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1")]);
        assert_eq!(rules_to_set(&RuleSet::new(), &desired), desired);
        assert!(rules_to_remove(&RuleSet::new(), &desired).is_empty());
    }

    #[test]
    fn test_diff_remove_all() {
        let current = rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1")]);
        assert!(rules_to_set(&current, &RuleSet::new()).is_empty());
        assert_eq!(rules_to_remove(&current, &RuleSet::new()), current);
    }

    #[test]
    fn test_diff_adds_only_missing() {
        let current = rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1")]);
        let desired = rules(&[(LIMIT_IOPS, "1"), (LIMIT_READ_IOPS, "1"), (LIMIT_WRITE_IOPS, "1")]);
        assert_eq!(rules_to_set(&current, &desired), rules(&[(LIMIT_WRITE_IOPS, "1")]));
        assert!(rules_to_remove(&current, &desired).is_empty());
    }

    #[test]
    fn test_diff_update_and_add() {
        let current = rules(&[(LIMIT_IOPS, "5")]);
        let desired = rules(&[(LIMIT_IOPS, "10"), (LIMIT_BPS, "100")]);

        assert_eq!(
            rules_to_set(&current, &desired),
            rules(&[(LIMIT_IOPS, "10"), (LIMIT_BPS, "100")])
        );
        assert!(rules_to_remove(&current, &desired).is_empty());
    }

    #[test]
    fn test_diff_remove_stale() {
        let current = rules(&[(LIMIT_IOPS, "5"), (BURST_IOPS, "20")]);
        let desired = rules(&[(LIMIT_IOPS, "5")]);

        assert!(rules_to_set(&current, &desired).is_empty());
        assert_eq!(rules_to_remove(&current, &desired), rules(&[(BURST_IOPS, "20")]));
    }

    #[test]
    fn test_valid_values() {
        for v in ["1", "10", "999", "1M", "1G", "100M", "100G", "100T"] {
            assert!(is_valid_value(v), "{v:?} should be valid");
        }
    }

    #[test]
    fn test_invalid_values() {
        for v in [
            "", "0", "01", "M", "100K", "100MM", "100MG", "100Mi", "100m", "1 M", "-1", "+1",
        ] {
            assert!(!is_valid_value(v), "{v:?} should be invalid");
        }
    }

    #[test]
    fn test_validate_settings_reports_offending_key() {
        let mut settings = QosSettings::new();
        settings.insert(QosKey::LimitIops, "100");
        settings.insert(QosKey::BurstBps, "100Mi");

        match validate_settings(&settings) {
            Err(Error::InvalidQosValue { key, value }) => {
                assert_eq!(key, "pv.kubernetes.io/qos-bps-burst");
                assert_eq!(value, "100Mi");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    fn known_key() -> impl Strategy<Value = String> {
        proptest::sample::select(QosKey::ALL.to_vec()).prop_map(|k| rbd_key(k).to_string())
    }

    fn rule_set() -> impl Strategy<Value = RuleSet> {
        proptest::collection::btree_map(known_key(), "[1-9][0-9]{0,3}[MGT]?", 0..12)
    }

    proptest! {
        #[test]
        fn prop_set_and_remove_are_disjoint(current in rule_set(), desired in rule_set()) {
            let set = rules_to_set(&current, &desired);
            let remove = rules_to_remove(&current, &desired);
            prop_assert!(set.keys().all(|k| !remove.contains_key(k)));
            prop_assert!(remove.keys().all(|k| current.contains_key(k)));
            prop_assert!(set.keys().all(|k| desired.contains_key(k)));
        }

        #[test]
        fn prop_applying_diff_converges(current in rule_set(), desired in rule_set()) {
            let mut state = current.clone();
            state.extend(rules_to_set(&current, &desired));
            for key in rules_to_remove(&current, &desired).keys() {
                state.remove(key);
            }
            prop_assert_eq!(state, desired);
        }

        #[test]
        fn prop_diff_is_idempotent(desired in rule_set()) {
            prop_assert!(rules_to_set(&desired, &desired).is_empty());
            prop_assert!(rules_to_remove(&desired, &desired).is_empty());
        }

        #[test]
        fn prop_generated_values_validate(value in "[1-9][0-9]{0,8}[MGT]?") {
            prop_assert!(is_valid_value(&value));
        }
    }
}
