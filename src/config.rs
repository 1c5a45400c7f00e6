//! Controller configuration
//!
//! Values come from command-line flags or, when `--config-file` is given,
//! from a YAML file:
//!
//! ```yaml
//! leaderElection:
//!   leaderElect: true
//!   leaseDuration: 30s
//! controllerConfig:
//!   resyncPeriod: 30m
//!   workers: 2
//!   cephRBD:
//!     provisioner: rbd.csi.ceph.com
//!     monitors: 10.0.0.1:6789,10.0.0.2:6789
//!     user: admin
//!     key: AQD...==
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RBD_PROVISIONER: &str = "rbd.csi.ceph.com";
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RESOURCE_NAME: &str = "qos-controller-leader-lock";
pub const DEFAULT_RESOURCE_LOCK: &str = "leases";
pub const DEFAULT_RESOURCE_NAMESPACE: &str = "default";

/// Default worker count: half the CPUs, at least one.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus / 2).max(1)
}

// =============================================================================
// Top Level
// =============================================================================

/// Complete process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub leader_election: LeaderElectionConfig,
    #[serde(rename = "controllerConfig")]
    pub controller: ControllerConfig,
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.leader_election.validate()
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Settings consumed by the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Interval at which every cached claim is re-checked
    #[serde(with = "duration_str")]
    pub resync_period: Duration,

    /// Number of concurrent workers
    pub workers: usize,

    /// Ceph RBD backend; disabled when absent or without a provisioner
    #[serde(rename = "cephRBD")]
    pub ceph_rbd: Option<RbdConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            workers: default_workers(),
            ceph_rbd: Some(RbdConfig::default()),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.resync_period.is_zero() {
            return Err(Error::Config("resyncPeriod must be positive".to_string()));
        }
        Ok(())
    }
}

/// Connection settings for one Ceph cluster.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RbdConfig {
    /// CSI driver name this backend serves
    pub provisioner: String,
    /// Comma separated monitor addresses
    pub monitors: String,
    /// Ceph user, without the `client.` prefix
    pub user: String,
    /// Secret key of `user`
    pub key: String,
    /// Path or name of the `rbd` binary
    pub rbd_binary: String,
    /// Path or name of the `ceph` binary
    pub ceph_binary: String,
    /// Directory for short-lived keyfiles (system temp dir when unset)
    pub keyfile_dir: Option<PathBuf>,
    /// Upper bound for a single storage command
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl RbdConfig {
    pub fn has_provisioner(&self) -> bool {
        !self.provisioner.is_empty()
    }
}

impl Default for RbdConfig {
    fn default() -> Self {
        Self {
            provisioner: DEFAULT_RBD_PROVISIONER.to_string(),
            monitors: String::new(),
            user: String::new(),
            key: String::new(),
            rbd_binary: "rbd".to_string(),
            ceph_binary: "ceph".to_string(),
            keyfile_dir: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for RbdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbdConfig")
            .field("provisioner", &self.provisioner)
            .field("monitors", &self.monitors)
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .field("rbd_binary", &self.rbd_binary)
            .field("ceph_binary", &self.ceph_binary)
            .field("keyfile_dir", &self.keyfile_dir)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

// =============================================================================
// Leader Election
// =============================================================================

/// Lease-based leader election settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
    /// Acquire leadership before running the controller
    pub leader_elect: bool,
    /// How long a non-renewed lease stays valid
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    #[serde(with = "duration_str")]
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    #[serde(with = "duration_str")]
    pub retry_period: Duration,
    /// Lock object type; only `leases` is supported
    pub resource_lock: String,
    pub resource_name: String,
    pub resource_namespace: String,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            leader_elect: false,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            resource_lock: DEFAULT_RESOURCE_LOCK.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            resource_namespace: DEFAULT_RESOURCE_NAMESPACE.to_string(),
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.leader_elect {
            return Ok(());
        }
        if self.renew_deadline > self.lease_duration {
            return Err(Error::Config(
                "leaseDuration must be greater than or equal to renewDeadline".to_string(),
            ));
        }
        if self.retry_period.is_zero() || self.retry_period >= self.renew_deadline {
            return Err(Error::Config(
                "retryPeriod must be positive and shorter than renewDeadline".to_string(),
            ));
        }
        if !matches!(self.resource_lock.as_str(), "leases" | "endpointsleases" | "configmapsleases") {
            return Err(Error::Config(format!(
                "unsupported resource lock {:?}",
                self.resource_lock
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration such as `30s`, `15m`, `1h30m`, `500ms` or `30m0s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c);
            chars.next();
        }

        if num_buf.is_empty() {
            return Err(Error::DurationParse(format!(
                "invalid number in duration: {}",
                s
            )));
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        let overflow = || Error::DurationParse(format!("duration out of range: {}", s));
        let secs = |factor: u64| {
            num.checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(overflow)
        };
        let part = match unit.as_str() {
            "ms" => Duration::from_millis(num),
            "s" | "S" => Duration::from_secs(num),
            "m" | "M" => secs(60)?,
            "h" | "H" => secs(3600)?,
            "d" | "D" => secs(86400)?,
            "" => {
                return Err(Error::DurationParse(format!(
                    "missing unit in duration: {}",
                    s
                )))
            }
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total = total.checked_add(part).ok_or_else(overflow)?;
    }

    Ok(total)
}

/// Render a duration in the form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let millis = d.subsec_millis();
    let secs = d.as_secs();
    if millis != 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}

/// Serde helper storing durations as human readable strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("30m0s").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration(" 45s ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1.5h").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        let max = u64::MAX.to_string();
        for input in [
            format!("{max}m"),
            format!("{max}h"),
            format!("{max}d"),
            format!("{max}s1s"),
        ] {
            assert!(
                matches!(parse_duration(&input), Err(Error::DurationParse(_))),
                "{input}"
            );
        }
        assert_eq!(
            parse_duration(&format!("{max}s")).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_format_duration_roundtrips() {
        for d in [
            Duration::from_secs(0),
            Duration::from_secs(5),
            Duration::from_secs(90),
            Duration::from_secs(1800),
            Duration::from_secs(5400),
            Duration::from_millis(1500),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.controller.resync_period, DEFAULT_RESYNC_PERIOD);
        assert!(config.controller.workers >= 1);
        let rbd = config.controller.ceph_rbd.as_ref().unwrap();
        assert_eq!(rbd.provisioner, DEFAULT_RBD_PROVISIONER);
        assert!(!config.leader_election.leader_elect);
        assert_eq!(config.leader_election.resource_name, DEFAULT_RESOURCE_NAME);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
leaderElection:
  leaderElect: true
  leaseDuration: 40s
  resourceNamespace: kube-system
controllerConfig:
  resyncPeriod: 10m
  workers: 4
  cephRBD:
    provisioner: rbd.csi.ceph.com
    monitors: 10.0.0.1:6789
    user: admin
    key: secret
    commandTimeout: 10s
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.leader_election.leader_elect);
        assert_eq!(config.leader_election.lease_duration, Duration::from_secs(40));
        assert_eq!(config.leader_election.renew_deadline, DEFAULT_RENEW_DEADLINE);
        assert_eq!(config.leader_election.resource_namespace, "kube-system");
        assert_eq!(config.controller.resync_period, Duration::from_secs(600));
        assert_eq!(config.controller.workers, 4);

        let rbd = config.controller.ceph_rbd.unwrap();
        assert_eq!(rbd.monitors, "10.0.0.1:6789");
        assert_eq!(rbd.user, "admin");
        assert_eq!(rbd.command_timeout, Duration::from_secs(10));
        assert_eq!(rbd.rbd_binary, "rbd");
    }

    #[test]
    fn test_from_yaml_rejects_zero_workers() {
        let yaml = "controllerConfig:\n  workers: 0\n";
        assert!(matches!(Config::from_yaml(yaml), Err(Error::Config(_))));
    }

    #[test]
    fn test_leader_election_validation() {
        let mut le = LeaderElectionConfig {
            leader_elect: true,
            ..Default::default()
        };
        le.validate().unwrap();

        le.renew_deadline = Duration::from_secs(60);
        assert!(le.validate().is_err());

        le.renew_deadline = DEFAULT_RENEW_DEADLINE;
        le.resource_lock = "configmaps".to_string();
        assert!(le.validate().is_err());
    }

    #[test]
    fn test_rbd_config_debug_redacts_key() {
        let rbd = RbdConfig {
            key: "AQDsecret==".to_string(),
            ..Default::default()
        };
        let printed = format!("{:?}", rbd);
        assert!(!printed.contains("AQDsecret"));
        assert!(printed.contains("<redacted>"));
    }
}
