//! Volume QoS Controller
//!
//! A Kubernetes controller that keeps the I/O throttling rules of storage
//! volumes in line with the QoS annotations on their PersistentVolumeClaims.
//! Annotations such as `pv.kubernetes.io/qos-iops-limit: "100"` on a bound
//! claim are translated into backend-native rules (RBD image metadata for
//! Ceph) and converged: missing rules are set, changed rules updated, and
//! rules no longer requested removed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Volume QoS Controller                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Claim Source │───▶│  Work Queue  │───▶│  Reconciler  │       │
//! │  │  (watches)   │    │   (dedup)    │    │  (workers)   │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                  ▼               │
//! │                                         ┌──────────────┐        │
//! │                                         │   Backends   │        │
//! │                                         │  (Ceph RBD)  │        │
//! │                                         └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Kubernetes and in-memory implementations of the domain ports
//! - [`backend`] - Storage backend contract, registry and the Ceph RBD driver
//! - [`config`] - Configuration file and defaults
//! - [`controller`] - Worker pool and reconciliation logic
//! - [`domain`] - Claims, QoS settings, notices and ports
//! - [`error`] - Error types
//! - [`leader`] - Lease-based leader election
//! - [`metrics`] - Prometheus instruments
//! - [`queue`] - Deduplicating rate-limited work queue
//! - [`server`] - Health and metrics endpoints

pub mod adapters;
pub mod backend;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod server;

// Re-export commonly used types
pub use backend::{BackendRegistry, VolumeBackend};
pub use config::Config;
pub use controller::{QosController, Reconciler, SyncOutcome};
pub use domain::{QosKey, QosSettings};
pub use error::{Error, Result};
pub use metrics::ControllerMetrics;
