//! Domain Layer
//!
//! Types the reconciliation core is written against:
//!
//! - **Claims** (`claim.rs`) - claim/volume snapshots and queue keys
//! - **QoS** (`qos.rs`) - QoS dimensions and claim-facing settings
//! - **Events** (`events.rs`) - advisory notices attached to claims
//! - **Ports** (`ports.rs`) - trait abstractions for external dependencies

pub mod claim;
pub mod events;
pub mod ports;
pub mod qos;

pub use claim::{ClaimPhase, ObjectKey, Volume, VolumeClaim};
pub use events::{ClaimNotice, NoticeType};
pub use ports::{ClaimCache, ClaimEvent, EventRecorder, CLAIM_EVENT_CAPACITY};
pub use qos::{QosKey, QosSettings};
