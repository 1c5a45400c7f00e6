//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │        ClaimCache │ EventRecorder │ ClaimEvent channel      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ KubeClaimSource │ KubeClaimCache │ KubeEventRecorder       │ │
//! │  │ InMemoryClaimCache │ InMemoryEventRecorder                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod event_recorder;
mod in_memory;
mod kubernetes;

pub use event_recorder::{claim_reference, InMemoryEventRecorder, KubeEventRecorder, CONTROLLER_NAME};
pub use in_memory::InMemoryClaimCache;
pub use kubernetes::{KubeClaimCache, KubeClaimSource, ResourceVersionTracker};
