//! Admission-controlled work queue.
//!
//! A [`ConstrainedQueue`] limits what may be released downstream without
//! rejecting anything outright: items that cannot proceed yet are held by
//! a pluggable [`AdmissionPolicy`] and surface later, when the release of
//! a finished item frees the capacity they were waiting on.
//!
//! ```text
//!            insert                       consume
//!               │                            ▲
//!               ▼                            │
//!        ┌─────────────┐   pass   ┌──────────┴───┐
//!        │  admission  │─────────▶│   delegate   │
//!        │   policy    │          │  (bounded)   │
//!        └──────┬──────┘          └──────▲───────┘
//!          held │                        │ drain task
//!               ▼                 ┌──────┴───────┐
//!        ┌─────────────┐ release  │   overflow   │
//!        │  waitlists  │─────────▶│ (unbounded)  │
//!        └─────────────┘          └──────────────┘
//! ```
//!
//! Two policies ship with the crate: [`CardinalityPolicy`] bounds the
//! total number of concurrently passed items, and
//! [`NodeConcurrencyPolicy`] bounds how many relocations may touch any
//! one node at once.

pub mod admission;
mod buffer;
pub mod cardinality;
pub mod constrained;
pub mod node_concurrency;

pub use admission::{Admission, AdmissionPolicy};
pub use cardinality::CardinalityPolicy;
pub use constrained::ConstrainedQueue;
pub use node_concurrency::NodeConcurrencyPolicy;
