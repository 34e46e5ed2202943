//! Shard rebalancing engine.
//!
//! The [`ShardAllocator`] converges a cluster toward a balanced,
//! conflict-free shard distribution:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ShardAllocator                         │
//! │  notify_* ──▶ replace universe, supersede in-flight pass     │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ pass: fill missing nodes → drop leavers → resolve      │  │
//! │  │ split-brain → assign unowned → even the load           │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ execute: ConstrainedQueue + NodeConcurrencyPolicy,     │  │
//! │  │ worker pool of |nodes| × max_per_node relocations      │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │        re-discover distribution, repeat until a pass         │
//! │        computes zero moves (fixed point)                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is a single-process in-memory coordinator: ownership truth,
//! physical relocation, and split-brain arbitration are supplied by the
//! caller through the three collaborator traits below.

pub mod engine;
pub mod placement;

pub use engine::ShardAllocator;
pub use placement::CountIndex;

use crate::error::Result;
use crate::types::{Distribution, Relocation};
use async_trait::async_trait;
use std::collections::HashSet;

/// Discovers the real-world distribution of shard ownership.
///
/// Queried after every executed batch; the answer is authoritative and
/// overrides the engine's in-memory bookkeeping.
#[async_trait]
pub trait DistributionDiscoverer<N, S>: Send + Sync {
    /// Report which nodes currently claim which shards.
    async fn discover_distribution(&self) -> Distribution<N, S>;
}

/// Performs one physical relocation.
///
/// Invoked once per computed move, potentially concurrently up to the
/// configured per-node bound. A failure truncates the current batch but
/// never aborts the engine; the next discovery-driven pass retries.
#[async_trait]
pub trait ShardRelocator<N, S>: Send + Sync {
    /// Carry out the relocation.
    async fn relocate(&self, relocation: &Relocation<N, S>) -> Result<()>;
}

/// Arbitrates disputed ownership.
///
/// Called once per conflicted shard per pass with the full claimant set
/// and the current load index, and returns the relocations that leave the
/// shard with a single owner. Returning no moves means the dispute is
/// accepted as-is.
pub trait SplitBrainResolver<N, S>: Send + Sync {
    /// Resolve a shard claimed by more than one live node.
    fn resolve(
        &self,
        shard: &S,
        claimants: &HashSet<N>,
        index: &CountIndex<N>,
    ) -> Vec<Relocation<N, S>>;
}
