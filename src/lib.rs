//! Admission-controlled shard rebalancing.
//!
//! This crate provides two layers that compose into a self-correcting
//! shard placement engine:
//! - **Constrained queue** for admission-controlled work delivery
//! - **Admission policies** that bound what may run concurrently
//! - **Shard allocator** that converges a cluster toward balanced ownership
//!
//! # Features
//!
//! - Generic blocking queue whose policy may hold items back until
//!   capacity frees up, instead of rejecting them
//! - Cardinality and per-node concurrency policies out of the box
//! - Coalescing rebalance engine: each notification supersedes the
//!   in-flight pass, so bursts of churn cost one rebalance
//! - Split-brain arbitration through a caller-supplied resolver
//! - Failure truncation with discovery-driven retry
//!
//! # Example
//!
//! ```rust,no_run
//! use ballast::{AllocatorConfig, ShardAllocator};
//! use std::sync::Arc;
//!
//! # use ballast::allocator::{DistributionDiscoverer, ShardRelocator, SplitBrainResolver};
//! # fn collaborators() -> (
//! #     Arc<dyn DistributionDiscoverer<u64, u64>>,
//! #     Arc<dyn ShardRelocator<u64, u64>>,
//! #     Arc<dyn SplitBrainResolver<u64, u64>>,
//! # ) { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (discoverer, relocator, resolver) = collaborators();
//!
//!     let config = AllocatorConfig::new(0..3u64, 0..9u64)
//!         .with_max_relocations_per_node(2);
//!     let allocator = ShardAllocator::new(config, discoverer, relocator, resolver)?;
//!
//!     // Membership changed; the engine replans and moves shards.
//!     allocator.notify_nodes_change((0..4).collect());
//!     allocator.await_rebalance().await?;
//!
//!     allocator.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     notify_nodes / shards / distribution    │
//! └─────────────────────────────────────────────┘
//!                      │ supersedes in-flight pass
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │              ShardAllocator                 │
//! │  plan → execute → re-discover → fixed point │
//! └─────────────────────────────────────────────┘
//!                      │ one batch per pass
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │   ConstrainedQueue<NodeConcurrencyPolicy>   │
//! │  per-node throttled relocation worker pool  │
//! └─────────────────────────────────────────────┘
//!          │                  │
//!          ▼                  ▼
//!   ShardRelocator    DistributionDiscoverer
//!   (your cluster)      (ground truth)
//! ```
//!
//! The queue layer stands alone: [`ConstrainedQueue`] with a custom
//! [`AdmissionPolicy`] works for any workload where items must wait for
//! capacity rather than be refused.

pub mod allocator;
pub mod config;
pub mod error;
pub mod queue;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use allocator::{
    DistributionDiscoverer, ShardAllocator, ShardRelocator, SplitBrainResolver,
};
pub use config::AllocatorConfig;
pub use error::{Error, Result};
pub use queue::{
    Admission, AdmissionPolicy, CardinalityPolicy, ConstrainedQueue, NodeConcurrencyPolicy,
};
pub use types::{Distribution, Relocation};
