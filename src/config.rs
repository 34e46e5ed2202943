//! Configuration for the rebalancing engine.

use crate::error::{Error, Result};
use crate::types::Distribution;
use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

/// Configuration for a [`ShardAllocator`](crate::ShardAllocator).
///
/// Built with the `with_*` methods and validated at engine construction;
/// an invalid configuration fails synchronously, no partially-built engine
/// is observable.
#[derive(Debug, Clone)]
pub struct AllocatorConfig<N, S> {
    /// Initial node universe. Must be non-empty.
    pub nodes: HashSet<N>,

    /// Initial shard universe. Must be non-empty.
    pub shards: HashSet<S>,

    /// Optional initial distribution. When absent, the first pass assigns
    /// every shard from scratch.
    pub initial_distribution: Option<Distribution<N, S>>,

    /// Maximum concurrent relocations touching any single node, whether as
    /// source or destination. Must be positive.
    pub max_relocations_per_node: usize,

    /// How long to wait for in-flight relocations after one of them fails,
    /// before moving on to re-discovery.
    pub relocation_grace: Duration,
}

impl<N, S> AllocatorConfig<N, S>
where
    N: Eq + Hash,
    S: Eq + Hash,
{
    /// Create a configuration with the given universes and defaults for
    /// everything else.
    pub fn new(
        nodes: impl IntoIterator<Item = N>,
        shards: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            shards: shards.into_iter().collect(),
            initial_distribution: None,
            max_relocations_per_node: 1,
            relocation_grace: Duration::from_secs(300),
        }
    }

    /// Seed the engine with an already-known distribution.
    pub fn with_initial_distribution(mut self, distribution: Distribution<N, S>) -> Self {
        self.initial_distribution = Some(distribution);
        self
    }

    /// Set the per-node relocation concurrency bound.
    pub fn with_max_relocations_per_node(mut self, max: usize) -> Self {
        self.max_relocations_per_node = max;
        self
    }

    /// Set the grace period granted to in-flight relocations after a
    /// failure truncates the batch.
    pub fn with_relocation_grace(mut self, grace: Duration) -> Self {
        self.relocation_grace = grace;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config(
                "node universe must not be empty".to_string(),
            ));
        }
        if self.shards.is_empty() {
            return Err(Error::Config(
                "shard universe must not be empty".to_string(),
            ));
        }
        if self.max_relocations_per_node == 0 {
            return Err(Error::Config(
                "max_relocations_per_node must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
