//! In-memory mock cluster for exercising the allocator.

use crate::allocator::{
    CountIndex, DistributionDiscoverer, ShardRelocator, SplitBrainResolver,
};
use crate::error::{Error, Result};
use crate::types::{Distribution, Relocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A fake cluster whose distribution is mutated by its own relocator and
/// served back by its discoverer, with call counters for assertions.
#[derive(Default)]
pub struct MockCluster {
    distribution: Mutex<Distribution<u64, u64>>,
    move_count: AtomicUsize,
    discovery_count: AtomicUsize,
    fail_remaining: AtomicUsize,
    relocation_delay: Mutex<Duration>,
}

impl MockCluster {
    /// Start with the given distribution.
    pub fn new(distribution: Distribution<u64, u64>) -> Self {
        Self {
            distribution: Mutex::new(distribution),
            ..Default::default()
        }
    }

    /// Snapshot of the current distribution.
    pub fn distribution(&self) -> Distribution<u64, u64> {
        self.distribution.lock().clone()
    }

    /// Replace the distribution out from under the allocator.
    pub fn set_distribution(&self, distribution: Distribution<u64, u64>) {
        *self.distribution.lock() = distribution;
    }

    /// Relocations performed so far.
    pub fn move_count(&self) -> usize {
        self.move_count.load(Ordering::Acquire)
    }

    /// Discovery queries served so far.
    pub fn discovery_count(&self) -> usize {
        self.discovery_count.load(Ordering::Acquire)
    }

    /// Make the next `count` relocations fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::Release);
    }

    /// Make every relocation sleep before taking effect, so tests can
    /// observe the engine mid-batch.
    pub fn set_relocation_delay(&self, delay: Duration) {
        *self.relocation_delay.lock() = delay;
    }
}

#[async_trait]
impl DistributionDiscoverer<u64, u64> for MockCluster {
    async fn discover_distribution(&self) -> Distribution<u64, u64> {
        self.discovery_count.fetch_add(1, Ordering::AcqRel);
        self.distribution()
    }
}

#[async_trait]
impl ShardRelocator<u64, u64> for MockCluster {
    async fn relocate(&self, relocation: &Relocation<u64, u64>) -> Result<()> {
        let delay = *self.relocation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::Relocation("injected failure".to_string()));
        }
        let mut distribution = self.distribution.lock();
        if let Some(from) = relocation.from_node {
            if let Some(owned) = distribution.get_mut(&from) {
                owned.remove(&relocation.shard);
            }
        }
        if let Some(to) = relocation.to_node {
            distribution.entry(to).or_default().insert(relocation.shard);
        }
        self.move_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Resolver that keeps a disputed shard on its least-loaded claimant and
/// has every other claimant relinquish it.
#[derive(Default)]
pub struct KeepLeastLoaded {
    calls: Mutex<Vec<(u64, HashSet<u64>)>>,
}

impl KeepLeastLoaded {
    /// Shards and claimant sets this resolver was asked about.
    pub fn calls(&self) -> Vec<(u64, HashSet<u64>)> {
        self.calls.lock().clone()
    }
}

impl SplitBrainResolver<u64, u64> for KeepLeastLoaded {
    fn resolve(
        &self,
        shard: &u64,
        claimants: &HashSet<u64>,
        index: &CountIndex<u64>,
    ) -> Vec<Relocation<u64, u64>> {
        self.calls.lock().push((*shard, claimants.clone()));
        let winner = claimants
            .iter()
            .min_by_key(|node| index.count_of(node).unwrap_or(0))
            .copied();
        let Some(winner) = winner else {
            return Vec::new();
        };
        claimants
            .iter()
            .filter(|node| **node != winner)
            .map(|loser| Relocation::remove(*loser, *shard))
            .collect()
    }
}

/// Assert the distribution is balanced over the given universes: every
/// node holds `floor(s/n)` or `ceil(s/n)` shards, exactly `s mod n` nodes
/// hold the ceiling, ownership is disjoint, and the union covers the
/// shard universe.
pub fn assert_balanced(
    distribution: &Distribution<u64, u64>,
    nodes: &HashSet<u64>,
    shards: &HashSet<u64>,
) {
    let node_count = nodes.len();
    let shard_count = shards.len();
    let low = shard_count / node_count;
    let high = low + usize::from(shard_count % node_count != 0);

    let empty = HashSet::new();
    let mut seen = HashSet::new();
    let mut at_high = 0;
    for node in nodes {
        let owned = distribution.get(node).unwrap_or(&empty);
        assert!(
            owned.len() == low || owned.len() == high,
            "node {node} holds {} shards, expected {low} or {high}",
            owned.len()
        );
        if high != low && owned.len() == high {
            at_high += 1;
        }
        for shard in owned {
            assert!(seen.insert(*shard), "shard {shard} owned by multiple nodes");
        }
    }
    if high != low {
        assert_eq!(
            at_high,
            shard_count % node_count,
            "wrong number of nodes at ceiling load"
        );
    }
    assert_eq!(&seen, shards, "ownership does not cover the shard universe");
}
