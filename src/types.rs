//! Core types used throughout the rebalancer.

use std::collections::{HashMap, HashSet};

/// Best-known ownership snapshot: which node currently holds which shards.
pub type Distribution<N, S> = HashMap<N, HashSet<S>>;

/// A directive moving a shard's ownership between nodes.
///
/// `from_node` is `None` when the shard is newly assigned (no prior owner
/// to release); `to_node` is `None` when the shard is being removed from
/// the universe (no new owner). The shard itself is always present.
///
/// Relocations are values: equality and hashing cover the full triple, so
/// the same logical move compares equal wherever it travels through the
/// admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relocation<N, S> {
    /// Node that must let go of the shard, if any.
    pub from_node: Option<N>,
    /// Node that must take ownership, if any.
    pub to_node: Option<N>,
    /// The shard being relocated.
    pub shard: S,
}

impl<N, S> Relocation<N, S> {
    /// Create a relocation with explicit endpoints.
    pub fn new(from_node: Option<N>, to_node: Option<N>, shard: S) -> Self {
        Self {
            from_node,
            to_node,
            shard,
        }
    }

    /// Move a shard between two live nodes.
    pub fn transfer(from: N, to: N, shard: S) -> Self {
        Self::new(Some(from), Some(to), shard)
    }

    /// Assign a previously unowned shard to a node.
    pub fn assign(to: N, shard: S) -> Self {
        Self::new(None, Some(to), shard)
    }

    /// Remove a shard from the universe; the owner relinquishes it.
    pub fn remove(from: N, shard: S) -> Self {
        Self::new(Some(from), None, shard)
    }

    /// Iterate over the endpoints that actually reference a node.
    pub fn endpoints(&self) -> impl Iterator<Item = &N> {
        self.from_node.iter().chain(self.to_node.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut h = DefaultHasher::new();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_equality_covers_full_triple() {
        let a = Relocation::transfer(1u64, 2u64, 7u64);
        let b = Relocation::transfer(1u64, 2u64, 7u64);
        let c = Relocation::transfer(2u64, 1u64, 7u64);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_assign_and_remove_endpoints() {
        let assign = Relocation::assign(3u64, 9u64);
        assert_eq!(assign.from_node, None);
        assert_eq!(assign.endpoints().count(), 1);

        let remove = Relocation::remove(3u64, 9u64);
        assert_eq!(remove.to_node, None);
        assert_eq!(remove.endpoints().collect::<Vec<_>>(), vec![&3u64]);

        let transfer = Relocation::transfer(1u64, 2u64, 9u64);
        assert_eq!(transfer.endpoints().count(), 2);
    }
}
