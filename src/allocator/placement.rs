//! Pass planning: load indexing and the greedy balancing algorithm.

use crate::allocator::SplitBrainResolver;
use crate::types::{Distribution, Relocation};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, warn};

/// Nodes indexed by how many shards they own.
///
/// Backs both the balancing loop and the split-brain resolver callback.
/// Ties between nodes with equal counts are broken arbitrarily.
#[derive(Debug, Clone, Default)]
pub struct CountIndex<N> {
    counts: HashMap<N, usize>,
    by_count: BTreeMap<usize, Vec<N>>,
}

impl<N> CountIndex<N>
where
    N: Clone + Eq + Hash,
{
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            by_count: BTreeMap::new(),
        }
    }

    /// Record a node with its current shard count, replacing any previous
    /// entry.
    pub fn insert(&mut self, node: N, count: usize) {
        self.detach(&node);
        self.counts.insert(node.clone(), count);
        self.by_count.entry(count).or_default().push(node);
    }

    /// Number of indexed nodes.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the index has no nodes.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Shard count for a node, if indexed.
    pub fn count_of(&self, node: &N) -> Option<usize> {
        self.counts.get(node).copied()
    }

    /// A node owning the fewest shards.
    pub fn least_loaded(&self) -> Option<(N, usize)> {
        let (count, nodes) = self.by_count.iter().next()?;
        nodes.first().map(|node| (node.clone(), *count))
    }

    /// A node owning the most shards.
    pub fn most_loaded(&self) -> Option<(N, usize)> {
        let (count, nodes) = self.by_count.iter().next_back()?;
        nodes.last().map(|node| (node.clone(), *count))
    }

    /// Move a node one count up, indexing it at one if absent.
    pub fn increment(&mut self, node: &N) {
        let count = self.count_of(node).unwrap_or(0);
        self.insert(node.clone(), count + 1);
    }

    /// Move a node one count down; unindexed nodes are ignored.
    pub fn decrement(&mut self, node: &N) {
        if let Some(count) = self.count_of(node) {
            self.insert(node.clone(), count.saturating_sub(1));
        }
    }

    fn detach(&mut self, node: &N) {
        if let Some(count) = self.counts.remove(node) {
            if let Some(nodes) = self.by_count.get_mut(&count) {
                nodes.retain(|n| n != node);
                if nodes.is_empty() {
                    self.by_count.remove(&count);
                }
            }
        }
    }
}

/// The engine's mutable view of the cluster.
pub(crate) struct AllocationState<N, S> {
    pub nodes: HashSet<N>,
    pub shards: HashSet<S>,
    pub distribution: Distribution<N, S>,
}

/// Result of one planning run.
pub(crate) struct RebalancePlan<N, S> {
    /// Moves to execute, in planning order.
    pub relocations: Vec<Relocation<N, S>>,
    /// Shards found with more than one claimant. When the resolver acted
    /// on any of them, the plan contains only resolver moves and balancing
    /// waits for the next pass; disputes the resolver declined stay parked
    /// in place while the rest of the pass proceeds.
    pub conflicts: usize,
}

/// Apply a computed move to the in-memory distribution and index.
///
/// Moves are applied as they are planned, not as they execute; discovery
/// after the batch replaces this bookkeeping with ground truth.
fn apply_move<N, S>(
    state: &mut AllocationState<N, S>,
    index: &mut CountIndex<N>,
    relocation: &Relocation<N, S>,
) where
    N: Clone + Eq + Hash,
    S: Clone + Eq + Hash,
{
    if let Some(from) = &relocation.from_node {
        if let Some(owned) = state.distribution.get_mut(from) {
            if owned.remove(&relocation.shard) {
                index.decrement(from);
            }
        }
    }
    if let Some(to) = &relocation.to_node {
        if state
            .distribution
            .entry(to.clone())
            .or_default()
            .insert(relocation.shard.clone())
        {
            index.increment(to);
        }
    }
}

/// Compute the moves that converge the current state toward a balanced,
/// conflict-free distribution.
pub(crate) fn compute_plan<N, S>(
    state: &mut AllocationState<N, S>,
    resolver: &dyn SplitBrainResolver<N, S>,
) -> RebalancePlan<N, S>
where
    N: Clone + Eq + Hash + Debug,
    S: Clone + Eq + Hash + Debug,
{
    let mut relocations = Vec::new();

    // Every universe node gets an entry so empty nodes are eligible
    // targets.
    for node in &state.nodes {
        state.distribution.entry(node.clone()).or_default();
    }

    // Leavers are assumed to have relinquished ownership already.
    let universe = state.nodes.clone();
    state.distribution.retain(|node, _| universe.contains(node));

    // Shards dropped from the universe get an explicit removal move.
    for (node, owned) in state.distribution.iter_mut() {
        let stale: Vec<S> = owned
            .iter()
            .filter(|shard| !state.shards.contains(*shard))
            .cloned()
            .collect();
        for shard in stale {
            owned.remove(&shard);
            relocations.push(Relocation::remove(node.clone(), shard));
        }
    }

    let mut index = CountIndex::new();
    for (node, owned) in &state.distribution {
        index.insert(node.clone(), owned.len());
    }

    // Split-brain check: group shards by claimant set and resolve each
    // conflict once. If the resolver produced moves, the pass executes
    // only those and balancing waits for the next one; declined disputes
    // are parked and the pass carries on without them.
    let mut claimants: HashMap<S, HashSet<N>> = HashMap::new();
    for (node, owned) in &state.distribution {
        for shard in owned {
            claimants
                .entry(shard.clone())
                .or_default()
                .insert(node.clone());
        }
    }
    let mut conflicts = 0;
    let mut resolver_moves = 0;
    let mut parked: Vec<(N, S)> = Vec::new();
    for (shard, owners) in claimants {
        if owners.len() < 2 {
            continue;
        }
        conflicts += 1;
        warn!(shard = ?shard, owners = ?owners, "shard has multiple claimants");
        let moves = resolver.resolve(&shard, &owners, &index);
        if moves.is_empty() {
            // The resolver accepted the dispute. Park the shard where it
            // is and take its claims out of the load counts, so the rest
            // of the pass balances the undisputed shards over a
            // consistent total.
            for owner in &owners {
                if let Some(owned) = state.distribution.get_mut(owner) {
                    if owned.remove(&shard) {
                        index.decrement(owner);
                        parked.push((owner.clone(), shard.clone()));
                    }
                }
            }
            continue;
        }
        resolver_moves += moves.len();
        for relocation in moves {
            apply_move(state, &mut index, &relocation);
            relocations.push(relocation);
        }
    }
    if resolver_moves > 0 {
        // Balancing waits for the next pass; put any parked claims back
        // so the cached distribution keeps telling the truth.
        for (owner, shard) in parked {
            state.distribution.entry(owner).or_default().insert(shard);
        }
        debug!(
            conflicts,
            moves = relocations.len(),
            "resolving split-brain before balancing"
        );
        return RebalancePlan {
            relocations,
            conflicts,
        };
    }
    let parked_shards: HashSet<S> = parked.iter().map(|(_, shard)| shard.clone()).collect();

    // Unowned shards go to whoever currently holds the least.
    let owned: HashSet<S> = state
        .distribution
        .values()
        .flat_map(|shards| shards.iter().cloned())
        .collect();
    let unowned: Vec<S> = state
        .shards
        .difference(&owned)
        .filter(|shard| !parked_shards.contains(*shard))
        .cloned()
        .collect();
    for shard in unowned {
        let Some((target, _)) = index.least_loaded() else {
            warn!(shard = ?shard, "no nodes available to assign shard");
            break;
        };
        let relocation = Relocation::assign(target, shard);
        apply_move(state, &mut index, &relocation);
        relocations.push(relocation);
    }

    // Even the load: shuffle one shard at a time from the most- to the
    // least-loaded node. Every move strictly shrinks total imbalance, so
    // this terminates.
    if !state.nodes.is_empty() {
        let settled = state.shards.len() - parked_shards.len();
        let mean = settled as f64 / state.nodes.len() as f64;
        let high = mean.ceil() as usize;
        let low = mean.floor() as usize;
        loop {
            let Some((most, most_count)) = index.most_loaded() else {
                break;
            };
            let Some((least, least_count)) = index.least_loaded() else {
                break;
            };
            if most_count <= high && least_count >= low {
                break;
            }
            let Some(shard) = state
                .distribution
                .get(&most)
                .and_then(|owned| owned.iter().next().cloned())
            else {
                break;
            };
            let relocation = Relocation::transfer(most, least, shard);
            apply_move(state, &mut index, &relocation);
            relocations.push(relocation);
        }
    }

    // Put parked claims back; the cached distribution must keep telling
    // the truth about the dispute.
    for (owner, shard) in parked {
        state.distribution.entry(owner).or_default().insert(shard);
    }

    RebalancePlan {
        relocations,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Resolver that keeps the shard on the least-loaded claimant and has
    /// every other claimant relinquish it.
    struct KeepLeastLoaded {
        calls: Mutex<Vec<(u64, HashSet<u64>)>>,
    }

    impl KeepLeastLoaded {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
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
                .copied()
                .expect("claimant set is never empty");
            claimants
                .iter()
                .filter(|node| **node != winner)
                .map(|loser| Relocation::remove(*loser, *shard))
                .collect()
        }
    }

    fn state(
        nodes: impl IntoIterator<Item = u64>,
        shards: impl IntoIterator<Item = u64>,
        distribution: &[(u64, &[u64])],
    ) -> AllocationState<u64, u64> {
        AllocationState {
            nodes: nodes.into_iter().collect(),
            shards: shards.into_iter().collect(),
            distribution: distribution
                .iter()
                .map(|(node, owned)| (*node, owned.iter().copied().collect()))
                .collect(),
        }
    }

    fn assert_balanced(state: &AllocationState<u64, u64>) {
        let nodes = state.nodes.len();
        let shards = state.shards.len();
        let low = shards / nodes;
        let high = low + usize::from(shards % nodes != 0);
        let mut seen = HashSet::new();
        let mut at_high = 0;
        for node in &state.nodes {
            let owned = state.distribution.get(node).expect("node has an entry");
            assert!(
                owned.len() == low || owned.len() == high,
                "node {node} holds {} shards, expected {low} or {high}",
                owned.len()
            );
            if owned.len() == high && high != low {
                at_high += 1;
            }
            for shard in owned {
                assert!(seen.insert(*shard), "shard {shard} owned twice");
            }
        }
        if high != low {
            assert_eq!(at_high, shards % nodes, "wrong number of ceiling nodes");
        }
        assert_eq!(seen, state.shards, "ownership does not cover the universe");
    }

    #[test]
    fn test_initial_assignment_balances() {
        let mut st = state(0..3, 0..6, &[]);
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert_eq!(plan.conflicts, 0);
        assert_eq!(plan.relocations.len(), 6);
        assert!(plan.relocations.iter().all(|r| r.from_node.is_none()));
        assert_balanced(&st);
    }

    #[test]
    fn test_balanced_distribution_needs_no_moves() {
        let mut st = state(
            0..3,
            0..9,
            &[(0, &[0, 1, 2]), (1, &[3, 4, 5]), (2, &[6, 7, 8])],
        );
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert!(plan.relocations.is_empty());
        assert_eq!(plan.conflicts, 0);
    }

    #[test]
    fn test_overloaded_node_sheds_to_least_loaded() {
        let mut st = state(
            0..3,
            0..9,
            &[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7]), (2, &[8])],
        );
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert_eq!(plan.relocations.len(), 2);
        assert!(plan
            .relocations
            .iter()
            .all(|r| r.to_node == Some(2) && r.from_node.is_some()));
        assert_balanced(&st);
    }

    #[test]
    fn test_shard_outside_universe_gets_removal_move() {
        let mut st = state(0..2, 0..4, &[(0, &[0, 1, 9]), (1, &[2, 3])]);
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert_eq!(plan.relocations, vec![Relocation::remove(0, 9)]);
        assert!(!st.distribution[&0].contains(&9));
    }

    #[test]
    fn test_leaver_dropped_and_its_shards_reassigned() {
        let mut st = state(0..2, 0..4, &[(0, &[0, 1]), (1, &[2]), (7, &[3])]);
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert!(!st.distribution.contains_key(&7));
        // Shard 3 is unowned once the leaver is dropped; it lands on the
        // least-loaded live node.
        assert_eq!(plan.relocations, vec![Relocation::assign(1, 3)]);
        assert_balanced(&st);
    }

    #[test]
    fn test_new_node_gets_zero_entry_and_receives_load() {
        let mut st = state(0..3, 0..6, &[(0, &[0, 1, 2]), (1, &[3, 4, 5])]);
        let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
        assert_eq!(plan.relocations.len(), 2);
        assert!(plan.relocations.iter().all(|r| r.to_node == Some(2)));
        assert_balanced(&st);
    }

    #[test]
    fn test_split_brain_resolved_before_balancing() {
        // Shard 0 claimed by nodes 0 and 1; node 2 is empty, so balancing
        // would normally move something there, but conflicts come first.
        let resolver = KeepLeastLoaded::new();
        let mut st = state(0..3, 0..5, &[(0, &[0, 1, 2]), (1, &[0, 3, 4]), (2, &[])]);
        let plan = compute_plan(&mut st, &resolver);
        assert_eq!(plan.conflicts, 1);

        let calls = resolver.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[0].1, HashSet::from([0, 1]));

        // Only resolver moves in this plan, and the shard has one owner
        // afterwards.
        assert_eq!(plan.relocations.len(), 1);
        let owners: Vec<u64> = st
            .distribution
            .iter()
            .filter(|(_, owned)| owned.contains(&0))
            .map(|(node, _)| *node)
            .collect();
        assert_eq!(owners.len(), 1);
    }

    /// Resolver that accepts every dispute as-is.
    struct AcceptDispute;

    impl SplitBrainResolver<u64, u64> for AcceptDispute {
        fn resolve(
            &self,
            _shard: &u64,
            _claimants: &HashSet<u64>,
            _index: &CountIndex<u64>,
        ) -> Vec<Relocation<u64, u64>> {
            Vec::new()
        }
    }

    #[test]
    fn test_passive_resolver_still_assigns_and_evens() {
        // Shard 0 is claimed by nodes 0 and 1 and the resolver declines to
        // act; shard 5 is unowned and node 0 is overloaded. The dispute is
        // parked, everything else still gets balanced.
        let mut st = state(0..3, 0..6, &[(0, &[0, 1, 2, 3, 4]), (1, &[0]), (2, &[])]);
        let plan = compute_plan(&mut st, &AcceptDispute);
        assert_eq!(plan.conflicts, 1);
        assert_eq!(plan.relocations.len(), 3);

        // The unowned shard found a home and no move touched the disputed
        // shard.
        assert!(st.distribution.values().any(|owned| owned.contains(&5)));
        assert!(plan.relocations.iter().all(|r| r.shard != 0));

        // Both claims on shard 0 are still recorded.
        let claimants = st
            .distribution
            .values()
            .filter(|owned| owned.contains(&0))
            .count();
        assert_eq!(claimants, 2);

        // The five undisputed shards are spread evenly (floor 1, ceil 2).
        for node in &st.nodes {
            let settled = st.distribution[node]
                .iter()
                .filter(|shard| **shard != 0)
                .count();
            assert!((1..=2).contains(&settled), "node {node} holds {settled}");
        }
    }

    #[test]
    fn test_count_index_ordering() {
        let mut index = CountIndex::new();
        index.insert(0u64, 3);
        index.insert(1u64, 0);
        index.insert(2u64, 5);
        assert_eq!(index.least_loaded(), Some((1, 0)));
        assert_eq!(index.most_loaded(), Some((2, 5)));

        index.increment(&1);
        index.decrement(&2);
        assert_eq!(index.count_of(&1), Some(1));
        assert_eq!(index.count_of(&2), Some(4));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_random_states_converge_to_balance() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let node_count = rng.gen_range(1..10u64);
            let shard_count = rng.gen_range(0..60u64);
            let mut dist: Vec<(u64, Vec<u64>)> =
                (0..node_count).map(|n| (n, Vec::new())).collect();
            for shard in 0..shard_count {
                // Some shards start unowned, the rest on a random node.
                if rng.gen_bool(0.8) {
                    let node = rng.gen_range(0..node_count) as usize;
                    dist[node].1.push(shard);
                }
            }
            let mut st = AllocationState {
                nodes: (0..node_count).collect(),
                shards: (0..shard_count).collect(),
                distribution: dist
                    .into_iter()
                    .map(|(node, owned)| (node, owned.into_iter().collect()))
                    .collect(),
            };
            let plan = compute_plan(&mut st, &KeepLeastLoaded::new());
            assert_eq!(plan.conflicts, 0);
            if st.shards.is_empty() {
                continue;
            }
            assert_balanced(&st);
        }
    }
}
