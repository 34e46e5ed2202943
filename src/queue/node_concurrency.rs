//! Admission policy bounding concurrent relocations per node.

use crate::queue::admission::{Admission, AdmissionPolicy};
use crate::types::Relocation;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

struct NodeState<N, S> {
    /// Relocations in flight per node. A node disappears from the map when
    /// its count returns to zero.
    active: HashMap<N, usize>,
    /// Multiset of relocations currently passed, so releasing something
    /// that was never admitted is a detectable no-op.
    admitted: HashMap<Relocation<N, S>, usize>,
    /// Blocked relocations, listed under every node they reference: the
    /// endpoint that is free now may be the saturated one by the time a
    /// slot opens.
    waitlists: HashMap<N, Vec<Relocation<N, S>>>,
    /// Distinct relocations currently waitlisted.
    held: usize,
}

impl<N, S> NodeState<N, S>
where
    N: Clone + Eq + Hash,
    S: Clone + Eq + Hash,
{
    fn saturated(&self, node: &N, max_per_node: usize) -> bool {
        self.active.get(node).copied().unwrap_or(0) >= max_per_node
    }

    /// A relocation is runnable only when neither endpoint is saturated.
    fn admissible(&self, relocation: &Relocation<N, S>, max_per_node: usize) -> bool {
        relocation
            .endpoints()
            .all(|node| !self.saturated(node, max_per_node))
    }

    fn increment(&mut self, node: &N) {
        *self.active.entry(node.clone()).or_insert(0) += 1;
    }

    fn decrement(&mut self, node: &N) {
        if let Some(count) = self.active.get(node).copied() {
            if count <= 1 {
                self.active.remove(node);
            } else {
                self.active.insert(node.clone(), count - 1);
            }
        }
    }

    fn mark_admitted(&mut self, relocation: &Relocation<N, S>) {
        for node in relocation.endpoints() {
            self.increment(node);
        }
        *self.admitted.entry(relocation.clone()).or_insert(0) += 1;
    }

    /// Remove one waitlist entry for `relocation` under `node`, dropping
    /// the node's list entirely once empty.
    fn unlist(&mut self, node: &N, relocation: &Relocation<N, S>) {
        if let Some(list) = self.waitlists.get_mut(node) {
            if let Some(pos) = list.iter().position(|r| r == relocation) {
                list.remove(pos);
            }
            if list.is_empty() {
                self.waitlists.remove(node);
            }
        }
    }
}

/// Admission policy allowing at most `max_per_node` concurrent relocations
/// to touch any single node, whether as source or destination.
///
/// Relocations are edges in a dependency graph over nodes; an edge runs
/// only while neither endpoint is saturated. Held relocations wait in
/// per-node lists and a single release can unblock up to two of them, one
/// through each freed endpoint. The waitlist has no hard cap, so admission
/// itself never blocks.
pub struct NodeConcurrencyPolicy<N, S> {
    max_per_node: usize,
    state: Mutex<NodeState<N, S>>,
}

impl<N, S> NodeConcurrencyPolicy<N, S>
where
    N: Clone + Eq + Hash,
    S: Clone + Eq + Hash,
{
    /// Create a policy with the given per-node concurrency bound.
    pub fn new(max_per_node: usize) -> Self {
        Self {
            max_per_node,
            state: Mutex::new(NodeState {
                active: HashMap::new(),
                admitted: HashMap::new(),
                waitlists: HashMap::new(),
                held: 0,
            }),
        }
    }

    /// Current in-flight count for a node, zero when idle.
    pub fn active_count(&self, node: &N) -> usize {
        self.state.lock().active.get(node).copied().unwrap_or(0)
    }

    fn decide(&self, relocation: Relocation<N, S>) -> Admission<Relocation<N, S>> {
        let mut state = self.state.lock();
        if state.admissible(&relocation, self.max_per_node) {
            state.mark_admitted(&relocation);
            Admission::Pass(relocation)
        } else {
            for node in relocation.endpoints() {
                state
                    .waitlists
                    .entry(node.clone())
                    .or_default()
                    .push(relocation.clone());
            }
            state.held += 1;
            Admission::Held
        }
    }

    /// Scan one node's waitlist for the first relocation that is now
    /// independently admissible and admit it.
    fn promote_for(
        &self,
        state: &mut NodeState<N, S>,
        node: &N,
    ) -> Option<Relocation<N, S>> {
        let candidate = state
            .waitlists
            .get(node)?
            .iter()
            .find(|r| state.admissible(r, self.max_per_node))
            .cloned()?;
        for endpoint in candidate.endpoints().cloned().collect::<Vec<_>>() {
            state.unlist(&endpoint, &candidate);
        }
        state.held -= 1;
        state.mark_admitted(&candidate);
        Some(candidate)
    }
}

#[async_trait]
impl<N, S> AdmissionPolicy<Relocation<N, S>> for NodeConcurrencyPolicy<N, S>
where
    N: Clone + Eq + Hash + Debug + Send + Sync,
    S: Clone + Eq + Hash + Debug + Send + Sync,
{
    async fn admit(&self, item: Relocation<N, S>) -> Admission<Relocation<N, S>> {
        // The waitlist is unbounded, so a decision is always immediate.
        self.decide(item)
    }

    fn try_admit(
        &self,
        item: Relocation<N, S>,
    ) -> Result<Admission<Relocation<N, S>>, Relocation<N, S>> {
        Ok(self.decide(item))
    }

    fn release(&self, item: &Relocation<N, S>) -> Vec<Relocation<N, S>> {
        let mut state = self.state.lock();
        match state.admitted.get(item).copied() {
            Some(count) if count > 1 => {
                state.admitted.insert(item.clone(), count - 1);
            }
            Some(_) => {
                state.admitted.remove(item);
            }
            None => {
                debug!(relocation = ?item, "ignoring release of a relocation that was never admitted");
                return Vec::new();
            }
        }
        for node in item.endpoints() {
            state.decrement(node);
        }

        // Each freed endpoint may unblock one waiter; the waiter's other
        // endpoint is re-checked since it may still be saturated.
        let mut released = Vec::new();
        for node in item.endpoints().cloned().collect::<Vec<_>>() {
            if let Some(promoted) = self.promote_for(&mut state, &node) {
                released.push(promoted);
            }
        }
        released
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.active.clear();
        state.admitted.clear();
        state.waitlists.clear();
        state.held = 0;
    }

    fn len(&self) -> usize {
        self.state.lock().held
    }

    fn is_empty(&self) -> bool {
        self.state.lock().held == 0
    }

    fn contains(&self, item: &Relocation<N, S>) -> bool {
        self.state
            .lock()
            .waitlists
            .values()
            .any(|list| list.contains(item))
    }

    fn remaining_capacity(&self) -> usize {
        usize::MAX
    }
}
