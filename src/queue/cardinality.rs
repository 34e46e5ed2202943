//! Reference admission policy bounding total in-flight items.

use crate::queue::admission::{Admission, AdmissionPolicy};
use crate::queue::buffer::BoundedBuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

struct CardinalityState<T> {
    /// Items currently passed and not yet released.
    in_flight: usize,
    /// Multiset of passed items, so double-release is detectable.
    passed: HashMap<T, usize>,
}

/// Admission policy that allows at most `max_released` items to be passed
/// concurrently, buffering up to `max_held` further items until releases
/// free capacity.
///
/// Unfair by design: held items are promoted in arbitrary order, FIFO is
/// not guaranteed.
pub struct CardinalityPolicy<T> {
    max_released: usize,
    held: BoundedBuffer<T>,
    state: Mutex<CardinalityState<T>>,
}

impl<T> CardinalityPolicy<T> {
    /// Create a policy holding at most `max_held` blocked items and
    /// passing at most `max_released` concurrent ones.
    pub fn new(max_held: usize, max_released: usize) -> Self {
        Self {
            max_released,
            held: BoundedBuffer::new(max_held),
            state: Mutex::new(CardinalityState {
                in_flight: 0,
                passed: HashMap::new(),
            }),
        }
    }
}

impl<T> CardinalityPolicy<T>
where
    T: Clone + Eq + Hash,
{
    /// Pass the item if the in-flight bound allows, otherwise hand it back
    /// for holding. Atomic with respect to releases.
    fn try_pass(&self, item: T) -> Result<T, T> {
        let mut state = self.state.lock();
        if state.in_flight < self.max_released {
            state.in_flight += 1;
            *state.passed.entry(item.clone()).or_insert(0) += 1;
            Ok(item)
        } else {
            Err(item)
        }
    }
}

#[async_trait]
impl<T> AdmissionPolicy<T> for CardinalityPolicy<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    async fn admit(&self, item: T) -> Admission<T> {
        match self.try_pass(item) {
            Ok(item) => Admission::Pass(item),
            // Blocks while the held buffer is full; nothing is recorded
            // until the push lands, so cancellation mid-wait is clean.
            Err(item) => {
                self.held.push(item).await;
                Admission::Held
            }
        }
    }

    fn try_admit(&self, item: T) -> Result<Admission<T>, T> {
        match self.try_pass(item) {
            Ok(item) => Ok(Admission::Pass(item)),
            Err(item) => match self.held.try_push(item) {
                Ok(()) => Ok(Admission::Held),
                Err(item) => Err(item),
            },
        }
    }

    fn release(&self, item: &T) -> Vec<T> {
        let mut state = self.state.lock();
        let count = match state.passed.get(item) {
            Some(count) => *count,
            None => {
                debug!("ignoring release of an item that was never admitted");
                return Vec::new();
            }
        };
        if count > 1 {
            state.passed.insert(item.clone(), count - 1);
        } else {
            state.passed.remove(item);
        }
        state.in_flight -= 1;

        if state.in_flight < self.max_released {
            if let Some(next) = self.held.try_pop() {
                state.in_flight += 1;
                *state.passed.entry(next.clone()).or_insert(0) += 1;
                return vec![next];
            }
        }
        Vec::new()
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.in_flight = 0;
        state.passed.clear();
        self.held.clear();
    }

    fn len(&self) -> usize {
        self.held.len()
    }

    fn is_empty(&self) -> bool {
        self.state.lock().in_flight == 0 && self.held.is_empty()
    }

    fn contains(&self, item: &T) -> bool {
        self.held.contains(item)
    }

    fn remaining_capacity(&self) -> usize {
        self.held.remaining_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_passes_up_to_max_released() {
        let policy = CardinalityPolicy::new(4, 2);
        assert!(policy.admit(1u32).await.is_pass());
        assert!(policy.admit(2u32).await.is_pass());
        assert_eq!(policy.admit(3u32).await, Admission::Held);
        assert_eq!(policy.len(), 1);
    }

    #[tokio::test]
    async fn test_release_promotes_exactly_one() {
        let policy = CardinalityPolicy::new(4, 1);
        assert!(policy.admit(1u32).await.is_pass());
        assert_eq!(policy.admit(2u32).await, Admission::Held);
        assert_eq!(policy.admit(3u32).await, Admission::Held);

        let freed = policy.release(&1);
        assert_eq!(freed.len(), 1);
        assert_eq!(policy.len(), 1);

        // The promoted item is now in flight; nothing more until it too is
        // released.
        let freed_again = policy.release(&freed[0]);
        assert_eq!(freed_again.len(), 1);
        assert!(policy.release(&freed_again[0]).is_empty());
        assert!(policy.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_admit_is_noop() {
        let policy = CardinalityPolicy::new(4, 1);
        assert!(policy.release(&99u32).is_empty());
        // The bogus release must not have freed a slot.
        assert!(policy.admit(1u32).await.is_pass());
        assert_eq!(policy.admit(2u32).await, Admission::Held);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let policy = CardinalityPolicy::new(4, 2);
        assert!(policy.admit(1u32).await.is_pass());
        assert!(policy.release(&1).is_empty());
        assert!(policy.release(&1).is_empty());
        // Two slots must still be available.
        assert!(policy.admit(2u32).await.is_pass());
        assert!(policy.admit(3u32).await.is_pass());
    }

    #[tokio::test]
    async fn test_try_admit_fails_when_held_buffer_full() {
        let policy = CardinalityPolicy::new(1, 1);
        assert!(policy.try_admit(1u32).unwrap().is_pass());
        assert_eq!(policy.try_admit(2u32).unwrap(), Admission::Held);
        assert_eq!(policy.try_admit(3u32), Err(3));
    }

    #[tokio::test]
    async fn test_blocked_admit_resolves_after_release() {
        let policy = std::sync::Arc::new(CardinalityPolicy::new(1, 1));
        assert!(policy.admit(1u32).await.is_pass());
        assert_eq!(policy.admit(2u32).await, Admission::Held);

        let blocked = {
            let policy = policy.clone();
            tokio::spawn(async move { policy.admit(3u32).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Releasing promotes the buffered item and frees buffer space for
        // the blocked admit.
        let freed = policy.release(&1);
        assert_eq!(freed, vec![2]);
        assert_eq!(blocked.await.unwrap(), Admission::Held);
    }

    #[tokio::test]
    async fn test_clear_resets_all_state() {
        let policy = CardinalityPolicy::new(2, 1);
        assert!(policy.admit(1u32).await.is_pass());
        assert_eq!(policy.admit(2u32).await, Admission::Held);
        policy.clear();
        assert!(policy.is_empty());
        assert!(policy.admit(3u32).await.is_pass());
    }
}
