//! Pluggable admission policies for the constrained queue.

use async_trait::async_trait;

/// Outcome of an admission decision.
///
/// `Pass` hands the item back to the caller for delivery downstream; `Held`
/// means the policy has taken ownership of the item and will surface it
/// again from a later [`AdmissionPolicy::release`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// The item may proceed immediately.
    Pass(T),
    /// The policy is holding the item until capacity frees up.
    Held,
}

impl<T> Admission<T> {
    /// Whether the item passed straight through.
    pub fn is_pass(&self) -> bool {
        matches!(self, Admission::Pass(_))
    }
}

/// Gate deciding whether queue items proceed immediately or wait for
/// capacity.
///
/// An admission policy never permanently rejects an item: `admit` always
/// eventually either passes the item back or holds it. Policies track the
/// identity of everything they passed so that releasing an item that was
/// never admitted (or releasing one twice) is a detectable no-op rather
/// than silent counter corruption.
#[async_trait]
pub trait AdmissionPolicy<T>: Send + Sync {
    /// Decide on an item, waiting as long as needed for buffer space.
    ///
    /// Must be cancel-safe: no observable state changes before the
    /// decision commits, so callers may race this future against a
    /// deadline.
    async fn admit(&self, item: T) -> Admission<T>;

    /// Decide on an item without waiting. `Err` returns the item when no
    /// decision could be rendered immediately.
    fn try_admit(&self, item: T) -> Result<Admission<T>, T>;

    /// Note that a previously passed item is finished, returning any held
    /// items that its departure unblocks.
    ///
    /// Safe no-op for items that were never admitted.
    fn release(&self, item: &T) -> Vec<T>;

    /// Drop all held items and admission bookkeeping.
    fn clear(&self);

    /// Number of items currently held by the policy.
    fn len(&self) -> usize;

    /// Whether the policy holds no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the policy currently holds the given item.
    fn contains(&self, item: &T) -> bool;

    /// Remaining room for held items.
    fn remaining_capacity(&self) -> usize;
}
