//! Concurrency-limiting queue with pluggable admission.

use crate::error::{Error, Result};
use crate::queue::admission::{Admission, AdmissionPolicy};
use crate::queue::buffer::BoundedBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct DrainTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueueInner<T, P> {
    policy: P,
    /// Primary store items are taken from.
    delegate: BoundedBuffer<T>,
    /// Unbounded holding area for items that passed admission but found
    /// the delegate full.
    overflow: BoundedBuffer<T>,
    open: AtomicBool,
    drain: Mutex<Option<DrainTask>>,
}

/// A queue whose insertion is gated by an [`AdmissionPolicy`] and whose
/// release of one item may unblock others.
///
/// Items flow through three stores: the policy's own holding area, a
/// bounded delegate that `take`/`poll` read from, and an unbounded
/// overflow buffer for items admitted while the delegate was full. A
/// background task drains the overflow into the delegate so admission
/// decisions never deadlock against delegate capacity.
///
/// [`ConstrainedQueue::forget`] must be called exactly once per consumed
/// item; the policy learns about finished work only through it, and held
/// items behind a forgotten-about item would otherwise starve.
///
/// FIFO order is not guaranteed anywhere in the pipeline.
pub struct ConstrainedQueue<T, P> {
    inner: Arc<QueueInner<T, P>>,
}

impl<T, P> ConstrainedQueue<T, P>
where
    T: Send + Sync + 'static,
    P: AdmissionPolicy<T> + 'static,
{
    /// Create a queue over the given policy, with a delegate store bounded
    /// at `delegate_capacity` (`usize::MAX` for effectively unbounded).
    ///
    /// Spawns the overflow drain task; must be called within a tokio
    /// runtime.
    pub fn new(policy: P, delegate_capacity: usize) -> Self {
        let inner = Arc::new(QueueInner {
            policy,
            delegate: BoundedBuffer::new(delegate_capacity),
            overflow: BoundedBuffer::new(usize::MAX),
            open: AtomicBool::new(true),
            drain: Mutex::new(None),
        });
        let queue = Self { inner };
        queue.spawn_drain();
        queue
    }

    fn spawn_drain(&self) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = task_token.cancelled() => break,
                    item = inner.overflow.pop() => item,
                };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = inner.delegate.push(item) => {}
                }
            }
            debug!("overflow drain task stopped");
        });
        *self.inner.drain.lock() = Some(DrainTask { token, handle });
    }

    /// Route a passed item to the delegate, spilling into the overflow
    /// buffer when the delegate is full.
    fn deliver(&self, item: T) {
        if let Err(item) = self.inner.delegate.try_push(item) {
            // Overflow capacity is effectively unbounded; a failed push
            // there means someone is clearing, and dropping is documented.
            let _ = self.inner.overflow.try_push(item);
        }
    }

    /// Insert an item, waiting as long as the policy needs to decide.
    pub async fn put(&self, item: T) -> Result<()> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match self.inner.policy.admit(item).await {
            Admission::Pass(item) => self.deliver(item),
            Admission::Held => {}
        }
        Ok(())
    }

    /// Insert without waiting. Returns `false` when the policy could not
    /// decide immediately (the item is dropped) or the queue is closed.
    pub fn offer(&self, item: T) -> bool {
        if !self.inner.open.load(Ordering::Acquire) {
            return false;
        }
        match self.inner.policy.try_admit(item) {
            Ok(Admission::Pass(item)) => {
                self.deliver(item);
                true
            }
            Ok(Admission::Held) => true,
            Err(_item) => false,
        }
    }

    /// Insert with a deadline on the admission decision.
    ///
    /// Fails with [`Error::Timeout`] when no decision was reached in time;
    /// the item is dropped. Admission is cancel-safe, so an expired
    /// attempt leaves no residue in the policy.
    pub async fn offer_timeout(&self, item: T, timeout: Duration) -> Result<()> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match tokio::time::timeout(timeout, self.inner.policy.admit(item)).await {
            Ok(Admission::Pass(item)) => {
                self.deliver(item);
                Ok(())
            }
            Ok(Admission::Held) => Ok(()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Remove the next deliverable item, waiting for one.
    pub async fn take(&self) -> T {
        self.inner.delegate.pop().await
    }

    /// Remove the next deliverable item if one is ready.
    pub fn poll(&self) -> Option<T> {
        self.inner.delegate.try_pop()
    }

    /// Remove the next deliverable item, waiting up to `timeout`.
    pub async fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.inner.delegate.pop())
            .await
            .ok()
    }

    /// Release a finished item through the policy, delivering anything it
    /// unblocks.
    ///
    /// Must be called exactly once per consumed item. Releasing an item
    /// the policy never admitted is a safe no-op.
    pub fn forget(&self, item: &T) {
        for freed in self.inner.policy.release(item) {
            self.deliver(freed);
        }
    }

    /// Items across all three stores: policy-held, delegate, overflow.
    pub fn len(&self) -> usize {
        self.inner.policy.len() + self.inner.delegate.len() + self.inner.overflow.len()
    }

    /// True when no item is held, deliverable, or in flight through the
    /// policy.
    pub fn is_empty(&self) -> bool {
        self.inner.policy.is_empty()
            && self.inner.delegate.is_empty()
            && self.inner.overflow.is_empty()
    }

    /// Remaining admission plus delegate capacity, saturating.
    pub fn remaining_capacity(&self) -> usize {
        self.inner
            .policy
            .remaining_capacity()
            .saturating_add(self.inner.delegate.remaining_capacity())
    }

    /// Empty all three stores. Best-effort: items entering concurrently
    /// may be dropped.
    pub fn clear(&self) {
        self.inner.policy.clear();
        self.inner.delegate.clear();
        self.inner.overflow.clear();
    }

    /// Stop accepting items, drop queued state, and stop the drain task,
    /// waiting until it acknowledges termination.
    ///
    /// Already-consumed items may still be `forget`ten afterwards; blocked
    /// `take` callers stay blocked until the queue is reopened.
    pub async fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.clear();
        let task = self.inner.drain.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if task.handle.await.is_err() {
                debug!("overflow drain task aborted during close");
            }
        }
    }

    /// Reopen a closed queue, restarting the drain task.
    pub fn open(&self) {
        if !self.inner.open.swap(true, Ordering::AcqRel) {
            self.spawn_drain();
        }
    }
}

impl<T, P> ConstrainedQueue<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: AdmissionPolicy<T> + 'static,
{
    /// Look at the next deliverable item without removing it.
    pub fn peek(&self) -> Option<T> {
        self.inner.delegate.peek()
    }
}

impl<T, P> ConstrainedQueue<T, P>
where
    T: PartialEq + Send + Sync + 'static,
    P: AdmissionPolicy<T> + 'static,
{
    /// Whether the item sits in any of the three stores.
    pub fn contains(&self, item: &T) -> bool {
        self.inner.delegate.contains(item)
            || self.inner.overflow.contains(item)
            || self.inner.policy.contains(item)
    }
}

impl<T, P> Drop for ConstrainedQueue<T, P> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.drain.lock().take() {
            task.token.cancel();
            task.handle.abort();
        }
    }
}
