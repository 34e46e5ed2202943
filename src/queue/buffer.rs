//! Bounded async buffer backing the queue's delegate and overflow stores.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Semaphore;

/// A capacity-bounded FIFO buffer with async push/pop.
///
/// Capacity is enforced with a pair of semaphores (space and availability)
/// so that producers block while the buffer is full and consumers block
/// while it is empty. Pass `usize::MAX` for an effectively unbounded
/// buffer.
///
/// The internal semaphores are never closed, so `push`/`pop` cannot fail;
/// shutdown is handled above this layer.
pub(crate) struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    space: Semaphore,
    avail: Semaphore,
}

impl<T> BoundedBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            space: Semaphore::new(capacity.min(Semaphore::MAX_PERMITS)),
            avail: Semaphore::new(0),
        }
    }

    /// Push, waiting for space.
    pub(crate) async fn push(&self, item: T) {
        let permit = self
            .space
            .acquire()
            .await
            .expect("buffer semaphore is never closed");
        permit.forget();
        self.items.lock().push_back(item);
        self.avail.add_permits(1);
    }

    /// Push without waiting; hands the item back when the buffer is full.
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        match self.space.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.items.lock().push_back(item);
                self.avail.add_permits(1);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Pop, waiting for an item.
    pub(crate) async fn pop(&self) -> T {
        let permit = self
            .avail
            .acquire()
            .await
            .expect("buffer semaphore is never closed");
        permit.forget();
        let item = self
            .items
            .lock()
            .pop_front()
            .expect("availability permit implies a buffered item");
        self.space.add_permits(1);
        item
    }

    /// Pop without waiting.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let permit = self.avail.try_acquire().ok()?;
        permit.forget();
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.space.add_permits(1);
        }
        item
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub(crate) fn remaining_capacity(&self) -> usize {
        self.space.available_permits()
    }

    /// Drop everything currently buffered.
    pub(crate) fn clear(&self) {
        while self.try_pop().is_some() {}
    }
}

impl<T: Clone> BoundedBuffer<T> {
    pub(crate) fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T: PartialEq> BoundedBuffer<T> {
    pub(crate) fn contains(&self, item: &T) -> bool {
        self.items.lock().contains(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_pop_roundtrip() {
        let buf = BoundedBuffer::new(4);
        buf.push(1u32).await;
        buf.push(2u32).await;
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.pop().await, 1);
        assert_eq!(buf.pop().await, 2);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_try_push_respects_capacity() {
        let buf = BoundedBuffer::new(1);
        assert!(buf.try_push(1u32).is_ok());
        assert_eq!(buf.try_push(2u32), Err(2));
        assert_eq!(buf.remaining_capacity(), 0);
        assert_eq!(buf.try_pop(), Some(1));
        assert!(buf.try_push(2u32).is_ok());
    }

    #[tokio::test]
    async fn test_blocked_push_resumes_after_pop() {
        let buf = Arc::new(BoundedBuffer::new(1));
        buf.push(1u32).await;

        let pusher = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.push(2u32).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        assert_eq!(buf.pop().await, 1);
        pusher.await.unwrap();
        assert_eq!(buf.pop().await, 2);
    }

    #[tokio::test]
    async fn test_clear_resets_capacity() {
        let buf = BoundedBuffer::new(2);
        buf.push(1u32).await;
        buf.push(2u32).await;
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining_capacity(), 2);
    }
}
