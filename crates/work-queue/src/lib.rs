//! Multi-level FIFO work queue used to hand work items between pipeline stages.
//!
//! A [`PriorityQueue`] holds `L` independent FIFO levels. Level 0 has the
//! highest precedence: [`PriorityQueue::get`] always drains every item of a
//! lower-numbered level before it returns anything from a higher-numbered
//! one. Within a level, items keep their insertion order.
//!
//! The queue is unbounded, `put` never blocks, and `get` waits on a
//! [`tokio::sync::Notify`] until an item shows up. Many producers and many
//! consumers may share one queue behind an `Arc`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors raised while building a queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("a priority queue needs at least one level")]
    NoLevels,
}

/// Process-safe, multi-level FIFO queue.
pub struct PriorityQueue<T> {
    levels: Mutex<Vec<VecDeque<T>>>,
    level_count: usize,
    notify: Notify,
}

impl<T> PriorityQueue<T> {
    /// Create a queue with `levels` priority levels.
    ///
    /// A level count of zero is clamped to one; use [`PriorityQueue::try_new`]
    /// to reject it instead.
    pub fn new(levels: usize) -> Self {
        let level_count = levels.max(1);
        Self {
            levels: Mutex::new((0..level_count).map(|_| VecDeque::new()).collect()),
            level_count,
            notify: Notify::new(),
        }
    }

    /// Create a queue, rejecting a zero level count.
    pub fn try_new(levels: usize) -> Result<Self, QueueError> {
        if levels == 0 {
            return Err(QueueError::NoLevels);
        }
        Ok(Self::new(levels))
    }

    /// Number of priority levels.
    pub fn levels(&self) -> usize {
        self.level_count
    }

    /// Level used when the caller does not name one.
    pub fn lowest_level(&self) -> usize {
        self.level_count - 1
    }

    /// Append `item` to the tail of `level` (lowest priority when `None`).
    ///
    /// Levels past the last one are clamped to the lowest priority level.
    /// Returns the level the item was actually stored at.
    pub fn put(&self, item: T, level: Option<usize>) -> usize {
        let level = level
            .unwrap_or(self.lowest_level())
            .min(self.lowest_level());
        self.levels.lock()[level].push_back(item);
        self.notify.notify_one();
        level
    }

    /// Remove and return the head of the lowest-numbered non-empty level.
    pub fn try_get(&self) -> Option<T> {
        let mut levels = self.levels.lock();
        let item = levels.iter_mut().find_map(VecDeque::pop_front);
        let more = levels.iter().any(|l| !l.is_empty());
        drop(levels);

        // Hand the wake-up on so a second waiter does not sleep on a non-empty queue.
        if item.is_some() && more {
            self.notify.notify_one();
        }
        item
    }

    /// Wait until an item is available, then remove and return it.
    ///
    /// Cancel safe: an item is only removed from the queue in the same
    /// synchronous step that returns it, so dropping this future never loses
    /// work.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Number of items waiting at `level` (0 for an unknown level).
    pub fn size(&self, level: usize) -> usize {
        self.levels.lock().get(level).map_or(0, VecDeque::len)
    }

    /// Number of items waiting across all levels.
    pub fn total_size(&self) -> usize {
        self.levels.lock().iter().map(VecDeque::len).sum()
    }

    /// Per-level snapshot of the queue depth.
    pub fn sizes(&self) -> Vec<usize> {
        self.levels.lock().iter().map(VecDeque::len).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.total_size() == 0
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("levels", &self.level_count)
            .field("sizes", &self.sizes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    #[test]
    fn test_try_new_rejects_zero_levels() {
        assert_eq!(
            PriorityQueue::<u32>::try_new(0).unwrap_err(),
            QueueError::NoLevels
        );
        assert_eq!(PriorityQueue::<u32>::new(0).levels(), 1);
    }

    #[test]
    fn test_default_level_is_lowest_priority() {
        let queue = PriorityQueue::new(3);
        assert_eq!(queue.put("a", None), 2);
        assert_eq!(queue.size(2), 1);
        assert_eq!(queue.size(0), 0);
    }

    #[test]
    fn test_out_of_range_level_is_clamped() {
        let queue = PriorityQueue::new(2);
        assert_eq!(queue.put(1, Some(7)), 1);
        assert_eq!(queue.sizes(), vec![0, 1]);
        assert_eq!(queue.size(9), 0);
    }

    #[test]
    fn test_level_precedence_and_fifo() {
        let queue = PriorityQueue::new(3);
        queue.put("low-1", Some(2));
        queue.put("mid-1", Some(1));
        queue.put("low-2", Some(2));
        queue.put("high-1", Some(0));
        queue.put("mid-2", Some(1));

        assert_eq!(queue.total_size(), 5);
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_get()).collect();
        assert_eq!(drained, vec!["high-1", "mid-1", "mid-2", "low-1", "low-2"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(PriorityQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.put(42u32, None);
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake up")
            .unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn test_cancelled_get_does_not_lose_items() {
        let queue = PriorityQueue::new(2);
        let res = tokio::time::timeout(Duration::from_millis(10), queue.get()).await;
        assert!(res.is_err());

        queue.put(7u32, Some(0));
        assert_eq!(queue.total_size(), 1);
        assert_eq!(queue.get().await, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_and_consumers() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 250;

        let queue = Arc::new(PriorityQueue::new(3));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(item) =
                    tokio::time::timeout(Duration::from_millis(200), queue.get()).await
                {
                    seen.push(item);
                }
                seen
            }));
        }

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    queue.put(p * PER_PRODUCER + i, Some((i % 3) as usize));
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert_eq!(unique.len(), all.len());
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_delivery_is_level_ordered_and_fifo(
            puts in proptest::collection::vec(0usize..3, 0..64)
        ) {
            let queue = PriorityQueue::new(3);
            for (seq, level) in puts.iter().enumerate() {
                queue.put((*level, seq), Some(*level));
            }

            let drained: Vec<(usize, usize)> = std::iter::from_fn(|| queue.try_get()).collect();
            prop_assert_eq!(drained.len(), puts.len());
            for pair in drained.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                prop_assert!(a.0 <= b.0);
                if a.0 == b.0 {
                    prop_assert!(a.1 < b.1);
                }
            }
        }
    }
}
