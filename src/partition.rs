//! Splitting a dispatch batch into per-worker shards.

use std::ops::Range;

use tracing::debug;

use crate::types::{DispatchBatch, Message};

/// A contiguous run of messages owned by one producer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Index of the worker that publishes this shard
    pub worker: usize,
    /// Messages in batch order
    pub messages: Vec<Message>,
}

/// How a batch of `total` messages is laid out across workers.
///
/// Every shard holds `ceil(total / workers)` messages except possibly the
/// last. Would-be shards starting past the end of the batch are not created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    total: usize,
    workers: usize,
    shard_size: usize,
}

impl ShardPlan {
    /// Plan a batch of `total` messages across `workers` (0 is treated as 1).
    pub fn new(total: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            total,
            workers,
            shard_size: total.div_ceil(workers),
        }
    }

    /// Messages per shard (the last shard may hold fewer).
    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Index ranges of the non-empty shards, in batch order.
    pub fn ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.workers.min(self.total));
        for worker in 0..self.workers {
            let start = worker * self.shard_size;
            if start >= self.total {
                break;
            }
            let end = (start + self.shard_size).min(self.total);
            ranges.push(start..end);
        }
        ranges
    }
}

/// Split a batch into non-empty shards covering it exactly, in order.
pub fn partition(batch: DispatchBatch) -> Vec<Shard> {
    let plan = ShardPlan::new(batch.len(), batch.workers());
    let ranges = plan.ranges();

    debug!(
        total = batch.len(),
        workers = batch.workers(),
        shard_size = plan.shard_size(),
        shards = ranges.len(),
        skipped = batch.workers() - ranges.len(),
        "Partitioned batch"
    );

    let mut messages = batch.into_messages().into_iter();
    ranges
        .into_iter()
        .enumerate()
        .map(|(worker, range)| Shard {
            worker,
            messages: messages.by_ref().take(range.len()).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn batch(contents: &[&str], workers: i64) -> DispatchBatch {
        DispatchBatch::new(contents.iter().map(|c| Message::from(*c)).collect(), workers)
    }

    fn sizes(shards: &[Shard]) -> Vec<usize> {
        shards.iter().map(|s| s.messages.len()).collect()
    }

    #[test]
    fn test_two_workers_split_evenly() {
        let shards = partition(batch(&["A", "B", "C", "D"], 2));
        assert_eq!(sizes(&shards), vec![2, 2]);
        assert_eq!(shards[0].messages, vec![Message::from("A"), Message::from("B")]);
        assert_eq!(shards[1].messages, vec![Message::from("C"), Message::from("D")]);
    }

    #[test]
    fn test_three_workers_skip_empty_shard() {
        let plan = ShardPlan::new(4, 3);
        assert_eq!(plan.shard_size(), 2);
        assert_eq!(plan.ranges(), vec![0..2, 2..4]);

        let shards = partition(batch(&["A", "B", "C", "D"], 3));
        assert_eq!(sizes(&shards), vec![2, 2]);
        assert_eq!(shards[1].worker, 1);
    }

    #[test]
    fn test_non_positive_workers_match_single_worker() {
        let single = partition(batch(&["A", "B", "C"], 1));
        assert_eq!(partition(batch(&["A", "B", "C"], 0)), single);
        assert_eq!(partition(batch(&["A", "B", "C"], -4)), single);
        assert_eq!(sizes(&single), vec![3]);
    }

    #[test]
    fn test_empty_batch_has_no_shards() {
        assert!(partition(batch(&[], 4)).is_empty());
        assert!(ShardPlan::new(0, 4).ranges().is_empty());
    }

    #[test]
    fn test_more_workers_than_messages() {
        let shards = partition(batch(&["A", "B"], 5));
        assert_eq!(sizes(&shards), vec![1, 1]);
    }

    #[test]
    fn test_huge_worker_count_does_not_preallocate() {
        let shards = partition(batch(&["A", "B"], i64::MAX));
        assert_eq!(sizes(&shards), vec![1, 1]);

        let plan = ShardPlan::new(3, 1 << 40);
        assert_eq!(plan.ranges(), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_shards_cover_batch_exactly() {
        for total in 0..=25usize {
            for workers in 1..=9usize {
                let contents: Vec<String> = (0..total).map(|i| i.to_string()).collect();
                let messages: Vec<Message> =
                    contents.iter().map(|c| Message::new(c.as_str())).collect();
                let shards = partition(DispatchBatch::new(messages.clone(), workers as i64));

                let limit = total.div_ceil(workers);
                assert!(shards.len() <= workers.min(total));
                for (index, shard) in shards.iter().enumerate() {
                    assert_eq!(shard.worker, index);
                    assert!(!shard.messages.is_empty());
                    assert!(shard.messages.len() <= limit);
                }

                let joined: Vec<Message> =
                    shards.into_iter().flat_map(|s| s.messages).collect();
                assert_eq!(joined, messages, "total={total} workers={workers}");
            }
        }
    }
}
