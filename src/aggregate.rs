//! Reducing producer worker outcomes to a single verdict.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::DispatchError;

/// What a producer worker reports when it finishes: the number of messages it
/// published, or the error that stopped it.
pub type WorkerOutcome = Result<usize, DispatchError>;

/// Report of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatch_id: Uuid,
    /// Workers that actually ran (non-empty shards)
    pub workers: usize,
    /// Messages published across all workers
    pub published: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outcomes collected from one dispatch, in the order they were observed.
#[derive(Debug)]
pub struct OutcomeSet {
    dispatch_id: Uuid,
    reported: Vec<bool>,
    published: usize,
    errors: Vec<DispatchError>,
}

impl OutcomeSet {
    /// Expect one outcome from each of `workers` workers.
    pub fn new(dispatch_id: Uuid, workers: usize) -> Self {
        Self {
            dispatch_id,
            reported: vec![false; workers],
            published: 0,
            errors: Vec::new(),
        }
    }

    /// Record the outcome of `worker`.
    pub fn record(&mut self, worker: usize, outcome: WorkerOutcome) {
        if let Some(slot) = self.reported.get_mut(worker) {
            *slot = true;
        }
        match outcome {
            Ok(published) => self.published += published,
            Err(e) => {
                warn!(
                    dispatch_id = %self.dispatch_id,
                    worker,
                    error = %e,
                    "Sender failed"
                );
                self.errors.push(e);
            }
        }
    }

    /// Drain `results` until every sender has hung up.
    pub async fn collect(&mut self, results: &mut mpsc::Receiver<(usize, WorkerOutcome)>) {
        while let Some((worker, outcome)) = results.recv().await {
            self.record(worker, outcome);
        }
    }

    /// Errors in observation order.
    pub fn errors(&self) -> &[DispatchError] {
        &self.errors
    }

    /// Messages published so far.
    pub fn published(&self) -> usize {
        self.published
    }

    /// Workers that never reported.
    pub fn missing(&self) -> Vec<usize> {
        self.reported
            .iter()
            .enumerate()
            .filter(|(_, reported)| !**reported)
            .map(|(worker, _)| worker)
            .collect()
    }

    /// Reduce to the first observed error, or a summary if every worker
    /// succeeded. A worker that never reported counts as failed.
    pub fn into_result(self, started_at: DateTime<Utc>) -> Result<DispatchSummary, DispatchError> {
        let missing = self.missing();
        if let Some(first) = self.errors.into_iter().next() {
            return Err(first);
        }
        if let Some(&worker) = missing.first() {
            return Err(DispatchError::WorkerLost { worker });
        }

        Ok(DispatchSummary {
            dispatch_id: self.dispatch_id,
            workers: self.reported.len(),
            published: self.published,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_all_succeeded() {
        let mut outcomes = OutcomeSet::new(Uuid::new_v4(), 2);
        outcomes.record(1, Ok(2));
        outcomes.record(0, Ok(2));

        let summary = outcomes.into_result(Utc::now()).unwrap();
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.published, 4);
    }

    #[test]
    fn test_first_observed_error_wins() {
        let mut outcomes = OutcomeSet::new(Uuid::new_v4(), 3);
        outcomes.record(2, Err(DispatchError::WorkerLost { worker: 2 }));
        outcomes.record(
            0,
            Err(DispatchError::Timeout {
                worker: 0,
                timeout: Duration::from_secs(5),
            }),
        );
        outcomes.record(1, Ok(1));

        assert_eq!(outcomes.errors().len(), 2);
        let err = outcomes.into_result(Utc::now()).unwrap_err();
        assert_eq!(err.worker(), 2);
    }

    #[test]
    fn test_silent_worker_is_a_failure() {
        let mut outcomes = OutcomeSet::new(Uuid::new_v4(), 2);
        outcomes.record(0, Ok(3));

        assert_eq!(outcomes.missing(), vec![1]);
        let err = outcomes.into_result(Utc::now()).unwrap_err();
        assert!(matches!(err, DispatchError::WorkerLost { worker: 1 }));
    }

    #[tokio::test]
    async fn test_collect_until_senders_drop() {
        let (tx, mut rx) = mpsc::channel(2);
        let first = tx.clone();
        tokio::spawn(async move { first.send((0, Ok(1))).await });
        tokio::spawn(async move { tx.send((1, Ok(2))).await });

        let mut outcomes = OutcomeSet::new(Uuid::new_v4(), 2);
        outcomes.collect(&mut rx).await;

        assert_eq!(outcomes.published(), 3);
        assert!(outcomes.missing().is_empty());
    }
}
