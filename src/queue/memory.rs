use super::{QueueError, SettlementJob, SettlementQueue, DEFAULT_LEASE_SECS};
use crate::config;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct Scheduled {
    sequence: u64,
    job: SettlementJob,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.job.eta == other.job.eta && self.sequence == other.sequence
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest ETA first, then FIFO; reversed for the max-heap.
        other
            .job
            .eta
            .cmp(&self.job.eta)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Scheduled>,
    next_sequence: u64,
    leased: HashMap<Uuid, (DateTime<Utc>, SettlementJob)>,
}

impl Heap {
    fn push(&mut self, job: SettlementJob) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.entries.push(Scheduled { sequence, job });
    }

    fn requeue_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, (until, _))| *until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((_, job)) = self.leased.remove(&id) {
                tracing::warn!(job_id = %id, reference = %job.reference, "Lease expired, job rescheduled");
                self.push(job);
            }
        }
    }
}

/// Process-local settlement queue ordered by ETA.
#[derive(Clone)]
pub struct InMemorySettlementQueue {
    heap: Arc<Mutex<Heap>>,
    lease: Duration,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemorySettlementQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySettlementQueue {
    pub fn new() -> Self {
        Self::with_lease(config::seconds(DEFAULT_LEASE_SECS))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            heap: Arc::new(Mutex::new(Heap::default())),
            lease,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, `enqueue` fails with [`QueueError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl SettlementQueue for InMemorySettlementQueue {
    async fn enqueue(&self, job: SettlementJob) -> Result<(), QueueError> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue switched off".into()));
        }
        self.heap.lock().await.push(job);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<SettlementJob>, QueueError> {
        let mut heap = self.heap.lock().await;
        heap.requeue_expired(now);
        let due = heap
            .entries
            .peek()
            .map(|head| head.job.is_due(now))
            .unwrap_or(false);
        if !due {
            return Ok(None);
        }
        let Some(Scheduled { job, .. }) = heap.entries.pop() else {
            return Ok(None);
        };
        heap.leased.insert(job.id, (now + self.lease, job.clone()));
        Ok(Some(job))
    }

    async fn ack(&self, job: &SettlementJob) -> Result<(), QueueError> {
        self.heap.lock().await.leased.remove(&job.id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.heap.lock().await.entries.len())
    }

    async fn in_flight(&self) -> Result<usize, QueueError> {
        Ok(self.heap.lock().await.leased.len())
    }

    async fn scheduled(&self) -> Result<Vec<SettlementJob>, QueueError> {
        let heap = self.heap.lock().await;
        let mut entries: Vec<&Scheduled> = heap.entries.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries.into_iter().map(|s| s.job.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PaymentReference;

    fn job_at(reference: &str, eta: DateTime<Utc>) -> SettlementJob {
        SettlementJob::new(PaymentReference::parse(reference).unwrap(), eta, 3, 30)
    }

    #[tokio::test]
    async fn test_claims_only_due_jobs_in_eta_order() {
        let queue = InMemorySettlementQueue::new();
        let now = Utc::now();
        queue
            .enqueue(job_at("TF-AAAlp00001", now + Duration::seconds(5)))
            .await
            .unwrap();
        queue
            .enqueue(job_at("TF-BBBlp00002", now - Duration::seconds(5)))
            .await
            .unwrap();
        queue
            .enqueue(job_at("TF-CCClp00003", now + Duration::seconds(60)))
            .await
            .unwrap();

        let first = queue.claim_due(now).await.unwrap().unwrap();
        assert_eq!(first.reference.as_str(), "TF-BBBlp00002");
        assert!(queue.claim_due(now).await.unwrap().is_none());

        let later = queue
            .claim_due(now + Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.reference.as_str(), "TF-AAAlp00001");
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_job_once() {
        let queue = InMemorySettlementQueue::new();
        let now = Utc::now();
        for i in 0..20 {
            queue
                .enqueue(job_at(&format!("TF-AAAlp{:05}", i), now))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_due(Utc::now()).await.unwrap() {
                    claimed.push(job.reference.to_string());
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_unacked_job_is_redelivered_after_lease() {
        let queue = InMemorySettlementQueue::with_lease(Duration::seconds(60));
        let now = Utc::now();
        queue.enqueue(job_at("TF-AAAlp00001", now)).await.unwrap();

        // Claimed, then the worker dies without acknowledging.
        let claimed = queue.claim_due(now).await.unwrap().unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 1);
        assert!(queue
            .claim_due(now + Duration::seconds(59))
            .await
            .unwrap()
            .is_none());

        let redelivered = queue
            .claim_due(now + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered, claimed);

        queue.ack(&redelivered).await.unwrap();
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert!(queue
            .claim_due(now + Duration::hours(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_scheduled_snapshot_is_earliest_first() {
        let queue = InMemorySettlementQueue::new();
        let now = Utc::now();
        queue
            .enqueue(job_at("TF-AAAlp00001", now + Duration::seconds(30)))
            .await
            .unwrap();
        queue
            .enqueue(job_at("TF-BBBlp00002", now + Duration::seconds(10)))
            .await
            .unwrap();

        let snapshot = queue.scheduled().await.unwrap();
        assert_eq!(snapshot[0].reference.as_str(), "TF-BBBlp00002");
        assert_eq!(snapshot[1].reference.as_str(), "TF-AAAlp00001");
    }

    #[tokio::test]
    async fn test_unavailable_queue_rejects_enqueue() {
        let queue = InMemorySettlementQueue::new();
        queue.set_unavailable(true);
        let err = queue
            .enqueue(job_at("TF-AAAlp00001", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
    }
}
