//! Settlement task queue.
//!
//! At-least-once, ETA-ordered storage for deferred "check settlement status"
//! jobs. Claiming is atomic: of several executors racing for the same entry,
//! exactly one receives it. A claimed job is held under a lease until the
//! worker acknowledges it; a lease that runs out puts the job back on the
//! schedule, so a worker dying mid-job delays the check but never loses it.
//! Nothing is ordered across distinct references.

pub mod memory;
#[cfg(feature = "cache")]
pub mod redis_queue;

pub use memory::InMemorySettlementQueue;
#[cfg(feature = "cache")]
pub use redis_queue::RedisSettlementQueue;

use crate::config;
use crate::domain::PaymentReference;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task name the settlement status check is registered under.
pub const SETTLEMENT_TASK: &str = "enqueue-settlement-topup";

/// Lease used when none is configured.
pub const DEFAULT_LEASE_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[cfg(feature = "cache")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One scheduled status check for a deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementJob {
    pub id: Uuid,
    pub task: String,
    pub reference: PaymentReference,
    /// Earliest time the job may run.
    pub eta: DateTime<Utc>,
    /// Retries allowed after a retryable handler error.
    pub retry_count: u32,
    pub retry_timeout_secs: u64,
    /// Retries consumed so far.
    pub attempts: u32,
    /// Status checks that came back non-terminal before this job.
    pub poll: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl SettlementJob {
    pub fn new(
        reference: PaymentReference,
        eta: DateTime<Utc>,
        retry_count: u32,
        retry_timeout_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: SETTLEMENT_TASK.to_string(),
            reference,
            eta,
            retry_count,
            retry_timeout_secs,
            attempts: 0,
            poll: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta <= now
    }

    /// Follow-up check after a non-terminal status. Gets a fresh id and a
    /// fresh retry budget.
    pub fn next_poll(&self, eta: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            eta,
            attempts: 0,
            poll: self.poll + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Same job rescheduled after a retryable failure, or `None` once the
    /// retry budget is spent. The timeout is clamped to
    /// [`config::MAX_SCHEDULE_DELAY_SECS`].
    pub fn retry_after_failure(&self, now: DateTime<Utc>) -> Option<Self> {
        if self.attempts >= self.retry_count {
            return None;
        }
        Some(Self {
            eta: now + config::seconds(self.retry_timeout_secs),
            attempts: self.attempts + 1,
            ..self.clone()
        })
    }
}

#[async_trait]
pub trait SettlementQueue: Send + Sync {
    async fn enqueue(&self, job: SettlementJob) -> Result<(), QueueError>;

    /// Moves the earliest job whose ETA is at or before `now` from the
    /// schedule to the in-flight set, leased until `now` plus the queue's
    /// lease. Expired leases are put back on the schedule first.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<SettlementJob>, QueueError>;

    /// Ends the lease of a claimed job once its handler has returned.
    /// Acknowledging an unknown job is a no-op.
    async fn ack(&self, job: &SettlementJob) -> Result<(), QueueError>;

    /// Scheduled jobs, excluding those in flight.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Claimed jobs not yet acknowledged.
    async fn in_flight(&self) -> Result<usize, QueueError>;

    /// Snapshot of every scheduled job, earliest first.
    async fn scheduled(&self) -> Result<Vec<SettlementJob>, QueueError>;
}
