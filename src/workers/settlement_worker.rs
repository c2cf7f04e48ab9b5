//! Settlement Worker Runtime
//!
//! A fixed pool of executors pulling due jobs from the settlement queue and
//! dispatching them by task name. Handler failures stop at the job
//! boundary:
//! - retryable errors spend one unit of the job's retry budget and the job is
//!   rescheduled after its retry timeout
//! - non-retryable errors, exhausted budgets, unknown tasks and handler
//!   panics drop the job with an error log
//!
//! Every claimed job is acknowledged once its handler returned, whatever the
//! report. A job whose executor died before that point comes back when its
//! queue lease runs out.
//!
//! A dropped settlement job leaves its deposit PENDING ("stuck pending") for
//! external reconciliation.

use crate::config::WorkerConfig;
use crate::error::WalletError;
use crate::queue::{QueueError, SettlementJob, SettlementQueue};
use crate::{job_span, log_performance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

// ============================================================================
// Handler contract
// ============================================================================

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &SettlementJob) -> Result<(), WalletError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no job handlers registered")]
    NoHandlers,

    #[error("settlement executor aborted: {0}")]
    ExecutorAborted(String),
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    Completed,
    Retried { attempt: u32, eta: DateTime<Utc> },
    Dropped { reason: String },
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Dispatcher {
    queue: Arc<dyn SettlementQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Dispatcher {
    async fn process_next(&self, now: DateTime<Utc>) -> Result<Option<JobReport>, QueueError> {
        let Some(job) = self.queue.claim_due(now).await? else {
            return Ok(None);
        };

        let span = job_span!(
            "settlement_job",
            job_id = job.id,
            reference = job.reference,
            task = job.task,
        );
        let report = self.dispatch(&job).instrument(span).await;
        if let Err(e) = self.queue.ack(&job).await {
            warn!(job_id = %job.id, error = %e, "Failed to acknowledge job, it returns after its lease");
        }
        Ok(Some(report))
    }

    async fn dispatch(&self, job: &SettlementJob) -> JobReport {
        let Some(handler) = self.handlers.get(&job.task).cloned() else {
            error!(task = %job.task, "No handler registered for task, dropping job");
            return JobReport::Dropped {
                reason: format!("unknown task {}", job.task),
            };
        };

        debug!(attempt = job.attempts, poll = job.poll, "Running settlement job");
        let started = Instant::now();

        // Run on its own task so a panicking handler cannot take the executor down.
        let task_job = job.clone();
        let outcome = tokio::spawn(
            async move { handler.handle(&task_job).await }.instrument(tracing::Span::current()),
        )
        .await;

        log_performance!(
            operation = "settlement_job",
            duration_ms = started.elapsed().as_millis(),
        );

        match outcome {
            Ok(Ok(())) => JobReport::Completed,
            Ok(Err(e)) if e.is_retryable() => self.retry_or_drop(job, e).await,
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    error_code = e.error_code(),
                    "Settlement job failed permanently, dropping"
                );
                JobReport::Dropped {
                    reason: e.to_string(),
                }
            }
            Err(join_error) => {
                error!(error = %join_error, "Settlement handler panicked, dropping job");
                JobReport::Dropped {
                    reason: format!("handler panicked: {}", join_error),
                }
            }
        }
    }

    async fn retry_or_drop(&self, job: &SettlementJob, cause: WalletError) -> JobReport {
        let Some(retry) = job.retry_after_failure(Utc::now()) else {
            error!(
                error = %cause,
                retry_count = job.retry_count,
                "Retry budget exhausted, deposit left pending for reconciliation"
            );
            return JobReport::Dropped {
                reason: format!("retry budget exhausted: {}", cause),
            };
        };

        let attempt = retry.attempts;
        let eta = retry.eta;
        warn!(
            error = %cause,
            attempt,
            retry_count = job.retry_count,
            eta = %eta,
            "Settlement job failed, retrying"
        );

        match self.queue.enqueue(retry).await {
            Ok(()) => JobReport::Retried { attempt, eta },
            Err(e) => {
                error!(error = %e, "Failed to reschedule settlement job, dropping");
                JobReport::Dropped {
                    reason: format!("reschedule failed: {}", e),
                }
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

pub struct WorkerRuntime {
    dispatcher: Dispatcher,
    config: WorkerConfig,
}

impl WorkerRuntime {
    pub fn new(queue: Arc<dyn SettlementQueue>, config: WorkerConfig) -> Self {
        Self {
            dispatcher: Dispatcher {
                queue,
                handlers: HashMap::new(),
            },
            config,
        }
    }

    pub fn register_handler(&mut self, task: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let task = task.into();
        info!(task = %task, "Job handler registered");
        self.dispatcher.handlers.insert(task, handler);
    }

    /// Claims and runs at most one job due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<JobReport>, QueueError> {
        self.dispatcher.process_next(now).await
    }

    /// Runs every job due at `now`, one after another, and returns the reports.
    pub async fn drain_due(&self, now: DateTime<Utc>) -> Result<Vec<JobReport>, QueueError> {
        let mut reports = Vec::new();
        while let Some(report) = self.dispatcher.process_next(now).await? {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Runs `pool_size` executors until `shutdown_rx` flips to `true`.
    /// In-flight jobs finish before their executor stops.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.dispatcher.handlers.is_empty() {
            return Err(WorkerError::NoHandlers);
        }

        let pool_size = self.config.pool_size.max(1);
        let idle = Duration::from_millis(self.config.idle_poll_interval_ms);
        info!(
            pool_size,
            idle_poll_interval_ms = self.config.idle_poll_interval_ms,
            "Settlement worker pool started"
        );

        let dispatcher = Arc::new(self.dispatcher);
        let executors: Vec<_> = (0..pool_size)
            .map(|worker_id| {
                tokio::spawn(executor_loop(
                    worker_id,
                    Arc::clone(&dispatcher),
                    idle,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        let mut first_failure = None;
        for joined in join_all(executors).await {
            if let Err(e) = joined {
                error!(error = %e, "Settlement executor aborted");
                first_failure.get_or_insert(e.to_string());
            }
        }

        info!("Settlement worker pool stopped");
        match first_failure {
            Some(reason) => Err(WorkerError::ExecutorAborted(reason)),
            None => Ok(()),
        }
    }
}

async fn executor_loop(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    idle: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "Settlement executor started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match dispatcher.process_next(Utc::now()).await {
            Ok(Some(report)) => {
                debug!(worker_id, report = ?report, "Settlement job finished");
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(worker_id, error = %e, "Failed to claim settlement job"),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle) => {}
        }
    }

    debug!(worker_id, "Settlement executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PaymentReference;
    use crate::gateway::GatewayError;
    use crate::queue::{InMemorySettlementQueue, SETTLEMENT_TASK};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingHandler {
        calls: AtomicUsize,
        retryable: bool,
    }

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: &SettlementJob) -> Result<(), WalletError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.retryable {
                Err(GatewayError::Timeout(5).into())
            } else {
                Err(WalletError::not_found("transaction", "TF-A1Bnp03723"))
            }
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _job: &SettlementJob) -> Result<(), WalletError> {
            panic!("boom");
        }
    }

    fn due_job(retry_count: u32) -> SettlementJob {
        SettlementJob::new(
            PaymentReference::parse("TF-A1Bnp03723").unwrap(),
            Utc::now(),
            retry_count,
            1,
        )
    }

    #[tokio::test]
    async fn test_retryable_failure_spends_budget_then_drops() {
        let queue = Arc::new(InMemorySettlementQueue::new());
        let handler = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
            retryable: true,
        });
        let mut runtime = WorkerRuntime::new(queue.clone(), WorkerConfig::default());
        runtime.register_handler(SETTLEMENT_TASK, handler.clone());

        queue.enqueue(due_job(2)).await.unwrap();
        let far_future = Utc::now() + chrono::Duration::hours(1);

        let first = runtime.run_once(far_future).await.unwrap().unwrap();
        assert!(matches!(first, JobReport::Retried { attempt: 1, .. }));
        let second = runtime.run_once(far_future).await.unwrap().unwrap();
        assert!(matches!(second, JobReport::Retried { attempt: 2, .. }));
        let third = runtime.run_once(far_future).await.unwrap().unwrap();
        assert!(matches!(third, JobReport::Dropped { .. }));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_drops_immediately() {
        let queue = Arc::new(InMemorySettlementQueue::new());
        let mut runtime = WorkerRuntime::new(queue.clone(), WorkerConfig::default());
        runtime.register_handler(
            SETTLEMENT_TASK,
            Arc::new(FailingHandler {
                calls: AtomicUsize::new(0),
                retryable: false,
            }),
        );

        queue.enqueue(due_job(5)).await.unwrap();
        let report = runtime.run_once(Utc::now()).await.unwrap().unwrap();
        assert!(matches!(report, JobReport::Dropped { .. }));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_crash_runtime() {
        let queue = Arc::new(InMemorySettlementQueue::new());
        let mut runtime = WorkerRuntime::new(queue.clone(), WorkerConfig::default());
        runtime.register_handler(SETTLEMENT_TASK, Arc::new(PanickingHandler));

        queue.enqueue(due_job(1)).await.unwrap();
        queue.enqueue(due_job(1)).await.unwrap();
        let reports = runtime.drain_due(Utc::now()).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| matches!(r, JobReport::Dropped { .. })));
        assert_eq!(queue.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_dropped() {
        let queue = Arc::new(InMemorySettlementQueue::new());
        let mut runtime = WorkerRuntime::new(queue.clone(), WorkerConfig::default());
        runtime.register_handler(SETTLEMENT_TASK, Arc::new(PanickingHandler));

        let mut job = due_job(1);
        job.task = "enqueue-something-else".into();
        queue.enqueue(job).await.unwrap();
        let report = runtime.run_once(Utc::now()).await.unwrap().unwrap();
        assert!(matches!(report, JobReport::Dropped { .. }));
    }

    #[tokio::test]
    async fn test_job_claimed_by_dead_executor_runs_after_lease() {
        let queue = Arc::new(InMemorySettlementQueue::with_lease(chrono::Duration::seconds(30)));
        let handler = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
            retryable: false,
        });
        let mut runtime = WorkerRuntime::new(queue.clone(), WorkerConfig::default());
        runtime.register_handler(SETTLEMENT_TASK, handler.clone());

        let now = Utc::now();
        queue.enqueue(due_job(0)).await.unwrap();
        // An executor that claims and then dies never acknowledges.
        let lost = queue.claim_due(now).await.unwrap().unwrap();
        assert!(runtime.run_once(now).await.unwrap().is_none());

        let report = runtime
            .run_once(now + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report, JobReport::Dropped { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert!(queue.scheduled().await.unwrap().iter().all(|j| j.id != lost.id));
    }

    #[tokio::test]
    async fn test_run_without_handlers_fails_fast() {
        let queue = Arc::new(InMemorySettlementQueue::new());
        let runtime = WorkerRuntime::new(queue, WorkerConfig::default());
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(runtime.run(rx).await, Err(WorkerError::NoHandlers)));
    }
}
