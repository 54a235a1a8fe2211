//! Enrichment worker: consumes jobs, calls restaurants that are open, defers the rest.
//!
//! ## Acknowledgement
//!
//! A delivery is acknowledged only once it has been handled:
//! - success (call placed and recorded, or deferred until the next opening)
//! - transient failure before a call exists: republished with `attempt + 1` after
//!   the [`RetryPolicy`] backoff; once retries are exhausted the restaurant is `failed`
//! - permanent failure, or any failure after the provider accepted the call:
//!   the restaurant is marked `failed` (best effort) and the job is dropped
//! - undecodable payload, or a job whose restaurant is no longer `queued`: logged
//!   and dropped
//!
//! Nothing is ever retried after a call id came back, so a restaurant is never
//! dialled twice for one job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use eatsavvy_core::hours::{is_open, next_open_delay, TimePoint};
use eatsavvy_core::{Clock, DomainError, EnrichmentJob, EnrichmentStatus, PlaceId, ProviderCallId};

use crate::external::{CallClient, CallError};
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::retry::RetryPolicy;
use crate::store::{RestaurantStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("undecodable job: {0}")]
    Decode(#[from] DomainError),

    #[error("restaurant lookup failed: {0}")]
    Lookup(StoreError),

    #[error("call not placed: {0}")]
    Call(#[from] CallError),

    #[error("call {call_id} placed but not recorded: {source}")]
    Record { call_id: ProviderCallId, source: StoreError },

    #[error("republish failed: {0}")]
    Republish(#[from] QueueError),
}

impl WorkerError {
    /// Whether the job may run again. Never true once a call was placed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Call(e) => e.is_transient(),
            WorkerError::Lookup(_) | WorkerError::Republish(_) => true,
            WorkerError::Decode(_) | WorkerError::Record { .. } => false,
        }
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Restaurant was open; the call is in progress.
    CallPlaced(ProviderCallId),
    /// Restaurant was closed; the same job was republished with this delay.
    Deferred(Duration),
    /// Transient failure; republished as retry `attempt` after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Restaurant marked `failed`.
    Failed { place_id: PlaceId, reason: String },
    /// Payload could not be decoded and was dropped.
    Discarded(String),
}

#[derive(Clone)]
pub struct EnrichmentWorker {
    store: Arc<dyn RestaurantStore>,
    queue: Arc<dyn JobQueue>,
    calls: Arc<dyn CallClient>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl std::fmt::Debug for EnrichmentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentWorker")
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn RestaurantStore>,
        queue: Arc<dyn JobQueue>,
        calls: Arc<dyn CallClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            calls,
            clock,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(1000),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the consuming loop on the tokio runtime.
    pub fn spawn(self, name: &'static str) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(name, shutdown_rx).await });
        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    async fn run(&self, name: &'static str, mut shutdown: watch::Receiver<bool>) {
        info!(worker = name, "enrichment worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.run_once().await {
                warn!(worker = name, error = %err, "queue error, backing off");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(worker = name, "enrichment worker stopped");
    }

    /// Wait one poll tick for a delivery and handle it.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        match self.queue.receive(self.poll_interval).await? {
            Some(delivery) => self.handle_delivery(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle one delivery per the acknowledgement policy, then ack it.
    #[instrument(skip(self, delivery), fields(message_id = %delivery.id))]
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<JobOutcome, QueueError> {
        let outcome = match EnrichmentJob::decode(&delivery.payload) {
            Ok(job) => match self.process_job(&job).await {
                Ok(outcome) => outcome,
                Err(err) => self.handle_failure(&job, err).await,
            },
            Err(err) => {
                error!(error = %err, "dropping undecodable job");
                JobOutcome::Discarded(err.to_string())
            }
        };

        self.queue.ack(delivery).await?;
        debug!(?outcome, "delivery acknowledged");
        Ok(outcome)
    }

    /// Call the restaurant if it is open now, otherwise defer until it opens.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.job_id, place_id = %job.restaurant.place_id, attempt = job.attempt),
        err
    )]
    pub async fn process_job(&self, job: &EnrichmentJob) -> Result<JobOutcome, WorkerError> {
        // A job only runs while its restaurant is still `queued`.
        let Some(restaurant) = self
            .store
            .get_restaurant(&job.restaurant.place_id)
            .await
            .map_err(WorkerError::Lookup)?
        else {
            warn!("restaurant no longer stored, dropping job");
            return Ok(JobOutcome::Discarded("restaurant not found".to_string()));
        };
        if restaurant.enrichment_status != EnrichmentStatus::Queued {
            warn!(status = %restaurant.enrichment_status, "stale job, dropping");
            return Ok(JobOutcome::Discarded(format!(
                "restaurant is {}, not queued",
                restaurant.enrichment_status
            )));
        }
        let now = TimePoint::from_datetime(self.clock.now());

        if !is_open(&restaurant.open_hours, now) {
            let delay = next_open_delay(&restaurant.open_hours, now);
            self.queue.publish_delayed(job, delay).await?;
            info!(delay_secs = delay.as_secs(), "restaurant closed, deferred");
            return Ok(JobOutcome::Deferred(delay));
        }

        let call_id = self.calls.create_call(&restaurant).await?;
        info!(call_id = %call_id, "call placed");

        self.store
            .record_call_started(&restaurant.place_id, &call_id, self.clock.now())
            .await
            .map_err(|source| WorkerError::Record {
                call_id: call_id.clone(),
                source,
            })?;

        Ok(JobOutcome::CallPlaced(call_id))
    }

    async fn handle_failure(&self, job: &EnrichmentJob, err: WorkerError) -> JobOutcome {
        let place_id = job.restaurant.place_id.clone();

        if err.is_retryable() && self.retry.should_retry(job.attempt) {
            let next = job.next_attempt();
            let delay = self.retry.delay_for_retry(next.attempt);
            match self.queue.publish_delayed(&next, delay).await {
                Ok(()) => {
                    warn!(place_id = %place_id, attempt = next.attempt, error = %err, "transient failure, retrying");
                    return JobOutcome::Retrying {
                        attempt: next.attempt,
                        delay,
                    };
                }
                Err(republish_err) => {
                    error!(place_id = %place_id, error = %republish_err, "retry republish failed");
                }
            }
        }

        error!(place_id = %place_id, error = %err, "enrichment job failed");
        if let Err(mark_err) = self
            .store
            .set_status(&place_id, EnrichmentStatus::Failed, self.clock.now())
            .await
        {
            error!(place_id = %place_id, error = %mark_err, "failed to mark restaurant failed");
        }

        JobOutcome::Failed {
            place_id,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use eatsavvy_core::{ManualClock, Restaurant, TimeRange};

    use crate::external::ScriptedCallClient;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryRestaurantStore;

    struct Fixture {
        store: Arc<InMemoryRestaurantStore>,
        queue: Arc<InMemoryJobQueue>,
        calls: Arc<ScriptedCallClient>,
        clock: Arc<ManualClock>,
        worker: EnrichmentWorker,
    }

    // 2025-03-03 is a Monday.
    fn monday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, hour, minute, 0).unwrap()
    }

    fn weekday_lunch() -> Vec<TimeRange> {
        (1..=5)
            .map(|d| {
                TimeRange::new(
                    TimePoint::new(d, 11, 0).unwrap(),
                    TimePoint::new(d, 15, 0).unwrap(),
                )
            })
            .collect()
    }

    fn fixture(at: DateTime<Utc>) -> Fixture {
        let clock = Arc::new(ManualClock::new(at));
        let store = Arc::new(InMemoryRestaurantStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
        let calls = Arc::new(ScriptedCallClient::new());
        let worker = EnrichmentWorker::new(store.clone(), queue.clone(), calls.clone(), clock.clone())
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)))
            .with_poll_interval(Duration::from_millis(5));
        Fixture {
            store,
            queue,
            calls,
            clock,
            worker,
        }
    }

    fn queued_job(f: &Fixture) -> EnrichmentJob {
        let mut r = Restaurant::pending_stub(PlaceId::new("p1").unwrap(), "Diner", f.clock.now());
        r.phone_number = Some("(206) 555-0100".into());
        r.open_hours = weekday_lunch();
        r.enrichment_status = EnrichmentStatus::Queued;
        f.store.insert(r.clone());
        EnrichmentJob::new(r, f.clock.now())
    }

    async fn status(f: &Fixture) -> EnrichmentStatus {
        f.store
            .get_restaurant(&PlaceId::new("p1").unwrap())
            .await
            .unwrap()
            .unwrap()
            .enrichment_status
    }

    #[tokio::test]
    async fn open_restaurant_gets_called_and_recorded() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);

        let outcome = f.worker.process_job(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::CallPlaced(_)));
        assert_eq!(status(&f).await, EnrichmentStatus::InProgress);
        assert_eq!(f.store.calls_for(&job.restaurant.place_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_restaurant_is_deferred_without_status_change() {
        let f = fixture(monday(9, 0));
        let job = queued_job(&f);

        let outcome = f.worker.process_job(&job).await.unwrap();
        // Opens at 11:00: two hours plus the 30 minute buffer.
        assert_eq!(outcome, JobOutcome::Deferred(Duration::from_secs(150 * 60)));
        assert_eq!(status(&f).await, EnrichmentStatus::Queued);
        assert_eq!(f.queue.delayed_len(), 1);
        assert_eq!(f.queue.published_jobs()[0].job_id, job.job_id);
        assert!(f.calls.attempts().is_empty());
    }

    #[tokio::test]
    async fn transient_call_failure_is_retried_then_exhausted() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);
        for _ in 0..3 {
            f.calls.push(Err(CallError::Unavailable {
                status: 503,
                body: String::new(),
            }));
        }

        f.queue.publish(&job).await.unwrap();
        let first = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            first,
            JobOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(status(&f).await, EnrichmentStatus::Queued);

        f.clock.advance(Duration::from_secs(60));
        let second = f.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(second, JobOutcome::Retrying { attempt: 2, .. }));

        f.clock.advance(Duration::from_secs(60));
        let third = f.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(third, JobOutcome::Failed { .. }));
        assert_eq!(status(&f).await, EnrichmentStatus::Failed);
        assert_eq!(f.queue.unacked_len(), 0);
        assert_eq!(f.queue.delayed_len(), 0);
    }

    #[tokio::test]
    async fn rejected_call_fails_without_retry() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);
        f.calls.push(Err(CallError::Rejected {
            status: 400,
            body: "bad number".into(),
        }));

        f.queue.publish(&job).await.unwrap();
        let outcome = f.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(status(&f).await, EnrichmentStatus::Failed);
        assert_eq!(f.queue.published().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_after_call_is_never_retried() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);
        f.store.fail_call_records(true);

        f.queue.publish(&job).await.unwrap();
        let outcome = f.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));

        f.store.fail_call_records(false);
        assert_eq!(status(&f).await, EnrichmentStatus::Failed);
        assert_eq!(f.calls.attempts().len(), 1);
        assert_eq!(f.queue.published().len(), 1);
        assert_eq!(f.queue.unacked_len(), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_acked_and_dropped() {
        let f = fixture(monday(12, 0));
        f.queue.push_raw(b"{\"schema_version\":99}".to_vec()).unwrap();

        let outcome = f.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Discarded(_)));
        assert_eq!(f.queue.unacked_len(), 0);
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);
        f.queue.publish(&job).await.unwrap();

        let handle = f.worker.clone().spawn("test-worker");
        for _ in 0..100 {
            if status(&f).await == EnrichmentStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(status(&f).await, EnrichmentStatus::InProgress);
    }

    #[tokio::test]
    async fn redelivered_job_does_not_dial_twice() {
        let f = fixture(monday(12, 0));
        let job = queued_job(&f);

        assert!(matches!(
            f.worker.process_job(&job).await.unwrap(),
            JobOutcome::CallPlaced(_)
        ));
        let again = f.worker.process_job(&job).await.unwrap();
        assert!(matches!(again, JobOutcome::Discarded(_)));
        assert_eq!(f.calls.attempts().len(), 1);
        assert_eq!(status(&f).await, EnrichmentStatus::InProgress);
    }
}
