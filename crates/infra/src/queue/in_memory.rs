use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use eatsavvy_core::{Clock, EnrichmentJob};

use super::{encode_job, Delivery, JobQueue, QueueError};

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    ready: VecDeque<Delivery>,
    delayed: Vec<(DateTime<Utc>, Delivery)>,
    unacked: HashMap<String, Delivery>,
    published: Vec<Delivery>,
}

/// In-memory job queue.
///
/// Intended for tests/dev. Delayed jobs become ready when the injected clock
/// reaches their due time, so a `ManualClock` drives delivery deterministically.
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    notify: Notify,
    fail_publishes: AtomicBool,
}

impl std::fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobQueue").finish_non_exhaustive()
    }
}

impl InMemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Make every publish fail until switched back off.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every delivery ever published, in publish order.
    pub fn published(&self) -> Vec<Delivery> {
        self.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    /// Decoded jobs ever published, in publish order.
    pub fn published_jobs(&self) -> Vec<EnrichmentJob> {
        self.published()
            .iter()
            .filter_map(|d| EnrichmentJob::decode(&d.payload).ok())
            .collect()
    }

    /// Number of jobs waiting on a delay.
    pub fn delayed_len(&self) -> usize {
        self.lock().map(|s| s.delayed.len()).unwrap_or(0)
    }

    /// Number of jobs ready to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Deliveries received but not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Push raw bytes as an immediate delivery (malformed-payload tests).
    pub fn push_raw(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        self.enqueue(payload, Duration::ZERO)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Command("lock poisoned".to_string()))
    }

    fn enqueue(&self, payload: Vec<u8>, delay: Duration) -> Result<(), QueueError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("injected publish failure".to_string()));
        }

        let now = self.clock.now();
        let mut state = self.lock()?;
        state.next_id += 1;
        let delivery = Delivery {
            id: format!("mem-{}", state.next_id),
            payload,
            delay,
        };
        state.published.push(delivery.clone());

        if delay.is_zero() {
            state.ready.push_back(delivery);
        } else {
            let due = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.delayed.push((due, delivery));
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(due_at, _)| *due_at <= now);
        state.delayed = waiting;
        let mut due = due;
        due.sort_by_key(|(due_at, _)| *due_at);
        state.ready.extend(due.into_iter().map(|(_, d)| d));

        let next = state.ready.pop_front();
        if let Some(delivery) = &next {
            state.unacked.insert(delivery.id.clone(), delivery.clone());
        }
        Ok(next)
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn publish(&self, job: &EnrichmentJob) -> Result<(), QueueError> {
        self.enqueue(encode_job(job)?, Duration::ZERO)
    }

    async fn publish_delayed(&self, job: &EnrichmentJob, delay: Duration) -> Result<(), QueueError> {
        self.enqueue(encode_job(job)?, delay)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = self.try_take()? {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_take()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock()?.unacked.remove(&delivery.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use eatsavvy_core::{ManualClock, PlaceId, Restaurant};

    fn job(clock: &ManualClock) -> EnrichmentJob {
        let r = Restaurant::pending_stub(PlaceId::new("p1").unwrap(), "Diner", clock.now());
        EnrichmentJob::new(r, clock.now())
    }

    #[tokio::test]
    async fn delayed_job_is_held_until_the_clock_reaches_it() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
        let queue = InMemoryJobQueue::new(clock.clone());

        queue
            .publish_delayed(&job(&clock), Duration::from_secs(90 * 60))
            .await
            .unwrap();
        assert!(queue.receive(Duration::from_millis(5)).await.unwrap().is_none());
        assert_eq!(queue.delayed_len(), 1);

        clock.advance(Duration::from_secs(90 * 60));
        let delivery = queue.receive(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(delivery.delay, Duration::from_secs(90 * 60));
        assert_eq!(queue.unacked_len(), 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.unacked_len(), 0);
    }

    #[tokio::test]
    async fn publish_failure_can_be_injected() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
        let queue = InMemoryJobQueue::new(clock.clone());
        queue.fail_publishes(true);

        assert!(matches!(
            queue.publish(&job(&clock)).await,
            Err(QueueError::Connection(_))
        ));
        assert!(queue.published().is_empty());
    }
}
