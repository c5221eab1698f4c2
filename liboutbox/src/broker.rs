//! In-process task transport between the scanner and the workers
//!
//! The scanner and dispatcher never share scan state; a task handed to
//! the broker is the only thing that crosses the boundary. The broker
//! enforces three properties the pipeline depends on:
//!
//! - at most one in-flight task per post (the scanner re-sees pending
//!   rows every scan and must not double-enqueue),
//! - tasks expire: one not claimed within its expiry window is dropped
//!   on claim, never executed,
//! - late acknowledgment: a task stays in-flight until the worker has
//!   written the terminal status and acked,
//! - retries are new deliveries: a transient publish failure is
//!   re-delivered after a backoff delay held in the broker, so a worker
//!   never sleeps out a backoff and the task time limits only ever
//!   cover real work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// One publish attempt handed from the scanner to a worker
#[derive(Debug, Clone)]
pub struct RetryableTask {
    pub task_id: Uuid,
    pub post_id: i64,
    pub tenant_id: String,
    /// Delivery attempt, starting at 1 and incremented on redelivery
    pub attempt: u32,
    pub enqueued_at: i64,
    /// Unix timestamp after which the task must not be executed
    pub expires_at: i64,
    /// Earliest claimable time; in the future for retry deliveries
    ready_at: Instant,
}

impl RetryableTask {
    pub fn new(post_id: i64, tenant_id: String, expiry: Duration) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            task_id: Uuid::new_v4(),
            post_id,
            tenant_id,
            attempt: 1,
            enqueued_at: now,
            expires_at: now + expiry.as_secs() as i64,
            ready_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

struct Inner {
    queue: VecDeque<RetryableTask>,
    /// Retry deliveries waiting out their backoff
    delayed: Vec<RetryableTask>,
    /// Post ids that are queued, delayed, or claimed-but-unacked
    in_flight: HashSet<i64>,
    /// task_id -> post_id for claimed tasks awaiting ack
    unacked: HashMap<Uuid, i64>,
}

pub struct TaskBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl TaskBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                delayed: Vec::new(),
                in_flight: HashSet::new(),
                unacked: HashMap::new(),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a task unless its post already has one in flight.
    ///
    /// Returns whether the task was accepted. A full queue drops the
    /// task with a warning; the next scan will retry.
    pub fn enqueue(&self, task: RetryableTask) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.in_flight.contains(&task.post_id) {
            debug!(post_id = task.post_id, "post already in flight, skipping enqueue");
            return false;
        }
        if inner.queue.len() >= self.capacity {
            warn!(
                post_id = task.post_id,
                capacity = self.capacity,
                "task queue full, dropping task until next scan"
            );
            return false;
        }

        inner.in_flight.insert(task.post_id);
        inner.queue.push_back(task);
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Hand the oldest live task to the caller.
    ///
    /// Expired tasks are discarded here, on the claim path, so a stale
    /// task dies in the broker instead of reaching a worker.
    pub fn claim(&self) -> Option<RetryableTask> {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.inner.lock().unwrap();

        // Promote retry deliveries whose backoff has elapsed
        let ready = Instant::now();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].ready_at <= ready {
                let task = inner.delayed.swap_remove(i);
                inner.queue.push_back(task);
            } else {
                i += 1;
            }
        }

        while let Some(task) = inner.queue.pop_front() {
            if task.is_expired(now) {
                debug!(
                    post_id = task.post_id,
                    "dropping expired task (the next scan re-enqueues the post)"
                );
                inner.in_flight.remove(&task.post_id);
                continue;
            }
            inner.unacked.insert(task.task_id, task.post_id);
            return Some(task);
        }
        None
    }

    /// Wait until a task can be claimed
    pub async fn claim_wait(&self) -> RetryableTask {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.claim() {
                return task;
            }
            // Wake when a new task arrives or a delayed retry comes due
            match self.next_ready_in() {
                Some(wait) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn next_ready_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .delayed
            .iter()
            .map(|task| task.ready_at.saturating_duration_since(now))
            .min()
    }

    /// Acknowledge a completed task. Only called after the terminal
    /// status write; until then the post stays in flight.
    pub fn ack(&self, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(post_id) = inner.unacked.remove(&task_id) {
            inner.in_flight.remove(&post_id);
        }
    }

    /// Put a claimed task back for redelivery (worker shut down before
    /// completing it). Expired tasks are released instead of requeued.
    pub fn requeue(&self, mut task: RetryableTask) -> bool {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.inner.lock().unwrap();

        inner.unacked.remove(&task.task_id);
        if task.is_expired(now) {
            inner.in_flight.remove(&task.post_id);
            return false;
        }
        task.attempt += 1;
        inner.queue.push_front(task);
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Schedule a retry as a fresh delivery after `delay`. The post
    /// stays in flight the whole time, so the scanner cannot enqueue a
    /// competing task while the backoff runs. Retry deliveries carry no
    /// expiry; the backoff schedule already bounds how late they run.
    pub fn retry(&self, mut task: RetryableTask, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();

        inner.unacked.remove(&task.task_id);
        task.task_id = Uuid::new_v4();
        task.attempt += 1;
        task.ready_at = Instant::now() + delay;
        task.expires_at = i64::MAX;
        inner.delayed.push(task);
        drop(inner);

        // Wake a parked worker so it re-arms its timer for the new delay
        self.notify.notify_one();
    }

    /// Queued (unclaimed) task count
    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Posts that are queued or awaiting ack
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(post_id: i64) -> RetryableTask {
        RetryableTask::new(post_id, "tenant-1".to_string(), Duration::from_secs(55))
    }

    #[test]
    fn test_enqueue_claim_ack_cycle() {
        let broker = TaskBroker::new(16);

        assert!(broker.enqueue(task(1)));
        assert_eq!(broker.queued(), 1);
        assert_eq!(broker.in_flight(), 1);

        let claimed = broker.claim().unwrap();
        assert_eq!(claimed.post_id, 1);
        assert_eq!(broker.queued(), 0);
        // Claimed but unacked still counts as in flight
        assert_eq!(broker.in_flight(), 1);

        broker.ack(claimed.task_id);
        assert_eq!(broker.in_flight(), 0);
    }

    #[test]
    fn test_duplicate_post_not_enqueued() {
        let broker = TaskBroker::new(16);

        assert!(broker.enqueue(task(1)));
        // Same post re-seen by the next scan
        assert!(!broker.enqueue(task(1)));
        assert_eq!(broker.queued(), 1);

        // Still blocked while claimed-but-unacked
        let claimed = broker.claim().unwrap();
        assert!(!broker.enqueue(task(1)));

        // After ack the post can be enqueued again
        broker.ack(claimed.task_id);
        assert!(broker.enqueue(task(1)));
    }

    #[test]
    fn test_expired_task_dropped_on_claim() {
        let broker = TaskBroker::new(16);

        let mut stale = task(1);
        stale.expires_at = chrono::Utc::now().timestamp() - 1;
        broker.enqueue(stale);
        broker.enqueue(task(2));

        // The expired task is skipped; its post is released
        let claimed = broker.claim().unwrap();
        assert_eq!(claimed.post_id, 2);
        assert!(broker.enqueue(task(1)));
    }

    #[test]
    fn test_claim_empty() {
        let broker = TaskBroker::new(16);
        assert!(broker.claim().is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let broker = TaskBroker::new(2);

        assert!(broker.enqueue(task(1)));
        assert!(broker.enqueue(task(2)));
        assert!(!broker.enqueue(task(3)));
        assert_eq!(broker.queued(), 2);
    }

    #[test]
    fn test_requeue_for_redelivery() {
        let broker = TaskBroker::new(16);
        broker.enqueue(task(1));

        let claimed = broker.claim().unwrap();
        assert!(broker.requeue(claimed));

        // Redelivered to the next claimer, with the attempt bumped
        let again = broker.claim().unwrap();
        assert_eq!(again.post_id, 1);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_requeue_expired_releases_post() {
        let broker = TaskBroker::new(16);
        broker.enqueue(task(1));

        let mut claimed = broker.claim().unwrap();
        claimed.expires_at = chrono::Utc::now().timestamp() - 1;

        assert!(!broker.requeue(claimed));
        assert_eq!(broker.queued(), 0);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retry_is_delayed_and_counts_as_new_delivery() {
        let broker = TaskBroker::new(16);
        broker.enqueue(task(1));

        let claimed = broker.claim().unwrap();
        let first_delivery = claimed.task_id;
        broker.retry(claimed, Duration::from_millis(30));

        // Not claimable until the backoff elapses, but still in flight
        assert!(broker.claim().is_none());
        assert_eq!(broker.in_flight(), 1);
        assert!(!broker.enqueue(task(1)));

        tokio::time::sleep(Duration::from_millis(40)).await;

        let again = broker.claim().unwrap();
        assert_eq!(again.post_id, 1);
        assert_eq!(again.attempt, 2);
        assert_ne!(again.task_id, first_delivery);
    }

    #[tokio::test]
    async fn test_claim_wait_wakes_for_delayed_retry() {
        use std::sync::Arc;

        let broker = Arc::new(TaskBroker::new(16));
        broker.enqueue(task(3));
        let claimed = broker.claim().unwrap();
        broker.retry(claimed, Duration::from_millis(25));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.claim_wait().await })
        };

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.post_id, 3);
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn test_claim_wait_wakes_on_enqueue() {
        use std::sync::Arc;

        let broker = Arc::new(TaskBroker::new(16));
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.claim_wait().await })
        };

        // Give the waiter a chance to park
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue(task(7));

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.post_id, 7);
    }
}
