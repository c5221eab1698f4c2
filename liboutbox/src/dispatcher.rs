//! Task dispatcher: the worker pool that executes publish tasks
//!
//! Each worker claims one task at a time (no prefetch), runs one
//! publish attempt under the task time limits, writes the terminal
//! status, and only then acknowledges the task. A transient provider
//! error schedules a retry as a delayed broker re-delivery with
//! exponential backoff, so each delivery gets the full time limits and
//! no worker ever sleeps out a backoff. Credential problems fail the
//! post immediately because they never resolve themselves on retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{RetryableTask, TaskBroker};
use crate::config::DispatchSection;
use crate::db::Database;
use crate::error::{OutboxError, PublishError, Result, TokenError};
use crate::publisher::PublishAdapter;
use crate::token::{ResolvedToken, TokenService};
use crate::types::{PostStatus, ScheduledPost};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Retries after the first attempt, transient errors only
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Budget for one publish call, leaving room for the terminal
    /// status write inside the hard limit
    pub soft_time_limit: Duration,
    /// Wall-clock limit for one delivery (load, token, publish, write);
    /// retry backoff runs in the broker and is never counted
    pub hard_time_limit: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base: Duration::from_secs(60),
            retry_cap: Duration::from_secs(300),
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
        }
    }
}

impl DispatchConfig {
    pub fn from_section(section: &DispatchSection) -> Self {
        Self {
            workers: section.workers,
            max_retries: section.max_retries,
            retry_base: Duration::from_secs(section.retry_base_secs),
            retry_cap: Duration::from_secs(section.retry_cap_secs),
            soft_time_limit: Duration::from_secs(section.soft_time_limit_secs),
            hard_time_limit: Duration::from_secs(section.hard_time_limit_secs),
        }
    }
}

pub struct Dispatcher {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        db: Database,
        broker: Arc<TaskBroker>,
        tokens: Arc<TokenService>,
        adapter: Arc<dyn PublishAdapter>,
        config: DispatchConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let db = db.clone();
            let broker = broker.clone();
            let tokens = tokens.clone();
            let adapter = adapter.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    tokio::select! {
                        result = shutdown_rx.changed() => {
                            if result.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        task = broker.claim_wait() => {
                            run_task(&db, &broker, &tokens, adapter.as_ref(), &config, task).await;
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }

        info!(workers = config.workers, adapter = adapter.name(), "dispatcher started");

        Self {
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Signal the workers and wait for them. A worker mid-task finishes
    /// that task first. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

enum Disposition {
    /// Terminal outcome reached (or nothing to do); acknowledge
    Done,
    /// Could not reach a terminal outcome; hand back for redelivery
    Redeliver,
    /// Transient publish failure; re-deliver after the backoff delay
    Retry(Duration),
}

/// Execute one delivery end to end, then ack it, requeue it, or
/// schedule a retry delivery.
pub(crate) async fn run_task(
    db: &Database,
    broker: &TaskBroker,
    tokens: &TokenService,
    adapter: &dyn PublishAdapter,
    config: &DispatchConfig,
    task: RetryableTask,
) {
    let disposition = match timeout(
        config.hard_time_limit,
        execute(db, tokens, adapter, config, &task),
    )
    .await
    {
        Ok(disposition) => disposition,
        Err(_) => {
            error!(
                post_id = task.post_id,
                limit_secs = config.hard_time_limit.as_secs(),
                "task exceeded hard time limit"
            );
            write_failure(db, task.post_id, "publish attempt timed out").await;
            Disposition::Done
        }
    };

    match disposition {
        Disposition::Done => broker.ack(task.task_id),
        Disposition::Redeliver => {
            broker.requeue(task);
        }
        Disposition::Retry(delay) => broker.retry(task, delay),
    }
}

async fn execute(
    db: &Database,
    tokens: &TokenService,
    adapter: &dyn PublishAdapter,
    config: &DispatchConfig,
    task: &RetryableTask,
) -> Disposition {
    let post = match db.get_scheduled_post(task.post_id).await {
        Ok(Some(post)) => post,
        Ok(None) => {
            debug!(post_id = task.post_id, "post no longer exists, nothing to do");
            return Disposition::Done;
        }
        Err(e) => {
            warn!(
                post_id = task.post_id,
                delivery = task.attempt,
                "failed to load post, requeueing: {}", e
            );
            return Disposition::Redeliver;
        }
    };

    // A terminal row means another path already resolved this post
    if post.status != PostStatus::Pending {
        debug!(post_id = post.id, status = %post.status, "post already terminal, skipping");
        return Disposition::Done;
    }

    let resolved = match tokens.access_token_for(&post.tenant_id).await {
        Ok(resolved) => resolved,
        Err(OutboxError::Token(e)) => {
            info!(
                tenant_id = %post.tenant_id,
                post_id = post.id,
                "credential resolution failed, failing post: {}", e
            );
            write_failure(db, post.id, token_failure_message(&e)).await;
            return Disposition::Done;
        }
        Err(e) => {
            error!(post_id = post.id, "unexpected error resolving credentials: {}", e);
            write_failure(db, post.id, "internal error while resolving credentials").await;
            return Disposition::Done;
        }
    };

    match attempt_publish(adapter, &resolved, &post, config).await {
        Ok(provider_post_id) => {
            if task.attempt > 1 {
                info!(post_id = post.id, attempt = task.attempt, "publish succeeded after retry");
            }
            let now = chrono::Utc::now().timestamp();
            match db.mark_published(post.id, &provider_post_id, now).await {
                Ok(true) => {
                    info!(
                        tenant_id = %post.tenant_id,
                        post_id = post.id,
                        provider_post_id = %provider_post_id,
                        "post published"
                    );
                }
                Ok(false) => {
                    warn!(post_id = post.id, "post reached a terminal state concurrently");
                }
                Err(e) => {
                    error!(post_id = post.id, "failed to record publication: {}", e);
                }
            }
        }
        Err(e) => {
            let transient = matches!(&e, OutboxError::Publish(p) if p.is_transient());
            if transient && task.attempt <= config.max_retries {
                let delay = retry_delay(config, task.attempt);
                warn!(
                    tenant_id = %post.tenant_id,
                    post_id = post.id,
                    attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient publish failure, retry scheduled: {}", e
                );
                return Disposition::Retry(delay);
            }
            warn!(
                tenant_id = %post.tenant_id,
                post_id = post.id,
                attempt = task.attempt,
                "publish failed terminally: {}", e
            );
            write_failure(db, post.id, &publish_failure_message(&e)).await;
        }
    }

    Disposition::Done
}

/// One publish call under the soft time limit. A call that outlives the
/// limit becomes a transient timeout, eligible for retry like any
/// other transient failure.
async fn attempt_publish(
    adapter: &dyn PublishAdapter,
    token: &ResolvedToken,
    post: &ScheduledPost,
    config: &DispatchConfig,
) -> Result<String> {
    match timeout(
        config.soft_time_limit,
        adapter.publish(
            &token.access_token,
            &token.external_id,
            &post.content,
            post.image_ref.as_deref(),
        ),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(OutboxError::Publish(PublishError::Timeout(format!(
            "no response within {:?}",
            config.soft_time_limit
        )))),
    }
}

/// Backoff for the retry after `completed_attempt` failed attempts:
/// base * 2^(n-1), capped
fn retry_delay(config: &DispatchConfig, completed_attempt: u32) -> Duration {
    let factor = 2_u32.saturating_pow(completed_attempt.saturating_sub(1));
    config.retry_base.saturating_mul(factor).min(config.retry_cap)
}

/// Human-readable failure messages for token errors. Deliberately
/// static: the row's error_message must never carry secrets or raw
/// provider responses.
fn token_failure_message(error: &TokenError) -> &'static str {
    match error {
        TokenError::NotConnected(_) => "account not connected - reconnect your account",
        TokenError::RefreshUnavailable => "session expired - reconnect your account",
        TokenError::RefreshFailed(_) => "token refresh failed - reconnect your account",
    }
}

fn publish_failure_message(error: &OutboxError) -> String {
    match error {
        OutboxError::Publish(e) => format!("publish failed: {}", e),
        _ => "internal error during publish".to_string(),
    }
}

async fn write_failure(db: &Database, post_id: i64, message: &str) {
    match db.mark_failed(post_id, message).await {
        Ok(true) => {}
        Ok(false) => debug!(post_id, "failure write skipped, post already terminal"),
        Err(e) => error!(post_id, "failed to record failure: {}", e),
    }
}
