//! Due-work scanner
//!
//! Periodically queries for pending posts whose scheduled time has
//! passed and hands each one to the broker as a task. The scanner is an
//! owned object with an explicit lifecycle: `start` spawns the loop,
//! `stop` signals it and awaits termination, and dropping the scanner
//! without stopping simply abandons the loop at its next tick check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::broker::{RetryableTask, TaskBroker};
use crate::config::BrokerConfig;
use crate::db::Database;

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    pub scan_interval: Duration,
    pub task_expiry: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            task_expiry: Duration::from_secs(55),
            heartbeat_interval: Duration::from_secs(300),
        }
    }
}

impl ScannerConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            task_expiry: Duration::from_secs(config.task_expiry_secs),
            ..Default::default()
        }
    }
}

/// One scan pass: enqueue every due pending post.
///
/// Errors are logged and swallowed; a failed scan never takes the loop
/// down. Returns the number of tasks accepted by the broker.
pub async fn scan_once(db: &Database, broker: &TaskBroker, task_expiry: Duration) -> usize {
    let now = chrono::Utc::now().timestamp();

    let due = match db.get_due_posts(now).await {
        Ok(posts) => posts,
        Err(e) => {
            error!("due-post scan failed: {}", e);
            return 0;
        }
    };

    let mut enqueued = 0;
    for post in due {
        let task = RetryableTask::new(post.id, post.tenant_id.clone(), task_expiry);
        if broker.enqueue(task) {
            enqueued += 1;
        }
    }

    if enqueued > 0 {
        info!(count = enqueued, "enqueued due posts");
    }
    enqueued
}

pub struct Scanner {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    /// Spawn the scan loop. The first scan runs immediately.
    pub fn start(db: Database, broker: Arc<TaskBroker>, config: ScannerConfig) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = config.scan_interval.as_secs(),
                expiry_secs = config.task_expiry.as_secs(),
                "scanner started"
            );
            let mut last_heartbeat = Instant::now();

            loop {
                scan_once(&db, &broker, config.task_expiry).await;

                if last_heartbeat.elapsed() >= config.heartbeat_interval {
                    info!(queued = broker.queued(), in_flight = broker.in_flight(), "scanner alive");
                    last_heartbeat = Instant::now();
                }

                tokio::select! {
                    _ = sleep(config.scan_interval) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("scanner stopped");
        });

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
