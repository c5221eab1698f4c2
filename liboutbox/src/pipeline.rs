//! Pipeline lifecycle: wiring and startup/shutdown ordering
//!
//! The pipeline owns every moving part of the publish path. All
//! collaborators are supplied at construction, so a missing adapter or
//! OAuth client is a startup failure, never a mid-task surprise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::TaskBroker;
use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::dispatcher::{self, DispatchConfig, Dispatcher};
use crate::error::Result;
use crate::publisher::PublishAdapter;
use crate::scanner::{self, Scanner, ScannerConfig};
use crate::token::{OAuthApi, TokenService};
use crate::vault::CredentialVault;

/// Deliveries of one task the inline drain will run before giving up
/// on it. Covers a task being endlessly requeued because its post row
/// cannot be loaded.
const MAX_DRAIN_REDELIVERIES: u32 = 3;

pub struct Pipeline {
    db: Database,
    vault: CredentialVault,
    broker: Arc<TaskBroker>,
    scanner: Scanner,
    dispatcher: Dispatcher,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Build every component and start the scanner and worker pool
    pub async fn start(
        config: &Config,
        cipher: Arc<TokenCipher>,
        adapter: Arc<dyn PublishAdapter>,
        oauth: Arc<dyn OAuthApi>,
    ) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let vault = CredentialVault::new(&db, cipher);
        let tokens = Arc::new(TokenService::new(
            Arc::new(vault.clone()),
            oauth,
            config.provider.name.clone(),
        ));
        let broker = Arc::new(TaskBroker::new(config.broker.queue_capacity));

        let scanner = Scanner::start(
            db.clone(),
            broker.clone(),
            ScannerConfig::from_broker_config(&config.broker),
        );
        let dispatcher = Dispatcher::start(
            db.clone(),
            broker.clone(),
            tokens,
            adapter,
            DispatchConfig::from_section(&config.dispatch),
        );

        info!("pipeline started");

        Ok(Self {
            db,
            vault,
            broker,
            scanner,
            dispatcher,
            stopped: AtomicBool::new(false),
        })
    }

    /// Stop the scanner first so no new tasks arrive, then the workers.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scanner.stop().await;
        self.dispatcher.shutdown().await;
        info!("pipeline stopped");
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn broker(&self) -> &TaskBroker {
        &self.broker
    }

    /// One scan followed by an inline drain of the queue, without
    /// starting any background loops. Used by `outbox-send --once` and
    /// by tests. Returns the number of tasks executed.
    pub async fn run_once(
        config: &Config,
        cipher: Arc<TokenCipher>,
        adapter: Arc<dyn PublishAdapter>,
        oauth: Arc<dyn OAuthApi>,
    ) -> Result<usize> {
        let db = Database::new(&config.database.path).await?;
        let vault = CredentialVault::new(&db, cipher);
        let tokens = TokenService::new(
            Arc::new(vault),
            oauth,
            config.provider.name.clone(),
        );
        let broker = TaskBroker::new(config.broker.queue_capacity);
        let dispatch_config = DispatchConfig::from_section(&config.dispatch);
        let task_expiry =
            std::time::Duration::from_secs(config.broker.task_expiry_secs);

        scanner::scan_once(&db, &broker, task_expiry).await;

        Ok(drain_queue(&db, &broker, &tokens, adapter.as_ref(), &dispatch_config).await)
    }
}

/// Run deliveries until the broker empties, waiting out retry backoff.
/// A task redelivered more than `MAX_DRAIN_REDELIVERIES` times is
/// abandoned so a persistent load failure cannot spin the drain.
/// Returns the number of deliveries run.
async fn drain_queue(
    db: &Database,
    broker: &TaskBroker,
    tokens: &TokenService,
    adapter: &dyn PublishAdapter,
    config: &DispatchConfig,
) -> usize {
    let mut deliveries = 0;
    let mut seen: HashMap<Uuid, u32> = HashMap::new();
    loop {
        let task = match broker.claim() {
            Some(task) => task,
            None => {
                if broker.in_flight() == 0 {
                    break;
                }
                // A retry delivery is waiting out its backoff
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        // Retry deliveries get fresh task ids; only same-delivery
        // requeues accumulate here.
        let times = seen.entry(task.task_id).or_insert(0);
        *times += 1;
        if *times > MAX_DRAIN_REDELIVERIES {
            warn!(
                post_id = task.post_id,
                "abandoning task after repeated redelivery"
            );
            break;
        }

        dispatcher::run_task(db, broker, tokens, adapter, config, task).await;
        deliveries += 1;
    }
    deliveries
}
