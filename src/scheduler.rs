use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::adaptor::AdaptorRegistry;
use crate::config;
use crate::ledger::{PgQuotaLedger, QuotaLedger};
use crate::poller::ChannelTaskPoller;
use crate::pricing::PricingHandle;
use crate::store::{PgTaskStore, TaskStore};
use crate::task::{Task, TaskPlatform};

/// Unfinished tasks of one platform, grouped by the channel that owns them.
#[derive(Debug, Default)]
pub struct PlatformBatch {
    pub channel_tasks: HashMap<i32, Vec<String>>,
    pub tasks: HashMap<String, Task>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub loaded: usize,
    pub platforms: usize,
    pub failed_platforms: usize,
}

pub fn partition_tasks(tasks: Vec<Task>) -> HashMap<TaskPlatform, PlatformBatch> {
    let mut batches: HashMap<TaskPlatform, PlatformBatch> = HashMap::new();
    for task in tasks {
        let batch = batches.entry(task.platform.clone()).or_default();
        batch
            .channel_tasks
            .entry(task.channel_id)
            .or_default()
            .push(task.task_id.clone());
        batch.tasks.insert(task.task_id.clone(), task);
    }
    batches
}

/// key: task-poll-scheduler -> periodic settlement of unfinished tasks
pub fn spawn<R>(pool: PgPool, pricing: Arc<PricingHandle>, adaptors: Arc<R>) -> JoinHandle<()>
where
    R: AdaptorRegistry + 'static,
{
    let interval = Duration::from_secs(*config::TASK_POLL_INTERVAL_SECS);
    let batch_limit = *config::TASK_POLL_BATCH_LIMIT;
    let store = PgTaskStore::new(
        pool.clone(),
        Duration::from_secs(*config::CHANNEL_CACHE_TTL_SECS),
    );
    let ledger = PgQuotaLedger::new(pool);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(
                &store,
                &ledger,
                adaptors.as_ref(),
                pricing.as_ref(),
                batch_limit,
            )
            .await
            {
                warn!(?err, "task settlement tick failed");
            }
        }
    })
}

/// key: task-poll-scheduler -> tick handler
pub async fn process_tick(
    store: &dyn TaskStore,
    ledger: &dyn QuotaLedger,
    adaptors: &dyn AdaptorRegistry,
    pricing: &PricingHandle,
    batch_limit: i64,
) -> Result<TickSummary> {
    if let Err(err) = pricing.reload() {
        warn!(?err, "pricing reload failed, keeping previous configuration");
    }

    let tasks = store.unfinished_tasks(batch_limit).await?;
    let loaded = tasks.len();
    if loaded == 0 {
        debug!("no unfinished tasks");
        return Ok(TickSummary::default());
    }

    let batches = partition_tasks(tasks);
    let platforms = batches.len();
    let poller = ChannelTaskPoller::new(store, ledger, adaptors, pricing.snapshot());
    let poller = &poller;

    let results = join_all(batches.into_iter().map(|(platform, mut batch)| async move {
        let result = poller
            .update_tasks_for_platform(&platform, &batch.channel_tasks, &mut batch.tasks)
            .await;
        (platform, result)
    }))
    .await;

    let mut failed_platforms = 0;
    for (platform, result) in results {
        if let Err(err) = result {
            failed_platforms += 1;
            warn!(%platform, %err, "platform tasks not polled");
        }
    }

    info!(loaded, platforms, failed_platforms, "task settlement tick finished");
    Ok(TickSummary {
        loaded,
        platforms,
        failed_platforms,
    })
}
