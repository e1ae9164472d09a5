use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::adaptor::{AdaptorRegistry, ChannelInfo, FetchQuery, TaskAdaptor};
use crate::error::{SettlementError, SettlementResult};
use crate::ledger::QuotaLedger;
use crate::pricing::PricingConfig;
use crate::settlement::{SettlementOutcome, TaskSettlementReconciler};
use crate::store::TaskStore;
use crate::task::{Channel, Task, TaskInfo, TaskPlatform};

const MAX_INLINE_VIDEO_CHARS: usize = 256;

/// Per-channel tally, used for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelReport {
    pub updated: usize,
    pub settled: usize,
    pub errors: usize,
}

impl ChannelReport {
    fn record(&mut self, outcome: &SettlementOutcome) {
        self.updated += 1;
        if !matches!(
            outcome,
            SettlementOutcome::Pending | SettlementOutcome::AlreadySettled
        ) {
            self.settled += 1;
        }
    }
}

/// Task status as reported by an upstream gateway running the same relay protocol.
#[derive(Debug, Deserialize)]
struct RelayEnvelope {
    #[serde(default)]
    code: String,
    data: Option<RelayedTask>,
}

#[derive(Debug, Deserialize)]
struct RelayedTask {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: String,
    #[serde(default)]
    fail_reason: String,
    #[serde(default)]
    data: Value,
}

/// Decodes a relay envelope. Returns `None` unless it reports success with a task.
fn parse_relay_envelope(body: &[u8]) -> Option<(TaskInfo, Value)> {
    let envelope: RelayEnvelope = serde_json::from_slice(body).ok()?;
    if envelope.code != "success" {
        return None;
    }
    let relayed = envelope.data?;
    let fail_reason = Some(relayed.fail_reason).filter(|reason| !reason.is_empty());
    let info = TaskInfo {
        task_id: relayed.task_id,
        status: relayed.status,
        progress: Some(relayed.progress).filter(|progress| !progress.is_empty()),
        url: fail_reason.clone(),
        reason: fail_reason,
        ..TaskInfo::default()
    };
    Some((info, relayed.data))
}

/// Strips inline base64 media from a provider body before it is stored.
pub fn redact_response_body(body: &[u8]) -> Value {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Value::String(String::from_utf8_lossy(body).into_owned()),
    };

    if let Some(response) = value.get_mut("response").and_then(Value::as_object_mut) {
        response.remove("bytesBase64Encoded");
        if let Some(Value::String(video)) = response.get_mut("video") {
            if video.chars().count() > MAX_INLINE_VIDEO_CHARS {
                let kept: String = video.chars().take(MAX_INLINE_VIDEO_CHARS).collect();
                *video = format!("{kept}...");
            }
        }
        if let Some(videos) = response.get_mut("videos").and_then(Value::as_array_mut) {
            for video in videos.iter_mut().filter_map(Value::as_object_mut) {
                video.remove("bytesBase64Encoded");
            }
        }
    }
    value
}

/// key: task-poller -> per-channel polling of unfinished tasks
pub struct ChannelTaskPoller<'a> {
    store: &'a dyn TaskStore,
    ledger: &'a dyn QuotaLedger,
    adaptors: &'a dyn AdaptorRegistry,
    pricing: Arc<PricingConfig>,
}

impl<'a> ChannelTaskPoller<'a> {
    pub fn new(
        store: &'a dyn TaskStore,
        ledger: &'a dyn QuotaLedger,
        adaptors: &'a dyn AdaptorRegistry,
        pricing: Arc<PricingConfig>,
    ) -> Self {
        Self {
            store,
            ledger,
            adaptors,
            pricing,
        }
    }

    fn reconciler(&self) -> TaskSettlementReconciler<'a> {
        TaskSettlementReconciler::new(self.store, self.ledger, Arc::clone(&self.pricing))
    }

    /// Polls every channel of one platform in turn. A failing channel is logged
    /// and does not stop the others.
    pub async fn update_tasks_for_platform(
        &self,
        platform: &TaskPlatform,
        channel_tasks: &HashMap<i32, Vec<String>>,
        tasks: &mut HashMap<String, Task>,
    ) -> SettlementResult<()> {
        if self.adaptors.adaptor(platform).is_none() {
            return Err(SettlementError::UnsupportedPlatform(platform.to_string()));
        }

        let mut channel_ids: Vec<i32> = channel_tasks.keys().copied().collect();
        channel_ids.sort_unstable();
        for channel_id in channel_ids {
            let task_ids = &channel_tasks[&channel_id];
            match self.poll_channel(platform, channel_id, task_ids, tasks).await {
                Ok(report) => info!(
                    %platform,
                    channel_id,
                    updated = report.updated,
                    settled = report.settled,
                    errors = report.errors,
                    "channel tasks polled"
                ),
                Err(err) => error!(%platform, channel_id, %err, "channel failed to update async tasks"),
            }
        }
        Ok(())
    }

    /// Polls one channel's tasks sequentially. Per-task failures are logged and
    /// counted; they never abort the batch.
    pub async fn poll_channel(
        &self,
        platform: &TaskPlatform,
        channel_id: i32,
        task_ids: &[String],
        tasks: &mut HashMap<String, Task>,
    ) -> SettlementResult<ChannelReport> {
        if task_ids.is_empty() {
            return Ok(ChannelReport::default());
        }
        info!(%platform, channel_id, pending = task_ids.len(), "polling channel tasks");

        let channel = match self.store.channel(channel_id).await {
            Ok(channel) => channel,
            Err(source) => {
                let reason = format!("Failed to get channel info, channel ID: {channel_id}");
                self.fail_batch(task_ids, tasks, &reason).await;
                return Err(SettlementError::Channel { channel_id, source });
            }
        };

        let mut adaptor = self
            .adaptors
            .adaptor(platform)
            .ok_or_else(|| SettlementError::UnsupportedPlatform(platform.to_string()))?;
        let base_url = channel
            .base_url()
            .unwrap_or_else(|| adaptor.default_base_url())
            .to_string();
        adaptor.init(&ChannelInfo {
            channel_type: channel.channel_type,
            base_url: base_url.clone(),
            key: channel.key.clone(),
        });

        let reconciler = self.reconciler();
        let mut report = ChannelReport::default();
        for task_id in task_ids {
            match self
                .poll_task(adaptor.as_ref(), &reconciler, &channel, &base_url, task_id, tasks)
                .await
            {
                Ok(outcome) => {
                    debug!(%task_id, channel_id, ?outcome, "task reconciled");
                    report.record(&outcome);
                }
                Err(err) => {
                    error!(%task_id, channel_id, %err, "failed to update task");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn poll_task(
        &self,
        adaptor: &dyn TaskAdaptor,
        reconciler: &TaskSettlementReconciler<'_>,
        channel: &Channel,
        base_url: &str,
        task_id: &str,
        tasks: &mut HashMap<String, Task>,
    ) -> SettlementResult<SettlementOutcome> {
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SettlementError::TaskMissing(task_id.to_string()))?;

        let body = adaptor
            .fetch_task(
                base_url,
                &channel.key,
                FetchQuery {
                    task_id,
                    action: &task.action,
                },
            )
            .await?;
        debug!(%task_id, body = %String::from_utf8_lossy(&body), "fetched task body");

        let (mut info, data) = match parse_relay_envelope(&body) {
            Some(relayed) => relayed,
            None => {
                let info = adaptor.parse_task_result(&body)?;
                (info, redact_response_body(&body))
            }
        };
        info.data = Some(data);

        reconciler
            .reconcile(task, &info, adaptor.pricing(), Utc::now().timestamp())
            .await
    }

    /// Fails every pending task of an unusable channel. Preloaded tasks go
    /// through the reconciler so their pre-deductions are refunded.
    async fn fail_batch(
        &self,
        task_ids: &[String],
        tasks: &mut HashMap<String, Task>,
        reason: &str,
    ) {
        let now = Utc::now().timestamp();
        let reconciler = self.reconciler();
        let failure = TaskInfo::failed(reason);
        let mut orphaned = Vec::new();

        for task_id in task_ids {
            if !tasks.contains_key(task_id) {
                match self.store.task(task_id).await {
                    Ok(Some(task)) => {
                        tasks.insert(task_id.clone(), task);
                    }
                    Ok(None) => {
                        orphaned.push(task_id.clone());
                        continue;
                    }
                    Err(err) => {
                        error!(%task_id, ?err, "failed to load task of unavailable channel");
                        continue;
                    }
                }
            }
            let Some(task) = tasks.get_mut(task_id) else {
                continue;
            };
            if let Err(err) = reconciler.reconcile(task, &failure, None, now).await {
                error!(%task_id, %err, "failed to fail task of unavailable channel");
            }
        }

        if !orphaned.is_empty() {
            match self.store.bulk_fail(&orphaned, reason, now).await {
                Ok(updated) => warn!(updated, "bulk-failed tasks of unavailable channel"),
                Err(err) => error!(?err, "failed to bulk-fail tasks of unavailable channel"),
            }
        }
    }
}
