#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use task_settlement::adaptor::{AdaptorRegistry, ChannelInfo, FeaturePricing, FetchQuery, TaskAdaptor};
use task_settlement::ledger::{LedgerEntry, QuotaLedger};
use task_settlement::pricing::{FeatureRequest, PricingConfig};
use task_settlement::store::TaskStore;
use task_settlement::{
    AdaptorError, Channel, PricingError, StoreError, Task, TaskInfo, TaskPlatform, TaskStatus,
};

pub const VIDEO_MODEL: &str = "video-model";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAccount {
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
}

#[derive(Default)]
pub struct State {
    pub tasks: HashMap<String, Task>,
    pub channels: HashMap<i32, Channel>,
    pub users: HashMap<i32, UserAccount>,
    pub channel_used: HashMap<i32, i64>,
    pub logs: Vec<LedgerEntry>,
    pub bulk_failed: Vec<String>,
    pub updates: usize,
}

/// In-memory task store and ledger with switchable failures.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub fail_updates: AtomicBool,
    pub fail_ledger: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_user(self, user_id: i32, group: &str, quota: i64) -> Self {
        self.state().users.insert(
            user_id,
            UserAccount {
                group: group.to_string(),
                quota,
                used_quota: 0,
            },
        );
        self
    }

    pub fn with_channel(self, channel_id: i32, key: &str) -> Self {
        self.state().channels.insert(
            channel_id,
            Channel {
                id: channel_id,
                channel_type: 0,
                base_url: Some("http://upstream.invalid".to_string()),
                key: key.to_string(),
            },
        );
        self
    }

    pub fn with_task(self, task: Task) -> Self {
        self.state().tasks.insert(task.task_id.clone(), task);
        self
    }

    pub fn user(&self, user_id: i32) -> UserAccount {
        self.state().users.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn stored_task(&self, task_id: &str) -> Task {
        self.state().tasks.get(task_id).cloned().unwrap()
    }

    pub fn logs(&self) -> Vec<LedgerEntry> {
        self.state().logs.clone()
    }

    pub fn channel_used(&self, channel_id: i32) -> i64 {
        self.state()
            .channel_used
            .get(&channel_id)
            .copied()
            .unwrap_or_default()
    }

    fn ledger_guard(&self) -> Result<(), StoreError> {
        if self.fail_ledger.load(Ordering::SeqCst) {
            return Err(StoreError::Message("ledger unavailable".into()));
        }
        Ok(())
    }

    fn adjust(&self, user_id: i32, delta: i64) -> Result<(), StoreError> {
        self.ledger_guard()?;
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.quota += delta;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn channel(&self, channel_id: i32) -> Result<Channel, StoreError> {
        self.state()
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or(StoreError::ChannelNotFound(channel_id))
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Message("database unavailable".into()));
        }
        let mut state = self.state();
        state.updates += 1;
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn bulk_fail(&self, task_ids: &[String], reason: &str, now: i64) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut touched = 0;
        for task_id in task_ids {
            state.bulk_failed.push(task_id.clone());
            if let Some(task) = state.tasks.get_mut(task_id) {
                if task.status.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Failure;
                task.progress = "100%".into();
                task.fail_reason = reason.to_string();
                if task.finish_time == 0 {
                    task.finish_time = now;
                }
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn user_group(&self, user_id: i32) -> Result<Option<String>, StoreError> {
        Ok(self
            .state()
            .users
            .get(&user_id)
            .map(|user| user.group.clone())
            .filter(|group| !group.is_empty()))
    }

    async fn task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.state().tasks.get(task_id).cloned())
    }

    async fn unfinished_tasks(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .state()
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks.truncate(limit as usize);
        Ok(tasks)
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn increase_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        self.adjust(user_id, quota)
    }

    async fn decrease_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        self.adjust(user_id, -quota)
    }

    async fn add_user_used_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        self.ledger_guard()?;
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.used_quota += quota;
        Ok(())
    }

    async fn add_channel_used_quota(&self, channel_id: i32, quota: i64) -> Result<(), StoreError> {
        self.ledger_guard()?;
        *self.state().channel_used.entry(channel_id).or_default() += quota;
        Ok(())
    }

    async fn record_log(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.state().logs.push(entry.clone());
        Ok(())
    }
}

pub fn video_task(task_id: &str, channel_id: i32, user_id: i32, quota: i64) -> Task {
    Task {
        id: task_id.bytes().map(i64::from).sum(),
        task_id: task_id.to_string(),
        platform: TaskPlatform::Other("scripted".into()),
        channel_id,
        user_id,
        group: "default".into(),
        model: VIDEO_MODEL.into(),
        action: "generate".into(),
        status: TaskStatus::Submitted,
        progress: "10%".into(),
        quota,
        submit_time: 1_700_000_000,
        start_time: 0,
        finish_time: 0,
        fail_reason: String::new(),
        data: json!({}),
        properties: json!({}),
    }
}

/// 240 quota per second of video at group ratio 1.0.
pub fn video_pricing() -> PricingConfig {
    PricingConfig::from_json(
        r#"{
            "model_ratios": {"video-model": 240.0, "kling-v1": 10.0},
            "group_ratios": {"default": 1.0, "vip": 0.5}
        }"#,
    )
    .unwrap()
}

pub fn observed(status: &str) -> TaskInfo {
    TaskInfo {
        status: status.to_string(),
        ..TaskInfo::default()
    }
}

pub fn succeeded_after(seconds: f64) -> TaskInfo {
    TaskInfo {
        status: "SUCCESS".into(),
        url: Some("https://cdn.example/out.mp4".into()),
        duration: Some(seconds),
        ..TaskInfo::default()
    }
}

/// Feature pricing that returns a fixed unit scale.
pub struct FixedScale(pub f64);

impl FeaturePricing for FixedScale {
    fn unit_price_scale(&self, _: &PricingConfig, _: &FeatureRequest) -> Result<f64, PricingError> {
        Ok(self.0)
    }

    fn price_scale(&self, _: &PricingConfig, _: &FeatureRequest) -> Result<f64, PricingError> {
        Ok(self.0)
    }
}

/// Adaptor that answers from a shared table of JSON bodies keyed by task id.
/// Body format: `{"status": "...", "duration": 5.0, "reason": "..."}`.
pub struct ScriptedAdaptor {
    bodies: Arc<Mutex<HashMap<String, String>>>,
    fetched: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl TaskAdaptor for ScriptedAdaptor {
    fn init(&mut self, _info: &ChannelInfo) {}

    fn default_base_url(&self) -> &str {
        "http://scripted.invalid"
    }

    async fn fetch_task(
        &self,
        base_url: &str,
        _key: &str,
        query: FetchQuery<'_>,
    ) -> Result<Bytes, AdaptorError> {
        self.fetched
            .lock()
            .unwrap()
            .push((base_url.to_string(), query.task_id.to_string()));
        self.bodies
            .lock()
            .unwrap()
            .get(query.task_id)
            .cloned()
            .map(Bytes::from)
            .ok_or_else(|| AdaptorError::Upstream(format!("no response for {}", query.task_id)))
    }

    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, AdaptorError> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(TaskInfo {
            task_id: value["task_id"].as_str().unwrap_or_default().to_string(),
            status: value["status"].as_str().unwrap_or_default().to_string(),
            duration: value["duration"].as_f64(),
            reason: value["reason"].as_str().map(String::from),
            ..TaskInfo::default()
        })
    }
}

#[derive(Clone, Default)]
pub struct ScriptedRegistry {
    pub bodies: Arc<Mutex<HashMap<String, String>>>,
    pub fetched: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedRegistry {
    pub fn respond(&self, task_id: &str, body: Value) {
        self.bodies
            .lock()
            .unwrap()
            .insert(task_id.to_string(), body.to_string());
    }

    pub fn fetched_ids(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl AdaptorRegistry for ScriptedRegistry {
    fn adaptor(&self, platform: &TaskPlatform) -> Option<Box<dyn TaskAdaptor>> {
        match platform {
            TaskPlatform::Other(name) if name == "scripted" => Some(Box::new(ScriptedAdaptor {
                bodies: Arc::clone(&self.bodies),
                fetched: Arc::clone(&self.fetched),
            })),
            _ => None,
        }
    }
}
