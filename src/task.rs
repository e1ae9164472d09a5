use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Lifecycle of an async generation job as persisted in `tasks.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "SUBMITTED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    /// Accepts the canonical names plus the synonyms providers commonly report.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let status = match normalized.as_str() {
            "submitted" => TaskStatus::Submitted,
            "queued" | "pending" => TaskStatus::Queued,
            "in_progress" | "processing" | "running" => TaskStatus::InProgress,
            "success" | "succeed" | "succeeded" | "completed" => TaskStatus::Success,
            "failure" | "failed" | "cancelled" | "canceled" => TaskStatus::Failure,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn default_progress(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "10%",
            TaskStatus::Queued => "20%",
            TaskStatus::InProgress => "30%",
            TaskStatus::Success | TaskStatus::Failure => "100%",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider family a task was submitted to. Selects the adaptor used to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskPlatform {
    Kling,
    Sora,
    Other(String),
}

impl TaskPlatform {
    pub fn as_str(&self) -> &str {
        match self {
            TaskPlatform::Kling => "kling",
            TaskPlatform::Sora => "sora",
            TaskPlatform::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for TaskPlatform {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kling" => TaskPlatform::Kling,
            "sora" => TaskPlatform::Sora,
            _ => TaskPlatform::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for TaskPlatform {
    fn from(raw: String) -> Self {
        TaskPlatform::from(raw.as_str())
    }
}

impl From<TaskPlatform> for String {
    fn from(platform: TaskPlatform) -> Self {
        platform.as_str().to_string()
    }
}

impl fmt::Display for TaskPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted async task. `quota` holds the amount currently charged for it:
/// the pre-deduction until settlement, then the settled actual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: i64,
    pub task_id: String,
    pub platform: TaskPlatform,
    pub channel_id: i32,
    pub user_id: i32,
    pub group: String,
    pub model: String,
    pub action: String,
    pub status: TaskStatus,
    pub progress: String,
    pub quota: i64,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub fail_reason: String,
    pub data: Value,
    pub properties: Value,
}

impl Task {
    /// Model named at submission, falling back to the request properties.
    pub fn origin_model(&self) -> &str {
        if !self.model.is_empty() {
            return &self.model;
        }
        self.properties
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Channel {
    pub id: i32,
    #[sqlx(rename = "type")]
    pub channel_type: i32,
    pub base_url: Option<String>,
    pub key: String,
}

impl Channel {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Provider-neutral observation of a task, produced by an adaptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub status: String,
    pub progress: Option<String>,
    pub url: Option<String>,
    pub reason: Option<String>,
    pub duration: Option<f64>,
    pub total_tokens: Option<i64>,
    /// Payload to store on the task once the observation is applied.
    pub data: Option<Value>,
}

impl TaskInfo {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure.as_str().to_string(),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Billable usage reported by the provider. Duration wins over tokens.
    pub fn usage(&self) -> Option<UsageSignal> {
        if let Some(seconds) = self
            .duration
            .filter(|value| value.is_finite() && *value > 0.0)
        {
            return Some(UsageSignal::Seconds(seconds));
        }
        self.total_tokens
            .filter(|value| *value > 0)
            .map(UsageSignal::Tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UsageSignal {
    Seconds(f64),
    Tokens(i64),
}

impl UsageSignal {
    pub fn units(&self) -> f64 {
        match self {
            UsageSignal::Seconds(seconds) => *seconds,
            UsageSignal::Tokens(tokens) => *tokens as f64,
        }
    }
}
