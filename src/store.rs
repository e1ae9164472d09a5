use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::error::StoreError;
use crate::task::{Channel, Task, TaskPlatform, TaskStatus};

/// key: task-store -> task records, channel lookup, user groups
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn channel(&self, channel_id: i32) -> Result<Channel, StoreError>;
    /// Persists status, progress, timestamps, result payload and quota.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;
    /// Marks every listed task FAILURE with `reason`. Returns the rows touched.
    async fn bulk_fail(&self, task_ids: &[String], reason: &str, now: i64) -> Result<u64, StoreError>;
    async fn user_group(&self, user_id: i32) -> Result<Option<String>, StoreError>;
    /// Latest record for a provider task id.
    async fn task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;
    async fn unfinished_tasks(&self, limit: i64) -> Result<Vec<Task>, StoreError>;
}

const TASK_COLUMNS: &str = r#"
    id, task_id, platform, channel_id, user_id, user_group, model, action,
    status, progress, quota, submit_time, start_time, finish_time,
    fail_reason, data, properties
"#;

pub struct PgTaskStore {
    pool: PgPool,
    channels: DashMap<i32, (Channel, Instant)>,
    channel_ttl: Duration,
}

impl PgTaskStore {
    pub fn new(pool: PgPool, channel_ttl: Duration) -> Self {
        Self {
            pool,
            channels: DashMap::new(),
            channel_ttl,
        }
    }

    fn cached_channel(&self, channel_id: i32) -> Option<Channel> {
        let entry = self.channels.get(&channel_id)?;
        let (channel, cached_at) = entry.value();
        (cached_at.elapsed() < self.channel_ttl).then(|| channel.clone())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn channel(&self, channel_id: i32) -> Result<Channel, StoreError> {
        if let Some(channel) = self.cached_channel(channel_id) {
            return Ok(channel);
        }

        let channel = sqlx::query_as::<_, Channel>(
            r#"
            SELECT id, type, base_url, key
            FROM channels
            WHERE id = $1
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ChannelNotFound(channel_id))?;

        if !self.channel_ttl.is_zero() {
            self.channels
                .insert(channel_id, (channel.clone(), Instant::now()));
        }
        Ok(channel)
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                progress = $3,
                quota = $4,
                start_time = $5,
                finish_time = $6,
                fail_reason = $7,
                data = $8
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(&task.progress)
        .bind(task.quota)
        .bind(task.start_time)
        .bind(task.finish_time)
        .bind(&task.fail_reason)
        .bind(&task.data)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.task_id.clone()));
        }
        Ok(())
    }

    async fn bulk_fail(&self, task_ids: &[String], reason: &str, now: i64) -> Result<u64, StoreError> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILURE',
                progress = '100%',
                fail_reason = $2,
                finish_time = CASE WHEN finish_time = 0 THEN $3 ELSE finish_time END
            WHERE task_id = ANY($1)
              AND status NOT IN ('SUCCESS', 'FAILURE')
            "#,
        )
        .bind(task_ids.to_vec())
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn user_group(&self, user_id: i32) -> Result<Option<String>, StoreError> {
        let group: Option<String> = sqlx::query_scalar(
            r#"
            SELECT user_group
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group.filter(|group| !group.is_empty()))
    }

    async fn task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1 ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_task_row).transpose()
    }

    async fn unfinished_tasks(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status NOT IN ('SUCCESS', 'FAILURE') \
             ORDER BY id ASC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match map_task_row(row) {
                Ok(task) => tasks.push(task),
                Err(err) => warn!(?err, "skipping unreadable task row"),
            }
        }
        Ok(tasks)
    }
}

fn map_task_row(row: &PgRow) -> Result<Task, StoreError> {
    let task_id: String = row.try_get("task_id")?;
    let raw_status: String = row.try_get("status")?;
    let status = TaskStatus::parse(&raw_status).ok_or_else(|| {
        StoreError::Message(format!("task {task_id} has unknown status {raw_status:?}"))
    })?;
    let platform: String = row.try_get("platform")?;

    Ok(Task {
        id: row.try_get("id")?,
        task_id,
        platform: TaskPlatform::from(platform),
        channel_id: row.try_get("channel_id")?,
        user_id: row.try_get("user_id")?,
        group: row.try_get("user_group")?,
        model: row.try_get("model")?,
        action: row.try_get("action")?,
        status,
        progress: row.try_get("progress")?,
        quota: row.try_get("quota")?,
        submit_time: row.try_get("submit_time")?,
        start_time: row.try_get("start_time")?,
        finish_time: row.try_get("finish_time")?,
        fail_reason: row.try_get("fail_reason")?,
        data: row.try_get("data")?,
        properties: row.try_get("properties")?,
    })
}
