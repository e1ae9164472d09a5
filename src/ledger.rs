use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

use crate::error::StoreError;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Refund,
    TopUp,
    Credit,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Refund => "refund",
            LedgerEntryKind::TopUp => "top_up",
            LedgerEntryKind::Credit => "credit",
        }
    }
}

/// Audit record written alongside every balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub user_id: i32,
    pub channel_id: i32,
    pub task_id: String,
    pub model: String,
    pub kind: LedgerEntryKind,
    pub quota: i64,
    pub content: String,
}

/// key: quota-ledger -> user balances, usage counters, audit log.
///
/// Each call is atomic on its own; callers sequence them.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn increase_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError>;
    async fn decrease_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError>;
    async fn add_user_used_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError>;
    async fn add_channel_used_quota(&self, channel_id: i32, quota: i64) -> Result<(), StoreError>;
    async fn record_log(&self, entry: &LedgerEntry) -> Result<(), StoreError>;
}

/// Returns `quota` to the user. Only the balance change can fail the call.
pub async fn refund(
    ledger: &dyn QuotaLedger,
    task: &Task,
    quota: i64,
    content: String,
) -> Result<(), StoreError> {
    ledger.increase_user_quota(task.user_id, quota).await?;
    write_log(ledger, task, LedgerEntryKind::Refund, quota, content).await;
    Ok(())
}

/// Charges the shortfall between the pre-deduction and the settled amount and
/// counts it as usage against the user and channel.
pub async fn top_up(
    ledger: &dyn QuotaLedger,
    task: &Task,
    delta: i64,
    content: String,
) -> Result<(), StoreError> {
    ledger.decrease_user_quota(task.user_id, delta).await?;
    if let Err(err) = ledger.add_user_used_quota(task.user_id, delta).await {
        warn!(?err, task_id = %task.task_id, user_id = task.user_id, "failed to bump user used quota");
    }
    if let Err(err) = ledger.add_channel_used_quota(task.channel_id, delta).await {
        warn!(?err, task_id = %task.task_id, channel_id = task.channel_id, "failed to bump channel used quota");
    }
    write_log(ledger, task, LedgerEntryKind::TopUp, delta, content).await;
    Ok(())
}

/// Returns an over-collected pre-deduction.
pub async fn credit(
    ledger: &dyn QuotaLedger,
    task: &Task,
    amount: i64,
    content: String,
) -> Result<(), StoreError> {
    ledger.increase_user_quota(task.user_id, amount).await?;
    write_log(ledger, task, LedgerEntryKind::Credit, amount, content).await;
    Ok(())
}

async fn write_log(
    ledger: &dyn QuotaLedger,
    task: &Task,
    kind: LedgerEntryKind,
    quota: i64,
    content: String,
) {
    let entry = LedgerEntry {
        user_id: task.user_id,
        channel_id: task.channel_id,
        task_id: task.task_id.clone(),
        model: task.model.clone(),
        kind,
        quota,
        content,
    };
    if let Err(err) = ledger.record_log(&entry).await {
        warn!(?err, task_id = %task.task_id, kind = kind.as_str(), "failed to record ledger log");
    }
}

#[derive(Clone)]
pub struct PgQuotaLedger {
    pool: PgPool,
}

impl PgQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn adjust_user(&self, user_id: i32, delta: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET quota = quota + $2
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for PgQuotaLedger {
    async fn increase_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        self.adjust_user(user_id, quota).await
    }

    async fn decrease_user_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        self.adjust_user(user_id, -quota).await
    }

    async fn add_user_used_quota(&self, user_id: i32, quota: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET used_quota = used_quota + $2,
                request_count = request_count + 1
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(quota)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn add_channel_used_quota(&self, channel_id: i32, quota: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE channels
            SET used_quota = used_quota + $2
            WHERE id = $1
            "#,
        )
        .bind(channel_id)
        .bind(quota)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ChannelNotFound(channel_id));
        }
        Ok(())
    }

    async fn record_log(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_logs (user_id, channel_id, task_id, model, kind, quota, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.channel_id)
        .bind(&entry.task_id)
        .bind(&entry.model)
        .bind(entry.kind.as_str())
        .bind(entry.quota)
        .bind(&entry.content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
