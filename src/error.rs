use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

/// Configuration and lookup failures raised while pricing a task.
#[derive(Debug, Error)]
pub enum PricingError {
    #[error("model ratio not configured for {0}")]
    ModelRatioMissing(String),
    #[error("model price not configured for {0}")]
    ModelPriceMissing(String),
    #[error("completion ratio not configured for {0}")]
    CompletionRatioMissing(String),
    #[error("cache ratio not configured for {0}")]
    CacheRatioMissing(String),
    #[error("group ratio not configured for {0}")]
    GroupRatioMissing(String),
    #[error("no billing group resolvable for user {0}")]
    GroupUnresolved(i32),
    #[error("model {model} does not support {mode} mode")]
    UnsupportedMode { model: String, mode: String },
    #[error("unsupported mode: {0}")]
    UnknownMode(String),
    #[error("quota for {model} is out of range: {value}")]
    QuotaOutOfRange { model: String, value: f64 },
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("failed to parse pricing config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to read pricing config: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for PricingError {
    fn into_response(self) -> Response {
        let status = match self {
            PricingError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

/// Failures talking to or decoding an upstream provider.
#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode task result: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream rejected task query: {0}")]
    Upstream(String),
    #[error("failed to sign request: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("channel {0} not found")]
    ChannelNotFound(i32),
    #[error("user {0} not found")]
    UserNotFound(i32),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("pricing error: {0}")]
    Pricing(#[from] PricingError),
    #[error("adaptor error: {0}")]
    Adaptor(#[from] AdaptorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to persist task {task_id}: {source}")]
    Persist {
        task_id: String,
        #[source]
        source: StoreError,
    },
    #[error("ledger mutation failed for task {task_id}: {source}")]
    Ledger {
        task_id: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to resolve channel {channel_id}: {source}")]
    Channel {
        channel_id: i32,
        #[source]
        source: StoreError,
    },
    #[error("task {0} not present in the preloaded batch")]
    TaskMissing(String),
    #[error("no task adaptor registered for platform {0}")]
    UnsupportedPlatform(String),
}

pub type SettlementResult<T> = Result<T, SettlementError>;
