use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::AdaptorError;
use crate::task::{TaskInfo, TaskStatus};

use super::{join_url, ChannelInfo, FetchQuery, TaskAdaptor};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
/// Channel type of Azure OpenAI deployments, which use a different path and auth header.
pub const AZURE_CHANNEL_TYPE: i32 = 3;

pub struct SoraAdaptor {
    client: Client,
    channel_type: i32,
    server_address: String,
}

impl SoraAdaptor {
    /// `server_address` is the gateway's public origin; finished videos are
    /// served from it rather than from the provider.
    pub fn new(client: Client, server_address: impl Into<String>) -> Self {
        Self {
            client,
            channel_type: 0,
            server_address: server_address.into(),
        }
    }

    fn content_url(&self, video_id: &str) -> String {
        join_url(&self.server_address, &format!("/v1/videos/{video_id}/content"))
    }

    fn is_azure(&self) -> bool {
        self.channel_type == AZURE_CHANNEL_TYPE
    }
}

#[derive(Debug, Deserialize)]
struct VideoJob {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: i64,
    #[serde(default)]
    error: Option<VideoJobError>,
}

#[derive(Debug, Deserialize)]
struct VideoJobError {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl TaskAdaptor for SoraAdaptor {
    fn init(&mut self, info: &ChannelInfo) {
        self.channel_type = info.channel_type;
    }

    fn default_base_url(&self) -> &str {
        DEFAULT_BASE_URL
    }

    async fn fetch_task(
        &self,
        base_url: &str,
        key: &str,
        query: FetchQuery<'_>,
    ) -> Result<Bytes, AdaptorError> {
        let request = if self.is_azure() {
            let url = join_url(base_url, &format!("/openai/v1/videos/{}", query.task_id));
            self.client.get(url).header("api-key", key)
        } else {
            let url = join_url(base_url, &format!("/v1/videos/{}", query.task_id));
            self.client.get(url).header(AUTHORIZATION, format!("Bearer {key}"))
        };
        debug!(task_id = query.task_id, azure = self.is_azure(), "querying video job");
        let response = request.send().await?;
        Ok(response.bytes().await?)
    }

    /// Statuses outside the known vocabulary are passed through unchanged.
    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, AdaptorError> {
        let job: VideoJob = serde_json::from_slice(body)?;
        let status = match job.status.as_str() {
            "queued" | "pending" | "submitted" => TaskStatus::Queued.as_str().to_string(),
            "processing" | "in_progress" => TaskStatus::InProgress.as_str().to_string(),
            "completed" | "succeeded" => TaskStatus::Success.as_str().to_string(),
            "failed" | "cancelled" | "canceled" => TaskStatus::Failure.as_str().to_string(),
            other => other.to_string(),
        };

        let reason = if status == TaskStatus::Failure.as_str() {
            Some(
                job.error
                    .map(|error| error.message)
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| "task failed".to_string()),
            )
        } else {
            None
        };

        let url = (status == TaskStatus::Success.as_str() && !job.id.is_empty())
            .then(|| self.content_url(&job.id));

        Ok(TaskInfo {
            progress: (job.progress > 0 && job.progress < 100)
                .then(|| format!("{}%", job.progress)),
            task_id: job.id,
            status,
            reason,
            url,
            ..TaskInfo::default()
        })
    }
}
