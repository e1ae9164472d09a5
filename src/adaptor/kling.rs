use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AdaptorError, PricingError};
use crate::pricing::{FeatureRequest, PricingConfig, TaskAction};
use crate::task::{TaskInfo, TaskStatus};

use super::{join_url, ChannelInfo, FeaturePricing, FetchQuery, TaskAdaptor};

pub const DEFAULT_BASE_URL: &str = "https://api-beijing.klingai.com";
const TOKEN_TTL_SECS: i64 = 1800;

/// key: kling-adaptor -> video task queries and mode-based pricing
pub struct KlingAdaptor {
    client: Client,
    channel: Option<ChannelInfo>,
}

impl KlingAdaptor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            channel: None,
        }
    }

    pub fn channel(&self) -> Option<&ChannelInfo> {
        self.channel.as_ref()
    }
}

/// Query endpoint for each submission action.
pub fn query_path(action: &TaskAction) -> &'static str {
    match action {
        TaskAction::OmniVideo => "/v1/videos/omni-video",
        TaskAction::MotionControl => "/v1/videos/motion-control",
        TaskAction::MultiImage2Video => "/v1/videos/multi-image2video",
        TaskAction::AdvancedLipSync => "/v1/videos/advanced-lip-sync",
        TaskAction::VideoExtend => "/v1/videos/video-extend",
        TaskAction::AvatarImage2Video => "/v1/videos/avatar/image2video",
        TaskAction::MultiElementsCreate | TaskAction::MultiElementsQuery => {
            "/v1/videos/multi-elements"
        }
        TaskAction::Generate => "/v1/videos/image2video",
        _ => "/v1/videos/text2video",
    }
}

/// Keys issued by another gateway are passed through and routed under `/kling`.
fn is_relay_key(key: &str) -> bool {
    key.starts_with("sk-")
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    exp: i64,
    nbf: i64,
}

/// `access_key|secret_key` pairs are exchanged for a short-lived HS256 token;
/// anything else is sent as-is.
pub fn bearer_token(key: &str, now: i64) -> Result<String, AdaptorError> {
    if is_relay_key(key) {
        return Ok(key.to_string());
    }
    let Some((access, secret)) = key.split_once('|') else {
        return Ok(key.to_string());
    };
    let claims = Claims {
        iss: access.trim(),
        exp: now + TOKEN_TTL_SECS,
        nbf: now - 5,
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.trim().as_bytes()),
    )?;
    Ok(token)
}

#[derive(Debug, Default, Deserialize)]
struct KlingResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: KlingTask,
}

#[derive(Debug, Default, Deserialize)]
struct KlingTask {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    task_status: String,
    #[serde(default)]
    task_status_msg: String,
    #[serde(default)]
    task_result: KlingTaskResult,
}

#[derive(Debug, Default, Deserialize)]
struct KlingTaskResult {
    #[serde(default)]
    videos: Vec<KlingVideo>,
}

#[derive(Debug, Default, Deserialize)]
struct KlingVideo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    duration: String,
}

#[async_trait]
impl TaskAdaptor for KlingAdaptor {
    fn init(&mut self, info: &ChannelInfo) {
        self.channel = Some(info.clone());
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
        let path = query_path(&TaskAction::parse(query.action));
        let url = if is_relay_key(key) {
            join_url(base_url, &format!("/kling{path}/{}", query.task_id))
        } else {
            join_url(base_url, &format!("{path}/{}", query.task_id))
        };
        let token = bearer_token(key, Utc::now().timestamp())?;
        debug!(%url, task_id = query.task_id, "querying kling task");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(USER_AGENT, "kling-sdk/1.0")
            .send()
            .await?;
        Ok(response.bytes().await?)
    }

    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, AdaptorError> {
        let payload: KlingResponse = serde_json::from_slice(body)?;
        let status = match payload.data.task_status.as_str() {
            "submitted" => TaskStatus::Submitted,
            "processing" => TaskStatus::InProgress,
            "succeed" => TaskStatus::Success,
            "failed" => TaskStatus::Failure,
            other => {
                return Err(AdaptorError::Upstream(format!(
                    "unknown task status {other:?} (code {}, message {:?})",
                    payload.code, payload.message
                )))
            }
        };

        let mut info = TaskInfo {
            task_id: payload.data.task_id,
            status: status.as_str().to_string(),
            ..TaskInfo::default()
        };

        match status {
            TaskStatus::Success => {
                if let Some(video) = payload.data.task_result.videos.first() {
                    info.url = Some(video.url.clone()).filter(|url| !url.is_empty());
                    info.duration = video
                        .duration
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|seconds| seconds.is_finite());
                }
            }
            TaskStatus::Failure => {
                let reason = if payload.data.task_status_msg.is_empty() {
                    payload.message
                } else {
                    payload.data.task_status_msg
                };
                info.reason = Some(reason).filter(|reason| !reason.is_empty());
            }
            _ => {}
        }

        Ok(info)
    }

    fn pricing(&self) -> Option<&dyn FeaturePricing> {
        Some(self)
    }
}

impl FeaturePricing for KlingAdaptor {
    fn unit_price_scale(
        &self,
        config: &PricingConfig,
        request: &FeatureRequest,
    ) -> Result<f64, PricingError> {
        config.feature_scales.unit_price_scale(request)
    }

    fn price_scale(
        &self,
        config: &PricingConfig,
        request: &FeatureRequest,
    ) -> Result<f64, PricingError> {
        config.feature_scales.price_scale(request)
    }
}
