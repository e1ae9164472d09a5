use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;

use crate::error::{AdaptorError, PricingError};
use crate::pricing::{FeatureRequest, PricingConfig};
use crate::task::{TaskInfo, TaskPlatform};

pub mod kling;
pub mod sora;

pub use kling::KlingAdaptor;
pub use sora::SoraAdaptor;

/// Connection details for the channel a task was routed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_type: i32,
    pub base_url: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchQuery<'a> {
    pub task_id: &'a str,
    pub action: &'a str,
}

/// Feature-dependent pricing for providers whose price varies by mode and add-ons.
pub trait FeaturePricing: Send + Sync {
    fn unit_price_scale(
        &self,
        config: &PricingConfig,
        request: &FeatureRequest,
    ) -> Result<f64, PricingError>;

    fn price_scale(&self, config: &PricingConfig, request: &FeatureRequest)
        -> Result<f64, PricingError>;
}

/// key: task-adaptor -> provider status query and response normalization
#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn init(&mut self, info: &ChannelInfo);
    fn default_base_url(&self) -> &str;
    /// Raw provider body for one task. Non-2xx responses are returned as-is.
    async fn fetch_task(
        &self,
        base_url: &str,
        key: &str,
        query: FetchQuery<'_>,
    ) -> Result<Bytes, AdaptorError>;
    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, AdaptorError>;
    fn pricing(&self) -> Option<&dyn FeaturePricing> {
        None
    }
}

pub trait AdaptorRegistry: Send + Sync {
    fn adaptor(&self, platform: &TaskPlatform) -> Option<Box<dyn TaskAdaptor>>;
}

/// Registry of the built-in providers sharing one HTTP client.
#[derive(Clone)]
pub struct DefaultAdaptors {
    client: Client,
    server_address: String,
}

impl DefaultAdaptors {
    pub fn new(timeout: Duration, server_address: impl Into<String>) -> Result<Self, AdaptorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server_address: server_address.into(),
        })
    }
}

impl AdaptorRegistry for DefaultAdaptors {
    fn adaptor(&self, platform: &TaskPlatform) -> Option<Box<dyn TaskAdaptor>> {
        match platform {
            TaskPlatform::Kling => Some(Box::new(KlingAdaptor::new(self.client.clone()))),
            TaskPlatform::Sora => Some(Box::new(SoraAdaptor::new(
                self.client.clone(),
                self.server_address.clone(),
            ))),
            TaskPlatform::Other(_) => None,
        }
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}
