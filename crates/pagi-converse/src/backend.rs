//! Agent backend: turn submission, image upload and conversation fetch.

use crate::config::ConverseConfig;
use crate::error::{ConverseError, ConverseResult};
use crate::transcript::Turn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Body of `POST /agent/plan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_voice_mode: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub id: String,
}

/// Reply of `POST /agent/plan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Some deployments nest the id as `conversation.id`; it wins when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
}

impl PlanResponse {
    pub fn resolved_conversation_id(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|c| c.id.as_str())
            .or(self.conversation_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Reply of `POST /agent/upload-image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub id: String,
    pub artifact_id: String,
    pub image_url: String,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> ConverseResult<PlanResponse>;

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> ConverseResult<UploadedImage>;

    /// Ordered turns of a conversation.
    async fn fetch_conversation(&self, conversation_id: &str) -> ConverseResult<Vec<Turn>>;
}

/// reqwest client for the agent HTTP API.
pub struct HttpAgentBackend {
    config: ConverseConfig,
    client: reqwest::Client,
}

impl HttpAgentBackend {
    pub fn new(config: ConverseConfig) -> Self {
        // The submitter enforces its own deadline; this only bounds a stuck socket.
        let client = reqwest::Client::builder()
            .timeout(config.submit_timeout() + Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        self.config.resolve_url(path)
    }
}

async fn error_body(res: reqwest::Response) -> String {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    format!("{} {}", status, body.trim())
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn plan(&self, request: &PlanRequest) -> ConverseResult<PlanResponse> {
        let url = self.url("/agent/plan");
        debug!("POST {} (voice: {:?})", url, request.is_voice_mode);
        let res = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ConverseError::SubmissionFailed(e.to_string()))?;

        if !res.status().is_success() {
            return Err(ConverseError::SubmissionFailed(error_body(res).await));
        }

        res.json::<PlanResponse>()
            .await
            .map_err(|e| ConverseError::SubmissionFailed(format!("response parse failed: {}", e)))
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> ConverseResult<UploadedImage> {
        let url = self.url("/agent/upload-image");
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| ConverseError::UploadFailed(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ConverseError::UploadFailed(e.to_string()))?;

        if !res.status().is_success() {
            return Err(ConverseError::UploadFailed(error_body(res).await));
        }

        res.json::<UploadedImage>()
            .await
            .map_err(|e| ConverseError::UploadFailed(format!("response parse failed: {}", e)))
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> ConverseResult<Vec<Turn>> {
        let mut url = reqwest::Url::parse(&self.url("/conversation"))
            .map_err(|e| ConverseError::Http(format!("bad conversation url: {}", e)))?;
        // The id is one path segment whatever it contains.
        url.path_segments_mut()
            .map_err(|_| ConverseError::Http("api base url cannot hold a path".to_string()))?
            .pop_if_empty()
            .push(conversation_id);
        let res = self.client.get(url).send().await?;
        if !res.status().is_success() {
            return Err(ConverseError::Http(error_body(res).await));
        }
        Ok(res.json::<Vec<Turn>>().await?)
    }
}
