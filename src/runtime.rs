//! Agent runtime abstraction
//!
//! A runtime executes one agent invocation and returns its raw output as
//! a stream of byte chunks in the `data: <json>\n` framing. The
//! `ToolCallListener` for the invocation is handed over at invocation
//! time, so every run gets its own numbering and nothing is registered
//! globally.

use crate::error::{RelayError, Result};
use crate::tools::ToolCallListener;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Raw runtime output
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Everything a runtime needs to run one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    pub message_id: Option<String>,
    pub runtime_identifier: String,
    pub qualifier: String,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start an invocation and return its output stream
    async fn invoke(
        &self,
        request: &RuntimeRequest,
        listener: Arc<dyn ToolCallListener>,
    ) -> Result<ByteStream>;

    /// Prepare the runtime session ahead of a real invocation
    async fn warm_up(&self, _request: &RuntimeRequest) -> Result<()> {
        Ok(())
    }
}

/// Settings for `HttpAgentRuntime`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRuntimeConfig {
    /// Base URL of the runtime service (`<baseUrl>/invocations`)
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for HttpRuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            connect_timeout_secs: 10,
        }
    }
}

const SESSION_HEADER: &str = "x-runtime-session-id";
const USER_HEADER: &str = "x-runtime-user-id";
const RUNTIME_HEADER: &str = "x-runtime-identifier";
const QUALIFIER_HEADER: &str = "x-runtime-qualifier";

/// Runtime reached over HTTP with a streamed response body
///
/// The remote agent process reports its own tool calls to the Tool
/// Notification Channel, so the listener passed to `invoke` is unused.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    config: HttpRuntimeConfig,
}

impl HttpAgentRuntime {
    pub fn new(config: HttpRuntimeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/invocations", self.config.base_url.trim_end_matches('/'))
    }

    async fn post(&self, request: &RuntimeRequest, body: serde_json::Value) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header(SESSION_HEADER, &request.session_id)
            .header(USER_HEADER, &request.user_id)
            .header(RUNTIME_HEADER, &request.runtime_identifier)
            .header(QUALIFIER_HEADER, &request.qualifier)
            .json(&body);

        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("Failed to invoke agent runtime: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Transport(format!(
                "Agent runtime returned {}: {}",
                status, body
            )));
        }
        Ok(response)
    }
}

/// JSON body of an invocation request
pub(crate) fn invocation_body(request: &RuntimeRequest) -> serde_json::Value {
    serde_json::json!({
        "prompt": request.prompt,
        "userId": request.user_id,
        "messageId": request.message_id,
    })
}

/// JSON body of a warm-up request
pub(crate) fn warm_up_body(request: &RuntimeRequest) -> serde_json::Value {
    serde_json::json!({
        "isHeartbeat": true,
        "userId": request.user_id,
    })
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn invoke(
        &self,
        request: &RuntimeRequest,
        _listener: Arc<dyn ToolCallListener>,
    ) -> Result<ByteStream> {
        let response = self.post(request, invocation_body(request)).await?;

        tracing::debug!(
            session_id = %request.session_id,
            runtime = %request.runtime_identifier,
            qualifier = %request.qualifier,
            "Runtime stream opened"
        );

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RelayError::Transport(format!("Runtime stream failed: {}", e))))
            .boxed())
    }

    async fn warm_up(&self, request: &RuntimeRequest) -> Result<()> {
        let response = self.post(request, warm_up_body(request)).await?;
        response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(())
    }
}
