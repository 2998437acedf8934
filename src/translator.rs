//! Tool notification translator
//!
//! Consumes the Tool Notification Channel on its own worker, asks a
//! `TextGenerator` for a short phrase describing each tool call and
//! publishes it as a `tool_action` event on the Outbound Channel.
//! Descriptions are best effort: a failed or slow generation produces
//! no event, and the token stream never waits on any of this.

use crate::error::{RelayError, Result};
use crate::provider::{ChannelSubscription, Delivery};
use crate::publisher::ChannelPublisher;
use crate::types::{Event, EventData, ToolActionData, ToolDescriptor, ToolNotification};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = r#"You explain what an AI agent is doing to people who are not technical.

You receive a JSON object describing an action the agent is about to take. Reply with one short, friendly sentence describing it.

Rules:
- Plain everyday words, no technical jargon
- Fewer than 30 words
- Present continuous tense ("Looking up...", "Checking...", "Searching for...")
- Describe what is being done for the user, not how
- Mention parameter values when they help (names, cities, order numbers)
- Never say "tool", "API", "function" or "parameter"

Example:
{"toolName": "get_weather", "toolDescription": "retrieves weather data", "parameters": [{"name": "city", "value": "Paris"}]}
Checking the weather in Paris..."#;

/// Produces a human-readable description of a tool call
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn describe(&self, call: &ToolDescriptor) -> Result<String>;
}

/// Settings for `HttpTextGenerator`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpGeneratorConfig {
    /// OpenAI-compatible base URL; requests go to `<baseUrl>/chat/completions`
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub connect_timeout_secs: u64,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 1024,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Text generator backed by a chat completions endpoint
pub struct HttpTextGenerator {
    client: reqwest::Client,
    config: HttpGeneratorConfig,
}

impl HttpTextGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn request_body(&self, call: &ToolDescriptor) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": serde_json::to_string(call)? },
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        }))
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn describe(&self, call: &ToolDescriptor) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&self.request_body(call)?);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Translation(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Translation(format!(
                "Text generation error at {} ({}): {}",
                url, status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Translation(format!("Failed to parse completion: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RelayError::Translation("Completion has no content".to_string()))
    }
}

/// Trim whitespace and wrapping quotes; empty output is a failure
fn clean_description(raw: &str) -> Option<String> {
    let text = raw.trim().trim_matches('"').trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Turns tool notifications into `tool_action` events
pub struct Translator {
    generator: Arc<dyn TextGenerator>,
    outbound: ChannelPublisher,
    timeout: Duration,
}

impl Translator {
    pub fn new(generator: Arc<dyn TextGenerator>, outbound: ChannelPublisher, timeout: Duration) -> Self {
        Self {
            generator,
            outbound,
            timeout,
        }
    }

    /// Describe one notification; `None` when no event should be published
    pub async fn translate(&self, notification: &ToolNotification) -> Option<Event> {
        let context = &notification.context;
        let call = &notification.data;

        let outcome = match tokio::time::timeout(self.timeout, self.generator.describe(call)).await {
            Ok(Ok(raw)) => clean_description(&raw)
                .ok_or_else(|| RelayError::Translation("Empty description".to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::Translation(format!(
                "No description within {}s",
                self.timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(tool_action) => {
                tracing::debug!(
                    session_id = %context.session_id,
                    tool = %call.tool_name,
                    invocation_number = context.invocation_number,
                    description = %tool_action,
                    "Tool action described"
                );
                Some(Event::new(
                    &context.session_id,
                    &context.user_id,
                    EventData::ToolAction(ToolActionData {
                        tool_name: call.tool_name.clone(),
                        tool_action,
                        invocation_number: context.invocation_number,
                        run_id: context.run_id.clone(),
                    }),
                ))
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %context.session_id,
                    tool = %call.tool_name,
                    invocation_number = context.invocation_number,
                    error = %e,
                    "Tool action not described"
                );
                None
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> bool {
        let notification: ToolNotification = match serde_json::from_slice(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(sequence = delivery.sequence, error = %e, "Skipping undecodable tool notification");
                return false;
            }
        };

        let event = match self.translate(&notification).await {
            Some(event) => event,
            None => return false,
        };

        match self.outbound.publish(&event) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id = %event.session_id, error = %e, "Failed to queue tool action");
                false
            }
        }
    }

    /// Translate a batch concurrently and ack every delivery
    ///
    /// Returns the number of `tool_action` events published.
    pub async fn process_batch(&self, mut deliveries: Vec<Delivery>) -> usize {
        let published = futures::future::join_all(deliveries.iter().map(|d| self.handle(d)))
            .await
            .into_iter()
            .filter(|published| *published)
            .count();

        for delivery in deliveries.iter_mut() {
            if let Err(e) = delivery.ack().await {
                tracing::warn!(sequence = delivery.sequence, error = %e, "Failed to ack tool notification");
            }
        }
        published
    }

    /// Process batches until the subscription closes
    pub async fn run(
        &self,
        mut subscription: Box<dyn ChannelSubscription>,
        batch_size: usize,
        batch_wait: Duration,
    ) -> Result<()> {
        tracing::info!(subject = %self.outbound.subject(), "Translator started");
        while let Some(batch) = subscription.next_batch(batch_size, batch_wait).await? {
            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
        }
        tracing::info!("Translator stopped");
        Ok(())
    }
}
