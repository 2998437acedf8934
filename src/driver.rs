//! Agent Invocation Driver
//!
//! Runs one agent invocation per request. Runtime output goes through a
//! per-invocation `FrameParser`; every decoded token is numbered and
//! published to the Outbound Channel at once, without waiting on any
//! consumer. The terminal record ends the invocation: a final answer is
//! published and appended to the history store in one write, a runtime
//! or transport failure is published as a single `error` event.

use crate::error::{RelayError, Result};
use crate::frame::{Frame, FrameParser};
use crate::history::{ExchangeRecord, HistoryStore};
use crate::publisher::ChannelPublisher;
use crate::runtime::{AgentRuntime, ByteStream, RuntimeRequest};
use crate::tools::{NoopListener, ToolCallListener, ToolNotifier};
use crate::types::{ErrorData, Event, EventData, FinalResponse, TokenData};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// A client's request to run the agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    pub message_id: Option<String>,
    pub runtime_identifier: Option<String>,
    pub qualifier: Option<String>,
}

impl InvocationRequest {
    /// Check required fields and build the runtime request
    pub fn validate(&self) -> Result<RuntimeRequest> {
        if self.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "Run request must contain a prompt".to_string(),
            ));
        }
        if self.session_id.is_empty() || self.user_id.is_empty() {
            return Err(RelayError::InvalidRequest(
                "Run request must carry a session and a user".to_string(),
            ));
        }
        let runtime_identifier = self.runtime_identifier.clone().ok_or_else(|| {
            RelayError::InvalidRequest(
                "Run request must contain the runtime ID of the agent to be used".to_string(),
            )
        })?;
        let qualifier = self.qualifier.clone().ok_or_else(|| {
            RelayError::InvalidRequest(
                "Run request must contain the name of the endpoint to be used".to_string(),
            )
        })?;

        Ok(RuntimeRequest {
            prompt: self.prompt.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            message_id: self.message_id.clone(),
            runtime_identifier,
            qualifier,
        })
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// A final answer was published and stored
    Completed {
        tokens: u64,
        response: FinalResponse,
    },
    /// The runtime reported an error; it was published, nothing was stored
    Failed { tokens: u64, message: String },
}

/// What the driver does after handling one frame
enum Step {
    Continue,
    Finish(FinalResponse),
    Abort(String),
}

/// State owned by a single invocation
struct Invocation {
    session_id: String,
    user_id: String,
    run_id: String,
    parser: FrameParser,
    last_sequence: u64,
    terminated: bool,
    outbound: ChannelPublisher,
}

impl Invocation {
    fn new(session_id: &str, user_id: &str, outbound: ChannelPublisher) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            run_id: format!("t-{}", uuid::Uuid::new_v4()),
            parser: FrameParser::new(),
            last_sequence: 0,
            terminated: false,
            outbound,
        }
    }

    fn publish(&self, mut data: EventData) {
        data.set_run_id(&self.run_id);
        let action = data.action();
        let event = Event::new(&self.session_id, &self.user_id, data);
        if let Err(e) = self.outbound.publish(&event) {
            tracing::warn!(
                session_id = %self.session_id,
                action = %action,
                error = %e,
                "Failed to queue outbound event"
            );
        }
    }

    fn handle(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::Token { value } => {
                self.last_sequence += 1;
                tracing::trace!(session_id = %self.session_id, sequence = self.last_sequence, "Token");
                self.publish(EventData::Token(TokenData {
                    sequence_number: self.last_sequence,
                    value,
                    run_id: None,
                }));
                Step::Continue
            }
            Frame::Final(response) => Step::Finish(response),
            Frame::Error { message } => Step::Abort(message),
            Frame::Other { action } => {
                tracing::debug!(session_id = %self.session_id, action = ?action, "Ignoring runtime record");
                Step::Continue
            }
        }
    }

    /// Publish the terminal event; later calls are ignored
    fn terminate(&mut self, data: EventData) {
        if self.terminated {
            tracing::warn!(session_id = %self.session_id, "Second terminal event suppressed");
            return;
        }
        self.terminated = true;
        self.publish(data);
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.terminate(EventData::Error(ErrorData {
            message: message.into(),
            run_id: None,
        }));
    }
}

/// Drives agent invocations and publishes their events
pub struct InvocationDriver {
    runtime: Arc<dyn AgentRuntime>,
    history: Arc<dyn HistoryStore>,
    outbound: ChannelPublisher,
    tool_notifications: Option<ChannelPublisher>,
    chunk_timeout: Option<Duration>,
}

impl InvocationDriver {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        history: Arc<dyn HistoryStore>,
        outbound: ChannelPublisher,
    ) -> Self {
        Self {
            runtime,
            history,
            outbound,
            tool_notifications: None,
            chunk_timeout: None,
        }
    }

    /// Publish tool descriptors of in-process agents to this channel
    pub fn with_tool_notifications(mut self, publisher: ChannelPublisher) -> Self {
        self.tool_notifications = Some(publisher);
        self
    }

    /// Abort when the runtime stays silent longer than `timeout`
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Run one invocation to its terminal event
    ///
    /// Invalid requests fail before anything is published. Transport
    /// failures publish one `error` event and are returned as
    /// `RelayError::Transport`.
    pub async fn run(&self, request: &InvocationRequest) -> Result<InvocationOutcome> {
        let runtime_request = request.validate()?;
        let mut invocation = Invocation::new(&request.session_id, &request.user_id, self.outbound.clone());

        tracing::info!(
            session_id = %request.session_id,
            user_id = %request.user_id,
            run_id = %invocation.run_id,
            runtime = %runtime_request.runtime_identifier,
            qualifier = %runtime_request.qualifier,
            "Invocation started"
        );

        let listener: Arc<dyn ToolCallListener> = match &self.tool_notifications {
            Some(publisher) => Arc::new(
                ToolNotifier::new(&request.session_id, &request.user_id, publisher.clone())
                    .with_run_id(&invocation.run_id),
            ),
            None => Arc::new(NoopListener),
        };

        let stream = match self.runtime.invoke(&runtime_request, listener).await {
            Ok(stream) => stream,
            Err(e) => return Err(transport_failure(&mut invocation, e)),
        };

        match self.consume(&mut invocation, stream).await {
            Ok(Step::Finish(response)) => self.complete(invocation, &runtime_request, response).await,
            Ok(Step::Abort(message)) => {
                tracing::error!(
                    session_id = %request.session_id,
                    tokens = invocation.last_sequence,
                    error = %message,
                    "Agent runtime reported an error"
                );
                invocation.fail(message.clone());
                Ok(InvocationOutcome::Failed {
                    tokens: invocation.last_sequence,
                    message,
                })
            }
            Ok(Step::Continue) => Err(transport_failure(
                &mut invocation,
                RelayError::Transport(
                    "Agent runtime stream ended before a final response".to_string(),
                ),
            )),
            Err(e) => Err(transport_failure(&mut invocation, e)),
        }
    }

    /// Read the stream until a terminal record; `Continue` means it ended without one
    async fn consume(&self, invocation: &mut Invocation, mut stream: ByteStream) -> Result<Step> {
        loop {
            let next = match self.chunk_timeout {
                Some(timeout) => tokio::time::timeout(timeout, stream.next())
                    .await
                    .map_err(|_| {
                        RelayError::Timeout(format!(
                            "No output from agent runtime for {}s",
                            timeout.as_secs()
                        ))
                    })?,
                None => stream.next().await,
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            for result in invocation.parser.push(&chunk) {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %invocation.session_id,
                            error = %e,
                            "Skipping undecodable runtime record"
                        );
                        continue;
                    }
                };

                match invocation.handle(frame) {
                    Step::Continue => {}
                    terminal => return Ok(terminal),
                }
            }
        }

        if let Err(e) = invocation.parser.finish() {
            tracing::warn!(session_id = %invocation.session_id, error = %e, "Runtime stream ended mid-record");
        }
        Ok(Step::Continue)
    }

    async fn complete(
        &self,
        mut invocation: Invocation,
        request: &RuntimeRequest,
        mut response: FinalResponse,
    ) -> Result<InvocationOutcome> {
        if response.message_id.is_none() {
            response.message_id = request.message_id.clone();
        }
        invocation.terminate(EventData::FinalResponse(response.clone()));

        tracing::info!(
            session_id = %request.session_id,
            run_id = %invocation.run_id,
            tokens = invocation.last_sequence,
            "The agent returned a final response"
        );

        let record = ExchangeRecord {
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            message_id: request
                .message_id
                .clone()
                .unwrap_or_else(|| invocation.run_id.clone()),
            user_prompt: request.prompt.clone(),
            assistant_content: response.content.clone(),
            reasoning_content: response.reasoning_content.clone().filter(|r| !r.is_empty()),
            references: response.references.clone().map(normalize_references),
            runtime_identifier: request.runtime_identifier.clone(),
            qualifier: request.qualifier.clone(),
            recorded_at: chrono::Utc::now(),
        };

        if let Err(e) = self.history.append(record).await {
            tracing::error!(session_id = %request.session_id, error = %e, "Failed to save conversation exchange");
            return Err(e);
        }

        Ok(InvocationOutcome::Completed {
            tokens: invocation.last_sequence,
            response,
        })
    }

    /// Warm up the runtime session and echo a heartbeat to the client
    ///
    /// Warm-up failures are logged and otherwise ignored.
    pub async fn heartbeat(&self, request: &InvocationRequest) {
        if let (Some(runtime_identifier), Some(qualifier)) =
            (&request.runtime_identifier, &request.qualifier)
        {
            let warm_up = RuntimeRequest {
                prompt: String::new(),
                session_id: request.session_id.clone(),
                user_id: request.user_id.clone(),
                message_id: None,
                runtime_identifier: runtime_identifier.clone(),
                qualifier: qualifier.clone(),
            };
            if let Err(e) = self.runtime.warm_up(&warm_up).await {
                tracing::warn!(session_id = %request.session_id, error = %e, "Heartbeat warm-up failed");
            }
        }

        let event = Event::new(&request.session_id, &request.user_id, EventData::Heartbeat);
        if let Err(e) = self.outbound.publish(&event) {
            tracing::warn!(session_id = %request.session_id, error = %e, "Failed to queue heartbeat");
        }
    }

    /// Outbound publisher used for every event of this driver
    pub fn outbound(&self) -> &ChannelPublisher {
        &self.outbound
    }
}

/// Publish the failure and hand it back as a transport error
fn transport_failure(invocation: &mut Invocation, error: RelayError) -> RelayError {
    let error = match error {
        RelayError::Transport(_) => error,
        other => RelayError::Transport(other.to_string()),
    };
    tracing::error!(
        session_id = %invocation.session_id,
        tokens = invocation.last_sequence,
        error = %error,
        "Invocation aborted"
    );
    invocation.fail(error.to_string());
    error
}

/// Runtimes send references as a JSON-encoded string; store them decoded
fn normalize_references(references: serde_json::Value) -> serde_json::Value {
    match references {
        serde_json::Value::String(ref raw) => {
            serde_json::from_str(raw).unwrap_or(references)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::provider::memory::MemoryProvider;
    use crate::types::{Action, ToolDescriptor, ToolNotification};
    use async_trait::async_trait;
    use bytes::Bytes;

    enum Script {
        Chunk(&'static str),
        Fail(&'static str),
        Tool(&'static str),
        Stall,
    }

    struct ScriptedRuntime {
        script: Vec<Script>,
    }

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn invoke(
            &self,
            _request: &RuntimeRequest,
            listener: Arc<dyn ToolCallListener>,
        ) -> Result<ByteStream> {
            let mut items: Vec<Result<Bytes>> = Vec::new();
            let mut stall = false;
            for step in &self.script {
                match step {
                    Script::Chunk(text) => items.push(Ok(Bytes::from_static(text.as_bytes()))),
                    Script::Fail(reason) => items.push(Err(RelayError::Transport(reason.to_string()))),
                    Script::Tool(name) => listener.before_tool_call(&ToolDescriptor::from_input(
                        *name,
                        "",
                        &serde_json::json!({"city": "Paris"}),
                    )),
                    Script::Stall => stall = true,
                }
            }
            let stream = futures::stream::iter(items);
            if stall {
                Ok(stream.chain(futures::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }
    }

    struct Harness {
        provider: Arc<MemoryProvider>,
        outbound: ChannelPublisher,
        history: Arc<MemoryHistoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let provider = Arc::new(MemoryProvider::default());
            let outbound = ChannelPublisher::spawn(provider.clone(), "outbound");
            Self {
                provider,
                outbound,
                history: Arc::new(MemoryHistoryStore::new()),
            }
        }

        fn driver(&self, script: Vec<Script>) -> InvocationDriver {
            InvocationDriver::new(
                Arc::new(ScriptedRuntime { script }),
                self.history.clone(),
                self.outbound.clone(),
            )
        }

        async fn events(&self) -> Vec<Event> {
            self.outbound.flush().await;
            self.provider
                .published("outbound")
                .await
                .iter()
                .map(|m| serde_json::from_slice(&m.payload).unwrap())
                .collect()
        }
    }

    fn request(prompt: &str) -> InvocationRequest {
        InvocationRequest {
            prompt: prompt.to_string(),
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            message_id: Some("m-1".to_string()),
            runtime_identifier: Some("rt-1".to_string()),
            qualifier: Some("DEFAULT".to_string()),
        }
    }

    const TOKEN_IT: &str = "data: {\"action\":\"on_new_llm_token\",\"data\":{\"token\":{\"sequenceNumber\":0,\"value\":\"It\"}}}\n\n";
    const TOKEN_IS: &str = "data: {\"action\":\"on_new_llm_token\",\"data\":{\"token\":{\"sequenceNumber\":1,\"value\":\" is\"}}}\n\n";
    const TOKEN_SUNNY: &str = "data: {\"action\":\"on_new_llm_token\",\"data\":{\"token\":{\"sequenceNumber\":2,\"value\":\" sunny.\"}}}\n\n";
    const FINAL: &str = "data: {\"action\":\"final_response\",\"data\":{\"content\":\"It is sunny.\",\"references\":\"[{\\\"uri\\\":\\\"s3://kb/a.md\\\"}]\"}}\n\n";

    fn tokens(events: &[Event]) -> Vec<(u64, String)> {
        events
            .iter()
            .filter_map(|e| match &e.data {
                EventData::Token(t) => Some((t.sequence_number, t.value.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_without_publishing() {
        let harness = Harness::new();
        let driver = harness.driver(vec![Script::Chunk(TOKEN_IT)]);

        let err = driver.run(&request("   ")).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        assert!(harness.events().await.is_empty());
        assert!(harness.history.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_qualifier_is_rejected() {
        let mut req = request("hi");
        req.qualifier = None;
        assert!(matches!(req.validate(), Err(RelayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_tokens_then_final_response() {
        let harness = Harness::new();
        let driver = harness.driver(vec![
            Script::Chunk(TOKEN_IT),
            Script::Chunk(&TOKEN_IS[..20]),
            Script::Chunk(&TOKEN_IS[20..]),
            Script::Chunk(TOKEN_SUNNY),
            Script::Chunk(FINAL),
        ]);

        let outcome = driver.run(&request("What's the weather in Paris?")).await.unwrap();
        match outcome {
            InvocationOutcome::Completed { tokens, ref response } => {
                assert_eq!(tokens, 3);
                assert_eq!(response.content, "It is sunny.");
                assert_eq!(response.message_id.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let events = harness.events().await;
        assert_eq!(
            tokens(&events),
            vec![
                (1, "It".to_string()),
                (2, " is".to_string()),
                (3, " sunny.".to_string())
            ]
        );
        assert_eq!(events.last().unwrap().action(), Action::FinalResponse);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let run_ids: std::collections::HashSet<_> =
            events.iter().map(|e| e.data.run_id()).collect();
        assert_eq!(run_ids.len(), 1);
        assert!(run_ids.iter().all(|r| r.is_some_and(|r| r.starts_with("t-"))));

        let stored = harness.history.session("s-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].user_prompt, "What's the weather in Paris?");
        assert_eq!(stored[0].assistant_content, "It is sunny.");
        assert_eq!(stored[0].message_id, "m-1");
        assert_eq!(stored[0].references.as_ref().unwrap()[0]["uri"], "s3://kb/a.md");
    }

    #[tokio::test]
    async fn test_records_after_final_are_not_consumed() {
        let harness = Harness::new();
        let driver = harness.driver(vec![
            Script::Chunk(TOKEN_IT),
            Script::Chunk(FINAL),
            Script::Chunk(TOKEN_IS),
        ]);

        driver.run(&request("hi")).await.unwrap();
        let events = harness.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action(), Action::FinalResponse);
    }

    #[tokio::test]
    async fn test_runtime_error_aborts_without_history() {
        let harness = Harness::new();
        let driver = harness.driver(vec![
            Script::Chunk(TOKEN_IT),
            Script::Chunk("data: {\"error\":\"model throttled\",\"action\":\"error\"}\n"),
            Script::Chunk(TOKEN_IS),
        ]);

        let outcome = driver.run(&request("hi")).await.unwrap();
        assert_eq!(
            outcome,
            InvocationOutcome::Failed {
                tokens: 1,
                message: "model throttled".to_string()
            }
        );

        let events = harness.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].data,
            EventData::Error(ErrorData {
                message: "model throttled".to_string(),
                run_id: events[0].data.run_id().map(str::to_string),
            })
        );
        assert!(harness.history.is_empty().await);
    }

    #[tokio::test]
    async fn test_transport_failure_publishes_one_error() {
        let harness = Harness::new();
        let driver = harness.driver(vec![Script::Chunk(TOKEN_IT), Script::Fail("connection reset")]);

        let err = driver.run(&request("hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));

        let events = harness.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action(), Action::Error);
        assert!(harness.history.is_empty().await);
    }

    #[tokio::test]
    async fn test_stream_ending_without_final_is_reported() {
        let harness = Harness::new();
        let driver = harness.driver(vec![Script::Chunk(TOKEN_IT), Script::Chunk("data: {\"act")]);

        let err = driver.run(&request("hi")).await.unwrap_err();
        assert!(err.to_string().contains("before a final response"));

        let events = harness.events().await;
        assert_eq!(events.last().unwrap().action(), Action::Error);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_runtime_times_out() {
        let harness = Harness::new();
        let driver = harness
            .driver(vec![Script::Chunk(TOKEN_IT), Script::Stall])
            .with_chunk_timeout(Some(Duration::from_secs(30)));

        let err = driver.run(&request("hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(err.to_string().contains("No output"));

        let events = harness.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action(), Action::Error);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let harness = Harness::new();
        let driver = harness.driver(vec![
            Script::Chunk(TOKEN_IT),
            Script::Chunk("data: {broken\n"),
            Script::Chunk(TOKEN_IS),
            Script::Chunk(FINAL),
        ]);

        driver.run(&request("hi")).await.unwrap();
        let events = harness.events().await;
        assert_eq!(
            tokens(&events),
            vec![(1, "It".to_string()), (2, " is".to_string())]
        );
    }

    #[tokio::test]
    async fn test_in_process_tool_calls_are_notified() {
        let harness = Harness::new();
        let tools = ChannelPublisher::spawn(harness.provider.clone(), "tools");
        let driver = harness
            .driver(vec![
                Script::Tool("get_weather"),
                Script::Tool("get_forecast"),
                Script::Chunk(FINAL),
            ])
            .with_tool_notifications(tools.clone());

        driver.run(&request("hi")).await.unwrap();
        tools.flush().await;

        let notifications: Vec<ToolNotification> = harness
            .provider
            .published("tools")
            .await
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].data.tool_name, "get_weather");
        assert_eq!(notifications[1].context.invocation_number, 2);
        assert_eq!(notifications[1].context.session_id, "s-1");

        let final_run = harness.events().await[0].data.run_id().map(str::to_string);
        assert!(final_run.is_some());
        assert!(notifications.iter().all(|n| n.context.run_id == final_run));
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let harness = Harness::new();
        let driver = harness.driver(Vec::new());

        driver.heartbeat(&request("")).await;
        let events = harness.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, EventData::Heartbeat);
    }

    #[test]
    fn test_normalize_references() {
        let raw = serde_json::json!("[{\"uri\":\"a\"}]");
        assert_eq!(normalize_references(raw)[0]["uri"], "a");

        let not_json = serde_json::json!("plain text");
        assert_eq!(normalize_references(not_json.clone()), not_json);

        let structured = serde_json::json!({"uri": "b"});
        assert_eq!(normalize_references(structured.clone()), structured);
    }
}
