//! # a3s-stream-relay
//!
//! Real-time token streaming from AI agent invocations to remote clients
//! over at-least-once message channels.
//!
//! ## Overview
//!
//! An invocation's raw output is parsed incrementally into sequenced
//! events and published, fire-and-forget, to an Outbound Channel. Tool
//! calls are captured on a separate channel and translated into short
//! human-readable annotations without ever delaying tokens. A relay
//! restores per-batch order and pushes every event to a delivery sink;
//! clients rebuild the full transcript by sequence number.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_stream_relay::{
//!     Collaborators, FileHistoryStore, HttpAgentRuntime, HttpGeneratorConfig,
//!     HttpRuntimeConfig, HttpTextGenerator, MemoryProvider, RelayConfig, SessionFanout,
//!     StreamRelay,
//! };
//!
//! # async fn example() -> a3s_stream_relay::Result<()> {
//! let relay = StreamRelay::new(Arc::new(MemoryProvider::default()), RelayConfig::default())?;
//! let fanout = Arc::new(SessionFanout::default());
//!
//! let handle = relay
//!     .start(Collaborators {
//!         runtime: Arc::new(HttpAgentRuntime::new(HttpRuntimeConfig::default())?),
//!         history: Arc::new(FileHistoryStore::new("history.jsonl")),
//!         generator: Arc::new(HttpTextGenerator::new(HttpGeneratorConfig::default())?),
//!         sink: fanout.clone(),
//!     })
//!     .await?;
//!
//! // Clients listen per session
//! let mut session = fanout.subscribe("session-1").await;
//! # let _ = session.try_recv();
//! # handle.abort();
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: In-process channels for testing and single-process use
//! - **nats**: NATS JetStream with durable pull consumers
//!
//! ## Architecture
//!
//! - **FrameParser**: incremental `data: <json>` record decoder
//! - **InvocationDriver**: one invocation, numbered tokens, one terminal event
//! - **ToolNotifier / Translator**: tool-call side channel
//! - **OutboundRelay**: batch-local ordering and failure isolation
//! - **TranscriptAssembler**: client-side reconstruction keyed by sequence

pub mod assembler;
pub mod config;
pub mod dlq;
pub mod driver;
pub mod error;
pub mod frame;
pub mod history;
pub mod inbound;
pub mod provider;
pub mod publisher;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod sink;
pub mod tools;
pub mod translator;
pub mod types;

// Re-export core types
pub use assembler::{Applied, Terminal, TranscriptAssembler};
pub use config::{ChannelSubjects, RelayConfig};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use driver::{InvocationDriver, InvocationOutcome, InvocationRequest};
pub use error::{RelayError, Result};
pub use frame::{Frame, FrameParser, ParseError};
pub use history::{ExchangeRecord, FileHistoryStore, HistoryStore, MemoryHistoryStore};
pub use inbound::InboundWorker;
pub use provider::{ChannelProvider, ChannelSubscription, Delivery};
pub use publisher::ChannelPublisher;
pub use relay::{order_batch, BatchReport, OutboundRelay};
pub use runtime::{AgentRuntime, ByteStream, HttpAgentRuntime, HttpRuntimeConfig, RuntimeRequest};
pub use service::{Collaborators, RelayHandle, StreamRelay};
pub use sink::{DeliverySink, SessionFanout};
pub use tools::{NoopListener, ToolCallListener, ToolNotifier};
pub use translator::{HttpGeneratorConfig, HttpTextGenerator, TextGenerator, Translator};
pub use types::{
    Action, Direction, ErrorData, Event, EventData, FinalResponse, InboundAction, InboundMessage,
    SessionPush, TokenData, ToolActionData, ToolDescriptor, ToolNotification,
};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, NatsSubscription, StorageType};
