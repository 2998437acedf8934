//! Relay service wiring
//!
//! `StreamRelay` connects the three workers to one channel provider:
//! the inbound worker (client requests → invocation driver), the
//! translator (tool notifications → `tool_action` events) and the
//! outbound relay (events → delivery sink). Each runs on its own task
//! with its own durable consumer.

use crate::config::RelayConfig;
use crate::dlq::{DlqHandler, MemoryDlqHandler};
use crate::driver::InvocationDriver;
use crate::error::{RelayError, Result};
use crate::history::HistoryStore;
use crate::inbound::InboundWorker;
use crate::provider::ChannelProvider;
use crate::publisher::ChannelPublisher;
use crate::relay::OutboundRelay;
use crate::runtime::AgentRuntime;
use crate::sink::DeliverySink;
use crate::translator::{TextGenerator, Translator};
use std::sync::Arc;
use tokio::task::JoinHandle;

const INBOUND_CONSUMER: &str = "stream-relay-inbound";
const TRANSLATOR_CONSUMER: &str = "stream-relay-translator";
const OUTBOUND_CONSUMER: &str = "stream-relay-outbound";

/// External collaborators the relay drives
pub struct Collaborators {
    pub runtime: Arc<dyn AgentRuntime>,
    pub history: Arc<dyn HistoryStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub sink: Arc<dyn DeliverySink>,
}

/// Streaming relay on top of a pluggable channel provider
pub struct StreamRelay {
    provider: Arc<dyn ChannelProvider>,
    config: RelayConfig,
    dlq: Arc<dyn DlqHandler>,
}

impl StreamRelay {
    pub fn new(provider: Arc<dyn ChannelProvider>, config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let dlq = Arc::new(MemoryDlqHandler::new(config.dlq_capacity));
        Ok(Self {
            provider,
            config,
            dlq,
        })
    }

    /// Replace the default in-memory DLQ
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn dlq(&self) -> Arc<dyn DlqHandler> {
        self.dlq.clone()
    }

    /// Publisher for the Inbound Channel, as used by an ingress
    pub fn inbound_publisher(&self) -> ChannelPublisher {
        ChannelPublisher::spawn(self.provider.clone(), &self.config.subjects.inbound)
    }

    /// Publisher for the Tool Notification Channel, for out-of-process agents
    pub fn tool_publisher(&self) -> ChannelPublisher {
        ChannelPublisher::spawn(self.provider.clone(), &self.config.subjects.tool_notifications)
    }

    /// Subscribe the three consumers and spawn their workers
    pub async fn start(&self, collaborators: Collaborators) -> Result<RelayHandle> {
        let subjects = &self.config.subjects;
        let batch_size = self.config.batch_size;
        let batch_wait = self.config.batch_wait();

        let inbound_sub = self.provider.subscribe(&subjects.inbound, INBOUND_CONSUMER).await?;
        let tools_sub = self
            .provider
            .subscribe(&subjects.tool_notifications, TRANSLATOR_CONSUMER)
            .await?;
        let outbound_sub = self.provider.subscribe(&subjects.outbound, OUTBOUND_CONSUMER).await?;

        let outbound = ChannelPublisher::spawn(self.provider.clone(), &subjects.outbound);
        let driver = InvocationDriver::new(collaborators.runtime, collaborators.history, outbound.clone())
            .with_tool_notifications(self.tool_publisher())
            .with_chunk_timeout(self.config.chunk_timeout());

        let inbound = InboundWorker::new(Arc::new(driver));
        let translator = Translator::new(
            collaborators.generator,
            outbound.clone(),
            self.config.translation_timeout(),
        );
        let relay = OutboundRelay::new(collaborators.sink, self.dlq.clone());

        let tasks = vec![
            tokio::spawn(async move { inbound.run(inbound_sub, batch_size, batch_wait).await }),
            tokio::spawn(async move { translator.run(tools_sub, batch_size, batch_wait).await }),
            tokio::spawn(async move { relay.run(outbound_sub, batch_size, batch_wait).await }),
        ];

        tracing::info!(
            provider = self.provider.name(),
            inbound = %subjects.inbound,
            outbound = %subjects.outbound,
            tools = %subjects.tool_notifications,
            "Stream relay started"
        );

        Ok(RelayHandle { tasks, outbound })
    }
}

/// Running relay workers
pub struct RelayHandle {
    tasks: Vec<JoinHandle<Result<()>>>,
    outbound: ChannelPublisher,
}

impl RelayHandle {
    /// Publisher shared by the driver and the translator
    pub fn outbound(&self) -> &ChannelPublisher {
        &self.outbound
    }

    /// Wait for every worker; returns the first worker error
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for task in self.tasks {
            let outcome = task
                .await
                .map_err(|e| RelayError::Consumer(format!("Worker task failed: {}", e)))
                .and_then(|result| result);
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Relay worker stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every worker immediately
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
