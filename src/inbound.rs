//! Inbound worker
//!
//! Consumes client requests from the Inbound Channel. Each request gets
//! its own task, so a long invocation never holds up the next message;
//! deliveries are acked as soon as their task is spawned.

use crate::driver::{InvocationDriver, InvocationOutcome, InvocationRequest};
use crate::error::{RelayError, Result};
use crate::provider::{ChannelSubscription, Delivery};
use crate::types::{Event, InboundAction, InboundMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

impl From<&InboundMessage> for InvocationRequest {
    fn from(message: &InboundMessage) -> Self {
        let data = &message.data;
        Self {
            prompt: data.text.clone().unwrap_or_default(),
            session_id: data.session_id.clone(),
            user_id: message.user_id.clone(),
            message_id: data.message_id.clone(),
            runtime_identifier: data.runtime_identifier.clone(),
            qualifier: data.qualifier.clone(),
        }
    }
}

/// Dispatches inbound requests to the invocation driver
pub struct InboundWorker {
    driver: Arc<InvocationDriver>,
}

impl InboundWorker {
    pub fn new(driver: Arc<InvocationDriver>) -> Self {
        Self { driver }
    }

    /// Spawn one task per decodable message and ack the whole batch
    pub async fn process_batch(&self, mut deliveries: Vec<Delivery>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(deliveries.len());

        for delivery in deliveries.iter_mut() {
            match serde_json::from_slice::<InboundMessage>(&delivery.payload) {
                Ok(message) => {
                    let driver = self.driver.clone();
                    tasks.push(tokio::spawn(async move { dispatch(&driver, message).await }));
                }
                Err(e) => tracing::warn!(
                    sequence = delivery.sequence,
                    error = %e,
                    "Skipping undecodable inbound message"
                ),
            }

            if let Err(e) = delivery.ack().await {
                tracing::warn!(sequence = delivery.sequence, error = %e, "Failed to ack inbound message");
            }
        }
        tasks
    }

    /// Process batches until the subscription closes
    pub async fn run(
        &self,
        mut subscription: Box<dyn ChannelSubscription>,
        batch_size: usize,
        batch_wait: Duration,
    ) -> Result<()> {
        tracing::info!("Inbound worker started");
        while let Some(batch) = subscription.next_batch(batch_size, batch_wait).await? {
            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
        }
        tracing::info!("Inbound worker stopped");
        Ok(())
    }
}

async fn dispatch(driver: &InvocationDriver, message: InboundMessage) {
    let request = InvocationRequest::from(&message);

    match message.action {
        InboundAction::Run => match driver.run(&request).await {
            Ok(InvocationOutcome::Completed { tokens, .. }) => {
                tracing::info!(session_id = %request.session_id, tokens, "Invocation completed");
            }
            Ok(InvocationOutcome::Failed { tokens, .. }) => {
                tracing::info!(session_id = %request.session_id, tokens, "Invocation ended with an error");
            }
            Err(RelayError::InvalidRequest(reason)) => {
                tracing::warn!(session_id = %request.session_id, reason = %reason, "Rejected run request");
            }
            Err(e) => {
                tracing::error!(session_id = %request.session_id, error = %e, "Invocation failed");
            }
        },
        InboundAction::Heartbeat => {
            tracing::debug!(session_id = %request.session_id, "Heartbeat");
            driver.heartbeat(&request).await;
        }
        InboundAction::Unknown => {
            tracing::warn!(session_id = %request.session_id, "Unknown inbound action");
            let event = Event::error(&request.session_id, &request.user_id, "Unknown action");
            if let Err(e) = driver.outbound().publish(&event) {
                tracing::warn!(session_id = %request.session_id, error = %e, "Failed to queue error event");
            }
        }
    }
}
