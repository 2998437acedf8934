//! JetStream pull subscription

use crate::error::{RelayError, Result};
use crate::provider::{ChannelSubscription, Delivery};
use async_nats::jetstream::consumer::{pull, Consumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Fetches batches from a durable pull consumer
pub struct NatsSubscription {
    consumer: Consumer<pull::Config>,
    filter_subject: String,
}

impl NatsSubscription {
    pub(crate) fn new(consumer: Consumer<pull::Config>, filter_subject: String) -> Self {
        Self {
            consumer,
            filter_subject,
        }
    }
}

#[async_trait]
impl ChannelSubscription for NatsSubscription {
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Option<Vec<Delivery>>> {
        let messages = self
            .consumer
            .fetch()
            .max_messages(max.max(1))
            .expires(wait.max(Duration::from_millis(10)))
            .messages()
            .await
            .map_err(|e| RelayError::Subscribe {
                subject: self.filter_subject.clone(),
                reason: e.to_string(),
            })?;

        let mut messages = std::pin::pin!(messages);
        let mut batch = Vec::new();
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(subject = %self.filter_subject, "Error fetching message: {}", e);
                    break;
                }
            };

            let (sequence, num_delivered) = message
                .info()
                .map(|info| (info.stream_sequence, info.delivered.max(1) as u64))
                .unwrap_or((0, 1));
            let subject = message.subject.to_string();
            let payload = message.payload.clone();

            batch.push(Delivery::new(subject, payload, sequence, num_delivered, move || {
                Box::pin(async move {
                    message
                        .ack()
                        .await
                        .map_err(|e| RelayError::Ack(e.to_string()))
                })
            }));
        }

        Ok(Some(batch))
    }
}
