//! NATS JetStream channel provider
//!
//! Implements `ChannelProvider` on a JetStream stream with durable pull
//! consumers: at-least-once delivery, redelivery of unacked messages,
//! batches fetched with `max_messages`/`expires`.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{ChannelProvider, ChannelSubscription};
use async_trait::async_trait;
use bytes::Bytes;

/// NATS JetStream channel provider
///
/// Wraps `NatsClient` and implements the `ChannelProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl ChannelProvider for NatsProvider {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        self.client.publish(subject, payload).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn ChannelSubscription>> {
        let sub = self.client.subscribe(subject, consumer_name).await?;
        Ok(Box::new(sub))
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.client.is_connected())
    }
}
