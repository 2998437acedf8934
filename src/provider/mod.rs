//! Channel provider trait: the core abstraction for message backends
//!
//! The Inbound, Outbound and Tool Notification channels are all subjects
//! on a `ChannelProvider`. Backends give at-least-once delivery in
//! batches and make no ordering promise across or within batches.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Core trait for channel backends
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Publish a payload, returning the provider-assigned sequence number
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64>;

    /// Attach a named consumer to a subject
    ///
    /// Consumers sharing a name on one subject share the work; every
    /// message goes to one of them.
    async fn subscribe(
        &self,
        subject: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn ChannelSubscription>>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check: returns true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Consumer handle yielding delivery batches
#[async_trait]
pub trait ChannelSubscription: Send + Sync {
    /// Wait up to `wait` for messages and return at most `max` of them
    ///
    /// Returns an empty batch when nothing arrived in time and `None`
    /// once the channel is closed for good.
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Option<Vec<Delivery>>>;
}

/// Acknowledgement callback attached to a delivery
pub type AckFn = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

/// One message handed to a consumer
///
/// Until acked, the backend may deliver the same message again.
pub struct Delivery {
    /// Subject the message was published to
    pub subject: String,

    /// Raw message body
    pub payload: Bytes,

    /// Provider-assigned sequence number
    pub sequence: u64,

    /// Number of delivery attempts, including this one
    pub num_delivered: u64,

    /// When the provider accepted the publish
    pub published_at: Option<tokio::time::Instant>,

    ack_fn: Option<AckFn>,
}

impl Delivery {
    /// Create a delivery with an ack callback
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        num_delivered: u64,
        ack_fn: impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            num_delivered,
            published_at: None,
            ack_fn: Some(Box::new(ack_fn)),
        }
    }

    /// Create a delivery that needs no acknowledgement
    pub fn unacked(subject: impl Into<String>, payload: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            sequence,
            num_delivered: 1,
            published_at: None,
            ack_fn: None,
        }
    }

    /// Record the publication instant
    pub fn with_published_at(mut self, instant: tokio::time::Instant) -> Self {
        self.published_at = Some(instant);
        self
    }

    /// Confirm processing so the backend stops redelivering
    pub async fn ack(&mut self) -> Result<()> {
        match self.ack_fn.take() {
            Some(ack) => ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("num_delivered", &self.num_delivered)
            .field("bytes", &self.payload.len())
            .finish()
    }
}
