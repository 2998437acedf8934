//! JetStream plumbing for the relay's channels
//!
//! All channel subjects live in one stream under `subject_prefix`; each
//! worker attaches a durable pull consumer filtered to its subject.

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{RelayError, Result};
use async_nats::jetstream;
use bytes::Bytes;
use std::time::Duration;

/// Connection plus the stream backing every channel subject
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| RelayError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream,
            config,
        })
    }

    /// Publish a payload, returning the JetStream sequence number
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        let subject = self.config.build_subject(subject);

        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| RelayError::Publish {
                subject: subject.clone(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| RelayError::Publish {
                subject: subject.clone(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(subject = %subject, sequence = ack.sequence, "Message published");
        Ok(ack.sequence)
    }

    /// Create (or reattach to) a durable pull consumer on a channel subject
    pub async fn subscribe(&self, subject: &str, consumer_name: &str) -> Result<NatsSubscription> {
        let filter_subject = self.config.build_subject(subject);
        let durable_name = durable_name(consumer_name, subject);

        let consumer = self
            .stream
            .get_or_create_consumer(
                &durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.clone()),
                    filter_subject: filter_subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: self.config.max_deliver,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                RelayError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    durable_name, e
                ))
            })?;

        tracing::info!(
            consumer = %durable_name,
            filter = %filter_subject,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(consumer, filter_subject))
    }

    /// Check the server connection state
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Durable consumer names may not contain dots
fn durable_name(consumer_name: &str, subject: &str) -> String {
    format!("{}-{}", consumer_name, subject).replace(['.', '*', '>', ' '], "-")
}

fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Create the relay stream, or attach to it when it already exists
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    // Work-queue retention would drop messages once the first consumer acks
    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: config.stream_subjects(),
            storage,
            max_messages: config.max_events,
            max_age: Duration::from_secs(config.max_age_secs),
            max_bytes: config.max_bytes,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        })
        .await
        .map_err(|e| RelayError::Stream(format!("Stream '{}' unavailable: {}", config.stream_name, e)))?;

    tracing::info!(stream = %config.stream_name, prefix = %config.subject_prefix, "JetStream stream ready");
    Ok(stream)
}
