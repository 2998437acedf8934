//! NATS JetStream channel configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and stream settings for `NatsProvider`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream holding every relay subject
    pub stream_name: String,

    /// Prefix prepended to channel subjects (`<prefix>.<subject>`)
    pub subject_prefix: String,

    pub storage: StorageType,

    /// Maximum messages retained by the stream (-1 = unlimited)
    pub max_events: i64,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Redelivery attempts before JetStream gives up on a message (-1 = unlimited)
    pub max_deliver: i64,

    /// Seconds JetStream waits for an ack before redelivering
    pub ack_wait_secs: u64,

    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: "AGENT_STREAM_RELAY".to_string(),
            subject_prefix: "relay".to_string(),
            storage: StorageType::File,
            max_events: 100_000,
            max_age_secs: 3600,
            max_bytes: -1,
            max_deliver: 5,
            ack_wait_secs: 30,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NatsConfig {
    /// Full subject for a channel subject
    pub fn build_subject(&self, subject: &str) -> String {
        format!("{}.{}", self.subject_prefix, subject)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }
}
