//! Relay configuration
//!
//! Every field has a default, so a config file only needs the values it
//! overrides. Keys are camelCase.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Channel subjects used by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSubjects {
    /// Client requests (run, heartbeat)
    pub inbound: String,
    /// Events bound for clients
    pub outbound: String,
    /// Tool descriptors captured before each tool call
    pub tool_notifications: String,
}

impl Default for ChannelSubjects {
    fn default() -> Self {
        Self {
            inbound: "inbound".to_string(),
            outbound: "outbound".to_string(),
            tool_notifications: "tools".to_string(),
        }
    }
}

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub subjects: ChannelSubjects,

    /// Maximum deliveries fetched per batch
    pub batch_size: usize,

    /// How long a consumer waits to fill a batch, in milliseconds
    pub batch_wait_ms: u64,

    /// Maximum silence between runtime chunks in seconds (0 = no limit)
    pub chunk_timeout_secs: u64,

    /// Upper bound for one tool-description generation, in seconds
    pub translation_timeout_secs: u64,

    /// Dead-lettered events kept in memory
    pub dlq_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            subjects: ChannelSubjects::default(),
            batch_size: 10,
            batch_wait_ms: 200,
            chunk_timeout_secs: 120,
            translation_timeout_secs: 10,
            dlq_capacity: 10_000,
        }
    }
}

impl RelayConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Self = serde_json::from_str(&json).map_err(|e| {
            RelayError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Relay config loaded");
        Ok(config)
    }

    /// Reject values the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RelayError::Config("batchSize must be >= 1".to_string()));
        }
        if self.translation_timeout_secs == 0 {
            return Err(RelayError::Config(
                "translationTimeoutSecs must be >= 1".to_string(),
            ));
        }
        let subjects = &self.subjects;
        for (name, subject) in [
            ("inbound", &subjects.inbound),
            ("outbound", &subjects.outbound),
            ("toolNotifications", &subjects.tool_notifications),
        ] {
            if subject.is_empty() {
                return Err(RelayError::Config(format!("subjects.{} cannot be empty", name)));
            }
        }
        if subjects.inbound == subjects.outbound
            || subjects.outbound == subjects.tool_notifications
            || subjects.inbound == subjects.tool_notifications
        {
            return Err(RelayError::Config("channel subjects must be distinct".to_string()));
        }
        Ok(())
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    /// `None` when chunks may arrive arbitrarily far apart
    pub fn chunk_timeout(&self) -> Option<Duration> {
        (self.chunk_timeout_secs > 0).then(|| Duration::from_secs(self.chunk_timeout_secs))
    }

    pub fn translation_timeout(&self) -> Duration {
        Duration::from_secs(self.translation_timeout_secs)
    }
}
