//! Dead letter queue for deliveries the relay could not complete
//!
//! Workers acknowledge every delivery they have looked at, so a failure
//! never blocks a subject. What failed is routed here instead, with the
//! raw payload and the reason.

use crate::error::Result;
use crate::provider::Delivery;
use crate::types::now_millis;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// A delivery that could not be processed
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subject: String,
    pub sequence: u64,
    pub num_delivered: u64,

    /// Session the payload belongs to, when it could be decoded
    pub session_id: Option<String>,

    /// Undecoded payload as received
    pub payload: Bytes,

    pub reason: String,

    /// Unix timestamp in milliseconds when the delivery was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(delivery: &Delivery, session_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: delivery.subject.clone(),
            sequence: delivery.sequence,
            num_delivered: delivery.num_delivered,
            session_id,
            payload: delivery.payload.clone(),
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Take ownership of a failed delivery
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// Bounded in-memory DLQ; the oldest letters are dropped first
pub struct MemoryDlqHandler {
    letters: RwLock<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl MemoryDlqHandler {
    /// `capacity` of 0 keeps everything
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: RwLock::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            subject = %letter.subject,
            sequence = letter.sequence,
            session_id = letter.session_id.as_deref().unwrap_or("-"),
            reason = %letter.reason,
            "Delivery dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push_back(letter);
        while self.capacity > 0 && letters.len() > self.capacity {
            letters.pop_front();
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
