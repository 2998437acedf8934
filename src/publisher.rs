//! Fire-and-forget publishing onto a channel subject
//!
//! `publish` serializes the message and hands it to a background pump
//! task. Callers never wait for the backend to accept the message; pump
//! failures are logged and dropped.

use crate::error::{RelayError, Result};
use crate::provider::ChannelProvider;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct PumpState {
    /// Messages queued or being published
    in_flight: AtomicUsize,
    /// Publishes the backend rejected
    failed: AtomicUsize,
    drained: Notify,
}

/// Cloneable handle publishing to one subject
#[derive(Clone)]
pub struct ChannelPublisher {
    subject: Arc<str>,
    tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<PumpState>,
}

impl ChannelPublisher {
    /// Start a pump task publishing to `subject` on `provider`
    ///
    /// Must be called inside a Tokio runtime. The pump stops once every
    /// clone of the publisher is dropped and the queue is drained.
    pub fn spawn(provider: Arc<dyn ChannelProvider>, subject: impl Into<String>) -> Self {
        let subject: Arc<str> = Arc::from(subject.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let state = Arc::new(PumpState::default());

        let pump_subject = subject.clone();
        let pump_state = state.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = provider.publish(&pump_subject, payload).await {
                    pump_state.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        subject = %pump_subject,
                        provider = provider.name(),
                        error = %e,
                        "Publish failed, message dropped"
                    );
                }
                if pump_state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    pump_state.drained.notify_waiters();
                }
            }
            tracing::debug!(subject = %pump_subject, "Publisher pump stopped");
        });

        Self { subject, tx, state }
    }

    /// Subject this publisher writes to
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue a message for publication without waiting for it
    ///
    /// Errors only when the message cannot be serialized or the pump is gone.
    pub fn publish<T: Serialize>(&self, message: &T) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(message)?);
        self.publish_raw(payload)
    }

    /// Queue an already-serialized payload
    pub fn publish_raw(&self, payload: Bytes) -> Result<()> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        self.tx.send(payload).map_err(|_| {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            RelayError::Publish {
                subject: self.subject.to_string(),
                reason: "publisher pump is not running".to_string(),
            }
        })
    }

    /// Number of messages the backend rejected so far
    pub fn failed(&self) -> usize {
        self.state.failed.load(Ordering::SeqCst)
    }

    /// Wait until everything queued so far has been handed to the backend
    pub async fn flush(&self) {
        loop {
            let drained = self.state.drained.notified();
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl std::fmt::Debug for ChannelPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPublisher")
            .field("subject", &self.subject)
            .field("in_flight", &self.state.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}
