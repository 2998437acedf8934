//! Delivery sink
//!
//! The relay hands every ordered event to a `DeliverySink`, which pushes
//! it to whoever is subscribed to the event's session. `SessionFanout` is
//! the in-process implementation: one broadcast channel per session,
//! created on first subscription. Pushes to sessions nobody listens to
//! are dropped.

use crate::error::Result;
use crate::types::SessionPush;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Accepts ordered pushes for one session at a time
///
/// Calls may repeat with identical payloads; consumers deduplicate by
/// sequence number.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn publish_to_session(&self, push: SessionPush) -> Result<()>;
}

/// Per-session broadcast fanout
pub struct SessionFanout {
    sessions: RwLock<HashMap<String, broadcast::Sender<SessionPush>>>,
    capacity: usize,
}

impl SessionFanout {
    /// `capacity` is the per-session backlog a slow subscriber may fall behind by
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to every push for `session_id` from now on
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionPush> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                sessions.insert(session_id.to_string(), sender);
                tracing::info!(session_id, "Session subscribed");
                receiver
            }
        }
    }

    /// Subscription as a stream; lagged pushes are skipped with a warning
    pub async fn stream(&self, session_id: &str) -> impl Stream<Item = SessionPush> + Send + 'static {
        let session = session_id.to_string();
        BroadcastStream::new(self.subscribe(session_id).await).filter_map(move |item| match item {
            Ok(push) => Some(push),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %session, skipped, "Session subscriber lagged");
                None
            }
        })
    }

    /// Live subscribers of a session
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for SessionFanout {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl DeliverySink for SessionFanout {
    async fn publish_to_session(&self, push: SessionPush) -> Result<()> {
        let session_id = push.session_id.clone();
        let delivered = {
            let sessions = self.sessions.read().await;
            match sessions.get(&session_id) {
                Some(sender) => sender.send(push).is_ok(),
                None => false,
            }
        };

        if delivered {
            tracing::trace!(session_id = %session_id, "Pushed to session");
            return Ok(());
        }

        tracing::debug!(session_id = %session_id, "No subscriber for session, push dropped");
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            sessions.remove(&session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(session_id: &str, data: &str) -> SessionPush {
        SessionPush {
            session_id: session_id.to_string(),
            user_id: "u-1".to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_reaches_session_subscribers_only() {
        let fanout = SessionFanout::default();
        let mut a = fanout.subscribe("s-a").await;
        let mut b = fanout.subscribe("s-b").await;

        fanout.publish_to_session(push("s-a", "one")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().data, "one");
        assert!(matches!(
            b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_push_without_subscriber_is_dropped() {
        let fanout = SessionFanout::default();
        fanout.publish_to_session(push("s-x", "lost")).await.unwrap();
        assert_eq!(fanout.subscriber_count("s-x").await, 0);

        let receiver = fanout.subscribe("s-x").await;
        drop(receiver);
        fanout.publish_to_session(push("s-x", "lost")).await.unwrap();
        assert!(fanout.sessions.read().await.get("s-x").is_none());
    }

    #[tokio::test]
    async fn test_stream_yields_pushes_in_order() {
        let fanout = SessionFanout::default();
        let stream = fanout.stream("s-1").await;
        tokio::pin!(stream);

        for data in ["a", "b", "c"] {
            fanout.publish_to_session(push("s-1", data)).await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(stream.next().await.unwrap().data);
        }
        assert_eq!(received, vec!["a", "b", "c"]);
    }
}
