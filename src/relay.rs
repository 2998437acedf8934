//! Outbound Relay
//!
//! Consumes Outbound Channel batches, puts the token events of each batch
//! back in sequence order and forwards everything, one event at a time,
//! to the `DeliverySink`. A failing event is dead-lettered and the rest
//! of the batch carries on. Every delivery is acked once the batch has
//! been handled.

use crate::dlq::{DeadLetter, DlqHandler};
use crate::error::{RelayError, Result};
use crate::provider::{ChannelSubscription, Delivery};
use crate::sink::DeliverySink;
use crate::types::{Direction, Event, SessionPush};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub forwarded: usize,
    pub failed: usize,
}

/// Sort the sequenced items of a batch while every other item keeps its slot
///
/// Items with a key are sorted among themselves (stable) and written back
/// into the positions sequenced items occupied. Items without a key are
/// never compared and never move.
pub(crate) fn restore_token_order<T>(items: Vec<T>, key: impl Fn(&T) -> Option<u64>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());
    let mut positions = Vec::new();
    let mut sequenced = Vec::new();

    for item in items {
        match key(&item) {
            Some(sequence) => {
                positions.push(slots.len());
                sequenced.push((sequence, item));
                slots.push(None);
            }
            None => slots.push(Some(item)),
        }
    }

    sequenced.sort_by_key(|(sequence, _)| *sequence);
    for (position, (_, item)) in positions.into_iter().zip(sequenced) {
        slots[position] = Some(item);
    }
    slots.into_iter().flatten().collect()
}

/// Order a batch of events for forwarding
pub fn order_batch(events: Vec<Event>) -> Vec<Event> {
    restore_token_order(events, Event::sequence_number)
}

/// Forwards Outbound Channel events to the delivery sink
pub struct OutboundRelay {
    sink: Arc<dyn DeliverySink>,
    dlq: Arc<dyn DlqHandler>,
}

impl OutboundRelay {
    pub fn new(sink: Arc<dyn DeliverySink>, dlq: Arc<dyn DlqHandler>) -> Self {
        Self { sink, dlq }
    }

    /// Forward one batch and ack all of its deliveries
    pub async fn process_batch(&self, mut deliveries: Vec<Delivery>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut decoded = Vec::with_capacity(deliveries.len());

        for (index, delivery) in deliveries.iter().enumerate() {
            match serde_json::from_slice::<Event>(&delivery.payload) {
                Ok(event) => decoded.push((index, event)),
                Err(e) => {
                    report.failed += 1;
                    self.dead_letter(delivery, None, format!("Undecodable event: {}", e))
                        .await;
                }
            }
        }

        for (index, mut event) in restore_token_order(decoded, |(_, event)| event.sequence_number()) {
            if event.direction.is_none() {
                event.direction = Some(Direction::Out);
            }

            match self.forward(&event).await {
                Ok(()) => {
                    report.forwarded += 1;
                    tracing::debug!(
                        session_id = %event.session_id,
                        action = %event.action(),
                        sequence = ?event.sequence_number(),
                        "Event forwarded"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        session_id = %event.session_id,
                        action = %event.action(),
                        error = %e,
                        "Failed to forward event"
                    );
                    self.dead_letter(&deliveries[index], Some(event.session_id.clone()), e.to_string())
                        .await;
                }
            }
        }

        for delivery in deliveries.iter_mut() {
            if let Err(e) = delivery.ack().await {
                tracing::warn!(subject = %delivery.subject, sequence = delivery.sequence, error = %e, "Failed to ack delivery");
            }
        }

        report
    }

    async fn forward(&self, event: &Event) -> Result<()> {
        let push = SessionPush {
            session_id: event.session_id.clone(),
            user_id: event.user_id.clone(),
            data: serde_json::to_string(event)?,
        };
        self.sink
            .publish_to_session(push)
            .await
            .map_err(|e| match e {
                RelayError::Delivery { .. } => e,
                other => RelayError::Delivery {
                    session_id: event.session_id.clone(),
                    reason: other.to_string(),
                },
            })
    }

    async fn dead_letter(&self, delivery: &Delivery, session_id: Option<String>, reason: String) {
        if let Err(e) = self
            .dlq
            .handle(DeadLetter::new(delivery, session_id, reason))
            .await
        {
            tracing::error!(subject = %delivery.subject, sequence = delivery.sequence, error = %e, "DLQ rejected delivery");
        }
    }

    /// Process batches until the subscription closes
    pub async fn run(
        &self,
        mut subscription: Box<dyn ChannelSubscription>,
        batch_size: usize,
        batch_wait: Duration,
    ) -> Result<()> {
        tracing::info!(batch_size, "Outbound relay started");
        while let Some(batch) = subscription.next_batch(batch_size, batch_wait).await? {
            if batch.is_empty() {
                continue;
            }
            let size = batch.len();
            let report = self.process_batch(batch).await;
            tracing::debug!(size, forwarded = report.forwarded, failed = report.failed, "Batch relayed");
        }
        tracing::info!("Outbound relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MemoryDlqHandler;
    use crate::types::{Action, EventData, ToolActionData};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        pushes: Mutex<Vec<Event>>,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn publish_to_session(&self, push: SessionPush) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.fail_on_call {
                return Err(RelayError::Transport("sink unavailable".to_string()));
            }
            self.pushes
                .lock()
                .await
                .push(serde_json::from_str(&push.data).unwrap());
            Ok(())
        }
    }

    fn delivery(event: &Event, sequence: u64, acks: &Arc<AtomicUsize>) -> Delivery {
        let acks = acks.clone();
        Delivery::new(
            "outbound",
            Bytes::from(serde_json::to_vec(event).unwrap()),
            sequence,
            1,
            move || {
                Box::pin(async move {
                    acks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        )
    }

    fn tool_action(invocation_number: u32) -> Event {
        Event::new(
            "s-1",
            "u-1",
            EventData::ToolAction(ToolActionData {
                tool_name: "get_weather".to_string(),
                tool_action: "Checking the weather".to_string(),
                invocation_number,
                run_id: None,
            }),
        )
    }

    fn relay(sink: Arc<RecordingSink>) -> (OutboundRelay, Arc<MemoryDlqHandler>) {
        let dlq = Arc::new(MemoryDlqHandler::default());
        (OutboundRelay::new(sink, dlq.clone()), dlq)
    }

    #[test]
    fn test_order_batch_sorts_tokens_only() {
        let events = vec![
            Event::token("s-1", "u-1", 3, "c"),
            tool_action(1),
            Event::token("s-1", "u-1", 1, "a"),
            Event::error("s-1", "u-1", "late"),
            Event::token("s-1", "u-1", 2, "b"),
        ];

        let ordered = order_batch(events);
        let shape: Vec<(Action, Option<u64>)> = ordered
            .iter()
            .map(|e| (e.action(), e.sequence_number()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Action::Token, Some(1)),
                (Action::ToolAction, None),
                (Action::Token, Some(2)),
                (Action::Error, None),
                (Action::Token, Some(3)),
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_forwarded_in_sequence_order() {
        let sink = Arc::new(RecordingSink::default());
        let (relay, _) = relay(sink.clone());
        let acks = Arc::new(AtomicUsize::new(0));

        let batch = [3, 1, 2]
            .iter()
            .enumerate()
            .map(|(i, seq)| delivery(&Event::token("s-1", "u-1", *seq, "x"), i as u64, &acks))
            .collect();

        let report = relay.process_batch(batch).await;
        assert_eq!(report, BatchReport { forwarded: 3, failed: 0 });

        let sequences: Vec<u64> = sink
            .pushes
            .lock()
            .await
            .iter()
            .filter_map(Event::sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(acks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_event_does_not_block_batch() {
        let sink = Arc::new(RecordingSink {
            fail_on_call: Some(3),
            ..Default::default()
        });
        let (relay, dlq) = relay(sink.clone());
        let acks = Arc::new(AtomicUsize::new(0));

        let batch = (1..=5)
            .map(|seq| delivery(&Event::token("s-1", "u-1", seq, "x"), seq, &acks))
            .collect();

        let report = relay.process_batch(batch).await;
        assert_eq!(report, BatchReport { forwarded: 4, failed: 1 });

        let sequences: Vec<u64> = sink
            .pushes
            .lock()
            .await
            .iter()
            .filter_map(Event::sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 4, 5]);

        let letters = dlq.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].sequence, 3);
        assert_eq!(letters[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(acks.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let sink = Arc::new(RecordingSink::default());
        let (relay, dlq) = relay(sink.clone());
        let acks = Arc::new(AtomicUsize::new(0));

        let mut batch = vec![delivery(&Event::token("s-1", "u-1", 1, "a"), 1, &acks)];
        batch.push(Delivery::unacked("outbound", "garbage", 2));

        let report = relay.process_batch(batch).await;
        assert_eq!(report, BatchReport { forwarded: 1, failed: 1 });
        assert_eq!(dlq.count().await.unwrap(), 1);
        assert!(dlq.list(1).await.unwrap()[0].session_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_direction_defaults_to_out() {
        let sink = Arc::new(RecordingSink::default());
        let (relay, _) = relay(sink.clone());

        let raw = r#"{"action":"error","sessionId":"s-1","userId":"u-1","timestamp":1,"data":{"message":"x"}}"#;
        relay
            .process_batch(vec![Delivery::unacked("outbound", raw, 1)])
            .await;

        let pushes = sink.pushes.lock().await;
        assert_eq!(pushes[0].direction, Some(Direction::Out));
    }
}
