//! In-memory channel provider
//!
//! Single-process backend for tests and local runs. Each subject keeps a
//! bounded log; a consumer name attaching to a subject for the first time
//! starts from the oldest retained message, later publishes fan out to
//! every consumer name on the subject.

use crate::error::Result;
use crate::provider::{ChannelProvider, ChannelSubscription, Delivery};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Messages retained per subject (oldest dropped first)
    pub max_events: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

/// A message as accepted by the provider
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
    pub published_at: tokio::time::Instant,
}

/// Work queue shared by all subscriptions of one consumer name
#[derive(Default)]
struct ConsumerQueue {
    pending: Mutex<VecDeque<Arc<PublishedMessage>>>,
    notify: Notify,
    closed: AtomicBool,
    acked: Arc<AtomicU64>,
}

impl ConsumerQueue {
    async fn push(&self, message: Arc<PublishedMessage>) {
        self.pending.lock().await.push_back(message);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct SubjectState {
    log: VecDeque<Arc<PublishedMessage>>,
    consumers: HashMap<String, Arc<ConsumerQueue>>,
}

/// In-memory channel provider
#[derive(Default)]
pub struct MemoryProvider {
    config: MemoryConfig,
    subjects: RwLock<HashMap<String, SubjectState>>,
    sequence: AtomicU64,
}

impl MemoryProvider {
    /// Create a provider with explicit configuration
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            subjects: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Messages retained for a subject, oldest first
    pub async fn published(&self, subject: &str) -> Vec<PublishedMessage> {
        let subjects = self.subjects.read().await;
        subjects
            .get(subject)
            .map(|state| state.log.iter().map(|m| (**m).clone()).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries acknowledged by a consumer name
    pub async fn acked(&self, subject: &str, consumer_name: &str) -> u64 {
        let subjects = self.subjects.read().await;
        subjects
            .get(subject)
            .and_then(|state| state.consumers.get(consumer_name))
            .map(|queue| queue.acked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Close every subscription; pending messages are still drained first
    pub async fn close(&self) {
        let subjects = self.subjects.read().await;
        for state in subjects.values() {
            for queue in state.consumers.values() {
                queue.close();
            }
        }
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Arc::new(PublishedMessage {
            subject: subject.to_string(),
            payload,
            sequence,
            published_at: tokio::time::Instant::now(),
        });

        let consumers: Vec<Arc<ConsumerQueue>> = {
            let mut subjects = self.subjects.write().await;
            let state = subjects.entry(subject.to_string()).or_default();
            state.log.push_back(message.clone());
            if self.config.max_events > 0 && state.log.len() > self.config.max_events {
                let overflow = state.log.len() - self.config.max_events;
                state.log.drain(..overflow);
            }
            state.consumers.values().cloned().collect()
        };

        for queue in consumers {
            queue.push(message.clone()).await;
        }

        tracing::debug!(subject, sequence, "Message published");
        Ok(sequence)
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn ChannelSubscription>> {
        let mut subjects = self.subjects.write().await;
        let state = subjects.entry(subject.to_string()).or_default();

        let queue = match state.consumers.get(consumer_name) {
            Some(queue) => queue.clone(),
            None => {
                let queue = Arc::new(ConsumerQueue::default());
                queue
                    .pending
                    .lock()
                    .await
                    .extend(state.log.iter().cloned());
                state
                    .consumers
                    .insert(consumer_name.to_string(), queue.clone());
                tracing::info!(subject, consumer = consumer_name, "Memory consumer created");
                queue
            }
        };

        Ok(Box::new(MemorySubscription { queue }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handle over a memory consumer queue
pub struct MemorySubscription {
    queue: Arc<ConsumerQueue>,
}

#[async_trait]
impl ChannelSubscription for MemorySubscription {
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Option<Vec<Delivery>>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.queue.notify.notified();
            {
                let mut pending = self.queue.pending.lock().await;
                if !pending.is_empty() {
                    let take = max.max(1).min(pending.len());
                    let batch = pending
                        .drain(..take)
                        .map(|message| {
                            let acked = self.queue.acked.clone();
                            Delivery::new(
                                message.subject.clone(),
                                message.payload.clone(),
                                message.sequence,
                                1,
                                move || {
                                    Box::pin(async move {
                                        acked.fetch_add(1, Ordering::SeqCst);
                                        Ok(())
                                    })
                                },
                            )
                            .with_published_at(message.published_at)
                        })
                        .collect();
                    return Ok(Some(batch));
                }
                if self.queue.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Some(Vec::new()));
            }
        }
    }
}
