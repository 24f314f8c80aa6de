//! Stream consumer: bus messages in, stored readings out.
//!
//! The loop is single-threaded on purpose: one message is fully parsed,
//! transformed, and persisted before the next is fetched, so a failure
//! is always attributable to exactly one message. Malformed messages and
//! unknown topics are logged, counted, and skipped; losing the store or
//! the bus is fatal and left to external supervision. Delivery is
//! at-least-once and appends carry no unique natural key, so duplicates
//! after a restart are possible.
//!
//! The consumer reads from a [`MessageSource`] rather than a concrete
//! bus client; production feeds it from the REST bus poller
//! ([`crate::bus::RestBusSource`]), tests from an in-process channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::SensorReading;
use crate::store::ReadingStore;

// ---

/// One message as received from a bus topic.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Value,
}

/// Where the consumer pulls messages from.
#[async_trait]
pub trait MessageSource: Send {
    /// The next message, or `None` once the source is exhausted/closed.
    /// An `Err` means the bus itself failed and the consumer should die.
    async fn next_message(&mut self) -> Result<Option<IncomingMessage>>;
}

/// In-process source fed through a tokio channel. The production bus
/// poller pushes into the sending half; tests push fixtures.
pub struct ChannelSource {
    rx: mpsc::Receiver<IncomingMessage>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<IncomingMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<IncomingMessage>> {
        Ok(self.rx.recv().await)
    }
}

// ---

/// Running counters for one consumer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub stored: u64,
    pub errors: u64,
}

/// The long-lived ingestion loop.
pub struct StreamConsumer<S, M> {
    store: Arc<S>,
    source: M,
    config: Config,
    stats: ConsumerStats,
}

impl<S: ReadingStore, M: MessageSource> StreamConsumer<S, M> {
    pub fn new(store: Arc<S>, source: M, config: Config) -> Self {
        Self {
            store,
            source,
            config,
            stats: ConsumerStats::default(),
        }
    }

    /// Consume until the source closes or an interrupt arrives. The
    /// in-flight message is always processed to completion before
    /// shutdown; each append is a single independent write, so there is
    /// nothing to roll back.
    ///
    /// Returns the session counters on clean shutdown; store or bus
    /// connectivity failures propagate instead.
    pub async fn run(mut self) -> Result<ConsumerStats> {
        // ---
        info!(topics = ?self.config.topics, "consumer started");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("interrupt received, stopping consumer");
                    break;
                }
                message = self.source.next_message() => {
                    match message? {
                        Some(message) => self.process(message).await?,
                        None => {
                            info!("message source closed, stopping consumer");
                            break;
                        }
                    }
                }
            }
        }

        let processed = self.stats.stored + self.stats.errors;
        let success_rate = if processed > 0 {
            self.stats.stored as f64 / processed as f64 * 100.0
        } else {
            100.0
        };
        info!(
            stored = self.stats.stored,
            errors = self.stats.errors,
            success_rate = format!("{success_rate:.1}%"),
            "consumer session summary"
        );

        Ok(self.stats)
    }

    /// Handle one message. Data-quality problems are recovered here by
    /// counting and skipping; only store failures bubble up.
    async fn process(&mut self, message: IncomingMessage) -> Result<()> {
        // ---
        // Fail closed on topics we did not subscribe for.
        let Some(sensor_type) = self.config.sensor_type_for_topic(&message.topic) else {
            warn!(topic = %message.topic, "message on unknown topic skipped");
            self.stats.errors += 1;
            return Ok(());
        };

        let reading = match SensorReading::from_payload(sensor_type, &message.payload, Utc::now())
        {
            Ok(reading) => reading,
            Err(e) if e.is_recoverable() => {
                error!(topic = %message.topic, error = %e, "malformed message skipped");
                self.stats.errors += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.store.append(&reading).await?;
        self.stats.stored += 1;

        if self.stats.stored % 10 == 0 {
            info!(
                stored = self.stats.stored,
                errors = self.stats.errors,
                "ingestion progress"
            );
        }

        Ok(())
    }
}
