//! Message bus client: long-polling consumer against the bus REST
//! gateway (Kafka REST proxy v2 wire format).
//!
//! On connect, a consumer instance is registered under the shared group
//! and subscribed to the three sensor topics; `next_message` then drains
//! a small local buffer refilled by long polls. Any transport failure is
//! surfaced to the consumer loop, which treats it as fatal; retries
//! below that level are the HTTP client's business.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::consumer::{IncomingMessage, MessageSource};
use crate::error::Result;

// ---

const CONTENT_TYPE: &str = "application/vnd.kafka.v2+json";
const ACCEPT_JSON_RECORDS: &str = "application/vnd.kafka.json.v2+json";
const POLL_TIMEOUT_MS: u64 = 3_000;
const EMPTY_POLL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct CreateConsumerResponse {
    instance_id: String,
    base_uri: String,
}

#[derive(Debug, Deserialize)]
struct BusRecord {
    topic: String,
    value: Value,
}

fn records_to_messages(records: Vec<BusRecord>) -> VecDeque<IncomingMessage> {
    records
        .into_iter()
        .map(|r| IncomingMessage {
            topic: r.topic,
            payload: r.value,
        })
        .collect()
}

// ---

/// A registered, subscribed consumer instance on the bus gateway.
pub struct RestBusSource {
    client: reqwest::Client,
    instance_uri: String,
    buffer: VecDeque<IncomingMessage>,
}

impl RestBusSource {
    /// Register a consumer instance in the configured group and
    /// subscribe it to all sensor topics. Offsets start at the earliest
    /// uncommitted position, committed automatically after each poll.
    pub async fn connect(config: &Config) -> Result<Self> {
        // ---
        let client = reqwest::Client::new();
        let instance_name = format!("civisense-{}", Uuid::new_v4());

        let created: CreateConsumerResponse = client
            .post(format!(
                "{}/consumers/{}",
                config.bus_url, config.bus_consumer_group
            ))
            .header("Content-Type", CONTENT_TYPE)
            .json(&json!({
                "name": instance_name,
                "format": "json",
                "auto.offset.reset": "earliest",
                "auto.commit.enable": "true",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(
            instance = created.instance_id,
            group = config.bus_consumer_group,
            "bus consumer instance registered"
        );

        client
            .post(format!("{}/subscription", created.base_uri))
            .header("Content-Type", CONTENT_TYPE)
            .json(&json!({ "topics": config.topics }))
            .send()
            .await?
            .error_for_status()?;

        info!(topics = ?config.topics, "subscribed to sensor topics");

        Ok(Self {
            client,
            instance_uri: created.base_uri,
            buffer: VecDeque::new(),
        })
    }

    async fn poll(&mut self) -> Result<()> {
        // ---
        let records: Vec<BusRecord> = self
            .client
            .get(format!(
                "{}/records?timeout={POLL_TIMEOUT_MS}",
                self.instance_uri
            ))
            .header("Accept", ACCEPT_JSON_RECORDS)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(count = records.len(), "bus poll complete");
        self.buffer = records_to_messages(records);
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RestBusSource {
    /// Never yields `None`: the bus is an endless stream. Errors mean
    /// the gateway is gone and the consumer process should exit.
    async fn next_message(&mut self) -> Result<Option<IncomingMessage>> {
        // ---
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Ok(Some(message));
            }
            self.poll().await?;
            if self.buffer.is_empty() {
                tokio::time::sleep(EMPTY_POLL_BACKOFF).await;
            }
        }
    }
}

impl Drop for RestBusSource {
    /// Best-effort deregistration so the group does not accumulate dead
    /// instances; the gateway also expires them on its own timeout.
    fn drop(&mut self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let uri = self.instance_uri.clone();
            handle.spawn(async move {
                if client.delete(&uri).send().await.is_ok() {
                    info!("bus consumer instance deregistered");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn records_deserialize_and_convert() {
        // ---
        let body = json!([
            {
                "topic": "sensor-air",
                "key": null,
                "value": { "time": "2026-03-26T18:00:00Z", "object.co2": 412.0 },
                "partition": 0,
                "offset": 41
            },
            {
                "topic": "sensor-noise",
                "key": null,
                "value": { "time": "2026-03-26T18:00:05Z", "object.LAeq": 58.1 },
                "partition": 0,
                "offset": 42
            }
        ]);

        let records: Vec<BusRecord> = serde_json::from_value(body).unwrap();
        let messages = records_to_messages(records);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, "sensor-air");
        assert_eq!(messages[1].payload["object.LAeq"], json!(58.1));
    }

    #[test]
    fn create_consumer_response_shape() {
        // ---
        let body = json!({
            "instance_id": "civisense-1234",
            "base_uri": "http://bus:8082/consumers/g/instances/civisense-1234"
        });
        let created: CreateConsumerResponse = serde_json::from_value(body).unwrap();
        assert!(created.base_uri.ends_with(&created.instance_id));
    }
}
