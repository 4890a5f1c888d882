//! Kafka-backed broker.
//!
//! Requires the native `librdkafka` library, so it is only built with the
//! `kafka` feature. Offsets are committed manually and synchronously; auto
//! commit is always off.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};

use super::{BrokerSubscription, DeliveryReceipt, EventBroker, InboundRecord, OutboundRecord};
use crate::error::{ConductorError, Result};

#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    pub client_id: String,
    /// How long a send may sit in the producer queue before failing.
    pub message_timeout: Duration,
    pub session_timeout: Duration,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "conductor".to_string(),
            message_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
        }
    }
}

pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(ConductorError::Config("Kafka brokers cannot be empty".to_string()));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            // Same key hash as the JVM client and the in-memory broker.
            .set("partitioner", "murmur2_random")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| ConductorError::Broker(format!("Failed to create Kafka producer: {e}")))?;

        tracing::info!(brokers = %config.brokers, client_id = %config.client_id, "Kafka producer created");
        Ok(Self { producer, config })
    }
}

#[async_trait]
impl EventBroker for KafkaBroker {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReceipt> {
        let kafka_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload);

        let (partition, offset) = self
            .producer
            .send(kafka_record, Duration::from_secs(0))
            .await
            .map_err(|(e, _)| ConductorError::Broker(format!("Failed to send message: {e}")))?;

        Ok(DeliveryReceipt { partition, offset })
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Box<dyn BrokerSubscription>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                self.config.session_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| ConductorError::Broker(format!("Failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(topics)
            .map_err(|e| ConductorError::Broker(format!("Failed to subscribe to topics: {e}")))?;

        tracing::info!(group = %group, topics = ?topics, "Kafka consumer subscribed");
        Ok(Box::new(KafkaSubscription { consumer }))
    }
}

pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

#[async_trait]
impl BrokerSubscription for KafkaSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => Ok(Some(InboundRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Ok(Err(e)) => Err(ConductorError::Broker(format!("Failed to receive message: {e}"))),
            Err(_) => Ok(None),
        }
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| ConductorError::Broker(format!("Invalid commit offset: {e}")))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| ConductorError::Broker(format!("Failed to commit offsets: {e}")))
    }

    async fn seek(&mut self, record: &InboundRecord) -> Result<()> {
        self.consumer
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                Duration::from_secs(5),
            )
            .map_err(|e| ConductorError::Broker(format!("Failed to seek: {e}")))
    }
}
