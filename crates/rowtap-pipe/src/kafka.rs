//! Kafka-backed pipe over rdkafka.
//!
//! Producers batch through librdkafka and are awaited for delivery on
//! flush; the partition key is whatever the caller pushes with (the row
//! key), so a given primary key always lands on one partition. Consumer
//! groups are stable per topic: a restarted streamer resumes from its
//! last committed offset, which is what makes replay-and-dedupe work.

use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rowtap_core::AppConfig;

use super::{offset_is_oldest, Consumer, Message, Pipe, PipeError, Producer, Result};

pub struct KafkaPipe {
    brokers: String,
    group_prefix: String,
    start_oldest: bool,
    shutdown: CancellationToken,
}

impl KafkaPipe {
    pub fn new(cfg: &AppConfig, shutdown: CancellationToken) -> Self {
        KafkaPipe {
            brokers: cfg.kafka_addrs.join(","),
            group_prefix: cfg.namespace.clone(),
            start_oldest: offset_is_oldest(cfg),
            shutdown,
        }
    }
}

#[async_trait]
impl Pipe for KafkaPipe {
    fn kind(&self) -> &'static str {
        "kafka"
    }

    async fn new_producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Box::new(KafkaProducer {
            producer,
            topic: topic.to_string(),
            in_flight: Vec::new(),
        }))
    }

    async fn new_consumer(&self, topic: &str) -> Result<Box<dyn Consumer>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", format!("{}-{}", self.group_prefix, topic))
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "6000")
            .set(
                "auto.offset.reset",
                if self.start_oldest { "earliest" } else { "latest" },
            )
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
            shutdown: self.shutdown.clone(),
            positions: HashMap::new(),
            fetched: None,
        }))
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    in_flight: Vec<DeliveryFuture>,
}

impl KafkaProducer {
    fn send(&mut self, key: Option<String>, payload: Vec<u8>) -> Result<()> {
        let mut record = FutureRecord::<String, Vec<u8>>::to(&self.topic).payload(&payload);
        if let Some(key) = &key {
            record = record.key(key);
        }
        match self.producer.send_result(record) {
            Ok(delivery) => {
                self.in_flight.push(delivery);
                Ok(())
            }
            Err((e, _)) => Err(e.into()),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        for delivery in self.in_flight.drain(..) {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(e.into()),
                Err(_) => return Err(PipeError::Other("delivery channel canceled".into())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn set_format(&mut self, _format: &str) {
        // Kafka carries opaque payloads; the format lives in the state row.
    }

    async fn push(&mut self, payload: Vec<u8>) -> Result<()> {
        self.send(None, payload)
    }

    async fn push_keyed(&mut self, key: String, payload: Vec<u8>) -> Result<()> {
        self.send(Some(key), payload)
    }

    async fn push_batch(&mut self, batch: Vec<(Option<String>, Vec<u8>)>) -> Result<()> {
        for (key, payload) in batch {
            self.send(key, payload)?;
        }
        self.flush().await
    }

    async fn push_schema(&mut self, key: String, schema: Vec<u8>) -> Result<()> {
        // Schema travels in-stream as the next message.
        self.send(Some(key), schema)?;
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    shutdown: CancellationToken,
    /// Highest seen offset per partition, committed on clean close.
    positions: HashMap<i32, i64>,
    fetched: Option<Result<Message>>,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn fetch_next(&mut self) -> bool {
        if self.fetched.is_some() {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            received = self.consumer.recv() => {
                match received {
                    Ok(m) => {
                        self.positions.insert(m.partition(), m.offset());
                        let payload = m.payload().unwrap_or_default().to_vec();
                        let key = m
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned());
                        self.fetched = Some(Ok(Message { payload, key }));
                        true
                    }
                    Err(e) => {
                        self.fetched = Some(Err(e.into()));
                        true
                    }
                }
            }
        }
    }

    fn pop(&mut self) -> Result<Message> {
        self.fetched.take().unwrap_or(Err(PipeError::NothingFetched))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.positions.is_empty() {
            let mut tpl = TopicPartitionList::new();
            for (partition, offset) in &self.positions {
                tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                    .map_err(PipeError::Kafka)?;
            }
            if let Err(e) = self.consumer.commit(&tpl, CommitMode::Sync) {
                warn!(topic = %self.topic, error = %e, "offset commit failed on close");
                return Err(e.into());
            }
        }
        self.consumer.unsubscribe();
        Ok(())
    }

    async fn close_on_failure(&mut self) -> Result<()> {
        // Release without committing: the next owner replays from the
        // last committed position and dedupes by seqno.
        self.positions.clear();
        self.consumer.unsubscribe();
        Ok(())
    }
}
