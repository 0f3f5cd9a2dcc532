//! The Ingester (§4.1): transports records from Kafka into a durable
//! per-topic JetStream subject, preserving per-partition order.
//!
//! The Kafka connector itself is out of scope (§1) — the core depends only
//! on the `SourceSubscription` trait below. `KafkaSourceSubscription` is the
//! real implementation, grounded on the Kafka consumer loops in the example
//! pack; tests exercise the ingester against an in-memory double.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::ClientConfig;
use rdkafka::Message as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{InitialOffset, KafkaConfig};
use crate::durable::DurableLog;
use crate::error::CoreError;
use crate::metrics::PipelineMetrics;
use crate::retry::retry_forever;

/// A single decoded unit read off the Kafka connector, not yet published.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub payload: Bytes,
    pub partition: i32,
    pub offset: i64,
    pub topic: String,
}

/// The Kafka connector's interface, per §1's out-of-scope boundary: the
/// ingester only ever talks to this trait.
#[async_trait]
pub trait SourceSubscription: Send {
    /// Blocks until the next message is available or a transient error
    /// occurs (to be retried by the caller).
    async fn recv(&mut self) -> Result<SourceMessage, CoreError>;

    /// Advances the consumer's committed position past `message`. Called
    /// only after the message has been durably published downstream.
    async fn commit(&mut self, message: &SourceMessage) -> Result<(), CoreError>;
}

/// Real Kafka subscription backed by `rdkafka::StreamConsumer`, with
/// `enable.auto.commit=false` — offsets are advanced explicitly, only after
/// a successful JetStream publish (§4.1).
pub struct KafkaSourceSubscription {
    consumer: StreamConsumer,
}

impl KafkaSourceSubscription {
    pub fn new(config: &KafkaConfig) -> Result<Self, CoreError> {
        let offset_reset = match config.initial_offset {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", "300000")
            .set_log_level(RDKafkaLogLevel::Info)
            .create()
            .map_err(CoreError::Kafka)?;

        let topic_refs: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(CoreError::Kafka)?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl SourceSubscription for KafkaSourceSubscription {
    async fn recv(&mut self) -> Result<SourceMessage, CoreError> {
        let msg = self.consumer.recv().await.map_err(CoreError::Kafka)?;
        let payload = msg.payload().unwrap_or_default().to_vec();
        Ok(SourceMessage {
            payload: Bytes::from(payload),
            partition: msg.partition(),
            offset: msg.offset(),
            topic: msg.topic().to_string(),
        })
    }

    async fn commit(&mut self, message: &SourceMessage) -> Result<(), CoreError> {
        let mut tpl = rdkafka::TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, rdkafka::Offset::Offset(message.offset + 1))
            .map_err(CoreError::Kafka)?;
        self.consumer.commit(&tpl, CommitMode::Async).map_err(CoreError::Kafka)
    }
}

/// Runs the ingester's cooperative loop for one topic: pull from Kafka,
/// publish into `gf.<pipelineId>.in.<topic>`, commit the Kafka offset only
/// once the publish has been acknowledged.
pub async fn run_ingester(
    mut source: impl SourceSubscription,
    durable: Arc<DurableLog>,
    topic: String,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    let subject = durable.subjects().input_subject(&topic);
    let stream_name = durable.subjects().input_stream(&topic);
    durable.ensure_stream(&stream_name, &subject).await?;

    info!(topic, subject, "ingester started");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(topic, "ingester received shutdown signal");
                break;
            }
            result = source.recv() => result,
        };

        let message = match message {
            Ok(m) => m,
            Err(e) if e.is_transient() => {
                warn!(topic, error = %e, "transient error receiving from Kafka, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }
            Err(e) => {
                error!(topic, error = %e, "fatal error receiving from Kafka");
                return Err(e);
            }
        };

        let msg_id = format!("{}:{}", message.partition, message.offset);
        let payload = message.payload.clone();
        let subject_clone = subject.clone();
        let durable_clone = durable.clone();

        let published = retry_forever(&shutdown, || {
            let durable = durable_clone.clone();
            let subject = subject_clone.clone();
            let payload = payload.clone();
            let msg_id = msg_id.clone();
            async move { durable.publish_with_id(&subject, payload, &msg_id).await }
        })
        .await;

        let Some(_sequence) = published else {
            info!(topic, "ingester stopping mid-publish due to shutdown");
            break;
        };

        if let Err(e) = source.commit(&message).await {
            warn!(topic, error = %e, "failed to commit Kafka offset, will be redelivered");
        }

        metrics.records_ingested.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(topic, offset = message.offset, "record published to durable log");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// An in-memory double standing in for the out-of-scope Kafka
    /// connector, yielding a fixed sequence of messages then blocking
    /// forever (as a real `recv` would while idle).
    struct FixedSourceSubscription {
        messages: Mutex<Vec<SourceMessage>>,
        committed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceSubscription for FixedSourceSubscription {
        async fn recv(&mut self) -> Result<SourceMessage, CoreError> {
            let next = self.messages.lock().unwrap().pop();
            match next {
                Some(m) => Ok(m),
                None => std::future::pending().await,
            }
        }

        async fn commit(&mut self, _message: &SourceMessage) -> Result<(), CoreError> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn source_message_carries_partition_offset_for_msg_id() {
        let msg = SourceMessage { payload: Bytes::from_static(b"{}"), partition: 2, offset: 42, topic: "t".into() };
        assert_eq!(format!("{}:{}", msg.partition, msg.offset), "2:42");
    }

    #[tokio::test]
    async fn commit_increments_counter_only_after_call() {
        let committed = Arc::new(AtomicUsize::new(0));
        let mut source =
            FixedSourceSubscription { messages: Mutex::new(Vec::new()), committed: committed.clone() };
        let msg = SourceMessage { payload: Bytes::from_static(b"{}"), partition: 0, offset: 1, topic: "t".into() };
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        source.commit(&msg).await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }
}
