//! The durable log: a thin wrapper over NATS JetStream providing the
//! per-pipeline stream/subject layout and message-id deduplication the
//! external interfaces design (§6) requires.
//!
//! One input stream per topic (`gf.<pipelineId>.in.<topic>`), one output
//! stream (`gf.<pipelineId>.out`). Publish uses the `Nats-Msg-Id` header for
//! JetStream-side dedup; consumers are pull-based with explicit, per-message
//! ack policy.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, ReplayPolicy};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::Client as NatsClient;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Builds the subject/stream names spec.md §6 mandates for one pipeline.
#[derive(Debug, Clone)]
pub struct Subjects {
    pipeline_id: String,
}

impl Subjects {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self { pipeline_id: pipeline_id.into() }
    }

    pub fn input_subject(&self, topic: &str) -> String {
        format!("gf.{}.in.{}", self.pipeline_id, topic)
    }

    pub fn input_stream(&self, topic: &str) -> String {
        format!("gf-{}-in-{}", self.pipeline_id, topic)
    }

    pub fn output_subject(&self) -> String {
        format!("gf.{}.out", self.pipeline_id)
    }

    pub fn output_stream(&self) -> String {
        format!("gf-{}-out", self.pipeline_id)
    }
}

/// A connected handle onto the durable log for one pipeline.
pub struct DurableLog {
    #[allow(dead_code)]
    client: NatsClient,
    jetstream: JetStreamContext,
    subjects: Subjects,
}

impl DurableLog {
    pub async fn connect(url: &str, pipeline_id: &str) -> Result<Self, CoreError> {
        info!(url, pipeline_id, "connecting to JetStream");
        let client = async_nats::connect(url).await.map_err(|e| CoreError::jetstream(e.to_string()))?;
        let jetstream = async_nats::jetstream::new(client.clone());
        Ok(Self { client, jetstream, subjects: Subjects::new(pipeline_id) })
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Creates the stream if absent. Idempotent.
    pub async fn ensure_stream(&self, stream_name: &str, subject: &str) -> Result<(), CoreError> {
        let config = StreamConfig {
            name: stream_name.to_string(),
            subjects: vec![subject.to_string()],
            duplicate_window: Duration::from_secs(120),
            ..Default::default()
        };

        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                debug!(stream = stream_name, "stream already exists");
            }
            Err(_) => {
                info!(stream = stream_name, "creating stream");
                self.jetstream.create_stream(config).await.map_err(|e| CoreError::jetstream(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Publishes `payload` to `subject` with a message-id derived from
    /// `{partition}:{offset}` so a redelivered/republished Kafka message
    /// collapses to one JetStream entry.
    pub async fn publish_with_id(&self, subject: &str, payload: bytes::Bytes, msg_id: &str) -> Result<u64, CoreError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| CoreError::jetstream(e.to_string()))?;

        let ack = ack.await.map_err(|e| CoreError::jetstream(e.to_string()))?;
        Ok(ack.sequence)
    }

    pub async fn create_pull_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<DurableConsumer, CoreError> {
        let stream = self.jetstream.get_stream(stream_name).await.map_err(|e| CoreError::jetstream(e.to_string()))?;

        let config = PullConsumerConfig {
            durable_name: Some(consumer_name.to_string()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            filter_subject: filter_subject.to_string(),
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(consumer_name, config)
            .await
            .map_err(|e| CoreError::jetstream(e.to_string()))?;

        Ok(DurableConsumer { consumer })
    }
}

/// The ack/nak side of a pulled message, split out from [`DurableMessage`]
/// so tests can supply an in-memory double instead of a live JetStream
/// subscription — mirroring the `SourceSubscription` seam in
/// `ingester/mod.rs`.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), CoreError>;
    async fn nak(&self) -> Result<(), CoreError>;
}

struct JetStreamAck {
    inner: async_nats::jetstream::Message,
}

#[async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(&self) -> Result<(), CoreError> {
        self.inner.ack().await.map_err(|e| CoreError::jetstream(e.to_string()))
    }

    async fn nak(&self) -> Result<(), CoreError> {
        self.inner
            .ack_with(async_nats::jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| CoreError::jetstream(e.to_string()))
    }
}

/// One message pulled off a durable consumer. Carries the JetStream
/// sequence number (the spec's `fingerprint`/`durableSeq`) and must be
/// explicitly acked or nak'd by the caller.
pub struct DurableMessage {
    ack_handle: Arc<dyn AckHandle>,
    pub sequence: u64,
    pub payload: bytes::Bytes,
}

impl DurableMessage {
    /// Builds a message around an arbitrary ack handle — used by the real
    /// JetStream consumer below and by test doubles for the sink/operator
    /// loops that need to observe ack/nak without a live NATS connection.
    pub fn new(sequence: u64, payload: bytes::Bytes, ack_handle: Arc<dyn AckHandle>) -> Self {
        Self { ack_handle, sequence, payload }
    }

    pub async fn ack(&self) -> Result<(), CoreError> {
        self.ack_handle.ack().await
    }

    pub async fn nak(&self) -> Result<(), CoreError> {
        self.ack_handle.nak().await
    }
}

/// The durable consumer's pull interface, per the same out-of-scope-seam
/// pattern as `ingester::SourceSubscription`: the sink's loop only ever
/// talks to this trait, so it can run against an in-memory double in tests.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(&self, max: usize, poll_timeout: Duration) -> Result<Vec<DurableMessage>, CoreError>;
}

pub struct DurableConsumer {
    consumer: async_nats::jetstream::consumer::Consumer<PullConsumerConfig>,
}

impl DurableConsumer {
    /// Pulls up to `max` messages, bounded by `poll_timeout` so the caller's
    /// cooperative loop can observe cancellation between polls (§5).
    pub async fn fetch(&self, max: usize, poll_timeout: Duration) -> Result<Vec<DurableMessage>, CoreError> {
        let batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(poll_timeout)
            .messages()
            .await
            .map_err(|e| CoreError::jetstream(e.to_string()))?;

        let collected: Vec<_> = batch.collect().await;
        let mut out = Vec::with_capacity(collected.len());
        for item in collected {
            match item {
                Ok(msg) => {
                    let info = msg.info().map_err(|e| CoreError::jetstream(e.to_string()))?;
                    let sequence = info.stream_sequence;
                    let payload = msg.payload.clone();
                    let ack_handle = Arc::new(JetStreamAck { inner: msg });
                    out.push(DurableMessage { ack_handle, sequence, payload });
                }
                Err(e) => warn!(error = %e, "failed to receive durable message"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageSource for DurableConsumer {
    async fn fetch(&self, max: usize, poll_timeout: Duration) -> Result<Vec<DurableMessage>, CoreError> {
        self.fetch(max, poll_timeout).await
    }
}
