//! Operators: Passthrough, Deduplicator, Joiner, and the chained
//! DeduplicatingJoiner (§4.2–§4.4).
//!
//! All four share the same cooperative-loop discipline (§5): one consumer
//! (or two, for the Joiner) is owned by exactly one loop, all window state
//! is touched only from that loop, and output order equals input
//! consumption order.

pub mod dedup;
pub mod dedup_join;
pub mod joiner;
pub mod passthrough;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::durable::DurableLog;
use crate::error::CoreError;
use crate::metrics::PipelineMetrics;

/// What a single-input operator does with one consumed record.
pub enum OperatorOutcome {
    /// Publish `payload` to the output subject, then ack the input message.
    Emit(bytes::Bytes),
    /// Ack the input message without publishing anything (dedup suppression
    /// or a dropped poison message).
    Suppress,
}

/// The per-record behavior of a single-input operator (Passthrough or
/// Deduplicator). The surrounding loop (`run_single_input_operator`) owns
/// I/O and cancellation; this trait owns only the transformation.
pub trait RecordTransform: Send {
    fn apply(&mut self, payload: &[u8]) -> OperatorOutcome;

    /// Drop window entries that have expired. Called once per loop
    /// iteration so a quiet topic still reclaims memory (§4.3's eviction
    /// step happens on every record, but nothing stops an implementer from
    /// also running it on the idle-poll path — this keeps the map bounded
    /// even when traffic pauses).
    fn evict_expired(&mut self) {}
}

/// Drives a single-input operator: pulls from `consumer`, applies
/// `transform`, publishes emitted records to `output_subject`, and acks the
/// input message once publishing (if any) succeeds.
pub async fn run_single_input_operator(
    mut transform: impl RecordTransform,
    consumer: crate::durable::DurableConsumer,
    durable: Arc<DurableLog>,
    output_subject: String,
    poll_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    loop {
        if shutdown.is_cancelled() {
            debug!("operator loop observed shutdown");
            break;
        }

        let messages = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = consumer.fetch(64, poll_timeout) => result?,
        };

        if messages.is_empty() {
            transform.evict_expired();
            continue;
        }

        for message in &messages {
            transform.evict_expired();
            match transform.apply(&message.payload) {
                OperatorOutcome::Emit(payload) => {
                    let msg_id = format!("op:{}", message.sequence);
                    match durable.publish_with_id(&output_subject, payload, &msg_id).await {
                        Ok(_seq) => {
                            if let Err(e) = message.ack().await {
                                warn!(error = %e, "failed to ack operator input message after publish");
                                metrics.acks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to publish operator output, leaving input unacked for redelivery");
                        }
                    }
                }
                OperatorOutcome::Suppress => {
                    metrics.records_suppressed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "failed to ack suppressed operator input message");
                        metrics.acks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }
    }

    Ok(())
}
