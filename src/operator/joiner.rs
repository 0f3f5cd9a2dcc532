//! §4.4 — the temporal joiner: one-sided chronological buffering with a
//! FIFO per side plus a `key -> list<entry>` index, matching records whose
//! arrival timestamps differ by at most `window`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::KeyType;
use crate::durable::{DurableConsumer, DurableLog};
use crate::error::CoreError;
use crate::metrics::PipelineMetrics;
use crate::record::{KeyValue, Side};
use crate::schema::extract_key;

struct BufferEntry {
    key: KeyValue,
    payload: bytes::Bytes,
    enqueued_at: Instant,
}

/// One side's buffer: FIFO by arrival order plus a key index into that same
/// `VecDeque`'s positions. Positions shift on expiry/eviction, so the index
/// stores keys only — lookups scan the (small, window-bounded) FIFO for
/// matching entries rather than tracking raw indices.
#[derive(Default)]
struct SideBuffer {
    entries: VecDeque<BufferEntry>,
}

impl SideBuffer {
    fn expire(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.entries.front() {
            if front.enqueued_at + window < now {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, key: KeyValue, payload: bytes::Bytes, now: Instant) {
        self.entries.push_back(BufferEntry { key, payload, enqueued_at: now });
    }

    fn matches(&self, key: &KeyValue) -> impl Iterator<Item = &bytes::Bytes> {
        self.entries.iter().filter(move |e| &e.key == key).map(|e| &e.payload)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct JoinerConfig {
    pub left_topic: String,
    pub left_key_path: String,
    pub left_key_type: KeyType,
    pub right_topic: String,
    pub right_key_path: String,
    pub right_key_type: KeyType,
    pub window: Duration,
    pub max_entries: Option<usize>,
}

struct JoinCore {
    config: JoinerConfig,
    left: SideBuffer,
    right: SideBuffer,
}

/// Outcome of processing one arriving record on the joiner.
enum JoinOutcome {
    Emitted(Vec<bytes::Bytes>),
    Dropped,
}

impl JoinCore {
    fn new(config: JoinerConfig) -> Self {
        Self { config, left: SideBuffer::default(), right: SideBuffer::default() }
    }

    fn cap(&mut self, side: Side) {
        let Some(cap) = self.config.max_entries else { return };
        let buffer = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        while buffer.len() > cap {
            buffer.entries.pop_front();
            warn!(?side, cap, "join buffer at capacity, evicting oldest entry ahead of its expiry");
        }
    }

    /// Processes one arriving record on `side`, matching it against the
    /// opposite buffer before inserting it into its own (§4.4's algorithm).
    fn on_arrival(&mut self, side: Side, payload: &[u8], now: Instant) -> JoinOutcome {
        let (key_path, key_type) = match side {
            Side::Left => (&self.config.left_key_path, self.config.left_key_type),
            Side::Right => (&self.config.right_key_path, self.config.right_key_type),
        };

        let key = match extract_key(payload, key_path, key_type) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "key extraction failed on joiner, dropping poison record");
                return JoinOutcome::Dropped;
            }
        };

        let window = self.config.window;
        let opposite = match side {
            Side::Left => &mut self.right,
            Side::Right => &mut self.left,
        };
        opposite.expire(window, now);

        let joined: Vec<bytes::Bytes> = opposite
            .matches(&key)
            .map(|opposite_payload| {
                let (left_payload, right_payload) = match side {
                    Side::Left => (payload, opposite_payload.as_ref()),
                    Side::Right => (opposite_payload.as_ref(), payload),
                };
                join_payload(left_payload, right_payload)
            })
            .collect();

        let own = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        own.push(key, bytes::Bytes::copy_from_slice(payload), now);
        self.cap(side);

        if joined.is_empty() {
            JoinOutcome::Dropped
        } else {
            JoinOutcome::Emitted(joined)
        }
    }
}

/// Builds `{"left": <l.payload>, "right": <r.payload>}`.
fn join_payload(left: &[u8], right: &[u8]) -> bytes::Bytes {
    let left_value: serde_json::Value = serde_json::from_slice(left).unwrap_or(serde_json::Value::Null);
    let right_value: serde_json::Value = serde_json::from_slice(right).unwrap_or(serde_json::Value::Null);

    let joined = serde_json::json!({ "left": left_value, "right": right_value });
    bytes::Bytes::from(serde_json::to_vec(&joined).unwrap_or_else(|_| b"{}".to_vec()))
}

/// Runs the joiner's cooperative loop: one `select!` across the left
/// consumer, the right consumer, and the shutdown signal, exactly matching
/// the concurrency contract of §5.
pub async fn run_joiner(
    config: JoinerConfig,
    left_consumer: DurableConsumer,
    right_consumer: DurableConsumer,
    durable: Arc<DurableLog>,
    output_subject: String,
    poll_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    let mut core = JoinCore::new(config);

    loop {
        let (side, messages) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = left_consumer.fetch(64, poll_timeout) => (Side::Left, result?),
            result = right_consumer.fetch(64, poll_timeout) => (Side::Right, result?),
        };

        for message in &messages {
            let now = Instant::now();
            match core.on_arrival(side, &message.payload, now) {
                JoinOutcome::Emitted(joined_payloads) => {
                    let mut all_published = true;
                    for (i, joined) in joined_payloads.into_iter().enumerate() {
                        let msg_id = format!("join:{:?}:{}:{}", side, message.sequence, i);
                        if let Err(e) = durable.publish_with_id(&output_subject, joined, &msg_id).await {
                            warn!(error = %e, "failed to publish joined record");
                            all_published = false;
                            break;
                        }
                        metrics.records_joined.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    // Ack only after every emitted output for this arrival
                    // has published successfully (§4.4's ordering rule).
                    if all_published {
                        if let Err(e) = message.ack().await {
                            warn!(error = %e, "failed to ack joiner input message");
                            metrics.acks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
                JoinOutcome::Dropped => {
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "failed to ack unmatched joiner input message");
                        metrics.acks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(window_ms: u64) -> JoinerConfig {
        JoinerConfig {
            left_topic: "left".into(),
            left_key_path: "/k".into(),
            left_key_type: KeyType::String,
            right_topic: "right".into(),
            right_key_path: "/k".into(),
            right_key_type: KeyType::String,
            window: Duration::from_millis(window_ms),
            max_entries: None,
        }
    }

    #[test]
    fn exact_match_within_window_emits_one_joined_record() {
        let mut core = JoinCore::new(cfg(5000));
        let t0 = Instant::now();
        assert!(matches!(core.on_arrival(Side::Left, br#"{"k":"x","v":1}"#, t0), JoinOutcome::Dropped));
        match core.on_arrival(Side::Right, br#"{"k":"x","v":2}"#, t0 + Duration::from_secs(2)) {
            JoinOutcome::Emitted(mut outs) => {
                assert_eq!(outs.len(), 1);
                let joined: serde_json::Value = serde_json::from_slice(&outs.remove(0)).unwrap();
                assert_eq!(joined["left"]["v"], 1);
                assert_eq!(joined["right"]["v"], 2);
            }
            JoinOutcome::Dropped => panic!("expected a join"),
        }
    }

    #[test]
    fn window_miss_emits_nothing() {
        let mut core = JoinCore::new(cfg(1000));
        let t0 = Instant::now();
        core.on_arrival(Side::Left, br#"{"k":"x"}"#, t0);
        let outcome = core.on_arrival(Side::Right, br#"{"k":"x"}"#, t0 + Duration::from_secs(2));
        assert!(matches!(outcome, JoinOutcome::Dropped));
    }

    #[test]
    fn one_left_record_matches_multiple_right_records() {
        let mut core = JoinCore::new(cfg(5000));
        let t0 = Instant::now();
        core.on_arrival(Side::Right, br#"{"k":"x","v":1}"#, t0);
        core.on_arrival(Side::Right, br#"{"k":"x","v":2}"#, t0 + Duration::from_millis(10));
        match core.on_arrival(Side::Left, br#"{"k":"x","v":0}"#, t0 + Duration::from_millis(20)) {
            JoinOutcome::Emitted(outs) => assert_eq!(outs.len(), 2),
            JoinOutcome::Dropped => panic!("expected two joins"),
        }
    }

    #[test]
    fn mismatched_keys_never_join() {
        let mut core = JoinCore::new(cfg(5000));
        let t0 = Instant::now();
        core.on_arrival(Side::Left, br#"{"k":"x"}"#, t0);
        let outcome = core.on_arrival(Side::Right, br#"{"k":"y"}"#, t0);
        assert!(matches!(outcome, JoinOutcome::Dropped));
    }

    #[test]
    fn poison_record_is_dropped_not_fatal() {
        let mut core = JoinCore::new(JoinerConfig { left_key_type: KeyType::I64, ..cfg(5000) });
        let outcome = core.on_arrival(Side::Left, br#"{"k":"not-a-number"}"#, Instant::now());
        assert!(matches!(outcome, JoinOutcome::Dropped));
    }
}
