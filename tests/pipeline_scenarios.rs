//! Multi-module scenario tests for the sink (§8 scenarios 4-6), exercised
//! against in-memory `MessageSource`/`ChExecutor`/`AckHandle` doubles rather
//! than a live NATS/ClickHouse deployment, mirroring the seam
//! `ingester/mod.rs` establishes for the Kafka connector.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use gf_core::circuit_breaker::CircuitBreaker;
use gf_core::config::ClickHouseConfig;
use gf_core::durable::{AckHandle, DurableMessage, MessageSource};
use gf_core::error::CoreError;
use gf_core::metrics::PipelineMetrics;
use gf_core::schema::{JsonPointerSchemaMapper, SchemaMapper};
use gf_core::sink::{run_sink, ChExecutor, ClickHouseSink};

#[derive(Default)]
struct AckLog {
    acked: Mutex<Vec<u64>>,
}

struct RecordingAck {
    sequence: u64,
    log: Arc<AckLog>,
}

#[async_trait]
impl AckHandle for RecordingAck {
    async fn ack(&self) -> Result<(), CoreError> {
        self.log.acked.lock().unwrap().push(self.sequence);
        Ok(())
    }

    async fn nak(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

fn make_message(sequence: u64, id: &str, log: &Arc<AckLog>) -> DurableMessage {
    DurableMessage::new(
        sequence,
        Bytes::from(format!(r#"{{"id":"{id}"}}"#)),
        Arc::new(RecordingAck { sequence, log: log.clone() }),
    )
}

/// Hands out one scripted batch per call, then signals `drained` and parks
/// until `poll_timeout` elapses (mirroring a real consumer idling at its
/// pull timeout).
struct ScriptedSource {
    steps: Mutex<VecDeque<Vec<DurableMessage>>>,
    drained: Arc<Notify>,
}

impl ScriptedSource {
    fn new(steps: Vec<Vec<DurableMessage>>, drained: Arc<Notify>) -> Self {
        Self { steps: Mutex::new(steps.into()), drained }
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch(&self, _max: usize, poll_timeout: Duration) -> Result<Vec<DurableMessage>, CoreError> {
        let next = self.steps.lock().unwrap().pop_front();
        match next {
            Some(batch) => Ok(batch),
            None => {
                self.drained.notify_one();
                tokio::time::sleep(poll_timeout).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Records every insert attempt and returns the next scripted result (or
/// `Ok(())` once the script runs out).
struct CountingExecutor {
    calls: AtomicUsize,
    results: Mutex<VecDeque<Result<(), CoreError>>>,
    notify: Arc<Notify>,
}

impl CountingExecutor {
    fn new(results: Vec<Result<(), CoreError>>, notify: Arc<Notify>) -> Self {
        Self { calls: AtomicUsize::new(0), results: Mutex::new(results.into()), notify }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChExecutor for CountingExecutor {
    async fn execute(&self, _sql: &str) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.notify.notify_one();
        result
    }
}

fn config(max_batch_size: usize, max_delay_ms: u64) -> ClickHouseConfig {
    ClickHouseConfig {
        host: "localhost".into(),
        port: 9000,
        database: "db".into(),
        table: "events".into(),
        username: "u".into(),
        password: String::new(),
        tls_enabled: false,
        max_batch_size,
        max_delay_ms,
    }
}

fn mapper() -> Arc<dyn SchemaMapper> {
    Arc::new(JsonPointerSchemaMapper::new(vec![("id".to_string(), "/id".to_string())]))
}

#[tokio::test(start_paused = true)]
async fn sink_flushes_on_size_boundary() {
    // §8 scenario 4: maxBatchSize=3, maxDelay=60s, three records arrive in
    // quick succession, flush observed once the third lands.
    let log = Arc::new(AckLog::default());
    let drained = Arc::new(Notify::new());
    let source = ScriptedSource::new(
        vec![
            vec![make_message(1, "a", &log)],
            vec![make_message(2, "b", &log)],
            vec![make_message(3, "c", &log)],
        ],
        drained.clone(),
    );

    let flushed = Arc::new(Notify::new());
    let executor = Arc::new(CountingExecutor::new(vec![], flushed.clone()));
    let sink = ClickHouseSink::with_executor(executor.clone(), config(3, 60_000), mapper(), CircuitBreaker::new(Default::default()));

    let metrics = PipelineMetrics::new();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(run_sink(sink, source, 3, Duration::from_secs(60), metrics, shutdown.clone()));

    flushed.notified().await;
    drained.notified().await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(log.acked.lock().unwrap().len(), 3);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sink_flushes_on_timer_when_below_size_threshold() {
    // §8 scenario 5: maxBatchSize=1000, maxDelay=100ms, two records well
    // under the size threshold, flush observed once the timer fires.
    let log = Arc::new(AckLog::default());
    let drained = Arc::new(Notify::new());
    let source = ScriptedSource::new(
        vec![vec![make_message(1, "a", &log), make_message(2, "b", &log)]],
        drained.clone(),
    );

    let flushed = Arc::new(Notify::new());
    let executor = Arc::new(CountingExecutor::new(vec![], flushed.clone()));
    let sink =
        ClickHouseSink::with_executor(executor.clone(), config(1000, 100), mapper(), CircuitBreaker::new(Default::default()));

    let metrics = PipelineMetrics::new();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(run_sink(sink, source, 1000, Duration::from_millis(100), metrics, shutdown.clone()));

    drained.notified().await;
    assert_eq!(executor.calls(), 0, "batch below max size must not flush before the timer fires");

    tokio::time::advance(Duration::from_millis(150)).await;
    flushed.notified().await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(log.acked.lock().unwrap().len(), 2);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn sink_retries_transient_failure_then_succeeds() {
    // §8 scenario 6: batch of 5, first insert attempt transient, second
    // succeeds; exactly one successful insert, all five acked.
    let log = Arc::new(AckLog::default());
    let drained = Arc::new(Notify::new());
    let messages: Vec<DurableMessage> = (1..=5).map(|seq| make_message(seq, &format!("r{seq}"), &log)).collect();
    let source = ScriptedSource::new(vec![messages], drained.clone());

    let flushed = Arc::new(Notify::new());
    let executor = Arc::new(CountingExecutor::new(
        vec![Err(CoreError::jetstream("connection reset".to_string())), Ok(())],
        flushed.clone(),
    ));
    let sink = ClickHouseSink::with_executor(executor.clone(), config(5, 60_000), mapper(), CircuitBreaker::new(Default::default()));

    let metrics = PipelineMetrics::new();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(run_sink(sink, source, 5, Duration::from_secs(60), metrics, shutdown.clone()));

    flushed.notified().await;
    flushed.notified().await;

    assert_eq!(executor.calls(), 2);
    assert_eq!(log.acked.lock().unwrap().len(), 5);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn sink_surfaces_fatal_rejection_without_retrying() {
    // §7: a non-retryable ClickHouse rejection must surface immediately,
    // with no backoff attempts, and tear the pipeline down.
    let log = Arc::new(AckLog::default());
    let drained = Arc::new(Notify::new());
    let messages: Vec<DurableMessage> = vec![make_message(1, "a", &log)];
    let source = ScriptedSource::new(vec![messages], drained.clone());

    let flushed = Arc::new(Notify::new());
    let executor = Arc::new(CountingExecutor::new(
        vec![Err(CoreError::ClickHouseFatal("unknown column".to_string()))],
        flushed.clone(),
    ));
    let sink = ClickHouseSink::with_executor(executor.clone(), config(1, 60_000), mapper(), CircuitBreaker::new(Default::default()));

    let metrics = PipelineMetrics::new();
    let shutdown = CancellationToken::new();

    let result = run_sink(sink, source, 1, Duration::from_secs(60), metrics, shutdown).await;

    assert!(matches!(result, Err(CoreError::ClickHouseFatal(_))));
    assert_eq!(executor.calls(), 1, "a fatal rejection must not be retried");
    assert!(log.acked.lock().unwrap().is_empty(), "messages in a fatally rejected batch stay unacked");
}

#[tokio::test]
async fn redelivered_duplicate_is_not_acked_before_flush() {
    // A redelivered copy of an already-buffered fingerprint must not be
    // acked until the batch holding the original delivery actually flushes.
    let log = Arc::new(AckLog::default());
    let drained = Arc::new(Notify::new());
    let source = ScriptedSource::new(
        vec![vec![make_message(1, "a", &log)], vec![make_message(1, "a", &log)]],
        drained.clone(),
    );

    let flushed = Arc::new(Notify::new());
    let executor = Arc::new(CountingExecutor::new(vec![], flushed.clone()));
    // max_batch_size=10 so neither arrival triggers a size flush on its own.
    let sink =
        ClickHouseSink::with_executor(executor.clone(), config(10, 60_000), mapper(), CircuitBreaker::new(Default::default()));

    let metrics = PipelineMetrics::new();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(run_sink(sink, source, 10, Duration::from_secs(60), metrics, shutdown.clone()));

    drained.notified().await;
    assert_eq!(executor.calls(), 0);
    assert!(log.acked.lock().unwrap().is_empty(), "neither the original nor the duplicate may ack before a flush");

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(executor.calls(), 1, "shutdown must drain the non-empty batch with one final flush");
    assert_eq!(log.acked.lock().unwrap().len(), 2, "both the original and the duplicate's message ack once flushed");
}
