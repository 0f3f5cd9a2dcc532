//! The ClickHouse batch sink (§4.5): the only component that owns a
//! ClickHouse connection, running the state machine Idle -> Filling ->
//! Flushing -> (Idle | Retrying) -> (Idle | Failed).
//!
//! A single cooperative loop selects among three sources per iteration
//! (§5): the input consumer, the flush timer, and shutdown. The timer is
//! armed only on the empty-to-nonempty transition and disarmed on flush, so
//! an idle pipeline never wakes the loop for nothing.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clickhouse::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ClickHouseConfig;
use crate::durable::{DurableMessage, MessageSource};
use crate::error::CoreError;
use crate::metrics::PipelineMetrics;
use crate::record::{Batch, ColumnValue};
use crate::retry::retry_with_backoff_if;
use crate::schema::SchemaMapper;

/// Mirrors the table in §4.5. `Idle` and `Filling` are distinguished only by
/// `batch.is_empty()`, so they are not represented as separate variants —
/// the sink tracks `Flushing`/`Retrying`/`Failed` explicitly because those
/// are the states with observable side effects (the circuit breaker, the
/// metrics counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    Filling,
    Flushing,
    Retrying,
    Failed,
}

/// The ClickHouse insert call, split out from [`ClickHouseSink`] so tests
/// can supply an in-memory double instead of a live connection — mirroring
/// the `SourceSubscription` seam in `ingester/mod.rs`. Returns
/// `CoreError::ClickHouseFatal` directly for a non-retryable rejection so a
/// test double never has to construct an opaque `clickhouse::error::Error`.
#[async_trait]
pub trait ChExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<(), CoreError>;
}

/// The real ClickHouse executor, backed by the `clickhouse` crate's HTTP
/// client.
pub struct NativeChClient {
    client: Client,
}

impl NativeChClient {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, CoreError> {
        let password = config.decoded_password()?;
        let client = Client::default()
            .with_url(config.url())
            .with_user(&config.username)
            .with_password(password)
            .with_database(&config.database)
            .with_compression(clickhouse::Compression::Lz4);

        Ok(Self { client })
    }
}

#[async_trait]
impl ChExecutor for NativeChClient {
    async fn execute(&self, sql: &str) -> Result<(), CoreError> {
        self.client.query(sql).execute().await.map_err(|e| {
            if is_fatal_rejection(&e) {
                CoreError::ClickHouseFatal(e.to_string())
            } else {
                CoreError::ClickHouse(e)
            }
        })
    }
}

/// ClickHouse returns a server exception with a numeric code on schema
/// mismatches and malformed data; everything else (connection refused,
/// timeout) is presumed transient. The `clickhouse` crate doesn't expose
/// the server error code directly, so this is a string-based heuristic —
/// narrower detection would require parsing the native protocol exception
/// frame ourselves.
fn is_fatal_rejection(e: &clickhouse::error::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("type mismatch")
        || msg.contains("unknown column")
        || msg.contains("cannot parse")
        || msg.contains("no such column")
}

pub struct ClickHouseSink {
    executor: Arc<dyn ChExecutor>,
    config: ClickHouseConfig,
    schema: Arc<dyn SchemaMapper>,
    circuit_breaker: Arc<CircuitBreaker>,
    state: SinkState,
}

impl ClickHouseSink {
    /// Opens the sink's single ClickHouse connection. §5/§9 require
    /// `MaxOpenConns == MaxIdleConns == 1`; the `clickhouse` crate's HTTP
    /// client already holds exactly one connection per `Client`, so that
    /// invariant is satisfied by never constructing more than one `Client`
    /// per sink, not by a pool configuration knob.
    pub fn new(config: ClickHouseConfig, schema: Arc<dyn SchemaMapper>, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, CoreError> {
        let executor = Arc::new(NativeChClient::new(&config)?);
        Ok(Self::with_executor(executor, config, schema, circuit_breaker))
    }

    /// Builds a sink around an arbitrary [`ChExecutor`] — for tests, or for
    /// an alternate ClickHouse transport.
    pub fn with_executor(
        executor: Arc<dyn ChExecutor>,
        config: ClickHouseConfig,
        schema: Arc<dyn SchemaMapper>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self { executor, config, schema, circuit_breaker, state: SinkState::Idle }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Builds `INSERT INTO <table> (cols...) VALUES (...), ...` from the
    /// batch's rows in the schema mapper's column order. The `clickhouse`
    /// crate's typed `Row` insert API assumes a fixed Rust struct per table;
    /// this sink's column set is config-driven, so rows are rendered as SQL
    /// literals instead.
    fn render_insert(&self, batch: &Batch) -> String {
        let columns = self.schema.ordered_columns().join(", ");
        let mut sql = format!("INSERT INTO {} ({}) VALUES ", self.config.table, columns);

        for (i, row) in batch.rows().iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push('(');
            for (j, value) in row.columns.iter().enumerate() {
                if j > 0 {
                    sql.push(',');
                }
                sql.push_str(&render_value(value));
            }
            sql.push(')');
        }

        sql
    }

    /// Attempts one insert of `batch` against ClickHouse. `Ok` means the
    /// rows are durably committed; `Err` distinguishes a transient failure
    /// (caller may retry) from `CoreError::ClickHouseFatal` (§7: the
    /// supervisor tears the pipeline down).
    async fn try_flush(&self, batch: &Batch, metrics: &PipelineMetrics) -> Result<(), CoreError> {
        if !self.circuit_breaker.allow().await {
            return Err(CoreError::jetstream("circuit breaker open, ClickHouse presumed unavailable".to_string()));
        }

        let sql = self.render_insert(batch);
        match self.executor.execute(&sql).await {
            Ok(()) => {
                self.circuit_breaker.on_success().await;
                Ok(())
            }
            Err(e) => {
                if self.circuit_breaker.on_failure().await {
                    warn!("circuit breaker tripped open after repeated ClickHouse failures");
                    metrics.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }
}

fn render_value(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        ColumnValue::I64(i) => i.to_string(),
        ColumnValue::U64(u) => u.to_string(),
        ColumnValue::F64(f) => f.to_string(),
        ColumnValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        ColumnValue::Null => "NULL".to_string(),
    }
}

/// What a flush attempt settled on, so `run_sink` can react correctly
/// instead of uniformly clearing the timer and resetting to `Idle`
/// regardless of outcome.
enum FlushOutcome {
    /// Batch inserted and every contributing message acked.
    Flushed,
    /// Every retry attempt failed with a transient error; the batch and its
    /// pending acks are untouched, so the timer must stay armed to try
    /// again.
    Retrying,
    /// ClickHouse rejected the batch outright. Non-retryable — the
    /// supervisor must tear the pipeline down.
    Fatal(String),
}

/// Runs the sink's cooperative loop.
///
/// The timer is armed (`flush_deadline = Some(...)`) only when a record
/// lands in an empty batch and disarmed on every successful or fatal flush,
/// matching §4.5's "timer armed only on empty-to-nonempty transition" rule
/// precisely — an already-filling batch receiving more records does not
/// rearm it. A `Retrying` outcome rearms the timer rather than clearing it,
/// since the batch remains non-empty and still needs a future trigger.
pub async fn run_sink(
    mut sink: ClickHouseSink,
    consumer: impl MessageSource,
    max_batch_size: usize,
    max_delay: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    let mut batch = Batch::new();
    let mut pending_messages: Vec<DurableMessage> = Vec::new();
    let mut flush_deadline: Option<tokio::time::Instant> = None;
    let poll_timeout = Duration::from_millis(500);

    loop {
        let sleep_until = flush_deadline.unwrap_or_else(|| tokio::time::Instant::now() + poll_timeout);

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("sink received shutdown signal");
                if !batch.is_empty() {
                    let outcome = flush(&mut sink, &mut batch, &mut pending_messages, &metrics, &shutdown).await;
                    if let FlushOutcome::Fatal(reason) = outcome {
                        return Err(CoreError::ClickHouseFatal(reason));
                    }
                }
                break;
            }
            _ = tokio::time::sleep_until(sleep_until), if flush_deadline.is_some() => {
                sink.state = SinkState::Flushing;
                match flush(&mut sink, &mut batch, &mut pending_messages, &metrics, &shutdown).await {
                    FlushOutcome::Flushed => {
                        flush_deadline = None;
                        sink.state = SinkState::Idle;
                    }
                    FlushOutcome::Retrying => {
                        flush_deadline = Some(tokio::time::Instant::now() + max_delay);
                    }
                    FlushOutcome::Fatal(reason) => {
                        return Err(CoreError::ClickHouseFatal(reason));
                    }
                }
            }
            result = consumer.fetch(64, poll_timeout) => {
                let messages = result?;
                for message in messages {
                    let was_empty = batch.is_empty();

                    let columns = match sink.schema.map(&message.payload) {
                        Ok(cols) => cols,
                        Err(e) => {
                            warn!(error = %e, "schema mapper rejected record, dropping poison message");
                            metrics.records_dropped_poison.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = message.ack().await {
                                warn!(error = %e, "failed to ack dropped poison message");
                            }
                            continue;
                        }
                    };

                    match batch.append(message.sequence, columns, message.sequence) {
                        crate::record::AppendOutcome::Appended => pending_messages.push(message),
                        crate::record::AppendOutcome::AlreadyPresent => {
                            // Don't ack yet: this redelivered duplicate's
                            // message must only be acked once the batch
                            // holding the original delivery of this
                            // fingerprint actually flushes (no JetStream
                            // message is acked before the insert containing
                            // its fingerprint returns success).
                            pending_messages.push(message);
                        }
                    }

                    if was_empty && !batch.is_empty() {
                        flush_deadline = Some(tokio::time::Instant::now() + max_delay);
                    }

                    if batch.len() >= max_batch_size {
                        sink.state = SinkState::Flushing;
                        match flush(&mut sink, &mut batch, &mut pending_messages, &metrics, &shutdown).await {
                            FlushOutcome::Flushed => {
                                flush_deadline = None;
                                sink.state = SinkState::Idle;
                            }
                            FlushOutcome::Retrying => {
                                flush_deadline = Some(tokio::time::Instant::now() + max_delay);
                            }
                            FlushOutcome::Fatal(reason) => {
                                return Err(CoreError::ClickHouseFatal(reason));
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Flushes the current batch: insert, then ack every contributing message
/// individually only after the insert has succeeded (§4.5/§9 — the stricter
/// per-fingerprint ack policy, not a single last-message ack).
async fn flush(
    sink: &mut ClickHouseSink,
    batch: &mut Batch,
    pending_messages: &mut Vec<DurableMessage>,
    metrics: &Arc<PipelineMetrics>,
    shutdown: &CancellationToken,
) -> FlushOutcome {
    if batch.is_empty() {
        return FlushOutcome::Flushed;
    }

    let row_count = batch.len() as u64;
    let result = retry_with_backoff_if(5, shutdown, || sink.try_flush(batch, metrics), CoreError::is_transient).await;

    match result {
        Ok(()) => {
            metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
            metrics.rows_inserted.fetch_add(row_count, Ordering::Relaxed);
            for message in pending_messages.drain(..) {
                if let Err(e) = message.ack().await {
                    warn!(error = %e, "failed to ack message after successful flush");
                    metrics.acks_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            *batch = Batch::new();
            FlushOutcome::Flushed
        }
        Err(CoreError::ClickHouseFatal(reason)) => {
            error!(reason, "ClickHouse rejected the batch, this pipeline cannot make progress");
            sink.state = SinkState::Failed;
            // Left unacked: a fatal rejection is a configuration/schema
            // problem the supervisor must surface, not something a redeliver
            // can fix, but at-least-once still requires the messages remain
            // claimable rather than silently dropped.
            FlushOutcome::Fatal(reason)
        }
        Err(e) => {
            warn!(error = %e, "batch flush failed after retries, will retry on next timer/size trigger");
            metrics.insert_retries.fetch_add(1, Ordering::Relaxed);
            sink.state = SinkState::Retrying;
            FlushOutcome::Retrying
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JsonPointerSchemaMapper;

    fn mapper() -> Arc<dyn SchemaMapper> {
        Arc::new(JsonPointerSchemaMapper::new(vec![("id".to_string(), "/id".to_string())]))
    }

    fn test_config() -> ClickHouseConfig {
        ClickHouseConfig {
            host: "localhost".into(),
            port: 9000,
            database: "db".into(),
            table: "events".into(),
            username: "u".into(),
            password: String::new(),
            tls_enabled: false,
            max_batch_size: 10,
            max_delay_ms: 1000,
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl ChExecutor for NoopExecutor {
        async fn execute(&self, _sql: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[test]
    fn render_insert_orders_columns_and_escapes_strings() {
        let cb = CircuitBreaker::new(Default::default());
        let sink = ClickHouseSink::with_executor(Arc::new(NoopExecutor), test_config(), mapper(), cb);

        let mut batch = Batch::new();
        batch.append(1, vec![ColumnValue::Str("o'brien".to_string())], 100);

        let sql = sink.render_insert(&batch);
        assert_eq!(sql, "INSERT INTO events (id) VALUES ('o\\'brien')");
    }

    #[test]
    fn render_value_covers_all_column_types() {
        assert_eq!(render_value(&ColumnValue::I64(-5)), "-5");
        assert_eq!(render_value(&ColumnValue::U64(5)), "5");
        assert_eq!(render_value(&ColumnValue::Bool(true)), "1");
        assert_eq!(render_value(&ColumnValue::Null), "NULL");
    }

    #[test]
    fn empty_batch_flush_is_a_no_op_boundary_case() {
        // §8 boundary: a timer firing on an empty batch must not attempt an
        // insert at all.
        let batch = Batch::new();
        assert!(batch.is_empty());
    }
}
