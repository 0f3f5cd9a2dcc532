//! Per-pipeline metrics: plain atomic counters, snapshotted and exported as
//! Prometheus text. No HTTP endpoint is wired up here — mounting the export
//! behind a scrape handler is a concern of the (out-of-scope) control API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub records_ingested: AtomicU64,
    pub records_suppressed: AtomicU64,
    pub records_joined: AtomicU64,
    pub records_dropped_poison: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub insert_retries: AtomicU64,
    pub acks_failed: AtomicU64,
    pub circuit_breaker_trips: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            records_suppressed: self.records_suppressed.load(Ordering::Relaxed),
            records_joined: self.records_joined.load(Ordering::Relaxed),
            records_dropped_poison: self.records_dropped_poison.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            insert_retries: self.insert_retries.load(Ordering::Relaxed),
            acks_failed: self.acks_failed.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub records_ingested: u64,
    pub records_suppressed: u64,
    pub records_joined: u64,
    pub records_dropped_poison: u64,
    pub batches_flushed: u64,
    pub rows_inserted: u64,
    pub insert_retries: u64,
    pub acks_failed: u64,
    pub circuit_breaker_trips: u64,
}

pub fn export_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    out.push_str("# HELP gf_records_ingested_total Records published from Kafka into the durable log\n");
    out.push_str("# TYPE gf_records_ingested_total counter\n");
    out.push_str(&format!("gf_records_ingested_total {}\n", snapshot.records_ingested));

    out.push_str("# HELP gf_records_suppressed_total Records suppressed by the deduplicator\n");
    out.push_str("# TYPE gf_records_suppressed_total counter\n");
    out.push_str(&format!("gf_records_suppressed_total {}\n", snapshot.records_suppressed));

    out.push_str("# HELP gf_records_joined_total Joined record pairs emitted by the joiner\n");
    out.push_str("# TYPE gf_records_joined_total counter\n");
    out.push_str(&format!("gf_records_joined_total {}\n", snapshot.records_joined));

    out.push_str("# HELP gf_records_dropped_poison_total Records dropped for key extraction failure\n");
    out.push_str("# TYPE gf_records_dropped_poison_total counter\n");
    out.push_str(&format!("gf_records_dropped_poison_total {}\n", snapshot.records_dropped_poison));

    out.push_str("# HELP gf_batches_flushed_total Batches successfully inserted into ClickHouse\n");
    out.push_str("# TYPE gf_batches_flushed_total counter\n");
    out.push_str(&format!("gf_batches_flushed_total {}\n", snapshot.batches_flushed));

    out.push_str("# HELP gf_rows_inserted_total Rows successfully inserted into ClickHouse\n");
    out.push_str("# TYPE gf_rows_inserted_total counter\n");
    out.push_str(&format!("gf_rows_inserted_total {}\n", snapshot.rows_inserted));

    out.push_str("# HELP gf_insert_retries_total ClickHouse insert attempts beyond the first\n");
    out.push_str("# TYPE gf_insert_retries_total counter\n");
    out.push_str(&format!("gf_insert_retries_total {}\n", snapshot.insert_retries));

    out.push_str("# HELP gf_acks_failed_total JetStream acks that failed after a successful insert\n");
    out.push_str("# TYPE gf_acks_failed_total counter\n");
    out.push_str(&format!("gf_acks_failed_total {}\n", snapshot.acks_failed));

    out.push_str("# HELP gf_circuit_breaker_trips_total Times the ClickHouse circuit breaker opened\n");
    out.push_str("# TYPE gf_circuit_breaker_trips_total counter\n");
    out.push_str(&format!("gf_circuit_breaker_trips_total {}\n", snapshot.circuit_breaker_trips));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = PipelineMetrics::new();
        metrics.records_ingested.fetch_add(3, Ordering::Relaxed);
        metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.records_ingested, 3);
        assert_eq!(snap.batches_flushed, 1);
    }

    #[test]
    fn export_contains_all_counters() {
        let snap = MetricsSnapshot { records_ingested: 5, ..Default::default() };
        let text = export_prometheus_metrics(&snap);
        assert!(text.contains("gf_records_ingested_total 5"));
        assert!(text.contains("gf_circuit_breaker_trips_total 0"));
    }
}
