//! The DeduplicatingJoiner (§4.4): a Deduplicator chained in front of each
//! side of the Joiner. No new algorithmic content — it composes the two
//! operators already defined in this module, each still running its own
//! cooperative loop with its own consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::KeyType;
use crate::durable::{DurableConsumer, DurableLog};
use crate::error::CoreError;
use crate::metrics::PipelineMetrics;

use super::dedup::Deduplicator;
use super::joiner::{run_joiner, JoinerConfig};
use super::run_single_input_operator;

pub struct DedupSideConfig {
    pub key_path: String,
    pub key_type: KeyType,
    pub dedup_window: Duration,
    pub dedup_max_entries: Option<usize>,
}

/// Runs one side's Deduplicator, publishing its surviving records onto an
/// intermediate subject that only the Joiner's corresponding input consumer
/// reads — keeping the two operators' state fully isolated per §5 (no
/// shared memory between components, only the durable log).
#[allow(clippy::too_many_arguments)]
pub async fn run_dedup_join_side(
    dedup_config: DedupSideConfig,
    input_consumer: DurableConsumer,
    durable: Arc<DurableLog>,
    dedup_output_subject: String,
    poll_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    let dedup = Deduplicator::new(
        dedup_config.key_path,
        dedup_config.key_type,
        dedup_config.dedup_window,
        dedup_config.dedup_max_entries,
    );

    run_single_input_operator(dedup, input_consumer, durable, dedup_output_subject, poll_timeout, metrics, shutdown)
        .await
}

/// Runs the join stage proper, reading from the two dedup stages' output
/// subjects rather than raw ingester output.
pub async fn run_dedup_join_merge(
    join_config: JoinerConfig,
    left_consumer: DurableConsumer,
    right_consumer: DurableConsumer,
    durable: Arc<DurableLog>,
    output_subject: String,
    poll_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<(), CoreError> {
    run_joiner(join_config, left_consumer, right_consumer, durable, output_subject, poll_timeout, metrics, shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_side_config_carries_window_independent_of_join_window() {
        let config = DedupSideConfig {
            key_path: "/id".into(),
            key_type: KeyType::String,
            dedup_window: Duration::from_secs(30),
            dedup_max_entries: None,
        };
        assert_eq!(config.dedup_window, Duration::from_secs(30));
    }
}
