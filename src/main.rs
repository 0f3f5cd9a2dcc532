//! Pipeline entry point: loads configuration, connects the durable log,
//! wires the configured operator topology, and runs it under the
//! supervisor until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gf_core::config::{Config, DedupConfig, JoinSideConfig, OperatorConfig};
use gf_core::durable::DurableLog;
use gf_core::ingester::{run_ingester, KafkaSourceSubscription};
use gf_core::metrics::PipelineMetrics;
use gf_core::operator::dedup::Deduplicator;
use gf_core::operator::dedup_join::{run_dedup_join_merge, run_dedup_join_side, DedupSideConfig};
use gf_core::operator::joiner::{run_joiner, JoinerConfig};
use gf_core::operator::passthrough::Passthrough;
use gf_core::operator::run_single_input_operator;
use gf_core::schema::JsonPointerSchemaMapper;
use gf_core::sink::{run_sink, ClickHouseSink};
use gf_core::supervisor::{ComponentFuture, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gf_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting gf-core pipeline");

    let config = Config::load_with_overrides()?;
    info!(pipeline_id = %config.pipeline_id, "configuration loaded");

    let metrics = PipelineMetrics::new();
    let durable = Arc::new(DurableLog::connect(&config.jetstream.url, &config.pipeline_id).await?);
    let poll_timeout = Duration::from_millis(config.jetstream.poll_timeout_ms);
    let drain_timeout = Duration::from_millis(config.jetstream.drain_timeout_ms);

    // Schema mapping is out of scope (§1) beyond this default, JSON-pointer
    // based implementation — a real deployment supplies its own
    // `SchemaMapper` for the target table.
    let schema = Arc::new(JsonPointerSchemaMapper::new(vec![("payload".to_string(), "".to_string())]));
    let circuit_breaker = gf_core::circuit_breaker::CircuitBreaker::new(Default::default());

    let supervisor = Supervisor::new(drain_timeout);
    let tokens = supervisor.tokens();

    let sink = ClickHouseSink::new(config.clickhouse.clone(), schema, circuit_breaker)?;
    let sink_stream = durable.subjects().output_stream();
    let sink_subject = durable.subjects().output_subject();
    durable.ensure_stream(&sink_stream, &sink_subject).await?;
    let sink_consumer = durable.create_pull_consumer(&sink_stream, "gf-sink", &sink_subject).await?;

    let sink_future: ComponentFuture = Box::pin(run_sink(
        sink,
        sink_consumer,
        config.clickhouse.max_batch_size,
        Duration::from_millis(config.clickhouse.max_delay_ms),
        metrics.clone(),
        tokens.sink.clone(),
    ));

    let mut ingester_futures: Vec<ComponentFuture> = Vec::new();
    let mut operator_futures: Vec<ComponentFuture> = Vec::new();

    match &config.operator {
        OperatorConfig::Passthrough => {
            let topic = config.kafka.topics[0].clone();
            ingester_futures.push(spawn_ingester(&config, &durable, &topic, metrics.clone(), tokens.ingester.clone()).await?);

            let input_stream = durable.subjects().input_stream(&topic);
            let input_subject = durable.subjects().input_subject(&topic);
            let consumer = durable.create_pull_consumer(&input_stream, "gf-operator", &input_subject).await?;

            operator_futures.push(Box::pin(run_single_input_operator(
                Passthrough,
                consumer,
                durable.clone(),
                sink_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));
        }
        OperatorConfig::Deduplicator(dedup_cfg) => {
            ingester_futures.push(
                spawn_ingester(&config, &durable, &dedup_cfg.topic, metrics.clone(), tokens.ingester.clone()).await?,
            );

            let input_stream = durable.subjects().input_stream(&dedup_cfg.topic);
            let input_subject = durable.subjects().input_subject(&dedup_cfg.topic);
            let consumer = durable.create_pull_consumer(&input_stream, "gf-operator", &input_subject).await?;

            let dedup = build_deduplicator(dedup_cfg);
            operator_futures.push(Box::pin(run_single_input_operator(
                dedup,
                consumer,
                durable.clone(),
                sink_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));
        }
        OperatorConfig::Joiner(join_cfg) => {
            ingester_futures.push(
                spawn_ingester(&config, &durable, &join_cfg.left.topic, metrics.clone(), tokens.ingester.clone()).await?,
            );
            ingester_futures.push(
                spawn_ingester(&config, &durable, &join_cfg.right.topic, metrics.clone(), tokens.ingester.clone()).await?,
            );

            let left_consumer = durable
                .create_pull_consumer(
                    &durable.subjects().input_stream(&join_cfg.left.topic),
                    "gf-joiner-left",
                    &durable.subjects().input_subject(&join_cfg.left.topic),
                )
                .await?;
            let right_consumer = durable
                .create_pull_consumer(
                    &durable.subjects().input_stream(&join_cfg.right.topic),
                    "gf-joiner-right",
                    &durable.subjects().input_subject(&join_cfg.right.topic),
                )
                .await?;

            let joiner_config = build_joiner_config(&join_cfg.left, &join_cfg.right, join_cfg.window_ms, join_cfg.max_entries);
            operator_futures.push(Box::pin(run_joiner(
                joiner_config,
                left_consumer,
                right_consumer,
                durable.clone(),
                sink_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));
        }
        OperatorConfig::DeduplicatingJoiner { left, right, join_window_ms } => {
            ingester_futures
                .push(spawn_ingester(&config, &durable, &left.topic, metrics.clone(), tokens.ingester.clone()).await?);
            ingester_futures
                .push(spawn_ingester(&config, &durable, &right.topic, metrics.clone(), tokens.ingester.clone()).await?);

            let left_dedup_subject = format!("{}.dedup.left", sink_subject);
            let right_dedup_subject = format!("{}.dedup.right", sink_subject);
            let left_dedup_stream = format!("{}-dedup-left", durable.subjects().output_stream());
            let right_dedup_stream = format!("{}-dedup-right", durable.subjects().output_stream());
            durable.ensure_stream(&left_dedup_stream, &left_dedup_subject).await?;
            durable.ensure_stream(&right_dedup_stream, &right_dedup_subject).await?;

            let left_input_consumer = durable
                .create_pull_consumer(
                    &durable.subjects().input_stream(&left.topic),
                    "gf-dedup-left",
                    &durable.subjects().input_subject(&left.topic),
                )
                .await?;
            let right_input_consumer = durable
                .create_pull_consumer(
                    &durable.subjects().input_stream(&right.topic),
                    "gf-dedup-right",
                    &durable.subjects().input_subject(&right.topic),
                )
                .await?;

            operator_futures.push(Box::pin(run_dedup_join_side(
                build_dedup_side_config(left),
                left_input_consumer,
                durable.clone(),
                left_dedup_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));
            operator_futures.push(Box::pin(run_dedup_join_side(
                build_dedup_side_config(right),
                right_input_consumer,
                durable.clone(),
                right_dedup_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));

            let left_join_consumer =
                durable.create_pull_consumer(&left_dedup_stream, "gf-joiner-left", &left_dedup_subject).await?;
            let right_join_consumer =
                durable.create_pull_consumer(&right_dedup_stream, "gf-joiner-right", &right_dedup_subject).await?;

            let joiner_config = build_joiner_config(left, right, *join_window_ms, None);
            operator_futures.push(Box::pin(run_dedup_join_merge(
                joiner_config,
                left_join_consumer,
                right_join_consumer,
                durable.clone(),
                sink_subject.clone(),
                poll_timeout,
                metrics.clone(),
                tokens.operator.clone(),
            )));
        }
    }

    let external_shutdown = CancellationToken::new();
    let shutdown_waiter = external_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        shutdown_waiter.cancel();
    });

    supervisor.run(sink_future, operator_futures, ingester_futures, external_shutdown).await?;

    info!("gf-core pipeline stopped");
    Ok(())
}

async fn spawn_ingester(
    config: &Config,
    durable: &Arc<DurableLog>,
    topic: &str,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<ComponentFuture> {
    let mut kafka_config = config.kafka.clone();
    kafka_config.topics = vec![topic.to_string()];
    kafka_config.consumer_group = format!("{}-{}", config.kafka.consumer_group, topic);
    let source = KafkaSourceSubscription::new(&kafka_config)?;

    Ok(Box::pin(run_ingester(source, durable.clone(), topic.to_string(), metrics, shutdown)))
}

fn build_deduplicator(cfg: &DedupConfig) -> Deduplicator {
    Deduplicator::new(cfg.key_path.clone(), cfg.key_type, Duration::from_millis(cfg.window_ms), cfg.max_entries)
}

fn build_dedup_side_config(cfg: &DedupConfig) -> DedupSideConfig {
    DedupSideConfig {
        key_path: cfg.key_path.clone(),
        key_type: cfg.key_type,
        dedup_window: Duration::from_millis(cfg.window_ms),
        dedup_max_entries: cfg.max_entries,
    }
}

fn build_joiner_config(left: &JoinSideConfig, right: &JoinSideConfig, window_ms: u64, max_entries: Option<usize>) -> JoinerConfig {
    JoinerConfig {
        left_topic: left.topic.clone(),
        left_key_path: left.key_path.clone(),
        left_key_type: left.key_type,
        right_topic: right.topic.clone(),
        right_key_path: right.key_path.clone(),
        right_key_type: right.key_type,
        window: Duration::from_millis(window_ms),
        max_entries,
    }
}
