//! Streaming ETL core: Kafka ingest into a durable NATS JetStream log,
//! configurable dedup/join operators, and a ClickHouse batch sink.
//!
//! See `SPEC_FULL.md` for the full component design. Each module here
//! corresponds to one of that document's components: `ingester` (§4.1),
//! `operator` (§4.2–§4.4), `sink` (§4.5), `supervisor` (§4.6).

pub mod circuit_breaker;
pub mod config;
pub mod durable;
pub mod error;
pub mod ingester;
pub mod metrics;
pub mod operator;
pub mod record;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod supervisor;

pub use error::{CoreError, Result};
