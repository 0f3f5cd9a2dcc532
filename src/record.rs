//! Core data model: the immutable units that flow through the pipeline.

use std::cmp::Ordering;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An immutable unit of work in transit between the ingester, the operator,
/// and the sink.
///
/// `fingerprint` is the durable-log sequence number assigned when the record
/// was published into JetStream. It is globally unique within a stream and
/// doubles as the idempotency key inside the sink's open batch.
#[derive(Debug, Clone)]
pub struct Record {
    pub payload: Bytes,
    pub fingerprint: u64,
    pub source_topic: String,
    pub source_offset: u64,
    pub source_timestamp: Instant,
    pub durable_seq: u64,
}

impl Record {
    pub fn new(
        payload: Bytes,
        fingerprint: u64,
        source_topic: impl Into<String>,
        source_offset: u64,
        durable_seq: u64,
    ) -> Self {
        Self {
            payload,
            fingerprint,
            source_topic: source_topic.into(),
            source_offset,
            source_timestamp: Instant::now(),
            durable_seq,
        }
    }
}

/// The JSON-pointer-coerced key used by the dedup/join operators.
///
/// Type mismatches during coercion are fatal for the offending record (see
/// the Operator error-handling policy) — they never produce a `KeyValue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyValue {
    Str(String),
    I64(i64),
    U64(u64),
    /// Compared and hashed on bit pattern so floats can key a map without a
    /// partial `Eq`/`Hash` impl.
    F64(u64),
    Bool(bool),
}

impl KeyValue {
    pub fn from_f64(v: f64) -> Self {
        KeyValue::F64(v.to_bits())
    }
}

impl Eq for KeyValue {}

impl std::hash::Hash for KeyValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            KeyValue::Str(s) => s.hash(state),
            KeyValue::I64(i) => i.hash(state),
            KeyValue::U64(u) => u.hash(state),
            KeyValue::F64(bits) => bits.hash(state),
            KeyValue::Bool(b) => b.hash(state),
        }
    }
}

/// A `Record` extended with an extracted, coerced key.
#[derive(Debug, Clone)]
pub struct KeyedRecord {
    pub record: Record,
    pub key: KeyValue,
}

/// An entry in the deduplicator's window map.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub key: KeyValue,
    pub first_seen_at: Instant,
    pub source_offset: u64,
}

/// Ordered by expiry (`first_seen_at + window`) ascending so the smallest
/// expiry sits at the heap's peek — a `BinaryHeap` is a max-heap, so the
/// comparison is reversed.
#[derive(Debug, Clone)]
pub struct DedupHeapEntry {
    pub expires_at: Instant,
    pub key: KeyValue,
}

impl PartialEq for DedupHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}
impl Eq for DedupHeapEntry {}

impl Ord for DedupHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expires_at.cmp(&self.expires_at)
    }
}
impl PartialOrd for DedupHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Which side of a temporal join a buffered entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// An entry in one side's join buffer.
#[derive(Debug, Clone)]
pub struct JoinBufferEntry {
    pub key: KeyValue,
    pub record: Record,
    pub enqueued_at: Instant,
    pub side: Side,
}

/// A typed column value produced by the schema mapper for one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnValue {
    Str(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Null,
}

/// One row queued for the next ClickHouse insert: the source fingerprint
/// (idempotency key within the open batch) plus its mapped column values.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub fingerprint: u64,
    pub columns: Vec<ColumnValue>,
}

/// The sink's in-flight accumulation of rows awaiting an insert.
///
/// Rebuilt after every flush. `fingerprint` is unique within a batch — a
/// second append with an already-present fingerprint is dropped silently.
#[derive(Debug, Default)]
pub struct Batch {
    rows: Vec<BatchRow>,
    seen_fingerprints: std::collections::HashSet<u64>,
    /// durable-log sequence numbers of every message that composed this
    /// batch, in consumption order — acked in full order after a
    /// successful flush.
    pub consumed_seqs: Vec<u64>,
}

/// Outcome of `Batch::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    AlreadyPresent,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, fingerprint: u64, columns: Vec<ColumnValue>, durable_seq: u64) -> AppendOutcome {
        if !self.seen_fingerprints.insert(fingerprint) {
            return AppendOutcome::AlreadyPresent;
        }
        self.rows.push(BatchRow { fingerprint, columns });
        self.consumed_seqs.push(durable_seq);
        AppendOutcome::Appended
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }

    pub fn take_consumed_seqs(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.consumed_seqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_drops_duplicate_fingerprint() {
        let mut batch = Batch::new();
        assert_eq!(batch.append(1, vec![ColumnValue::I64(1)], 10), AppendOutcome::Appended);
        assert_eq!(batch.append(1, vec![ColumnValue::I64(2)], 11), AppendOutcome::AlreadyPresent);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.consumed_seqs, vec![10]);
    }

    #[test]
    fn keyvalue_hashes_consistently() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(KeyValue::from_f64(1.5));
        assert!(set.contains(&KeyValue::from_f64(1.5)));
        assert!(!set.contains(&KeyValue::from_f64(1.6)));
    }
}
