//! The schema mapper: out of scope per §1 ("consumed as a pure function
//! that projects a record's JSON into an ordered column value vector"), so
//! this crate only defines the interface the sink calls against, plus a
//! JSON-pointer-based default implementation good enough to drive the
//! sink's tests and a simple deployment.

use serde_json::Value;

use crate::error::CoreError;
use crate::record::ColumnValue;

/// Projects a record's JSON payload into a fixed-arity, fixed-order tuple
/// of typed column values. Called once per record, outside any critical
/// section (§4.5).
pub trait SchemaMapper: Send + Sync {
    /// Column names in the order the sink's INSERT statement uses them.
    /// Computed once at startup.
    fn ordered_columns(&self) -> &[String];

    fn map(&self, payload: &[u8]) -> Result<Vec<ColumnValue>, CoreError>;
}

/// Maps a fixed list of top-level JSON-pointer paths to column values, in
/// the order given. Missing fields map to `ColumnValue::Null`.
pub struct JsonPointerSchemaMapper {
    columns: Vec<String>,
    pointers: Vec<String>,
}

impl JsonPointerSchemaMapper {
    pub fn new(columns: Vec<(String, String)>) -> Self {
        let (names, pointers) = columns.into_iter().unzip();
        Self { columns: names, pointers }
    }
}

impl SchemaMapper for JsonPointerSchemaMapper {
    fn ordered_columns(&self) -> &[String] {
        &self.columns
    }

    fn map(&self, payload: &[u8]) -> Result<Vec<ColumnValue>, CoreError> {
        let value: Value = serde_json::from_slice(payload)?;
        let mut out = Vec::with_capacity(self.pointers.len());
        for pointer in &self.pointers {
            out.push(json_value_to_column(value.pointer(pointer)));
        }
        Ok(out)
    }
}

fn json_value_to_column(value: Option<&Value>) -> ColumnValue {
    match value {
        None | Some(Value::Null) => ColumnValue::Null,
        Some(Value::Bool(b)) => ColumnValue::Bool(*b),
        Some(Value::String(s)) => ColumnValue::Str(s.clone()),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                ColumnValue::I64(i)
            } else if let Some(u) = n.as_u64() {
                ColumnValue::U64(u)
            } else {
                ColumnValue::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        Some(other) => ColumnValue::Str(other.to_string()),
    }
}

/// Extracts and coerces the dedup/join key from a JSON payload at
/// `key_path`, per the allowed key types in §3. A missing field or a type
/// mismatch against `key_type` is a key extraction failure (§7).
pub fn extract_key(
    payload: &[u8],
    key_path: &str,
    key_type: crate::config::KeyType,
) -> Result<crate::record::KeyValue, CoreError> {
    use crate::config::KeyType;
    use crate::record::KeyValue;

    let value: Value = serde_json::from_slice(payload)?;
    let found = value
        .pointer(key_path)
        .ok_or_else(|| CoreError::key_extraction(key_path, "field not present"))?;

    match key_type {
        KeyType::String => found
            .as_str()
            .map(|s| KeyValue::Str(s.to_string()))
            .ok_or_else(|| CoreError::key_extraction(key_path, "expected string")),
        KeyType::I64 => found
            .as_i64()
            .map(KeyValue::I64)
            .ok_or_else(|| CoreError::key_extraction(key_path, "expected i64")),
        KeyType::U64 => found
            .as_u64()
            .map(KeyValue::U64)
            .ok_or_else(|| CoreError::key_extraction(key_path, "expected u64")),
        KeyType::F64 => found
            .as_f64()
            .map(KeyValue::from_f64)
            .ok_or_else(|| CoreError::key_extraction(key_path, "expected f64")),
        KeyType::Bool => found
            .as_bool()
            .map(KeyValue::Bool)
            .ok_or_else(|| CoreError::key_extraction(key_path, "expected bool")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyType;

    #[test]
    fn maps_columns_in_order() {
        let mapper = JsonPointerSchemaMapper::new(vec![
            ("id".to_string(), "/id".to_string()),
            ("value".to_string(), "/value".to_string()),
        ]);
        let cols = mapper.map(br#"{"id":"a","value":42}"#).unwrap();
        assert!(matches!(cols[0], ColumnValue::Str(ref s) if s == "a"));
        assert!(matches!(cols[1], ColumnValue::I64(42)));
    }

    #[test]
    fn missing_field_maps_to_null() {
        let mapper = JsonPointerSchemaMapper::new(vec![("missing".to_string(), "/nope".to_string())]);
        let cols = mapper.map(br#"{}"#).unwrap();
        assert!(matches!(cols[0], ColumnValue::Null));
    }

    #[test]
    fn extract_key_rejects_type_mismatch() {
        let err = extract_key(br#"{"id": "not-a-number"}"#, "/id", KeyType::I64).unwrap_err();
        assert!(matches!(err, CoreError::KeyExtraction { .. }));
    }

    #[test]
    fn extract_key_rejects_missing_field() {
        let err = extract_key(br#"{}"#, "/id", KeyType::String).unwrap_err();
        assert!(matches!(err, CoreError::KeyExtraction { .. }));
    }

    #[test]
    fn extract_key_succeeds() {
        let key = extract_key(br#"{"id": "abc"}"#, "/id", KeyType::String).unwrap();
        assert_eq!(key, crate::record::KeyValue::Str("abc".to_string()));
    }
}
