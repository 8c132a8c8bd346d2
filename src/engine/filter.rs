//! Metadata filtering for `list`.

use crate::types::Metadata;

/// Metadata keys a list filter may constrain. Other keys are dropped.
pub const FILTERABLE_METADATA_KEYS: &[&str] = &["source", "step", "writes", "parents"];

/// Keep only the allow-listed entries of a caller-supplied filter.
pub fn sanitize_filter(filter: &Metadata) -> Metadata {
    filter
        .iter()
        .filter(|(key, _)| FILTERABLE_METADATA_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Whether every filter entry appears in `metadata` with an equal value.
///
/// Values compare by their serialized JSON text.
pub(crate) fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter.iter().all(|(key, expected)| match metadata.get(key) {
        Some(actual) => serialized_eq(actual, expected),
        None => false,
    })
}

fn serialized_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (serde_json::to_string(a), serde_json::to_string(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
