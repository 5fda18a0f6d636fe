use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Resolved timestamps are RFC 3339 strings; anything else (an unresolved
/// server placeholder, null, garbage) reads as "not committed yet".
pub(crate) fn lenient_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|timestamp| timestamp.with_timezone(&Utc)))
}

/// Non-array values read as the empty set; non-string entries are skipped.
pub(crate) fn lenient_id_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(id) => Some(id),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    })
}
