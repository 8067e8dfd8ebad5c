use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::Result;
use crate::merge::canonical_string;

pub const UNKNOWN_SERIAL: &str = "UNKNOWN_SERIAL";
pub const STATUS_BLOCK: &str = "STATUS";
pub const SETUP_BLOCK: &str = "SETUP";
pub const META_BLOCK: &str = "Meta";
pub const MEMORY_BLOCK: &str = "MEMORY";
pub const PROCESSED_DATA_KEY: &str = "processed_data";
pub const LAST_UPDATED_KEY: &str = "last_updated";

/// Device serial, normalized to uppercase. Byte serials are rendered as hex.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Serial(String);

impl Serial {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self(UNKNOWN_SERIAL.to_string())
        } else {
            Self(trimmed.to_uppercase())
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            Self(UNKNOWN_SERIAL.to_string())
        } else {
            Self(hex::encode_upper(bytes))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Serial {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// Remove every `processed_data` wrapper key, at any depth.
pub fn strip_processed_data(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(PROCESSED_DATA_KEY);
            for child in map.values_mut() {
                strip_processed_data(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_processed_data),
        _ => {}
    }
}

/// Set `Meta.last_updated` and, when given, `Meta.<command>` to `now`.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn stamp_meta(entry: &mut Map<String, Value>, command: Option<&str>, now: OffsetDateTime) -> Result<()> {
    let last_updated = utc_seconds(now)?;
    let command_stamp = match command {
        Some(_) => Some(rfc3339(now)?),
        None => None,
    };

    let meta = entry.entry(META_BLOCK.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Value::Object(meta) = meta {
        meta.insert(LAST_UPDATED_KEY.to_string(), Value::String(last_updated));
        if let (Some(command), Some(stamp)) = (command, command_stamp) {
            meta.insert(command.to_string(), Value::String(stamp));
        }
    }
    Ok(())
}

/// Whether an entry's data changed, ignoring `Meta` timestamps.
#[must_use]
pub fn entry_changed(before: Option<&Value>, after: &Value) -> bool {
    fn without_meta(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter().filter(|(k, _)| k.as_str() != META_BLOCK).map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            other => other.clone(),
        }
    }
    match before {
        None => true,
        Some(before) => canonical_string(&without_meta(before)) != canonical_string(&without_meta(after)),
    }
}

/// `["a", "b"]` + `v` becomes `{"a": {"b": v}}`.
#[must_use]
pub fn build_nested<S: AsRef<str>>(path: &[S], value: Value) -> Value {
    path.iter().rev().fold(value, |acc, key| {
        let mut map = Map::new();
        map.insert(key.as_ref().to_string(), acc);
        Value::Object(map)
    })
}

/// UTC timestamp with second precision and a `Z` suffix.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn utc_seconds(at: OffsetDateTime) -> Result<String> {
    let utc = at.to_offset(time::UtcOffset::UTC);
    Ok(utc.format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z"))?)
}

/// # Errors
/// Returns an error when formatting fails.
pub fn rfc3339(at: OffsetDateTime) -> Result<String> {
    Ok(at.format(&Rfc3339)?)
}

/// Compact stamp used in backup file names, e.g. `20240131T235959`.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn file_stamp(at: OffsetDateTime) -> Result<String> {
    let utc = at.to_offset(time::UtcOffset::UTC);
    Ok(utc.format(format_description!("[year][month][day]T[hour][minute][second]"))?)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    #[test]
    fn serial_normalization() {
        assert_eq!(Serial::parse(" ab12 ").as_str(), "AB12");
        assert_eq!(Serial::parse("").as_str(), UNKNOWN_SERIAL);
        assert_eq!(Serial::from_bytes(&[0x0a, 0xff]).as_str(), "0AFF");
        assert_eq!(Serial::from_bytes(&[]).as_str(), UNKNOWN_SERIAL);
    }

    #[test]
    fn processed_data_is_stripped_at_every_depth() {
        let mut value = json!({
            "processed_data": {"x": 1},
            "STATUS": {"cmd": {"processed_data": 2, "kept": 3}},
            "list": [{"processed_data": 4}]
        });
        strip_processed_data(&mut value);
        assert_eq!(value, json!({"STATUS": {"cmd": {"kept": 3}}, "list": [{}]}));
    }

    #[test]
    fn stamp_meta_writes_last_updated_and_command() -> Result<()> {
        let mut entry = Map::new();
        entry.insert(META_BLOCK.to_string(), json!("legacy"));
        stamp_meta(&mut entry, Some("ANALOG_READ"), fixture_time())?;
        assert_eq!(entry[META_BLOCK][LAST_UPDATED_KEY], json!("2023-11-14T22:13:20Z"));
        assert_eq!(entry[META_BLOCK]["ANALOG_READ"], json!("2023-11-14T22:13:20Z"));
        Ok(())
    }

    #[test]
    fn change_detection_ignores_meta() {
        let before = json!({"STATUS": {"a": 1}, "Meta": {"last_updated": "x"}});
        let same = json!({"STATUS": {"a": 1}, "Meta": {"last_updated": "y"}});
        let different = json!({"STATUS": {"a": 2}, "Meta": {"last_updated": "y"}});
        assert!(!entry_changed(Some(&before), &same));
        assert!(entry_changed(Some(&before), &different));
        assert!(entry_changed(None, &same));
    }

    #[test]
    fn build_nested_wraps_value() {
        assert_eq!(build_nested(&["a", "b"], json!(1)), json!({"a": {"b": 1}}));
        assert_eq!(build_nested::<&str>(&[], json!(1)), json!(1));
    }

    #[test]
    fn file_stamp_is_compact() -> Result<()> {
        assert_eq!(file_stamp(fixture_time())?, "20231114T221320");
        Ok(())
    }
}
