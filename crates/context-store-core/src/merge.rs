//! Deep merge of nested state trees.
//!
//! Object keys are matched with [`normalize_key`] so that spelling variants of the
//! same field collapse onto the key already on disk. Leaves are only rewritten
//! when the incoming value differs, which keeps change detection quiet for
//! repeated writes of the same fragment.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Known misspellings seen in device payload keys, applied after normalization.
const KEY_CORRECTIONS: [(&str, &str); 4] = [
    ("ditital", "digital"),
    ("threshod", "threshold"),
    ("thresold", "threshold"),
    ("theshold", "threshold"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ListMerge {
    #[default]
    Replace,
    Append,
    AppendDedup { sort: bool },
}

/// Which side survives when one side of a path is a nested object and the other a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Promotion {
    /// The nested object wins, whichever side it is on.
    #[default]
    PreferSubtree,
    PreferIncoming,
    PreferExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub lists: ListMerge,
    pub promotion: Promotion,
    pub fuzzy_keys: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { lists: ListMerge::Replace, promotion: Promotion::PreferSubtree, fuzzy_keys: true }
    }
}

impl MergeOptions {
    #[must_use]
    pub fn with_lists(mut self, lists: ListMerge) -> Self {
        self.lists = lists;
        self
    }

    #[must_use]
    pub fn with_promotion(mut self, promotion: Promotion) -> Self {
        self.promotion = promotion;
        self
    }
}

/// Lowercase, trim, drop spaces and underscores, then fix known misspellings.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let mut normalized: String = key
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != ' ' && *c != '_')
        .collect();
    for (wrong, right) in KEY_CORRECTIONS {
        if normalized.contains(wrong) {
            normalized = normalized.replace(wrong, right);
        }
    }
    normalized
}

/// Find the key in `map` that `desired` refers to: an exact match first, then
/// the first key with the same normalized form.
#[must_use]
pub fn find_matching_key(map: &Map<String, Value>, desired: &str) -> Option<String> {
    if map.contains_key(desired) {
        return Some(desired.to_string());
    }
    let wanted = normalize_key(desired);
    map.keys().find(|candidate| normalize_key(candidate) == wanted).cloned()
}

/// Merge `incoming` into `existing` in place. Returns whether `existing` changed.
pub fn deep_merge(existing: &mut Value, incoming: &Value, options: &MergeOptions) -> bool {
    match (existing, incoming) {
        (Value::Object(dest), Value::Object(src)) => merge_objects(dest, src, options),
        (Value::Array(dest), Value::Array(src)) => {
            let merged = merge_lists(dest, src, options.lists);
            if merged == *dest {
                false
            } else {
                *dest = merged;
                true
            }
        }
        (slot, incoming) if slot.is_object() != incoming.is_object() => {
            let take_incoming = match options.promotion {
                Promotion::PreferSubtree => incoming.is_object(),
                Promotion::PreferIncoming => true,
                Promotion::PreferExisting => false,
            };
            replace_if_different(slot, incoming, take_incoming)
        }
        (slot, incoming) => replace_if_different(slot, incoming, true),
    }
}

/// Non-mutating form of [`deep_merge`].
#[must_use]
pub fn merged(existing: &Value, incoming: &Value, options: &MergeOptions) -> Value {
    let mut out = existing.clone();
    deep_merge(&mut out, incoming, options);
    out
}

fn merge_objects(dest: &mut Map<String, Value>, src: &Map<String, Value>, options: &MergeOptions) -> bool {
    let mut changed = false;
    for (key, value) in src {
        let target = if options.fuzzy_keys {
            find_matching_key(dest, key)
        } else {
            dest.contains_key(key).then(|| key.clone())
        };
        match target.and_then(|k| dest.get_mut(&k)) {
            Some(slot) => changed |= deep_merge(slot, value, options),
            None => {
                dest.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed
}

fn replace_if_different(slot: &mut Value, incoming: &Value, take_incoming: bool) -> bool {
    if take_incoming && slot != incoming {
        *slot = incoming.clone();
        true
    } else {
        false
    }
}

/// Combine two lists under `policy`. Dedup keeps the first occurrence, keyed by
/// canonical JSON so objects compare structurally.
#[must_use]
pub fn merge_lists(existing: &[Value], incoming: &[Value], policy: ListMerge) -> Vec<Value> {
    match policy {
        ListMerge::Replace => incoming.to_vec(),
        ListMerge::Append => existing.iter().chain(incoming).cloned().collect(),
        ListMerge::AppendDedup { sort } => {
            let mut seen = HashSet::new();
            let mut out: Vec<Value> = existing
                .iter()
                .chain(incoming)
                .filter(|item| seen.insert(canonical_string(item)))
                .cloned()
                .collect();
            if sort {
                out.sort_by(compare_values);
            }
            out
        }
    }
}

/// Rebuild `value` with every object's keys in sorted order.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys; the structural identity used for dedup and checksums.
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a)
            .cmp(&type_rank(b))
            .then_with(|| canonical_string(a).cmp(&canonical_string(b))),
    }
}
