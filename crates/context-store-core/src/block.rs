use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ContextError, Result};

pub const DEFAULT_REGISTER_COUNT: usize = 10_000;
pub const DEFAULT_START_ADDRESS: u32 = 0;

/// Memory-type names whose sparse values are written as a dense list.
pub const LIST_SERIALIZED_MEMORY: [&str; 3] = ["%MB", "%RB", "%WB"];

#[must_use]
pub fn is_list_serialized(memory_name: &str) -> bool {
    LIST_SERIALIZED_MEMORY.contains(&memory_name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Sequential,
    Json,
}

impl BlockKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Json => "json",
        }
    }

    /// Accepts the canonical tags plus the longer class-style names found in older files.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        if lowered.starts_with("sequential") || lowered.starts_with("registerssequential") {
            Some(Self::Sequential)
        } else if lowered.starts_with("json") || lowered.starts_with("sparse") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequentialBlock {
    address: u32,
    default_value: Value,
    values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseBlock {
    address: u32,
    default_value: Value,
    values: BTreeMap<String, Value>,
}

/// One named, addressable memory region of a device.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterBlock {
    Sequential(SequentialBlock),
    Sparse(SparseBlock),
}

impl RegisterBlock {
    #[must_use]
    pub fn sequential(address: u32, count: usize, value: Value) -> Self {
        Self::Sequential(SequentialBlock {
            address,
            values: vec![value.clone(); count],
            default_value: value,
        })
    }

    #[must_use]
    pub fn sparse(address: u32, count: usize, value: Value) -> Self {
        let values = (0..count)
            .map(|offset| (address_key(u64::from(address) + offset as u64), value.clone()))
            .collect();
        Self::Sparse(SparseBlock { address, default_value: value, values })
    }

    /// Build a block of `count` default-filled registers starting at address 0.
    #[must_use]
    pub fn create(kind: BlockKind, count: usize, value: Value) -> Self {
        match kind {
            BlockKind::Sequential => Self::sequential(DEFAULT_START_ADDRESS, count, value),
            BlockKind::Json => Self::sparse(DEFAULT_START_ADDRESS, count, value),
        }
    }

    /// Build a block from `{type, count, value, address}`.
    ///
    /// # Errors
    /// Returns a validation error for unknown types or negative/oversized numbers.
    pub fn from_config(config: &Value) -> Result<Self> {
        let Some(object) = config.as_object() else {
            return Err(ContextError::Validation("block config must be an object".to_string()));
        };
        let kind = match object.get("type").and_then(Value::as_str) {
            None => BlockKind::Sequential,
            Some(raw) => BlockKind::parse(raw).ok_or_else(|| {
                ContextError::Validation(format!("unknown block type in config: {raw}"))
            })?,
        };
        let count = read_usize(object, "count")?.unwrap_or(DEFAULT_REGISTER_COUNT);
        let address = read_address(object)?;
        let value = object.get("value").cloned().unwrap_or_else(|| Value::from(0));

        Ok(match kind {
            BlockKind::Sequential => Self::sequential(address, count, value),
            BlockKind::Json => Self::sparse(address, count, value),
        })
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::Sequential(_) => BlockKind::Sequential,
            Self::Sparse(_) => BlockKind::Json,
        }
    }

    #[must_use]
    pub fn address(&self) -> u32 {
        match self {
            Self::Sequential(block) => block.address,
            Self::Sparse(block) => block.address,
        }
    }

    #[must_use]
    pub fn default_value(&self) -> &Value {
        match self {
            Self::Sequential(block) => &block.default_value,
            Self::Sparse(block) => &block.default_value,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Sequential(block) => block.values.len(),
            Self::Sparse(block) => block.values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn reset(&mut self) {
        match self {
            Self::Sequential(block) => {
                for slot in &mut block.values {
                    slot.clone_from(&block.default_value);
                }
            }
            Self::Sparse(block) => {
                for slot in block.values.values_mut() {
                    slot.clone_from(&block.default_value);
                }
            }
        }
    }

    /// Check that `[address, address + count)` lies inside the block.
    #[must_use]
    pub fn validate(&self, address: u32, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let start = u64::from(address);
        let Some(end) = range_end(address, count) else {
            return false;
        };
        match self {
            Self::Sequential(block) => {
                let base = u64::from(block.address);
                start >= base && end <= base + block.values.len() as u64
            }
            Self::Sparse(block) => {
                (start..end).all(|addr| block.values.contains_key(&address_key(addr)))
            }
        }
    }

    /// # Errors
    /// Returns a validation error when the range fails [`Self::validate`].
    pub fn get_values(&self, address: u32, count: usize) -> Result<Vec<Value>> {
        self.ensure_valid(address, count)?;
        let start = u64::from(address);
        Ok(match self {
            Self::Sequential(block) => {
                let offset = (address - block.address) as usize;
                block.values[offset..offset + count].to_vec()
            }
            Self::Sparse(block) => (start..range_end(address, count).unwrap_or(start))
                .map(|addr| {
                    block
                        .values
                        .get(&address_key(addr))
                        .cloned()
                        .unwrap_or_else(|| block.default_value.clone())
                })
                .collect(),
        })
    }

    /// # Errors
    /// Returns a validation error when the target range fails [`Self::validate`].
    pub fn set_values(&mut self, address: u32, values: &[Value]) -> Result<()> {
        self.ensure_valid(address, values.len())?;
        match self {
            Self::Sequential(block) => {
                let offset = (address - block.address) as usize;
                block.values[offset..offset + values.len()].clone_from_slice(values);
            }
            Self::Sparse(block) => {
                for (addr, value) in (u64::from(address)..).zip(values) {
                    block.values.insert(address_key(addr), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Grow a sequential block by `extra` default-valued registers.
    ///
    /// # Errors
    /// Returns a validation error for sparse blocks, which grow through [`Self::add_key`].
    pub fn extend_capacity(&mut self, extra: usize) -> Result<()> {
        match self {
            Self::Sequential(block) => {
                let fill = block.default_value.clone();
                block.values.resize(block.values.len() + extra, fill);
                Ok(())
            }
            Self::Sparse(_) => Err(ContextError::Validation(
                "extend_capacity applies to sequential blocks only".to_string(),
            )),
        }
    }

    /// # Errors
    /// Returns a validation error for sequential blocks.
    pub fn add_key(&mut self, key: &str, value: Option<Value>) -> Result<()> {
        match self {
            Self::Sparse(block) => {
                let value = value.unwrap_or_else(|| block.default_value.clone());
                block.values.insert(key.to_string(), value);
                Ok(())
            }
            Self::Sequential(_) => Err(ContextError::Validation(
                "keys can only be added to json blocks".to_string(),
            )),
        }
    }

    pub fn remove_key(&mut self, key: &str) -> bool {
        match self {
            Self::Sparse(block) => block.values.remove(key).is_some(),
            Self::Sequential(_) => false,
        }
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Sparse(block) => block.values.keys().cloned().collect(),
            Self::Sequential(block) => (0..block.values.len())
                .map(|offset| address_key(u64::from(block.address) + offset as u64))
                .collect(),
        }
    }

    /// Copy `seed` entries into the block. Sequential blocks only accept
    /// numeric keys that fall inside their range.
    pub fn apply_seed(&mut self, seed: &Map<String, Value>) {
        for (key, value) in seed {
            if let Self::Sparse(block) = self {
                block.values.insert(key.clone(), value.clone());
                continue;
            }
            let applied = key
                .parse::<u32>()
                .ok()
                .is_some_and(|addr| self.set_values(addr, std::slice::from_ref(value)).is_ok());
            if !applied {
                tracing::debug!(key, "seed key outside sequential block range");
            }
        }
    }

    /// Serialize as `{address, default_value, values, type}` using the block's native layout.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let values = match self {
            Self::Sequential(block) => Value::Array(block.values.clone()),
            Self::Sparse(block) => Value::Object(
                block.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
        };
        self.envelope(values)
    }

    /// Serialize for storage under `memory_name`; list-serialized memory types
    /// are written as a dense list relative to the block address.
    #[must_use]
    pub fn to_json_for(&self, memory_name: &str) -> Value {
        match self {
            Self::Sparse(block) if is_list_serialized(memory_name) => {
                self.envelope(Value::Array(sparse_to_dense(block)))
            }
            _ => self.to_json(),
        }
    }

    /// Inverse of [`Self::to_json`]; also accepts list/map normalized payloads.
    ///
    /// # Errors
    /// Returns a validation error when the payload is not a block object.
    pub fn from_json(value: &Value) -> Result<Self> {
        let normalized = normalize_for_restore(value.clone());
        let Some(object) = normalized.as_object() else {
            return Err(ContextError::Validation("block payload must be an object".to_string()));
        };
        let address = read_address(object)?;
        let default_value = object.get("default_value").cloned().unwrap_or_else(|| Value::from(0));
        let kind = object.get("type").and_then(Value::as_str).and_then(BlockKind::parse);
        let values = object.get("values").and_then(Value::as_object).cloned().unwrap_or_default();

        Ok(match kind {
            Some(BlockKind::Sequential) => {
                let dense = map_to_dense(&values, address, &default_value);
                Self::Sequential(SequentialBlock { address, default_value, values: dense })
            }
            _ => Self::Sparse(SparseBlock {
                address,
                default_value,
                values: values.into_iter().collect(),
            }),
        })
    }

    fn envelope(&self, values: Value) -> Value {
        serde_json::json!({
            "address": self.address(),
            "default_value": self.default_value(),
            "values": values,
            "type": self.kind().as_str(),
        })
    }

    fn ensure_valid(&self, address: u32, count: usize) -> Result<()> {
        if self.validate(address, count) {
            Ok(())
        } else {
            Err(ContextError::Validation(format!(
                "address range {address}..{} outside block starting at {} (size {})",
                u64::from(address).saturating_add(count as u64),
                self.address(),
                self.size()
            )))
        }
    }
}

/// Exclusive end of `[address, address + count)`, `None` on overflow.
fn range_end(address: u32, count: usize) -> Option<u64> {
    u64::from(address).checked_add(u64::try_from(count).ok()?)
}

/// Normalize a stored block payload: a bare list becomes `{values: {...}}` and a
/// `values` list becomes a string-indexed map keyed from the block address.
#[must_use]
pub fn normalize_for_restore(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            serde_json::json!({ "values": Value::Object(dense_to_map(items, DEFAULT_START_ADDRESS)) })
        }
        Value::Object(mut object) => {
            let address = object
                .get("address")
                .and_then(Value::as_u64)
                .and_then(|raw| u32::try_from(raw).ok())
                .unwrap_or(DEFAULT_START_ADDRESS);
            if let Some(Value::Array(items)) = object.get("values") {
                let map = dense_to_map(items.clone(), address);
                object.insert("values".to_string(), Value::Object(map));
            }
            Value::Object(object)
        }
        other => other,
    }
}

fn dense_to_map(items: Vec<Value>, address: u32) -> Map<String, Value> {
    (u64::from(address)..).zip(items).map(|(addr, value)| (address_key(addr), value)).collect()
}

fn sparse_to_dense(block: &SparseBlock) -> Vec<Value> {
    let map: Map<String, Value> =
        block.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    map_to_dense(&map, block.address, &block.default_value)
}

fn map_to_dense(values: &Map<String, Value>, address: u32, fill: &Value) -> Vec<Value> {
    let base = u64::from(address);
    let mut numeric: BTreeMap<u64, &Value> = BTreeMap::new();
    for (key, value) in values {
        match key.parse::<u64>() {
            Ok(addr) if addr >= base => {
                numeric.insert(addr - base, value);
            }
            _ => tracing::warn!(key, "dropping key that cannot be placed in a dense register list"),
        }
    }
    let Some(last) = numeric.keys().next_back().copied() else {
        return Vec::new();
    };
    (0..=last).map(|offset| numeric.get(&offset).map_or_else(|| fill.clone(), |v| (*v).clone())).collect()
}

fn address_key(address: u64) -> String {
    address.to_string()
}

fn read_usize(object: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => raw
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ContextError::Validation(format!("{key} must be a non-negative integer"))),
    }
}

fn read_address(object: &Map<String, Value>) -> Result<u32> {
    match object.get("address") {
        None | Some(Value::Null) => Ok(DEFAULT_START_ADDRESS),
        Some(raw) => raw
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ContextError::Validation(format!("invalid block address: {raw}"))),
    }
}
