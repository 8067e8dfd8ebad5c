use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::block::{BlockKind, RegisterBlock, DEFAULT_REGISTER_COUNT};
use crate::error::{ContextError, Result};
use crate::state::MEMORY_BLOCK;

pub const SLAVE_ID_MIN: u8 = 0x00;
pub const SLAVE_ID_MAX: u8 = 0xF7;

pub const MODBUS_MEMORY: &str = "MODBUS";
pub const MCU_NODE_MEMORY: &str = "MCU_node";
pub const LS_XGT_TCP_MEMORY: [&str; 3] = ["%MB", "%RB", "%WB"];

/// Anything the registry can push restored blocks and state entries into.
///
/// Each concrete context type implements this once; callers never check for
/// storage shapes at runtime.
pub trait StateTarget: Send + std::fmt::Debug {
    /// Install or replace the block stored under `name`. Returns whether it was accepted.
    fn set_block(&mut self, name: &str, block: RegisterBlock) -> bool;

    fn block(&self, name: &str) -> Option<&RegisterBlock>;

    fn block_names(&self) -> Vec<String>;

    fn set_state(&mut self, key: &str, value: Value);

    fn get_state(&self, key: &str) -> Option<&Value>;

    /// Snapshot of every state entry held in memory.
    fn all_state(&self) -> Map<String, Value>;

    fn clear_state(&mut self, key: Option<&str>);

    /// Remember which state entry carries this context's blocks under `MEMORY`.
    fn bind_memory_key(&mut self, _key: &str) {}

    /// State as it should be written to disk. Defaults to [`Self::all_state`].
    fn persisted_state(&self) -> Map<String, Value> {
        self.all_state()
    }
}

/// Protocol-specific block layout used to seed a fresh context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "protocol")]
pub enum ProtocolLayout {
    Modbus { count: usize, value: Value, use_json: bool },
    LsXgtTcp { count: usize, value: Value, use_json: bool },
    McuNode { count: usize, value: Value, use_json: bool, seed: Option<Map<String, Value>> },
}

impl ProtocolLayout {
    #[must_use]
    pub fn modbus(count: usize) -> Self {
        Self::Modbus { count, value: Value::from(0), use_json: false }
    }

    #[must_use]
    pub fn ls_xgt_tcp(count: usize, use_json: bool) -> Self {
        Self::LsXgtTcp { count, value: Value::from(0), use_json }
    }

    #[must_use]
    pub fn mcu_node(seed: Option<Map<String, Value>>) -> Self {
        Self::McuNode { count: DEFAULT_REGISTER_COUNT, value: Value::from(0), use_json: true, seed }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modbus { .. } => "MODBUS",
            Self::LsXgtTcp { .. } => "LS_XGT_TCP",
            Self::McuNode { .. } => "MCU_node",
        }
    }

    /// Look a protocol up by name with default sizing.
    #[must_use]
    pub fn parse(name: &str, count: Option<usize>, use_json: bool) -> Option<Self> {
        let count = count.unwrap_or(DEFAULT_REGISTER_COUNT);
        match name.trim().to_ascii_uppercase().as_str() {
            "MODBUS" => Some(Self::Modbus { count, value: Value::from(0), use_json }),
            "LS_XGT_TCP" => Some(Self::LsXgtTcp { count, value: Value::from(0), use_json }),
            "MCU_NODE" => Some(Self::McuNode { count, value: Value::from(0), use_json: true, seed: None }),
            _ => None,
        }
    }

    #[must_use]
    pub fn build_blocks(&self) -> BTreeMap<String, RegisterBlock> {
        fn kind(use_json: bool) -> BlockKind {
            if use_json {
                BlockKind::Json
            } else {
                BlockKind::Sequential
            }
        }

        let mut blocks = BTreeMap::new();
        match self {
            Self::Modbus { count, value, use_json } => {
                blocks.insert(MODBUS_MEMORY.to_string(), RegisterBlock::create(kind(*use_json), *count, value.clone()));
            }
            Self::LsXgtTcp { count, value, use_json } => {
                for name in LS_XGT_TCP_MEMORY {
                    blocks.insert(name.to_string(), RegisterBlock::create(kind(*use_json), *count, value.clone()));
                }
            }
            Self::McuNode { count, value, use_json, seed } => {
                let mut block = RegisterBlock::create(kind(*use_json), *count, value.clone());
                if let Some(seed) = seed {
                    block.apply_seed(seed);
                }
                blocks.insert(MCU_NODE_MEMORY.to_string(), block);
            }
        }
        blocks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub kind: BlockKind,
    pub size: usize,
    pub address: u32,
    pub default_value: Value,
}

/// All register blocks and state entries of one application.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveContext {
    blocks: BTreeMap<String, RegisterBlock>,
    state: Map<String, Value>,
    zero_mode: bool,
    memory_key: Option<String>,
}

impl Default for SlaveContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveContext {
    #[must_use]
    pub fn new() -> Self {
        Self { blocks: BTreeMap::new(), state: Map::new(), zero_mode: true, memory_key: None }
    }

    #[must_use]
    pub fn with_layout(layout: &ProtocolLayout) -> Self {
        Self { blocks: layout.build_blocks(), ..Self::new() }
    }

    /// When zero mode is off, addresses are one-based and shifted before block access.
    #[must_use]
    pub fn zero_mode(mut self, enabled: bool) -> Self {
        self.zero_mode = enabled;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.state.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&String, &RegisterBlock)> {
        self.blocks.iter()
    }

    pub fn block_mut(&mut self, name: &str) -> Option<&mut RegisterBlock> {
        self.blocks.get_mut(name)
    }

    /// # Errors
    /// Returns [`ContextError::NoSuchMemory`] for an unknown block name.
    pub fn validate(&self, memory: &str, address: u32, count: usize) -> Result<bool> {
        let block = self.named(memory)?;
        Ok(self.adjust(address).is_some_and(|addr| block.validate(addr, count)))
    }

    /// # Errors
    /// Returns an error for unknown memory names or out-of-range addresses.
    pub fn get_values(&self, memory: &str, address: u32, count: usize) -> Result<Vec<Value>> {
        let address = self.adjust(address).ok_or_else(|| overflow(address))?;
        self.named(memory)?.get_values(address, count)
    }

    /// # Errors
    /// Returns an error for unknown memory names or out-of-range addresses.
    pub fn set_values(&mut self, memory: &str, address: u32, values: &[Value]) -> Result<()> {
        let address = self.adjust(address).ok_or_else(|| overflow(address))?;
        self.blocks
            .get_mut(memory)
            .ok_or_else(|| ContextError::NoSuchMemory(memory.to_string()))?
            .set_values(address, values)
    }

    pub fn reset(&mut self) {
        for block in self.blocks.values_mut() {
            block.reset();
        }
    }

    #[must_use]
    pub fn memory_info(&self) -> BTreeMap<String, MemoryInfo> {
        self.blocks
            .iter()
            .map(|(name, block)| {
                let info = MemoryInfo {
                    kind: block.kind(),
                    size: block.size(),
                    address: block.address(),
                    default_value: block.default_value().clone(),
                };
                (name.clone(), info)
            })
            .collect()
    }

    /// Block payloads keyed by memory name, as written under an entry's `MEMORY` key.
    #[must_use]
    pub fn memory_json(&self) -> Map<String, Value> {
        self.blocks.iter().map(|(name, block)| (name.clone(), block.to_json_for(name))).collect()
    }

    fn named(&self, memory: &str) -> Result<&RegisterBlock> {
        self.blocks.get(memory).ok_or_else(|| ContextError::NoSuchMemory(memory.to_string()))
    }

    fn adjust(&self, address: u32) -> Option<u32> {
        if self.zero_mode {
            Some(address)
        } else {
            address.checked_add(1)
        }
    }
}

fn overflow(address: u32) -> ContextError {
    ContextError::Validation(format!("address {address} overflows the register space"))
}

impl StateTarget for SlaveContext {
    fn set_block(&mut self, name: &str, block: RegisterBlock) -> bool {
        self.blocks.insert(name.to_string(), block);
        true
    }

    fn block(&self, name: &str) -> Option<&RegisterBlock> {
        self.blocks.get(name)
    }

    fn block_names(&self) -> Vec<String> {
        self.blocks.keys().cloned().collect()
    }

    fn set_state(&mut self, key: &str, value: Value) {
        self.state.insert(key.to_string(), value);
    }

    fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    fn all_state(&self) -> Map<String, Value> {
        self.state.clone()
    }

    fn clear_state(&mut self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.state.remove(key);
            }
            None => self.state.clear(),
        }
    }

    fn bind_memory_key(&mut self, key: &str) {
        self.memory_key = Some(key.to_string());
    }

    fn persisted_state(&self) -> Map<String, Value> {
        let mut state = self.state.clone();
        if let Some(key) = self.memory_key.as_deref().filter(|_| !self.blocks.is_empty()) {
            let entry = state.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(entry) = entry {
                entry.insert(MEMORY_BLOCK.to_string(), Value::Object(self.memory_json()));
            }
        }
        state
    }
}

/// Unit id to [`SlaveContext`] map for servers fronting several devices.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerContext {
    slaves: BTreeMap<u8, SlaveContext>,
    single: bool,
}

impl ServerContext {
    /// Every unit id resolves to `context`.
    #[must_use]
    pub fn single(context: SlaveContext) -> Self {
        let mut slaves = BTreeMap::new();
        slaves.insert(SLAVE_ID_MIN, context);
        Self { slaves, single: true }
    }

    #[must_use]
    pub fn multi() -> Self {
        Self { slaves: BTreeMap::new(), single: false }
    }

    /// # Errors
    /// Returns a validation error for ids above [`SLAVE_ID_MAX`].
    pub fn add_slave(&mut self, unit: u8, context: SlaveContext) -> Result<()> {
        if unit > SLAVE_ID_MAX {
            return Err(ContextError::Validation(format!("slave id {unit:#04x} out of range")));
        }
        let unit = if self.single { SLAVE_ID_MIN } else { unit };
        self.slaves.insert(unit, context);
        Ok(())
    }

    pub fn remove_slave(&mut self, unit: u8) -> Option<SlaveContext> {
        self.slaves.remove(&self.route(unit))
    }

    /// # Errors
    /// Returns [`ContextError::NoSuchSlave`] when no context answers for `unit`.
    pub fn slave(&self, unit: u8) -> Result<&SlaveContext> {
        self.slaves.get(&self.route(unit)).ok_or(ContextError::NoSuchSlave(unit))
    }

    /// # Errors
    /// Returns [`ContextError::NoSuchSlave`] when no context answers for `unit`.
    pub fn slave_mut(&mut self, unit: u8) -> Result<&mut SlaveContext> {
        let routed = self.route(unit);
        self.slaves.get_mut(&routed).ok_or(ContextError::NoSuchSlave(unit))
    }

    #[must_use]
    pub fn units(&self) -> Vec<u8> {
        self.slaves.keys().copied().collect()
    }

    pub fn reset_all(&mut self) {
        for slave in self.slaves.values_mut() {
            slave.reset();
        }
    }

    fn route(&self, unit: u8) -> u8 {
        if self.single {
            SLAVE_ID_MIN
        } else {
            unit
        }
    }

    fn default_slave(&self) -> Option<&SlaveContext> {
        self.slaves.values().next()
    }

    fn default_slave_mut(&mut self) -> &mut SlaveContext {
        let unit = self.slaves.keys().next().copied().unwrap_or(SLAVE_ID_MIN);
        self.slaves.entry(unit).or_default()
    }
}

// Restores and state sync go to the lowest configured unit.
impl StateTarget for ServerContext {
    fn set_block(&mut self, name: &str, block: RegisterBlock) -> bool {
        self.default_slave_mut().set_block(name, block)
    }

    fn block(&self, name: &str) -> Option<&RegisterBlock> {
        self.default_slave().and_then(|slave| slave.block(name))
    }

    fn block_names(&self) -> Vec<String> {
        self.default_slave().map(StateTarget::block_names).unwrap_or_default()
    }

    fn set_state(&mut self, key: &str, value: Value) {
        self.default_slave_mut().set_state(key, value);
    }

    fn get_state(&self, key: &str) -> Option<&Value> {
        self.default_slave().and_then(|slave| slave.get_state(key))
    }

    fn all_state(&self) -> Map<String, Value> {
        self.default_slave().map(StateTarget::all_state).unwrap_or_default()
    }

    fn clear_state(&mut self, key: Option<&str>) {
        if let Some(slave) = self.slaves.values_mut().next() {
            slave.clear_state(key);
        }
    }

    fn bind_memory_key(&mut self, key: &str) {
        self.default_slave_mut().bind_memory_key(key);
    }

    fn persisted_state(&self) -> Map<String, Value> {
        self.default_slave().map(StateTarget::persisted_state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;

    use super::*;

    #[test]
    fn ls_xgt_layout_builds_three_blocks() {
        let context = SlaveContext::with_layout(&ProtocolLayout::ls_xgt_tcp(16, true));
        assert_eq!(context.block_names(), vec!["%MB", "%RB", "%WB"]);
        let info = context.memory_info();
        assert_eq!(info["%MB"].kind, BlockKind::Json);
        assert_eq!(info["%MB"].size, 16);
    }

    #[test]
    fn mcu_layout_applies_seed() -> Result<()> {
        let mut seed = Map::new();
        seed.insert("node".to_string(), json!("A1"));
        let context = SlaveContext::with_layout(&ProtocolLayout::McuNode {
            count: 2,
            value: json!(0),
            use_json: true,
            seed: Some(seed),
        });
        let block = context.block(MCU_NODE_MEMORY).ok_or_else(|| anyhow::anyhow!("missing block"))?;
        assert_eq!(block.keys(), vec!["0", "1", "node"]);
        Ok(())
    }

    #[test]
    fn unknown_memory_is_reported() {
        let context = SlaveContext::with_layout(&ProtocolLayout::modbus(4));
        assert!(matches!(context.get_values("%ZZ", 0, 1), Err(ContextError::NoSuchMemory(_))));
    }

    #[test]
    fn one_based_addressing_shifts_by_one() -> Result<()> {
        let mut context = SlaveContext::with_layout(&ProtocolLayout::modbus(4)).zero_mode(false);
        context.set_values(MODBUS_MEMORY, 0, &[json!(5)])?;
        let block = context.block(MODBUS_MEMORY).ok_or_else(|| anyhow::anyhow!("missing block"))?;
        assert_eq!(block.get_values(1, 1)?, vec![json!(5)]);
        assert!(!context.validate(MODBUS_MEMORY, 3, 1)?);
        assert!(context.validate(MODBUS_MEMORY, 2, 1)?);
        Ok(())
    }

    #[test]
    fn state_map_round_trip() {
        let mut context = SlaveContext::new();
        context.set_state("AB01", json!({"STATUS": {}}));
        context.set_state("AB02", json!({}));
        assert_eq!(context.all_state().len(), 2);
        context.clear_state(Some("AB01"));
        assert!(context.get_state("AB01").is_none());
        context.clear_state(None);
        assert!(context.is_empty());
    }

    #[test]
    fn reset_restores_every_block() -> Result<()> {
        let mut context = SlaveContext::with_layout(&ProtocolLayout::ls_xgt_tcp(2, false));
        context.set_values("%RB", 1, &[json!(9)])?;
        context.reset();
        assert_eq!(context.get_values("%RB", 0, 2)?, vec![json!(0), json!(0)]);
        Ok(())
    }

    #[test]
    fn persisted_state_carries_live_blocks() -> Result<()> {
        let mut context = SlaveContext::with_layout(&ProtocolLayout::ls_xgt_tcp(2, true));
        context.bind_memory_key("127.0.0.1:2004");
        context.set_values("%WB", 1, &[json!(42)])?;
        let state = context.persisted_state();
        assert_eq!(state["127.0.0.1:2004"]["MEMORY"]["%WB"]["values"], json!([0, 42]));
        assert!(context.all_state().is_empty());
        Ok(())
    }

    #[test]
    fn server_context_routes_units() -> Result<()> {
        let mut server = ServerContext::multi();
        server.add_slave(1, SlaveContext::with_layout(&ProtocolLayout::modbus(2)))?;
        assert!(server.slave(1).is_ok());
        assert!(matches!(server.slave(2), Err(ContextError::NoSuchSlave(2))));
        assert!(server.add_slave(0xF8, SlaveContext::new()).is_err());

        let single = ServerContext::single(SlaveContext::new());
        assert!(single.slave(0x42).is_ok());
        Ok(())
    }

    #[test]
    fn server_context_delegates_state_target() {
        let mut server = ServerContext::multi();
        assert!(server.set_block("%MB", RegisterBlock::sparse(0, 1, json!(0))));
        server.set_state("AB01", json!({"x": 1}));
        assert_eq!(server.block_names(), vec!["%MB"]);
        assert_eq!(server.all_state().len(), 1);
        assert_eq!(server.units(), vec![SLAVE_ID_MIN]);
    }
}
