//! Symbol table consumed by debug formatting and the entry-point finder.
//!
//! The table is produced externally (by the assembler), handed to the core as a plain
//! name-to-address mapping, and used purely for information: resolving an address to the nearest
//! preceding symbol, and picking the program entry point.

use log::warn;
use std::collections::HashMap;

/// An address-sorted view over a `name → address` symbol mapping.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_name: HashMap<String, u32>,
    /// Sorted by address; ties resolve to the last-inserted name.
    by_address: Vec<(u32, String)>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(name, address)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u32)>) -> Self {
        let mut table = Self::new();
        for (name, address) in entries {
            table.insert(name, address);
        }
        table
    }

    pub fn insert(&mut self, name: impl Into<String>, address: u32) {
        let name = name.into();
        self.by_name.insert(name.clone(), address);
        let index = self.by_address.partition_point(|&(a, _)| a <= address);
        self.by_address.insert(index, (address, name));
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Exact lookup of a symbol's address.
    pub fn address_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Returns the nearest symbol at or below `address`, with the remaining offset.
    pub fn resolve(&self, address: u32) -> Option<(&str, u32)> {
        let index = self.by_address.partition_point(|&(a, _)| a <= address);
        let (symbol_address, name) = self.by_address.get(index.checked_sub(1)?)?;
        Some((name.as_str(), address - symbol_address))
    }

    /// Formats an address as `name+offset (0xhex)`, or plain hex when no symbol precedes it.
    pub fn format(&self, address: u32) -> String {
        match self.resolve(address) {
            Some((name, 0)) => format!("{name} ({address:#010x})"),
            Some((name, offset)) => format!("{name}+{offset:#x} ({address:#010x})"),
            None => format!("{address:#010x}"),
        }
    }

    /// Formats an address as `name+offset`, or plain hex when no symbol precedes it.
    pub fn format_compact(&self, address: u32) -> String {
        match self.resolve(address) {
            Some((name, 0)) => name.to_string(),
            Some((name, offset)) => format!("{name}+{offset:#x}"),
            None => format!("{address:#010x}"),
        }
    }

    /// Picks the program entry point: `_start`, then `__start`, then `start`, then `main`.
    /// Falls back to `default` (conventionally the code-segment base) with a warning.
    pub fn entry_point(&self, default: u32) -> u32 {
        for candidate in ["_start", "__start", "start", "main"] {
            if let Some(address) = self.address_of(candidate) {
                return address;
            }
        }
        warn!("No entry symbol found, starting execution at {default:#010x}");
        default
    }
}
