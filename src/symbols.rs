//! Read-only symbol table shared by all running stages.

use std::collections::BTreeMap;

/// Address/symbol resolution provided by the emulated CPU's firmware image.
pub trait SymbolTable: Send + Sync {
    /// Address of a symbol.
    fn address_of(&self, name: &str) -> Option<u32>;

    /// All symbols with their addresses, sorted by name.
    fn entries(&self) -> Vec<(String, u32)>;
}

/// Symbol table backed by an ordered map.
#[derive(Debug, Clone, Default)]
pub struct MapSymbolTable {
    symbols: BTreeMap<String, u32>,
}

impl MapSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: u32) {
        self.symbols.insert(name.into(), address);
    }
}

impl FromIterator<(String, u32)> for MapSymbolTable {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self {
            symbols: iter.into_iter().collect(),
        }
    }
}

impl SymbolTable for MapSymbolTable {
    fn address_of(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    fn entries(&self) -> Vec<(String, u32)> {
        self.symbols.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}
