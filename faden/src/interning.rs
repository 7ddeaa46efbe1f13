use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::SymbolId;

struct SymbolsImpl {
    table: Vec<Arc<str>>,
    mappings: HashMap<String, SymbolId>,
}

/// Shared symbol table. Ids are dense and stable for the lifetime of the
/// runtime, so they fit the value encoding and double as map keys.
#[derive(Clone)]
pub struct Symbols(Arc<RwLock<SymbolsImpl>>);

impl SymbolsImpl {
    fn new() -> Self {
        Self {
            table: Vec::new(),
            mappings: HashMap::new(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> SymbolId {
        if let Some(&id) = self.mappings.get(value) {
            return id;
        }
        let id = SymbolId(self.table.len() as u32);
        self.table.push(Arc::<str>::from(value));
        self.mappings.insert(value.to_owned(), id);
        id
    }
}

impl Symbols {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SymbolsImpl::new())))
    }

    pub fn intern(&self, value: &str) -> SymbolId {
        self.0.write().get_or_add(value)
    }

    pub fn resolve(&self, id: SymbolId) -> Option<Arc<str>> {
        self.0.read().table.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Symbols {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Symbols {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbols")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let symbols = Symbols::new();
        let a = symbols.intern("swap");
        let b = symbols.intern("swap");
        let c = symbols.intern("dup");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn ids_resolve_back_to_their_text() {
        let symbols = Symbols::new();
        let id = symbols.intern("counter");
        assert_eq!(symbols.resolve(id).as_deref(), Some("counter"));
        assert!(symbols.resolve(SymbolId(99)).is_none());
    }

    #[test]
    fn clones_share_one_table() {
        let symbols = Symbols::new();
        let shared = symbols.clone();
        let from_clone = std::thread::spawn(move || shared.intern("spawn"))
            .join()
            .unwrap();
        assert_eq!(symbols.intern("spawn"), from_clone);
    }
}
