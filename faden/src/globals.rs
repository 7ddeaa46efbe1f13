//! The shared global table. Values are stored as sealed capsules so no
//! process heap is ever referenced from shared state; readers take
//! duplicates and subscribe for invalidation, writers replace the capsule
//! and learn who has to be notified.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::{Capsule, ProcessId, SymbolId};

#[derive(Debug, Default)]
struct GlobalsImpl {
    table: HashMap<SymbolId, Capsule>,
    subscribers: HashMap<SymbolId, HashSet<ProcessId>>,
}

#[derive(Debug, Default)]
pub struct Globals {
    inner: Mutex<GlobalsImpl>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// A private duplicate of the named global, or `None` when unset.
    pub fn read(&self, name: SymbolId) -> Option<Capsule> {
        self.inner.lock().table.get(&name).map(Capsule::duplicate)
    }

    pub fn contains(&self, name: SymbolId) -> bool {
        self.inner.lock().table.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `pid` for invalidation tokens on future writes to `name`.
    pub fn subscribe(&self, name: SymbolId, pid: ProcessId) {
        self.inner
            .lock()
            .subscribers
            .entry(name)
            .or_default()
            .insert(pid);
    }

    /// Drop every subscription of a dead process.
    pub fn unsubscribe_process(&self, pid: ProcessId) {
        let mut inner = self.inner.lock();
        for subs in inner.subscribers.values_mut() {
            subs.remove(&pid);
        }
    }

    /// Replace the named global and return the processes whose cached
    /// copies are now stale. The caller pushes the invalidation tokens;
    /// this keeps the table lock out of any per-process lock ordering.
    #[must_use = "subscribers must receive their invalidation tokens"]
    pub fn write(&self, name: SymbolId, capsule: Capsule) -> Vec<ProcessId> {
        let mut inner = self.inner.lock();
        inner.table.insert(name, capsule);
        inner
            .subscribers
            .get(&name)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Processes referenced by any stored capsule, for process-level
    /// marking roots.
    pub fn referenced_processes(&self, out: &mut Vec<ProcessId>) {
        let inner = self.inner.lock();
        for capsule in inner.table.values() {
            capsule.referenced_processes(out);
        }
    }
}
