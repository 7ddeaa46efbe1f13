//! The shared runtime context handed to every worker: process registry,
//! global table, symbol table, and the set of processes parked on external
//! IO (which count as roots for process-level collection).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Capsule, Globals, HeapConfig, ProcessId, Registry, SymbolId, Symbols};

#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub heap: HeapConfig,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct Vm {
    pub registry: Registry,
    pub globals: Globals,
    pub symbols: Symbols,
    io_pending: Mutex<HashSet<ProcessId>>,
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(info.heap),
            globals: Globals::new(),
            symbols: Symbols::new(),
            io_pending: Mutex::new(HashSet::new()),
        })
    }

    /// Store a global and push the invalidation tokens to every subscribed
    /// process. Token delivery never touches a process's state lock.
    pub fn global_write(&self, name: SymbolId, capsule: Capsule) {
        for pid in self.globals.write(name, capsule) {
            if let Some(process) = self.registry.get(pid) {
                process.invalidate_global(name);
            }
        }
    }

    /// Mark a process as parked on external IO. While registered it is
    /// unconditionally live for process-level collection.
    pub fn io_begin(&self, pid: ProcessId) {
        self.io_pending.lock().insert(pid);
    }

    pub fn io_end(&self, pid: ProcessId) {
        self.io_pending.lock().remove(&pid);
    }

    pub fn io_pending_snapshot(&self) -> Vec<ProcessId> {
        self.io_pending.lock().iter().copied().collect()
    }
}
