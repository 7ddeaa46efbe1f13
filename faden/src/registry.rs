//! The process registry: id allocation, spawn, lookup, and the shared
//! soft-stop probe that gets wired into every spawned heap.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::RwLock;

use crate::{Capsule, DeliverResult, HeapConfig, Process, ProcessId};

#[derive(Debug)]
pub struct Registry {
    processes: RwLock<HashMap<ProcessId, Arc<Process>>>,
    next_id: AtomicU64,
    heap_config: HeapConfig,
    stop_probe: Arc<AtomicBool>,
}

impl Registry {
    pub fn new(heap_config: HeapConfig) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            heap_config,
            stop_probe: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag heaps assert clear on every mutation. The scheduler raises
    /// it for the span of a soft-stop.
    pub fn stop_probe(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_probe)
    }

    /// Create a process and deliver its entry message, if any. The fresh
    /// lock is uncontended, so entry delivery cannot be asked to retry.
    pub fn spawn(&self, entry: Option<Capsule>) -> Arc<Process> {
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let process = Process::new(
            id,
            self.heap_config.clone(),
            Some(Arc::clone(&self.stop_probe)),
        );
        if let Some(capsule) = entry {
            match process.receive_message(capsule) {
                DeliverResult::Delivered { .. } => {}
                other => unreachable!("entry delivery to a fresh process: {other:?}"),
            }
        }
        let previous = self.processes.write().insert(id, Arc::clone(&process));
        assert!(previous.is_none(), "process id {id:?} registered twice");
        process
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Process>> {
        self.processes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, Value};

    #[test]
    fn spawn_hands_out_unique_ids_and_registers() {
        let registry = Registry::new(HeapConfig::default());
        let a = registry.spawn(None);
        let b = registry.spawn(None);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.get(a.id).unwrap(), &a));
        assert!(registry.get(ProcessId(999)).is_none());
    }

    #[test]
    fn entry_message_is_waiting_in_the_mailbox() {
        let registry = Registry::new(HeapConfig::default());
        let heap = Heap::new(HeapConfig::default());
        let entry = Capsule::seal(&heap, Value::small_int(41));

        let p = registry.spawn(Some(entry));
        let msg = p.extract_message().expect("entry message present");
        assert_eq!(msg.root(), Value::small_int(41));
    }

    #[test]
    fn removed_processes_are_gone() {
        let registry = Registry::new(HeapConfig::default());
        let p = registry.spawn(None);
        assert!(registry.remove(p.id).is_some());
        assert!(registry.get(p.id).is_none());
        assert!(registry.remove(p.id).is_none());
        assert!(registry.is_empty());
    }
}
