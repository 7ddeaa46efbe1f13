//! Processes: isolated actor-style units of execution. Each process owns a
//! heap, a mailbox of capsules, one status, and the marking color used by
//! process-level collection. All mutable state sits behind one lock; the
//! non-blocking mailbox protocol is driven through `try_lock`.

use std::collections::HashMap;
use std::sync::{Arc, atomic::AtomicBool};

use parking_lot::{Mutex, MutexGuard};

use crate::{Capsule, CapsuleList, Globals, Heap, HeapConfig, ProcessId, RootSet, SymbolId, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Waiting,
    /// GC-only transitional state: temporarily excluded from the
    /// waiting-to-running wakeup while liveness is being decided. Never
    /// observable by user code.
    Anesthesized,
    /// Terminal.
    Dead,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Color {
    White,
    Black,
}

/// A user-visible runtime error raised inside a quantum, caught at the
/// scheduler boundary.
#[derive(Debug, Clone)]
pub struct Fault {
    pub message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of a delivery attempt against the non-blocking process lock.
#[derive(Debug)]
pub enum DeliverResult {
    Delivered { was_waiting: bool },
    /// Lock contended: not an error, retry.
    Retry(Capsule),
    /// The receiver is dead; the payload comes back to the caller.
    Dead(Capsule),
}

#[derive(Debug)]
pub enum TryExtract {
    Message(Capsule),
    Empty,
    Contended,
}

#[derive(Debug)]
pub struct ProcessState {
    pub status: ProcessStatus,
    pub color: Color,
    pub heap: Heap,
    pub roots: RootSet,
    pub mailbox: CapsuleList,
    /// Sealed duplicates of globals this process has read.
    pub cache: HashMap<SymbolId, Capsule>,
    pub pending_fault: Option<Fault>,
}

impl ProcessState {
    pub fn has_error_handler(&self) -> bool {
        self.roots.error_handler != Value::Nil
    }

    /// Every process referenced from this process's heap, mailbox or
    /// global cache, for process-level marking.
    pub fn referenced_processes(&self, out: &mut Vec<ProcessId>) {
        self.heap.referenced_processes(out);
        for capsule in self.mailbox.iter() {
            capsule.referenced_processes(out);
        }
        for capsule in self.cache.values() {
            capsule.referenced_processes(out);
        }
    }
}

#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    state: Mutex<ProcessState>,
    /// Invalidation tokens queued by global-table writers. A dedicated
    /// lock so a writer never contends with the owner's state lock.
    stale: Mutex<Vec<SymbolId>>,
}

impl Process {
    pub fn new(
        id: ProcessId,
        config: HeapConfig,
        stop_probe: Option<Arc<AtomicBool>>,
    ) -> Arc<Self> {
        let mut heap = Heap::new(config.clone());
        if let Some(probe) = stop_probe {
            heap.set_stop_probe(probe);
        }
        let state = ProcessState {
            status: ProcessStatus::Running,
            color: Color::White,
            roots: RootSet::new(config.history_slots),
            heap,
            mailbox: CapsuleList::new(),
            cache: HashMap::new(),
            pending_fault: None,
        };
        Arc::new(Self {
            id,
            state: Mutex::new(state),
            stale: Mutex::new(Vec::new()),
        })
    }

    /// Exclusive access for the owning worker (or the collector under
    /// soft-stop). Blocks.
    pub fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock()
    }

    pub fn try_lock_state(&self) -> Option<MutexGuard<'_, ProcessState>> {
        self.state.try_lock()
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().status
    }

    pub fn is_dead(&self) -> bool {
        self.status() == ProcessStatus::Dead
    }

    /// Attempt to deliver a capsule without blocking. On contention the
    /// capsule comes back with a retry signal; on success the caller
    /// learns whether the receiver was waiting and must be re-queued.
    pub fn receive_message(&self, capsule: Capsule) -> DeliverResult {
        let Some(mut st) = self.state.try_lock() else {
            return DeliverResult::Retry(capsule);
        };
        match st.status {
            ProcessStatus::Dead => DeliverResult::Dead(capsule),
            ProcessStatus::Waiting => {
                st.mailbox.insert(capsule);
                st.status = ProcessStatus::Running;
                DeliverResult::Delivered { was_waiting: true }
            }
            // Delivery during anesthesia lands in the mailbox but the
            // scheduling decision is deferred to resolve_anesthesia.
            ProcessStatus::Running | ProcessStatus::Anesthesized => {
                st.mailbox.insert(capsule);
                DeliverResult::Delivered { was_waiting: false }
            }
        }
    }

    /// Pop the oldest pending capsule; an empty mailbox atomically
    /// transitions the process to `Waiting`.
    pub fn extract_message(&self) -> Option<Capsule> {
        let mut st = self.state.lock();
        if st.status == ProcessStatus::Dead {
            return None;
        }
        if st.mailbox.is_empty() {
            st.status = ProcessStatus::Waiting;
            None
        } else {
            Some(st.mailbox.remove_oldest())
        }
    }

    /// Non-blocking variant distinguishing contention from emptiness.
    pub fn try_extract_message(&self) -> TryExtract {
        let Some(mut st) = self.state.try_lock() else {
            return TryExtract::Contended;
        };
        if st.status == ProcessStatus::Dead {
            return TryExtract::Empty;
        }
        if st.mailbox.is_empty() {
            st.status = ProcessStatus::Waiting;
            TryExtract::Empty
        } else {
            TryExtract::Message(st.mailbox.remove_oldest())
        }
    }

    /// Atomically exclude a waiting, still-unmarked process from delivery
    /// wakeups while the collector decides its liveness.
    pub fn anesthesize(&self) -> bool {
        let mut st = self.state.lock();
        if st.status == ProcessStatus::Waiting && st.color == Color::White {
            st.status = ProcessStatus::Anesthesized;
            true
        } else {
            false
        }
    }

    /// Lift anesthesia. Returns true when a message arrived in the
    /// meantime and the process must be re-queued.
    pub fn resolve_anesthesia(&self) -> bool {
        let mut st = self.state.lock();
        assert_eq!(
            st.status,
            ProcessStatus::Anesthesized,
            "resolving anesthesia on a process that is not anesthesized"
        );
        if st.mailbox.is_empty() {
            st.status = ProcessStatus::Waiting;
            false
        } else {
            st.status = ProcessStatus::Running;
            true
        }
    }

    /// Any non-dead state to `Dead`: frees the heap, clears the mailbox
    /// and caches. Terminal.
    pub fn kill(&self) {
        let mut st = self.state.lock();
        if st.status == ProcessStatus::Dead {
            return;
        }
        st.status = ProcessStatus::Dead;
        st.mailbox.clear();
        st.cache.clear();
        st.roots.clear();
        st.pending_fault = None;
        let drained = HeapConfig {
            initial_capacity: 0,
            ..st.heap.config().clone()
        };
        st.heap = Heap::new(drained);
    }

    pub fn color(&self) -> Color {
        self.state.lock().color
    }

    pub fn mark_black(&self) {
        self.state.lock().color = Color::Black;
    }

    pub fn reset_white(&self) {
        self.state.lock().color = Color::White;
    }

    pub fn set_pending_fault(&self, fault: Fault) {
        self.state.lock().pending_fault = Some(fault);
    }

    pub fn take_pending_fault(&self) -> Option<Fault> {
        self.state.lock().pending_fault.take()
    }

    /// Queue a cache-invalidation token. Called by global-table writers;
    /// never touches the state lock.
    pub fn invalidate_global(&self, name: SymbolId) {
        self.stale.lock().push(name);
    }

    fn drain_stale(&self, st: &mut ProcessState) {
        for name in self.stale.lock().drain(..) {
            st.cache.remove(&name);
            st.roots.globals.remove(&name);
        }
    }

    /// Read a global through the per-process cache. The first access (or
    /// the first after invalidation) subscribes this process and pulls a
    /// fresh capsule from the table; later reads are served locally and
    /// may be stale until the next token arrives.
    pub fn global_read(&self, name: SymbolId, globals: &Globals) -> Option<Value> {
        let mut st = self.state.lock();
        self.drain_stale(&mut st);
        let ProcessState {
            heap, roots, cache, ..
        } = &mut *st;

        if let Some(&opened) = roots.globals.get(&name) {
            return Some(opened);
        }
        if let Some(sealed) = cache.get(&name) {
            let root = sealed.duplicate().open_into(heap);
            roots.globals.insert(name, root);
            return Some(root);
        }

        globals.subscribe(name, self.id);
        let sealed = globals.read(name)?;
        let root = sealed.duplicate().open_into(heap);
        cache.insert(name, sealed);
        roots.globals.insert(name, root);
        Some(root)
    }
}
