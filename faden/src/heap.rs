//! The per-process heap: one active semispace plus any spaces adopted from
//! opened message capsules, a Cheney-style copying collector, and the
//! optional generational write-barrier hook.

use std::collections::{HashMap, HashSet};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bitflags::bitflags;
use log::debug;

use crate::{Address, HeapObject, ProcessId, Semispace, SymbolId, Value};

bitflags! {
    #[derive(Debug, Copy, Clone)]
    pub struct HeapFlags: u8 {
        /// Live set reached the tight threshold after the last collection;
        /// the next sizing doubles its headroom to avoid thrashing.
        const TIGHT = 1 << 0;
    }
}

#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub initial_capacity: usize,
    /// Insurance margin added on top of the live set when sizing a
    /// destination space.
    pub headroom: usize,
    /// Live set at or below this percentage of the new space triggers a
    /// shrinking re-collection.
    pub shrink_percent: usize,
    /// Live set at or above this percentage marks the heap tight.
    pub tight_percent: usize,
    /// Smallest capacity the shrink pass may produce.
    pub min_capacity: usize,
    /// Sequential store buffer capacity; `None` disables the barrier and
    /// the collector always scans the full heap (which it does anyway).
    pub store_buffer: Option<usize>,
    /// Call-history ring capacity.
    pub history_slots: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16 * 1024,
            headroom: 2048,
            shrink_percent: 25,
            tight_percent: 75,
            min_capacity: 1024,
            store_buffer: None,
            history_slots: 64,
        }
    }
}

/// Fixed ring buffer of recently executed call sites, scanned as roots.
#[derive(Debug)]
pub struct CallHistory {
    ring: Vec<Value>,
    head: usize,
    len: usize,
    capacity: usize,
}

impl CallHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![Value::Nil; capacity],
            head: 0,
            len: 0,
            capacity,
        }
    }

    pub fn push(&mut self, value: Value) {
        if self.capacity == 0 {
            return;
        }
        self.ring[self.head] = value;
        self.head = (self.head + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn scan(&mut self, f: &mut impl FnMut(&mut Value)) {
        for i in 0..self.len {
            let idx = (self.head + self.capacity - self.len + i) % self.capacity;
            f(&mut self.ring[idx]);
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.head = 0;
    }
}

/// The declared roots of one process: interpreter stack, saved bytecode
/// reference, error-handler slot, opened global values, call history.
/// Every reachable value after a collection is re-derived through here.
#[derive(Debug)]
pub struct RootSet {
    pub stack: Vec<Value>,
    pub saved_code: Value,
    pub error_handler: Value,
    pub globals: HashMap<SymbolId, Value>,
    pub history: CallHistory,
}

impl RootSet {
    pub fn new(history_slots: usize) -> Self {
        Self {
            stack: Vec::new(),
            saved_code: Value::Nil,
            error_handler: Value::Nil,
            globals: HashMap::new(),
            history: CallHistory::new(history_slots),
        }
    }

    pub fn scan(&mut self, f: &mut impl FnMut(&mut Value)) {
        for v in self.stack.iter_mut() {
            f(v);
        }
        f(&mut self.saved_code);
        f(&mut self.error_handler);
        for v in self.globals.values_mut() {
            f(v);
        }
        self.history.scan(f);
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.saved_code = Value::Nil;
        self.error_handler = Value::Nil;
        self.globals.clear();
        self.history.clear();
    }
}

/// Fixed-capacity append-only buffer of written slot addresses. When it
/// fills, the cleanup pass records the targets as possible
/// inter-generational roots and resets the buffer.
#[derive(Debug)]
struct StoreBuffer {
    entries: Vec<Address>,
    capacity: usize,
    flushes: u64,
}

#[derive(Debug, Copy, Clone)]
pub struct HeapStats {
    pub collections: u64,
    pub live_bytes: usize,
    pub capacity: usize,
    pub barrier_flushes: u64,
}

#[derive(Debug)]
pub struct Heap {
    main: Semispace,
    others: Vec<Semispace>,
    config: HeapConfig,
    flags: HeapFlags,
    collections: u64,
    ssb: Option<StoreBuffer>,
    remembered: HashSet<Address>,
    /// Scheduler soft-stop probe: while the flag is set no worker may be
    /// mutating any heap, so allocation asserts it is clear.
    stop_probe: Option<Arc<AtomicBool>>,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Self {
        let main = Semispace::new(config.initial_capacity);
        let ssb = config.store_buffer.map(|capacity| StoreBuffer {
            entries: Vec::with_capacity(capacity),
            capacity,
            flushes: 0,
        });
        Self {
            main,
            others: Vec::new(),
            config,
            flags: HeapFlags::empty(),
            collections: 0,
            ssb,
            remembered: HashSet::new(),
            stop_probe: None,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn set_stop_probe(&mut self, probe: Arc<AtomicBool>) {
        self.stop_probe = Some(probe);
    }

    pub fn is_tight(&self) -> bool {
        self.flags.contains(HeapFlags::TIGHT)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            collections: self.collections,
            live_bytes: self.used_total(),
            capacity: self.main.capacity(),
            barrier_flushes: self.ssb.as_ref().map(|b| b.flushes).unwrap_or(0),
        }
    }

    pub fn main_space(&self) -> &Semispace {
        &self.main
    }

    fn used_total(&self) -> usize {
        self.main.used() + self.others.iter().map(Semispace::used).sum::<usize>()
    }

    fn space(&self, id: crate::SpaceId) -> &Semispace {
        if self.main.id() == id {
            return &self.main;
        }
        self.others
            .iter()
            .find(|s| s.id() == id)
            .unwrap_or_else(|| panic!("reference into unknown space {id:?}"))
    }

    pub fn object(&self, addr: Address) -> &HeapObject {
        self.space(addr.space).object(addr.index)
    }

    pub fn object_mut(&mut self, addr: Address) -> &mut HeapObject {
        if self.main.id() == addr.space {
            return self.main.object_mut(addr.index);
        }
        self.others
            .iter_mut()
            .find(|s| s.id() == addr.space)
            .unwrap_or_else(|| panic!("reference into unknown space {:?}", addr.space))
            .object_mut(addr.index)
    }

    /// Iterate every live object across the main and adopted spaces.
    pub fn live_objects(&self) -> impl Iterator<Item = &HeapObject> {
        std::iter::once(&self.main)
            .chain(self.others.iter())
            .flat_map(|s| s.live_objects().map(|(_, o)| o))
    }

    /// Every process referenced from this heap, for process-level marking.
    pub fn referenced_processes(&self, out: &mut Vec<ProcessId>) {
        for obj in self.live_objects() {
            if let Some(pid) = obj.actor_pid() {
                out.push(pid);
            }
        }
    }

    fn assert_mutable(&self) {
        if let Some(probe) = &self.stop_probe {
            assert!(
                !probe.load(Ordering::Relaxed),
                "heap mutation while a scheduler soft-stop is active"
            );
        }
    }

    /// Allocate `object`, collecting first if the active space cannot fit
    /// it. Any call may invalidate every previously obtained address;
    /// callers re-derive pointers from `roots` afterwards.
    pub fn allocate(&mut self, object: HeapObject, roots: &mut RootSet) -> Address {
        self.assert_mutable();
        let size = object.real_size();
        if !self.main.can_fit(size) {
            self.collect_with_reserve(roots, size);
        }
        self.main.allocate(object)
    }

    pub fn allocate_cell(&mut self, value: Value, roots: &mut RootSet) -> Address {
        self.allocate(HeapObject::Cell { value }, roots)
    }

    pub fn allocate_tuple(&mut self, elems: Vec<Value>, roots: &mut RootSet) -> Address {
        self.allocate(HeapObject::Tuple { elems }, roots)
    }

    pub fn allocate_bytes(&mut self, data: Vec<u8>, roots: &mut RootSet) -> Address {
        self.allocate(HeapObject::Bytes { data }, roots)
    }

    pub fn allocate_actor_ref(&mut self, pid: ProcessId, roots: &mut RootSet) -> Address {
        self.allocate(HeapObject::ActorRef { pid }, roots)
    }

    /// Scratch-discipline allocation; see [`Semispace::scratch_allocate`].
    pub fn scratch_allocate(&mut self, object: HeapObject, roots: &mut RootSet) -> Address {
        self.assert_mutable();
        let size = object.real_size();
        if !self.main.can_fit(size) {
            self.collect_with_reserve(roots, size);
        }
        self.main.scratch_allocate(object)
    }

    pub fn scratch_free(&mut self, addr: Address) {
        self.main.scratch_free(addr);
    }

    /// Unwind a failed constructor; only valid for the most recent forward
    /// allocation.
    pub fn deallocate(&mut self, addr: Address) {
        self.main.deallocate(addr);
    }

    /// Attach a capsule's private space as an "other space" and hand back
    /// its root. The next collection drains it into the main space.
    pub fn adopt_space(&mut self, space: Semispace, root: Value) -> Value {
        self.others.push(space);
        root
    }

    /// Generational write-barrier hook: record that a pointer was stored
    /// into `slot`. Purely an optimization hook for a future generational
    /// collector; correctness never depends on it.
    pub fn record_write(&mut self, slot: Address) {
        let Some(ssb) = &mut self.ssb else {
            return;
        };
        ssb.entries.push(slot);
        if ssb.entries.len() >= ssb.capacity {
            for addr in ssb.entries.drain(..) {
                self.remembered.insert(addr);
            }
            ssb.flushes += 1;
        }
    }

    pub fn remembered_len(&self) -> usize {
        self.remembered.len()
    }

    pub fn collect(&mut self, roots: &mut RootSet) {
        self.collect_with_reserve(roots, 0);
    }

    fn collect_with_reserve(&mut self, roots: &mut RootSet, reserve: usize) {
        let live_guess = self.used_total();
        let headroom = if self.is_tight() {
            self.config.headroom * 2
        } else {
            self.config.headroom
        };
        let target = (live_guess + reserve + headroom).max(self.config.min_capacity);
        self.evacuate(roots, target);

        // Post-pass sizing: shrink once when mostly empty, flag when tight.
        let live = self.main.used();
        let capacity = self.main.capacity();
        if live * 100 <= capacity * self.config.shrink_percent {
            let half = (capacity / 2).max(self.config.min_capacity);
            if half < capacity && half >= live + reserve + self.config.headroom {
                self.evacuate(roots, half);
            }
        }

        let live = self.main.used();
        let capacity = self.main.capacity();
        if live * 100 >= capacity * self.config.tight_percent {
            self.flags.insert(HeapFlags::TIGHT);
        } else {
            self.flags.remove(HeapFlags::TIGHT);
        }

        self.collections += 1;
        debug!(
            "heap collection #{}: {} -> {} live bytes, capacity {}, tight {}",
            self.collections,
            live_guess,
            live,
            capacity,
            self.is_tight()
        );
    }

    /// Cheney two-pointer evacuation of everything reachable from `roots`
    /// into a fresh space of `target_capacity` bytes.
    fn evacuate(&mut self, roots: &mut RootSet, target_capacity: usize) {
        let mut to = Semispace::new(target_capacity);
        let main = &mut self.main;
        let others = &mut self.others;

        roots.scan(&mut |slot| {
            *slot = forward_value(main, others, &mut to, *slot);
        });

        // Scan the destination space, not the yet-unvisited old space,
        // until the scan frontier catches the allocation frontier.
        let mut scan = 0;
        while scan < to.slot_count() {
            let mut obj = to.take_for_scan(scan);
            obj.visit_edges(&mut |slot| {
                *slot = forward_value(main, others, &mut to, *slot);
            });
            to.put_back(scan, obj);
            scan += 1;
        }

        self.main = to;
        self.others.clear();
        self.remembered.clear();
        if let Some(ssb) = &mut self.ssb {
            ssb.entries.clear();
        }
    }
}

fn forward_value(
    main: &mut Semispace,
    others: &mut [Semispace],
    to: &mut Semispace,
    value: Value,
) -> Value {
    let Value::Ref(addr) = value else {
        return value;
    };
    let space = if main.id() == addr.space {
        main
    } else {
        others
            .iter_mut()
            .find(|s| s.id() == addr.space)
            .unwrap_or_else(|| panic!("root references unknown space {:?}", addr.space))
    };
    if let Some(fwd) = space.forwarding(addr.index) {
        return Value::Ref(fwd);
    }
    let copy = space.object(addr.index).clone_object();
    let new_addr = to.allocate(copy);
    let _old = space.break_heart(addr.index, new_addr);
    Value::Ref(new_addr)
}
