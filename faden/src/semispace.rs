//! One arena of the copying collector.
//!
//! A semispace is byte-accounted with two disciplines growing toward each
//! other: forward bump allocation for ordinary objects and backward bump
//! allocation for short-lived scratch objects with strict LIFO reuse.
//! Object storage itself is slot-indexed; a relocated object leaves an
//! explicit [`Slot::Forwarded`] marker (the broken heart) behind instead of
//! an aliased in-place header.

use std::collections::HashMap;
use std::mem;

use crate::{Address, HeapObject, SpaceId, Value};

#[derive(Debug)]
pub enum Slot {
    Live(HeapObject),
    /// Broken heart: the object moved, every surviving reference must be
    /// rewritten to the forwarding address before this space is dropped.
    Forwarded(Address),
    Freed,
}

#[derive(Debug)]
pub struct Semispace {
    id: SpaceId,
    capacity: usize,
    slots: Vec<Slot>,
    sizes: Vec<u32>,
    forward_used: usize,
    scratch_used: usize,
    last_forward: Option<u32>,
    scratch_stack: Vec<u32>,
}

impl Semispace {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: SpaceId::fresh(),
            capacity,
            slots: Vec::new(),
            sizes: Vec::new(),
            forward_used: 0,
            scratch_used: 0,
            last_forward: None,
            scratch_stack: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.forward_used + self.scratch_used
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.used()
    }

    #[inline]
    pub fn can_fit(&self, size: usize) -> bool {
        self.used() + size <= self.capacity
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn push_slot(&mut self, object: HeapObject) -> (u32, usize) {
        let size = object.real_size();
        assert!(
            self.can_fit(size),
            "semispace overflow: {} bytes requested, {} free",
            size,
            self.free()
        );
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Live(object));
        self.sizes.push(size as u32);
        (index, size)
    }

    /// Forward bump allocation.
    pub fn allocate(&mut self, object: HeapObject) -> Address {
        let (index, size) = self.push_slot(object);
        self.forward_used += size;
        self.last_forward = Some(index);
        Address::new(self.id, index)
    }

    /// Unwind the most recent forward allocation (failed constructor).
    /// Anything else is a protocol violation.
    pub fn deallocate(&mut self, addr: Address) {
        assert_eq!(addr.space, self.id, "deallocate against a foreign space");
        match self.last_forward {
            Some(index) if index == addr.index => {
                self.forward_used -= self.sizes[index as usize] as usize;
                self.slots[index as usize] = Slot::Freed;
                self.last_forward = None;
            }
            _ => panic!(
                "deallocate of slot {} is not the most recent forward allocation",
                addr.index
            ),
        }
    }

    /// Backward bump allocation, stack-disciplined.
    pub fn scratch_allocate(&mut self, object: HeapObject) -> Address {
        let (index, size) = self.push_slot(object);
        self.scratch_used += size;
        self.scratch_stack.push(index);
        Address::new(self.id, index)
    }

    /// LIFO scratch release. Freeing anything but the most recent scratch
    /// allocation is a no-op; in-place reuse is an optimization, not a
    /// requirement, and the cursor must never be corrupted.
    pub fn scratch_free(&mut self, addr: Address) {
        if addr.space != self.id {
            return;
        }
        if self.scratch_stack.last() == Some(&addr.index) {
            self.scratch_stack.pop();
            self.scratch_used -= self.sizes[addr.index as usize] as usize;
            self.slots[addr.index as usize] = Slot::Freed;
        }
    }

    pub fn slot(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    /// Borrow a live object. A forwarded or freed slot here means the
    /// caller holds a stale address, which is fatal.
    pub fn object(&self, index: u32) -> &HeapObject {
        match &self.slots[index as usize] {
            Slot::Live(obj) => obj,
            Slot::Forwarded(addr) => {
                panic!("slot {index} is a broken heart forwarding to {addr:?}")
            }
            Slot::Freed => panic!("slot {index} was freed"),
        }
    }

    pub fn object_mut(&mut self, index: u32) -> &mut HeapObject {
        match &mut self.slots[index as usize] {
            Slot::Live(obj) => obj,
            Slot::Forwarded(addr) => {
                panic!("slot {index} is a broken heart forwarding to {addr:?}")
            }
            Slot::Freed => panic!("slot {index} was freed"),
        }
    }

    pub fn forwarding(&self, index: u32) -> Option<Address> {
        match &self.slots[index as usize] {
            Slot::Forwarded(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Replace a live slot with a forwarding marker. Breaking an already
    /// broken heart indicates double collection or a revisiting traversal
    /// and is fatal.
    pub fn break_heart(&mut self, index: u32, new_addr: Address) -> HeapObject {
        let slot = &mut self.slots[index as usize];
        match slot {
            Slot::Live(_) => {
                let old = mem::replace(slot, Slot::Forwarded(new_addr));
                match old {
                    Slot::Live(obj) => obj,
                    _ => unreachable!(),
                }
            }
            Slot::Forwarded(_) => panic!("breaking an already broken heart at slot {index}"),
            Slot::Freed => panic!("breaking a freed slot {index}"),
        }
    }

    /// Temporarily move an object out for edge rewriting during a scan.
    pub(crate) fn take_for_scan(&mut self, index: u32) -> HeapObject {
        match mem::replace(&mut self.slots[index as usize], Slot::Freed) {
            Slot::Live(obj) => obj,
            Slot::Forwarded(_) => panic!("scanning a broken heart at slot {index}"),
            Slot::Freed => panic!("scanning a freed slot {index}"),
        }
    }

    pub(crate) fn put_back(&mut self, index: u32, object: HeapObject) {
        self.slots[index as usize] = Slot::Live(object);
    }

    /// Iterate live objects (read-only).
    pub fn live_objects(&self) -> impl Iterator<Item = (u32, &HeapObject)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Live(obj) => Some((i as u32, obj)),
            _ => None,
        })
    }

    /// Full-copy relocating duplication of everything reachable from `root`
    /// within this space into a fresh space of the same logical size,
    /// returning the translated root. The graph must not escape this space.
    pub fn clone_into(&self, root: Value) -> (Semispace, Value) {
        let mut to = Semispace::new(self.capacity);
        let mut map: HashMap<u32, Address> = HashMap::new();
        let mut work: Vec<u32> = Vec::new();

        let new_root = self.import(&mut to, &mut map, &mut work, root);
        while let Some(index) = work.pop() {
            let mut obj = to.take_for_scan(index);
            obj.visit_edges(&mut |slot| {
                *slot = self.import(&mut to, &mut map, &mut work, *slot);
            });
            to.put_back(index, obj);
        }
        (to, new_root)
    }

    fn import(
        &self,
        to: &mut Semispace,
        map: &mut HashMap<u32, Address>,
        work: &mut Vec<u32>,
        value: Value,
    ) -> Value {
        let Value::Ref(addr) = value else {
            return value;
        };
        assert_eq!(
            addr.space, self.id,
            "subgraph reference escapes the cloned space"
        );
        if let Some(&new_addr) = map.get(&addr.index) {
            return Value::Ref(new_addr);
        }
        let copy = self.object(addr.index).clone_object();
        let new_addr = to.allocate(copy);
        map.insert(addr.index, new_addr);
        work.push(new_addr.index);
        Value::Ref(new_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(value: Value) -> HeapObject {
        HeapObject::Cell { value }
    }

    #[test]
    fn forward_allocation_advances_used_bytes() {
        let mut space = Semispace::new(256);
        let a = space.allocate(cell(Value::Nil));
        assert_eq!(space.used(), 16);
        assert_eq!(space.free(), 240);
        assert_eq!(a.index, 0);
        assert!(space.can_fit(240));
        assert!(!space.can_fit(241));
    }

    #[test]
    fn deallocate_unwinds_most_recent_allocation() {
        let mut space = Semispace::new(256);
        let _a = space.allocate(cell(Value::Nil));
        let b = space.allocate(cell(Value::True));
        assert_eq!(space.used(), 32);
        space.deallocate(b);
        assert_eq!(space.used(), 16);
    }

    #[test]
    #[should_panic(expected = "not the most recent forward allocation")]
    fn deallocate_of_older_allocation_is_fatal() {
        let mut space = Semispace::new(256);
        let a = space.allocate(cell(Value::Nil));
        let _b = space.allocate(cell(Value::True));
        space.deallocate(a);
    }

    #[test]
    fn scratch_free_is_strictly_lifo_and_never_corrupts_cursors() {
        let mut space = Semispace::new(256);
        let a = space.scratch_allocate(cell(Value::Nil));
        let b = space.scratch_allocate(cell(Value::True));
        let used_before = space.used();

        // Non-top free is a no-op.
        space.scratch_free(a);
        assert_eq!(space.used(), used_before, "non-top scratch free must not move cursors");

        // Top-of-stack free reclaims.
        space.scratch_free(b);
        assert_eq!(space.used(), used_before - 16);

        // Now `a` is the top and can be reclaimed.
        space.scratch_free(a);
        assert_eq!(space.used(), used_before - 32);
    }

    #[test]
    fn scratch_and_forward_regions_share_the_capacity() {
        let mut space = Semispace::new(64);
        let _f = space.allocate(cell(Value::Nil));
        let _s = space.scratch_allocate(cell(Value::Nil));
        assert_eq!(space.used(), 32);
        assert!(space.can_fit(32));
        assert!(!space.can_fit(33));
    }

    #[test]
    fn break_heart_forwards_and_returns_the_object() {
        let mut space = Semispace::new(256);
        let a = space.allocate(cell(Value::True));
        let target = Address::new(SpaceId::fresh(), 0);
        let obj = space.break_heart(a.index, target);
        assert_eq!(obj, cell(Value::True));
        assert_eq!(space.forwarding(a.index), Some(target));
    }

    #[test]
    #[should_panic(expected = "already broken heart")]
    fn breaking_a_broken_heart_twice_is_fatal() {
        let mut space = Semispace::new(256);
        let a = space.allocate(cell(Value::True));
        let target = Address::new(SpaceId::fresh(), 0);
        space.break_heart(a.index, target);
        space.break_heart(a.index, target);
    }

    #[test]
    #[should_panic(expected = "broken heart")]
    fn dereferencing_a_broken_heart_is_fatal() {
        let mut space = Semispace::new(256);
        let a = space.allocate(cell(Value::True));
        space.break_heart(a.index, Address::new(SpaceId::fresh(), 0));
        let _ = space.object(a.index);
    }

    #[test]
    fn clone_into_produces_an_isomorphic_graph() {
        let mut space = Semispace::new(1024);
        // leaf <- pair(leaf, leaf), with sharing
        let leaf = space.allocate(HeapObject::Bytes {
            data: vec![7, 8, 9],
        });
        let pair = space.allocate(HeapObject::Tuple {
            elems: vec![Value::Ref(leaf), Value::Ref(leaf), Value::small_int(5)],
        });

        let (copy, new_root) = space.clone_into(Value::Ref(pair));
        let root_addr = new_root.expect_ref();
        assert_eq!(root_addr.space, copy.id(), "root translated into the new space");

        let tuple = copy.object(root_addr.index);
        assert_eq!(tuple.element(2), Value::small_int(5), "scalar payload preserved");

        let e0 = tuple.element(0).expect_ref();
        let e1 = tuple.element(1).expect_ref();
        assert_eq!(e0, e1, "sharing preserved, not duplicated");
        assert_eq!(e0.space, copy.id());
        assert_eq!(
            copy.object(e0.index),
            &HeapObject::Bytes { data: vec![7, 8, 9] }
        );

        // source untouched
        assert_eq!(space.object(pair.index).element(0), Value::Ref(leaf));
    }

    #[test]
    fn clone_into_handles_cyclic_graphs() {
        let mut space = Semispace::new(1024);
        let a = space.allocate(HeapObject::Tuple {
            elems: vec![Value::Nil],
        });
        // tie the knot: a[0] = a
        space.object_mut(a.index).set_element(0, Value::Ref(a));

        let (copy, new_root) = space.clone_into(Value::Ref(a));
        let root_addr = new_root.expect_ref();
        assert_eq!(
            copy.object(root_addr.index).element(0),
            Value::Ref(root_addr),
            "cycle closed onto the copy"
        );
    }
}
