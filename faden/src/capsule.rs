//! Value capsules: self-contained clones of a value plus its reachable
//! subgraph, used as mailbox envelopes and as global-table storage. A
//! capsule owns a private semispace sized to exactly the subgraph it
//! carries, so it can move between processes without any shared memory.

use std::collections::{HashMap, HashSet};

use crate::{Address, Heap, HeapObject, ProcessId, Semispace, Value};

#[derive(Debug)]
pub struct Capsule {
    space: Semispace,
    root: Value,
    next: Option<Box<Capsule>>,
}

impl Capsule {
    /// Snapshot `value` and its transitive heap closure out of `heap`:
    /// measure the exact byte total, clone each reachable object once into
    /// a private space, and rewrite every outgoing reference through the
    /// old-to-new address map.
    pub fn seal(heap: &Heap, value: Value) -> Capsule {
        let total = measure(heap, value);
        let mut space = Semispace::new(total);
        let mut map: HashMap<Address, Address> = HashMap::new();
        let mut work: Vec<u32> = Vec::new();

        let root = import(heap, &mut space, &mut map, &mut work, value);
        while let Some(index) = work.pop() {
            let mut obj = space.take_for_scan(index);
            obj.visit_edges(&mut |slot| {
                *slot = import(heap, &mut space, &mut map, &mut work, *slot);
            });
            space.put_back(index, obj);
        }

        debug_assert_eq!(
            space.used(),
            total,
            "capsule space sized to exactly the reachable subgraph"
        );
        Capsule {
            space,
            root,
            next: None,
        }
    }

    /// An independent copy of this capsule (fresh space, fresh addresses).
    pub fn duplicate(&self) -> Capsule {
        let (space, root) = self.space.clone_into(self.root);
        Capsule {
            space,
            root,
            next: None,
        }
    }

    pub fn root(&self) -> Value {
        self.root
    }

    pub fn space(&self) -> &Semispace {
        &self.space
    }

    /// Hand the payload over to a heap: the private space becomes one of
    /// the heap's other spaces and the translated root is returned.
    pub fn open_into(self, heap: &mut Heap) -> Value {
        debug_assert!(self.next.is_none(), "opening a still-linked capsule");
        heap.adopt_space(self.space, self.root)
    }

    /// Processes referenced by the payload, for process-level marking.
    pub fn referenced_processes(&self, out: &mut Vec<ProcessId>) {
        for (_, obj) in self.space.live_objects() {
            if let Some(pid) = obj.actor_pid() {
                out.push(pid);
            }
        }
    }
}

fn measure(heap: &Heap, value: Value) -> usize {
    let Some(root) = value.as_ref_addr() else {
        return 0;
    };
    let mut visited: HashSet<Address> = HashSet::new();
    let mut stack = vec![root];
    let mut total = 0usize;
    while let Some(addr) = stack.pop() {
        if !visited.insert(addr) {
            continue;
        }
        let obj = heap.object(addr);
        total += obj.real_size();
        obj.for_each_edge(&mut |edge| {
            if let Some(a) = edge.as_ref_addr() {
                stack.push(a);
            }
        });
    }
    total
}

fn import(
    heap: &Heap,
    to: &mut Semispace,
    map: &mut HashMap<Address, Address>,
    work: &mut Vec<u32>,
    value: Value,
) -> Value {
    let Value::Ref(addr) = value else {
        return value;
    };
    if let Some(&new_addr) = map.get(&addr) {
        return Value::Ref(new_addr);
    }
    let copy = heap.object(addr).clone_object();
    let new_addr = to.allocate(copy);
    map.insert(addr, new_addr);
    work.push(new_addr.index);
    Value::Ref(new_addr)
}

/// Singly-linked list of capsules. Insertion and removal are LIFO at the
/// head; `remove_oldest` walks to the tail for FIFO mailbox extraction.
/// Removing from an empty list is a precondition violation.
#[derive(Debug, Default)]
pub struct CapsuleList {
    head: Option<Box<Capsule>>,
    len: usize,
}

impl CapsuleList {
    pub fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn insert(&mut self, mut capsule: Capsule) {
        debug_assert!(capsule.next.is_none(), "inserting a still-linked capsule");
        capsule.next = self.head.take();
        self.head = Some(Box::new(capsule));
        self.len += 1;
    }

    pub fn remove(&mut self) -> Capsule {
        let mut head = self.head.take().expect("remove from an empty capsule list");
        self.head = head.next.take();
        self.len -= 1;
        *head
    }

    pub fn remove_oldest(&mut self) -> Capsule {
        assert!(!self.is_empty(), "remove from an empty capsule list");
        let mut drained = Vec::with_capacity(self.len);
        while !self.is_empty() {
            drained.push(self.remove());
        }
        let oldest = drained.pop().expect("list was non-empty");
        for capsule in drained.into_iter().rev() {
            self.insert(capsule);
        }
        oldest
    }

    pub fn iter(&self) -> CapsuleIter<'_> {
        CapsuleIter {
            cursor: self.head.as_deref(),
        }
    }

    pub fn clear(&mut self) {
        // Drop iteratively so long mailboxes cannot overflow the stack.
        let mut cursor = self.head.take();
        while let Some(mut capsule) = cursor {
            cursor = capsule.next.take();
        }
        self.len = 0;
    }
}

impl Drop for CapsuleList {
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct CapsuleIter<'a> {
    cursor: Option<&'a Capsule>,
}

impl<'a> Iterator for CapsuleIter<'a> {
    type Item = &'a Capsule;

    fn next(&mut self) -> Option<&'a Capsule> {
        let current = self.cursor?;
        self.cursor = current.next.as_deref();
        Some(current)
    }
}
