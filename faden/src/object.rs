//! The heap object model.
//!
//! The set of heap object kinds is closed and known at build time, so the
//! polymorphic header contract of the object model (`real_size`, cloning,
//! reference traversal) is a plain enum with match dispatch instead of a
//! vtable.

use crate::{ProcessId, Value};

pub const HEADER_BYTES: usize = 8;
pub const WORD_BYTES: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Cell,
    Tuple,
    Bytes,
    ActorRef,
}

/// Any value allocated inside a semispace.
///
/// `Cell` and `ActorRef` are the fixed-size base behavior; `Tuple` and
/// `Bytes` carry an element count as part of their state and are the
/// variable-length base behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapObject {
    /// One mutable slot.
    Cell { value: Value },
    /// Variable-length array of values.
    Tuple { elems: Vec<Value> },
    /// Variable-length byte payload, no outgoing references.
    Bytes { data: Vec<u8> },
    /// First-class reference to another process. Process-level GC finds
    /// these while traversing heaps and mailboxes.
    ActorRef { pid: ProcessId },
}

impl HeapObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapObject::Cell { .. } => ObjectKind::Cell,
            HeapObject::Tuple { .. } => ObjectKind::Tuple,
            HeapObject::Bytes { .. } => ObjectKind::Bytes,
            HeapObject::ActorRef { .. } => ObjectKind::ActorRef,
        }
    }

    /// Runtime byte size: one header word plus the payload, with
    /// variable-length kinds paying an extra length word.
    pub fn real_size(&self) -> usize {
        match self {
            HeapObject::Cell { .. } => HEADER_BYTES + WORD_BYTES,
            HeapObject::Tuple { elems } => {
                HEADER_BYTES + WORD_BYTES + elems.len() * WORD_BYTES
            }
            HeapObject::Bytes { data } => {
                HEADER_BYTES + WORD_BYTES + data.len().next_multiple_of(WORD_BYTES)
            }
            HeapObject::ActorRef { .. } => HEADER_BYTES + WORD_BYTES,
        }
    }

    /// Same-kind-preserving copy, used to relocate the object into another
    /// space. Outgoing references still point at the old addresses until
    /// the collector rewrites them.
    pub fn clone_object(&self) -> HeapObject {
        self.clone()
    }

    /// Visit every outgoing reference slot mutably so a collector can
    /// rewrite forwarded addresses in place.
    pub fn visit_edges(&mut self, f: &mut impl FnMut(&mut Value)) {
        match self {
            HeapObject::Cell { value } => f(value),
            HeapObject::Tuple { elems } => {
                for slot in elems.iter_mut() {
                    f(slot);
                }
            }
            HeapObject::Bytes { .. } | HeapObject::ActorRef { .. } => {}
        }
    }

    /// Read-only traversal of outgoing references.
    pub fn for_each_edge(&self, f: &mut impl FnMut(Value)) {
        match self {
            HeapObject::Cell { value } => f(*value),
            HeapObject::Tuple { elems } => {
                for slot in elems.iter() {
                    f(*slot);
                }
            }
            HeapObject::Bytes { .. } | HeapObject::ActorRef { .. } => {}
        }
    }

    /// Element count of a variable-length object, zero for fixed kinds.
    pub fn len(&self) -> usize {
        match self {
            HeapObject::Tuple { elems } => elems.len(),
            HeapObject::Bytes { data } => data.len(),
            HeapObject::Cell { .. } | HeapObject::ActorRef { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self, index: usize) -> Value {
        match self {
            HeapObject::Tuple { elems } => {
                assert!(
                    index < elems.len(),
                    "tuple index {index} past element count {}",
                    elems.len()
                );
                elems[index]
            }
            other => panic!("element access on non-tuple {:?}", other.kind()),
        }
    }

    pub fn set_element(&mut self, index: usize, value: Value) {
        match self {
            HeapObject::Tuple { elems } => {
                assert!(
                    index < elems.len(),
                    "tuple index {index} past element count {}",
                    elems.len()
                );
                elems[index] = value;
            }
            other => panic!("element store on non-tuple {:?}", other.kind()),
        }
    }

    pub fn byte(&self, index: usize) -> u8 {
        match self {
            HeapObject::Bytes { data } => {
                assert!(
                    index < data.len(),
                    "byte index {index} past element count {}",
                    data.len()
                );
                data[index]
            }
            other => panic!("byte access on non-bytes {:?}", other.kind()),
        }
    }

    pub fn actor_pid(&self) -> Option<ProcessId> {
        match self {
            HeapObject::ActorRef { pid } => Some(*pid),
            _ => None,
        }
    }
}
