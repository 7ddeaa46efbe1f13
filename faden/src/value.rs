//! Tagged values.
//!
//! A `Value` is everything the interpreter can hold in a register or a heap
//! slot: a small integer, a character, a symbol handle, one of the two
//! singletons (`True`, `Nil`) or a reference into arena-owned storage.
//!
//! The enum is the working representation; `encode`/`decode` give the
//! word-sized wire form with the classic low-tag-bit discrimination:
//!
//! ```text
//! ....vvvv vvvvvv00   SmallInt, payload shifted left by 2 (62-bit signed)
//! ssssssss iiiiii01   Ref, bits 2..32 slot index, bits 32..64 space id
//! ....cccc cccccc10   Char, code point shifted left by 2
//! ....yyyy yyyy0011   Symbol, handle shifted left by 4
//! 00000000 00000111   True
//! 00000000 00001011   Nil
//! ```
//!
//! `True` and `Nil` reuse the `0b11` tag with sub-tags no symbol can
//! produce, so they are distinct from every legal small integer and every
//! symbol handle. Decoding an undefined pattern is a fatal error, not a
//! representable state.

use std::sync::atomic::{AtomicU32, Ordering};

/// Smallest tag: low two bits of the encoded word.
const TAG_MASK: u64 = 0b11;
const TAG_SMALL: u64 = 0b00;
const TAG_REF: u64 = 0b01;
const TAG_CHAR: u64 = 0b10;
const TAG_SPECIAL: u64 = 0b11;

const SPECIAL_MASK: u64 = 0b1111;
const SPECIAL_SYMBOL: u64 = 0b0011;
const SPECIAL_TRUE: u64 = 0b0111;
const SPECIAL_NIL: u64 = 0b1011;

// The space field gets the full id width: space ids are never reused, so
// a long-lived system burns through them monotonically and the index side
// is the one with a natural bound (a slot index is at least 16 bytes of
// heap).
const REF_INDEX_SHIFT: u64 = 2;
const REF_INDEX_BITS: u64 = 30;
const REF_SPACE_SHIFT: u64 = REF_INDEX_SHIFT + REF_INDEX_BITS;

/// Small integers lose two bits to the tag.
pub const SMALL_INT_MAX: i64 = (1 << 61) - 1;
pub const SMALL_INT_MIN: i64 = -(1 << 61);

/// Identity of one semispace. Ids are process-global and never reused, so
/// an `Address` stays meaningful when a capsule's space is adopted by
/// another heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub u32);

static NEXT_SPACE_ID: AtomicU32 = AtomicU32::new(1);

impl SpaceId {
    pub fn fresh() -> Self {
        Self(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Interned symbol handle, allocated by [`crate::Symbols`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// Runtime-unique process handle. Never reused, so a stale reference to a
/// dead process stays detectably dead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// A handle to a heap object: which space it lives in and which slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub space: SpaceId,
    pub index: u32,
}

impl Address {
    pub fn new(space: SpaceId, index: u32) -> Self {
        Self { space, index }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value {
    SmallInt(i64),
    Char(char),
    Symbol(SymbolId),
    True,
    Nil,
    Ref(Address),
}

impl Value {
    pub fn small_int(value: i64) -> Self {
        assert!(
            (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&value),
            "small integer {value} out of encodable range"
        );
        Self::SmallInt(value)
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    #[inline]
    pub fn as_ref_addr(&self) -> Option<Address> {
        match self {
            Value::Ref(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Dereference a value the caller knows is a reference. Using this on a
    /// non-reference is a programming error.
    #[inline]
    pub fn expect_ref(&self) -> Address {
        match self {
            Value::Ref(addr) => *addr,
            other => panic!("expected a heap reference, got {other:?}"),
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            Value::SmallInt(v) => {
                assert!(
                    (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&v),
                    "small integer {v} out of encodable range"
                );
                (v << 2).cast_unsigned() | TAG_SMALL
            }
            Value::Char(c) => ((c as u64) << 2) | TAG_CHAR,
            Value::Symbol(SymbolId(id)) => ((id as u64) << 4) | SPECIAL_SYMBOL,
            Value::True => SPECIAL_TRUE,
            Value::Nil => SPECIAL_NIL,
            Value::Ref(addr) => {
                assert!(
                    (addr.index as u64) < (1 << REF_INDEX_BITS),
                    "slot index {} exceeds the encodable range",
                    addr.index
                );
                ((addr.space.0 as u64) << REF_SPACE_SHIFT)
                    | ((addr.index as u64) << REF_INDEX_SHIFT)
                    | TAG_REF
            }
        }
    }

    pub fn decode(word: u64) -> Self {
        match word & TAG_MASK {
            TAG_SMALL => Value::SmallInt(word.cast_signed() >> 2),
            TAG_REF => {
                let index = ((word >> REF_INDEX_SHIFT) & ((1 << REF_INDEX_BITS) - 1)) as u32;
                let space = (word >> REF_SPACE_SHIFT) as u32;
                Value::Ref(Address::new(SpaceId(space), index))
            }
            TAG_CHAR => {
                let code = (word >> 2) as u32;
                let c = char::from_u32(code)
                    .unwrap_or_else(|| panic!("char-tagged word holds invalid code point {code}"));
                Value::Char(c)
            }
            _ => match word & SPECIAL_MASK {
                SPECIAL_SYMBOL => Value::Symbol(SymbolId((word >> 4) as u32)),
                SPECIAL_TRUE if word == SPECIAL_TRUE => Value::True,
                SPECIAL_NIL if word == SPECIAL_NIL => Value::Nil,
                _ => panic!("undefined value encoding {word:#x}"),
            },
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::small_int(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::Char(value)
    }
}
