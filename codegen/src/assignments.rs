//! Value assignments: the bookkeeping record for one IR value's storage.
//!
//! Each value owns an assignment split into *parts* (an i128 has two
//! 64-bit parts; most values have one). A part either lives in exactly
//! one register, or in its stack slot, or both; the stack copy is up to
//! date iff `stack_valid` is set and `modified` is not.
//!
//! Assignments are created when a value is defined and destroyed when its
//! reference count runs out, so the arena reuses slots through a free
//! list. Storage is a [`SegmentedVec`] so records keep their index (the
//! register file names owners by index) while the arena grows.

use smallvec::SmallVec;

use crate::regfile::{Reg, RegBank};
use crate::segmented_vec::SegmentedVec;

/// Dense per-function value number handed out by the adaptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ValLocalIdx(pub u32);

impl ValLocalIdx {
    /// Sentinel for "no value".
    pub const NONE: ValLocalIdx = ValLocalIdx(u32::MAX);

    /// Construct from a raw index.
    #[inline]
    pub fn from_u32(x: u32) -> Self {
        ValLocalIdx(x)
    }

    /// The raw index.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Is this a real value index?
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

/// Storage state of one assignment part.
#[derive(Clone, Copy, Debug)]
pub struct AssignmentPart {
    /// Register currently holding the part, if any.
    pub reg: Reg,
    /// Byte offset of the part's stack slot below the frame base; 0 means
    /// no slot has been allocated yet. (Offset 0 always belongs to the
    /// saved frame linkage, never to a slot.)
    pub frame_off: u32,
    /// Register bank of the part.
    pub bank: RegBank,
    /// Part size in bytes (1, 2, 4, 8, or 16).
    pub size: u8,
    flags: u8,
}

const FLAG_VARIABLE_REF: u8 = 1 << 0;
const FLAG_FIXED: u8 = 1 << 1;
const FLAG_STACK_VALID: u8 = 1 << 2;
const FLAG_MODIFIED: u8 = 1 << 3;

impl AssignmentPart {
    /// A fresh part with no register and no stack slot.
    pub fn new(bank: RegBank, size: u8) -> Self {
        Self {
            reg: Reg::invalid(),
            frame_off: 0,
            bank,
            size,
            flags: 0,
        }
    }

    /// The materialized form of this part is the *address* of its stack
    /// slot, never the slot contents.
    pub fn variable_ref(&self) -> bool {
        self.flags & FLAG_VARIABLE_REF != 0
    }

    /// Mark the part as a stack variable reference.
    pub fn set_variable_ref(&mut self, v: bool) {
        self.set(FLAG_VARIABLE_REF, v)
    }

    /// The part stays in one register for its whole lifetime.
    pub fn fixed_assignment(&self) -> bool {
        self.flags & FLAG_FIXED != 0
    }

    /// Mark the part as permanently register-resident.
    pub fn set_fixed_assignment(&mut self, v: bool) {
        self.set(FLAG_FIXED, v)
    }

    /// The stack slot holds the current value (unless also `modified`).
    pub fn stack_valid(&self) -> bool {
        self.flags & FLAG_STACK_VALID != 0
    }

    /// Record whether the stack slot is up to date.
    pub fn set_stack_valid(&mut self, v: bool) {
        self.set(FLAG_STACK_VALID, v)
    }

    /// The register copy has been written since the last spill.
    pub fn modified(&self) -> bool {
        self.flags & FLAG_MODIFIED != 0
    }

    /// Record a register write.
    pub fn set_modified(&mut self, v: bool) {
        self.set(FLAG_MODIFIED, v)
    }

    fn set(&mut self, flag: u8, v: bool) {
        if v {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

/// The assignment record for one value.
pub struct ValueAssignment {
    /// Per-part storage state.
    pub parts: SmallVec<[AssignmentPart; 2]>,
    /// Uses left before the assignment can be released, seeded from the
    /// analyzer's reference count.
    pub references_left: u32,
    /// Full byte size of the stack allocation behind a variable-ref
    /// assignment (0 otherwise); the part size only covers the pointer.
    pub alloca_size: u32,
}

/// Arena of live assignments, indexed by the values' local indices.
pub struct AssignmentArena {
    arena: SegmentedVec<ValueAssignment>,
    free: Vec<u32>,
    by_local: Vec<u32>,
}

const NO_SLOT: u32 = u32::MAX;

impl AssignmentArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            arena: SegmentedVec::new(),
            free: Vec::new(),
            by_local: Vec::new(),
        }
    }

    /// Prepare for a function with `n` values.
    pub fn begin_func(&mut self, n: usize) {
        self.arena.clear();
        self.free.clear();
        self.by_local.clear();
        self.by_local.resize(n, NO_SLOT);
    }

    /// Does `local` currently have an assignment?
    pub fn has(&self, local: ValLocalIdx) -> bool {
        self.by_local
            .get(local.0 as usize)
            .map_or(false, |&s| s != NO_SLOT)
    }

    /// Create the assignment for `local`. Panics if one already exists.
    pub fn create(&mut self, local: ValLocalIdx, va: ValueAssignment) -> &mut ValueAssignment {
        let li = local.0 as usize;
        assert!(
            self.by_local[li] == NO_SLOT,
            "value {local:?} already has an assignment"
        );
        let slot = match self.free.pop() {
            Some(slot) => {
                self.arena.replace(slot as usize, va);
                slot
            }
            None => self.arena.push(va) as u32,
        };
        self.by_local[li] = slot;
        self.arena.get_mut(slot as usize).unwrap()
    }

    /// Shared access to the assignment of `local`.
    pub fn get(&self, local: ValLocalIdx) -> &ValueAssignment {
        let slot = self.by_local[local.0 as usize];
        debug_assert!(slot != NO_SLOT, "value {local:?} has no assignment");
        self.arena.get(slot as usize).unwrap()
    }

    /// Exclusive access to the assignment of `local`.
    pub fn get_mut(&mut self, local: ValLocalIdx) -> &mut ValueAssignment {
        let slot = self.by_local[local.0 as usize];
        debug_assert!(slot != NO_SLOT, "value {local:?} has no assignment");
        self.arena.get_mut(slot as usize).unwrap()
    }

    /// Release the assignment of `local`, returning the record so the
    /// caller can free registers and stack slots.
    pub fn release(&mut self, local: ValLocalIdx) -> ValueAssignment {
        let li = local.0 as usize;
        let slot = self.by_local[li];
        debug_assert!(slot != NO_SLOT);
        self.by_local[li] = NO_SLOT;
        self.free.push(slot);
        self.arena.take(slot as usize).unwrap()
    }
}

impl Default for AssignmentArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Stack-frame slot allocator with per-size free lists.
///
/// Offsets grow downward from the frame base; offset 0 is reserved for
/// the frame linkage. `frame_size` is the high-water mark the epilogue
/// writer rounds up to the final frame size.
pub struct StackFrame {
    /// Current frame high-water mark in bytes, including the reserved
    /// area below the frame base (saved registers etc.).
    pub frame_size: u32,
    free_slots: [Vec<u32>; 5],
}

impl StackFrame {
    /// A frame whose first `reserved` bytes are spoken for.
    pub fn new(reserved: u32) -> Self {
        Self {
            frame_size: reserved,
            free_slots: Default::default(),
        }
    }

    /// Reset for a new function.
    pub fn reset(&mut self, reserved: u32) {
        self.frame_size = reserved;
        for l in &mut self.free_slots {
            l.clear();
        }
    }

    fn size_class(size: u32) -> Option<usize> {
        match size {
            1 => Some(0),
            2 => Some(1),
            4 => Some(2),
            8 => Some(3),
            16 => Some(4),
            _ => None,
        }
    }

    /// Allocate a slot of `size` bytes with the given power-of-two
    /// alignment. Power-of-two sizes up to 16 go through the free lists.
    pub fn alloc(&mut self, size: u32, align: u32) -> u32 {
        debug_assert!(align.is_power_of_two());
        if size == align {
            if let Some(class) = Self::size_class(size) {
                if let Some(off) = self.free_slots[class].pop() {
                    return off;
                }
            }
        }
        let off = (self.frame_size + align - 1) & !(align - 1);
        self.frame_size = off + size;
        off
    }

    /// Return a slot to its free list.
    pub fn free(&mut self, off: u32, size: u32) {
        if let Some(class) = Self::size_class(size) {
            self.free_slots[class].push(off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regfile::GP_BANK;

    fn one_part() -> ValueAssignment {
        ValueAssignment {
            parts: smallvec::smallvec![AssignmentPart::new(GP_BANK, 8)],
            references_left: 2,
            alloca_size: 0,
        }
    }

    #[test]
    fn arena_reuses_slots() {
        let mut arena = AssignmentArena::new();
        arena.begin_func(4);
        arena.create(ValLocalIdx(0), one_part());
        arena.create(ValLocalIdx(1), one_part());
        arena.release(ValLocalIdx(0));
        arena.create(ValLocalIdx(2), one_part());
        assert!(arena.has(ValLocalIdx(1)));
        assert!(arena.has(ValLocalIdx(2)));
        assert!(!arena.has(ValLocalIdx(0)));
    }

    #[test]
    fn frame_alignment_and_reuse() {
        let mut frame = StackFrame::new(16);
        let a = frame.alloc(8, 8);
        assert_eq!(a, 16);
        let b = frame.alloc(1, 1);
        assert_eq!(b, 24);
        let c = frame.alloc(8, 8);
        assert_eq!(c, 32);
        frame.free(a, 8);
        assert_eq!(frame.alloc(8, 8), a);
    }
}
