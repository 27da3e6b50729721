//! The IR adaptor trait: the surface a client IR exposes to the engine.
//!
//! The engine never inspects IR instructions itself; the adaptor
//! enumerates blocks, values, operands, PHIs, and arguments, and stores
//! two 32-bit scratch words per block which the analyzer uses during
//! reverse-post-order construction and then leaves holding the final
//! layout index (plus traversal flags in the second word).
//!
//! Block references handed to `block_succs` must come from the same
//! function the adaptor is currently switched to; the engine compiles one
//! function at a time (`switch_func`) and resets all per-function state
//! in between.

use crate::regfile::{RegBank, GP_BANK};

/// Interface between a client IR and the engine.
pub trait IrAdaptor {
    /// Reference to an IR value (an instruction result, PHI, argument, or
    /// stack slot).
    type Value: Copy + Eq + core::fmt::Debug;
    /// Reference to an IR basic block.
    type Block: Copy + Eq + core::fmt::Debug;
    /// Reference to an IR function.
    type Func: Copy + Eq;

    /// Number of functions in the module.
    fn func_count(&self) -> u32;

    /// All functions, in module order.
    fn funcs(&self) -> impl Iterator<Item = Self::Func> + '_;

    /// Linkage name of `func`.
    fn func_link_name(&self, func: Self::Func) -> &str;

    /// Is `func` a declaration without a body?
    fn func_extern(&self, func: Self::Func) -> bool;

    /// Does `func` have local (file-scope) linkage?
    fn func_local(&self, func: Self::Func) -> bool;

    /// Switch the adaptor to `func`. Returns false for declarations.
    fn switch_func(&mut self, func: Self::Func) -> bool;

    /// Highest value local index of the current function.
    fn cur_highest_val_idx(&self) -> u32;

    /// Arguments of the current function, in order.
    fn cur_args(&self) -> impl Iterator<Item = Self::Value> + '_;

    /// Static stack slots of the current function (`alloca`s in the entry
    /// block).
    fn cur_static_allocas(&self) -> impl Iterator<Item = Self::Value> + '_;

    /// Does the current function use `va_start`-style variable arguments?
    fn cur_is_vararg(&self) -> bool {
        false
    }

    /// May the current function grow its stack frame dynamically?
    fn cur_has_dynamic_alloca(&self) -> bool {
        false
    }

    /// May the current function emit calls? Steers fixed-assignment
    /// register selection towards callee-saved registers.
    fn cur_may_emit_calls(&self) -> bool {
        true
    }

    /// Entry block of the current function.
    fn cur_entry_block(&self) -> Self::Block;

    /// All blocks of the current function in source sibling order. The
    /// RPO tie-break follows this order.
    fn blocks(&self) -> impl Iterator<Item = Self::Block> + '_;

    /// Successors of `block`, in terminator order.
    fn block_succs(&self, block: Self::Block) -> impl Iterator<Item = Self::Block> + '_;

    /// Non-PHI and PHI values defined in `block`, in instruction order.
    fn block_values(&self, block: Self::Block) -> impl Iterator<Item = Self::Value> + '_;

    /// PHIs of `block`.
    fn block_phis(&self, block: Self::Block) -> impl Iterator<Item = Self::Value> + '_;

    /// First scratch word of `block`.
    fn block_info(&self, block: Self::Block) -> u32;

    /// Store the first scratch word of `block`.
    fn block_set_info(&mut self, block: Self::Block, info: u32);

    /// Second scratch word of `block`.
    fn block_info2(&self, block: Self::Block) -> u32;

    /// Store the second scratch word of `block`.
    fn block_set_info2(&mut self, block: Self::Block, info: u32);

    /// Dense per-function number of `value`.
    fn val_local_idx(&self, value: Self::Value) -> u32;

    /// Should liveness analysis skip `value` entirely?
    fn val_ignore_in_liveness(&self, value: Self::Value) -> bool {
        false
    }

    /// Is `value` a PHI?
    fn val_is_phi(&self, value: Self::Value) -> bool;

    /// Does the instruction defining `value` produce a result?
    fn val_produces_result(&self, value: Self::Value) -> bool;

    /// Operand values of the instruction defining `value`.
    fn val_operands(&self, value: Self::Value) -> impl Iterator<Item = Self::Value> + '_;

    /// Number of incoming (block, value) slots of a PHI.
    fn phi_incoming_count(&self, phi: Self::Value) -> u32;

    /// Incoming block of PHI slot `slot`.
    fn phi_incoming_block(&self, phi: Self::Value, slot: u32) -> Self::Block;

    /// Incoming value of PHI slot `slot`.
    fn phi_incoming_val(&self, phi: Self::Value, slot: u32) -> Self::Value;

    /// Byte size of the stack slot when `value` is a static alloca.
    fn val_alloca_size(&self, value: Self::Value) -> u32 {
        let _ = value;
        0
    }

    /// Number of parts the storage of `value` splits into.
    fn val_part_count(&self, value: Self::Value) -> u32 {
        let _ = value;
        1
    }

    /// Register bank of part `part` of `value`.
    fn val_part_bank(&self, value: Self::Value, part: u32) -> RegBank {
        let _ = (value, part);
        GP_BANK
    }

    /// Byte size of part `part` of `value`.
    fn val_part_size(&self, value: Self::Value, part: u32) -> u32 {
        let _ = (value, part);
        8
    }
}
