//! The single-pass compiler core.
//!
//! One [`Compiler`] walks the analyzed block layout of a function exactly
//! once. Every IR value receives a *value assignment* when it is defined
//! (a register, a stack slot, or both); operand references load, lock,
//! and release assignments through the handful of primitives the client
//! lowering uses ([`Compiler::use_val_as_reg`], [`Compiler::def_val`],
//! [`Compiler::def_val_salvage`]). Reference counts seeded from the
//! analyzer drive deallocation, with `last_full` values surviving to the
//! end of their last block.
//!
//! Values that live across block boundaries keep either a *fixed
//! assignment* (one register for the whole lifetime) or a stack slot as
//! their canonical location; everything else travels in scratch-lifetime
//! registers. Branch emission resolves PHIs with parallel-copy ordering
//! and splits critical edges where the fall-through side would observe
//! the copies.

use smallvec::SmallVec;

use crate::adaptor::IrAdaptor;
use crate::analyzer::{Analyzer, BlockIndex};
use crate::assembler::{Assembler, Label, SymBinding, SymRef};
use crate::assignments::{
    AssignmentArena, AssignmentPart, StackFrame, ValLocalIdx, ValueAssignment,
};
use crate::error::{CodegenError, CodegenResult};
use crate::isa::{Backend, BranchCond, CCAssigner, CCAssignment, CallTarget, FuncInfo};
use crate::regfile::{Reg, RegBank, RegisterFile, NUM_BANKS};

/// Client instruction lowering.
///
/// The compiler core drives the block walk and calls `lower_inst` for
/// every non-PHI instruction; the lowering translates the client's
/// opcodes into back-end emissions through the compiler's value
/// primitives.
pub trait Lowering<A: IrAdaptor, B: Backend> {
    /// Lower one instruction.
    fn lower_inst(&mut self, comp: &mut Compiler<A, B>, inst: A::Value) -> CodegenResult<()>;
}

/// Canonical location of a value part during PHI resolution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Loc {
    Reg(Reg),
    Stack(u32),
}

struct PhiCopy {
    dst_local: ValLocalIdx,
    dst_loc: Loc,
    size: u32,
    bank: RegBank,
    src_local: ValLocalIdx,
    src_loc: Loc,
    src_override: Option<Reg>,
    done: bool,
}

/// The per-module compiler. Owns the assembler and all per-function
/// scratch state, which is cleared between functions; the engine is
/// re-entrant across functions but compiles one at a time.
pub struct Compiler<'a, A: IrAdaptor, B: Backend> {
    /// The client IR adaptor.
    pub adaptor: &'a mut A,
    /// Analysis results for the current function.
    pub analyzer: Analyzer<A>,
    /// The object being built.
    pub assembler: Assembler,
    /// The architecture back-end.
    pub backend: B,
    /// Register occupancy.
    pub regfile: RegisterFile,
    arena: AssignmentArena,
    frame: StackFrame,
    block_labels: Vec<Label>,
    func_syms: Vec<SymRef>,
    cur_block: BlockIndex,
    may_emit_calls: bool,
    fixed_counts: [u32; NUM_BANKS],
    locked: SmallVec<[Reg; 8]>,
    dead_after_inst: SmallVec<[ValLocalIdx; 8]>,
    delayed_free: Vec<(BlockIndex, ValLocalIdx)>,
    spilled_for_terminator: bool,
}

impl<'a, A: IrAdaptor, B: Backend> Compiler<'a, A, B> {
    /// Create a compiler over `adaptor` with the given back-end.
    pub fn new(adaptor: &'a mut A, backend: B) -> Self {
        let assembler = Assembler::new(B::target_info());
        let cc = *backend.cc_info();
        let bank_regs = [
            backend.bank_regs(crate::regfile::GP_BANK),
            backend.bank_regs(crate::regfile::FP_BANK),
        ];
        Self {
            adaptor,
            analyzer: Analyzer::new(),
            assembler,
            backend,
            regfile: RegisterFile::new(cc.allocatable_regs, bank_regs),
            arena: AssignmentArena::new(),
            frame: StackFrame::new(0),
            block_labels: Vec::new(),
            func_syms: Vec::new(),
            cur_block: 0,
            may_emit_calls: true,
            fixed_counts: [0; NUM_BANKS],
            locked: SmallVec::new(),
            dead_after_inst: SmallVec::new(),
            delayed_free: Vec::new(),
            spilled_for_terminator: false,
        }
    }

    /// The symbol of the `idx`-th function (in `funcs()` order).
    pub fn func_sym(&self, idx: u32) -> SymRef {
        self.func_syms[idx as usize]
    }

    /// Layout index of the block currently being compiled.
    pub fn cur_block_idx(&self) -> BlockIndex {
        self.cur_block
    }

    /// Consume the compiler, keeping the accumulated assembler state.
    pub fn into_assembler(self) -> Assembler {
        self.assembler
    }

    /// Drop all accumulated state, ready for a fresh translation unit.
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.backend.reset();
        self.analyzer.reset();
        self.func_syms.clear();
        self.delayed_free.clear();
        self.locked.clear();
        self.dead_after_inst.clear();
    }

    /// Compile every function of the module with the given lowering.
    pub fn compile<L: Lowering<A, B>>(&mut self, lowering: &mut L) -> CodegenResult<()> {
        let funcs: Vec<A::Func> = self.adaptor.funcs().collect();

        // predeclare all symbols so calls can reference functions defined
        // later in the module
        self.func_syms.clear();
        for &func in &funcs {
            let name = self.adaptor.func_link_name(func).to_string();
            let sym = if self.adaptor.func_extern(func) {
                self.assembler.sym_add_undef(&name, SymBinding::Global)
            } else if self.adaptor.func_local(func) {
                self.assembler.sym_predef_func(&name, SymBinding::Local)
            } else {
                self.assembler.sym_predef_func(&name, SymBinding::Global)
            };
            self.func_syms.push(sym);
        }

        for (idx, &func) in funcs.iter().enumerate() {
            if self.adaptor.func_extern(func) {
                continue;
            }
            log::debug!(
                "compiling function {}",
                self.adaptor.func_link_name(func)
            );
            self.compile_func(func, idx as u32, lowering)?;
        }
        Ok(())
    }

    /// Serialize the object file.
    pub fn finish(&mut self) -> CodegenResult<Vec<u8>> {
        self.assembler.finish()
    }

    fn compile_func<L: Lowering<A, B>>(
        &mut self,
        func: A::Func,
        func_idx: u32,
        lowering: &mut L,
    ) -> CodegenResult<()> {
        if !self.adaptor.switch_func(func) {
            return Ok(());
        }
        self.analyzer.reset();
        self.analyzer.switch_func(self.adaptor);

        let info = FuncInfo {
            sym: self.func_syms[func_idx as usize],
            is_vararg: self.adaptor.cur_is_vararg(),
            has_dynamic_alloca: self.adaptor.cur_has_dynamic_alloca(),
        };
        self.may_emit_calls = self.adaptor.cur_may_emit_calls();

        let cc = *self.backend.cc_info();
        self.regfile.reset(cc.allocatable_regs);
        self.arena
            .begin_func(self.adaptor.cur_highest_val_idx() as usize + 1);
        self.frame.reset(self.backend.frame_reserved(&info));
        self.fixed_counts = [0; NUM_BANKS];
        self.locked.clear();
        self.dead_after_inst.clear();
        self.delayed_free.clear();
        self.cur_block = 0;

        self.block_labels.clear();
        for _ in 0..self.analyzer.block_count() {
            let label = self.backend.label_create();
            self.block_labels.push(label);
        }

        self.assembler.text_align_16();
        self.backend.begin_func(&mut self.assembler, &info);
        self.setup_args()?;
        self.setup_static_allocas();

        for block_idx in 0..self.analyzer.block_count() {
            self.cur_block = block_idx;
            self.spilled_for_terminator = false;
            self.free_delayed();

            let label = self.block_labels[block_idx as usize];
            self.backend.label_place(&mut self.assembler, label);

            let block = self.analyzer.block_layout[block_idx as usize];
            let values: SmallVec<[A::Value; 16]> = self.adaptor.block_values(block).collect();
            for value in values {
                if self.adaptor.val_is_phi(value) {
                    self.consume_def(value);
                } else {
                    lowering.lower_inst(self, value)?;
                }
                self.end_inst();
            }

            self.clear_block_bindings();
        }

        self.backend
            .finish_func(&mut self.assembler, self.regfile.clobbered, self.frame.frame_size)?;
        Ok(())
    }

    // --- argument and alloca setup ---------------------------------------

    fn setup_args(&mut self) -> CodegenResult<()> {
        let cc_info = *self.backend.cc_info();
        let mut cc = self.backend.new_cc();

        // prevent argument registers from being handed out while incoming
        // arguments are still being placed
        debug_assert_eq!(
            cc_info.allocatable_regs & cc_info.arg_regs,
            cc_info.arg_regs,
            "argument registers must be allocatable"
        );
        self.regfile.allocatable &= !cc_info.arg_regs;

        let args: SmallVec<[A::Value; 8]> = self.adaptor.cur_args().collect();
        for arg in args {
            let local = ValLocalIdx::from_u32(self.adaptor.val_local_idx(arg));
            self.create_assignment(arg);

            let part_count = self.adaptor.val_part_count(arg);
            for part in 0..part_count {
                let bank = self.adaptor.val_part_bank(arg, part);
                let size = self.adaptor.val_part_size(arg, part);
                let mut cca = CCAssignment::new(bank, size);
                cc.assign_arg(&mut cca);

                if cca.reg.is_valid() {
                    // hand the register back to the allocator as soon as
                    // it is bound; unused arguments free it right away
                    self.regfile.allocatable |= cca.reg.mask();
                    self.regfile.mark_used(cca.reg, local, part as u8);
                    self.regfile.mark_clobbered(cca.reg);
                    let pa = &mut self.arena.get_mut(local).parts[part as usize];
                    pa.reg = cca.reg;
                    pa.set_modified(true);
                } else {
                    let dst = self.alloc_reg_evicting(bank)?;
                    self.backend
                        .load_arg_from_stack(&mut self.assembler, dst, &cca);
                    self.regfile.mark_used(dst, local, part as u8);
                    self.regfile.mark_clobbered(dst);
                    let pa = &mut self.arena.get_mut(local).parts[part as usize];
                    pa.reg = dst;
                    pa.set_modified(true);
                }
            }

            // the definition itself accounts for one reference
            self.dec_refs(local);
        }

        self.regfile.allocatable |= cc_info.arg_regs;
        self.flush_dead();
        Ok(())
    }

    fn setup_static_allocas(&mut self) {
        let allocas: SmallVec<[A::Value; 8]> = self.adaptor.cur_static_allocas().collect();
        for value in allocas {
            let local = ValLocalIdx::from_u32(self.adaptor.val_local_idx(value));
            let size = self.adaptor.val_alloca_size(value).max(1);
            let align = size.next_power_of_two().clamp(8, 16);
            let refs = self.analyzer.liveness_info(local.as_u32()).ref_count;
            let off = self.frame.alloc(size, align);
            let mut part = AssignmentPart::new(crate::regfile::GP_BANK, 8);
            part.frame_off = off;
            part.set_variable_ref(true);
            self.arena.create(
                local,
                ValueAssignment {
                    parts: smallvec::smallvec![part],
                    references_left: refs,
                    alloca_size: size,
                },
            );
        }
    }

    // --- assignment management -------------------------------------------

    fn create_assignment(&mut self, value: A::Value) {
        let local = ValLocalIdx::from_u32(self.adaptor.val_local_idx(value));
        debug_assert!(!self.arena.has(local), "value defined twice");
        let refs = self.analyzer.liveness_info(local.as_u32()).ref_count;
        let part_count = self.adaptor.val_part_count(value);
        let mut parts = SmallVec::with_capacity(part_count as usize);
        for part in 0..part_count {
            parts.push(AssignmentPart::new(
                self.adaptor.val_part_bank(value, part),
                self.adaptor.val_part_size(value, part) as u8,
            ));
        }
        self.arena.create(
            local,
            ValueAssignment {
                parts,
                references_left: refs,
                alloca_size: 0,
            },
        );
    }

    fn dec_refs(&mut self, local: ValLocalIdx) {
        let a = self.arena.get_mut(local);
        debug_assert!(a.references_left > 0, "value {local:?} over-released");
        a.references_left -= 1;
        if a.references_left == 0 {
            self.dead_after_inst.push(local);
        }
    }

    /// Consume the defining reference of a value the lowering emits no
    /// code for (PHIs at their own block, static allocas).
    pub fn consume_def(&mut self, value: A::Value) {
        let local = ValLocalIdx::from_u32(self.adaptor.val_local_idx(value));
        if !self.arena.has(local) {
            // a PHI nothing branched to yet (single-predecessor
            // degenerate form)
            self.create_assignment(value);
        }
        self.dec_refs(local);
    }

    fn free_assignment(&mut self, local: ValLocalIdx) {
        let va = self.arena.release(local);
        for part in &va.parts {
            if part.reg.is_valid() {
                if part.fixed_assignment() {
                    self.fixed_counts[part.bank.0 as usize] -= 1;
                    self.regfile.unmark_fixed(part.reg);
                }
                self.regfile.unmark_used(part.reg);
            }
            // variable-ref slots keep their (arbitrarily sized) storage
            // for the rest of the function
            if part.frame_off != 0 && !part.variable_ref() {
                self.frame.free(part.frame_off, u32::from(part.size));
            }
        }
    }

    fn flush_dead(&mut self) {
        while let Some(local) = self.dead_after_inst.pop() {
            if !self.arena.has(local) {
                continue;
            }
            if self.arena.get(local).references_left != 0 {
                continue;
            }
            let liveness = *self.analyzer.liveness_info(local.as_u32());
            if liveness.last_full && self.cur_block <= liveness.last {
                // keep the value recoverable until its last block ends
                self.make_stack_valid(local);
                self.unbind_regs(local);
                self.delayed_free.push((liveness.last, local));
            } else {
                self.free_assignment(local);
            }
        }
    }

    fn free_delayed(&mut self) {
        let cur = self.cur_block;
        let mut i = 0;
        while i < self.delayed_free.len() {
            if self.delayed_free[i].0 < cur {
                let (_, local) = self.delayed_free.swap_remove(i);
                self.free_assignment(local);
            } else {
                i += 1;
            }
        }
    }

    fn make_stack_valid(&mut self, local: ValLocalIdx) {
        for part_idx in 0..self.arena.get(local).parts.len() {
            let part = self.arena.get(local).parts[part_idx];
            if part.variable_ref() || part.stack_valid() && !part.modified() {
                continue;
            }
            if !part.reg.is_valid() {
                debug_assert!(part.stack_valid());
                continue;
            }
            let size = u32::from(part.size);
            let off = if part.frame_off != 0 {
                part.frame_off
            } else {
                self.frame.alloc(size, size)
            };
            self.backend.spill(&mut self.assembler, part.reg, off, size);
            let pa = &mut self.arena.get_mut(local).parts[part_idx];
            pa.frame_off = off;
            pa.set_stack_valid(true);
            pa.set_modified(false);
        }
    }

    fn unbind_regs(&mut self, local: ValLocalIdx) {
        for part_idx in 0..self.arena.get(local).parts.len() {
            let part = self.arena.get(local).parts[part_idx];
            if part.reg.is_valid() {
                if part.fixed_assignment() {
                    self.fixed_counts[part.bank.0 as usize] -= 1;
                    self.regfile.unmark_fixed(part.reg);
                }
                self.regfile.unmark_used(part.reg);
                let pa = &mut self.arena.get_mut(local).parts[part_idx];
                pa.reg = Reg::invalid();
                pa.set_fixed_assignment(false);
            }
        }
    }

    /// Unlock operand registers and release dead values. Called by the
    /// compile loop after every instruction.
    fn end_inst(&mut self) {
        while let Some(reg) = self.locked.pop() {
            self.regfile.unmark_fixed(reg);
        }
        self.flush_dead();
    }

    fn lock_reg(&mut self, reg: Reg) {
        if !self.regfile.is_fixed(reg) {
            self.regfile.mark_fixed(reg);
            self.locked.push(reg);
        }
    }

    // --- register allocation ---------------------------------------------

    fn alloc_reg_evicting(&mut self, bank: RegBank) -> CodegenResult<Reg> {
        let cc = *self.backend.cc_info();
        // prefer caller-saved registers so small functions save nothing
        let reg = self.regfile.find_free(bank, !cc.callee_saved_regs);
        if reg.is_valid() {
            return Ok(reg);
        }
        let victim = self.regfile.pick_eviction_candidate(bank);
        if !victim.is_valid() {
            return Err(CodegenError::RegisterExhausted(bank.0));
        }
        self.evict_reg(victim);
        Ok(victim)
    }

    fn evict_reg(&mut self, reg: Reg) {
        let local = self.regfile.reg_local_idx(reg);
        debug_assert!(local.is_some(), "evicting an unowned register");
        let part_idx = self.regfile.reg_part(reg) as usize;
        let part = self.arena.get(local).parts[part_idx];
        debug_assert!(!part.fixed_assignment());

        if !part.variable_ref() && (part.modified() || !part.stack_valid()) {
            let size = u32::from(part.size);
            let off = if part.frame_off != 0 {
                part.frame_off
            } else {
                self.frame.alloc(size, size)
            };
            self.backend.spill(&mut self.assembler, reg, off, size);
            let pa = &mut self.arena.get_mut(local).parts[part_idx];
            pa.frame_off = off;
            pa.set_stack_valid(true);
            pa.set_modified(false);
        }
        self.arena.get_mut(local).parts[part_idx].reg = Reg::invalid();
        self.regfile.unmark_used(reg);
    }

    /// Allocate a scratch register bound to the current code site.
    pub fn alloc_scratch(&mut self, bank: RegBank) -> CodegenResult<Reg> {
        let reg = self.alloc_reg_evicting(bank)?;
        self.regfile.mark_used(reg, ValLocalIdx::NONE, 0);
        self.regfile.mark_fixed(reg);
        self.regfile.mark_clobbered(reg);
        Ok(reg)
    }

    /// Release a scratch register.
    pub fn free_scratch(&mut self, reg: Reg) {
        self.regfile.unmark_fixed(reg);
        self.regfile.unmark_used(reg);
    }

    /// Select a register for a fixed assignment, following the
    /// callee-saved-first policy when the function may emit calls.
    fn select_fixed_reg(&mut self, bank: RegBank) -> Reg {
        let cc = *self.backend.cc_info();
        let reg_mask =
            self.regfile.bank_regs(bank) & !self.backend.fixed_nonallocatable_mask();

        let find = |rf: &RegisterFile, preferred: u64| -> u64 {
            let free = rf.allocatable & !rf.used;
            let mut possible = free & preferred & reg_mask;
            if possible == 0 {
                possible = rf.used & !rf.fixed & preferred & reg_mask;
            }
            possible
        };

        let possible = if self.may_emit_calls {
            // only callee-saved registers survive calls
            find(&self.regfile, cc.callee_saved_regs)
        } else {
            let preferred = !cc.result_regs & !cc.callee_saved_regs;
            let first = find(&self.regfile, preferred);
            if first != 0 {
                first
            } else {
                find(&self.regfile, cc.callee_saved_regs)
            }
        };
        if possible == 0 {
            return Reg::invalid();
        }

        let unused = possible & !self.regfile.used;
        if unused != 0 {
            return Reg::new(unused.trailing_zeros() as u8);
        }

        // last resort: evict an unmodified resident
        for reg in RegisterFile::regs_in(possible) {
            if self.regfile.is_fixed(reg) {
                continue;
            }
            let local = self.regfile.reg_local_idx(reg);
            if !local.is_some() {
                continue;
            }
            let part = self.arena.get(local).parts[self.regfile.reg_part(reg) as usize];
            if part.modified() {
                continue;
            }
            return reg;
        }
        Reg::invalid()
    }

    // --- value access ----------------------------------------------------

    fn local_of(&self, value: A::Value) -> ValLocalIdx {
        ValLocalIdx::from_u32(self.adaptor.val_local_idx(value))
    }

    fn load_part(&mut self, local: ValLocalIdx, part_idx: usize) -> CodegenResult<Reg> {
        let part = self.arena.get(local).parts[part_idx];
        if part.reg.is_valid() {
            return Ok(part.reg);
        }
        let reg = self.alloc_reg_evicting(part.bank)?;
        if part.variable_ref() {
            let alloca_size = self.arena.get(local).alloca_size;
            self.backend
                .load_stack_addr(&mut self.assembler, reg, part.frame_off, alloca_size);
        } else {
            debug_assert!(
                part.stack_valid(),
                "value {local:?} has neither register nor stack copy"
            );
            self.backend
                .reload(&mut self.assembler, reg, part.frame_off, u32::from(part.size));
        }
        self.regfile.mark_used(reg, local, part_idx as u8);
        self.regfile.mark_clobbered(reg);
        self.arena.get_mut(local).parts[part_idx].reg = reg;
        Ok(reg)
    }

    /// Use `value` (part 0) as a register operand: loads it if necessary,
    /// locks the register for the rest of the instruction, and consumes
    /// one reference.
    pub fn use_val_as_reg(&mut self, value: A::Value) -> CodegenResult<Reg> {
        let local = self.local_of(value);
        debug_assert!(self.arena.has(local), "use of undefined value {value:?}");
        let reg = self.load_part(local, 0)?;
        self.lock_reg(reg);
        self.dec_refs(local);
        Ok(reg)
    }

    /// Is this instruction the last use of `value`? (Consults the
    /// remaining reference count.)
    pub fn is_last_use(&self, value: A::Value) -> bool {
        let local = self.local_of(value);
        self.arena.has(local) && self.arena.get(local).references_left == 0
    }

    /// Define `value` and return the register of its first part. Values
    /// living across blocks try to get a fixed assignment.
    pub fn def_val(&mut self, value: A::Value) -> CodegenResult<Reg> {
        let local = self.local_of(value);
        self.create_assignment(value);
        let bank = self.arena.get(local).parts[0].bank;

        let liveness = *self.analyzer.liveness_info(local.as_u32());
        let crosses_blocks = liveness.first != liveness.last;
        let mut fixed = false;
        let reg = if crosses_blocks
            && self.fixed_counts[bank.0 as usize] < self.backend.num_fixed_assignments(bank)
        {
            let reg = self.select_fixed_reg(bank);
            if reg.is_valid() {
                if self.regfile.is_used(reg) {
                    self.evict_reg(reg);
                }
                fixed = true;
                reg
            } else {
                self.alloc_reg_evicting(bank)?
            }
        } else {
            self.alloc_reg_evicting(bank)?
        };

        self.regfile.mark_used(reg, local, 0);
        self.regfile.mark_clobbered(reg);
        if fixed {
            self.regfile.mark_fixed(reg);
            self.fixed_counts[bank.0 as usize] += 1;
        }
        let pa = &mut self.arena.get_mut(local).parts[0];
        pa.reg = reg;
        pa.set_modified(true);
        pa.set_fixed_assignment(fixed);
        self.lock_reg(reg);
        self.dec_refs(local);
        Ok(reg)
    }

    /// Define `value`, reusing `operand`'s register when this was the
    /// operand's last use (salvage). The operand must already have been
    /// consumed with [`Compiler::use_val_as_reg`].
    pub fn def_val_salvage(&mut self, value: A::Value, operand: A::Value) -> CodegenResult<Reg> {
        let op_local = self.local_of(operand);
        let can_salvage = self.arena.has(op_local) && {
            let a = self.arena.get(op_local);
            a.references_left == 0 && a.parts[0].reg.is_valid() && !a.parts[0].fixed_assignment()
        };
        let result_bank = self.adaptor.val_part_bank(value, 0);
        if !can_salvage || self.arena.get(op_local).parts[0].bank != result_bank {
            return self.def_val(value);
        }

        let reg = self.arena.get(op_local).parts[0].reg;
        let local = self.local_of(value);
        self.create_assignment(value);

        // transfer ownership of the register from the dead operand
        self.arena.get_mut(op_local).parts[0].reg = Reg::invalid();
        self.regfile.unmark_fixed(reg);
        self.regfile.unmark_used(reg);
        self.regfile.mark_used(reg, local, 0);
        self.regfile.mark_clobbered(reg);
        let pa = &mut self.arena.get_mut(local).parts[0];
        pa.reg = reg;
        pa.set_modified(true);
        self.lock_reg(reg);
        self.dec_refs(local);
        Ok(reg)
    }

    // --- terminators ------------------------------------------------------

    /// Spill every non-fixed register whose value outlives the current
    /// block; successors find such values at their canonical stack
    /// locations. Idempotent within a block.
    fn spill_live_across(&mut self) {
        if self.spilled_for_terminator {
            return;
        }
        self.spilled_for_terminator = true;

        let mask = self.regfile.used & self.regfile.allocatable;
        for reg in RegisterFile::regs_in(mask) {
            let local = self.regfile.reg_local_idx(reg);
            if !local.is_some() {
                continue; // scratch
            }
            let part_idx = self.regfile.reg_part(reg) as usize;
            let part = self.arena.get(local).parts[part_idx];
            if part.fixed_assignment() {
                continue;
            }
            let liveness = *self.analyzer.liveness_info(local.as_u32());
            let lives_past = liveness.last > self.cur_block
                || (liveness.last == self.cur_block && liveness.last_full);
            if !lives_past {
                continue;
            }
            if self.regfile.is_fixed(reg) {
                // locked operand of the terminator: write back but keep
                // the register readable
                self.make_stack_valid(local);
            } else {
                self.evict_reg(reg);
            }
        }
    }

    /// Drop all non-fixed register bindings at the end of a block. The
    /// terminator already spilled everything that outlives the block, so
    /// this emits no code; it only keeps the (path-independent) register
    /// state from leaking across block boundaries.
    fn clear_block_bindings(&mut self) {
        let mask = self.regfile.used & self.regfile.allocatable;
        for reg in RegisterFile::regs_in(mask) {
            let local = self.regfile.reg_local_idx(reg);
            debug_assert!(local.is_some(), "scratch register leaked past a block");
            if !local.is_some() {
                continue;
            }
            let part_idx = self.regfile.reg_part(reg) as usize;
            if self.arena.get(local).parts[part_idx].fixed_assignment() {
                continue;
            }
            self.arena.get_mut(local).parts[part_idx].reg = Reg::invalid();
            self.regfile.unmark_used(reg);
        }
    }

    /// Emit an unconditional branch to `target`, resolving PHIs. When
    /// `fallthrough_ok` and the target is the next block in layout, no
    /// jump instruction is emitted.
    pub fn gen_jump(&mut self, target: A::Block) -> CodegenResult<()> {
        self.spill_live_across();
        let target_idx = self.analyzer.block_idx(self.adaptor, target);
        self.branch_to_block(BranchCond::Always, target, target_idx, false, true)
    }

    /// Emit a conditional branch: to `true_target` when `cond_val` is
    /// non-zero, else to `false_target`.
    pub fn gen_cond_branch(
        &mut self,
        cond_val: A::Value,
        true_target: A::Block,
        false_target: A::Block,
    ) -> CodegenResult<()> {
        let reg = self.use_val_as_reg(cond_val)?;
        self.gen_branch(BranchCond::NonZero(reg), true_target, false_target)
    }

    /// Emit a two-way branch on an arbitrary condition. Registers named
    /// by `cond` must be operands locked through
    /// [`Compiler::use_val_as_reg`] so the live-across spill keeps them
    /// readable.
    pub fn gen_branch(
        &mut self,
        cond: BranchCond,
        true_target: A::Block,
        false_target: A::Block,
    ) -> CodegenResult<()> {
        self.spill_live_across();

        let t_idx = self.analyzer.block_idx(self.adaptor, true_target);
        let f_idx = self.analyzer.block_idx(self.adaptor, false_target);
        let t_split = self
            .analyzer
            .block_has_multiple_incoming(self.adaptor, true_target);

        self.branch_to_block(cond, true_target, t_idx, t_split, false)?;
        self.branch_to_block(BranchCond::Always, false_target, f_idx, false, true)
    }

    fn branch_to_block(
        &mut self,
        cond: BranchCond,
        target: A::Block,
        target_idx: BlockIndex,
        needs_split: bool,
        last_edge: bool,
    ) -> CodegenResult<()> {
        let label = self.block_labels[target_idx as usize];
        if matches!(cond, BranchCond::Always) || !needs_split {
            self.move_to_phi_nodes(target)?;
            let fallthrough = last_edge && target_idx == self.cur_block + 1;
            if !fallthrough {
                self.backend.branch(&mut self.assembler, cond, label);
            }
        } else {
            // split the edge: skip the PHI copies when not taken
            let skip = self.backend.label_create();
            self.backend
                .branch(&mut self.assembler, cond.inverted(), skip);
            self.move_to_phi_nodes(target)?;
            self.backend
                .branch(&mut self.assembler, BranchCond::Always, label);
            self.backend.label_place(&mut self.assembler, skip);
        }
        Ok(())
    }

    fn phi_location(&mut self, phi: A::Value) -> CodegenResult<(ValLocalIdx, Loc)> {
        let local = self.local_of(phi);
        if !self.arena.has(local) {
            self.create_assignment(phi);
            // cross-block by construction; try to pin it to a register
            let bank = self.arena.get(local).parts[0].bank;
            if self.fixed_counts[bank.0 as usize] < self.backend.num_fixed_assignments(bank) {
                let reg = self.select_fixed_reg(bank);
                if reg.is_valid() {
                    if self.regfile.is_used(reg) {
                        self.evict_reg(reg);
                    }
                    self.regfile.mark_used(reg, local, 0);
                    self.regfile.mark_fixed(reg);
                    self.regfile.mark_clobbered(reg);
                    self.fixed_counts[bank.0 as usize] += 1;
                    let pa = &mut self.arena.get_mut(local).parts[0];
                    pa.reg = reg;
                    pa.set_fixed_assignment(true);
                }
            }
            if !self.arena.get(local).parts[0].reg.is_valid() {
                let size = u32::from(self.arena.get(local).parts[0].size);
                let off = self.frame.alloc(size, size);
                self.arena.get_mut(local).parts[0].frame_off = off;
            }
        }
        let part = self.arena.get(local).parts[0];
        let loc = if part.fixed_assignment() {
            Loc::Reg(part.reg)
        } else {
            if part.frame_off == 0 {
                // the PHI was first touched at its own block (irreducible
                // entry); give it its canonical slot now
                let size = u32::from(part.size);
                let off = self.frame.alloc(size, size);
                self.arena.get_mut(local).parts[0].frame_off = off;
            }
            Loc::Stack(self.arena.get(local).parts[0].frame_off)
        };
        Ok((local, loc))
    }

    fn cur_loc(&self, local: ValLocalIdx) -> Loc {
        let part = self.arena.get(local).parts[0];
        if part.reg.is_valid() {
            Loc::Reg(part.reg)
        } else {
            Loc::Stack(part.frame_off)
        }
    }

    /// Copy incoming values into the PHIs of `target` for the edge from
    /// the current block, in parallel-copy order: copies whose
    /// destination is not also a pending source go first, cycles are
    /// rotated through a scratch register.
    fn move_to_phi_nodes(&mut self, target: A::Block) -> CodegenResult<()> {
        let cur_ref = self.analyzer.block_layout[self.cur_block as usize];
        let phis: SmallVec<[A::Value; 4]> = self.adaptor.block_phis(target).collect();
        if phis.is_empty() {
            return Ok(());
        }

        let mut copies: SmallVec<[PhiCopy; 4]> = SmallVec::new();
        for phi in phis {
            let slot_count = self.adaptor.phi_incoming_count(phi);
            let mut src = None;
            for slot in 0..slot_count {
                if self.adaptor.phi_incoming_block(phi, slot) == cur_ref {
                    src = Some(self.adaptor.phi_incoming_val(phi, slot));
                    break;
                }
            }
            let Some(src) = src else {
                debug_assert!(false, "PHI without incoming value for this edge");
                continue;
            };
            let (dst_local, dst_loc) = self.phi_location(phi)?;
            let src_local = self.local_of(src);
            debug_assert!(self.arena.has(src_local), "PHI input {src:?} undefined");

            if src_local == dst_local {
                // self-loop input: nothing to copy
                self.dec_refs(src_local);
                self.dec_refs(dst_local);
                continue;
            }

            let part = self.arena.get(dst_local).parts[0];
            copies.push(PhiCopy {
                dst_local,
                dst_loc,
                size: u32::from(part.size),
                bank: part.bank,
                src_local,
                src_loc: self.cur_loc(src_local),
                src_override: None,
                done: false,
            });
        }

        let mut remaining = copies.len();
        let mut scratches: SmallVec<[Reg; 2]> = SmallVec::new();
        while remaining > 0 {
            let mut progressed = false;
            for i in 0..copies.len() {
                if copies[i].done {
                    continue;
                }
                let dst_loc = copies[i].dst_loc;
                let blocked = copies
                    .iter()
                    .enumerate()
                    .any(|(j, c)| j != i && !c.done && c.src_override.is_none() && c.src_loc == dst_loc);
                if blocked {
                    continue;
                }
                self.emit_phi_copy(i, &mut copies)?;
                remaining -= 1;
                progressed = true;
            }
            if remaining == 0 {
                break;
            }
            if !progressed {
                // rotate a cycle: preserve one destination in a scratch
                let idx = copies.iter().position(|c| !c.done).unwrap();
                let dst_loc = copies[idx].dst_loc;
                let bank = copies[idx].bank;
                let size = copies[idx].size;
                let scratch = self.alloc_scratch(bank)?;
                match dst_loc {
                    Loc::Reg(r) => self.backend.mov(&mut self.assembler, scratch, r, size),
                    Loc::Stack(off) => {
                        self.backend.reload(&mut self.assembler, scratch, off, size)
                    }
                }
                scratches.push(scratch);
                for c in copies.iter_mut() {
                    if !c.done && c.src_loc == dst_loc {
                        c.src_override = Some(scratch);
                    }
                }
            }
        }
        for scratch in scratches {
            self.free_scratch(scratch);
        }
        Ok(())
    }

    fn emit_phi_copy(
        &mut self,
        i: usize,
        copies: &mut SmallVec<[PhiCopy; 4]>,
    ) -> CodegenResult<()> {
        let (dst_local, dst_loc, size, bank, src_local, src_override) = {
            let c = &copies[i];
            (c.dst_local, c.dst_loc, c.size, c.bank, c.src_local, c.src_override)
        };

        match dst_loc {
            Loc::Reg(dr) => {
                if let Some(sr) = src_override {
                    self.backend.mov(&mut self.assembler, dr, sr, size);
                } else {
                    let part = self.arena.get(src_local).parts[0];
                    if part.reg.is_valid() {
                        if part.reg != dr {
                            self.backend.mov(&mut self.assembler, dr, part.reg, size);
                        }
                    } else if part.variable_ref() {
                        let alloca_size = self.arena.get(src_local).alloca_size;
                        self.backend
                            .load_stack_addr(&mut self.assembler, dr, part.frame_off, alloca_size);
                    } else {
                        self.backend
                            .reload(&mut self.assembler, dr, part.frame_off, size);
                    }
                }
                self.regfile.mark_clobbered(dr);
            }
            Loc::Stack(off) => {
                // writing the slot invalidates any stale register binding
                let stale = self.arena.get(dst_local).parts[0].reg;
                if stale.is_valid() && !self.arena.get(dst_local).parts[0].fixed_assignment() {
                    self.regfile.unmark_used(stale);
                    self.arena.get_mut(dst_local).parts[0].reg = Reg::invalid();
                }

                let sr = if let Some(sr) = src_override {
                    sr
                } else {
                    let part = self.arena.get(src_local).parts[0];
                    if part.reg.is_valid() {
                        part.reg
                    } else {
                        let tmp = self.alloc_scratch(bank)?;
                        if part.variable_ref() {
                            let alloca_size = self.arena.get(src_local).alloca_size;
                            self.backend.load_stack_addr(
                                &mut self.assembler,
                                tmp,
                                part.frame_off,
                                alloca_size,
                            );
                        } else {
                            self.backend
                                .reload(&mut self.assembler, tmp, part.frame_off, size);
                        }
                        self.backend.spill(&mut self.assembler, tmp, off, size);
                        self.free_scratch(tmp);
                        let pa = &mut self.arena.get_mut(dst_local).parts[0];
                        pa.set_stack_valid(true);
                        pa.set_modified(false);
                        self.dec_refs(src_local);
                        self.dec_refs(dst_local);
                        copies[i].done = true;
                        return Ok(());
                    }
                };
                self.backend.spill(&mut self.assembler, sr, off, size);
                let pa = &mut self.arena.get_mut(dst_local).parts[0];
                pa.set_stack_valid(true);
                pa.set_modified(false);
            }
        }

        self.dec_refs(src_local);
        self.dec_refs(dst_local);
        copies[i].done = true;
        Ok(())
    }

    // --- calls and returns ------------------------------------------------

    /// Move the function result (if any) into its convention register and
    /// emit the epilogue.
    pub fn gen_return(&mut self, value: Option<A::Value>) -> CodegenResult<()> {
        if let Some(value) = value {
            let mut cc = self.backend.new_cc();
            let local = self.local_of(value);
            let part = self.arena.get(local).parts[0];
            let mut cca = CCAssignment::new(part.bank, u32::from(part.size));
            cc.assign_ret(&mut cca);
            self.move_val_into_reg(value, cca.reg)?;
        }
        self.backend.gen_epilogue(&mut self.assembler);
        Ok(())
    }

    fn move_val_into_reg(&mut self, value: A::Value, target: Reg) -> CodegenResult<()> {
        let local = self.local_of(value);
        let part = self.arena.get(local).parts[0];
        let size = u32::from(part.size);

        if part.reg != target {
            if self.regfile.is_used(target) {
                debug_assert!(
                    !self.regfile.is_fixed(target),
                    "target register is pinned"
                );
                self.evict_reg(target);
            }
            if part.reg.is_valid() {
                self.backend.mov(&mut self.assembler, target, part.reg, size);
            } else if part.variable_ref() {
                let alloca_size = self.arena.get(local).alloca_size;
                self.backend
                    .load_stack_addr(&mut self.assembler, target, part.frame_off, alloca_size);
            } else {
                debug_assert!(part.stack_valid());
                self.backend
                    .reload(&mut self.assembler, target, part.frame_off, size);
            }
        }
        self.dec_refs(local);
        Ok(())
    }

    /// Compile a call: spill caller-saved residents, place arguments,
    /// emit the call, and bind the result.
    pub fn gen_call(
        &mut self,
        target: CallTarget<A::Value>,
        args: &[A::Value],
        result: Option<A::Value>,
    ) -> CodegenResult<()> {
        let mut cc = self.backend.new_cc();

        struct Place<V> {
            value: V,
            cca: CCAssignment,
        }
        let mut places: SmallVec<[Place<A::Value>; 8]> = SmallVec::new();
        for &value in args {
            let local = self.local_of(value);
            let part = self.arena.get(local).parts[0];
            let mut cca = CCAssignment::new(part.bank, u32::from(part.size));
            cc.assign_arg(&mut cca);
            places.push(Place { value, cca });
        }

        self.spill_for_call();

        let stack_size = cc.stack_size();
        let cookie = if stack_size > 0 {
            Some(self.backend.begin_call_stack(&mut self.assembler))
        } else {
            None
        };

        let mut placed: SmallVec<[Reg; 8]> = SmallVec::new();
        for place in &places {
            if place.cca.reg.is_valid() {
                self.move_val_into_reg(place.value, place.cca.reg)?;
                if !self.regfile.is_used(place.cca.reg) {
                    self.regfile.mark_used(place.cca.reg, ValLocalIdx::NONE, 0);
                    self.regfile.mark_fixed(place.cca.reg);
                    placed.push(place.cca.reg);
                }
            }
        }
        let callee_saved = self.backend.cc_info().callee_saved_regs;
        for place in &places {
            if !place.cca.reg.is_valid() {
                let local = self.local_of(place.value);
                let size = u32::from(self.arena.get(local).parts[0].size);
                let reg = self.load_part(local, 0)?;
                self.backend
                    .store_stack_arg(&mut self.assembler, reg, place.cca.stack_off, size);
                // a binding created here in a caller-saved register would
                // go stale across the call
                if reg.mask() & callee_saved == 0 {
                    let part_idx = self.regfile.reg_part(reg) as usize;
                    let part = &self.arena.get(local).parts[part_idx];
                    debug_assert!(part.stack_valid() || part.variable_ref());
                    self.arena.get_mut(local).parts[part_idx].reg = Reg::invalid();
                    self.regfile.unmark_used(reg);
                }
                self.dec_refs(local);
            }
        }

        let sub = cookie
            .map(|c| self.backend.finish_call_stack(&mut self.assembler, c, stack_size));

        match target {
            CallTarget::Sym(sym) => self.backend.call_sym(&mut self.assembler, sym),
            CallTarget::Value(value) => {
                // the target was spilled with the other caller-saved
                // residents; bring it into the reserved scratch register
                let local = self.local_of(value);
                let part = self.arena.get(local).parts[0];
                let scratch = self.backend.scratch_reg();
                let reg = if part.reg.is_valid() {
                    part.reg
                } else {
                    debug_assert!(part.stack_valid() || part.variable_ref());
                    if part.variable_ref() {
                        let alloca_size = self.arena.get(local).alloca_size;
                        self.backend.load_stack_addr(
                            &mut self.assembler,
                            scratch,
                            part.frame_off,
                            alloca_size,
                        );
                    } else {
                        self.backend.reload(
                            &mut self.assembler,
                            scratch,
                            part.frame_off,
                            u32::from(part.size),
                        );
                    }
                    scratch
                };
                self.dec_refs(local);
                self.backend.call_reg(&mut self.assembler, reg);
            }
        }

        if let Some(sub) = sub {
            self.backend.restore_call_stack(&mut self.assembler, sub);
        }

        for reg in placed {
            self.regfile.unmark_fixed(reg);
            self.regfile.unmark_used(reg);
        }

        if let Some(result) = result {
            let local = self.local_of(result);
            self.create_assignment(result);
            let part = self.arena.get(local).parts[0];
            let mut cca = CCAssignment::new(part.bank, u32::from(part.size));
            cc.assign_ret(&mut cca);
            debug_assert!(cca.reg.is_valid());
            self.regfile.mark_used(cca.reg, local, 0);
            self.regfile.mark_clobbered(cca.reg);
            let pa = &mut self.arena.get_mut(local).parts[0];
            pa.reg = cca.reg;
            pa.set_modified(true);
            self.lock_reg(cca.reg);
            self.dec_refs(local);
        }
        Ok(())
    }

    fn spill_for_call(&mut self) {
        let cc = *self.backend.cc_info();
        let mask = self.regfile.used & self.regfile.allocatable & !cc.callee_saved_regs;
        for reg in RegisterFile::regs_in(mask) {
            let local = self.regfile.reg_local_idx(reg);
            if !local.is_some() {
                debug_assert!(false, "scratch register live across a call");
                continue;
            }
            let part = self.arena.get(local).parts[self.regfile.reg_part(reg) as usize];
            debug_assert!(
                !part.fixed_assignment(),
                "fixed assignment in a caller-saved register of a calling function"
            );
            self.evict_reg(reg);
        }
    }

    /// Materialize `value` as a fresh constant definition.
    pub fn def_const(&mut self, value: A::Value, constant: u64) -> CodegenResult<Reg> {
        let reg = self.def_val(value)?;
        let local = self.local_of(value);
        let part = self.arena.get(local).parts[0];
        self.backend.materialize_const(
            &mut self.assembler,
            reg,
            part.bank,
            u32::from(part.size),
            constant,
        );
        Ok(reg)
    }
}
