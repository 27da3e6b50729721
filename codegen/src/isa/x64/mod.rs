//! x86-64 back-end: System V calling convention and the end-patched
//! `push rbp`-style prologue.
//!
//! Value slots are addressed `rbp`-relative below the callee-saved push
//! area. Prologue bytes are written at function end once the clobbered
//! callee-saved set is known, and the entry label is moved forward so
//! small functions do not execute padding nops. All label fixups are
//! rel32 fields, which reach anywhere in a 2 GiB text section, so no
//! veneers are needed.

pub mod encode;

use gimli::constants as dw;
use smallvec::SmallVec;

use crate::assembler::{Assembler, Label, LabelTable, SymRef, TargetInfo};
use crate::error::{CodegenError, CodegenResult};
use crate::isa::{
    AddrExpr, AluOp, Backend, BranchCond, CCAssigner, CCAssignment, CCInfo, CondCode, FuncInfo,
};
use crate::regfile::{Reg, RegBank, FP_BANK, GP_BANK};

use encode::*;

/// A GP register by hardware encoding (0 = rax, 4 = rsp, 5 = rbp, ...).
pub fn gpr(n: u8) -> Reg {
    debug_assert!(n < 16);
    Reg::new(n)
}

/// An XMM register.
pub fn xmm(n: u8) -> Reg {
    debug_assert!(n < 16);
    Reg::new(32 + n)
}

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R11: u8 = 11;

const fn bit(n: u8) -> u64 {
    1u64 << n
}

const GP_REGS: u64 = 0xffff;
const FP_REGS: u64 = 0xffff << 32;

/// rsp and rbp carry the frame, r11 is the permanent scratch.
const ALLOCATABLE: u64 =
    (GP_REGS & !(bit(RSP) | bit(RBP) | bit(R11))) | FP_REGS;

const CALLEE_SAVED: u64 = bit(RBX) | bit(12) | bit(13) | bit(14) | bit(15);

const ARG_GP: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

const ARG_REGS: u64 = bit(RDI)
    | bit(RSI)
    | bit(RDX)
    | bit(RCX)
    | bit(R8)
    | bit(R9)
    | bit(32)
    | bit(33)
    | bit(34)
    | bit(35)
    | bit(36)
    | bit(37)
    | bit(38)
    | bit(39);

const RESULT_REGS: u64 = bit(RAX) | bit(RDX) | bit(32) | bit(33);

const CC_INFO: CCInfo = CCInfo {
    allocatable_regs: ALLOCATABLE,
    callee_saved_regs: CALLEE_SAVED,
    arg_regs: ARG_REGS,
    result_regs: RESULT_REGS,
};

/// The System V AMD64 argument assigner. Arguments come pre-classified
/// into eightbytes by the client (the part split); integer eightbytes
/// take the next GP argument register, vector eightbytes the next XMM
/// register, and everything else goes to the stack in 8-byte slots.
pub struct CCAssignerSysV {
    next_gp: u32,
    next_fp: u32,
    stack: u32,
    ret_gp: u32,
    ret_fp: u32,
    /// Vector registers used so far; a vararg caller mirrors this into
    /// `%al` before the call.
    pub vector_count: u32,
}

impl CCAssignerSysV {
    /// Fresh state for one signature.
    pub fn new() -> Self {
        Self {
            next_gp: 0,
            next_fp: 0,
            stack: 0,
            ret_gp: 0,
            ret_fp: 0,
            vector_count: 0,
        }
    }
}

impl Default for CCAssignerSysV {
    fn default() -> Self {
        Self::new()
    }
}

impl CCAssigner for CCAssignerSysV {
    fn info(&self) -> &CCInfo {
        &CC_INFO
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if arg.byval {
            let align = arg.byval_align.max(8);
            self.stack = (self.stack + align - 1) & !(align - 1);
            arg.stack_off = self.stack;
            self.stack += (arg.byval_size + 7) & !7;
            return;
        }
        if arg.bank == GP_BANK {
            if (self.next_gp as usize) < ARG_GP.len() {
                arg.reg = gpr(ARG_GP[self.next_gp as usize]);
                self.next_gp += 1;
                return;
            }
        } else if self.next_fp < 8 {
            arg.reg = xmm(self.next_fp as u8);
            self.next_fp += 1;
            self.vector_count += 1;
            return;
        }
        arg.stack_off = self.stack;
        self.stack += 8;
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        if ret.bank == GP_BANK {
            debug_assert!(self.ret_gp < 2);
            ret.reg = gpr([RAX, RDX][self.ret_gp as usize]);
            self.ret_gp += 1;
        } else {
            debug_assert!(self.ret_fp < 2);
            ret.reg = xmm(self.ret_fp as u8);
            self.ret_fp += 1;
        }
    }

    fn stack_size(&self) -> u32 {
        self.stack
    }
}

const FIXUP_REL32: u8 = 0;
const FIXUP_TABLE32: u8 = 1;

/// Map hardware encodings to DWARF register numbers.
const DWARF_GP: [u8; 16] = [0, 2, 1, 3, 7, 6, 4, 5, 8, 9, 10, 11, 12, 13, 14, 15];

struct FuncState {
    sym: SymRef,
    start_off: u32,
    prologue_alloc: u32,
    epilogue_alloc: u32,
    ret_offs: SmallVec<[u32; 8]>,
}

const PROLOGUE_ALLOC: u32 = 32;
const EPILOGUE_ALLOC: u32 = 20;

/// The x86-64 back-end.
pub struct X64Backend {
    labels: LabelTable,
    func: Option<FuncState>,
    tls_get_addr: Option<SymRef>,
}

impl X64Backend {
    /// Create the back-end.
    pub fn new() -> Self {
        Self {
            labels: LabelTable::new(),
            func: None,
            tls_get_addr: None,
        }
    }

    fn func(&mut self) -> &mut FuncState {
        self.func.as_mut().expect("no function in progress")
    }

    fn emit(&mut self, asm: &mut Assembler, inst: EncodedInst) {
        asm.text_ensure_space(inst.len());
        asm.text_write_unchecked(&inst);
    }

    /// Translate an abstract frame offset into an rbp displacement: the
    /// slot of `size` bytes at `frame_off` lives below the push area.
    fn frame_disp(frame_off: u32, size: u32) -> i32 {
        -((frame_off + size) as i32)
    }

    /// Set `%al` to the number of vector registers a vararg call uses.
    pub fn emit_vararg_count(&mut self, asm: &mut Assembler, count: u32) {
        self.emit(asm, enc_mov_imm32(RAX, count.min(8)));
    }

    /// Emit a jump table of 32-bit offsets relative to the table start.
    pub fn emit_jump_table(&mut self, asm: &mut Assembler, table: Label, targets: &[Label]) {
        asm.text_ensure_space(4 * targets.len());
        self.label_place(asm, table);
        let table_off = asm.text_cur_off();
        for (i, &target) in targets.iter().enumerate() {
            let entry_off = table_off + 4 * i as u32;
            if self.labels.is_pending(target) {
                asm.text_write_unchecked(&table_off.to_le_bytes());
                self.labels.add_fixup(target, entry_off, FIXUP_TABLE32);
            } else {
                let diff = self.labels.offset(target) as i32 - table_off as i32;
                asm.text_write_unchecked(&diff.to_le_bytes());
            }
        }
    }

    fn emit_branch_insn(&mut self, asm: &mut Assembler, cond: BranchCond, rel: i32) -> u32 {
        // returns the offset of the rel32 field
        match cond {
            BranchCond::Always => {
                self.emit(asm, enc_jmp_rel32(rel));
                asm.text_cur_off() - 4
            }
            BranchCond::Zero(r) | BranchCond::NonZero(r) => {
                let cc = if matches!(cond, BranchCond::Zero(_)) {
                    Cc::E
                } else {
                    Cc::Ne
                };
                self.emit(asm, enc_test_rr(r.hw_enc(), r.hw_enc()));
                self.emit(asm, enc_jcc_rel32(cc, rel));
                asm.text_cur_off() - 4
            }
            BranchCond::Cmp(lhs, rhs, cc) => {
                self.emit(asm, enc_cmp_rr(lhs.hw_enc(), rhs.hw_enc()));
                self.emit(asm, enc_jcc_rel32(map_cc(cc), rel));
                asm.text_cur_off() - 4
            }
            BranchCond::BitSet(r, bit) | BranchCond::BitClear(r, bit) => {
                // bt leaves the tested bit in CF
                let cc = if matches!(cond, BranchCond::BitSet(..)) {
                    Cc::B
                } else {
                    Cc::B.invert()
                };
                self.emit(asm, enc_bt_imm(r.hw_enc(), bit));
                self.emit(asm, enc_jcc_rel32(cc, rel));
                asm.text_cur_off() - 4
            }
        }
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        Self::new()
    }
}

const CIE_INITIAL: &[u8] = &[
    // DW_CFA_def_cfa rsp, 8; DW_CFA_offset ra, 1
    0x0c, 7, 8, 0x80 | 16, 1,
];

/// Condition-code mapping onto the `Jcc` encodings.
fn map_cc(cc: CondCode) -> Cc {
    match cc {
        CondCode::Eq => Cc::E,
        CondCode::Ne => Cc::Ne,
        CondCode::Lt => Cc::L,
        CondCode::Le => Cc::Le,
        CondCode::Gt => Cc::G,
        CondCode::Ge => Cc::Ge,
        CondCode::ULt => Cc::B,
        CondCode::ULe => Cc::Be,
        CondCode::UGt => Cc::A,
        CondCode::UGe => Cc::Ae,
    }
}

impl Backend for X64Backend {
    type CC = CCAssignerSysV;

    fn target_info() -> TargetInfo {
        TargetInfo {
            elf_machine: object::elf::EM_X86_64,
            eh_code_align: 1,
            eh_ra_reg: 16,
            eh_initial_instrs: CIE_INITIAL,
            reloc_pc32: object::elf::R_X86_64_PC32,
        }
    }

    fn cc_info(&self) -> &CCInfo {
        &CC_INFO
    }

    fn new_cc(&self) -> CCAssignerSysV {
        CCAssignerSysV::new()
    }

    fn bank_regs(&self, bank: RegBank) -> u64 {
        if bank == GP_BANK {
            GP_REGS
        } else {
            FP_REGS
        }
    }

    fn num_fixed_assignments(&self, bank: RegBank) -> u32 {
        if bank == GP_BANK {
            4
        } else {
            6
        }
    }

    fn fixed_nonallocatable_mask(&self) -> u64 {
        bit(RAX) | bit(RDX)
    }

    fn scratch_reg(&self) -> Reg {
        gpr(R11)
    }

    fn ensure_text(&mut self, asm: &mut Assembler, n: u32) {
        asm.text_ensure_space(n as usize);
    }

    fn mov(&mut self, asm: &mut Assembler, dst: Reg, src: Reg, size: u32) {
        debug_assert!(dst.is_valid() && src.is_valid());
        let inst = match (dst.bank() == GP_BANK, src.bank() == GP_BANK) {
            (true, true) => {
                if size > 4 {
                    enc_mov_rr(dst.hw_enc(), src.hw_enc())
                } else {
                    enc_mov_rr32(dst.hw_enc(), src.hw_enc())
                }
            }
            (false, false) => enc_mov_fp(dst.hw_enc(), src.hw_enc()),
            (true, false) => enc_movq_gp_fp(false, src.hw_enc(), dst.hw_enc()),
            (false, true) => enc_movq_gp_fp(true, dst.hw_enc(), src.hw_enc()),
        };
        self.emit(asm, inst);
    }

    fn spill(&mut self, asm: &mut Assembler, reg: Reg, frame_off: u32, size: u32) {
        let disp = Self::frame_disp(frame_off, size);
        let inst = if reg.bank() == GP_BANK {
            enc_store_gp(reg.hw_enc(), RBP, disp, size)
        } else {
            enc_store_fp(reg.hw_enc(), RBP, disp, size)
        };
        self.emit(asm, inst);
    }

    fn reload(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, size: u32) {
        let disp = Self::frame_disp(frame_off, size);
        let inst = if dst.bank() == GP_BANK {
            enc_load_gp(dst.hw_enc(), RBP, disp, size)
        } else {
            enc_load_fp(dst.hw_enc(), RBP, disp, size)
        };
        self.emit(asm, inst);
    }

    fn load_stack_addr(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, size: u32) {
        // slots grow downward from rbp: the slot's lowest byte sits at
        // rbp - (frame_off + size)
        let inst = enc_lea(dst.hw_enc(), RBP, Self::frame_disp(frame_off, size));
        self.emit(asm, inst);
    }

    fn materialize_const(
        &mut self,
        asm: &mut Assembler,
        dst: Reg,
        bank: RegBank,
        size: u32,
        value: u64,
    ) {
        if bank == FP_BANK {
            if value == 0 {
                self.emit(asm, enc_xorps(dst.hw_enc()));
                return;
            }
            self.materialize_const(asm, self.scratch_reg(), GP_BANK, size.min(8), value);
            self.emit(asm, enc_movq_gp_fp(true, dst.hw_enc(), R11));
            return;
        }
        let r = dst.hw_enc();
        if size <= 4 || value <= u64::from(u32::MAX) {
            self.emit(asm, enc_mov_imm32(r, value as u32));
        } else if (value as i64) == i64::from(value as i32) {
            self.emit(asm, enc_mov_imm32s(r, value as i32));
        } else {
            self.emit(asm, enc_mov_imm64(r, value));
        }
    }

    fn emit_alu(&mut self, asm: &mut Assembler, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) {
        // dst == rhs is only tolerable when no copy is needed
        debug_assert!(dst != rhs || dst == lhs);
        if dst != lhs {
            self.mov(asm, dst, lhs, 8);
        }
        let inst = match op {
            AluOp::Add => enc_alu_rr(0x01, dst.hw_enc(), rhs.hw_enc()),
            AluOp::Sub => enc_alu_rr(0x29, dst.hw_enc(), rhs.hw_enc()),
            AluOp::And => enc_alu_rr(0x21, dst.hw_enc(), rhs.hw_enc()),
            AluOp::Or => enc_alu_rr(0x09, dst.hw_enc(), rhs.hw_enc()),
            AluOp::Xor => enc_alu_rr(0x31, dst.hw_enc(), rhs.hw_enc()),
            AluOp::Mul => enc_imul_rr(dst.hw_enc(), rhs.hw_enc()),
        };
        self.emit(asm, inst);
    }

    fn expr_addr(&mut self, asm: &mut Assembler, dst: Reg, expr: &AddrExpr) {
        let disp32 = i32::try_from(expr.disp).ok();
        match (expr.base, expr.index, disp32) {
            (_, Some(_), _) if !matches!(expr.scale, 1 | 2 | 4 | 8) => {
                // scale outside the SIB forms: shift/multiply into the
                // scratch first
                let index = expr.index.unwrap();
                self.materialize_const(asm, self.scratch_reg(), GP_BANK, 8, u64::from(expr.scale));
                self.emit(asm, enc_imul_rr(R11, index.hw_enc()));
                let folded = AddrExpr {
                    base: expr.base,
                    index: Some(self.scratch_reg()),
                    scale: 1,
                    disp: expr.disp,
                };
                self.expr_addr(asm, dst, &folded);
            }
            (Some(base), Some(index), Some(disp)) => {
                self.emit(
                    asm,
                    enc_lea_sib(dst.hw_enc(), Some(base.hw_enc()), index.hw_enc(), expr.scale, disp),
                );
            }
            (None, Some(index), Some(disp)) => {
                self.emit(
                    asm,
                    enc_lea_sib(dst.hw_enc(), None, index.hw_enc(), expr.scale, disp),
                );
            }
            (Some(base), None, Some(disp)) => {
                self.emit(asm, enc_lea(dst.hw_enc(), base.hw_enc(), disp));
            }
            (None, None, _) => {
                self.materialize_const(asm, dst, GP_BANK, 8, expr.disp as u64);
            }
            _ => {
                // displacement beyond imm32: one extra constant load and
                // an add
                self.materialize_const(asm, self.scratch_reg(), GP_BANK, 8, expr.disp as u64);
                let folded = AddrExpr {
                    disp: 0,
                    ..*expr
                };
                self.expr_addr(asm, dst, &folded);
                self.emit(asm, enc_alu_rr(0x01, dst.hw_enc(), R11));
            }
        }
    }

    fn load_mem(&mut self, asm: &mut Assembler, dst: Reg, addr: Reg, size: u32) {
        let inst = if dst.bank() == GP_BANK {
            enc_load_gp(dst.hw_enc(), addr.hw_enc(), 0, size)
        } else {
            enc_load_fp(dst.hw_enc(), addr.hw_enc(), 0, size)
        };
        self.emit(asm, inst);
    }

    fn store_mem(&mut self, asm: &mut Assembler, src: Reg, addr: Reg, size: u32) {
        let inst = if src.bank() == GP_BANK {
            enc_store_gp(src.hw_enc(), addr.hw_enc(), 0, size)
        } else {
            enc_store_fp(src.hw_enc(), addr.hw_enc(), 0, size)
        };
        self.emit(asm, inst);
    }

    fn label_create(&mut self) -> Label {
        self.labels.create()
    }

    fn label_place(&mut self, asm: &mut Assembler, label: Label) {
        let place_off = asm.text_cur_off();
        self.labels.place(label, place_off, |fixup| match fixup.kind {
            FIXUP_REL32 => {
                let rel = place_off as i64 - i64::from(fixup.text_off) - 4;
                asm.text_patch(fixup.text_off, &(rel as i32).to_le_bytes());
            }
            _ => {
                let table_off = asm.text_read_u32(fixup.text_off);
                let diff = place_off as i32 - table_off as i32;
                asm.text_patch_u32(fixup.text_off, diff as u32);
            }
        });
    }

    fn branch(&mut self, asm: &mut Assembler, cond: BranchCond, label: Label) {
        asm.text_ensure_space(16);
        if self.labels.is_pending(label) {
            let field = self.emit_branch_insn(asm, cond, 0);
            self.labels.add_fixup(label, field, FIXUP_REL32);
        } else {
            // rel32 is relative to the end of the branch instruction;
            // emit with a provisional offset, then fix it against the
            // actual field position
            let target = self.labels.offset(label);
            let field = self.emit_branch_insn(asm, cond, 0);
            let rel = target as i64 - i64::from(field) - 4;
            asm.text_patch(field, &(rel as i32).to_le_bytes());
        }
    }

    fn frame_reserved(&self, info: &FuncInfo) -> u32 {
        let mut reserved = 8 * 5;
        if info.is_vararg {
            // GP register save area for va_arg
            reserved += 8 * 6;
        }
        reserved
    }

    fn begin_func(&mut self, asm: &mut Assembler, info: &FuncInfo) {
        let start_off = asm.text_cur_off();
        self.func = Some(FuncState {
            sym: info.sym,
            start_off,
            prologue_alloc: PROLOGUE_ALLOC,
            epilogue_alloc: EPILOGUE_ALLOC,
            ret_offs: SmallVec::new(),
        });
        asm.text_skip(PROLOGUE_ALLOC as usize);

        if info.is_vararg {
            // spill the GP argument registers below the push area where
            // va_arg expects them; the XMM half of the save area is only
            // partially handled
            for (i, &reg) in ARG_GP.iter().enumerate() {
                let disp = Self::frame_disp((40 + 8 * i) as u32, 8);
                let inst = enc_store_gp(reg, RBP, disp, 8);
                self.emit(asm, inst);
            }
        }
    }

    fn load_arg_from_stack(&mut self, asm: &mut Assembler, dst: Reg, cca: &CCAssignment) {
        // incoming stack arguments start above the saved rbp and the
        // return address
        let disp = (16 + cca.stack_off) as i32;
        let inst = if cca.byval {
            enc_lea(dst.hw_enc(), RBP, disp)
        } else if cca.bank == GP_BANK {
            enc_load_gp(dst.hw_enc(), RBP, disp, cca.size)
        } else {
            enc_load_fp(dst.hw_enc(), RBP, disp, cca.size)
        };
        self.emit(asm, inst);
    }

    fn gen_epilogue(&mut self, asm: &mut Assembler) {
        let off = asm.text_cur_off();
        asm.text_skip(EPILOGUE_ALLOC as usize);
        self.func().ret_offs.push(off);
    }

    fn finish_func(
        &mut self,
        asm: &mut Assembler,
        clobbered: u64,
        frame_size: u32,
    ) -> CodegenResult<()> {
        let st = self.func.take().expect("no function in progress");
        let saved: SmallVec<[Reg; 8]> =
            crate::regfile::RegisterFile::regs_in(clobbered & CALLEE_SAVED).collect();

        let frame = (frame_size + 15) & !15;
        if frame >= i32::MAX as u32 {
            return Err(CodegenError::FrameTooLarge(frame));
        }
        let sub_amount = frame as i32 - 8 * (saved.len() as i32 + 1) + 8;

        let fde = asm.eh_begin_fde();

        // assemble the prologue into a byte buffer, streaming the CFA
        // rules alongside (code alignment factor 1, data alignment -8)
        let mut prologue: SmallVec<[u8; 32]> = SmallVec::new();
        prologue.extend_from_slice(&enc_push(RBP));
        asm.eh_write_inst(dw::DW_CFA_advance_loc, prologue.len() as u64);
        asm.eh_write_inst(dw::DW_CFA_def_cfa_offset, 16);
        asm.eh_write_inst2(dw::DW_CFA_offset, u64::from(DWARF_GP[RBP as usize]), 2);

        let mark = prologue.len();
        prologue.extend_from_slice(&enc_mov_rr(RBP, RSP));
        asm.eh_write_inst(dw::DW_CFA_advance_loc, (prologue.len() - mark) as u64);
        asm.eh_write_inst(dw::DW_CFA_def_cfa_register, u64::from(DWARF_GP[RBP as usize]));

        let mark = prologue.len();
        for reg in saved.iter() {
            prologue.extend_from_slice(&enc_push(reg.hw_enc()));
        }
        if sub_amount > 0 {
            prologue.extend_from_slice(&enc_alu_imm32(5, RSP, sub_amount));
        }
        if prologue.len() > mark {
            asm.eh_write_inst(dw::DW_CFA_advance_loc, (prologue.len() - mark) as u64);
            for (k, reg) in saved.iter().enumerate() {
                // the k-th push lands at cfa - 24 - 8k
                asm.eh_write_inst2(
                    dw::DW_CFA_offset,
                    u64::from(DWARF_GP[reg.hw_enc() as usize]),
                    3 + k as u64,
                );
            }
        }

        debug_assert!(prologue.len() <= st.prologue_alloc as usize);
        let shift = (st.prologue_alloc as usize - prologue.len()) & !15;
        let func_start = st.start_off + shift as u32;
        let pad = st.prologue_alloc as usize - shift - prologue.len();
        asm.text_patch(func_start, &prologue);
        for i in 0..pad {
            asm.text_patch(func_start + (prologue.len() + i) as u32, &[0x90]);
        }

        // epilogue: rewind rsp over the value area (also correct after
        // dynamic allocas), pop the saved registers, and return
        let mut epilogue: SmallVec<[u8; 24]> = SmallVec::new();
        epilogue.extend_from_slice(&enc_lea(RSP, RBP, -8 * saved.len() as i32));
        for reg in saved.iter().rev() {
            epilogue.extend_from_slice(&enc_pop(reg.hw_enc()));
        }
        epilogue.extend_from_slice(&enc_pop(RBP));
        epilogue.extend_from_slice(&enc_ret());
        debug_assert!(epilogue.len() <= st.epilogue_alloc as usize);

        for &ret_off in &st.ret_offs {
            asm.text_patch(ret_off, &epilogue);
            for i in epilogue.len()..st.epilogue_alloc as usize {
                asm.text_patch(ret_off + i as u32, &[0x90]);
            }
        }
        if let Some(&last_ret) = st.ret_offs.last() {
            if last_ret + st.epilogue_alloc == asm.text_cur_off() {
                asm.text_shrink_to(last_ret + epilogue.len() as u32);
            }
        }

        let func_size = asm.text_cur_off() - func_start;
        let text = asm.sec_text;
        asm.sym_def(st.sym, text, u64::from(func_start), u64::from(func_size));
        asm.eh_end_fde(fde, st.sym);
        Ok(())
    }

    fn begin_call_stack(&mut self, asm: &mut Assembler) -> u32 {
        asm.text_skip(7)
    }

    fn finish_call_stack(&mut self, asm: &mut Assembler, cookie: u32, stack_size: u32) -> u32 {
        let amount = (stack_size + 15) & !15;
        let inst = enc_alu_imm32(5, RSP, amount as i32);
        debug_assert_eq!(inst.len(), 7);
        asm.text_patch(cookie, &inst);
        amount
    }

    fn store_stack_arg(&mut self, asm: &mut Assembler, reg: Reg, off: u32, size: u32) {
        let inst = if reg.bank() == GP_BANK {
            enc_store_gp(reg.hw_enc(), RSP, off as i32, size)
        } else {
            enc_store_fp(reg.hw_enc(), RSP, off as i32, size)
        };
        self.emit(asm, inst);
    }

    fn restore_call_stack(&mut self, asm: &mut Assembler, amount: u32) {
        let inst = enc_alu_imm32(0, RSP, amount as i32);
        self.emit(asm, inst);
    }

    fn call_sym(&mut self, asm: &mut Assembler, sym: SymRef) {
        self.emit(asm, enc_call_rel32(0));
        asm.reloc_text(
            sym,
            object::elf::R_X86_64_PLT32,
            u64::from(asm.text_cur_off() - 4),
            -4,
        );
    }

    fn call_reg(&mut self, asm: &mut Assembler, reg: Reg) {
        self.emit(asm, enc_call_reg(reg.hw_enc()));
    }

    fn emit_tls_addr(&mut self, asm: &mut Assembler, sym: SymRef, dst: Reg) {
        // general-dynamic access through __tls_get_addr; clobbers the
        // caller-saved registers like any call
        let tls_get_addr = *self
            .tls_get_addr
            .get_or_insert_with(|| asm.sym_add_undef("__tls_get_addr", crate::assembler::SymBinding::Global));

        asm.text_ensure_space(16);
        // data16 lea rdi, [rip + sym@tlsgd]
        asm.text_write_unchecked(&[0x66, 0x48, 0x8d, 0x3d]);
        asm.reloc_text(
            sym,
            object::elf::R_X86_64_TLSGD,
            u64::from(asm.text_cur_off()),
            -4,
        );
        asm.text_write_unchecked(&[0, 0, 0, 0]);
        // data16 data16 rex.w call __tls_get_addr@plt
        asm.text_write_unchecked(&[0x66, 0x66, 0x48, 0xe8]);
        asm.reloc_text(
            tls_get_addr,
            object::elf::R_X86_64_PLT32,
            u64::from(asm.text_cur_off()),
            -4,
        );
        asm.text_write_unchecked(&[0, 0, 0, 0]);
        if dst.hw_enc() != RAX || dst.bank() != GP_BANK {
            self.mov(asm, dst, gpr(RAX), 8);
        }
    }

    fn reset(&mut self) {
        self.labels.clear();
        self.func = None;
        self.tls_get_addr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::SymBinding;

    #[test]
    fn tls_general_dynamic_sequence() {
        let mut asm = Assembler::new(X64Backend::target_info());
        let mut backend = X64Backend::new();
        let sym = asm.sym_add_undef("tls_var", SymBinding::Global);

        backend.emit_tls_addr(&mut asm, sym, gpr(RAX));
        // data16 lea + data16-padded call, result already in rax
        assert_eq!(asm.text_cur_off(), 16);

        let relocs = &asm.sections[asm.sec_text].relocs;
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[0].kind, object::elf::R_X86_64_TLSGD);
        assert_eq!(relocs[0].sym, sym);
        assert_eq!(relocs[1].kind, object::elf::R_X86_64_PLT32);
        assert_eq!(asm.sym_name(relocs[1].sym), "__tls_get_addr");
    }

    #[test]
    fn bit_test_branch_encoding() {
        // bt rdi, 3; jb -> 48 0f ba e7 03 0f 82 <rel32>
        assert_eq!(enc_bt_imm(RDI, 3).as_slice(), &[0x48, 0x0f, 0xba, 0xe7, 0x03]);
        // cmp rdi, rsi -> 48 39 f7
        assert_eq!(enc_cmp_rr(RDI, RSI).as_slice(), &[0x48, 0x39, 0xf7]);
    }
}
