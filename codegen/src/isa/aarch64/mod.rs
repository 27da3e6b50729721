//! AArch64 back-end: AAPCS64 calling convention, branch emission with
//! veneers, and the patched prologue/epilogue policy.
//!
//! x16 and x17 are reserved for the whole function (permanent scratch and
//! the incoming-stack-argument base); the frame pointer is established by
//! every prologue and value slots are addressed `fp`-relative upwards.
//! Conditional branches reach ±1 MiB and test branches ±32 KiB, so the
//! text-growth hook splices veneer pools — a forward `B` over a block of
//! five-instruction indirect-jump stubs — whenever pending branches could
//! run out of reach.

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

/// X registers are flat ids 0..=30, SP is 31, V registers are 32..=63.
pub fn xreg(n: u8) -> Reg {
    debug_assert!(n < 31);
    Reg::new(n)
}

/// A V register.
pub fn vreg(n: u8) -> Reg {
    debug_assert!(n < 32);
    Reg::new(32 + n)
}

/// The frame pointer (x29).
pub fn fp_reg() -> Reg {
    Reg::new(29)
}

/// The link register (x30).
pub fn lr_reg() -> Reg {
    Reg::new(30)
}

/// The stack pointer.
pub fn sp_reg() -> Reg {
    Reg::new(31)
}

/// The permanent scratch register (x16, IP0). Reserved for the whole
/// function: constant materialization, veneers, and indirect call
/// targets go through it, so no value assignment ever names it.
pub fn scratch_reg() -> Reg {
    Reg::new(16)
}

/// The second reserved scratch (x17, IP1), used as the incoming stack
/// argument base.
pub fn tmp2_reg() -> Reg {
    Reg::new(17)
}

const fn bit(n: u8) -> u64 {
    1u64 << n
}

const GP_REGS: u64 = 0xffff_ffff;
const FP_REGS: u64 = 0xffff_ffff << 32;

const ALLOCATABLE: u64 = !(bit(31) | bit(29) | bit(16) | bit(17));

const CALLEE_SAVED: u64 = bit(19)
    | bit(20)
    | bit(21)
    | bit(22)
    | bit(23)
    | bit(24)
    | bit(25)
    | bit(26)
    | bit(27)
    | bit(28)
    | bit(32 + 8)
    | bit(32 + 9)
    | bit(32 + 10)
    | bit(32 + 11)
    | bit(32 + 12)
    | bit(32 + 13)
    | bit(32 + 14)
    | bit(32 + 15);

const ARG_REGS: u64 = 0x1ff | (0xffu64 << 32);
const RESULT_REGS: u64 = 0xff | (0xffu64 << 32);

const CC_INFO: CCInfo = CCInfo {
    allocatable_regs: ALLOCATABLE,
    callee_saved_regs: CALLEE_SAVED,
    arg_regs: ARG_REGS,
    result_regs: RESULT_REGS,
};

/// The AAPCS64 argument assigner.
///
/// NGRN/NSRN/NSAA terminology follows the procedure call standard: next
/// general-purpose register, next SIMD register, next stack argument
/// address.
pub struct CCAssignerAapcs {
    ngrn: u32,
    nsrn: u32,
    nsaa: u32,
    ret_ngrn: u32,
    ret_nsrn: u32,
}

impl CCAssignerAapcs {
    /// Fresh state for one signature.
    pub fn new() -> Self {
        Self {
            ngrn: 0,
            nsrn: 0,
            nsaa: 0,
            ret_ngrn: 0,
            ret_nsrn: 0,
        }
    }
}

impl Default for CCAssignerAapcs {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(x: u32, to: u32) -> u32 {
    (x + to - 1) & !(to - 1)
}

impl CCAssigner for CCAssignerAapcs {
    fn info(&self) -> &CCInfo {
        &CC_INFO
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if arg.byval {
            self.nsaa = align_up(self.nsaa, arg.byval_align.max(8));
            arg.stack_off = self.nsaa;
            self.nsaa += arg.byval_size;
            return;
        }
        if arg.sret {
            arg.reg = xreg(8);
            return;
        }
        if arg.bank == GP_BANK {
            if arg.align > 8 {
                // 16-byte-aligned arguments start at an even register
                self.ngrn = align_up(self.ngrn, 2);
            }
            if self.ngrn + arg.consecutive < 8 {
                arg.reg = xreg(self.ngrn as u8);
                self.ngrn += 1;
            } else {
                self.ngrn = 8;
                self.nsaa = align_up(self.nsaa, arg.align.max(8));
                arg.stack_off = self.nsaa;
                self.nsaa += 8;
            }
        } else if self.nsrn + arg.consecutive < 8 {
            arg.reg = vreg(self.nsrn as u8);
            self.nsrn += 1;
        } else {
            self.nsrn = 8;
            let size = align_up(arg.size, 8);
            self.nsaa = align_up(self.nsaa, size);
            arg.stack_off = self.nsaa;
            self.nsaa += size;
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        debug_assert!(!ret.byval && !ret.sret);
        if ret.bank == GP_BANK {
            if ret.align > 8 {
                self.ret_ngrn = align_up(self.ret_ngrn, 2);
            }
            debug_assert!(self.ret_ngrn + ret.consecutive < 8);
            ret.reg = xreg(self.ret_ngrn as u8);
            self.ret_ngrn += 1;
        } else {
            debug_assert!(self.ret_nsrn + ret.consecutive < 8);
            ret.reg = vreg(self.ret_nsrn as u8);
            self.ret_nsrn += 1;
        }
    }

    fn stack_size(&self) -> u32 {
        self.nsaa
    }
}

/// Branch-form kinds of pending label fixups; each has a different reach
/// and veneer strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum FixupKind {
    Br = 0,
    CondBr = 1,
    TestBr = 2,
    JumpTable = 3,
}

impl FixupKind {
    fn from_u8(v: u8) -> FixupKind {
        match v {
            0 => FixupKind::Br,
            1 => FixupKind::CondBr,
            2 => FixupKind::TestBr,
            _ => FixupKind::JumpTable,
        }
    }
}

const COND_BR_RANGE: u32 = 1024 * 1024;
const TEST_BR_RANGE: u32 = 32 * 1024;
const VENEER_INSTS: u32 = 5;

struct VeneerPool {
    off: u32,
    insts_used: u16,
    max_insts: u16,
    kind: FixupKind,
}

struct FuncState {
    sym: SymRef,
    start_off: u32,
    prologue_alloc: u32,
    epilogue_alloc: u32,
    ret_offs: SmallVec<[u32; 8]>,
    arg_stack_patch: Option<u32>,
    dyn_alloca: bool,
    reg_save_off: u32,
}

/// The AArch64 back-end.
pub struct A64Backend {
    labels: LabelTable,
    veneers: Vec<VeneerPool>,
    unresolved_cond_brs: u32,
    unresolved_test_brs: u32,
    last_cond_veneer_off: u32,
    text_overflowed: bool,
    func: Option<FuncState>,
}

impl A64Backend {
    /// Create the back-end.
    pub fn new() -> Self {
        Self {
            labels: LabelTable::new(),
            veneers: Vec::new(),
            unresolved_cond_brs: 0,
            unresolved_test_brs: 0,
            last_cond_veneer_off: 0,
            text_overflowed: false,
            func: None,
        }
    }

    fn func(&mut self) -> &mut FuncState {
        self.func.as_mut().expect("no function in progress")
    }

    fn emit(&mut self, asm: &mut Assembler, inst: u32) {
        self.ensure_text(asm, 4);
        asm.text_write_u32(inst);
    }

    /// `add`/`sub sp`-class immediate that may use the shifted-by-12
    /// form for 4 KiB-aligned frames.
    fn enc_frame_add(r: u8, n: u8, frame: u32, sub: bool) -> u32 {
        if frame < 0x1000 {
            if sub {
                enc_sub_imm(r, n, frame, false)
            } else {
                enc_add_imm(r, n, frame, false)
            }
        } else {
            debug_assert_eq!(frame & 0xfff, 0);
            if sub {
                enc_sub_imm(r, n, frame >> 12, true)
            } else {
                enc_add_imm(r, n, frame >> 12, true)
            }
        }
    }

    fn dw_reg(reg: Reg) -> u8 {
        if reg.bank() == GP_BANK {
            reg.hw_enc()
        } else {
            // DWARF numbers v0 at 64 on AArch64
            64 + reg.hw_enc()
        }
    }

    /// Emit a `.rodata`-based load for constants too wide for move
    /// sequences: `ADRP` + `LDR q` against an anonymous literal.
    pub fn materialize_wide_const(&mut self, asm: &mut Assembler, dst: Reg, data: &[u8; 16]) {
        debug_assert!(dst.bank() == FP_BANK);
        let rodata = asm.sec_rodata;
        let sym = asm.sym_def_data(rodata, "", data, 16, crate::assembler::SymBinding::Local);
        self.ensure_text(asm, 8);
        asm.reloc_text(
            sym,
            object::elf::R_AARCH64_ADR_PREL_PG_HI21,
            u64::from(asm.text_cur_off()),
            0,
        );
        asm.text_write_u32(enc_adrp(scratch_reg().hw_enc(), 0));
        asm.reloc_text(
            sym,
            object::elf::R_AARCH64_LDST128_ABS_LO12_NC,
            u64::from(asm.text_cur_off()),
            0,
        );
        asm.text_write_u32(enc_ldst_fp(true, dst.hw_enc(), scratch_reg().hw_enc(), 0, 16));
    }

    /// Emit a jump table: a label per entry, each a 32-bit offset
    /// relative to the table start.
    pub fn emit_jump_table(&mut self, asm: &mut Assembler, table: Label, targets: &[Label]) {
        self.ensure_text(asm, (4 + 4 * targets.len()) as u32);
        self.label_place(asm, table);
        let table_off = asm.text_cur_off();
        for (i, &target) in targets.iter().enumerate() {
            let entry_off = table_off + 4 * i as u32;
            if self.labels.is_pending(target) {
                // stash the table base in the entry until resolution
                asm.text_write_u32(table_off);
                self.labels
                    .add_fixup(target, entry_off, FixupKind::JumpTable as u8);
            } else {
                let diff = self.labels.offset(target) as i32 - table_off as i32;
                asm.text_write_u32(diff as u32);
            }
        }
    }

    fn frame_addressable(
        &mut self,
        asm: &mut Assembler,
        frame_off: u32,
        size: u32,
    ) -> (u8, u32) {
        // slots are addressed fp-relative; offsets beyond the scaled
        // 12-bit range go through the permanent scratch
        if frame_off < 0x1000 * size {
            (fp_reg().hw_enc(), frame_off)
        } else {
            self.emit(
                asm,
                enc_add_imm(
                    scratch_reg().hw_enc(),
                    fp_reg().hw_enc(),
                    (frame_off & !0xfff) >> 12,
                    true,
                ),
            );
            (scratch_reg().hw_enc(), frame_off & 0xfff)
        }
    }
}

impl Default for A64Backend {
    fn default() -> Self {
        Self::new()
    }
}

const CIE_INITIAL: &[u8] = &[
    // DW_CFA_def_cfa sp, 0
    0x0c, 31, 0,
];

impl Backend for A64Backend {
    type CC = CCAssignerAapcs;

    fn target_info() -> TargetInfo {
        TargetInfo {
            elf_machine: object::elf::EM_AARCH64,
            eh_code_align: 4,
            eh_ra_reg: 30,
            eh_initial_instrs: CIE_INITIAL,
            reloc_pc32: object::elf::R_AARCH64_PREL32,
        }
    }

    fn cc_info(&self) -> &CCInfo {
        &CC_INFO
    }

    fn new_cc(&self) -> CCAssignerAapcs {
        CCAssignerAapcs::new()
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
            5
        } else {
            6
        }
    }

    fn fixed_nonallocatable_mask(&self) -> u64 {
        // keep the first result pair free for exception paths
        bit(0) | bit(1)
    }

    fn scratch_reg(&self) -> Reg {
        scratch_reg()
    }

    fn ensure_text(&mut self, asm: &mut Assembler, n: u32) {
        if asm.text_space_left() >= n as usize {
            return;
        }
        if asm.text_cur_off() >= 128 * 1024 * 1024 {
            // a single text section must stay within B's reach; keep
            // growing so writes stay in bounds and report the overflow
            // when the function is finished
            self.text_overflowed = true;
        }

        let cur_off = asm.text_cur_off();
        let mut veneer_size = 0u32;

        // test branches only reach 32 KiB, which is barely more than one
        // growth chunk: spill a pool for them on every grow
        if self.unresolved_test_brs > 0 {
            self.veneers.push(VeneerPool {
                off: cur_off + 4,
                insts_used: 0,
                max_insts: (self.unresolved_test_brs * VENEER_INSTS) as u16,
                kind: FixupKind::TestBr,
            });
            veneer_size += self.unresolved_test_brs * VENEER_INSTS * 4;
            self.unresolved_test_brs = 0;
        }

        if self.unresolved_cond_brs > 0
            && cur_off.saturating_sub(self.last_cond_veneer_off)
                >= COND_BR_RANGE - 16 * 1024 - veneer_size
        {
            let off = cur_off + 4 + veneer_size;
            self.veneers.push(VeneerPool {
                off,
                insts_used: 0,
                max_insts: (self.unresolved_cond_brs * VENEER_INSTS) as u16,
                kind: FixupKind::CondBr,
            });
            veneer_size += self.unresolved_cond_brs * VENEER_INSTS * 4;
            self.unresolved_cond_brs = 0;
            self.last_cond_veneer_off = off;
        }

        asm.text_ensure_space((n + veneer_size + 4) as usize);
        if veneer_size != 0 {
            // jump over the pool; the slots are patched when labels land
            asm.text_write_u32(enc_b(((4 + veneer_size) / 4) as i32));
            asm.text_skip(veneer_size as usize);
        }
    }

    fn mov(&mut self, asm: &mut Assembler, dst: Reg, src: Reg, size: u32) {
        debug_assert!(dst.is_valid() && src.is_valid());
        let inst = match (dst.bank() == GP_BANK, src.bank() == GP_BANK) {
            (true, true) => enc_mov_reg(size > 4, dst.hw_enc(), src.hw_enc()),
            (false, false) => enc_mov_vec(dst.hw_enc(), src.hw_enc()),
            (true, false) => enc_fmov_gp_fp(false, size > 4, dst.hw_enc(), src.hw_enc()),
            (false, true) => enc_fmov_gp_fp(true, size > 4, dst.hw_enc(), src.hw_enc()),
        };
        self.emit(asm, inst);
    }

    fn spill(&mut self, asm: &mut Assembler, reg: Reg, frame_off: u32, size: u32) {
        let (base, off) = self.frame_addressable(asm, frame_off, size);
        let inst = if reg.bank() == GP_BANK {
            enc_ldst_gp(false, reg.hw_enc(), base, off, size)
        } else {
            enc_ldst_fp(false, reg.hw_enc(), base, off, size)
        };
        self.emit(asm, inst);
    }

    fn reload(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, size: u32) {
        let (base, off) = self.frame_addressable(asm, frame_off, size);
        let inst = if dst.bank() == GP_BANK {
            enc_ldst_gp(true, dst.hw_enc(), base, off, size)
        } else {
            enc_ldst_fp(true, dst.hw_enc(), base, off, size)
        };
        self.emit(asm, inst);
    }

    fn load_stack_addr(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, _size: u32) {
        // slots grow upward from the frame pointer, so the allocation
        // offset is the address
        if frame_off < 0x1000 {
            self.emit(asm, enc_add_imm(dst.hw_enc(), fp_reg().hw_enc(), frame_off, false));
        } else {
            self.materialize_const(asm, dst, GP_BANK, 8, u64::from(frame_off));
            self.emit(
                asm,
                enc_add_reg(dst.hw_enc(), fp_reg().hw_enc(), dst.hw_enc(), 0),
            );
        }
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
                self.emit(asm, enc_movi_zero(dst.hw_enc()));
                return;
            }
            // route through the permanent scratch
            self.materialize_const(asm, scratch_reg(), GP_BANK, size.min(8), value);
            self.emit(asm, enc_fmov_gp_fp(true, size > 4, dst.hw_enc(), scratch_reg().hw_enc()));
            return;
        }

        let sf = size > 4;
        let value = if sf { value } else { value & 0xffff_ffff };
        let chunk_count: u8 = if sf { 4 } else { 2 };
        let r = dst.hw_enc();

        let chunks: [u16; 4] = [
            value as u16,
            (value >> 16) as u16,
            (value >> 32) as u16,
            (value >> 48) as u16,
        ];
        let zeros = chunks[..chunk_count as usize].iter().filter(|&&c| c == 0).count();
        let ones = chunks[..chunk_count as usize]
            .iter()
            .filter(|&&c| c == 0xffff)
            .count();

        self.ensure_text(asm, 4 * u32::from(chunk_count));
        if ones > zeros {
            // MOVN seeds the register with ones, MOVK patches the rest
            let mut first = true;
            for hw in 0..chunk_count {
                let c = chunks[hw as usize];
                if first {
                    if c != 0xffff {
                        asm.text_write_u32(enc_movn(sf, r, !c, hw));
                        first = false;
                    }
                } else if c != 0xffff {
                    asm.text_write_u32(enc_movk(sf, r, c, hw));
                }
            }
            if first {
                asm.text_write_u32(enc_movn(sf, r, 0, 0));
            }
        } else {
            let mut first = true;
            for hw in 0..chunk_count {
                let c = chunks[hw as usize];
                if c == 0 {
                    continue;
                }
                if first {
                    asm.text_write_u32(enc_movz(sf, r, c, hw));
                    first = false;
                } else {
                    asm.text_write_u32(enc_movk(sf, r, c, hw));
                }
            }
            if first {
                asm.text_write_u32(enc_movz(sf, r, 0, 0));
            }
        }
    }

    fn emit_alu(&mut self, asm: &mut Assembler, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) {
        let (d, n, m) = (dst.hw_enc(), lhs.hw_enc(), rhs.hw_enc());
        let inst = match op {
            AluOp::Add => enc_add_reg(d, n, m, 0),
            AluOp::Sub => enc_sub_reg(d, n, m),
            AluOp::Mul => enc_madd(d, n, m, 31),
            AluOp::And => enc_and_reg(d, n, m),
            AluOp::Or => enc_orr_reg(d, n, m),
            AluOp::Xor => enc_eor_reg(d, n, m),
        };
        self.emit(asm, inst);
    }

    fn expr_addr(&mut self, asm: &mut Assembler, dst: Reg, expr: &AddrExpr) {
        let d = dst.hw_enc();
        match (expr.base, expr.index) {
            (None, None) => {
                self.materialize_const(asm, dst, GP_BANK, 8, expr.disp as u64);
                return;
            }
            (None, Some(index)) => {
                if expr.scale.is_power_of_two() {
                    self.emit(asm, enc_lsl_imm(d, index.hw_enc(), expr.scale.trailing_zeros() as u8));
                } else {
                    self.materialize_const(
                        asm,
                        scratch_reg(),
                        GP_BANK,
                        8,
                        u64::from(expr.scale),
                    );
                    self.emit(asm, enc_madd(d, index.hw_enc(), scratch_reg().hw_enc(), 31));
                }
            }
            (Some(base), Some(index)) => {
                if expr.scale.is_power_of_two() {
                    self.emit(
                        asm,
                        enc_add_reg(d, base.hw_enc(), index.hw_enc(), expr.scale.trailing_zeros() as u8),
                    );
                } else {
                    self.materialize_const(
                        asm,
                        scratch_reg(),
                        GP_BANK,
                        8,
                        u64::from(expr.scale),
                    );
                    self.emit(
                        asm,
                        enc_madd(d, index.hw_enc(), scratch_reg().hw_enc(), base.hw_enc()),
                    );
                }
            }
            (Some(base), None) => {
                if expr.disp != 0 && (0..0x1000).contains(&expr.disp) {
                    self.emit(asm, enc_add_imm(d, base.hw_enc(), expr.disp as u32, false));
                    return;
                }
                if d != base.hw_enc() {
                    self.emit(asm, enc_mov_reg(true, d, base.hw_enc()));
                }
            }
        }
        if expr.disp != 0 {
            if (0..0x1000).contains(&expr.disp) {
                self.emit(asm, enc_add_imm(d, d, expr.disp as u32, false));
            } else {
                self.materialize_const(asm, scratch_reg(), GP_BANK, 8, expr.disp as u64);
                self.emit(asm, enc_add_reg(d, d, scratch_reg().hw_enc(), 0));
            }
        }
    }

    fn load_mem(&mut self, asm: &mut Assembler, dst: Reg, addr: Reg, size: u32) {
        let inst = if dst.bank() == GP_BANK {
            enc_ldst_gp(true, dst.hw_enc(), addr.hw_enc(), 0, size)
        } else {
            enc_ldst_fp(true, dst.hw_enc(), addr.hw_enc(), 0, size)
        };
        self.emit(asm, inst);
    }

    fn store_mem(&mut self, asm: &mut Assembler, src: Reg, addr: Reg, size: u32) {
        let inst = if src.bank() == GP_BANK {
            enc_ldst_gp(false, src.hw_enc(), addr.hw_enc(), 0, size)
        } else {
            enc_ldst_fp(false, src.hw_enc(), addr.hw_enc(), 0, size)
        };
        self.emit(asm, inst);
    }

    fn label_create(&mut self) -> Label {
        self.labels.create()
    }

    fn label_place(&mut self, asm: &mut Assembler, label: Label) {
        let place_off = asm.text_cur_off();
        let veneers = &mut self.veneers;
        let unresolved_cond_brs = &mut self.unresolved_cond_brs;
        let unresolved_test_brs = &mut self.unresolved_test_brs;
        let last_cond_veneer_off = self.last_cond_veneer_off;

        self.labels.place(label, place_off, |fixup| {
            let diff = place_off as i64 - i64::from(fixup.text_off);
            debug_assert!(diff >= 0);
            debug_assert!(diff < 128 * 1024 * 1024);
            match FixupKind::from_u8(fixup.kind) {
                FixupKind::Br => {
                    asm.text_patch_u32(fixup.text_off, enc_b((diff / 4) as i32));
                }
                FixupKind::CondBr => {
                    if diff < i64::from(COND_BR_RANGE) {
                        let inst = asm.text_read_u32(fixup.text_off);
                        asm.text_patch_u32(fixup.text_off, patch_imm19(inst, (diff / 4) as i32));
                        // a branch without a pool after it is still
                        // counted as unresolved
                        if veneers.is_empty() || last_cond_veneer_off < fixup.text_off {
                            debug_assert!(*unresolved_cond_brs > 0);
                            *unresolved_cond_brs -= 1;
                        }
                    } else {
                        patch_through_veneer(
                            asm,
                            veneers,
                            fixup.text_off,
                            place_off,
                            FixupKind::CondBr,
                            patch_imm19,
                        );
                    }
                }
                FixupKind::TestBr => {
                    if diff < i64::from(TEST_BR_RANGE) {
                        let inst = asm.text_read_u32(fixup.text_off);
                        asm.text_patch_u32(fixup.text_off, patch_imm14(inst, (diff / 4) as i32));
                        if veneers.last().map_or(true, |v| v.off < fixup.text_off) {
                            debug_assert!(*unresolved_test_brs > 0);
                            *unresolved_test_brs -= 1;
                        }
                    } else {
                        patch_through_veneer(
                            asm,
                            veneers,
                            fixup.text_off,
                            place_off,
                            FixupKind::TestBr,
                            patch_imm14,
                        );
                    }
                }
                FixupKind::JumpTable => {
                    let table_off = asm.text_read_u32(fixup.text_off);
                    let diff = place_off as i32 - table_off as i32;
                    asm.text_patch_u32(fixup.text_off, diff as u32);
                }
            }
        });
    }

    fn branch(&mut self, asm: &mut Assembler, cond: BranchCond, label: Label) {
        self.ensure_text(asm, 12);
        let pending = self.labels.is_pending(label);
        match cond {
            BranchCond::Always => {
                if pending {
                    let off = asm.text_cur_off();
                    asm.text_write_u32(enc_b(0));
                    self.labels.add_fixup(label, off, FixupKind::Br as u8);
                } else {
                    let diff = asm.text_cur_off() as i64 - i64::from(self.labels.offset(label));
                    debug_assert!(diff >= 0 && diff < 128 * 1024 * 1024);
                    asm.text_write_u32(enc_b((-diff / 4) as i32));
                }
            }
            BranchCond::Zero(reg) | BranchCond::NonZero(reg) => {
                let nonzero = matches!(cond, BranchCond::NonZero(_));
                if pending {
                    let off = asm.text_cur_off();
                    asm.text_write_u32(enc_cbz(nonzero, reg.hw_enc(), 0));
                    self.labels.add_fixup(label, off, FixupKind::CondBr as u8);
                    self.unresolved_cond_brs += 1;
                } else {
                    let diff = asm.text_cur_off() as i64 - i64::from(self.labels.offset(label));
                    debug_assert!(diff >= 0);
                    if diff < i64::from(COND_BR_RANGE) {
                        asm.text_write_u32(enc_cbz(nonzero, reg.hw_enc(), (-diff / 4) as i32));
                    } else {
                        // out of reach backwards: invert over an
                        // unconditional branch
                        asm.text_write_u32(enc_cbz(!nonzero, reg.hw_enc(), 2));
                        asm.text_write_u32(enc_b(((-diff - 4) / 4) as i32));
                    }
                }
            }
            BranchCond::Cmp(lhs, rhs, cc) => {
                asm.text_write_u32(enc_cmp_reg(lhs.hw_enc(), rhs.hw_enc()));
                let cond = map_cond(cc);
                if pending {
                    let off = asm.text_cur_off();
                    asm.text_write_u32(enc_b_cond(cond, 0));
                    self.labels.add_fixup(label, off, FixupKind::CondBr as u8);
                    self.unresolved_cond_brs += 1;
                } else {
                    let diff = asm.text_cur_off() as i64 - i64::from(self.labels.offset(label));
                    debug_assert!(diff >= 0);
                    if diff < i64::from(COND_BR_RANGE) {
                        asm.text_write_u32(enc_b_cond(cond, (-diff / 4) as i32));
                    } else {
                        asm.text_write_u32(enc_b_cond(cond.invert(), 2));
                        asm.text_write_u32(enc_b(((-diff - 4) / 4) as i32));
                    }
                }
            }
            BranchCond::BitSet(reg, bit) | BranchCond::BitClear(reg, bit) => {
                let nonzero = matches!(cond, BranchCond::BitSet(..));
                if pending {
                    let off = asm.text_cur_off();
                    asm.text_write_u32(enc_tbz(nonzero, reg.hw_enc(), bit, 0));
                    self.labels.add_fixup(label, off, FixupKind::TestBr as u8);
                    self.unresolved_test_brs += 1;
                } else {
                    let diff = asm.text_cur_off() as i64 - i64::from(self.labels.offset(label));
                    debug_assert!(diff >= 0);
                    if diff < i64::from(TEST_BR_RANGE) {
                        asm.text_write_u32(enc_tbz(nonzero, reg.hw_enc(), bit, (-diff / 4) as i32));
                    } else {
                        asm.text_write_u32(enc_tbz(!nonzero, reg.hw_enc(), bit, 2));
                        asm.text_write_u32(enc_b(((-diff - 4) / 4) as i32));
                    }
                }
            }
        }
    }

    fn frame_reserved(&self, info: &FuncInfo) -> u32 {
        // fp/lr pair plus the callee-saved save area
        let mut reserved = 16 + align_up(10 * 8 + 8 * 8, 16);
        if info.is_vararg {
            // 8 GP registers, 8 Q registers, the stack-area pointer, and
            // padding
            reserved += 64 + 128 + 16;
        }
        reserved
    }

    fn begin_func(&mut self, asm: &mut Assembler, info: &FuncInfo) {
        // sub sp / stp fp,lr / mov fp,sp plus one stp per register pair
        let save_insts = (10 + 1) / 2 + (8 + 1) / 2;
        let prologue_alloc = 12 + 4 * save_insts;
        let mut epilogue_alloc = 12 + 4 * save_insts;
        if info.has_dynamic_alloca {
            epilogue_alloc += 4;
        }

        // veneer pools may be spliced here; only then is the function
        // start position final
        self.ensure_text(asm, prologue_alloc + 16 * 4);
        asm.text_align_16();
        let start_off = asm.text_cur_off();

        self.func = Some(FuncState {
            sym: info.sym,
            start_off,
            prologue_alloc,
            epilogue_alloc,
            ret_offs: SmallVec::new(),
            arg_stack_patch: None,
            dyn_alloca: info.has_dynamic_alloca,
            reg_save_off: 16 + align_up(10 * 8 + 8 * 8, 16),
        });

        asm.text_skip(prologue_alloc as usize);

        if info.is_vararg {
            // spill the whole argument register file so va_arg can walk
            // it; vector registers as D pairs (low halves only)
            let save_off = self.func().reg_save_off;
            for i in 0..4u32 {
                asm.text_write_u32(enc_ldp_stp_gp(
                    false,
                    (i * 2) as u8,
                    (i * 2 + 1) as u8,
                    31,
                    (save_off + i * 16) as i32,
                ));
            }
            for i in 0..4u32 {
                asm.text_write_u32(enc_ldp_stp_fp(
                    false,
                    (i * 2) as u8,
                    (i * 2 + 1) as u8,
                    31,
                    (save_off + 64 + i * 16) as i32,
                ));
            }
        }
    }

    fn load_arg_from_stack(&mut self, asm: &mut Assembler, dst: Reg, cca: &CCAssignment) {
        self.ensure_text(asm, 12);
        if self.func().arg_stack_patch.is_none() {
            // patched to `add x17, sp, #frame` once the frame is final
            let off = asm.text_cur_off();
            asm.text_write_u32(enc_add_imm(tmp2_reg().hw_enc(), 31, 0, false));
            self.func().arg_stack_patch = Some(off);
        }
        let base = tmp2_reg().hw_enc();
        if cca.byval {
            asm.text_write_u32(enc_add_imm(dst.hw_enc(), base, cca.stack_off, false));
        } else if cca.bank == GP_BANK {
            asm.text_write_u32(enc_ldst_gp(true, dst.hw_enc(), base, cca.stack_off, cca.size));
        } else {
            asm.text_write_u32(enc_ldst_fp(true, dst.hw_enc(), base, cca.stack_off, cca.size));
        }
    }

    fn gen_epilogue(&mut self, asm: &mut Assembler) {
        let alloc = self.func().epilogue_alloc;
        // reserve before taking the offset: the growth hook may splice a
        // veneer pool first
        self.ensure_text(asm, alloc);
        let off = asm.text_skip(alloc as usize);
        self.func().ret_offs.push(off);
    }

    fn finish_func(
        &mut self,
        asm: &mut Assembler,
        clobbered: u64,
        frame_size: u32,
    ) -> CodegenResult<()> {
        let st = self.func.take().expect("no function in progress");
        if self.text_overflowed {
            return Err(CodegenError::TextTooLarge);
        }
        let saved = clobbered & CALLEE_SAVED;

        let mut final_frame = align_up(frame_size, 16);
        if final_frame > 4095 {
            final_frame = align_up(final_frame, 4096);
            if final_frame >= 16 * 1024 * 1024 {
                return Err(CodegenError::FrameTooLarge(final_frame));
            }
        }

        let fde = asm.eh_begin_fde();

        let stack_base: u8 = if st.dyn_alloca { 29 } else { 31 };
        let saved_list: SmallVec<[Reg; 18]> =
            crate::regfile::RegisterFile::regs_in(saved).collect();

        // assemble the prologue; NB code alignment factor 4, data
        // alignment factor -8
        let mut prologue: SmallVec<[u32; 16]> = SmallVec::new();
        prologue.push(Self::enc_frame_add(31, 31, final_frame, true));
        prologue.push(enc_ldp_stp_gp(false, 29, 30, 31, 0));
        prologue.push(enc_mov_sp(29, 31));
        emit_reg_saves(&mut prologue, &saved_list, stack_base, false);

        debug_assert!(prologue.len() * 4 <= st.prologue_alloc as usize);

        // stream the frame rules as the prologue establishes them
        asm.eh_write_inst(dw::DW_CFA_advance_loc, 1);
        asm.eh_write_inst(dw::DW_CFA_def_cfa_offset, u64::from(final_frame));
        asm.eh_write_inst(dw::DW_CFA_advance_loc, 2);
        asm.eh_write_inst(dw::DW_CFA_def_cfa_register, 29);
        asm.eh_write_inst2(dw::DW_CFA_offset, 29, u64::from(final_frame / 8));
        asm.eh_write_inst2(dw::DW_CFA_offset, 30, u64::from(final_frame / 8 - 1));
        if !saved_list.is_empty() {
            asm.eh_write_inst(dw::DW_CFA_advance_loc, (prologue.len() - 3) as u64);
            // each saved register occupies the next 8-byte slot above the
            // frame linkage
            for (k, &reg) in saved_list.iter().enumerate() {
                let frame_off = 16 + 8 * k as u32;
                let dw_reg = Self::dw_reg(reg);
                let cfa_off = u64::from((final_frame - frame_off) / 8);
                if dw_reg < 0x40 {
                    asm.eh_write_inst2(dw::DW_CFA_offset, u64::from(dw_reg), cfa_off);
                } else {
                    asm.eh_write_inst2(dw::DW_CFA_offset_extended, u64::from(dw_reg), cfa_off);
                }
            }
        }

        // pad so the unused prologue space stays 16-byte aligned and
        // shrink the function at its start
        let nop_count = (st.prologue_alloc as usize / 4 - prologue.len()) % 4;
        for _ in 0..nop_count {
            prologue.push(enc_nop());
        }
        let shift = (st.prologue_alloc as usize - prologue.len() * 4) & !15;
        let func_start = st.start_off + shift as u32;
        for (i, &inst) in prologue.iter().enumerate() {
            asm.text_patch_u32(func_start + 4 * i as u32, inst);
        }

        if let Some(off) = st.arg_stack_patch {
            asm.text_patch_u32(off, Self::enc_frame_add(17, 31, final_frame, false));
        }

        // epilogue template: with dynamic allocas the stack pointer is
        // rewound from the frame pointer first so the save area is
        // addressable again
        let mut epilogue: SmallVec<[u32; 16]> = SmallVec::new();
        if st.dyn_alloca {
            epilogue.push(enc_mov_sp(31, 29));
        } else {
            epilogue.push(enc_ldp_stp_gp(true, 29, 30, 31, 0));
        }
        emit_reg_saves(&mut epilogue, &saved_list, stack_base, true);
        if st.dyn_alloca {
            epilogue.push(enc_ldp_stp_gp(true, 29, 30, 31, 0));
        }
        epilogue.push(Self::enc_frame_add(31, 31, final_frame, false));
        epilogue.push(enc_ret());
        debug_assert!(epilogue.len() * 4 <= st.epilogue_alloc as usize);

        for &ret_off in &st.ret_offs {
            for (i, &inst) in epilogue.iter().enumerate() {
                asm.text_patch_u32(ret_off + 4 * i as u32, inst);
            }
        }

        // the final return can give back its unused reserved space
        if let Some(&last_ret) = st.ret_offs.last() {
            if last_ret + st.epilogue_alloc == asm.text_cur_off() {
                asm.text_shrink_to(last_ret + epilogue.len() as u32 * 4);
            }
        }

        let func_size = asm.text_cur_off() - func_start;
        let text = asm.sec_text;
        asm.sym_def(st.sym, text, u64::from(func_start), u64::from(func_size));
        asm.eh_end_fde(fde, st.sym);
        Ok(())
    }

    fn begin_call_stack(&mut self, asm: &mut Assembler) -> u32 {
        self.ensure_text(asm, 4);
        asm.text_skip(4)
    }

    fn finish_call_stack(&mut self, asm: &mut Assembler, cookie: u32, stack_size: u32) -> u32 {
        let sub = align_up(stack_size, if stack_size < 0x1000 { 16 } else { 0x1000 });
        asm.text_patch_u32(cookie, Self::enc_frame_add(31, 31, sub, true));
        sub
    }

    fn store_stack_arg(&mut self, asm: &mut Assembler, reg: Reg, off: u32, size: u32) {
        let inst = if reg.bank() == GP_BANK {
            enc_ldst_gp(false, reg.hw_enc(), 31, off, size)
        } else {
            enc_ldst_fp(false, reg.hw_enc(), 31, off, size)
        };
        self.emit(asm, inst);
    }

    fn restore_call_stack(&mut self, asm: &mut Assembler, amount: u32) {
        self.emit(asm, Self::enc_frame_add(31, 31, amount, false));
    }

    fn call_sym(&mut self, asm: &mut Assembler, sym: SymRef) {
        self.emit(asm, enc_bl(0));
        asm.reloc_text(
            sym,
            object::elf::R_AARCH64_CALL26,
            u64::from(asm.text_cur_off() - 4),
            0,
        );
    }

    fn call_reg(&mut self, asm: &mut Assembler, reg: Reg) {
        self.emit(asm, enc_blr(reg.hw_enc()));
    }

    fn emit_tls_addr(&mut self, asm: &mut Assembler, sym: SymRef, dst: Reg) {
        // general-dynamic TLSDESC sequence; clobbers x0/x1 like a call
        self.ensure_text(asm, 6 * 4);
        let off = u64::from(asm.text_cur_off());
        asm.reloc_text(sym, object::elf::R_AARCH64_TLSDESC_ADR_PAGE21, off, 0);
        asm.text_write_u32(enc_adrp(0, 0));
        asm.reloc_text(sym, object::elf::R_AARCH64_TLSDESC_LD64_LO12, off + 4, 0);
        asm.text_write_u32(enc_ldst_gp(true, 1, 0, 0, 8));
        asm.reloc_text(sym, object::elf::R_AARCH64_TLSDESC_ADD_LO12, off + 8, 0);
        asm.text_write_u32(enc_add_imm(0, 0, 0, false));
        asm.reloc_text(sym, object::elf::R_AARCH64_TLSDESC_CALL, off + 12, 0);
        asm.text_write_u32(enc_blr(1));
        asm.text_write_u32(enc_mrs_tpidr(scratch_reg().hw_enc()));
        asm.text_write_u32(enc_add_reg(dst.hw_enc(), scratch_reg().hw_enc(), 0, 0));
    }

    fn reset(&mut self) {
        self.labels.clear();
        self.veneers.clear();
        self.unresolved_cond_brs = 0;
        self.unresolved_test_brs = 0;
        self.last_cond_veneer_off = 0;
        self.text_overflowed = false;
        self.func = None;
    }
}

/// Condition-code mapping onto the `B.cond` encodings.
fn map_cond(cc: CondCode) -> Cond {
    match cc {
        CondCode::Eq => Cond::Eq,
        CondCode::Ne => Cond::Ne,
        CondCode::Lt => Cond::Lt,
        CondCode::Le => Cond::Le,
        CondCode::Gt => Cond::Gt,
        CondCode::Ge => Cond::Ge,
        CondCode::ULt => Cond::Cc,
        CondCode::ULe => Cond::Ls,
        CondCode::UGt => Cond::Hi,
        CondCode::UGe => Cond::Cs,
    }
}

/// Emit `stp`/`ldp` pairs (plus a trailing single store/load for odd
/// counts or a bank straddle) covering `saved`, one 8-byte slot per
/// register starting at frame offset 16.
fn emit_reg_saves(out: &mut SmallVec<[u32; 16]>, saved: &[Reg], base: u8, load: bool) {
    let mut k = 0;
    while k < saved.len() {
        let frame_off = (16 + 8 * k) as u32;
        let reg = saved[k];
        if k + 1 < saved.len() && saved[k + 1].bank() == reg.bank() {
            let next = saved[k + 1];
            out.push(if reg.bank() == GP_BANK {
                enc_ldp_stp_gp(load, reg.hw_enc(), next.hw_enc(), base, frame_off as i32)
            } else {
                enc_ldp_stp_fp(load, reg.hw_enc(), next.hw_enc(), base, frame_off as i32)
            });
            k += 2;
        } else {
            out.push(if reg.bank() == GP_BANK {
                enc_ldst_gp(load, reg.hw_enc(), base, frame_off, 8)
            } else {
                enc_ldst_fp(load, reg.hw_enc(), base, frame_off, 8)
            });
            k += 1;
        }
    }
}

/// Route a branch through the nearest veneer pool after it and patch the
/// branch at the pool's next free stub.
fn patch_through_veneer(
    asm: &mut Assembler,
    veneers: &mut [VeneerPool],
    branch_off: u32,
    target_off: u32,
    kind: FixupKind,
    patch: fn(u32, i32) -> u32,
) {
    let pool = veneers
        .iter_mut()
        .find(|v| v.off >= branch_off && v.kind == kind)
        .expect("no veneer pool in reach of an out-of-range branch");
    debug_assert!(u32::from(pool.insts_used) + VENEER_INSTS <= u32::from(pool.max_insts));

    let stub_off = pool.off + u32::from(pool.insts_used) * 4;
    // adr x16, .+16 ; ldr w17, .+12 ; add x16, x16, x17 ; br x16 ; <off>
    asm.text_patch_u32(stub_off, enc_adr(16, 16));
    asm.text_patch_u32(stub_off + 4, enc_ldr_lit_w(17, 3));
    asm.text_patch_u32(stub_off + 8, enc_add_reg(16, 16, 17, 0));
    asm.text_patch_u32(stub_off + 12, enc_br(16));
    let const_off = stub_off + 16;
    asm.text_patch_u32(const_off, target_off.wrapping_sub(const_off));
    pool.insts_used += VENEER_INSTS as u16;

    let inst = asm.text_read_u32(branch_off);
    asm.text_patch_u32(branch_off, patch(inst, ((stub_off - branch_off) / 4) as i32));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::SymBinding;

    #[test]
    fn tls_descriptor_sequence() {
        let mut asm = Assembler::new(A64Backend::target_info());
        let mut backend = A64Backend::new();
        let sym = asm.sym_add_undef("tls_var", SymBinding::Global);

        backend.emit_tls_addr(&mut asm, sym, xreg(2));
        // adrp, ldr, add, blr, mrs, add
        assert_eq!(asm.text_cur_off(), 24);

        let relocs = &asm.sections[asm.sec_text].relocs;
        let kinds: Vec<u32> = relocs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                object::elf::R_AARCH64_TLSDESC_ADR_PAGE21,
                object::elf::R_AARCH64_TLSDESC_LD64_LO12,
                object::elf::R_AARCH64_TLSDESC_ADD_LO12,
                object::elf::R_AARCH64_TLSDESC_CALL,
            ]
        );
        assert!(relocs.iter().all(|r| r.sym == sym));
    }

    #[test]
    fn comparison_and_test_branches_use_the_full_form_set() {
        let mut asm = Assembler::new(A64Backend::target_info());
        let mut backend = A64Backend::new();

        // forward comparison branch: cmp + b.lt placeholder
        let target = backend.label_create();
        backend.branch(&mut asm, BranchCond::Cmp(xreg(0), xreg(1), CondCode::Lt), target);
        assert_eq!(asm.text_read_u32(0), enc_cmp_reg(0, 1));
        assert_eq!(asm.text_read_u32(4) & 0xff00_000f, 0x5400_0000 | Cond::Lt as u32);

        // forward bit-test branch: tbnz placeholder, counted for veneers
        let target2 = backend.label_create();
        backend.branch(&mut asm, BranchCond::BitSet(xreg(3), 5), target2);
        assert_eq!(asm.text_read_u32(8), enc_tbz(true, 3, 5, 0));
        assert_eq!(backend.unresolved_test_brs, 1);
        assert_eq!(backend.unresolved_cond_brs, 1);

        // placing the labels patches the branch offsets
        backend.label_place(&mut asm, target);
        backend.label_place(&mut asm, target2);
        let place = asm.text_cur_off();
        assert_eq!((asm.text_read_u32(4) >> 5) & 0x7_ffff, (place - 4) / 4);
        assert_eq!((asm.text_read_u32(8) >> 5) & 0x3fff, (place - 8) / 4);
    }
}
