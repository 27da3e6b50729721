//! Architecture back-ends.
//!
//! The engine is generic over the [`Backend`] trait: a back-end supplies
//! instruction encoding, the calling convention, register environment,
//! and the prologue/epilogue policy, while the compiler core owns value
//! assignment, register allocation, and branch/PHI resolution.
//!
//! Two back-ends are provided: [`x64`] (x86-64 System V) and [`aarch64`]
//! (AAPCS64).

pub mod aarch64;
pub mod x64;

use crate::assembler::{Assembler, Label, SymRef, TargetInfo};
use crate::error::CodegenResult;
use crate::regfile::{Reg, RegBank};

/// Static register environment of a calling convention.
#[derive(Clone, Copy, Debug)]
pub struct CCInfo {
    /// Registers the allocator may use at all.
    pub allocatable_regs: u64,
    /// Callee-saved registers.
    pub callee_saved_regs: u64,
    /// Argument (and result) registers, temporarily removed from the
    /// allocatable set while arguments are being moved into place.
    pub arg_regs: u64,
    /// Result registers of the convention.
    pub result_regs: u64,
}

/// One argument or return value going through the calling convention.
///
/// The caller fills the descriptive fields; the assigner fills `reg` or
/// `stack_off`.
#[derive(Clone, Copy, Debug)]
pub struct CCAssignment {
    /// Register bank of the part.
    pub bank: RegBank,
    /// Size of the part in bytes.
    pub size: u32,
    /// Required alignment (8 unless larger).
    pub align: u32,
    /// Number of follow-up parts that must land in consecutive registers
    /// (16-byte-aligned arguments round up to an even register pair).
    pub consecutive: u32,
    /// Structure-return pointer argument.
    pub sret: bool,
    /// Pass a copy of the pointed-to memory on the stack.
    pub byval: bool,
    /// Size of the byval copy.
    pub byval_size: u32,
    /// Alignment of the byval copy.
    pub byval_align: u32,
    /// Assigned register (invalid when passed on the stack).
    pub reg: Reg,
    /// Assigned stack offset when not in a register.
    pub stack_off: u32,
}

impl CCAssignment {
    /// A plain register-or-stack part of `size` bytes in `bank`.
    pub fn new(bank: RegBank, size: u32) -> Self {
        Self {
            bank,
            size,
            align: size.max(1),
            consecutive: 0,
            sret: false,
            byval: false,
            byval_size: 0,
            byval_align: 0,
            reg: Reg::invalid(),
            stack_off: 0,
        }
    }
}

/// Stateful argument/return assigner for one call or function signature.
pub trait CCAssigner {
    /// The register environment of this convention.
    fn info(&self) -> &CCInfo;
    /// Place the next argument.
    fn assign_arg(&mut self, arg: &mut CCAssignment);
    /// Place the next return value.
    fn assign_ret(&mut self, ret: &mut CCAssignment);
    /// Total stack space used by stack arguments so far.
    fn stack_size(&self) -> u32;
}

/// Two-register ALU operations the generic lowering layer can request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AluOp {
    /// Integer addition.
    Add,
    /// Integer subtraction.
    Sub,
    /// Integer multiplication.
    Mul,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
}

/// Relational condition of a two-register comparison branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CondCode {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Signed less than.
    Lt,
    /// Signed less than or equal.
    Le,
    /// Signed greater than.
    Gt,
    /// Signed greater than or equal.
    Ge,
    /// Unsigned less than.
    ULt,
    /// Unsigned less than or equal.
    ULe,
    /// Unsigned greater than.
    UGt,
    /// Unsigned greater than or equal.
    UGe,
}

impl CondCode {
    /// The opposite condition.
    pub fn inverted(self) -> CondCode {
        match self {
            CondCode::Eq => CondCode::Ne,
            CondCode::Ne => CondCode::Eq,
            CondCode::Lt => CondCode::Ge,
            CondCode::Ge => CondCode::Lt,
            CondCode::Le => CondCode::Gt,
            CondCode::Gt => CondCode::Le,
            CondCode::ULt => CondCode::UGe,
            CondCode::UGe => CondCode::ULt,
            CondCode::ULe => CondCode::UGt,
            CondCode::UGt => CondCode::ULe,
        }
    }

    /// Parse the source-syntax name (`eq`, `ne`, `lt`, `ult`, ...).
    pub fn from_name(name: &str) -> Option<CondCode> {
        Some(match name {
            "eq" => CondCode::Eq,
            "ne" => CondCode::Ne,
            "lt" => CondCode::Lt,
            "le" => CondCode::Le,
            "gt" => CondCode::Gt,
            "ge" => CondCode::Ge,
            "ult" => CondCode::ULt,
            "ule" => CondCode::ULe,
            "ugt" => CondCode::UGt,
            "uge" => CondCode::UGe,
            _ => return None,
        })
    }

    /// The source-syntax name.
    pub fn name(self) -> &'static str {
        match self {
            CondCode::Eq => "eq",
            CondCode::Ne => "ne",
            CondCode::Lt => "lt",
            CondCode::Le => "le",
            CondCode::Gt => "gt",
            CondCode::Ge => "ge",
            CondCode::ULt => "ult",
            CondCode::ULe => "ule",
            CondCode::UGt => "ugt",
            CondCode::UGe => "uge",
        }
    }

    /// Stable numeric encoding (for clients that store conditions in
    /// flat tables).
    pub fn from_u8(v: u8) -> CondCode {
        match v {
            0 => CondCode::Eq,
            1 => CondCode::Ne,
            2 => CondCode::Lt,
            3 => CondCode::Le,
            4 => CondCode::Gt,
            5 => CondCode::Ge,
            6 => CondCode::ULt,
            7 => CondCode::ULe,
            8 => CondCode::UGt,
            _ => CondCode::UGe,
        }
    }
}

/// Condition of a branch emitted by the compiler core. The back-ends map
/// these onto their full branch form sets (`B`/`B.cond`/`CBZ`/`CBNZ`/
/// `TBZ`/`TBNZ` on AArch64, `jmp`/`jcc` with `test`/`cmp`/`bt` on
/// x86-64).
#[derive(Clone, Copy, Debug)]
pub enum BranchCond {
    /// Unconditional.
    Always,
    /// Taken when the register is zero.
    Zero(Reg),
    /// Taken when the register is non-zero.
    NonZero(Reg),
    /// Taken when the comparison of the two registers satisfies the
    /// condition.
    Cmp(Reg, Reg, CondCode),
    /// Taken when the numbered bit of the register is set.
    BitSet(Reg, u8),
    /// Taken when the numbered bit of the register is clear.
    BitClear(Reg, u8),
}

impl BranchCond {
    /// The branch with the opposite sense.
    pub fn inverted(self) -> Self {
        match self {
            BranchCond::Always => BranchCond::Always,
            BranchCond::Zero(r) => BranchCond::NonZero(r),
            BranchCond::NonZero(r) => BranchCond::Zero(r),
            BranchCond::Cmp(l, r, cc) => BranchCond::Cmp(l, r, cc.inverted()),
            BranchCond::BitSet(r, bit) => BranchCond::BitClear(r, bit),
            BranchCond::BitClear(r, bit) => BranchCond::BitSet(r, bit),
        }
    }
}

/// An address expression `base + scale·index + disp` a back-end folds
/// into addressing modes where it can, materializing the rest with the
/// minimum number of extra instructions.
#[derive(Clone, Copy, Debug)]
pub struct AddrExpr {
    /// Base register.
    pub base: Option<Reg>,
    /// Scaled index register.
    pub index: Option<Reg>,
    /// Scale applied to the index.
    pub scale: u8,
    /// Constant displacement.
    pub disp: i64,
}

/// Target of a call: a symbol (direct, relocated, routed through the PLT
/// when out of reach) or a value holding the function address.
#[derive(Clone, Copy, Debug)]
pub enum CallTarget<V> {
    /// Direct call against a symbol.
    Sym(SymRef),
    /// Indirect call through a value.
    Value(V),
}

/// Per-function facts the prologue writer needs up front.
#[derive(Clone, Copy, Debug)]
pub struct FuncInfo {
    /// Symbol of the function being compiled.
    pub sym: SymRef,
    /// Uses variable arguments.
    pub is_vararg: bool,
    /// May adjust the stack pointer dynamically.
    pub has_dynamic_alloca: bool,
}

/// An architecture back-end.
///
/// All encoding hooks write through the assembler's text window; hooks
/// that can emit more than a few bytes reserve their own space. Prologue
/// and epilogue space is only reserved while the function body is
/// compiled and patched by [`Backend::finish_func`] once the clobbered
/// callee-saved set and the final frame size are known.
pub trait Backend {
    /// The calling-convention assigner of the default convention.
    type CC: CCAssigner;

    /// Assembler parameters (ELF machine, CIE shape).
    fn target_info() -> TargetInfo;

    /// Register environment of the default calling convention.
    fn cc_info(&self) -> &CCInfo;

    /// Fresh assigner for one signature.
    fn new_cc(&self) -> Self::CC;

    /// All registers of `bank`.
    fn bank_regs(&self, bank: RegBank) -> u64;

    /// How many fixed assignments the compiler may create per bank.
    fn num_fixed_assignments(&self, bank: RegBank) -> u32;

    /// Registers never used for fixed assignments (e.g. the first two
    /// result registers).
    fn fixed_nonallocatable_mask(&self) -> u64;

    /// The permanent scratch register reserved outside the allocatable
    /// set (x16 on AArch64); the prologue policy fixes this choice.
    fn scratch_reg(&self) -> Reg;

    /// Make sure `n` more text bytes can be written without checks. On
    /// AArch64 this is also the veneer hook.
    fn ensure_text(&mut self, asm: &mut Assembler, n: u32);

    /// Register-to-register move (any bank combination).
    fn mov(&mut self, asm: &mut Assembler, dst: Reg, src: Reg, size: u32);

    /// Store `reg` to the stack slot at `frame_off`.
    fn spill(&mut self, asm: &mut Assembler, reg: Reg, frame_off: u32, size: u32);

    /// Load the stack slot at `frame_off` into `dst`.
    fn reload(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, size: u32);

    /// Materialize the *address* of the `size`-byte stack slot allocated
    /// at `frame_off`.
    fn load_stack_addr(&mut self, asm: &mut Assembler, dst: Reg, frame_off: u32, size: u32);

    /// Materialize a constant.
    fn materialize_const(
        &mut self,
        asm: &mut Assembler,
        dst: Reg,
        bank: RegBank,
        size: u32,
        value: u64,
    );

    /// Two-operand ALU operation; `dst` may alias `lhs` (salvage) but
    /// never `rhs`.
    fn emit_alu(&mut self, asm: &mut Assembler, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg);

    /// Materialize an address expression into `dst`.
    fn expr_addr(&mut self, asm: &mut Assembler, dst: Reg, expr: &AddrExpr);

    /// Load `size` bytes from the address in `addr` into `dst`.
    fn load_mem(&mut self, asm: &mut Assembler, dst: Reg, addr: Reg, size: u32);

    /// Store `size` bytes from `src` to the address in `addr`.
    fn store_mem(&mut self, asm: &mut Assembler, src: Reg, addr: Reg, size: u32);

    /// Allocate a fresh label.
    fn label_create(&mut self) -> Label;

    /// Bind `label` to the current text offset, patching queued sites.
    fn label_place(&mut self, asm: &mut Assembler, label: Label);

    /// Emit a branch to `label` (queued for patching while the label is
    /// pending).
    fn branch(&mut self, asm: &mut Assembler, cond: BranchCond, label: Label);

    /// Bytes at the bottom of the frame reserved for the linkage area
    /// and the callee-saved register saves; value slots start above this.
    fn frame_reserved(&self, info: &FuncInfo) -> u32;

    /// Reserve prologue space and set up per-function state. The text
    /// cursor is 16-byte aligned on entry.
    fn begin_func(&mut self, asm: &mut Assembler, info: &FuncInfo);

    /// Load an argument that was passed on the stack.
    fn load_arg_from_stack(&mut self, asm: &mut Assembler, dst: Reg, cca: &CCAssignment);

    /// Reserve epilogue space at a return point.
    fn gen_epilogue(&mut self, asm: &mut Assembler);

    /// Write the real prologue and epilogues now that the clobbered
    /// callee-saved set and frame size are final; defines the function
    /// symbol and closes its FDE.
    fn finish_func(
        &mut self,
        asm: &mut Assembler,
        clobbered: u64,
        frame_size: u32,
    ) -> CodegenResult<()>;

    /// Reserve the stack-pointer adjustment for outgoing stack
    /// arguments; returns a patch cookie.
    fn begin_call_stack(&mut self, asm: &mut Assembler) -> u32;

    /// Patch the reserved adjustment with the final argument area size;
    /// returns the adjusted amount.
    fn finish_call_stack(&mut self, asm: &mut Assembler, cookie: u32, stack_size: u32) -> u32;

    /// Store an outgoing stack argument at `sp + off`.
    fn store_stack_arg(&mut self, asm: &mut Assembler, reg: Reg, off: u32, size: u32);

    /// Release the outgoing argument area again.
    fn restore_call_stack(&mut self, asm: &mut Assembler, amount: u32);

    /// Direct call to `sym` (routed through the PLT when out of reach).
    fn call_sym(&mut self, asm: &mut Assembler, sym: SymRef);

    /// Indirect call through `reg`.
    fn call_reg(&mut self, asm: &mut Assembler, reg: Reg);

    /// Load the address of thread-local `sym` (general-dynamic model).
    fn emit_tls_addr(&mut self, asm: &mut Assembler, sym: SymRef, dst: Reg);

    /// Drop all per-translation-unit state (labels etc.).
    fn reset(&mut self);
}
