//! The in-memory test IR and its adaptor implementation.
//!
//! The module keeps everything in flat arrays — values, operand indices,
//! blocks, successor indices, functions holding ranges into them — so
//! references are plain `u32` indices and the adaptor surface stays
//! allocation-free.

use tarmac_codegen::adaptor::IrAdaptor;
use tarmac_codegen::isa::CondCode;

/// Opcodes of non-PHI instructions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    /// No operation (arguments, PHIs, and allocas use this slot).
    None,
    /// Two-operand addition.
    Add,
    /// Two-operand subtraction.
    Sub,
    /// Two-operand multiplication.
    Mul,
    /// Integer constant.
    Const,
    /// Call of another function in the module.
    Call,
    /// 8-byte load through a pointer operand.
    Load,
    /// 8-byte store of the first operand through the second.
    Store,
    /// Unconditional jump to the block's single successor.
    Jump,
    /// Two-way branch: first successor when the operand is non-zero.
    CondBr,
    /// Two-way branch on a two-operand comparison; the condition code is
    /// stored in `imm`.
    CondBrCmp,
    /// Two-way branch on one bit of the operand; the bit number is
    /// stored in `imm`.
    CondBrBit,
    /// Function return, with an optional value operand.
    Terminate,
}

/// What kind of value an entry in the value table is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueKind {
    /// An ordinary instruction.
    Normal,
    /// A function argument.
    Arg,
    /// A static stack slot.
    Alloca,
    /// A PHI node.
    Phi,
}

/// One entry of the value table.
#[derive(Clone, Debug)]
pub struct ValueData {
    /// Source name (without the `%`).
    pub name: String,
    /// Value number local to the enclosing function.
    pub local_idx: u32,
    /// Kind of the value.
    pub kind: ValueKind,
    /// Opcode for `ValueKind::Normal`.
    pub op: Op,
    /// Start of the operand range in `value_operands`. PHIs store
    /// `(block, value)` index pairs there.
    pub op_begin: u32,
    /// End of the operand range.
    pub op_end: u32,
    /// Byte size for allocas; constant bits for `Op::Const`.
    pub imm: u64,
    /// Callee function index for `Op::Call`.
    pub call_func: u32,
    /// Does the instruction define a result?
    pub has_result: bool,
}

/// One entry of the block table.
#[derive(Clone, Debug)]
pub struct BlockData {
    /// Source name (without the `^`).
    pub name: String,
    /// Successor range in `block_succs`.
    pub succ_begin: u32,
    /// End of the successor range.
    pub succ_end: u32,
    /// Instruction range in `values`.
    pub inst_begin: u32,
    /// End of the instruction range.
    pub inst_end: u32,
    /// First analyzer scratch word.
    pub info: u32,
    /// Second analyzer scratch word.
    pub info2: u32,
}

/// One entry of the function table.
#[derive(Clone, Debug)]
pub struct FunctionData {
    /// Linkage name.
    pub name: String,
    /// Block range in `blocks`; the first block is the entry.
    pub block_begin: u32,
    /// End of the block range.
    pub block_end: u32,
    /// First value of the function (arguments come first).
    pub value_begin: u32,
    /// End of the value range.
    pub value_end: u32,
    /// Number of leading argument values.
    pub arg_count: u32,
    /// Declared with file-local linkage.
    pub is_local: bool,
    /// Declaration without a body.
    pub is_extern: bool,
    /// Contains at least one call.
    pub has_call: bool,
}

/// A parsed test-IR module.
#[derive(Default)]
pub struct Module {
    /// All values of all functions.
    pub values: Vec<ValueData>,
    /// Flattened operand lists.
    pub value_operands: Vec<u32>,
    /// All blocks of all functions.
    pub blocks: Vec<BlockData>,
    /// Flattened successor lists.
    pub block_succs: Vec<u32>,
    /// All functions.
    pub functions: Vec<FunctionData>,
    cur_func: u32,
}

/// Reference to a value (index into `Module::values`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValueRef(pub u32);

/// Reference to a block (index into `Module::blocks`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockRef(pub u32);

/// Reference to a function (index into `Module::functions`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FuncRef(pub u32);

impl Module {
    fn func(&self) -> &FunctionData {
        &self.functions[self.cur_func as usize]
    }

    fn value(&self, v: ValueRef) -> &ValueData {
        &self.values[v.0 as usize]
    }

    /// The function index of the currently selected function.
    pub fn cur_func_idx(&self) -> u32 {
        self.cur_func
    }

    /// Look up a function by name.
    pub fn func_by_name(&self, name: &str) -> Option<FuncRef> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncRef(i as u32))
    }

    /// Print the module in its source syntax.
    pub fn print(&self) -> String {
        let mut out = String::new();
        for f in &self.functions {
            out.push_str(&f.name);
            out.push('(');
            for i in 0..f.arg_count {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('%');
                out.push_str(&self.values[(f.value_begin + i) as usize].name);
            }
            out.push(')');
            if f.is_extern {
                out.push_str("!\n");
                continue;
            }
            if f.is_local {
                out.push_str(" local");
            }
            out.push_str(" {\n");
            for b in f.block_begin..f.block_end {
                let block = &self.blocks[b as usize];
                out.push_str(&format!("{}:\n", block.name));
                for v in block.inst_begin..block.inst_end {
                    out.push_str(&format!("  {}\n", self.print_inst(v)));
                }
            }
            out.push_str("}\n");
        }
        out
    }

    fn print_inst(&self, v: u32) -> String {
        let value = &self.values[v as usize];
        let ops = |r: std::ops::Range<u32>| {
            (r.start..r.end)
                .map(|i| {
                    format!(
                        "%{}",
                        self.values[self.value_operands[i as usize] as usize].name
                    )
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        match value.kind {
            ValueKind::Arg => format!("%{} = arg", value.name),
            ValueKind::Alloca => format!("%{} = alloca {}", value.name, value.imm),
            ValueKind::Phi => {
                let mut parts = Vec::new();
                let mut i = value.op_begin;
                while i < value.op_end {
                    let block = self.value_operands[i as usize];
                    let val = self.value_operands[(i + 1) as usize];
                    parts.push(format!(
                        "[^{}, %{}]",
                        self.blocks[block as usize].name, self.values[val as usize].name
                    ));
                    i += 2;
                }
                format!("%{} = phi {}", value.name, parts.join(", "))
            }
            ValueKind::Normal => match value.op {
                Op::Add | Op::Sub | Op::Mul => {
                    let name = match value.op {
                        Op::Add => "add",
                        Op::Sub => "sub",
                        _ => "mul",
                    };
                    format!("%{} = {} {}", value.name, name, ops(value.op_begin..value.op_end))
                }
                Op::Const => format!("%{} = const {}", value.name, value.imm),
                Op::Call => {
                    let callee = &self.functions[value.call_func as usize].name;
                    let args = ops(value.op_begin..value.op_end);
                    if value.has_result {
                        format!("%{} = call @{}({})", value.name, callee, args)
                    } else {
                        format!("call @{}({})", callee, args)
                    }
                }
                Op::Load => format!("%{} = load {}", value.name, ops(value.op_begin..value.op_end)),
                Op::Store => format!("store {}", ops(value.op_begin..value.op_end)),
                Op::Jump => {
                    let block = &self.blocks[self.cur_succ(v, 0) as usize];
                    format!("jump ^{}", block.name)
                }
                Op::CondBr => {
                    let t = &self.blocks[self.cur_succ(v, 0) as usize];
                    let f = &self.blocks[self.cur_succ(v, 1) as usize];
                    format!(
                        "condbr {}, ^{}, ^{}",
                        ops(value.op_begin..value.op_end),
                        t.name,
                        f.name
                    )
                }
                Op::CondBrCmp => {
                    let t = &self.blocks[self.cur_succ(v, 0) as usize];
                    let f = &self.blocks[self.cur_succ(v, 1) as usize];
                    format!(
                        "brcmp {}, {}, ^{}, ^{}",
                        CondCode::from_u8(value.imm as u8).name(),
                        ops(value.op_begin..value.op_end),
                        t.name,
                        f.name
                    )
                }
                Op::CondBrBit => {
                    let t = &self.blocks[self.cur_succ(v, 0) as usize];
                    let f = &self.blocks[self.cur_succ(v, 1) as usize];
                    format!(
                        "brbit {}, {}, ^{}, ^{}",
                        value.imm,
                        ops(value.op_begin..value.op_end),
                        t.name,
                        f.name
                    )
                }
                Op::Terminate => {
                    if value.op_begin == value.op_end {
                        "terminate".to_string()
                    } else {
                        format!("terminate {}", ops(value.op_begin..value.op_end))
                    }
                }
                Op::None => format!("%{} = ?", value.name),
            },
        }
    }

    fn cur_succ(&self, inst: u32, n: u32) -> u32 {
        // terminators live in exactly one block; find it
        let block = self
            .blocks
            .iter()
            .find(|b| (b.inst_begin..b.inst_end).contains(&inst))
            .expect("instruction outside any block");
        self.block_succs[(block.succ_begin + n) as usize]
    }
}

impl IrAdaptor for Module {
    type Value = ValueRef;
    type Block = BlockRef;
    type Func = FuncRef;

    fn func_count(&self) -> u32 {
        self.functions.len() as u32
    }

    fn funcs(&self) -> impl Iterator<Item = FuncRef> + '_ {
        (0..self.functions.len() as u32).map(FuncRef)
    }

    fn func_link_name(&self, func: FuncRef) -> &str {
        &self.functions[func.0 as usize].name
    }

    fn func_extern(&self, func: FuncRef) -> bool {
        self.functions[func.0 as usize].is_extern
    }

    fn func_local(&self, func: FuncRef) -> bool {
        self.functions[func.0 as usize].is_local
    }

    fn switch_func(&mut self, func: FuncRef) -> bool {
        self.cur_func = func.0;
        !self.functions[func.0 as usize].is_extern
    }

    fn cur_highest_val_idx(&self) -> u32 {
        let f = self.func();
        f.value_end.saturating_sub(f.value_begin + 1)
    }

    fn cur_args(&self) -> impl Iterator<Item = ValueRef> + '_ {
        let f = self.func();
        (f.value_begin..f.value_begin + f.arg_count).map(ValueRef)
    }

    fn cur_static_allocas(&self) -> impl Iterator<Item = ValueRef> + '_ {
        let f = self.func();
        (f.value_begin..f.value_end)
            .map(ValueRef)
            .filter(|&v| self.value(v).kind == ValueKind::Alloca)
    }

    fn cur_may_emit_calls(&self) -> bool {
        self.func().has_call
    }

    fn cur_entry_block(&self) -> BlockRef {
        BlockRef(self.func().block_begin)
    }

    fn blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        let f = self.func();
        (f.block_begin..f.block_end).map(BlockRef)
    }

    fn block_succs(&self, block: BlockRef) -> impl Iterator<Item = BlockRef> + '_ {
        let b = &self.blocks[block.0 as usize];
        (b.succ_begin..b.succ_end).map(|i| BlockRef(self.block_succs[i as usize]))
    }

    fn block_values(&self, block: BlockRef) -> impl Iterator<Item = ValueRef> + '_ {
        let b = &self.blocks[block.0 as usize];
        (b.inst_begin..b.inst_end).map(ValueRef)
    }

    fn block_phis(&self, block: BlockRef) -> impl Iterator<Item = ValueRef> + '_ {
        let b = &self.blocks[block.0 as usize];
        (b.inst_begin..b.inst_end)
            .map(ValueRef)
            .filter(|&v| self.value(v).kind == ValueKind::Phi)
    }

    fn block_info(&self, block: BlockRef) -> u32 {
        self.blocks[block.0 as usize].info
    }

    fn block_set_info(&mut self, block: BlockRef, info: u32) {
        self.blocks[block.0 as usize].info = info;
    }

    fn block_info2(&self, block: BlockRef) -> u32 {
        self.blocks[block.0 as usize].info2
    }

    fn block_set_info2(&mut self, block: BlockRef, info: u32) {
        self.blocks[block.0 as usize].info2 = info;
    }

    fn val_local_idx(&self, value: ValueRef) -> u32 {
        self.value(value).local_idx
    }

    fn val_is_phi(&self, value: ValueRef) -> bool {
        self.value(value).kind == ValueKind::Phi
    }

    fn val_produces_result(&self, value: ValueRef) -> bool {
        self.value(value).has_result
    }

    fn val_operands(&self, value: ValueRef) -> impl Iterator<Item = ValueRef> + '_ {
        let v = self.value(value);
        let range = if v.kind == ValueKind::Phi {
            // PHI slots are visited through the phi accessors
            0..0
        } else {
            v.op_begin..v.op_end
        };
        range.map(|i| ValueRef(self.value_operands[i as usize]))
    }

    fn phi_incoming_count(&self, phi: ValueRef) -> u32 {
        let v = self.value(phi);
        debug_assert_eq!(v.kind, ValueKind::Phi);
        (v.op_end - v.op_begin) / 2
    }

    fn phi_incoming_block(&self, phi: ValueRef, slot: u32) -> BlockRef {
        let v = self.value(phi);
        BlockRef(self.value_operands[(v.op_begin + 2 * slot) as usize])
    }

    fn phi_incoming_val(&self, phi: ValueRef, slot: u32) -> ValueRef {
        let v = self.value(phi);
        ValueRef(self.value_operands[(v.op_begin + 2 * slot + 1) as usize])
    }

    fn val_alloca_size(&self, value: ValueRef) -> u32 {
        self.value(value).imm as u32
    }
}
