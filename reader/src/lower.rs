//! Lowering of the test IR through the engine, plus the convenience
//! drivers that compile a module to an object or prepare it for the JIT
//! mapper.

use smallvec::SmallVec;

use tarmac_codegen::adaptor::IrAdaptor;
use tarmac_codegen::assembler::{Assembler, SymRef};
use tarmac_codegen::compiler::{Compiler, Lowering};
use tarmac_codegen::isa::aarch64::A64Backend;
use tarmac_codegen::isa::x64::X64Backend;
use tarmac_codegen::isa::{AluOp, Backend, BranchCond, CallTarget, CondCode};
use tarmac_codegen::CodegenResult;

use crate::module::{BlockRef, Module, Op, ValueKind, ValueRef};

/// Lowers test-IR instructions onto any back-end.
pub struct TestIrLowering;

impl<B: Backend> Lowering<Module, B> for TestIrLowering {
    fn lower_inst(
        &mut self,
        comp: &mut Compiler<Module, B>,
        inst: ValueRef,
    ) -> CodegenResult<()> {
        let data = &comp.adaptor.values[inst.0 as usize];
        let (kind, op, imm, call_func, has_result) =
            (data.kind, data.op, data.imm, data.call_func, data.has_result);

        match kind {
            ValueKind::Alloca => {
                // storage was set up at function entry
                comp.consume_def(inst);
                return Ok(());
            }
            ValueKind::Arg | ValueKind::Phi => {
                debug_assert!(false, "arguments and PHIs never reach the lowering");
                return Ok(());
            }
            ValueKind::Normal => {}
        }

        let operands: SmallVec<[ValueRef; 4]> = comp.adaptor.val_operands(inst).collect();
        match op {
            Op::Const => {
                comp.def_const(inst, imm)?;
            }
            Op::Add | Op::Sub | Op::Mul => {
                let lhs = comp.use_val_as_reg(operands[0])?;
                let rhs = comp.use_val_as_reg(operands[1])?;
                // write in place when this was the left operand's last use
                let dst = comp.def_val_salvage(inst, operands[0])?;
                let alu = match op {
                    Op::Add => AluOp::Add,
                    Op::Sub => AluOp::Sub,
                    _ => AluOp::Mul,
                };
                comp.backend.emit_alu(&mut comp.assembler, alu, dst, lhs, rhs);
            }
            Op::Load => {
                let addr = comp.use_val_as_reg(operands[0])?;
                let dst = comp.def_val(inst)?;
                comp.backend.load_mem(&mut comp.assembler, dst, addr, 8);
            }
            Op::Store => {
                let value = comp.use_val_as_reg(operands[0])?;
                let addr = comp.use_val_as_reg(operands[1])?;
                comp.backend.store_mem(&mut comp.assembler, value, addr, 8);
            }
            Op::Call => {
                let target = CallTarget::Sym(comp.func_sym(call_func));
                let result = has_result.then_some(inst);
                comp.gen_call(target, &operands, result)?;
            }
            Op::Jump => {
                let target = block_succ(comp, 0);
                comp.gen_jump(target)?;
            }
            Op::CondBr => {
                let t = block_succ(comp, 0);
                let f = block_succ(comp, 1);
                comp.gen_cond_branch(operands[0], t, f)?;
            }
            Op::CondBrCmp => {
                let lhs = comp.use_val_as_reg(operands[0])?;
                let rhs = comp.use_val_as_reg(operands[1])?;
                let cc = CondCode::from_u8(imm as u8);
                let t = block_succ(comp, 0);
                let f = block_succ(comp, 1);
                comp.gen_branch(BranchCond::Cmp(lhs, rhs, cc), t, f)?;
            }
            Op::CondBrBit => {
                let v = comp.use_val_as_reg(operands[0])?;
                let t = block_succ(comp, 0);
                let f = block_succ(comp, 1);
                comp.gen_branch(BranchCond::BitSet(v, imm as u8), t, f)?;
            }
            Op::Terminate => {
                comp.gen_return(operands.first().copied())?;
            }
            Op::None => unreachable!("normal value without an opcode"),
        }
        Ok(())
    }
}

fn block_succ<B: Backend>(comp: &Compiler<Module, B>, n: u32) -> BlockRef {
    let cur = comp.analyzer.block_layout[comp.cur_block_idx() as usize];
    let block = &comp.adaptor.blocks[cur.0 as usize];
    BlockRef(comp.adaptor.block_succs[(block.succ_begin + n) as usize])
}

/// A compiled module ready for mapping or inspection.
pub struct CompiledModule {
    /// The assembler holding sections, symbols, and relocations.
    pub assembler: Assembler,
    /// Per-function symbols, in module order.
    pub func_syms: Vec<SymRef>,
    /// Per-function linkage names, in module order.
    pub func_names: Vec<String>,
}

impl CompiledModule {
    /// The symbol of the function named `name`.
    pub fn sym_by_name(&self, name: &str) -> Option<SymRef> {
        self.func_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.func_syms[i])
    }
}

fn compile_with<B: Backend>(module: &mut Module, backend: B) -> CodegenResult<CompiledModule> {
    let func_names: Vec<String> = module
        .functions
        .iter()
        .map(|f| f.name.clone())
        .collect();
    let mut comp = Compiler::new(module, backend);
    comp.compile(&mut TestIrLowering)?;
    let func_syms = (0..func_names.len() as u32).map(|i| comp.func_sym(i)).collect();
    Ok(CompiledModule {
        assembler: comp.into_assembler(),
        func_syms,
        func_names,
    })
}

/// Compile `module` for x86-64, keeping the assembler state (for the JIT
/// mapper or serialization).
pub fn compile_x64(module: &mut Module) -> CodegenResult<CompiledModule> {
    compile_with(module, X64Backend::new())
}

/// Compile `module` for AArch64.
pub fn compile_a64(module: &mut Module) -> CodegenResult<CompiledModule> {
    compile_with(module, A64Backend::new())
}

/// Compile `module` to a relocatable object for the given architecture.
pub fn compile_to_object(module: &mut Module, arch: crate::Arch) -> CodegenResult<Vec<u8>> {
    let mut compiled = match arch {
        crate::Arch::X64 => compile_x64(module)?,
        crate::Arch::A64 => compile_a64(module)?,
    };
    compiled.assembler.finish()
}
