//! Emitter lowering SSA IR into an executable [`Program`].
//!
//! Per handler, in order: linear-scan register assignment (slots live for
//! the whole handler, temporaries die at last use and their registers are
//! recycled), block emission in creation order with the entry first, and a
//! final fixup pass resolving branch and match-table targets to absolute
//! instruction indices.  Constants are interned into the program pools,
//! deduplicated by value, and materialized lazily at their first use.

use thiserror::Error;
use tracing::debug;

use crate::bytecode::{Instruction, Opcode};
use crate::ir::{BlockId, IrHandler, IrInstr, IrProgram, ValueId};
use crate::matching::{MatchCase, MatchOp, MatchTable};
use crate::natives::NativeRegistry;
use crate::program::{Program, ProgramError};
use crate::value::Literal;

/// Lowering and linking errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("opcode {0:?} is not supported by the emitter")]
    UnsupportedOpcode(Opcode),
    #[error("use of undefined IR value v{0}")]
    UndefinedValue(u32),
    #[error("IR node is missing an operand")]
    MissingOperand,
    #[error("handler '{0}' exceeds the 65536-register budget")]
    RegisterOverflow(String),
    #[error("reference to unknown handler '{0}'")]
    UnknownHandler(String),
    #[error("regex match requires a literal regex operand")]
    RegexOperand,
    #[error("branch into block '{0}' which emitted no code")]
    DanglingBlock(String),
    #[error("array literal exceeds {max} elements")]
    ArrayTooLarge { max: usize },
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// Lower an IR program into an unlinked [`Program`].
///
/// The result still needs [`Program::link`] against the host registry and a
/// [`Program::validate`] pass before any Runner may execute it;
/// [`compile_linked`] bundles all three.
pub fn compile(ir: &IrProgram) -> Result<Program, CompileError> {
    let mut program = Program::new();
    for handler in &ir.handlers {
        HandlerEmitter::new(ir, handler, &mut program).emit()?;
    }
    Ok(program)
}

/// Compile, link and validate in one step.
pub fn compile_linked(
    ir: &IrProgram,
    registry: &NativeRegistry,
) -> Result<Program, CompileError> {
    let mut program = compile(ir)?;
    program.link(registry)?;
    program.validate()?;
    Ok(program)
}

enum PatchField {
    A,
    B,
}

struct MatchFixup {
    table: u16,
    cases: Vec<(u32, BlockId)>,
    else_block: BlockId,
}

struct HandlerEmitter<'a, 'p> {
    ir: &'a IrProgram,
    handler: &'a IrHandler,
    program: &'p mut Program,
    code: Vec<Instruction>,
    block_pcs: Vec<Option<u32>>,
    branch_fixups: Vec<(usize, PatchField, BlockId)>,
    match_fixups: Vec<MatchFixup>,
    value_regs: Vec<Option<u16>>,
    pending: Vec<Option<Literal>>,
    pinned: Vec<bool>,
    last_use: Vec<Option<usize>>,
    free: Vec<u16>,
    next_reg: u32,
    max_reg: u32,
    ordinal: usize,
}

impl<'a, 'p> HandlerEmitter<'a, 'p> {
    fn new(ir: &'a IrProgram, handler: &'a IrHandler, program: &'p mut Program) -> Self {
        let values = handler.value_types.len();
        Self {
            ir,
            handler,
            program,
            code: Vec::new(),
            block_pcs: vec![None; handler.blocks.len()],
            branch_fixups: Vec::new(),
            match_fixups: Vec::new(),
            value_regs: vec![None; values],
            pending: vec![None; values],
            pinned: vec![false; values],
            last_use: vec![None; values],
            free: Vec::new(),
            next_reg: 0,
            max_reg: 0,
            ordinal: 0,
        }
    }

    fn emit(mut self) -> Result<(), CompileError> {
        self.compute_last_uses();

        // Entry first; remaining blocks in creation order, which the IR
        // generator keeps topological enough that fixups stay cheap.
        let handler = self.handler;
        for (block_index, block) in handler.blocks.iter().enumerate() {
            self.block_pcs[block_index] = Some(self.code.len() as u32);
            for instruction in &block.instructions {
                self.emit_instr(instruction)?;
                self.release_dead(instruction);
                self.ordinal += 1;
            }
        }

        self.apply_fixups()?;

        let register_count = self.max_reg.max(1);
        if register_count > u32::from(u16::MAX) {
            return Err(CompileError::RegisterOverflow(self.handler.name.clone()));
        }
        debug!(
            handler = %self.handler.name,
            registers = register_count,
            instructions = self.code.len(),
            "handler emitted"
        );
        self.program
            .create_handler(&self.handler.name, register_count as u16, self.code);
        Ok(())
    }

    // ---- lifetimes and registers --------------------------------------

    fn compute_last_uses(&mut self) {
        let handler = self.handler;
        let mut ordinal = 0;
        for block in &handler.blocks {
            for instruction in &block.instructions {
                for value in instr_uses(instruction) {
                    self.last_use[value.0 as usize] = Some(ordinal);
                }
                ordinal += 1;
            }
        }
    }

    fn alloc_reg(&mut self) -> Result<u16, CompileError> {
        if let Some(reg) = self.free.pop() {
            return Ok(reg);
        }
        if self.next_reg > u32::from(u16::MAX) {
            return Err(CompileError::RegisterOverflow(self.handler.name.clone()));
        }
        let reg = self.next_reg as u16;
        self.next_reg += 1;
        self.max_reg = self.max_reg.max(self.next_reg);
        Ok(reg)
    }

    /// Contiguous window taken from the high-water mark, bypassing the free
    /// list (call frames and operand pairs must be adjacent).
    fn alloc_window(&mut self, len: u32) -> Result<u16, CompileError> {
        if self.next_reg + len > u32::from(u16::MAX) + 1 {
            return Err(CompileError::RegisterOverflow(self.handler.name.clone()));
        }
        let base = self.next_reg as u16;
        self.next_reg += len;
        self.max_reg = self.max_reg.max(self.next_reg);
        Ok(base)
    }

    fn release(&mut self, reg: u16) {
        self.free.push(reg);
    }

    fn define(&mut self, value: ValueId) -> Result<u16, CompileError> {
        let reg = self.alloc_reg()?;
        self.value_regs[value.0 as usize] = Some(reg);
        Ok(reg)
    }

    /// Register holding `value`, materializing a deferred constant on first
    /// use.
    fn ensure_reg(&mut self, value: ValueId) -> Result<u16, CompileError> {
        if let Some(reg) = self.value_regs[value.0 as usize] {
            return Ok(reg);
        }
        let Some(literal) = self.pending[value.0 as usize].take() else {
            return Err(CompileError::UndefinedValue(value.0));
        };
        let reg = self.alloc_reg()?;
        self.emit_literal(reg, &literal)?;
        self.value_regs[value.0 as usize] = Some(reg);
        Ok(reg)
    }

    fn release_dead(&mut self, instruction: &IrInstr) {
        for value in instr_uses(instruction) {
            let index = value.0 as usize;
            if self.last_use[index] == Some(self.ordinal) && !self.pinned[index] {
                if let Some(reg) = self.value_regs[index] {
                    self.release(reg);
                }
            }
        }
        // A result nothing ever reads frees its register immediately.
        if let Some(result) = instr_def(instruction) {
            let index = result.0 as usize;
            if self.last_use[index].is_none() && !self.pinned[index] {
                if let Some(reg) = self.value_regs[index] {
                    self.release(reg);
                }
            }
        }
    }

    // ---- emission ------------------------------------------------------

    fn push(&mut self, opcode: Opcode, a: u16, b: u16, c: u16) {
        self.code.push(Instruction::new(opcode, a, b, c));
    }

    fn push_branch(&mut self, opcode: Opcode, a: u16, field: PatchField, target: BlockId) {
        self.branch_fixups.push((self.code.len(), field, target));
        self.push(opcode, a, 0, 0);
    }

    fn emit_literal(&mut self, reg: u16, literal: &Literal) -> Result<(), CompileError> {
        match literal {
            Literal::Number(value) => {
                if i16::try_from(*value).is_ok() {
                    self.push(Opcode::Imov, reg, *value as i16 as u16, 0);
                } else {
                    let index = self.program.add_number(*value);
                    self.push(Opcode::Nconst, reg, index, 0);
                }
            }
            Literal::Boolean(value) => {
                self.push(Opcode::Imov, reg, u16::from(*value), 0);
            }
            Literal::String(bytes) => {
                let index = self.program.add_string(bytes);
                self.push(Opcode::Sconst, reg, index, 0);
            }
            Literal::IpAddr(addr) => {
                let index = self.program.add_ipaddr(*addr);
                self.push(Opcode::Pconst, reg, index, 0);
            }
            Literal::Cidr(cidr) => {
                let index = self.program.add_cidr(*cidr);
                self.push(Opcode::Cconst, reg, index, 0);
            }
            Literal::Regex(pattern) => {
                // Regex cells carry the pool index; there is no typed load.
                let index = self.program.add_regex(pattern)?;
                self.push(Opcode::Imov, reg, index, 0);
            }
            Literal::HandlerRef(name) => {
                let index = self
                    .ir
                    .find_handler(name)
                    .ok_or_else(|| CompileError::UnknownHandler(name.clone()))?;
                self.push(Opcode::Imov, reg, index as u16, 0);
            }
        }
        Ok(())
    }

    fn emit_instr(&mut self, instruction: &IrInstr) -> Result<(), CompileError> {
        match instruction {
            IrInstr::Alloca { result, .. } => {
                // Slots start zeroed by the runner; no code until the store.
                self.define(*result)?;
                self.pinned[result.0 as usize] = true;
            }
            IrInstr::Load { result, slot, .. } => {
                let slot_reg = self.ensure_reg(*slot)?;
                let result_reg = self.define(*result)?;
                self.push(Opcode::Mov, result_reg, slot_reg, 0);
            }
            IrInstr::Store { slot, value } => {
                let value_reg = self.ensure_reg(*value)?;
                let slot_reg = self.ensure_reg(*slot)?;
                self.push(Opcode::Mov, slot_reg, value_reg, 0);
            }
            IrInstr::Const { result, literal } => {
                self.pending[result.0 as usize] = Some(literal.clone());
            }
            IrInstr::Vm {
                opcode,
                result,
                operands,
                ..
            } => self.emit_vm(*opcode, *result, operands)?,
            IrInstr::NewArray {
                result,
                ty,
                elements,
            } => {
                if elements.len() > usize::from(u16::MAX) {
                    return Err(CompileError::ArrayTooLarge {
                        max: usize::from(u16::MAX),
                    });
                }
                let element_regs: Vec<u16> = elements
                    .iter()
                    .map(|element| self.ensure_reg(*element))
                    .collect::<Result<_, _>>()?;
                let result_reg = self.define(*result)?;
                let (new_op, init_op) = match ty {
                    crate::value::FlowType::StringArray => (Opcode::Asnew, Opcode::Asinit),
                    _ => (Opcode::Annew, Opcode::Aninit),
                };
                self.push(new_op, result_reg, elements.len() as u16, 0);
                for (index, element_reg) in element_regs.iter().enumerate() {
                    self.push(init_op, result_reg, index as u16, *element_reg);
                }
            }
            IrInstr::Call {
                result,
                ty,
                kind,
                native,
                args,
            } => {
                let native_index = self.program.add_native(*kind, native, *ty)?;
                let base = self.emit_call_window(args)?;
                let argc = args.len() as u16 + 1;
                self.push(Opcode::Call, native_index, argc, base);
                // The result lives in the window's first cell.
                self.value_regs[result.0 as usize] = Some(base);
                for offset in 1..u32::from(argc) {
                    self.release(base + offset as u16);
                }
            }
            IrInstr::InvokeHandler { native, args } => {
                let native_index = self.program.add_native(
                    crate::natives::NativeKind::Handler,
                    native,
                    crate::value::FlowType::Boolean,
                )?;
                let base = self.emit_call_window(args)?;
                let argc = args.len() as u16 + 1;
                self.push(Opcode::Handler, native_index, argc, base);
                for offset in 0..u32::from(argc) {
                    self.release(base + offset as u16);
                }
            }
            IrInstr::Match {
                op,
                condition,
                cases,
                else_block,
            } => {
                let condition_reg = self.ensure_reg(*condition)?;
                let table = self
                    .program
                    .add_match(MatchTable::new(*op, Vec::new(), 0));
                let mut fixup_cases = Vec::with_capacity(cases.len());
                for case in cases {
                    let literal = match (&case.literal, op) {
                        (Literal::Regex(pattern), MatchOp::Regex) => {
                            u32::from(self.program.add_regex(pattern)?)
                        }
                        (
                            Literal::String(bytes),
                            MatchOp::Eq | MatchOp::Prefix | MatchOp::Suffix,
                        ) => u32::from(self.program.add_string(bytes)),
                        _ => return Err(CompileError::RegexOperand),
                    };
                    fixup_cases.push((literal, case.block));
                }
                self.match_fixups.push(MatchFixup {
                    table,
                    cases: fixup_cases,
                    else_block: *else_block,
                });
                let opcode = match op {
                    MatchOp::Eq => Opcode::Smatcheq,
                    MatchOp::Prefix => Opcode::Smatchbeg,
                    MatchOp::Suffix => Opcode::Smatchend,
                    MatchOp::Regex => Opcode::Smatchr,
                };
                self.push(opcode, condition_reg, table, 0);
            }
            IrInstr::Br { target } => {
                self.push_branch(Opcode::Jmp, 0, PatchField::A, *target);
            }
            IrInstr::CondBr {
                condition,
                then_block,
                else_block,
            } => {
                let condition_reg = self.ensure_reg(*condition)?;
                self.push_branch(Opcode::Jz, condition_reg, PatchField::B, *else_block);
                self.push_branch(Opcode::Jmp, 0, PatchField::A, *then_block);
            }
            IrInstr::Ret { value } => {
                // Literal verdicts collapse to a bare EXIT.
                match self.pending[value.0 as usize].take() {
                    Some(Literal::Boolean(truthy)) => {
                        self.push(Opcode::Exit, u16::from(truthy), 0, 0);
                    }
                    Some(Literal::Number(number)) => {
                        self.push(Opcode::Exit, u16::from(number != 0), 0, 0);
                    }
                    Some(other) => {
                        self.pending[value.0 as usize] = Some(other);
                        let reg = self.ensure_reg(*value)?;
                        self.emit_exit_on(reg);
                    }
                    None => {
                        let reg = self.ensure_reg(*value)?;
                        self.emit_exit_on(reg);
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_exit_on(&mut self, reg: u16) {
        let pc = self.code.len() as u16;
        self.push(Opcode::Jn, reg, pc + 2, 0);
        self.push(Opcode::Exit, 0, 0, 0);
        self.push(Opcode::Exit, 1, 0, 0);
    }

    /// Lay out `argv` for a native invocation: a fresh contiguous window,
    /// result slot first, arguments copied behind it.
    fn emit_call_window(&mut self, args: &[ValueId]) -> Result<u16, CompileError> {
        let arg_regs: Vec<u16> = args
            .iter()
            .map(|arg| self.ensure_reg(*arg))
            .collect::<Result<_, _>>()?;
        let base = self.alloc_window(args.len() as u32 + 1)?;
        self.push(Opcode::Imov, base, 0, 0);
        for (offset, arg_reg) in arg_regs.iter().enumerate() {
            self.push(Opcode::Mov, base + 1 + offset as u16, *arg_reg, 0);
        }
        Ok(base)
    }

    fn emit_vm(
        &mut self,
        opcode: Opcode,
        result: Option<ValueId>,
        operands: &[ValueId],
    ) -> Result<(), CompileError> {
        use Opcode::*;
        match opcode {
            // A <- op B
            Nneg | Ncmpz | Bnot | Slen | Sisempty | S2i | I2s | P2s | C2s | R2s | Surlenc
            | Surldec | Sreggroup => {
                let operand = self.operand(operands, 0)?;
                let operand_reg = self.ensure_reg(operand)?;
                let result_reg = self.result_reg(result)?;
                self.push(opcode, result_reg, operand_reg, 0);
            }
            // A <- B op C
            Nadd | Nsub | Nmul | Ndiv | Nrem | Nshl | Nshr | Npow | Nand | Nor | Nxor | Ncmpeq
            | Ncmpne | Ncmple | Ncmpge | Ncmplt | Ncmpgt | Band | Bor | Bxor | Sadd | Scmpeq
            | Scmpne | Scmple | Scmpge | Scmplt | Scmpgt | Scmpbeg | Scmpend | Scontains
            | Pcmpeq | Pcmpne | Pincidr => {
                let lhs = self.ensure_reg(self.operand(operands, 0)?)?;
                let rhs = self.ensure_reg(self.operand(operands, 1)?)?;
                let result_reg = self.result_reg(result)?;
                self.push(opcode, result_reg, lhs, rhs);
            }
            // A <- B =~ pool(C); the pattern must be a literal.
            Sregmatch => {
                let subject = self.ensure_reg(self.operand(operands, 0)?)?;
                let pattern = self.operand(operands, 1)?;
                let pool = match self.pending[pattern.0 as usize].take() {
                    Some(Literal::Regex(pattern)) => self.program.add_regex(&pattern)?,
                    _ => return Err(CompileError::RegexOperand),
                };
                let result_reg = self.result_reg(result)?;
                self.push(Sregmatch, result_reg, subject, pool);
            }
            // A <- substr(B, [C], [C+1])
            Ssubstr => {
                let subject = self.ensure_reg(self.operand(operands, 0)?)?;
                let offset = self.ensure_reg(self.operand(operands, 1)?)?;
                let length = self.ensure_reg(self.operand(operands, 2)?)?;
                let pair = self.alloc_window(2)?;
                self.push(Mov, pair, offset, 0);
                self.push(Mov, pair + 1, length, 0);
                let result_reg = self.result_reg(result)?;
                self.push(Ssubstr, result_reg, subject, pair);
                self.release(pair);
                self.release(pair + 1);
            }
            Sprint => {
                let operand_reg = self.ensure_reg(self.operand(operands, 0)?)?;
                self.push(Sprint, operand_reg, 0, 0);
            }
            Nticks => {
                let result_reg = self.result_reg(result)?;
                self.push(Nticks, result_reg, 0, 0);
            }
            other => return Err(CompileError::UnsupportedOpcode(other)),
        }
        Ok(())
    }

    fn operand(&self, operands: &[ValueId], index: usize) -> Result<ValueId, CompileError> {
        operands
            .get(index)
            .copied()
            .ok_or(CompileError::MissingOperand)
    }

    fn result_reg(&mut self, result: Option<ValueId>) -> Result<u16, CompileError> {
        match result {
            Some(value) => self.define(value),
            None => self.alloc_reg(),
        }
    }

    // ---- fixups --------------------------------------------------------

    fn block_pc(&self, block: BlockId) -> Result<u32, CompileError> {
        self.block_pcs[block.0 as usize]
            .ok_or_else(|| CompileError::DanglingBlock(self.handler.blocks[block.0 as usize].label.clone()))
    }

    fn apply_fixups(&mut self) -> Result<(), CompileError> {
        for (index, field, block) in std::mem::take(&mut self.branch_fixups) {
            let pc = self.block_pc(block)? as u16;
            let insn = self.code[index];
            self.code[index] = match field {
                PatchField::A => insn.with_a(pc),
                PatchField::B => insn.with_b(pc),
            };
        }
        for fixup in std::mem::take(&mut self.match_fixups) {
            let mut cases = Vec::with_capacity(fixup.cases.len());
            for (literal, block) in fixup.cases {
                cases.push(MatchCase {
                    literal,
                    target: self.block_pc(block)?,
                });
            }
            let else_target = self.block_pc(fixup.else_block)?;
            self.program.patch_match(fixup.table, cases, else_target);
        }
        Ok(())
    }
}

/// Values an instruction reads.
fn instr_uses(instruction: &IrInstr) -> Vec<ValueId> {
    match instruction {
        IrInstr::Alloca { .. } | IrInstr::Const { .. } | IrInstr::Br { .. } => Vec::new(),
        IrInstr::Load { slot, .. } => vec![*slot],
        IrInstr::Store { slot, value } => vec![*slot, *value],
        IrInstr::Vm { operands, .. } => operands.clone(),
        IrInstr::NewArray { elements, .. } => elements.clone(),
        IrInstr::Call { args, .. } => args.clone(),
        IrInstr::InvokeHandler { args, .. } => args.clone(),
        IrInstr::Match { condition, .. } => vec![*condition],
        IrInstr::CondBr { condition, .. } => vec![*condition],
        IrInstr::Ret { value } => vec![*value],
    }
}

/// The value an instruction defines, if any.
fn instr_def(instruction: &IrInstr) -> Option<ValueId> {
    match instruction {
        IrInstr::Alloca { result, .. }
        | IrInstr::Load { result, .. }
        | IrInstr::Const { result, .. }
        | IrInstr::NewArray { result, .. }
        | IrInstr::Call { result, .. } => Some(*result),
        IrInstr::Vm { result, .. } => *result,
        _ => None,
    }
}

