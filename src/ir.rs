//! SSA intermediate representation of Flow handlers.
//!
//! Every value is defined exactly once and carries a static [`FlowType`].
//! Generic typed operations record the VM opcode they lower to, so the
//! emitter's job stays largely mechanical: assign registers, order blocks,
//! resolve branch targets.  Control flow is explicit; each basic block ends
//! in exactly one terminator.

use crate::bytecode::Opcode;
use crate::matching::MatchOp;
use crate::natives::NativeKind;
use crate::value::{FlowType, Literal};

/// Identifier of an SSA value within one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// Identifier of a basic block within one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// An IR module: one function per source handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrProgram {
    pub handlers: Vec<IrHandler>,
}

impl IrProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }
}

/// A lowered handler: entry block, body blocks in creation order, and the
/// type of every SSA value.
#[derive(Debug, Clone, PartialEq)]
pub struct IrHandler {
    pub name: String,
    pub entry: BlockId,
    pub blocks: Vec<IrBlock>,
    pub value_types: Vec<FlowType>,
}

impl IrHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entry: BlockId(0),
            blocks: Vec::new(),
            value_types: Vec::new(),
        }
    }

    pub fn new_value(&mut self, ty: FlowType) -> ValueId {
        self.value_types.push(ty);
        ValueId(self.value_types.len() as u32 - 1)
    }

    pub fn create_block(&mut self, label: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            id,
            label: label.to_owned(),
            instructions: Vec::new(),
        });
        id
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn value_type(&self, value: ValueId) -> FlowType {
        self.value_types[value.0 as usize]
    }
}

/// A basic block: a label for diagnostics and a straight-line instruction
/// sequence ending in a terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct IrBlock {
    pub id: BlockId,
    pub label: String,
    pub instructions: Vec<IrInstr>,
}

impl IrBlock {
    pub fn push(&mut self, instruction: IrInstr) {
        self.instructions.push(instruction);
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self.instructions.last(),
            Some(
                IrInstr::Br { .. }
                    | IrInstr::CondBr { .. }
                    | IrInstr::Match { .. }
                    | IrInstr::Ret { .. }
            )
        )
    }
}

/// One `(literal, target)` case of a match terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct IrMatchCase {
    pub literal: Literal,
    pub block: BlockId,
}

/// IR instruction set.
#[derive(Debug, Clone, PartialEq)]
pub enum IrInstr {
    /// Reserve one mutable slot (a source variable).
    Alloca { result: ValueId, ty: FlowType },
    /// Read the current value of a slot.
    Load {
        result: ValueId,
        ty: FlowType,
        slot: ValueId,
    },
    /// Overwrite a slot.
    Store { slot: ValueId, value: ValueId },
    /// Materialize a literal.
    Const { result: ValueId, literal: Literal },
    /// Generic typed operation tagged with the VM opcode it lowers to.
    Vm {
        opcode: Opcode,
        ty: FlowType,
        result: Option<ValueId>,
        operands: Vec<ValueId>,
    },
    /// Construct a homogeneous array from element values.
    NewArray {
        result: ValueId,
        ty: FlowType,
        elements: Vec<ValueId>,
    },
    /// Invoke a value-producing native (`CALL`).
    Call {
        result: ValueId,
        ty: FlowType,
        kind: NativeKind,
        native: String,
        args: Vec<ValueId>,
    },
    /// Invoke a verdict-producing native (`HANDLER`).
    InvokeHandler { native: String, args: Vec<ValueId> },
    /// Match terminator: dispatch over string/regex cases.
    Match {
        op: MatchOp,
        condition: ValueId,
        cases: Vec<IrMatchCase>,
        else_block: BlockId,
    },
    /// Unconditional branch.
    Br { target: BlockId },
    /// Conditional branch on a boolean value.
    CondBr {
        condition: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Return the handler verdict.
    Ret { value: ValueId },
}
