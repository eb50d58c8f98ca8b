//! IR instruction definitions

use crate::compiler::types::IntType;
use crate::parser::{BinaryOp, Location};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual register (single assignment, infinite supply)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IrReg(pub u32);

impl IrReg {
    /// Creates a new virtual register with the given ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Index into the register type table
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IrReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Stack slot of a local variable or inlined parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

impl VarId {
    /// Index into the local slot table
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Basic block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Index into the block list
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Register value
    Reg(IrReg),
    /// Immediate
    Imm(i64),
    /// String table entry
    Str(usize),
    /// Map reference by name
    Map(String),
}

impl Operand {
    /// Register, if the operand is one
    pub fn reg(&self) -> Option<IrReg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Imm(value) => write!(f, "{}", value),
            Operand::Str(index) => write!(f, "str#{}", index),
            Operand::Map(name) => write!(f, "&{}", name),
        }
    }
}

/// Where an entry argument comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSource {
    /// Parameter of a plain entry function (the context)
    Context,
    /// Typed parameter of an entry wrapper macro, read from the context registers
    WrapperParam,
}

/// IR instruction (three-address code)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "inst", rename_all = "snake_case")]
pub enum IrInstruction {
    /// dst = entry argument `index`
    Arg {
        /// Destination
        dst: IrReg,
        /// Argument position
        index: u32,
        /// Context or wrapper parameter
        source: ArgSource,
    },
    /// dst = local
    ReadVar {
        /// Destination
        dst: IrReg,
        /// Local slot
        var: VarId,
    },
    /// local = src
    WriteVar {
        /// Local slot
        var: VarId,
        /// Value
        src: Operand,
    },
    /// Zero-fill a local slot
    ZeroVar {
        /// Local slot
        var: VarId,
    },
    /// dst = &local
    AddrOfVar {
        /// Destination
        dst: IrReg,
        /// Local slot
        var: VarId,
    },
    /// dst = global
    ReadGlobal {
        /// Destination
        dst: IrReg,
        /// Global name
        global: String,
        /// Access must not be cached or folded
        volatile: bool,
    },
    /// global = src
    WriteGlobal {
        /// Global name
        global: String,
        /// Value
        src: Operand,
        /// Access must not be cached or elided
        volatile: bool,
    },
    /// dst = &global
    AddrOfGlobal {
        /// Destination
        dst: IrReg,
        /// Global name
        global: String,
    },
    /// dst = *(addr + offset)
    Load {
        /// Destination
        dst: IrReg,
        /// Address
        addr: Operand,
        /// Byte offset
        offset: i64,
        /// Loaded width and signedness
        ty: IntType,
    },
    /// *(addr + offset) = src
    Store {
        /// Address
        addr: Operand,
        /// Byte offset
        offset: i64,
        /// Value
        src: Operand,
        /// Stored width
        ty: IntType,
    },
    /// dst = lhs op rhs, wrapping at the width of `ty`
    Bin {
        /// Destination
        dst: IrReg,
        /// Operator (comparisons produce 0 or 1)
        op: BinaryOp,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
        /// Operation type after the usual conversions
        ty: IntType,
    },
    /// dst = (to) src
    Cast {
        /// Destination
        dst: IrReg,
        /// Value
        src: Operand,
        /// Target integer type
        to: IntType,
    },
    /// dst = helper(args...)
    HelperCall {
        /// Destination, absent for void helpers
        dst: Option<IrReg>,
        /// Helper name
        helper: String,
        /// Kernel helper id
        id: u32,
        /// Arguments in order
        args: Vec<Operand>,
    },
}

impl IrInstruction {
    /// Register defined by this instruction
    pub fn dst(&self) -> Option<IrReg> {
        match self {
            IrInstruction::Arg { dst, .. }
            | IrInstruction::ReadVar { dst, .. }
            | IrInstruction::AddrOfVar { dst, .. }
            | IrInstruction::ReadGlobal { dst, .. }
            | IrInstruction::AddrOfGlobal { dst, .. }
            | IrInstruction::Load { dst, .. }
            | IrInstruction::Bin { dst, .. }
            | IrInstruction::Cast { dst, .. } => Some(*dst),
            IrInstruction::HelperCall { dst, .. } => *dst,
            IrInstruction::WriteVar { .. }
            | IrInstruction::ZeroVar { .. }
            | IrInstruction::WriteGlobal { .. }
            | IrInstruction::Store { .. } => None,
        }
    }

    /// Map names used as operands
    pub fn maps(&self) -> impl Iterator<Item = &str> {
        let args: &[Operand] = match self {
            IrInstruction::HelperCall { args, .. } => args,
            _ => &[],
        };
        args.iter().filter_map(|arg| match arg {
            Operand::Map(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Global touched by this instruction
    pub fn global(&self) -> Option<&str> {
        match self {
            IrInstruction::ReadGlobal { global, .. }
            | IrInstruction::WriteGlobal { global, .. }
            | IrInstruction::AddrOfGlobal { global, .. } => Some(global),
            _ => None,
        }
    }
}

impl fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrInstruction::Arg { dst, index, source } => {
                let source = match source {
                    ArgSource::Context => "ctx",
                    ArgSource::WrapperParam => "param",
                };
                write!(f, "{} = arg.{} {}", dst, source, index)
            }
            IrInstruction::ReadVar { dst, var } => write!(f, "{} = {}", dst, var),
            IrInstruction::WriteVar { var, src } => write!(f, "{} = {}", var, src),
            IrInstruction::ZeroVar { var } => write!(f, "{} = zeroed", var),
            IrInstruction::AddrOfVar { dst, var } => write!(f, "{} = &{}", dst, var),
            IrInstruction::ReadGlobal {
                dst,
                global,
                volatile,
            } => write!(
                f,
                "{} = {}@{}",
                dst,
                if *volatile { "volatile " } else { "" },
                global
            ),
            IrInstruction::WriteGlobal {
                global,
                src,
                volatile,
            } => write!(
                f,
                "{}@{} = {}",
                if *volatile { "volatile " } else { "" },
                global,
                src
            ),
            IrInstruction::AddrOfGlobal { dst, global } => write!(f, "{} = &@{}", dst, global),
            IrInstruction::Load {
                dst,
                addr,
                offset,
                ty,
            } => write!(f, "{} = load.{} [{} + {}]", dst, ty, addr, offset),
            IrInstruction::Store {
                addr,
                offset,
                src,
                ty,
            } => write!(f, "store.{} [{} + {}] = {}", ty, addr, offset, src),
            IrInstruction::Bin {
                dst,
                op,
                lhs,
                rhs,
                ty,
            } => write!(f, "{} = {} {}.{} {}", dst, lhs, op, ty, rhs),
            IrInstruction::Cast { dst, src, to } => write!(f, "{} = ({}) {}", dst, to, src),
            IrInstruction::HelperCall {
                dst, helper, args, ..
            } => {
                if let Some(dst) = dst {
                    write!(f, "{} = ", dst)?;
                }
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "call {}({})", helper, args.join(", "))
            }
        }
    }
}

/// Instruction with the source location it was lowered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrNode {
    /// Instruction
    pub inst: IrInstruction,
    /// Source location
    pub loc: Location,
}

/// Block terminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Terminator {
    /// Unconditional jump
    Jump {
        /// Target block
        target: BlockId,
    },
    /// Two-way branch on a non-zero test
    Branch {
        /// Tested value
        cond: Operand,
        /// Taken when non-zero
        then_block: BlockId,
        /// Taken when zero
        else_block: BlockId,
    },
    /// Return from the program
    Return {
        /// Return value
        value: Option<Operand>,
    },
}

impl Terminator {
    /// Successor blocks in order
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Return { .. } => Vec::new(),
        }
    }

    /// Rewrite block targets
    pub fn remap(&mut self, map: &dyn Fn(BlockId) -> BlockId) {
        match self {
            Terminator::Jump { target } => *target = map(*target),
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                *then_block = map(*then_block);
                *else_block = map(*else_block);
            }
            Terminator::Return { .. } => {}
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump { target } => write!(f, "jump {}", target),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "branch {} ? {} : {}", cond, then_block, else_block),
            Terminator::Return { value: Some(value) } => write!(f, "return {}", value),
            Terminator::Return { value: None } => write!(f, "return"),
        }
    }
}
