//! # Intermediate Representation (IR) for eBPF C Programs
//!
//! Each program's entry function, with every ordinary call inlined, is
//! lowered to a control-flow graph of basic blocks holding three-address
//! instructions. The safety checker and the artifact writer both work on
//! this form.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # IrReg, VarId, BlockId, Operand, IrInstruction, Terminator
//! ├── program.rs      # BasicBlock, LocalSlot, IrProgram (CFG representation)
//! ├── loops.rs        # Counted-loop recognition and trip counts
//! └── generator.rs    # IrGenerator: statements, expressions, inlining
//! ```
//!
//! ## Key Types
//!
//! - [`IrReg`] - Virtual register (single assignment, typed by [`IrProgram::registers`])
//! - [`VarId`] - Stack slot of a local variable
//! - [`IrInstruction`] - Three-address-code instruction
//! - [`Terminator`] - How control leaves a block (jump, branch, return)
//! - [`IrProgram`] - Lowered program with blocks, register types, locals and strings

mod generator;
mod instruction;
pub mod loops;
mod program;

pub use generator::{lower_program, IrGenerator};
pub use instruction::{
    ArgSource, BlockId, IrInstruction, IrNode, IrReg, Operand, Terminator, VarId,
};
pub use program::{BasicBlock, IrProgram, LocalSlot};
