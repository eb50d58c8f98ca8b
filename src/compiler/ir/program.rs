//! IR program and basic block definitions

use super::instruction::{BlockId, IrInstruction, IrNode, IrReg, Terminator, VarId};
use crate::compiler::types::CType;
use crate::parser::Location;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;

/// Basic block in the control flow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Block number (position in [`IrProgram::blocks`])
    pub id: BlockId,
    /// IR instructions in this block
    pub instructions: Vec<IrNode>,
    /// How control leaves the block
    pub terminator: Terminator,
    /// Location of the statement that ended the block
    pub terminator_loc: Location,
    /// Proven trip bound when this block is a loop header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_bound: Option<u64>,
}

impl BasicBlock {
    /// Create an empty block that returns nothing
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: Terminator::Return { value: None },
            terminator_loc: Location::default(),
            loop_bound: None,
        }
    }

    /// Successor blocks
    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }
}

/// Stack slot of a local variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSlot {
    /// Source name (inlined locals keep their callee's name)
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub ty: CType,
    /// Size in bytes
    pub size: u64,
}

/// Lowered program: basic blocks with the entry at index 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrProgram {
    /// Entry function name
    pub name: String,
    /// Blocks in deterministic order, entry first
    pub blocks: Vec<BasicBlock>,
    /// Type of every virtual register, by register number
    pub registers: Vec<CType>,
    /// Local slots, by slot number
    pub locals: Vec<LocalSlot>,
    /// String table for string literals
    pub strings: Vec<String>,
}

impl IrProgram {
    /// Create an empty program
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blocks: Vec::new(),
            registers: Vec::new(),
            locals: Vec::new(),
            strings: Vec::new(),
        }
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    /// Type of a register
    pub fn reg_type(&self, reg: IrReg) -> Option<&CType> {
        self.registers.get(reg.index())
    }

    /// Local slot by id
    pub fn local(&self, var: VarId) -> Option<&LocalSlot> {
        self.locals.get(var.index())
    }

    /// Iterate all instructions in block order
    pub fn instructions(&self) -> impl Iterator<Item = &IrNode> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Maps referenced by helper calls, sorted by name
    pub fn referenced_maps(&self) -> BTreeSet<String> {
        self.instructions()
            .flat_map(|node| node.inst.maps())
            .map(str::to_string)
            .collect()
    }

    /// Globals read, written or addressed, sorted by name
    pub fn referenced_globals(&self) -> BTreeSet<String> {
        self.instructions()
            .filter_map(|node| node.inst.global())
            .map(str::to_string)
            .collect()
    }

    /// Drop blocks unreachable from the entry and renumber the rest
    ///
    /// Surviving blocks keep their relative order, so the numbering depends
    /// only on the order blocks were created in.
    pub fn prune_unreachable(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        let mut reachable = vec![false; self.blocks.len()];
        let mut queue = VecDeque::from([BlockId(0)]);
        reachable[0] = true;
        while let Some(id) = queue.pop_front() {
            for succ in self.blocks[id.index()].successors() {
                if let Some(seen) = reachable.get_mut(succ.index()) {
                    if !*seen {
                        *seen = true;
                        queue.push_back(succ);
                    }
                }
            }
        }

        let mut renumber = vec![BlockId(0); self.blocks.len()];
        let mut next = 0u32;
        for (index, live) in reachable.iter().enumerate() {
            if *live {
                renumber[index] = BlockId(next);
                next += 1;
            }
        }

        let before = self.blocks.len();
        let blocks = std::mem::take(&mut self.blocks);
        self.blocks = blocks
            .into_iter()
            .filter(|block| reachable[block.id.index()])
            .map(|mut block| {
                block.id = renumber[block.id.index()];
                block.terminator.remap(&|target| renumber[target.index()]);
                block
            })
            .collect();
        tracing::debug!(
            program = %self.name,
            pruned = before - self.blocks.len(),
            blocks = self.blocks.len(),
            "pruned unreachable blocks"
        );
    }

    /// Human-readable listing
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "program {}", self.name);
        for (index, slot) in self.locals.iter().enumerate() {
            let _ = writeln!(out, "  local ${} {}: {}", index, slot.name, slot.ty);
        }
        for block in &self.blocks {
            match block.loop_bound {
                Some(bound) => {
                    let _ = writeln!(out, "{}: ; loop bound {}", block.id, bound);
                }
                None => {
                    let _ = writeln!(out, "{}:", block.id);
                }
            }
            for node in &block.instructions {
                let _ = writeln!(out, "    {}", node.inst);
            }
            let _ = writeln!(out, "    {}", block.terminator);
        }
        out
    }

    /// True when any instruction matches `pred`
    pub fn any_instruction(&self, pred: impl Fn(&IrInstruction) -> bool) -> bool {
        self.instructions().any(|node| pred(&node.inst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::instruction::Operand;

    #[test]
    fn test_prune_renumbers_in_order() {
        let mut program = IrProgram::new("p");
        for id in 0..4 {
            program.blocks.push(BasicBlock::new(BlockId(id)));
        }
        // 0 -> 2 -> 3, block 1 is dead
        program.blocks[0].terminator = Terminator::Jump { target: BlockId(2) };
        program.blocks[2].terminator = Terminator::Branch {
            cond: Operand::Imm(1),
            then_block: BlockId(3),
            else_block: BlockId(3),
        };
        program.prune_unreachable();
        assert_eq!(program.blocks.len(), 3);
        assert_eq!(
            program.blocks[0].terminator,
            Terminator::Jump { target: BlockId(1) }
        );
        assert_eq!(program.blocks[1].successors(), vec![BlockId(2), BlockId(2)]);
        assert!(program
            .blocks
            .iter()
            .enumerate()
            .all(|(i, b)| b.id.index() == i));
    }

    #[test]
    fn test_dump_lists_blocks() {
        let mut program = IrProgram::new("p");
        let mut block = BasicBlock::new(BlockId(0));
        block.loop_bound = Some(4);
        program.blocks.push(block);
        let text = program.dump();
        assert!(text.starts_with("program p"));
        assert!(text.contains("bb0: ; loop bound 4"));
        assert!(text.contains("return"));
    }
}
