//! # Program Safety Checker
//!
//! Validates lowered programs before they are written to the artifact:
//!
//! - values returned by nullable helpers are tested before every dereference
//! - helper calls match their signatures
//! - map operands exist, support the operation and agree on key/value sizes
//! - globals both read and written are reported as race hazards (advisory)
//!
//! The null check is a forward dataflow analysis over the block graph. Each
//! register and local slot carries a [`Nullness`]; states only move up the
//! lattice, so the worklist terminates on loops. Stack memory at a fixed
//! offset into a local is tracked like a local. A test narrows every copy of
//! the tested value, wherever it is held.

use super::helpers::{HelperSignature, HelperTable, ParamKind};
use super::ir::{BlockId, IrInstruction, IrNode, IrProgram, IrReg, Operand, Terminator, VarId};
use super::resolver::ResolvedUnit;
use super::types::CType;
use crate::error::{SemanticError, SemanticErrorKind};
use crate::parser::{BinaryOp, Location};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Null-safety state of one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Nullness {
    /// Not produced by a nullable helper
    NotDerived,
    /// Tested non-null on every path
    Checked,
    /// May be null on some path
    Unknown,
}

impl Nullness {
    fn join(self, other: Nullness) -> Nullness {
        self.max(other)
    }
}

/// Read/write summary of one global within a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRace {
    /// Global name
    pub global: String,
    /// First write
    pub location: Location,
}

/// Outcome of checking one program
#[derive(Debug, Default)]
pub struct SafetyReport {
    /// Blocking errors, deduplicated and ordered by location
    pub errors: Vec<SemanticError>,
    /// Globals both read and written, by name
    pub races: Vec<GlobalRace>,
}

impl SafetyReport {
    /// True when the program may be emitted
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Storage that keeps a value between instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    /// Scalar local
    Var(VarId),
    /// Bytes of a stack local at a fixed offset (member or element)
    Mem(VarId, i64),
}

impl Slot {
    fn var(self) -> VarId {
        match self {
            Slot::Var(var) | Slot::Mem(var, _) => var,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    regs: Vec<Nullness>,
    /// Register each register is a copy of
    copies: Vec<Option<IrReg>>,
    /// Nullness of stored values; a missing slot holds a non-derived value
    slots: BTreeMap<Slot, Nullness>,
    /// Register whose value each slot currently holds
    holds: BTreeMap<Slot, IrReg>,
}

impl State {
    fn new(program: &IrProgram) -> Self {
        State {
            regs: vec![Nullness::NotDerived; program.registers.len()],
            copies: vec![None; program.registers.len()],
            slots: BTreeMap::new(),
            holds: BTreeMap::new(),
        }
    }

    fn reg(&self, reg: IrReg) -> Nullness {
        self.regs.get(reg.index()).copied().unwrap_or(Nullness::NotDerived)
    }

    fn operand(&self, op: &Operand) -> Nullness {
        op.reg().map_or(Nullness::NotDerived, |reg| self.reg(reg))
    }

    fn slot(&self, slot: Slot) -> Nullness {
        self.slots.get(&slot).copied().unwrap_or(Nullness::NotDerived)
    }

    /// Register first holding the value `reg` holds
    fn root(&self, reg: IrReg) -> IrReg {
        self.copies.get(reg.index()).copied().flatten().unwrap_or(reg)
    }

    /// Define `reg` with a fresh value; whatever held its old value no longer does
    fn define(&mut self, reg: IrReg, value: Nullness, copy_of: Option<IrReg>) {
        for copy in self.copies.iter_mut() {
            if *copy == Some(reg) {
                *copy = None;
            }
        }
        self.holds.retain(|_, held| *held != reg);
        let copy_of = copy_of.map(|src| self.root(src)).filter(|root| *root != reg);
        if let Some(slot) = self.regs.get_mut(reg.index()) {
            *slot = value;
        }
        if let Some(slot) = self.copies.get_mut(reg.index()) {
            *slot = copy_of;
        }
    }

    /// `reg` takes the value stored in `slot`
    fn read(&mut self, reg: IrReg, slot: Slot) {
        let value = self.slot(slot);
        match self.holds.get(&slot).copied() {
            Some(held) => self.define(reg, value, Some(held)),
            None => {
                self.define(reg, value, None);
                self.holds.insert(slot, reg);
            }
        }
    }

    fn write(&mut self, slot: Slot, src: &Operand) {
        match self.operand(src) {
            Nullness::NotDerived => self.slots.remove(&slot),
            value => self.slots.insert(slot, value),
        };
        match src.reg() {
            Some(reg) => self.holds.insert(slot, self.root(reg)),
            None => self.holds.remove(&slot),
        };
    }

    /// Zero every slot of a local
    fn zero(&mut self, var: VarId) {
        self.slots.retain(|slot, _| slot.var() != var);
        self.forget(var);
    }

    /// A local may have been written behind our back
    fn forget(&mut self, var: VarId) {
        self.holds.retain(|slot, _| slot.var() != var);
    }

    /// The value `reg` holds is non-null; so is every copy of it
    fn narrow(&mut self, reg: IrReg) {
        let root = self.root(reg);
        let checked = |value: &mut Nullness| {
            if *value == Nullness::Unknown {
                *value = Nullness::Checked;
            }
        };
        for (index, value) in self.regs.iter_mut().enumerate() {
            let this = IrReg(index as u32);
            if this == reg || this == root || self.copies[index] == Some(root) {
                checked(value);
            }
        }
        for (slot, held) in &self.holds {
            if *held == root {
                if let Some(value) = self.slots.get_mut(slot) {
                    checked(value);
                }
            }
        }
    }

    /// Join `other` into `self`; true when anything changed
    fn join(&mut self, other: &State) -> bool {
        let mut changed = false;
        for (a, b) in self.regs.iter_mut().zip(&other.regs) {
            let joined = a.join(*b);
            changed |= joined != *a;
            *a = joined;
        }
        for (a, b) in self.copies.iter_mut().zip(&other.copies) {
            if a.is_some() && a != b {
                *a = None;
                changed = true;
            }
        }
        for (slot, value) in &other.slots {
            let current = self.slot(*slot);
            let joined = current.join(*value);
            if joined != current {
                self.slots.insert(*slot, joined);
                changed = true;
            }
        }
        let before = self.holds.len();
        self.holds
            .retain(|slot, held| other.holds.get(slot) == Some(&*held));
        changed |= self.holds.len() != before;
        changed
    }
}

/// Safety checker for one program
pub struct SafetyChecker<'a> {
    unit: &'a ResolvedUnit,
    helpers: &'a HelperTable,
    program: &'a IrProgram,
    /// Defining instruction of every register
    defs: HashMap<IrReg, &'a IrInstruction>,
    errors: Vec<SemanticError>,
}

/// Check one lowered program
pub fn check_program(unit: &ResolvedUnit, helpers: &HelperTable, program: &IrProgram) -> SafetyReport {
    SafetyChecker::new(unit, helpers, program).check()
}

impl<'a> SafetyChecker<'a> {
    /// Create a checker for `program`
    pub fn new(unit: &'a ResolvedUnit, helpers: &'a HelperTable, program: &'a IrProgram) -> Self {
        let defs = program
            .instructions()
            .filter_map(|node| node.inst.dst().map(|dst| (dst, &node.inst)))
            .collect();
        Self {
            unit,
            helpers,
            program,
            defs,
            errors: Vec::new(),
        }
    }

    /// Run every check
    pub fn check(mut self) -> SafetyReport {
        let program = self.program;
        let states = self.solve();
        for (block, state) in program.blocks.iter().zip(&states) {
            let Some(state) = state else {
                continue;
            };
            let mut state = state.clone();
            for node in &block.instructions {
                self.transfer(&mut state, node, true);
            }
        }
        for node in program.instructions() {
            if let IrInstruction::HelperCall { helper, args, .. } = &node.inst {
                self.check_helper_call(helper, args, node.loc);
            }
        }
        let races = self.global_races();

        let mut errors = self.errors;
        errors.sort_by(|a, b| {
            (a.location.line, a.location.column, a.kind, &a.message)
                .cmp(&(b.location.line, b.location.column, b.kind, &b.message))
        });
        errors.dedup();
        tracing::debug!(
            program = %program.name,
            errors = errors.len(),
            races = races.len(),
            "safety check finished"
        );
        SafetyReport { errors, races }
    }

    // ------------------------------------------------------------------
    // Null-check dataflow
    // ------------------------------------------------------------------

    /// Entry state of every reachable block
    fn solve(&mut self) -> Vec<Option<State>> {
        let program = self.program;
        let mut states: Vec<Option<State>> = vec![None; program.blocks.len()];
        if program.blocks.is_empty() {
            return states;
        }
        states[0] = Some(State::new(program));
        let mut queue = VecDeque::from([BlockId(0)]);
        let mut iterations = 0usize;

        while let Some(id) = queue.pop_front() {
            iterations += 1;
            let Some(block) = program.block(id) else {
                continue;
            };
            let Some(mut state) = states[id.index()].clone() else {
                continue;
            };
            for node in &block.instructions {
                self.transfer(&mut state, node, false);
            }
            let (then_guard, else_guard) = self.guards(block.id);
            let edges: Vec<(BlockId, Option<IrReg>)> = match &block.terminator {
                Terminator::Jump { target } => vec![(*target, None)],
                Terminator::Branch {
                    then_block,
                    else_block,
                    ..
                } => vec![(*then_block, then_guard), (*else_block, else_guard)],
                Terminator::Return { .. } => Vec::new(),
            };
            for (target, guard) in edges {
                let mut out = state.clone();
                if let Some(reg) = guard {
                    out.narrow(reg);
                }
                let Some(slot) = states.get_mut(target.index()) else {
                    continue;
                };
                let changed = match slot {
                    Some(existing) => existing.join(&out),
                    None => {
                        *slot = Some(out);
                        true
                    }
                };
                if changed && !queue.contains(&target) {
                    queue.push_back(target);
                }
            }
        }
        tracing::debug!(
            program = %program.name,
            iterations,
            "null-check fixpoint reached"
        );
        states
    }

    fn transfer(&mut self, state: &mut State, node: &IrNode, report: bool) {
        match &node.inst {
            IrInstruction::Arg { dst, .. }
            | IrInstruction::AddrOfVar { dst, .. }
            | IrInstruction::ReadGlobal { dst, .. }
            | IrInstruction::AddrOfGlobal { dst, .. } => {
                state.define(*dst, Nullness::NotDerived, None)
            }
            IrInstruction::ReadVar { dst, var } => state.read(*dst, Slot::Var(*var)),
            IrInstruction::WriteVar { var, src } => state.write(Slot::Var(*var), src),
            IrInstruction::ZeroVar { var } => state.zero(*var),
            IrInstruction::WriteGlobal { src, .. } => {
                if report {
                    self.check_escape(state, src, node.loc);
                }
            }
            IrInstruction::Load {
                dst, addr, offset, ..
            } => {
                if report {
                    self.check_deref(state, addr, node.loc);
                }
                match self.stack_slot(state, addr, *offset) {
                    Some(slot) => state.read(*dst, slot),
                    None => state.define(*dst, Nullness::NotDerived, None),
                }
            }
            IrInstruction::Store {
                addr, offset, src, ..
            } => {
                if report {
                    self.check_deref(state, addr, node.loc);
                }
                match self.stack_slot(state, addr, *offset) {
                    Some(slot) => state.write(slot, src),
                    None if report => self.check_escape(state, src, node.loc),
                    None => {}
                }
            }
            IrInstruction::Bin { dst, op, lhs, rhs, .. } => {
                // pointer arithmetic keeps the provenance of its operands
                let value = match op {
                    BinaryOp::Add | BinaryOp::Sub => state.operand(lhs).join(state.operand(rhs)),
                    _ => Nullness::NotDerived,
                };
                state.define(*dst, value, None);
            }
            IrInstruction::Cast { dst, src, to } => {
                let value = state.operand(src);
                // only a full-width cast keeps the value a zero test sees
                let copy_of = src.reg().filter(|_| to.bits == 64);
                state.define(*dst, value, copy_of);
            }
            IrInstruction::HelperCall {
                dst, helper, args, ..
            } => {
                let helpers = self.helpers;
                let signature = helpers.get(helper);
                if report {
                    if let Some(signature) = signature {
                        for (index, arg) in args.iter().enumerate() {
                            if signature.param(index) == Some(ParamKind::NonNullPtr) {
                                self.check_deref(state, arg, node.loc);
                            }
                        }
                    }
                }
                // a helper may write through any stack pointer it is given
                for arg in args {
                    if let Some(slot) = self.stack_slot(state, arg, 0) {
                        state.forget(slot.var());
                    }
                }
                if let Some(dst) = dst {
                    let nullable = signature.is_some_and(|s| s.nullable);
                    let value = if nullable {
                        Nullness::Unknown
                    } else {
                        Nullness::NotDerived
                    };
                    state.define(*dst, value, None);
                }
            }
        }
    }

    /// Stack slot an address points at, if it is a fixed offset into a local
    fn stack_slot(&self, state: &State, addr: &Operand, offset: i64) -> Option<Slot> {
        let mut current = state.root(addr.reg()?);
        let mut offset = offset;
        for _ in 0..=self.defs.len() {
            match self.defs.get(&current)? {
                IrInstruction::AddrOfVar { var, .. } => return Some(Slot::Mem(*var, offset)),
                IrInstruction::Bin {
                    op: BinaryOp::Add,
                    lhs: Operand::Reg(base),
                    rhs: Operand::Imm(step),
                    ..
                } => {
                    offset = offset.wrapping_add(*step);
                    current = state.root(*base);
                }
                IrInstruction::Cast {
                    src: Operand::Reg(src),
                    ..
                } => current = state.root(*src),
                _ => return None,
            }
        }
        None
    }

    /// A possibly-null value leaving the stack can no longer be tracked
    fn check_escape(&mut self, state: &State, src: &Operand, loc: Location) {
        let Some(reg) = src.reg() else {
            return;
        };
        if state.reg(reg) != Nullness::Unknown {
            return;
        }
        let name = self
            .origin(reg)
            .map_or_else(|| "pointer".to_string(), |name| format!("`{}`", name));
        self.errors.push(SemanticError::new(
            SemanticErrorKind::MissingNullCheck,
            format!(
                "{} may be NULL when stored outside the stack; test it against NULL first",
                name
            ),
            loc,
        ));
    }

    fn check_deref(&mut self, state: &State, addr: &Operand, loc: Location) {
        let Some(reg) = addr.reg() else {
            return;
        };
        if state.reg(reg) != Nullness::Unknown {
            return;
        }
        let message = match self.origin(reg) {
            Some(name) => format!(
                "`{}` may be NULL here; test it against NULL before dereferencing",
                name
            ),
            None => "pointer may be NULL here; test it against NULL before dereferencing".to_string(),
        };
        self.errors
            .push(SemanticError::new(SemanticErrorKind::MissingNullCheck, message, loc));
    }

    /// Source-level name of a register's value, for messages
    fn origin(&self, reg: IrReg) -> Option<String> {
        let mut current = reg;
        for _ in 0..self.defs.len() {
            match self.defs.get(&current)? {
                IrInstruction::ReadVar { var, .. } => {
                    return self.program.local(*var).map(|slot| slot.name.clone())
                }
                IrInstruction::HelperCall { helper, .. } => {
                    return Some(format!("result of {}()", helper))
                }
                IrInstruction::Cast { src, .. } | IrInstruction::Bin { lhs: src, .. } => {
                    current = src.reg()?;
                }
                _ => return None,
            }
        }
        None
    }

    /// Register proven non-null on the then and else edges of a block's branch
    fn guards(&self, id: BlockId) -> (Option<IrReg>, Option<IrReg>) {
        let Some(block) = self.program.block(id) else {
            return (None, None);
        };
        let Terminator::Branch {
            cond: Operand::Reg(cond),
            ..
        } = &block.terminator
        else {
            return (None, None);
        };

        // `if (p)` guards p; `if (p != 0)` / `if (p == 0)` as values guard p on one edge
        match self.defs.get(cond) {
            Some(IrInstruction::Bin {
                op: op @ (BinaryOp::Ne | BinaryOp::Eq),
                lhs,
                rhs,
                ..
            }) => match (lhs, rhs) {
                (Operand::Reg(reg), Operand::Imm(0)) | (Operand::Imm(0), Operand::Reg(reg)) => {
                    if *op == BinaryOp::Ne {
                        (Some(*reg), None)
                    } else {
                        (None, Some(*reg))
                    }
                }
                _ => (Some(*cond), None),
            },
            _ => (Some(*cond), None),
        }
    }

    // ------------------------------------------------------------------
    // Helper signatures and maps
    // ------------------------------------------------------------------

    fn check_helper_call(&mut self, helper: &str, args: &[Operand], loc: Location) {
        let helpers = self.helpers;
        let Some(signature) = helpers.get(helper) else {
            self.errors.push(SemanticError::new(
                SemanticErrorKind::UndeclaredIdentifier,
                format!("`{}` is not a known helper", helper),
                loc,
            ));
            return;
        };
        let (min, max) = signature.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{} to {}", min, max)
            };
            self.errors.push(SemanticError::new(
                SemanticErrorKind::HelperSignatureMismatch,
                format!(
                    "`{}` takes {} argument(s) but {} were given",
                    helper,
                    expected,
                    args.len()
                ),
                loc,
            ));
            return;
        }
        for (index, arg) in args.iter().enumerate() {
            let Some(kind) = signature.param(index) else {
                continue;
            };
            if !self.accepts(kind, arg) {
                self.errors.push(SemanticError::new(
                    SemanticErrorKind::HelperSignatureMismatch,
                    format!(
                        "argument {} of `{}` must be {}, found {}",
                        index + 1,
                        helper,
                        describe_kind(kind),
                        self.describe_operand(arg)
                    ),
                    loc,
                ));
            }
        }
        self.check_map_access(signature, args, loc);
    }

    fn accepts(&self, kind: ParamKind, arg: &Operand) -> bool {
        let ty = arg.reg().and_then(|reg| self.program.reg_type(reg));
        match kind {
            ParamKind::Any => !matches!(arg, Operand::Map(_)),
            ParamKind::Map => matches!(arg, Operand::Map(_)),
            ParamKind::Scalar => match arg {
                Operand::Imm(_) => true,
                Operand::Reg(_) => ty.is_some_and(|t| t.is_scalar() && !t.is_pointer()),
                _ => false,
            },
            ParamKind::Ptr => match arg {
                Operand::Imm(value) => *value == 0,
                Operand::Str(_) => true,
                Operand::Reg(_) => ty.is_some_and(CType::is_pointer),
                Operand::Map(_) => false,
            },
            ParamKind::NonNullPtr => match arg {
                Operand::Str(_) => true,
                Operand::Reg(_) => ty.is_some_and(CType::is_pointer),
                _ => false,
            },
            ParamKind::FormatStr => match arg {
                Operand::Str(_) => true,
                Operand::Reg(_) => ty
                    .and_then(CType::pointee)
                    .is_some_and(|t| matches!(t.int_type(), Some(it) if it.bits == 8) && !t.is_pointer()),
                _ => false,
            },
        }
    }

    fn describe_operand(&self, arg: &Operand) -> String {
        match arg {
            Operand::Imm(value) => format!("constant {}", value),
            Operand::Str(_) => "a string literal".to_string(),
            Operand::Map(name) => format!("map `{}`", name),
            Operand::Reg(reg) => match self.program.reg_type(*reg) {
                Some(ty) => format!("`{}`", ty),
                None => "a value".to_string(),
            },
        }
    }

    fn check_map_access(&mut self, signature: &HelperSignature, args: &[Operand], loc: Location) {
        let Some(index) = signature.map_param() else {
            return;
        };
        let Some(Operand::Map(name)) = args.get(index) else {
            return;
        };
        let unit = self.unit;
        let Some(def) = unit.map(name) else {
            let err = match unit.invalid_maps.get(name) {
                Some(reason) => reason.clone(),
                None => SemanticError::new(
                    SemanticErrorKind::UndefinedMap,
                    format!("map `{}` is not declared in this file", name),
                    loc,
                ),
            };
            self.errors.push(err);
            return;
        };
        let Some(op) = signature.map_op else {
            return;
        };
        if !op.supports(&def.kind) {
            self.errors.push(SemanticError::new(
                SemanticErrorKind::MapTypeMismatch,
                format!(
                    "`{}` cannot be used on map `{}` of type {}",
                    signature.name, name, def.kind
                ),
                loc,
            ));
            return;
        }

        let key_size = def
            .key_size
            .or_else(|| def.key_type.as_ref().and_then(|t| unit.size_of(t)));
        let value_size = def
            .value_size
            .or_else(|| def.value_type.as_ref().and_then(|t| unit.size_of(t)));
        for (position, expected, what) in [
            (op.key_arg(), key_size, "key"),
            (op.value_arg(), value_size, "value"),
        ] {
            let (Some(position), Some(expected)) = (position, expected) else {
                continue;
            };
            let Some(actual) = args.get(position).and_then(|arg| self.pointee_size(arg)) else {
                continue;
            };
            if actual != expected {
                self.errors.push(SemanticError::new(
                    SemanticErrorKind::MapTypeMismatch,
                    format!(
                        "{} of map `{}` is {} bytes but the argument points to {} bytes",
                        what, name, expected, actual
                    ),
                    loc,
                ));
            }
        }
    }

    /// Size of what a pointer operand points at, when known
    fn pointee_size(&self, arg: &Operand) -> Option<u64> {
        let ty = self.program.reg_type(arg.reg()?)?;
        match ty.pointee()? {
            CType::Void => None,
            pointee => self.unit.size_of(pointee),
        }
    }

    // ------------------------------------------------------------------
    // Shared globals
    // ------------------------------------------------------------------

    fn global_races(&self) -> Vec<GlobalRace> {
        #[derive(Default)]
        struct Access {
            read: bool,
            write: Option<Location>,
        }

        // registers holding (an offset into) a global's address
        let mut provenance: HashMap<IrReg, &str> = HashMap::new();
        let mut access: BTreeMap<&str, Access> = BTreeMap::new();
        for node in self.program.instructions() {
            match &node.inst {
                IrInstruction::ReadGlobal { global, .. } => {
                    access.entry(global).or_default().read = true;
                }
                IrInstruction::WriteGlobal { global, .. } => {
                    access.entry(global).or_default().write.get_or_insert(node.loc);
                }
                IrInstruction::AddrOfGlobal { dst, global } => {
                    provenance.insert(*dst, global);
                }
                IrInstruction::Bin { dst, lhs, rhs, .. } => {
                    let base = [lhs, rhs]
                        .into_iter()
                        .find_map(|op| op.reg().and_then(|reg| provenance.get(&reg).copied()));
                    if let Some(global) = base {
                        provenance.insert(*dst, global);
                    }
                }
                IrInstruction::Cast { dst, src, .. } => {
                    if let Some(global) = src.reg().and_then(|reg| provenance.get(&reg).copied()) {
                        provenance.insert(*dst, global);
                    }
                }
                IrInstruction::Load { addr, .. } => {
                    if let Some(global) = addr.reg().and_then(|reg| provenance.get(&reg).copied()) {
                        access.entry(global).or_default().read = true;
                    }
                }
                IrInstruction::Store { addr, .. } => {
                    if let Some(global) = addr.reg().and_then(|reg| provenance.get(&reg).copied()) {
                        access.entry(global).or_default().write.get_or_insert(node.loc);
                    }
                }
                IrInstruction::HelperCall { args, .. } => {
                    for arg in args {
                        if let Some(global) = arg.reg().and_then(|reg| provenance.get(&reg).copied()) {
                            access.entry(global).or_default().read = true;
                        }
                    }
                }
                _ => {}
            }
        }
        access
            .into_iter()
            .filter_map(|(global, access)| match access {
                Access {
                    read: true,
                    write: Some(location),
                } => Some(GlobalRace {
                    global: global.to_string(),
                    location,
                }),
                _ => None,
            })
            .collect()
    }
}

fn describe_kind(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Scalar => "an integer",
        ParamKind::Ptr => "a pointer",
        ParamKind::NonNullPtr => "a non-null pointer",
        ParamKind::Map => "a map reference",
        ParamKind::FormatStr => "a format string",
        ParamKind::Any => "a value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::lower_program;
    use crate::compiler::resolver::resolve;
    use crate::compiler::CompileOptions;
    use crate::parser::parse_source;

    fn check(source: &str, entry: &str) -> SafetyReport {
        let options = CompileOptions::default();
        let unit = resolve(&parse_source(source).unwrap(), "t.bpf.c", &options);
        let def = unit.function(entry).unwrap().clone();
        let program = lower_program(&unit, &def, &options).unwrap();
        check_program(&unit, &options.helpers, &program)
    }

    fn kinds(report: &SafetyReport) -> Vec<SemanticErrorKind> {
        report.errors.iter().map(|e| e.kind).collect()
    }

    const RINGBUF: &str = r#"
struct event { __u32 pid; char comm[16]; };
struct {
    __uint(type, BPF_MAP_TYPE_RINGBUF);
    __uint(max_entries, 256 * 1024);
} rb SEC(".maps");
"#;

    const HASH: &str = r#"
struct {
    __uint(type, BPF_MAP_TYPE_HASH);
    __uint(max_entries, 64);
    __type(key, __u32);
    __type(value, __u64);
} counts SEC(".maps");
"#;

    #[test]
    fn test_guarded_ringbuf_passes() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               struct event *e = bpf_ringbuf_reserve(&rb, sizeof(*e), 0);\n\
               if (!e) return 0;\n\
               e->pid = bpf_get_current_pid_tgid() >> 32;\n\
               bpf_get_current_comm(&e->comm, sizeof(e->comm));\n\
               bpf_ringbuf_submit(e, 0);\n\
               return 0;\n\
             }}",
            RINGBUF
        );
        let report = check(&source, "prog");
        assert!(report.passed(), "{:?}", report.errors);
    }

    #[test]
    fn test_unguarded_ringbuf_fails() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               struct event *e = bpf_ringbuf_reserve(&rb, sizeof(*e), 0);\n\
               e->pid = 1;\n\
               bpf_ringbuf_submit(e, 0);\n\
               return 0;\n\
             }}",
            RINGBUF
        );
        let report = check(&source, "prog");
        assert_eq!(
            kinds(&report),
            vec![
                SemanticErrorKind::MissingNullCheck,
                SemanticErrorKind::MissingNullCheck
            ]
        );
        assert!(report.errors[0].message.contains("`e`"));
        assert!(report.errors[0].location.line < report.errors[1].location.line);
    }

    #[test]
    fn test_guard_inside_logical_and() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               if (v != NULL && *v > 10) {{ *v = 0; }}\n\
               return 0;\n\
             }}",
            HASH
        );
        assert!(check(&source, "prog").passed());
    }

    #[test]
    fn test_lookup_checked_only_on_one_path() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               if (bpf_get_prandom_u32() & 1) {{ if (!v) return 0; }}\n\
               *v += 1;\n\
               return 0;\n\
             }}",
            HASH
        );
        assert_eq!(kinds(&check(&source, "prog")), vec![SemanticErrorKind::MissingNullCheck]);
    }

    #[test]
    fn test_guard_holds_across_loop() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               if (!v) return 0;\n\
               for (int i = 0; i < 8; i++) {{ *v += i; }}\n\
               return 0;\n\
             }}",
            HASH
        );
        assert!(check(&source, "prog").passed());
    }

    #[test]
    fn test_assignment_inside_condition_guards() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v;\n\
               if ((v = bpf_map_lookup_elem(&counts, &key)) != NULL) {{ *v = 1; }}\n\
               return 0;\n\
             }}",
            HASH
        );
        let report = check(&source, "prog");
        assert!(report.passed(), "{:?}", report.errors);
    }

    #[test]
    fn test_cast_guard_covers_pointer() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               if (!(long)v) return 0;\n\
               *v = 1;\n\
               return 0;\n\
             }}",
            HASH
        );
        let report = check(&source, "prog");
        assert!(report.passed(), "{:?}", report.errors);
    }

    #[test]
    fn test_guarding_a_copy_covers_the_original() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               __u64 *w = v;\n\
               if (!w) return 0;\n\
               *v = 1;\n\
               *w = 2;\n\
               return 0;\n\
             }}",
            HASH
        );
        let report = check(&source, "prog");
        assert!(report.passed(), "{:?}", report.errors);
    }

    #[test]
    fn test_reassigned_copy_is_not_guarded() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *v = bpf_map_lookup_elem(&counts, &key);\n\
               __u64 *w = v;\n\
               v = bpf_map_lookup_elem(&counts, &key);\n\
               if (!w) return 0;\n\
               *v = 1;\n\
               return 0;\n\
             }}",
            HASH
        );
        assert_eq!(kinds(&check(&source, "prog")), vec![SemanticErrorKind::MissingNullCheck]);
    }

    #[test]
    fn test_pointer_kept_in_struct_member() {
        let unguarded = format!(
            "struct holder {{ __u64 *p; }};\n{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               struct holder h = {{}};\n\
               h.p = bpf_map_lookup_elem(&counts, &key);\n\
               *h.p = 1;\n\
               return 0;\n\
             }}",
            HASH
        );
        let report = check(&unguarded, "prog");
        assert_eq!(kinds(&report), vec![SemanticErrorKind::MissingNullCheck]);

        let guarded = unguarded.replace("*h.p = 1;", "if (h.p) *h.p = 1;");
        let report = check(&guarded, "prog");
        assert!(report.passed(), "{:?}", report.errors);
    }

    #[test]
    fn test_pointer_kept_in_array_element() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               __u64 *arr[2];\n\
               arr[0] = bpf_map_lookup_elem(&counts, &key);\n\
               arr[1] = 0;\n\
               *arr[0] = 1;\n\
               return 0;\n\
             }}",
            HASH
        );
        assert_eq!(kinds(&check(&source, "prog")), vec![SemanticErrorKind::MissingNullCheck]);
    }

    #[test]
    fn test_unchecked_pointer_stored_off_stack() {
        let source = format!(
            "{}{}struct slot {{ __u64 *p; }};\n\
             SEC(\"xdp\") int prog(void *ctx) {{\n\
               __u32 key = 0;\n\
               struct slot *s = bpf_ringbuf_reserve(&rb, sizeof(*s), 0);\n\
               if (!s) return 0;\n\
               s->p = bpf_map_lookup_elem(&counts, &key);\n\
               bpf_ringbuf_submit(s, 0);\n\
               return 0;\n\
             }}",
            RINGBUF, HASH
        );
        let report = check(&source, "prog");
        assert_eq!(kinds(&report), vec![SemanticErrorKind::MissingNullCheck]);
        assert!(report.errors[0].message.contains("outside the stack"));
    }

    #[test]
    fn test_fetched_but_unused_is_fine() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{ __u32 key = 0; void *v = bpf_map_lookup_elem(&counts, &key); return 0; }}",
            HASH
        );
        assert!(check(&source, "prog").passed());
    }

    #[test]
    fn test_key_size_mismatch() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{ __u64 key = 0; bpf_map_delete_elem(&counts, &key); return 0; }}",
            HASH
        );
        let report = check(&source, "prog");
        assert_eq!(kinds(&report), vec![SemanticErrorKind::MapTypeMismatch]);
        assert!(report.errors[0].message.contains("4 bytes"));
    }

    #[test]
    fn test_operation_unsupported_by_kind() {
        let source = format!(
            "{}SEC(\"xdp\") int prog(void *ctx) {{ __u32 key = 0; bpf_map_lookup_elem(&rb, &key); return 0; }}",
            RINGBUF
        );
        assert_eq!(kinds(&check(&source, "prog")), vec![SemanticErrorKind::MapTypeMismatch]);
    }

    #[test]
    fn test_undefined_map() {
        let report = check(
            "SEC(\"xdp\") int prog(void *ctx) { __u32 key = 0; bpf_map_delete_elem(&nowhere, &key); return 0; }",
            "prog",
        );
        assert_eq!(kinds(&report), vec![SemanticErrorKind::UndefinedMap]);
    }

    #[test]
    fn test_helper_arity_and_category() {
        let report = check(
            "SEC(\"xdp\") int prog(void *ctx) { bpf_ktime_get_ns(1); bpf_get_current_comm(0, 16); return 0; }",
            "prog",
        );
        assert_eq!(
            kinds(&report),
            vec![
                SemanticErrorKind::HelperSignatureMismatch,
                SemanticErrorKind::HelperSignatureMismatch
            ]
        );
    }

    #[test]
    fn test_read_and_written_globals_race() {
        let report = check(
            "struct pair { __u64 a; __u64 b; };\n\
             struct pair w = {};\n\
             volatile __u64 prev = 0;\n\
             __u64 only_read = 3;\n\
             SEC(\"xdp\") int prog(void *ctx) {\n\
               __u64 ts = bpf_ktime_get_ns();\n\
               bpf_printk(\"%lu %lu\", w.b, only_read);\n\
               w.a = ts;\n\
               prev = prev + 1;\n\
               return 0;\n\
             }",
            "prog",
        );
        assert!(report.passed());
        let names: Vec<&str> = report.races.iter().map(|r| r.global.as_str()).collect();
        assert_eq!(names, vec!["prev", "w"]);
    }
}
