//! IR Generator - lowers entry functions to basic-block IR
//!
//! One [`IrGenerator`] lowers one program: the entry function with every
//! ordinary call spliced in at its call site. Helper calls stay opaque.
//!
//! Lowering does not stop at the first semantic error. A failed operand is
//! replaced by a poison value (`void`-typed zero) that later operations
//! accept silently, so each mistake is reported once.
//!
//! ## Conventions
//!
//! - Locals live in stack slots ([`VarId`]) and are read and written with
//!   explicit instructions; registers are single-assignment temporaries.
//! - `known` tracks slots holding a known constant in the current block,
//!   which is how loop counters get their initial value.
//! - Blocks are created in source order and never reordered; unreachable
//!   ones are pruned at the end.

use super::instruction::{
    ArgSource, BlockId, IrInstruction, IrNode, IrReg, Operand, Terminator, VarId,
};
use super::loops::{self, LoopKind};
use super::program::{BasicBlock, IrProgram, LocalSlot};
use crate::compiler::const_eval::{self, ConstEnv, ConstValue};
use crate::compiler::helpers::{HelperSignature, HelperTable, ParamKind};
use crate::compiler::inliner;
use crate::compiler::resolver::ResolvedUnit;
use crate::compiler::types::{CType, IntType};
use crate::compiler::CompileOptions;
use crate::error::{SemanticError, SemanticErrorKind};
use crate::parser::{
    BinaryOp, Designator, EntryWrapper, Expr, ExprKind, FunctionDef, InitItem, Initializer,
    LocalDecl, Location, Stmt, StmtKind, TypeExpr, UnaryOp,
};
use std::collections::{HashMap, HashSet};

/// Nesting limit for inlined calls (recursion is rejected before lowering)
const MAX_INLINE_DEPTH: usize = 64;

/// Limit on inlined call sites per program, counting every expansion
pub const MAX_INLINED_CALLS: usize = 4096;

/// Name of compiler-introduced temporaries
const TEMP_NAME: &str = "%tmp";

#[derive(Debug, Clone)]
enum Binding {
    /// Local slot
    Var(VarId),
    /// Inlined parameter bound to a map
    Map(String),
}

#[derive(Debug, Clone)]
struct Value {
    op: Operand,
    ty: CType,
}

impl Value {
    fn new(op: Operand, ty: CType) -> Self {
        Value { op, ty }
    }

    fn imm(value: i64, ty: IntType) -> Self {
        Value::new(Operand::Imm(ty.normalize(value)), CType::Int(ty))
    }

    fn poison() -> Self {
        Value::new(Operand::Imm(0), CType::Void)
    }

    fn is_poison(&self) -> bool {
        self.ty == CType::Void
    }
}

/// Assignable location
#[derive(Debug, Clone)]
enum Place {
    Var(VarId, CType),
    Global {
        name: String,
        ty: CType,
        volatile: bool,
    },
    Mem {
        base: Operand,
        offset: i64,
        ty: CType,
    },
}

impl Place {
    fn ty(&self) -> &CType {
        match self {
            Place::Var(_, ty) | Place::Global { ty, .. } | Place::Mem { ty, .. } => ty,
        }
    }
}

/// Function being lowered (the entry or an inlined callee)
struct Frame {
    scopes: Vec<HashMap<String, Binding>>,
    /// Continuation block and return slot of an inlined call
    exit: Option<(BlockId, Option<VarId>)>,
    ret: CType,
    /// Loops entered before this frame (not targets for its break/continue)
    loop_base: usize,
}

#[derive(Debug, Clone, Copy)]
struct LoopTargets {
    break_to: BlockId,
    continue_to: BlockId,
}

/// IR Generator - lowers one entry function
pub struct IrGenerator<'a> {
    unit: &'a ResolvedUnit,
    helpers: &'a HelperTable,
    max_loop_iterations: u64,
    program: IrProgram,
    current: BlockId,
    /// Blocks whose terminator is final
    closed: Vec<bool>,
    frames: Vec<Frame>,
    loops: Vec<LoopTargets>,
    known: HashMap<VarId, i64>,
    escaped: HashSet<VarId>,
    /// Calls inlined so far
    inlined: usize,
    errors: Vec<SemanticError>,
}

/// Lower one program's entry function
pub fn lower_program(
    unit: &ResolvedUnit,
    entry: &FunctionDef,
    options: &CompileOptions,
) -> Result<IrProgram, Vec<SemanticError>> {
    IrGenerator::new(unit, options).generate(entry)
}

impl<'a> IrGenerator<'a> {
    /// Create a generator over a resolved unit
    pub fn new(unit: &'a ResolvedUnit, options: &'a CompileOptions) -> Self {
        Self {
            unit,
            helpers: options.helpers.as_ref(),
            max_loop_iterations: options.max_loop_iterations,
            program: IrProgram::new(""),
            current: BlockId(0),
            closed: Vec::new(),
            frames: Vec::new(),
            loops: Vec::new(),
            known: HashMap::new(),
            escaped: HashSet::new(),
            inlined: 0,
            errors: Vec::new(),
        }
    }

    /// Lower `entry` and everything it calls
    pub fn generate(mut self, entry: &FunctionDef) -> Result<IrProgram, Vec<SemanticError>> {
        self.program.name = entry.name.clone();
        let first = self.new_block();
        self.switch_to(first);

        let ret = self.resolve(&entry.ret, entry.loc).unwrap_or_else(CType::s32);
        self.frames.push(Frame {
            scopes: vec![HashMap::new()],
            exit: None,
            ret: ret.clone(),
            loop_base: 0,
        });
        self.bind_entry_params(entry);
        self.lower_stmts(&entry.body);
        if !self.is_closed() {
            let value = (ret != CType::Void).then_some(Operand::Imm(0));
            self.terminate(Terminator::Return { value }, entry.loc);
        }
        self.frames.pop();

        if !self.errors.is_empty() {
            tracing::debug!(
                program = %entry.name,
                errors = self.errors.len(),
                "lowering failed"
            );
            return Err(self.errors);
        }
        self.program.prune_unreachable();
        tracing::debug!(
            program = %entry.name,
            blocks = self.program.blocks.len(),
            registers = self.program.registers.len(),
            locals = self.program.locals.len(),
            "lowered program"
        );
        Ok(self.program)
    }

    fn bind_entry_params(&mut self, entry: &FunctionDef) {
        let source = match entry.wrapper {
            Some(wrapper) => {
                let ctx = match wrapper {
                    EntryWrapper::Kprobe | EntryWrapper::Kretprobe => {
                        CType::struct_named("pt_regs").pointer_to()
                    }
                    EntryWrapper::Prog => CType::u64().pointer_to(),
                };
                self.bind_arg("ctx", ctx, 0, ArgSource::Context, entry.loc);
                ArgSource::WrapperParam
            }
            None => ArgSource::Context,
        };
        for (index, param) in entry.params.iter().enumerate() {
            let Some(ty) = self.resolve(&param.ty, param.loc) else {
                continue;
            };
            let name = param.name.as_deref().unwrap_or("");
            self.bind_arg(name, ty, index as u32, source, param.loc);
        }
    }

    fn bind_arg(&mut self, name: &str, ty: CType, index: u32, source: ArgSource, loc: Location) {
        let dst = self.alloc_reg(ty.clone());
        self.emit(IrInstruction::Arg { dst, index, source }, loc);
        if name.is_empty() {
            return;
        }
        if let Some(var) = self.new_local(name, ty, loc) {
            self.emit(
                IrInstruction::WriteVar {
                    var,
                    src: Operand::Reg(dst),
                },
                loc,
            );
            self.bind(name, Binding::Var(var));
        }
    }

    // ------------------------------------------------------------------
    // Blocks, registers, slots
    // ------------------------------------------------------------------

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.program.blocks.len() as u32);
        self.program.blocks.push(BasicBlock::new(id));
        self.closed.push(false);
        id
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
        self.known.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed[self.current.index()]
    }

    fn emit(&mut self, inst: IrInstruction, loc: Location) {
        if self.is_closed() {
            // code after return/break/continue gets a block nothing jumps to
            let dead = self.new_block();
            self.switch_to(dead);
        }
        self.program.blocks[self.current.index()]
            .instructions
            .push(IrNode { inst, loc });
    }

    fn terminate(&mut self, terminator: Terminator, loc: Location) {
        if self.is_closed() {
            return;
        }
        let block = &mut self.program.blocks[self.current.index()];
        block.terminator = terminator;
        block.terminator_loc = loc;
        self.closed[self.current.index()] = true;
    }

    fn jump(&mut self, target: BlockId, loc: Location) {
        self.terminate(Terminator::Jump { target }, loc);
    }

    fn alloc_reg(&mut self, ty: CType) -> IrReg {
        let reg = IrReg::new(self.program.registers.len() as u32);
        self.program.registers.push(ty);
        reg
    }

    fn new_local(&mut self, name: &str, ty: CType, loc: Location) -> Option<VarId> {
        let Some(size) = self.unit.size_of(&ty) else {
            self.error(
                SemanticErrorKind::UnknownType,
                format!("`{}` has incomplete type `{}`", name, ty),
                loc,
            );
            return None;
        };
        let var = VarId(self.program.locals.len() as u32);
        self.program.locals.push(LocalSlot {
            name: name.to_string(),
            ty,
            size,
        });
        Some(var)
    }

    fn local_type(&self, var: VarId) -> CType {
        self.program
            .local(var)
            .map_or(CType::Void, |slot| slot.ty.clone())
    }

    fn intern(&mut self, text: &str) -> usize {
        if let Some(index) = self.program.strings.iter().position(|s| s == text) {
            return index;
        }
        self.program.strings.push(text.to_string());
        self.program.strings.len() - 1
    }

    fn error(&mut self, kind: SemanticErrorKind, message: impl Into<String>, loc: Location) {
        let err = SemanticError::new(kind, message, loc);
        tracing::debug!(program = %self.program.name, error = %err, "lowering error");
        self.errors.push(err);
    }

    fn resolve(&mut self, ty: &TypeExpr, loc: Location) -> Option<CType> {
        match self.unit.resolve_type(ty, loc) {
            Ok(ty) => Some(ty),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn bind(&mut self, name: &str, binding: Binding) {
        if let Some(scope) = self.frames.last_mut().and_then(|f| f.scopes.last_mut()) {
            scope.insert(name.to_string(), binding);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames
            .last()?
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
    }

    fn push_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.push(HashMap::new());
        }
    }

    fn pop_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.pop();
        }
    }

    /// Map named by `name` in the current scope, if it is one
    fn map_name(&self, name: &str) -> Option<String> {
        match self.lookup(name) {
            Some(Binding::Map(map)) => Some(map.clone()),
            Some(Binding::Var(_)) => None,
            None if self.unit.global(name).is_none() && self.unit.is_map(name) => {
                Some(name.to_string())
            }
            None => None,
        }
    }

    /// `&name` or `name` used as a map reference
    ///
    /// In a map parameter position an unknown name is still taken as a map,
    /// so the safety checker reports it as undefined.
    fn map_reference(&self, arg: &Expr, map_position: bool) -> Option<String> {
        let name = match &arg.kind {
            ExprKind::Unary {
                op: UnaryOp::AddrOf,
                operand,
            } => operand.as_ident()?,
            ExprKind::Ident(name) => name.as_str(),
            _ => return None,
        };
        if let Some(map) = self.map_name(name) {
            return Some(map);
        }
        let unknown = self.lookup(name).is_none()
            && self.unit.global(name).is_none()
            && self.unit.function(name).is_none()
            && self.constant(name).is_none();
        (map_position && unknown).then(|| name.to_string())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn lower_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.lower_stmt(stmt);
        }
    }

    fn lower_scoped(&mut self, stmt: &Stmt) {
        self.push_scope();
        self.lower_stmt(stmt);
        self.pop_scope();
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Decl(decls) => {
                for decl in decls {
                    self.lower_local(decl);
                }
            }
            StmtKind::Expr(expr) => self.lower_effect(expr),
            StmtKind::Block(stmts) => {
                self.push_scope();
                self.lower_stmts(stmts);
                self.pop_scope();
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let then_block = self.new_block();
                let else_block = else_branch.as_ref().map(|_| self.new_block());
                let merge = self.new_block();
                self.lower_cond(cond, then_block, else_block.unwrap_or(merge));

                self.switch_to(then_block);
                self.lower_scoped(then_branch);
                self.jump(merge, stmt.loc);
                if let (Some(else_block), Some(else_branch)) = (else_block, else_branch) {
                    self.switch_to(else_block);
                    self.lower_scoped(else_branch);
                    self.jump(merge, stmt.loc);
                }
                self.switch_to(merge);
            }
            StmtKind::While { cond, body } => {
                self.lower_loop(LoopKind::While, None, Some(cond), None, body, stmt.loc)
            }
            StmtKind::DoWhile { body, cond } => {
                self.lower_loop(LoopKind::DoWhile, None, Some(cond), None, body, stmt.loc)
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => self.lower_loop(
                LoopKind::For,
                init.as_deref(),
                cond.as_ref(),
                step.as_ref(),
                body,
                stmt.loc,
            ),
            StmtKind::Return(value) => self.lower_return(value.as_ref(), stmt.loc),
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                let base = self.frames.last().map_or(0, |f| f.loop_base);
                match self.loops.last().copied() {
                    Some(targets) if self.loops.len() > base => {
                        let target = if is_break {
                            targets.break_to
                        } else {
                            targets.continue_to
                        };
                        self.jump(target, stmt.loc);
                    }
                    _ => self.error(
                        SemanticErrorKind::UnsupportedConstruct,
                        format!(
                            "`{}` outside of a loop",
                            if is_break { "break" } else { "continue" }
                        ),
                        stmt.loc,
                    ),
                }
            }
            StmtKind::Empty => {}
        }
    }

    fn lower_return(&mut self, value: Option<&Expr>, loc: Location) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let ret = frame.ret.clone();
        let exit = frame.exit;
        let value = value.map(|expr| {
            let value = self.lower_expr(expr);
            self.convert(value, &ret, expr.loc).op
        });
        match exit {
            Some((block, slot)) => {
                if let (Some(var), Some(src)) = (slot, value) {
                    self.emit(IrInstruction::WriteVar { var, src }, loc);
                }
                self.jump(block, loc);
            }
            None => self.terminate(Terminator::Return { value }, loc),
        }
    }

    fn lower_loop(
        &mut self,
        kind: LoopKind,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
        loc: Location,
    ) {
        self.push_scope();
        if let Some(init) = init {
            self.lower_stmt(init);
        }
        let bound = self.loop_bound(kind, cond, step, body, loc);

        let header = self.new_block();
        let body_block = match kind {
            LoopKind::DoWhile => header,
            LoopKind::For | LoopKind::While => self.new_block(),
        };
        let latch = self.new_block();
        let exit = self.new_block();

        self.jump(header, loc);
        self.switch_to(header);
        self.program.blocks[header.index()].loop_bound = bound;
        if kind != LoopKind::DoWhile {
            match cond {
                Some(cond) => self.lower_cond(cond, body_block, exit),
                None => self.jump(body_block, loc),
            }
            self.switch_to(body_block);
        }

        self.loops.push(LoopTargets {
            break_to: exit,
            continue_to: latch,
        });
        self.lower_scoped(body);
        self.loops.pop();
        self.jump(latch, loc);

        self.switch_to(latch);
        match kind {
            LoopKind::For => {
                if let Some(step) = step {
                    self.lower_effect(step);
                }
                self.jump(header, loc);
            }
            LoopKind::While => self.jump(header, loc),
            LoopKind::DoWhile => match cond {
                Some(cond) => self.lower_cond(cond, header, exit),
                None => self.jump(header, loc),
            },
        }
        self.switch_to(exit);
        self.pop_scope();
    }

    fn loop_bound(
        &mut self,
        kind: LoopKind,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
        loc: Location,
    ) -> Option<u64> {
        let result = loops::analyze(kind, cond, step, body, &*self).and_then(|shape| {
            let counter = match self.lookup(shape.counter) {
                Some(Binding::Var(var)) => *var,
                _ => {
                    return Err(format!(
                        "loop counter `{}` is not a local variable",
                        shape.counter
                    ))
                }
            };
            let init = self.known.get(&counter).copied().ok_or_else(|| {
                format!(
                    "initial value of loop counter `{}` is not a known constant",
                    shape.counter
                )
            })?;
            let ty = self.local_type(counter).int_type().ok_or_else(|| {
                format!("loop counter `{}` is not an integer", shape.counter)
            })?;
            loops::trip_count(&shape, init, ty, kind == LoopKind::DoWhile).ok_or_else(|| {
                format!(
                    "loop counter `{}` wraps around or steps past {}",
                    shape.counter, shape.limit
                )
            })
        });
        match result {
            Ok(trips) if trips <= self.max_loop_iterations => {
                tracing::debug!(program = %self.program.name, trips, "loop bound proven");
                Some(trips)
            }
            Ok(trips) => {
                self.error(
                    SemanticErrorKind::UnboundedLoop,
                    format!(
                        "loop runs {} iterations, more than the limit of {}",
                        trips, self.max_loop_iterations
                    ),
                    loc,
                );
                None
            }
            Err(reason) => {
                self.error(SemanticErrorKind::UnboundedLoop, reason, loc);
                None
            }
        }
    }

    /// Expression evaluated for its side effects only
    fn lower_effect(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Call { callee, args } => {
                self.lower_call(callee, args, expr.loc);
            }
            ExprKind::Comma(lhs, rhs) => {
                self.lower_effect(lhs);
                self.lower_effect(rhs);
            }
            ExprKind::Cast {
                ty: TypeExpr::Void,
                expr: inner,
            } => self.lower_effect(inner),
            _ => {
                self.lower_expr(expr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Local declarations and initializers
    // ------------------------------------------------------------------

    fn lower_local(&mut self, decl: &LocalDecl) {
        let Some(mut ty) = self.resolve(&decl.ty, decl.loc) else {
            return;
        };
        // `char buf[] = "..."` and `int v[] = {...}` take their length from the initializer
        let init_len = match &decl.init {
            Some(Initializer::Expr(Expr {
                kind: ExprKind::StringLiteral(text),
                ..
            })) => Some(text.len() as u64 + 1),
            Some(Initializer::List { items, .. }) => Some(items.len() as u64),
            _ => None,
        };
        let sized = match (&ty, init_len) {
            (CType::Array(elem, 0), Some(len)) => Some(CType::Array(elem.clone(), len)),
            _ => None,
        };
        if let Some(sized) = sized {
            ty = sized;
        }

        let Some(var) = self.new_local(&decl.name, ty.clone(), decl.loc) else {
            return;
        };
        // the name is in scope inside its own initializer (`sizeof(*e)`)
        self.bind(&decl.name, Binding::Var(var));
        match &decl.init {
            None => {}
            Some(Initializer::Expr(expr)) if ty.is_scalar() => {
                let value = self.lower_expr(expr);
                self.store(Place::Var(var, ty), value, expr.loc);
            }
            Some(Initializer::Expr(Expr {
                kind: ExprKind::StringLiteral(text),
                loc,
            })) if is_char_array(&ty) => {
                self.emit(IrInstruction::ZeroVar { var }, *loc);
                let base = self.addr_of_var(var, *loc);
                self.store_bytes(&base, 0, text, &ty, *loc);
            }
            Some(Initializer::Expr(expr)) => self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!(
                    "`{}` of type `{}` cannot be initialized by copy",
                    decl.name, ty
                ),
                expr.loc,
            ),
            Some(Initializer::List { items, loc }) => {
                self.emit(IrInstruction::ZeroVar { var }, *loc);
                if ty.is_scalar() {
                    if let Some(InitItem {
                        value: Initializer::Expr(expr),
                        ..
                    }) = items.first()
                    {
                        let value = self.lower_expr(expr);
                        self.store(Place::Var(var, ty.clone()), value, expr.loc);
                    }
                } else {
                    let base = self.addr_of_var(var, *loc);
                    self.init_list(&base, 0, &ty, items, *loc);
                }
            }
        }
    }

    fn init_list(
        &mut self,
        base: &Operand,
        offset: i64,
        ty: &CType,
        items: &[InitItem],
        loc: Location,
    ) {
        let unit = self.unit;
        match ty {
            CType::Struct(tag) => {
                let Some(layout) = unit.layout(tag) else {
                    self.error(
                        SemanticErrorKind::UnknownType,
                        format!("struct `{}` has no known layout", tag),
                        loc,
                    );
                    return;
                };
                let mut position = 0;
                for item in items {
                    let index = match &item.designator {
                        Some(Designator::Field(name)) => {
                            match layout.fields.iter().position(|f| &f.name == name) {
                                Some(index) => index,
                                None => {
                                    self.error(
                                        SemanticErrorKind::UnsupportedConstruct,
                                        format!("struct `{}` has no member `{}`", tag, name),
                                        loc,
                                    );
                                    continue;
                                }
                            }
                        }
                        Some(Designator::Index(_)) => {
                            self.error(
                                SemanticErrorKind::UnsupportedConstruct,
                                "array designator in a struct initializer",
                                loc,
                            );
                            continue;
                        }
                        None => position,
                    };
                    let Some(field) = layout.fields.get(index) else {
                        self.error(
                            SemanticErrorKind::UnsupportedConstruct,
                            format!("too many initializers for struct `{}`", tag),
                            loc,
                        );
                        break;
                    };
                    position = index + 1;
                    self.init_member(base, offset + field.offset as i64, &field.ty, &item.value);
                }
            }
            CType::Array(elem, len) => {
                let Some(size) = unit.size_of(elem) else {
                    self.error(
                        SemanticErrorKind::UnknownType,
                        format!("array element type `{}` has no known size", elem),
                        loc,
                    );
                    return;
                };
                let mut index = 0u64;
                for item in items {
                    if let Some(Designator::Index(expr)) = &item.designator {
                        match const_eval::eval(expr, &*self).and_then(|v| v.as_u64()) {
                            Some(at) => index = at,
                            None => {
                                self.error(
                                    SemanticErrorKind::UnsupportedConstruct,
                                    "array designator is not a constant",
                                    expr.loc,
                                );
                                continue;
                            }
                        }
                    }
                    if index >= *len {
                        self.error(
                            SemanticErrorKind::UnsupportedConstruct,
                            format!("initializer index {} is past the end of `{}`", index, ty),
                            loc,
                        );
                        break;
                    }
                    let at = offset + (index * size) as i64;
                    self.init_member(base, at, elem, &item.value);
                    index += 1;
                }
            }
            _ => self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("braced initializer for `{}`", ty),
                loc,
            ),
        }
    }

    fn init_member(&mut self, base: &Operand, offset: i64, ty: &CType, init: &Initializer) {
        match init {
            Initializer::List { items, loc } => self.init_list(base, offset, ty, items, *loc),
            Initializer::Expr(Expr {
                kind: ExprKind::StringLiteral(text),
                loc,
            }) if is_char_array(ty) => self.store_bytes(base, offset, text, ty, *loc),
            Initializer::Expr(expr) if ty.is_scalar() => {
                let value = self.lower_expr(expr);
                // the slot is already zeroed
                if value.op == Operand::Imm(0) {
                    return;
                }
                let place = Place::Mem {
                    base: base.clone(),
                    offset,
                    ty: ty.clone(),
                };
                self.store(place, value, expr.loc);
            }
            Initializer::Expr(expr) => self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("member of type `{}` cannot be initialized by copy", ty),
                expr.loc,
            ),
        }
    }

    fn store_bytes(&mut self, base: &Operand, offset: i64, text: &str, ty: &CType, loc: Location) {
        let capacity = match ty {
            CType::Array(_, len) => *len,
            _ => 0,
        };
        if text.len() as u64 > capacity {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("string of {} bytes does not fit `{}`", text.len(), ty),
                loc,
            );
            return;
        }
        for (i, byte) in text.bytes().enumerate() {
            if byte != 0 {
                self.emit(
                    IrInstruction::Store {
                        addr: base.clone(),
                        offset: offset + i as i64,
                        src: Operand::Imm(i64::from(byte)),
                        ty: IntType::U8,
                    },
                    loc,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    /// Branch to `then_block` when `expr` is non-zero, else to `else_block`
    fn lower_cond(&mut self, expr: &Expr, then_block: BlockId, else_block: BlockId) {
        if let Some(value) = const_eval::eval(expr, &*self) {
            let target = if value.is_true() { then_block } else { else_block };
            self.jump(target, expr.loc);
            return;
        }
        match &expr.kind {
            ExprKind::Binary {
                op: BinaryOp::LogicalAnd,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.lower_cond(lhs, mid, else_block);
                self.switch_to(mid);
                self.lower_cond(rhs, then_block, else_block);
            }
            ExprKind::Binary {
                op: BinaryOp::LogicalOr,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.lower_cond(lhs, then_block, mid);
                self.switch_to(mid);
                self.lower_cond(rhs, then_block, else_block);
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.lower_cond(operand, else_block, then_block),
            ExprKind::Binary {
                op: op @ (BinaryOp::Eq | BinaryOp::Ne),
                lhs,
                rhs,
            } => {
                // `x == NULL` / `0 != x` test x itself
                let tested = if self.is_zero(rhs) {
                    Some(lhs)
                } else if self.is_zero(lhs) {
                    Some(rhs)
                } else {
                    None
                };
                match (tested, op) {
                    (Some(x), BinaryOp::Eq) => self.lower_cond(x, else_block, then_block),
                    (Some(x), _) => self.lower_cond(x, then_block, else_block),
                    (None, _) => self.branch_on(expr, then_block, else_block),
                }
            }
            _ => self.branch_on(expr, then_block, else_block),
        }
    }

    fn branch_on(&mut self, expr: &Expr, then_block: BlockId, else_block: BlockId) {
        let value = self.lower_expr(expr);
        match value.op {
            Operand::Imm(v) => {
                let target = if v != 0 { then_block } else { else_block };
                self.jump(target, expr.loc);
            }
            cond => self.terminate(
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                },
                expr.loc,
            ),
        }
    }

    fn is_zero(&self, expr: &Expr) -> bool {
        const_eval::eval(expr, self).is_some_and(|v| v.value == 0)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> Value {
        if let Some(value) = const_eval::eval(expr, &*self) {
            return Value::new(Operand::Imm(value.value), CType::Int(value.ty));
        }
        let loc = expr.loc;
        match &expr.kind {
            ExprKind::StringLiteral(text) => {
                let index = self.intern(text);
                Value::new(Operand::Str(index), CType::u8().pointer_to())
            }
            ExprKind::Ident(_)
            | ExprKind::Member { .. }
            | ExprKind::Index { .. }
            | ExprKind::Unary {
                op: UnaryOp::Deref, ..
            } => match self.lower_place(expr) {
                Some(place) => self.load(place, loc),
                None => Value::poison(),
            },
            ExprKind::Unary { op, operand } => self.lower_unary(*op, operand, loc),
            ExprKind::Binary { op, .. } if op.is_logical() => self.lower_logical(expr, loc),
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs);
                let rhs = self.lower_expr(rhs);
                self.binary(*op, lhs, rhs, loc)
            }
            ExprKind::Assign { op, target, value } => self.lower_assign(*op, target, value, loc),
            ExprKind::Conditional {
                cond,
                then_expr,
                else_expr,
            } => self.lower_conditional(cond, then_expr, else_expr, loc),
            ExprKind::Call { callee, args } => match self.lower_call(callee, args, loc) {
                Some(value) => value,
                None => {
                    self.error(
                        SemanticErrorKind::UnsupportedConstruct,
                        format!("`{}` returns no value", callee),
                        loc,
                    );
                    Value::poison()
                }
            },
            ExprKind::Cast { ty, expr: inner } => {
                let value = self.lower_expr(inner);
                match self.resolve(ty, loc) {
                    Some(ty) => self.convert(value, &ty, loc),
                    None => Value::poison(),
                }
            }
            ExprKind::SizeofType(_) | ExprKind::SizeofExpr(_) => {
                self.error(
                    SemanticErrorKind::UnknownType,
                    "operand of `sizeof` has no known size",
                    loc,
                );
                Value::poison()
            }
            ExprKind::IncDec {
                target,
                increment,
                prefix,
            } => self.lower_incdec(target, *increment, *prefix, loc),
            ExprKind::Comma(lhs, rhs) => {
                self.lower_effect(lhs);
                self.lower_expr(rhs)
            }
            // literals always fold above
            ExprKind::IntLiteral { .. } | ExprKind::CharLiteral(_) => Value::poison(),
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, operand: &Expr, loc: Location) -> Value {
        match op {
            UnaryOp::AddrOf => self.lower_addr_of(operand, loc),
            UnaryOp::Deref => {
                let pointer = self.lower_expr(operand);
                match self.deref(pointer, loc) {
                    Some(place) => self.load(place, loc),
                    None => Value::poison(),
                }
            }
            UnaryOp::Plus => {
                let value = self.lower_expr(operand);
                match value.ty.int_type() {
                    Some(ty) if !value.ty.is_pointer() => {
                        self.convert(value, &CType::Int(ty.promote()), loc)
                    }
                    _ => value,
                }
            }
            UnaryOp::Neg => {
                let value = self.lower_expr(operand);
                self.binary(BinaryOp::Sub, Value::imm(0, IntType::S32), value, loc)
            }
            UnaryOp::BitNot => {
                let value = self.lower_expr(operand);
                self.binary(BinaryOp::BitXor, value, Value::imm(-1, IntType::S32), loc)
            }
            UnaryOp::Not => {
                let value = self.lower_expr(operand);
                self.binary(BinaryOp::Eq, value, Value::imm(0, IntType::S32), loc)
            }
        }
    }

    fn lower_addr_of(&mut self, operand: &Expr, loc: Location) -> Value {
        if let Some(map) = operand.as_ident().and_then(|name| self.map_name(name)) {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("map `{}` can only be passed to a helper", map),
                loc,
            );
            return Value::poison();
        }
        let Some(place) = self.lower_place(operand) else {
            return Value::poison();
        };
        if let Place::Var(var, _) = &place {
            self.escaped.insert(*var);
            self.known.remove(var);
        }
        self.address(place, loc)
    }

    /// `&&` / `||` as a value: 0 or 1 through a temporary
    fn lower_logical(&mut self, expr: &Expr, loc: Location) -> Value {
        let Some(var) = self.new_local(TEMP_NAME, CType::s32(), loc) else {
            return Value::poison();
        };
        let then_block = self.new_block();
        let else_block = self.new_block();
        let merge = self.new_block();
        self.lower_cond(expr, then_block, else_block);
        for (block, value) in [(then_block, 1), (else_block, 0)] {
            self.switch_to(block);
            self.emit(
                IrInstruction::WriteVar {
                    var,
                    src: Operand::Imm(value),
                },
                loc,
            );
            self.jump(merge, loc);
        }
        self.switch_to(merge);
        self.load(Place::Var(var, CType::s32()), loc)
    }

    fn lower_conditional(
        &mut self,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
        loc: Location,
    ) -> Value {
        let ty = self
            .conditional_type(then_expr, else_expr)
            .unwrap_or_else(CType::s64);
        let Some(var) = self.new_local(TEMP_NAME, ty.clone(), loc) else {
            return Value::poison();
        };
        let then_block = self.new_block();
        let else_block = self.new_block();
        let merge = self.new_block();
        self.lower_cond(cond, then_block, else_block);
        for (block, expr) in [(then_block, then_expr), (else_block, else_expr)] {
            self.switch_to(block);
            let value = self.lower_expr(expr);
            self.store(Place::Var(var, ty.clone()), value, expr.loc);
            self.jump(merge, loc);
        }
        self.switch_to(merge);
        self.load(Place::Var(var, ty), loc)
    }

    fn lower_assign(
        &mut self,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
        loc: Location,
    ) -> Value {
        let Some(place) = self.lower_place(target) else {
            self.lower_expr(value);
            return Value::poison();
        };
        match op {
            None => {
                let value = self.lower_expr(value);
                self.store(place, value, loc)
            }
            Some(op) => {
                let current = self.load(place.clone(), loc);
                let value = self.lower_expr(value);
                let result = self.binary(op, current, value, loc);
                self.store(place, result, loc)
            }
        }
    }

    fn lower_incdec(&mut self, target: &Expr, increment: bool, prefix: bool, loc: Location) -> Value {
        let Some(place) = self.lower_place(target) else {
            return Value::poison();
        };
        let current = self.load(place.clone(), loc);
        let op = if increment {
            BinaryOp::Add
        } else {
            BinaryOp::Sub
        };
        let updated = self.binary(op, current.clone(), Value::imm(1, IntType::S32), loc);
        let stored = self.store(place, updated, loc);
        if prefix {
            stored
        } else {
            current
        }
    }

    // ------------------------------------------------------------------
    // Places
    // ------------------------------------------------------------------

    fn lower_place(&mut self, expr: &Expr) -> Option<Place> {
        let loc = expr.loc;
        match &expr.kind {
            ExprKind::Ident(name) => self.place_of_ident(name, loc),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let pointer = self.lower_expr(operand);
                self.deref(pointer, loc)
            }
            ExprKind::Member { base, field, arrow } => self.place_of_member(base, field, *arrow, loc),
            ExprKind::Index { base, index } => self.place_of_index(base, index, loc),
            _ => {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    "expression is not assignable",
                    loc,
                );
                None
            }
        }
    }

    fn place_of_ident(&mut self, name: &str, loc: Location) -> Option<Place> {
        match self.lookup(name).cloned() {
            Some(Binding::Var(var)) => return Some(Place::Var(var, self.local_type(var))),
            Some(Binding::Map(map)) => {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("map `{}` can only be passed to a helper", map),
                    loc,
                );
                return None;
            }
            None => {}
        }
        let unit = self.unit;
        if let Some(global) = unit.global(name) {
            return Some(Place::Global {
                name: name.to_string(),
                ty: global.ty.clone(),
                volatile: global.is_volatile(),
            });
        }
        if unit.is_map(name) {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("map `{}` can only be passed to a helper", name),
                loc,
            );
        } else {
            self.error(
                SemanticErrorKind::UndeclaredIdentifier,
                format!("`{}` is not declared", name),
                loc,
            );
        }
        None
    }

    fn deref(&mut self, pointer: Value, loc: Location) -> Option<Place> {
        if pointer.is_poison() {
            return None;
        }
        match pointer.ty.pointee() {
            Some(CType::Void) => {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    "dereference of `void *`",
                    loc,
                );
                None
            }
            Some(inner) => Some(Place::Mem {
                ty: inner.clone(),
                base: pointer.op,
                offset: 0,
            }),
            None => {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("dereference of non-pointer type `{}`", pointer.ty),
                    loc,
                );
                None
            }
        }
    }

    fn place_of_member(&mut self, base: &Expr, field: &str, arrow: bool, loc: Location) -> Option<Place> {
        let (addr, offset, ty) = if arrow {
            let pointer = self.lower_expr(base);
            if pointer.is_poison() {
                return None;
            }
            match pointer.ty.pointee().cloned() {
                Some(inner) => (pointer.op, 0, inner),
                None => {
                    self.error(
                        SemanticErrorKind::UnsupportedConstruct,
                        format!("`->{}` applied to non-pointer type `{}`", field, pointer.ty),
                        loc,
                    );
                    return None;
                }
            }
        } else {
            let place = self.lower_place(base)?;
            let ty = place.ty().clone();
            let (addr, offset) = self.place_parts(place, loc);
            (addr, offset, ty)
        };

        let CType::Struct(tag) = &ty else {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("member `{}` of non-struct type `{}`", field, ty),
                loc,
            );
            return None;
        };
        let unit = self.unit;
        let Some(layout) = unit.layout(tag) else {
            self.error(
                SemanticErrorKind::UnknownType,
                format!("struct `{}` has no known layout", tag),
                loc,
            );
            return None;
        };
        let Some(member) = layout.field(field) else {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("struct `{}` has no member `{}`", tag, field),
                loc,
            );
            return None;
        };
        Some(Place::Mem {
            base: addr,
            offset: offset + member.offset as i64,
            ty: member.ty.clone(),
        })
    }

    fn place_of_index(&mut self, base: &Expr, index: &Expr, loc: Location) -> Option<Place> {
        let (addr, offset, elem) = match self.type_of(base) {
            Some(CType::Array(elem, _)) => {
                let place = self.lower_place(base)?;
                let (addr, offset) = self.place_parts(place, loc);
                (addr, offset, *elem)
            }
            _ => {
                let pointer = self.lower_expr(base);
                if pointer.is_poison() {
                    return None;
                }
                match pointer.ty.pointee() {
                    Some(inner) if *inner != CType::Void => {
                        let inner = inner.clone();
                        (pointer.op, 0, inner)
                    }
                    _ => {
                        self.error(
                            SemanticErrorKind::UnsupportedConstruct,
                            format!("subscript of type `{}`", pointer.ty),
                            loc,
                        );
                        return None;
                    }
                }
            }
        };
        let Some(size) = self.unit.size_of(&elem) else {
            self.error(
                SemanticErrorKind::UnknownType,
                format!("element type `{}` has no known size", elem),
                loc,
            );
            return None;
        };

        if let Some(at) = const_eval::eval(index, &*self) {
            return Some(Place::Mem {
                base: addr,
                offset: offset.wrapping_add(at.value.wrapping_mul(size as i64)),
                ty: elem,
            });
        }
        let position = self.lower_expr(index);
        let position = self.convert(position, &CType::s64(), loc);
        let scaled = if size == 1 {
            position
        } else {
            self.binary(
                BinaryOp::Mul,
                position,
                Value::imm(size as i64, IntType::S64),
                loc,
            )
        };
        let dst = self.alloc_reg(elem.clone().pointer_to());
        self.emit(
            IrInstruction::Bin {
                dst,
                op: BinaryOp::Add,
                lhs: addr,
                rhs: scaled.op,
                ty: IntType::U64,
            },
            loc,
        );
        Some(Place::Mem {
            base: Operand::Reg(dst),
            offset,
            ty: elem,
        })
    }

    /// Base address and offset of a place
    fn place_parts(&mut self, place: Place, loc: Location) -> (Operand, i64) {
        match place {
            Place::Var(var, _) => (self.addr_of_var(var, loc), 0),
            Place::Global { name, ty, .. } => {
                let dst = self.alloc_reg(ty.pointer_to());
                self.emit(IrInstruction::AddrOfGlobal { dst, global: name }, loc);
                (Operand::Reg(dst), 0)
            }
            Place::Mem { base, offset, .. } => (base, offset),
        }
    }

    fn addr_of_var(&mut self, var: VarId, loc: Location) -> Operand {
        let dst = self.alloc_reg(self.local_type(var).pointer_to());
        self.emit(IrInstruction::AddrOfVar { dst, var }, loc);
        Operand::Reg(dst)
    }

    /// `base + offset` as a register typed `ty`
    fn offset_pointer(&mut self, base: Operand, offset: i64, ty: CType, loc: Location) -> Operand {
        if offset == 0 {
            if let Operand::Reg(reg) = &base {
                if self.program.reg_type(*reg) == Some(&ty) {
                    return base;
                }
            }
        }
        let dst = self.alloc_reg(ty);
        self.emit(
            IrInstruction::Bin {
                dst,
                op: BinaryOp::Add,
                lhs: base,
                rhs: Operand::Imm(offset),
                ty: IntType::U64,
            },
            loc,
        );
        Operand::Reg(dst)
    }

    fn address(&mut self, place: Place, loc: Location) -> Value {
        let pointer = place.ty().clone().pointer_to();
        let (base, offset) = self.place_parts(place, loc);
        let op = self.offset_pointer(base, offset, pointer.clone(), loc);
        Value::new(op, pointer)
    }

    fn load(&mut self, place: Place, loc: Location) -> Value {
        match place.ty() {
            CType::Array(elem, _) => {
                // arrays decay to a pointer to their first element
                let pointer = elem.as_ref().clone().pointer_to();
                let (base, offset) = self.place_parts(place, loc);
                let op = self.offset_pointer(base, offset, pointer.clone(), loc);
                return Value::new(op, pointer);
            }
            CType::Struct(tag) => {
                let message = format!("struct `{}` cannot be used as a value", tag);
                self.error(SemanticErrorKind::UnsupportedConstruct, message, loc);
                return Value::poison();
            }
            CType::Void => {
                self.error(SemanticErrorKind::UnsupportedConstruct, "use of a `void` value", loc);
                return Value::poison();
            }
            _ => {}
        }
        match place {
            Place::Var(var, ty) => {
                let dst = self.alloc_reg(ty.clone());
                self.emit(IrInstruction::ReadVar { dst, var }, loc);
                Value::new(Operand::Reg(dst), ty)
            }
            Place::Global { name, ty, volatile } => {
                let dst = self.alloc_reg(ty.clone());
                self.emit(
                    IrInstruction::ReadGlobal {
                        dst,
                        global: name,
                        volatile,
                    },
                    loc,
                );
                Value::new(Operand::Reg(dst), ty)
            }
            Place::Mem { base, offset, ty } => {
                let dst = self.alloc_reg(ty.clone());
                self.emit(
                    IrInstruction::Load {
                        dst,
                        addr: base,
                        offset,
                        ty: ty.int_type().unwrap_or(IntType::U64),
                    },
                    loc,
                );
                Value::new(Operand::Reg(dst), ty)
            }
        }
    }

    /// Store `value` converted to the place's type; returns the stored value
    fn store(&mut self, place: Place, value: Value, loc: Location) -> Value {
        let ty = place.ty().clone();
        if !ty.is_scalar() {
            if !value.is_poison() {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("cannot assign to `{}`; copy its members one by one", ty),
                    loc,
                );
            }
            return Value::poison();
        }
        let value = self.convert(value, &ty, loc);
        match place {
            Place::Var(var, _) => {
                self.emit(
                    IrInstruction::WriteVar {
                        var,
                        src: value.op.clone(),
                    },
                    loc,
                );
                match value.op {
                    Operand::Imm(v) if !self.escaped.contains(&var) => {
                        self.known.insert(var, v);
                    }
                    _ => {
                        self.known.remove(&var);
                    }
                }
            }
            Place::Global { name, volatile, .. } => self.emit(
                IrInstruction::WriteGlobal {
                    global: name,
                    src: value.op.clone(),
                    volatile,
                },
                loc,
            ),
            Place::Mem { base, offset, .. } => self.emit(
                IrInstruction::Store {
                    addr: base,
                    offset,
                    src: value.op.clone(),
                    ty: ty.int_type().unwrap_or(IntType::U64),
                },
                loc,
            ),
        }
        value
    }

    // ------------------------------------------------------------------
    // Arithmetic and conversions
    // ------------------------------------------------------------------

    fn convert(&mut self, value: Value, to: &CType, loc: Location) -> Value {
        if value.is_poison() || value.ty == *to || *to == CType::Void {
            return value;
        }
        if *to == CType::Bool {
            return match value.op {
                Operand::Imm(v) => Value::new(Operand::Imm(i64::from(v != 0)), CType::Bool),
                _ => {
                    let test = self.binary(BinaryOp::Ne, value, Value::imm(0, IntType::S32), loc);
                    Value::new(test.op, CType::Bool)
                }
            };
        }
        let (Some(from), Some(target)) = (value.ty.int_type(), to.int_type()) else {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("cannot convert `{}` to `{}`", value.ty, to),
                loc,
            );
            return Value::poison();
        };
        match value.op {
            Operand::Imm(v) => Value::new(Operand::Imm(target.normalize(v)), to.clone()),
            Operand::Reg(reg) if from != target => {
                let dst = self.alloc_reg(to.clone());
                self.emit(
                    IrInstruction::Cast {
                        dst,
                        src: Operand::Reg(reg),
                        to: target,
                    },
                    loc,
                );
                Value::new(Operand::Reg(dst), to.clone())
            }
            op => Value::new(op, to.clone()),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value, loc: Location) -> Value {
        if lhs.is_poison() || rhs.is_poison() {
            return Value::poison();
        }
        if lhs.ty.is_pointer() || rhs.ty.is_pointer() {
            return self.pointer_binary(op, lhs, rhs, loc);
        }
        let (Some(lt), Some(rt)) = (lhs.ty.int_type(), rhs.ty.int_type()) else {
            self.error(
                SemanticErrorKind::UnsupportedConstruct,
                format!("invalid operands to `{}`: `{}` and `{}`", op, lhs.ty, rhs.ty),
                loc,
            );
            return Value::poison();
        };
        if let (Operand::Imm(a), Operand::Imm(b)) = (&lhs.op, &rhs.op) {
            if let Some(folded) =
                const_eval::fold_binary(op, ConstValue::new(*a, lt), ConstValue::new(*b, rt))
            {
                return Value::new(Operand::Imm(folded.value), CType::Int(folded.ty));
            }
        }

        let (ty, lhs_ty, rhs_ty) = match op {
            BinaryOp::Shl | BinaryOp::Shr => (lt.promote(), lt.promote(), rt.promote()),
            _ => {
                let common = IntType::common(lt, rt);
                (common, common, common)
            }
        };
        let result = if op.is_comparison() { IntType::S32 } else { ty };
        let lhs = self.convert(lhs, &CType::Int(lhs_ty), loc);
        let rhs = self.convert(rhs, &CType::Int(rhs_ty), loc);
        let dst = self.alloc_reg(CType::Int(result));
        self.emit(
            IrInstruction::Bin {
                dst,
                op,
                lhs: lhs.op,
                rhs: rhs.op,
                ty,
            },
            loc,
        );
        Value::new(Operand::Reg(dst), CType::Int(result))
    }

    fn pointer_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value, loc: Location) -> Value {
        let (lp, rp) = (lhs.ty.is_pointer(), rhs.ty.is_pointer());
        let (result, lhs_op, rhs_op, ty) = match op {
            _ if op.is_comparison() => {
                let lhs = self.convert(lhs, &CType::u64(), loc);
                let rhs = self.convert(rhs, &CType::u64(), loc);
                (CType::s32(), lhs.op, rhs.op, IntType::U64)
            }
            BinaryOp::Add | BinaryOp::Sub if lp && !rp => {
                let Some(step) = self.scale(rhs, &lhs.ty, loc) else {
                    return Value::poison();
                };
                (lhs.ty.clone(), lhs.op, step.op, IntType::U64)
            }
            BinaryOp::Add if rp && !lp => {
                let Some(step) = self.scale(lhs, &rhs.ty, loc) else {
                    return Value::poison();
                };
                (rhs.ty.clone(), rhs.op, step.op, IntType::U64)
            }
            BinaryOp::Sub if lp && rp => {
                let size = self.element_size(&lhs.ty, loc);
                let dst = self.alloc_reg(CType::s64());
                self.emit(
                    IrInstruction::Bin {
                        dst,
                        op: BinaryOp::Sub,
                        lhs: lhs.op,
                        rhs: rhs.op,
                        ty: IntType::S64,
                    },
                    loc,
                );
                let diff = Value::new(Operand::Reg(dst), CType::s64());
                return match size {
                    Some(1) => diff,
                    Some(size) => self.binary(BinaryOp::Div, diff, Value::imm(size as i64, IntType::S64), loc),
                    None => Value::poison(),
                };
            }
            _ => {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("invalid pointer operands to `{}`", op),
                    loc,
                );
                return Value::poison();
            }
        };
        let dst = self.alloc_reg(result.clone());
        self.emit(
            IrInstruction::Bin {
                dst,
                op,
                lhs: lhs_op,
                rhs: rhs_op,
                ty,
            },
            loc,
        );
        Value::new(Operand::Reg(dst), result)
    }

    /// Byte size of what `pointer` points at (`void *` steps by one byte)
    fn element_size(&mut self, pointer: &CType, loc: Location) -> Option<u64> {
        match pointer.pointee() {
            Some(CType::Void) => Some(1),
            Some(elem) => {
                let size = self.unit.size_of(elem);
                if size.is_none() {
                    self.error(
                        SemanticErrorKind::UnknownType,
                        format!("pointer arithmetic on `{}` of unknown size", pointer),
                        loc,
                    );
                }
                size
            }
            None => Some(1),
        }
    }

    fn scale(&mut self, index: Value, pointer: &CType, loc: Location) -> Option<Value> {
        let size = self.element_size(pointer, loc)?;
        let index = self.convert(index, &CType::s64(), loc);
        if size == 1 {
            return Some(index);
        }
        Some(self.binary(
            BinaryOp::Mul,
            index,
            Value::imm(size as i64, IntType::S64),
            loc,
        ))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Lower a call; `None` for calls without a value
    fn lower_call(&mut self, callee: &str, args: &[Expr], loc: Location) -> Option<Value> {
        let unit = self.unit;
        if let Some(def) = unit.function(callee) {
            return self.inline_call(def, args, loc);
        }
        let helpers = self.helpers;
        if let Some(signature) = helpers.get(callee) {
            return self.helper_call(signature, args, loc);
        }
        let message = if unit.prototypes.contains(callee) {
            format!("function `{}` is declared but never defined", callee)
        } else {
            format!("call to undeclared function `{}`", callee)
        };
        self.error(SemanticErrorKind::UndeclaredIdentifier, message, loc);
        Some(Value::poison())
    }

    fn helper_call(
        &mut self,
        signature: &HelperSignature,
        args: &[Expr],
        loc: Location,
    ) -> Option<Value> {
        let mut operands = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let kind = signature.param(index);
            let operand = match (kind, &arg.kind) {
                (Some(ParamKind::FormatStr), ExprKind::StringLiteral(text)) => {
                    Operand::Str(self.intern(text))
                }
                _ => match self.map_reference(arg, kind == Some(ParamKind::Map)) {
                    Some(map) => Operand::Map(map),
                    None => self.lower_expr(arg).op,
                },
            };
            operands.push(operand);
        }
        let dst = (signature.ret != CType::Void).then(|| self.alloc_reg(signature.ret.clone()));
        self.emit(
            IrInstruction::HelperCall {
                dst,
                helper: signature.name.clone(),
                id: signature.id,
                args: operands,
            },
            loc,
        );
        dst.map(|reg| Value::new(Operand::Reg(reg), signature.ret.clone()))
    }

    fn inline_call(&mut self, def: &FunctionDef, args: &[Expr], loc: Location) -> Option<Value> {
        if self.frames.len() >= MAX_INLINE_DEPTH {
            self.error(
                SemanticErrorKind::UnsupportedRecursion,
                format!("inlining `{}` nests deeper than {} calls", def.name, MAX_INLINE_DEPTH),
                loc,
            );
            return Some(Value::poison());
        }
        self.inlined += 1;
        if self.inlined > MAX_INLINED_CALLS {
            // reported once; later calls are dropped without lowering
            if self.inlined == MAX_INLINED_CALLS + 1 {
                self.error(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!(
                        "inlining `{}` expands the program past {} inlined calls",
                        def.name, MAX_INLINED_CALLS
                    ),
                    loc,
                );
            }
            return Some(Value::poison());
        }
        let pairs = match inliner::bind_arguments(def, args, loc) {
            Ok(pairs) => pairs,
            Err(err) => {
                self.errors.push(err);
                return Some(Value::poison());
            }
        };

        // arguments are evaluated left to right, in the caller's scope
        let mut scope = HashMap::new();
        for ((name, arg), param) in pairs.into_iter().zip(&def.params) {
            if let Some(map) = self.map_reference(arg, false) {
                scope.insert(name.to_string(), Binding::Map(map));
                continue;
            }
            let value = self.lower_expr(arg);
            let Some(ty) = self.resolve(&param.ty, param.loc) else {
                continue;
            };
            let Some(var) = self.new_local(name, ty.clone(), param.loc) else {
                continue;
            };
            self.store(Place::Var(var, ty), value, arg.loc);
            scope.insert(name.to_string(), Binding::Var(var));
        }

        let ret = self.resolve(&def.ret, def.loc).unwrap_or(CType::Void);
        let slot = if ret == CType::Void {
            None
        } else {
            self.new_local(&format!("{}.ret", def.name), ret.clone(), def.loc)
        };
        let exit = self.new_block();
        self.frames.push(Frame {
            scopes: vec![scope],
            exit: Some((exit, slot)),
            ret: ret.clone(),
            loop_base: self.loops.len(),
        });
        tracing::debug!(callee = %def.name, depth = self.frames.len(), "inlining call");
        self.lower_stmts(&def.body);
        self.frames.pop();
        self.jump(exit, loc);
        self.switch_to(exit);

        match slot {
            Some(var) => Some(self.load(Place::Var(var, ret.clone()), loc)),
            None if ret == CType::Void => None,
            None => Some(Value::poison()),
        }
    }

    // ------------------------------------------------------------------
    // Static types
    // ------------------------------------------------------------------

    /// Type of an expression without lowering it
    fn type_of(&self, expr: &Expr) -> Option<CType> {
        match &expr.kind {
            ExprKind::IntLiteral {
                value,
                unsigned,
                long,
                non_decimal,
            } => Some(CType::Int(const_eval::literal_type(
                *value,
                *unsigned,
                *long,
                *non_decimal,
            ))),
            ExprKind::CharLiteral(_) => Some(CType::s32()),
            ExprKind::StringLiteral(text) => {
                Some(CType::Array(Box::new(CType::u8()), text.len() as u64 + 1))
            }
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(Binding::Var(var)) => Some(self.local_type(*var)),
                Some(Binding::Map(_)) => None,
                None => self
                    .unit
                    .global(name)
                    .map(|g| g.ty.clone())
                    .or_else(|| self.unit.constant(name).map(|c| CType::Int(c.ty))),
            },
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Deref => self.value_type(operand)?.pointee().cloned(),
                UnaryOp::AddrOf => Some(self.type_of(operand)?.pointer_to()),
                UnaryOp::Not => Some(CType::s32()),
                UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => {
                    Some(CType::Int(self.type_of(operand)?.int_type()?.promote()))
                }
            },
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(CType::s32());
                }
                let l = self.value_type(lhs)?;
                let r = self.value_type(rhs)?;
                match (l.is_pointer(), r.is_pointer()) {
                    (true, true) => Some(CType::s64()),
                    (true, false) => Some(l),
                    (false, true) => Some(r),
                    (false, false) => match op {
                        BinaryOp::Shl | BinaryOp::Shr => Some(CType::Int(l.int_type()?.promote())),
                        _ => Some(CType::Int(IntType::common(l.int_type()?, r.int_type()?))),
                    },
                }
            }
            ExprKind::Assign { target, .. } | ExprKind::IncDec { target, .. } => {
                self.type_of(target)
            }
            ExprKind::Conditional {
                then_expr,
                else_expr,
                ..
            } => self.conditional_type(then_expr, else_expr),
            ExprKind::Call { callee, .. } => match self.unit.function(callee) {
                Some(def) => self.unit.resolve_type(&def.ret, def.loc).ok(),
                None => self.helpers.get(callee).map(|s| s.ret.clone()),
            },
            ExprKind::Member { base, field, arrow } => {
                let base_ty = if *arrow {
                    self.value_type(base)?.pointee()?.clone()
                } else {
                    self.type_of(base)?
                };
                match base_ty {
                    CType::Struct(tag) => self.unit.layout(&tag)?.field(field).map(|f| f.ty.clone()),
                    _ => None,
                }
            }
            ExprKind::Index { base, .. } => self.value_type(base)?.pointee().cloned(),
            ExprKind::Cast { ty, .. } => self.unit.resolve_type(ty, expr.loc).ok(),
            ExprKind::SizeofType(_) | ExprKind::SizeofExpr(_) => Some(CType::u64()),
            ExprKind::Comma(_, rhs) => self.type_of(rhs),
        }
    }

    /// Type of an expression used as a value (arrays decay)
    fn value_type(&self, expr: &Expr) -> Option<CType> {
        match self.type_of(expr)? {
            CType::Array(elem, _) => Some(elem.pointer_to()),
            ty => Some(ty),
        }
    }

    fn conditional_type(&self, then_expr: &Expr, else_expr: &Expr) -> Option<CType> {
        match (self.value_type(then_expr), self.value_type(else_expr)) {
            (Some(ty), _) if ty.is_pointer() => Some(ty),
            (_, Some(ty)) if ty.is_pointer() => Some(ty),
            (Some(a), Some(b)) => Some(CType::Int(IntType::common(a.int_type()?, b.int_type()?))),
            (a, b) => a.or(b),
        }
    }
}

impl ConstEnv for IrGenerator<'_> {
    fn constant(&self, name: &str) -> Option<ConstValue> {
        // locals shadow named constants
        if self.lookup(name).is_some() {
            return None;
        }
        self.unit.constant(name)
    }

    fn int_type_of(&self, ty: &TypeExpr) -> Option<IntType> {
        self.unit.int_type_of(ty)
    }

    fn size_of_type(&self, ty: &TypeExpr) -> Option<u64> {
        self.unit.size_of_type(ty)
    }

    fn size_of_expr(&self, expr: &Expr) -> Option<u64> {
        let ty = self.type_of(expr)?;
        self.unit.size_of(&ty)
    }
}

fn is_char_array(ty: &CType) -> bool {
    matches!(ty, CType::Array(elem, _) if matches!(elem.as_ref(), CType::Int(it) if it.bits == 8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::resolver::resolve;
    use crate::parser::parse_source;

    fn lower(source: &str, entry: &str) -> Result<IrProgram, Vec<SemanticError>> {
        let options = CompileOptions::default();
        let unit = resolve(&parse_source(source).unwrap(), "t.bpf.c", &options);
        let def = unit.function(entry).unwrap().clone();
        lower_program(&unit, &def, &options)
    }

    fn kinds(errors: &[SemanticError]) -> Vec<SemanticErrorKind> {
        errors.iter().map(|e| e.kind).collect()
    }

    const HASH_DELTA: &str = r#"
#define u64 unsigned long long
struct {
    __uint(type, BPF_MAP_TYPE_HASH);
    __uint(max_entries, 1);
    __type(key, u64);
    __type(value, u64);
} last SEC(".maps");

SEC("kprobe/do_sys_open")
int do_trace(struct pt_regs *ctx) {
    u64 ts, *tsp, delta, key = 0;
    tsp = bpf_map_lookup_elem(&last, &key);
    if (tsp != NULL) {
        delta = bpf_ktime_get_ns() - *tsp;
        if (delta < 1000000000) {
            bpf_printk("%d\n", delta / 1000000);
        }
        bpf_map_delete_elem(&last, &key);
    }
    ts = bpf_ktime_get_ns();
    bpf_map_update_elem(&last, &key, &ts, BPF_ANY);
    return 0;
}
"#;

    #[test]
    fn test_lower_hash_delta() {
        let program = lower(HASH_DELTA, "do_trace").unwrap();
        assert!(program.blocks.len() >= 4);
        assert!(program.any_instruction(|inst| matches!(
            inst,
            IrInstruction::HelperCall { helper, args, .. }
                if helper == "bpf_map_lookup_elem" && args[0] == Operand::Map("last".to_string())
        )));
        assert!(program
            .blocks
            .iter()
            .any(|b| matches!(b.terminator, Terminator::Branch { .. })));
        assert_eq!(program.strings, vec!["%d\n".to_string()]);
        assert_eq!(program.referenced_maps().len(), 1);
    }

    #[test]
    fn test_program_json_round_trip() {
        let program = lower(HASH_DELTA, "do_trace").unwrap();
        assert!(program.any_instruction(|inst| matches!(inst, IrInstruction::Bin { .. })));
        let json = serde_json::to_string(&program).unwrap();
        assert!(json.contains("\"inst\":\"bin\""));
        let back: IrProgram = serde_json::from_str(&json).unwrap();
        assert_eq!(back, program);
    }

    #[test]
    fn test_loop_bound_on_header() {
        let program = lower(
            "SEC(\"xdp\") int prog(void *ctx) { int sum = 0; for (int i = 0; i < 4; i++) { sum += i; } return sum; }",
            "prog",
        )
        .unwrap();
        let bounds: Vec<u64> = program.blocks.iter().filter_map(|b| b.loop_bound).collect();
        assert_eq!(bounds, vec![4]);
    }

    #[test]
    fn test_unbounded_loop() {
        let errors = lower(
            "SEC(\"xdp\") int prog(void *ctx) { int n = bpf_get_prandom_u32(); while (n) { n--; } return 0; }",
            "prog",
        )
        .unwrap_err();
        assert_eq!(kinds(&errors), vec![SemanticErrorKind::UnboundedLoop]);
    }

    #[test]
    fn test_loop_above_limit() {
        let errors = lower(
            "SEC(\"xdp\") int prog(void *ctx) { for (long i = 0; i < 100000000; i++) { } return 0; }",
            "prog",
        )
        .unwrap_err();
        assert!(errors[0].message.contains("100000000"));
    }

    #[test]
    fn test_inlined_callee_has_isolated_locals() {
        let program = lower(
            "static __always_inline int add(int a, int b) { int sum = a + b; return sum; }\n\
             SEC(\"xdp\") int prog(void *ctx) { int sum = 1; return add(sum, 2); }",
            "prog",
        )
        .unwrap();
        let names: Vec<&str> = program.locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["ctx", "sum", "a", "b", "add.ret", "sum"]);
        assert!(!program.any_instruction(|inst| matches!(inst, IrInstruction::HelperCall { .. })));
    }

    #[test]
    fn test_inline_expansion_is_capped() {
        // every level calls the next twice: 2^24 expansions if left alone
        let mut source = String::from("static int f0(int x) { return x + 1; }\n");
        for level in 1..=24 {
            source.push_str(&format!(
                "static int f{level}(int x) {{ return f{prev}(x) + f{prev}(x + 1); }}\n",
                level = level,
                prev = level - 1
            ));
        }
        source.push_str("SEC(\"xdp\") int prog(void *ctx) { return f24(1); }");

        let errors = lower(&source, "prog").unwrap_err();
        assert_eq!(kinds(&errors), vec![SemanticErrorKind::UnsupportedConstruct]);
        assert!(errors[0].message.contains(&MAX_INLINED_CALLS.to_string()));
    }

    #[test]
    fn test_map_parameter_binding() {
        let program = lower(
            "struct { __uint(type, BPF_MAP_TYPE_ARRAY); __type(key, u32); __type(value, u64); __uint(max_entries, 4); } counts SEC(\".maps\");\n\
             static void bump(void *map, u32 key) { u64 *v = bpf_map_lookup_elem(map, &key); if (v) *v += 1; }\n\
             SEC(\"xdp\") int prog(void *ctx) { bump(&counts, 1); return 2; }",
            "prog",
        )
        .unwrap();
        assert!(program.referenced_maps().contains("counts"));
    }

    #[test]
    fn test_undeclared_function_and_identifier() {
        let errors = lower(
            "SEC(\"xdp\") int prog(void *ctx) { frobnicate(1); return missing; }",
            "prog",
        )
        .unwrap_err();
        assert_eq!(
            kinds(&errors),
            vec![
                SemanticErrorKind::UndeclaredIdentifier,
                SemanticErrorKind::UndeclaredIdentifier
            ]
        );
    }

    #[test]
    fn test_break_outside_loop() {
        let errors = lower("SEC(\"xdp\") int prog(void *ctx) { break; return 0; }", "prog")
            .unwrap_err();
        assert_eq!(kinds(&errors), vec![SemanticErrorKind::UnsupportedConstruct]);
    }

    #[test]
    fn test_struct_copy_rejected() {
        let errors = lower(
            "struct pair { int a; int b; };\n\
             SEC(\"xdp\") int prog(void *ctx) { struct pair x = {}; struct pair y = {}; x = y; return 0; }",
            "prog",
        )
        .unwrap_err();
        assert_eq!(kinds(&errors), vec![SemanticErrorKind::UnsupportedConstruct]);
    }

    #[test]
    fn test_dead_code_is_pruned() {
        let program = lower(
            "SEC(\"xdp\") int prog(void *ctx) { return XDP_PASS; bpf_printk(\"never\"); }",
            "prog",
        )
        .unwrap();
        assert_eq!(program.blocks.len(), 1);
        assert_eq!(
            program.blocks[0].terminator,
            Terminator::Return {
                value: Some(Operand::Imm(2))
            }
        );
    }

    #[test]
    fn test_constant_expressions_fold() {
        let program = lower(
            "#define SHIFT 3\nSEC(\"xdp\") int prog(void *ctx) { return (1 << SHIFT) + sizeof(u64); }",
            "prog",
        )
        .unwrap();
        assert_eq!(
            program.blocks[0].terminator,
            Terminator::Return {
                value: Some(Operand::Imm(16))
            }
        );
    }

    #[test]
    fn test_member_stores_use_layout_offsets() {
        let program = lower(
            "struct event { __u32 pid; __u32 uid; __u64 ts; };\n\
             SEC(\"tp/syscalls/sys_enter_setuid\") int prog(struct trace_event_raw_sys_enter *ctx) {\n\
               struct event data = {};\n\
               data.uid = (unsigned int)ctx->args[0];\n\
               data.ts = bpf_ktime_get_ns();\n\
               return 0;\n\
             }",
            "prog",
        )
        .unwrap();
        let offsets: Vec<i64> = program
            .instructions()
            .filter_map(|node| match &node.inst {
                IrInstruction::Store { offset, .. } => Some(*offset),
                IrInstruction::Load { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect();
        // args[0] is at 16 in the tracepoint context, then uid at 4 and ts at 8
        assert_eq!(offsets, vec![16, 4, 8]);
    }

    #[test]
    fn test_short_circuit_condition() {
        let program = lower(
            "SEC(\"xdp\") int prog(void *ctx) { int a = bpf_get_prandom_u32(); int b = bpf_get_prandom_u32(); if (a && !b) return 1; return 0; }",
            "prog",
        )
        .unwrap();
        let branches = program
            .blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::Branch { .. }))
            .count();
        assert_eq!(branches, 2);
    }
}
