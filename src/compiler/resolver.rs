//! Declaration resolution
//!
//! Partitions a [`TranslationUnit`] into the facts later stages work from:
//! map definitions, global variables, struct layouts, named constants, type
//! aliases, the license, ordinary functions and candidate programs.
//!
//! Resolution is whole-file: declaration order only matters where C itself
//! requires it (a struct used by value must be complete).

use super::const_eval::{self, ConstEnv, ConstValue};
use super::maps::{MapDef, MapFields, MapKind};
use super::types::{CType, IntType, StructLayout, StructTable};
use super::{AttachTargetPolicy, CompileOptions};
use crate::diagnostics::{AdvisoryKind, Diagnostic, DiagnosticScope};
use crate::error::{SemanticError, SemanticErrorKind};
use crate::parser::{
    AttrValue, EnumDef, Expr, ExprKind, FunctionDef, GlobalDecl, Initializer, Item, Location,
    MacroBody, StructDef, TranslationUnit, TypeExpr,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Section that marks map declarations
pub const MAPS_SECTION: &str = ".maps";
/// Section that carries the license string
pub const LICENSE_SECTION: &str = "license";

/// Alias chains longer than this are treated as cyclic
const MAX_ALIAS_DEPTH: usize = 32;

/// Kind of kernel hook a program attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// `kprobe/<symbol>`
    Kprobe,
    /// `kretprobe/<symbol>`
    Kretprobe,
    /// `tracepoint/<category>/<name>` (alias `tp`)
    Tracepoint,
    /// `raw_tracepoint/<name>` (alias `raw_tp`)
    RawTracepoint,
    /// `xdp`
    Xdp,
    /// `perf_event`
    Perf,
}

impl HookKind {
    /// Hook kind from the first segment of a section string
    pub fn parse(segment: &str) -> Option<HookKind> {
        match segment {
            "kprobe" => Some(HookKind::Kprobe),
            "kretprobe" => Some(HookKind::Kretprobe),
            "tracepoint" | "tp" => Some(HookKind::Tracepoint),
            "raw_tracepoint" | "raw_tp" => Some(HookKind::RawTracepoint),
            "xdp" => Some(HookKind::Xdp),
            "perf_event" | "perf" => Some(HookKind::Perf),
            _ => None,
        }
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            HookKind::Kprobe => "kprobe",
            HookKind::Kretprobe => "kretprobe",
            HookKind::Tracepoint => "tracepoint",
            HookKind::RawTracepoint => "raw_tracepoint",
            HookKind::Xdp => "xdp",
            HookKind::Perf => "perf_event",
        }
    }

    /// True when the hook kind carries no attach target
    pub fn targetless(&self) -> bool {
        matches!(self, HookKind::Xdp | HookKind::Perf)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How far an attach target could be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachStatus {
    /// Follows the hook's naming convention (and is in the registry, if one is configured)
    Resolved,
    /// Looks like a placeholder left in a template
    Placeholder,
    /// Does not follow the convention, or is missing from the registry
    Unresolved,
}

/// Attach target of a program, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachTarget {
    /// Text after the hook kind in the section string
    pub raw: String,
    /// Resolution status
    pub status: AttachStatus,
}

lazy_static::lazy_static! {
    static ref TARGET_PATTERNS: Vec<(HookKind, Regex)> = [
        (HookKind::Kprobe, r"^[A-Za-z_][A-Za-z0-9_.]*(\+(0x[0-9a-fA-F]+|[0-9]+))?$"),
        (HookKind::Kretprobe, r"^[A-Za-z_][A-Za-z0-9_.]*$"),
        (HookKind::Tracepoint, r"^[A-Za-z0-9_]+/[A-Za-z0-9_]+$"),
        (HookKind::RawTracepoint, r"^[A-Za-z_][A-Za-z0-9_]*$"),
        (HookKind::Xdp, r"^([a-z_.]+)?$"),
        (HookKind::Perf, r"^$"),
    ]
    .iter()
    .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (*kind, re)))
    .collect();
}

/// Template markers such as `YOUR_PROBE_POINT` or `<function>`
fn is_placeholder(target: &str) -> bool {
    const MARKERS: [&str; 5] = ["YOUR_", "TODO", "XXX", "<", ">"];
    if MARKERS.iter().any(|m| target.contains(m)) {
        return true;
    }
    // kernel symbols are lower or mixed case; an all-caps name is a template slot
    let letters: Vec<char> = target.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    letters.len() > 1 && letters.iter().all(|c| c.is_ascii_uppercase())
}

/// True when `target` matches the naming convention of `hook`
fn follows_convention(hook: HookKind, target: &str) -> bool {
    TARGET_PATTERNS
        .iter()
        .find(|(kind, _)| *kind == hook)
        .is_some_and(|(_, re)| re.is_match(target))
}

/// Classify a target against its hook's naming convention and the registry
fn classify_target(
    hook: HookKind,
    target: &str,
    registry: Option<&BTreeSet<String>>,
) -> (AttachStatus, Option<String>) {
    if !hook.targetless() && target.is_empty() {
        return (
            AttachStatus::Unresolved,
            Some(format!("{} section has no attach target", hook)),
        );
    }
    if is_placeholder(target) {
        return (
            AttachStatus::Placeholder,
            Some(format!("attach target `{}` is a placeholder", target)),
        );
    }
    if !follows_convention(hook, target) {
        return (
            AttachStatus::Unresolved,
            Some(format!(
                "attach target `{}` does not name a {} hook point",
                target, hook
            )),
        );
    }
    if let Some(registry) = registry {
        if !target.is_empty() && !registry.contains(target) {
            return (
                AttachStatus::Unresolved,
                Some(format!("attach target `{}` is not a known symbol", target)),
            );
        }
    }
    (AttachStatus::Resolved, None)
}

/// Mutability of a global variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    /// `const`: folded at use sites when the initializer is a constant scalar
    Const,
    /// Plain mutable global
    Mutable,
    /// `volatile`: never folded, every access is a real load or store
    Volatile,
}

/// Initial value of a global
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum GlobalInit {
    /// Folded scalar
    Scalar(i64),
    /// String literal
    Bytes(String),
    /// `= {}` or a list of zeros
    Zeroed,
    /// Initializer list with constant members
    Aggregate,
}

/// Global variable that is not a map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVar {
    /// Variable name
    pub name: String,
    /// Resolved type
    #[serde(rename = "type")]
    pub ty: CType,
    /// Mutability
    pub mutability: Mutability,
    /// Initial value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<GlobalInit>,
    /// Section, if one was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Declaration location
    pub location: Location,
}

impl GlobalVar {
    /// True for `volatile` globals
    pub fn is_volatile(&self) -> bool {
        self.mutability == Mutability::Volatile
    }
}

/// A SEC-tagged entry function
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramEntry {
    /// Function name
    pub name: String,
    /// Full section string
    pub section: String,
    /// Hook kind (`None` when the section names an unknown kind)
    pub hook: Option<HookKind>,
    /// Attach target
    pub attach: AttachTarget,
    /// Error that rejects the program before lowering
    pub rejection: Option<SemanticError>,
    /// Declaration location
    pub location: Location,
}

/// Everything known about a translation unit after resolution
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    /// Source unit name
    pub file: String,
    /// License string
    pub license: Option<String>,
    /// Valid maps in declaration order
    pub maps: Vec<MapDef>,
    /// Maps rejected as incomplete, with the reason
    pub invalid_maps: BTreeMap<String, SemanticError>,
    /// Globals in declaration order
    pub globals: Vec<GlobalVar>,
    /// Struct layouts (kernel table overlaid with user definitions)
    pub structs: StructTable,
    /// Named constants: `#define`s, enumerators and const globals
    pub constants: BTreeMap<String, ConstValue>,
    /// Typedefs and `#define` type aliases
    pub aliases: BTreeMap<String, TypeExpr>,
    /// Every function with a body, entry functions included
    pub functions: BTreeMap<String, FunctionDef>,
    /// Functions declared without a body
    pub prototypes: BTreeSet<String>,
    /// Candidate programs in declaration order
    pub programs: Vec<ProgramEntry>,
    /// File-level semantic errors
    pub file_errors: Vec<SemanticError>,
    /// File- and program-level advisories found during resolution
    pub advisories: Vec<Diagnostic>,
}

impl ResolvedUnit {
    fn new(file: &str, structs: StructTable) -> Self {
        ResolvedUnit {
            file: file.to_string(),
            license: None,
            maps: Vec::new(),
            invalid_maps: BTreeMap::new(),
            globals: Vec::new(),
            structs,
            constants: BTreeMap::new(),
            aliases: BTreeMap::new(),
            functions: BTreeMap::new(),
            prototypes: BTreeSet::new(),
            programs: Vec::new(),
            file_errors: Vec::new(),
            advisories: Vec::new(),
        }
    }

    /// Valid map by name
    pub fn map(&self, name: &str) -> Option<&MapDef> {
        self.maps.iter().find(|m| m.name == name)
    }

    /// True when `name` is a declared map, valid or not
    pub fn is_map(&self, name: &str) -> bool {
        self.map(name).is_some() || self.invalid_maps.contains_key(name)
    }

    /// Global by name
    pub fn global(&self, name: &str) -> Option<&GlobalVar> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Function definition by name
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    /// Size of a resolved type
    pub fn size_of(&self, ty: &CType) -> Option<u64> {
        ty.size(&self.structs)
    }

    /// Layout of a struct type
    pub fn layout(&self, tag: &str) -> Option<&StructLayout> {
        self.structs.get(tag)
    }

    /// Resolve a source type
    pub fn resolve_type(&self, ty: &TypeExpr, loc: Location) -> Result<CType, SemanticError> {
        self.resolve_type_depth(ty, loc, 0)
    }

    fn resolve_type_depth(
        &self,
        ty: &TypeExpr,
        loc: Location,
        depth: usize,
    ) -> Result<CType, SemanticError> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(SemanticError::new(
                SemanticErrorKind::UnknownType,
                format!("type alias `{}` refers to itself", ty),
                loc,
            ));
        }
        let resolved = match ty {
            TypeExpr::Void => CType::Void,
            TypeExpr::Bool => CType::Bool,
            TypeExpr::Int { bits, signed } => CType::Int(IntType::new(*bits, *signed)),
            TypeExpr::Struct(tag) => CType::Struct(tag.clone()),
            TypeExpr::Pointer(inner) => self.resolve_type_depth(inner, loc, depth + 1)?.pointer_to(),
            TypeExpr::Named(name) => match self.aliases.get(name) {
                Some(target) => self.resolve_type_depth(target, loc, depth + 1)?,
                None => {
                    return Err(SemanticError::new(
                        SemanticErrorKind::UnknownType,
                        format!("unknown type `{}`", name),
                        loc,
                    ))
                }
            },
            TypeExpr::Array(inner, len) => {
                let element = self.resolve_type_depth(inner, loc, depth + 1)?;
                let count = match len {
                    None => 0,
                    Some(expr) => const_eval::eval(expr, self)
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| {
                            SemanticError::new(
                                SemanticErrorKind::UnsupportedConstruct,
                                "array length is not a constant expression",
                                expr.loc,
                            )
                        })?,
                };
                CType::Array(Box::new(element), count)
            }
        };
        Ok(resolved)
    }

    /// Type of a global-scope expression, for `sizeof`
    fn static_type_of(&self, expr: &Expr) -> Option<CType> {
        match &expr.kind {
            ExprKind::Ident(name) => self.global(name).map(|g| g.ty.clone()),
            ExprKind::StringLiteral(s) => Some(CType::Array(Box::new(CType::u8()), s.len() as u64 + 1)),
            ExprKind::Member { base, field, arrow } => {
                let base = self.static_type_of(base)?;
                let tag = match (&base, arrow) {
                    (CType::Struct(tag), false) => tag.clone(),
                    (CType::Pointer(inner), true) => match inner.as_ref() {
                        CType::Struct(tag) => tag.clone(),
                        _ => return None,
                    },
                    _ => return None,
                };
                self.layout(&tag)?.field(field).map(|f| f.ty.clone())
            }
            ExprKind::Unary {
                op: crate::parser::UnaryOp::Deref,
                operand,
            } => self.static_type_of(operand)?.pointee().cloned(),
            _ => None,
        }
    }

    fn advisory(&mut self, scope: DiagnosticScope, kind: AdvisoryKind, message: String, loc: Location) {
        tracing::warn!(file = %self.file, advisory = kind.tag(), "{}", message);
        self.advisories
            .push(Diagnostic::advisory(&self.file, scope, kind, message, Some(loc)));
    }
}

impl ConstEnv for ResolvedUnit {
    fn constant(&self, name: &str) -> Option<ConstValue> {
        self.constants
            .get(name)
            .copied()
            .or_else(|| const_eval::header_constant(name))
    }

    fn int_type_of(&self, ty: &TypeExpr) -> Option<IntType> {
        self.resolve_type(ty, Location::default()).ok()?.int_type()
    }

    fn size_of_type(&self, ty: &TypeExpr) -> Option<u64> {
        let ty = self.resolve_type(ty, Location::default()).ok()?;
        self.size_of(&ty)
    }

    fn size_of_expr(&self, expr: &Expr) -> Option<u64> {
        let ty = self.static_type_of(expr)?;
        self.size_of(&ty)
    }
}

/// Resolve a parsed translation unit
pub fn resolve(unit: &TranslationUnit, file: &str, options: &CompileOptions) -> ResolvedUnit {
    let mut resolved = ResolvedUnit::new(file, options.kernel_structs.as_ref().clone());

    let mut defines = Vec::new();
    let mut enums = Vec::new();
    let mut struct_defs: BTreeMap<String, &StructDef> = BTreeMap::new();
    let mut struct_order = Vec::new();
    let mut globals = Vec::new();

    for item in &unit.items {
        match item {
            Item::Directive { .. } => {}
            Item::Define(def) => match &def.body {
                MacroBody::Type(ty) => {
                    resolved.aliases.insert(def.name.clone(), ty.clone());
                }
                MacroBody::Expr(expr) => defines.push((def.name.clone(), expr)),
                MacroBody::Opaque(_) => {
                    tracing::debug!(name = %def.name, "keeping opaque macro");
                }
            },
            Item::Typedef { name, ty, .. } => {
                resolved.aliases.insert(name.clone(), ty.clone());
            }
            Item::Struct(def) => {
                struct_defs.insert(def.name.clone(), def);
                struct_order.push(def);
            }
            Item::Enum(def) => enums.push(def),
            Item::Global(decl) => globals.push(decl),
            Item::Function(def) => {
                if resolved.functions.contains_key(&def.name) {
                    resolved.file_errors.push(SemanticError::new(
                        SemanticErrorKind::UnsupportedConstruct,
                        format!("function `{}` is defined more than once", def.name),
                        def.loc,
                    ));
                    continue;
                }
                resolved.functions.insert(def.name.clone(), def.clone());
            }
            Item::Prototype(proto) => {
                resolved.prototypes.insert(proto.name.clone());
            }
        }
    }

    resolve_constants(&mut resolved, &defines, &enums);
    resolve_layouts(&mut resolved, &struct_order);

    for decl in globals {
        resolve_global(&mut resolved, decl, &struct_defs);
    }
    // const globals fold like named constants
    let folded: Vec<(String, ConstValue)> = resolved
        .globals
        .iter()
        .filter(|g| g.mutability == Mutability::Const)
        .filter_map(|g| match (&g.init, g.ty.int_type()) {
            (Some(GlobalInit::Scalar(v)), Some(it)) => Some((g.name.clone(), ConstValue::new(*v, it))),
            _ => None,
        })
        .collect();
    resolved.constants.extend(folded);

    if resolved.license.is_none() {
        resolved.advisory(
            DiagnosticScope::FileLevel,
            AdvisoryKind::MissingLicense,
            "no SEC(\"license\") declaration: GPL-only helpers will be refused at load time"
                .to_string(),
            Location::new(1, 1),
        );
    }

    let entries: Vec<FunctionDef> = unit
        .items
        .iter()
        .filter_map(|item| match item {
            Item::Function(def) if def.section.is_some() => Some(def.clone()),
            _ => None,
        })
        .collect();
    for def in &entries {
        resolve_program(&mut resolved, def, options);
    }

    tracing::debug!(
        file = %resolved.file,
        maps = resolved.maps.len(),
        globals = resolved.globals.len(),
        programs = resolved.programs.len(),
        functions = resolved.functions.len(),
        "resolved declarations"
    );
    resolved
}

/// Fold `#define`s and enumerators; later definitions may refer to earlier
/// ones and macros may refer forward, so iterate until nothing changes.
fn resolve_constants(
    resolved: &mut ResolvedUnit,
    defines: &[(String, &Expr)],
    enums: &[&EnumDef],
) {
    for def in enums {
        let mut next = ConstValue::int(0);
        for (name, value) in &def.variants {
            let value = match value {
                Some(expr) => match const_eval::eval(expr, &*resolved) {
                    Some(v) => v.convert(IntType::S32),
                    None => {
                        tracing::debug!(enumerator = %name, "enumerator value is not constant");
                        continue;
                    }
                },
                None => next,
            };
            resolved.constants.insert(name.clone(), value);
            next = ConstValue::int(value.value.wrapping_add(1));
        }
    }

    let mut pending: Vec<&(String, &Expr)> = defines.iter().collect();
    loop {
        let before = pending.len();
        pending.retain(|(name, expr)| match const_eval::eval(expr, &*resolved) {
            Some(value) => {
                resolved.constants.insert(name.clone(), value);
                false
            }
            None => true,
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    for (name, _) in pending {
        tracing::debug!(name = %name, "macro body is not a constant expression");
    }
}

/// Lay out user structs in source order, overriding kernel layouts
fn resolve_layouts(resolved: &mut ResolvedUnit, structs: &[&StructDef]) {
    for def in structs {
        if !def.attributes.is_empty() {
            continue;
        }
        let mut members = Vec::with_capacity(def.fields.len());
        let mut failed = None;
        for field in &def.fields {
            match resolved.resolve_type(&field.ty, field.loc) {
                Ok(ty) => members.push((field.name.clone(), ty)),
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        let layout = match failed {
            Some(err) => Err(err.message),
            None => StructLayout::natural(&def.name, def.is_union, members, &resolved.structs),
        };
        match layout {
            Ok(layout) => {
                if resolved.structs.contains(&def.name) {
                    tracing::debug!(name = %def.name, "user struct overrides kernel layout");
                }
                resolved.structs.insert(layout);
            }
            Err(message) => {
                // reported where the struct is used
                tracing::debug!(name = %def.name, reason = %message, "struct has no layout");
            }
        }
    }
}

fn resolve_global(
    resolved: &mut ResolvedUnit,
    decl: &GlobalDecl,
    struct_defs: &BTreeMap<String, &StructDef>,
) {
    let section = decl.section.as_ref().map(|s| s.name.clone());

    let attr_struct = match &decl.ty {
        TypeExpr::Struct(tag) => struct_defs.get(tag).filter(|d| !d.attributes.is_empty()),
        _ => None,
    };

    if section.as_deref() == Some(MAPS_SECTION) || attr_struct.is_some() {
        resolve_map(resolved, decl, attr_struct.copied(), section.as_deref());
        return;
    }

    if section.as_deref() == Some(LICENSE_SECTION) {
        match &decl.init {
            Some(Initializer::Expr(Expr {
                kind: ExprKind::StringLiteral(text),
                ..
            })) => resolved.license = Some(text.clone()),
            _ => resolved.file_errors.push(SemanticError::new(
                SemanticErrorKind::UnsupportedConstruct,
                format!("license `{}` must be initialized with a string literal", decl.name),
                decl.loc,
            )),
        }
        return;
    }

    if decl.qualifiers.is_extern {
        tracing::debug!(name = %decl.name, "skipping extern declaration");
        return;
    }

    let mut ty = match resolved.resolve_type(&decl.ty, decl.loc) {
        Ok(ty) => ty,
        Err(err) => {
            resolved.file_errors.push(err);
            return;
        }
    };

    let init = match &decl.init {
        None => None,
        Some(Initializer::Expr(Expr {
            kind: ExprKind::StringLiteral(text),
            ..
        })) => {
            if let CType::Array(elem, 0) = &ty {
                ty = CType::Array(elem.clone(), text.len() as u64 + 1);
            }
            Some(GlobalInit::Bytes(text.clone()))
        }
        Some(Initializer::Expr(expr)) => match const_eval::eval(expr, &*resolved) {
            Some(value) => {
                let value = match ty.int_type() {
                    Some(it) => value.convert(it).value,
                    None => value.value,
                };
                Some(GlobalInit::Scalar(value))
            }
            None => {
                resolved.file_errors.push(SemanticError::new(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("initializer of global `{}` is not a constant expression", decl.name),
                    expr.loc,
                ));
                return;
            }
        },
        Some(Initializer::List { items, loc }) => {
            let all_zero = items.iter().all(|item| match &item.value {
                Initializer::Expr(expr) => {
                    const_eval::eval(expr, resolved).is_some_and(|v| v.value == 0)
                }
                Initializer::List { items, .. } => items.is_empty(),
            });
            if all_zero {
                Some(GlobalInit::Zeroed)
            } else if list_is_constant(items, resolved) {
                Some(GlobalInit::Aggregate)
            } else {
                resolved.file_errors.push(SemanticError::new(
                    SemanticErrorKind::UnsupportedConstruct,
                    format!("initializer of global `{}` is not constant", decl.name),
                    *loc,
                ));
                return;
            }
        }
    };

    if ty.size(&resolved.structs).is_none() {
        resolved.file_errors.push(SemanticError::new(
            SemanticErrorKind::UnknownType,
            format!("global `{}` has incomplete type `{}`", decl.name, ty),
            decl.loc,
        ));
        return;
    }

    let mutability = if decl.qualifiers.is_volatile {
        Mutability::Volatile
    } else if decl.qualifiers.is_const {
        Mutability::Const
    } else {
        Mutability::Mutable
    };

    resolved.globals.push(GlobalVar {
        name: decl.name.clone(),
        ty,
        mutability,
        init,
        section,
        location: decl.loc,
    });
}

fn list_is_constant(items: &[crate::parser::InitItem], env: &ResolvedUnit) -> bool {
    items.iter().all(|item| match &item.value {
        Initializer::Expr(Expr {
            kind: ExprKind::StringLiteral(_),
            ..
        }) => true,
        Initializer::Expr(expr) => const_eval::eval(expr, env).is_some(),
        Initializer::List { items, .. } => list_is_constant(items, env),
    })
}

fn resolve_map(
    resolved: &mut ResolvedUnit,
    decl: &GlobalDecl,
    attr_struct: Option<&StructDef>,
    section: Option<&str>,
) {
    let result = match (attr_struct, section) {
        (Some(def), Some(MAPS_SECTION)) => map_fields(resolved, def)
            .and_then(|fields| fields.validate(&decl.name, decl.loc)),
        (Some(_), _) => Err(SemanticError::new(
            SemanticErrorKind::IncompleteMapDeclaration,
            format!("map `{}` is not placed in SEC(\"{}\")", decl.name, MAPS_SECTION),
            decl.loc,
        )),
        (None, _) => Err(SemanticError::new(
            SemanticErrorKind::IncompleteMapDeclaration,
            format!("`{}` is in SEC(\"{}\") but declares no map attributes", decl.name, MAPS_SECTION),
            decl.loc,
        )),
    };

    match result {
        Ok(def) => {
            tracing::debug!(map = %def.name, kind = %def.kind, "resolved map");
            resolved.maps.push(def);
        }
        Err(err) => {
            tracing::warn!(map = %decl.name, "{}", err);
            resolved.file_errors.push(err.clone());
            resolved.invalid_maps.insert(decl.name.clone(), err);
        }
    }
}

/// Gather attribute members into map fields
fn map_fields(resolved: &ResolvedUnit, def: &StructDef) -> Result<MapFields, SemanticError> {
    let mut fields = MapFields::default();

    for attr in &def.attributes {
        let incomplete = |message: String| {
            SemanticError::new(SemanticErrorKind::IncompleteMapDeclaration, message, attr.loc)
        };
        match attr.key.as_str() {
            "type" => {
                let kind = match &attr.value {
                    AttrValue::Expr(Expr {
                        kind: ExprKind::Ident(name),
                        ..
                    }) if name.starts_with("BPF_MAP_TYPE_") => Some(MapKind::from_type_name(name)),
                    AttrValue::Expr(expr) => const_eval::eval(expr, resolved)
                        .and_then(|v| v.as_u64())
                        .and_then(MapKind::from_code),
                    _ => None,
                };
                fields.kind = Some(kind.ok_or_else(|| {
                    incomplete(format!("map type `{}` is not recognized", attr_text(resolved, &attr.value)))
                })?);
            }
            "key" | "value" => {
                let ty = match &attr.value {
                    AttrValue::Type(ty) => resolved.resolve_type(ty, attr.loc)?,
                    AttrValue::Expr(Expr {
                        kind: ExprKind::Ident(name),
                        ..
                    }) => resolved.resolve_type(&TypeExpr::Named(name.clone()), attr.loc)?,
                    other => {
                        return Err(incomplete(format!(
                            "map {} must be a type, found `{}`",
                            attr.key,
                            attr_text(resolved, other)
                        )))
                    }
                };
                let size = resolved.size_of(&ty).ok_or_else(|| {
                    SemanticError::new(
                        SemanticErrorKind::UnknownType,
                        format!("map {} type `{}` has no known layout", attr.key, ty),
                        attr.loc,
                    )
                })?;
                if attr.key == "key" {
                    fields.key = Some((ty, size));
                } else {
                    fields.value = Some((ty, size));
                }
            }
            "key_size" | "value_size" | "max_entries" => {
                let value = match &attr.value {
                    AttrValue::Expr(expr) => const_eval::eval(expr, resolved).and_then(|v| v.as_u64()),
                    _ => None,
                }
                .ok_or_else(|| {
                    incomplete(format!(
                        "{} of map `{}` is not a constant expression",
                        attr.key, def.name
                    ))
                })?;
                match attr.key.as_str() {
                    "key_size" => fields.key_size = Some(value),
                    "value_size" => fields.value_size = Some(value),
                    _ => fields.max_entries = Some(value),
                }
            }
            other => {
                fields
                    .extra
                    .insert(other.to_string(), attr_text(resolved, &attr.value));
            }
        }
    }
    Ok(fields)
}

/// Text form of an attribute value kept as opaque metadata
fn attr_text(resolved: &ResolvedUnit, value: &AttrValue) -> String {
    match value {
        AttrValue::Type(ty) => ty.to_string(),
        AttrValue::Raw(text) => text.clone(),
        AttrValue::Expr(expr) => match (&expr.kind, const_eval::eval(expr, resolved)) {
            (ExprKind::Ident(name), _) => name.clone(),
            (_, Some(value)) => value.value.to_string(),
            (ExprKind::StringLiteral(text), None) => text.clone(),
            _ => "<expression>".to_string(),
        },
    }
}

fn resolve_program(resolved: &mut ResolvedUnit, def: &FunctionDef, options: &CompileOptions) {
    let Some(section) = &def.section else {
        return;
    };
    let (head, target) = match section.name.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (section.name.as_str(), ""),
    };
    let hook = HookKind::parse(head);
    let scope = DiagnosticScope::Program(def.name.clone());

    let mut rejection = None;
    let attach = match hook {
        None => {
            rejection = Some(SemanticError::new(
                SemanticErrorKind::UnsupportedHookKind,
                format!("section `{}` names unknown hook kind `{}`", section.name, head),
                section.loc,
            ));
            AttachTarget {
                raw: target.to_string(),
                status: AttachStatus::Unresolved,
            }
        }
        Some(hook) => {
            let (status, reason) =
                classify_target(hook, target, options.attach_registry.as_ref());
            if let Some(reason) = reason {
                // registry misses stay advisories under either policy
                let escalate = options.attach_policy == AttachTargetPolicy::Strict
                    && (status == AttachStatus::Placeholder || !follows_convention(hook, target));
                if escalate {
                    rejection = Some(SemanticError::new(
                        SemanticErrorKind::InvalidAttachTarget,
                        reason,
                        section.loc,
                    ));
                } else {
                    resolved.advisory(
                        scope,
                        AdvisoryKind::UnresolvedAttachTarget,
                        reason,
                        section.loc,
                    );
                }
            }
            AttachTarget {
                raw: target.to_string(),
                status,
            }
        }
    };

    resolved.programs.push(ProgramEntry {
        name: def.name.clone(),
        section: section.name.clone(),
        hook,
        attach,
        rejection,
        location: def.loc,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn resolve_src(source: &str) -> ResolvedUnit {
        let unit = parse_source(source).unwrap();
        resolve(&unit, "test.bpf.c", &CompileOptions::default())
    }

    #[test]
    fn test_ringbuf_size_folds() {
        let unit = resolve_src(
            "struct { __uint(type, BPF_MAP_TYPE_RINGBUF); __uint(max_entries, 1 << 24); } rb SEC(\".maps\");\n\
             struct { __uint(type, BPF_MAP_TYPE_RINGBUF); __uint(max_entries, 256 * 1024); } rb2 SEC(\".maps\");\n\
             char LICENSE[] SEC(\"license\") = \"GPL\";",
        );
        assert_eq!(unit.maps[0].max_entries, Some(16_777_216));
        assert_eq!(unit.maps[1].max_entries, Some(262_144));
        assert_eq!(unit.license.as_deref(), Some("GPL"));
        assert!(unit.advisories.is_empty());
        assert!(unit.globals.is_empty());
    }

    #[test]
    fn test_incomplete_map_is_file_error() {
        let unit = resolve_src(
            "struct { __uint(type, BPF_MAP_TYPE_HASH); __type(key, u32); __type(value, u64); } m SEC(\".maps\");",
        );
        assert!(unit.maps.is_empty());
        assert!(unit.invalid_maps.contains_key("m"));
        assert!(unit.is_map("m"));
        assert_eq!(
            unit.file_errors[0].kind,
            SemanticErrorKind::IncompleteMapDeclaration
        );
    }

    #[test]
    fn test_perf_array_sizes_and_alias() {
        let unit = resolve_src(
            "#define u32 unsigned int\n\
             struct { __uint(type, BPF_MAP_TYPE_PERF_EVENT_ARRAY); __uint(key_size, sizeof(u32));\n\
                      __uint(value_size, sizeof(u32)); } events SEC(\".maps\");",
        );
        let map = unit.map("events").unwrap();
        assert_eq!(map.kind, MapKind::PerfEventArray);
        assert_eq!(map.key_size, Some(4));
        assert_eq!(map.max_entries, None);
    }

    #[test]
    fn test_pointer_key_and_extra() {
        let unit = resolve_src(
            "struct { __uint(type, BPF_MAP_TYPE_HASH); __uint(max_entries, 10240);\n\
                      __type(key, struct request *); __type(value, u64);\n\
                      __uint(pinning, LIBBPF_PIN_BY_NAME); } start SEC(\".maps\");",
        );
        let map = unit.map("start").unwrap();
        assert_eq!(map.key_size, None);
        assert_eq!(map.key_type.as_ref().and_then(|t| unit.size_of(t)), Some(8));
        assert_eq!(map.extra.get("pinning").map(String::as_str), Some("LIBBPF_PIN_BY_NAME"));
    }

    #[test]
    fn test_globals_and_mutability() {
        let unit = resolve_src(
            "struct test_struct { u64 a; u64 b; };\n\
             struct test_struct w = {};\n\
             volatile __u64 prev_time = 0;\n\
             const int limit = 3 * 4;\n",
        );
        assert_eq!(unit.globals.len(), 3);
        assert_eq!(unit.global("w").unwrap().init, Some(GlobalInit::Zeroed));
        assert!(unit.global("prev_time").unwrap().is_volatile());
        assert_eq!(unit.constants.get("limit").unwrap().value, 12);
        assert!(!unit.constants.contains_key("prev_time"));
        assert_eq!(unit.advisories.len(), 1);
        assert_eq!(unit.advisories[0].kind.tag(), "missing-license");
    }

    #[test]
    fn test_program_sections() {
        let unit = resolve_src(
            "SEC(\"tp/syscalls/sys_enter_execve\") int a(void *ctx) { return 0; }\n\
             SEC(\"kprobe/YOUR_PROBE_POINT\") int b(void *ctx) { return 0; }\n\
             SEC(\"uprobe/lib\") int c(void *ctx) { return 0; }\n\
             SEC(\"xdp\") int d(struct xdp_md *ctx) { return XDP_PASS; }\n\
             static int helper(int x) { return x; }\n\
             char LICENSE[] SEC(\"license\") = \"GPL\";",
        );
        assert_eq!(unit.programs.len(), 4);
        assert_eq!(unit.programs[0].hook, Some(HookKind::Tracepoint));
        assert_eq!(unit.programs[0].attach.raw, "syscalls/sys_enter_execve");
        assert_eq!(unit.programs[0].attach.status, AttachStatus::Resolved);
        assert_eq!(unit.programs[1].attach.status, AttachStatus::Placeholder);
        assert!(unit.programs[1].rejection.is_none());
        assert_eq!(
            unit.programs[2].rejection.as_ref().unwrap().kind,
            SemanticErrorKind::UnsupportedHookKind
        );
        assert_eq!(unit.programs[3].attach.status, AttachStatus::Resolved);
        assert!(unit.functions.contains_key("helper"));
        assert_eq!(unit.advisories.len(), 1);
    }

    #[test]
    fn test_strict_policy_rejects_placeholder() {
        let unit = parse_source("SEC(\"kprobe/YOUR_PROBE_POINT\") int b(void *ctx) { return 0; }")
            .unwrap();
        let options = CompileOptions {
            attach_policy: AttachTargetPolicy::Strict,
            ..CompileOptions::default()
        };
        let resolved = resolve(&unit, "t.c", &options);
        assert_eq!(
            resolved.programs[0].rejection.as_ref().unwrap().kind,
            SemanticErrorKind::InvalidAttachTarget
        );
    }

    #[test]
    fn test_registry_miss_is_advisory() {
        let unit =
            parse_source("SEC(\"kprobe/do_unlinkat\") int b(void *ctx) { return 0; }").unwrap();
        let options = CompileOptions {
            attach_registry: Some(["vfs_read".to_string()].into_iter().collect()),
            attach_policy: AttachTargetPolicy::Strict,
            ..CompileOptions::default()
        };
        let resolved = resolve(&unit, "t.c", &options);
        assert_eq!(resolved.programs[0].attach.status, AttachStatus::Unresolved);
        assert!(resolved.programs[0].rejection.is_none());
    }

    #[test]
    fn test_user_struct_overrides_kernel() {
        let unit = resolve_src(
            "struct trace_entry { short unsigned int type; unsigned char flags; };\n\
             struct event { u32 pid; char comm[TASK_COMM_LEN]; u64 ts; };",
        );
        assert_eq!(unit.layout("trace_entry").unwrap().size, 4);
        assert!(!unit.layout("trace_entry").unwrap().opaque);
        assert_eq!(unit.layout("event").unwrap().size, 32);
    }

    #[test]
    fn test_placeholder_heuristic() {
        assert!(is_placeholder("YOUR_PROBE_POINT"));
        assert!(is_placeholder("<function>"));
        assert!(!is_placeholder("do_unlinkat"));
        assert!(!is_placeholder("syscalls/sys_enter_execve"));
    }
}
