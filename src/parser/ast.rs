use serde::{Deserialize, Serialize};
use std::fmt;

/// Source position (1-indexed line and column)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Location {
    /// Line number
    pub line: usize,
    /// Column number
    pub column: usize,
}

impl Location {
    /// Creates a location
    pub fn new(line: usize, column: usize) -> Self {
        Location { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Complete translation unit (one source file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TranslationUnit {
    /// Top-level items in source order
    pub items: Vec<Item>,
}

/// Top-level item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// Preprocessor line kept as opaque text (`#include`, `#pragma`, ...)
    Directive {
        /// Text after the `#`
        text: String,
        /// Where the directive starts
        loc: Location,
    },
    /// `#define NAME body`
    Define(MacroDef),
    /// `typedef <type> name;`
    Typedef {
        /// New type name
        name: String,
        /// Aliased type
        ty: TypeExpr,
        /// Declaration location
        loc: Location,
    },
    /// Struct or union definition (named, or synthesized for anonymous ones)
    Struct(StructDef),
    /// Enum definition (its enumerators become named constants)
    Enum(EnumDef),
    /// Global variable (one item per declarator)
    Global(GlobalDecl),
    /// Function with a body
    Function(FunctionDef),
    /// Function declaration without a body
    Prototype(FunctionProto),
}

/// Object-like `#define`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    /// Macro name
    pub name: String,
    /// Parsed body
    pub body: MacroBody,
    /// Directive location
    pub loc: Location,
}

/// What a `#define` body was recognized as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MacroBody {
    /// Body is a type name: the macro is a type alias
    Type(TypeExpr),
    /// Body is an expression (folded later when constant)
    Expr(Expr),
    /// Function-like macro or anything else: kept verbatim
    Opaque(String),
}

/// Type as written in source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    /// `void`
    Void,
    /// `_Bool` / `bool`
    Bool,
    /// Integer type of a fixed width
    Int {
        /// Width in bits (8, 16, 32, 64)
        bits: u8,
        /// Signedness
        signed: bool,
    },
    /// Typedef or `#define` alias name, resolved later
    Named(String),
    /// `struct tag` / `union tag` (anonymous ones get a synthesized tag)
    Struct(String),
    /// Pointer to a type
    Pointer(Box<TypeExpr>),
    /// Array with optional length expression
    Array(Box<TypeExpr>, Option<Box<Expr>>),
}

impl TypeExpr {
    /// Shorthand for an integer type
    pub fn int(bits: u8, signed: bool) -> Self {
        TypeExpr::Int { bits, signed }
    }

    /// Fixed-width integer spelled with a well-known header typedef
    pub fn builtin(name: &str) -> Option<TypeExpr> {
        let ty = match name {
            "u8" | "__u8" | "uint8_t" => TypeExpr::int(8, false),
            "u16" | "__u16" | "uint16_t" | "__be16" | "__le16" => TypeExpr::int(16, false),
            "u32" | "__u32" | "uint32_t" | "__be32" | "__le32" | "__wsum" | "uid_t" | "gid_t" => {
                TypeExpr::int(32, false)
            }
            "u64" | "__u64" | "uint64_t" | "__be64" | "__le64" | "size_t" | "uintptr_t" => {
                TypeExpr::int(64, false)
            }
            "s8" | "__s8" | "int8_t" => TypeExpr::int(8, true),
            "s16" | "__s16" | "int16_t" => TypeExpr::int(16, true),
            "s32" | "__s32" | "int32_t" | "pid_t" => TypeExpr::int(32, true),
            "s64" | "__s64" | "int64_t" | "ssize_t" | "loff_t" => TypeExpr::int(64, true),
            "bool" => TypeExpr::Bool,
            _ => return None,
        };
        Some(ty)
    }

    /// True for pointer types
    pub fn is_pointer(&self) -> bool {
        matches!(self, TypeExpr::Pointer(_))
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeExpr::Void => write!(f, "void"),
            TypeExpr::Bool => write!(f, "bool"),
            TypeExpr::Int { bits, signed } => {
                write!(f, "{}{}", if *signed { "s" } else { "u" }, bits)
            }
            TypeExpr::Named(name) => write!(f, "{}", name),
            TypeExpr::Struct(tag) => write!(f, "struct {}", tag),
            TypeExpr::Pointer(inner) => write!(f, "{} *", inner),
            TypeExpr::Array(inner, _) => write!(f, "{}[]", inner),
        }
    }
}

/// Struct or union definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    /// Tag (synthesized as `anon.N` for anonymous definitions)
    pub name: String,
    /// Definition had no tag in source
    pub anonymous: bool,
    /// `union` instead of `struct`
    pub is_union: bool,
    /// Data members in declaration order
    pub fields: Vec<FieldDecl>,
    /// Attribute-call members (`__uint(type, ...)`, `__type(key, ...)`)
    pub attributes: Vec<MapAttribute>,
    /// Definition location
    pub loc: Location,
}

/// Struct data member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: TypeExpr,
    /// Member location
    pub loc: Location,
}

/// Attribute-call member of a map struct, e.g. `__uint(max_entries, 1 << 24)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAttribute {
    /// Macro used (`__uint`, `__type`, `__array`, ...)
    pub macro_name: String,
    /// Attribute key (`type`, `key`, `value`, `max_entries`, ...)
    pub key: String,
    /// Attribute value
    pub value: AttrValue,
    /// Member location
    pub loc: Location,
}

/// Value of a map attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Expression (`1 << 24`, `BPF_MAP_TYPE_HASH`, `sizeof(int)`)
    Expr(Expr),
    /// Type (`u64`, `struct event`)
    Type(TypeExpr),
    /// Anything else, verbatim
    Raw(String),
}

/// `enum` definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    /// Tag, if any
    pub name: Option<String>,
    /// Enumerators with explicit values where given
    pub variants: Vec<(String, Option<Expr>)>,
    /// Definition location
    pub loc: Location,
}

/// `SEC("...")` marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section string
    pub name: String,
    /// Location of the `SEC` token
    pub loc: Location,
}

/// Declaration qualifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qualifiers {
    /// `const`
    pub is_const: bool,
    /// `volatile`
    pub is_volatile: bool,
    /// `static`
    pub is_static: bool,
    /// `extern`
    pub is_extern: bool,
    /// `inline` / `__always_inline`
    pub is_inline: bool,
}

/// Global variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDecl {
    /// Variable name
    pub name: String,
    /// Declared type
    pub ty: TypeExpr,
    /// Qualifiers
    pub qualifiers: Qualifiers,
    /// Section marker, if any
    pub section: Option<Section>,
    /// Initializer
    pub init: Option<Initializer>,
    /// Declarator location
    pub loc: Location,
}

/// Entry wrapper macro used in place of a plain declarator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryWrapper {
    /// `BPF_KPROBE(name, params...)`
    Kprobe,
    /// `BPF_KRETPROBE(name, params...)`
    Kretprobe,
    /// `BPF_PROG(name, params...)`
    Prog,
}

impl EntryWrapper {
    /// Recognize a wrapper macro name
    pub fn from_macro(name: &str) -> Option<Self> {
        match name {
            "BPF_KPROBE" => Some(EntryWrapper::Kprobe),
            "BPF_KRETPROBE" => Some(EntryWrapper::Kretprobe),
            "BPF_PROG" => Some(EntryWrapper::Prog),
            _ => None,
        }
    }
}

/// Function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name (unnamed in prototypes)
    pub name: Option<String>,
    /// Parameter type
    pub ty: TypeExpr,
    /// Parameter location
    pub loc: Location,
}

/// Function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Return type
    pub ret: TypeExpr,
    /// Parameters (for wrapped entries: the wrapper's typed parameters)
    pub params: Vec<Param>,
    /// Body statements
    pub body: Vec<Stmt>,
    /// Qualifiers
    pub qualifiers: Qualifiers,
    /// Section marker, if any
    pub section: Option<Section>,
    /// Entry wrapper macro, if declared through one
    pub wrapper: Option<EntryWrapper>,
    /// Declarator location
    pub loc: Location,
}

/// Function prototype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    /// Function name
    pub name: String,
    /// Return type
    pub ret: TypeExpr,
    /// Parameters
    pub params: Vec<Param>,
    /// Takes `...`
    pub variadic: bool,
    /// Declarator location
    pub loc: Location,
}

/// Initializer of a declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// `= expr`
    Expr(Expr),
    /// `= { ... }`
    List {
        /// Elements with optional designators
        items: Vec<InitItem>,
        /// Location of `{`
        loc: Location,
    },
}

/// One element of an initializer list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitItem {
    /// `.field =` or `[index] =`
    pub designator: Option<Designator>,
    /// Element value
    pub value: Initializer,
}

/// Initializer designator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Designator {
    /// `.field`
    Field(String),
    /// `[index]`
    Index(Expr),
}

/// Local variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDecl {
    /// Variable name
    pub name: String,
    /// Declared type
    pub ty: TypeExpr,
    /// Qualifiers
    pub qualifiers: Qualifiers,
    /// Initializer
    pub init: Option<Initializer>,
    /// Declarator location
    pub loc: Location,
}

/// Statement with location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    /// Statement kind
    pub kind: StmtKind,
    /// Location of the first token
    pub loc: Location,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// Declaration with one or more declarators
    Decl(Vec<LocalDecl>),
    /// Expression statement
    Expr(Expr),
    /// `{ ... }`
    Block(Vec<Stmt>),
    /// `if (cond) then else`
    If {
        /// Condition
        cond: Expr,
        /// Then branch
        then_branch: Box<Stmt>,
        /// Optional else branch
        else_branch: Option<Box<Stmt>>,
    },
    /// `while (cond) body`
    While {
        /// Condition
        cond: Expr,
        /// Loop body
        body: Box<Stmt>,
    },
    /// `do body while (cond);`
    DoWhile {
        /// Loop body
        body: Box<Stmt>,
        /// Condition
        cond: Expr,
    },
    /// `for (init; cond; step) body`
    For {
        /// Init clause (declaration or expression statement)
        init: Option<Box<Stmt>>,
        /// Condition (absent means always true)
        cond: Option<Expr>,
        /// Step expression
        step: Option<Expr>,
        /// Loop body
        body: Box<Stmt>,
    },
    /// `return expr;`
    Return(Option<Expr>),
    /// `break;`
    Break,
    /// `continue;`
    Continue,
    /// `;`
    Empty,
}

/// Expression with location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Expression kind
    pub kind: ExprKind,
    /// Location of the first token
    pub loc: Location,
}

impl Expr {
    /// Creates an expression
    pub fn new(kind: ExprKind, loc: Location) -> Self {
        Expr { kind, loc }
    }

    /// Identifier name if this is a bare identifier
    pub fn as_ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer literal
    IntLiteral {
        /// Value as written
        value: u64,
        /// `u` suffix
        unsigned: bool,
        /// `l`/`ll` suffix
        long: bool,
        /// Hex, octal or binary spelling
        non_decimal: bool,
    },
    /// Character literal
    CharLiteral(u8),
    /// String literal (adjacent literals already concatenated)
    StringLiteral(String),
    /// Identifier
    Ident(String),
    /// Prefix operator
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operator (including `&&` and `||`)
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// `=` or a compound assignment (`op` is the arithmetic part)
    Assign {
        /// Arithmetic part of a compound assignment
        op: Option<BinaryOp>,
        /// Assigned lvalue
        target: Box<Expr>,
        /// Assigned value
        value: Box<Expr>,
    },
    /// `cond ? a : b`
    Conditional {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then_expr: Box<Expr>,
        /// Value when false
        else_expr: Box<Expr>,
    },
    /// Direct call by name
    Call {
        /// Called function or helper
        callee: String,
        /// Arguments
        args: Vec<Expr>,
    },
    /// `base.field` or `base->field`
    Member {
        /// Struct or pointer expression
        base: Box<Expr>,
        /// Member name
        field: String,
        /// Written with `->`
        arrow: bool,
    },
    /// `base[index]`
    Index {
        /// Array or pointer
        base: Box<Expr>,
        /// Index
        index: Box<Expr>,
    },
    /// `(type) expr`
    Cast {
        /// Target type
        ty: TypeExpr,
        /// Operand
        expr: Box<Expr>,
    },
    /// `sizeof(type)`
    SizeofType(TypeExpr),
    /// `sizeof expr`
    SizeofExpr(Box<Expr>),
    /// `++x`, `x++`, `--x`, `x--`
    IncDec {
        /// Modified lvalue
        target: Box<Expr>,
        /// `++` rather than `--`
        increment: bool,
        /// Prefix form
        prefix: bool,
    },
    /// `a, b`
    Comma(Box<Expr>, Box<Expr>),
}

/// Prefix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Plus,
    /// `!x`
    Not,
    /// `~x`
    BitNot,
    /// `*p`
    Deref,
    /// `&x`
    AddrOf,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    // Arithmetic
    /// Addition operator (+)
    Add,
    /// Subtraction operator (-)
    Sub,
    /// Multiplication operator (*)
    Mul,
    /// Division operator (/)
    Div,
    /// Modulo operator (%)
    Mod,

    // Bitwise
    /// Left shift (<<)
    Shl,
    /// Right shift (>>)
    Shr,
    /// Bitwise and (&)
    BitAnd,
    /// Bitwise or (|)
    BitOr,
    /// Bitwise xor (^)
    BitXor,

    // Comparison
    /// Equality operator (==)
    Eq,
    /// Inequality operator (!=)
    Ne,
    /// Less than operator (<)
    Lt,
    /// Greater than operator (>)
    Gt,
    /// Less than or equal operator (<=)
    Le,
    /// Greater than or equal operator (>=)
    Ge,

    // Logical
    /// Short-circuit and (&&)
    LogicalAnd,
    /// Short-circuit or (||)
    LogicalOr,
}

/// Operator precedence levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    /// No precedence
    None,
    /// Comma operator
    Comma,
    /// Assignment operators (=, +=, ...)
    Assignment,
    /// Ternary operator
    Conditional,
    /// Logical OR operator
    LogicalOr,
    /// Logical AND operator
    LogicalAnd,
    /// Bitwise OR
    BitOr,
    /// Bitwise XOR
    BitXor,
    /// Bitwise AND
    BitAnd,
    /// Equality operators (==, !=)
    Equality,
    /// Relational operators (<, >, <=, >=)
    Relational,
    /// Shifts (<<, >>)
    Shift,
    /// Addition and subtraction (+, -)
    Additive,
    /// Multiplication, division, modulo (*, /, %)
    Multiplicative,
    /// Prefix operators
    Unary,
    /// Call operators (., ->, (), [])
    Postfix,
}

impl BinaryOp {
    /// Returns the precedence level of this binary operator
    pub fn precedence(&self) -> Precedence {
        match self {
            BinaryOp::LogicalOr => Precedence::LogicalOr,
            BinaryOp::LogicalAnd => Precedence::LogicalAnd,
            BinaryOp::BitOr => Precedence::BitOr,
            BinaryOp::BitXor => Precedence::BitXor,
            BinaryOp::BitAnd => Precedence::BitAnd,
            BinaryOp::Eq | BinaryOp::Ne => Precedence::Equality,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => Precedence::Relational,
            BinaryOp::Shl | BinaryOp::Shr => Precedence::Shift,
            BinaryOp::Add | BinaryOp::Sub => Precedence::Additive,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => Precedence::Multiplicative,
        }
    }

    /// Comparison operators produce 0/1
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }

    /// `&&` / `||`
    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }

    /// Comparison with operands swapped (`a < b` is `b > a`)
    pub fn swapped(&self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Ge => BinaryOp::Le,
            other => *other,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        };
        f.write_str(s)
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Plus => write!(f, "+"),
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::BitNot => write!(f, "~"),
            UnaryOp::Deref => write!(f, "*"),
            UnaryOp::AddrOf => write!(f, "&"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_ordering() {
        assert!(BinaryOp::Add.precedence() > BinaryOp::Shl.precedence());
        assert!(BinaryOp::Mul.precedence() > BinaryOp::Add.precedence());
        assert!(BinaryOp::Eq.precedence() > BinaryOp::BitAnd.precedence());
        assert!(BinaryOp::LogicalAnd.precedence() > BinaryOp::LogicalOr.precedence());
    }

    #[test]
    fn test_builtin_type_names() {
        assert_eq!(TypeExpr::builtin("__u64"), Some(TypeExpr::int(64, false)));
        assert_eq!(TypeExpr::builtin("s32"), Some(TypeExpr::int(32, true)));
        assert_eq!(TypeExpr::builtin("task_struct"), None);
        assert_eq!(TypeExpr::int(64, false).to_string(), "u64");
    }

    #[test]
    fn test_location_ordering() {
        assert!(Location::new(2, 1) > Location::new(1, 80));
        assert_eq!(Location::new(4, 2).to_string(), "4:2");
    }
}
