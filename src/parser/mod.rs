//! Parser for the restricted C dialect
//!
//! Turns the token stream into a [`TranslationUnit`]. Preprocessor lines stay
//! opaque except for object-like `#define`s, which are recognized as type
//! aliases or constant expressions.

mod ast;
mod c_parser;

pub use ast::{
    AttrValue, BinaryOp, Designator, EntryWrapper, EnumDef, Expr, ExprKind, FieldDecl,
    FunctionDef, FunctionProto, GlobalDecl, InitItem, Initializer, Item, LocalDecl, Location,
    MacroBody, MacroDef, MapAttribute, Param, Precedence, Qualifiers, Section, Stmt, StmtKind,
    StructDef, TranslationUnit, TypeExpr, UnaryOp,
};
pub use c_parser::CParser;

use crate::error::Result;
use crate::lexer::CScanner;

/// Scan and parse a complete source unit
pub fn parse_source(source: &str) -> Result<TranslationUnit> {
    let tokens = CScanner::new(source).scan_tokens()?;
    CParser::new(tokens).parse()
}
