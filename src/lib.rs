//! # ebpfc - A Front End for Restricted eBPF C
//!
//! ebpfc reads kernel-probe programs written in the restricted C dialect
//! used for eBPF (`SEC(...)` entry points, `.maps` declarations, helper
//! calls) and turns each source unit into a deterministic, loader-ready
//! artifact, after proving the properties the in-kernel verifier would
//! otherwise reject the program for.
//!
//! ## Features
//!
//! - **Map declarations** - `__uint`/`__type` attribute blocks resolved into
//!   typed map definitions, with constant-folded sizes (`1 << 24`, `256 * 1024`)
//! - **Bounded control flow** - every loop needs a provable trip count
//! - **Null safety** - nullable helper results must be tested before use
//! - **Helper signatures** - arity, argument categories and map kinds checked
//! - **Full inlining** - ordinary calls are spliced in; recursion is rejected
//! - **Partial success** - a broken Program never takes its siblings down
//!
//! ## Quick Start
//!
//! ```rust
//! use ebpfc::{CompileOptions, Compiler, FileStatus};
//!
//! let source = r#"
//! char LICENSE[] SEC("license") = "GPL";
//!
//! SEC("xdp")
//! int pass_all(void *ctx)
//! {
//!     return XDP_PASS;
//! }
//! "#;
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let report = compiler.compile_source("pass.bpf.c", source);
//!
//! assert_eq!(report.status, FileStatus::Success);
//! assert_eq!(report.program_names(), vec!["pass_all"]);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Source → CScanner → Tokens → CParser → AST → Resolver → Inliner
//!        → IrGenerator → SafetyChecker → Artifact (JSON + SHA-256)
//! ```
//!
//! ### Main Components
//!
//! - [`CScanner`] - Tokenizes source text; preprocessor lines stay opaque
//! - [`CParser`] - Parses tokens into a [`TranslationUnit`]
//! - [`compiler::resolver`] - Maps, globals, struct layouts, constants, Programs
//! - [`compiler::inliner`] - Call graphs and recursion detection
//! - [`compiler::ir`] - Basic-block IR with proven loop bounds
//! - [`compiler::safety`] - Null checks, helper and map checks, global races
//! - [`compiler::artifact`] - Deterministic artifact and file status
//! - [`parallel`] - Multi-file compilation on a rayon pool
//!
//! ## Error Handling
//!
//! A syntax error fails its file. Semantic errors reject only the Program
//! they occur in. Every problem, blocking or advisory, reaches the caller as
//! a [`Diagnostic`]; only an unreadable source file is an `Err`.

#![allow(clippy::only_used_in_recursion)] // False positive for recursive helper functions
#![allow(clippy::collapsible_match)] // Separate error handling for clarity

/// Version of the ebpfc front end
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod lexer;
pub mod parallel;
pub mod parser;

// Re-export main types
pub use compiler::{
    AttachTargetPolicy, Artifact, CompileOptions, Compiler, FileReport, FileStatus, HelperTable,
    StructTable,
};
pub use diagnostics::{AdvisoryKind, Diagnostic, DiagnosticKind, DiagnosticScope, Severity};
pub use error::{Error, ErrorSeverity, Result, SemanticError, SemanticErrorKind};
pub use lexer::{CScanner, Token, TokenKind};
pub use parser::{parse_source, CParser, Location, TranslationUnit};
pub use parallel::{compile_files, ParallelConfig};
