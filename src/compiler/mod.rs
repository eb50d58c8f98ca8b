//! # ebpfc Compiler - restricted eBPF C to verified program artifacts
//!
//! This module drives one source unit through the whole pipeline and
//! collects everything it produces into a [`FileReport`].
//!
//! ## Architecture
//!
//! ```text
//! Source → AST → Resolve → (per Program) Inline → Lower → Safety → Artifact
//! ```
//!
//! A syntax error aborts the file. A semantic error rejects only the Program
//! it belongs to; its siblings still compile.
//!
//! ## Usage
//!
//! ```ignore
//! use ebpfc::compiler::{CompileOptions, Compiler};
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let report = compiler.compile_file("probe.bpf.c")?;
//! for diagnostic in &report.diagnostics {
//!     eprintln!("{}", diagnostic);
//! }
//! if let Some(artifact) = &report.artifact {
//!     std::fs::write("probe.json", artifact.to_bytes()?)?;
//! }
//! ```

pub mod artifact;
pub mod const_eval;
pub mod helpers;
pub mod inliner;
pub mod ir;
pub mod maps;
pub mod resolver;
pub mod safety;
pub mod types;

pub use artifact::{Artifact, FileReport, FileStatus, ProgramDescriptor};
pub use helpers::{HelperSignature, HelperTable, ParamKind};
pub use ir::{lower_program, IrGenerator, IrInstruction, IrProgram, IrReg};
pub use maps::{MapDef, MapKind};
pub use resolver::{resolve, AttachStatus, AttachTarget, HookKind, ProgramEntry, ResolvedUnit};
pub use safety::{GlobalRace, SafetyReport};
pub use types::{CType, IntType, StructLayout, StructTable};

use crate::diagnostics::{AdvisoryKind, Diagnostic, DiagnosticScope};
use crate::error::{Error, Result, SemanticError, SemanticErrorKind};
use crate::parser::{parse_source, TranslationUnit};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// How unresolvable attach targets are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachTargetPolicy {
    /// Placeholders and unconventional names produce an advisory
    #[default]
    Advisory,
    /// Placeholders and unconventional names reject the Program
    Strict,
}

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Largest trip count a counted loop may have
    pub max_loop_iterations: u64,
    /// Attach target escalation
    pub attach_policy: AttachTargetPolicy,
    /// Known attach targets; `None` skips the registry lookup
    pub attach_registry: Option<BTreeSet<String>>,
    /// Helper signature table
    pub helpers: Arc<HelperTable>,
    /// Opaque kernel struct layouts
    pub kernel_structs: Arc<StructTable>,
    /// Compile the Programs of one file in parallel
    pub parallel: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_loop_iterations: 8 * 1024 * 1024,
            attach_policy: AttachTargetPolicy::Advisory,
            attach_registry: None,
            helpers: Arc::new(HelperTable::default()),
            kernel_structs: Arc::new(StructTable::default()),
            parallel: true,
        }
    }
}

/// What compiling one Program produced
struct ProgramOutcome {
    descriptor: Option<ProgramDescriptor>,
    diagnostics: Vec<Diagnostic>,
}

/// eBPF C compiler
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a new compiler with options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Options this compiler runs with
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Read and compile one source file
    ///
    /// Only a failure to read the file is an `Err`; everything the pipeline
    /// finds wrong with the source is reported through the [`FileReport`].
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<FileReport> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let source = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: name.clone(),
            message: e.to_string(),
        })?;
        Ok(self.compile_source(&name, &source))
    }

    /// Compile source text held in memory; `file` names it in diagnostics
    pub fn compile_source(&self, file: &str, source: &str) -> FileReport {
        match parse_source(source) {
            Ok(unit) => self.compile_unit(file, &unit),
            Err(err) => {
                tracing::warn!(file, error = %err, "parse failed, nothing resolved");
                FileReport::from_error(file, &err)
            }
        }
    }

    /// Compile an already parsed unit
    pub fn compile_unit(&self, file: &str, unit: &TranslationUnit) -> FileReport {
        let resolved = resolver::resolve(unit, file, &self.options);

        let mut diagnostics = resolved.advisories.clone();
        diagnostics.extend(
            resolved
                .file_errors
                .iter()
                .map(|err| Diagnostic::file_error(file, err)),
        );

        let outcomes: Vec<ProgramOutcome> = if self.options.parallel && resolved.programs.len() > 1
        {
            resolved
                .programs
                .par_iter()
                .map(|entry| self.compile_program(&resolved, entry))
                .collect()
        } else {
            resolved
                .programs
                .iter()
                .map(|entry| self.compile_program(&resolved, entry))
                .collect()
        };

        let mut artifact = Artifact::new(&resolved);
        for outcome in outcomes {
            diagnostics.extend(outcome.diagnostics);
            artifact.programs.extend(outcome.descriptor);
        }

        let status = FileStatus::classify(artifact.programs.len(), &diagnostics);
        tracing::info!(
            file,
            %status,
            programs = artifact.programs.len(),
            candidates = resolved.programs.len(),
            diagnostics = diagnostics.len(),
            "compiled file"
        );
        FileReport {
            file: file.to_string(),
            status,
            artifact: Some(artifact),
            diagnostics,
        }
    }

    fn compile_program(&self, unit: &ResolvedUnit, entry: &ProgramEntry) -> ProgramOutcome {
        let file = unit.file.as_str();
        let reject = |errors: &[SemanticError], mut diagnostics: Vec<Diagnostic>| {
            for err in errors {
                tracing::warn!(file, program = %entry.name, kind = err.kind.tag(), "{}", err.message);
                diagnostics.push(Diagnostic::program_error(file, &entry.name, err));
            }
            ProgramOutcome {
                descriptor: None,
                diagnostics,
            }
        };

        if let Some(err) = &entry.rejection {
            return reject(std::slice::from_ref(err), Vec::new());
        }
        let Some(hook) = entry.hook else {
            let err = SemanticError::new(
                SemanticErrorKind::UnsupportedHookKind,
                format!("section `{}` names no known hook kind", entry.section),
                entry.location,
            );
            return reject(std::slice::from_ref(&err), Vec::new());
        };
        let Some(def) = unit.function(&entry.name) else {
            let err = SemanticError::new(
                SemanticErrorKind::UndeclaredIdentifier,
                format!("entry function `{}` has no body", entry.name),
                entry.location,
            );
            return reject(std::slice::from_ref(&err), Vec::new());
        };

        let graph = match inliner::check_program(unit, &entry.name) {
            Ok(graph) => graph,
            Err(err) => return reject(std::slice::from_ref(&err), Vec::new()),
        };
        tracing::debug!(
            program = %entry.name,
            functions = graph.functions().count(),
            "call graph is acyclic"
        );

        let program = match lower_program(unit, def, &self.options) {
            Ok(program) => program,
            Err(errors) => return reject(errors.as_slice(), Vec::new()),
        };

        let report = safety::check_program(unit, &self.options.helpers, &program);
        let advisories = report
            .races
            .iter()
            .map(|race| {
                tracing::warn!(file, program = %entry.name, global = %race.global, "unsynchronized global");
                Diagnostic::advisory(
                    file,
                    DiagnosticScope::Program(entry.name.clone()),
                    AdvisoryKind::UnsynchronizedGlobal,
                    format!(
                        "global `{}` is read and written without synchronization; concurrent invocations of `{}` race on it",
                        race.global, entry.name
                    ),
                    Some(race.location),
                )
            })
            .collect();
        if !report.passed() {
            return reject(report.errors.as_slice(), advisories);
        }

        tracing::debug!(program = %entry.name, hook = hook.name(), "program emitted");
        ProgramOutcome {
            descriptor: Some(ProgramDescriptor::new(unit, entry, hook, program)),
            diagnostics: advisories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticKind;

    const TWO_PROGRAMS: &str = r#"
char LICENSE[] SEC("license") = "GPL";

SEC("tracepoint/syscalls/sys_enter_openat")
int spin(void *ctx)
{
    int i = 0;
    while (i >= 0) {
        i = i + 1;
    }
    return 0;
}

SEC("tracepoint/syscalls/sys_enter_execve")
int fine(void *ctx)
{
    int i;
    int total = 0;
    for (i = 0; i < 8; i++)
        total += i;
    return total;
}
"#;

    fn compile(source: &str) -> FileReport {
        Compiler::new(CompileOptions::default()).compile_source("t.bpf.c", source)
    }

    #[test]
    fn test_partial_success_keeps_sibling() {
        let report = compile(TWO_PROGRAMS);
        assert_eq!(report.status, FileStatus::PartialSuccess);
        assert_eq!(report.program_names(), vec!["fine"]);
        let errors: Vec<_> = report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].semantic_kind(), Some(SemanticErrorKind::UnboundedLoop));
        assert_eq!(errors[0].scope, DiagnosticScope::Program("spin".to_string()));
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let parallel = compile(TWO_PROGRAMS);
        let sequential = Compiler::new(CompileOptions {
            parallel: false,
            ..Default::default()
        })
        .compile_source("t.bpf.c", TWO_PROGRAMS);
        assert_eq!(parallel.artifact, sequential.artifact);
        assert_eq!(parallel.diagnostics, sequential.diagnostics);
    }

    #[test]
    fn test_syntax_error_fails_file() {
        let report = compile("SEC(\"kprobe/x\") int f(void *ctx) { return 0;");
        assert_eq!(report.status, FileStatus::Failure);
        assert!(report.artifact.is_none());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Syntax);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let compiler = Compiler::new(CompileOptions::default());
        let err = compiler
            .compile_file("/nonexistent/dir/probe.bpf.c")
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_strict_policy_rejects_placeholder() {
        let source = r#"
char LICENSE[] SEC("license") = "GPL";
SEC("kprobe/YOUR_FUNCTION")
int probe(void *ctx) { return 0; }
"#;
        let advisory = compile(source);
        assert_eq!(advisory.status, FileStatus::Success);
        assert_eq!(advisory.program_names(), vec!["probe"]);
        assert_eq!(advisory.advisories().count(), 1);

        let strict = Compiler::new(CompileOptions {
            attach_policy: AttachTargetPolicy::Strict,
            ..Default::default()
        })
        .compile_source("t.bpf.c", source);
        assert_eq!(strict.status, FileStatus::Failure);
        assert_eq!(
            strict.errors().next().and_then(|d| d.semantic_kind()),
            Some(SemanticErrorKind::InvalidAttachTarget)
        );
    }
}
