//! Structured diagnostic records
//!
//! Every error and advisory produced while compiling a file reaches the caller
//! as a [`Diagnostic`]. Nothing is dropped silently.

use crate::error::{Error, SemanticError, SemanticErrorKind};
use crate::parser::Location;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks emission of the affected Program (or the whole file)
    Error,
    /// Advisory, never blocks emission
    Warning,
}

/// Non-blocking diagnostic kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvisoryKind {
    /// Attach target is a placeholder or does not follow its hook's naming convention
    UnresolvedAttachTarget,
    /// Global read and written by a Program: racy under concurrent invocations
    UnsynchronizedGlobal,
    /// No `SEC("license")` declaration in the file
    MissingLicense,
}

impl AdvisoryKind {
    /// Stable kebab-case tag
    pub fn tag(&self) -> &'static str {
        match self {
            AdvisoryKind::UnresolvedAttachTarget => "unresolved-attach-target",
            AdvisoryKind::UnsynchronizedGlobal => "unsynchronized-global",
            AdvisoryKind::MissingLicense => "missing-license",
        }
    }
}

/// What a diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "category", content = "kind", rename_all = "lowercase")]
pub enum DiagnosticKind {
    /// Malformed source, the file could not be parsed
    Syntax,
    /// Semantic rejection
    Semantic(SemanticErrorKind),
    /// Non-blocking advisory
    Advisory(AdvisoryKind),
    /// Source unit could not be read
    Io,
}

impl DiagnosticKind {
    /// Stable tag used in rendered output
    pub fn tag(&self) -> &'static str {
        match self {
            DiagnosticKind::Syntax => "syntax-error",
            DiagnosticKind::Semantic(kind) => kind.tag(),
            DiagnosticKind::Advisory(kind) => kind.tag(),
            DiagnosticKind::Io => "io-error",
        }
    }
}

/// Which unit a diagnostic belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticScope {
    /// Applies to the translation unit as a whole
    FileLevel,
    /// Applies to one Program (entry point)
    Program(String),
}

impl fmt::Display for DiagnosticScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticScope::FileLevel => f.write_str("file-level"),
            DiagnosticScope::Program(name) => write!(f, "program `{}`", name),
        }
    }
}

/// A structured error or advisory record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Source unit name
    pub file: String,
    /// Program name or file-level
    pub scope: DiagnosticScope,
    /// Error or warning
    pub severity: Severity,
    /// Diagnostic kind
    pub kind: DiagnosticKind,
    /// Human readable description
    pub message: String,
    /// Source location, when one exists
    pub location: Option<Location>,
}

impl Diagnostic {
    /// Diagnostic for a rejected Program
    pub fn program_error(file: &str, program: &str, err: &SemanticError) -> Self {
        Self {
            file: file.to_string(),
            scope: DiagnosticScope::Program(program.to_string()),
            severity: Severity::Error,
            kind: DiagnosticKind::Semantic(err.kind),
            message: err.message.clone(),
            location: Some(err.location),
        }
    }

    /// File-level semantic error (e.g. an incomplete map declaration)
    pub fn file_error(file: &str, err: &SemanticError) -> Self {
        Self {
            file: file.to_string(),
            scope: DiagnosticScope::FileLevel,
            severity: Severity::Error,
            kind: DiagnosticKind::Semantic(err.kind),
            message: err.message.clone(),
            location: Some(err.location),
        }
    }

    /// Advisory record
    pub fn advisory(
        file: &str,
        scope: DiagnosticScope,
        kind: AdvisoryKind,
        message: impl Into<String>,
        location: Option<Location>,
    ) -> Self {
        Self {
            file: file.to_string(),
            scope,
            severity: Severity::Warning,
            kind: DiagnosticKind::Advisory(kind),
            message: message.into(),
            location,
        }
    }

    /// Convert a file-aborting pipeline error into a record
    pub fn from_error(file: &str, err: &Error) -> Self {
        let kind = match err {
            Error::SyntaxError { .. } => DiagnosticKind::Syntax,
            Error::Semantic(sem) => DiagnosticKind::Semantic(sem.kind),
            Error::Io { .. } | Error::Config(_) | Error::Serialization(_) => DiagnosticKind::Io,
        };
        Self {
            file: file.to_string(),
            scope: DiagnosticScope::FileLevel,
            severity: Severity::Error,
            kind,
            message: err.to_string(),
            location: err.location(),
        }
    }

    /// True for blocking diagnostics
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// True for advisories
    pub fn is_advisory(&self) -> bool {
        matches!(self.kind, DiagnosticKind::Advisory(_))
    }

    /// Semantic kind, if this is a semantic error
    pub fn semantic_kind(&self) -> Option<SemanticErrorKind> {
        match self.kind {
            DiagnosticKind::Semantic(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match self.location {
            Some(loc) => write!(f, "{}:{}:{}: ", self.file, loc.line, loc.column)?,
            None => write!(f, "{}: ", self.file)?,
        }
        write!(
            f,
            "{}[{}] {}: {}",
            severity,
            self.kind.tag(),
            self.scope,
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_program_error() {
        let err = SemanticError::new(
            SemanticErrorKind::UnboundedLoop,
            "loop has no constant bound",
            Location::new(12, 5),
        );
        let diag = Diagnostic::program_error("loop.bpf.c", "spin", &err);
        assert_eq!(
            diag.to_string(),
            "loop.bpf.c:12:5: error[unbounded-loop] program `spin`: loop has no constant bound"
        );
        assert!(diag.is_error());
        assert_eq!(diag.semantic_kind(), Some(SemanticErrorKind::UnboundedLoop));
    }

    #[test]
    fn test_advisory_is_not_error() {
        let diag = Diagnostic::advisory(
            "a.bpf.c",
            DiagnosticScope::FileLevel,
            AdvisoryKind::MissingLicense,
            "no license section",
            None,
        );
        assert!(!diag.is_error());
        assert!(diag.is_advisory());
        assert_eq!(
            diag.to_string(),
            "a.bpf.c: warning[missing-license] file-level: no license section"
        );
    }

    #[test]
    fn test_serializes_kind_with_category() {
        let diag = Diagnostic::advisory(
            "a.bpf.c",
            DiagnosticScope::Program("p".to_string()),
            AdvisoryKind::UnsynchronizedGlobal,
            "racy",
            None,
        );
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"category\":\"advisory\""));
        assert!(json.contains("\"kind\":\"unsynchronized-global\""));
    }
}
