//! Error types for the ebpfc pipeline

use crate::parser::Location;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Syntax error encountered while scanning or parsing
    ///
    /// **Triggered by:** malformed braces, unterminated strings, unparseable SEC literals
    /// **Example:** `SEC(kprobe/foo)` (attach string is not a string literal)
    /// **Scope:** aborts the whole file, no Program can be resolved without an AST
    #[error("Syntax error at line {line}, column {col} near `{token}`: {message}")]
    SyntaxError {
        /// Line number where error occurred
        line: usize,
        /// Column number where error occurred
        col: usize,
        /// Offending token text (empty at end of input)
        token: String,
        /// Error description
        message: String,
    },

    /// Semantic error attached to a single Program (or a single declaration)
    #[error(transparent)]
    Semantic(#[from] SemanticError),

    /// Source could not be read
    ///
    /// The only fatal condition: input that merely fails validation never produces it.
    #[error("I/O error on {path}: {message}")]
    Io {
        /// Path of the source unit
        path: String,
        /// Underlying I/O failure
        message: String,
    },

    /// Malformed external fact table (helper signatures, struct layouts)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Artifact could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kinds of Program-level semantic failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticErrorKind {
    /// Map declaration lacks (or conflicts in) fields required by its kind
    IncompleteMapDeclaration,
    /// Call graph reachable from the Program contains a cycle
    UnsupportedRecursion,
    /// Loop without a provable static trip bound
    UnboundedLoop,
    /// Nullable helper result dereferenced without a guard
    MissingNullCheck,
    /// Helper call arity or argument category mismatch
    HelperSignatureMismatch,
    /// Map operation incompatible with the map's kind or key/value sizes
    MapTypeMismatch,
    /// Map operand does not name a map of this translation unit
    UndefinedMap,
    /// Identifier or function that resolves to nothing
    UndeclaredIdentifier,
    /// Type name or struct layout that cannot be resolved
    UnknownType,
    /// SEC string names a hook kind the pipeline does not know
    UnsupportedHookKind,
    /// Attach target cannot name a hook point (strict attach policy only)
    InvalidAttachTarget,
    /// Construct the restricted dialect does not allow (aggregate copies, stray break, ...)
    UnsupportedConstruct,
}

impl SemanticErrorKind {
    /// Stable kebab-case tag used in diagnostics
    pub fn tag(&self) -> &'static str {
        match self {
            SemanticErrorKind::IncompleteMapDeclaration => "incomplete-map-declaration",
            SemanticErrorKind::UnsupportedRecursion => "unsupported-recursion",
            SemanticErrorKind::UnboundedLoop => "unbounded-loop",
            SemanticErrorKind::MissingNullCheck => "missing-null-check",
            SemanticErrorKind::HelperSignatureMismatch => "helper-signature-mismatch",
            SemanticErrorKind::MapTypeMismatch => "map-type-mismatch",
            SemanticErrorKind::UndefinedMap => "undefined-map",
            SemanticErrorKind::UndeclaredIdentifier => "undeclared-identifier",
            SemanticErrorKind::UnknownType => "unknown-type",
            SemanticErrorKind::UnsupportedHookKind => "unsupported-hook-kind",
            SemanticErrorKind::InvalidAttachTarget => "invalid-attach-target",
            SemanticErrorKind::UnsupportedConstruct => "unsupported-construct",
        }
    }

    /// Human readable summary, as used in error messages
    pub fn describe(&self) -> &'static str {
        match self {
            SemanticErrorKind::IncompleteMapDeclaration => "incomplete map declaration",
            SemanticErrorKind::UnsupportedRecursion => "unsupported recursion",
            SemanticErrorKind::UnboundedLoop => "unbounded loop",
            SemanticErrorKind::MissingNullCheck => "missing null check",
            SemanticErrorKind::HelperSignatureMismatch => "helper signature mismatch",
            SemanticErrorKind::MapTypeMismatch => "map type mismatch",
            SemanticErrorKind::UndefinedMap => "undefined map",
            SemanticErrorKind::UndeclaredIdentifier => "undeclared identifier",
            SemanticErrorKind::UnknownType => "unknown type",
            SemanticErrorKind::UnsupportedHookKind => "unsupported hook kind",
            SemanticErrorKind::InvalidAttachTarget => "invalid attach target",
            SemanticErrorKind::UnsupportedConstruct => "unsupported construct",
        }
    }
}

impl std::fmt::Display for SemanticErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// A semantic failure with its source location
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SemanticError {
    /// What went wrong
    pub kind: SemanticErrorKind,
    /// Detailed description
    pub message: String,
    /// Where it went wrong
    pub location: Location,
}

impl SemanticError {
    /// Create a semantic error
    pub fn new(kind: SemanticErrorKind, message: impl Into<String>, location: Location) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
        }
    }
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Aborts the caller (only source I/O)
    Fatal,
    /// Aborts resolution of the whole file
    FileLevel,
    /// Rejects one Program, siblings continue
    ProgramLevel,
}

impl Error {
    /// Create a syntax error at a location
    pub fn syntax(
        location: Location,
        token: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::SyntaxError {
            line: location.line,
            col: location.column,
            token: token.into(),
            message: message.into(),
        }
    }

    /// Create a semantic error
    pub fn semantic(
        kind: SemanticErrorKind,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        Error::Semantic(SemanticError::new(kind, message, location))
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::Io { .. } => ErrorSeverity::Fatal,
            Error::SyntaxError { .. } => ErrorSeverity::FileLevel,
            Error::Config(_) => ErrorSeverity::Fatal,
            Error::Serialization(_) => ErrorSeverity::Fatal,
            Error::Semantic(_) => ErrorSeverity::ProgramLevel,
        }
    }

    /// Source location of the error, when known
    pub fn location(&self) -> Option<Location> {
        match self {
            Error::SyntaxError { line, col, .. } => Some(Location::new(*line, *col)),
            Error::Semantic(err) => Some(err.location),
            _ => None,
        }
    }
}

/// Result type for ebpfc operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_message() {
        let err = Error::syntax(Location::new(3, 7), "}", "unbalanced brace");
        assert_eq!(
            err.to_string(),
            "Syntax error at line 3, column 7 near `}`: unbalanced brace"
        );
        assert_eq!(err.classify(), ErrorSeverity::FileLevel);
        assert_eq!(err.location(), Some(Location::new(3, 7)));
    }

    #[test]
    fn test_semantic_error_is_program_level() {
        let err = Error::semantic(
            SemanticErrorKind::MissingNullCheck,
            "load through `tsp`",
            Location::new(10, 2),
        );
        assert_eq!(err.classify(), ErrorSeverity::ProgramLevel);
        assert!(err.to_string().starts_with("missing null check"));
    }
}
