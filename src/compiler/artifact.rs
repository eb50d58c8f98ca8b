//! Artifact serializer
//!
//! The artifact is what an external loader consumes: the map table, the
//! globals and one descriptor per Program that passed every check. Every
//! container in it is ordered, so the same input always serializes to the
//! same bytes.

use super::ir::IrProgram;
use super::maps::MapDef;
use super::resolver::{AttachTarget, GlobalVar, HookKind, ProgramEntry, ResolvedUnit};
use crate::diagnostics::Diagnostic;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Descriptor of one emitted Program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    /// Entry function name
    pub name: String,
    /// Hook kind
    pub hook: HookKind,
    /// Section string, verbatim
    pub section: String,
    /// Attach target and its resolution status
    pub attach: AttachTarget,
    /// Maps the Program references, in declaration order
    pub maps: Vec<MapDef>,
    /// Globals the Program touches, by name
    pub globals: Vec<String>,
    /// Lowered program
    pub ir: IrProgram,
}

impl ProgramDescriptor {
    /// Build a descriptor for a Program that passed the safety checks
    pub fn new(unit: &ResolvedUnit, entry: &ProgramEntry, hook: HookKind, ir: IrProgram) -> Self {
        let referenced = ir.referenced_maps();
        let maps = unit
            .maps
            .iter()
            .filter(|map| referenced.contains(&map.name))
            .cloned()
            .collect();
        Self {
            name: entry.name.clone(),
            hook,
            section: entry.section.clone(),
            attach: entry.attach.clone(),
            maps,
            globals: ir.referenced_globals().into_iter().collect(),
            ir,
        }
    }
}

/// Compiled output of one source unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Source unit name
    pub file: String,
    /// License string from `SEC("license")`
    pub license: Option<String>,
    /// Every valid map, in declaration order
    pub maps: Vec<MapDef>,
    /// Every global, in declaration order
    pub globals: Vec<GlobalVar>,
    /// Emitted Programs, in declaration order
    pub programs: Vec<ProgramDescriptor>,
}

impl Artifact {
    /// Empty artifact carrying a unit's file-level tables
    pub fn new(unit: &ResolvedUnit) -> Self {
        Self {
            file: unit.file.clone(),
            license: unit.license.clone(),
            maps: unit.maps.clone(),
            globals: unit.globals.clone(),
            programs: Vec::new(),
        }
    }

    /// Program descriptor by name
    pub fn program(&self, name: &str) -> Option<&ProgramDescriptor> {
        self.programs.iter().find(|p| p.name == name)
    }

    /// Pretty JSON text
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deterministic serialized bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_json()?.into_bytes())
    }

    /// Parse an artifact back from its JSON form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// SHA-256 of the serialized bytes, hex encoded
    pub fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Outcome of compiling one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    /// No errors
    Success,
    /// At least one Program emitted, but errors exist
    PartialSuccess,
    /// Nothing emitted, or the file could not be parsed
    Failure,
}

impl FileStatus {
    /// Status from the number of emitted Programs and the diagnostics
    pub fn classify(emitted: usize, diagnostics: &[Diagnostic]) -> FileStatus {
        let has_errors = diagnostics.iter().any(Diagnostic::is_error);
        match (has_errors, emitted) {
            (false, _) => FileStatus::Success,
            (true, 0) => FileStatus::Failure,
            (true, _) => FileStatus::PartialSuccess,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FileStatus::Success => "success",
            FileStatus::PartialSuccess => "partial success",
            FileStatus::Failure => "failure",
        };
        f.write_str(text)
    }
}

/// Everything produced for one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    /// Source unit name
    pub file: String,
    /// File-level status
    pub status: FileStatus,
    /// Artifact, absent when the file could not be parsed
    pub artifact: Option<Artifact>,
    /// Errors and advisories, in pipeline order
    pub diagnostics: Vec<Diagnostic>,
}

impl FileReport {
    /// Report for a file that never reached resolution
    pub fn from_error(file: &str, err: &Error) -> Self {
        FileReport {
            file: file.to_string(),
            status: FileStatus::Failure,
            artifact: None,
            diagnostics: vec![Diagnostic::from_error(file, err)],
        }
    }

    /// Blocking diagnostics
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// Advisories
    pub fn advisories(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_advisory())
    }

    /// Names of emitted Programs
    pub fn program_names(&self) -> Vec<&str> {
        self.artifact
            .iter()
            .flat_map(|a| a.programs.iter().map(|p| p.name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{AdvisoryKind, DiagnosticScope};
    use crate::error::{SemanticError, SemanticErrorKind};
    use crate::parser::Location;

    fn empty() -> Artifact {
        Artifact {
            file: "a.bpf.c".to_string(),
            license: Some("GPL".to_string()),
            maps: Vec::new(),
            globals: Vec::new(),
            programs: Vec::new(),
        }
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let artifact = empty();
        let digest = artifact.digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, artifact.clone().digest().unwrap());

        let mut other = empty();
        other.license = None;
        assert_ne!(digest, other.digest().unwrap());
    }

    #[test]
    fn test_json_round_trip() {
        let artifact = empty();
        let json = artifact.to_json().unwrap();
        assert!(json.contains("\"license\": \"GPL\""));
        assert_eq!(Artifact::from_json(&json).unwrap(), artifact);
    }

    #[test]
    fn test_status_classification() {
        let error = Diagnostic::program_error(
            "a.bpf.c",
            "p",
            &SemanticError::new(SemanticErrorKind::UnboundedLoop, "spin", Location::new(1, 1)),
        );
        let advisory = Diagnostic::advisory(
            "a.bpf.c",
            DiagnosticScope::FileLevel,
            AdvisoryKind::MissingLicense,
            "no license",
            None,
        );
        assert_eq!(FileStatus::classify(0, &[advisory.clone()]), FileStatus::Success);
        assert_eq!(
            FileStatus::classify(1, &[advisory, error.clone()]),
            FileStatus::PartialSuccess
        );
        assert_eq!(FileStatus::classify(0, &[error]), FileStatus::Failure);
        assert_eq!(FileStatus::PartialSuccess.to_string(), "partial success");
    }
}
