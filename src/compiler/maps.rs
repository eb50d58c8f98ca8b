//! Map kinds, map definitions and their required-field rules

use super::types::CType;
use crate::error::{SemanticError, SemanticErrorKind};
use crate::parser::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Map kind, from `__uint(type, BPF_MAP_TYPE_...)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MapKind {
    /// `BPF_MAP_TYPE_HASH`
    Hash,
    /// `BPF_MAP_TYPE_ARRAY`
    Array,
    /// `BPF_MAP_TYPE_PERCPU_HASH`
    PercpuHash,
    /// `BPF_MAP_TYPE_PERCPU_ARRAY`
    PercpuArray,
    /// `BPF_MAP_TYPE_LRU_HASH`
    LruHash,
    /// `BPF_MAP_TYPE_LRU_PERCPU_HASH`
    LruPercpuHash,
    /// `BPF_MAP_TYPE_LPM_TRIE`
    LpmTrie,
    /// `BPF_MAP_TYPE_PERF_EVENT_ARRAY`
    PerfEventArray,
    /// `BPF_MAP_TYPE_RINGBUF`
    Ringbuf,
    /// `BPF_MAP_TYPE_PROG_ARRAY`
    ProgArray,
    /// `BPF_MAP_TYPE_STACK_TRACE`
    StackTrace,
    /// `BPF_MAP_TYPE_QUEUE`
    Queue,
    /// `BPF_MAP_TYPE_STACK`
    Stack,
    /// `BPF_MAP_TYPE_BLOOM_FILTER`
    BloomFilter,
    /// Any other kind, by name without the `BPF_MAP_TYPE_` prefix
    Other(String),
}

/// Kernel numbering of map kinds, for `__uint(type, 27)` style declarations
const MAP_TYPE_CODES: &[(u64, &str)] = &[
    (1, "HASH"),
    (2, "ARRAY"),
    (3, "PROG_ARRAY"),
    (4, "PERF_EVENT_ARRAY"),
    (5, "PERCPU_HASH"),
    (6, "PERCPU_ARRAY"),
    (7, "STACK_TRACE"),
    (8, "CGROUP_ARRAY"),
    (9, "LRU_HASH"),
    (10, "LRU_PERCPU_HASH"),
    (11, "LPM_TRIE"),
    (12, "ARRAY_OF_MAPS"),
    (13, "HASH_OF_MAPS"),
    (14, "DEVMAP"),
    (15, "SOCKMAP"),
    (16, "CPUMAP"),
    (17, "XSKMAP"),
    (18, "SOCKHASH"),
    (19, "CGROUP_STORAGE"),
    (20, "REUSEPORT_SOCKARRAY"),
    (21, "PERCPU_CGROUP_STORAGE"),
    (22, "QUEUE"),
    (23, "STACK"),
    (24, "SK_STORAGE"),
    (25, "DEVMAP_HASH"),
    (26, "STRUCT_OPS"),
    (27, "RINGBUF"),
    (28, "INODE_STORAGE"),
    (29, "TASK_STORAGE"),
    (30, "BLOOM_FILTER"),
    (31, "USER_RINGBUF"),
    (32, "CGRP_STORAGE"),
];

/// Which attributes a map kind requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapShape {
    /// Key type, value type and max_entries
    Typed,
    /// key_size and value_size (max_entries optional)
    Sized,
    /// max_entries only
    RingBuffer,
    /// Value type and max_entries, no key
    ValueOnly,
    /// Only `type` is checked
    Unchecked,
}

impl MapKind {
    /// Map kind from a `BPF_MAP_TYPE_*` name (prefix optional)
    pub fn from_type_name(name: &str) -> MapKind {
        let short = name.strip_prefix("BPF_MAP_TYPE_").unwrap_or(name);
        match short {
            "HASH" => MapKind::Hash,
            "ARRAY" => MapKind::Array,
            "PERCPU_HASH" => MapKind::PercpuHash,
            "PERCPU_ARRAY" => MapKind::PercpuArray,
            "LRU_HASH" => MapKind::LruHash,
            "LRU_PERCPU_HASH" => MapKind::LruPercpuHash,
            "LPM_TRIE" => MapKind::LpmTrie,
            "PERF_EVENT_ARRAY" => MapKind::PerfEventArray,
            "RINGBUF" => MapKind::Ringbuf,
            "PROG_ARRAY" => MapKind::ProgArray,
            "STACK_TRACE" => MapKind::StackTrace,
            "QUEUE" => MapKind::Queue,
            "STACK" => MapKind::Stack,
            "BLOOM_FILTER" => MapKind::BloomFilter,
            other => MapKind::Other(other.to_string()),
        }
    }

    /// Map kind from its kernel enum value
    pub fn from_code(code: u64) -> Option<MapKind> {
        MAP_TYPE_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| MapKind::from_type_name(name))
    }

    /// Short name (`HASH`, `RINGBUF`, ...)
    pub fn name(&self) -> &str {
        match self {
            MapKind::Hash => "HASH",
            MapKind::Array => "ARRAY",
            MapKind::PercpuHash => "PERCPU_HASH",
            MapKind::PercpuArray => "PERCPU_ARRAY",
            MapKind::LruHash => "LRU_HASH",
            MapKind::LruPercpuHash => "LRU_PERCPU_HASH",
            MapKind::LpmTrie => "LPM_TRIE",
            MapKind::PerfEventArray => "PERF_EVENT_ARRAY",
            MapKind::Ringbuf => "RINGBUF",
            MapKind::ProgArray => "PROG_ARRAY",
            MapKind::StackTrace => "STACK_TRACE",
            MapKind::Queue => "QUEUE",
            MapKind::Stack => "STACK",
            MapKind::BloomFilter => "BLOOM_FILTER",
            MapKind::Other(name) => name,
        }
    }

    /// Required-field shape of this kind
    pub fn shape(&self) -> MapShape {
        match self {
            MapKind::Hash
            | MapKind::Array
            | MapKind::PercpuHash
            | MapKind::PercpuArray
            | MapKind::LruHash
            | MapKind::LruPercpuHash
            | MapKind::LpmTrie => MapShape::Typed,
            MapKind::PerfEventArray | MapKind::ProgArray | MapKind::StackTrace => MapShape::Sized,
            MapKind::Ringbuf => MapShape::RingBuffer,
            MapKind::Queue | MapKind::Stack | MapKind::BloomFilter => MapShape::ValueOnly,
            MapKind::Other(_) => MapShape::Unchecked,
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for MapKind {
    fn from(name: String) -> Self {
        MapKind::from_type_name(&name)
    }
}

impl From<MapKind> for String {
    fn from(kind: MapKind) -> Self {
        kind.name().to_string()
    }
}

/// Map operation performed by a helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapOp {
    /// `bpf_map_lookup_elem`
    Lookup,
    /// `bpf_map_update_elem`
    Update,
    /// `bpf_map_delete_elem`
    Delete,
    /// `bpf_perf_event_output`
    PerfOutput,
    /// `bpf_ringbuf_reserve`
    RingbufReserve,
    /// `bpf_ringbuf_output`
    RingbufOutput,
    /// `bpf_tail_call`
    TailCall,
    /// `bpf_get_stackid`
    StackId,
    /// `bpf_map_push_elem`
    Push,
    /// `bpf_map_pop_elem`
    Pop,
    /// `bpf_map_peek_elem`
    Peek,
}

impl MapOp {
    /// True when maps of `kind` support this operation
    pub fn supports(&self, kind: &MapKind) -> bool {
        if matches!(kind, MapKind::Other(_)) {
            return true;
        }
        match self {
            MapOp::Lookup | MapOp::Update | MapOp::Delete => kind.shape() == MapShape::Typed,
            MapOp::PerfOutput => *kind == MapKind::PerfEventArray,
            MapOp::RingbufReserve | MapOp::RingbufOutput => *kind == MapKind::Ringbuf,
            MapOp::TailCall => *kind == MapKind::ProgArray,
            MapOp::StackId => *kind == MapKind::StackTrace,
            MapOp::Push | MapOp::Peek => kind.shape() == MapShape::ValueOnly,
            MapOp::Pop => matches!(kind, MapKind::Queue | MapKind::Stack),
        }
    }

    /// Position of the key pointer argument, if the operation takes one
    pub fn key_arg(&self) -> Option<usize> {
        match self {
            MapOp::Lookup | MapOp::Update | MapOp::Delete => Some(1),
            _ => None,
        }
    }

    /// Position of the value pointer argument, if the operation takes one
    pub fn value_arg(&self) -> Option<usize> {
        match self {
            MapOp::Update => Some(2),
            MapOp::Push | MapOp::Pop | MapOp::Peek => Some(1),
            _ => None,
        }
    }
}

/// Resolved map declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDef {
    /// Map name
    pub name: String,
    /// Map kind
    pub kind: MapKind,
    /// Key type, for typed kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<CType>,
    /// Value type, for typed and value-only kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<CType>,
    /// Key size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u64>,
    /// Value size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_size: Option<u64>,
    /// Capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<u64>,
    /// Unrecognized attributes, verbatim
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, String>,
    /// Declaration location
    pub location: Location,
}

/// Attribute values gathered from a map struct, before validation
#[derive(Debug, Clone, Default)]
pub struct MapFields {
    /// `type`
    pub kind: Option<MapKind>,
    /// `key` type with its size in bytes
    pub key: Option<(CType, u64)>,
    /// `value` type with its size in bytes
    pub value: Option<(CType, u64)>,
    /// `key_size`
    pub key_size: Option<u64>,
    /// `value_size`
    pub value_size: Option<u64>,
    /// `max_entries`
    pub max_entries: Option<u64>,
    /// Anything else
    pub extra: BTreeMap<String, String>,
}

impl MapFields {
    /// Check the required-field rules of the map kind and build the definition
    pub fn validate(self, name: &str, location: Location) -> Result<MapDef, SemanticError> {
        let incomplete = |message: String| {
            SemanticError::new(SemanticErrorKind::IncompleteMapDeclaration, message, location)
        };

        let kind = self
            .kind
            .ok_or_else(|| incomplete(format!("map `{}` has no `type` attribute", name)))?;

        let mut def = MapDef {
            name: name.to_string(),
            kind: kind.clone(),
            key_type: None,
            value_type: None,
            key_size: None,
            value_size: None,
            max_entries: self.max_entries,
            extra: self.extra,
            location,
        };

        let require_max_entries = |def: &MapDef| match def.max_entries {
            None => Err(incomplete(format!(
                "{} map `{}` requires `max_entries`",
                kind, name
            ))),
            Some(0) => Err(incomplete(format!(
                "{} map `{}` has zero `max_entries`",
                kind, name
            ))),
            Some(_) => Ok(()),
        };

        match kind.shape() {
            MapShape::Typed => {
                let (key_type, key_bytes) = self.key.ok_or_else(|| {
                    incomplete(format!("{} map `{}` requires a key type", kind, name))
                })?;
                let (value_type, value_bytes) = self.value.ok_or_else(|| {
                    incomplete(format!("{} map `{}` requires a value type", kind, name))
                })?;
                reject_size(name, &kind, "key", self.key_size).map_err(incomplete)?;
                reject_size(name, &kind, "value", self.value_size).map_err(incomplete)?;
                require_max_entries(&def)?;
                def.key_type = Some(key_type);
                def.value_type = Some(value_type);
            }
            MapShape::Sized => {
                let key_size = sized_field(name, "key", self.key.as_ref(), self.key_size)
                    .map_err(incomplete)?;
                let value_size = sized_field(name, "value", self.value.as_ref(), self.value_size)
                    .map_err(incomplete)?;
                if let Some(0) = def.max_entries {
                    return Err(incomplete(format!(
                        "{} map `{}` has zero `max_entries`",
                        kind, name
                    )));
                }
                def.key_size = Some(key_size);
                def.value_size = Some(value_size);
            }
            MapShape::RingBuffer => {
                let conflicting = [
                    ("key", self.key.is_some()),
                    ("value", self.value.is_some()),
                    ("key_size", self.key_size.is_some()),
                    ("value_size", self.value_size.is_some()),
                ];
                if let Some((field, _)) = conflicting.iter().find(|(_, present)| *present) {
                    return Err(incomplete(format!(
                        "RINGBUF map `{}` must not declare `{}`",
                        name, field
                    )));
                }
                require_max_entries(&def)?;
            }
            MapShape::ValueOnly => {
                if self.key.is_some() || self.key_size.is_some_and(|size| size != 0) {
                    return Err(incomplete(format!(
                        "{} map `{}` has no key, but one is declared",
                        kind, name
                    )));
                }
                let (value_type, _) = self.value.ok_or_else(|| {
                    incomplete(format!("{} map `{}` requires a value type", kind, name))
                })?;
                reject_size(name, &kind, "value", self.value_size).map_err(incomplete)?;
                require_max_entries(&def)?;
                def.value_type = Some(value_type);
            }
            MapShape::Unchecked => {
                // a declared type stands for its size
                match self.key {
                    Some((ty, _)) => def.key_type = Some(ty),
                    None => def.key_size = self.key_size,
                }
                match self.value {
                    Some((ty, _)) => def.value_type = Some(ty),
                    None => def.value_size = self.value_size,
                }
            }
        }

        Ok(def)
    }
}

/// Kinds declared by type take their sizes from the types alone
fn reject_size(map: &str, kind: &MapKind, what: &str, declared: Option<u64>) -> Result<(), String> {
    match declared {
        Some(size) => Err(format!(
            "{} map `{}` is declared by type and must not also declare {}_size {}",
            kind, map, what, size
        )),
        None => Ok(()),
    }
}

/// A declared `*_size` must agree with the declared type
fn check_consistent(
    map: &str,
    what: &str,
    type_bytes: u64,
    declared: Option<u64>,
) -> Result<(), String> {
    match declared {
        Some(size) if size != type_bytes => Err(format!(
            "map `{}` declares {}_size {} but its {} type is {} bytes",
            map, what, size, what, type_bytes
        )),
        _ => Ok(()),
    }
}

/// Size of a key or value for kinds that are declared by size
fn sized_field(
    map: &str,
    what: &str,
    typed: Option<&(CType, u64)>,
    declared: Option<u64>,
) -> Result<u64, String> {
    match (typed, declared) {
        (Some((_, bytes)), declared) => {
            check_consistent(map, what, *bytes, declared)?;
            Ok(*bytes)
        }
        (None, Some(size)) => Ok(size),
        (None, None) => Err(format!("map `{}` requires `{}_size`", map, what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location::new(1, 1)
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(MapKind::from_type_name("BPF_MAP_TYPE_HASH"), MapKind::Hash);
        assert_eq!(MapKind::from_code(27), Some(MapKind::Ringbuf));
        assert_eq!(
            MapKind::from_type_name("BPF_MAP_TYPE_SOCKMAP"),
            MapKind::Other("SOCKMAP".to_string())
        );
        assert_eq!(MapKind::LruPercpuHash.to_string(), "LRU_PERCPU_HASH");
    }

    #[test]
    fn test_hash_requires_key_value_entries() {
        let fields = MapFields {
            kind: Some(MapKind::Hash),
            key: Some((CType::u64(), 8)),
            value: Some((CType::u64(), 8)),
            ..Default::default()
        };
        let err = fields.validate("last", loc()).unwrap_err();
        assert_eq!(err.kind, SemanticErrorKind::IncompleteMapDeclaration);
        assert!(err.message.contains("max_entries"));
    }

    #[test]
    fn test_perf_array_by_size() {
        let fields = MapFields {
            kind: Some(MapKind::PerfEventArray),
            key_size: Some(4),
            value_size: Some(4),
            ..Default::default()
        };
        let def = fields.validate("events", loc()).unwrap();
        assert_eq!(def.key_size, Some(4));
        assert_eq!(def.max_entries, None);
    }

    #[test]
    fn test_ringbuf_rejects_key() {
        let fields = MapFields {
            kind: Some(MapKind::Ringbuf),
            key: Some((CType::u32(), 4)),
            max_entries: Some(1 << 24),
            ..Default::default()
        };
        assert!(fields.validate("rb", loc()).is_err());

        let fields = MapFields {
            kind: Some(MapKind::Ringbuf),
            max_entries: Some(256 * 1024),
            ..Default::default()
        };
        assert_eq!(
            fields.validate("rb", loc()).unwrap().max_entries,
            Some(262144)
        );
    }

    #[test]
    fn test_typed_map_carries_types_only() {
        let fields = MapFields {
            kind: Some(MapKind::Array),
            key: Some((CType::u32(), 4)),
            value: Some((CType::u64(), 8)),
            max_entries: Some(1),
            ..Default::default()
        };
        let def = fields.validate("arr", loc()).unwrap();
        assert_eq!(def.key_type, Some(CType::u32()));
        assert_eq!(def.value_type, Some(CType::u64()));
        assert_eq!((def.key_size, def.value_size), (None, None));
    }

    #[test]
    fn test_typed_map_rejects_sizes() {
        for value_size in [4, 8] {
            let fields = MapFields {
                kind: Some(MapKind::Array),
                key: Some((CType::u32(), 4)),
                value: Some((CType::u64(), 8)),
                value_size: Some(value_size),
                max_entries: Some(1),
                ..Default::default()
            };
            let err = fields.validate("arr", loc()).unwrap_err();
            assert_eq!(err.kind, SemanticErrorKind::IncompleteMapDeclaration);
            assert!(err.message.contains("value_size"));
        }
    }

    #[test]
    fn test_queue_is_value_only() {
        let fields = MapFields {
            kind: Some(MapKind::Queue),
            value: Some((CType::u32(), 4)),
            max_entries: Some(16),
            ..Default::default()
        };
        let def = fields.validate("q", loc()).unwrap();
        assert_eq!(def.key_size, None);
        assert_eq!(def.value_type, Some(CType::u32()));
        assert_eq!(def.value_size, None);
    }

    #[test]
    fn test_map_op_support() {
        assert!(MapOp::Lookup.supports(&MapKind::LruHash));
        assert!(!MapOp::Lookup.supports(&MapKind::Ringbuf));
        assert!(MapOp::RingbufReserve.supports(&MapKind::Ringbuf));
        assert!(!MapOp::Pop.supports(&MapKind::BloomFilter));
        assert!(MapOp::TailCall.supports(&MapKind::Other("DEVMAP".to_string())));
    }
}
