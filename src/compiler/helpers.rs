//! Helper signature table
//!
//! Calls to names in this table are emitted as opaque helper-call IR nodes
//! rather than inlined. The built-in table covers the tracing, map, perf and
//! ring buffer helpers; a replacement can be loaded from JSON.

use super::maps::MapOp;
use super::types::CType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category of a helper parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Integer value
    Scalar,
    /// Pointer (or null)
    Ptr,
    /// Pointer that the helper dereferences: must be provably non-null
    NonNullPtr,
    /// Map reference (`&map`)
    Map,
    /// Format string (literal or char buffer)
    FormatStr,
    /// Anything (context pointers, unsafe source addresses)
    Any,
}

/// Signature of one helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSignature {
    /// Name as called from source
    pub name: String,
    /// Kernel helper id
    pub id: u32,
    /// Fixed parameters in order
    pub params: Vec<ParamKind>,
    /// Number of extra arguments accepted after the fixed ones
    #[serde(default)]
    pub variadic: usize,
    /// Return type
    pub ret: CType,
    /// Result may be a null "miss" sentinel
    #[serde(default)]
    pub nullable: bool,
    /// Map operation, when the helper takes a map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_op: Option<MapOp>,
}

impl HelperSignature {
    fn new(name: &str, id: u32, params: &[ParamKind], ret: CType) -> Self {
        HelperSignature {
            name: name.to_string(),
            id,
            params: params.to_vec(),
            variadic: 0,
            ret,
            nullable: false,
            map_op: None,
        }
    }

    fn variadic(mut self, extra: usize) -> Self {
        self.variadic = extra;
        self
    }

    fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn map_op(mut self, op: MapOp) -> Self {
        self.map_op = Some(op);
        self
    }

    /// Accepted argument count range
    pub fn arity(&self) -> (usize, usize) {
        (self.params.len(), self.params.len() + self.variadic)
    }

    /// Category of the argument at `index` (variadic extras are `Any`)
    pub fn param(&self, index: usize) -> Option<ParamKind> {
        match self.params.get(index) {
            Some(kind) => Some(*kind),
            None if index < self.params.len() + self.variadic => Some(ParamKind::Any),
            None => None,
        }
    }

    /// Position of the map parameter, if any
    pub fn map_param(&self) -> Option<usize> {
        self.params.iter().position(|p| *p == ParamKind::Map)
    }
}

lazy_static::lazy_static! {
    static ref BUILTIN_HELPERS: HelperTable = HelperTable::builtin();
}

/// Helper signatures by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperTable {
    helpers: BTreeMap<String, HelperSignature>,
}

#[derive(Deserialize)]
struct HelperTableFile {
    helpers: Vec<HelperSignature>,
}

impl Default for HelperTable {
    fn default() -> Self {
        BUILTIN_HELPERS.clone()
    }
}

impl HelperTable {
    /// Table with no entries
    pub fn empty() -> Self {
        HelperTable {
            helpers: BTreeMap::new(),
        }
    }

    /// Load signatures from JSON: `{"helpers": [{"name", "id", "params", "ret", ...}]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let file: HelperTableFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid helper table: {}", e)))?;
        let mut table = HelperTable::empty();
        for helper in file.helpers {
            if helper.map_op.is_some() && helper.map_param().is_none() {
                return Err(Error::Config(format!(
                    "helper `{}` has a map operation but no map parameter",
                    helper.name
                )));
            }
            table.insert(helper);
        }
        Ok(table)
    }

    /// Look up a helper by name
    pub fn get(&self, name: &str) -> Option<&HelperSignature> {
        self.helpers.get(name)
    }

    /// True when `name` is a helper
    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Add or replace a signature
    pub fn insert(&mut self, helper: HelperSignature) {
        self.helpers.insert(helper.name.clone(), helper);
    }

    /// Number of helpers
    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    /// Iterate signatures in name order
    pub fn iter(&self) -> impl Iterator<Item = &HelperSignature> {
        self.helpers.values()
    }

    fn builtin() -> Self {
        use ParamKind::*;

        let void_ptr = CType::Void.pointer_to();
        let long = CType::s64();

        let probe_read = |name: &str, id: u32| {
            HelperSignature::new(name, id, &[NonNullPtr, Scalar, Any], long.clone())
        };

        let signatures = vec![
            HelperSignature::new("bpf_map_lookup_elem", 1, &[Map, Ptr], void_ptr.clone())
                .nullable()
                .map_op(MapOp::Lookup),
            HelperSignature::new("bpf_map_update_elem", 2, &[Map, Ptr, Ptr, Scalar], long.clone())
                .map_op(MapOp::Update),
            HelperSignature::new("bpf_map_delete_elem", 3, &[Map, Ptr], long.clone())
                .map_op(MapOp::Delete),
            probe_read("bpf_probe_read", 4),
            HelperSignature::new("bpf_ktime_get_ns", 5, &[], CType::u64()),
            HelperSignature::new("bpf_trace_printk", 6, &[FormatStr, Scalar], long.clone())
                .variadic(3),
            // libbpf macro over trace_printk / trace_vprintk
            HelperSignature::new("bpf_printk", 6, &[FormatStr], long.clone()).variadic(12),
            HelperSignature::new("bpf_get_prandom_u32", 7, &[], CType::u32()),
            HelperSignature::new("bpf_get_smp_processor_id", 8, &[], CType::u32()),
            HelperSignature::new("bpf_tail_call", 12, &[Any, Map, Scalar], long.clone())
                .map_op(MapOp::TailCall),
            HelperSignature::new("bpf_get_current_pid_tgid", 14, &[], CType::u64()),
            HelperSignature::new("bpf_get_current_uid_gid", 15, &[], CType::u64()),
            HelperSignature::new("bpf_get_current_comm", 16, &[NonNullPtr, Scalar], long.clone()),
            HelperSignature::new("bpf_redirect", 23, &[Scalar, Scalar], long.clone()),
            HelperSignature::new(
                "bpf_perf_event_output",
                25,
                &[Any, Map, Scalar, NonNullPtr, Scalar],
                long.clone(),
            )
            .map_op(MapOp::PerfOutput),
            HelperSignature::new("bpf_get_stackid", 27, &[Any, Map, Scalar], long.clone())
                .map_op(MapOp::StackId),
            HelperSignature::new("bpf_get_current_task", 35, &[], CType::u64()),
            HelperSignature::new("bpf_xdp_adjust_head", 44, &[Any, Scalar], long.clone()),
            probe_read("bpf_probe_read_str", 45),
            HelperSignature::new("bpf_map_push_elem", 87, &[Map, Ptr, Scalar], long.clone())
                .map_op(MapOp::Push),
            HelperSignature::new("bpf_map_pop_elem", 88, &[Map, NonNullPtr], long.clone())
                .map_op(MapOp::Pop),
            HelperSignature::new("bpf_map_peek_elem", 89, &[Map, NonNullPtr], long.clone())
                .map_op(MapOp::Peek),
            probe_read("bpf_probe_read_user", 112),
            probe_read("bpf_probe_read_kernel", 113),
            probe_read("bpf_probe_read_user_str", 114),
            probe_read("bpf_probe_read_kernel_str", 115),
            HelperSignature::new("bpf_ktime_get_boot_ns", 125, &[], CType::u64()),
            HelperSignature::new(
                "bpf_ringbuf_output",
                130,
                &[Map, NonNullPtr, Scalar, Scalar],
                long.clone(),
            )
            .map_op(MapOp::RingbufOutput),
            HelperSignature::new("bpf_ringbuf_reserve", 131, &[Map, Scalar, Scalar], void_ptr)
                .nullable()
                .map_op(MapOp::RingbufReserve),
            HelperSignature::new("bpf_ringbuf_submit", 132, &[NonNullPtr, Scalar], CType::Void),
            HelperSignature::new("bpf_ringbuf_discard", 133, &[NonNullPtr, Scalar], CType::Void),
        ];

        let mut table = HelperTable::empty();
        for helper in signatures {
            table.insert(helper);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup_is_nullable() {
        let table = HelperTable::default();
        let lookup = table.get("bpf_map_lookup_elem").unwrap();
        assert!(lookup.nullable);
        assert_eq!(lookup.id, 1);
        assert_eq!(lookup.map_param(), Some(0));
        assert_eq!(lookup.map_op, Some(MapOp::Lookup));
        assert!(!table.get("bpf_ktime_get_ns").unwrap().nullable);
    }

    #[test]
    fn test_variadic_params() {
        let table = HelperTable::default();
        let printk = table.get("bpf_trace_printk").unwrap();
        assert_eq!(printk.arity(), (2, 5));
        assert_eq!(printk.param(0), Some(ParamKind::FormatStr));
        assert_eq!(printk.param(4), Some(ParamKind::Any));
        assert_eq!(printk.param(5), None);
    }

    #[test]
    fn test_ringbuf_submit_needs_non_null() {
        let table = HelperTable::default();
        let submit = table.get("bpf_ringbuf_submit").unwrap();
        assert_eq!(submit.params[0], ParamKind::NonNullPtr);
        assert_eq!(submit.ret, CType::Void);
    }

    #[test]
    fn test_from_json() {
        let table = HelperTable::from_json(
            r#"{"helpers": [
                {"name": "bpf_sk_lookup_tcp", "id": 84,
                 "params": ["any", "non_null_ptr", "scalar", "scalar", "scalar"],
                 "ret": "void *", "nullable": true}
            ]}"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        let helper = table.get("bpf_sk_lookup_tcp").unwrap();
        assert!(helper.nullable);
        assert_eq!(helper.ret, CType::Void.pointer_to());
        assert!(!table.contains("bpf_map_lookup_elem"));
    }

    #[test]
    fn test_from_json_rejects_map_op_without_map() {
        let err = HelperTable::from_json(
            r#"{"helpers": [{"name": "bad", "id": 1, "params": ["ptr"],
                 "ret": "s64", "map_op": "lookup"}]}"#,
        );
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
