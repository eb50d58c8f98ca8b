//! Resolved C types and struct layouts
//!
//! [`CType`] is the resolved form of a source type. Struct layouts come from
//! two places: user definitions laid out with natural alignment, and the
//! kernel struct table, whose layouts are opaque facts taken as given.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed-width integer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntType {
    /// Width in bits (8, 16, 32 or 64)
    pub bits: u8,
    /// Signedness
    pub signed: bool,
}

impl IntType {
    /// `u8`
    pub const U8: IntType = IntType::new(8, false);
    /// `u16`
    pub const U16: IntType = IntType::new(16, false);
    /// `u32`
    pub const U32: IntType = IntType::new(32, false);
    /// `u64`
    pub const U64: IntType = IntType::new(64, false);
    /// `s8`
    pub const S8: IntType = IntType::new(8, true);
    /// `s16`
    pub const S16: IntType = IntType::new(16, true);
    /// `int`
    pub const S32: IntType = IntType::new(32, true);
    /// `long`
    pub const S64: IntType = IntType::new(64, true);

    /// Creates an integer type
    pub const fn new(bits: u8, signed: bool) -> Self {
        IntType { bits, signed }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        u64::from(self.bits / 8)
    }

    /// Truncate `value` to this width, then sign- or zero-extend it back to 64 bits
    pub fn normalize(&self, value: i64) -> i64 {
        if self.bits >= 64 {
            return value;
        }
        let shift = 64 - u32::from(self.bits);
        if self.signed {
            value.wrapping_shl(shift).wrapping_shr(shift)
        } else {
            ((value as u64).wrapping_shl(shift).wrapping_shr(shift)) as i64
        }
    }

    /// Integer promotion: anything narrower than `int` becomes `int`
    pub fn promote(&self) -> IntType {
        if self.bits < 32 {
            IntType::S32
        } else {
            *self
        }
    }

    /// Usual arithmetic conversions between two operand types
    pub fn common(a: IntType, b: IntType) -> IntType {
        let a = a.promote();
        let b = b.promote();
        if a == b {
            return a;
        }
        if a.signed == b.signed {
            return if a.bits >= b.bits { a } else { b };
        }
        let (unsigned, signed) = if a.signed { (b, a) } else { (a, b) };
        if unsigned.bits >= signed.bits {
            unsigned
        } else {
            // the wider signed type holds every value of the unsigned one
            signed
        }
    }

    /// True when `value` (as a mathematical integer) fits this type
    pub fn fits(&self, value: i128) -> bool {
        let (min, max) = if self.signed {
            (-(1i128 << (self.bits - 1)), (1i128 << (self.bits - 1)) - 1)
        } else {
            (0, (1i128 << self.bits) - 1)
        };
        value >= min && value <= max
    }
}

impl fmt::Display for IntType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", if self.signed { "s" } else { "u" }, self.bits)
    }
}

/// Resolved C type
///
/// Serialized in its textual form (`u64`, `struct event *`, `char[16]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CType {
    /// `void`
    Void,
    /// `bool`
    Bool,
    /// Fixed-width integer
    Int(IntType),
    /// Pointer
    Pointer(Box<CType>),
    /// Array with element count
    Array(Box<CType>, u64),
    /// Struct or union by tag
    Struct(String),
}

impl CType {
    /// `u8`
    pub fn u8() -> Self {
        CType::Int(IntType::U8)
    }

    /// `u16`
    pub fn u16() -> Self {
        CType::Int(IntType::U16)
    }

    /// `u32`
    pub fn u32() -> Self {
        CType::Int(IntType::U32)
    }

    /// `u64`
    pub fn u64() -> Self {
        CType::Int(IntType::U64)
    }

    /// `s32`
    pub fn s32() -> Self {
        CType::Int(IntType::S32)
    }

    /// `s64`
    pub fn s64() -> Self {
        CType::Int(IntType::S64)
    }

    /// Pointer to `self`
    pub fn pointer_to(self) -> Self {
        CType::Pointer(Box::new(self))
    }

    /// `struct name`
    pub fn struct_named(name: &str) -> Self {
        CType::Struct(name.to_string())
    }

    /// Pointee of a pointer (or element of an array)
    pub fn pointee(&self) -> Option<&CType> {
        match self {
            CType::Pointer(inner) | CType::Array(inner, _) => Some(inner),
            _ => None,
        }
    }

    /// True for pointers
    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer(_))
    }

    /// True for integers, bools and pointers (fit in one register)
    pub fn is_scalar(&self) -> bool {
        matches!(self, CType::Bool | CType::Int(_) | CType::Pointer(_))
    }

    /// True for structs and arrays
    pub fn is_aggregate(&self) -> bool {
        matches!(self, CType::Struct(_) | CType::Array(..))
    }

    /// Integer view used for arithmetic: pointers are 64-bit unsigned
    pub fn int_type(&self) -> Option<IntType> {
        match self {
            CType::Int(it) => Some(*it),
            CType::Bool => Some(IntType::U8),
            CType::Pointer(_) => Some(IntType::U64),
            _ => None,
        }
    }

    /// Size in bytes; `None` for structs missing from the table
    pub fn size(&self, structs: &StructTable) -> Option<u64> {
        match self {
            CType::Void | CType::Bool => Some(1),
            CType::Int(it) => Some(it.size()),
            CType::Pointer(_) => Some(8),
            CType::Array(inner, len) => inner.size(structs).map(|s| s.saturating_mul(*len)),
            CType::Struct(name) => structs.get(name).map(|s| s.size),
        }
    }

    /// Natural alignment in bytes
    pub fn align(&self, structs: &StructTable) -> Option<u64> {
        match self {
            CType::Void | CType::Bool => Some(1),
            CType::Int(it) => Some(it.size()),
            CType::Pointer(_) => Some(8),
            CType::Array(inner, _) => inner.align(structs),
            CType::Struct(name) => structs.get(name).map(|s| s.align.max(1)),
        }
    }

    /// Parse the textual form (`u32`, `struct event *`, `char[16]`)
    pub fn parse(text: &str) -> Result<CType> {
        let text = text.trim();
        if let Some(inner) = text.strip_suffix('*') {
            return Ok(CType::parse(inner)?.pointer_to());
        }
        if let Some(head) = text.strip_suffix(']') {
            let open = head
                .rfind('[')
                .ok_or_else(|| Error::Config(format!("malformed array type `{}`", text)))?;
            let len = head[open + 1..]
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("malformed array length in `{}`", text)))?;
            return Ok(CType::Array(Box::new(CType::parse(&head[..open])?), len));
        }
        if let Some(tag) = text.strip_prefix("struct ") {
            return Ok(CType::Struct(tag.trim().to_string()));
        }
        let ty = match text {
            "void" => CType::Void,
            "bool" | "_Bool" => CType::Bool,
            "u8" | "char" | "unsigned char" => CType::u8(),
            "u16" => CType::u16(),
            "u32" | "unsigned int" => CType::u32(),
            "u64" | "unsigned long" => CType::u64(),
            "s8" => CType::Int(IntType::S8),
            "s16" => CType::Int(IntType::S16),
            "s32" | "int" => CType::s32(),
            "s64" | "long" => CType::s64(),
            other => return Err(Error::Config(format!("unknown type `{}`", other))),
        };
        Ok(ty)
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CType::Void => write!(f, "void"),
            CType::Bool => write!(f, "bool"),
            CType::Int(it) => write!(f, "{}", it),
            CType::Pointer(inner) => write!(f, "{} *", inner),
            CType::Array(inner, len) => write!(f, "{}[{}]", inner, len),
            CType::Struct(tag) => write!(f, "struct {}", tag),
        }
    }
}

impl TryFrom<String> for CType {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        CType::parse(&text)
    }
}

impl From<CType> for String {
    fn from(ty: CType) -> Self {
        ty.to_string()
    }
}

/// One member of a struct layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    /// Member name
    pub name: String,
    /// Member type
    #[serde(rename = "type")]
    pub ty: CType,
    /// Byte offset from the struct start
    pub offset: u64,
    /// Size in bytes (derived from the type when omitted)
    #[serde(default)]
    pub size: u64,
}

/// Struct layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructLayout {
    /// Struct tag
    pub name: String,
    /// Members in offset order
    pub fields: Vec<FieldLayout>,
    /// Total size in bytes
    pub size: u64,
    /// Alignment in bytes (derived from the members when omitted)
    #[serde(default)]
    pub align: u64,
    /// Layout comes from the kernel table and is never re-derived
    #[serde(default)]
    pub opaque: bool,
}

impl StructLayout {
    /// Lay out members with natural alignment
    ///
    /// Members with an empty name and a struct type are anonymous nested
    /// structs/unions: their members are lifted into this layout.
    pub fn natural(
        name: &str,
        is_union: bool,
        members: Vec<(String, CType)>,
        structs: &StructTable,
    ) -> std::result::Result<StructLayout, String> {
        let mut fields = Vec::new();
        let mut offset = 0u64;
        let mut size = 0u64;
        let mut align = 1u64;

        for (member, ty) in members {
            let member_size = ty
                .size(structs)
                .ok_or_else(|| format!("member `{}` has incomplete type `{}`", member, ty))?;
            let member_align = ty.align(structs).unwrap_or(1).max(1);
            align = align.max(member_align);

            let at = if is_union {
                0
            } else {
                offset.div_ceil(member_align) * member_align
            };

            match (&ty, member.is_empty()) {
                (CType::Struct(inner), true) => {
                    let nested = structs
                        .get(inner)
                        .ok_or_else(|| format!("unknown nested struct `{}`", inner))?;
                    for field in &nested.fields {
                        fields.push(FieldLayout {
                            name: field.name.clone(),
                            ty: field.ty.clone(),
                            offset: at + field.offset,
                            size: field.size,
                        });
                    }
                }
                _ => fields.push(FieldLayout {
                    name: member,
                    ty,
                    offset: at,
                    size: member_size,
                }),
            }

            if is_union {
                size = size.max(member_size);
            } else {
                offset = at + member_size;
                size = offset;
            }
        }

        let size = size.div_ceil(align) * align;
        Ok(StructLayout {
            name: name.to_string(),
            fields,
            size,
            align,
            opaque: false,
        })
    }

    /// Look up a member by name
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

lazy_static::lazy_static! {
    static ref KERNEL_STRUCTS: StructTable = StructTable::kernel_defaults();
}

/// Struct layouts by tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructTable {
    structs: BTreeMap<String, StructLayout>,
}

#[derive(Deserialize)]
struct StructTableFile {
    structs: Vec<StructLayout>,
}

impl Default for StructTable {
    fn default() -> Self {
        KERNEL_STRUCTS.clone()
    }
}

impl StructTable {
    /// Table with no entries
    pub fn empty() -> Self {
        StructTable {
            structs: BTreeMap::new(),
        }
    }

    /// Load kernel layouts from JSON: `{"structs": [{"name", "size", "fields": [...]}]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let file: StructTableFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid struct table: {}", e)))?;
        let mut table = StructTable::empty();
        for mut layout in file.structs {
            layout.opaque = true;
            table.insert(layout);
        }
        // member sizes may refer to other entries, so fill them in afterwards
        let snapshot = table.clone();
        for layout in table.structs.values_mut() {
            let mut align = layout.align;
            for field in &mut layout.fields {
                if field.size == 0 {
                    field.size = field.ty.size(&snapshot).ok_or_else(|| {
                        Error::Config(format!(
                            "struct `{}` member `{}` has unknown type `{}`",
                            layout.name, field.name, field.ty
                        ))
                    })?;
                }
                if layout.align == 0 {
                    align = align.max(field.ty.align(&snapshot).unwrap_or(1));
                }
            }
            layout.align = align.max(1);
        }
        Ok(table)
    }

    /// Look up a layout
    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.structs.get(name)
    }

    /// Add or replace a layout
    pub fn insert(&mut self, layout: StructLayout) {
        self.structs.insert(layout.name.clone(), layout);
    }

    /// True when a layout exists
    pub fn contains(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    /// Number of layouts
    pub fn len(&self) -> usize {
        self.structs.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    /// Iterate layouts in tag order
    pub fn iter(&self) -> impl Iterator<Item = &StructLayout> {
        self.structs.values()
    }

    fn kernel_defaults() -> Self {
        fn layout(name: &str, size: u64, fields: Vec<(&str, CType, u64)>) -> StructLayout {
            let fields: Vec<FieldLayout> = fields
                .into_iter()
                .map(|(field, ty, offset)| {
                    let size = match &ty {
                        CType::Array(inner, len) => inner.int_type().map_or(8, |t| t.size()) * len,
                        CType::Struct(_) => 8,
                        other => other.int_type().map_or(8, |t| t.size()),
                    };
                    FieldLayout {
                        name: field.to_string(),
                        ty,
                        offset,
                        size,
                    }
                })
                .collect();
            StructLayout {
                name: name.to_string(),
                fields,
                size,
                align: 8,
                opaque: true,
            }
        }

        const PT_REGS: [&str; 21] = [
            "r15", "r14", "r13", "r12", "bp", "bx", "r11", "r10", "r9", "r8", "ax", "cx", "dx",
            "si", "di", "orig_ax", "ip", "cs", "flags", "sp", "ss",
        ];

        let mut table = StructTable::empty();
        table.insert(layout(
            "pt_regs",
            168,
            PT_REGS
                .iter()
                .enumerate()
                .map(|(i, reg)| (*reg, CType::u64(), i as u64 * 8))
                .collect(),
        ));
        table.insert(layout(
            "xdp_md",
            24,
            vec![
                ("data", CType::u32(), 0),
                ("data_end", CType::u32(), 4),
                ("data_meta", CType::u32(), 8),
                ("ingress_ifindex", CType::u32(), 12),
                ("rx_queue_index", CType::u32(), 16),
                ("egress_ifindex", CType::u32(), 20),
            ],
        ));
        let mut entry = layout(
            "trace_entry",
            8,
            vec![
                ("type", CType::u16(), 0),
                ("flags", CType::u8(), 2),
                ("preempt_count", CType::u8(), 3),
                ("pid", CType::s32(), 4),
            ],
        );
        entry.align = 4;
        table.insert(entry);

        let mut sys_enter = layout(
            "trace_event_raw_sys_enter",
            64,
            vec![
                ("id", CType::s64(), 8),
                ("args", CType::Array(Box::new(CType::u64()), 6), 16),
            ],
        );
        sys_enter.fields.insert(0, trace_entry_field());
        table.insert(sys_enter);

        let mut sys_exit = layout(
            "trace_event_raw_sys_exit",
            24,
            vec![("id", CType::s64(), 8), ("ret", CType::s64(), 16)],
        );
        sys_exit.fields.insert(0, trace_entry_field());
        table.insert(sys_exit);

        table.insert(layout(
            "request",
            288,
            vec![
                ("q", CType::u64().pointer_to(), 0),
                ("mq_ctx", CType::u64().pointer_to(), 8),
                ("mq_hctx", CType::u64().pointer_to(), 16),
                ("cmd_flags", CType::u32(), 24),
                ("rq_flags", CType::u32(), 28),
                ("tag", CType::s32(), 32),
                ("internal_tag", CType::s32(), 36),
                ("timeout", CType::u32(), 40),
                ("__data_len", CType::u32(), 44),
                ("__sector", CType::u64(), 48),
            ],
        ));

        let mut perf = layout(
            "bpf_perf_event_data",
            184,
            vec![("sample_period", CType::u64(), 168), ("addr", CType::u64(), 176)],
        );
        perf.fields.insert(
            0,
            FieldLayout {
                name: "regs".to_string(),
                ty: CType::struct_named("pt_regs"),
                offset: 0,
                size: 168,
            },
        );
        table.insert(perf);

        table
    }
}

fn trace_entry_field() -> FieldLayout {
    FieldLayout {
        name: "ent".to_string(),
        ty: CType::struct_named("trace_entry"),
        offset: 0,
        size: 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wraps() {
        assert_eq!(IntType::U8.normalize(256 + 7), 7);
        assert_eq!(IntType::S8.normalize(0xff), -1);
        assert_eq!(IntType::U32.normalize(-1), 0xffff_ffff);
        assert_eq!(IntType::U64.normalize(-1), -1);
    }

    #[test]
    fn test_usual_conversions() {
        assert_eq!(IntType::common(IntType::U8, IntType::S16), IntType::S32);
        assert_eq!(IntType::common(IntType::U32, IntType::S32), IntType::U32);
        assert_eq!(IntType::common(IntType::U32, IntType::S64), IntType::S64);
        assert_eq!(IntType::common(IntType::U64, IntType::S64), IntType::U64);
    }

    #[test]
    fn test_natural_layout() {
        let table = StructTable::empty();
        let layout = StructLayout::natural(
            "event",
            false,
            vec![
                ("pid".to_string(), CType::u32()),
                ("ts".to_string(), CType::u64()),
                ("comm".to_string(), CType::Array(Box::new(CType::u8()), 16)),
                ("flag".to_string(), CType::u8()),
            ],
            &table,
        )
        .unwrap();
        assert_eq!(layout.field("ts").unwrap().offset, 8);
        assert_eq!(layout.field("comm").unwrap().offset, 16);
        assert_eq!(layout.field("flag").unwrap().offset, 32);
        assert_eq!(layout.size, 40);
        assert_eq!(layout.align, 8);
    }

    #[test]
    fn test_union_layout() {
        let table = StructTable::empty();
        let layout = StructLayout::natural(
            "u",
            true,
            vec![("a".to_string(), CType::u8()), ("b".to_string(), CType::u64())],
            &table,
        )
        .unwrap();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.field("b").unwrap().offset, 0);
    }

    #[test]
    fn test_kernel_defaults() {
        let table = StructTable::default();
        let req = table.get("request").unwrap();
        assert!(req.opaque);
        assert_eq!(req.field("__data_len").unwrap().offset, 44);
        let enter = table.get("trace_event_raw_sys_enter").unwrap();
        assert_eq!(enter.field("args").unwrap().size, 48);
    }

    #[test]
    fn test_type_text_roundtrip() {
        for text in ["u64", "struct event *", "u8[16]", "s32 * *"] {
            let ty = CType::parse(text).unwrap();
            assert_eq!(CType::parse(&ty.to_string()).unwrap(), ty);
        }
    }

    #[test]
    fn test_struct_table_from_json() {
        let table = StructTable::from_json(
            r#"{"structs": [{"name": "sock", "size": 16,
                 "fields": [{"name": "family", "type": "u16", "offset": 0},
                            {"name": "cookie", "type": "u64", "offset": 8}]}]}"#,
        )
        .unwrap();
        let sock = table.get("sock").unwrap();
        assert!(sock.opaque);
        assert_eq!(sock.field("cookie").unwrap().size, 8);
        assert_eq!(sock.align, 8);
        assert!(StructTable::from_json("{\"structs\": 3}").is_err());
    }
}
