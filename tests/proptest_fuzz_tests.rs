//! Property-based fuzzing tests for the ebpfc scanner, parser and pipeline
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The scanner and parser never panic on arbitrary input
//! 2. Constant folding matches fixed-width wrapping arithmetic
//! 3. Compiling the same program twice yields byte-identical artifacts

use ebpfc::compiler::{resolve, CompileOptions, Compiler, FileStatus};
use ebpfc::{parse_source, CScanner};
use proptest::prelude::*;

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

/// Generate random strings that might break the scanner
fn arbitrary_source_string() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[\x00-\x7F]{0,500}").unwrap()
}

/// Generate C-like token soup
fn c_like_string() -> impl Strategy<Value = String> {
    prop::collection::vec(c_token(), 0..60).prop_map(|tokens| tokens.join(" "))
}

/// Generate tokens that look like restricted C
fn c_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("(".to_string()),
        Just(")".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just("[".to_string()),
        Just("]".to_string()),
        Just(";".to_string()),
        Just(",".to_string()),
        // Keywords
        Just("struct".to_string()),
        Just("int".to_string()),
        Just("unsigned".to_string()),
        Just("if".to_string()),
        Just("else".to_string()),
        Just("for".to_string()),
        Just("while".to_string()),
        Just("return".to_string()),
        Just("SEC".to_string()),
        Just("__uint".to_string()),
        Just("__type".to_string()),
        Just("#define".to_string()),
        Just("\n".to_string()),
        // Operators
        Just("+".to_string()),
        Just("*".to_string()),
        Just("&".to_string()),
        Just("->".to_string()),
        Just("=".to_string()),
        Just("<".to_string()),
        Just("<<".to_string()),
        Just("!".to_string()),
        Just("&&".to_string()),
        // Literals
        (0u64..100_000).prop_map(|n| n.to_string()),
        r#""[a-z/_]{0,20}""#.prop_map(|s| s),
        // Identifiers
        "[a-z_][a-z0-9_]{0,10}".prop_map(|s| s),
        // Comments
        "//[^\n]{0,20}\n".prop_map(|s| s),
    ]
}

/// A well-formed program: one HASH map and one counted loop
fn counted_loop_program() -> impl Strategy<Value = (String, u64)> {
    (1u64..=4096, 1u64..=64, 1i64..=8).prop_map(|(entries, bound, step)| {
        let source = format!(
            r#"
char LICENSE[] SEC("license") = "GPL";

struct {{
    __uint(type, BPF_MAP_TYPE_HASH);
    __uint(max_entries, {entries});
    __type(key, __u32);
    __type(value, __u64);
}} counts SEC(".maps");

SEC("tracepoint/syscalls/sys_enter_execve")
int count(void *ctx)
{{
    __u32 key = 0;
    __u64 total = 0;
    for (int i = 0; i < {bound}; i += {step})
        total += i;
    __u64 *slot = bpf_map_lookup_elem(&counts, &key);
    if (slot)
        *slot = total;
    return 0;
}}
"#
        );
        (source, entries)
    })
}

// =============================================================================
// SCANNER / PARSER FUZZ TESTS
// =============================================================================

proptest! {
    /// The scanner should never panic on arbitrary input
    #[test]
    fn scanner_never_panics(source in arbitrary_source_string()) {
        let _ = CScanner::new(&source).scan_tokens();
    }

    /// The parser handles C-like token soup without panic
    #[test]
    fn parser_never_panics(source in c_like_string()) {
        let _ = parse_source(&source);
    }

    /// A file that does not parse fails as a whole, with no artifact
    #[test]
    fn unparseable_source_fails_cleanly(source in arbitrary_source_string()) {
        let report = Compiler::new(CompileOptions::default()).compile_source("fuzz.bpf.c", &source);
        if report.artifact.is_none() {
            prop_assert_eq!(report.status, FileStatus::Failure);
            prop_assert_eq!(report.diagnostics.len(), 1);
        }
    }
}

// =============================================================================
// CONSTANT FOLDING
// =============================================================================

fn fold_define(expr: &str) -> Option<i64> {
    let source = format!("#define X ({})\n", expr);
    let unit = parse_source(&source).ok()?;
    let resolved = resolve(&unit, "fold.bpf.c", &CompileOptions::default());
    resolved.constants.get("X").map(|c| c.value)
}

proptest! {
    /// `int` arithmetic wraps at 32 bits
    #[test]
    fn int_arithmetic_wraps(a in 0i64..=i32::MAX as i64, b in 0i64..=i32::MAX as i64) {
        let (x, y) = (a as i32, b as i32);
        prop_assert_eq!(fold_define(&format!("{} + {}", a, b)), Some(x.wrapping_add(y) as i64));
        prop_assert_eq!(fold_define(&format!("{} - {}", a, b)), Some(x.wrapping_sub(y) as i64));
        prop_assert_eq!(fold_define(&format!("{} * {}", a, b)), Some(x.wrapping_mul(y) as i64));
    }

    /// `unsigned long long` arithmetic wraps at 64 bits
    #[test]
    fn u64_arithmetic_wraps(a in any::<u32>(), b in any::<u32>(), c in any::<u32>()) {
        let expected = (a as u64).wrapping_mul(b as u64).wrapping_mul(c as u64);
        let folded = fold_define(&format!("{}ULL * {}ULL * {}ULL", a, b, c));
        prop_assert_eq!(folded, Some(expected as i64));
    }

    /// Shifts of an `int` one stay exact below the sign bit
    #[test]
    fn shifts_fold_exactly(n in 0u32..31) {
        prop_assert_eq!(fold_define(&format!("1 << {}", n)), Some(1i64 << n));
    }
}

// =============================================================================
// DETERMINISM
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Compiling the same program twice yields byte-identical artifacts
    #[test]
    fn compilation_is_idempotent((source, entries) in counted_loop_program()) {
        let compiler = Compiler::new(CompileOptions::default());
        let first = compiler.compile_source("loop.bpf.c", &source);
        let second = compiler.compile_source("loop.bpf.c", &source);

        prop_assert_eq!(first.status, FileStatus::Success);
        let a = first.artifact.unwrap();
        let b = second.artifact.unwrap();
        prop_assert_eq!(a.maps[0].max_entries, Some(entries));
        prop_assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        prop_assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }
}
