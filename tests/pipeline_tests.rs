//! End-to-end tests for the compilation pipeline
//! Source → Resolver → Inliner → IR → Safety → Artifact, over the C fixtures
//! in `tests/fixtures/` and a few scenarios written inline.

use ebpfc::compiler::maps::MapShape;
use ebpfc::compiler::{AttachStatus, CompileOptions, Compiler, FileReport, FileStatus};
use ebpfc::{compile_files, AdvisoryKind, DiagnosticKind, DiagnosticScope, ParallelConfig};
use ebpfc::SemanticErrorKind;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn compile_fixture(name: &str) -> FileReport {
    Compiler::new(CompileOptions::default())
        .compile_file(fixture(name))
        .unwrap()
}

fn compile(source: &str) -> FileReport {
    Compiler::new(CompileOptions::default()).compile_source("inline.bpf.c", source)
}

fn advisory_kinds(report: &FileReport) -> Vec<AdvisoryKind> {
    report
        .advisories()
        .filter_map(|d| match d.kind {
            DiagnosticKind::Advisory(kind) => Some(kind),
            _ => None,
        })
        .collect()
}

fn error_kinds(report: &FileReport) -> Vec<SemanticErrorKind> {
    report.errors().filter_map(|d| d.semantic_kind()).collect()
}

const FIXTURES: [(&str, usize); 10] = [
    ("trace_delta.bpf.c", 1),
    ("execve_delta.bpf.c", 2),
    ("lookup_unused.bpf.c", 2),
    ("hello_kprobe.bpf.c", 1),
    ("hello_xdp.bpf.c", 1),
    ("execve_printk.bpf.c", 1),
    ("clone_perf.bpf.c", 1),
    ("setuid_perf.bpf.c", 1),
    ("blk_latency.bpf.c", 3),
    ("globals.bpf.c", 1),
];

// =============================================================================
// FIXTURES
// =============================================================================

#[test]
fn test_fixtures_compile_without_errors() {
    for (name, programs) in FIXTURES {
        let report = compile_fixture(name);
        let errors: Vec<String> = report.errors().map(|d| d.to_string()).collect();
        assert!(errors.is_empty(), "{}: {:?}", name, errors);
        assert_eq!(report.status, FileStatus::Success, "{}", name);
        assert_eq!(report.program_names().len(), programs, "{}", name);
    }
}

#[test]
fn test_hash_delta_with_placeholder_target() {
    let report = compile_fixture("trace_delta.bpf.c");
    assert_eq!(report.errors().count(), 0);
    assert_eq!(advisory_kinds(&report), vec![AdvisoryKind::UnresolvedAttachTarget]);

    let artifact = report.artifact.as_ref().unwrap();
    let program = artifact.program("do_trace").unwrap();
    assert_eq!(program.attach.raw, "YOUR_PROBE_POINT");
    assert_eq!(program.attach.status, AttachStatus::Placeholder);
    assert_eq!(program.maps.len(), 1);
    assert_eq!(program.maps[0].name, "last");
}

#[test]
fn test_shared_globals_are_advisories() {
    let report = compile_fixture("globals.bpf.c");
    assert_eq!(report.status, FileStatus::Success);
    assert_eq!(
        advisory_kinds(&report),
        vec![AdvisoryKind::UnsynchronizedGlobal, AdvisoryKind::UnsynchronizedGlobal]
    );
    for advisory in report.advisories() {
        assert_eq!(advisory.scope, DiagnosticScope::Program("trace_execve".to_string()));
    }

    let artifact = report.artifact.as_ref().unwrap();
    let globals: Vec<&str> = artifact.globals.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(globals, vec!["w", "prev_time"]);
}

#[test]
fn test_map_only_file_warns_about_license() {
    let report = compile_fixture("ringbuf_map_only.bpf.c");
    assert_eq!(report.status, FileStatus::Success);
    assert!(report.program_names().is_empty());
    assert_eq!(advisory_kinds(&report), vec![AdvisoryKind::MissingLicense]);

    let artifact = report.artifact.as_ref().unwrap();
    assert_eq!(artifact.maps[0].max_entries, Some(1 << 24));
}

#[test]
fn test_resolved_maps_satisfy_their_shape() {
    for (name, _) in FIXTURES {
        let report = compile_fixture(name);
        for map in &report.artifact.as_ref().unwrap().maps {
            match map.kind.shape() {
                MapShape::Typed => {
                    assert!(map.key_type.is_some() && map.value_type.is_some(), "{}", map.name);
                    assert!(map.key_size.is_none() && map.value_size.is_none(), "{}", map.name);
                    assert!(map.max_entries.is_some_and(|n| n > 0), "{}", map.name);
                }
                MapShape::Sized => {
                    assert!(map.key_size.is_some() && map.value_size.is_some(), "{}", map.name);
                    assert!(map.key_type.is_none() && map.value_type.is_none(), "{}", map.name);
                }
                MapShape::RingBuffer => {
                    assert!(map.max_entries.is_some(), "{}", map.name);
                    assert!(map.key_type.is_none() && map.value_type.is_none(), "{}", map.name);
                }
                MapShape::ValueOnly | MapShape::Unchecked => {}
            }
        }
    }
}

// =============================================================================
// DETERMINISM
// =============================================================================

#[test]
fn test_compilation_is_idempotent() {
    for (name, _) in FIXTURES {
        let first = compile_fixture(name);
        let second = compile_fixture(name);
        let a = first.artifact.unwrap();
        let b = second.artifact.unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap(), "{}", name);
        assert_eq!(a.digest().unwrap(), b.digest().unwrap(), "{}", name);
        assert_eq!(first.diagnostics, second.diagnostics, "{}", name);
    }
}

#[test]
fn test_compile_files_keeps_input_order() {
    let paths: Vec<PathBuf> = FIXTURES.iter().map(|(name, _)| fixture(name)).collect();
    let compiler = Compiler::new(CompileOptions::default());
    let reports = compile_files(&compiler, &paths, &ParallelConfig::default()).unwrap();

    assert_eq!(reports.len(), paths.len());
    for (report, path) in reports.iter().zip(&paths) {
        assert_eq!(report.file, path.display().to_string());
        let alone = compiler.compile_file(path).unwrap();
        assert_eq!(report.artifact, alone.artifact);
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

const RINGBUF_HEADER: &str = r#"
char LICENSE[] SEC("license") = "GPL";

struct event {
    __u32 pid;
    char comm[16];
};

struct {
    __uint(type, BPF_MAP_TYPE_RINGBUF);
    __uint(max_entries, 256 * 1024);
} rb SEC(".maps");
"#;

#[test]
fn test_ringbuf_submit_inside_guard() {
    let source = format!(
        "{}{}",
        RINGBUF_HEADER,
        r#"
SEC("tracepoint/syscalls/sys_enter_execve")
int handle_execve(void *ctx)
{
    struct event *e;

    e = bpf_ringbuf_reserve(&rb, sizeof(*e), 0);
    if (!e)
        return 0;

    e->pid = bpf_get_current_pid_tgid() >> 32;
    bpf_get_current_comm(&e->comm, sizeof(e->comm));
    bpf_ringbuf_submit(e, 0);
    return 0;
}
"#
    );
    let report = compile(&source);
    assert_eq!(report.status, FileStatus::Success);
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);

    let artifact = report.artifact.unwrap();
    assert_eq!(artifact.maps[0].max_entries, Some(262_144));
    assert!(artifact.to_json().unwrap().contains("\"max_entries\": 262144"));
}

#[test]
fn test_ringbuf_submit_outside_guard() {
    let source = format!(
        "{}{}",
        RINGBUF_HEADER,
        r#"
SEC("tracepoint/syscalls/sys_enter_execve")
int handle_execve(void *ctx)
{
    struct event *e;

    e = bpf_ringbuf_reserve(&rb, sizeof(*e), 0);
    if (e) {
        e->pid = bpf_get_current_pid_tgid() >> 32;
    }
    bpf_ringbuf_submit(e, 0);
    return 0;
}
"#
    );
    let report = compile(&source);
    assert_eq!(report.status, FileStatus::Failure);
    assert_eq!(error_kinds(&report), vec![SemanticErrorKind::MissingNullCheck]);
    assert!(report.program_names().is_empty());
}

#[test]
fn test_unbounded_loop_rejects_only_its_program() {
    let report = compile(
        r#"
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
int count(void *ctx)
{
    int total = 0;
    for (int i = 0; i < 16; i++)
        total += i;
    return total;
}
"#,
    );
    assert_eq!(report.status, FileStatus::PartialSuccess);
    assert_eq!(report.program_names(), vec!["count"]);
    assert_eq!(error_kinds(&report), vec![SemanticErrorKind::UnboundedLoop]);
    let error = report.errors().next().unwrap();
    assert_eq!(error.scope, DiagnosticScope::Program("spin".to_string()));
}

#[test]
fn test_mutual_recursion_through_entry_point() {
    let report = compile(
        r#"
char LICENSE[] SEC("license") = "GPL";

static int bounce(void *ctx);

SEC("tracepoint/syscalls/sys_enter_execve")
int first(void *ctx)
{
    bpf_printk("first");
    return 0;
}

SEC("tracepoint/syscalls/sys_enter_openat")
int recurse(void *ctx)
{
    return bounce(ctx);
}

static int bounce(void *ctx)
{
    return recurse(ctx);
}
"#,
    );
    assert_eq!(report.status, FileStatus::PartialSuccess);
    assert_eq!(report.program_names(), vec!["first"]);
    assert_eq!(error_kinds(&report), vec![SemanticErrorKind::UnsupportedRecursion]);
    assert!(report
        .errors()
        .all(|d| d.scope == DiagnosticScope::Program("recurse".to_string())));
}

#[test]
fn test_incomplete_map_rejects_its_users() {
    let report = compile(
        r#"
char LICENSE[] SEC("license") = "GPL";

struct {
    __uint(type, BPF_MAP_TYPE_HASH);
    __uint(max_entries, 16);
    __type(value, __u64);
} nokey SEC(".maps");

SEC("tracepoint/syscalls/sys_enter_execve")
int uses_map(void *ctx)
{
    __u32 k = 0;
    bpf_map_lookup_elem(&nokey, &k);
    return 0;
}

SEC("tracepoint/syscalls/sys_enter_openat")
int ignores_map(void *ctx)
{
    return 0;
}
"#,
    );
    assert_eq!(report.status, FileStatus::PartialSuccess);
    assert_eq!(report.program_names(), vec!["ignores_map"]);
    assert_eq!(
        error_kinds(&report),
        vec![
            SemanticErrorKind::IncompleteMapDeclaration,
            SemanticErrorKind::IncompleteMapDeclaration
        ]
    );
    let scopes: Vec<&DiagnosticScope> = report.errors().map(|d| &d.scope).collect();
    assert_eq!(scopes[0], &DiagnosticScope::FileLevel);
    assert_eq!(scopes[1], &DiagnosticScope::Program("uses_map".to_string()));
    assert!(report.artifact.unwrap().maps.is_empty());
}

#[test]
fn test_diagnostics_render_and_serialize() {
    let report = compile_fixture("trace_delta.bpf.c");
    let advisory = report.advisories().next().unwrap();
    let text = advisory.to_string();
    assert!(text.contains("trace_delta.bpf.c"));
    assert!(text.contains("unresolved-attach-target"));

    let json = serde_json::to_string(&report.diagnostics).unwrap();
    assert!(json.contains("unresolved-attach-target"));
}
