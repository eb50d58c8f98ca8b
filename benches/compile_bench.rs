use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ebpfc::{parse_source, CScanner, CompileOptions, Compiler};

const TRACE_DELTA: &str = include_str!("../tests/fixtures/trace_delta.bpf.c");
const BLK_LATENCY: &str = include_str!("../tests/fixtures/blk_latency.bpf.c");

fn lexer_benchmark(c: &mut Criterion) {
    c.bench_function("tokenize trace_delta", |b| {
        b.iter(|| CScanner::new(black_box(TRACE_DELTA)).scan_tokens().unwrap())
    });
}

fn parser_benchmark(c: &mut Criterion) {
    c.bench_function("parse blk_latency", |b| {
        b.iter(|| parse_source(black_box(BLK_LATENCY)).unwrap())
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let compiler = Compiler::new(CompileOptions::default());
    c.bench_function("compile trace_delta", |b| {
        b.iter(|| compiler.compile_source("trace_delta.bpf.c", black_box(TRACE_DELTA)))
    });

    let sequential = Compiler::new(CompileOptions {
        parallel: false,
        ..Default::default()
    });
    c.bench_function("compile blk_latency sequential", |b| {
        b.iter(|| sequential.compile_source("blk_latency.bpf.c", black_box(BLK_LATENCY)))
    });
    c.bench_function("compile blk_latency parallel", |b| {
        b.iter(|| compiler.compile_source("blk_latency.bpf.c", black_box(BLK_LATENCY)))
    });
}

criterion_group!(benches, lexer_benchmark, parser_benchmark, pipeline_benchmark);
criterion_main!(benches);
