//! Benchmarks for the pipelining passes.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeliner::analysis::{DependenceGraph, ScheduleBounds};
use pipeliner::ir::Module;
use pipeliner::target::TargetConfig;
use pipeliner::transform::{ModuloScheduler, OptLevel, PassKind, Pipeline, PipelineConfig};

const DOT: &str = r#"
    func @dot(%a: buffer<i32>, %b: buffer<i32>, %n: index) -> (i32) {
      %lb = const[0]() : index
      %st = const[1]() : index
      %z = const[0]() : i32
      %r = for[main](%lb, %n, %st, %z) : i32 {
        ^(%i: index, %acc: i32):
        %x = load(%a, %i) : i32
        %y = load(%b, %i) : i32
        %s = fma(%x, %y, %acc) : i32
        yield(%s)
      }
      return(%r)
    }
"#;

/// A loop body of `width` independent multiply-add chains.
fn unrolled(width: usize) -> String {
    let mut body = String::new();
    let mut sum = "%acc".to_string();
    for k in 0..width {
        body.push_str(&format!(
            "        %x{k} = load(%a, %i) : i32\n        %y{k} = fma(%x{k}, %x{k}, {sum}) : i32\n        store(%y{k}, %o, %i)\n"
        ));
        sum = format!("%y{k}");
    }
    format!(
        r#"
    func @wide(%a: buffer<i32>, %o: buffer<i32>, %n: index) -> (i32) {{
      %lb = const[0]() : index
      %st = const[1]() : index
      %z = const[0]() : i32
      %r = for[main](%lb, %n, %st, %z) : i32 {{
        ^(%i: index, %acc: i32):
{body}        yield({sum})
      }}
      return(%r)
    }}
"#
    )
}

/// Benchmark lexer and parser speed.
fn bench_parsing(c: &mut Criterion) {
    let source = unrolled(16);

    c.bench_function("lex_unrolled_16", |b| {
        b.iter(|| {
            let lexer = pipeliner::frontend::Lexer::new(black_box(&source));
            lexer.tokenize().unwrap()
        })
    });

    c.bench_function("parse_unrolled_16", |b| {
        b.iter(|| pipeliner::frontend::parse(black_box(&source)).unwrap())
    });
}

/// Benchmark the scheduler alone on kernels of growing size.
fn bench_scheduling(c: &mut Criterion) {
    let target = TargetConfig::default();
    let mut group = c.benchmark_group("modulo_schedule");
    for width in [1usize, 4, 16] {
        let mut module = pipeliner::frontend::parse(&unrolled(width)).unwrap();
        let config = PipelineConfig::new(OptLevel::O0).with_passes(vec![PassKind::Extract]);
        Pipeline::new(config).optimize(&mut module).unwrap();
        let kernel = module.get("wide_kernel").unwrap().clone();
        let scheduler = ModuloScheduler::new(&target);

        group.bench_with_input(BenchmarkId::from_parameter(width), &kernel, |b, kernel| {
            b.iter(|| scheduler.schedule_kernel(black_box(kernel)).unwrap())
        });
    }
    group.finish();
}

/// Benchmark bound computation on the dependence graph.
fn bench_bounds(c: &mut Criterion) {
    let target = TargetConfig::default();
    let mut module = pipeliner::frontend::parse(&unrolled(16)).unwrap();
    let config = PipelineConfig::new(OptLevel::O0).with_passes(vec![PassKind::Extract]);
    Pipeline::new(config).optimize(&mut module).unwrap();
    let kernel = module.get("wide_kernel").unwrap();
    let (_, graph, _): (_, DependenceGraph, _) =
        ModuloScheduler::new(&target).schedule_kernel(kernel).unwrap();

    c.bench_function("schedule_bounds_16", |b| {
        b.iter(|| ScheduleBounds::compute(black_box(&graph), &target))
    });
}

/// Benchmark the full default pipeline.
fn bench_full_pipeline(c: &mut Criterion) {
    let module: Module = pipeliner::frontend::parse(DOT).unwrap();

    c.bench_function("pipeline_dot_o3", |b| {
        b.iter(|| {
            let mut module = module.clone();
            Pipeline::default_pipeline().optimize(black_box(&mut module)).unwrap()
        })
    });
}

criterion_group!(benches, bench_parsing, bench_scheduling, bench_bounds, bench_full_pipeline);
criterion_main!(benches);
