//! Integration tests for the pipelining passes.

use pipeliner::prelude::*;
use pipeliner::analysis::loops;
use pipeliner::ir::print_func;
use pipeliner::transform::pipeline::quick_optimize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write;

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

const MADD: &str = r#"
    func @madd(%a: buffer<i32>, %o: buffer<i32>, %s: i32, %t: i32, %n: index) -> () {
      %lb = const[0]() : index
      %st = const[1]() : index
      for[main](%lb, %n, %st) {
        ^(%i: index):
        %x = load(%a, %i) : i32
        %y = fma(%x, %s, %t) : i32
        store(%y, %o, %i)
        yield()
      }
      return()
    }
"#;

const ACCUMULATE: &str = r#"
    func @accumulate(%a: buffer<i32>, %b: buffer<i32>, %n: index) -> (i32) {
      %lb = const[0]() : index
      %st = const[1]() : index
      %z = const[0]() : i32
      %r = for[main](%lb, %n, %st, %z) : i32 {
        ^(%i: index, %acc: i32):
        %two = const[2]() : i32
        %x = load(%a, %i) : i32
        %y = mul(%x, %two) : i32
        store(%y, %b, %i)
        %s = add(%acc, %y) : i32
        yield(%s)
      }
      return(%r)
    }
"#;

const MINMAX: &str = r#"
    func @minmax(%a: buffer<i32>, %lo: index, %n: index) -> (i32, i32) {
      %st = const[3]() : index
      %big = const[1000]() : i32
      %small = const[-1000]() : i32
      %mn, %mx = for[main](%lo, %n, %st, %big, %small) : i32, i32 {
        ^(%i: index, %m: i32, %x: i32):
        %v = load(%a, %i) : i32
        %m2 = min(%m, %v) : i32
        %x2 = max(%x, %v) : i32
        yield(%m2, %x2)
      }
      return(%mn, %mx)
    }
"#;

const WIDE: &str = r#"
    func @wide(%a: buffer<i32>, %o: buffer<i32>, %n: index) -> (i32) {
      %lb = const[0]() : index
      %st = const[8]() : index
      %z = const[0]() : i32
      %r = for[main](%lb, %n, %st, %z) : i32 {
        ^(%i: index, %acc: i32):
        %v = load(%a, %i) : vector<8xi32>
        %w = add(%v, %v) : vector<8xi32>
        store(%w, %o, %i)
        %p = reduce[max](%w) : i32
        %s = add(%acc, %p) : i32
        yield(%s)
      }
      return(%r)
    }
"#;

/// Buffers first, then scalars, matching every fixture's parameter order.
#[derive(Debug, Clone)]
struct Inputs {
    buffers: Vec<Vec<i64>>,
    scalars: Vec<i64>,
}

impl Inputs {
    fn random(rng: &mut StdRng, buffers: usize, scalars: Vec<i64>) -> Self {
        let buffers = (0..buffers)
            .map(|_| (0..32).map(|_| rng.gen_range(-50..50)).collect())
            .collect();
        Self { buffers, scalars }
    }
}

/// Returned values and final buffer contents of one call.
fn observe(module: &Module, name: &str, inputs: &Inputs) -> (Vec<RtValue>, Vec<Vec<i64>>) {
    let mut interp = Interpreter::new(module);
    let handles: Vec<RtValue> = inputs.buffers.iter().map(|b| interp.alloc(b.clone())).collect();
    let mut args = handles.clone();
    args.extend(inputs.scalars.iter().map(|&v| RtValue::Int(v)));
    let results = interp.call(name, &args).unwrap();
    let buffers = handles.iter().map(|h| interp.buffer(h).unwrap().to_vec()).collect();
    (results, buffers)
}

fn assert_round_trip(source: &str, name: &str, buffers: usize, scalars: impl Fn(i64) -> Vec<i64>) {
    let original = pipeliner::parse(source).unwrap();
    let mut pipelined = original.clone();
    let report = quick_optimize(&mut pipelined).unwrap();
    assert!(report.failures.is_empty(), "{}", report);
    assert_eq!(report.schedules.len(), 1, "{}", report);
    verify_module(&pipelined).unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for n in 0..=12 {
        let inputs = Inputs::random(&mut rng, buffers, scalars(n));
        assert_eq!(
            observe(&pipelined, name, &inputs),
            observe(&original, name, &inputs),
            "@{} diverges for n={}",
            name,
            n
        );
    }
}

#[test]
fn test_round_trip_dot() {
    assert_round_trip(DOT, "dot", 2, |n| vec![n]);
}

#[test]
fn test_round_trip_store_only() {
    assert_round_trip(MADD, "madd", 2, |n| vec![3, -7, n]);
}

#[test]
fn test_round_trip_accumulate() {
    assert_round_trip(ACCUMULATE, "accumulate", 2, |n| vec![n]);
}

#[test]
fn test_round_trip_two_accumulators() {
    assert_round_trip(MINMAX, "minmax", 1, |n| vec![1, n]);
}

#[test]
fn test_round_trip_wide_vectors() {
    assert_round_trip(WIDE, "wide", 2, |n| vec![n]);
}

/// A counted loop over `%a`, `%b` with 1-3 accumulators and a random body.
///
/// Bodies read and write both buffers at `i`, `i+1` and `i+2`, so nearby
/// iterations alias, and may yield the same value more than once.
fn random_loop(rng: &mut StdRng) -> String {
    let accs = rng.gen_range(1..=3);
    let step = rng.gen_range(1..=2);
    let idx = ["%i", "%i1", "%i2"];
    let bufs = ["%a", "%b"];

    let mut pool: Vec<String> = (0..accs).map(|k| format!("%acc{}", k)).collect();
    pool.push("%s".to_string());
    let mut body = String::new();
    fn pick(rng: &mut StdRng, pool: &[String]) -> String {
        pool[rng.gen_range(0..pool.len())].clone()
    }

    for k in 0..rng.gen_range(3..=8) {
        let v = format!("%v{}", k);
        let kind = if k == 0 { 0 } else { rng.gen_range(0..4) };
        match kind {
            0 => {
                let (b, i) = (bufs[rng.gen_range(0..2)], idx[rng.gen_range(0..3)]);
                writeln!(body, "{} = load({}, {}) : i32", v, b, i).unwrap();
            }
            1 => {
                let op = ["add", "sub", "mul", "min", "max", "xor"][rng.gen_range(0..6)];
                let (x, y) = (pick(rng, &pool), pick(rng, &pool));
                writeln!(body, "{} = {}({}, {}) : i32", v, op, x, y).unwrap();
            }
            2 => {
                let (x, y, z) = (pick(rng, &pool), pick(rng, &pool), pick(rng, &pool));
                writeln!(body, "{} = fma({}, {}, {}) : i32", v, x, y, z).unwrap();
            }
            _ => {
                let (b, i) = (bufs[rng.gen_range(0..2)], idx[rng.gen_range(0..3)]);
                writeln!(body, "store({}, {}, {})", pick(rng, &pool), b, i).unwrap();
                continue;
            }
        }
        pool.push(v);
    }
    if rng.gen_bool(0.5) {
        let (b, i) = (bufs[rng.gen_range(0..2)], idx[rng.gen_range(0..3)]);
        writeln!(body, "store({}, {}, {})", pick(rng, &pool), b, i).unwrap();
    }
    let yields: Vec<String> = (0..accs).map(|_| pick(rng, &pool)).collect();

    let results: Vec<String> = (0..accs).map(|k| format!("%r{}", k)).collect();
    let inits: Vec<String> = (0..accs).map(|k| format!("%z{}", k)).collect();
    let params: Vec<String> = (0..accs).map(|k| format!("%acc{}: i32", k)).collect();
    let types = vec!["i32"; accs].join(", ");
    let mut text = String::new();
    writeln!(text, "func @rnd(%a: buffer<i32>, %b: buffer<i32>, %s: i32, %n: index) -> ({}) {{", types).unwrap();
    writeln!(text, "%lb = const[0]() : index").unwrap();
    writeln!(text, "%st = const[{}]() : index", step).unwrap();
    for (k, z) in inits.iter().enumerate() {
        writeln!(text, "{} = const[{}]() : i32", z, rng.gen_range(-5..5) + k as i64).unwrap();
    }
    writeln!(
        text,
        "{} = for[main](%lb, %n, %st, {}) : {} {{",
        results.join(", "),
        inits.join(", "),
        types
    )
    .unwrap();
    writeln!(text, "^(%i: index, {}):", params.join(", ")).unwrap();
    writeln!(text, "%one = const[1]() : index").unwrap();
    writeln!(text, "%two = const[2]() : index").unwrap();
    writeln!(text, "%i1 = add(%i, %one) : index").unwrap();
    writeln!(text, "%i2 = add(%i, %two) : index").unwrap();
    text.push_str(&body);
    writeln!(text, "yield({})", yields.join(", ")).unwrap();
    writeln!(text, "}}").unwrap();
    writeln!(text, "return({})", results.join(", ")).unwrap();
    writeln!(text, "}}").unwrap();
    text
}

#[test]
fn test_round_trip_random_loops() {
    let mut rng = StdRng::seed_from_u64(0x100b);
    for case in 0..40 {
        let source = random_loop(&mut rng);
        let original = pipeliner::parse(&source).unwrap();

        let mut target = TargetConfig::default();
        target.set_latency("load", rng.gen_range(1..=5));
        target.set_latency("mul", rng.gen_range(1..=4));
        target.set_latency("fma", rng.gen_range(1..=5));
        target.set_capacity(ResourceClass::Mem, rng.gen_range(1..=2));
        let mut pipelined = original.clone();
        let report = Pipeline::new(PipelineConfig::new(OptLevel::O3).with_target(target))
            .optimize(&mut pipelined)
            .unwrap();
        assert!(report.failures.is_empty(), "case {}: {}\n{}", case, report, source);
        assert_eq!(report.schedules.len(), 1, "case {}:\n{}", case, source);
        verify_module(&pipelined).unwrap();

        for n in 0..=14 {
            let s = rng.gen_range(-9..9);
            let inputs = Inputs::random(&mut rng, 2, vec![s, n]);
            assert_eq!(
                observe(&pipelined, "rnd", &inputs),
                observe(&original, "rnd", &inputs),
                "case {} diverges for n={}:\n{}",
                case,
                n,
                source
            );
        }
    }
}

#[test]
fn test_empty_range_is_noop() {
    let original = pipeliner::parse(MINMAX).unwrap();
    let mut pipelined = original.clone();
    quick_optimize(&mut pipelined).unwrap();
    let inputs = Inputs { buffers: vec![vec![5; 32]], scalars: vec![9, 2] };
    let (results, _) = observe(&pipelined, "minmax", &inputs);
    assert_eq!(results, vec![RtValue::Int(1000), RtValue::Int(-1000)]);
}

/// Extract and legalize, then return the scheduler's view of the kernel.
fn scheduled_kernel(source: &str, kernel: &str, target: &TargetConfig) -> (DependenceGraph, pipeliner::transform::ModuloSchedule) {
    let mut module = pipeliner::parse(source).unwrap();
    let config = PipelineConfig::new(OptLevel::O0)
        .with_target(target.clone())
        .with_passes(vec![PassKind::Extract, PassKind::Legalize]);
    Pipeline::new(config).optimize(&mut module).unwrap();
    let func = module.get(kernel).unwrap();
    let (_, graph, schedule) = ModuloScheduler::new(target).schedule_kernel(func).unwrap();
    (graph, schedule)
}

#[test]
fn test_schedule_invariants() {
    let target = TargetConfig::default();
    let fixtures = [
        (DOT, "dot_kernel"),
        (MADD, "madd_kernel"),
        (ACCUMULATE, "accumulate_kernel"),
        (MINMAX, "minmax_kernel"),
        (WIDE, "wide_kernel"),
    ];
    for (source, kernel) in fixtures {
        let (graph, schedule) = scheduled_kernel(source, kernel, &target);
        let ii = schedule.ii;
        let bounds = schedule.bounds;
        assert_eq!(bounds.ii0(), bounds.res_mii.max(bounds.rec_mii).max(1));
        assert!(ii >= bounds.ii0(), "@{}: II={} below II0={}", kernel, ii, bounds.ii0());

        for edge in &graph.edges {
            let (u, v) = (schedule.cycle(edge.source) as i64, schedule.cycle(edge.target) as i64);
            assert!(
                v >= u + edge.latency as i64 - edge.distance as i64 * ii as i64,
                "@{}: edge n{} -> n{} violated",
                kernel,
                edge.source,
                edge.target
            );
        }

        for class in [ResourceClass::Alu, ResourceClass::Mul, ResourceClass::Mem, ResourceClass::Shuffle, ResourceClass::Branch] {
            let mut usage = vec![0u32; ii as usize];
            for (n, node) in graph.nodes.iter().enumerate().filter(|(_, node)| node.class == class) {
                for k in 0..node.occupancy {
                    usage[((schedule.cycle(n) + k) % ii) as usize] += 1;
                }
            }
            assert!(
                usage.iter().all(|&u| u <= target.capacity(class)),
                "@{}: class {} oversubscribed: {:?}",
                kernel,
                class.name(),
                usage
            );
        }
        schedule.verify(&graph, &target).unwrap();
    }
}

#[test]
fn test_loop_shape_idempotent() {
    let mut module = pipeliner::parse(DOT).unwrap();
    quick_optimize(&mut module).unwrap();
    let converter = LoopShapeConverter::new();
    for name in module.names() {
        let (again, _) = converter.run(&module, &name).unwrap();
        assert_eq!(print_module(&again), print_module(&module), "@{} changed", name);
    }
}

#[test]
fn test_legalization_fixed_point() {
    let target = TargetConfig::default();
    let mut module = pipeliner::parse(WIDE).unwrap();
    let config = PipelineConfig::new(OptLevel::O1);
    let report = Pipeline::new(config).optimize(&mut module).unwrap();
    assert!(report.applied_transforms.contains(&"legalize(@wide)".to_string()));

    let legalized = module.clone();
    let (again, changed) = Legalizer::new(&target).run(&legalized, "wide").unwrap();
    assert!(!changed);
    assert_eq!(print_module(&again), print_module(&legalized));

    let mut kernel = legalized.get("wide_kernel").unwrap().clone();
    assert_eq!(Legalizer::new(&target).legalize_func(&mut kernel).unwrap(), 0);
}

#[test]
fn test_tail_is_legal_after_full_pipeline() {
    let target = TargetConfig::default();
    let mut module = pipeliner::parse(WIDE).unwrap();
    quick_optimize(&mut module).unwrap();
    let mut tail = module.get("wide_kernel_tail").unwrap().clone();
    assert_eq!(tail.role, FuncRole::Tail);
    assert_eq!(Legalizer::new(&target).legalize_func(&mut tail).unwrap(), 0);
}

#[test]
fn test_multiply_add_scenario() {
    // one multiply-add per iteration, latency 3, one multiplier
    let mut target = TargetConfig::default();
    target.set_latency("fma", 3);
    target.set_capacity(ResourceClass::Mul, 1);
    target.set_capacity(ResourceClass::Mem, 2);

    let original = pipeliner::parse(MADD).unwrap();
    let mut module = original.clone();
    let report = Pipeline::new(PipelineConfig::default().with_target(target.clone()))
        .optimize(&mut module)
        .unwrap();
    assert_eq!(report.schedules.len(), 1);
    let info = report.schedules[0].1;
    assert_eq!(info.res_mii, 1);
    assert_eq!(info.rec_mii, 0);
    assert_eq!(info.ii, 1);
    // load at 0, fma at 3, store at 6
    assert_eq!(info.stage_count, 7);

    // prologue and epilogue each replay StageCount-1 steps
    let (graph, schedule) = scheduled_kernel(MADD, "madd_kernel", &target);
    let stages: Vec<u32> = (0..graph.len()).map(|n| schedule.stage(n)).collect();
    let s = info.stage_count;
    let fill: usize = (0..s - 1).map(|j| stages.iter().filter(|&&st| st <= j).count()).sum();
    let drain: usize = (1..s).map(|j| stages.iter().filter(|&&st| st >= j).count()).sum();
    assert_eq!(info.prologue_ops, fill);
    assert_eq!(info.epilogue_ops, drain);

    let inputs = Inputs { buffers: vec![(0..16).collect(), vec![0; 16]], scalars: vec![4, 1, 10] };
    let mut interp = Interpreter::new(&module);
    let a = interp.alloc(inputs.buffers[0].clone());
    let o = interp.alloc(inputs.buffers[1].clone());
    interp
        .call("madd", &[a, o.clone(), RtValue::Int(4), RtValue::Int(1), RtValue::Int(10)])
        .unwrap();
    assert_eq!(interp.calls("madd_kernel_prologue"), 1);
    assert_eq!(interp.calls("madd_kernel_steady"), 10 - 7 + 1);
    assert_eq!(interp.calls("madd_kernel_epilogue"), 1);
    assert_eq!(interp.calls("madd_kernel_tail"), 0);
    let expected: Vec<i64> = (0..16).map(|x| if x < 10 { 4 * x + 1 } else { 0 }).collect();
    assert_eq!(interp.buffer(&o).unwrap(), &expected[..]);

    assert_eq!(observe(&module, "madd", &inputs), observe(&original, "madd", &inputs));
}

#[test]
fn test_short_trip_count_takes_tail_path() {
    let original = pipeliner::parse(ACCUMULATE).unwrap();
    let mut module = original.clone();
    let report = quick_optimize(&mut module).unwrap();
    assert_eq!(report.schedules[0].1.stage_count, 4);

    let data: Vec<i64> = vec![7, -2, 5, 100, 100];
    let mut interp = Interpreter::new(&module);
    let a = interp.alloc(data.clone());
    let b = interp.alloc(vec![0; data.len()]);
    let out = interp.call("accumulate", &[a, b.clone(), RtValue::Int(3)]).unwrap();

    assert_eq!(out, vec![RtValue::Int(2 * (7 - 2 + 5))]);
    assert_eq!(interp.buffer(&b).unwrap(), &[14, -4, 10, 0, 0][..]);
    assert_eq!(interp.calls("accumulate_kernel_tail"), 3);
    for generated in ["prologue", "steady", "epilogue"] {
        assert_eq!(interp.calls(&format!("accumulate_kernel_{}", generated)), 0);
    }
}

#[test]
fn test_pipelined_module_shape() {
    let mut module = pipeliner::parse(ACCUMULATE).unwrap();
    quick_optimize(&mut module).unwrap();
    let func = module.get("accumulate").unwrap();
    // no test-before-body loops remain
    assert!(loops::all_loops(func).is_empty());
    let printed = print_func(func);
    assert!(printed.contains("do_while"));
    assert!(printed.contains("@accumulate_kernel_steady"));

    for (name, role) in [
        ("accumulate_kernel_prologue", FuncRole::Prologue),
        ("accumulate_kernel_steady", FuncRole::Steady),
        ("accumulate_kernel_epilogue", FuncRole::Epilogue),
        ("accumulate_kernel_tail", FuncRole::Tail),
    ] {
        assert_eq!(module.get(name).map(|f| f.role), Some(role), "@{}", name);
    }
}

#[test]
fn test_infeasible_schedule_leaves_function_untouched() {
    // no memory port at all, and no room above II0
    let mut target = TargetConfig::default();
    target.max_ii_offset = 0;
    target.set_capacity(ResourceClass::Mem, 0);

    let original = pipeliner::parse(MADD).unwrap();
    let mut module = original.clone();
    let report = Pipeline::new(PipelineConfig::default().with_target(target))
        .optimize(&mut module)
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, TransformErrorKind::SchedulingInfeasible);
    assert_eq!(report.failures[0].function.as_deref(), Some("madd_kernel"));
    assert!(report.schedules.is_empty());
    assert_eq!(print_module(&module), print_module(&original));
}

#[test]
fn test_cli_config_roundtrip() {
    let mut target = TargetConfig::default();
    target.set_capacity(ResourceClass::Mem, 3);
    target.max_ii_offset = 5;
    let parsed = TargetConfig::from_json(&target.to_json()).unwrap();
    assert_eq!(parsed, target);
    assert!(TargetConfig::from_json("{\"native_vector_bits\": 96}").unwrap().validate().is_err());
}
