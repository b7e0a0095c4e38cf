//! Prologue, steady-state and epilogue generation.
//!
//! Iteration `i` enters stage 0 at step `i`, and op `n` of iteration `i`
//! runs at step `i + stage(n)`. Within a step ops are issued by cycle
//! modulo II, which is the order of their absolute issue times, so running
//! the steps one after another preserves every dependence.
//!
//! A value consumed `d > 0` steps after it was produced travels through a
//! relay slot: at the start of a step, slot `(v, d)` holds the value `v`
//! took `d` steps earlier. The induction variable is relayed like a value
//! produced in stage 0.

use crate::analysis::dependence::DependenceGraph;
use crate::ir::builder::Builder;
use crate::ir::function::{BlockId, Func, OpId, ValueId};
use crate::ir::ops::{FuncRole, OpKind, PipelineInfo};
use crate::ir::types::Type;
use crate::transform::modulo::ModuloSchedule;
use crate::utils::errors::{TransformError, TransformErrorKind};
use std::collections::{BTreeMap, HashMap};

/// Names chosen for the generated functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNames {
    pub prologue: String,
    pub steady: String,
    pub epilogue: String,
}

/// The generated functions and the relay slots they exchange.
#[derive(Debug, Clone)]
pub struct PipelineFunctions {
    pub prologue: Func,
    pub steady: Func,
    pub epilogue: Func,
    pub slot_types: Vec<Type>,
    pub info: PipelineInfo,
}

/// A relayed quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RelayKey {
    Iv,
    Value(ValueId),
}

/// Where a kernel operand comes from.
#[derive(Debug, Clone, Copy)]
enum Source {
    Produced(ValueId),
    Iv,
    Carried(usize),
    LiveIn(usize),
    Const(OpId),
}

fn internal(message: impl Into<String>) -> TransformError {
    TransformError::new(TransformErrorKind::SchedulingInfeasible, "modulo-schedule", message)
}

/// Generate the three functions for a scheduled kernel.
///
/// `kernel` takes `(iv, carried..., live_ins...)`, returns the next carried
/// values as distinct op results and has a straight-line body matching
/// `graph`.
pub fn generate(
    kernel: &Func,
    graph: &DependenceGraph,
    schedule: &ModuloSchedule,
    names: &PipelineNames,
) -> Result<PipelineFunctions, TransformError> {
    let layout = Layout::new(kernel, graph, schedule)?;
    let (mut prologue, prologue_ops) = layout.prologue(&names.prologue)?;
    let mut steady = layout.steady(&names.steady)?;
    let (mut epilogue, epilogue_ops) = layout.epilogue(&names.epilogue)?;

    let info = schedule.info(prologue_ops, epilogue_ops);
    for func in [&mut prologue, &mut steady, &mut epilogue] {
        func.info = Some(info);
    }
    Ok(PipelineFunctions {
        prologue,
        steady,
        epilogue,
        slot_types: layout.slot_types(),
        info,
    })
}

struct Layout<'k> {
    kernel: &'k Func,
    graph: &'k DependenceGraph,
    stages: Vec<u32>,
    stage_count: u32,
    order: Vec<usize>,
    /// Producing node of every node result
    producer: HashMap<ValueId, usize>,
    /// Returned values, one per carried parameter
    carried: Vec<ValueId>,
    num_live_ins: usize,
    slots: Vec<(RelayKey, u32)>,
    slot_index: HashMap<(RelayKey, u32), usize>,
}

impl<'k> Layout<'k> {
    fn new(
        kernel: &'k Func,
        graph: &'k DependenceGraph,
        schedule: &ModuloSchedule,
    ) -> Result<Self, TransformError> {
        let ret = kernel
            .terminator(kernel.entry())
            .ok_or_else(|| internal("kernel has no return"))?;
        let carried = kernel.op(ret).operands.clone();
        let num_live_ins = kernel
            .params()
            .len()
            .checked_sub(1 + carried.len())
            .ok_or_else(|| internal("kernel signature does not match its return"))?;

        let mut producer = HashMap::new();
        for (n, node) in graph.nodes.iter().enumerate() {
            for &r in &kernel.op(node.op).results {
                producer.insert(r, n);
            }
        }

        let mut layout = Self {
            kernel,
            graph,
            stages: (0..graph.len()).map(|n| schedule.stage(n)).collect(),
            stage_count: schedule.stage_count(),
            order: schedule.emission_order(),
            producer,
            carried,
            num_live_ins,
            slots: Vec::new(),
            slot_index: HashMap::new(),
        };
        layout.assign_slots()?;
        Ok(layout)
    }

    /// Depth of every relayed quantity, then one slot per depth: the
    /// induction variable first, then node results in program order.
    fn assign_slots(&mut self) -> Result<(), TransformError> {
        let mut depth: BTreeMap<RelayKey, u32> = BTreeMap::new();
        for n in 0..self.graph.len() {
            for &v in &self.kernel.op(self.graph.nodes[n].op).operands {
                if let Some((key, d)) = self.relay(n, self.source(v)?)? {
                    let entry = depth.entry(key).or_insert(0);
                    *entry = (*entry).max(d);
                }
            }
        }
        // the epilogue reads the last carried values from the slots
        for &w in &self.carried {
            if self.stage_of(RelayKey::Value(w)) == 0 {
                let entry = depth.entry(RelayKey::Value(w)).or_insert(0);
                *entry = (*entry).max(1);
            }
        }

        let mut keys = vec![RelayKey::Iv];
        for node in &self.graph.nodes {
            keys.extend(self.kernel.op(node.op).results.iter().map(|&r| RelayKey::Value(r)));
        }
        for key in keys {
            for d in 1..=depth.get(&key).copied().unwrap_or(0) {
                self.slot_index.insert((key, d), self.slots.len());
                self.slots.push((key, d));
            }
        }
        Ok(())
    }

    fn source(&self, v: ValueId) -> Result<Source, TransformError> {
        if self.producer.contains_key(&v) {
            return Ok(Source::Produced(v));
        }
        let m = self.carried.len();
        if let Some(p) = self.kernel.params().iter().position(|&x| x == v) {
            return Ok(match p {
                0 => Source::Iv,
                p if p <= m => Source::Carried(p - 1),
                p => Source::LiveIn(p - 1 - m),
            });
        }
        match self.kernel.defining_op(v) {
            Some(op) if matches!(self.kernel.op(op).kind, OpKind::Const(_)) => Ok(Source::Const(op)),
            _ => Err(internal(format!("operand {} is not visible to the schedule", v))),
        }
    }

    fn stage_of(&self, key: RelayKey) -> u32 {
        match key {
            RelayKey::Iv => 0,
            RelayKey::Value(v) => self.producer.get(&v).map_or(0, |&n| self.stages[n]),
        }
    }

    /// Quantity and step distance a consumer `n` reads for `source`.
    fn relay(&self, n: usize, source: Source) -> Result<Option<(RelayKey, u32)>, TransformError> {
        let s_n = self.stages[n] as i64;
        let (key, d) = match source {
            Source::Produced(v) => (RelayKey::Value(v), s_n - self.stage_of(RelayKey::Value(v)) as i64),
            Source::Iv => (RelayKey::Iv, s_n),
            Source::Carried(k) => {
                let key = RelayKey::Value(self.carried[k]);
                (key, s_n + 1 - self.stage_of(key) as i64)
            }
            Source::LiveIn(_) | Source::Const(_) => return Ok(None),
        };
        if d < 0 {
            return Err(internal(format!("n{} reads a value from a later stage", n)));
        }
        Ok(Some((key, d as u32)))
    }

    fn slot_type(&self, key: RelayKey) -> Type {
        match key {
            RelayKey::Iv => Type::Index,
            RelayKey::Value(v) => self.kernel.value_type(v),
        }
    }

    fn slot_types(&self) -> Vec<Type> {
        self.slots.iter().map(|&(key, _)| self.slot_type(key)).collect()
    }

    fn carried_types(&self) -> Vec<Type> {
        self.carried.iter().map(|&w| self.kernel.value_type(w)).collect()
    }

    fn live_in_types(&self) -> Vec<Type> {
        let params = self.kernel.params();
        params[params.len() - self.num_live_ins..]
            .iter()
            .map(|&p| self.kernel.value_type(p))
            .collect()
    }

    fn emitter(&self, name: &str, params: &[Type], results: Vec<Type>, role: FuncRole) -> Emitter<'k> {
        let func = Func::new(name, params, results).with_role(role);
        let block = func.entry();
        let live_ins = func.params()[params.len() - self.num_live_ins..].to_vec();
        Emitter {
            kernel: self.kernel,
            func,
            block,
            live_ins,
            consts: HashMap::new(),
            emitted: 0,
        }
    }

    /// Clone node `n`, resolving produced, induction and carried operands
    /// through `resolve`.
    fn emit_node<F>(&self, em: &mut Emitter<'k>, n: usize, mut resolve: F) -> Result<Vec<ValueId>, TransformError>
    where
        F: FnMut(&mut Emitter<'k>, Source) -> Result<ValueId, TransformError>,
    {
        let op = self.graph.nodes[n].op;
        let mut operands = Vec::new();
        for &v in &self.kernel.op(op).operands {
            let value = match self.source(v)? {
                Source::Const(c) => em.constant(c),
                Source::LiveIn(j) => em.live_ins[j],
                source => resolve(em, source)?,
            };
            operands.push(value);
        }
        Ok(em.clone_node(op, operands))
    }

    /// Steps `0..S-1`: iterations `0..S-1` fill the pipeline.
    fn prologue(&self, name: &str) -> Result<(Func, usize), TransformError> {
        let m = self.carried.len();
        let mut params = vec![Type::Index, Type::Index];
        params.extend(self.carried_types());
        params.extend(self.live_in_types());
        let mut em = self.emitter(name, &params, self.slot_types(), FuncRole::Prologue);
        let args = em.func.params().to_vec();
        let (lb, step) = (args[0], args[1]);
        let inits = args[2..2 + m].to_vec();

        let mut ivs = vec![lb];
        let mut env: HashMap<(RelayKey, i64), ValueId> = HashMap::new();
        let stage_count = self.stage_count as i64;
        for j in 0..stage_count - 1 {
            for &n in &self.order {
                let s = self.stages[n] as i64;
                if s > j {
                    continue;
                }
                let i = j - s;
                let results = self.emit_node(&mut em, n, |em, source| match source {
                    Source::Iv => Ok(em.induction(&mut ivs, step, i)),
                    Source::Produced(v) => lookup(&env, RelayKey::Value(v), i),
                    Source::Carried(k) if i == 0 => Ok(inits[k]),
                    Source::Carried(k) => lookup(&env, RelayKey::Value(self.carried[k]), i - 1),
                    _ => Err(internal("unexpected operand source")),
                })?;
                self.record(&mut env, n, i, results);
            }
        }

        let mut out = Vec::with_capacity(self.slots.len());
        for &(key, d) in &self.slots {
            let i = stage_count - 1 - d as i64 - self.stage_of(key) as i64;
            let value = match key {
                RelayKey::Iv if i >= 0 => em.induction(&mut ivs, step, i),
                RelayKey::Value(_) if i >= 0 => lookup(&env, key, i)?,
                // iteration -1 only exists for carried values: the inits
                RelayKey::Value(v) if i == -1 => match self.carried.iter().position(|&w| w == v) {
                    Some(k) => inits[k],
                    None => return Err(internal(format!("slot of {} precedes the first iteration", v))),
                },
                _ => return Err(internal("slot precedes the first iteration")),
            };
            out.push(value);
        }
        let emitted = em.emitted;
        Ok((em.finish(out), emitted))
    }

    /// One step of the filled pipeline.
    fn steady(&self, name: &str) -> Result<Func, TransformError> {
        let mut params = vec![Type::Index];
        params.extend(self.slot_types());
        params.extend(self.live_in_types());
        let mut em = self.emitter(name, &params, self.slot_types(), FuncRole::Steady);
        let args = em.func.params().to_vec();
        let iv = args[0];
        let slot_args = args[1..1 + self.slots.len()].to_vec();

        let mut current: HashMap<ValueId, ValueId> = HashMap::new();
        for &n in &self.order {
            let results = self.emit_node(&mut em, n, |_, source| {
                let (key, d) = self
                    .relay(n, source)?
                    .ok_or_else(|| internal("unexpected operand source"))?;
                match (key, d) {
                    (RelayKey::Iv, 0) => Ok(iv),
                    (RelayKey::Value(v), 0) => current
                        .get(&v)
                        .copied()
                        .ok_or_else(|| internal(format!("{} read before it is computed", v))),
                    _ => self.slot(&slot_args, key, d),
                }
            })?;
            let op = self.graph.nodes[n].op;
            for (&r, v) in self.kernel.op(op).results.iter().zip(results) {
                current.insert(r, v);
            }
        }

        let mut out = Vec::with_capacity(self.slots.len());
        for &(key, d) in &self.slots {
            let value = match (key, d) {
                (RelayKey::Iv, 1) => iv,
                (RelayKey::Value(v), 1) => current
                    .get(&v)
                    .copied()
                    .ok_or_else(|| internal(format!("{} is never computed", v)))?,
                _ => self.slot(&slot_args, key, d - 1)?,
            };
            out.push(value);
        }
        Ok(em.finish(out))
    }

    /// Steps `tc..tc+S-1`: drain the iterations still in flight. Iterations
    /// are numbered relative to the last one, which is 0.
    fn epilogue(&self, name: &str) -> Result<(Func, usize), TransformError> {
        let mut params = self.slot_types();
        params.extend(self.live_in_types());
        let mut em = self.emitter(name, &params, self.carried_types(), FuncRole::Epilogue);
        let args = em.func.params().to_vec();

        let mut env: HashMap<(RelayKey, i64), ValueId> = HashMap::new();
        for (&(key, d), &arg) in self.slots.iter().zip(&args) {
            env.insert((key, 1 - d as i64 - self.stage_of(key) as i64), arg);
        }

        for e in 0..self.stage_count as i64 - 1 {
            for &n in &self.order {
                let s = self.stages[n] as i64;
                if s < e + 1 {
                    continue;
                }
                let r = 1 + e - s;
                let results = self.emit_node(&mut em, n, |_, source| match source {
                    Source::Iv => lookup(&env, RelayKey::Iv, r),
                    Source::Produced(v) => lookup(&env, RelayKey::Value(v), r),
                    Source::Carried(k) => lookup(&env, RelayKey::Value(self.carried[k]), r - 1),
                    _ => Err(internal("unexpected operand source")),
                })?;
                self.record(&mut env, n, r, results);
            }
        }

        let out = self
            .carried
            .iter()
            .map(|&w| lookup(&env, RelayKey::Value(w), 0))
            .collect::<Result<Vec<_>, _>>()?;
        let emitted = em.emitted;
        Ok((em.finish(out), emitted))
    }

    fn slot(&self, slot_args: &[ValueId], key: RelayKey, d: u32) -> Result<ValueId, TransformError> {
        self.slot_index
            .get(&(key, d))
            .map(|&index| slot_args[index])
            .ok_or_else(|| internal(format!("no relay slot for {:?} at depth {}", key, d)))
    }

    fn record(&self, env: &mut HashMap<(RelayKey, i64), ValueId>, n: usize, iteration: i64, results: Vec<ValueId>) {
        let op = self.graph.nodes[n].op;
        for (&r, v) in self.kernel.op(op).results.iter().zip(results) {
            env.insert((RelayKey::Value(r), iteration), v);
        }
    }
}

fn lookup(
    env: &HashMap<(RelayKey, i64), ValueId>,
    key: RelayKey,
    iteration: i64,
) -> Result<ValueId, TransformError> {
    env.get(&(key, iteration))
        .copied()
        .ok_or_else(|| internal(format!("{:?} of iteration {} is not available", key, iteration)))
}

/// Appends cloned kernel ops to a generated function.
struct Emitter<'k> {
    kernel: &'k Func,
    func: Func,
    block: BlockId,
    live_ins: Vec<ValueId>,
    /// Kernel constants already rematerialized
    consts: HashMap<OpId, ValueId>,
    /// Scheduled ops emitted so far
    emitted: usize,
}

impl<'k> Emitter<'k> {
    fn constant(&mut self, op: OpId) -> ValueId {
        if let Some(&v) = self.consts.get(&op) {
            return v;
        }
        let kernel = self.kernel;
        let data = kernel.op(op);
        let ty = kernel.value_type(data.results[0]);
        let v = Builder::at_end(&mut self.func, self.block).value(data.kind.clone(), Vec::new(), ty);
        self.consts.insert(op, v);
        v
    }

    fn clone_node(&mut self, op: OpId, operands: Vec<ValueId>) -> Vec<ValueId> {
        let kernel = self.kernel;
        let data = kernel.op(op);
        let types: Vec<Type> = data.results.iter().map(|&r| kernel.value_type(r)).collect();
        let new = self.func.append_op(self.block, data.kind.clone(), operands, &types, Vec::new());
        self.emitted += 1;
        self.func.op(new).results.clone()
    }

    /// `lb + i * step`, as a chain of additions built on demand.
    fn induction(&mut self, ivs: &mut Vec<ValueId>, step: ValueId, i: i64) -> ValueId {
        while ivs.len() <= i as usize {
            let last = ivs[ivs.len() - 1];
            let next = Builder::at_end(&mut self.func, self.block).add(last, step);
            ivs.push(next);
        }
        ivs[i as usize]
    }

    fn finish(mut self, returned: Vec<ValueId>) -> Func {
        Builder::at_end(&mut self.func, self.block).ret(returned);
        self.func
    }
}
