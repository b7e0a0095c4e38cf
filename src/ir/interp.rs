//! Reference interpreter.
//!
//! Executes module functions on integer data with wrapping arithmetic at the
//! element width of each result. Used to check that transformations
//! preserve observable results: returned values and buffer contents.

use crate::ir::function::{BlockId, Func, Module, OpId, ValueId};
use crate::ir::ops::OpKind;
use crate::ir::types::Type;
use crate::utils::errors::{ExecError, ExecErrorKind};
use log::trace;
use std::collections::HashMap;
use std::fmt;

/// Default number of operations a single `call` may execute.
pub const DEFAULT_FUEL: u64 = 10_000_000;

/// A runtime value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtValue {
    /// Index, scalar or `i1` (0 or 1)
    Int(i64),
    Vector(Vec<i64>),
    /// Handle into the interpreter's buffer table
    Buffer(usize),
}

impl RtValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RtValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn lanes(&self) -> Vec<i64> {
        match self {
            RtValue::Int(v) => vec![*v],
            RtValue::Vector(v) => v.clone(),
            RtValue::Buffer(_) => Vec::new(),
        }
    }
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtValue::Int(v) => write!(f, "{}", v),
            RtValue::Vector(v) => {
                let lanes: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "<{}>", lanes.join(", "))
            }
            RtValue::Buffer(h) => write!(f, "buffer#{}", h),
        }
    }
}

/// Truncate raw lane values to the width of `ty`.
fn wrap(ty: Type, lanes: Vec<i64>) -> RtValue {
    match ty {
        Type::Vector { elem, .. } => RtValue::Vector(lanes.into_iter().map(|x| elem.wrap(x)).collect()),
        Type::Scalar(elem) => RtValue::Int(elem.wrap(lanes[0])),
        Type::Bool => RtValue::Int((lanes[0] != 0) as i64),
        _ => RtValue::Int(lanes[0]),
    }
}

/// Executes functions of one module against a private buffer table.
pub struct Interpreter<'m> {
    module: &'m Module,
    buffers: Vec<Vec<i64>>,
    call_counts: HashMap<String, usize>,
    fuel: u64,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            buffers: Vec::new(),
            call_counts: HashMap::new(),
            fuel: DEFAULT_FUEL,
        }
    }

    /// Limit the number of operations executed by each top-level `call`.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Allocate a buffer and return its handle.
    pub fn alloc(&mut self, data: Vec<i64>) -> RtValue {
        self.buffers.push(data);
        RtValue::Buffer(self.buffers.len() - 1)
    }

    /// Contents of a buffer.
    pub fn buffer(&self, handle: &RtValue) -> Option<&[i64]> {
        match handle {
            RtValue::Buffer(h) => self.buffers.get(*h).map(|b| b.as_slice()),
            _ => None,
        }
    }

    /// How many times `name` has been entered.
    pub fn calls(&self, name: &str) -> usize {
        self.call_counts.get(name).copied().unwrap_or(0)
    }

    /// Run a function to completion.
    pub fn call(&mut self, name: &str, args: &[RtValue]) -> Result<Vec<RtValue>, ExecError> {
        let mut fuel = self.fuel;
        self.invoke(name, args, &mut fuel)
    }

    fn invoke(&mut self, name: &str, args: &[RtValue], fuel: &mut u64) -> Result<Vec<RtValue>, ExecError> {
        let module = self.module;
        let func = module.get(name).ok_or_else(|| {
            ExecError::new(ExecErrorKind::UnknownFunction, format!("no function named @{}", name))
        })?;
        if func.params().len() != args.len() {
            return Err(ExecError::new(
                ExecErrorKind::BadArguments,
                format!("@{} takes {} arguments, got {}", name, func.params().len(), args.len()),
            ));
        }
        *self.call_counts.entry(name.to_string()).or_insert(0) += 1;
        trace!("enter @{}", name);

        let mut frame = Frame { func, env: HashMap::new() };
        frame.bind(func.params(), args.to_vec());
        self.run_block(&mut frame, func.entry(), fuel)
    }

    /// Execute a block and return the operands of its terminator.
    fn run_block(&mut self, frame: &mut Frame<'m>, block: BlockId, fuel: &mut u64) -> Result<Vec<RtValue>, ExecError> {
        let func = frame.func;
        for &op in &func.block(block).ops {
            if *fuel == 0 {
                return Err(ExecError::new(ExecErrorKind::FuelExhausted, "operation budget exhausted"));
            }
            *fuel -= 1;
            if func.op(op).kind.is_terminator() {
                return Ok(frame.get_all(&func.op(op).operands));
            }
            let results = self.run_op(frame, op, fuel)?;
            frame.bind(&func.op(op).results, results);
        }
        Ok(Vec::new())
    }

    fn run_op(&mut self, frame: &mut Frame<'m>, id: OpId, fuel: &mut u64) -> Result<Vec<RtValue>, ExecError> {
        let func = frame.func;
        let op = func.op(id);
        let args = frame.get_all(&op.operands);
        let result_ty = op.results.first().map(|&r| func.value_type(r));
        let int = |v: &RtValue| -> Result<i64, ExecError> {
            v.as_int().ok_or_else(|| ExecError::new(ExecErrorKind::BadArguments, format!("{} expects a scalar", op.kind)))
        };

        let value = match &op.kind {
            OpKind::Const(c) => {
                let ty = result_ty.unwrap_or(Type::Index);
                wrap(ty, vec![*c; ty.lanes() as usize])
            }
            OpKind::Binary(bin) => {
                let (a, b) = (args[0].lanes(), args[1].lanes());
                let lanes = a.iter().zip(&b).map(|(&x, &y)| bin.eval(x, y)).collect();
                wrap(result_ty.unwrap_or(Type::Index), lanes)
            }
            OpKind::Fma => {
                let (a, b, c) = (args[0].lanes(), args[1].lanes(), args[2].lanes());
                let lanes = (0..a.len())
                    .map(|i| a[i].wrapping_mul(b[i]).wrapping_add(c[i]))
                    .collect();
                wrap(result_ty.unwrap_or(Type::Index), lanes)
            }
            OpKind::Cmp(pred) => RtValue::Int(pred.eval(int(&args[0])?, int(&args[1])?) as i64),
            OpKind::Broadcast => {
                let ty = result_ty.unwrap_or(Type::Index);
                wrap(ty, vec![int(&args[0])?; ty.lanes() as usize])
            }
            OpKind::Reduce(bin) => {
                let lanes = args[0].lanes();
                let ty = result_ty.unwrap_or(Type::Index);
                let mut acc = lanes[0];
                for &x in &lanes[1..] {
                    acc = ty.elem().map(|e| e.wrap(bin.eval(acc, x))).unwrap_or_else(|| bin.eval(acc, x));
                }
                wrap(ty, vec![acc])
            }
            OpKind::Slice(offset) => {
                let lanes = args[0].lanes();
                let n = result_ty.map(|t| t.lanes()).unwrap_or(1) as usize;
                let start = *offset as usize;
                RtValue::Vector(lanes[start..start + n].to_vec())
            }
            OpKind::Concat => RtValue::Vector(args.iter().flat_map(|a| a.lanes()).collect()),
            OpKind::Copy => args[0].clone(),
            OpKind::Load => {
                let ty = result_ty.unwrap_or(Type::Index);
                let data = self.load(&args[0], int(&args[1])?, ty.lanes() as usize)?;
                wrap(ty, data)
            }
            OpKind::Store => {
                let ty = func.value_type(op.operands[0]);
                let lanes: Vec<i64> = args[0].lanes();
                let lanes = wrap(ty, lanes).lanes();
                self.store(&args[1], int(&args[2])?, &lanes)?;
                return Ok(Vec::new());
            }
            OpKind::Call(callee) => return self.invoke(callee, &args, fuel),
            OpKind::For { .. } => {
                let (lb, ub, step) = (int(&args[0])?, int(&args[1])?, int(&args[2])?);
                let n_carried = op.results.len();
                let mut carried: Vec<RtValue> = args[3..3 + n_carried].to_vec();
                let body = op.regions[0];
                let mut iv = lb;
                while iv < ub {
                    let mut block_args = vec![RtValue::Int(iv)];
                    block_args.extend(carried);
                    frame.bind(&func.block(body).args, block_args);
                    carried = self.run_block(frame, body, fuel)?;
                    iv = iv.wrapping_add(step);
                }
                return Ok(carried);
            }
            OpKind::DoWhile => {
                let body = op.regions[0];
                let mut values = args;
                loop {
                    frame.bind(&func.block(body).args, values);
                    let mut out = self.run_block(frame, body, fuel)?;
                    let cond = out.remove(0);
                    values = out;
                    if int(&cond)? == 0 {
                        return Ok(values);
                    }
                }
            }
            OpKind::If => {
                let region = if int(&args[0])? != 0 { op.regions[0] } else { op.regions[1] };
                return self.run_block(frame, region, fuel);
            }
            OpKind::Yield | OpKind::Condition | OpKind::Return => return Ok(args),
        };
        Ok(vec![value])
    }

    fn buffer_slot(&self, handle: &RtValue, index: i64, len: usize) -> Result<(usize, usize), ExecError> {
        let RtValue::Buffer(h) = handle else {
            return Err(ExecError::new(ExecErrorKind::BadArguments, "memory access through a non-buffer"));
        };
        let size = self.buffers.get(*h).map(|b| b.len()).unwrap_or(0);
        if index < 0 || index as usize + len > size {
            return Err(ExecError::new(
                ExecErrorKind::OutOfBounds,
                format!("access [{}, {}) outside buffer#{} of length {}", index, index + len as i64, h, size),
            ));
        }
        Ok((*h, index as usize))
    }

    fn load(&mut self, handle: &RtValue, index: i64, len: usize) -> Result<Vec<i64>, ExecError> {
        let (h, start) = self.buffer_slot(handle, index, len)?;
        Ok(self.buffers[h][start..start + len].to_vec())
    }

    fn store(&mut self, handle: &RtValue, index: i64, lanes: &[i64]) -> Result<(), ExecError> {
        let (h, start) = self.buffer_slot(handle, index, lanes.len())?;
        self.buffers[h][start..start + lanes.len()].copy_from_slice(lanes);
        Ok(())
    }
}

/// Values of one function activation.
struct Frame<'m> {
    func: &'m Func,
    env: HashMap<ValueId, RtValue>,
}

impl<'m> Frame<'m> {
    fn bind(&mut self, names: &[ValueId], values: Vec<RtValue>) {
        for (&name, value) in names.iter().zip(values) {
            self.env.insert(name, value);
        }
    }

    fn get_all(&self, values: &[ValueId]) -> Vec<RtValue> {
        // The verifier guarantees every operand is bound before use.
        values.iter().map(|v| self.env.get(v).cloned().unwrap_or(RtValue::Int(0))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;

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

    #[test]
    fn test_dot_product() {
        let module = parse(DOT).unwrap();
        let mut interp = Interpreter::new(&module);
        let a = interp.alloc(vec![1, 2, 3, 4]);
        let b = interp.alloc(vec![5, 6, 7, 8]);
        let out = interp.call("dot", &[a, b, RtValue::Int(4)]).unwrap();
        assert_eq!(out, vec![RtValue::Int(70)]);
        assert_eq!(interp.calls("dot"), 1);
    }

    #[test]
    fn test_zero_trip_count() {
        let module = parse(DOT).unwrap();
        let mut interp = Interpreter::new(&module);
        let a = interp.alloc(vec![]);
        let b = interp.alloc(vec![]);
        let out = interp.call("dot", &[a, b, RtValue::Int(0)]).unwrap();
        assert_eq!(out, vec![RtValue::Int(0)]);
    }

    #[test]
    fn test_out_of_bounds() {
        let module = parse(DOT).unwrap();
        let mut interp = Interpreter::new(&module);
        let a = interp.alloc(vec![1]);
        let b = interp.alloc(vec![1]);
        let err = interp.call("dot", &[a, b, RtValue::Int(2)]).unwrap_err();
        assert_eq!(err.kind, ExecErrorKind::OutOfBounds);
    }

    #[test]
    fn test_wrapping_and_vectors() {
        let source = r#"
            func @f(%buf: buffer<i8>) -> (i8) {
              %i = const[0]() : index
              %v = load(%buf, %i) : vector<4xi8>
              %c = const[100]() : vector<4xi8>
              %s = add(%v, %c) : vector<4xi8>
              store(%s, %buf, %i)
              %r = reduce[max](%s) : i8
              return(%r)
            }
        "#;
        let module = parse(source).unwrap();
        let mut interp = Interpreter::new(&module);
        let buf = interp.alloc(vec![1, 2, 27, 28]);
        let out = interp.call("f", &[buf.clone()]).unwrap();
        assert_eq!(out, vec![RtValue::Int(127)]);
        assert_eq!(interp.buffer(&buf).unwrap(), &[101, 102, 127, -128]);
    }

    #[test]
    fn test_do_while_and_fuel() {
        let source = r#"
            func @count(%n: index) -> (index) {
              %one = const[1]() : index
              %zero = const[0]() : index
              %r = do_while(%zero) : index {
                ^(%k: index):
                %next = add(%k, %one) : index
                %more = cmp[lt](%next, %n) : i1
                condition(%more, %next)
              }
              return(%r)
            }
        "#;
        let module = parse(source).unwrap();
        let mut interp = Interpreter::new(&module);
        assert_eq!(interp.call("count", &[RtValue::Int(5)]).unwrap(), vec![RtValue::Int(5)]);
        // the body runs once even when the condition is false up front
        assert_eq!(interp.call("count", &[RtValue::Int(0)]).unwrap(), vec![RtValue::Int(1)]);

        let mut starved = Interpreter::new(&module).with_fuel(10);
        let err = starved.call("count", &[RtValue::Int(1000)]).unwrap_err();
        assert_eq!(err.kind, ExecErrorKind::FuelExhausted);
    }
}
