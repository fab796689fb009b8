//! Register VM.
//!
//! Calls never recurse natively: the active call chain is an explicit stack
//! of frames and the dispatch loop switches between them. `APPLYTC` replaces
//! the current frame in place, so tail recursion runs in constant depth.
//! `YIELD` hands the whole chain back to the host as a [`Suspension`].

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::bytecode::{Constant, Insn, OwnOp, Pc, Program, Reg, UnitId};
use crate::closure::{Closure, GroupId};
use crate::config::RunOptions;
use crate::ir::{BinOp, Ty};
use crate::value::{Heap, Object, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("value is not a function")]
    NotAFunction,
    #[error("function takes {expected} arguments, got {got}")]
    Arity { expected: u32, got: usize },
}

type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub calls: u64,
    pub tail_calls: u64,
    /// Deepest call chain observed, in frames.
    pub max_depth: usize,
}

#[derive(Debug)]
struct Frame {
    unit: UnitId,
    pc: Pc,
    regs: Vec<Value>,
    /// Owned references to the arguments.
    args: Vec<Value>,
    /// Owned reference to the running closure; `None` for the entry unit.
    closure: Option<Value>,
    /// Caller register receiving the result; `None` returns to the host.
    ret: Option<Reg>,
    scopes: Vec<GroupId>,
}

/// A call chain stopped at `YIELD`. Resuming continues with the
/// instruction after it.
#[derive(Debug)]
pub struct Suspension {
    frames: Vec<Frame>,
}

impl Suspension {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Values handed to the host carry one reference owned by the host; give it
/// back with [`Vm::release`].
#[derive(Debug)]
pub enum Outcome {
    Returned(Value),
    Yielded(Value, Suspension),
}

pub struct Vm<'p> {
    program: &'p Program,
    heap: Heap,
    consts: Vec<Value>,
    stack: Vec<Value>,
    opts: RunOptions,
    stats: VmStats,
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        for v in std::mem::take(&mut self.stack) {
            self.heap.unref(v);
        }
        for v in std::mem::take(&mut self.consts) {
            self.heap.unref(v);
        }
    }
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self::with_options(program, RunOptions::default())
    }

    /// Load a program: heap constants are allocated once and owned by the pool.
    pub fn with_options(program: &'p Program, opts: RunOptions) -> Self {
        let mut heap = Heap::new();
        let consts = program
            .consts
            .iter()
            .map(|k| {
                let v = match k {
                    Constant::Nil | Constant::Undefined(_) => Value::Nil,
                    Constant::Bool(b) => Value::Bool(*b),
                    Constant::Num(n) => Value::Num(*n),
                    Constant::Str(s) => heap.alloc_str(s.clone()),
                    Constant::Closure(unit) => heap.alloc_closure(*unit),
                };
                heap.acquire(v);
                v
            })
            .collect();
        Vm { program, heap, consts, stack: Vec::with_capacity(64), opts, stats: VmStats::default() }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub fn render(&self, v: Value) -> String {
        self.heap.render(v, &self.program.types)
    }

    /// Give back a reference obtained from an [`Outcome`].
    pub fn release(&mut self, v: Value) {
        self.heap.unref(v);
    }

    /// A fresh string for host arguments. It is unowned until passed to a call.
    pub fn string(&mut self, s: impl Into<String>) -> Value {
        self.heap.alloc_str(s)
    }

    /// Evaluate the entry unit.
    pub fn run(&mut self) -> Outcome {
        let frame = self.frame(self.program.entry, Vec::new(), None, None);
        self.stats.max_depth = self.stats.max_depth.max(1);
        self.execute(Vec::new(), frame)
    }

    /// Call a function value from the host. The call holds its own
    /// references to `f` and `args` while it runs.
    pub fn call(&mut self, f: Value, args: &[Value]) -> VmResult<Outcome> {
        let unit = self.callable(f, args.len()).map_err(|tag| match tag {
            "arity-error" => {
                let expected = self.heap.closure(f).map_or(0, |c| self.program.unit(c.unit).arity);
                VmError::Arity { expected, got: args.len() }
            }
            _ => VmError::NotAFunction,
        })?;
        self.heap.acquire(f);
        for &a in args {
            self.heap.acquire(a);
        }
        let frame = self.frame(unit, args.to_vec(), Some(f), None);
        self.stats.calls += 1;
        self.stats.max_depth = self.stats.max_depth.max(1);
        Ok(self.execute(Vec::new(), frame))
    }

    pub fn resume(&mut self, suspension: Suspension) -> Outcome {
        let mut frames = suspension.frames;
        let Some(cur) = frames.pop() else {
            panic!("resumed an empty suspension");
        };
        self.execute(frames, cur)
    }

    fn frame(&self, unit: UnitId, args: Vec<Value>, closure: Option<Value>, ret: Option<Reg>) -> Frame {
        let nregs = self.program.unit(unit).nregs as usize;
        Frame { unit, pc: 0, regs: vec![Value::Nil; nregs], args, closure, ret, scopes: Vec::new() }
    }

    /// The unit `f` runs when called with `nargs` arguments, or the error tag.
    fn callable(&self, f: Value, nargs: usize) -> Result<UnitId, &'static str> {
        match self.heap.closure(f) {
            Some(c) if c.is_finalized() => {
                if self.program.unit(c.unit).arity as usize == nargs {
                    Ok(c.unit)
                } else {
                    Err("arity-error")
                }
            }
            _ => Err("not-a-function"),
        }
    }

    fn pop_args(&mut self, nargs: u32) -> Vec<Value> {
        let at = self.stack.len().checked_sub(nargs as usize).unwrap_or_else(|| {
            panic!("argument stack holds {} values, call wants {nargs}", self.stack.len())
        });
        self.stack.split_off(at)
    }

    /// Finish the current frame with `v`, which carries one reference.
    /// Returns the outcome when control leaves the VM.
    fn leave(&mut self, frames: &mut Vec<Frame>, cur: &mut Frame, v: Value) -> Option<Outcome> {
        for a in std::mem::take(&mut cur.args) {
            self.heap.unref(a);
        }
        if let Some(f) = cur.closure.take() {
            self.heap.unref(f);
        }
        let ret = cur.ret;
        let Some(caller) = frames.pop() else {
            return Some(Outcome::Returned(v));
        };
        self.heap.release(v);
        *cur = caller;
        let Some(dst) = ret else {
            panic!("frame returning into a caller has no result register");
        };
        cur.regs[dst.0 as usize] = v;
        None
    }

    fn execute(&mut self, mut frames: Vec<Frame>, mut cur: Frame) -> Outcome {
        let program = self.program;

        macro_rules! reg {
            ($r:expr) => {
                cur.regs[$r.0 as usize]
            };
        }

        loop {
            let insn = &program.unit(cur.unit).code[cur.pc];
            cur.pc += 1;
            match insn {
                Insn::Nop | Insn::Phi { .. } => {}
                Insn::End => {
                    if let Some(out) = self.leave(&mut frames, &mut cur, Value::Nil) {
                        return out;
                    }
                }
                Insn::Const { dst, k } => {
                    let v = match &program.consts[k.0 as usize] {
                        Constant::Undefined(tag) => self.heap.undefined(tag.clone()),
                        _ => self.consts[k.0 as usize],
                    };
                    reg!(dst) = v;
                }
                Insn::Param { dst, idx } => reg!(dst) = cur.args[*idx as usize],
                Insn::LoadCap { dst, idx } => {
                    let Some(c) = cur.closure.and_then(|f| self.heap.closure(f)) else {
                        panic!("LDCAP outside a closure in unit{}", cur.unit.0);
                    };
                    reg!(dst) = c.caps[*idx as usize];
                }
                Insn::Var { dst, src } => {
                    let v = reg!(src);
                    self.heap.acquire(v);
                    reg!(dst) = self.heap.alloc(Object::Cell(v));
                }
                Insn::Deref { dst, cell } => {
                    reg!(dst) = match reg!(cell).as_obj().map(|r| self.heap.get(r)) {
                        Some(Object::Cell(v)) => *v,
                        _ => panic!("DEREF of a non-cell"),
                    };
                }
                Insn::Set { cell, src } => {
                    let v = reg!(src);
                    self.heap.acquire(v);
                    let old = match reg!(cell).as_obj().map(|r| self.heap.get_mut(r)) {
                        Some(Object::Cell(slot)) => std::mem::replace(slot, v),
                        _ => panic!("SET of a non-cell"),
                    };
                    self.heap.unref(old);
                }
                Insn::Binop { op, dst, lhs, rhs, checked } => {
                    reg!(dst) = self.binop(*op, reg!(lhs), reg!(rhs), *checked);
                }
                Insn::Test { dst, src } => reg!(dst) = Value::Bool(reg!(src).truthy()),
                Insn::TestTy { dst, src, ty } => reg!(dst) = Value::Bool(self.has_type(reg!(src), *ty)),
                Insn::SetFlag { dst, value } => reg!(dst) = Value::Bool(*value),
                Insn::Field { dst, src, idx } => reg!(dst) = self.field(reg!(src), *idx as usize),
                Insn::New { dst, ty, fields } => {
                    let values: Vec<Value> = fields.iter().map(|r| reg!(r)).collect();
                    for &v in &values {
                        self.heap.acquire(v);
                    }
                    reg!(dst) = self.heap.alloc(Object::Struct { ty: *ty, fields: values });
                }
                Insn::Guard { src, ty } => {
                    let v = reg!(src);
                    if !self.has_type(v, *ty) {
                        panic!("guard failed in unit{}: expected {ty:?}, got {}", cur.unit.0, self.render(v));
                    }
                }
                Insn::If { test, else_ } => {
                    if !reg!(test).truthy() {
                        cur.pc = *else_;
                    }
                }
                Insn::Jmp { target } => cur.pc = *target,
                Insn::Mov { dst, src } => {
                    let v = reg!(src);
                    self.heap.acquire(v);
                    reg!(dst) = v;
                }
                Insn::Push { src } => {
                    let v = reg!(src);
                    self.heap.acquire(v);
                    self.stack.push(v);
                }
                Insn::Apply { dst, func, nargs, checked } => {
                    let args = self.pop_args(*nargs);
                    let f = reg!(func);
                    let unit = match self.callable(f, args.len()) {
                        Ok(_) if frames.len() + 1 >= self.opts.max_frames => Err("stack-overflow"),
                        other => other,
                    };
                    match unit {
                        Ok(unit) => {
                            self.heap.acquire(f);
                            let callee = self.frame(unit, args, Some(f), Some(*dst));
                            frames.push(std::mem::replace(&mut cur, callee));
                            self.stats.calls += 1;
                            self.stats.max_depth = self.stats.max_depth.max(frames.len() + 1);
                        }
                        Err(tag) => {
                            if !checked && tag != "stack-overflow" {
                                panic!("unchecked call in unit{} failed: {tag}", cur.unit.0);
                            }
                            for a in args {
                                self.heap.unref(a);
                            }
                            reg!(dst) = self.heap.undefined(tag);
                        }
                    }
                }
                Insn::ApplyTc { func, nargs } => {
                    let args = self.pop_args(*nargs);
                    let f = reg!(func);
                    match self.callable(f, args.len()) {
                        Ok(unit) => {
                            let old_args = std::mem::replace(&mut cur.args, args);
                            let old_closure = cur.closure.replace(f);
                            for a in old_args {
                                self.heap.unref(a);
                            }
                            if let Some(c) = old_closure {
                                self.heap.unref(c);
                            }
                            let nregs = program.unit(unit).nregs as usize;
                            cur.unit = unit;
                            cur.pc = 0;
                            cur.regs.clear();
                            cur.regs.resize(nregs, Value::Nil);
                            cur.scopes.clear();
                            self.stats.tail_calls += 1;
                            trace!(unit = unit.0, "tail call");
                        }
                        Err(tag) => {
                            for a in args {
                                self.heap.unref(a);
                            }
                            self.heap.unref(f);
                            let err = self.heap.undefined(tag);
                            self.heap.acquire(err);
                            if let Some(out) = self.leave(&mut frames, &mut cur, err) {
                                return out;
                            }
                        }
                    }
                }
                Insn::Ret { src } => {
                    let v = reg!(src);
                    if let Some(out) = self.leave(&mut frames, &mut cur, v) {
                        return out;
                    }
                }
                Insn::Yield { src } => {
                    let v = reg!(src);
                    self.heap.acquire(v);
                    debug!(depth = frames.len() + 1, "suspended");
                    frames.push(cur);
                    return Outcome::Yielded(v, Suspension { frames });
                }
                Insn::Trace { src, loc } => {
                    if let Some(r) = reg!(src).as_obj() {
                        if let Object::Undefined { trace, .. } = self.heap.get_mut(r) {
                            trace.push(loc.clone());
                        }
                    }
                }
                Insn::Own { op, reg } => {
                    let v = reg!(reg);
                    match op {
                        OwnOp::Inc => self.heap.acquire(v),
                        OwnOp::Dec => self.heap.release(v),
                        OwnOp::Drop => self.heap.drop_value(v),
                        OwnOp::Unref => self.heap.unref(v),
                    }
                }
                Insn::AllocFn { dst } => {
                    let v = self.heap.alloc(Object::Closure(Closure::shell()));
                    self.heap.acquire(v);
                    reg!(dst) = v;
                }
                Insn::FinFn { dst, unit, caps } => {
                    let values: Vec<Value> = caps.iter().map(|r| reg!(r)).collect();
                    for &v in &values {
                        self.heap.acquire(v);
                    }
                    let Some(r) = reg!(dst).as_obj() else {
                        panic!("FINFN on a non-closure register");
                    };
                    match self.heap.get_mut(r) {
                        Object::Closure(c) => {
                            c.unit = *unit;
                            c.weak = vec![false; values.len()];
                            c.caps = values;
                        }
                        _ => panic!("FINFN on a non-closure value"),
                    }
                    if let Some(&gid) = cur.scopes.last() {
                        self.heap.join_group(gid, r);
                    }
                }
                Insn::BegScp { n } => {
                    let gid = self.heap.open_group(*n);
                    cur.scopes.push(gid);
                }
                Insn::EndScp { .. } => {
                    let Some(gid) = cur.scopes.pop() else {
                        panic!("ENDSCP without an open recursive scope");
                    };
                    self.heap.seal_group(gid);
                }
            }
        }
    }

    fn text(&self, v: Value) -> Option<String> {
        match v.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn binop(&mut self, op: BinOp, a: Value, b: Value, checked: bool) -> Value {
        match op {
            BinOp::Cons => {
                self.heap.acquire(a);
                self.heap.acquire(b);
                return self.heap.alloc(Object::Cons(a, b));
            }
            BinOp::Eq => return Value::Bool(self.heap.equal(a, b)),
            BinOp::Ne => return Value::Bool(!self.heap.equal(a, b)),
            _ => {}
        }
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            return match op {
                BinOp::Add => Value::Num(x + y),
                BinOp::Sub => Value::Num(x - y),
                BinOp::Mul => Value::Num(x * y),
                BinOp::Div => Value::Num(x / y),
                BinOp::Mod => Value::Num(x % y),
                BinOp::Lt => Value::Bool(x < y),
                BinOp::Le => Value::Bool(x <= y),
                BinOp::Gt => Value::Bool(x > y),
                BinOp::Ge => Value::Bool(x >= y),
                BinOp::Eq | BinOp::Ne | BinOp::Cons => unreachable!(),
            };
        }
        if !checked {
            panic!("unchecked {} on non-numeric operands", op.symbol());
        }
        let (Some(x), Some(y)) = (self.text(a), self.text(b)) else {
            return self.heap.undefined("type-error");
        };
        let ord = x.cmp(&y);
        match op {
            BinOp::Add => self.heap.alloc_str(x + &y),
            BinOp::Lt => Value::Bool(ord == Ordering::Less),
            BinOp::Le => Value::Bool(ord != Ordering::Greater),
            BinOp::Gt => Value::Bool(ord == Ordering::Greater),
            BinOp::Ge => Value::Bool(ord != Ordering::Less),
            _ => self.heap.undefined("type-error"),
        }
    }

    fn has_type(&self, v: Value, ty: Ty) -> bool {
        let Some(r) = v.as_obj() else {
            return false;
        };
        matches!(
            (self.heap.get(r), ty),
            (Object::Cons(..), Ty::Cons) | (Object::Undefined { .. }, Ty::Undefined)
        ) || matches!(self.heap.get(r), Object::Struct { ty: have, .. } if Ty::Struct(*have) == ty)
    }

    fn field(&mut self, v: Value, idx: usize) -> Value {
        let Some(r) = v.as_obj() else {
            panic!("field load from an immediate");
        };
        match self.heap.get(r) {
            Object::Cons(a, b) => match idx {
                0 => *a,
                1 => *b,
                _ => panic!("cons has no field {idx}"),
            },
            Object::Struct { fields, .. } => fields[idx],
            Object::Undefined { tag, .. } => {
                let tag = tag.clone();
                self.heap.alloc_str(tag)
            }
            _ => panic!("field load from a value without fields"),
        }
    }
}
