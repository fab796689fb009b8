//! IR to bytecode lowering.
//!
//! Each function body becomes one [`Unit`]. Lexical variables live on an
//! explicit value-stack of registers; offsets in the IR index it from the
//! top. Lowering can run in tail position, in which case the node ends its
//! own control path (`RET`/`APPLYTC`) and yields no register.

mod pattern;

use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::{
    peephole, ConstId, Constant, Insn, InsnId, InsnList, Program, Reg, RegKind, Unit, UnitId, VType,
};
use crate::config::CompileOptions;
use crate::ir::{BinOp, Const, FnLit, Ir, Loc, Module, StructDecl, Ty};
use crate::lifetime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("variable offset {offset} out of range (stack depth {depth})")]
    BadOffset { offset: usize, depth: usize },
    #[error("binding at offset {offset} is not mutable")]
    NotMutable { offset: usize },
    #[error("unknown struct type #{ty}")]
    UnknownStruct { ty: u32 },
    #[error("struct #{ty} expects {expected} fields, got {got}")]
    StructArity { ty: u32, expected: usize, got: usize },
    #[error("field offset {field} out of range for {ty}")]
    FieldOutOfRange { ty: String, field: usize },
    #[error("fix binding {index} is not a function literal")]
    FixNotFunction { index: usize },
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compile a resolved module into a program whose entry unit evaluates the
/// module body.
pub fn compile(module: &Module, opts: &CompileOptions) -> Result<Program> {
    let mut em = Emitter::new(opts, &module.types);
    let entry = em.compile_unit("main".to_string(), 0, &[], &module.body)?;
    Ok(Program { units: em.units, consts: em.consts, types: module.types.clone(), entry })
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    reg: Reg,
    /// The register holds a cell; reads go through `DEREF`.
    mutable: bool,
}

/// A capture-free function whose code is known at the call site.
#[derive(Debug, Clone)]
struct KnownFn {
    arity: usize,
    body: Ir,
}

/// An open `IF`, waiting for its else label and join.
#[derive(Debug)]
struct Branch {
    iff: InsnId,
    jmp: Option<InsnId>,
}

/// Per-unit emission state.
struct FnBuilder {
    list: InsnList,
    stack: Vec<Slot>,
    known: HashMap<Reg, usize>,
    /// Types that hold only past an error guard; never used for ownership.
    narrowed: HashMap<Reg, VType>,
    inline_depth: usize,
}

impl FnBuilder {
    fn new() -> Self {
        FnBuilder {
            list: InsnList::new(),
            stack: Vec::new(),
            known: HashMap::new(),
            narrowed: HashMap::new(),
            inline_depth: 0,
        }
    }

    fn write(&mut self, insn: Insn) -> InsnId {
        self.list.write(insn)
    }

    fn value(&mut self, kind: RegKind, ty: Option<VType>) -> Reg {
        let r = self.list.new_value(kind);
        if ty.is_some() {
            self.list.set_type(r, ty);
        }
        r
    }

    fn ty(&self, r: Reg) -> Option<VType> {
        self.narrowed.get(&r).copied().or(self.list.reg_type(r))
    }

    fn slot(&self, offset: usize) -> Result<Slot> {
        let depth = self.stack.len();
        if offset >= depth {
            return Err(CompileError::BadOffset { offset, depth });
        }
        Ok(self.stack[depth - 1 - offset])
    }

    fn push(&mut self, reg: Reg) {
        self.stack.push(Slot { reg, mutable: false });
    }

    fn branch(&mut self, test: Reg) -> Branch {
        let iff = self.write(Insn::If { test, else_: InsnId(0) });
        Branch { iff, jmp: None }
    }

    /// Close the then-arm and start the else-arm.
    fn else_arm(&mut self, br: &mut Branch) {
        br.jmp = Some(self.write(Insn::Jmp { target: InsnId(0) }));
        let label = self.write(Insn::Nop);
        if let Insn::If { else_, .. } = self.list.get_mut(br.iff) {
            *else_ = label;
        }
    }

    /// Write the join label, a `PHI` marker when the arms merge a value.
    fn join(&mut self, br: Branch, phi: Option<Reg>) -> InsnId {
        let label = match phi {
            Some(dst) => self.write(Insn::Phi { dst }),
            None => self.write(Insn::Nop),
        };
        let Some(jmp) = br.jmp else {
            panic!("branch at {} joined without an else arm", br.iff);
        };
        if let Insn::Jmp { target } = self.list.get_mut(jmp) {
            *target = label;
        }
        label
    }

    /// Give a merge register the static type both arms agree on.
    fn unify(&mut self, phi: Reg, a: Reg, b: Reg) {
        let (ta, tb) = (self.list.reg_type(a), self.list.reg_type(b));
        if ta.is_some() && ta == tb {
            self.list.set_type(phi, ta);
        } else if let (Some(x), Some(y)) = (self.ty(a), self.ty(b)) {
            if x == y {
                self.narrowed.insert(phi, x);
            }
        }
    }
}

pub struct Emitter<'a> {
    opts: &'a CompileOptions,
    types: &'a [StructDecl],
    units: Vec<Unit>,
    consts: Vec<Constant>,
    known_fns: Vec<KnownFn>,
}

impl<'a> Emitter<'a> {
    pub fn new(opts: &'a CompileOptions, types: &'a [StructDecl]) -> Self {
        Emitter { opts, types, units: Vec::new(), consts: Vec::new(), known_fns: Vec::new() }
    }

    fn compile_unit(&mut self, name: String, arity: usize, caps: &[bool], body: &Ir) -> Result<UnitId> {
        let id = UnitId(self.units.len() as u32);
        self.units.push(Unit {
            name: name.clone(),
            arity: arity as u32,
            ncaps: caps.len() as u32,
            nregs: 0,
            code: Vec::new(),
        });

        let mut b = FnBuilder::new();
        for (idx, &mutable) in caps.iter().enumerate() {
            let ty = if mutable { Some(VType::Cell) } else { None };
            let reg = b.value(RegKind::Global, ty);
            b.write(Insn::LoadCap { dst: reg, idx: idx as u32 });
            b.stack.push(Slot { reg, mutable });
        }
        for idx in 0..arity {
            let reg = b.value(RegKind::Param, None);
            b.write(Insn::Param { dst: reg, idx: idx as u32 });
            b.push(reg);
        }
        self.emit_tail(&mut b, body)?;

        let report = lifetime::fix_lifetimes(&mut b.list);
        let consts = &self.consts;
        let removed = peephole::cleanup(&mut b.list, |k| consts[k.0 as usize] == Constant::Nil);
        if self.opts.verify_lifetimes {
            if let Err(e) = lifetime::check_unit(&b.list) {
                panic!("unbalanced lifetimes in unit {name}: {e}\n{}", b.list);
            }
        }

        let code = b.list.flatten();
        debug!(
            unit = %name,
            insns = code.len(),
            regs = b.list.reg_count(),
            acquires = report.acquires,
            releases = report.unrefs + report.drops,
            removed,
            "compiled unit"
        );
        let unit = &mut self.units[id.0 as usize];
        unit.nregs = b.list.reg_count();
        unit.code = code;
        Ok(id)
    }

    fn intern(&mut self, c: Constant) -> ConstId {
        let idx = match self.consts.iter().position(|k| *k == c) {
            Some(i) => i,
            None => {
                self.consts.push(c);
                self.consts.len() - 1
            }
        };
        ConstId(idx as u32)
    }

    fn constant(&mut self, b: &mut FnBuilder, c: Constant) -> Reg {
        let ty = match &c {
            Constant::Nil => VType::Nil,
            Constant::Bool(_) => VType::Bool,
            Constant::Num(_) => VType::Num,
            Constant::Str(_) => VType::Str,
            Constant::Undefined(_) => VType::Obj(Ty::Undefined),
            Constant::Closure(_) => VType::Fn,
        };
        let k = self.intern(c);
        let dst = b.value(RegKind::Temp, Some(ty));
        b.write(Insn::Const { dst, k });
        dst
    }

    fn nil(&mut self, b: &mut FnBuilder) -> Reg {
        self.constant(b, Constant::Nil)
    }

    fn emit(&mut self, b: &mut FnBuilder, ir: &Ir) -> Result<Reg> {
        match self.lower(b, ir, false)? {
            Some(r) => Ok(r),
            None => unreachable!("lowering outside tail position always yields a register"),
        }
    }

    fn emit_tail(&mut self, b: &mut FnBuilder, ir: &Ir) -> Result<()> {
        if let Some(src) = self.lower(b, ir, true)? {
            b.write(Insn::Ret { src });
        }
        Ok(())
    }

    /// Lower `ir`. In tail position, nodes that end the control path
    /// themselves return `None`; anything else returns the result register
    /// and the caller returns it.
    fn lower(&mut self, b: &mut FnBuilder, ir: &Ir, tail: bool) -> Result<Option<Reg>> {
        match ir {
            Ir::Const(c) => {
                let c = match c {
                    Const::Nil => Constant::Nil,
                    Const::Bool(v) => Constant::Bool(*v),
                    Const::Num(n) => Constant::Num(*n),
                    Const::Str(s) => Constant::Str(s.clone()),
                    Const::Undefined(tag) => Constant::Undefined(tag.clone()),
                };
                Ok(Some(self.constant(b, c)))
            }
            Ir::Var { offset, mutable } => {
                let slot = b.slot(*offset)?;
                if slot.mutable {
                    let dst = b.value(RegKind::Temp, None);
                    b.write(Insn::Deref { dst, cell: slot.reg });
                    Ok(Some(dst))
                } else if *mutable {
                    Err(CompileError::NotMutable { offset: *offset })
                } else {
                    Ok(Some(slot.reg))
                }
            }
            Ir::Apply { callee, args, guard, loc } => {
                self.lower_apply(b, callee, args, *guard, loc.as_ref(), tail)
            }
            Ir::Binop { op, lhs, rhs } => self.lower_binop(b, *op, lhs, rhs).map(Some),
            Ir::Fn(lit) => self.lower_fn(b, lit).map(Some),
            Ir::Let { binds, body } => {
                let height = b.stack.len();
                for bind in binds {
                    let r = self.emit(b, &bind.value)?;
                    if bind.mutable {
                        let cell = b.value(RegKind::Temp, Some(VType::Cell));
                        b.write(Insn::Var { dst: cell, src: r });
                        b.stack.push(Slot { reg: cell, mutable: true });
                    } else {
                        b.push(r);
                    }
                }
                self.lower_scoped(b, body.as_deref(), height, tail)
            }
            Ir::Fix { fns, body } => {
                let height = b.stack.len();
                self.lower_fix(b, fns)?;
                self.lower_scoped(b, body.as_deref(), height, tail)
            }
            Ir::If { test, then, else_ } => self.lower_if(b, test, then, else_, tail),
            Ir::Match { pattern, value, then, else_ } => {
                self.lower_match(b, pattern, value, then, else_.as_deref(), tail)
            }
            Ir::Block { exprs, keep } => {
                let height = b.stack.len();
                let Some((last, init)) = exprs.split_last() else {
                    return Ok(Some(self.nil(b)));
                };
                for e in init {
                    self.emit(b, e)?;
                }
                let out = self.lower(b, last, tail)?;
                if !keep {
                    b.stack.truncate(height);
                }
                Ok(out)
            }
            Ir::Return(e) => {
                self.emit_tail(b, e)?;
                if tail {
                    Ok(None)
                } else {
                    // Unreachable; keeps the expression shape.
                    Ok(Some(self.nil(b)))
                }
            }
            Ir::SetRef { offset, value } => {
                let slot = b.slot(*offset)?;
                if !slot.mutable {
                    return Err(CompileError::NotMutable { offset: *offset });
                }
                let src = self.emit(b, value)?;
                b.write(Insn::Set { cell: slot.reg, src });
                Ok(Some(self.nil(b)))
            }
            Ir::Yield(e) => {
                let src = self.emit(b, e)?;
                b.write(Insn::Yield { src });
                Ok(Some(self.nil(b)))
            }
            Ir::Struct { ty, fields } => {
                let decl = self.types.get(*ty as usize).ok_or(CompileError::UnknownStruct { ty: *ty })?;
                if decl.fields.len() != fields.len() {
                    return Err(CompileError::StructArity {
                        ty: *ty,
                        expected: decl.fields.len(),
                        got: fields.len(),
                    });
                }
                let mut regs = Vec::with_capacity(fields.len());
                for f in fields {
                    regs.push(self.emit(b, f)?);
                }
                let dst = b.value(RegKind::Temp, Some(VType::Obj(Ty::Struct(*ty))));
                b.write(Insn::New { dst, ty: *ty, fields: regs });
                Ok(Some(dst))
            }
        }
    }

    /// Body of a `let`/`fix`: without one, the bindings stay visible to the
    /// rest of the enclosing block.
    fn lower_scoped(&mut self, b: &mut FnBuilder, body: Option<&Ir>, height: usize, tail: bool) -> Result<Option<Reg>> {
        match body {
            Some(body) => {
                let out = self.lower(b, body, tail)?;
                b.stack.truncate(height);
                Ok(out)
            }
            None => Ok(Some(self.nil(b))),
        }
    }

    fn lower_apply(
        &mut self,
        b: &mut FnBuilder,
        callee: &Ir,
        args: &[Ir],
        guard: bool,
        loc: Option<&Loc>,
        tail: bool,
    ) -> Result<Option<Reg>> {
        let mut regs = Vec::with_capacity(args.len());
        for a in args {
            regs.push(self.emit(b, a)?);
        }
        let func = self.emit(b, callee)?;
        let nargs = regs.len() as u32;

        let mut checked = true;
        if let Some(&idx) = b.known.get(&func) {
            let known = &self.known_fns[idx];
            if known.arity == regs.len() {
                if self.can_inline(b, known) {
                    let body = known.body.clone();
                    return self.inline(b, &body, &regs, guard, loc, tail);
                }
                checked = false;
            }
        }

        if tail && matches!(callee, Ir::Var { .. }) {
            for &src in &regs {
                b.write(Insn::Push { src });
            }
            b.write(Insn::ApplyTc { func, nargs });
            return Ok(None);
        }

        for &src in &regs {
            b.write(Insn::Push { src });
        }
        let dst = b.value(RegKind::Temp, None);
        b.write(Insn::Apply { dst, func, nargs, checked });
        if guard {
            self.guard(b, dst, loc);
        }
        Ok(Some(dst))
    }

    fn can_inline(&self, b: &FnBuilder, known: &KnownFn) -> bool {
        self.opts.inline
            && b.inline_depth < self.opts.max_inline_depth
            && known.body.size() <= self.opts.inline_budget
            && !known.body.escapes_frame()
    }

    /// Re-emit a capture-free callee's body with its parameters bound to
    /// the argument registers.
    fn inline(
        &mut self,
        b: &mut FnBuilder,
        body: &Ir,
        args: &[Reg],
        guard: bool,
        loc: Option<&Loc>,
        tail: bool,
    ) -> Result<Option<Reg>> {
        let params = args.iter().map(|&reg| Slot { reg, mutable: false }).collect();
        let saved = std::mem::replace(&mut b.stack, params);
        b.inline_depth += 1;
        let out = self.lower(b, body, tail);
        b.inline_depth -= 1;
        b.stack = saved;

        let out = out?;
        if let Some(r) = out {
            if guard && !tail {
                self.guard(b, r, loc);
            }
        }
        Ok(out)
    }

    /// Return early when `r` holds the undefined sentinel.
    fn guard(&mut self, b: &mut FnBuilder, r: Reg, loc: Option<&Loc>) {
        if b.ty(r).is_some_and(VType::is_defined) {
            return;
        }
        let t = b.value(RegKind::Flag, None);
        b.write(Insn::TestTy { dst: t, src: r, ty: Ty::Undefined });
        let mut br = b.branch(t);
        if self.opts.traces {
            if let Some(loc) = loc {
                b.write(Insn::Trace { src: r, loc: loc.clone() });
            }
        }
        b.write(Insn::Ret { src: r });
        b.else_arm(&mut br);
        b.join(br, None);
    }

    fn lower_binop(&mut self, b: &mut FnBuilder, op: BinOp, lhs: &Ir, rhs: &Ir) -> Result<Reg> {
        let l = self.emit(b, lhs)?;
        let r = self.emit(b, rhs)?;
        let unchecked = |b: &mut FnBuilder, ty: VType| {
            let dst = b.value(RegKind::Temp, Some(ty));
            b.write(Insn::Binop { op, dst, lhs: l, rhs: r, checked: false });
            dst
        };
        match op {
            BinOp::Cons => Ok(unchecked(b, VType::Obj(Ty::Cons))),
            BinOp::Eq | BinOp::Ne => Ok(unchecked(b, VType::Bool)),
            _ => {
                let result = if op.is_ordering() { VType::Bool } else { VType::Num };
                if b.ty(l) == Some(VType::Num) && b.ty(r) == Some(VType::Num) {
                    return Ok(unchecked(b, result));
                }
                let dst = b.value(RegKind::Temp, None);
                b.write(Insn::Binop { op, dst, lhs: l, rhs: r, checked: true });
                self.guard(b, dst, None);
                let narrowed = match op {
                    BinOp::Add if b.ty(l) == Some(VType::Str) && b.ty(r) == Some(VType::Str) => Some(VType::Str),
                    BinOp::Add => None,
                    _ => Some(result),
                };
                if let Some(ty) = narrowed {
                    b.narrowed.insert(dst, ty);
                }
                Ok(dst)
            }
        }
    }

    fn truth(&mut self, b: &mut FnBuilder, c: Reg) -> Reg {
        if b.list.reg_info(c).kind == RegKind::Flag {
            return c;
        }
        let t = b.value(RegKind::Flag, None);
        b.write(Insn::Test { dst: t, src: c });
        t
    }

    fn lower_if(&mut self, b: &mut FnBuilder, test: &Ir, then: &Ir, else_: &Ir, tail: bool) -> Result<Option<Reg>> {
        let c = self.emit(b, test)?;
        let t = self.truth(b, c);
        let height = b.stack.len();
        let mut br = b.branch(t);

        if tail {
            self.emit_tail(b, then)?;
            b.stack.truncate(height);
            b.else_arm(&mut br);
            self.emit_tail(b, else_)?;
            b.stack.truncate(height);
            b.join(br, None);
            return Ok(None);
        }

        let phi = b.value(RegKind::Phi, None);
        let x = self.emit(b, then)?;
        b.write(Insn::Mov { dst: phi, src: x });
        b.stack.truncate(height);
        b.else_arm(&mut br);
        let y = self.emit(b, else_)?;
        b.write(Insn::Mov { dst: phi, src: y });
        b.stack.truncate(height);
        b.join(br, Some(phi));
        b.unify(phi, x, y);
        Ok(Some(phi))
    }

    fn fn_name(&self, lit: &FnLit) -> String {
        lit.name.clone().unwrap_or_else(|| format!("fn{}", self.units.len()))
    }

    fn lower_fn(&mut self, b: &mut FnBuilder, lit: &FnLit) -> Result<Reg> {
        if lit.captures.is_empty() {
            let unit = self.compile_unit(self.fn_name(lit), lit.arity, &[], &lit.body)?;
            let r = self.constant(b, Constant::Closure(unit));
            b.known.insert(r, self.known_fns.len());
            self.known_fns.push(KnownFn { arity: lit.arity, body: (*lit.body).clone() });
            return Ok(r);
        }
        let dst = b.value(RegKind::Phi, Some(VType::Fn));
        b.write(Insn::AllocFn { dst });
        let (unit, caps) = self.closure_unit(b, lit)?;
        b.write(Insn::FinFn { dst, unit, caps });
        Ok(dst)
    }

    /// Compile a literal's body and resolve the registers it captures.
    fn closure_unit(&mut self, b: &mut FnBuilder, lit: &FnLit) -> Result<(UnitId, Vec<Reg>)> {
        let mut caps = Vec::with_capacity(lit.captures.len());
        let mut mutable = Vec::with_capacity(lit.captures.len());
        for &offset in &lit.captures {
            let slot = b.slot(offset)?;
            caps.push(slot.reg);
            mutable.push(slot.mutable);
        }
        let unit = self.compile_unit(self.fn_name(lit), lit.arity, &mutable, &lit.body)?;
        Ok((unit, caps))
    }

    /// `fix`: allocate every closure shell first so the bodies can capture
    /// each other, then finalize them inside one recursive scope.
    fn lower_fix(&mut self, b: &mut FnBuilder, fns: &[Ir]) -> Result<()> {
        let mut shells = Vec::with_capacity(fns.len());
        for (index, f) in fns.iter().enumerate() {
            let Ir::Fn(lit) = f else {
                return Err(CompileError::FixNotFunction { index });
            };
            let dst = b.value(RegKind::Phi, Some(VType::Fn));
            b.write(Insn::AllocFn { dst });
            b.push(dst);
            shells.push((dst, lit));
        }
        let n = shells.len() as u32;
        b.write(Insn::BegScp { n });
        for (dst, lit) in shells {
            let (unit, caps) = self.closure_unit(b, lit)?;
            b.write(Insn::FinFn { dst, unit, caps });
        }
        b.write(Insn::EndScp { n });
        Ok(())
    }
}
