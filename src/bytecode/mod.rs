//! Instruction model: opcodes, the relinkable instruction list used while
//! generating code, and the flattened units the VM executes.
//!
//! The list is an arena of nodes linked by index. Jump and branch targets
//! are node ids while a unit is under construction; [`InsnList::flatten`]
//! renumbers them into program counters.

pub mod peephole;

use std::fmt;

use crate::ir::{BinOp, Loc, StructDecl, Ty};

// ── Operand types ────────────────────────────────────────────────────

/// Virtual register: one definition site's slot in the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Node handle inside an [`InsnList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(pub u32);

impl fmt::Display for InsnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Index into a flattened unit.
pub type Pc = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstId(pub u32);

/// Compile-time role of a register, consumed by the lifetime analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    Temp,
    Param,
    /// Loaded from the enclosing closure's captures.
    Global,
    /// Written on several arms, read after they reconverge. Owned on arrival.
    Phi,
    /// Boolean flag; never heap allocated.
    Flag,
}

/// Statically known value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VType {
    Nil,
    Bool,
    Num,
    Str,
    Fn,
    Cell,
    Obj(Ty),
}

impl VType {
    /// Immediates carry no reference count.
    pub fn is_immediate(self) -> bool {
        matches!(self, VType::Nil | VType::Bool | VType::Num)
    }

    /// Known not to be the undefined sentinel.
    pub fn is_defined(self) -> bool {
        self != VType::Obj(Ty::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInfo {
    pub kind: RegKind,
    pub ty: Option<VType>,
}

/// The four ownership primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnOp {
    /// Increment.
    Inc,
    /// Decrement, never free.
    Dec,
    /// Free iff the count is zero, no decrement.
    Drop,
    /// Decrement, free iff it reached zero.
    Unref,
}

impl OwnOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OwnOp::Inc => "INC",
            OwnOp::Dec => "DEC",
            OwnOp::Drop => "DROP",
            OwnOp::Unref => "UNREF",
        }
    }
}

// ── Instructions ─────────────────────────────────────────────────────

/// One instruction. `L` is the label type: [`InsnId`] while building,
/// [`Pc`] once flattened.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn<L = InsnId> {
    Nop,
    End,
    Const { dst: Reg, k: ConstId },
    Param { dst: Reg, idx: u32 },
    LoadCap { dst: Reg, idx: u32 },
    /// Box `src` in a fresh mutable cell.
    Var { dst: Reg, src: Reg },
    Deref { dst: Reg, cell: Reg },
    Set { cell: Reg, src: Reg },
    Binop { op: BinOp, dst: Reg, lhs: Reg, rhs: Reg, checked: bool },
    Test { dst: Reg, src: Reg },
    TestTy { dst: Reg, src: Reg, ty: Ty },
    SetFlag { dst: Reg, value: bool },
    Field { dst: Reg, src: Reg, idx: u32 },
    New { dst: Reg, ty: u32, fields: Vec<Reg> },
    Guard { src: Reg, ty: Ty },
    If { test: Reg, else_: L },
    Jmp { target: L },
    Phi { dst: Reg },
    Mov { dst: Reg, src: Reg },
    Push { src: Reg },
    Apply { dst: Reg, func: Reg, nargs: u32, checked: bool },
    ApplyTc { func: Reg, nargs: u32 },
    Ret { src: Reg },
    Yield { src: Reg },
    Trace { src: Reg, loc: Loc },
    Own { op: OwnOp, reg: Reg },
    AllocFn { dst: Reg },
    FinFn { dst: Reg, unit: UnitId, caps: Vec<Reg> },
    BegScp { n: u32 },
    EndScp { n: u32 },
}

impl<L> Insn<L> {
    /// Register this instruction creates, if any.
    pub fn def(&self) -> Option<Reg> {
        match self {
            Insn::Const { dst, .. }
            | Insn::Param { dst, .. }
            | Insn::LoadCap { dst, .. }
            | Insn::Var { dst, .. }
            | Insn::Deref { dst, .. }
            | Insn::Binop { dst, .. }
            | Insn::Test { dst, .. }
            | Insn::TestTy { dst, .. }
            | Insn::SetFlag { dst, .. }
            | Insn::Field { dst, .. }
            | Insn::New { dst, .. }
            | Insn::Phi { dst }
            | Insn::Apply { dst, .. }
            | Insn::AllocFn { dst } => Some(*dst),
            _ => None,
        }
    }

    /// Registers read by this instruction. Control and ownership
    /// instructions read nothing in lifetime terms; a branch test does.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Insn::Var { src, .. }
            | Insn::Test { src, .. }
            | Insn::TestTy { src, .. }
            | Insn::Field { src, .. }
            | Insn::Guard { src, .. }
            | Insn::Mov { src, .. }
            | Insn::Push { src }
            | Insn::Ret { src }
            | Insn::Yield { src }
            | Insn::Trace { src, .. } => vec![*src],
            Insn::Deref { cell, .. } => vec![*cell],
            Insn::Set { cell, src } => vec![*cell, *src],
            Insn::Binop { lhs, rhs, .. } => vec![*lhs, *rhs],
            Insn::New { fields, .. } => fields.clone(),
            Insn::If { test, .. } => vec![*test],
            Insn::Apply { func, .. } | Insn::ApplyTc { func, .. } => vec![*func],
            Insn::FinFn { dst, caps, .. } => {
                let mut regs = Vec::with_capacity(caps.len() + 1);
                regs.push(*dst);
                regs.extend_from_slice(caps);
                regs
            }
            _ => Vec::new(),
        }
    }

    pub fn uses_reg(&self, r: Reg) -> bool {
        self.uses().contains(&r)
    }

    /// A killing use consumes the register's owned reference outright.
    pub fn kills(&self, r: Reg) -> bool {
        match self {
            Insn::Ret { src } => *src == r,
            Insn::ApplyTc { func, .. } => *func == r,
            _ => false,
        }
    }

    /// Instructions after which a control path ends.
    pub fn is_path_end(&self) -> bool {
        matches!(self, Insn::Ret { .. } | Insn::ApplyTc { .. } | Insn::End)
    }

    pub fn map_label<M>(self, mut f: impl FnMut(L) -> M) -> Insn<M> {
        match self {
            Insn::If { test, else_ } => Insn::If { test, else_: f(else_) },
            Insn::Jmp { target } => Insn::Jmp { target: f(target) },
            Insn::Nop => Insn::Nop,
            Insn::End => Insn::End,
            Insn::Const { dst, k } => Insn::Const { dst, k },
            Insn::Param { dst, idx } => Insn::Param { dst, idx },
            Insn::LoadCap { dst, idx } => Insn::LoadCap { dst, idx },
            Insn::Var { dst, src } => Insn::Var { dst, src },
            Insn::Deref { dst, cell } => Insn::Deref { dst, cell },
            Insn::Set { cell, src } => Insn::Set { cell, src },
            Insn::Binop { op, dst, lhs, rhs, checked } => Insn::Binop { op, dst, lhs, rhs, checked },
            Insn::Test { dst, src } => Insn::Test { dst, src },
            Insn::TestTy { dst, src, ty } => Insn::TestTy { dst, src, ty },
            Insn::SetFlag { dst, value } => Insn::SetFlag { dst, value },
            Insn::Field { dst, src, idx } => Insn::Field { dst, src, idx },
            Insn::New { dst, ty, fields } => Insn::New { dst, ty, fields },
            Insn::Guard { src, ty } => Insn::Guard { src, ty },
            Insn::Phi { dst } => Insn::Phi { dst },
            Insn::Mov { dst, src } => Insn::Mov { dst, src },
            Insn::Push { src } => Insn::Push { src },
            Insn::Apply { dst, func, nargs, checked } => Insn::Apply { dst, func, nargs, checked },
            Insn::ApplyTc { func, nargs } => Insn::ApplyTc { func, nargs },
            Insn::Ret { src } => Insn::Ret { src },
            Insn::Yield { src } => Insn::Yield { src },
            Insn::Trace { src, loc } => Insn::Trace { src, loc },
            Insn::Own { op, reg } => Insn::Own { op, reg },
            Insn::AllocFn { dst } => Insn::AllocFn { dst },
            Insn::FinFn { dst, unit, caps } => Insn::FinFn { dst, unit, caps },
            Insn::BegScp { n } => Insn::BegScp { n },
            Insn::EndScp { n } => Insn::EndScp { n },
        }
    }
}

fn regs(list: &[Reg]) -> String {
    list.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(" ")
}

fn ty_name(ty: Ty) -> String {
    match ty {
        Ty::Cons => "cons".to_string(),
        Ty::Undefined => "undefined".to_string(),
        Ty::Struct(id) => format!("struct#{id}"),
    }
}

impl<L: fmt::Display> fmt::Display for Insn<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Nop => write!(f, "NOP"),
            Insn::End => write!(f, "END"),
            Insn::Const { dst, k } => write!(f, "CONST {dst} k{}", k.0),
            Insn::Param { dst, idx } => write!(f, "PARAM {dst} {idx}"),
            Insn::LoadCap { dst, idx } => write!(f, "LDCAP {dst} {idx}"),
            Insn::Var { dst, src } => write!(f, "VAR {dst} {src}"),
            Insn::Deref { dst, cell } => write!(f, "DEREF {dst} {cell}"),
            Insn::Set { cell, src } => write!(f, "SET {cell} {src}"),
            Insn::Binop { op, dst, lhs, rhs, checked } => {
                let suffix = if *checked { "" } else { "!" };
                write!(f, "BINOP{suffix} {dst} {lhs} {} {rhs}", op.symbol())
            }
            Insn::Test { dst, src } => write!(f, "TEST {dst} {src}"),
            Insn::TestTy { dst, src, ty } => write!(f, "TESTTY {dst} {src} {}", ty_name(*ty)),
            Insn::SetFlag { dst, value } => write!(f, "FLAG {dst} {value}"),
            Insn::Field { dst, src, idx } => write!(f, "LDFLD {dst} {src} {idx}"),
            Insn::New { dst, ty, fields } => write!(f, "NEW {dst} struct#{ty} [{}]", regs(fields)),
            Insn::Guard { src, ty } => write!(f, "GUARD {src} {}", ty_name(*ty)),
            Insn::If { test, else_ } => write!(f, "IF {test} else {else_}"),
            Insn::Jmp { target } => write!(f, "JMP {target}"),
            Insn::Phi { dst } => write!(f, "PHI {dst}"),
            Insn::Mov { dst, src } => write!(f, "MOV {dst} {src}"),
            Insn::Push { src } => write!(f, "PUSH {src}"),
            Insn::Apply { dst, func, nargs, checked } => {
                let suffix = if *checked { "" } else { "!" };
                write!(f, "APPLY{suffix} {dst} {func} {nargs}")
            }
            Insn::ApplyTc { func, nargs } => write!(f, "APPLYTC {func} {nargs}"),
            Insn::Ret { src } => write!(f, "RET {src}"),
            Insn::Yield { src } => write!(f, "YIELD {src}"),
            Insn::Trace { src, loc } => write!(f, "TRACE {src} {loc}"),
            Insn::Own { op, reg } => write!(f, "{} {reg}", op.mnemonic()),
            Insn::AllocFn { dst } => write!(f, "ALCFN {dst}"),
            Insn::FinFn { dst, unit, caps } => write!(f, "FINFN {dst} unit{} [{}]", unit.0, regs(caps)),
            Insn::BegScp { n } => write!(f, "BEGSCP {n}"),
            Insn::EndScp { n } => write!(f, "ENDSCP {n}"),
        }
    }
}

// ── Instruction list ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    insn: Option<Insn>,
    prev: Option<InsnId>,
    next: Option<InsnId>,
}

/// Mutable instruction list bracketed by a leading `Nop` and a trailing
/// `End` sentinel. New instructions are written before the cursor.
#[derive(Debug, Clone)]
pub struct InsnList {
    nodes: Vec<Node>,
    free: Vec<InsnId>,
    head: InsnId,
    tail: InsnId,
    cursor: InsnId,
    regs: Vec<RegInfo>,
}

impl Default for InsnList {
    fn default() -> Self {
        Self::new()
    }
}

impl InsnList {
    pub fn new() -> Self {
        let head = InsnId(0);
        let tail = InsnId(1);
        InsnList {
            nodes: vec![
                Node { insn: Some(Insn::Nop), prev: None, next: Some(tail) },
                Node { insn: Some(Insn::End), prev: Some(head), next: None },
            ],
            free: Vec::new(),
            head,
            tail,
            cursor: tail,
            regs: Vec::with_capacity(16),
        }
    }

    pub fn head(&self) -> InsnId {
        self.head
    }

    pub fn tail(&self) -> InsnId {
        self.tail
    }

    pub fn cursor(&self) -> InsnId {
        self.cursor
    }

    /// Subsequent writes go immediately before `at`.
    pub fn set_cursor(&mut self, at: InsnId) {
        self.node(at);
        self.cursor = at;
    }

    fn node(&self, id: InsnId) -> &Node {
        match self.nodes.get(id.0 as usize) {
            Some(n) if n.insn.is_some() => n,
            _ => panic!("instruction {id} is not part of this unit"),
        }
    }

    fn node_mut(&mut self, id: InsnId) -> &mut Node {
        match self.nodes.get_mut(id.0 as usize) {
            Some(n) if n.insn.is_some() => n,
            _ => panic!("instruction {id} is not part of this unit"),
        }
    }

    pub fn get(&self, id: InsnId) -> &Insn {
        self.node(id).insn.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn get_mut(&mut self, id: InsnId) -> &mut Insn {
        self.node_mut(id).insn.as_mut().unwrap_or_else(|| unreachable!())
    }

    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.node(id).next
    }

    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.node(id).prev
    }

    fn alloc(&mut self, insn: Insn) -> InsnId {
        let node = Node { insn: Some(insn), prev: None, next: None };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = node;
                id
            }
            None => {
                let id = InsnId(self.nodes.len() as u32);
                self.nodes.push(node);
                id
            }
        }
    }

    pub fn insert_before(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let prev = self.node(at).prev.unwrap_or_else(|| panic!("cannot insert before the head sentinel"));
        let id = self.alloc(insn);
        self.nodes[id.0 as usize].prev = Some(prev);
        self.nodes[id.0 as usize].next = Some(at);
        self.node_mut(prev).next = Some(id);
        self.node_mut(at).prev = Some(id);
        id
    }

    pub fn insert_after(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let next = self.node(at).next.unwrap_or_else(|| panic!("cannot insert after the end sentinel"));
        self.insert_before(next, insn)
    }

    /// Splice `insn` immediately before the cursor.
    pub fn write(&mut self, insn: Insn) -> InsnId {
        self.insert_before(self.cursor, insn)
    }

    pub fn append(&mut self, insn: Insn) -> InsnId {
        self.insert_before(self.tail, insn)
    }

    pub fn prepend(&mut self, insn: Insn) -> InsnId {
        self.insert_after(self.head, insn)
    }

    /// Unlink a single instruction and release its node.
    pub fn remove(&mut self, id: InsnId) {
        assert!(id != self.head && id != self.tail, "sentinels cannot be removed");
        assert!(id != self.cursor, "cannot remove the instruction under the cursor");
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        if let Some(p) = prev {
            self.node_mut(p).next = next;
        }
        if let Some(n) = next {
            self.node_mut(n).prev = prev;
        }
        self.nodes[id.0 as usize] = Node { insn: None, prev: None, next: None };
        self.free.push(id);
    }

    /// Delete `from` and everything after it up to the end sentinel.
    pub fn truncate_from(&mut self, from: InsnId) {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if id == self.tail {
                break;
            }
            cur = self.next(id);
            if self.cursor == id {
                self.cursor = self.tail;
            }
            self.remove(id);
        }
    }

    pub fn new_value(&mut self, kind: RegKind) -> Reg {
        let r = Reg(self.regs.len() as u32);
        let ty = if kind == RegKind::Flag { Some(VType::Bool) } else { None };
        self.regs.push(RegInfo { kind, ty });
        r
    }

    pub fn reg_count(&self) -> u32 {
        self.regs.len() as u32
    }

    pub fn reg_info(&self, r: Reg) -> RegInfo {
        self.regs[r.0 as usize]
    }

    pub fn reg_type(&self, r: Reg) -> Option<VType> {
        self.regs[r.0 as usize].ty
    }

    pub fn set_type(&mut self, r: Reg, ty: Option<VType>) {
        self.regs[r.0 as usize].ty = ty;
    }

    /// Node ids from head to tail, inclusive.
    pub fn ids(&self) -> Vec<InsnId> {
        let mut out = Vec::new();
        let mut cur = Some(self.head);
        while let Some(id) = cur {
            out.push(id);
            cur = self.next(id);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.next(self.head) == Some(self.tail)
    }

    /// Control successors of `id`: the fall-through and, for branches, the
    /// taken edge.
    pub fn successors(&self, id: InsnId) -> Vec<InsnId> {
        let insn = self.get(id);
        match insn {
            Insn::If { else_, .. } => {
                let mut out = Vec::with_capacity(2);
                out.extend(self.next(id));
                out.push(*else_);
                out
            }
            Insn::Jmp { target } => vec![*target],
            _ if insn.is_path_end() => Vec::new(),
            _ => self.next(id).into_iter().collect(),
        }
    }

    /// Copy the list into a contiguous array, rewriting every label into
    /// the index of its target.
    pub fn flatten(&self) -> Vec<Insn<Pc>> {
        let ids = self.ids();
        let mut pc_of = vec![usize::MAX; self.nodes.len()];
        for (pc, id) in ids.iter().enumerate() {
            pc_of[id.0 as usize] = pc;
        }
        ids.iter()
            .map(|&id| {
                self.get(id).clone().map_label(|target| {
                    let pc = pc_of[target.0 as usize];
                    assert!(pc != usize::MAX, "branch to deleted instruction {target}");
                    pc
                })
            })
            .collect()
    }
}

impl fmt::Display for InsnList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.ids() {
            writeln!(f, "{:>5}  {}", id.to_string(), self.get(id))?;
        }
        Ok(())
    }
}

// ── Finished program ─────────────────────────────────────────────────

/// Constant pool entry, materialized into the heap when a VM loads the program.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    Undefined(String),
    /// Capture-free function resolved at emission time.
    Closure(UnitId),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Num(n) => write!(f, "{n}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Undefined(tag) => write!(f, "undefined({tag})"),
            Constant::Closure(u) => write!(f, "<fn unit{}>", u.0),
        }
    }
}

/// A flattened, immutable bytecode unit.
#[derive(Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub arity: u32,
    pub ncaps: u32,
    pub nregs: u32,
    pub code: Vec<Insn<Pc>>,
}

impl Unit {
    pub fn count(&self, pred: impl Fn(&Insn<Pc>) -> bool) -> usize {
        self.code.iter().filter(|i| pred(i)).count()
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub units: Vec<Unit>,
    pub consts: Vec<Constant>,
    pub types: Vec<StructDecl>,
    pub entry: UnitId,
}

impl Program {
    pub fn unit(&self, id: UnitId) -> &Unit {
        &self.units[id.0 as usize]
    }

    pub fn entry_unit(&self) -> &Unit {
        self.unit(self.entry)
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        if !self.consts.is_empty() {
            out.push_str("constants:\n");
            for (i, k) in self.consts.iter().enumerate() {
                out.push_str(&format!("  k{i} = {k}\n"));
            }
        }
        for (i, unit) in self.units.iter().enumerate() {
            let marker = if UnitId(i as u32) == self.entry { " (entry)" } else { "" };
            out.push_str(&format!(
                "unit{i} {}{marker}: arity={} caps={} regs={}\n",
                unit.name, unit.arity, unit.ncaps, unit.nregs
            ));
            for (pc, insn) in unit.code.iter().enumerate() {
                out.push_str(&format!("  {pc:>4}  {insn}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_list_has_sentinels_only() {
        let list = InsnList::new();
        assert!(list.is_empty());
        assert_eq!(list.get(list.head()), &Insn::Nop);
        assert_eq!(list.get(list.tail()), &Insn::End);
        assert_eq!(list.cursor(), list.tail());
    }

    #[test]
    fn write_splices_before_cursor() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let a = list.write(Insn::Const { dst: r, k: ConstId(0) });
        let b = list.write(Insn::Ret { src: r });
        list.set_cursor(b);
        let c = list.write(Insn::Push { src: r });
        assert_eq!(list.ids(), vec![list.head(), a, c, b, list.tail()]);
        let p = list.prepend(Insn::Nop);
        assert_eq!(list.next(list.head()), Some(p));
    }

    #[test]
    fn remove_reuses_slots() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let a = list.append(Insn::Push { src: r });
        let b = list.append(Insn::Push { src: r });
        list.remove(a);
        assert_eq!(list.ids(), vec![list.head(), b, list.tail()]);
        let c = list.append(Insn::Nop);
        assert_eq!(c, a);
    }

    #[test]
    fn truncate_keeps_tail() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let a = list.append(Insn::Push { src: r });
        list.append(Insn::Push { src: r });
        list.append(Insn::Push { src: r });
        list.truncate_from(a);
        assert!(list.is_empty());
    }

    #[test]
    fn flatten_patches_labels() {
        let mut list = InsnList::new();
        let t = list.new_value(RegKind::Flag);
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::SetFlag { dst: t, value: true });
        let branch = list.append(Insn::If { test: t, else_: InsnId(0) });
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        let jmp = list.append(Insn::Jmp { target: InsnId(0) });
        let else_label = list.append(Insn::Nop);
        list.append(Insn::Const { dst: r, k: ConstId(1) });
        let join = list.append(Insn::Nop);
        list.append(Insn::Ret { src: r });
        *list.get_mut(branch) = Insn::If { test: t, else_: else_label };
        *list.get_mut(jmp) = Insn::Jmp { target: join };

        let code = list.flatten();
        assert_eq!(code[2], Insn::If { test: t, else_: 5 });
        assert_eq!(code[4], Insn::Jmp { target: 7 });
        assert_eq!(code.last(), Some(&Insn::End));
    }

    #[test]
    fn killing_uses() {
        let r = Reg(3);
        assert!(Insn::<Pc>::Ret { src: r }.kills(r));
        assert!(Insn::<Pc>::ApplyTc { func: r, nargs: 0 }.kills(r));
        assert!(!Insn::<Pc>::Push { src: r }.kills(r));
        assert!(Insn::<Pc>::Own { op: OwnOp::Unref, reg: r }.uses().is_empty());
    }

    #[test]
    fn flag_registers_are_bool() {
        let mut list = InsnList::new();
        let f = list.new_value(RegKind::Flag);
        assert_eq!(list.reg_type(f), Some(VType::Bool));
    }
}
