use std::fmt::Write as _;

use tracing::debug;

use crate::bytecode::UnitId;
use crate::closure::{Closure, Group, GroupId, Verdict};
use crate::ir::{Loc, StructDecl};

// ── Values ───────────────────────────────────────────────────────────
//
// Immediates live in registers directly; everything else is a handle into
// the heap arena. A fresh heap object starts with a count of zero: the
// instruction that produced it is its only owner until someone acquires it.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn as_obj(self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_num(self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(n),
            _ => None,
        }
    }

    /// Only `nil` and `false` are falsy.
    pub fn truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

#[derive(Debug, Clone)]
pub enum Object {
    Str(String),
    Cons(Value, Value),
    Struct { ty: u32, fields: Vec<Value> },
    /// Mutable variable indirection.
    Cell(Value),
    Closure(Closure),
    Undefined { tag: String, trace: Vec<Loc> },
}

impl Object {
    fn for_each_owned(&self, mut f: impl FnMut(Value)) {
        match self {
            Object::Str(_) | Object::Undefined { .. } => {}
            Object::Cons(a, b) => {
                f(*a);
                f(*b);
            }
            Object::Struct { fields, .. } => fields.iter().copied().for_each(f),
            Object::Cell(v) => f(*v),
            Object::Closure(c) => c.strong_caps().for_each(f),
        }
    }
}

// ── Heap ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Slot {
    Live { rc: u32, obj: Object },
    Free,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocs: u64,
    pub frees: u64,
    pub live: u64,
    pub groups_collected: u64,
}

/// Reference-counted object arena. The four ownership primitives are
/// [`acquire`](Heap::acquire), [`release`](Heap::release),
/// [`drop_value`](Heap::drop_value) and [`unref`](Heap::unref).
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    groups: Vec<Option<Group>>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn alloc(&mut self, obj: Object) -> Value {
        self.stats.allocs += 1;
        self.stats.live += 1;
        let slot = Slot::Live { rc: 0, obj };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };
        Value::Obj(ObjRef(idx))
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        self.alloc(Object::Str(s.into()))
    }

    pub fn undefined(&mut self, tag: impl Into<String>) -> Value {
        self.alloc(Object::Undefined { tag: tag.into(), trace: Vec::new() })
    }

    fn slot(&self, r: ObjRef) -> (&u32, &Object) {
        match self.slots.get(r.0 as usize) {
            Some(Slot::Live { rc, obj }) => (rc, obj),
            _ => panic!("use of freed object #{}", r.0),
        }
    }

    fn slot_mut(&mut self, r: ObjRef) -> (&mut u32, &mut Object) {
        match self.slots.get_mut(r.0 as usize) {
            Some(Slot::Live { rc, obj }) => (rc, obj),
            _ => panic!("use of freed object #{}", r.0),
        }
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        self.slot(r).1
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        self.slot_mut(r).1
    }

    pub fn rc(&self, r: ObjRef) -> u32 {
        *self.slot(r).0
    }

    pub fn closure(&self, v: Value) -> Option<&Closure> {
        match v {
            Value::Obj(r) => match self.get(r) {
                Object::Closure(c) => Some(c),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn undefined_tag(&self, v: Value) -> Option<&str> {
        match v {
            Value::Obj(r) => match self.get(r) {
                Object::Undefined { tag, .. } => Some(tag),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_undefined(&self, v: Value) -> bool {
        self.undefined_tag(v).is_some()
    }

    /// Increment.
    pub fn acquire(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            *self.slot_mut(r).0 += 1;
        }
    }

    /// Decrement without freeing.
    pub fn release(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.dec(r);
        }
    }

    /// Free iff nothing owns the value; the count is left alone.
    pub fn drop_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            if self.rc(r) == 0 {
                self.collect(r);
            }
        }
    }

    /// Decrement and free on zero.
    pub fn unref(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            if self.dec(r) == 0 {
                self.collect(r);
            }
        }
    }

    fn dec(&mut self, r: ObjRef) -> u32 {
        let rc = self.slot_mut(r).0;
        assert!(*rc > 0, "reference count underflow on object #{}", r.0);
        *rc -= 1;
        *rc
    }

    fn group_of(&self, r: ObjRef) -> Option<GroupId> {
        match self.get(r) {
            Object::Closure(c) => c.group,
            _ => None,
        }
    }

    /// Free `root` and everything that becomes unreferenced with it.
    fn collect(&mut self, root: ObjRef) {
        let mut work = vec![root];
        while let Some(r) = work.pop() {
            if let Some(gid) = self.group_of(r) {
                self.member_zero(gid, &mut work);
                continue;
            }
            let obj = self.take(r);
            obj.for_each_owned(|child| {
                if let Value::Obj(c) = child {
                    if self.dec(c) == 0 {
                        work.push(c);
                    }
                }
            });
        }
    }

    fn take(&mut self, r: ObjRef) -> Object {
        let slot = std::mem::replace(&mut self.slots[r.0 as usize], Slot::Free);
        match slot {
            Slot::Live { obj, .. } => {
                self.free.push(r.0);
                self.stats.frees += 1;
                self.stats.live -= 1;
                obj
            }
            Slot::Free => panic!("double free of object #{}", r.0),
        }
    }

    // ── Recursive scopes ─────────────────────────────────────────────

    pub fn open_group(&mut self, size: u32) -> GroupId {
        self.groups.push(Some(Group::new(size)));
        GroupId((self.groups.len() - 1) as u32)
    }

    fn group_mut(&mut self, gid: GroupId) -> &mut Group {
        match self.groups.get_mut(gid.0 as usize) {
            Some(Some(g)) => g,
            _ => panic!("recursive scope {} already collected", gid.0),
        }
    }

    pub fn join_group(&mut self, gid: GroupId, member: ObjRef) {
        self.group_mut(gid).join(member);
        match self.get_mut(member) {
            Object::Closure(c) => c.group = Some(gid),
            _ => panic!("only closures can join a recursive scope"),
        }
    }

    /// Seal a scope: captures of siblings become weak and stop counting
    /// toward the sibling's own reference count.
    pub fn seal_group(&mut self, gid: GroupId) {
        let members = self.group_mut(gid).members().to_vec();
        for &m in &members {
            let caps = match self.get(m) {
                Object::Closure(c) => c.caps.clone(),
                _ => unreachable!("group member is a closure"),
            };
            let weak: Vec<bool> =
                caps.iter().map(|v| v.as_obj().is_some_and(|r| members.contains(&r))).collect();
            for (v, &w) in caps.iter().zip(&weak) {
                if w {
                    self.release(*v);
                }
            }
            if let Object::Closure(c) = self.get_mut(m) {
                c.weak = weak;
            }
        }

        let verdict = {
            let slots = &self.slots;
            let rc_of = |r: ObjRef| match &slots[r.0 as usize] {
                Slot::Live { rc, .. } => *rc,
                Slot::Free => 0,
            };
            match self.groups.get_mut(gid.0 as usize) {
                Some(Some(g)) => g.seal(rc_of),
                _ => panic!("recursive scope {} already collected", gid.0),
            }
        };
        if verdict == Verdict::Collect {
            let mut work = Vec::new();
            self.destroy_group(gid, &mut work);
            while let Some(r) = work.pop() {
                self.collect(r);
            }
        }
    }

    fn member_zero(&mut self, gid: GroupId, work: &mut Vec<ObjRef>) {
        let verdict = {
            let slots = &self.slots;
            let rc_of = |r: ObjRef| match &slots[r.0 as usize] {
                Slot::Live { rc, .. } => *rc,
                Slot::Free => 0,
            };
            match self.groups.get_mut(gid.0 as usize) {
                Some(Some(g)) => g.on_member_zero(rc_of),
                _ => panic!("recursive scope {} already collected", gid.0),
            }
        };
        if verdict == Verdict::Collect {
            self.destroy_group(gid, work);
        }
    }

    fn destroy_group(&mut self, gid: GroupId, work: &mut Vec<ObjRef>) {
        let Some(group) = self.groups[gid.0 as usize].take() else {
            panic!("recursive scope {} already collected", gid.0);
        };
        debug!(group = gid.0, members = group.members().len(), "collecting recursive scope");
        self.stats.groups_collected += 1;
        for &m in group.members() {
            let obj = self.take(m);
            obj.for_each_owned(|child| {
                if let Value::Obj(c) = child {
                    if self.dec(c) == 0 {
                        work.push(c);
                    }
                }
            });
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) if x == y => true,
            (Value::Obj(x), Value::Obj(y)) => match (self.get(x), self.get(y)) {
                (Object::Str(s), Object::Str(t)) => s == t,
                (Object::Cons(a1, b1), Object::Cons(a2, b2)) => {
                    self.equal(*a1, *a2) && self.equal(*b1, *b2)
                }
                (Object::Struct { ty: t1, fields: f1 }, Object::Struct { ty: t2, fields: f2 }) => {
                    t1 == t2 && f1.len() == f2.len() && f1.iter().zip(f2).all(|(x, y)| self.equal(*x, *y))
                }
                _ => false,
            },
            (a, b) => a == b,
        }
    }

    /// Human-readable rendering, used by the CLI and in test assertions.
    pub fn render(&self, v: Value, types: &[StructDecl]) -> String {
        let mut out = String::new();
        self.render_into(&mut out, v, types);
        out
    }

    fn render_into(&self, out: &mut String, v: Value, types: &[StructDecl]) {
        match v {
            Value::Nil => out.push_str("nil"),
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Num(n) => {
                let _ = write!(out, "{n}");
            }
            Value::Obj(r) => match self.get(r) {
                Object::Str(s) => {
                    let _ = write!(out, "{s:?}");
                }
                Object::Cons(a, b) => {
                    out.push('(');
                    self.render_into(out, *a, types);
                    out.push_str(" . ");
                    self.render_into(out, *b, types);
                    out.push(')');
                }
                Object::Struct { ty, fields } => {
                    let name = types.get(*ty as usize).map_or("struct", |d| d.name.as_str());
                    out.push_str(name);
                    out.push('(');
                    for (i, f) in fields.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.render_into(out, *f, types);
                    }
                    out.push(')');
                }
                Object::Cell(inner) => {
                    out.push_str("ref ");
                    self.render_into(out, *inner, types);
                }
                Object::Closure(c) => {
                    let _ = write!(out, "<fn unit{}>", c.unit.0);
                }
                Object::Undefined { tag, trace } => {
                    let _ = write!(out, "undefined({tag})");
                    for loc in trace {
                        let _ = write!(out, "\n  at {loc}");
                    }
                }
            },
        }
    }

    pub fn alloc_closure(&mut self, unit: UnitId) -> Value {
        self.alloc(Object::Closure(Closure::resolved(unit)))
    }
}
