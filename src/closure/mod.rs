//! Closures and recursive scopes.
//!
//! A recursive scope is the ownership group of closures bound together by a
//! `fix`. Members may capture each other, so their reference counts alone
//! can never reach zero. Once the scope is sealed, sibling captures are held
//! weakly and a member's own count reflects only references from outside the
//! group. The group decides when the whole cluster is garbage.

use crate::bytecode::UnitId;
use crate::value::{ObjRef, Value};

/// A function value: a code unit plus its captured environment.
#[derive(Debug, Clone)]
pub struct Closure {
    pub unit: UnitId,
    pub caps: Vec<Value>,
    /// `weak[i]` marks a capture of a sibling in the same group. Weak
    /// captures hold no reference and are not released on destruction.
    pub weak: Vec<bool>,
    pub group: Option<GroupId>,
}

impl Closure {
    /// Allocated but not yet finalized (`ALCFN`).
    pub fn shell() -> Closure {
        Closure { unit: UnitId(u32::MAX), caps: Vec::new(), weak: Vec::new(), group: None }
    }

    pub fn resolved(unit: UnitId) -> Closure {
        Closure { unit, caps: Vec::new(), weak: Vec::new(), group: None }
    }

    pub fn is_finalized(&self) -> bool {
        self.unit.0 != u32::MAX
    }

    /// Captures that own a reference.
    pub fn strong_caps(&self) -> impl Iterator<Item = Value> + '_ {
        self.caps
            .iter()
            .zip(self.weak.iter().copied().chain(std::iter::repeat(false)))
            .filter(|(_, weak)| !weak)
            .map(|(v, _)| *v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

/// Outcome of a member-zero event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Some member is still referenced from outside; keep everything.
    Pending,
    /// Only internal references remain; destroy every member.
    Collect,
}

#[derive(Debug, Clone)]
pub struct Group {
    size: u32,
    rc: u32,
    members: Vec<ObjRef>,
    sealed: bool,
}

impl Group {
    pub fn new(size: u32) -> Group {
        Group { size, rc: size, members: Vec::with_capacity(size as usize), sealed: false }
    }

    pub fn join(&mut self, member: ObjRef) {
        assert!(!self.sealed, "closure joined a sealed recursive scope");
        assert!(
            self.members.len() < self.size as usize,
            "recursive scope of {} overfilled",
            self.size
        );
        self.members.push(member);
    }

    pub fn members(&self) -> &[ObjRef] {
        &self.members
    }

    pub fn rc(&self) -> u32 {
        self.rc
    }

    /// Close the scope. The group count starts at the member count; members
    /// already unreferenced from outside report their zero event right away.
    pub fn seal(&mut self, rc_of: impl Fn(ObjRef) -> u32) -> Verdict {
        assert!(!self.sealed, "recursive scope sealed twice");
        assert_eq!(
            self.members.len(),
            self.size as usize,
            "recursive scope sealed with missing members"
        );
        self.sealed = true;
        self.rc = self.size;
        let zeros = self.members.iter().filter(|&&m| rc_of(m) == 0).count();
        let mut verdict = Verdict::Pending;
        for _ in 0..zeros {
            verdict = self.on_member_zero(&rc_of);
            if verdict == Verdict::Collect {
                break;
            }
        }
        verdict
    }

    /// A member's own count reached zero.
    ///
    /// The group count drops by one; when it hits zero the members are
    /// scanned, and the group is collectible only if none of them is still
    /// referenced from outside. Otherwise the count restarts at the number
    /// of externally referenced members.
    pub fn on_member_zero(&mut self, rc_of: impl Fn(ObjRef) -> u32) -> Verdict {
        if !self.sealed {
            return Verdict::Pending;
        }
        self.rc = self.rc.saturating_sub(1);
        if self.rc > 0 {
            return Verdict::Pending;
        }
        let external = self.members.iter().filter(|&&m| rc_of(m) > 0).count() as u32;
        if external == 0 {
            Verdict::Collect
        } else {
            self.rc = external;
            Verdict::Pending
        }
    }
}
