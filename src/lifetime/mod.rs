//! Lifetime analysis: decides for every register how its ownership is
//! released and where, then inserts the ownership instructions.
//!
//! A register either starts *floating* (the producing instruction leaves the
//! value with no extra owner) or *owned* (phi registers and closure shells
//! already hold a reference when they come into existence). The analyzer
//! walks all control paths from the creation point:
//!
//! - no use anywhere: release right after creation (`DROP` when floating,
//!   `UNREF` when owned);
//! - otherwise a floating register is acquired (`INC`) right after creation,
//!   each non-killing last use is followed by `UNREF`, and a killing last use
//!   (`RET`, `APPLYTC`) consumes the reference itself;
//! - at a branch whose arms disagree, the arm without a use releases at its
//!   start so both arms reach the join with the same count.
//!
//! [`check_balance`] re-walks the finished graph and simulates the owned
//! count along every path.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use crate::bytecode::{Insn, InsnId, InsnList, OwnOp, Reg, RegInfo, RegKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeReport {
    pub tracked: usize,
    pub acquires: usize,
    pub drops: usize,
    pub unrefs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("{reg} is used at {at} after its release")]
    UseAfterRelease { reg: Reg, at: InsnId },
    #[error("{reg} released at {at} without an owned reference")]
    Underflow { reg: Reg, at: InsnId },
    #[error("{reg} still owned when the path ends at {at}")]
    Leak { reg: Reg, at: InsnId },
    #[error("{reg} dropped at {at} while still owned")]
    DropOwned { reg: Reg, at: InsnId },
    #[error("{reg} has {count} definitions")]
    Definitions { reg: Reg, count: usize },
    #[error("{reg} is touched at {at} after its container {container} was released")]
    OutlivesContainer { reg: Reg, container: Reg, at: InsnId },
}

/// Registers whose ownership is managed. Flags and statically immediate
/// values carry no reference count.
pub fn is_tracked(info: RegInfo) -> bool {
    info.kind != RegKind::Flag && !info.ty.is_some_and(|t| t.is_immediate())
}

fn starts_owned(info: RegInfo) -> bool {
    info.kind == RegKind::Phi
}

fn definitions(list: &InsnList) -> HashMap<Reg, Vec<InsnId>> {
    let mut defs: HashMap<Reg, Vec<InsnId>> = HashMap::new();
    for id in list.ids() {
        if let Some(r) = list.get(id).def() {
            defs.entry(r).or_default().push(id);
        }
    }
    defs
}

/// `live[id]`: some path starting at `id` (inclusive) uses `r`.
fn liveness(list: &InsnList, r: Reg, start: InsnId) -> HashMap<InsnId, bool> {
    let mut live: HashMap<InsnId, bool> = HashMap::new();
    let mut on_path: HashSet<InsnId> = HashSet::new();
    let mut stack: Vec<(InsnId, bool)> = vec![(start, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            on_path.remove(&id);
            let succ_live = list.successors(id).iter().any(|s| live.get(s).copied().unwrap_or(false));
            live.insert(id, list.get(id).uses_reg(r) || succ_live);
            continue;
        }
        if live.contains_key(&id) {
            continue;
        }
        if !on_path.insert(id) {
            panic!("lifetime analysis: loops are not supported (back edge into {id})");
        }
        stack.push((id, true));
        for s in list.successors(id) {
            if on_path.contains(&s) {
                panic!("lifetime analysis: loops are not supported (back edge into {s})");
            }
            if !live.contains_key(&s) {
                stack.push((s, false));
            }
        }
    }
    live
}

fn live_after(list: &InsnList, live: &HashMap<InsnId, bool>, id: InsnId) -> bool {
    list.successors(id).iter().any(|s| live.get(s).copied().unwrap_or(false))
}

/// Compute and insert the ownership instructions for every register.
pub fn fix_lifetimes(list: &mut InsnList) -> LifetimeReport {
    let defs = definitions(list);
    let mut edits: BTreeMap<InsnId, Vec<(OwnOp, Reg)>> = BTreeMap::new();
    let mut report = LifetimeReport::default();

    let mut regs: Vec<Reg> = defs.keys().copied().collect();
    regs.sort();
    for r in regs {
        let info = list.reg_info(r);
        if !is_tracked(info) {
            continue;
        }
        let sites = &defs[&r];
        if sites.len() != 1 {
            panic!("lifetime analysis: {r} has {} definitions", sites.len());
        }
        report.tracked += 1;
        plan_register(list, r, sites[0], starts_owned(info), &mut edits);
    }

    // A borrowed load (`LDFLD`, `DEREF`) shares its anchor with the last use
    // of its container, so it must be dropped before the container goes.
    for (anchor, mut ops) in edits {
        ops.sort_by_key(|(op, r)| (anchor_rank(*op), *r));
        let mut at = anchor;
        for (op, reg) in ops {
            match op {
                OwnOp::Inc => report.acquires += 1,
                OwnOp::Drop => report.drops += 1,
                OwnOp::Unref | OwnOp::Dec => report.unrefs += 1,
            }
            at = list.insert_after(at, Insn::Own { op, reg });
        }
    }
    report
}

fn anchor_rank(op: OwnOp) -> u8 {
    match op {
        OwnOp::Inc => 0,
        OwnOp::Drop => 1,
        OwnOp::Dec | OwnOp::Unref => 2,
    }
}

fn plan_register(
    list: &InsnList,
    r: Reg,
    created: InsnId,
    owned: bool,
    edits: &mut BTreeMap<InsnId, Vec<(OwnOp, Reg)>>,
) {
    let Some(first) = list.next(created) else {
        panic!("lifetime analysis: {r} created at the end sentinel");
    };
    let live = liveness(list, r, first);

    if !live[&first] {
        let op = if owned { OwnOp::Unref } else { OwnOp::Drop };
        trace!(reg = %r, at = %created, op = op.mnemonic(), "unused value");
        edits.entry(created).or_default().push((op, r));
        return;
    }
    if !owned {
        edits.entry(created).or_default().push((OwnOp::Inc, r));
    }

    let mut reachable: Vec<InsnId> = live.keys().copied().collect();
    reachable.sort();
    for id in reachable {
        let insn = list.get(id);
        if let Insn::If { else_, .. } = insn {
            let then_live = list.next(id).is_some_and(|t| live.get(&t).copied().unwrap_or(false));
            let else_live = live.get(else_).copied().unwrap_or(false);
            if then_live && !else_live {
                let label = *else_;
                if !matches!(list.get(label), Insn::Nop | Insn::Phi { .. }) {
                    panic!("lifetime analysis: else target {label} is not a label");
                }
                trace!(reg = %r, arm = "else", at = %label, "balancing release");
                edits.entry(label).or_default().push((OwnOp::Unref, r));
            } else if else_live && !then_live {
                trace!(reg = %r, arm = "then", at = %id, "balancing release");
                edits.entry(id).or_default().push((OwnOp::Unref, r));
            }
            continue;
        }
        if insn.uses_reg(r) && !insn.kills(r) && !live_after(list, &live, id) {
            if insn.is_path_end() {
                panic!("lifetime analysis: {r} read by path end {id} without being consumed");
            }
            trace!(reg = %r, at = %id, "last use");
            edits.entry(id).or_default().push((OwnOp::Unref, r));
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PathState {
    count: u32,
    dead: bool,
}

/// Walk every path from `r`'s creation and verify that it is released
/// exactly once and never touched afterwards.
pub fn check_balance(list: &InsnList, r: Reg) -> Result<(), BalanceError> {
    let info = list.reg_info(r);
    if !is_tracked(info) {
        return Ok(());
    }
    let sites: Vec<InsnId> = list.ids().into_iter().filter(|&id| list.get(id).def() == Some(r)).collect();
    if sites.len() != 1 {
        return Err(BalanceError::Definitions { reg: r, count: sites.len() });
    }
    let created = sites[0];
    let start = PathState { count: u32::from(starts_owned(info)), dead: false };

    let mut seen: HashSet<(InsnId, PathState)> = HashSet::new();
    let mut work: Vec<(InsnId, PathState)> = list.successors(created).into_iter().map(|s| (s, start)).collect();
    if work.is_empty() {
        return Err(BalanceError::Leak { reg: r, at: created });
    }

    while let Some((id, mut st)) = work.pop() {
        if !seen.insert((id, st)) {
            continue;
        }
        let insn = list.get(id);
        match insn {
            Insn::Own { op, reg } if *reg == r => {
                if st.dead {
                    return Err(BalanceError::UseAfterRelease { reg: r, at: id });
                }
                match op {
                    OwnOp::Inc => st.count += 1,
                    OwnOp::Dec => {
                        if st.count == 0 {
                            return Err(BalanceError::Underflow { reg: r, at: id });
                        }
                        st.count -= 1;
                    }
                    OwnOp::Unref => {
                        if st.count == 0 {
                            return Err(BalanceError::Underflow { reg: r, at: id });
                        }
                        st.count -= 1;
                        st.dead = st.count == 0;
                    }
                    OwnOp::Drop => {
                        if st.count != 0 {
                            return Err(BalanceError::DropOwned { reg: r, at: id });
                        }
                        st.dead = true;
                    }
                }
            }
            _ if insn.uses_reg(r) => {
                if st.dead {
                    return Err(BalanceError::UseAfterRelease { reg: r, at: id });
                }
                if insn.kills(r) {
                    if st.count == 0 {
                        return Err(BalanceError::Underflow { reg: r, at: id });
                    }
                    st.count -= 1;
                    st.dead = true;
                }
            }
            _ => {}
        }

        let succ = list.successors(id);
        if succ.is_empty() {
            if !st.dead || st.count != 0 {
                return Err(BalanceError::Leak { reg: r, at: id });
            }
            continue;
        }
        work.extend(succ.into_iter().map(|s| (s, st)));
    }
    Ok(())
}

/// Owned count after `insn`, without validating it.
fn advance(insn: &Insn, r: Reg, mut st: PathState) -> PathState {
    match insn {
        Insn::Own { op, reg } if *reg == r => match op {
            OwnOp::Inc => st.count += 1,
            OwnOp::Dec => st.count = st.count.saturating_sub(1),
            OwnOp::Unref => {
                st.count = st.count.saturating_sub(1);
                st.dead = st.count == 0;
            }
            OwnOp::Drop => st.dead = st.count == 0,
        },
        _ if insn.kills(r) => {
            st.count = st.count.saturating_sub(1);
            st.dead = true;
        }
        _ => {}
    }
    st
}

fn touches(insn: &Insn, r: Reg) -> bool {
    insn.uses_reg(r) || matches!(insn, Insn::Own { reg, .. } if *reg == r)
}

/// A value read out of a container (`LDFLD`, `DEREF`) is kept alive only by
/// that container until it is acquired. Walk every path from the container's
/// creation and reject any touch of `load` while it owns nothing and the
/// container is already released.
pub fn check_borrow(list: &InsnList, load: Reg, container: Reg) -> Result<(), BalanceError> {
    let info = list.reg_info(container);
    if !is_tracked(info) || !is_tracked(list.reg_info(load)) {
        return Ok(());
    }
    let sites: Vec<InsnId> = list.ids().into_iter().filter(|&id| list.get(id).def() == Some(container)).collect();
    let &[created] = sites.as_slice() else {
        return Ok(());
    };
    let start = PathState { count: u32::from(starts_owned(info)), dead: false };

    type State = (PathState, Option<PathState>);
    let mut seen: HashSet<(InsnId, State)> = HashSet::new();
    let mut work: Vec<(InsnId, State)> = list.successors(created).into_iter().map(|s| (s, (start, None))).collect();

    while let Some((id, (outer, inner))) = work.pop() {
        if !seen.insert((id, (outer, inner))) {
            continue;
        }
        let insn = list.get(id);
        let inner = match inner {
            Some(st) => {
                if st.count == 0 && outer.dead && touches(insn, load) {
                    return Err(BalanceError::OutlivesContainer { reg: load, container, at: id });
                }
                Some(advance(insn, load, st))
            }
            None if insn.def() == Some(load) => Some(PathState { count: 0, dead: false }),
            None => None,
        };
        let outer = advance(insn, container, outer);
        work.extend(list.successors(id).into_iter().map(|s| (s, (outer, inner))));
    }
    Ok(())
}

/// Check every register of a finished unit, then every borrowed load
/// against its container.
pub fn check_unit(list: &InsnList) -> Result<(), BalanceError> {
    for r in 0..list.reg_count() {
        let r = Reg(r);
        let defined = list.ids().into_iter().any(|id| list.get(id).def() == Some(r));
        if defined {
            check_balance(list, r)?;
        }
    }
    for id in list.ids() {
        match list.get(id) {
            Insn::Field { dst, src, .. } => check_borrow(list, *dst, *src)?,
            Insn::Deref { dst, cell } => check_borrow(list, *dst, *cell)?,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ConstId, VType};

    fn own(list: &InsnList) -> Vec<(OwnOp, Reg)> {
        list.ids()
            .into_iter()
            .filter_map(|id| match list.get(id) {
                Insn::Own { op, reg } => Some((*op, *reg)),
                _ => None,
            })
            .collect()
    }

    /// Build `IF t then { then_body } else { else_body }` with a trailing join label.
    fn branch(list: &mut InsnList, t: Reg, then_body: Vec<Insn>, else_body: Vec<Insn>) -> (InsnId, InsnId, InsnId) {
        let iff = list.append(Insn::If { test: t, else_: InsnId(0) });
        for i in then_body {
            list.append(i);
        }
        let jmp = list.append(Insn::Jmp { target: InsnId(0) });
        let else_label = list.append(Insn::Nop);
        for i in else_body {
            list.append(i);
        }
        let join = list.append(Insn::Nop);
        *list.get_mut(iff) = Insn::If { test: t, else_: else_label };
        *list.get_mut(jmp) = Insn::Jmp { target: join };
        (iff, else_label, join)
    }

    #[test]
    fn unused_value_is_dropped_at_creation() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let c = list.append(Insn::Const { dst: r, k: ConstId(0) });
        let report = fix_lifetimes(&mut list);
        assert_eq!(report.drops, 1);
        assert_eq!(list.get(list.next(c).unwrap()), &Insn::Own { op: OwnOp::Drop, reg: r });
        check_unit(&list).unwrap();
    }

    #[test]
    fn read_value_is_acquired_then_unrefd_after_last_use() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let s = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        list.append(Insn::Push { src: r });
        let last = list.append(Insn::Push { src: r });
        list.append(Insn::Const { dst: s, k: ConstId(1) });
        list.append(Insn::Ret { src: s });
        fix_lifetimes(&mut list);
        assert_eq!(
            own(&list),
            vec![(OwnOp::Inc, r), (OwnOp::Unref, r), (OwnOp::Inc, s)]
        );
        assert_eq!(list.get(list.next(last).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: r });
        check_unit(&list).unwrap();
    }

    #[test]
    fn return_consumes_the_reference() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Param);
        list.append(Insn::Param { dst: r, idx: 0 });
        list.append(Insn::Ret { src: r });
        let report = fix_lifetimes(&mut list);
        assert_eq!(report.acquires, 1);
        assert_eq!(report.unrefs, 0);
        check_unit(&list).unwrap();
    }

    #[test]
    fn arm_without_use_releases_at_its_start() {
        let mut list = InsnList::new();
        let t = list.new_value(RegKind::Flag);
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::SetFlag { dst: t, value: true });
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        let (_, else_label, _) = branch(&mut list, t, vec![Insn::Push { src: r }], vec![]);
        list.append(Insn::Ret { src: t });
        fix_lifetimes(&mut list);
        assert_eq!(list.get(list.next(else_label).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: r });
        check_unit(&list).unwrap();
    }

    #[test]
    fn then_arm_release_when_only_else_uses() {
        let mut list = InsnList::new();
        let t = list.new_value(RegKind::Flag);
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::SetFlag { dst: t, value: false });
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        let (iff, _, _) = branch(&mut list, t, vec![], vec![Insn::Push { src: r }]);
        list.append(Insn::Ret { src: t });
        fix_lifetimes(&mut list);
        assert_eq!(list.get(list.next(iff).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: r });
        check_unit(&list).unwrap();
    }

    #[test]
    fn early_return_arm_releases_values_live_after_join() {
        let mut list = InsnList::new();
        let t = list.new_value(RegKind::Flag);
        let x = list.new_value(RegKind::Temp);
        let y = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: x, k: ConstId(0) });
        list.append(Insn::Const { dst: y, k: ConstId(1) });
        list.append(Insn::TestTy { dst: t, src: y, ty: crate::ir::Ty::Undefined });
        branch(&mut list, t, vec![Insn::Ret { src: y }], vec![]);
        list.append(Insn::Push { src: x });
        list.append(Insn::Ret { src: y });
        fix_lifetimes(&mut list);
        check_unit(&list).unwrap();
    }

    #[test]
    fn phi_register_starts_owned() {
        let mut list = InsnList::new();
        let t = list.new_value(RegKind::Flag);
        let a = list.new_value(RegKind::Temp);
        let p = list.new_value(RegKind::Phi);
        list.append(Insn::SetFlag { dst: t, value: true });
        list.append(Insn::Const { dst: a, k: ConstId(0) });
        let (_, _, join) = branch(
            &mut list,
            t,
            vec![Insn::Mov { dst: p, src: a }],
            vec![Insn::Mov { dst: p, src: a }],
        );
        let phi = list.insert_after(join, Insn::Phi { dst: p });
        list.append(Insn::Nop);
        fix_lifetimes(&mut list);
        assert_eq!(list.get(list.next(phi).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: p });
        check_unit(&list).unwrap();
    }

    #[test]
    fn acquire_precedes_release_on_shared_anchor() {
        let mut list = InsnList::new();
        let s = list.new_value(RegKind::Temp);
        let f = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: s, k: ConstId(0) });
        let load = list.append(Insn::Field { dst: f, src: s, idx: 0 });
        list.append(Insn::Ret { src: f });
        fix_lifetimes(&mut list);
        let after = list.next(load).unwrap();
        assert_eq!(list.get(after), &Insn::Own { op: OwnOp::Inc, reg: f });
        assert_eq!(list.get(list.next(after).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: s });
    }

    #[test]
    fn immediates_and_flags_are_untracked() {
        let mut list = InsnList::new();
        let n = list.new_value(RegKind::Temp);
        list.set_type(n, Some(VType::Num));
        let t = list.new_value(RegKind::Flag);
        list.append(Insn::Const { dst: n, k: ConstId(0) });
        list.append(Insn::SetFlag { dst: t, value: true });
        let report = fix_lifetimes(&mut list);
        assert_eq!(report.tracked, 0);
        assert!(own(&list).is_empty());
    }

    #[test]
    fn checker_rejects_use_after_unref() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        list.append(Insn::Own { op: OwnOp::Inc, reg: r });
        list.append(Insn::Own { op: OwnOp::Unref, reg: r });
        let push = list.append(Insn::Push { src: r });
        assert_eq!(check_balance(&list, r), Err(BalanceError::UseAfterRelease { reg: r, at: push }));
    }

    #[test]
    fn checker_rejects_leak() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        list.append(Insn::Push { src: r });
        assert!(matches!(check_balance(&list, r), Err(BalanceError::Leak { .. })));
    }

    #[test]
    #[should_panic(expected = "definitions")]
    fn double_definition_is_fatal() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        list.append(Insn::Const { dst: r, k: ConstId(1) });
        fix_lifetimes(&mut list);
    }

    /// Random structured graphs: straight-line reads, nested branches and
    /// early returns. Every register must come out balanced.
    #[test]
    fn unused_field_is_dropped_before_its_container() {
        let mut list = InsnList::new();
        let s = list.new_value(RegKind::Temp);
        let f = list.new_value(RegKind::Temp);
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: s, k: ConstId(0) });
        let load = list.append(Insn::Field { dst: f, src: s, idx: 0 });
        list.append(Insn::Const { dst: r, k: ConstId(1) });
        list.append(Insn::Ret { src: r });
        fix_lifetimes(&mut list);
        let first = list.next(load).unwrap();
        assert_eq!(list.get(first), &Insn::Own { op: OwnOp::Drop, reg: f });
        assert_eq!(list.get(list.next(first).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: s });
        check_unit(&list).unwrap();
    }

    #[test]
    fn unused_deref_is_dropped_before_its_cell() {
        let mut list = InsnList::new();
        let v = list.new_value(RegKind::Temp);
        let c = list.new_value(RegKind::Temp);
        let d = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: v, k: ConstId(0) });
        list.append(Insn::Var { dst: c, src: v });
        let load = list.append(Insn::Deref { dst: d, cell: c });
        list.append(Insn::Ret { src: v });
        fix_lifetimes(&mut list);
        let first = list.next(load).unwrap();
        assert_eq!(list.get(first), &Insn::Own { op: OwnOp::Drop, reg: d });
        assert_eq!(list.get(list.next(first).unwrap()), &Insn::Own { op: OwnOp::Unref, reg: c });
        check_unit(&list).unwrap();
    }

    #[test]
    fn touching_a_load_after_its_container_is_released_is_rejected() {
        let mut list = InsnList::new();
        let s = list.new_value(RegKind::Temp);
        let f = list.new_value(RegKind::Temp);
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: s, k: ConstId(0) });
        list.append(Insn::Own { op: OwnOp::Inc, reg: s });
        list.append(Insn::Field { dst: f, src: s, idx: 0 });
        list.append(Insn::Own { op: OwnOp::Unref, reg: s });
        let drop = list.append(Insn::Own { op: OwnOp::Drop, reg: f });
        list.append(Insn::Const { dst: r, k: ConstId(1) });
        list.append(Insn::Own { op: OwnOp::Inc, reg: r });
        list.append(Insn::Ret { src: r });
        assert!(check_balance(&list, f).is_ok());
        assert_eq!(
            check_borrow(&list, f, s),
            Err(BalanceError::OutlivesContainer { reg: f, container: s, at: drop })
        );
    }

    #[test]
    #[should_panic(expected = "loops are not supported")]
    fn back_edge_is_reported_as_unsupported() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        let head = list.append(Insn::Push { src: r });
        list.append(Insn::Jmp { target: head });
        fix_lifetimes(&mut list);
    }

    #[test]
    fn random_graphs_balance() {
        fn gen_block(rng: &mut fastrand::Rng, list: &mut InsnList, live: &mut Vec<Reg>, depth: u32) -> bool {
            let steps = rng.usize(1..6);
            for _ in 0..steps {
                match rng.u32(0..12) {
                    0..=3 => {
                        let r = list.new_value(RegKind::Temp);
                        list.append(Insn::Const { dst: r, k: ConstId(0) });
                        live.push(r);
                    }
                    4..=6 if !live.is_empty() => {
                        let r = live[rng.usize(..live.len())];
                        list.append(Insn::Push { src: r });
                    }
                    7 | 8 if depth < 3 => {
                        let t = list.new_value(RegKind::Flag);
                        list.append(Insn::SetFlag { dst: t, value: rng.bool() });
                        let iff = list.append(Insn::If { test: t, else_: InsnId(0) });
                        let mut inner = live.clone();
                        let then_ended = gen_block(rng, list, &mut inner, depth + 1);
                        let jmp = list.append(Insn::Jmp { target: InsnId(0) });
                        let else_label = list.append(Insn::Nop);
                        let mut inner = live.clone();
                        let else_ended = gen_block(rng, list, &mut inner, depth + 1);
                        let join = list.append(Insn::Nop);
                        *list.get_mut(iff) = Insn::If { test: t, else_: else_label };
                        *list.get_mut(jmp) = Insn::Jmp { target: join };
                        if then_ended && else_ended {
                            return true;
                        }
                    }
                    9 if !live.is_empty() && depth > 0 => {
                        let r = live[rng.usize(..live.len())];
                        list.append(Insn::Ret { src: r });
                        return true;
                    }
                    10 | 11 if !live.is_empty() => {
                        let src = live[rng.usize(..live.len())];
                        let r = list.new_value(RegKind::Temp);
                        list.append(Insn::Field { dst: r, src, idx: 0 });
                        live.push(r);
                    }
                    _ => {}
                }
            }
            false
        }

        for seed in 0..200 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut list = InsnList::new();
            let mut live = Vec::new();
            gen_block(&mut rng, &mut list, &mut live, 0);
            let r = list.new_value(RegKind::Temp);
            list.append(Insn::Const { dst: r, k: ConstId(0) });
            list.append(Insn::Ret { src: r });
            fix_lifetimes(&mut list);
            if let Err(e) = check_unit(&list) {
                panic!("seed {seed}: {e}\n{list}");
            }
        }
    }
}
