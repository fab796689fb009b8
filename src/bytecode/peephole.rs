use std::collections::HashSet;

use super::{ConstId, Insn, InsnList, OwnOp, Reg};

/// Peephole pass run after lifetimes are fixed, before flattening.
///
/// - loads that are never read (nil constants, parameters, captures) go away
///   together with the ownership instructions attached to them;
/// - `INC r; DEC r` is dropped, `INC r; UNREF r` collapses into `DROP r`.
///
/// Returns the number of instructions removed.
pub fn cleanup(list: &mut InsnList, is_nil: impl Fn(ConstId) -> bool) -> usize {
    let mut removed = remove_unread_loads(list, &is_nil);
    removed += fold_adjacent_pairs(list);
    removed
}

fn remove_unread_loads(list: &mut InsnList, is_nil: &impl Fn(ConstId) -> bool) -> usize {
    let ids = list.ids();
    let read: HashSet<Reg> = ids.iter().flat_map(|&id| list.get(id).uses()).collect();

    let dead: HashSet<Reg> = ids
        .iter()
        .filter_map(|&id| match list.get(id) {
            Insn::Const { dst, k } if is_nil(*k) => Some(*dst),
            Insn::Param { dst, .. } | Insn::LoadCap { dst, .. } => Some(*dst),
            _ => None,
        })
        .filter(|r| !read.contains(r))
        .collect();
    if dead.is_empty() {
        return 0;
    }

    let mut removed = 0;
    for id in ids {
        let doomed = match list.get(id) {
            Insn::Const { dst, .. } | Insn::Param { dst, .. } | Insn::LoadCap { dst, .. } => {
                dead.contains(dst)
            }
            Insn::Own { reg, .. } => dead.contains(reg),
            _ => false,
        };
        if doomed && id != list.cursor() {
            list.remove(id);
            removed += 1;
        }
    }
    removed
}

fn fold_adjacent_pairs(list: &mut InsnList) -> usize {
    let mut removed = 0;
    let mut cur = list.next(list.head());
    while let Some(id) = cur {
        let next = list.next(id);
        let (Some(n), Insn::Own { op: OwnOp::Inc, reg }) = (next, list.get(id).clone()) else {
            cur = next;
            continue;
        };
        match list.get(n).clone() {
            Insn::Own { op: OwnOp::Dec, reg: r } if r == reg && id != list.cursor() && n != list.cursor() => {
                cur = list.next(n);
                list.remove(id);
                list.remove(n);
                removed += 2;
            }
            Insn::Own { op: OwnOp::Unref, reg: r } if r == reg && id != list.cursor() => {
                *list.get_mut(n) = Insn::Own { op: OwnOp::Drop, reg };
                cur = Some(n);
                list.remove(id);
                removed += 1;
            }
            _ => cur = next,
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::RegKind;

    #[test]
    fn unread_nil_load_is_removed_with_its_drop() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        let keep = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(0) });
        list.append(Insn::Own { op: OwnOp::Drop, reg: r });
        list.append(Insn::Const { dst: keep, k: ConstId(1) });
        list.append(Insn::Ret { src: keep });
        let removed = cleanup(&mut list, |k| k == ConstId(0));
        assert_eq!(removed, 2);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn non_nil_unread_constant_stays() {
        let mut list = InsnList::new();
        let r = list.new_value(RegKind::Temp);
        list.append(Insn::Const { dst: r, k: ConstId(5) });
        list.append(Insn::Own { op: OwnOp::Drop, reg: r });
        assert_eq!(cleanup(&mut list, |_| false), 0);
    }

    #[test]
    fn inc_dec_pair_vanishes_and_inc_unref_becomes_drop() {
        let mut list = InsnList::new();
        let a = list.new_value(RegKind::Temp);
        let b = list.new_value(RegKind::Temp);
        list.append(Insn::Own { op: OwnOp::Inc, reg: a });
        list.append(Insn::Own { op: OwnOp::Dec, reg: a });
        list.append(Insn::Own { op: OwnOp::Inc, reg: b });
        let unref = list.append(Insn::Own { op: OwnOp::Unref, reg: b });
        list.append(Insn::Push { src: a });
        list.append(Insn::Push { src: b });
        cleanup(&mut list, |_| false);
        assert_eq!(list.get(unref), &Insn::Own { op: OwnOp::Drop, reg: b });
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn pair_on_different_registers_is_kept() {
        let mut list = InsnList::new();
        let a = list.new_value(RegKind::Temp);
        let b = list.new_value(RegKind::Temp);
        list.append(Insn::Own { op: OwnOp::Inc, reg: a });
        list.append(Insn::Own { op: OwnOp::Unref, reg: b });
        assert_eq!(fold_adjacent_pairs(&mut list), 0);
    }
}
