//! Pattern matching.
//!
//! - without an else arm the match cannot fail: a `GUARD` asserts the type
//!   and the fields are bound directly;
//! - a single-level pattern with an else arm is one type test and one branch;
//! - nested patterns open one branch per level and close them all on the
//!   failure path, which sets a flag instead of jumping out of the nest.
//!
//! A scrutinee whose static type decides the match emits only the arm that
//! can run.

use super::{Branch, CompileError, Emitter, FnBuilder, Result};
use crate::bytecode::{Insn, Reg, RegKind, VType};
use crate::ir::{Ir, Pattern, Ty};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fit {
    Always,
    Never,
    Unknown,
}

fn static_fit(ty: Option<VType>, pattern: &Pattern) -> Fit {
    match pattern {
        Pattern::Bind | Pattern::Ignore => Fit::Always,
        Pattern::Unpack { ty: want, fields } => match ty {
            Some(VType::Obj(have)) if have == *want => {
                if fields.iter().all(|(_, p)| p.depth() == 0) {
                    Fit::Always
                } else {
                    Fit::Unknown
                }
            }
            Some(_) => Fit::Never,
            None => Fit::Unknown,
        },
    }
}

impl Emitter<'_> {
    pub(super) fn lower_match(
        &mut self,
        b: &mut FnBuilder,
        pattern: &Pattern,
        value: &Ir,
        then: &Ir,
        else_: Option<&Ir>,
        tail: bool,
    ) -> Result<Option<Reg>> {
        let v = self.emit(b, value)?;
        let height = b.stack.len();

        let Some(else_) = else_ else {
            self.bind_leaking(b, v, pattern)?;
            let out = self.lower(b, then, tail)?;
            b.stack.truncate(height);
            return Ok(out);
        };

        match static_fit(b.ty(v), pattern) {
            Fit::Always => {
                self.bind_leaking(b, v, pattern)?;
                let out = self.lower(b, then, tail)?;
                b.stack.truncate(height);
                Ok(out)
            }
            Fit::Never => {
                self.check_pattern(pattern)?;
                self.lower(b, else_, tail)
            }
            Fit::Unknown if pattern.depth() <= 1 => self.match_single(b, v, pattern, then, else_, tail),
            Fit::Unknown => self.match_nested(b, v, pattern, then, else_, tail),
        }
    }

    fn field_count(&self, ty: Ty) -> Result<usize> {
        match ty {
            Ty::Cons => Ok(2),
            Ty::Undefined => Ok(1),
            Ty::Struct(id) => self
                .types
                .get(id as usize)
                .map(|d| d.fields.len())
                .ok_or(CompileError::UnknownStruct { ty: id }),
        }
    }

    fn check_pattern(&self, pattern: &Pattern) -> Result<()> {
        let Pattern::Unpack { ty, fields } = pattern else {
            return Ok(());
        };
        let count = self.field_count(*ty)?;
        for (offset, sub) in fields {
            if *offset >= count {
                let ty = match ty {
                    Ty::Struct(id) => self.types[*id as usize].name.clone(),
                    Ty::Cons => "cons".to_string(),
                    Ty::Undefined => "undefined".to_string(),
                };
                return Err(CompileError::FieldOutOfRange { ty, field: *offset });
            }
            self.check_pattern(sub)?;
        }
        Ok(())
    }

    fn load_field(&mut self, b: &mut FnBuilder, src: Reg, ty: Ty, idx: usize) -> Reg {
        let field_ty = match ty {
            Ty::Undefined => Some(VType::Str),
            _ => None,
        };
        let dst = b.value(RegKind::Temp, field_ty);
        b.write(Insn::Field { dst, src, idx: idx as u32 });
        dst
    }

    /// Bind a pattern that must match. A failed type test is fatal.
    fn bind_leaking(&mut self, b: &mut FnBuilder, v: Reg, pattern: &Pattern) -> Result<()> {
        match pattern {
            Pattern::Bind => b.push(v),
            Pattern::Ignore => {}
            Pattern::Unpack { ty, fields } => {
                self.check_pattern(pattern)?;
                if b.ty(v) != Some(VType::Obj(*ty)) {
                    b.write(Insn::Guard { src: v, ty: *ty });
                }
                self.bind_fields(b, v, *ty, fields)?;
            }
        }
        Ok(())
    }

    fn bind_fields(&mut self, b: &mut FnBuilder, v: Reg, ty: Ty, fields: &[(usize, Pattern)]) -> Result<()> {
        for (offset, sub) in fields {
            if matches!(sub, Pattern::Ignore) {
                continue;
            }
            let f = self.load_field(b, v, ty, *offset);
            self.bind_leaking(b, f, sub)?;
        }
        Ok(())
    }

    fn match_single(
        &mut self,
        b: &mut FnBuilder,
        v: Reg,
        pattern: &Pattern,
        then: &Ir,
        else_: &Ir,
        tail: bool,
    ) -> Result<Option<Reg>> {
        let Pattern::Unpack { ty, fields } = pattern else {
            unreachable!("irrefutable patterns always fit");
        };
        self.check_pattern(pattern)?;
        let height = b.stack.len();
        let t = b.value(RegKind::Flag, None);
        b.write(Insn::TestTy { dst: t, src: v, ty: *ty });
        let mut br = b.branch(t);

        let phi = if tail { None } else { Some(b.value(RegKind::Phi, None)) };
        self.bind_fields(b, v, *ty, fields)?;
        let x = self.arm(b, then, phi)?;
        b.stack.truncate(height);
        b.else_arm(&mut br);
        let y = self.arm(b, else_, phi)?;
        b.stack.truncate(height);
        b.join(br, phi);
        if let (Some(phi), Some(x), Some(y)) = (phi, x, y) {
            b.unify(phi, x, y);
        }
        Ok(phi)
    }

    fn match_nested(
        &mut self,
        b: &mut FnBuilder,
        v: Reg,
        pattern: &Pattern,
        then: &Ir,
        else_: &Ir,
        tail: bool,
    ) -> Result<Option<Reg>> {
        self.check_pattern(pattern)?;
        let height = b.stack.len();

        if tail {
            let mut levels = Vec::new();
            self.open_levels(b, v, pattern, &mut levels);
            self.emit_tail(b, then)?;
            b.stack.truncate(height);
            for mut br in levels.into_iter().rev() {
                b.else_arm(&mut br);
                b.join(br, None);
            }
            self.emit_tail(b, else_)?;
            return Ok(None);
        }

        let unmatched = b.value(RegKind::Flag, None);
        b.write(Insn::SetFlag { dst: unmatched, value: true });
        let phi = b.value(RegKind::Phi, None);
        let mut levels = Vec::new();
        self.open_levels(b, v, pattern, &mut levels);
        b.write(Insn::SetFlag { dst: unmatched, value: false });
        let x = self.emit(b, then)?;
        b.write(Insn::Mov { dst: phi, src: x });
        b.stack.truncate(height);
        for mut br in levels.into_iter().rev() {
            b.else_arm(&mut br);
            b.join(br, None);
        }

        let mut br = b.branch(unmatched);
        let y = self.emit(b, else_)?;
        b.write(Insn::Mov { dst: phi, src: y });
        b.stack.truncate(height);
        b.else_arm(&mut br);
        b.join(br, Some(phi));
        b.unify(phi, x, y);
        Ok(Some(phi))
    }

    /// Emit one arm, moving its value into `phi` unless it is a tail arm.
    fn arm(&mut self, b: &mut FnBuilder, body: &Ir, phi: Option<Reg>) -> Result<Option<Reg>> {
        match phi {
            Some(dst) => {
                let src = self.emit(b, body)?;
                b.write(Insn::Mov { dst, src });
                Ok(Some(src))
            }
            None => {
                self.emit_tail(b, body)?;
                Ok(None)
            }
        }
    }

    /// Test and destructure one nesting level at a time. Every level that
    /// needs a runtime test leaves an open branch in `levels`; fields are
    /// loaded only once their container's test has passed.
    fn open_levels(&mut self, b: &mut FnBuilder, v: Reg, pattern: &Pattern, levels: &mut Vec<Branch>) {
        match pattern {
            Pattern::Bind => b.push(v),
            Pattern::Ignore => {}
            Pattern::Unpack { ty, fields } => {
                if b.ty(v) != Some(VType::Obj(*ty)) {
                    let t = b.value(RegKind::Flag, None);
                    b.write(Insn::TestTy { dst: t, src: v, ty: *ty });
                    levels.push(b.branch(t));
                }
                for (offset, sub) in fields {
                    if matches!(sub, Pattern::Ignore) {
                        continue;
                    }
                    let f = self.load_field(b, v, *ty, *offset);
                    self.open_levels(b, f, sub, levels);
                }
            }
        }
    }
}
