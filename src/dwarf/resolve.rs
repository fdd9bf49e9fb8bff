//! Turning a row of rules into register locations for the caller's frame.

use super::expr::{evaluate, ExprResult};
use super::state::{CfaRule, RegisterRule};
use crate::arch::{Regnum, MAX_REGISTERS};
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::Result;

/// Compute the CFA from the current frame's register locations.
pub fn resolve_cfa<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    locs: &[Location; MAX_REGISTERS],
    rule: CfaRule,
) -> Result<u64> {
    let mask = acc.arch().word_mask();
    match rule {
        CfaRule::RegisterOffset { register, offset } => {
            let base = locs[usize::from(register)].read(acc, register)?;
            Ok(base.wrapping_add(offset as u64) & mask)
        }
        CfaRule::Expression(expr) => match evaluate(acc, locs, expr, None)? {
            ExprResult::Address(cfa) | ExprResult::Value(cfa) => Ok(cfa),
            ExprResult::Register(reg) => locs[usize::from(reg)].read(acc, reg),
        },
    }
}

/// Apply `rules` on top of `locs`, the current frame's locations, and return
/// the CFA together with the caller's locations. Registers without a rule
/// keep their location. Nothing is written back; a failure leaves the
/// current frame as it was.
pub fn apply_rules<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    locs: &[Location; MAX_REGISTERS],
    cfa_rule: CfaRule,
    rules: impl Iterator<Item = (Regnum, RegisterRule)>,
) -> Result<(u64, [Location; MAX_REGISTERS])> {
    let arch = acc.arch();
    let mask = arch.word_mask();
    let cfa = resolve_cfa(acc, locs, cfa_rule)?;
    let at_cfa = |offset: i64| cfa.wrapping_add(offset as u64) & mask;

    let mut caller = *locs;
    let mut sp_has_rule = false;
    for (reg, rule) in rules {
        let index = usize::from(reg);
        sp_has_rule |= reg == arch.sp;
        let loc = match rule {
            RegisterRule::Undefined => Location::None,
            RegisterRule::SameValue => locs[index],
            RegisterRule::CfaRelative(offset) => Location::mem(at_cfa(offset)),
            RegisterRule::ValCfaRelative(offset) => Location::Value(at_cfa(offset)),
            RegisterRule::InRegister(from) => locs[usize::from(from)],
            RegisterRule::Expression(expr) => match evaluate(acc, locs, expr, Some(cfa))? {
                ExprResult::Address(addr) => Location::mem(addr),
                ExprResult::Register(from) => locs[usize::from(from)],
                ExprResult::Value(value) => Location::Value(value),
            },
            RegisterRule::ValExpression(expr) => match evaluate(acc, locs, expr, Some(cfa))? {
                ExprResult::Address(value) | ExprResult::Value(value) => Location::Value(value),
                ExprResult::Register(from) => {
                    Location::Value(locs[usize::from(from)].read(acc, from)?)
                }
            },
        };
        caller[index] = loc.with_fp(arch.is_fp(reg));
    }

    if !sp_has_rule {
        caller[usize::from(arch.sp)] = Location::Value(cfa);
    }

    Ok((cfa, caller))
}
