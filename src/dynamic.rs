//! Unwind info for code generated at run time.
//!
//! A JIT has no `.eh_frame` to hand out, so it describes each region it
//! emits as a [`DynamicProc`]: a list of ops, each taking effect at a byte
//! offset into the region. Registered regions are consulted before the
//! address space's own proc-info lookup.


use core::ops::Range;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::{Arch, Regnum};
use crate::dwarf::state::{CfaRule, RegisterRule, StateRecord, Workspace};
use crate::{Error, Result};

/// Live predicate registers for targets with predicated execution.
///
/// `mask` says which predicates are known, `value` what they are. Ops
/// qualified by a predicate that is known to be false are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Predicates {
    pub mask: u64,
    pub value: u64,
}

impl Predicates {
    pub fn holds(&self, predicate: Option<u8>) -> bool {
        match predicate {
            None => true,
            Some(bit) if bit < 64 => {
                let bit = 1u64 << bit;
                self.mask & bit == 0 || self.value & bit != 0
            }
            Some(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynOpKind {
    /// CFA = `register` + `offset`.
    DefCfa { register: Regnum, offset: i64 },
    /// `register` was copied into `to`.
    SaveReg { register: Regnum, to: Regnum },
    /// `register` was stored at CFA + `offset`.
    SpillCfaRel { register: Regnum, offset: i64 },
    /// Back to the rule in effect at the start of the region.
    Restore(Regnum),
    LabelState(u64),
    CopyState(u64),
    /// Nothing to unwind past this point.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynOp {
    /// Byte offset from the start of the region at which the op takes
    /// effect.
    pub when: u64,
    /// Qualifying predicate, if any.
    pub predicate: Option<u8>,
    pub kind: DynOpKind,
}

impl DynOp {
    pub const fn at(when: u64, kind: DynOpKind) -> Self {
        Self {
            when,
            predicate: None,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicProc {
    pub name: Option<String>,
    pub start_ip: u64,
    pub end_ip: u64,
    pub return_address_column: Regnum,
    ops: Vec<DynOp>,
}

impl DynamicProc {
    /// `ops` may come in any order; ops with the same `when` keep theirs.
    pub fn new(
        name: Option<String>,
        range: Range<u64>,
        return_address_column: Regnum,
        mut ops: Vec<DynOp>,
    ) -> Result<Self> {
        if range.start >= range.end {
            return Err(Error::InvalidArgument("dynamic region covers an empty range"));
        }
        ops.sort_by_key(|op| op.when);
        Ok(Self {
            name,
            start_ip: range.start,
            end_ip: range.end,
            return_address_column,
            ops,
        })
    }

    pub fn contains(&self, ip: u64) -> bool {
        self.start_ip <= ip && ip < self.end_ip
    }

    pub fn ops(&self) -> &[DynOp] {
        &self.ops
    }
}

/// Compute the rules in effect at `ip` inside `proc`.
pub fn build_state(
    arch: &Arch,
    ws: &mut Workspace,
    proc: &DynamicProc,
    ip: u64,
    predicates: Predicates,
) -> Result<StateRecord> {
    if !proc.contains(ip) {
        return Err(Error::NoInfo(ip));
    }
    let reg = |r: Regnum| arch.check_reg(u64::from(r));
    let mut state = StateRecord::new(arch, reg(proc.return_address_column)?);
    let offset = ip - proc.start_ip;

    ws.reset();
    for op in proc.ops.iter().take_while(|op| op.when <= offset) {
        if !predicates.holds(op.predicate) {
            continue;
        }
        trace!("{:#x}: {:?}", proc.start_ip + op.when, op.kind);
        let current = &mut state.current;
        match op.kind {
            DynOpKind::DefCfa { register, offset } => {
                current.cfa = CfaRule::RegisterOffset {
                    register: reg(register)?,
                    offset,
                }
            }
            DynOpKind::SaveReg { register, to } => {
                let to = reg(to)?;
                current.set(u64::from(register), RegisterRule::InRegister(to))?;
            }
            DynOpKind::SpillCfaRel { register, offset } => {
                current.set(u64::from(register), RegisterRule::CfaRelative(offset))?
            }
            DynOpKind::Restore(register) => {
                let rule = state.initial.get(u64::from(register))?;
                current.set(u64::from(register), rule)?;
            }
            DynOpKind::LabelState(label) => ws.label(label, current)?,
            DynOpKind::CopyState(label) => *current = ws.labeled(label)?.clone(),
            DynOpKind::Stop => return Err(Error::StopUnwind),
        }
    }

    Ok(state)
}

/// The regions registered with one unwinder, sorted by start address.
#[derive(Debug, Default)]
pub struct DynamicRegistry {
    procs: spin::RwLock<Vec<Arc<DynamicProc>>>,
}

impl DynamicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proc: DynamicProc) -> Result<Arc<DynamicProc>> {
        let mut procs = self.procs.write();
        let index = procs.partition_point(|p| p.start_ip < proc.start_ip);
        let overlaps_prev = index > 0 && procs[index - 1].end_ip > proc.start_ip;
        let overlaps_next = procs.get(index).is_some_and(|p| p.start_ip < proc.end_ip);
        if overlaps_prev || overlaps_next {
            return Err(Error::InvalidArgument("dynamic region overlaps a registered one"));
        }
        let proc = Arc::new(proc);
        procs.insert(index, proc.clone());
        debug!(
            "registered dynamic region {:#x}..{:#x}",
            proc.start_ip, proc.end_ip
        );
        Ok(proc)
    }

    pub fn unregister(&self, start_ip: u64) -> Option<Arc<DynamicProc>> {
        let mut procs = self.procs.write();
        let index = procs.iter().position(|p| p.start_ip == start_ip)?;
        debug!("unregistered dynamic region at {start_ip:#x}");
        Some(procs.remove(index))
    }

    /// The region covering `ip`. A registry that is being modified right now
    /// counts as having nothing.
    pub fn find(&self, ip: u64) -> Option<Arc<DynamicProc>> {
        let procs = self.procs.try_read()?;
        let index = procs.partition_point(|p| p.start_ip <= ip).checked_sub(1)?;
        let proc = &procs[index];
        proc.contains(ip).then(|| proc.clone())
    }

    pub fn len(&self) -> usize {
        self.procs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
