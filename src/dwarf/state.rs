//! Rule tables: one row of the CFI table, and the bookkeeping the
//! interpreter needs to produce it.

use arrayvec::ArrayVec;

use crate::arch::{Arch, Regnum, MAX_REGISTERS};
use crate::{Error, Result};

/// How to recover a register's value in the previous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRule {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    /// (By convention, it is preserved by the callee, but the callee has not
    /// modified it.)
    SameValue,
    /// The previous value of this register is saved at the address CFA+N where
    /// CFA is the current CFA value and N is a signed offset
    CfaRelative(i64),
    /// The previous value of this register is the value CFA+N where CFA is the
    /// current CFA value and N is a signed offset.
    ValCfaRelative(i64),
    /// The previous value of this register is stored in another register
    /// numbered R.
    InRegister(Regnum),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression stored at this address (a ULEB128
    /// length followed by the expression bytes).
    Expression(u64),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression stored at this address.
    ValExpression(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule {
    RegisterOffset { register: Regnum, offset: i64 },
    /// Address of a length-prefixed expression computing the CFA.
    Expression(u64),
}

/// One complete row: the CFA rule plus a rule per register column.
#[derive(Clone, PartialEq, Eq)]
pub struct RuleTable {
    pub cfa: CfaRule,
    rules: [RegisterRule; MAX_REGISTERS],
    num_regs: Regnum,
}

impl RuleTable {
    /// Every register `SameValue`, CFA = SP + 0.
    pub fn new(arch: &Arch) -> Self {
        Self {
            cfa: CfaRule::RegisterOffset {
                register: arch.sp,
                offset: 0,
            },
            rules: [RegisterRule::SameValue; MAX_REGISTERS],
            num_regs: arch.num_regs,
        }
    }

    fn index(&self, reg: u64) -> Result<usize> {
        if reg < u64::from(self.num_regs) {
            Ok(reg as usize)
        } else {
            Err(Error::BadRegister(reg))
        }
    }

    pub fn get(&self, reg: u64) -> Result<RegisterRule> {
        Ok(self.rules[self.index(reg)?])
    }

    /// Out-of-range registers leave the table untouched.
    pub fn set(&mut self, reg: u64, rule: RegisterRule) -> Result<()> {
        let index = self.index(reg)?;
        self.rules[index] = rule;
        Ok(())
    }

    pub fn num_regs(&self) -> Regnum {
        self.num_regs
    }

    /// Columns whose rule is something other than `SameValue`.
    pub fn explicit(&self) -> impl Iterator<Item = (Regnum, RegisterRule)> + '_ {
        self.rules[..usize::from(self.num_regs)]
            .iter()
            .enumerate()
            .filter(|(_, rule)| **rule != RegisterRule::SameValue)
            .map(|(reg, rule)| (reg as Regnum, *rule))
    }
}

impl core::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"cfa", &self.cfa);
        for (reg, rule) in self.explicit() {
            map.entry(&reg, &rule);
        }
        map.finish()
    }
}

/// The interpreter's result for one IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// The row after the CIE's initial instructions, used by `restore`.
    pub initial: RuleTable,
    pub current: RuleTable,
    pub args_size: u64,
    pub return_address_column: Regnum,
    pub signal_frame: bool,
    /// AArch64 pointer authentication: the saved return address is signed.
    pub ra_signed: bool,
}

impl StateRecord {
    pub fn new(arch: &Arch, return_address_column: Regnum) -> Self {
        let table = RuleTable::new(arch);
        Self {
            initial: table.clone(),
            current: table,
            args_size: 0,
            return_address_column,
            signal_frame: false,
            ra_signed: false,
        }
    }
}

const MAX_SNAPSHOTS: usize = 4;
const MAX_LABELS: usize = 4;

/// Fixed-capacity scratch storage for `remember_state` snapshots and
/// labeled states. One lives in each cursor so stepping never allocates.
#[derive(Debug, Default)]
pub struct Workspace {
    snapshots: ArrayVec<RuleTable, MAX_SNAPSHOTS>,
    labels: ArrayVec<(u64, RuleTable), MAX_LABELS>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything left over from a previous program.
    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.labels.clear();
    }

    pub fn push(&mut self, table: &RuleTable) -> Result<()> {
        self.snapshots
            .try_push(table.clone())
            .map_err(|_| Error::OutOfMemory("rule snapshot stack"))
    }

    pub fn pop(&mut self) -> Result<RuleTable> {
        self.snapshots
            .pop()
            .ok_or(Error::InvalidArgument("restore_state without remember_state"))
    }

    pub fn label(&mut self, label: u64, table: &RuleTable) -> Result<()> {
        if let Some((_, slot)) = self.labels.iter_mut().find(|(l, _)| *l == label) {
            *slot = table.clone();
            return Ok(());
        }
        self.labels
            .try_push((label, table.clone()))
            .map_err(|_| Error::OutOfMemory("labeled states"))
    }

    pub fn labeled(&self, label: u64) -> Result<&RuleTable> {
        self.labels
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, table)| table)
            .ok_or(Error::InvalidArgument("copy_state of unknown label"))
    }
}
