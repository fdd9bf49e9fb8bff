//! The call frame instruction interpreter.
//!
//! A CIE's initial instructions and an FDE's instructions form a tiny
//! program that, executed up to some IP, yields the row of the CFI table
//! that applies at that IP.
#![allow(non_upper_case_globals)]


use core::ops::Range;

use super::parse::Cie;
use super::read::{
    read_encoded_pointer, read_sleb128, read_u16, read_u32, read_u8, read_uleb128, PointerBases,
};
use super::state::{CfaRule, RegisterRule, StateRecord, Workspace};
use crate::arch::WindowSave;
use crate::space::{Accessor, AddressSpace};
use crate::{Error, Result};

// High two bits; the low six are the operand.
pub const DW_CFA_advance_loc: u8 = 0x40;
pub const DW_CFA_offset: u8 = 0x80;
pub const DW_CFA_restore: u8 = 0xc0;

pub const DW_CFA_nop: u8 = 0;
pub const DW_CFA_set_loc: u8 = 0x01;
pub const DW_CFA_advance_loc1: u8 = 0x02;
pub const DW_CFA_advance_loc2: u8 = 0x03;
pub const DW_CFA_advance_loc4: u8 = 0x04;
pub const DW_CFA_offset_extended: u8 = 0x05;
pub const DW_CFA_restore_extended: u8 = 0x06;
pub const DW_CFA_undefined: u8 = 0x07;
pub const DW_CFA_same_value: u8 = 0x08;
pub const DW_CFA_register: u8 = 0x09;
pub const DW_CFA_remember_state: u8 = 0x0a;
pub const DW_CFA_restore_state: u8 = 0x0b;
pub const DW_CFA_def_cfa: u8 = 0x0c;
pub const DW_CFA_def_cfa_register: u8 = 0x0d;
pub const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub const DW_CFA_expression: u8 = 0x10;
pub const DW_CFA_offset_extended_sf: u8 = 0x11;
pub const DW_CFA_def_cfa_sf: u8 = 0x12;
pub const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub const DW_CFA_val_offset: u8 = 0x14;
pub const DW_CFA_val_offset_sf: u8 = 0x15;
pub const DW_CFA_val_expression: u8 = 0x16;
pub const DW_CFA_GNU_window_save: u8 = 0x2d;
pub const DW_CFA_GNU_args_size: u8 = 0x2e;
pub const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Start a new row at the given target address.
    SetLoc(u64),
    /// Advance the location by `delta * code_alignment_factor`. The delta is
    /// packed into the opcode.
    AdvanceLoc(u8),
    AdvanceLoc1(u8),
    AdvanceLoc2(u16),
    AdvanceLoc4(u32),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    DefCfa { register: u64, offset: u64 },
    /// The offset is signed and factored by the data alignment factor.
    DefCfaSf { register: u64, factored_offset: i64 },
    /// Change the CFA register, keeping the offset. Only valid while the CFA
    /// is register-relative.
    DefCfaRegister(u64),
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    /// Address of the length-prefixed expression.
    DefCfaExpression(u64),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u64),
    SameValue(u64),
    Offset { register: u64, factored_offset: u64 },
    OffsetExtended { register: u64, factored_offset: u64 },
    OffsetExtendedSf { register: u64, factored_offset: i64 },
    ValOffset { register: u64, factored_offset: u64 },
    ValOffsetSf { register: u64, factored_offset: i64 },
    Register { register: u64, from_register: u64 },
    Expression { register: u64, expr: u64 },
    ValExpression { register: u64, expr: u64 },
    Restore(u64),
    RestoreExtended(u64),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    RememberState,
    RestoreState,
    //
    //-------- GNU extensions
    //
    GnuWindowSave,
    GnuArgsSize(u64),
    GnuNegativeOffsetExtended { register: u64, factored_offset: u64 },
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
}

/// Decodes instructions from a program living in the address space.
pub struct InstrIter<'a, 'b, S: AddressSpace> {
    acc: &'a mut Accessor<'b, S>,
    pos: u64,
    end: u64,
    cie: &'a Cie,
    bases: &'a PointerBases,
}

impl<'a, 'b, S: AddressSpace> InstrIter<'a, 'b, S> {
    pub fn new(
        acc: &'a mut Accessor<'b, S>,
        program: Range<u64>,
        cie: &'a Cie,
        bases: &'a PointerBases,
    ) -> Self {
        Self {
            acc,
            pos: program.start,
            end: program.end,
            cie,
            bases,
        }
    }

    pub fn arch(&self) -> &'static crate::Arch {
        self.acc.arch()
    }

    fn u8(&mut self) -> Result<u8> {
        read_u8(self.acc, &mut self.pos)
    }

    fn uleb128(&mut self) -> Result<u64> {
        read_uleb128(self.acc, &mut self.pos)
    }

    fn sleb128(&mut self) -> Result<i64> {
        read_sleb128(self.acc, &mut self.pos)
    }

    /// Skip over a length-prefixed block, returning its address.
    fn block(&mut self) -> Result<u64> {
        let start = self.pos;
        let len = self.uleb128()?;
        self.pos = self
            .pos
            .checked_add(len)
            .filter(|&pos| pos <= self.end)
            .ok_or(Error::InvalidArgument("expression block overruns program"))?;
        Ok(start)
    }

    fn decode(&mut self) -> Result<Instruction> {
        let b = self.u8()?;
        let low_6 = b & 0x3f;
        Ok(match b & 0xc0 {
            DW_CFA_advance_loc => Instruction::AdvanceLoc(low_6),
            DW_CFA_offset => Instruction::Offset {
                register: u64::from(low_6),
                factored_offset: self.uleb128()?,
            },
            DW_CFA_restore => Instruction::Restore(u64::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    let encoding = self.cie.augmentation.fde_encoding;
                    Instruction::SetLoc(read_encoded_pointer(
                        self.acc,
                        &mut self.pos,
                        encoding,
                        self.bases,
                    )?)
                }
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc1(self.u8()?),
                DW_CFA_advance_loc2 => {
                    Instruction::AdvanceLoc2(read_u16(self.acc, &mut self.pos)?)
                }
                DW_CFA_advance_loc4 => {
                    Instruction::AdvanceLoc4(read_u32(self.acc, &mut self.pos)?)
                }
                DW_CFA_offset_extended => Instruction::OffsetExtended {
                    register: self.uleb128()?,
                    factored_offset: self.uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::RestoreExtended(self.uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(self.uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(self.uleb128()?),
                DW_CFA_register => Instruction::Register {
                    register: self.uleb128()?,
                    from_register: self.uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: self.uleb128()?,
                    offset: self.uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.block()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.uleb128()?,
                    expr: self.block()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: self.uleb128()?,
                    factored_offset: self.sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: self.uleb128()?,
                    factored_offset: self.sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(self.sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: self.uleb128()?,
                    factored_offset: self.uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: self.uleb128()?,
                    factored_offset: self.sleb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.uleb128()?,
                    expr: self.block()?,
                },
                DW_CFA_GNU_window_save => Instruction::GnuWindowSave,
                DW_CFA_GNU_args_size => Instruction::GnuArgsSize(self.uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::GnuNegativeOffsetExtended {
                    register: self.uleb128()?,
                    factored_offset: self.uleb128()?,
                },
                _ => return Err(Error::InvalidArgument("reserved CFA opcode")),
            },
        })
    }
}

impl<S: AddressSpace> Iterator for InstrIter<'_, '_, S> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let instr = self.decode();
        if instr.is_err() {
            self.pos = self.end;
        }
        Some(instr)
    }
}

/// Run `program` against `state.current`, starting at `start_ip` and stopping
/// once the location passes `target_ip`.
pub fn run_program<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    state: &mut StateRecord,
    ws: &mut Workspace,
    cie: &Cie,
    program: Range<u64>,
    start_ip: u64,
    target_ip: u64,
    bases: &PointerBases,
) -> Result<()> {
    let mut loc = start_ip;
    let mut instrs = InstrIter::new(acc, program, cie, bases);
    let arch = instrs.arch();
    let code_align = cie.code_alignment_factor;
    let data_align = cie.data_alignment_factor;
    let factored = |n: u64| (n as i64).wrapping_mul(data_align);

    while loc <= target_ip {
        let Some(instr) = instrs.next() else {
            break;
        };
        let instr = instr?;
        trace!("{loc:#x}: {instr:?}");

        let current = &mut state.current;
        match instr {
            Instruction::SetLoc(address) => loc = address,
            Instruction::AdvanceLoc(delta) | Instruction::AdvanceLoc1(delta) => {
                loc = loc.wrapping_add(u64::from(delta).wrapping_mul(code_align));
            }
            Instruction::AdvanceLoc2(delta) => {
                loc = loc.wrapping_add(u64::from(delta).wrapping_mul(code_align));
            }
            Instruction::AdvanceLoc4(delta) => {
                loc = loc.wrapping_add(u64::from(delta).wrapping_mul(code_align));
            }
            Instruction::DefCfa { register, offset } => {
                current.cfa = CfaRule::RegisterOffset {
                    register: arch.check_reg(register)?,
                    offset: offset as i64,
                };
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                current.cfa = CfaRule::RegisterOffset {
                    register: arch.check_reg(register)?,
                    offset: factored_offset.wrapping_mul(data_align),
                };
            }
            Instruction::DefCfaRegister(register) => {
                let register = arch.check_reg(register)?;
                match &mut current.cfa {
                    CfaRule::RegisterOffset { register: r, .. } => *r = register,
                    CfaRule::Expression(_) => {
                        return Err(Error::InvalidArgument("def_cfa_register on expression CFA"))
                    }
                }
            }
            Instruction::DefCfaOffset(offset) => match &mut current.cfa {
                CfaRule::RegisterOffset { offset: o, .. } => *o = offset as i64,
                CfaRule::Expression(_) => {
                    return Err(Error::InvalidArgument("def_cfa_offset on expression CFA"))
                }
            },
            Instruction::DefCfaOffsetSf(factored_offset) => match &mut current.cfa {
                CfaRule::RegisterOffset { offset: o, .. } => {
                    *o = factored_offset.wrapping_mul(data_align)
                }
                CfaRule::Expression(_) => {
                    return Err(Error::InvalidArgument("def_cfa_offset on expression CFA"))
                }
            },
            Instruction::DefCfaExpression(expr) => current.cfa = CfaRule::Expression(expr),
            Instruction::Undefined(register) => current.set(register, RegisterRule::Undefined)?,
            Instruction::SameValue(register) => current.set(register, RegisterRule::SameValue)?,
            Instruction::Offset {
                register,
                factored_offset,
            }
            | Instruction::OffsetExtended {
                register,
                factored_offset,
            } => current.set(register, RegisterRule::CfaRelative(factored(factored_offset)))?,
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => current.set(
                register,
                RegisterRule::CfaRelative(factored_offset.wrapping_mul(data_align)),
            )?,
            Instruction::ValOffset {
                register,
                factored_offset,
            } => current.set(register, RegisterRule::ValCfaRelative(factored(factored_offset)))?,
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => current.set(
                register,
                RegisterRule::ValCfaRelative(factored_offset.wrapping_mul(data_align)),
            )?,
            Instruction::Register {
                register,
                from_register,
            } => {
                let from = arch.check_reg(from_register)?;
                current.set(register, RegisterRule::InRegister(from))?;
            }
            Instruction::Expression { register, expr } => {
                current.set(register, RegisterRule::Expression(expr))?
            }
            Instruction::ValExpression { register, expr } => {
                current.set(register, RegisterRule::ValExpression(expr))?
            }
            Instruction::Restore(register) | Instruction::RestoreExtended(register) => {
                let rule = state.initial.get(register)?;
                state.current.set(register, rule)?;
            }
            Instruction::RememberState => ws.push(current)?,
            Instruction::RestoreState => state.current = ws.pop()?,
            Instruction::GnuWindowSave => match arch.window_save {
                Some(WindowSave::RegisterWindows) => {
                    let word = arch.word_size() as i64;
                    for register in 16..32u64 {
                        let offset = (register as i64 - 16) * word;
                        current.set(register, RegisterRule::CfaRelative(offset))?;
                    }
                }
                Some(WindowSave::NegateRaState) => state.ra_signed = !state.ra_signed,
                None => {
                    return Err(Error::InvalidArgument(
                        "DW_CFA_GNU_window_save on a target without register windows",
                    ))
                }
            },
            Instruction::GnuArgsSize(size) => state.args_size = size,
            Instruction::GnuNegativeOffsetExtended {
                register,
                factored_offset,
            } => current.set(
                register,
                RegisterRule::CfaRelative(factored(factored_offset).wrapping_neg()),
            )?,
            Instruction::Nop => {}
        }
    }

    Ok(())
}
