//! A small DWARF expression evaluator, enough for what CFI uses.
#![allow(non_upper_case_globals)]


use arrayvec::ArrayVec;

use super::read::{
    read_sleb128, read_u16, read_u32, read_u64, read_u8, read_uint, read_uleb128, read_word,
};
use crate::arch::Regnum;
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::{Error, Result};

const DW_OP_addr: u8 = 0x03;
const DW_OP_deref: u8 = 0x06;
const DW_OP_const1u: u8 = 0x08;
const DW_OP_const1s: u8 = 0x09;
const DW_OP_const2u: u8 = 0x0a;
const DW_OP_const2s: u8 = 0x0b;
const DW_OP_const4u: u8 = 0x0c;
const DW_OP_const4s: u8 = 0x0d;
const DW_OP_const8u: u8 = 0x0e;
const DW_OP_const8s: u8 = 0x0f;
const DW_OP_constu: u8 = 0x10;
const DW_OP_consts: u8 = 0x11;
const DW_OP_dup: u8 = 0x12;
const DW_OP_drop: u8 = 0x13;
const DW_OP_over: u8 = 0x14;
const DW_OP_pick: u8 = 0x15;
const DW_OP_swap: u8 = 0x16;
const DW_OP_rot: u8 = 0x17;
const DW_OP_abs: u8 = 0x19;
const DW_OP_and: u8 = 0x1a;
const DW_OP_div: u8 = 0x1b;
const DW_OP_minus: u8 = 0x1c;
const DW_OP_mod: u8 = 0x1d;
const DW_OP_mul: u8 = 0x1e;
const DW_OP_neg: u8 = 0x1f;
const DW_OP_not: u8 = 0x20;
const DW_OP_or: u8 = 0x21;
const DW_OP_plus: u8 = 0x22;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_shl: u8 = 0x24;
const DW_OP_shr: u8 = 0x25;
const DW_OP_shra: u8 = 0x26;
const DW_OP_xor: u8 = 0x27;
const DW_OP_bra: u8 = 0x28;
const DW_OP_eq: u8 = 0x29;
const DW_OP_ge: u8 = 0x2a;
const DW_OP_gt: u8 = 0x2b;
const DW_OP_le: u8 = 0x2c;
const DW_OP_lt: u8 = 0x2d;
const DW_OP_ne: u8 = 0x2e;
const DW_OP_skip: u8 = 0x2f;
const DW_OP_lit0: u8 = 0x30;
const DW_OP_lit31: u8 = 0x4f;
const DW_OP_reg0: u8 = 0x50;
const DW_OP_reg31: u8 = 0x6f;
const DW_OP_breg0: u8 = 0x70;
const DW_OP_breg31: u8 = 0x8f;
const DW_OP_regx: u8 = 0x90;
const DW_OP_bregx: u8 = 0x92;
const DW_OP_deref_size: u8 = 0x94;
const DW_OP_nop: u8 = 0x96;
const DW_OP_stack_value: u8 = 0x9f;

const STACK_DEPTH: usize = 64;
/// Backward branches could otherwise loop forever.
const MAX_OPS: usize = 10_000;

/// What an expression evaluated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprResult {
    /// The top of the stack, as an address.
    Address(u64),
    /// `DW_OP_regN`/`DW_OP_regx`: the value lives in a register.
    Register(Regnum),
    /// `DW_OP_stack_value`: the top of the stack is the value itself.
    Value(u64),
}

struct Stack {
    values: ArrayVec<u64, STACK_DEPTH>,
    mask: u64,
}

impl Stack {
    fn push(&mut self, value: u64) -> Result<()> {
        self.values
            .try_push(value & self.mask)
            .map_err(|_| Error::OutOfMemory("expression stack"))
    }

    fn pop(&mut self) -> Result<u64> {
        self.values
            .pop()
            .ok_or(Error::InvalidArgument("expression stack underflow"))
    }

    fn pick(&self, index: usize) -> Result<u64> {
        self.values
            .len()
            .checked_sub(index + 1)
            .map(|i| self.values[i])
            .ok_or(Error::InvalidArgument("expression stack underflow"))
    }

    /// Sign-extend a stack value from the target word width.
    fn signed(&self, value: u64) -> i64 {
        let bits = self.mask.count_ones();
        if bits >= 64 {
            value as i64
        } else {
            ((value << (64 - bits)) as i64) >> (64 - bits)
        }
    }
}

fn read_reg<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    regs: &[Location],
    reg: u64,
) -> Result<u64> {
    let reg = acc.arch().check_reg(reg)?;
    regs.get(usize::from(reg))
        .copied()
        .unwrap_or_default()
        .read(acc, reg)
}

/// Evaluate the length-prefixed expression at `expr`. `regs` are the
/// locations of the frame the expression describes; `push` is placed on the
/// stack first (the CFA, for register rules).
pub fn evaluate<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    regs: &[Location],
    expr: u64,
    push: Option<u64>,
) -> Result<ExprResult> {
    let arch = acc.arch();
    let mut pos = expr;
    let len = read_uleb128(acc, &mut pos)?;
    let start = pos;
    let end = start
        .checked_add(len)
        .ok_or(Error::InvalidArgument("expression length overflows"))?;

    let mut stack = Stack {
        values: ArrayVec::new(),
        mask: arch.word_mask(),
    };
    if let Some(value) = push {
        stack.push(value)?;
    }

    let mut executed = 0;
    while pos < end {
        executed += 1;
        if executed > MAX_OPS {
            return Err(Error::InvalidArgument("expression does not terminate"));
        }

        let op = read_u8(acc, &mut pos)?;
        trace!("DW_OP {op:#x} at {:#x}", pos - 1);
        match op {
            DW_OP_addr => stack.push(read_word(acc, &mut pos)?)?,
            DW_OP_deref => {
                let addr = stack.pop()?;
                stack.push(acc.read_word(addr)?)?;
            }
            DW_OP_deref_size => {
                let size = u64::from(read_u8(acc, &mut pos)?);
                if size == 0 || size > arch.word_size() {
                    return Err(Error::InvalidArgument("bad DW_OP_deref_size"));
                }
                let mut addr = stack.pop()?;
                stack.push(read_uint(acc, &mut addr, size)?)?;
            }
            DW_OP_const1u => stack.push(u64::from(read_u8(acc, &mut pos)?))?,
            DW_OP_const1s => stack.push(read_u8(acc, &mut pos)? as i8 as u64)?,
            DW_OP_const2u => stack.push(u64::from(read_u16(acc, &mut pos)?))?,
            DW_OP_const2s => stack.push(read_u16(acc, &mut pos)? as i16 as u64)?,
            DW_OP_const4u => stack.push(u64::from(read_u32(acc, &mut pos)?))?,
            DW_OP_const4s => stack.push(read_u32(acc, &mut pos)? as i32 as u64)?,
            DW_OP_const8u | DW_OP_const8s => stack.push(read_u64(acc, &mut pos)?)?,
            DW_OP_constu => stack.push(read_uleb128(acc, &mut pos)?)?,
            DW_OP_consts => stack.push(read_sleb128(acc, &mut pos)? as u64)?,
            DW_OP_dup => stack.push(stack.pick(0)?)?,
            DW_OP_drop => {
                stack.pop()?;
            }
            DW_OP_over => stack.push(stack.pick(1)?)?,
            DW_OP_pick => {
                let index = read_u8(acc, &mut pos)?;
                stack.push(stack.pick(usize::from(index))?)?;
            }
            DW_OP_swap => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                stack.push(a)?;
                stack.push(b)?;
            }
            DW_OP_rot => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                let c = stack.pop()?;
                stack.push(a)?;
                stack.push(c)?;
                stack.push(b)?;
            }
            DW_OP_abs => {
                let a = stack.pop()?;
                stack.push(stack.signed(a).unsigned_abs())?;
            }
            DW_OP_neg => {
                let a = stack.pop()?;
                stack.push(a.wrapping_neg())?;
            }
            DW_OP_not => {
                let a = stack.pop()?;
                stack.push(!a)?;
            }
            DW_OP_plus_uconst => {
                let a = stack.pop()?;
                stack.push(a.wrapping_add(read_uleb128(acc, &mut pos)?))?;
            }
            DW_OP_and | DW_OP_div | DW_OP_minus | DW_OP_mod | DW_OP_mul | DW_OP_or
            | DW_OP_plus | DW_OP_shl | DW_OP_shr | DW_OP_shra | DW_OP_xor | DW_OP_eq
            | DW_OP_ge | DW_OP_gt | DW_OP_le | DW_OP_lt | DW_OP_ne => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                let (sa, sb) = (stack.signed(a), stack.signed(b));
                let value = match op {
                    DW_OP_and => a & b,
                    DW_OP_div => {
                        if sb == 0 {
                            return Err(Error::InvalidArgument("division by zero"));
                        }
                        sa.wrapping_div(sb) as u64
                    }
                    DW_OP_minus => a.wrapping_sub(b),
                    DW_OP_mod => {
                        if b == 0 {
                            return Err(Error::InvalidArgument("division by zero"));
                        }
                        a % b
                    }
                    DW_OP_mul => a.wrapping_mul(b),
                    DW_OP_or => a | b,
                    DW_OP_plus => a.wrapping_add(b),
                    DW_OP_shl if b < 64 => a << b,
                    DW_OP_shr if b < 64 => a >> b,
                    DW_OP_shl | DW_OP_shr => 0,
                    DW_OP_shra => (sa >> b.min(63)) as u64,
                    DW_OP_xor => a ^ b,
                    DW_OP_eq => u64::from(sa == sb),
                    DW_OP_ge => u64::from(sa >= sb),
                    DW_OP_gt => u64::from(sa > sb),
                    DW_OP_le => u64::from(sa <= sb),
                    DW_OP_lt => u64::from(sa < sb),
                    _ => u64::from(sa != sb),
                };
                stack.push(value)?;
            }
            DW_OP_skip | DW_OP_bra => {
                let offset = read_u16(acc, &mut pos)? as i16;
                let taken = op == DW_OP_skip || stack.pop()? != 0;
                if taken {
                    let target = pos.wrapping_add(offset as i64 as u64);
                    if target < start || target > end {
                        return Err(Error::InvalidArgument("branch out of expression"));
                    }
                    pos = target;
                }
            }
            DW_OP_lit0..=DW_OP_lit31 => stack.push(u64::from(op - DW_OP_lit0))?,
            DW_OP_reg0..=DW_OP_reg31 => {
                let reg = u64::from(op - DW_OP_reg0);
                return Ok(ExprResult::Register(arch.check_reg(reg)?));
            }
            DW_OP_regx => {
                let reg = read_uleb128(acc, &mut pos)?;
                return Ok(ExprResult::Register(arch.check_reg(reg)?));
            }
            DW_OP_breg0..=DW_OP_breg31 => {
                let offset = read_sleb128(acc, &mut pos)?;
                let value = read_reg(acc, regs, u64::from(op - DW_OP_breg0))?;
                stack.push(value.wrapping_add(offset as u64))?;
            }
            DW_OP_bregx => {
                let reg = read_uleb128(acc, &mut pos)?;
                let offset = read_sleb128(acc, &mut pos)?;
                let value = read_reg(acc, regs, reg)?;
                stack.push(value.wrapping_add(offset as u64))?;
            }
            DW_OP_nop => {}
            DW_OP_stack_value => return Ok(ExprResult::Value(stack.pop()?)),
            _ => return Err(Error::InvalidArgument("unsupported DWARF expression op")),
        }
    }

    Ok(ExprResult::Address(stack.pop()?))
}
