use crate::arch::Regnum;
use crate::space::{Accessor, AddressSpace, FpValue};
use crate::{Error, Result};

/// Where a register's value for the current frame can be found.
///
/// A location is never dereferenced directly; [`Location::read`] and
/// friends go through the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// The value is not recoverable in this frame.
    #[default]
    None,
    /// Still live in a machine register of the innermost frame.
    Register { reg: Regnum, fp: bool },
    /// Spilled to target memory.
    Memory { addr: u64, fp: bool },
    /// Not stored anywhere; computed during the step (SP = CFA, `val_*`
    /// rules). Read-only.
    Value(u64),
}

impl Location {
    pub const fn reg(reg: Regnum) -> Self {
        Location::Register { reg, fp: false }
    }

    pub const fn mem(addr: u64) -> Self {
        Location::Memory { addr, fp: false }
    }

    /// Tag the location as holding a floating-point register image.
    pub const fn with_fp(self, fp: bool) -> Self {
        match self {
            Location::Register { reg, .. } => Location::Register { reg, fp },
            Location::Memory { addr, .. } => Location::Memory { addr, fp },
            other => other,
        }
    }

    pub const fn is_fp(&self) -> bool {
        matches!(
            self,
            Location::Register { fp: true, .. } | Location::Memory { fp: true, .. }
        )
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Location::None)
    }

    /// Read an integer register value. `reg` is the column being read and
    /// only names the error when there is nothing to read.
    pub fn read<S: AddressSpace>(self, acc: &mut Accessor<'_, S>, reg: Regnum) -> Result<u64> {
        match self {
            Location::None => Err(Error::BadRegister(u64::from(reg))),
            Location::Register { reg, .. } => acc.read_reg(reg),
            Location::Memory { addr, .. } => acc.read_word(addr),
            Location::Value(value) => Ok(value),
        }
    }

    pub fn write<S: AddressSpace>(
        self,
        acc: &mut Accessor<'_, S>,
        reg: Regnum,
        value: u64,
    ) -> Result<()> {
        match self {
            Location::None => Err(Error::BadRegister(u64::from(reg))),
            Location::Register { reg, .. } => acc.write_reg(reg, value),
            Location::Memory { addr, .. } => acc.write_word(addr, value),
            Location::Value(_) => Err(Error::ReadOnlyRegister(reg)),
        }
    }

    /// Read a floating-point register image. Spilled images are
    /// `fp_size` bytes, least significant word first on little endian
    /// targets.
    pub fn read_fp<S: AddressSpace>(
        self,
        acc: &mut Accessor<'_, S>,
        reg: Regnum,
    ) -> Result<FpValue> {
        match self {
            Location::None => Err(Error::BadRegister(u64::from(reg))),
            Location::Register { reg, .. } => acc.read_fpreg(reg),
            Location::Memory { addr, .. } => {
                let arch = acc.arch();
                let words = (u64::from(arch.fp_size) / arch.word_size()).max(1);
                spilled_image_fits(addr, words * arch.word_size())?;
                let mut value: FpValue = 0;
                for i in 0..words {
                    let word = acc.read_word(addr + i * arch.word_size())?;
                    let slot = match arch.endian {
                        crate::arch::Endian::Little => i,
                        crate::arch::Endian::Big => words - 1 - i,
                    };
                    value |= FpValue::from(word) << (slot * 8 * arch.word_size());
                }
                Ok(value)
            }
            Location::Value(value) => Ok(FpValue::from(value)),
        }
    }

    pub fn write_fp<S: AddressSpace>(
        self,
        acc: &mut Accessor<'_, S>,
        reg: Regnum,
        value: FpValue,
    ) -> Result<()> {
        match self {
            Location::None => Err(Error::BadRegister(u64::from(reg))),
            Location::Register { reg, .. } => acc.write_fpreg(reg, value),
            Location::Memory { addr, .. } => {
                let arch = acc.arch();
                let words = (u64::from(arch.fp_size) / arch.word_size()).max(1);
                spilled_image_fits(addr, words * arch.word_size())?;
                for i in 0..words {
                    let slot = match arch.endian {
                        crate::arch::Endian::Little => i,
                        crate::arch::Endian::Big => words - 1 - i,
                    };
                    let word = (value >> (slot * 8 * arch.word_size())) as u64;
                    acc.write_word(addr + i * arch.word_size(), word)?;
                }
                Ok(())
            }
            Location::Value(_) => Err(Error::ReadOnlyRegister(reg)),
        }
    }
}

/// A spilled image of `len` bytes must not wrap around the address space.
fn spilled_image_fits(addr: u64, len: u64) -> Result<()> {
    match addr.checked_add(len - 1) {
        Some(_) => Ok(()),
        None => Err(Error::Unreadable(addr)),
    }
}
