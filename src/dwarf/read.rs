//! Primitive decoding of DWARF data living in an address space.
//!
//! Every reader takes a position, reads through the [`Accessor`] and moves
//! the position forward by exactly the number of bytes it consumed.
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use core::fmt;

use crate::arch::Endian;
use crate::space::{Accessor, AddressSpace};
use crate::{Error, Result};

pub const DW_EH_PE_absptr: u8 = 0x00;
pub const DW_EH_PE_uleb128: u8 = 0x01;
pub const DW_EH_PE_udata2: u8 = 0x02;
pub const DW_EH_PE_udata4: u8 = 0x03;
pub const DW_EH_PE_udata8: u8 = 0x04;
pub const DW_EH_PE_sleb128: u8 = 0x09;
pub const DW_EH_PE_sdata2: u8 = 0x0A;
pub const DW_EH_PE_sdata4: u8 = 0x0B;
pub const DW_EH_PE_sdata8: u8 = 0x0C;

pub const DW_EH_PE_pcrel: u8 = 0x10;
pub const DW_EH_PE_textrel: u8 = 0x20;
pub const DW_EH_PE_datarel: u8 = 0x30;
pub const DW_EH_PE_funcrel: u8 = 0x40;
pub const DW_EH_PE_aligned: u8 = 0x50;

pub const DW_EH_PE_indirect: u8 = 0x80;
pub const DW_EH_PE_omit: u8 = 0xFF;

/// A pointer-encoding byte as found in augmentation data and
/// `.eh_frame_hdr`.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const OMIT: Encoding = Encoding(DW_EH_PE_omit);
    pub const ABSPTR: Encoding = Encoding(DW_EH_PE_absptr);

    pub fn is_omit(self) -> bool {
        self.0 == DW_EH_PE_omit
    }

    pub fn is_indirect(self) -> bool {
        self.0 & DW_EH_PE_indirect != 0
    }

    pub fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0x0f {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::InvalidArgument("invalid pointer value format")),
        })
    }

    pub fn application(self) -> Result<ValueApplication> {
        Ok(match self.0 & 0x70 {
            0x00 => ValueApplication::DW_EH_PE_absptr,
            0x10 => ValueApplication::DW_EH_PE_pcrel,
            0x20 => ValueApplication::DW_EH_PE_textrel,
            0x30 => ValueApplication::DW_EH_PE_datarel,
            0x40 => ValueApplication::DW_EH_PE_funcrel,
            0x50 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::InvalidArgument("invalid pointer application")),
        })
    }

    /// Size in bytes of a fixed-width encoding; `None` for LEB128.
    pub fn size(self, address_size: u8) -> Result<Option<u64>> {
        Ok(match self.format()? {
            ValueFormat::DW_EH_PE_absptr => Some(u64::from(address_size)),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return write!(f, "DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(app), Ok(format)) => {
                write!(f, "{app:?} | {format:?}")?;
                if self.is_indirect() {
                    write!(f, " | DW_EH_PE_indirect")?;
                }
                Ok(())
            }
            _ => write!(f, "Encoding({:#x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueFormat {
    /// A target word.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the address of the encoded field.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}

/// Base addresses for the relative pointer applications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerBases {
    pub data: u64,
    pub text: Option<u64>,
    pub func: u64,
}

/// The position `len` bytes past `pos`. Running off the end of the address
/// space is an unreadable access.
fn advance(pos: u64, len: u64) -> Result<u64> {
    pos.checked_add(len).ok_or(Error::Unreadable(pos))
}

pub fn read_u8<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u8> {
    let next = advance(*pos, 1)?;
    let byte = acc.read_byte(*pos)?;
    *pos = next;
    Ok(byte)
}

pub(crate) fn read_uint<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    pos: &mut u64,
    size: u64,
) -> Result<u64> {
    let endian = acc.arch().endian;
    let end = advance(*pos, size)?;
    let mut value = 0u64;
    for i in 0..size {
        let byte = u64::from(acc.read_byte(*pos + i)?);
        value |= match endian {
            Endian::Little => byte << (8 * i),
            Endian::Big => byte << (8 * (size - 1 - i)),
        };
    }
    *pos = end;
    Ok(value)
}

pub fn read_u16<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u16> {
    read_uint(acc, pos, 2).map(|v| v as u16)
}

pub fn read_u32<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u32> {
    read_uint(acc, pos, 4).map(|v| v as u32)
}

pub fn read_u64<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u64> {
    read_uint(acc, pos, 8)
}

/// A target word, 4 or 8 bytes depending on the architecture.
pub fn read_word<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u64> {
    let size = acc.arch().word_size();
    read_uint(acc, pos, size)
}

pub fn read_uleb128<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(acc, pos)?;
        if shift < 64 {
            result |= u64::from(byte & 0b0111_1111) << shift;
        }
        shift += 7;
        if (byte >> 7) == 0 {
            break;
        }
    }
    Ok(result)
}

pub fn read_sleb128<S: AddressSpace>(acc: &mut Accessor<'_, S>, pos: &mut u64) -> Result<i64> {
    let mut result = 0u64;
    let mut shift = 0u32;

    let sign_bit_set = loop {
        let byte = read_u8(acc, pos)?;
        if shift < 64 {
            result |= u64::from(byte & 0b0111_1111) << shift;
        }
        shift += 7;
        if (byte >> 7) == 0 {
            break ((byte >> 6) & 1) == 1;
        }
    };
    if shift < 64 && sign_bit_set {
        result |= u64::MAX << shift;
    }
    Ok(result as i64)
}

/// Decode a pointer stored with `encoding`, starting at `*pos`.
pub fn read_encoded_pointer<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    pos: &mut u64,
    encoding: Encoding,
    bases: &PointerBases,
) -> Result<u64> {
    let arch = acc.arch();

    if encoding.is_omit() {
        return Ok(0);
    }
    if encoding.0 == DW_EH_PE_aligned {
        let size = arch.word_size();
        *pos = advance(*pos, size - 1)? & !(size - 1);
        return read_word(acc, pos);
    }

    let field = *pos;
    let value = match encoding.format()? {
        ValueFormat::DW_EH_PE_absptr => read_word(acc, pos)?,
        ValueFormat::DW_EH_PE_uleb128 => read_uleb128(acc, pos)?,
        ValueFormat::DW_EH_PE_udata2 => u64::from(read_u16(acc, pos)?),
        ValueFormat::DW_EH_PE_udata4 => u64::from(read_u32(acc, pos)?),
        ValueFormat::DW_EH_PE_udata8 => read_u64(acc, pos)?,
        ValueFormat::DW_EH_PE_sleb128 => read_sleb128(acc, pos)? as u64,
        ValueFormat::DW_EH_PE_sdata2 => read_u16(acc, pos)? as i16 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata4 => read_u32(acc, pos)? as i32 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata8 => read_u64(acc, pos)?,
    };

    // A zero is "no pointer", whatever it would have been relative to.
    if value == 0 {
        return Ok(0);
    }

    let value = match encoding.application()? {
        ValueApplication::DW_EH_PE_absptr => value,
        ValueApplication::DW_EH_PE_pcrel => value.wrapping_add(field),
        ValueApplication::DW_EH_PE_textrel => match bases.text {
            Some(text) => value.wrapping_add(text),
            None => return Err(Error::InvalidArgument("textrel pointer without text base")),
        },
        ValueApplication::DW_EH_PE_datarel => value.wrapping_add(bases.data),
        ValueApplication::DW_EH_PE_funcrel => value.wrapping_add(bases.func),
        ValueApplication::DW_EH_PE_aligned => {
            return Err(Error::InvalidArgument("aligned pointer with a value format"))
        }
    } & arch.word_mask();

    if encoding.is_indirect() {
        let mut target = value;
        return read_word(acc, &mut target);
    }
    Ok(value)
}
