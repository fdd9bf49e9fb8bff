//! Parsing of DWARF call frame information entries.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program. The remaining columns contain unwinding rules that are associated
//! with the indicated location. The table is stored compressed: a CIE holds
//! the rules shared by many functions, and each FDE holds a small program that
//! derives its rows from the CIE's (see [`super::instr`]).
//!
//! Entries are never borrowed from memory. They are read through the address
//! space every time, so the same code works on our own process and on a
//! stopped foreign one.


use core::ops::Range;

use arrayvec::ArrayVec;

use super::read::{
    read_encoded_pointer, read_sleb128, read_u32, read_u64, read_u8, read_uleb128, Encoding,
    PointerBases,
};
use crate::arch::Regnum;
use crate::space::{Accessor, AddressSpace, FrameSection, ProcInfo, UnwindInfo};
use crate::{Error, Result};

const MAX_AUGMENTATION_LEN: usize = 8;

/// The parts of the augmentation string we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augmentation {
    /// `z`: augmentation data is length-prefixed, and so are the FDEs'.
    pub has_data: bool,
    /// `L`
    pub lsda_encoding: Encoding,
    /// `R`
    pub fde_encoding: Encoding,
    /// `P`: address of the personality routine.
    pub personality: u64,
    /// `S`: the FDEs describe signal trampolines; the IP is not a return
    /// address.
    pub signal_frame: bool,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            has_data: false,
            lsda_encoding: Encoding::OMIT,
            fde_encoding: Encoding::ABSPTR,
            personality: 0,
            signal_frame: false,
        }
    }
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    pub address: u64,
    pub version: u8,
    pub augmentation: Augmentation,
    /// A constant that is factored out of all advance location instructions.
    /// The resulting value is (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions. The
    /// resulting value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// Which column in the rule table represents the return address of the
    /// function. Note that this column might not correspond to an actual
    /// machine register.
    pub return_address_register: Regnum,
    /// The program that produces the initial setting of each column.
    pub initial_instructions: Range<u64>,
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    pub address: u64,
    pub cie: Cie,
    pub start_ip: u64,
    pub end_ip: u64,
    /// Language-specific data area, 0 if there is none.
    pub lsda: u64,
    pub instructions: Range<u64>,
}

/// The length/id prologue shared by CIEs and FDEs.
#[derive(Debug)]
struct EntryHeader {
    /// Address of the id field.
    id_field: u64,
    id: u64,
    is_64: bool,
    /// First byte after the id.
    body: u64,
    /// One past the last byte of the entry.
    end: u64,
}

impl EntryHeader {
    fn is_cie(&self, section: FrameSection) -> bool {
        match section {
            FrameSection::EhFrame => self.id == 0,
            FrameSection::DebugFrame { .. } if self.is_64 => self.id == u64::MAX,
            FrameSection::DebugFrame { .. } => self.id == u64::from(u32::MAX),
        }
    }
}

fn parse_entry_header<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    address: u64,
) -> Result<EntryHeader> {
    let mut pos = address;
    let mut length = u64::from(read_u32(acc, &mut pos)?);
    let is_64 = length == u64::from(u32::MAX);
    if is_64 {
        length = read_u64(acc, &mut pos)?;
    }
    if length == 0 {
        return Err(Error::InvalidArgument("zero-length CFI entry"));
    }
    let end = pos
        .checked_add(length)
        .ok_or(Error::InvalidArgument("CFI entry length overflows"))?;

    let id_field = pos;
    let id = if is_64 {
        read_u64(acc, &mut pos)?
    } else {
        u64::from(read_u32(acc, &mut pos)?)
    };
    if pos > end {
        return Err(Error::InvalidArgument("CFI entry shorter than its header"));
    }

    Ok(EntryHeader {
        id_field,
        id,
        is_64,
        body: pos,
        end,
    })
}

fn read_augmentation_string<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    pos: &mut u64,
) -> Result<ArrayVec<u8, MAX_AUGMENTATION_LEN>> {
    let mut string = ArrayVec::new();
    loop {
        let byte = read_u8(acc, pos)?;
        if byte == 0 {
            return Ok(string);
        }
        string
            .try_push(byte)
            .map_err(|_| Error::InvalidArgument("augmentation string too long"))?;
    }
}

#[instrument(level = "trace", skip(acc))]
pub fn parse_cie<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    address: u64,
    section: FrameSection,
    bases: &PointerBases,
) -> Result<Cie> {
    let header = parse_entry_header(acc, address)?;
    if !header.is_cie(section) {
        return Err(Error::InvalidArgument("expected a CIE"));
    }
    let mut pos = header.body;

    let version = read_u8(acc, &mut pos)?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::BadVersion(version));
    }

    let string = read_augmentation_string(acc, &mut pos)?;

    if version == 4 {
        let address_size = read_u8(acc, &mut pos)?;
        let _segment_size = read_u8(acc, &mut pos)?;
        if u64::from(address_size) != acc.arch().word_size() {
            return Err(Error::InvalidArgument("CIE address size differs from target"));
        }
    }

    let code_alignment_factor = read_uleb128(acc, &mut pos)?;
    let data_alignment_factor = read_sleb128(acc, &mut pos)?;
    let return_address_register = if version == 1 {
        u64::from(read_u8(acc, &mut pos)?)
    } else {
        read_uleb128(acc, &mut pos)?
    };

    if code_alignment_factor == 0 {
        return Err(Error::InvalidArgument("zero code alignment factor"));
    }
    if data_alignment_factor == 0 {
        return Err(Error::InvalidArgument("zero data alignment factor"));
    }
    let return_address_register = acc.arch().check_reg(return_address_register)?;

    let mut augmentation = Augmentation::default();
    let mut letters = string.iter().copied().peekable();
    if letters.peek() == Some(&b'z') {
        letters.next();
        augmentation.has_data = true;

        let len = read_uleb128(acc, &mut pos)?;
        let data_end = pos
            .checked_add(len)
            .filter(|&data_end| data_end <= header.end)
            .ok_or(Error::InvalidArgument("augmentation data overruns CIE"))?;

        for letter in letters {
            match letter {
                b'L' => augmentation.lsda_encoding = Encoding(read_u8(acc, &mut pos)?),
                b'R' => augmentation.fde_encoding = Encoding(read_u8(acc, &mut pos)?),
                b'P' => {
                    let encoding = Encoding(read_u8(acc, &mut pos)?);
                    augmentation.personality =
                        read_encoded_pointer(acc, &mut pos, encoding, bases)?;
                }
                b'S' => augmentation.signal_frame = true,
                // The length prefix lets us skip whatever we do not know.
                _ => {
                    trace!("skipping unknown augmentation {:?}", letter as char);
                    break;
                }
            }
        }
        pos = data_end;
    } else {
        for letter in letters {
            match letter {
                b'S' => augmentation.signal_frame = true,
                _ => return Err(Error::InvalidArgument("unknown augmentation without 'z'")),
            }
        }
    }

    if pos > header.end {
        return Err(Error::InvalidArgument("CIE header overruns entry"));
    }

    let cie = Cie {
        address,
        version,
        augmentation,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions: pos..header.end,
    };
    trace!(?cie);
    Ok(cie)
}

#[instrument(level = "trace", skip(acc))]
pub fn parse_fde<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    address: u64,
    section: FrameSection,
    bases: &PointerBases,
) -> Result<Fde> {
    let header = parse_entry_header(acc, address)?;
    if header.is_cie(section) {
        return Err(Error::InvalidArgument("expected an FDE, found a CIE"));
    }

    let cie_address = match section {
        FrameSection::EhFrame => header.id_field.wrapping_sub(header.id),
        FrameSection::DebugFrame { base } => base.wrapping_add(header.id),
    };
    trace!("FDE at {address:#x} uses CIE at {cie_address:#x}");
    let cie = parse_cie(acc, cie_address, section, bases)?;

    let mut pos = header.body;
    let encoding = cie.augmentation.fde_encoding;
    let start_ip = read_encoded_pointer(acc, &mut pos, encoding, bases)?;
    // The range is a length, never relative to anything.
    let range = read_encoded_pointer(acc, &mut pos, Encoding(encoding.0 & 0x0f), bases)?;
    let end_ip = start_ip.wrapping_add(range) & acc.arch().word_mask();

    let mut lsda = 0;
    if cie.augmentation.has_data {
        let len = read_uleb128(acc, &mut pos)?;
        let data_end = pos
            .checked_add(len)
            .ok_or(Error::InvalidArgument("augmentation data overruns FDE"))?;
        if !cie.augmentation.lsda_encoding.is_omit() {
            let bases = PointerBases {
                func: start_ip,
                ..*bases
            };
            lsda = read_encoded_pointer(acc, &mut pos, cie.augmentation.lsda_encoding, &bases)?;
        }
        pos = data_end;
    }

    if pos > header.end {
        return Err(Error::InvalidArgument("FDE header overruns entry"));
    }
    if start_ip >= end_ip {
        return Err(Error::InvalidArgument("FDE covers an empty range"));
    }

    Ok(Fde {
        address,
        cie,
        start_ip,
        end_ip,
        lsda,
        instructions: pos..header.end,
    })
}

impl Fde {
    /// Describe this FDE as proc-info, the shape providers hand back.
    pub fn proc_info(&self, section: FrameSection, bases: &PointerBases) -> ProcInfo {
        ProcInfo {
            start_ip: self.start_ip,
            end_ip: self.end_ip,
            lsda: self.lsda,
            handler: self.cie.augmentation.personality,
            gp: bases.data,
            text_base: bases.text,
            unwind_info: UnwindInfo::DwarfFde {
                fde: self.address,
                section,
            },
        }
    }
}

/// Walk every entry of a frame section looking for the FDE covering `ip`.
/// This is how `.debug_frame` is searched; `.eh_frame` normally goes through
/// the `.eh_frame_hdr` table instead.
pub fn search_section<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    section_range: Range<u64>,
    section: FrameSection,
    bases: &PointerBases,
    ip: u64,
) -> Result<Fde> {
    let mut address = section_range.start;
    while address < section_range.end {
        let header = match parse_entry_header(acc, address) {
            Ok(header) => header,
            // The terminator.
            Err(Error::InvalidArgument(_)) => break,
            Err(err) => return Err(err),
        };
        if !header.is_cie(section) {
            let fde = parse_fde(acc, address, section, bases)?;
            if fde.start_ip <= ip && ip < fde.end_ip {
                return Ok(fde);
            }
        }
        address = header.end;
    }
    Err(Error::NoInfo(ip))
}
