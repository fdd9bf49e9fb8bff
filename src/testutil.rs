//! An in-memory address space and CFI byte builders for unit tests.

use core::cell::{Cell, RefCell};
use core::ops::Range;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::arch::{Arch, Endian, Regnum, MAX_REGISTERS};
use crate::dwarf::instr::*;
use crate::space::{AddressSpace, FpValue, FrameSection, ProcInfo, UnwindInfo};
use crate::{Error, Result};

pub(crate) struct MockRegs {
    pub regs: [u64; MAX_REGISTERS],
    pub fpregs: [FpValue; MAX_REGISTERS],
}

impl MockRegs {
    pub fn new() -> Self {
        Self {
            regs: [0; MAX_REGISTERS],
            fpregs: [0; MAX_REGISTERS],
        }
    }

    pub fn with(values: &[(Regnum, u64)]) -> Self {
        let mut regs = Self::new();
        for &(reg, value) in values {
            regs.regs[usize::from(reg)] = value;
        }
        regs
    }
}

pub(crate) struct MockSpace {
    pub arch: &'static Arch,
    memory: RefCell<BTreeMap<u64, u64>>,
    procs: Vec<(Range<u64>, u64)>,
    /// Number of `find_proc_info` calls, i.e. full parses requested.
    pub lookups: Cell<usize>,
}

impl MockSpace {
    pub fn new(arch: &'static Arch) -> Self {
        Self {
            arch,
            memory: RefCell::new(BTreeMap::new()),
            procs: Vec::new(),
            lookups: Cell::new(0),
        }
    }

    fn align(&self, addr: u64) -> u64 {
        addr & !(self.arch.word_size() - 1)
    }

    pub fn write_word(&self, addr: u64, value: u64) {
        let addr = self.align(addr);
        self.memory.borrow_mut().insert(addr, value & self.arch.word_mask());
    }

    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) {
        let size = self.arch.word_size();
        let mut memory = self.memory.borrow_mut();
        for (i, &byte) in bytes.iter().enumerate() {
            let at = addr + i as u64;
            let aligned = self.align(at);
            let index = at - aligned;
            let shift = match self.arch.endian {
                Endian::Little => index * 8,
                Endian::Big => (size - 1 - index) * 8,
            };
            let word = memory.entry(aligned).or_insert(0);
            *word = (*word & !(0xff << shift)) | (u64::from(byte) << shift);
        }
    }

    pub fn read_word(&self, addr: u64) -> Option<u64> {
        self.memory.borrow().get(&self.align(addr)).copied()
    }

    /// Make `fde` the unwind info for `range`.
    pub fn add_proc(&mut self, range: Range<u64>, fde: u64) {
        self.procs.push((range, fde));
    }
}

impl AddressSpace for MockSpace {
    type Arg = MockRegs;

    fn arch(&self) -> &'static Arch {
        self.arch
    }

    fn access_mem(&self, addr: u64, value: &mut u64, write: bool, _arg: &mut MockRegs) -> Result<()> {
        if write {
            self.write_word(addr, *value);
            return Ok(());
        }
        *value = self.read_word(addr).ok_or(Error::Unreadable(addr))?;
        Ok(())
    }

    fn access_reg(&self, reg: Regnum, value: &mut u64, write: bool, arg: &mut MockRegs) -> Result<()> {
        let slot = arg
            .regs
            .get_mut(usize::from(reg))
            .filter(|_| reg < self.arch.num_regs)
            .ok_or(Error::BadRegister(u64::from(reg)))?;
        if write {
            *slot = *value;
        } else {
            *value = *slot;
        }
        Ok(())
    }

    fn access_fpreg(
        &self,
        reg: Regnum,
        value: &mut FpValue,
        write: bool,
        arg: &mut MockRegs,
    ) -> Result<()> {
        if !self.arch.is_fp(reg) {
            return Err(Error::BadRegister(u64::from(reg)));
        }
        let slot = &mut arg.fpregs[usize::from(reg)];
        if write {
            *slot = *value;
        } else {
            *value = *slot;
        }
        Ok(())
    }

    fn find_proc_info(&self, ip: u64, _need_unwind_info: bool, _arg: &mut MockRegs) -> Result<ProcInfo> {
        self.lookups.set(self.lookups.get() + 1);
        let (range, fde) = self
            .procs
            .iter()
            .find(|(range, _)| range.contains(&ip))
            .ok_or(Error::NoInfo(ip))?;
        Ok(ProcInfo {
            start_ip: range.start,
            end_ip: range.end,
            unwind_info: UnwindInfo::DwarfFde {
                fde: *fde,
                section: FrameSection::EhFrame,
            },
            ..Default::default()
        })
    }

    fn probe_mem(&self, addr: u64, _arg: &mut MockRegs) -> Result<()> {
        self.read_word(addr).map(|_| ()).ok_or(Error::Unreadable(addr))
    }
}

pub(crate) fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Assembles CFA programs.
#[derive(Default)]
pub(crate) struct Program(pub Vec<u8>);

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    pub fn advance(mut self, delta: u8) -> Self {
        assert!(delta < 0x40);
        self.0.push(DW_CFA_advance_loc | delta);
        self
    }

    pub fn def_cfa(mut self, reg: u64, offset: u64) -> Self {
        self.0.push(DW_CFA_def_cfa);
        uleb(&mut self.0, reg);
        uleb(&mut self.0, offset);
        self
    }

    pub fn def_cfa_register(mut self, reg: u64) -> Self {
        self.0.push(DW_CFA_def_cfa_register);
        uleb(&mut self.0, reg);
        self
    }

    pub fn def_cfa_offset(mut self, offset: u64) -> Self {
        self.0.push(DW_CFA_def_cfa_offset);
        uleb(&mut self.0, offset);
        self
    }

    pub fn offset(mut self, reg: u8, factored: u64) -> Self {
        if reg < 0x40 {
            self.0.push(DW_CFA_offset | reg);
        } else {
            self.0.push(DW_CFA_offset_extended);
            uleb(&mut self.0, u64::from(reg));
        }
        uleb(&mut self.0, factored);
        self
    }

    pub fn offset_extended(mut self, reg: u64, factored: u64) -> Self {
        self.0.push(DW_CFA_offset_extended);
        uleb(&mut self.0, reg);
        uleb(&mut self.0, factored);
        self
    }

    pub fn register(mut self, reg: u64, other: u64) -> Self {
        self.0.push(DW_CFA_register);
        uleb(&mut self.0, reg);
        uleb(&mut self.0, other);
        self
    }

    pub fn undefined(mut self, reg: u64) -> Self {
        self.0.push(DW_CFA_undefined);
        uleb(&mut self.0, reg);
        self
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }
}

/// Lays out an `.eh_frame` image: CIEs with a `zR` augmentation and
/// absolute word-sized FDE pointers.
pub(crate) struct EhFrameBuilder {
    arch: &'static Arch,
    base: u64,
    bytes: Vec<u8>,
}

impl EhFrameBuilder {
    pub fn new(arch: &'static Arch, base: u64) -> Self {
        Self {
            arch,
            base,
            bytes: Vec::new(),
        }
    }

    fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn push_uint(&mut self, value: u64, size: u64) {
        for i in 0..size {
            let shift = match self.arch.endian {
                Endian::Little => 8 * i,
                Endian::Big => 8 * (size - 1 - i),
            };
            self.bytes.push((value >> shift) as u8);
        }
    }

    /// Append an entry whose body is `body`, padded with `DW_CFA_nop` to the
    /// word size. Returns the entry's address.
    fn entry(&mut self, body: impl FnOnce(&mut Self, u64)) -> u64 {
        let start = self.here();
        let len_at = self.bytes.len();
        self.push_uint(0, 4);
        body(self, start);
        while (self.bytes.len() - len_at) % self.arch.word_size() as usize != 0 {
            self.bytes.push(DW_CFA_nop);
        }
        let len = (self.bytes.len() - len_at - 4) as u32;
        self.bytes[len_at..len_at + 4].copy_from_slice(&match self.arch.endian {
            Endian::Little => len.to_le_bytes(),
            Endian::Big => len.to_be_bytes(),
        });
        start
    }

    pub fn cie(&mut self, code_align: u64, data_align: i64, ra: u8, program: Program) -> u64 {
        self.entry(|b, _| {
            b.push_uint(0, 4);
            b.bytes.push(1);
            b.bytes.extend_from_slice(b"zR\0");
            uleb(&mut b.bytes, code_align);
            sleb(&mut b.bytes, data_align);
            b.bytes.push(ra);
            uleb(&mut b.bytes, 1);
            b.bytes.push(crate::dwarf::read::DW_EH_PE_absptr);
            b.bytes.extend_from_slice(&program.0);
        })
    }

    pub fn fde(&mut self, cie: u64, range: Range<u64>, program: Program) -> u64 {
        let word = self.arch.word_size();
        self.entry(|b, start| {
            let pointer_field = start + 4;
            b.push_uint(pointer_field - cie, 4);
            b.push_uint(range.start, word);
            b.push_uint(range.end - range.start, word);
            uleb(&mut b.bytes, 0);
            b.bytes.extend_from_slice(&program.0);
        })
    }

    pub fn install(self, space: &MockSpace) {
        space.write_bytes(self.base, &self.bytes);
        // Terminator.
        space.write_bytes(self.here(), &[0; 8]);
    }
}
