//! The accessor contract.
//!
//! The unwinder never dereferences a target address itself. Memory, registers
//! and unwind-info lookup are all supplied by an [`AddressSpace`], which may
//! be the current process, a ptrace'd one, or a core dump. Every call may
//! fail and failures are passed straight back to the caller.

use alloc::sync::Arc;

use crate::arch::{Arch, Endian, Regnum};
use crate::dynamic::DynamicProc;
use crate::{Error, Result};

/// A floating-point register image, zero-extended to 128 bits.
pub type FpValue = u128;

/// Which section an FDE came from; decides how its CIE pointer is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    /// `.eh_frame`: the CIE pointer is a backward offset from the field.
    EhFrame,
    /// `.debug_frame`: the CIE pointer is an offset from `base`.
    DebugFrame { base: u64 },
}

#[derive(Debug, Clone, Default)]
pub enum UnwindInfo {
    #[default]
    None,
    DwarfFde { fde: u64, section: FrameSection },
    Dynamic(Arc<DynamicProc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcFormat {
    None,
    DwarfFde,
    Dynamic,
}

/// Everything known about the procedure covering an IP.
#[derive(Debug, Clone, Default)]
pub struct ProcInfo {
    pub start_ip: u64,
    pub end_ip: u64,
    pub lsda: u64,
    /// Personality routine.
    pub handler: u64,
    /// Base for `DW_EH_PE_datarel` pointers.
    pub gp: u64,
    /// Base for `DW_EH_PE_textrel` pointers, when the provider knows it.
    pub text_base: Option<u64>,
    pub unwind_info: UnwindInfo,
}

impl ProcInfo {
    pub fn format(&self) -> ProcFormat {
        match self.unwind_info {
            UnwindInfo::None => ProcFormat::None,
            UnwindInfo::DwarfFde { .. } => ProcFormat::DwarfFde,
            UnwindInfo::Dynamic(_) => ProcFormat::Dynamic,
        }
    }

    pub fn contains(&self, ip: u64) -> bool {
        self.start_ip <= ip && ip < self.end_ip
    }
}

pub trait AddressSpace {
    /// Per-cursor state handed to every call, e.g. a thread's register
    /// context or a ptrace handle.
    type Arg;

    fn arch(&self) -> &'static Arch;

    /// Read or write one target word at `addr`.
    fn access_mem(&self, addr: u64, value: &mut u64, write: bool, arg: &mut Self::Arg)
        -> Result<()>;

    fn access_reg(&self, reg: Regnum, value: &mut u64, write: bool, arg: &mut Self::Arg)
        -> Result<()>;

    fn access_fpreg(
        &self,
        reg: Regnum,
        _value: &mut FpValue,
        _write: bool,
        _arg: &mut Self::Arg,
    ) -> Result<()> {
        Err(Error::BadRegister(u64::from(reg)))
    }

    /// Locate the unwind info for `ip`. With `need_unwind_info` unset the
    /// provider may leave [`ProcInfo::unwind_info`] empty.
    fn find_proc_info(&self, ip: u64, need_unwind_info: bool, arg: &mut Self::Arg)
        -> Result<ProcInfo>;

    /// Release whatever `find_proc_info` acquired for `info`.
    fn put_proc_info(&self, _info: &ProcInfo, _arg: &mut Self::Arg) {}

    /// Write the name of the procedure containing `ip` into `buf`; returns
    /// the name's length and `ip`'s offset into the procedure.
    fn get_proc_name(&self, ip: u64, _buf: &mut [u8], _arg: &mut Self::Arg) -> Result<(usize, u64)> {
        Err(Error::NoInfo(ip))
    }

    /// Check that `addr` can be read without faulting. Only consulted when a
    /// cursor has validation enabled.
    fn probe_mem(&self, _addr: u64, _arg: &mut Self::Arg) -> Result<()> {
        Ok(())
    }
}

/// An address space bound to one cursor's argument.
pub struct Accessor<'a, S: AddressSpace> {
    space: &'a S,
    arg: &'a mut S::Arg,
    validate: bool,
}

impl<'a, S: AddressSpace> Accessor<'a, S> {
    pub fn new(space: &'a S, arg: &'a mut S::Arg, validate: bool) -> Self {
        Self {
            space,
            arg,
            validate,
        }
    }

    pub fn arch(&self) -> &'static Arch {
        self.space.arch()
    }

    pub fn space(&self) -> &'a S {
        self.space
    }

    pub fn read_word(&mut self, addr: u64) -> Result<u64> {
        if self.validate {
            self.space.probe_mem(addr, self.arg)?;
        }
        let mut value = 0;
        self.space.access_mem(addr, &mut value, false, self.arg)?;
        Ok(value & self.arch().word_mask())
    }

    pub fn write_word(&mut self, addr: u64, value: u64) -> Result<()> {
        if self.validate {
            self.space.probe_mem(addr, self.arg)?;
        }
        let mut value = value & self.arch().word_mask();
        self.space.access_mem(addr, &mut value, true, self.arg)
    }

    /// Single bytes are extracted from the aligned word that holds them, so
    /// address spaces only ever see word-sized accesses.
    pub fn read_byte(&mut self, addr: u64) -> Result<u8> {
        let arch = self.arch();
        let size = arch.word_size();
        let aligned = addr & !(size - 1);
        let word = self.read_word(aligned)?;
        let index = addr - aligned;
        let shift = match arch.endian {
            Endian::Little => index * 8,
            Endian::Big => (size - 1 - index) * 8,
        };
        Ok((word >> shift) as u8)
    }

    pub fn read_reg(&mut self, reg: Regnum) -> Result<u64> {
        let mut value = 0;
        self.space.access_reg(reg, &mut value, false, self.arg)?;
        Ok(value)
    }

    pub fn write_reg(&mut self, reg: Regnum, value: u64) -> Result<()> {
        let mut value = value;
        self.space.access_reg(reg, &mut value, true, self.arg)
    }

    pub fn read_fpreg(&mut self, reg: Regnum) -> Result<FpValue> {
        let mut value = 0;
        self.space.access_fpreg(reg, &mut value, false, self.arg)?;
        Ok(value)
    }

    pub fn write_fpreg(&mut self, reg: Regnum, value: FpValue) -> Result<()> {
        let mut value = value;
        self.space.access_fpreg(reg, &mut value, true, self.arg)
    }

    pub fn find_proc_info(&mut self, ip: u64, need_unwind_info: bool) -> Result<ProcInfo> {
        self.space.find_proc_info(ip, need_unwind_info, self.arg)
    }

    pub fn put_proc_info(&mut self, info: &ProcInfo) {
        self.space.put_proc_info(info, self.arg)
    }

    pub fn get_proc_name(&mut self, ip: u64, buf: &mut [u8]) -> Result<(usize, u64)> {
        self.space.get_proc_name(ip, buf, self.arg)
    }
}
