//! The current process as an address space.
//!
//! Memory is this process's memory, registers come from a [`Context`]
//! captured with [`capture_context`](crate::arch::capture_context) and unwind
//! info is found by asking the dynamic linker which object an IP belongs to.

#[cfg(test)]
mod tests;

use core::ffi;

use crate::arch::{self, Arch, Context, Regnum};
use crate::dwarf::divination::{eh_frame_hdr, find_proc_info_in_hdr};
use crate::identify;
use crate::space::{Accessor, AddressSpace, ProcInfo};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct LocalAddressSpace {
    arch: &'static Arch,
    page_size: u64,
}

impl LocalAddressSpace {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            arch: arch::host(),
            page_size: u64::try_from(page_size).unwrap_or(4096),
        }
    }

    fn page_mapped(&self, addr: u64) -> bool {
        let page = addr & !(self.page_size - 1);
        let mut resident = 0u8;
        // SAFETY: mincore only inspects the mapping and writes one byte for
        // the single page asked about.
        let ret = unsafe {
            libc::mincore(
                page as usize as *mut ffi::c_void,
                self.page_size as usize,
                &mut resident,
            )
        };
        ret == 0
    }
}

impl Default for LocalAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for LocalAddressSpace {
    type Arg = Context;

    fn arch(&self) -> &'static Arch {
        self.arch
    }

    fn access_mem(&self, addr: u64, value: &mut u64, write: bool, _arg: &mut Context) -> Result<()> {
        let ptr = core::ptr::with_exposed_provenance_mut::<u64>(addr as usize);
        // SAFETY: the addresses come from unwind info and saved registers of
        // live frames. Cursors that cannot trust those validate first.
        unsafe {
            if write {
                ptr.write_unaligned(*value);
            } else {
                *value = ptr.read_unaligned();
            }
        }
        Ok(())
    }

    fn access_reg(&self, reg: Regnum, value: &mut u64, write: bool, arg: &mut Context) -> Result<()> {
        let slot = arg
            .registers
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

    fn find_proc_info(&self, ip: u64, _need_unwind_info: bool, arg: &mut Context) -> Result<ProcInfo> {
        let hdr = eh_frame_hdr(ip).ok_or(Error::NoInfo(ip))?;
        let mut acc = Accessor::new(self, arg, false);
        find_proc_info_in_hdr(&mut acc, hdr, ip)
    }

    fn get_proc_name(&self, ip: u64, buf: &mut [u8], _arg: &mut Context) -> Result<(usize, u64)> {
        let (name, offset) = identify::proc_name(ip).ok_or(Error::NoInfo(ip))?;
        let name = name.to_bytes();
        let len = name.len().min(buf.len());
        buf[..len].copy_from_slice(&name[..len]);
        Ok((len, offset))
    }

    fn probe_mem(&self, addr: u64, _arg: &mut Context) -> Result<()> {
        let last = addr.wrapping_add(self.arch.word_size() - 1);
        if self.page_mapped(addr) && self.page_mapped(last) {
            Ok(())
        } else {
            Err(Error::Unreadable(addr))
        }
    }
}
