//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the dynamic linker) for knowledge of the future
//! (where we will find the dwarves)
//!
//! on glibc, the dynamic linker hands out the `PT_GNU_EH_FRAME` segment (the
//! `.eh_frame_hdr` section) of the object containing an address through the
//! GNU extension (`_dl_find_object`)[https://www.gnu.org/software/libc/manual/html_node/Dynamic-Linker-Introspection.html].
//! that header has a sorted table of `(initial_loc, fde)` pairs, which we
//! binary search for the FDE covering an IP. The search itself only needs an
//! [`Accessor`], so providers for other processes can use it too.

#![allow(non_camel_case_types)]


use super::parse::{parse_fde, search_section};
use super::read::{read_encoded_pointer, read_u8, Encoding, PointerBases};
use crate::space::{Accessor, AddressSpace, FrameSection, ProcInfo};
use crate::{Error, Result};

/// The fixed prologue of `.eh_frame_hdr`.
/// See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
/// and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.
#[derive(Debug)]
struct EhFrameHeader {
    version: u8,
    eh_frame_ptr_enc: Encoding,
    fde_count_enc: Encoding,
    table_enc: Encoding,
}

/// Find the FDE covering `ip` through the `.eh_frame_hdr` at `hdr` and
/// describe it as proc-info.
#[instrument(level = "debug", skip(acc))]
pub fn find_proc_info_in_hdr<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    hdr: u64,
    ip: u64,
) -> Result<ProcInfo> {
    let mut pos = hdr;
    let header = EhFrameHeader {
        version: read_u8(acc, &mut pos)?,
        eh_frame_ptr_enc: Encoding(read_u8(acc, &mut pos)?),
        fde_count_enc: Encoding(read_u8(acc, &mut pos)?),
        table_enc: Encoding(read_u8(acc, &mut pos)?),
    };
    if header.version != 1 {
        trace!("eh_frame_hdr version is not 1");
        return Err(Error::BadVersion(header.version));
    }
    trace!("eh_frame_hdr: {:?}", header);

    // Table entries are relative to the start of the header.
    let bases = PointerBases {
        data: hdr,
        text: None,
        func: 0,
    };

    let eh_frame = read_encoded_pointer(acc, &mut pos, header.eh_frame_ptr_enc, &bases)?;
    trace!("eh_frame: {eh_frame:#x}");

    if header.fde_count_enc.is_omit() || header.table_enc.is_omit() {
        debug!("eh_frame_hdr has no search table, scanning .eh_frame");
        let fde = search_section(acc, eh_frame..u64::MAX, FrameSection::EhFrame, &bases, ip)?;
        return Ok(fde.proc_info(FrameSection::EhFrame, &bases));
    }

    let fde_count = read_encoded_pointer(acc, &mut pos, header.fde_count_enc, &bases)?;
    trace!("fde_count: {fde_count}");

    let table_half_entry_size = header
        .table_enc
        .size(acc.arch().address_size)?
        .ok_or(Error::InvalidArgument("eh_frame_hdr table entries are not fixed-size"))?;
    let table = pos;
    let entry_size = table_half_entry_size * 2;
    // Every entry address below is at most `table_end`.
    let table_end = fde_count
        .checked_mul(entry_size)
        .and_then(|len| table.checked_add(len))
        .ok_or(Error::InvalidArgument("eh_frame_hdr table does not fit in the address space"))?;
    trace!("search table: {table:#x}..{table_end:#x}");
    let entry = |idx: u64| table + idx * entry_size;

    // The last entry whose initial_loc is <= ip.
    let mut base = 0;
    let mut len = fde_count;
    while len > 0 {
        let half = len / 2;
        let mid = base + half;
        let mut mid_pos = entry(mid);
        let value = read_encoded_pointer(acc, &mut mid_pos, header.table_enc, &bases)?;

        debug!(?base, ?len, ?mid, "binary searching for {ip:#x}: {value:#x}");

        if value <= ip {
            base = mid + 1;
            len -= half + 1;
        } else {
            len = half;
        }
    }
    if base == 0 {
        return Err(Error::NoInfo(ip));
    }

    let found = base - 1;
    debug!("found FDE idx in binary search {found}");

    let mut fde_pos = entry(found) + table_half_entry_size;
    let fde_address = read_encoded_pointer(acc, &mut fde_pos, header.table_enc, &bases)?;
    trace!("found FDE at address {fde_address:#x}");

    let fde = parse_fde(acc, fde_address, FrameSection::EhFrame, &bases)?;
    if !(fde.start_ip <= ip && ip < fde.end_ip) {
        trace!(
            "FDE {:#x}..{:#x} does not cover {ip:#x}",
            fde.start_ip,
            fde.end_ip
        );
        return Err(Error::NoInfo(ip));
    }

    Ok(fde.proc_info(FrameSection::EhFrame, &bases))
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod dl {
    use core::ffi;

    use crate::stdext::with_last_os_error_str;

    #[repr(C)]
    struct dl_find_object {
        dlfo_flags: ffi::c_ulonglong,
        dlfo_map_start: *const ffi::c_void,
        dlfo_map_end: *const ffi::c_void,
        dlf_link_map: *const ffi::c_void,
        /// A pointer to the `PT_GNU_EH_FRAME` segment (the `.eh_frame_hdr`
        /// section).
        dlfo_eh_frame: *const ffi::c_void,
        __dlfo_reserved: [ffi::c_ulonglong; 7],
    }

    extern "C" {
        fn _dl_find_object(address: *const ffi::c_void, result: *mut dl_find_object) -> ffi::c_int;
    }

    /// Address of the `.eh_frame_hdr` of the loaded object containing `ip`.
    pub(crate) fn eh_frame_hdr(ip: u64) -> Option<u64> {
        let addr = ip as usize as *const ffi::c_void;
        // SAFETY: `_dl_find_object` only inspects the link map and fills
        // `out`, which is large enough for glibc's struct.
        let out = unsafe {
            let mut out: dl_find_object = core::mem::zeroed();
            let ret = _dl_find_object(addr, &mut out);
            trace!("_dl_find_object returned {ret}");
            if ret != 0 {
                with_last_os_error_str(|err| trace!("dl_find_object error: {err}"));
                return None;
            }
            out
        };

        if out.dlfo_eh_frame.is_null() {
            trace!("dlfo_eh_frame is null");
            return None;
        }

        trace!(
            "dwarf info; map: ({:p}, {:p}), eh_frame_hdr: {:p}",
            out.dlfo_map_start,
            out.dlfo_map_end,
            out.dlfo_eh_frame
        );

        if !(out.dlfo_map_start..out.dlfo_map_end).contains(&addr) {
            trace!("dl_find_object returned object out of range for addr: {addr:p}");
            return None;
        }

        Some(out.dlfo_eh_frame as usize as u64)
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) use dl::eh_frame_hdr;
