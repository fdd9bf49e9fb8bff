use core::ffi::CStr;

/// The exported symbol containing `addr` and `addr`'s offset into it.
pub(crate) fn proc_name(addr: u64) -> Option<(&'static CStr, u64)> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();

        if libc::dladdr(addr as usize as *const _, &mut info) == 0 {
            trace!("dladdr knows nothing about {addr:#x}");
            return None;
        }

        if info.dli_sname.is_null() {
            return None;
        }

        let sym_name = CStr::from_ptr(info.dli_sname);
        let offset = addr.wrapping_sub(info.dli_saddr as usize as u64);
        Some((sym_name, offset))
    }
}
