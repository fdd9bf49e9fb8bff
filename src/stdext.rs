use core::ffi;

fn errno() -> i32 {
    // SAFETY: Surely errno_location would be valid, right?
    unsafe { *libc::__errno_location() }
}

/// Run `f` on the `strerror` text of the current `errno` without allocating.
pub(crate) fn with_last_os_error_str<R>(f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(errno(), buf.as_mut_ptr().cast(), buf.len()) };
    // SAFETY: strerror_r writes the string to buf, even if it didnt write anything, we did zero init it.
    let cstr = if error != 0 {
        c"<strerror_r returned an error>"
    } else {
        unsafe { ffi::CStr::from_ptr(buf.as_ptr().cast()) }
    };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}
