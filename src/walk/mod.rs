//! Ways to find the caller's frame without CFI.
//!
//! Each heuristic looks at the current frame and either produces the
//! caller's register locations or declines with `Ok(None)`.

pub(crate) mod fp;
pub(crate) mod lr;
pub(crate) mod plt;
pub(crate) mod signal;

use crate::arch::{Regnum, MAX_REGISTERS};
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};

/// How a cursor got to its current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMethod {
    /// DWARF CFI from the address space.
    Cfi,
    /// A region registered with the unwinder.
    Dynamic,
    /// Out of a signal handler, through the saved machine context.
    SignalFrame,
    /// Out of a PLT stub.
    Plt,
    /// Following the frame pointer chain.
    FramePointer,
    /// Trusting the link register.
    LinkRegister,
}

/// The frame being stepped out of.
pub(crate) struct Frame<'l> {
    pub ip: u64,
    pub locs: &'l [Location; MAX_REGISTERS],
}

/// The caller's frame, not yet committed to the cursor.
#[derive(Debug)]
pub(crate) struct Unwound {
    pub cfa: u64,
    pub locs: [Location; MAX_REGISTERS],
    /// Column holding the caller's IP.
    pub ip_column: Regnum,
    pub method: StepMethod,
    /// The caller's IP is where it was interrupted rather than a return
    /// address, so its unwind info is looked up at the IP itself.
    pub exact_ip: bool,
    /// The caller's IP was signed and has to be stripped.
    pub ra_signed: bool,
}

/// Whether the code at `addr` matches `pattern`; `None` matches any byte.
/// Unreadable code never matches.
pub(crate) fn code_matches<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    addr: u64,
    pattern: impl IntoIterator<Item = Option<u8>>,
) -> bool {
    pattern
        .into_iter()
        .zip(addr..)
        .all(|(expected, at)| match expected {
            None => true,
            Some(byte) => acc.read_byte(at).is_ok_and(|b| b == byte),
        })
}
