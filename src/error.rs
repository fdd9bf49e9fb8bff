//! The small, stable set of ways an unwind can go wrong.
//!
//! Every variant is `Copy` and carries at most a number or a static string,
//! so errors can be produced inside a signal handler without touching the
//! allocator.

#[cfg(test)]
mod tests;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A fixed-capacity pool (rule snapshots, labeled states, the expression
    /// stack) ran out of room.
    #[error("out of memory: {0} exhausted")]
    OutOfMemory(&'static str),
    /// A register number outside the architecture's range, or a register
    /// that has no recoverable value in this frame.
    #[error("bad register number {0}")]
    BadRegister(u64),
    #[error("register {0} is read-only in this frame")]
    ReadOnlyRegister(u16),
    /// The unwind data says there is nothing further up. Not a failure.
    #[error("stop unwinding")]
    StopUnwind,
    #[error("invalid instruction pointer {0:#x}")]
    InvalidIp(u64),
    /// A step that did not move `(ip, cfa)`.
    #[error("bad frame: step did not advance")]
    BadFrame,
    /// Malformed unwind data: reserved opcodes, unknown augmentations,
    /// state stack underflow and friends.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unsupported CIE version {0}")]
    BadVersion(u8),
    #[error("no unwind info covers {0:#x}")]
    NoInfo(u64),
    /// The address space could not read or write this address.
    #[error("cannot access memory at {0:#x}")]
    Unreadable(u64),
}

impl Error {
    /// The negative result code callers see across an FFI-style boundary.
    /// -1 is left for the caller's own catch-all failure.
    pub const fn code(self) -> i32 {
        match self {
            Error::OutOfMemory(_) => -2,
            Error::BadRegister(_) => -3,
            Error::ReadOnlyRegister(_) => -4,
            Error::StopUnwind => -5,
            Error::InvalidIp(_) => -6,
            Error::BadFrame => -7,
            Error::InvalidArgument(_) | Error::Unreadable(_) => -8,
            Error::BadVersion(_) => -9,
            Error::NoInfo(_) => -10,
        }
    }

    /// Whether a heuristic fallback may be attempted after a CFI step failed
    /// with this error.
    pub(crate) fn allows_fallback(self) -> bool {
        matches!(
            self,
            Error::NoInfo(_)
                | Error::InvalidArgument(_)
                | Error::BadVersion(_)
                | Error::BadRegister(_)
                | Error::OutOfMemory(_)
        )
    }
}
