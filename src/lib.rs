//! A stack unwinder driven by DWARF call frame information.
//!
//! An [`Unwinder`] sits on top of an [`AddressSpace`], which supplies memory,
//! registers and the location of unwind info. [`Cursor`]s created from it
//! walk a stack one frame at a time, using `.eh_frame`/`.debug_frame` CFI
//! where there is some and a few well-known heuristics where there isn't.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

pub mod arch;
pub mod cache;
mod cursor;
pub mod dwarf;
pub mod dynamic;
mod error;
pub mod location;
pub mod space;
mod unwinder;
mod walk;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod stdext;

#[cfg(all(
    feature = "std",
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod identify;
#[cfg(all(
    feature = "std",
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod local;

#[cfg(test)]
mod testutil;

pub use arch::{Arch, Regnum};
pub use cache::{CacheConfig, CachePolicy, CacheStats};
pub use cursor::Cursor;
pub use dynamic::{DynOp, DynOpKind, DynamicProc, Predicates};
pub use error::{Error, Result};
pub use location::Location;
pub use space::{AddressSpace, FpValue, FrameSection, ProcFormat, ProcInfo, UnwindInfo};
pub use unwinder::Unwinder;
pub use walk::StepMethod;

#[cfg(all(
    feature = "std",
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub use local::LocalAddressSpace;
