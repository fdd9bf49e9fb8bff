//! Signal trampolines.
//!
//! When a signal handler returns, it returns into a few instructions that
//! ask the kernel to restore the interrupted context. Compilers don't
//! describe those reliably, so the trampoline is recognized by its bytes and
//! the interrupted registers are read straight out of the context the kernel
//! left on the stack.

use super::{code_matches, Frame, StepMethod, Unwound};
use crate::arch::SignalFrameLayout;
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::Result;

fn layout_at<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    ip: u64,
) -> Option<&'static SignalFrameLayout> {
    let layout = acc.arch().signal_frame?;
    let bytes = layout.trampoline.iter().map(|&b| Some(b));
    code_matches(acc, ip, bytes).then_some(layout)
}

pub(crate) fn is_trampoline<S: AddressSpace>(acc: &mut Accessor<'_, S>, ip: u64) -> bool {
    layout_at(acc, ip).is_some()
}

pub(crate) fn step<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    frame: &Frame<'_>,
) -> Result<Option<Unwound>> {
    let Some(layout) = layout_at(acc, frame.ip) else {
        return Ok(None);
    };
    let arch = acc.arch();
    let sp = frame.locs[usize::from(arch.sp)].read(acc, arch.sp)?;
    let context = sp.wrapping_add(layout.context_offset);
    debug!("signal frame at {:#x}, context at {context:#x}", frame.ip);

    let mut locs = *frame.locs;
    for &(reg, offset) in layout.registers {
        let addr = context.wrapping_add(offset) & arch.word_mask();
        locs[usize::from(reg)] = Location::mem(addr).with_fp(arch.is_fp(reg));
    }
    let cfa = locs[usize::from(arch.sp)].read(acc, arch.sp)?;

    Ok(Some(Unwound {
        cfa,
        locs,
        ip_column: arch.ip,
        method: StepMethod::SignalFrame,
        exact_ip: true,
        ra_signed: false,
    }))
}
