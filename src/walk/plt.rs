//! PLT stubs have no unwind info, but they also have no frame: on entry the
//! return address is the word at SP.

use super::{code_matches, Frame, StepMethod, Unwound};
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::Result;

pub(crate) fn step<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    frame: &Frame<'_>,
) -> Result<Option<Unwound>> {
    let arch = acc.arch();
    let Some(pattern) = arch.plt_entry else {
        return Ok(None);
    };
    if !code_matches(acc, frame.ip, pattern.iter().copied()) {
        return Ok(None);
    }
    trace!("PLT entry at {:#x}", frame.ip);

    let sp = frame.locs[usize::from(arch.sp)].read(acc, arch.sp)?;
    let cfa = sp.wrapping_add(arch.word_size()) & arch.word_mask();
    let mut locs = *frame.locs;
    locs[usize::from(arch.return_address)] = Location::mem(sp);
    locs[usize::from(arch.sp)] = Location::Value(cfa);

    Ok(Some(Unwound {
        cfa,
        locs,
        ip_column: arch.return_address,
        method: StepMethod::Plt,
        exact_ip: false,
        ra_signed: false,
    }))
}
