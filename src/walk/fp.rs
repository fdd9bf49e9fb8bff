//! Frame pointer walker. Not very good, but it is what there is when a
//! function has no unwind info and kept its frame pointer.
//!
//! The frame pointer points at a two-word record: the caller's frame
//! pointer, then the return address. The caller's stack pointer is just
//! above the record.

use super::{Frame, StepMethod, Unwound};
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::{Error, Result};

pub(crate) fn step<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    frame: &Frame<'_>,
) -> Result<Option<Unwound>> {
    let arch = acc.arch();
    let Some(fp_reg) = arch.fp else {
        return Ok(None);
    };
    let current_fp = match frame.locs[usize::from(fp_reg)].read(acc, fp_reg) {
        Ok(fp) => fp,
        Err(Error::BadRegister(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    trace!("walk...   fp={current_fp:#x}");

    // The outermost frame zeroes its frame pointer.
    if current_fp == 0 {
        return Err(Error::StopUnwind);
    }
    let word = arch.word_size();
    if current_fp % word != 0 {
        trace!("walk... fp is not a frame record");
        return Ok(None);
    }

    let past_fp = |len: u64| {
        current_fp
            .checked_add(len)
            .filter(|&addr| addr <= arch.word_mask())
    };
    let (Some(return_addr_slot), Some(cfa)) = (past_fp(word), past_fp(2 * word)) else {
        trace!("walk... frame record runs off the address space");
        return Ok(None);
    };
    let return_addr = acc.read_word(return_addr_slot)?;
    trace!("walk... return_addr={return_addr:#x}");

    let mut locs = *frame.locs;
    locs[usize::from(fp_reg)] = Location::mem(current_fp);
    locs[usize::from(arch.return_address)] = Location::mem(return_addr_slot);
    locs[usize::from(arch.sp)] = Location::Value(cfa);

    Ok(Some(Unwound {
        cfa,
        locs,
        ip_column: arch.return_address,
        method: StepMethod::FramePointer,
        exact_ip: false,
        ra_signed: false,
    }))
}
