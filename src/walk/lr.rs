//! Last resort on link-register targets: assume a leaf function that has
//! not touched LR or SP yet.

use super::{Frame, StepMethod, Unwound};
use crate::location::Location;
use crate::space::{Accessor, AddressSpace};
use crate::Result;

pub(crate) fn step<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    frame: &Frame<'_>,
) -> Result<Option<Unwound>> {
    let arch = acc.arch();
    let Some(lr) = arch.lr else {
        return Ok(None);
    };
    if frame.locs[usize::from(lr)].is_none() {
        return Ok(None);
    }

    let cfa = frame.locs[usize::from(arch.sp)].read(acc, arch.sp)?;
    let mut locs = *frame.locs;
    locs[usize::from(arch.sp)] = Location::Value(cfa);

    Ok(Some(Unwound {
        cfa,
        locs,
        ip_column: lr,
        method: StepMethod::LinkRegister,
        exact_ip: false,
        ra_signed: false,
    }))
}
