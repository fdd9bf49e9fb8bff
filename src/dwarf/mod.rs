//! DWARF call frame information.
//!
//! # how it works
//! the unwind info for a function is a CIE (shared by many functions) and an
//! FDE (one per function). Both carry a little program of call frame
//! instructions (yes, that shit is basically a programming language). We run
//! the CIE's program, then the FDE's up to the IP we are looking at, and get
//! one row of the CFI table: how to find the CFA and where each register of
//! the caller was saved. See <https://dwarfstd.org/doc/DWARF5.pdf> section
//! 6.4 if more information is desired.
//!
//! Nothing here dereferences a pointer. Every byte is read through the
//! [`Accessor`], so the same code unwinds this process, another process or a
//! core file.

pub mod divination;
pub mod expr;
pub mod instr;
pub mod parse;
pub mod read;
pub mod resolve;
pub mod state;


use self::instr::run_program;
use self::parse::Fde;
use self::read::PointerBases;
use self::state::{StateRecord, Workspace};
use crate::space::{Accessor, AddressSpace, ProcInfo};
use crate::Result;

/// The bases `DW_EH_PE_datarel`/`textrel`/`funcrel` pointers are relative to
/// for the procedure described by `info`.
pub fn pointer_bases(info: &ProcInfo) -> PointerBases {
    PointerBases {
        data: info.gp,
        text: info.text_base,
        func: info.start_ip,
    }
}

/// Compute the CFI row of `fde` that applies at `ip`.
#[instrument(level = "trace", skip(acc, ws, fde, bases), fields(fde = fde.address))]
pub fn build_state<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    ws: &mut Workspace,
    fde: &Fde,
    ip: u64,
    bases: &PointerBases,
) -> Result<StateRecord> {
    let cie = &fde.cie;
    let mut state = StateRecord::new(acc.arch(), cie.return_address_register);
    state.signal_frame = cie.augmentation.signal_frame;

    ws.reset();
    run_program(
        acc,
        &mut state,
        ws,
        cie,
        cie.initial_instructions.clone(),
        fde.start_ip,
        u64::MAX,
        bases,
    )?;
    state.initial = state.current.clone();

    run_program(
        acc,
        &mut state,
        ws,
        cie,
        fde.instructions.clone(),
        fde.start_ip,
        ip,
        bases,
    )?;

    trace!("row at {ip:#x}: {:?}", state.current);
    Ok(state)
}
