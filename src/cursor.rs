//! The cursor: one frame of a stack being walked.
//!
//! A cursor starts at the frame whose registers the address space hands out
//! and [`Cursor::step`] moves it to the caller. Each step tries, in order:
//!
//! 1. a signal trampoline, recognized by its code bytes
//! 2. CFI, from a registered dynamic region or the address space's
//!    proc-info, served from the script cache when possible
//! 3. when there is no usable CFI, the PLT, frame pointer and link register
//!    heuristics
//!
//! Register values are never copied into the cursor. It only tracks where
//! each of the frame's registers lives ([`Location`]) and reads them through
//! the address space on demand.


use crate::arch::{Arch, Regnum, MAX_REGISTERS};
use crate::cache::{CacheKey, Script};
use crate::dwarf::parse::parse_fde;
use crate::dwarf::resolve::apply_rules;
use crate::dwarf::state::{CfaRule, StateRecord, Workspace};
use crate::dynamic::Predicates;
use crate::location::Location;
use crate::space::{Accessor, AddressSpace, FpValue, ProcFormat, ProcInfo, UnwindInfo};
use crate::unwinder::Unwinder;
use crate::walk::{self, Frame, StepMethod, Unwound};
use crate::{dwarf, dynamic, Error, Result};

/// The rules for one frame, cached or not.
enum Rules {
    Cached(Script),
    /// Too many explicit rules for a script.
    Uncached(StateRecord),
}

impl Rules {
    fn cfa(&self) -> CfaRule {
        match self {
            Rules::Cached(script) => script.cfa,
            Rules::Uncached(state) => state.current.cfa,
        }
    }

    fn return_address_column(&self) -> Regnum {
        match self {
            Rules::Cached(script) => script.return_address_column,
            Rules::Uncached(state) => state.return_address_column,
        }
    }

    fn args_size(&self) -> u64 {
        match self {
            Rules::Cached(script) => script.args_size,
            Rules::Uncached(state) => state.args_size,
        }
    }

    fn signal_frame(&self) -> bool {
        match self {
            Rules::Cached(script) => script.signal_frame,
            Rules::Uncached(state) => state.signal_frame,
        }
    }

    fn ra_signed(&self) -> bool {
        match self {
            Rules::Cached(script) => script.ra_signed,
            Rules::Uncached(state) => state.ra_signed,
        }
    }

    fn apply<S: AddressSpace>(
        &self,
        acc: &mut Accessor<'_, S>,
        locs: &[Location; MAX_REGISTERS],
    ) -> Result<(u64, [Location; MAX_REGISTERS])> {
        match self {
            Rules::Cached(script) => {
                apply_rules(acc, locs, self.cfa(), script.rules.iter().copied())
            }
            Rules::Uncached(state) => apply_rules(acc, locs, self.cfa(), state.current.explicit()),
        }
    }
}

pub struct Cursor<'a, S: AddressSpace> {
    unwinder: &'a Unwinder<S>,
    arg: &'a mut S::Arg,
    ip: u64,
    cfa: u64,
    locs: [Location; MAX_REGISTERS],
    /// Proc-info of the current frame, once asked for.
    proc_info: Option<ProcInfo>,
    /// The IP is a return address; look up unwind info at `ip - 1`.
    use_prev_instr: bool,
    last_step: Option<StepMethod>,
    validate: bool,
    predicates: Predicates,
    /// Cache slot that served or stored the last script.
    hint: Option<u16>,
    ws: Workspace,
}

impl<'a, S: AddressSpace> core::fmt::Debug for Cursor<'a, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cursor")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("cfa", &format_args!("{:#x}", self.cfa))
            .field("last_step", &self.last_step)
            .finish_non_exhaustive()
    }
}

/// Find proc-info for `ip`: registered dynamic regions first, then the
/// address space. The flag says whether the address space handed it out.
fn find_proc_info<S: AddressSpace>(
    unwinder: &Unwinder<S>,
    acc: &mut Accessor<'_, S>,
    ip: u64,
) -> Result<(ProcInfo, bool)> {
    if let Some(proc) = unwinder.dynamic().find(ip) {
        trace!("{ip:#x} is in dynamic region {:#x}", proc.start_ip);
        let info = ProcInfo {
            start_ip: proc.start_ip,
            end_ip: proc.end_ip,
            unwind_info: UnwindInfo::Dynamic(proc),
            ..Default::default()
        };
        return Ok((info, false));
    }

    let info = acc.find_proc_info(ip, true)?;
    if !info.contains(ip) {
        acc.put_proc_info(&info);
        return Err(Error::NoInfo(ip));
    }
    Ok((info, true))
}

fn build_state<S: AddressSpace>(
    acc: &mut Accessor<'_, S>,
    ws: &mut Workspace,
    info: &ProcInfo,
    ip: u64,
    predicates: Predicates,
) -> Result<StateRecord> {
    match &info.unwind_info {
        UnwindInfo::DwarfFde { fde, section } => {
            let bases = dwarf::pointer_bases(info);
            let fde = parse_fde(acc, *fde, *section, &bases)?;
            if !(fde.start_ip <= ip && ip < fde.end_ip) {
                return Err(Error::NoInfo(ip));
            }
            dwarf::build_state(acc, ws, &fde, ip, &bases)
        }
        UnwindInfo::Dynamic(proc) => dynamic::build_state(acc.arch(), ws, proc, ip, predicates),
        UnwindInfo::None => Err(Error::NoInfo(ip)),
    }
}

impl<'a, S: AddressSpace> Cursor<'a, S> {
    /// A cursor at the frame described by `arg`'s registers.
    pub(crate) fn new(unwinder: &'a Unwinder<S>, arg: &'a mut S::Arg) -> Result<Self> {
        let arch = unwinder.space().arch();
        let mut locs = [Location::None; MAX_REGISTERS];
        for reg in 0..arch.num_regs {
            locs[usize::from(reg)] = Location::reg(reg).with_fp(arch.is_fp(reg));
        }

        let mut acc = Accessor::new(unwinder.space(), &mut *arg, false);
        let ip = acc.read_reg(arch.ip)?;
        let cfa = acc.read_reg(arch.sp)?;
        debug!("new cursor at ip={ip:#x} sp={cfa:#x}");

        Ok(Self {
            unwinder,
            arg,
            ip,
            cfa,
            locs,
            proc_info: None,
            use_prev_instr: false,
            last_step: None,
            validate: false,
            predicates: Predicates::default(),
            hint: None,
            ws: Workspace::new(),
        })
    }

    pub fn arch(&self) -> &'static Arch {
        self.unwinder.space().arch()
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    pub fn cfa(&self) -> u64 {
        self.cfa
    }

    /// How the cursor reached its current frame; `None` before the first
    /// step.
    pub fn last_step(&self) -> Option<StepMethod> {
        self.last_step
    }

    /// Probe every memory access with [`AddressSpace::probe_mem`] first.
    pub fn set_validate(&mut self, validate: bool) {
        self.validate = validate;
    }

    pub fn set_predicates(&mut self, predicates: Predicates) {
        self.predicates = predicates;
    }

    fn lookup_ip(&self) -> u64 {
        if self.use_prev_instr {
            self.ip.wrapping_sub(1)
        } else {
            self.ip
        }
    }

    /// Move to the caller's frame. `Ok(false)` means there is no caller: the
    /// cursor stays where it was.
    #[instrument(level = "debug", skip(self), fields(ip = self.ip))]
    pub fn step(&mut self) -> Result<bool> {
        let arch = self.arch();
        let unwound = match self.unwind_frame() {
            Ok(unwound) => unwound,
            Err(Error::StopUnwind) => {
                debug!("no frame above {:#x}", self.ip);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let ra = unwound.locs[usize::from(unwound.ip_column)];
        if ra.is_none() {
            debug!("return address is undefined above {:#x}", self.ip);
            return Ok(false);
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        let mut ip = ra.read(&mut acc, unwound.ip_column)?;
        if unwound.ra_signed {
            ip &= !arch.ra_sign_bits;
        }

        if ip == 0 {
            debug!("reached a zero return address");
            return Ok(false);
        }
        if ip == self.ip && unwound.cfa == self.cfa {
            warn!("step did not advance from ip={ip:#x} cfa={:#x}", self.cfa);
            return Err(Error::BadFrame);
        }
        if ip % arch.ip_alignment != 0 {
            return Err(Error::InvalidIp(ip));
        }

        let mut locs = unwound.locs;
        locs[usize::from(arch.ip)] = ra;
        self.locs = locs;
        self.ip = ip;
        self.cfa = unwound.cfa;
        self.use_prev_instr = !unwound.exact_ip;
        self.last_step = Some(unwound.method);
        self.proc_info = None;

        debug!(
            "stepped to ip={ip:#x} cfa={:#x} via {:?}",
            self.cfa, unwound.method
        );
        Ok(true)
    }

    fn unwind_frame(&mut self) -> Result<Unwound> {
        {
            let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
            let frame = Frame {
                ip: self.ip,
                locs: &self.locs,
            };
            if let Some(unwound) = walk::signal::step(&mut acc, &frame)? {
                return Ok(unwound);
            }
        }

        let err = match self.step_cfi() {
            Ok(unwound) => return Ok(unwound),
            Err(err) if err.allows_fallback() => err,
            Err(err) => return Err(err),
        };
        warn!("no usable unwind info at {:#x} ({err}), trying heuristics", self.ip);

        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        let frame = Frame {
            ip: self.ip,
            locs: &self.locs,
        };
        if let Some(unwound) = walk::plt::step(&mut acc, &frame)? {
            return Ok(unwound);
        }
        if let Some(unwound) = walk::fp::step(&mut acc, &frame)? {
            return Ok(unwound);
        }
        if let Some(unwound) = walk::lr::step(&mut acc, &frame)? {
            return Ok(unwound);
        }
        Err(err)
    }

    fn step_cfi(&mut self) -> Result<Unwound> {
        let (rules, info) = self.frame_rules()?;
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        let (cfa, locs) = rules.apply(&mut acc, &self.locs)?;
        let method = match info.format() {
            ProcFormat::Dynamic => StepMethod::Dynamic,
            _ => StepMethod::Cfi,
        };
        Ok(Unwound {
            cfa,
            locs,
            ip_column: rules.return_address_column(),
            method,
            exact_ip: rules.signal_frame(),
            ra_signed: rules.ra_signed(),
        })
    }

    /// The rules for the current frame, from the cache if possible.
    fn frame_rules(&mut self) -> Result<(Rules, ProcInfo)> {
        let ip = self.lookup_ip();
        let key = CacheKey {
            ip,
            predicates: self.predicates,
        };
        let unwinder = self.unwinder;
        let generation = unwinder.generation();
        let hint = self.hint;

        let cached = unwinder.cache().with(|cache| {
            cache.sync(generation);
            cache
                .lookup(&key, hint)
                .map(|(slot, entry)| (slot, entry.script.clone(), entry.info.clone()))
        });
        match cached {
            Ok(Some((slot, script, info))) => {
                trace!("script cache hit for {ip:#x}");
                self.hint = Some(slot);
                return Ok((Rules::Cached(script), info));
            }
            Ok(None) => debug!("script cache miss for {ip:#x}"),
            Err(unavailable) => debug!("{unavailable}, not caching {ip:#x}"),
        }

        let mut acc = Accessor::new(unwinder.space(), &mut *self.arg, self.validate);
        let (info, provided) = find_proc_info(unwinder, &mut acc, ip)?;
        let state = build_state(&mut acc, &mut self.ws, &info, ip, self.predicates);
        if provided {
            acc.put_proc_info(&info);
        }
        let state = state?;

        let Some(script) = Script::compile(&state) else {
            debug!("row at {ip:#x} does not fit in a script");
            return Ok((Rules::Uncached(state), info));
        };
        // Unwind info changed under us; the script may be stale.
        if unwinder.generation() == generation {
            let stored = unwinder.cache().with(|cache| {
                cache.sync(generation);
                cache.insert(key, script.clone(), info.clone())
            });
            if let Ok(slot) = stored {
                self.hint = Some(slot);
            }
        }
        Ok((Rules::Cached(script), info))
    }

    fn check_reg(&self, reg: Regnum) -> Result<usize> {
        Ok(usize::from(self.arch().check_reg(u64::from(reg))?))
    }

    /// Where the current frame's `reg` lives.
    pub fn location(&self, reg: Regnum) -> Result<Location> {
        Ok(self.locs[self.check_reg(reg)?])
    }

    pub fn get_reg(&mut self, reg: Regnum) -> Result<u64> {
        let index = self.check_reg(reg)?;
        let arch = self.arch();
        if reg == arch.ip {
            return Ok(self.ip);
        }
        if arch.is_fp(reg) {
            return Err(Error::BadRegister(u64::from(reg)));
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        self.locs[index].read(&mut acc, reg)
    }

    /// Write `value` to wherever the frame's `reg` lives. Setting the IP
    /// moves the cursor to that address within the same frame.
    pub fn set_reg(&mut self, reg: Regnum, value: u64) -> Result<()> {
        let index = self.check_reg(reg)?;
        let arch = self.arch();
        if arch.is_fp(reg) {
            return Err(Error::BadRegister(u64::from(reg)));
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        self.locs[index].write(&mut acc, reg, value)?;
        if reg == arch.ip {
            self.ip = value;
            self.proc_info = None;
        }
        Ok(())
    }

    pub fn get_fpreg(&mut self, reg: Regnum) -> Result<FpValue> {
        let index = self.check_reg(reg)?;
        if !self.arch().is_fp(reg) {
            return Err(Error::BadRegister(u64::from(reg)));
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        self.locs[index].read_fp(&mut acc, reg)
    }

    pub fn set_fpreg(&mut self, reg: Regnum, value: FpValue) -> Result<()> {
        let index = self.check_reg(reg)?;
        if !self.arch().is_fp(reg) {
            return Err(Error::BadRegister(u64::from(reg)));
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        self.locs[index].write_fp(&mut acc, reg, value)
    }

    /// Proc-info for the current frame.
    pub fn proc_info(&mut self) -> Result<ProcInfo> {
        if let Some(info) = &self.proc_info {
            return Ok(info.clone());
        }
        let ip = self.lookup_ip();
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        let (info, provided) = find_proc_info(self.unwinder, &mut acc, ip)?;
        if provided {
            acc.put_proc_info(&info);
        }
        self.proc_info = Some(info.clone());
        Ok(info)
    }

    /// Write the name of the current procedure into `buf`, returning the
    /// name's length and the IP's offset from the procedure's start.
    pub fn proc_name(&mut self, buf: &mut [u8]) -> Result<(usize, u64)> {
        let ip = self.lookup_ip();
        if let Some(proc) = self.unwinder.dynamic().find(ip) {
            if let Some(name) = &proc.name {
                let len = name.len().min(buf.len());
                buf[..len].copy_from_slice(&name.as_bytes()[..len]);
                return Ok((len, self.ip - proc.start_ip));
            }
        }
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        acc.get_proc_name(self.ip, buf)
    }

    /// Whether the current frame is a signal trampoline, by its code or by
    /// its unwind info.
    pub fn is_signal_frame(&mut self) -> bool {
        let mut acc = Accessor::new(self.unwinder.space(), &mut *self.arg, self.validate);
        if walk::signal::is_trampoline(&mut acc, self.ip) {
            return true;
        }
        self.frame_rules()
            .is_ok_and(|(rules, _)| rules.signal_frame())
    }

    /// Bytes of outgoing arguments the current frame has pushed
    /// (`DW_CFA_GNU_args_size`).
    pub fn args_size(&mut self) -> Result<u64> {
        Ok(self.frame_rules()?.0.args_size())
    }
}
