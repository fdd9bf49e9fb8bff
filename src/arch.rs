//! Architectures as data.
//!
//! The unwinder core never branches on "which CPU is this". Everything it
//! needs to know about a target lives in an [`Arch`] table: how many DWARF
//! register columns there are, which of them are the instruction pointer,
//! stack pointer, frame pointer and link register, how wide a word is, and
//! the byte patterns and context layouts the fallback heuristics look for.
//! Adding a target means adding a table.

use core::ops::Range;

/// A DWARF register column.
pub type Regnum = u16;

/// Upper bound on [`Arch::num_regs`] for every table; sizes the fixed rule
/// and location arrays.
pub const MAX_REGISTERS: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// What `DW_CFA_GNU_window_save` (0x2d) means on this target, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSave {
    /// SPARC: the caller's `%o`/`%l`/`%i` window was spilled to the save
    /// area at the CFA, so columns 16..32 become CFA-relative.
    RegisterWindows,
    /// AArch64 reuses the opcode as `DW_CFA_AARCH64_negate_ra_state`.
    NegateRaState,
}

/// Where the kernel left the interrupted machine context when a signal
/// handler returned into the sigreturn trampoline.
#[derive(Debug)]
pub struct SignalFrameLayout {
    /// The trampoline's instruction bytes, matched at the current IP.
    pub trampoline: &'static [u8],
    /// Offset from the trampoline frame's SP to the start of the saved
    /// general purpose registers.
    pub context_offset: u64,
    /// DWARF column → byte offset from the start of the saved context.
    pub registers: &'static [(Regnum, u64)],
}

#[derive(Debug)]
pub struct Arch {
    pub name: &'static str,
    /// Number of DWARF columns, `<= MAX_REGISTERS`.
    pub num_regs: Regnum,
    /// Target word size in bytes, 4 or 8.
    pub address_size: u8,
    pub endian: Endian,
    pub ip: Regnum,
    pub sp: Regnum,
    pub fp: Option<Regnum>,
    pub lr: Option<Regnum>,
    /// The return-address column compilers use by default.
    pub return_address: Regnum,
    pub fp_regs: Range<Regnum>,
    /// Bytes a floating-point register occupies when spilled to memory.
    pub fp_size: u8,
    /// Every valid IP is a multiple of this.
    pub ip_alignment: u64,
    pub window_save: Option<WindowSave>,
    /// Bits of a signed return address that carry its authentication code
    /// rather than the address. Cleared before the address is used.
    pub ra_sign_bits: u64,
    /// PLT stub prefix; `None` entries match any byte.
    pub plt_entry: Option<&'static [Option<u8>]>,
    pub signal_frame: Option<&'static SignalFrameLayout>,
}

impl Arch {
    pub fn word_mask(&self) -> u64 {
        if self.address_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (u32::from(self.address_size) * 8)) - 1
        }
    }

    pub fn word_size(&self) -> u64 {
        u64::from(self.address_size)
    }

    pub fn is_fp(&self, reg: Regnum) -> bool {
        self.fp_regs.contains(&reg)
    }

    pub fn check_reg(&self, reg: u64) -> crate::Result<Regnum> {
        if reg < u64::from(self.num_regs) {
            Ok(reg as Regnum)
        } else {
            Err(crate::Error::BadRegister(reg))
        }
    }
}

// `jmp *disp32(%rip); push $imm32; jmp rel32`
const X86_64_PLT: [Option<u8>; 12] = [
    Some(0xff),
    Some(0x25),
    None,
    None,
    None,
    None,
    Some(0x68),
    None,
    None,
    None,
    None,
    Some(0xe9),
];

// `__restore_rt`: `mov $15, %rax; syscall`. The handler's `ret` consumed the
// frame's pretcode, so SP points at the `ucontext_t`; gregs start at
// uc_mcontext (offset 40) in the order r8..r15, rdi, rsi, rbp, rbx, rdx,
// rax, rcx, rsp, rip.
const X86_64_LINUX_SIGFRAME: SignalFrameLayout = SignalFrameLayout {
    trampoline: &[0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05],
    context_offset: 40,
    registers: &[
        (0, 0x68),
        (1, 0x60),
        (2, 0x70),
        (3, 0x58),
        (4, 0x48),
        (5, 0x40),
        (6, 0x50),
        (7, 0x78),
        (8, 0x00),
        (9, 0x08),
        (10, 0x10),
        (11, 0x18),
        (12, 0x20),
        (13, 0x28),
        (14, 0x30),
        (15, 0x38),
        (16, 0x80),
    ],
};

// `__kernel_rt_sigreturn`: `mov x8, #139; svc #0`. SP points at the
// `rt_sigframe`: 128 bytes of siginfo, then the ucontext whose
// `uc_mcontext.regs[0]` sits 184 bytes in.
const AARCH64_LINUX_SIGFRAME: SignalFrameLayout = SignalFrameLayout {
    trampoline: &[0x68, 0x11, 0x80, 0xd2, 0x01, 0x00, 0x00, 0xd4],
    context_offset: 128 + 184,
    registers: &[
        (0, 0),
        (1, 8),
        (2, 16),
        (3, 24),
        (4, 32),
        (5, 40),
        (6, 48),
        (7, 56),
        (8, 64),
        (9, 72),
        (10, 80),
        (11, 88),
        (12, 96),
        (13, 104),
        (14, 112),
        (15, 120),
        (16, 128),
        (17, 136),
        (18, 144),
        (19, 152),
        (20, 160),
        (21, 168),
        (22, 176),
        (23, 184),
        (24, 192),
        (25, 200),
        (26, 208),
        (27, 216),
        (28, 224),
        (29, 232),
        (30, 240),
        (31, 248),
        (32, 256),
    ],
};

/// x86-64 System V: rax rdx rcx rbx rsi rdi rbp rsp r8-r15, column 16 is the
/// return address (RIP), 17..33 are xmm0-15.
pub const X86_64: Arch = Arch {
    name: "x86_64",
    num_regs: 33,
    address_size: 8,
    endian: Endian::Little,
    ip: 16,
    sp: 7,
    fp: Some(6),
    lr: None,
    return_address: 16,
    fp_regs: 17..33,
    fp_size: 16,
    ip_alignment: 1,
    window_save: None,
    ra_sign_bits: 0,
    plt_entry: Some(&X86_64_PLT),
    signal_frame: Some(&X86_64_LINUX_SIGFRAME),
};

/// AArch64: x0-x30, sp is 31, 32 is a pseudo column for the PC, v0-v31 are
/// 64..96. The return address lives in x30.
pub const AARCH64: Arch = Arch {
    name: "aarch64",
    num_regs: 96,
    address_size: 8,
    endian: Endian::Little,
    ip: 32,
    sp: 31,
    fp: Some(29),
    lr: Some(30),
    return_address: 30,
    fp_regs: 64..96,
    fp_size: 8,
    ip_alignment: 4,
    window_save: Some(WindowSave::NegateRaState),
    // Linux user space has 48-bit virtual addresses.
    ra_sign_bits: !((1 << 48) - 1),
    plt_entry: None,
    signal_frame: Some(&AARCH64_LINUX_SIGFRAME),
};

/// i386 System V: eax ecx edx ebx esp ebp esi edi, column 8 is EIP.
pub const X86: Arch = Arch {
    name: "x86",
    num_regs: 9,
    address_size: 4,
    endian: Endian::Little,
    ip: 8,
    sp: 4,
    fp: Some(5),
    lr: None,
    return_address: 8,
    fp_regs: 9..9,
    fp_size: 0,
    ip_alignment: 1,
    window_save: None,
    ra_sign_bits: 0,
    plt_entry: None,
    signal_frame: None,
};

/// The table for the machine this crate was compiled for.
#[cfg(target_arch = "x86_64")]
pub fn host() -> &'static Arch {
    &X86_64
}

#[cfg(target_arch = "aarch64")]
pub fn host() -> &'static Arch {
    &AARCH64
}

#[cfg(target_arch = "x86")]
pub fn host() -> &'static Arch {
    &X86
}

/// Register values of the calling function, indexed by DWARF column.
#[derive(Debug, Clone)]
pub struct Context {
    pub registers: [u64; MAX_REGISTERS],
}

/// Snapshot the caller's registers. Must be inlined so the captured IP and
/// SP belong to a frame that is still live when it is unwound.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn capture_context() -> Context {
    use core::arch::asm;

    let mut context = Context {
        registers: [0; MAX_REGISTERS],
    };

    unsafe {
        asm!(
            "mov [{regs}+1*8], rdx",
            "mov [{regs}+2*8], rcx",
            "mov [{regs}+3*8], rbx", // callee-saved
            "mov [{regs}+4*8], rsi",
            "mov [{regs}+5*8], rdi",
            "mov [{regs}+6*8], rbp", // callee-saved
            "mov [{regs}+7*8], rsp",
            "mov [{regs}+8*8], r8",
            "mov [{regs}+9*8], r9",
            "mov [{regs}+10*8], r10",
            "mov [{regs}+11*8], r11",
            "mov [{regs}+12*8], r12", // callee-saved
            "mov [{regs}+13*8], r13", // callee-saved
            "mov [{regs}+14*8], r14", // callee-saved
            "mov [{regs}+15*8], r15", // callee-saved

            "lea rax, [rip + 0]", // must use rip as a base register
            "mov [{regs}+16*8], rax",

            out("rax") _,
            regs = in(reg) context.registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    context
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn capture_context() -> Context {
    use core::arch::asm;

    let mut context = Context {
        registers: [0; MAX_REGISTERS],
    };

    unsafe {
        asm!(
            "stp x0, x1, [{regs}, #0]",
            "stp x2, x3, [{regs}, #16]",
            "stp x4, x5, [{regs}, #32]",
            "stp x6, x7, [{regs}, #48]",
            "stp x8, x9, [{regs}, #64]",
            "stp x10, x11, [{regs}, #80]",
            "stp x12, x13, [{regs}, #96]",
            "stp x14, x15, [{regs}, #112]",
            "stp x16, x17, [{regs}, #128]",
            "stp x18, x19, [{regs}, #144]",
            "stp x20, x21, [{regs}, #160]",
            "stp x22, x23, [{regs}, #176]",
            "stp x24, x25, [{regs}, #192]",
            "stp x26, x27, [{regs}, #208]",
            "stp x28, x29, [{regs}, #224]",
            "str x30, [{regs}, #240]",
            "mov {tmp}, sp",
            "str {tmp}, [{regs}, #248]",
            "adr {tmp}, .",
            "str {tmp}, [{regs}, #256]",
            tmp = out(reg) _,
            regs = in(reg) context.registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_fit_fixed_storage() {
        for arch in [&X86_64, &AARCH64, &X86] {
            assert!(usize::from(arch.num_regs) <= MAX_REGISTERS, "{}", arch.name);
            assert!(arch.ip < arch.num_regs);
            assert!(arch.sp < arch.num_regs);
            assert!(arch.return_address < arch.num_regs);
            if let Some(layout) = arch.signal_frame {
                assert!(layout.registers.iter().all(|&(r, _)| r < arch.num_regs));
            }
        }
    }

    #[test]
    fn word_mask_follows_address_size() {
        assert_eq!(X86_64.word_mask(), u64::MAX);
        assert_eq!(X86.word_mask(), 0xffff_ffff);
    }

    #[test]
    fn check_reg_rejects_out_of_range() {
        assert_eq!(X86_64.check_reg(16), Ok(16));
        assert_eq!(X86_64.check_reg(33), Err(crate::Error::BadRegister(33)));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn capture_sees_live_stack() {
        let marker = 0u64;
        let ctx = capture_context();
        let sp = ctx.registers[X86_64.sp as usize];
        let here = core::ptr::addr_of!(marker) as u64;
        assert!(sp != 0 && sp <= here);
        assert_ne!(ctx.registers[X86_64.ip as usize], 0);
    }
}
