use alloc::vec::Vec;

use crate::arch::{capture_context, MAX_REGISTERS};
use crate::cache::CacheConfig;
use crate::local::LocalAddressSpace;
use crate::space::AddressSpace;
use crate::unwinder::Unwinder;
use crate::walk::StepMethod;
use crate::Error;

/// Steps out of itself and returns the proc-info start of each of the first
/// `frames` callers.
#[inline(never)]
fn callers(unwinder: &Unwinder<LocalAddressSpace>, frames: usize) -> Vec<u64> {
    let mut context = capture_context();
    let mut cursor = unwinder.cursor(&mut context).unwrap();
    cursor.set_validate(true);

    let mut starts = Vec::new();
    for _ in 0..frames {
        assert!(cursor.step().unwrap());
        assert_eq!(cursor.last_step(), Some(StepMethod::Cfi));
        starts.push(cursor.proc_info().unwrap().start_ip);
    }
    starts
}

#[inline(never)]
fn outer(unwinder: &Unwinder<LocalAddressSpace>) -> Vec<u64> {
    core::hint::black_box(middle(unwinder))
}

#[inline(never)]
fn middle(unwinder: &Unwinder<LocalAddressSpace>) -> Vec<u64> {
    core::hint::black_box(callers(unwinder, 2))
}

#[test]
fn walks_out_of_its_own_callers() {
    let unwinder = Unwinder::new(LocalAddressSpace::new(), CacheConfig::default());
    let starts = outer(&unwinder);
    assert_eq!(starts, [middle as usize as u64, outer as usize as u64]);

    // Again, now from the cache.
    let starts = outer(&unwinder);
    assert_eq!(starts, [middle as usize as u64, outer as usize as u64]);
    assert!(unwinder.cache_stats().unwrap().hits >= 2);
}

#[test]
fn registers_are_the_captured_context() {
    let space = LocalAddressSpace::new();
    let mut context = crate::arch::Context {
        registers: [0; MAX_REGISTERS],
    };
    let sp = space.arch().sp;
    let mut value = 0x1234;
    space.access_reg(sp, &mut value, true, &mut context).unwrap();
    assert_eq!(context.registers[usize::from(sp)], 0x1234);

    let mut value = 0;
    assert_eq!(
        space.access_reg(200, &mut value, false, &mut context),
        Err(Error::BadRegister(200))
    );
}

#[test]
fn unmapped_memory_is_rejected() {
    let space = LocalAddressSpace::new();
    let mut context = capture_context();
    let local = 7u64;
    let addr = core::ptr::addr_of!(local) as usize as u64;
    assert_eq!(space.probe_mem(addr, &mut context), Ok(()));
    assert_eq!(space.probe_mem(0, &mut context), Err(Error::Unreadable(0)));
}
