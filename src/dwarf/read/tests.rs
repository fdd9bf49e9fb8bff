use crate::arch::{X86, X86_64};
use crate::space::Accessor;
use crate::testutil::{sleb, uleb, MockRegs, MockSpace};
use crate::Error;

use super::*;

fn space_with(bytes: &[u8]) -> MockSpace {
    let space = MockSpace::new(&X86_64);
    space.write_bytes(0x1000, bytes);
    space
}

#[test]
fn uleb128_round_trip() {
    for n in [0, 1, 127, 128, 300, 624485, u64::from(u32::MAX), u64::MAX - 1, u64::MAX] {
        let mut bytes = Vec::new();
        uleb(&mut bytes, n);
        let space = space_with(&bytes);
        let mut regs = MockRegs::new();
        let mut acc = Accessor::new(&space, &mut regs, false);

        let mut pos = 0x1000;
        assert_eq!(read_uleb128(&mut acc, &mut pos), Ok(n));
        assert_eq!(pos, 0x1000 + bytes.len() as u64);
    }
}

#[test]
fn sleb128_round_trip() {
    for n in [0, 1, -1, 63, 64, -64, -65, -123456, i64::MAX, i64::MIN] {
        let mut bytes = Vec::new();
        sleb(&mut bytes, n);
        let space = space_with(&bytes);
        let mut regs = MockRegs::new();
        let mut acc = Accessor::new(&space, &mut regs, false);

        let mut pos = 0x1000;
        assert_eq!(read_sleb128(&mut acc, &mut pos), Ok(n), "{n}");
        assert_eq!(pos, 0x1000 + bytes.len() as u64);
    }
}

#[test]
fn sleb128_sign_extends_from_bit_six() {
    // 0x40 alone has bit 6 set: -64. 0x3f has it clear: 63.
    let space = space_with(&[0x40, 0x3f, 0x80, 0x7f]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    assert_eq!(read_sleb128(&mut acc, &mut pos), Ok(-64));
    assert_eq!(read_sleb128(&mut acc, &mut pos), Ok(63));
    assert_eq!(read_sleb128(&mut acc, &mut pos), Ok(-128));
}

#[test]
fn fixed_width_reads_are_little_endian() {
    #[rustfmt::skip]
    let space = space_with(&[
        0x34, 0x12,
        0x78, 0x56, 0x34, 0x12,
        0xef, 0xcd, 0xab, 0x89, 0x67, 0x45, 0x23, 0x01,
    ]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    assert_eq!(read_u16(&mut acc, &mut pos), Ok(0x1234));
    assert_eq!(read_u32(&mut acc, &mut pos), Ok(0x1234_5678));
    assert_eq!(read_u64(&mut acc, &mut pos), Ok(0x0123_4567_89ab_cdef));
    assert_eq!(pos, 0x100e);
}

#[test]
fn pcrel_sdata4() {
    // Field at A holds -16 as a 4-byte little-endian value.
    let space = space_with(&(-16i32).to_le_bytes());
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    let value = read_encoded_pointer(&mut acc, &mut pos, Encoding(0x1B), &PointerBases::default());
    // Relative to the field start; `A + 4 - 16` once the preceding 4-byte
    // CIE pointer field is taken as `A`.
    assert_eq!(value, Ok(0x1000 - 16));
    assert_eq!(pos, 0x1004);
}

#[test]
fn omit_consumes_nothing() {
    let space = space_with(&[0xde, 0xad, 0xbe, 0xef]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    let value = read_encoded_pointer(&mut acc, &mut pos, Encoding::OMIT, &PointerBases::default());
    assert_eq!(value, Ok(0));
    assert_eq!(pos, 0x1000);
}

#[test]
fn zero_stays_zero_regardless_of_application() {
    let space = space_with(&[0, 0, 0, 0]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let bases = PointerBases {
        data: 0x5000,
        text: Some(0x6000),
        func: 0x7000,
    };
    for encoding in [0x1B, 0x2B, 0x3B, 0x4B] {
        let mut pos = 0x1000;
        assert_eq!(
            read_encoded_pointer(&mut acc, &mut pos, Encoding(encoding), &bases),
            Ok(0)
        );
        assert_eq!(pos, 0x1004);
    }
}

#[test]
fn relative_applications_use_their_base() {
    let space = space_with(&[0x10, 0, 0x10, 0, 0x10, 0]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let bases = PointerBases {
        data: 0x5000,
        text: Some(0x6000),
        func: 0x7000,
    };
    let mut pos = 0x1000;
    let udata2 = |app: u8| Encoding(app | DW_EH_PE_udata2);
    assert_eq!(read_encoded_pointer(&mut acc, &mut pos, udata2(DW_EH_PE_datarel), &bases), Ok(0x5010));
    assert_eq!(read_encoded_pointer(&mut acc, &mut pos, udata2(DW_EH_PE_textrel), &bases), Ok(0x6010));
    assert_eq!(read_encoded_pointer(&mut acc, &mut pos, udata2(DW_EH_PE_funcrel), &bases), Ok(0x7010));

    let mut pos = 0x1000;
    let no_text = PointerBases::default();
    assert_eq!(
        read_encoded_pointer(&mut acc, &mut pos, udata2(DW_EH_PE_textrel), &no_text),
        Err(Error::InvalidArgument("textrel pointer without text base"))
    );
}

#[test]
fn indirect_reads_through_the_pointer() {
    let space = space_with(&0x2000u64.to_le_bytes());
    space.write_word(0x2000, 0xcafe_f00d);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    let encoding = Encoding(DW_EH_PE_indirect | DW_EH_PE_udata8);
    assert_eq!(
        read_encoded_pointer(&mut acc, &mut pos, encoding, &PointerBases::default()),
        Ok(0xcafe_f00d)
    );
    assert_eq!(pos, 0x1008);
}

#[test]
fn aligned_rounds_up_to_word() {
    let space = space_with(&[0; 16]);
    space.write_word(0x1008, 0x4242);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1003;
    let value = read_encoded_pointer(
        &mut acc,
        &mut pos,
        Encoding(DW_EH_PE_aligned),
        &PointerBases::default(),
    );
    assert_eq!(value, Ok(0x4242));
    assert_eq!(pos, 0x1010);
}

#[test]
fn results_masked_to_word_width() {
    let space = MockSpace::new(&X86);
    space.write_bytes(0x1000, &(-16i32).to_le_bytes());
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    let encoding = Encoding(DW_EH_PE_sdata4);
    assert_eq!(
        read_encoded_pointer(&mut acc, &mut pos, encoding, &PointerBases::default()),
        Ok(0xffff_fff0)
    );
}

#[test]
fn reserved_encodings_are_rejected() {
    let space = space_with(&[0; 8]);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x1000;
    assert!(matches!(
        read_encoded_pointer(&mut acc, &mut pos, Encoding(0x05), &PointerBases::default()),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn unreadable_memory_passes_through() {
    let space = MockSpace::new(&X86_64);
    let mut regs = MockRegs::new();
    let mut acc = Accessor::new(&space, &mut regs, false);

    let mut pos = 0x9000;
    assert_eq!(read_u8(&mut acc, &mut pos), Err(Error::Unreadable(0x9000)));
}
