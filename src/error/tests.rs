use crate::Error;

#[test]
fn codes_are_stable() {
    let all = [
        Error::OutOfMemory("stack"),
        Error::BadRegister(99),
        Error::ReadOnlyRegister(7),
        Error::StopUnwind,
        Error::InvalidIp(0x1001),
        Error::BadFrame,
        Error::InvalidArgument("reserved opcode"),
        Error::BadVersion(2),
        Error::NoInfo(0x1000),
        Error::Unreadable(0),
    ];
    let codes = all.map(Error::code);
    assert_eq!(codes, [-2, -3, -4, -5, -6, -7, -8, -9, -10, -8]);
}

#[test]
fn only_undecodable_info_falls_back() {
    assert!(Error::NoInfo(0x1000).allows_fallback());
    assert!(Error::BadVersion(2).allows_fallback());
    assert!(!Error::Unreadable(0x1000).allows_fallback());
    assert!(!Error::BadFrame.allows_fallback());
}
