#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use cpu::host::unix::MappedPage;
use cpu::thunk::{THUNK_SIZE, TransitionThunk, decode_thunk, thunk_is_self_consistent};
use cpu::{CpuError, PageProtection, ThunkBuffer};

#[test]
fn mapped_page_lands_below_4g() {
    let page = MappedPage::new().expect("mmap should succeed");
    assert!(page.address() >> 32 == 0, "page at {:#x}", page.address());
    assert_eq!(page.protection(), PageProtection::ReadWrite);
    assert!(page.bytes().iter().all(|byte| *byte == 0));
}

#[test]
fn thunk_on_real_page_is_sealed() {
    let mut page = MappedPage::new().expect("mmap should succeed");
    let thunk =
        TransitionThunk::build(&mut page, 0x33, 0x6bc1_2340).expect("thunk should build");

    assert_eq!(thunk.previous_protection(), PageProtection::ReadWrite);
    assert_eq!(page.protection(), PageProtection::ExecuteRead);
    assert_eq!(u64::from(thunk.entry()), page.address());

    let targets = decode_thunk(page.bytes()).expect("page should hold the thunk");
    assert!(thunk_is_self_consistent(&targets, thunk.entry()));
    assert_eq!(targets.resume, 0x6bc1_2340);
    assert!(page.bytes()[THUNK_SIZE..THUNK_SIZE + 4].iter().all(|b| *b == 0));

    let err = page.write(0, &[0x90]).expect_err("sealed page must refuse writes");
    assert!(matches!(err, CpuError::Protection(_)));
}
