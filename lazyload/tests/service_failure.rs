//! A page that cannot be serviced terminates the program instead of resuming
//! it with a half-filled page.
//!
//! Servicing fails inside the trap handler of a child process: the test
//! runs itself again with `CHILD_ENV` set, and the child touches a segment
//! that promises more file bytes than its backing file has.

use abyss::mman;
use lazyload::{Config, LoaderContext, PageSize, Permission, Segment, SegmentTable, Va};
use std::{io::Write, os::unix::process::ExitStatusExt, process::Command};

const CHILD_ENV: &str = "LAZYLOAD_SHORT_READ_CHILD";

fn touch_truncated_segment() {
    let ps = PageSize::host();
    let page = ps.bytes();
    lazyload::initialize_with(Config::builder().page_size(ps).build()).unwrap();

    let mut backing = tempfile::tempfile().unwrap();
    backing.write_all(&vec![7u8; page / 2]).unwrap();

    let free = mman::map_anonymous(page, Permission::READ).unwrap();
    let base = Va::from_ptr(free.as_ptr());
    unsafe { mman::unmap(base, page).unwrap() };

    let table = SegmentTable::new(
        base,
        vec![Segment::new(base, page, page, 0, Permission::READ)],
        ps,
    )
    .unwrap();
    LoaderContext::new(table, backing, ps).install().unwrap();
    let byte = unsafe { core::ptr::read_volatile(base.as_mut_ptr()) };
    panic!("a page past the end of the file was resumed (read {byte:#x})");
}

#[test]
fn short_read_aborts() {
    if std::env::var_os(CHILD_ENV).is_some() {
        touch_truncated_segment();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["short_read_aborts", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env_remove("LAZYLOAD_LOG")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "a short read while servicing should abort the program ({stderr})"
    );
    assert!(stderr.contains("short read"), "the failure should be logged ({stderr})");
}
