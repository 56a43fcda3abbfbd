//! End-to-end tests against the in-process dispatch table.
//!
//! Each test that activates uses its own hook context so tests can run
//! in parallel without sharing wrapper state.

use slowdisk_hook::config::{ModuleParams, Normalization, WaitBounds};
use slowdisk_hook::hooks::{hook_pair, GlobalHooks, HookContext, HookState};
use slowdisk_hook::host::{AddressProvider, ProcessTable, Registration};
use slowdisk_hook::protect::{Mprotect, Region};
use slowdisk_hook::table::{Operation, SearchSpace, SyscallLayout};
use slowdisk_hook::{Phase, SlowDisk, SlowDiskError};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

macro_rules! context {
    ($name:ident, $state:ident) => {
        static $state: HookState = HookState::new();
        struct $name;
        impl HookContext for $name {
            fn state() -> &'static HookState {
                &$state
            }
        }
    };
}

context!(ConcurrentCtx, CONCURRENT_STATE);
context!(MissingCtx, MISSING_STATE);
context!(RegistrationCtx, REGISTRATION_STATE);
context!(InvertedCtx, INVERTED_STATE);
context!(WritableCtx, WRITABLE_STATE);
context!(ReadOnlyCtx, READ_ONLY_STATE);

fn rewind(file: &mut std::fs::File) {
    file.seek(SeekFrom::Start(0)).unwrap();
}

#[test]
fn hooked_io_matches_unhooked_io_and_unload_restores() {
    let _ = env_logger::builder().is_test(true).try_init();
    let host = ProcessTable::new().unwrap();
    let read_before = host.entry(Operation::Read);
    let write_before = host.entry(Operation::Write);

    let mut file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let payload = b"the quick brown fox jumps over the lazy dog";

    // Baseline.
    let plain_written = host.dispatch_write(fd, payload).unwrap();
    rewind(&mut file);
    let mut plain = [0u8; 64];
    let plain_read = host.dispatch_read(fd, &mut plain).unwrap();

    let mut registration: Registration<_, _> = Registration::new(&host, Mprotect);
    let report = registration.load("minWait=200 maxWait=500").unwrap();
    assert_eq!(report.bounds, WaitBounds::new(200, 500));
    assert_eq!(report.table_base, host.table_base());
    assert!(registration.is_loaded());
    assert_eq!(host.entry(Operation::Read), hook_pair::<GlobalHooks>().read);
    assert_eq!(host.entry(Operation::Write), hook_pair::<GlobalHooks>().write);

    rewind(&mut file);
    assert_eq!(host.dispatch_write(fd, payload).unwrap(), plain_written);
    rewind(&mut file);
    let mut hooked = [0u8; 64];
    assert_eq!(host.dispatch_read(fd, &mut hooked).unwrap(), plain_read);
    assert_eq!(hooked, plain);

    // Errors pass through untouched.
    let err = host.dispatch_write(-1, payload).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));

    let stats = registration.module().unwrap().stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.writes, 2);
    assert!(stats.max_magnitude <= 500);
    assert!(stats.total_magnitude >= 3 * 200);

    registration.unload().unwrap();
    assert!(!registration.is_loaded());
    assert_eq!(host.entry(Operation::Read), read_before);
    assert_eq!(host.entry(Operation::Write), write_before);
    assert_eq!(host.entry(Operation::Read), host.read_reference());

    // Load again on the same host: a fresh cycle.
    registration.load("").unwrap();
    registration.unload().unwrap();
    assert_eq!(host.entry(Operation::Write), write_before);
}

#[test]
fn concurrent_callers_each_get_a_bounded_delay() {
    let host = ProcessTable::new().unwrap();
    let mut module: SlowDisk<_, _, ConcurrentCtx> = SlowDisk::new(&host, Mprotect);
    module
        .activate(&ModuleParams::parse("minWait=200 maxWait=500"))
        .unwrap();

    const THREADS: usize = 8;
    const CALLS: usize = 50;
    std::thread::scope(|s| {
        for t in 0..THREADS {
            let host = &host;
            s.spawn(move || {
                let mut file = tempfile::tempfile().unwrap();
                let fd = file.as_raw_fd();
                let line = format!("thread {t}\n");
                for _ in 0..CALLS {
                    assert_eq!(host.dispatch_write(fd, line.as_bytes()).unwrap(), line.len());
                }
                rewind(&mut file);
                let mut buf = vec![0u8; line.len()];
                for _ in 0..CALLS {
                    assert_eq!(host.dispatch_read(fd, &mut buf).unwrap(), line.len());
                    assert_eq!(buf, line.as_bytes());
                }
            });
        }
    });

    let stats = module.stats();
    let calls = (THREADS * CALLS) as u64;
    assert_eq!(stats.writes, calls);
    assert_eq!(stats.reads, calls);
    assert!(stats.max_magnitude <= 500);
    assert!(stats.total_magnitude >= 2 * calls * 200);
    assert!(stats.total_magnitude <= 2 * calls * 500);

    module.deactivate().unwrap();
    assert_eq!(host.entry(Operation::Read), host.read_reference());
    assert_eq!(host.entry(Operation::Write), host.write_reference());
}

/// A host whose reference `close` address is not in its table.
struct WrongReference(ProcessTable);

impl AddressProvider for WrongReference {
    fn layout(&self) -> SyscallLayout {
        self.0.layout()
    }
    fn search_space(&self) -> SearchSpace<'_> {
        self.0.search_space()
    }
    fn close_reference(&self) -> usize {
        0xdead_beef
    }
    fn read_reference(&self) -> usize {
        self.0.read_reference()
    }
    fn write_reference(&self) -> usize {
        self.0.write_reference()
    }
}

#[test]
fn missing_table_leaves_io_untouched() {
    let host = WrongReference(ProcessTable::new().unwrap());
    let mut module: SlowDisk<_, _, MissingCtx> = SlowDisk::new(&host, Mprotect);

    let err = module.activate(&ModuleParams::default()).unwrap_err();
    assert!(matches!(err, SlowDiskError::TableNotFound { .. }));
    assert_eq!(module.phase(), Phase::FailedToActivate);
    assert!(!MISSING_STATE.is_armed());
    assert_eq!(host.0.entry(Operation::Read), host.0.read_reference());
    assert_eq!(host.0.entry(Operation::Write), host.0.write_reference());

    let file = tempfile::tempfile().unwrap();
    assert_eq!(host.0.dispatch_write(file.as_raw_fd(), b"abc").unwrap(), 3);
    assert_eq!(module.stats().calls(), 0);
}

#[test]
fn registration_guards_its_hooks() {
    let host = ProcessTable::new().unwrap();
    let mut registration: Registration<_, _, RegistrationCtx> = Registration::new(&host, Mprotect);

    assert!(matches!(
        registration.unload(),
        Err(SlowDiskError::RestoreWithoutInstall)
    ));

    registration.load("minWait=0 maxWait=0").unwrap();
    assert!(matches!(
        registration.load("minWait=1 maxWait=2"),
        Err(SlowDiskError::AlreadyActive)
    ));
    let report = registration.module().unwrap().report().unwrap();
    assert_eq!(report.bounds, WaitBounds::new(0, 1));
    assert_eq!(report.normalization, Some(Normalization::ZeroMax));

    registration.unload().unwrap();
    assert!(registration.module().is_none());
}

#[test]
fn inverted_bounds_are_normalized_on_load() {
    let host = ProcessTable::new().unwrap();
    let mut registration: Registration<_, _, InvertedCtx> = Registration::new(&host, Mprotect);

    let report = registration.load("minWait=1000 maxWait=500 seed=11").unwrap();
    assert_eq!(report.bounds, WaitBounds::new(500, 1000));
    assert!(matches!(
        report.normalization,
        Some(Normalization::InvertedRange { min: 1000, max: 500 })
    ));
    assert!(report.seeded);

    let file = tempfile::tempfile().unwrap();
    for _ in 0..20 {
        host.dispatch_write(file.as_raw_fd(), b"x").unwrap();
    }
    let stats = registration.module().unwrap().stats();
    assert!(stats.max_magnitude <= 1000);
    assert!(stats.total_magnitude >= 20 * 500);

    registration.unload().unwrap();
}

unsafe extern "C" fn plain_read(
    _fd: libc::c_uint,
    _buf: *mut libc::c_char,
    count: libc::size_t,
) -> libc::c_long {
    count as libc::c_long
}

unsafe extern "C" fn plain_write(
    _fd: libc::c_uint,
    _buf: *const libc::c_char,
    count: libc::size_t,
) -> libc::c_long {
    count as libc::c_long
}

unsafe extern "C" fn plain_close(_fd: libc::c_uint) -> libc::c_long {
    0
}

/// A table on an ordinary read-write page shared with other data.
struct WritablePage {
    ptr: *mut libc::c_void,
    len: usize,
}

impl WritablePage {
    fn new() -> Self {
        let len = Mprotect::page_size();
        // SAFETY: fresh anonymous mapping, unmapped on drop.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let page = Self { ptr, len };
        let words = page.words();
        words[8].store(plain_read as usize, Ordering::Relaxed);
        words[9].store(plain_write as usize, Ordering::Relaxed);
        words[11].store(plain_close as usize, Ordering::Relaxed);
        page
    }

    fn words(&self) -> &[AtomicUsize] {
        // SAFETY: the mapping spans `len` bytes for the life of self.
        unsafe {
            std::slice::from_raw_parts(self.ptr.cast(), self.len / std::mem::size_of::<usize>())
        }
    }

    fn region(&self) -> Region {
        Region {
            start: self.ptr as usize,
            len: self.len,
        }
    }
}

impl Drop for WritablePage {
    fn drop(&mut self) {
        // SAFETY: unmapping the page created in `new`.
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

impl AddressProvider for WritablePage {
    fn layout(&self) -> SyscallLayout {
        SyscallLayout::X86_64
    }
    fn search_space(&self) -> SearchSpace<'_> {
        SearchSpace::new(&self.words()[..32])
    }
    fn close_reference(&self) -> usize {
        plain_close as usize
    }
    fn read_reference(&self) -> usize {
        plain_read as usize
    }
    fn write_reference(&self) -> usize {
        plain_write as usize
    }
}

#[test]
fn writable_table_page_keeps_its_protection() {
    let host = WritablePage::new();
    let rw = libc::PROT_READ | libc::PROT_WRITE;
    let mut module: SlowDisk<_, _, WritableCtx> = SlowDisk::new(&host, Mprotect);

    module.activate(&ModuleParams::default()).unwrap();
    assert_eq!(
        Mprotect::protections(host.region()).unwrap(),
        vec![(host.region(), rw)]
    );
    module.deactivate().unwrap();
    assert_eq!(
        Mprotect::protections(host.region()).unwrap(),
        vec![(host.region(), rw)]
    );

    // Data next to the table is still writable.
    host.words()[100].store(42, Ordering::Relaxed);
    assert_eq!(host.words()[8].load(Ordering::Relaxed), plain_read as usize);
}

#[test]
fn read_only_table_page_is_read_only_again_after_unload() {
    let host = ProcessTable::new().unwrap();
    let page = Region {
        start: host.table_base(),
        len: 1,
    }
    .page_aligned(Mprotect::page_size());
    let mut registration: Registration<_, _, ReadOnlyCtx> = Registration::new(&host, Mprotect);

    registration.load("").unwrap();
    assert_eq!(Mprotect::protections(page).unwrap(), vec![(page, libc::PROT_READ)]);
    registration.unload().unwrap();
    assert_eq!(Mprotect::protections(page).unwrap(), vec![(page, libc::PROT_READ)]);
}
