//! A dispatch table living in the current process.
//!
//! One anonymous page is mapped, a table is written at a fixed word offset
//! inside it, and the page is made read-only.  Slots follow the x86-64
//! syscall numbering; `read`, `write` and `close` route to libc through
//! adapters that return `-errno` on failure, every other slot returns
//! `-ENOSYS`.  The rest of the page is zero, so the locator has to scan
//! past it to find the table.
//!
//! ```text
//! page: [ 0 0 0 … 0 | read write open close … ni ni | 0 0 … ]
//!                   ^ TABLE_OFFSET
//! ```

use super::AddressProvider;
use crate::error::{Result, SlowDiskError};
use crate::hooks::{ReadFn, WriteFn};
use crate::protect::Mprotect;
use crate::table::{Operation, SearchSpace, SyscallLayout};
use libc::{c_char, c_int, c_long, c_uint, size_t};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Word offset of slot 0 inside the page.
const TABLE_OFFSET: usize = 64;
/// Number of slots populated.
const TABLE_SLOTS: usize = 16;

type CloseFn = unsafe extern "C" fn(fd: c_uint) -> c_long;

fn neg_errno() -> c_long {
    -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as c_long)
}

unsafe extern "C" fn sys_read(fd: c_uint, buf: *mut c_char, count: size_t) -> c_long {
    // SAFETY: forwarded verbatim from the caller, who owns the contract.
    let n = unsafe { libc::read(fd as c_int, buf.cast(), count) };
    if n < 0 {
        neg_errno()
    } else {
        n as c_long
    }
}

unsafe extern "C" fn sys_write(fd: c_uint, buf: *const c_char, count: size_t) -> c_long {
    // SAFETY: forwarded verbatim from the caller, who owns the contract.
    let n = unsafe { libc::write(fd as c_int, buf.cast(), count) };
    if n < 0 {
        neg_errno()
    } else {
        n as c_long
    }
}

unsafe extern "C" fn sys_close(fd: c_uint) -> c_long {
    // SAFETY: closing an fd has no memory-safety preconditions.
    if unsafe { libc::close(fd as c_int) } < 0 {
        neg_errno()
    } else {
        0
    }
}

unsafe extern "C" fn sys_ni_syscall() -> c_long {
    -(libc::ENOSYS as c_long)
}

/// Convert a `-errno` style return into an `io::Result`.
fn check(ret: c_long) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::from_raw_os_error(-ret as i32))
    } else {
        Ok(ret as usize)
    }
}

/// A read-only, page-backed syscall table for this process.
///
/// # Example
///
/// ```no_run
/// use slowdisk_hook::host::{ProcessTable, Registration};
/// use slowdisk_hook::protect::Mprotect;
///
/// let host = ProcessTable::new().unwrap();
/// let mut registration: Registration<_, _> = Registration::new(&host, Mprotect);
/// registration.load("minWait=200 maxWait=500").unwrap();
///
/// // Every write dispatched through the table now spins first.
/// host.dispatch_write(1, b"slow hello\n").unwrap();
///
/// registration.unload().unwrap();
/// ```
#[derive(Debug)]
pub struct ProcessTable {
    page: *mut AtomicUsize,
    page_words: usize,
    layout: SyscallLayout,
}

// SAFETY: the page is only touched through atomic word accesses, and the
// mapping lives until drop.
unsafe impl Send for ProcessTable {}
unsafe impl Sync for ProcessTable {}

impl ProcessTable {
    /// Map the page, populate the table and drop write permission.
    pub fn new() -> Result<Self> {
        let page_size = Mprotect::page_size();
        let page_words = page_size / std::mem::size_of::<usize>();
        let layout = SyscallLayout::X86_64;
        debug_assert!(TABLE_OFFSET + TABLE_SLOTS <= page_words);
        debug_assert!(layout.table_len() <= TABLE_SLOTS);

        // SAFETY: fresh anonymous private mapping; checked for MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SlowDiskError::HostSetup(io::Error::last_os_error()));
        }

        let table = Self {
            page: ptr.cast(),
            page_words,
            layout,
        };
        let words = table.words();
        for slot in 0..TABLE_SLOTS {
            words[TABLE_OFFSET + slot].store(sys_ni_syscall as usize, Ordering::Relaxed);
        }
        words[TABLE_OFFSET + layout.read].store(sys_read as ReadFn as usize, Ordering::Relaxed);
        words[TABLE_OFFSET + layout.write].store(sys_write as WriteFn as usize, Ordering::Relaxed);
        words[TABLE_OFFSET + layout.close].store(sys_close as CloseFn as usize, Ordering::Relaxed);

        // SAFETY: `ptr` is the page-aligned mapping created above.
        if unsafe { libc::mprotect(ptr, page_size, libc::PROT_READ) } != 0 {
            return Err(SlowDiskError::HostSetup(io::Error::last_os_error()));
        }
        log::debug!("process dispatch table at {:#x}", table.table_base());
        Ok(table)
    }

    fn words(&self) -> &[AtomicUsize] {
        // SAFETY: the mapping spans `page_words` words for the life of self.
        unsafe { std::slice::from_raw_parts(self.page, self.page_words) }
    }

    fn slot(&self, n: usize) -> usize {
        self.words()[TABLE_OFFSET + n].load(Ordering::Acquire)
    }

    /// Address of slot 0.
    pub fn table_base(&self) -> usize {
        self.words()[TABLE_OFFSET..].as_ptr() as usize
    }

    /// Current entry for `op`.
    pub fn entry(&self, op: Operation) -> usize {
        self.slot(self.layout.slot(op))
    }

    /// Route a `read` through whatever the table currently holds.
    pub fn dispatch_read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the read slot only ever holds a `ReadFn`: the adapter
        // above or a wrapper installed by the patcher.
        let read = unsafe { std::mem::transmute::<usize, ReadFn>(self.entry(Operation::Read)) };
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        check(unsafe { read(fd as c_uint, buf.as_mut_ptr().cast(), buf.len()) })
    }

    /// Route a `write` through whatever the table currently holds.
    pub fn dispatch_write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: as in `dispatch_read`, for the write slot.
        let write = unsafe { std::mem::transmute::<usize, WriteFn>(self.entry(Operation::Write)) };
        // SAFETY: `buf` is valid for `buf.len()` readable bytes.
        check(unsafe { write(fd as c_uint, buf.as_ptr().cast(), buf.len()) })
    }

    /// Route a `close` through the table.
    pub fn dispatch_close(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: the close slot is never patched and holds a `CloseFn`.
        let close = unsafe { std::mem::transmute::<usize, CloseFn>(self.slot(self.layout.close)) };
        // SAFETY: see `sys_close`.
        check(unsafe { close(fd as c_uint) }).map(|_| ())
    }
}

impl AddressProvider for ProcessTable {
    fn layout(&self) -> SyscallLayout {
        self.layout
    }

    fn search_space(&self) -> SearchSpace<'_> {
        SearchSpace::new(self.words())
    }

    fn close_reference(&self) -> usize {
        sys_close as CloseFn as usize
    }

    fn read_reference(&self) -> usize {
        sys_read as ReadFn as usize
    }

    fn write_reference(&self) -> usize {
        sys_write as WriteFn as usize
    }
}

impl Drop for ProcessTable {
    fn drop(&mut self) {
        // SAFETY: unmapping the page created in `new`; no references
        // outlive self.
        unsafe {
            libc::munmap(
                self.page.cast(),
                self.page_words * std::mem::size_of::<usize>(),
            );
        }
    }
}
