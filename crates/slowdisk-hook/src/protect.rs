//! Write-protection control over the dispatch table's memory.
//!
//! The table normally lives in read-only memory.  The patcher lifts that
//! protection through a [`WriteWindow`], an RAII guard that puts the
//! previous state back when it goes out of scope, on error and unwind
//! paths included.

use std::io;

/// A byte range of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

impl Region {
    /// Smallest page-aligned range covering this region.
    pub fn page_aligned(&self, page_size: usize) -> Region {
        let start = self.start & !(page_size - 1);
        let end = (self.start + self.len).div_ceil(page_size) * page_size;
        Region {
            start,
            len: end - start,
        }
    }
}

/// Privileged control over write protection.
pub trait MemoryProtection {
    /// Whatever is needed to undo one `disable_write_protection` call.
    type Saved;

    /// Make `region` writable, returning the state to restore.
    fn disable_write_protection(&self, region: Region) -> io::Result<Self::Saved>;

    /// Put back the state captured by `disable_write_protection`.
    fn restore_write_protection(&self, saved: Self::Saved) -> io::Result<()>;
}

/// Memory that is always writable; both operations are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unprotected;

impl MemoryProtection for Unprotected {
    type Saved = ();

    fn disable_write_protection(&self, _region: Region) -> io::Result<()> {
        Ok(())
    }

    fn restore_write_protection(&self, _saved: ()) -> io::Result<()> {
        Ok(())
    }
}

/// Toggles `PROT_WRITE` on the pages covering a region with `mprotect(2)`.
///
/// The protection in force before the window opened is read from
/// `/proc/self/maps`, one segment per mapping, and put back exactly when
/// the window closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mprotect;

/// Pre-window protection of the pages a [`Mprotect`] window covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedProtection {
    segments: Vec<(Region, libc::c_int)>,
}

impl Mprotect {
    pub fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    /// Current protection of every mapping overlapping `pages`, clipped
    /// to `pages`.
    ///
    /// Fails with `ENOMEM` if part of the range is not mapped.
    pub fn protections(pages: Region) -> io::Result<Vec<(Region, libc::c_int)>> {
        let maps = std::fs::read_to_string("/proc/self/maps")?;
        let end = pages.start + pages.len;
        let mut segments = Vec::new();
        let mut covered = 0;
        for (mapping, prot) in maps.lines().filter_map(parse_maps_line) {
            let lo = mapping.start.max(pages.start);
            let hi = (mapping.start + mapping.len).min(end);
            if lo < hi {
                segments.push((Region { start: lo, len: hi - lo }, prot));
                covered += hi - lo;
            }
        }
        if covered != pages.len {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok(segments)
    }

    fn protect(region: Region, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: the region is page-aligned; mprotect validates the
        // mapping itself and reports ENOMEM for unmapped pages.
        let rc = unsafe { libc::mprotect(region.start as *mut libc::c_void, region.len, prot) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reapply saved protections, continuing past failures and reporting
    /// the first one.
    fn reapply(segments: &[(Region, libc::c_int)]) -> io::Result<()> {
        let mut first = Ok(());
        for &(region, prot) in segments {
            if let Err(e) = Self::protect(region, prot) {
                log::error!("mprotect({:#x}+{}) failed: {}", region.start, region.len, e);
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

/// Parse one `/proc/self/maps` line into its address range and
/// `PROT_*` bits.
fn parse_maps_line(line: &str) -> Option<(Region, libc::c_int)> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = fields.next()?.as_bytes();
    if perms.len() < 3 || end <= start {
        return None;
    }
    let mut prot = libc::PROT_NONE;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC;
    }
    Some((
        Region {
            start,
            len: end - start,
        },
        prot,
    ))
}

impl MemoryProtection for Mprotect {
    type Saved = SavedProtection;

    fn disable_write_protection(&self, region: Region) -> io::Result<SavedProtection> {
        let pages = region.page_aligned(Self::page_size());
        let segments = Self::protections(pages)?;
        for (i, &(segment, prot)) in segments.iter().enumerate() {
            if let Err(e) = Self::protect(segment, prot | libc::PROT_READ | libc::PROT_WRITE) {
                let _ = Self::reapply(&segments[..i]);
                return Err(e);
            }
        }
        Ok(SavedProtection { segments })
    }

    fn restore_write_protection(&self, saved: SavedProtection) -> io::Result<()> {
        Self::reapply(&saved.segments)
    }
}

/// Scoped write permission over a region.
pub struct WriteWindow<'p, P: MemoryProtection> {
    protection: &'p P,
    saved: Option<P::Saved>,
}

impl<'p, P: MemoryProtection> WriteWindow<'p, P> {
    pub fn open(protection: &'p P, region: Region) -> io::Result<Self> {
        let saved = protection.disable_write_protection(region)?;
        log::trace!("write window opened over {:#x}+{}", region.start, region.len);
        Ok(Self {
            protection,
            saved: Some(saved),
        })
    }

    /// Close the window and report whether protection came back.
    pub fn close(mut self) -> io::Result<()> {
        match self.saved.take() {
            Some(saved) => self.protection.restore_write_protection(saved),
            None => Ok(()),
        }
    }
}

impl<P: MemoryProtection> Drop for WriteWindow<'_, P> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = self.protection.restore_write_protection(saved) {
                log::error!("failed to restore write protection: {}", e);
            }
        }
    }
}
