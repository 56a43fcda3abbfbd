//! Swapping the read/write entries of a dispatch table.
//!
//! [`TablePatcher::install`] hands back an [`OriginalEntries`] value that
//! [`TablePatcher::restore`] consumes.  The type is neither `Clone` nor
//! constructible outside this module, so a restore without an install,
//! or two restores for one install, does not compile.

use crate::error::{Result, SlowDiskError};
use crate::protect::{MemoryProtection, WriteWindow};
use crate::table::{DispatchTable, Operation};

/// Addresses to write into the read and write slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookPair {
    pub read: usize,
    pub write: usize,
}

impl HookPair {
    pub fn get(&self, op: Operation) -> usize {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
        }
    }
}

/// Table entries as they were before [`TablePatcher::install`].
#[must_use = "dropping the originals makes the table impossible to restore"]
#[derive(Debug, PartialEq, Eq)]
pub struct OriginalEntries {
    read: usize,
    write: usize,
}

impl OriginalEntries {
    pub fn get(&self, op: Operation) -> usize {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
        }
    }
}

/// Single writer to a dispatch table.
#[derive(Debug)]
pub struct TablePatcher<P> {
    protection: P,
}

impl<P: MemoryProtection> TablePatcher<P> {
    pub fn new(protection: P) -> Self {
        Self { protection }
    }

    pub fn protection(&self) -> &P {
        &self.protection
    }

    /// Save the current read/write entries and point them at `hooks`.
    ///
    /// Both stores happen inside one write window.  If the window cannot
    /// be opened nothing is written.  A failure to re-protect afterwards
    /// is logged but does not undo the install, since the originals
    /// would otherwise be lost.
    pub fn install(&mut self, table: &DispatchTable<'_>, hooks: HookPair) -> Result<OriginalEntries> {
        let window =
            WriteWindow::open(&self.protection, table.region()).map_err(SlowDiskError::Protection)?;

        let originals = OriginalEntries {
            read: table.entry(Operation::Read),
            write: table.entry(Operation::Write),
        };
        table.store(Operation::Write, hooks.write);
        table.store(Operation::Read, hooks.read);

        if let Err(e) = window.close() {
            log::error!("table patched but write protection not restored: {}", e);
        }
        log::debug!(
            "installed hooks at {:#x}: read {:#x} -> {:#x}, write {:#x} -> {:#x}",
            table.base_addr(),
            originals.read,
            hooks.read,
            originals.write,
            hooks.write
        );
        Ok(originals)
    }

    /// Write `originals` back into the read/write slots.
    ///
    /// On failure to open the window the originals are handed back so the
    /// caller can retry.
    pub fn restore(
        &mut self,
        table: &DispatchTable<'_>,
        originals: OriginalEntries,
    ) -> std::result::Result<(), (OriginalEntries, SlowDiskError)> {
        let window = match WriteWindow::open(&self.protection, table.region()) {
            Ok(w) => w,
            Err(e) => return Err((originals, SlowDiskError::Protection(e))),
        };

        table.store(Operation::Write, originals.write);
        table.store(Operation::Read, originals.read);

        if let Err(e) = window.close() {
            log::error!("table restored but write protection not restored: {}", e);
        }
        log::debug!("restored original entries at {:#x}", table.base_addr());
        Ok(())
    }
}
