//! The dispatch table and the heuristic that finds it.
//!
//! A dispatch table is a run of machine words, one function address per
//! operation number.  Nothing exports its location, so the
//! [`TableLocator`] walks a [`SearchSpace`] until the `close` slot of a
//! candidate window holds the address of the real `close`
//! implementation.
//!
//! Every word is accessed as an [`AtomicUsize`]: callers read entries on
//! every dispatch while the patcher rewrites two of them, and a torn
//! pointer would be fatal.

use crate::error::{Result, SlowDiskError};
use crate::protect::Region;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One of the two intercepted byte-transfer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::Read, Operation::Write];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// Slot numbers of the operations the hook cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallLayout {
    pub read: usize,
    pub write: usize,
    /// Slot compared against the reference address while locating.
    pub close: usize,
}

impl SyscallLayout {
    /// `__NR_read`, `__NR_write`, `__NR_close` on x86-64 Linux.
    pub const X86_64: SyscallLayout = SyscallLayout {
        read: 0,
        write: 1,
        close: 3,
    };

    pub fn slot(&self, op: Operation) -> usize {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
        }
    }

    /// Number of words a table must span to cover every slot used here.
    pub fn table_len(&self) -> usize {
        self.read.max(self.write).max(self.close) + 1
    }
}

impl Default for SyscallLayout {
    fn default() -> Self {
        Self::X86_64
    }
}

/// A bounded range of words the locator may read.
#[derive(Debug, Clone, Copy)]
pub struct SearchSpace<'a> {
    words: &'a [AtomicUsize],
}

impl<'a> SearchSpace<'a> {
    pub fn new(words: &'a [AtomicUsize]) -> Self {
        Self { words }
    }

    /// View `len` words starting at `base` as a search space.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `base` is word-aligned and `base..base + len` words is mapped and
    ///   readable for `'a`
    /// - every write to that range during `'a` is a word-sized atomic store
    pub unsafe fn from_raw(base: *const usize, len: usize) -> Self {
        // AtomicUsize has the same size and alignment as usize.
        Self {
            words: std::slice::from_raw_parts(base.cast::<AtomicUsize>(), len),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn base_addr(&self) -> usize {
        self.words.as_ptr() as usize
    }
}

/// Handle to a located dispatch table.
///
/// Reading entries is open to anyone; writing is reserved for the
/// patcher.
#[derive(Debug)]
pub struct DispatchTable<'a> {
    entries: &'a [AtomicUsize],
    layout: SyscallLayout,
}

impl<'a> DispatchTable<'a> {
    /// Address of slot 0.
    pub fn base_addr(&self) -> usize {
        self.entries.as_ptr() as usize
    }

    pub fn layout(&self) -> SyscallLayout {
        self.layout
    }

    /// Current entry for `op`.
    pub fn entry(&self, op: Operation) -> usize {
        self.entries[self.layout.slot(op)].load(Ordering::Acquire)
    }

    /// Current `close` entry.
    pub fn close_entry(&self) -> usize {
        self.entries[self.layout.close].load(Ordering::Acquire)
    }

    /// Memory spanned by the slots this table handle covers.
    pub fn region(&self) -> Region {
        Region {
            start: self.base_addr(),
            len: std::mem::size_of_val(self.entries),
        }
    }

    pub(crate) fn store(&self, op: Operation, value: usize) {
        self.entries[self.layout.slot(op)].store(value, Ordering::Release);
    }
}

/// Finds a dispatch table by matching its `close` slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableLocator {
    layout: SyscallLayout,
}

impl TableLocator {
    pub fn new(layout: SyscallLayout) -> Self {
        Self { layout }
    }

    /// Scan `space` upward for a table whose `close` entry equals
    /// `close_reference`.
    ///
    /// Only candidates whose full window fits inside `space` are
    /// considered, so the scan never reads past the end.  A zero
    /// reference can never identify a table and is rejected outright.
    pub fn locate<'a>(
        &self,
        space: SearchSpace<'a>,
        close_reference: usize,
    ) -> Result<DispatchTable<'a>> {
        let window = self.layout.table_len();
        if close_reference == 0 || space.len() < window {
            return Err(SlowDiskError::TableNotFound { scanned: 0 });
        }

        let candidates = space.len() - window + 1;
        for base in 0..candidates {
            let close = space.words[base + self.layout.close].load(Ordering::Relaxed);
            if close == close_reference {
                log::debug!(
                    "dispatch table candidate at {:#x} (slot {} of search space)",
                    space.base_addr() + base * std::mem::size_of::<usize>(),
                    base
                );
                return Ok(DispatchTable {
                    entries: &space.words[base..base + window],
                    layout: self.layout,
                });
            }
        }

        Err(SlowDiskError::TableNotFound {
            scanned: candidates,
        })
    }
}
