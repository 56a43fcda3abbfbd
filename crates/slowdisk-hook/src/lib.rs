//! Artificially slow `read`/`write` by patching a dispatch table.
//!
//! The hook finds the table that routes read/write requests, swaps those
//! two entries for wrappers that burn a random, bounded amount of CPU
//! before forwarding, and puts the originals back on unload.  The result
//! behaves like slow storage on a machine whose real disks are fast.
//!
//! # Components
//!
//! 1. **[`delay`]**: draws a magnitude in `[minWait, maxWait]` and spins
//!    for it
//! 2. **[`table`]**: dispatch table handle and the locator heuristic
//! 3. **[`patcher`]**: swaps and restores the two entries under a
//!    [`protect::WriteWindow`]
//! 4. **[`hooks`]**: the `extern "C"` wrappers
//! 5. **[`lifecycle`]**: parameter normalization and the
//!    locate → install → restore state machine
//!
//! # Architecture
//!
//! ```text
//! Host                     Lifecycle                  Table
//! ────                     ─────────                  ─────
//! Registration::load() ──→ normalize bounds
//!                          TableLocator::locate() ──→ scan for close slot
//!                          TablePatcher::install() ─→ read/write = hooks
//! table[read](..)  ──────────────────────────────────→ read_hook ─→ spin ─→ original
//! Registration::unload() → TablePatcher::restore() ─→ read/write = originals
//! ```

pub mod config;
pub mod delay;
pub mod error;
pub mod hooks;
pub mod host;
pub mod lifecycle;
pub mod patcher;
pub mod protect;
pub mod table;

pub use config::{ModuleParams, WaitBounds};
pub use error::{Result, SlowDiskError};
pub use lifecycle::{ActivationReport, Phase, SlowDisk};
