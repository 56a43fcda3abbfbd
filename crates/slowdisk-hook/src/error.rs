//! Error types shared by every component of the hook.

use std::io;
use thiserror::Error;

/// Errors surfaced to the host by the locate / install / restore cycle.
///
/// Configuration problems are deliberately absent: an out-of-range
/// `[minWait, maxWait]` pair is normalized and reported as a
/// [`Normalization`](crate::config::Normalization), never as a failure.
#[derive(Error, Debug)]
pub enum SlowDiskError {
    /// The locator walked the whole search space without a `close` match.
    #[error("dispatch table not found after scanning {scanned} candidate slots")]
    TableNotFound { scanned: usize },

    /// The write-protection override over the table could not be opened
    /// or closed.
    #[error("memory protection change failed: {0}")]
    Protection(#[source] io::Error),

    /// `deactivate` ran without a matching successful `activate`.
    #[error("restore requested without a prior successful install")]
    RestoreWithoutInstall,

    /// `activate` ran on an instance whose earlier activation failed.
    #[error("activation already failed; load a fresh instance")]
    ActivationFailed,

    /// `activate` ran while wrappers are already installed.
    #[error("hook is already active")]
    AlreadyActive,

    /// The in-process host could not set up its dispatch table.
    #[error("host setup failed: {0}")]
    HostSetup(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, SlowDiskError>;
