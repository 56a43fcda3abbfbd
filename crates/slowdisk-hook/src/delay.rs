//! Calibrated CPU-bound delay.
//!
//! The [`DelayEngine`] picks a magnitude uniformly in the configured
//! inclusive range and burns that many loop iterations on the calling
//! thread before returning.  It never sleeps or yields: the point is to
//! look like slow hardware occupying the I/O path, not like a suspended
//! task.

use crate::config::WaitBounds;
use crate::table::Operation;
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Burn `magnitude` iterations of sequential arithmetic.
///
/// Each step feeds the previous accumulator and the loop index through
/// [`black_box`], so the loop survives optimization and its cost grows
/// linearly with `magnitude`.
pub fn spin(magnitude: u64) {
    let mut acc: u64 = 0;
    for i in 0..magnitude {
        acc = black_box(acc.wrapping_add(i).wrapping_mul(i / 2));
    }
    black_box(acc);
}

/// CPU time consumed so far by the calling thread.
///
/// Returns zero if the clock is unavailable.
pub fn thread_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into a valid, owned timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

enum Entropy {
    /// Per-thread OS-seeded generator; no shared state between callers.
    Thread,
    /// One deterministic stream shared by every caller.
    Seeded(Mutex<ChaCha20Rng>),
}

/// Draws delay magnitudes and spends them.
///
/// # Example
///
/// ```
/// use slowdisk_hook::config::WaitBounds;
/// use slowdisk_hook::delay::DelayEngine;
///
/// let engine = DelayEngine::seeded(WaitBounds::new(200, 500), 7);
/// let waited = engine.spend_delay();
/// assert!((200..=500).contains(&waited));
/// ```
pub struct DelayEngine {
    bounds: WaitBounds,
    /// `max + 1`, computed once so draws land in `[min, max]` inclusive.
    upper: u64,
    entropy: Entropy,
}

impl DelayEngine {
    /// Engine drawing from the thread-local OS-seeded generator.
    ///
    /// `bounds` is expected to be normalized already.  With
    /// `max == u64::MAX` the exclusive upper bound saturates and `max`
    /// itself is never drawn.
    pub fn new(bounds: WaitBounds) -> Self {
        Self::with_entropy(bounds, Entropy::Thread)
    }

    /// Engine drawing from a ChaCha20 stream keyed by `seed`.
    pub fn seeded(bounds: WaitBounds, seed: u64) -> Self {
        Self::with_entropy(bounds, Entropy::Seeded(Mutex::new(rng_from_u64(seed))))
    }

    fn with_entropy(bounds: WaitBounds, entropy: Entropy) -> Self {
        Self {
            bounds,
            upper: bounds.max.saturating_add(1),
            entropy,
        }
    }

    /// The inclusive range this engine draws from.
    pub fn bounds(&self) -> WaitBounds {
        self.bounds
    }

    /// Whether draws are reproducible.
    pub fn is_seeded(&self) -> bool {
        matches!(self.entropy, Entropy::Seeded(_))
    }

    /// Map a raw random word onto the configured range.
    pub fn magnitude_for(&self, raw: u64) -> u64 {
        let interval = self.upper.saturating_sub(self.bounds.min).max(1);
        raw % interval + self.bounds.min
    }

    /// Draw the next magnitude without spending it.
    pub fn draw(&self) -> u64 {
        let raw = match &self.entropy {
            Entropy::Thread => rand::thread_rng().next_u64(),
            Entropy::Seeded(rng) => rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .next_u64(),
        };
        self.magnitude_for(raw)
    }

    /// Draw a magnitude, spin for it, and return it.
    pub fn spend_delay(&self) -> u64 {
        let magnitude = self.draw();
        spin(magnitude);
        magnitude
    }
}

impl std::fmt::Debug for DelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayEngine")
            .field("bounds", &self.bounds)
            .field("seeded", &self.is_seeded())
            .finish()
    }
}

fn rng_from_u64(seed: u64) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    ChaCha20Rng::from_seed(key)
}

/// Lock-free counters of delays spent by the wrappers.
#[derive(Debug, Default)]
pub struct DelayStats {
    reads: AtomicU64,
    writes: AtomicU64,
    total_magnitude: AtomicU64,
    max_magnitude: AtomicU64,
}

/// Point-in-time copy of [`DelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DelayStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub total_magnitude: u64,
    pub max_magnitude: u64,
}

impl DelayStatsSnapshot {
    /// Total delayed calls of either kind.
    pub fn calls(&self) -> u64 {
        self.reads + self.writes
    }

    /// Mean magnitude per delayed call, or 0 with no calls.
    pub fn mean_magnitude(&self) -> f64 {
        match self.calls() {
            0 => 0.0,
            n => self.total_magnitude as f64 / n as f64,
        }
    }
}

impl DelayStats {
    pub const fn new() -> Self {
        Self {
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            total_magnitude: AtomicU64::new(0),
            max_magnitude: AtomicU64::new(0),
        }
    }

    pub fn record(&self, op: Operation, magnitude: u64) {
        match op {
            Operation::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            Operation::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        self.total_magnitude.fetch_add(magnitude, Ordering::Relaxed);
        self.max_magnitude.fetch_max(magnitude, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DelayStatsSnapshot {
        DelayStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            total_magnitude: self.total_magnitude.load(Ordering::Relaxed),
            max_magnitude: self.max_magnitude.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.total_magnitude.store(0, Ordering::Relaxed);
        self.max_magnitude.store(0, Ordering::Relaxed);
    }
}
