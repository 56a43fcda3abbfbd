//! Load-time configuration: the `[minWait, maxWait]` bound pair and the
//! module-parameter string it is read from.
//!
//! Parameters arrive once, at load, as whitespace-separated `key=value`
//! pairs in the style of `insmod slowdisk minWait=200 maxWait=500`.
//! Nothing here can fail: unknown keys and malformed values are logged and
//! skipped, and an unusable bound pair is normalized by
//! [`WaitBounds::normalized`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default lower bound on the per-call delay magnitude.
pub const DEFAULT_MIN_WAIT: u64 = 500;
/// Default upper bound on the per-call delay magnitude.
pub const DEFAULT_MAX_WAIT: u64 = 1000;

/// Environment variable read by [`ModuleParams::from_env`] for `minWait`.
pub const ENV_MIN_WAIT: &str = "SLOWDISK_MIN_WAIT";
/// Environment variable read by [`ModuleParams::from_env`] for `maxWait`.
pub const ENV_MAX_WAIT: &str = "SLOWDISK_MAX_WAIT";
/// Environment variable read by [`ModuleParams::from_env`] for `seed`.
pub const ENV_SEED: &str = "SLOWDISK_SEED";

/// Inclusive range of delay magnitudes, in loop iterations.
///
/// Both ends are unsigned, so a negative bound cannot be expressed at all;
/// the only invalid shapes left are `min > max` and `max == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for WaitBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_WAIT,
            max: DEFAULT_MAX_WAIT,
        }
    }
}

/// A correction applied to a configured bound pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    /// `min > max`; the pair was replaced with the defaults.
    InvertedRange { min: u64, max: u64 },
    /// `max == 0`; `max` was raised to 1.
    ZeroMax,
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::InvertedRange { min, max } => write!(
                f,
                "invalid [minWait, maxWait] range [{}, {}]; normalizing to [{}, {}]",
                min, max, DEFAULT_MIN_WAIT, DEFAULT_MAX_WAIT
            ),
            Normalization::ZeroMax => write!(f, "maxWait is 0; setting it to 1"),
        }
    }
}

impl WaitBounds {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Apply the normalization rules and report which one fired, if any.
    ///
    /// `min > max` takes precedence; the defaults it falls back to never
    /// trigger the `max == 0` rule.
    pub fn normalized(self) -> (WaitBounds, Option<Normalization>) {
        if self.min > self.max {
            (
                WaitBounds::default(),
                Some(Normalization::InvertedRange {
                    min: self.min,
                    max: self.max,
                }),
            )
        } else if self.max == 0 {
            (WaitBounds { min: 0, max: 1 }, Some(Normalization::ZeroMax))
        } else {
            (self, None)
        }
    }
}

impl fmt::Display for WaitBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Parameters supplied by the host at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleParams {
    /// Minimum cycle wait per read/write.
    pub min_wait: u64,
    /// Maximum cycle wait per read/write.
    pub max_wait: u64,
    /// Fixed seed for reproducible delay draws. `None` draws from the
    /// thread-local OS-seeded generator.
    pub seed: Option<u64>,
}

impl Default for ModuleParams {
    fn default() -> Self {
        Self {
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            seed: None,
        }
    }
}

impl ModuleParams {
    /// Parse a module-parameter string such as `"minWait=200 maxWait=500"`.
    ///
    /// Accepts both `minWait` and `min_wait` spellings. Keys that are not
    /// recognized and values that are not unsigned integers are skipped
    /// with a warning, leaving the default in place.
    pub fn parse(input: &str) -> Self {
        let mut params = Self::default();
        for token in input.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => params.apply(key, value),
                None => log::warn!("ignoring parameter without a value: {}", token),
            }
        }
        params
    }

    /// Read parameters from `SLOWDISK_MIN_WAIT`, `SLOWDISK_MAX_WAIT` and
    /// `SLOWDISK_SEED`, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        for (var, key) in [
            (ENV_MIN_WAIT, "minWait"),
            (ENV_MAX_WAIT, "maxWait"),
            (ENV_SEED, "seed"),
        ] {
            if let Ok(value) = std::env::var(var) {
                params.apply(key, &value);
            }
        }
        params
    }

    /// The configured pair, before normalization.
    pub fn bounds(&self) -> WaitBounds {
        WaitBounds::new(self.min_wait, self.max_wait)
    }

    fn apply(&mut self, key: &str, value: &str) {
        let parsed = match value.trim().parse::<u64>() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("ignoring malformed value {:?} for {}: {}", value, key, e);
                return;
            }
        };
        match key {
            "minWait" | "min_wait" => self.min_wait = parsed,
            "maxWait" | "max_wait" => self.max_wait = parsed,
            "seed" => self.seed = Some(parsed),
            other => log::warn!("ignoring unknown parameter {:?}", other),
        }
    }
}
