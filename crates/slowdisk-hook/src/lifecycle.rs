//! Activation state machine: validate → locate → install, then restore.
//!
//! ```text
//!            activate()                 deactivate()
//! Inactive ──────────→ Activating ──→ Active ──────────→ Deactivating ──→ Inactive
//!                          │
//!                          └── table not found / window refused ──→ FailedToActivate
//! ```
//!
//! `FailedToActivate` is terminal for this instance; the host retries by
//! loading a fresh one.  Nothing is installed on any failure path.

use crate::config::{ModuleParams, Normalization, WaitBounds};
use crate::delay::{DelayEngine, DelayStatsSnapshot};
use crate::error::{Result, SlowDiskError};
use crate::hooks::{hook_pair, GlobalHooks, HookContext};
use crate::host::AddressProvider;
use crate::patcher::{OriginalEntries, TablePatcher};
use crate::protect::MemoryProtection;
use crate::table::{DispatchTable, Operation, TableLocator};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Where the lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Inactive,
    Activating,
    Active,
    Deactivating,
    FailedToActivate,
}

/// What an activation ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// Address of the located table.
    pub table_base: usize,
    /// The pair as configured.
    pub requested: WaitBounds,
    /// The pair in effect after normalization.
    pub bounds: WaitBounds,
    /// The normalization applied, if the configured pair was unusable.
    pub normalization: Option<Normalization>,
    pub seeded: bool,
}

struct Activation<'a> {
    table: DispatchTable<'a>,
    originals: OriginalEntries,
    report: ActivationReport,
}

/// One load/unload cycle of the hook against the table `provider` exposes.
pub struct SlowDisk<'a, A, M, C = GlobalHooks>
where
    A: AddressProvider,
    M: MemoryProtection,
    C: HookContext,
{
    provider: &'a A,
    patcher: TablePatcher<M>,
    phase: Phase,
    active: Option<Activation<'a>>,
    _context: PhantomData<C>,
}

impl<'a, A, M, C> SlowDisk<'a, A, M, C>
where
    A: AddressProvider,
    M: MemoryProtection,
    C: HookContext,
{
    pub fn new(provider: &'a A, protection: M) -> Self {
        Self {
            provider,
            patcher: TablePatcher::new(protection),
            phase: Phase::Inactive,
            active: None,
            _context: PhantomData,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn report(&self) -> Option<&ActivationReport> {
        self.active.as_ref().map(|a| &a.report)
    }

    /// Delays spent by this context's wrappers since activation.
    pub fn stats(&self) -> DelayStatsSnapshot {
        C::state().stats()
    }

    /// Normalize the bounds, locate the table and install the wrappers.
    pub fn activate(&mut self, params: &ModuleParams) -> Result<&ActivationReport> {
        match self.phase {
            Phase::Inactive => {}
            Phase::FailedToActivate => {
                log::error!("activation already failed; load a fresh instance");
                return Err(SlowDiskError::ActivationFailed);
            }
            _ => return Err(SlowDiskError::AlreadyActive),
        }
        self.set_phase(Phase::Activating);

        let requested = params.bounds();
        let (bounds, normalization) = requested.normalized();
        if let Some(fix) = normalization {
            log::warn!("{}", fix);
        }

        let provider = self.provider;
        let locator = TableLocator::new(provider.layout());
        let table = match locator.locate(provider.search_space(), provider.close_reference()) {
            Ok(table) => table,
            Err(e) => {
                log::warn!("could not find the dispatch table: {}", e);
                self.set_phase(Phase::FailedToActivate);
                return Err(e);
            }
        };
        self.check_expected_entries(&table);

        let engine = Arc::new(match params.seed {
            Some(seed) => DelayEngine::seeded(bounds, seed),
            None => DelayEngine::new(bounds),
        });
        let state = C::state();
        if let Err(e) = state.arm(
            engine,
            table.entry(Operation::Read),
            table.entry(Operation::Write),
        ) {
            self.set_phase(Phase::FailedToActivate);
            return Err(e);
        }

        let originals = match self.patcher.install(&table, hook_pair::<C>()) {
            Ok(originals) => originals,
            Err(e) => {
                log::warn!("could not patch the dispatch table: {}", e);
                state.disarm();
                self.set_phase(Phase::FailedToActivate);
                return Err(e);
            }
        };
        debug_assert_eq!(originals.get(Operation::Read), state.original(Operation::Read));
        debug_assert_eq!(originals.get(Operation::Write), state.original(Operation::Write));

        log::info!(
            "Successfully loaded SlowDisk hook at {:#x} with interval {}",
            table.base_addr(),
            bounds
        );
        let report = ActivationReport {
            table_base: table.base_addr(),
            requested,
            bounds,
            normalization,
            seeded: params.seed.is_some(),
        };
        self.set_phase(Phase::Active);
        let activation = self.active.insert(Activation {
            table,
            originals,
            report,
        });
        Ok(&activation.report)
    }

    /// Put the original entries back and stop delaying.
    ///
    /// Without a prior successful [`activate`](Self::activate) this is an
    /// invariant violation and reports
    /// [`SlowDiskError::RestoreWithoutInstall`] without touching anything.
    /// If the write window cannot be opened the instance stays `Active`.
    pub fn deactivate(&mut self) -> Result<()> {
        let Some(Activation {
            table,
            originals,
            report,
        }) = self.active.take()
        else {
            log::error!("deactivate called in phase {:?} with nothing installed", self.phase);
            return Err(SlowDiskError::RestoreWithoutInstall);
        };
        self.set_phase(Phase::Deactivating);

        match self.patcher.restore(&table, originals) {
            Ok(()) => {
                C::state().disarm();
                self.set_phase(Phase::Inactive);
                log::info!("Successfully unloaded SlowDisk hook");
                Ok(())
            }
            Err((originals, e)) => {
                log::error!("could not restore the dispatch table: {}", e);
                self.active = Some(Activation {
                    table,
                    originals,
                    report,
                });
                self.set_phase(Phase::Active);
                Err(e)
            }
        }
    }

    // ── Internal ────────────────────────────────────────────────

    fn set_phase(&mut self, phase: Phase) {
        log::debug!("lifecycle {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Warn when the live entries are not the implementations the host
    /// expects, e.g. because another interposer got there first.
    fn check_expected_entries(&self, table: &DispatchTable<'_>) {
        for (op, expected) in [
            (Operation::Read, self.provider.read_reference()),
            (Operation::Write, self.provider.write_reference()),
        ] {
            let found = table.entry(op);
            if found != expected {
                log::warn!(
                    "{} entry is {:#x}, expected {:#x}; forwarding to the live entry",
                    op.name(),
                    found,
                    expected
                );
            }
        }
    }
}

impl<A, M, C> Drop for SlowDisk<'_, A, M, C>
where
    A: AddressProvider,
    M: MemoryProtection,
    C: HookContext,
{
    fn drop(&mut self) {
        if let Some(Activation {
            table, originals, ..
        }) = self.active.take()
        {
            log::warn!("SlowDisk dropped while active; restoring the table");
            match self.patcher.restore(&table, originals) {
                Ok(()) => C::state().disarm(),
                Err((_, e)) => log::error!("could not restore the dispatch table: {}", e),
            }
        }
    }
}
