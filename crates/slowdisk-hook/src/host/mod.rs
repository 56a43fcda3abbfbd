//! Host-side collaborators: where the table lives and who loads the hook.
//!
//! - [`AddressProvider`]: the search space, the slot layout, and the
//!   reference addresses used to recognize the table
//! - [`Registration`]: the load/unload hooks a host wires to its own
//!   module lifecycle
//! - [`ProcessTable`]: an in-process host with a read-only dispatch table
//!   the current process, routed to libc

mod process;

pub use process::ProcessTable;

use crate::config::ModuleParams;
use crate::error::{Result, SlowDiskError};
use crate::hooks::{GlobalHooks, HookContext};
use crate::lifecycle::{ActivationReport, Phase, SlowDisk};
use crate::protect::MemoryProtection;
use crate::table::{SearchSpace, SyscallLayout};

/// Reference addresses and memory the locator needs from the host.
pub trait AddressProvider {
    fn layout(&self) -> SyscallLayout;

    /// Memory the locator may scan.
    fn search_space(&self) -> SearchSpace<'_>;

    /// Address of the real `close`, used to recognize the table.
    fn close_reference(&self) -> usize;

    /// Address of the real `read` the table is expected to hold.
    fn read_reference(&self) -> usize;

    /// Address of the real `write` the table is expected to hold.
    fn write_reference(&self) -> usize;
}

/// Load/unload entry points for one host.
///
/// Every `load` builds a fresh [`SlowDisk`], so a failed load leaves
/// nothing behind and the next one starts clean.
pub struct Registration<'a, A, M, C = GlobalHooks>
where
    A: AddressProvider,
    M: MemoryProtection + Clone,
    C: HookContext,
{
    provider: &'a A,
    protection: M,
    module: Option<SlowDisk<'a, A, M, C>>,
}

impl<'a, A, M, C> Registration<'a, A, M, C>
where
    A: AddressProvider,
    M: MemoryProtection + Clone,
    C: HookContext,
{
    pub fn new(provider: &'a A, protection: M) -> Self {
        Self {
            provider,
            protection,
            module: None,
        }
    }

    /// Load hook: parse `params` (`"minWait=.. maxWait=.."`) and activate.
    pub fn load(&mut self, params: &str) -> Result<ActivationReport> {
        self.load_with(&ModuleParams::parse(params))
    }

    /// Load hook with already-parsed parameters.
    pub fn load_with(&mut self, params: &ModuleParams) -> Result<ActivationReport> {
        if self.is_loaded() {
            return Err(SlowDiskError::AlreadyActive);
        }
        let mut module = SlowDisk::new(self.provider, self.protection.clone());
        let report = module.activate(params)?.clone();
        self.module = Some(module);
        Ok(report)
    }

    /// Unload hook.  Only valid after a successful [`load`](Self::load).
    pub fn unload(&mut self) -> Result<()> {
        let Some(module) = self.module.as_mut() else {
            log::error!("unload called without a loaded module");
            return Err(SlowDiskError::RestoreWithoutInstall);
        };
        module.deactivate()?;
        self.module = None;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.module
            .as_ref()
            .is_some_and(|m| m.phase() == Phase::Active)
    }

    pub fn module(&self) -> Option<&SlowDisk<'a, A, M, C>> {
        self.module.as_ref()
    }
}
