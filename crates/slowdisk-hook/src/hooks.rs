//! The read/write interception wrappers.
//!
//! A table entry is a bare function address, so a wrapper cannot capture
//! anything: it has to find the delay engine and the original entry in
//! static memory.  Each [`HookContext`] names one such static
//! [`HookState`], and [`read_hook`] / [`write_hook`] are instantiated per
//! context.  The host uses [`GlobalHooks`]; independent contexts let
//! several tables be hooked side by side.
//!
//! ```text
//! caller ──→ table[read] ──→ read_hook::<C>
//!                               ├─ C::state().delay()   (spin)
//!                               └─ original read(fd, buf, count)
//! ```

use crate::delay::{DelayEngine, DelayStats, DelayStatsSnapshot};
use crate::error::{Result, SlowDiskError};
use crate::patcher::HookPair;
use crate::table::Operation;
use libc::{c_char, c_long, c_uint, size_t};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Table entry signature for `read`.
pub type ReadFn = unsafe extern "C" fn(fd: c_uint, buf: *mut c_char, count: size_t) -> c_long;
/// Table entry signature for `write`.
pub type WriteFn = unsafe extern "C" fn(fd: c_uint, buf: *const c_char, count: size_t) -> c_long;

/// Static state one pair of wrappers forwards through.
///
/// The original addresses are set before the wrappers become reachable
/// and are never cleared, so a call that entered a wrapper just before
/// restore still reaches a valid implementation.
///
/// The engine is published as a raw `Arc` pointer.  Wrappers never lock:
/// they bump `in_flight`, load the pointer and spin.  [`disarm`] swaps
/// the pointer out and frees the engine only once `in_flight` drains.
///
/// [`disarm`]: HookState::disarm
#[derive(Debug)]
pub struct HookState {
    original_read: AtomicUsize,
    original_write: AtomicUsize,
    engine: AtomicPtr<DelayEngine>,
    in_flight: AtomicUsize,
    stats: DelayStats,
}

impl Default for HookState {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one wrapper call for as long as it may touch the engine.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HookState {
    pub const fn new() -> Self {
        Self {
            original_read: AtomicUsize::new(0),
            original_write: AtomicUsize::new(0),
            engine: AtomicPtr::new(std::ptr::null_mut()),
            in_flight: AtomicUsize::new(0),
            stats: DelayStats::new(),
        }
    }

    /// Publish the engine and the addresses to forward to.
    ///
    /// Fails with [`SlowDiskError::AlreadyActive`] if another activation
    /// holds this state.
    pub fn arm(
        &self,
        engine: Arc<DelayEngine>,
        original_read: usize,
        original_write: usize,
    ) -> Result<()> {
        let ptr = Arc::into_raw(engine).cast_mut();
        if self
            .engine
            .compare_exchange(std::ptr::null_mut(), ptr, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // SAFETY: `ptr` came from `Arc::into_raw` above and was never
            // published.
            drop(unsafe { Arc::from_raw(ptr) });
            return Err(SlowDiskError::AlreadyActive);
        }
        self.original_read.store(original_read, Ordering::Release);
        self.original_write.store(original_write, Ordering::Release);
        self.stats.reset();
        Ok(())
    }

    /// Stop delaying.  Forwarding keeps working for in-flight callers.
    ///
    /// Returns once no wrapper can still be spinning on the old engine.
    pub fn disarm(&self) {
        let ptr = self.engine.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if ptr.is_null() {
            return;
        }
        let waiting = self.in_flight();
        if waiting > 0 {
            log::debug!("waiting for {} in-flight delays", waiting);
        }
        while self.in_flight() != 0 {
            std::thread::yield_now();
        }
        // SAFETY: `ptr` came from `Arc::into_raw` in `arm`, is no longer
        // published, and every caller that could have loaded it has left.
        drop(unsafe { Arc::from_raw(ptr) });
    }

    pub fn is_armed(&self) -> bool {
        !self.engine.load(Ordering::SeqCst).is_null()
    }

    /// Wrapper calls currently inside [`delay`](Self::delay).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn original(&self, op: Operation) -> usize {
        match op {
            Operation::Read => self.original_read.load(Ordering::Acquire),
            Operation::Write => self.original_write.load(Ordering::Acquire),
        }
    }

    pub fn stats(&self) -> DelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spend one delay for `op` and return its magnitude; 0 when disarmed.
    pub fn delay(&self, op: Operation) -> u64 {
        let _guard = InFlight::enter(&self.in_flight);
        let ptr = self.engine.load(Ordering::SeqCst);
        // SAFETY: this call is counted in `in_flight` before the load, so
        // `disarm` cannot free a non-null engine until the guard drops.
        let Some(engine) = (unsafe { ptr.as_ref() }) else {
            return 0;
        };
        let magnitude = engine.spend_delay();
        self.stats.record(op, magnitude);
        log::trace!("{} delayed by {} cycles", op.name(), magnitude);
        magnitude
    }
}

impl Drop for HookState {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Names the static [`HookState`] a set of wrappers uses.
pub trait HookContext: 'static {
    fn state() -> &'static HookState;
}

static GLOBAL_STATE: HookState = HookState::new();

/// The process-wide hook context.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalHooks;

impl HookContext for GlobalHooks {
    fn state() -> &'static HookState {
        &GLOBAL_STATE
    }
}

/// Interception wrapper for `read`.
///
/// # Safety
///
/// Same contract as the original `read` entry; arguments are forwarded
/// untouched.
pub unsafe extern "C" fn read_hook<C: HookContext>(
    fd: c_uint,
    buf: *mut c_char,
    count: size_t,
) -> c_long {
    let state = C::state();
    state.delay(Operation::Read);
    match state.original(Operation::Read) {
        0 => -(libc::ENOSYS as c_long),
        addr => {
            // SAFETY: non-zero originals are only ever stored from a read
            // slot of a dispatch table, which holds a `ReadFn`.
            let original = unsafe { std::mem::transmute::<usize, ReadFn>(addr) };
            unsafe { original(fd, buf, count) }
        }
    }
}

/// Interception wrapper for `write`.
///
/// # Safety
///
/// Same contract as the original `write` entry; arguments are forwarded
/// untouched.
pub unsafe extern "C" fn write_hook<C: HookContext>(
    fd: c_uint,
    buf: *const c_char,
    count: size_t,
) -> c_long {
    let state = C::state();
    state.delay(Operation::Write);
    match state.original(Operation::Write) {
        0 => -(libc::ENOSYS as c_long),
        addr => {
            // SAFETY: as in `read_hook`, for the write slot.
            let original = unsafe { std::mem::transmute::<usize, WriteFn>(addr) };
            unsafe { original(fd, buf, count) }
        }
    }
}

/// Addresses of the wrappers for context `C`, ready for the patcher.
pub fn hook_pair<C: HookContext>() -> HookPair {
    HookPair {
        read: read_hook::<C> as ReadFn as usize,
        write: write_hook::<C> as WriteFn as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitBounds;

    static ECHO_STATE: HookState = HookState::new();
    struct Echo;
    impl HookContext for Echo {
        fn state() -> &'static HookState {
            &ECHO_STATE
        }
    }

    static SLOW_STATE: HookState = HookState::new();

    static BARE_STATE: HookState = HookState::new();
    struct Bare;
    impl HookContext for Bare {
        fn state() -> &'static HookState {
            &BARE_STATE
        }
    }

    /// Returns a value derived from every argument so forwarding is
    /// checked bit for bit.
    unsafe extern "C" fn fake_read(fd: c_uint, buf: *mut c_char, count: size_t) -> c_long {
        (fd as c_long) * 1_000_000 + (buf as usize as c_long % 1000) * 1000 + count as c_long
    }

    unsafe extern "C" fn fake_write(fd: c_uint, _buf: *const c_char, count: size_t) -> c_long {
        if fd == 99 {
            return -(libc::EBADF as c_long);
        }
        count as c_long
    }

    #[test]
    fn wrappers_forward_arguments_and_results() {
        let engine = Arc::new(DelayEngine::seeded(WaitBounds::new(10, 20), 5));
        ECHO_STATE
            .arm(engine, fake_read as ReadFn as usize, fake_write as WriteFn as usize)
            .unwrap();
        let again = Arc::new(DelayEngine::new(WaitBounds::default()));
        assert!(matches!(
            ECHO_STATE.arm(again, 1, 2),
            Err(SlowDiskError::AlreadyActive)
        ));
        let hooks = hook_pair::<Echo>();
        let read = unsafe { std::mem::transmute::<usize, ReadFn>(hooks.read) };
        let write = unsafe { std::mem::transmute::<usize, WriteFn>(hooks.write) };

        let buf = 0x1234usize as *mut c_char;
        let direct = unsafe { fake_read(7, buf, 42) };
        assert_eq!(unsafe { read(7, buf, 42) }, direct);
        assert_eq!(unsafe { write(3, buf, 512) }, 512);
        // Errors come back untransformed.
        assert_eq!(unsafe { write(99, buf, 512) }, -(libc::EBADF as c_long));

        let stats = ECHO_STATE.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 2);
        assert!(stats.max_magnitude >= 10 && stats.max_magnitude <= 20);
        assert!(stats.total_magnitude >= 30 && stats.total_magnitude <= 60);

        ECHO_STATE.disarm();
        assert!(!ECHO_STATE.is_armed());
        assert_eq!(ECHO_STATE.delay(Operation::Read), 0);
        // Still forwards after disarm.
        assert_eq!(unsafe { read(7, buf, 42) }, direct);
    }

    #[test]
    fn unarmed_wrapper_fails_open_with_enosys() {
        let hooks = hook_pair::<Bare>();
        let read = unsafe { std::mem::transmute::<usize, ReadFn>(hooks.read) };
        assert_eq!(
            unsafe { read(0, std::ptr::null_mut(), 0) },
            -(libc::ENOSYS as c_long)
        );
        assert_eq!(BARE_STATE.stats().calls(), 0);
    }

    #[test]
    fn disarm_waits_for_in_flight_delays() {
        // Long enough that the spinning thread is still inside `delay`
        // when disarm starts.
        let bounds = WaitBounds::new(20_000_000, 20_000_001);
        SLOW_STATE
            .arm(Arc::new(DelayEngine::seeded(bounds, 3)), 1, 2)
            .unwrap();

        std::thread::scope(|s| {
            let caller = s.spawn(|| SLOW_STATE.delay(Operation::Write));
            while SLOW_STATE.in_flight() == 0 && !caller.is_finished() {
                std::thread::yield_now();
            }
            SLOW_STATE.disarm();
            assert_eq!(SLOW_STATE.in_flight(), 0);
            assert!(!SLOW_STATE.is_armed());

            let magnitude = caller.join().unwrap();
            assert!(magnitude == 0 || magnitude >= 20_000_000);
            assert_eq!(SLOW_STATE.stats().writes, u64::from(magnitude != 0));
        });

        // Disarmed delays are free and uncounted.
        assert_eq!(SLOW_STATE.delay(Operation::Read), 0);
        assert_eq!(SLOW_STATE.in_flight(), 0);
        assert_eq!(SLOW_STATE.stats().reads, 0);
    }

    #[test]
    fn local_state_releases_its_engine_on_drop() {
        let engine = Arc::new(DelayEngine::new(WaitBounds::new(1, 2)));
        let state = HookState::new();
        state.arm(Arc::clone(&engine), 1, 2).unwrap();
        assert_eq!(Arc::strong_count(&engine), 2);
        drop(state);
        assert_eq!(Arc::strong_count(&engine), 1);
    }

    #[test]
    fn contexts_have_distinct_wrappers() {
        assert_ne!(hook_pair::<Echo>().read, hook_pair::<Bare>().read);
        assert_ne!(hook_pair::<Echo>().read, hook_pair::<Echo>().write);
    }
}
