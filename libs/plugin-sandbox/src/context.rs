//! Thread-local plumbing for the plug-in boundary.
//!
//! The core passes context explicitly everywhere; the only place an
//! ambient pointer exists is here, at the C ABI edge, because a plug-in's
//! `register()`/`log()` calls arrive through bare function pointers with
//! no room for a context argument. The pointer is installed and removed
//! by RAII guards, never left dangling across events.

use std::cell::{Cell, RefCell};

use crate::abi::{HostCalls, PluginVTable, RegionDesc};
use crate::state::{PluginState, Snapshot};

thread_local! {
    /// Set while execution is inside plug-in code, so interceptors know
    /// whether to switch back into simulator context.
    static IN_PLUGIN: Cell<bool> = const { Cell::new(false) };

    /// The live host-call sink for ABI trampolines.
    static HOST_CALLS: Cell<Option<*mut dyn HostCalls>> = const { Cell::new(None) };

    /// Captures the plug-in's `register()` call during init.
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub vtable: PluginVTable,
    pub regions: Vec<RegionDesc>,
}

/// Whether the current thread is executing plug-in code.
pub fn in_plugin_context() -> bool {
    IN_PLUGIN.with(Cell::get)
}

pub(crate) fn record_registration(vtable: PluginVTable, regions: &[RegionDesc]) {
    REGISTRATION.with(|slot| {
        *slot.borrow_mut() = Some(Registration {
            vtable,
            regions: regions.to_vec(),
        });
    });
}

pub(crate) fn take_registration() -> Option<Registration> {
    REGISTRATION.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn with_host_calls<R>(f: impl FnOnce(&mut dyn HostCalls) -> R) -> Option<R> {
    let ptr = HOST_CALLS.with(Cell::get)?;

    // The guard that installed the pointer outlives this call; trampolines
    // only run while plug-in code invoked under that guard is on the stack.
    let calls = unsafe { &mut *ptr };

    Some(f(calls))
}

/// RAII guard around every entry into plug-in code.
///
/// On construction: the host's saved bytes are copied into the plug-in's
/// live memory, the host-call sink is installed, and the in-plugin flag
/// raised. On drop — any exit path — the live bytes are captured back
/// into the snapshot and both thread-locals are cleared.
pub struct PluginContext<'a> {
    state: &'a PluginState,
    snapshot: &'a mut Snapshot,
    previous_calls: Option<*mut dyn HostCalls>,
}

impl<'a> PluginContext<'a> {
    pub fn enter(
        state: &'a PluginState,
        snapshot: &'a mut Snapshot,
        calls: &'a mut dyn HostCalls,
    ) -> Self {
        state.restore(snapshot);

        let ptr: *mut (dyn HostCalls + 'a) = calls;
        // SAFETY: the thread-local only ever holds this pointer while `self`
        // (and therefore the borrow it was derived from) is alive on the
        // stack; the `Drop` impl clears it before `'a` ends.
        let ptr: *mut dyn HostCalls = unsafe { std::mem::transmute(ptr) };
        let previous_calls = HOST_CALLS.with(|slot| slot.replace(Some(ptr)));
        IN_PLUGIN.with(|flag| flag.set(true));

        Self {
            state,
            snapshot,
            previous_calls,
        }
    }

    /// Run a closure "inside" the plug-in; the vtable call happens here.
    pub fn call<R>(&mut self, f: impl FnOnce(&PluginVTable) -> R) -> R {
        f(self.state.vtable())
    }
}

impl Drop for PluginContext<'_> {
    fn drop(&mut self) {
        self.state.save(self.snapshot);

        HOST_CALLS.with(|slot| slot.set(self.previous_calls));
        IN_PLUGIN.with(|flag| flag.set(false));
    }
}
