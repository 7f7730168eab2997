//! Bridges loaded plug-ins into the simulation core.
//!
//! A [`PluginApp`] is the [`Application`] the core drives for a plug-in
//! process. Every entry into plug-in code goes through the sandbox's
//! context guard, so the process's snapshot of the plug-in globals is
//! swapped in before the vtable call and captured back afterwards. The
//! [`HostBridge`] implements the plug-in ABI's host calls on top of the
//! explicit syscall context.

use std::collections::HashMap;
use std::ffi::{CString, c_char};
use std::net::Ipv4Addr;
use std::sync::Arc;

use plugin_sandbox::{
    CallbackFn, HostCalls, LogLevel, Plugin, PluginContext, PluginVTable, SendPtr, Snapshot,
};
use sim_core::{Application, EventPayload, Fd, ProcessId, SyscallCtx};
use sim_time::SimDuration;

pub struct PluginApp {
    plugin: Arc<Plugin>,
    snapshot: Snapshot,
    args: Vec<String>,
    /// One-shot callbacks scheduled by the plug-in, keyed by token.
    callbacks: HashMap<u64, (CallbackFn, SendPtr)>,
    next_token: u64,
}

impl PluginApp {
    pub fn new(plugin: Arc<Plugin>, args: Vec<String>) -> Self {
        let snapshot = plugin.default_state();

        Self {
            plugin,
            snapshot,
            args,
            callbacks: HashMap::new(),
            next_token: 0,
        }
    }

    /// Run `f` inside the plug-in's context, then act on anything the
    /// plug-in asked of the host while it ran.
    fn enter(&mut self, ctx: &mut SyscallCtx<'_, '_>, f: impl FnOnce(&PluginVTable)) {
        let mut bridge = HostBridge {
            ctx,
            pending_callbacks: Vec::new(),
        };

        {
            let mut context =
                PluginContext::enter(self.plugin.state(), &mut self.snapshot, &mut bridge);
            context.call(f);
        }

        let HostBridge {
            ctx,
            pending_callbacks,
        } = bridge;

        for (callback, arg, delay_ms) in pending_callbacks {
            let token = self.next_token;
            self.next_token += 1;
            self.callbacks.insert(token, (callback, arg));

            let pid = ctx
                .process
                .expect("plug-in code only runs on behalf of a process");

            ctx.worker.schedule_local(
                ctx.host,
                SimDuration::from_millis(delay_ms),
                EventPayload::Callback(Box::new(move |ctx| run_app_callback(ctx, pid, token))),
            );
        }
    }
}

/// Route a deferred callback back into the owning process's application.
fn run_app_callback(ctx: &mut SyscallCtx<'_, '_>, pid: ProcessId, token: u64) {
    let Some(mut app) = ctx.host.processes.get_mut(&pid).and_then(|p| p.app.take()) else {
        return; // Process already gone.
    };

    let previous = ctx.process.replace(pid);
    app.callback(ctx, token);
    ctx.process = previous;

    if let Some(process) = ctx.host.processes.get_mut(&pid) {
        process.app = Some(app);
    }
}

impl Application for PluginApp {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let argv_storage: Vec<CString> = std::iter::once("plugin".to_owned())
            .chain(self.args.iter().cloned())
            .map(|arg| CString::new(arg).unwrap_or_default())
            .collect();
        let argv: Vec<*const c_char> = argv_storage.iter().map(|a| a.as_ptr()).collect();

        self.enter(ctx, |vtable| {
            (vtable.new)(argv.len() as i32, argv.as_ptr());
        });
    }

    fn stop(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        self.enter(ctx, |vtable| {
            (vtable.free)();
        });
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        self.enter(ctx, |vtable| {
            (vtable.socket_readable)(fd.0);
        });
    }

    fn writable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        self.enter(ctx, |vtable| {
            (vtable.socket_writable)(fd.0);
        });
    }

    fn callback(&mut self, ctx: &mut SyscallCtx<'_, '_>, token: u64) {
        let Some((callback, arg)) = self.callbacks.remove(&token) else {
            return; // Fired once already; one-shots are inert afterwards.
        };

        self.enter(ctx, |_| callback(arg.0));
    }
}

/// The host side of the plug-in ABI, implemented over a live syscall
/// context.
struct HostBridge<'a, 'w, 'h> {
    ctx: &'a mut SyscallCtx<'w, 'h>,
    /// Callbacks requested during this entry; scheduled after the state
    /// swap completes.
    pending_callbacks: Vec<(CallbackFn, SendPtr, u64)>,
}

impl HostCalls for HostBridge<'_, '_, '_> {
    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!(target: "plugin", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "plugin", "{message}"),
            LogLevel::Message | LogLevel::Info => tracing::info!(target: "plugin", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "plugin", "{message}"),
        }
    }

    fn resolve_name(&mut self, name: &str) -> Option<Ipv4Addr> {
        self.ctx.worker.sim.resolver.resolve_by_name(name)
    }

    fn resolve_addr(&mut self, addr: Ipv4Addr) -> Option<String> {
        self.ctx.worker.sim.resolver.resolve_by_addr(addr)
    }

    fn my_ip(&mut self) -> Ipv4Addr {
        self.ctx.host.default_ip
    }

    fn my_hostname(&mut self) -> String {
        self.ctx.host.hostname.clone()
    }

    fn create_callback(&mut self, callback: CallbackFn, arg: SendPtr, delay_ms: u64) {
        self.pending_callbacks.push((callback, arg, delay_ms));
    }

    fn bandwidth_floor(&mut self, other: Ipv4Addr) -> u64 {
        let own = self.ctx.host.default_ip;

        self.ctx
            .worker
            .sim
            .resolver
            .bandwidth_floor(own, other)
            .unwrap_or(0)
    }
}
