//! The C ABI between the simulator and plug-in shared objects.
//!
//! The plug-in exports one init symbol. The simulator calls it once with
//! a [`HostApi`] table; during that call the plug-in registers its own
//! callback vtable and its writable global regions via
//! `register_plugin`. At runtime the host-side entries of the table
//! trampoline through a thread-local [`HostCalls`] installed by the
//! active [`PluginContext`](crate::PluginContext).

use std::ffi::{CStr, c_char, c_void};
use std::net::Ipv4Addr;

use crate::context;

/// One registered writable region of plug-in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegionDesc {
    pub ptr: *mut u8,
    pub size: usize,
}

/// The callbacks a plug-in registers for the simulator to drive it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginVTable {
    pub new: extern "C" fn(argc: i32, argv: *const *const c_char),
    pub free: extern "C" fn(),
    pub socket_readable: extern "C" fn(fd: i32),
    pub socket_writable: extern "C" fn(fd: i32),
}

/// A deferred plug-in callback scheduled via `create_callback`.
pub type CallbackFn = extern "C" fn(arg: *mut c_void);

/// A raw plug-in pointer that must cross the event queue. The plug-in's
/// memory is only ever touched under its host's lock and with its state
/// swapped in, which is what makes carrying the pointer sound.
#[derive(Debug, Clone, Copy)]
pub struct SendPtr(pub *mut c_void);

unsafe impl Send for SendPtr {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Message,
    Info,
    Debug,
}

impl LogLevel {
    fn from_raw(raw: i32) -> Self {
        match raw {
            0 => LogLevel::Error,
            1 => LogLevel::Warning,
            2 => LogLevel::Message,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// What the simulator offers a plug-in, minus the syscall surface (which
/// arrives via libc interposition, outside this crate).
pub trait HostCalls {
    fn log(&mut self, level: LogLevel, message: &str);
    fn resolve_name(&mut self, name: &str) -> Option<Ipv4Addr>;
    fn resolve_addr(&mut self, addr: Ipv4Addr) -> Option<String>;
    fn my_ip(&mut self) -> Ipv4Addr;
    fn my_hostname(&mut self) -> String;
    /// Schedule `callback(arg)` to run in plug-in context after
    /// `delay_ms` of simulated time.
    fn create_callback(&mut self, callback: CallbackFn, arg: SendPtr, delay_ms: u64);
    /// Minimum of both directions of both access links to `other`.
    fn bandwidth_floor(&mut self, other: Ipv4Addr) -> u64;
}

/// The function table handed to the plug-in's init symbol.
#[repr(C)]
pub struct HostApi {
    pub register_plugin:
        extern "C" fn(vtable: *const PluginVTable, n_regions: u32, regions: *const RegionDesc),
    pub log: extern "C" fn(level: i32, message: *const c_char),
    /// Returns the address in network byte order, 0 on failure.
    pub resolve_name: extern "C" fn(name: *const c_char) -> u32,
    /// Writes the NUL-terminated hostname into `buf`; returns -1 on
    /// failure or truncation.
    pub resolve_addr: extern "C" fn(addr: u32, buf: *mut c_char, len: usize) -> i32,
    pub my_ip: extern "C" fn() -> u32,
    pub my_hostname: extern "C" fn(buf: *mut c_char, len: usize) -> i32,
    pub create_callback:
        extern "C" fn(callback: CallbackFn, arg: *mut c_void, delay_ms: u64),
    pub bandwidth_floor: extern "C" fn(addr: u32) -> u64,
}

pub static HOST_API: HostApi = HostApi {
    register_plugin: trampoline_register,
    log: trampoline_log,
    resolve_name: trampoline_resolve_name,
    resolve_addr: trampoline_resolve_addr,
    my_ip: trampoline_my_ip,
    my_hostname: trampoline_my_hostname,
    create_callback: trampoline_create_callback,
    bandwidth_floor: trampoline_bandwidth_floor,
};

pub type InitFn = extern "C" fn(api: *const HostApi);

extern "C" fn trampoline_register(
    vtable: *const PluginVTable,
    n_regions: u32,
    regions: *const RegionDesc,
) {
    if vtable.is_null() {
        tracing::error!("register() called with a null vtable");
        return;
    }

    let regions = if regions.is_null() || n_regions == 0 {
        &[]
    } else {
        // The plug-in owns the array for the duration of the call.
        unsafe { std::slice::from_raw_parts(regions, n_regions as usize) }
    };

    context::record_registration(unsafe { *vtable }, regions);
}

extern "C" fn trampoline_log(level: i32, message: *const c_char) {
    if message.is_null() {
        return;
    }

    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();

    context::with_host_calls(|calls| {
        calls.log(LogLevel::from_raw(level), &message);
    });
}

extern "C" fn trampoline_resolve_name(name: *const c_char) -> u32 {
    if name.is_null() {
        return 0;
    }

    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();

    context::with_host_calls(|calls| calls.resolve_name(&name))
        .flatten()
        .map(|ip| u32::from(ip).to_be())
        .unwrap_or(0)
}

extern "C" fn trampoline_resolve_addr(addr: u32, buf: *mut c_char, len: usize) -> i32 {
    let ip = Ipv4Addr::from(u32::from_be(addr));

    let Some(Some(name)) = context::with_host_calls(|calls| calls.resolve_addr(ip)) else {
        return -1;
    };

    write_c_string(&name, buf, len)
}

extern "C" fn trampoline_my_ip() -> u32 {
    context::with_host_calls(|calls| u32::from(calls.my_ip()).to_be()).unwrap_or(0)
}

extern "C" fn trampoline_my_hostname(buf: *mut c_char, len: usize) -> i32 {
    let Some(name) = context::with_host_calls(|calls| calls.my_hostname()) else {
        return -1;
    };

    write_c_string(&name, buf, len)
}

extern "C" fn trampoline_create_callback(callback: CallbackFn, arg: *mut c_void, delay_ms: u64) {
    context::with_host_calls(|calls| {
        calls.create_callback(callback, SendPtr(arg), delay_ms);
    });
}

extern "C" fn trampoline_bandwidth_floor(addr: u32) -> u64 {
    let ip = Ipv4Addr::from(u32::from_be(addr));

    context::with_host_calls(|calls| calls.bandwidth_floor(ip)).unwrap_or(0)
}

fn write_c_string(s: &str, buf: *mut c_char, len: usize) -> i32 {
    if buf.is_null() || len == 0 || s.len() + 1 > len {
        return -1;
    }

    unsafe {
        std::ptr::copy_nonoverlapping(s.as_ptr(), buf.cast::<u8>(), s.len());
        *buf.add(s.len()) = 0;
    }

    0
}
