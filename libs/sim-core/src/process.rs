//! Processes: running application instances on a host.

use std::fmt;

use crate::{Fd, syscall::SyscallCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// What a process runs. Plug-in instances implement this by trampolining
/// into their loaded library; tests implement it directly in Rust.
///
/// Callbacks receive a [`SyscallCtx`] and drive the host exclusively
/// through the virtual syscall surface.
pub trait Application: Send {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>);

    fn stop(&mut self, _ctx: &mut SyscallCtx<'_, '_>) {}

    /// A descriptor owned by this process became readable.
    fn readable(&mut self, _ctx: &mut SyscallCtx<'_, '_>, _fd: Fd) {}

    /// A descriptor owned by this process became writable.
    fn writable(&mut self, _ctx: &mut SyscallCtx<'_, '_>, _fd: Fd) {}

    /// A deferred callback the process scheduled for itself fired.
    /// `token` is whatever the process passed when scheduling.
    fn callback(&mut self, _ctx: &mut SyscallCtx<'_, '_>, _token: u64) {}
}

pub struct Process {
    pub id: ProcessId,
    pub name: String,
    pub args: Vec<String>,
    /// Temporarily taken out while a callback runs, so the callback can
    /// borrow the rest of the host mutably.
    pub app: Option<Box<dyn Application>>,
    pub started: bool,
    pub stopped: bool,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Process {
    pub fn new(id: ProcessId, name: impl Into<String>, args: Vec<String>, app: Box<dyn Application>) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            app: Some(app),
            started: false,
            stopped: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }
}
