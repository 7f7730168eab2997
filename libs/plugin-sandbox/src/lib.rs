//! The plug-in sandbox.
//!
//! A plug-in is a shared object running real application code inside the
//! simulation. Many hosts run the same library, but the library was
//! written as an ordinary program with ordinary globals — so each host
//! needs those globals swapped in before its code runs and swapped back
//! out afterwards. The build-time hoisting pass concentrates a plug-in's
//! mutable globals into one struct of known size; the sandbox records
//! that region (plus anything registered explicitly) and copies bytes in
//! and out around every entry into plug-in code.
//!
//! Entering plug-in context is always done through [`PluginContext`], an
//! RAII guard: state is restored on construction and captured back on
//! drop, so every exit path — including panics unwinding through Rust
//! frames — leaves the per-host snapshot consistent.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod abi;
mod context;
mod loader;
mod state;

pub use abi::{CallbackFn, HostCalls, LogLevel, PluginVTable, RegionDesc, SendPtr};
pub use context::{PluginContext, in_plugin_context};
pub use loader::Plugin;
pub use state::{PluginState, Snapshot};

/// Symbol every plug-in must export as its entry point.
pub const INIT_SYMBOL: &str = "umbra_plugin_init";

/// Symbols produced by the global-hoisting pass, consumed opaquely.
pub const HOISTED_GLOBALS_SYMBOL: &str = "__hoisted_globals";
pub const HOISTED_GLOBALS_SIZE_SYMBOL: &str = "__hoisted_globals_size";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load plug-in `{path}`: {detail}")]
    Load { path: String, detail: String },
    #[error("plug-in `{path}` does not export `{symbol}`")]
    MissingSymbol { path: String, symbol: String },
    #[error("plug-in never called register() during init")]
    NoRegistration,
    /// Source and destination state disagree on shape; a swap would
    /// corrupt memory. Always fatal.
    #[error(
        "plug-in state mismatch: {expected_regions} regions / {expected_bytes} bytes expected, \
         got {actual_regions} / {actual_bytes}"
    )]
    StateMismatch {
        expected_regions: usize,
        expected_bytes: usize,
        actual_regions: usize,
        actual_bytes: usize,
    },
}
