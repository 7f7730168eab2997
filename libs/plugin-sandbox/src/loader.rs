//! Loading plug-in shared objects.
//!
//! Each host dlopen()s its own on-disk copy of the library. Without the
//! copy, the dynamic linker would hand every host the same mapping and
//! OS-level symbol resolution would share state between hosts behind the
//! sandbox's back; distinct files defeat the linker's caching.

use std::ffi::{CString, c_void};
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::abi::{HOST_API, InitFn, RegionDesc};
use crate::state::{PluginState, Snapshot};
use crate::{
    Error, HOISTED_GLOBALS_SIZE_SYMBOL, HOISTED_GLOBALS_SYMBOL, INIT_SYMBOL, context,
};

/// One loaded plug-in instance: the private library copy, the callbacks
/// and state regions it registered, and its pristine post-init snapshot.
#[derive(Debug)]
pub struct Plugin {
    /// dlopen handle; kept for the lifetime of the plug-in.
    handle: *mut c_void,
    path: PathBuf,
    state: PluginState,
    default_state: Snapshot,
}

// The handle is only used for dlclose at drop; region pointers are
// guarded by `PluginState`'s own contract.
unsafe impl Send for Plugin {}
unsafe impl Sync for Plugin {}

impl Plugin {
    /// Copy `library` into `private_dir` and load the copy.
    ///
    /// Calls the init symbol, which must call `register()` before
    /// returning. The bytes of every registered region right after init
    /// become the default state each host starts from.
    pub fn load(library: &Path, private_dir: &Path) -> anyhow::Result<Plugin> {
        std::fs::create_dir_all(private_dir)
            .with_context(|| format!("Failed to create {}", private_dir.display()))?;

        let file_name = library
            .file_name()
            .with_context(|| format!("Not a library path: {}", library.display()))?;
        let private_copy = private_dir.join(file_name);

        std::fs::copy(library, &private_copy).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                library.display(),
                private_copy.display()
            )
        })?;

        Self::load_in_place(&private_copy)
    }

    /// Load a library path directly (the caller already made it private).
    pub fn load_in_place(path: &Path) -> anyhow::Result<Plugin> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .context("Library path contains a NUL byte")?;

        // RTLD_LOCAL keeps each copy's symbols out of the global namespace.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::Load {
                path: path.display().to_string(),
                detail: dlerror_string(),
            }
            .into());
        }

        let init = match find_symbol(handle, path, INIT_SYMBOL) {
            Ok(init) => init,
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                return Err(e.into());
            }
        };
        let init: InitFn = unsafe { std::mem::transmute::<*mut c_void, InitFn>(init) };

        // Init runs synchronously and its register() call lands in the
        // thread-local the trampoline writes.
        init(&HOST_API);

        let registration = context::take_registration().ok_or(Error::NoRegistration)?;
        let mut regions = registration.regions;

        // The hoisting pass concentrates the remaining globals into one
        // struct; pick it up automatically when present.
        if let Some(hoisted) = hoisted_globals_region(handle, path) {
            regions.push(hoisted);
        }

        let state = PluginState::new(registration.vtable, regions);
        let default_state = state.snapshot();

        tracing::info!(
            path = %path.display(),
            regions = state.region_count(),
            bytes = state.total_bytes(),
            "Loaded plug-in"
        );

        Ok(Plugin {
            handle,
            path: path.to_path_buf(),
            state,
            default_state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PluginState {
        &self.state
    }

    /// The pristine snapshot a new host starts from.
    pub fn default_state(&self) -> Snapshot {
        self.default_state.clone()
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

fn find_symbol(handle: *mut c_void, path: &Path, symbol: &str) -> Result<*mut c_void, Error> {
    let c_symbol = CString::new(symbol).expect("symbol names contain no NUL");

    let address = unsafe { libc::dlsym(handle, c_symbol.as_ptr()) };
    if address.is_null() {
        return Err(Error::MissingSymbol {
            path: path.display().to_string(),
            symbol: symbol.to_owned(),
        });
    }

    Ok(address)
}

fn hoisted_globals_region(handle: *mut c_void, path: &Path) -> Option<RegionDesc> {
    let globals = find_symbol(handle, path, HOISTED_GLOBALS_SYMBOL).ok()?;
    let size_sym = find_symbol(handle, path, HOISTED_GLOBALS_SIZE_SYMBOL).ok()?;

    let size = unsafe { *size_sym.cast::<usize>() };
    if size == 0 {
        return None;
    }

    tracing::debug!(path = %path.display(), size, "Found hoisted globals");

    Some(RegionDesc {
        ptr: globals.cast::<u8>(),
        size,
    })
}

fn dlerror_string() -> String {
    let err = unsafe { libc::dlerror() };

    if err.is_null() {
        "unknown dlopen failure".to_owned()
    } else {
        unsafe { std::ffi::CStr::from_ptr(err) }
            .to_string_lossy()
            .into_owned()
    }
}
