//! The platform `ImageLoader`: dynamic libraries opened with lazy
//! binding via `libloading`, one per component image path.

use nlink_context::Context;
use nlink_loader::{Address, ImageLoader, RawHandle};
use nlink_result::{NexusError, Result};
use nlink_stream::DataStream;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(unix)]
const RTLD_LAZY: std::os::raw::c_int = 1;

/// The fixed shape every `<component_id>_process` entry point must have.
/// `component` is reserved for a future opaque per-instance handle; this
/// loader always passes null.
type ProcessFn =
    unsafe extern "C" fn(*mut c_void, *mut DataStream, *mut DataStream) -> u16;

#[derive(Default)]
pub struct DylibImageLoader {
    next_handle: AtomicU64,
    libraries: Mutex<HashMap<RawHandle, libloading::Library>>,
}

impl DylibImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(unix)]
    fn open_lazy(path: &str) -> std::result::Result<libloading::Library, libloading::Error> {
        unsafe { libloading::os::unix::Library::open(Some(path), RTLD_LAZY).map(Into::into) }
    }

    #[cfg(not(unix))]
    fn open_lazy(path: &str) -> std::result::Result<libloading::Library, libloading::Error> {
        unsafe { libloading::Library::new(path) }
    }
}

impl ImageLoader for DylibImageLoader {
    fn open(&self, path: &str) -> Result<RawHandle> {
        let library = Self::open_lazy(path).map_err(|e| NexusError::ImageOpenFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.libraries.lock().unwrap().insert(handle, library);
        Ok(handle)
    }

    fn close(&self, handle: RawHandle) {
        self.libraries.lock().unwrap().remove(&handle);
    }

    fn resolve(&self, handle: RawHandle, symbol_name: &str) -> Option<Address> {
        let libraries = self.libraries.lock().unwrap();
        let library = libraries.get(&handle)?;
        unsafe {
            let symbol: libloading::Symbol<ProcessFn> =
                library.get(symbol_name.as_bytes()).ok()?;
            Some(Address(*symbol as usize))
        }
    }

    fn invoke_init(&self, handle: RawHandle, ctx: &Context) -> Result<Option<bool>> {
        let libraries = self.libraries.lock().unwrap();
        let Some(library) = libraries.get(&handle) else {
            return Ok(None);
        };
        let symbol: Option<libloading::Symbol<unsafe extern "C" fn(*const Context) -> bool>> =
            unsafe { library.get(b"nexus_component_init").ok() };
        match symbol {
            Some(init) => Ok(Some(unsafe { init(ctx as *const Context) })),
            None => Ok(None),
        }
    }

    fn invoke_cleanup(&self, handle: RawHandle, ctx: &Context) {
        let libraries = self.libraries.lock().unwrap();
        let Some(library) = libraries.get(&handle) else {
            return;
        };
        let symbol: Option<libloading::Symbol<unsafe extern "C" fn(*const Context)>> =
            unsafe { library.get(b"nexus_component_cleanup").ok() };
        if let Some(cleanup) = symbol {
            unsafe { cleanup(ctx as *const Context) };
        }
    }

    fn invoke_process(
        &self,
        _handle: RawHandle,
        address: Address,
        input: &mut DataStream,
        output: &mut DataStream,
    ) -> Result<u16> {
        let func: ProcessFn = unsafe { std::mem::transmute(address.0) };
        let code = unsafe { func(std::ptr::null_mut(), input as *mut DataStream, output as *mut DataStream) };
        Ok(code)
    }
}
