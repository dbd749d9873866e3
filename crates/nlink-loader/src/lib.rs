//! Component C — the image loader with handle interning.
//!
//! `ImageLoader` is a small surface a platform-specific implementation
//! satisfies: open with lazy binding, close, resolve by name, invoke the
//! optional init/cleanup hooks, and call the resolved process entry
//! point. An in-memory fake stands in for it in tests so the interning
//! and refcount logic can be exercised without real dynamic-linking.

use nlink_context::Context;
use nlink_result::{NexusError, Result};
use nlink_stream::DataStream;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::{info, warn};

/// Opaque handle to an image, assigned by the platform collaborator.
pub type RawHandle = u64;

/// Opaque symbol address, same representation as `nlink_symbols::Address`
/// but kept crate-local so this crate doesn't have to depend on
/// `nlink-symbols` just for a newtype around `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub usize);

/// Image loader contract: open with lazy binding, close, resolve by name.
/// Also exposes the two well-known ABI hooks as typed callables so
/// invoking them doesn't require transmuting a raw address in library
/// code.
pub trait ImageLoader: Send + Sync {
    fn open(&self, path: &str) -> Result<RawHandle>;
    fn close(&self, handle: RawHandle);
    fn resolve(&self, handle: RawHandle, symbol_name: &str) -> Option<Address>;

    /// Invokes `nexus_component_init` if present. `Ok(None)` means the
    /// symbol wasn't found (nothing to invoke); `Ok(Some(accepted))` is the
    /// hook's own boolean contract; `Err` is a loader-level failure.
    fn invoke_init(&self, _handle: RawHandle, _ctx: &Context) -> Result<Option<bool>> {
        Ok(None)
    }

    /// Invokes `nexus_component_cleanup` if present.
    fn invoke_cleanup(&self, _handle: RawHandle, _ctx: &Context) {}

    /// Invokes an abort hook distinct from the ordinary cleanup path, if
    /// the image provides one. Returns whether it ran; callers fall back
    /// to the ordinary cleanup hook when it didn't.
    fn invoke_abort(&self, _handle: RawHandle, _ctx: &Context) -> bool {
        false
    }

    /// Calls the `<component_id>_process(component, input_stream,
    /// output_stream) -> result_code` entry point at `address` within
    /// `handle`'s image. The unsafe cast from resolved address to the
    /// fixed-shape process function pointer is this trait's job, not its
    /// caller's — a real implementation encapsulates it the same way it
    /// encapsulates `dlopen`/`LoadLibrary` mechanics.
    fn invoke_process(
        &self,
        handle: RawHandle,
        address: Address,
        input: &mut DataStream,
        output: &mut DataStream,
    ) -> Result<u16>;
}

struct HandleEntry {
    handle: RawHandle,
    refcount: u64,
    owning_component_id: String,
}

/// Process-wide intern table for loaded image handles, keyed by path.
/// Serialized by a single mutex; load and unload are the only critical
/// sections, resolution stays lock-free by going straight to the
/// `ImageLoader` rather than through this table.
pub struct HandleRegistry {
    entries: Mutex<HashMap<String, HandleEntry>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of outstanding loads for `path` (0 if never loaded or fully
    /// unloaded).
    pub fn live_refcount(&self, path: &str) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

static GLOBAL_HANDLES: OnceLock<HandleRegistry> = OnceLock::new();

/// The process-wide instance every `ComponentLoader::new` shares, so a
/// component image loaded by one `Pipeline` stays loaded (refcount > 0)
/// when a later `Pipeline::create` for the same manifest looks it up,
/// instead of each `Pipeline` tracking its own empty table.
pub fn global_handle_registry() -> &'static HandleRegistry {
    GLOBAL_HANDLES.get_or_init(HandleRegistry::new)
}

#[derive(Debug, Clone)]
pub struct ComponentRecord {
    pub path: String,
    pub id: String,
    pub handle: RawHandle,
    pub refcount: u64,
}

/// The component loader proper: references the process-wide
/// `HandleRegistry` and owns the per-`(path, id)` component table. At
/// most one live component per `(path, id)`; a duplicate `load(path, id)`
/// increments its refcount instead of reopening the image.
pub struct ComponentLoader<L: ImageLoader> {
    handles: &'static HandleRegistry,
    image_loader: L,
    components: HashMap<(String, String), ComponentRecord>,
}

impl<L: ImageLoader> ComponentLoader<L> {
    /// Wires in the process-wide `HandleRegistry`.
    pub fn new(image_loader: L) -> Self {
        Self::with_registry(image_loader, global_handle_registry())
    }

    /// Wires in an explicit registry instead of the process-wide one —
    /// the seam tests use so that two tests loading the same component
    /// path don't see each other's handles.
    pub fn with_registry(image_loader: L, handles: &'static HandleRegistry) -> Self {
        Self {
            handles,
            image_loader,
            components: HashMap::new(),
        }
    }

    pub fn handle_registry(&self) -> &HandleRegistry {
        self.handles
    }

    /// Opens a fresh handle only the
    /// first time `path` is seen; every successful call increments the
    /// shared handle refcount regardless of `id`. A duplicate `(path, id)`
    /// pair increments that component's own refcount and skips re-running
    /// the init hook (it already ran when the handle was first opened).
    pub fn load(&mut self, ctx: &Context, path: &str, id: &str) -> Result<ComponentRecord> {
        let key = (path.to_string(), id.to_string());

        let mut entries = self.handles.entries.lock().unwrap();
        let handle = if let Some(entry) = entries.get_mut(path) {
            entry.refcount += 1;
            entry.handle
        } else {
            let handle = self.image_loader.open(path).map_err(|e| {
                warn!(path, error = %e, "failed to open component image");
                e
            })?;
            entries.insert(
                path.to_string(),
                HandleEntry {
                    handle,
                    refcount: 1,
                    owning_component_id: id.to_string(),
                },
            );
            drop(entries);
            if let Err(e) = self.image_loader.invoke_init(handle, ctx) {
                // Roll back: this load never succeeded.
                let mut entries = self.handles.entries.lock().unwrap();
                entries.remove(path);
                return Err(NexusError::ComponentInitFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
            info!(path, id, "component image loaded");
            handle
        };

        if let Some(existing) = self.components.get_mut(&key) {
            existing.refcount += 1;
            return Ok(existing.clone());
        }
        let record = ComponentRecord {
            path: path.to_string(),
            id: id.to_string(),
            handle,
            refcount: 1,
        };
        self.components.insert(key, record.clone());
        Ok(record)
    }

    /// Decrements the component's own refcount; at zero, invokes
    /// `nexus_component_cleanup` and drops the record. The
    /// underlying handle is never closed here — only `HandleRegistry`
    /// destruction closes handles.
    pub fn unload(&mut self, ctx: &Context, path: &str, id: &str) -> Result<()> {
        let key = (path.to_string(), id.to_string());
        let handle = {
            let record = self
                .components
                .get_mut(&key)
                .ok_or_else(|| NexusError::NotFound {
                    name: format!("{path}:{id}"),
                })?;
            record.refcount = record.refcount.saturating_sub(1);
            if record.refcount > 0 {
                return Ok(());
            }
            record.handle
        };
        self.image_loader.invoke_cleanup(handle, ctx);
        self.components.remove(&key);

        let mut entries = self.handles.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(path) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        info!(path, id, "component unloaded (handle retained)");
        Ok(())
    }

    /// Same refcount semantics as [`Self::unload`], but at the
    /// zero-refcount boundary prefers the image's abort hook over its
    /// ordinary cleanup hook when one is present.
    pub fn unload_via_abort(&mut self, ctx: &Context, path: &str, id: &str) -> Result<()> {
        let key = (path.to_string(), id.to_string());
        let handle = {
            let record = self
                .components
                .get_mut(&key)
                .ok_or_else(|| NexusError::NotFound {
                    name: format!("{path}:{id}"),
                })?;
            record.refcount = record.refcount.saturating_sub(1);
            if record.refcount > 0 {
                return Ok(());
            }
            record.handle
        };
        if !self.image_loader.invoke_abort(handle, ctx) {
            self.image_loader.invoke_cleanup(handle, ctx);
        }
        self.components.remove(&key);

        let mut entries = self.handles.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(path) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        info!(path, id, "component aborted (handle retained)");
        Ok(())
    }

    /// Resolves a symbol from an already-loaded component by name. Does
    /// not populate any symbol table; callers that want to publish call
    /// `nlink_symbols::SymbolTable::add` themselves.
    pub fn resolve_symbol(&self, path: &str, symbol_name: &str) -> Option<Address> {
        let entries = self.handles.entries.lock().unwrap();
        let handle = entries.get(path)?.handle;
        drop(entries);
        self.image_loader.resolve(handle, symbol_name)
    }

    /// Calls the process entry point at `address` within the image
    /// backing `path`'s handle. A thin indirection over
    /// `ImageLoader::invoke_process` so callers never need to look up or
    /// hold a raw handle themselves.
    pub fn invoke_process(
        &self,
        path: &str,
        address: Address,
        input: &mut DataStream,
        output: &mut DataStream,
    ) -> Result<u16> {
        let handle = {
            let entries = self.handles.entries.lock().unwrap();
            entries
                .get(path)
                .ok_or_else(|| NexusError::NotFound {
                    name: path.to_string(),
                })?
                .handle
        };
        self.image_loader.invoke_process(handle, address, input, output)
    }

    pub fn owning_component_id(&self, path: &str) -> Option<String> {
        self.handles
            .entries
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.owning_component_id.clone())
    }

    /// Closes every handle — called only when the registry itself is torn
    /// down.
    pub fn shutdown(&mut self) {
        let mut entries = self.handles.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            self.image_loader.close(entry.handle);
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory `ImageLoader` fake: enough behavior to exercise the
    //! contract without real dynamic-linking mechanics.
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct FakeImage {
        pub symbols: StdHashMap<String, Address>,
        pub init_result: Option<Result<bool>>,
        pub fail_open: bool,
        pub process: Option<Box<dyn Fn(&mut DataStream, &mut DataStream) -> Result<u16> + Send + Sync>>,
    }

    impl Default for FakeImage {
        fn default() -> Self {
            Self {
                symbols: StdHashMap::new(),
                init_result: None,
                fail_open: false,
                process: None,
            }
        }
    }

    #[derive(Default)]
    pub struct FakeImageLoader {
        next_handle: AtomicU64,
        images: Mutex<StdHashMap<String, FakeImage>>,
        handle_to_path: Mutex<StdHashMap<RawHandle, String>>,
        pub closed: Mutex<Vec<RawHandle>>,
        pub cleanup_calls: Mutex<Vec<RawHandle>>,
    }

    impl FakeImageLoader {
        pub fn with_image(self, path: &str, image: FakeImage) -> Self {
            self.images.lock().unwrap().insert(path.to_string(), image);
            self
        }
    }

    impl ImageLoader for FakeImageLoader {
        fn open(&self, path: &str) -> Result<RawHandle> {
            let images = self.images.lock().unwrap();
            let image = images.get(path);
            if image.map(|i| i.fail_open).unwrap_or(false) {
                return Err(NexusError::ImageOpenFailed {
                    path: path.to_string(),
                    reason: "fake open failure".to_string(),
                });
            }
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
            self.handle_to_path
                .lock()
                .unwrap()
                .insert(handle, path.to_string());
            Ok(handle)
        }

        fn close(&self, handle: RawHandle) {
            self.closed.lock().unwrap().push(handle);
        }

        fn resolve(&self, handle: RawHandle, symbol_name: &str) -> Option<Address> {
            let path = self.handle_to_path.lock().unwrap().get(&handle)?.clone();
            self.images
                .lock()
                .unwrap()
                .get(&path)?
                .symbols
                .get(symbol_name)
                .copied()
        }

        fn invoke_init(&self, handle: RawHandle, _ctx: &Context) -> Result<Option<bool>> {
            let path = match self.handle_to_path.lock().unwrap().get(&handle).cloned() {
                Some(path) => path,
                None => return Ok(None),
            };
            let images = self.images.lock().unwrap();
            let init_result = match images.get(&path) {
                Some(image) => image.init_result.as_ref(),
                None => return Ok(None),
            };
            match init_result {
                Some(Ok(b)) => Ok(Some(*b)),
                Some(Err(_)) => Err(NexusError::ComponentInitFailed {
                    id: path.clone(),
                    reason: "fake init failure".to_string(),
                }),
                None => Ok(None),
            }
        }

        fn invoke_cleanup(&self, handle: RawHandle, _ctx: &Context) {
            self.cleanup_calls.lock().unwrap().push(handle);
        }

        fn invoke_process(
            &self,
            handle: RawHandle,
            _address: Address,
            input: &mut DataStream,
            output: &mut DataStream,
        ) -> Result<u16> {
            let path = match self.handle_to_path.lock().unwrap().get(&handle).cloned() {
                Some(path) => path,
                None => return Err(NexusError::SymbolNotFound("unknown handle".to_string())),
            };
            let images = self.images.lock().unwrap();
            let image = images
                .get(&path)
                .ok_or_else(|| NexusError::SymbolNotFound(path.clone()))?;
            match &image.process {
                Some(f) => f(input, output),
                None => Err(NexusError::SymbolNotFound(path.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use nlink_context::Context;

    /// Leaks a fresh registry so each test gets its own handle namespace
    /// instead of sharing `global_handle_registry()` with every other test
    /// in this binary — tests reuse paths like "a.so" across functions,
    /// which would otherwise hand one test's loader a handle opened by
    /// another test's `FakeImageLoader` instance.
    fn fresh_registry() -> &'static HandleRegistry {
        Box::leak(Box::new(HandleRegistry::new()))
    }

    #[test]
    fn duplicate_load_same_id_increments_component_refcount_not_reopen() {
        let loader = FakeImageLoader::default().with_image("a.so", FakeImage::default());
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        let c1 = cl.load(&ctx, "a.so", "comp").unwrap();
        let c2 = cl.load(&ctx, "a.so", "comp").unwrap();
        assert_eq!(c1.handle, c2.handle);
        assert_eq!(c2.refcount, 2);
        assert_eq!(cl.handle_registry().live_refcount("a.so"), 2);
    }

    #[test]
    fn different_ids_share_handle_but_get_distinct_components() {
        let loader = FakeImageLoader::default().with_image("a.so", FakeImage::default());
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        let c1 = cl.load(&ctx, "a.so", "comp1").unwrap();
        let c2 = cl.load(&ctx, "a.so", "comp2").unwrap();
        assert_eq!(c1.handle, c2.handle);
        assert_eq!(c1.refcount, 1);
        assert_eq!(c2.refcount, 1);
        assert_eq!(cl.handle_registry().live_refcount("a.so"), 2);
    }

    #[test]
    fn unload_at_zero_invokes_cleanup_and_retains_handle() {
        let loader = FakeImageLoader::default().with_image("a.so", FakeImage::default());
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        cl.load(&ctx, "a.so", "comp").unwrap();
        cl.unload(&ctx, "a.so", "comp").unwrap();
        assert_eq!(cl.image_loader.cleanup_calls.lock().unwrap().len(), 1);
        assert!(cl.image_loader.closed.lock().unwrap().is_empty());
        assert_eq!(cl.handle_registry().live_refcount("a.so"), 0);
    }

    #[test]
    fn shutdown_closes_every_handle() {
        let loader = FakeImageLoader::default().with_image("a.so", FakeImage::default());
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        cl.load(&ctx, "a.so", "comp").unwrap();
        cl.shutdown();
        assert_eq!(cl.image_loader.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn init_failure_propagates_and_releases_handle() {
        let loader = FakeImageLoader::default().with_image(
            "bad.so",
            FakeImage {
                init_result: Some(Err(NexusError::ComponentInitFailed {
                    id: "bad".into(),
                    reason: "boom".into(),
                })),
                ..FakeImage::default()
            },
        );
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        let result = cl.load(&ctx, "bad.so", "comp");
        assert!(matches!(result, Err(NexusError::ComponentInitFailed { .. })));
        assert_eq!(cl.handle_registry().live_refcount("bad.so"), 0);
    }

    #[test]
    fn unload_via_abort_falls_back_to_cleanup_when_no_abort_hook() {
        let loader = FakeImageLoader::default().with_image("a.so", FakeImage::default());
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        cl.load(&ctx, "a.so", "comp").unwrap();
        cl.unload_via_abort(&ctx, "a.so", "comp").unwrap();
        assert_eq!(cl.image_loader.cleanup_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn invoke_process_runs_the_registered_closure() {
        let loader = FakeImageLoader::default().with_image(
            "a.so",
            FakeImage {
                process: Some(Box::new(|input, output| {
                    let mut buf = vec![0u8; input.size()];
                    input.read(&mut buf);
                    output.write(&buf)?;
                    output.write(&[0xFF])?;
                    Ok(0)
                })),
                ..FakeImage::default()
            },
        );
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        let record = cl.load(&ctx, "a.so", "comp").unwrap();
        let mut input = DataStream::new("binary");
        input.write(&[1, 2, 3]).unwrap();
        input.reset();
        let mut output = DataStream::new("binary");
        let code = cl
            .image_loader
            .invoke_process(record.handle, Address(0), &mut input, &mut output)
            .unwrap();
        assert_eq!(code, 0);
        output.reset();
        let mut out_bytes = [0u8; 4];
        output.read(&mut out_bytes);
        assert_eq!(out_bytes, [1, 2, 3, 0xFF]);
    }

    #[test]
    fn resolve_symbol_does_not_require_load_of_the_same_id() {
        let loader = FakeImageLoader::default().with_image(
            "a.so",
            FakeImage {
                symbols: [("nexus_foo".to_string(), Address(42))].into_iter().collect(),
                ..FakeImage::default()
            },
        );
        let mut cl = ComponentLoader::with_registry(loader, fresh_registry());
        let ctx = Context::with_defaults();
        cl.load(&ctx, "a.so", "comp").unwrap();
        assert_eq!(cl.resolve_symbol("a.so", "nexus_foo"), Some(Address(42)));
        assert_eq!(cl.resolve_symbol("a.so", "missing"), None);
    }
}
