//! Component I — process-wide configuration, log sink, and registry anchor.
//!
//! A value created once at startup, holding both raw inputs and derived
//! state, plus a `discover()`-style search path resolver generalized from
//! "find one config file" to "the list of directories a pipeline
//! searches for component images".

use bitflags::bitflags;
use nlink_symbols::SymbolRegistry;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::Level;

bitflags! {
    /// Flags bitset: auto-load, auto-unload, strict-deps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u8 {
        const AUTO_LOAD    = 0b001;
        const AUTO_UNLOAD  = 0b010;
        const STRICT_DEPS  = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_tracing(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Injectable log destination. Callers that run multiple `Context`s
/// concurrently must supply a thread-safe sink.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, message: &str);
}

/// Default sink: forwards to whatever `tracing::Subscriber` is installed,
/// matching every other crate in this workspace.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, level: LogLevel, message: &str) {
        match level.as_tracing() {
            Level::TRACE => tracing::trace!("{message}"),
            Level::DEBUG => tracing::debug!("{message}"),
            Level::INFO => tracing::info!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            Level::ERROR => tracing::error!("{message}"),
        }
    }
}

struct ContextInner {
    flags: ContextFlags,
    log_level: LogLevel,
    search_path: Vec<String>,
    registry: SymbolRegistry,
}

/// Process-wide configuration anchor. Owns the symbol registry. Field
/// mutation is serialized by an internal mutex; registry mutation is
/// exposed through a closure so callers never hold the lock across
/// unrelated work.
pub struct Context {
    inner: Mutex<ContextInner>,
    log_sink: Arc<dyn LogSink>,
}

impl Context {
    pub fn new(flags: ContextFlags, log_level: LogLevel, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                flags,
                log_level,
                search_path: default_search_path(),
                registry: SymbolRegistry::new(),
            }),
            log_sink,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            ContextFlags::AUTO_LOAD | ContextFlags::AUTO_UNLOAD,
            LogLevel::Info,
            Arc::new(TracingLogSink),
        )
    }

    pub fn flags(&self) -> ContextFlags {
        self.inner.lock().unwrap().flags
    }

    pub fn set_flags(&self, flags: ContextFlags) {
        self.inner.lock().unwrap().flags = flags;
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.lock().unwrap().log_level
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().log_level = level;
    }

    pub fn search_path(&self) -> Vec<String> {
        self.inner.lock().unwrap().search_path.clone()
    }

    pub fn set_search_path(&self, paths: Vec<String>) {
        self.inner.lock().unwrap().search_path = paths;
    }

    pub fn push_search_path(&self, path: impl Into<String>) {
        self.inner.lock().unwrap().search_path.push(path.into());
    }

    /// Gives a caller temporary exclusive access to the owned registry.
    /// Kept narrow (closure, not a guard type) so the lock is never held
    /// across an image-load or process-function call.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut SymbolRegistry) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard.registry)
    }

    /// Structured logger: filters by the configured level, then forwards
    /// to the sink.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if level < self.log_level() {
            return;
        }
        self.log_sink.write(level, message.as_ref());
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock().unwrap();
        f.debug_struct("Context")
            .field("flags", &guard.flags)
            .field("log_level", &guard.log_level)
            .field("search_path", &guard.search_path)
            .finish()
    }
}

fn default_search_path() -> Vec<String> {
    vec!["components".to_string()]
}

static GLOBAL_CONTEXT: OnceLock<Mutex<Option<Arc<Context>>>> = OnceLock::new();

/// Installs `ctx` as the process-global `Context`. Does not destroy
/// whatever was previously installed.
pub fn set_global(ctx: Arc<Context>) {
    let slot = GLOBAL_CONTEXT.get_or_init(|| Mutex::new(None));
    *slot.lock().unwrap() = Some(ctx);
}

pub fn global() -> Option<Arc<Context>> {
    GLOBAL_CONTEXT
        .get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap()
        .clone()
}
