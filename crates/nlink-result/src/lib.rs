//! Shared result-code contract and error taxonomy for NexusLink.
//!
//! Every core crate returns `nlink_result::Result<T>` instead of inventing
//! its own error type, one convention shared workspace-wide. The numeric
//! codes are an observable contract: callers embedding NexusLink in a host
//! that only understands integers can match on `NexusError::code()`
//! instead of downcasting.

use thiserror::Error;

/// Success / partial-success sentinels, distinct from the error space.
pub const CODE_SUCCESS: u16 = 0;
pub const CODE_PARTIAL_SUCCESS: u16 = 1;

/// Stable numeric error codes. 100..999 general, 1000..1099 minimizer-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ResultCode {
    InvalidParameter = 100,
    NotInitialized = 101,
    OutOfMemory = 102,
    NotFound = 103,
    AlreadyExists = 104,
    InvalidOperation = 105,
    Unsupported = 106,
    IoError = 107,
    DependencyError = 108,
    VersionConflict = 109,
    SymbolError = 110,
    MinimizerError = 1000,
}

impl ResultCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Input errors (caller bug), resource errors, structural errors, and
/// runtime errors. Every variant carries enough context to build the
/// human-readable message the pipeline error handler receives.
#[derive(Debug, Error)]
pub enum NexusError {
    // --- Input errors (A: version engine, B: symbol registry) ---
    #[error("malformed version string: {0:?}")]
    VersionMalformed(String),

    #[error("malformed version constraint: {0:?}")]
    ConstraintMalformed(String),

    #[error("symbol {name:?} already present in table")]
    AlreadyPresent { name: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("duplicate component id {0:?}")]
    DuplicateComponent(String),

    // --- Lookup / usage errors (B) ---
    #[error("symbol {name:?} not found")]
    NotFound { name: String },

    #[error("symbol {name:?} is in use (refcount > 0)")]
    InUse { name: String },

    #[error("symbol {name:?} kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    // --- Resource errors (C: image loader) ---
    #[error("failed to open component image at {path:?}: {reason}")]
    ImageOpenFailed { path: String, reason: String },

    #[error("component {id:?} init hook failed: {reason}")]
    ComponentInitFailed { id: String, reason: String },

    #[error("allocation failed")]
    AllocationFailed,

    #[error("I/O error: {0}")]
    IoError(String),

    // --- Structural errors (D: minimizer) ---
    #[error("malformed minimizer input")]
    MalformedInput,

    // --- Structural errors (E/F: dependency resolvers) ---
    #[error("dependency cycle detected through edge {consumer:?} -> {dependency:?}")]
    DependencyCycle { consumer: String, dependency: String },

    #[error("missing required dependency {missing_id:?} for {consumer_id:?}")]
    MissingRequiredDependency {
        consumer_id: String,
        missing_id: String,
    },

    #[error("component {0:?} participates in a cycle but is not reentrance-capable")]
    NonReentrantCycle(String),

    #[error("version conflict resolving {component:?}: requires {constraint:?}, found {found:?}")]
    VersionConflict {
        component: String,
        constraint: String,
        found: String,
    },

    // --- Runtime errors (H: pipeline engine) ---
    #[error("component {id:?} process function failed: {reason}")]
    ComponentProcessFailed { id: String, reason: String },

    #[error("symbol {0:?} could not be resolved at runtime")]
    SymbolNotFound(String),

    #[error("pipeline was aborted and must be re-initialized before executing")]
    PipelineAborted,

    #[error("pipeline is not initialized")]
    NotInitialized,

    #[error("cyclic execution group exceeded the maximum iteration count ({0})")]
    MaxIterationsExceeded(u32),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl NexusError {
    /// Maps this error onto the stable numeric contract.
    pub fn code(&self) -> u16 {
        use NexusError::*;
        match self {
            VersionMalformed(_) | ConstraintMalformed(_) | InvalidParameter(_) => {
                ResultCode::InvalidParameter.as_u16()
            }
            NotInitialized => ResultCode::NotInitialized.as_u16(),
            AllocationFailed => ResultCode::OutOfMemory.as_u16(),
            NotFound { .. } | SymbolNotFound(_) => ResultCode::NotFound.as_u16(),
            AlreadyPresent { .. } | DuplicateComponent(_) => ResultCode::AlreadyExists.as_u16(),
            InUse { .. } | PipelineAborted | InvalidOperation(_) => {
                ResultCode::InvalidOperation.as_u16()
            }
            Unsupported(_) => ResultCode::Unsupported.as_u16(),
            ImageOpenFailed { .. } | IoError(_) => ResultCode::IoError.as_u16(),
            ComponentInitFailed { .. }
            | ComponentProcessFailed { .. }
            | DependencyCycle { .. }
            | MissingRequiredDependency { .. }
            | NonReentrantCycle(_)
            | MaxIterationsExceeded(_) => ResultCode::DependencyError.as_u16(),
            VersionConflict { .. } => ResultCode::VersionConflict.as_u16(),
            KindMismatch { .. } => ResultCode::SymbolError.as_u16(),
            MalformedInput => ResultCode::MinimizerError.as_u16(),
        }
    }

    /// True for errors the iteration-budget rule treats as a warning
    /// (partial success) rather than a hard failure.
    pub fn is_warning(&self) -> bool {
        matches!(self, NexusError::MaxIterationsExceeded(_))
    }
}

pub type Result<T> = std::result::Result<T, NexusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_land_in_documented_ranges() {
        assert_eq!(NexusError::InvalidParameter("x".into()).code(), 100);
        assert_eq!(NexusError::NotInitialized.code(), 101);
        assert_eq!(NexusError::AllocationFailed.code(), 102);
        assert_eq!(NexusError::NotFound { name: "f".into() }.code(), 103);
        assert_eq!(
            NexusError::AlreadyPresent { name: "f".into() }.code(),
            104
        );
        assert_eq!(
            NexusError::KindMismatch {
                name: "f".into(),
                expected: "function".into(),
                found: "variable".into()
            }
            .code(),
            110
        );
        assert_eq!(NexusError::MalformedInput.code(), 1000);
    }

    #[test]
    fn max_iterations_exceeded_is_a_warning() {
        assert!(NexusError::MaxIterationsExceeded(10).is_warning());
        assert!(!NexusError::PipelineAborted.is_warning());
    }
}
