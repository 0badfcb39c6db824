use std::fmt;

use parking_lot::Mutex;

use crate::dtype::DType;

/// Coarse failure category. Every [`Error`] variant belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incompatible shape, stride set or axis set.
    Shape,
    /// Allocation failure on either locality.
    OutOfMemory,
    /// A buffer (or a view of it) was used after release or invalidation.
    UseAfterRelease,
    /// An op dispatch precondition was violated.
    Execution,
    /// Unknown graph identifier.
    GraphNotFound,
    /// Device, stream or event operation failed.
    Device,
}

impl ErrorKind {
    /// Stable integer code reported through [`LastError`]. Zero means success.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Shape => 1,
            ErrorKind::OutOfMemory => 2,
            ErrorKind::UseAfterRelease => 3,
            ErrorKind::Execution => 4,
            ErrorKind::GraphNotFound => 5,
            ErrorKind::Device => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Shape => "shape error",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::UseAfterRelease => "use after release",
            ErrorKind::Execution => "execution error",
            ErrorKind::GraphNotFound => "graph not found",
            ErrorKind::Device => "device error",
        };
        f.write_str(s)
    }
}

/// Which side of a dual-locality buffer an operation targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Host memory.
    Primary,
    /// Device memory.
    Secondary,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Primary => f.write_str("primary"),
            Side::Secondary => f.write_str("secondary"),
        }
    }
}

/// All errors that can occur within Kestrel.
///
/// One enum for the whole workspace; [`Error::kind`] folds the variants into
/// the six failure categories callers actually branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Requested rank exceeds [`crate::MAX_RANK`].
    #[error("rank {rank} exceeds the maximum supported rank {max}")]
    RankTooLarge { rank: usize, max: usize },

    /// Extents and strides disagree in length.
    #[error("extents have {extents} entries but strides have {strides}")]
    StrideLengthMismatch { extents: usize, strides: usize },

    /// Axis index out of range for the descriptor's rank.
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: i64, rank: usize },

    /// The same axis was named twice in an axis set.
    #[error("axis {axis} given more than once")]
    DuplicateAxis { axis: usize },

    /// Two shapes that must agree do not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Generic shape problem not covered by a structured variant.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Allocation failed.
    #[error("out of memory: requested {requested} bytes on {side} side")]
    OutOfMemory { requested: usize, side: Side },

    /// A released buffer was touched.
    #[error("buffer {buffer} used after release")]
    UseAfterRelease { buffer: u64 },

    /// A view outlived its parent's storage generation (after expansion).
    #[error("view of buffer {buffer} is stale: parent storage was reallocated")]
    StaleView { buffer: u64 },

    /// An op identifier that is not registered.
    #[error("unknown op: family {family}, code {code}")]
    UnknownOp { family: String, code: i32 },

    /// Op does not support the dtype combination it was given.
    #[error("op {op} does not support dtype {dtype}")]
    UnsupportedDType { op: String, dtype: DType },

    /// Dispatch precondition violated.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Graph identifier not registered.
    #[error("graph {id} is not registered")]
    GraphNotFound { id: i64 },

    /// Device runtime failure.
    #[error("device error: {0}")]
    Device(String),

    /// Malformed `.npy` header.
    #[error("invalid npy header: {0}")]
    Npy(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for [`Error::Execution`].
    pub fn execution(s: impl Into<String>) -> Self {
        Error::Execution(s.into())
    }

    /// Shorthand for [`Error::InvalidShape`].
    pub fn shape(s: impl Into<String>) -> Self {
        Error::InvalidShape(s.into())
    }

    /// The failure category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RankTooLarge { .. }
            | Error::StrideLengthMismatch { .. }
            | Error::AxisOutOfRange { .. }
            | Error::DuplicateAxis { .. }
            | Error::ShapeMismatch { .. }
            | Error::InvalidShape(_)
            | Error::Npy(_) => ErrorKind::Shape,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::UseAfterRelease { .. } | Error::StaleView { .. } => ErrorKind::UseAfterRelease,
            Error::UnknownOp { .. }
            | Error::UnsupportedDType { .. }
            | Error::Execution(_)
            | Error::Msg(_) => ErrorKind::Execution,
            Error::GraphNotFound { .. } => ErrorKind::GraphNotFound,
            Error::Device(_) => ErrorKind::Device,
        }
    }

    /// Integer code of [`Error::kind`].
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

/// Convenience Result type used throughout Kestrel.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

// LastError — shared failure slot
//
// Entry points record the failure here just before returning Err so callers
// on the far side of a flat boundary can poll code + message. The slot is
// shared by every thread using the same engine; it is not thread-local.

/// Process-wide (per engine) record of the most recent failure.
#[derive(Debug, Default)]
pub struct LastError {
    slot: Mutex<Option<(i32, String)>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` as the latest failure.
    pub fn record(&self, err: &Error) {
        *self.slot.lock() = Some((err.code(), err.to_string()));
    }

    /// Pass `result` through, recording its error if there is one.
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!(code = e.code(), error = %e, "recording last error");
            self.record(e);
        }
        result
    }

    /// Last failure code, 0 if nothing failed since the last clear.
    pub fn code(&self) -> i32 {
        self.slot.lock().as_ref().map(|(c, _)| *c).unwrap_or(0)
    }

    /// Last failure message, empty if nothing failed since the last clear.
    pub fn message(&self) -> String {
        self.slot
            .lock()
            .as_ref()
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}
