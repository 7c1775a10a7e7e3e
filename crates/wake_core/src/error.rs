use thiserror::Error;

/// Failures raised while building or restoring wake structures.
///
/// Numerical degeneracies are never reported here; they are clamped where they
/// occur and produce zero or bounded contributions instead.
#[derive(Debug, Error)]
pub enum WakeError {
    #[error("number of trailing wake sub-vortices must be a power of two, got {0}")]
    NotPowerOfTwo(usize),
    #[error("a vortex sheet needs at least {required} trailing vortices, got {found}")]
    TooFewTrailingVortices { required: usize, found: usize },
    #[error("trails of one sheet need {expected} sub-vortices each, got {found}")]
    MismatchedSubVortices { expected: usize, found: usize },
    #[error("trailing vortex index {index} is out of range for a sheet of {count}")]
    TrailIndexOutOfRange { index: usize, count: usize },
    #[error("wake record holds {found} nodes but the trail can store at most {capacity}")]
    RecordSizeMismatch { found: usize, capacity: usize },
    #[error("wake record I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type WakeResult<T> = std::result::Result<T, WakeError>;
