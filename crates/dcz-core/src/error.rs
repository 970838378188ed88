use crate::shape::Shape;

/// All errors that can occur within dcz.
///
/// Every fault is local and synchronous: it is raised where the violated
/// invariant is detected and propagated to the caller with `?`. Kernels
/// validate their inputs before writing, so a returned error never leaves a
/// half-written output behind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes are incompatible for a broadcast, reduction or copy.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Slicing or indexing beyond an axis extent.
    #[error("index out of range: {index} for axis {dim} of size {size}")]
    IndexOutOfRange { index: usize, dim: usize, size: usize },

    /// Elementwise division hit a zero divisor.
    #[error("division by zero at element {position}")]
    DivisionByZero { position: usize },

    /// Bad magic, truncated payload or otherwise malformed weight file.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Unknown parameter, sublayer or file entry.
    #[error("missing entity: {0}")]
    MissingEntity(String),

    /// The operation is not valid in the current state (e.g. backward on a
    /// node that was never recorded).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Matrix multiplication contraction dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    InnerDimMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Tried to read a scalar from a tensor with more than one element.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn unsupported(s: impl Into<String>) -> Self {
        Error::UnsupportedOperation(s.into())
    }

    pub(crate) fn shape_mismatch(expected: &Shape, got: &Shape) -> Self {
        Error::ShapeMismatch {
            expected: expected.clone(),
            got: got.clone(),
        }
    }
}

/// Convenience Result type used throughout dcz.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
