use std::path::PathBuf;

use cell_links::LinkError;
use thiserror::Error;

/// Failures inside point-cloud registration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistrationError {
    /// The freshly captured cloud has no valid points.
    #[error("source cloud is empty")]
    EmptySource,

    /// The reference cloud has no valid points.
    #[error("target cloud is empty")]
    EmptyTarget,

    /// Too few weighted correspondences to constrain six degrees of freedom.
    #[error("too few correspondences: {found}")]
    TooFewCorrespondences {
        /// Correspondences found.
        found: usize,
    },

    /// The linearized system had no solution.
    #[error("normal equations are singular")]
    Singular,

    /// A tuning parameter was out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result alias for registration.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Failures loading or saving a reference dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// File could not be read or written.
    #[error("dataset file {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File content was not valid JSON for its type.
    #[error("dataset file {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Depth buffer length does not match the frame size.
    #[error("depth frame {width}x{height} carries {len} samples")]
    BufferSize {
        /// Frame width.
        width: u32,
        /// Frame height.
        height: u32,
        /// Samples present.
        len: usize,
    },
}

/// Why one correction attempt produced no pose.
///
/// Never surfaced by [`crate::PoseCorrector::correct`]; attempts that fail are
/// logged and counted as "no correction".
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// Capturing the depth frame or reading the pose failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Registration failed outright.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The blocking registration task died.
    #[error("registration task failed: {0}")]
    Task(String),
}
