#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Typed configuration for the inspection cell.
//!
//! The document is plain JSON. Every field has its default enumerated in
//! [`model`]; [`ConfigStore`] re-reads the file on each access.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration document types.
pub mod model;

/// File-backed store.
pub mod store;

pub use model::{
    ArmCorrectionData, ArmPosition, CameraIntrinsics, CellConfig, CorrectionFiles, CycleSettings,
    HoleInspection, MissionSettings, RegistrationSettings, SignalTags, StationSettings,
    Thresholds, Waypoints,
};
pub use store::ConfigStore;

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config io error at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid JSON for the document shape.
    #[error("config parse error in {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Cross-field validation failed.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// No station with the requested name.
    #[error("unknown station `{0}`")]
    UnknownStation(String),
}
