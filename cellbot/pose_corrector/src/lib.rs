#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Sensor pose correction.
//!
//! Before a precision capture the hand camera is re-aimed at a recorded
//! reference view: a fresh depth frame is back-projected into a cloud,
//! registered against the master cloud with robust point-to-plane ICP, and
//! the inverse of the registration, remapped from optical to body axes, is
//! composed onto the current end-effector pose. The arm only moves when the
//! registration fitness clears the configured threshold.

/// Depth back-projection.
pub mod cloud;
/// Capture, register and move.
pub mod corrector;
/// Master reference data.
pub mod dataset;
/// Error types.
pub mod error;
/// Registration.
pub mod icp;
/// Normal estimation.
pub mod normals;
/// Structured logging and events.
pub mod telemetry;
/// Pose and frame conversions.
pub mod transform;

pub use cloud::PointCloud;
pub use corrector::{CorrectionAttempt, PoseCorrector};
pub use dataset::ArmCorrectionDataset;
pub use error::{CorrectionError, DatasetError, RegistrationError, RegistrationResult};
pub use icp::{register, tukey_weight, IcpParams, IcpResult, RegistrationTarget};
pub use normals::{build_kdtree, estimate_normals};
pub use telemetry::{CorrectorTelemetry, CorrectorTelemetryBuilder};
pub use transform::{corrected_pose, isometry_to_pose, optical_to_body, pose_to_isometry};
