use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use cell_config::{CameraIntrinsics, CorrectionFiles};
use cell_links::{DepthFrame, Pose};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{cloud::PointCloud, error::DatasetError};

/// Reference cloud plus the end-effector pose it was captured from.
///
/// The master instance is loaded once from disk. Target instances are built
/// from a fresh capture on every correction attempt and never persisted.
#[derive(Debug, Clone)]
pub struct ArmCorrectionDataset {
    /// Depth-derived cloud in optical axes.
    pub cloud: Arc<PointCloud>,
    /// End-effector pose at capture time.
    pub pose: Pose,
    /// Hand color image, when recorded.
    pub hand_color: Option<PathBuf>,
    /// Depth-aligned color image, when recorded.
    pub depth_color: Option<PathBuf>,
}

impl ArmCorrectionDataset {
    /// Dataset from an in-memory capture.
    #[must_use]
    pub fn from_capture(
        frame: &DepthFrame,
        pose: Pose,
        intrinsics: &CameraIntrinsics,
        stride: u32,
    ) -> Self {
        Self {
            cloud: Arc::new(PointCloud::from_depth(frame, intrinsics, stride)),
            pose,
            hand_color: None,
            depth_color: None,
        }
    }

    /// Loads the master dataset.
    ///
    /// The depth frame and pose are required. Images are referenced only if
    /// they exist.
    ///
    /// # Errors
    ///
    /// Fails when the depth or pose file is missing or malformed.
    pub fn load(
        files: &CorrectionFiles,
        intrinsics: &CameraIntrinsics,
        stride: u32,
    ) -> Result<Self, DatasetError> {
        let frame: DepthFrame = read_json(&files.hand_depth)?;
        if !frame.has_valid_buffer_size() {
            return Err(DatasetError::BufferSize {
                width: frame.width,
                height: frame.height,
                len: frame.depths.len(),
            });
        }
        let pose: Pose = read_json(&files.arm_pose)?;
        let mut dataset = Self::from_capture(&frame, pose, intrinsics, stride);
        dataset.hand_color = files.hand_color.exists().then(|| files.hand_color.clone());
        dataset.depth_color = files.depth_color.exists().then(|| files.depth_color.clone());
        debug!(
            points = dataset.cloud.len(),
            path = %files.hand_depth.display(),
            "loaded master correction dataset"
        );
        Ok(dataset)
    }

    /// Records a new master: writes the raw frame and pose where
    /// [`Self::load`] expects them.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be written.
    pub fn record(files: &CorrectionFiles, frame: &DepthFrame, pose: &Pose) -> Result<(), DatasetError> {
        write_json(&files.hand_depth, frame)?;
        write_json(&files.arm_pose, pose)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DatasetError> {
    let raw = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_string(value).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, body).map_err(io_err)
}
