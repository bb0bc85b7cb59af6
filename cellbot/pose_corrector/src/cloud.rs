use cell_config::CameraIntrinsics;
use cell_links::DepthFrame;
use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Unorganized point cloud in the camera optical frame
/// (x right, y down, z forward), meters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    /// Points.
    pub points: Vec<Point3<f64>>,
}

impl PointCloud {
    /// Wraps existing points.
    #[must_use]
    pub const fn from_points(points: Vec<Point3<f64>>) -> Self {
        Self { points }
    }

    /// Back-projects a depth frame through pinhole intrinsics.
    ///
    /// Every `stride`-th pixel along both axes is kept. Zero, NaN and
    /// out-of-range depths are dropped.
    #[must_use]
    pub fn from_depth(frame: &DepthFrame, intrinsics: &CameraIntrinsics, stride: u32) -> Self {
        let stride = stride.max(1) as usize;
        let scale = if intrinsics.depth_scale > 0.0 {
            intrinsics.depth_scale
        } else {
            1.0
        };
        let mut points = Vec::new();
        for v in (0..frame.height).step_by(stride) {
            for u in (0..frame.width).step_by(stride) {
                let Some(raw) = frame.get(u, v) else {
                    continue;
                };
                let z = f64::from(raw) / scale;
                if !z.is_finite() || z <= 0.0 || z < intrinsics.min_depth || z > intrinsics.max_depth
                {
                    continue;
                }
                let x = (f64::from(u) - intrinsics.cx) / intrinsics.fx * z;
                let y = (f64::from(v) - intrinsics.cy) / intrinsics.fy * z;
                points.push(Point3::new(x, y, z));
            }
        }
        Self { points }
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the cloud is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean of all points, `None` when empty.
    #[must_use]
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.points.iter().map(|p| p.coords).sum();
        #[allow(clippy::cast_precision_loss)]
        let count = self.points.len() as f64;
        Some(Point3::from(sum / count))
    }

    /// Copy of the cloud moved by `transform`.
    #[must_use]
    pub fn transformed(&self, transform: &Isometry3<f64>) -> Self {
        Self {
            points: self.points.iter().map(|p| transform * p).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn frame(width: u32, height: u32, depths: Vec<f32>) -> DepthFrame {
        DepthFrame {
            width,
            height,
            depths,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn principal_point_projects_onto_axis() {
        let intrinsics = CameraIntrinsics {
            cx: 1.0,
            cy: 1.0,
            ..CameraIntrinsics::default()
        };
        let cloud = PointCloud::from_depth(&frame(3, 3, vec![0.5; 9]), &intrinsics, 1);
        assert_eq!(cloud.len(), 9);
        let center = cloud.points[4];
        assert_relative_eq!(center.x, 0.0);
        assert_relative_eq!(center.y, 0.0);
        assert_relative_eq!(center.z, 0.5);
        let right = cloud.points[5];
        assert_relative_eq!(right.x, 0.5 / intrinsics.fx, epsilon = 1e-12);
    }

    #[test]
    fn invalid_depths_are_dropped() {
        let depths = vec![0.0, f32::NAN, 0.05, 3.0, 1.0, 1.0];
        let cloud = PointCloud::from_depth(&frame(3, 2, depths), &CameraIntrinsics::default(), 1);
        assert_eq!(cloud.len(), 2);
    }

    #[test]
    fn stride_skips_pixels() {
        let cloud = PointCloud::from_depth(&frame(4, 4, vec![1.0; 16]), &CameraIntrinsics::default(), 2);
        assert_eq!(cloud.len(), 4);
    }

    #[test]
    fn depth_scale_converts_raw_units() {
        let intrinsics = CameraIntrinsics {
            depth_scale: 1000.0,
            ..CameraIntrinsics::default()
        };
        let cloud = PointCloud::from_depth(&frame(1, 1, vec![750.0]), &intrinsics, 1);
        assert_relative_eq!(cloud.points[0].z, 0.75, epsilon = 1e-9);
    }

    #[test]
    fn centroid_of_empty_cloud_is_none() {
        assert!(PointCloud::default().centroid().is_none());
    }
}
