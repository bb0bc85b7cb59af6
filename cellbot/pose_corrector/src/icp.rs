//! Robust point-to-plane Iterative Closest Point.
//!
//! Each iteration pairs every source point with its nearest target point,
//! linearizes the point-to-plane residual around the current estimate,
//! down-weights pairs with Tukey's biweight and solves the 6x6 normal
//! equations. The small update is composed onto the running transform, so
//! each iteration starts from the previous result.

use cell_config::RegistrationSettings;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Isometry3, Matrix6, Point3, Vector3, Vector6};
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    cloud::PointCloud,
    error::{RegistrationError, RegistrationResult},
    normals::{build_kdtree, estimate_normals},
};

/// ICP tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpParams {
    /// Iteration budget.
    pub max_iterations: usize,
    /// Pairs farther apart than this (meters) are ignored.
    pub max_correspondence_distance: f64,
    /// Tukey kernel scale (meters); residuals beyond it get zero weight.
    pub sigma: f64,
    /// Stop once the update norm drops below this.
    pub convergence_threshold: f64,
    /// Neighbours used to estimate target normals.
    pub normal_neighbors: usize,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_correspondence_distance: 0.05,
            sigma: 0.01,
            convergence_threshold: 1e-8,
            normal_neighbors: 8,
        }
    }
}

impl IcpParams {
    /// Default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the iteration budget.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the correspondence cut-off.
    #[must_use]
    pub const fn with_max_correspondence_distance(mut self, distance: f64) -> Self {
        self.max_correspondence_distance = distance;
        self
    }

    /// Sets the robust kernel scale.
    #[must_use]
    pub const fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    /// Sets the convergence threshold.
    #[must_use]
    pub const fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    /// Sets the neighbour count for normal estimation.
    #[must_use]
    pub const fn with_normal_neighbors(mut self, k: usize) -> Self {
        self.normal_neighbors = k;
        self
    }

    fn validate(&self) -> RegistrationResult<()> {
        if self.max_correspondence_distance <= 0.0 {
            return Err(RegistrationError::InvalidParameter(
                "max_correspondence_distance must be positive".into(),
            ));
        }
        if self.sigma <= 0.0 {
            return Err(RegistrationError::InvalidParameter(
                "sigma must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl From<&RegistrationSettings> for IcpParams {
    fn from(settings: &RegistrationSettings) -> Self {
        Self::default()
            .with_max_iterations(settings.max_iterations)
            .with_max_correspondence_distance(settings.max_correspondence_distance)
            .with_sigma(settings.sigma)
            .with_normal_neighbors(settings.normal_neighbors)
    }
}

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IcpResult {
    /// Transform mapping source points onto the target.
    pub transform: Isometry3<f64>,
    /// Inlier correspondences divided by source points, in `[0, 1]`.
    pub fitness: f64,
    /// RMS distance over inlier correspondences.
    pub inlier_rmse: f64,
    /// Iterations run.
    pub iterations: usize,
}

/// Reference cloud with its normals and search tree, built once and reused
/// across registrations.
pub struct RegistrationTarget {
    cloud: PointCloud,
    normals: Vec<Vector3<f64>>,
    tree: KdTree<f64, 3>,
}

impl std::fmt::Debug for RegistrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationTarget")
            .field("points", &self.cloud.len())
            .finish_non_exhaustive()
    }
}

impl RegistrationTarget {
    /// Indexes `cloud` and estimates normals from `k` neighbours.
    #[must_use]
    pub fn new(cloud: PointCloud, k: usize) -> Self {
        let tree = build_kdtree(&cloud.points);
        let normals = estimate_normals(&cloud.points, &tree, k);
        Self {
            cloud,
            normals,
            tree,
        }
    }

    /// The indexed cloud.
    #[must_use]
    pub const fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    fn nearest(&self, p: &Point3<f64>) -> (usize, f64) {
        let hit = self.tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
        #[allow(clippy::cast_possible_truncation)]
        let index = hit.item as usize;
        (index, hit.distance)
    }
}

/// Tukey biweight: `(1 - (r/k)^2)^2` inside the kernel, zero outside.
#[must_use]
pub fn tukey_weight(residual: f64, sigma: f64) -> f64 {
    if residual.abs() > sigma {
        return 0.0;
    }
    let ratio = residual / sigma;
    let inner = ratio.mul_add(-ratio, 1.0);
    inner * inner
}

/// Registers `source` onto `target`, starting from the identity.
///
/// # Errors
///
/// Fails on empty clouds, invalid parameters, or when an iteration finds
/// too few weighted correspondences to solve for a pose.
pub fn register(
    source: &PointCloud,
    target: &RegistrationTarget,
    params: &IcpParams,
) -> RegistrationResult<IcpResult> {
    params.validate()?;
    if source.is_empty() {
        return Err(RegistrationError::EmptySource);
    }
    if target.cloud.is_empty() {
        return Err(RegistrationError::EmptyTarget);
    }

    let max_dist_sq = params.max_correspondence_distance * params.max_correspondence_distance;
    let mut transform = Isometry3::identity();
    let mut iterations = 0;

    for _ in 0..params.max_iterations {
        iterations += 1;
        let rows: Vec<(Vector6<f64>, f64, f64)> = source
            .points
            .par_iter()
            .filter_map(|p| {
                let moved = transform * p;
                let (index, dist_sq) = target.nearest(&moved);
                if dist_sq > max_dist_sq {
                    return None;
                }
                let q = target.cloud.points.get(index)?;
                let n = target.normals.get(index)?;
                let residual = (moved - q).dot(n);
                let weight = tukey_weight(residual, params.sigma);
                if weight <= 0.0 {
                    return None;
                }
                let c = moved.coords.cross(n);
                Some((Vector6::new(c.x, c.y, c.z, n.x, n.y, n.z), residual, weight))
            })
            .collect();

        if rows.len() < 6 {
            return Err(RegistrationError::TooFewCorrespondences { found: rows.len() });
        }

        let mut a = Matrix6::zeros();
        let mut b = Vector6::zeros();
        for (jacobian, residual, weight) in &rows {
            a += jacobian * jacobian.transpose() * *weight;
            b += jacobian * (*residual * *weight);
        }

        let update = solve(a, -b).ok_or(RegistrationError::Singular)?;
        let delta = Isometry3::new(
            Vector3::new(update[3], update[4], update[5]),
            Vector3::new(update[0], update[1], update[2]),
        );
        transform = delta * transform;

        if update.norm() < params.convergence_threshold {
            break;
        }
    }

    let (fitness, inlier_rmse) = evaluate(source, target, &transform, max_dist_sq);
    Ok(IcpResult {
        transform,
        fitness,
        inlier_rmse,
        iterations,
    })
}

fn solve(a: Matrix6<f64>, rhs: Vector6<f64>) -> Option<Vector6<f64>> {
    a.cholesky()
        .map(|chol| chol.solve(&rhs))
        .or_else(|| a.lu().solve(&rhs))
}

/// Fitness and inlier RMSE of `transform` applied to `source`.
fn evaluate(
    source: &PointCloud,
    target: &RegistrationTarget,
    transform: &Isometry3<f64>,
    max_dist_sq: f64,
) -> (f64, f64) {
    let inliers: Vec<f64> = source
        .points
        .par_iter()
        .filter_map(|p| {
            let (_, dist_sq) = target.nearest(&(transform * p));
            (dist_sq <= max_dist_sq).then_some(dist_sq)
        })
        .collect();
    if inliers.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let fitness = inliers.len() as f64 / source.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let rmse = (inliers.iter().sum::<f64>() / inliers.len() as f64).sqrt();
    (fitness, rmse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Wavy surface in front of the camera, curved enough to pin all six
    /// degrees of freedom.
    fn surface(count: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..count)
            .map(|_| {
                let x: f64 = rng.gen_range(-0.15..0.15);
                let y: f64 = rng.gen_range(-0.15..0.15);
                let z = 0.02f64.mul_add((25.0 * x).sin() * (20.0 * y).cos(), 0.6);
                Point3::new(x, y, z)
            })
            .collect();
        PointCloud::from_points(points)
    }

    fn params() -> IcpParams {
        IcpParams::new()
            .with_max_iterations(50)
            .with_sigma(0.02)
            .with_normal_neighbors(10)
    }

    #[test]
    fn identical_clouds_register_to_identity() {
        let cloud = surface(1500, 1);
        let target = RegistrationTarget::new(cloud.clone(), 10);
        let result = register(&cloud, &target, &params()).unwrap();
        assert_relative_eq!(result.fitness, 1.0);
        assert!(result.inlier_rmse < 1e-9);
        assert!(result.transform.translation.vector.norm() < 1e-6);
        assert!(result.transform.rotation.angle() < 1e-6);
    }

    #[test]
    fn recovers_small_rigid_offset() {
        let cloud = surface(2500, 2);
        let truth = Isometry3::from_parts(
            Vector3::new(0.004, -0.003, 0.002).into(),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.004),
        );
        let source = cloud.transformed(&truth.inverse());
        let target = RegistrationTarget::new(cloud, 10);
        let result = register(&source, &target, &params()).unwrap();

        let error = result.transform * truth.inverse();
        assert!(error.translation.vector.norm() < 2e-3, "{error:?}");
        assert!(error.rotation.angle() < 2e-3, "{error:?}");
        assert!(result.fitness > 0.95);
    }

    #[test]
    fn distant_cloud_finds_no_correspondences() {
        let cloud = surface(500, 3);
        let far = cloud.transformed(&Isometry3::translation(0.0, 0.0, 0.5));
        let target = RegistrationTarget::new(cloud, 8);
        let err = register(&far, &target, &IcpParams::new()).unwrap_err();
        assert_eq!(err, RegistrationError::TooFewCorrespondences { found: 0 });
    }

    #[test]
    fn empty_clouds_are_rejected() {
        let target = RegistrationTarget::new(surface(100, 4), 8);
        assert_eq!(
            register(&PointCloud::default(), &target, &IcpParams::new()).unwrap_err(),
            RegistrationError::EmptySource
        );
        let empty = RegistrationTarget::new(PointCloud::default(), 8);
        assert_eq!(
            register(&surface(10, 5), &empty, &IcpParams::new()).unwrap_err(),
            RegistrationError::EmptyTarget
        );
    }

    #[test]
    fn non_positive_sigma_is_invalid() {
        let target = RegistrationTarget::new(surface(100, 6), 8);
        let err = register(&surface(100, 6), &target, &IcpParams::new().with_sigma(0.0)).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidParameter(_)));
    }

    #[test]
    fn tukey_weight_vanishes_outside_kernel() {
        assert_relative_eq!(tukey_weight(0.0, 0.01), 1.0);
        assert_relative_eq!(tukey_weight(0.005, 0.01), 0.5625);
        assert_relative_eq!(tukey_weight(0.02, 0.01), 0.0);
    }
}
