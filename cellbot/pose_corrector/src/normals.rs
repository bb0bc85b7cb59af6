use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use rayon::prelude::*;

/// Per-index offset added to every indexed coordinate.
///
/// kiddo cannot split a bucket whose items all share one value on the split
/// axis, which a depth grid produces along a whole pixel column or across a
/// flat panel. The offset keeps every axis value distinct and stays far
/// below sensor resolution.
const KEY_SPREAD: f64 = 1e-12;

/// Builds a KD-tree over `points`, items are point indices.
///
/// Keys carry an index-dependent offset of at most `len * 1e-12` m, so
/// returned distances may differ from the exact ones by that much.
#[must_use]
pub fn build_kdtree(points: &[Point3<f64>]) -> KdTree<f64, 3> {
    let mut tree: KdTree<f64, 3> = KdTree::with_capacity(points.len().max(1));
    for (i, p) in points.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let offset = i as f64 * KEY_SPREAD;
        tree.add(&[p.x + offset, p.y + offset, p.z + offset], i as u64);
    }
    tree
}

/// Estimates one unit normal per point by PCA over its `k` nearest
/// neighbours, oriented towards the camera origin.
///
/// Points with fewer than three neighbours get the optical axis pointing
/// back at the camera.
#[must_use]
pub fn estimate_normals(points: &[Point3<f64>], tree: &KdTree<f64, 3>, k: usize) -> Vec<Vector3<f64>> {
    let k = k.max(3);
    points
        .par_iter()
        .map(|p| {
            let neighbours = tree.nearest_n::<SquaredEuclidean>(&[p.x, p.y, p.z], k);
            #[allow(clippy::cast_possible_truncation)]
            let positions: Vec<Point3<f64>> = neighbours
                .iter()
                .filter_map(|n| points.get(n.item as usize).copied())
                .collect();
            let normal = plane_normal(&positions).unwrap_or_else(|| -Vector3::z());
            if normal.dot(&p.coords) > 0.0 {
                -normal
            } else {
                normal
            }
        })
        .collect()
}

fn plane_normal(positions: &[Point3<f64>]) -> Option<Vector3<f64>> {
    if positions.len() < 3 {
        return None;
    }
    let sum: Vector3<f64> = positions.iter().map(|p| p.coords).sum();
    #[allow(clippy::cast_precision_loss)]
    let centroid = sum / positions.len() as f64;
    let mut cov = Matrix3::zeros();
    for p in positions {
        let diff = p.coords - centroid;
        cov += diff * diff.transpose();
    }
    let eigen = SymmetricEigen::new(cov);
    let values = eigen.eigenvalues;
    let min_idx = if values[0] <= values[1] && values[0] <= values[2] {
        0
    } else if values[1] <= values[2] {
        1
    } else {
        2
    };
    let column = eigen.eigenvectors.column(min_idx);
    let normal = Vector3::new(column[0], column[1], column[2]);
    let norm = normal.norm();
    (norm > 1e-10).then(|| normal / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn tilted_plane_normals_face_camera() {
        let mut rng = StdRng::seed_from_u64(7);
        // z = 1 + 0.2 x with a little sensor noise.
        let points: Vec<Point3<f64>> = (0..400)
            .map(|_| {
                let x: f64 = rng.gen_range(-0.2..0.2);
                let y: f64 = rng.gen_range(-0.2..0.2);
                Point3::new(x, y, 0.2f64.mul_add(x, 1.0) + rng.gen_range(-1e-6..1e-6))
            })
            .collect();
        let tree = build_kdtree(&points);
        let normals = estimate_normals(&points, &tree, 10);
        let expected = Vector3::new(0.2, 0.0, -1.0).normalize();
        for normal in &normals {
            assert_relative_eq!(normal.norm(), 1.0, epsilon = 1e-9);
            assert!(normal.dot(&expected) > 0.99);
        }
    }

    #[test]
    fn sparse_cloud_falls_back_to_optical_axis() {
        let points = vec![Point3::new(0.0, 0.0, 1.0), Point3::new(0.1, 0.05, 1.02)];
        let tree = build_kdtree(&points);
        let normals = estimate_normals(&points, &tree, 8);
        assert_eq!(normals[0], -Vector3::z());
    }

    #[test]
    fn flat_grid_with_shared_axis_values_is_indexed() {
        // A fronto-parallel panel: every point has z = 0.6 and each column
        // repeats its x value 60 times, more than one bucket holds.
        let points: Vec<Point3<f64>> = (0..60)
            .flat_map(|v| {
                (0..80).map(move |u| {
                    Point3::new(f64::from(u - 40) * 0.005, f64::from(v - 30) * 0.005, 0.6)
                })
            })
            .collect();
        let tree = build_kdtree(&points);
        let normals = estimate_normals(&points, &tree, 10);
        assert_eq!(normals.len(), points.len());
        for normal in &normals {
            assert!(normal.dot(&-Vector3::z()) > 0.999);
        }
        let hit = tree.nearest_one::<SquaredEuclidean>(&[0.0, 0.0, 0.6]);
        assert_eq!(points[hit.item as usize], Point3::new(0.0, 0.0, 0.6));
    }
}
