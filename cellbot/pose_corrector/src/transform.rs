use cell_links::{Pose, Position, Rotation};
use nalgebra::{Isometry3, Matrix3, Quaternion, Rotation3, Translation3, UnitQuaternion};

/// Rotation taking camera optical axes (x right, y down, z forward) onto the
/// agent body convention (x forward, y left, z up).
#[must_use]
pub fn optical_to_body() -> UnitQuaternion<f64> {
    let matrix = Matrix3::new(
        0.0, 0.0, 1.0, //
        -1.0, 0.0, 0.0, //
        0.0, -1.0, 0.0,
    );
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(matrix))
}

/// Converts a pose into a homogeneous rigid transform.
#[must_use]
pub fn pose_to_isometry(pose: &Pose) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(
        pose.rotation.w,
        pose.rotation.x,
        pose.rotation.y,
        pose.rotation.z,
    ));
    Isometry3::from_parts(
        Translation3::new(pose.position.x, pose.position.y, pose.position.z),
        rotation,
    )
}

/// Converts a rigid transform back into a position + quaternion pose.
#[must_use]
pub fn isometry_to_pose(iso: &Isometry3<f64>) -> Pose {
    let q = iso.rotation.quaternion();
    Pose {
        position: Position {
            x: iso.translation.x,
            y: iso.translation.y,
            z: iso.translation.z,
        },
        rotation: Rotation {
            w: q.w,
            x: q.i,
            y: q.j,
            z: q.k,
        },
    }
}

/// Pose the end effector must reach so the camera sees the scene as it did
/// when the reference was recorded.
///
/// `registration` maps points from the fresh capture onto the reference,
/// both in optical axes. It is inverted, re-expressed in body axes and
/// composed onto `nominal`.
#[must_use]
pub fn corrected_pose(nominal: &Pose, registration: &Isometry3<f64>) -> Pose {
    let remap = Isometry3::from_parts(Translation3::identity(), optical_to_body());
    let correction = remap * registration.inverse() * remap.inverse();
    isometry_to_pose(&(pose_to_isometry(nominal) * correction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};

    fn assert_pose_eq(actual: &Pose, expected: &Pose) {
        let a = pose_to_isometry(actual);
        let e = pose_to_isometry(expected);
        assert_relative_eq!(a.translation.vector, e.translation.vector, epsilon = 1e-9);
        assert!(a.rotation.angle_to(&e.rotation) < 1e-9);
    }

    #[test]
    fn remap_sends_optical_axis_forward() {
        let forward = optical_to_body() * Vector3::z();
        assert_relative_eq!(forward, Vector3::x(), epsilon = 1e-12);
        let down = optical_to_body() * Vector3::y();
        assert_relative_eq!(down, -Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn pose_round_trips_through_isometry() {
        let pose = Pose {
            position: Position {
                x: 0.7,
                y: -0.1,
                z: 0.35,
            },
            rotation: Rotation {
                w: 0.5,
                x: 0.5,
                y: 0.5,
                z: 0.5,
            },
        };
        assert_pose_eq(&isometry_to_pose(&pose_to_isometry(&pose)), &pose);
    }

    #[test]
    fn identity_registration_keeps_nominal() {
        let nominal = Pose::at(0.8, 0.1, 0.4);
        assert_pose_eq(&corrected_pose(&nominal, &Isometry3::identity()), &nominal);
    }

    #[test]
    fn correction_undoes_hand_drift() {
        let reference = pose_to_isometry(&Pose::at(0.8, 0.0, 0.4));
        let drift = Isometry3::new(Vector3::new(0.01, -0.02, 0.005), Vector3::new(0.0, 0.0, 0.03));
        let current = reference * drift;

        // A scene point seen from both camera placements, in optical axes.
        let remap = Isometry3::from_parts(Translation3::identity(), optical_to_body());
        let registration = remap.inverse() * drift * remap;
        let world = Point3::new(1.2, 0.1, 0.3);
        let in_reference = remap.inverse() * reference.inverse() * world;
        let in_current = remap.inverse() * current.inverse() * world;
        assert_relative_eq!(registration * in_current, in_reference, epsilon = 1e-9);

        let corrected = corrected_pose(&isometry_to_pose(&current), &registration);
        assert_pose_eq(&corrected, &isometry_to_pose(&reference));
    }
}
