use glam::{Quat, Vec3};
use openxr as xr;

/// A position plus unit rotation, representing a local coordinate frame.
///
/// Every physical object (HMD, controllers) has a pose relative to some
/// space, and relative poses compose: `a.transform_pose(b)` applies `b`
/// inside `a`'s local frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// Transform a point in this pose's local space to parent space.
    pub fn transform_point(&self, v: Vec3) -> Vec3 {
        self.position + self.rotation * v
    }

    /// Rotate a vector from local space into parent space.
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation * v
    }

    /// Compose with a local pose, such that
    /// `a.transform_point(b.transform_point(p)) ==
    ///  a.transform_pose(&b).transform_point(p)`.
    pub fn transform_pose(&self, other: &Pose) -> Pose {
        Pose {
            position: self.position + self.rotation * other.position,
            rotation: self.rotation * other.rotation,
        }
    }

    pub fn inverse(&self) -> Pose {
        let rotation = self.rotation.inverse();
        Pose {
            position: rotation * -self.position,
            rotation,
        }
    }

    /// This pose expressed in the local space of `base`.
    pub fn relative_to(&self, base: &Pose) -> Pose {
        base.inverse().transform_pose(self)
    }
}

impl std::ops::Mul for Pose {
    type Output = Pose;
    fn mul(self, rhs: Pose) -> Pose {
        self.transform_pose(&rhs)
    }
}

// Runtime poses are right-handed Y-up; the engine is left-handed Y-up.
// Every value crossing the boundary has its Z component negated.

pub(crate) fn vec_from_xr(v: xr::Vector3f) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

pub(crate) fn quat_from_xr(q: xr::Quaternionf) -> Quat {
    Quat::from_xyzw(q.x, q.y, -q.z, q.w)
}

pub(crate) fn pose_from_xr(p: xr::Posef) -> Pose {
    Pose {
        position: vec_from_xr(p.position),
        rotation: quat_from_xr(p.orientation),
    }
}

pub(crate) fn vec_to_xr(v: Vec3) -> xr::Vector3f {
    xr::Vector3f {
        x: v.x,
        y: v.y,
        z: -v.z,
    }
}

pub(crate) fn quat_to_xr(q: Quat) -> xr::Quaternionf {
    xr::Quaternionf {
        x: q.x,
        y: q.y,
        z: -q.z,
        w: q.w,
    }
}

pub(crate) fn extent_to_xr((width, height): (f32, f32)) -> xr::Extent2Df {
    xr::Extent2Df { width, height }
}

/// The orientation handed to the engine for an eye view. The downstream
/// camera API consumes conjugate quaternions, so on top of the Z negation
/// the X and Y components are inverted unconditionally.
pub(crate) fn eye_orientation(q: xr::Quaternionf) -> Quat {
    Quat::from_xyzw(-q.x, -q.y, q.z, q.w)
}

/// Heading of a runtime orientation around Y, from the rotated forward
/// vector. Pitch and roll do not contribute.
pub(crate) fn yaw_of(q: xr::Quaternionf) -> f32 {
    let rotation = Quat::from_xyzw(q.x, q.y, q.z, q.w);
    let forward = rotation * Vec3::Z;
    forward.x.atan2(forward.z)
}

/// A rotation of `yaw` radians about Y, as a runtime quaternion.
pub(crate) fn yaw_quat_xr(yaw: f32) -> xr::Quaternionf {
    xr::Quaternionf {
        x: 0.0,
        y: (yaw / 2.0).sin(),
        z: 0.0,
        w: (yaw / 2.0).cos(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_3;

    fn assert_pose_eq(a: &Pose, b: &Pose) {
        assert!(
            a.position.abs_diff_eq(b.position, 1e-4),
            "{a:?} vs {b:?}"
        );
        assert!(
            a.rotation.abs_diff_eq(b.rotation, 1e-4) || a.rotation.abs_diff_eq(-b.rotation, 1e-4),
            "{a:?} vs {b:?}"
        );
    }

    fn sample_poses() -> Vec<Pose> {
        vec![
            Pose::IDENTITY,
            Pose::new(Vec3::new(1.0, 2.0, -3.0), Quat::from_rotation_y(0.7)),
            Pose::new(
                Vec3::new(-0.25, 1.6, 0.1),
                Quat::from_euler(glam::EulerRot::YXZ, 1.2, -0.4, 0.3),
            ),
            Pose::new(Vec3::new(0.0, -5.0, 2.5), Quat::from_rotation_x(-1.1)),
        ]
    }

    #[test]
    fn pose_composition_round_trip() {
        for a in sample_poses() {
            for b in sample_poses() {
                let round = a.transform_pose(&b.inverse()).transform_pose(&b);
                assert_pose_eq(&round, &a);
            }
        }
    }

    #[test]
    fn pose_transform_associates_with_points() {
        let a = Pose::new(Vec3::new(1.0, 0.0, 2.0), Quat::from_rotation_y(0.9));
        let b = Pose::new(Vec3::new(0.0, 3.0, -1.0), Quat::from_rotation_x(0.4));
        let p = Vec3::new(0.5, -0.5, 4.0);
        let lhs = a.transform_point(b.transform_point(p));
        let rhs = a.transform_pose(&b).transform_point(p);
        assert!(lhs.abs_diff_eq(rhs, 1e-4));
    }

    #[test]
    fn inverse_cancels() {
        for p in sample_poses() {
            assert_pose_eq(&p.transform_pose(&p.inverse()), &Pose::IDENTITY);
            assert_pose_eq(&p.inverse().transform_pose(&p), &Pose::IDENTITY);
        }
    }

    #[test]
    fn conversion_symmetry() {
        let samples = [
            xr::Posef::IDENTITY,
            xr::Posef {
                position: xr::Vector3f {
                    x: 0.3,
                    y: 1.5,
                    z: -2.0,
                },
                orientation: quat_to_xr(Quat::from_rotation_y(0.8)),
            },
        ];
        for p in samples {
            let engine = pose_from_xr(p);
            let back = xr::Posef {
                position: vec_to_xr(engine.position),
                orientation: quat_to_xr(engine.rotation),
            };
            let again = pose_from_xr(back);
            assert_pose_eq(&again, &engine);
        }
    }

    #[test]
    fn yaw_extraction_drops_pitch() {
        for yaw in [0.0, 0.4, -1.3, 2.9] {
            for pitch in [0.0, 0.5, -0.8] {
                let q = Quat::from_euler(glam::EulerRot::YXZ, yaw, pitch, 0.0);
                let got = yaw_of(xr::Quaternionf {
                    x: q.x,
                    y: q.y,
                    z: q.z,
                    w: q.w,
                });
                let diff = (got - yaw).rem_euclid(std::f32::consts::TAU);
                assert!(
                    diff < 1e-3 || diff > std::f32::consts::TAU - 1e-3,
                    "yaw {yaw} pitch {pitch} -> {got}"
                );
            }
        }
    }

    #[test]
    fn yaw_quat_is_pure_y_rotation() {
        let q = yaw_quat_xr(FRAC_PI_3);
        assert_eq!(q.x, 0.0);
        assert_eq!(q.z, 0.0);
        let expected = Quat::from_rotation_y(FRAC_PI_3);
        assert!((q.y - expected.y).abs() < 1e-6);
        assert!((q.w - expected.w).abs() < 1e-6);
    }
}
