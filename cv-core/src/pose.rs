use crate::{FeatureMatch, FeatureWorldMatch};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix3, Point3, Rotation3, UnitVector3, Vector3, Vector6};
use sample_consensus::Model;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A rigid transform between two frames.
///
/// The engine stores [`WorldToCamera`] for every registered view. [`CameraToWorld`] places a
/// camera in the world and [`CameraToCamera`] is the relative pose estimated from two views.
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type Inverse: Pose;

    /// The underlying rotation and translation.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// The pose of a camera at the origin looking down +Z.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Multiplies the translation by `scale`. Used to fix the gauge of a reconstruction.
    #[must_use]
    fn scale(self, scale: f64) -> Self {
        let mut isometry = self.isometry();
        isometry.translation.vector *= scale;
        isometry.into()
    }

    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// The translation followed by the scaled rotation axis.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r = isometry.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Inverse of [`Pose::se3`].
    fn from_se3(se3: Vector6<f64>) -> Self {
        let rotation = Rotation3::from_scaled_axis(Vector3::new(se3[3], se3[4], se3[5]));
        Self::from_parts(se3.xyz(), rotation)
    }

    /// Maps a point of the source frame into the target frame.
    fn transform(self, point: Point3<f64>) -> Point3<f64> {
        self.isometry() * point
    }

    /// Maps a bearing of the source frame into the target frame.
    fn rotate(self, bearing: UnitVector3<f64>) -> UnitVector3<f64> {
        self.isometry().rotation * bearing
    }

    /// Checks that the rotation is orthonormal with a positive determinant and that the
    /// translation is finite.
    fn is_valid(self, tolerance: f64) -> bool {
        let isometry = self.isometry();
        let rotation = isometry.rotation.matrix();
        let orthonormality = (rotation.transpose() * rotation - Matrix3::identity()).norm();
        rotation.iter().all(|n| n.is_finite())
            && isometry.translation.vector.iter().all(|n| n.is_finite())
            && orthonormality < tolerance
            && rotation.determinant() > 0.0
    }
}

/// Maps world points into the frame of a camera.
///
/// This is the pose of a registered view. A world point is in front of the camera when its
/// transformed Z coordinate is positive.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// The optical center of the camera in world coordinates.
    pub fn center(self) -> Point3<f64> {
        self.inverse().isometry() * Point3::origin()
    }

    /// The depth (camera Z) of a world point.
    pub fn depth(self, point: Point3<f64>) -> f64 {
        self.transform(point).z
    }

    /// Rotates a bearing in the camera frame into the world frame.
    pub fn world_bearing(self, bearing: UnitVector3<f64>) -> UnitVector3<f64> {
        self.inverse().rotate(bearing)
    }

    /// Computes the pose of `other` relative to this camera.
    pub fn relative_to(self, other: WorldToCamera) -> CameraToCamera {
        CameraToCamera(other.0 * self.0.inverse())
    }
}

/// The angle in radians between an observed bearing and the direction to the world point.
///
/// A point behind the camera produces an angle above `π / 2`, so it never looks like an inlier
/// under a small threshold.
impl Model<FeatureWorldMatch> for WorldToCamera {
    fn residual(&self, data: &FeatureWorldMatch) -> f64 {
        let &FeatureWorldMatch(bearing, world) = data;
        let camera = self.transform(world).coords;
        let norm = camera.norm();
        if !norm.is_finite() || norm == 0.0 {
            return f64::INFINITY;
        }
        angle_between(&bearing.into_inner(), &(camera / norm))
    }
}

/// The pose of a camera in the world.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// The relative pose that maps points in the frame of camera A into the frame of camera B.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToCamera(pub IsometryMatrix3<f64>);

impl Pose for CameraToCamera {
    type Inverse = CameraToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// Symmetric angular distance of a match to the epipolar plane, in radians.
///
/// For each bearing, the angle between it and the plane spanned by the baseline and the other
/// bearing is computed, and the larger of both is returned. With a zero baseline the plane is
/// undefined and the angle between both bearings is used instead.
impl Model<FeatureMatch> for CameraToCamera {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        let &FeatureMatch(a, b) = data;
        let t = self.0.translation.vector;
        let ra = (self.0.rotation * a).into_inner();
        let b = b.into_inner();

        let plane_b = t.cross(&ra);
        let plane_a = t.cross(&b);
        let (na, nb) = (plane_a.norm(), plane_b.norm());
        if na < 1e-12 || nb < 1e-12 {
            return angle_between(&ra, &b);
        }
        let error_b = (plane_b.dot(&b) / nb).abs().min(1.0).asin();
        let error_a = (plane_a.dot(&ra) / na).abs().min(1.0).asin();
        error_a.max(error_b)
    }
}

/// Numerically robust angle between two (not necessarily normalized) vectors.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.cross(b).norm().atan2(a.dot(b))
}
