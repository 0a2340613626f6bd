use crate::{CameraToCamera, Pose, WorldToCamera};
use nalgebra::{Point3, UnitVector3};

/// Triangulates a world point from any number of posed observations.
pub trait TriangulatorObservations {
    /// Each item is the pose of a camera and the bearing (in that camera's frame) at which
    /// the point was observed. Returns `None` if the point cannot be triangulated, including when
    /// it would lie behind one of the cameras.
    fn triangulate_observations(
        &self,
        pairs: impl Iterator<Item = (WorldToCamera, UnitVector3<f64>)> + Clone,
    ) -> Option<Point3<f64>>;
}

/// Triangulates a point from two cameras related by a relative pose.
pub trait TriangulatorRelative {
    /// `relative_pose` maps the frame of camera A into the frame of camera B, `a` and `b` are the
    /// bearings in each camera. The point is returned in the frame of camera A.
    fn triangulate_relative(
        &self,
        relative_pose: CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<Point3<f64>>;
}

impl<T> TriangulatorRelative for T
where
    T: TriangulatorObservations,
{
    fn triangulate_relative(
        &self,
        CameraToCamera(pose): CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<Point3<f64>> {
        use core::iter::once;

        // Camera A is the world, so its pose is the identity and the relative pose
        // becomes the world to camera pose of camera B.
        self.triangulate_observations(
            once((WorldToCamera::identity(), a)).chain(once((WorldToCamera(pose), b))),
        )
    }
}
