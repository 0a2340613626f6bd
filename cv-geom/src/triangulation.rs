//! Two-view and many-view triangulation.
//!
//! All triangulators return world points and reject points that would lie behind one of the
//! observing cameras.

use crate::UnknownVariant;
use core::fmt;
use core::str::FromStr;
use cv_core::{
    angle_between,
    nalgebra::{zero, Matrix3x4, Matrix4, Point3, UnitVector3, Vector3},
    CameraToCamera, Pose, TriangulatorObservations, TriangulatorRelative, WorldToCamera,
};

/// Reffered to as the Linear-Eigen method by Hartley and Sturm in the paper
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
///
/// Every observation contributes the rows of `(I - b bᵀ) [R | t]`, which vanish when the
/// homogeneous point lies on the ray of bearing `b`. The point is the eigenvector of the
/// accumulated 4x4 system with the smallest eigenvalue. This is the direct linear transform
/// for bearings and works with any number of views.
///
/// ```
/// use cv_core::nalgebra::{Point3, Rotation3, Vector3, UnitVector3};
/// use cv_core::{CameraToCamera, Pose, TriangulatorRelative};
/// use cv_geom::triangulation::LinearEigenTriangulator;
///
/// let point = Point3::new(0.3, 0.1, 2.0);
/// let pose = CameraToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::new(Vector3::new(0.1, 0.1, 0.1)));
/// let bearing_a = UnitVector3::new_normalize(point.coords);
/// let bearing_b = UnitVector3::new_normalize(pose.transform(point).coords);
/// let triangulated = LinearEigenTriangulator::new().triangulate_relative(pose, bearing_a, bearing_b).unwrap();
/// assert!((point - triangulated).norm() < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the symmetric eigen solver.
    ///
    /// Default is `1e-12`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the symmetric eigen solver.
    ///
    /// Default is `1000`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl TriangulatorObservations for LinearEigenTriangulator {
    fn triangulate_observations(
        &self,
        pairs: impl Iterator<Item = (WorldToCamera, UnitVector3<f64>)> + Clone,
    ) -> Option<Point3<f64>> {
        if pairs.clone().count() < 2 {
            return None;
        }

        let mut system: Matrix4<f64> = zero();
        for (pose, bearing) in pairs.clone() {
            let bearing = bearing.into_inner();
            let rotation = pose.0.rotation.matrix();
            let projection = Matrix3x4::<f64>::from_columns(&[
                rotation.column(0),
                rotation.column(1),
                rotation.column(2),
                pose.0.translation.vector.column(0),
            ]);
            let rejection = projection - bearing * (bearing.transpose() * projection);
            system += rejection.transpose() * rejection;
        }

        let eigen = system.try_symmetric_eigen(self.epsilon, self.max_iterations)?;
        let homogeneous = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| eigen.eigenvectors.column(ix).into_owned())?;
        if homogeneous.w.abs() < f64::EPSILON {
            return None;
        }
        let point = Point3::from(homogeneous.xyz() / homogeneous.w);
        Some(point).filter(|point| is_finite(point) && in_front_of_all(pairs, point))
    }
}

/// Finds the depths `(λa, λb)` such that `λa a - λb b = baseline`, where `a` and `b` are
/// bearings in the same frame and `baseline` points from the optical center of `a` to the
/// optical center of `b`. If the rays do not intersect this is the least squares solution
/// in the plane spanned by the bearings.
pub(crate) fn ray_depths(
    baseline: Vector3<f64>,
    a: Vector3<f64>,
    b: Vector3<f64>,
) -> Option<(f64, f64)> {
    let normal = a.cross(&b);
    let norm_squared = normal.norm_squared();
    if norm_squared < 1e-24 {
        return None;
    }
    let depth_a = baseline.cross(&b).dot(&normal) / norm_squared;
    let depth_b = baseline.cross(&a).dot(&normal) / norm_squared;
    Some((depth_a, depth_b))
}

/// Expresses the second camera of a relative pose in the frame of the first one.
///
/// Returns the optical center of camera B and the bearing `b` rotated into camera A.
fn second_camera_in_first(
    relative_pose: CameraToCamera,
    b: UnitVector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let inverse = relative_pose.inverse().isometry();
    (inverse.translation.vector, inverse.rotation * b.into_inner())
}

/// Intersects two corrected rays and verifies chirality.
fn intersect_corrected(
    center_b: Vector3<f64>,
    a: Vector3<f64>,
    b: Vector3<f64>,
) -> Option<Point3<f64>> {
    let (depth_a, depth_b) = ray_depths(center_b, a, b)?;
    if depth_a <= 0.0 || depth_b <= 0.0 {
        return None;
    }
    Some(Point3::from(a * depth_a)).filter(is_finite)
}

/// From the paper "Closed-Form Optimal Two-View Triangulation Based on Angular Errors"
/// by Seong Hun Lee and Javier Civera, algorithms 12 and 13.
///
/// Only the bearing which is cheaper to correct is moved onto the epipolar plane of the other,
/// which minimizes the sum of both angular errors.
///
/// ```
/// use cv_core::nalgebra::{Point3, Rotation3, Vector3, UnitVector3};
/// use cv_core::{CameraToCamera, Pose, TriangulatorRelative};
/// use cv_geom::triangulation::AngularL1Triangulator;
///
/// let pose = CameraToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::from_scaled_axis(Vector3::new(0.1, 0.1, 0.1)));
/// let point = Point3::new(0.3, 0.1, 2.0);
/// let triangulated = AngularL1Triangulator.triangulate_relative(
///     pose,
///     UnitVector3::new_normalize(point.coords),
///     UnitVector3::new_normalize(pose.transform(point).coords),
/// ).unwrap();
/// assert!((point - triangulated).norm() < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct AngularL1Triangulator;

impl TriangulatorRelative for AngularL1Triangulator {
    fn triangulate_relative(
        &self,
        relative_pose: CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<Point3<f64>> {
        let (center_b, b) = second_camera_in_first(relative_pose, b);
        let a = a.into_inner();
        let direction = center_b.try_normalize(1e-12)?;

        let cross_a = a.cross(&direction);
        let cross_b = b.cross(&direction);
        let (a, b) = if cross_a.norm() < cross_b.norm() {
            let nb = cross_b.normalize();
            ((a - a.dot(&nb) * nb).normalize(), b)
        } else {
            let na = cross_a.normalize();
            (a, (b - b.dot(&na) * na).normalize())
        };
        intersect_corrected(center_b, a, b)
    }
}

/// From the paper "Closed-Form Optimal Two-View Triangulation Based on Angular Errors"
/// in section 7: "Closed-Form L∞ Triangulation".
///
/// Both bearings are moved onto a common plane through the baseline so that the larger of the
/// two angular corrections is as small as possible.
#[derive(Copy, Clone, Debug, Default)]
pub struct AngularLInfinityTriangulator;

impl TriangulatorRelative for AngularLInfinityTriangulator {
    fn triangulate_relative(
        &self,
        relative_pose: CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<Point3<f64>> {
        let (center_b, b) = second_camera_in_first(relative_pose, b);
        let a = a.into_inner();
        let direction = center_b.try_normalize(1e-12)?;

        let sum = (a + b).cross(&direction);
        let difference = (a - b).cross(&direction);
        let n = if sum.norm_squared() > difference.norm_squared() {
            sum.normalize()
        } else {
            difference.normalize()
        };
        let a = (a - a.dot(&n) * n).normalize();
        let b = (b - b.dot(&n) * n).normalize();
        intersect_corrected(center_b, a, b)
    }
}

/// Inverse-depth weighted midpoint from "Triangulation: Why Optimize?" by Lee and Civera.
///
/// The closest points on both rays are blended with weights proportional to the inverse of
/// their depth, so the point moves towards the camera that observes it more closely.
#[derive(Copy, Clone, Debug, Default)]
pub struct InverseDepthWeightedTriangulator;

impl TriangulatorRelative for InverseDepthWeightedTriangulator {
    fn triangulate_relative(
        &self,
        relative_pose: CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<Point3<f64>> {
        let (center_b, b) = second_camera_in_first(relative_pose, b);
        let a = a.into_inner();
        let (depth_a, depth_b) = ray_depths(center_b, a, b)?;
        if depth_a <= 0.0 || depth_b <= 0.0 {
            return None;
        }
        let on_a = a * depth_a;
        let on_b = center_b + b * depth_b;
        let point = Point3::from((on_a * depth_b + on_b * depth_a) / (depth_a + depth_b));
        Some(point)
            .filter(is_finite)
            .filter(|p| p.coords.dot(&a) > 0.0 && (p.coords - center_b).dot(&b) > 0.0)
    }
}

/// The triangulation methods that can be selected in the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TriangulationMethod {
    DirectLinear,
    L1Angular,
    LInfinityAngular,
    InverseDepthWeighted,
    Default,
}

impl TriangulationMethod {
    pub const ALL: [TriangulationMethod; 5] = [
        TriangulationMethod::DirectLinear,
        TriangulationMethod::L1Angular,
        TriangulationMethod::LInfinityAngular,
        TriangulationMethod::InverseDepthWeighted,
        TriangulationMethod::Default,
    ];

    /// Resolves [`TriangulationMethod::Default`] to a concrete method.
    pub fn resolve(self) -> Self {
        match self {
            TriangulationMethod::Default => TriangulationMethod::InverseDepthWeighted,
            method => method,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TriangulationMethod::DirectLinear => "DIRECT_LINEAR",
            TriangulationMethod::L1Angular => "L1_ANGULAR",
            TriangulationMethod::LInfinityAngular => "LINFINITY_ANGULAR",
            TriangulationMethod::InverseDepthWeighted => "INVERSE_DEPTH_WEIGHTED",
            TriangulationMethod::Default => "DEFAULT",
        }
    }

    /// Triangulates a world point from posed observations.
    ///
    /// [`TriangulationMethod::DirectLinear`] uses every observation. The two-view methods use the
    /// pair of observations whose rays have the widest angle, preferring earlier observations
    /// on ties.
    pub fn triangulate(
        self,
        observations: &[(WorldToCamera, UnitVector3<f64>)],
    ) -> Option<Point3<f64>> {
        if observations.len() < 2 {
            return None;
        }
        let method = self.resolve();
        if method == TriangulationMethod::DirectLinear {
            return LinearEigenTriangulator::new()
                .triangulate_observations(observations.iter().copied());
        }

        let (i, j) = widest_pair(observations)?;
        let (pose_a, a) = observations[i];
        let (pose_b, b) = observations[j];
        let relative = pose_a.relative_to(pose_b);
        let local = match method {
            TriangulationMethod::L1Angular => AngularL1Triangulator.triangulate_relative(relative, a, b),
            TriangulationMethod::LInfinityAngular => {
                AngularLInfinityTriangulator.triangulate_relative(relative, a, b)
            }
            _ => InverseDepthWeightedTriangulator.triangulate_relative(relative, a, b),
        }?;
        Some(pose_a.inverse().transform(local))
    }
}

impl fmt::Display for TriangulationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TriangulationMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant::new("triangulation method", s))
    }
}

/// Index pair of the two observations whose world rays span the widest angle.
fn widest_pair(observations: &[(WorldToCamera, UnitVector3<f64>)]) -> Option<(usize, usize)> {
    let rays: Vec<Vector3<f64>> = observations
        .iter()
        .map(|&(pose, bearing)| pose.world_bearing(bearing).into_inner())
        .collect();
    let mut best: Option<(f64, usize, usize)> = None;
    for i in 0..rays.len() {
        for j in i + 1..rays.len() {
            let angle = angle_between(&rays[i], &rays[j]);
            if best.map_or(true, |(a, _, _)| angle > a) {
                best = Some((angle, i, j));
            }
        }
    }
    best.map(|(_, i, j)| (i, j))
}

/// The angle in radians between the rays from two optical centers to a point.
pub fn triangulation_angle(
    center_a: &Point3<f64>,
    center_b: &Point3<f64>,
    point: &Point3<f64>,
) -> f64 {
    angle_between(&(point - center_a), &(point - center_b))
}

fn is_finite(point: &Point3<f64>) -> bool {
    point.iter().all(|n| n.is_finite())
}

fn in_front_of_all(
    pairs: impl Iterator<Item = (WorldToCamera, UnitVector3<f64>)>,
    point: &Point3<f64>,
) -> bool {
    pairs
        .into_iter()
        .all(|(pose, bearing)| pose.transform(*point).coords.dot(&bearing) > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::Rotation3;

    fn scene() -> (Vec<WorldToCamera>, Point3<f64>) {
        let poses = vec![
            WorldToCamera::identity(),
            WorldToCamera::from_parts(
                Vector3::new(-0.5, 0.05, 0.02),
                Rotation3::from_euler_angles(0.01, 0.08, -0.02),
            ),
            WorldToCamera::from_parts(
                Vector3::new(-1.0, -0.1, 0.1),
                Rotation3::from_euler_angles(-0.02, 0.15, 0.01),
            ),
        ];
        (poses, Point3::new(0.4, -0.2, 5.0))
    }

    fn observe(poses: &[WorldToCamera], point: Point3<f64>) -> Vec<(WorldToCamera, UnitVector3<f64>)> {
        poses
            .iter()
            .map(|&pose| (pose, UnitVector3::new_normalize(pose.transform(point).coords)))
            .collect()
    }

    #[test]
    fn every_method_recovers_exact_point() {
        let (poses, point) = scene();
        let observations = observe(&poses, point);
        for method in TriangulationMethod::ALL {
            for count in 2..=3 {
                let triangulated = method.triangulate(&observations[..count]).unwrap();
                assert!(
                    (triangulated - point).norm() < 1e-6,
                    "{} with {} views gave {}",
                    method,
                    count,
                    triangulated
                );
            }
        }
    }

    #[test]
    fn points_behind_cameras_are_rejected() {
        let (poses, point) = scene();
        let observations: Vec<_> = observe(&poses, point)
            .into_iter()
            .map(|(pose, b)| (pose, UnitVector3::new_normalize(-b.into_inner())))
            .collect();
        for method in TriangulationMethod::ALL {
            assert!(method.triangulate(&observations).is_none(), "{}", method);
        }
    }

    #[test]
    fn parallel_rays_do_not_triangulate() {
        let pose = WorldToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity());
        let bearing = UnitVector3::new_normalize(Vector3::z());
        let observations = [(WorldToCamera::identity(), bearing), (pose, bearing)];
        for method in [
            TriangulationMethod::L1Angular,
            TriangulationMethod::LInfinityAngular,
            TriangulationMethod::InverseDepthWeighted,
        ] {
            assert!(method.triangulate(&observations).is_none());
        }
    }

    #[test]
    fn noisy_bearings_stay_close() {
        let (poses, point) = scene();
        let mut observations = observe(&poses, point);
        observations[1].1 =
            UnitVector3::new_normalize(observations[1].1.into_inner() + Vector3::new(1e-4, 0.0, 0.0));
        for method in TriangulationMethod::ALL {
            let triangulated = method.triangulate(&observations).unwrap();
            assert!((triangulated - point).norm() < 0.05, "{}", method);
        }
    }

    #[test]
    fn angle_of_symmetric_configuration() {
        let a = Point3::new(-1.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let p = Point3::new(0.0, 0.0, 1.0);
        let angle = triangulation_angle(&a, &b, &p);
        assert!((angle - core::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn names_parse() {
        for method in TriangulationMethod::ALL {
            assert_eq!(method.to_string().parse::<TriangulationMethod>().unwrap(), method);
        }
        assert!("MIDPOINT".parse::<TriangulationMethod>().is_err());
    }
}
