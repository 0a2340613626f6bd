//! Essential matrices and their decomposition into relative poses.

use crate::triangulation::ray_depths;
use cv_core::{
    nalgebra::{Matrix3, Rotation3, Vector3, SVD},
    sample_consensus::Model,
    CameraToCamera, FeatureMatch, Pose,
};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};

/// The essential matrix `E = [t]x R` of a relative pose.
///
/// For a match `(a, b)` the epipolar constraint `bᵀ E a = 0` holds, where `a` is a bearing in
/// camera A and `b` the bearing of the same point in camera B.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl From<CameraToCamera> for EssentialMatrix {
    fn from(pose: CameraToCamera) -> Self {
        let isometry = pose.isometry();
        Self(isometry.translation.vector.cross_matrix() * isometry.rotation.matrix())
    }
}

/// Symmetric angle in radians between each bearing and the epipolar plane induced by the other.
impl Model<FeatureMatch> for EssentialMatrix {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        let &FeatureMatch(a, b) = data;
        let (a, b) = (a.into_inner(), b.into_inner());
        let normal_b = self.0 * a;
        let normal_a = self.0.transpose() * b;
        plane_angle(&normal_b, &b).max(plane_angle(&normal_a, &a))
    }
}

fn plane_angle(normal: &Vector3<f64>, bearing: &Vector3<f64>) -> f64 {
    let norm = normal.norm();
    if !norm.is_finite() || norm < 1e-300 {
        return f64::INFINITY;
    }
    (normal.dot(bearing) / norm).abs().min(1.0).asin()
}

impl EssentialMatrix {
    /// Projects the matrix onto the essential manifold: two equal singular values and one zero.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let old_svd = self.try_svd(true, true, epsilon, max_iterations)?;
        let mut sources: [usize; 3] = [0, 1, 2];
        sources.sort_unstable_by(|&a, &b| {
            old_svd.singular_values[b]
                .partial_cmp(&old_svd.singular_values[a])
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        let mut svd = old_svd;
        for (dest, &source) in sources.iter().enumerate() {
            svd.singular_values[dest] = old_svd.singular_values[source];
            svd.u
                .as_mut()?
                .column_mut(dest)
                .copy_from(&old_svd.u.as_ref()?.column(source));
            svd.v_t
                .as_mut()?
                .row_mut(dest)
                .copy_from(&old_svd.v_t.as_ref()?.row(source));
        }
        let mean = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = mean;
        svd.singular_values[1] = mean;
        svd.singular_values[2] = 0.0;
        svd.recompose().ok().map(Self)
    }

    /// The four relative poses consistent with this matrix, with unit translation.
    ///
    /// Only one of them places the observed points in front of both cameras, use
    /// [`EssentialMatrix::pose_solver`] to pick it.
    pub fn possible_poses(&self, epsilon: f64, max_iterations: usize) -> Option<[CameraToCamera; 4]> {
        let svd = SVD::try_new(self.0, true, true, epsilon, max_iterations)?;
        let mut u = svd.u?;
        let mut v_t = svd.v_t?;
        // Keep the rotations proper, flipping the sign of E does not change the constraint.
        if u.determinant() < 0.0 {
            u = -u;
        }
        if v_t.determinant() < 0.0 {
            v_t = -v_t;
        }
        // The null direction of E is the last column of U only if singular values are sorted.
        let null = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| ix)?;
        let order = match null {
            0 => [1, 2, 0],
            1 => [2, 0, 1],
            _ => [0, 1, 2],
        };
        let u = Matrix3::from_columns(&[u.column(order[0]), u.column(order[1]), u.column(order[2])]);
        let v_t = Matrix3::from_rows(&[v_t.row(order[0]), v_t.row(order[1]), v_t.row(order[2])]);
        // The cyclic permutation keeps both determinants positive.
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let rotation_a = Rotation3::from_matrix_unchecked(u * w * v_t);
        let rotation_b = Rotation3::from_matrix_unchecked(u * w.transpose() * v_t);
        let t: Vector3<f64> = u.column(2).into_owned();
        Some([
            CameraToCamera::from_parts(t, rotation_a),
            CameraToCamera::from_parts(-t, rotation_a),
            CameraToCamera::from_parts(t, rotation_b),
            CameraToCamera::from_parts(-t, rotation_b),
        ])
    }

    /// Creates a solver that picks the pose placing the most matches in front of both cameras.
    pub fn pose_solver(&self) -> PoseSolver<'_> {
        PoseSolver {
            essential: self,
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

/// Disambiguates the four decompositions of an [`EssentialMatrix`] with chirality.
#[derive(Copy, Clone, Debug)]
pub struct PoseSolver<'a> {
    essential: &'a EssentialMatrix,
    epsilon: f64,
    max_iterations: usize,
}

impl<'a> PoseSolver<'a> {
    /// Set the epsilon used in the SVD solver.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the SVD solver.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Returns the pose with the most matches in front of both cameras and that count.
    ///
    /// Ties go to the earliest pose of [`EssentialMatrix::possible_poses`]. Returns `None` if no
    /// pose has any match in front, or if the decomposition fails.
    pub fn solve_counted<I>(&self, matches: I) -> Option<(CameraToCamera, usize)>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        let poses = self
            .essential
            .possible_poses(self.epsilon, self.max_iterations)?;
        let mut best: Option<(CameraToCamera, usize)> = None;
        for pose in poses {
            let count = matches.clone().filter(|m| in_front(pose, m)).count();
            if count > 0 && best.map_or(true, |(_, c)| count > c) {
                best = Some((pose, count));
            }
        }
        best
    }

    /// Same as [`PoseSolver::solve_counted`] without the count.
    pub fn solve<I>(&self, matches: I) -> Option<CameraToCamera>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.solve_counted(matches).map(|(pose, _)| pose)
    }

    /// Only accepts a pose that places every match in front of both cameras.
    pub fn solve_unanimous<I>(&self, matches: I) -> Option<CameraToCamera>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        let total = matches.clone().count();
        self.solve_counted(matches)
            .filter(|&(_, count)| count == total)
            .map(|(pose, _)| pose)
    }
}

/// Checks that the point seen through a match lies in front of both cameras of `pose`.
pub fn in_front(pose: CameraToCamera, data: &FeatureMatch) -> bool {
    let &FeatureMatch(a, b) = data;
    let inverse = pose.inverse().isometry();
    let center_b = inverse.translation.vector;
    let b_in_a = inverse.rotation * b.into_inner();
    match ray_depths(center_b, a.into_inner(), b_in_a) {
        Some((depth_a, depth_b)) => depth_a > 0.0 && depth_b > 0.0,
        None => false,
    }
}

/// A relative pose whose residual also enforces chirality.
///
/// Matches that the pose would triangulate behind either camera get an infinite residual, so
/// they can never be counted as inliers.
#[derive(Debug, Clone, Copy, PartialEq, From, Into)]
pub struct OrientedPose(pub CameraToCamera);

impl Model<FeatureMatch> for OrientedPose {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        if in_front(self.0, data) {
            self.0.residual(data)
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{Point3, UnitVector3};

    fn relative() -> CameraToCamera {
        CameraToCamera::from_parts(
            Vector3::new(-0.8, 0.1, 0.05).normalize(),
            Rotation3::from_euler_angles(0.02, 0.1, -0.03),
        )
    }

    fn matches(pose: CameraToCamera) -> Vec<FeatureMatch> {
        [
            Point3::new(0.1, 0.2, 4.0),
            Point3::new(-0.5, 0.3, 5.0),
            Point3::new(0.7, -0.4, 3.5),
            Point3::new(0.0, 0.0, 6.0),
        ]
        .iter()
        .map(|&p| {
            FeatureMatch(
                UnitVector3::new_normalize(p.coords),
                UnitVector3::new_normalize(pose.transform(p).coords),
            )
        })
        .collect()
    }

    #[test]
    fn epipolar_constraint_holds() {
        let pose = relative();
        let essential = EssentialMatrix::from(pose);
        for m in matches(pose) {
            assert!(essential.residual(&m) < 1e-12);
        }
    }

    #[test]
    fn decomposition_recovers_pose() {
        let pose = relative();
        let essential = EssentialMatrix::from(pose);
        let data = matches(pose);
        let solved = essential
            .pose_solver()
            .solve_unanimous(data.iter().copied())
            .unwrap();
        assert_relative_eq!(
            solved.0.to_homogeneous(),
            pose.0.to_homogeneous(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn recondition_keeps_constraint() {
        let pose = relative();
        let mut essential = EssentialMatrix::from(pose);
        essential.0[(0, 0)] += 1e-4;
        let fixed = essential.recondition(1e-12, 1000).unwrap();
        let svd = fixed.0.svd(false, false);
        let mut values: Vec<f64> = svd.singular_values.iter().copied().collect();
        values.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_relative_eq!(values[0], values[1], epsilon = 1e-9);
        assert!(values[2].abs() < 1e-9);
    }

    #[test]
    fn oriented_pose_rejects_points_behind() {
        let pose = relative();
        let m = matches(pose)[0];
        assert!(OrientedPose(pose).residual(&m) < 1e-12);
        let flipped = FeatureMatch(
            UnitVector3::new_normalize(-m.0.into_inner()),
            UnitVector3::new_normalize(-m.1.into_inner()),
        );
        // Still on the epipolar plane, but behind both cameras.
        assert!(pose.residual(&flipped) < 1e-9);
        assert!(OrientedPose(pose).residual(&flipped).is_infinite());
    }
}
