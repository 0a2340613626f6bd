use super::{in_front_of_camera, three};
use crate::polynomial::real_roots;
use arrayvec::ArrayVec;
use cv_core::{
    nalgebra::{Matrix3, Rotation3, Vector3},
    sample_consensus::Estimator,
    FeatureWorldMatch, Pose, WorldToCamera,
};

/// The P3P solver from "A Novel Parametrization of the Perspective-Three-Point Problem for a
/// Direct Computation of Absolute Camera Position and Orientation" by Laurent Kneip, Davide
/// Scaramuzza and Roland Siegwart, CVPR 2011.
///
/// The camera center and orientation are computed directly from a quartic in the cosine of the
/// angle between the plane of the first two points and the camera, without solving for the
/// depths first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KneipP3p;

impl KneipP3p {
    pub fn new() -> Self {
        Self
    }

    pub fn solve(&self, samples: [FeatureWorldMatch; 3]) -> ArrayVec<WorldToCamera, 4> {
        let mut poses = ArrayVec::new();
        let mut points = samples.map(|FeatureWorldMatch(_, p)| p.coords);
        let mut bearings = samples.map(|FeatureWorldMatch(b, _)| b.into_inner());

        if (points[1] - points[0]).cross(&(points[2] - points[0])).norm() == 0.0 {
            return poses;
        }

        // Intermediate camera frame with the first bearing as X and the first two in the XY plane.
        let camera_frame = |bearings: &[Vector3<f64>; 3]| -> Option<Matrix3<f64>> {
            let e1 = bearings[0];
            let e3 = bearings[0].cross(&bearings[1]).try_normalize(1e-12)?;
            let e2 = e3.cross(&e1);
            Some(Matrix3::from_rows(&[e1.transpose(), e2.transpose(), e3.transpose()]))
        };
        let mut t = match camera_frame(&bearings) {
            Some(t) => t,
            None => return poses,
        };
        let mut f3 = t * bearings[2];
        // The third bearing must lie on the negative Z side, swapping the first two points fixes it.
        if f3.z > 0.0 {
            bearings.swap(0, 1);
            points.swap(0, 1);
            t = match camera_frame(&bearings) {
                Some(t) => t,
                None => return poses,
            };
            f3 = t * bearings[2];
        }

        // Intermediate world frame with the first two points on X and the third in the XY plane.
        let n1 = (points[1] - points[0]).normalize();
        let n3 = n1.cross(&(points[2] - points[0])).normalize();
        let n2 = n3.cross(&n1);
        let n = Matrix3::from_rows(&[n1.transpose(), n2.transpose(), n3.transpose()]);
        let p3 = n * (points[2] - points[0]);

        let d12 = (points[1] - points[0]).norm();
        let f1 = f3.x / f3.z;
        let f2 = f3.y / f3.z;
        let p1 = p3.x;
        let p2 = p3.y;

        let cos_beta = bearings[0].dot(&bearings[1]);
        let b = (1.0 / (1.0 - cos_beta * cos_beta) - 1.0).sqrt().copysign(cos_beta);

        let f1_2 = f1 * f1;
        let f2_2 = f2 * f2;
        let p1_2 = p1 * p1;
        let p1_3 = p1_2 * p1;
        let p1_4 = p1_3 * p1;
        let p2_2 = p2 * p2;
        let p2_3 = p2_2 * p2;
        let p2_4 = p2_3 * p2;
        let d12_2 = d12 * d12;
        let b_2 = b * b;

        let factors = [
            -f2_2 * p2_4 - p2_4 * f1_2 - p2_4,
            2.0 * p2_3 * d12 * b + 2.0 * f2_2 * p2_3 * d12 * b - 2.0 * f2 * p2_3 * f1 * d12,
            -f2_2 * p2_2 * p1_2 - f2_2 * p2_2 * d12_2 * b_2 - f2_2 * p2_2 * d12_2
                + f2_2 * p2_4
                + p2_4 * f1_2
                + 2.0 * p1 * p2_2 * d12
                + 2.0 * f1 * f2 * p1 * p2_2 * d12 * b
                - p2_2 * p1_2 * f1_2
                + 2.0 * p1 * p2_2 * f2_2 * d12
                - p2_2 * d12_2 * b_2
                - 2.0 * p1_2 * p2_2,
            2.0 * p1_2 * p2 * d12 * b + 2.0 * f2 * p2_3 * f1 * d12
                - 2.0 * f2_2 * p2_3 * d12 * b
                - 2.0 * p1 * p2 * d12_2 * b,
            -2.0 * f2 * p2_2 * f1 * p1 * d12 * b + f2_2 * p2_2 * d12_2 + 2.0 * p1_3 * d12
                - p1_2 * d12_2
                + f2_2 * p2_2 * p1_2
                - p1_4
                - 2.0 * f2_2 * p2_2 * p1 * d12
                + p2_2 * f1_2 * p1_2
                + f2_2 * p2_2 * d12_2 * b_2,
        ];

        for cos_theta in real_roots(&factors) {
            if cos_theta.abs() > 1.0 {
                continue;
            }
            let cot_alpha = (-f1 * p1 / f2 - cos_theta * p2 + d12 * b)
                / (-f1 * cos_theta * p2 / f2 + p1 - d12);
            let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
            let sin_alpha = (1.0 / (cot_alpha * cot_alpha + 1.0)).sqrt();
            let cos_alpha = (1.0 - sin_alpha * sin_alpha).sqrt().copysign(cot_alpha);

            let along = d12 * (sin_alpha * b + cos_alpha);
            let center_local = Vector3::new(
                cos_alpha * along,
                cos_theta * sin_alpha * along,
                sin_theta * sin_alpha * along,
            );
            let center = points[0] + n.transpose() * center_local;

            #[rustfmt::skip]
            let q = Matrix3::new(
                -cos_alpha, -sin_alpha * cos_theta, -sin_alpha * sin_theta,
                sin_alpha,  -cos_alpha * cos_theta, -cos_alpha * sin_theta,
                0.0,        -sin_theta,             cos_theta,
            );
            // Orientation of the camera in the world.
            let camera_to_world = n.transpose() * q.transpose() * t;
            let rotation = Rotation3::from_matrix_unchecked(camera_to_world.transpose());
            let pose = WorldToCamera::from_parts(-(rotation * center), rotation);
            if pose.is_valid(1e-6) && in_front_of_camera(pose, &samples) && !poses.is_full() {
                poses.push(pose);
            }
        }
        poses
    }
}

impl Estimator<FeatureWorldMatch> for KneipP3p {
    type Model = WorldToCamera;
    type ModelIter = ArrayVec<WorldToCamera, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        three(data).map(|s| self.solve(s)).unwrap_or_default()
    }
}
