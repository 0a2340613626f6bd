use super::in_front_of_camera;
use arrayvec::ArrayVec;
use cv_core::{
    nalgebra::{Matrix6, Rotation3, Vector3, Vector6},
    sample_consensus::Estimator,
    FeatureWorldMatch, Pose, WorldToCamera,
};

/// Upright P2P after "Closed-form solutions to minimal absolute pose problems with known vertical
/// direction" by Zuzana Kukelova, Martin Bujnak and Tomas Pajdla, ACCV 2010.
///
/// The Y axis of the camera is assumed to be aligned with the Y axis of the world, so only the
/// rotation about Y and the translation are unknown. Two matches are enough and up to two poses
/// are returned.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Up2p {
    epsilon: f64,
    max_iterations: usize,
}

impl Up2p {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solve(&self, samples: [FeatureWorldMatch; 2]) -> ArrayVec<WorldToCamera, 2> {
        let mut poses = ArrayVec::new();
        // Unknowns are (cos θ, sin θ, tx, ty, tz, 1). Each match gives b × (R X + t) = 0.
        let mut system = Matrix6::zeros();
        for (ix, FeatureWorldMatch(bearing, point)) in samples.iter().enumerate() {
            let (b1, b2, b3) = (bearing.x, bearing.y, bearing.z);
            let (x1, x2, x3) = (point.x, point.y, point.z);
            let rows = [
                [b2 * x3, -b2 * x1, 0.0, -b3, b2, -b3 * x2],
                [b3 * x1 - b1 * x3, b3 * x3 + b1 * x1, b3, 0.0, -b1, 0.0],
                [-b2 * x1, -b2 * x3, -b2, b1, 0.0, b1 * x2],
            ];
            for (r, row) in rows.iter().enumerate() {
                for (c, &value) in row.iter().enumerate() {
                    system[(3 * ix + r, c)] = value;
                }
            }
        }

        let svd = match system.try_svd(false, true, self.epsilon, self.max_iterations) {
            Some(svd) => svd,
            None => return poses,
        };
        let v_t = match svd.v_t {
            Some(v_t) => v_t,
            None => return poses,
        };
        let mut order = [0, 1, 2, 3, 4, 5];
        order.sort_unstable_by_key(|&ix| float_ord::FloatOrd(svd.singular_values[ix]));
        let mut first: Vector6<f64> = v_t.row(order[0]).transpose();
        let mut second: Vector6<f64> = v_t.row(order[1]).transpose();
        if first[5].abs() < second[5].abs() {
            core::mem::swap(&mut first, &mut second);
        }
        if first[5].abs() < 1e-12 {
            return poses;
        }

        // z = α first + β second with z[5] = 1, leaving cos² + sin² = 1 as a quadratic in β.
        let base = first / first[5];
        let direction = second - base * second[5];
        let a = direction[0] * direction[0] + direction[1] * direction[1];
        let b = 2.0 * (base[0] * direction[0] + base[1] * direction[1]);
        let c = base[0] * base[0] + base[1] * base[1] - 1.0;
        let betas: ArrayVec<f64, 2> = if a.abs() < 1e-14 {
            if b.abs() < 1e-14 {
                return poses;
            }
            [-c / b].into_iter().collect()
        } else {
            let discriminant = b * b - 4.0 * a * c;
            if discriminant < 0.0 {
                return poses;
            }
            let root = discriminant.sqrt();
            [(-b + root) / (2.0 * a), (-b - root) / (2.0 * a)]
                .into_iter()
                .collect()
        };

        for beta in betas {
            let z = base + direction * beta;
            let angle = z[1].atan2(z[0]);
            let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
            let pose = WorldToCamera::from_parts(Vector3::new(z[2], z[3], z[4]), rotation);
            if in_front_of_camera(pose, &samples) {
                poses.push(pose);
            }
        }
        poses
    }
}

impl Default for Up2p {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl Estimator<FeatureWorldMatch> for Up2p {
    type Model = WorldToCamera;
    type ModelIter = ArrayVec<WorldToCamera, 2>;
    const MIN_SAMPLES: usize = 2;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        match (data.next(), data.next()) {
            (Some(a), Some(b)) => self.solve([a, b]),
            _ => ArrayVec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Point3, UnitVector3};

    #[test]
    fn upright_pose_is_recovered() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.3, -0.2, 1.5),
            Rotation3::from_axis_angle(&Vector3::y_axis(), 0.7),
        );
        let samples = [Point3::new(0.2, 0.1, 3.0), Point3::new(-0.6, 0.4, 4.0)].map(|camera| {
            FeatureWorldMatch(
                UnitVector3::new_normalize(camera.coords),
                pose.inverse().transform(camera),
            )
        });
        let poses = Up2p::new().solve(samples);
        assert!(poses
            .iter()
            .any(|p| (p.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-8));
    }
}
