use crate::{resection::LambdaTwist, FivePoint, TriangulationMethod};
use cv_core::{
    nalgebra::{Point3, UnitVector3},
    sample_consensus::{Estimator, Model},
    FeatureMatch, FeatureWorldMatch, Pose, TripletMatch, WorldToCamera,
};

/// The poses of three cameras in the frame of the first one.
///
/// The first pose is the identity and the second has a unit baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletPoses(pub [WorldToCamera; 3]);

impl TripletPoses {
    /// Triangulates the point seen by a triplet match from all three cameras.
    pub fn triangulate(&self, data: &TripletMatch) -> Option<Point3<f64>> {
        let observations = self.observations(data);
        TriangulationMethod::DirectLinear.triangulate(&observations)
    }

    fn observations(&self, data: &TripletMatch) -> [(WorldToCamera, UnitVector3<f64>); 3] {
        let TripletMatch(bearings) = *data;
        [
            (self.0[0], bearings[0]),
            (self.0[1], bearings[1]),
            (self.0[2], bearings[2]),
        ]
    }
}

/// The largest angular error over the three views of the triangulated point.
impl Model<TripletMatch> for TripletPoses {
    fn residual(&self, data: &TripletMatch) -> f64 {
        match self.triangulate(data) {
            Some(point) => self
                .observations(data)
                .iter()
                .map(|&(pose, bearing)| pose.residual(&FeatureWorldMatch(bearing, point)))
                .fold(0.0, f64::max),
            None => f64::INFINITY,
        }
    }
}

/// Minimal solver for the poses of three calibrated views.
///
/// The relative pose of the first two views comes from the five point algorithm. The five
/// sampled matches are then triangulated and the third view is resected from three of them
/// with [`LambdaTwist`]. Every combination of solutions is returned, for a consensus to choose.
#[derive(Copy, Clone, Debug, Default)]
pub struct TripletEstimator {
    pub five_point: FivePoint,
    pub p3p: LambdaTwist,
}

impl TripletEstimator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Estimator<TripletMatch> for TripletEstimator {
    type Model = TripletPoses;
    type ModelIter = Vec<TripletPoses>;
    const MIN_SAMPLES: usize = 5;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = TripletMatch> + Clone,
    {
        let sample: Vec<TripletMatch> = data.collect();
        let pairs = sample
            .iter()
            .map(|&TripletMatch(b)| FeatureMatch(b[0], b[1]));
        let mut models = Vec::new();
        for essential in self.five_point.from_matches(pairs.clone()) {
            let relative = match essential.pose_solver().solve_unanimous(pairs.clone()) {
                Some(relative) => relative,
                None => continue,
            };
            let first = WorldToCamera::identity();
            let second = WorldToCamera(relative.isometry());
            let world_matches: Vec<FeatureWorldMatch> = sample
                .iter()
                .filter_map(|&TripletMatch(b)| {
                    TriangulationMethod::InverseDepthWeighted
                        .triangulate(&[(first, b[0]), (second, b[1])])
                        .map(|point| FeatureWorldMatch(b[2], point))
                })
                .collect();
            if world_matches.len() < 3 {
                continue;
            }
            let p3p_sample = [world_matches[0], world_matches[1], world_matches[2]];
            for third in self.p3p.solve(p3p_sample) {
                models.push(TripletPoses([first, second, third]));
            }
        }
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Rotation3, Vector3};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn scene(rng: &mut Pcg64) -> ([WorldToCamera; 3], Vec<TripletMatch>) {
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera::from_parts(
                Vector3::new(-1.0, 0.0, 0.0),
                Rotation3::from_euler_angles(0.0, 0.05, 0.0),
            ),
            WorldToCamera::from_parts(
                Vector3::new(-1.6, 0.3, 0.2),
                Rotation3::from_euler_angles(0.02, 0.1, -0.03),
            ),
        ];
        let matches = (0..30)
            .map(|_| {
                let point = Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(5.0..9.0),
                );
                TripletMatch(poses.map(|pose| UnitVector3::new_normalize(pose.transform(point).coords)))
            })
            .collect();
        (poses, matches)
    }

    #[test]
    fn exact_sample_has_a_consistent_model() {
        let mut rng = Pcg64::seed_from_u64(3);
        let (_, matches) = scene(&mut rng);
        let models = TripletEstimator::new().estimate(matches.iter().take(5).copied());
        assert!(!models.is_empty());
        let best = models
            .iter()
            .map(|model| matches.iter().map(|m| model.residual(m)).fold(0.0, f64::max))
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-6, "best {}", best);
    }

    #[test]
    fn wrong_third_view_has_large_residual() {
        let mut rng = Pcg64::seed_from_u64(4);
        let (poses, matches) = scene(&mut rng);
        let wrong = TripletPoses([
            poses[0],
            poses[1],
            WorldToCamera::from_parts(Vector3::new(3.0, 0.0, 0.0), Rotation3::identity()),
        ]);
        assert!(matches.iter().all(|m| wrong.residual(m) > 1e-3));
    }
}
