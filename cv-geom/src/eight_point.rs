use crate::EssentialMatrix;
use cv_core::{
    nalgebra::{Matrix3, SMatrix, SVector},
    sample_consensus::Estimator,
    FeatureMatch,
};

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley and Andrew Zisserman.
///
/// Any number of matches above eight can be given, in which case the linear least squares
/// solution over all of them is found. This makes it useful to re-fit an essential matrix to the
/// inliers of a consensus run. The result is not reconditioned, see
/// [`EssentialMatrix::recondition`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<EssentialMatrix>
    where
        I: Iterator<Item = FeatureMatch>,
    {
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        let mut count = 0;
        for FeatureMatch(a, b) in data {
            // bᵀ E a = 0 expressed over the column major entries of E.
            let mut row = SVector::<f64, 9>::zeros();
            for j in 0..3 {
                row.fixed_rows_mut::<3>(3 * j).copy_from(&(a[j] * b.into_inner()));
            }
            normal += row * row.transpose();
            count += 1;
        }
        if count < 8 {
            return None;
        }
        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let eigenvector = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        Some(EssentialMatrix(Matrix3::from_iterator(
            eigenvector.iter().copied(),
        )))
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch> for EightPoint {
    type Model = EssentialMatrix;
    type ModelIter = Option<EssentialMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(data)
            .and_then(|essential| essential.recondition(self.epsilon, self.iterations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::{
        nalgebra::{Point3, Rotation3, UnitVector3, Vector3},
        sample_consensus::Model,
        CameraToCamera, Pose,
    };
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    const SAMPLE_POINTS: usize = 16;
    const RESIDUAL_THRESHOLD: f64 = 1e-6;

    fn some_test_data(rng: &mut Pcg64) -> Vec<FeatureMatch> {
        let relative_pose = CameraToCamera::from_parts(
            Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
            Rotation3::new(Vector3::new(
                rng.gen_range(-0.4..0.4),
                rng.gen_range(-0.4..0.4),
                rng.gen_range(-0.4..0.4),
            )),
        );
        (0..SAMPLE_POINTS)
            .map(|_| {
                let a = Point3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(3.0..5.0),
                );
                let b = relative_pose.transform(a);
                FeatureMatch(
                    UnitVector3::new_normalize(a.coords),
                    UnitVector3::new_normalize(b.coords),
                )
            })
            .collect()
    }

    #[test]
    fn randomized() {
        let mut rng = Pcg64::seed_from_u64(8);
        let successes = (0..200)
            .filter(|_| {
                let matches = some_test_data(&mut rng);
                EightPoint::new()
                    .estimate(matches.iter().copied())
                    .map_or(false, |essential| {
                        matches
                            .iter()
                            .all(|m| essential.residual(m).abs() < RESIDUAL_THRESHOLD)
                    })
            })
            .count();
        assert!(successes > 190, "successes: {}", successes);
    }

    #[test]
    fn too_few_matches() {
        let mut rng = Pcg64::seed_from_u64(2);
        let matches = some_test_data(&mut rng);
        assert!(EightPoint::new().from_matches(matches.into_iter().take(7)).is_none());
    }
}
