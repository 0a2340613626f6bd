use cv_core::sample_consensus::{Consensus, Estimator, Model};
use rand::{seq::index::sample, Rng};

/// The result of an [`AcRansac`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct AcRansacResult<M> {
    /// The most meaningful model.
    pub model: M,
    /// Indices of the inliers, sorted ascending.
    pub inliers: Vec<usize>,
    /// The inlier threshold chosen from the data, in the unit of the scaled residual (pixels).
    pub threshold: f64,
    /// `log10` of the number of false alarms of the model. Always negative.
    pub log_nfa: f64,
}

/// A-contrario RANSAC from Moisan, Moulon and Monasse, "Automatic Homographic Registration of a
/// Pair of Images, with A Contrario Elimination of Outliers".
///
/// Instead of a fixed inlier threshold, every hypothesis is scored by its number of false
/// alarms (NFA): the expected number of models that would explain as many matches with the same
/// precision if the matches were random. The inlier count and threshold minimizing the NFA are
/// selected, and a model is only accepted if its NFA is below one.
///
/// Residuals of the estimator models are multiplied by `error_scale` before being squared. For
/// angular residuals the focal length in pixels turns them into pixel errors.
#[derive(Debug, Clone)]
pub struct AcRansac<R> {
    rng: R,
    max_iterations: usize,
    log_alpha0: f64,
    error_multiplier: f64,
    error_scale: f64,
    max_threshold: f64,
}

impl<R> AcRansac<R>
where
    R: Rng,
{
    /// For models whose residual is a distance to a point, such as a reprojection.
    ///
    /// `width` and `height` give the area of the image in which errors are measured.
    pub fn point_to_point(rng: R, width: f64, height: f64, error_scale: f64) -> Self {
        Self::with_alpha(
            rng,
            (core::f64::consts::PI / (width * height)).log10(),
            1.0,
            error_scale,
        )
    }

    /// For models whose residual is a distance to a line, such as an epipolar line.
    pub fn point_to_line(rng: R, width: f64, height: f64, error_scale: f64) -> Self {
        let diagonal = width.hypot(height);
        Self::with_alpha(
            rng,
            (2.0 * diagonal / (width * height)).log10(),
            0.5,
            error_scale,
        )
    }

    fn with_alpha(rng: R, log_alpha0: f64, error_multiplier: f64, error_scale: f64) -> Self {
        Self {
            rng,
            max_iterations: 1024,
            log_alpha0,
            error_multiplier,
            error_scale,
            max_threshold: f64::INFINITY,
        }
    }

    /// Number of hypotheses to draw. A tenth of them is reserved for refining the best model
    /// by sampling only among its inliers.
    ///
    /// Default is `1024`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// The largest threshold (in scaled residual units) that may be selected.
    ///
    /// Default is unbounded.
    #[must_use]
    pub fn max_threshold(self, max_threshold: f64) -> Self {
        Self {
            max_threshold,
            ..self
        }
    }

    /// Consumes the consensus and returns the random number generator.
    pub fn into_rng(self) -> R {
        self.rng
    }

    /// Runs the a-contrario estimation on the data.
    ///
    /// Returns `None` if there are not more samples than the minimal sample size or no model
    /// reaches an NFA below one.
    pub fn estimate<E, Data>(&mut self, estimator: &E, data: &[Data]) -> Option<AcRansacResult<E::Model>>
    where
        E: Estimator<Data>,
        Data: Clone,
    {
        let n = data.len();
        let k_min = E::MIN_SAMPLES;
        if n <= k_min || self.max_iterations == 0 {
            return None;
        }

        let log_combi_n: Vec<f64> = (0..=n).map(|k| log_combinations(n, k)).collect();
        let log_combi_k: Vec<f64> = (0..=n).map(|k| log_combinations(k, k_min)).collect();
        let max_squared = self.max_threshold * self.max_threshold;
        let reserve = (self.max_iterations / 10).max(1).min(self.max_iterations);
        let main_iterations = self.max_iterations - reserve;

        let mut best: Option<AcRansacResult<E::Model>> = None;
        let mut errors: Vec<(f64, usize)> = Vec::with_capacity(n);

        for iteration in 0..self.max_iterations {
            let refining = iteration >= main_iterations;
            // Inliers always outnumber the minimal sample.
            let pool: Vec<usize> = match (&best, refining) {
                (Some(best), true) => best.inliers.clone(),
                _ => (0..n).collect(),
            };
            let indices = sample(&mut self.rng, pool.len(), k_min).into_vec();
            let models: Vec<E::Model> = estimator
                .estimate(indices.iter().map(|&ix| data[pool[ix]].clone()))
                .into_iter()
                .collect();
            if models.is_empty() {
                continue;
            }
            let log_e0 = ((models.len() * (n - k_min)) as f64).log10();

            for model in models {
                errors.clear();
                errors.extend(data.iter().enumerate().map(|(ix, datum)| {
                    let scaled = model.residual(datum) * self.error_scale;
                    let squared = scaled * scaled;
                    (if squared.is_nan() { f64::INFINITY } else { squared }, ix)
                }));
                errors.sort_unstable_by(|a, b| {
                    a.0.partial_cmp(&b.0)
                        .unwrap_or(core::cmp::Ordering::Equal)
                        .then(a.1.cmp(&b.1))
                });

                let mut model_best: Option<(f64, usize)> = None;
                for k in k_min + 1..=n {
                    let error = errors[k - 1].0;
                    if !error.is_finite() || error > max_squared {
                        break;
                    }
                    let log_alpha = self.log_alpha0
                        + self.error_multiplier * (error + f64::from(f32::EPSILON)).log10();
                    let log_nfa = log_e0
                        + log_alpha * (k - k_min) as f64
                        + log_combi_n[k]
                        + log_combi_k[k];
                    if model_best.map_or(true, |(nfa, _)| log_nfa < nfa) {
                        model_best = Some((log_nfa, k));
                    }
                }

                if let Some((log_nfa, k)) = model_best {
                    let improves = best.as_ref().map_or(log_nfa < 0.0, |b| log_nfa < b.log_nfa);
                    if improves {
                        let mut inliers: Vec<usize> = errors[..k].iter().map(|&(_, ix)| ix).collect();
                        inliers.sort_unstable();
                        best = Some(AcRansacResult {
                            model,
                            inliers,
                            threshold: errors[k - 1].0.sqrt(),
                            log_nfa,
                        });
                    }
                }
            }
        }

        if let Some(result) = &best {
            log::trace!(
                "a-contrario consensus: {} of {} inliers, threshold {:.3}, log10(NFA) {:.2}",
                result.inliers.len(),
                n,
                result.threshold,
                result.log_nfa
            );
        }
        best
    }
}

/// `log10` of the binomial coefficient `C(n, k)`. Zero when `k > n`.
fn log_combinations(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k)
        .map(|i| ((n - i) as f64).log10() - ((i + 1) as f64).log10())
        .sum()
}

impl<E, R, Data> Consensus<E, Data> for AcRansac<R>
where
    E: Estimator<Data>,
    R: Rng,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        self.estimate(estimator, &data).map(|result| result.model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        self.estimate(estimator, &data)
            .map(|result| (result.model, result.inliers))
    }
}

/// RANSAC with a fixed threshold and a fixed number of iterations.
///
/// The model with the most inliers wins, ties go to the earliest hypothesis.
#[derive(Debug, Clone)]
pub struct MaxConsensus<R> {
    rng: R,
    threshold: f64,
    max_iterations: usize,
}

impl<R> MaxConsensus<R>
where
    R: Rng,
{
    /// `threshold` is compared against the raw model residual.
    pub fn new(rng: R, threshold: f64) -> Self {
        Self {
            rng,
            threshold,
            max_iterations: 1024,
        }
    }

    /// Default is `1024`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    pub fn estimate<E, Data>(&mut self, estimator: &E, data: &[Data]) -> Option<(E::Model, Vec<usize>)>
    where
        E: Estimator<Data>,
        Data: Clone,
    {
        let n = data.len();
        if n < E::MIN_SAMPLES {
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>)> = None;
        for _ in 0..self.max_iterations {
            let indices = sample(&mut self.rng, n, E::MIN_SAMPLES).into_vec();
            for model in estimator.estimate(indices.iter().map(|&ix| data[ix].clone())) {
                let inliers: Vec<usize> = data
                    .iter()
                    .enumerate()
                    .filter(|(_, datum)| model.residual(datum) < self.threshold)
                    .map(|(ix, _)| ix)
                    .collect();
                if inliers.len() >= E::MIN_SAMPLES
                    && best.as_ref().map_or(true, |(_, b)| inliers.len() > b.len())
                {
                    best = Some((model, inliers));
                }
            }
        }
        best
    }
}

impl<E, R, Data> Consensus<E, Data> for MaxConsensus<R>
where
    E: Estimator<Data>,
    R: Rng,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        self.estimate(estimator, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    /// A line through the origin `y = slope x`, the residual is the vertical distance.
    #[derive(Debug, Clone, Copy)]
    struct Slope(f64);

    impl Model<(f64, f64)> for Slope {
        fn residual(&self, &(x, y): &(f64, f64)) -> f64 {
            (y - self.0 * x).abs()
        }
    }

    struct SlopeEstimator;

    impl Estimator<(f64, f64)> for SlopeEstimator {
        type Model = Slope;
        type ModelIter = ArrayVec<Slope, 1>;
        const MIN_SAMPLES: usize = 1;

        fn estimate<I>(&self, mut data: I) -> Self::ModelIter
        where
            I: Iterator<Item = (f64, f64)> + Clone,
        {
            let mut models = ArrayVec::new();
            if let Some((x, y)) = data.next() {
                if x.abs() > 1e-9 {
                    models.push(Slope(y / x));
                }
            }
            models
        }
    }

    fn data(rng: &mut Pcg64) -> Vec<(f64, f64)> {
        let mut data: Vec<(f64, f64)> = (0..80)
            .map(|_| {
                let x = rng.gen_range(-50.0..50.0);
                (x, 2.0 * x + rng.gen_range(-0.5..0.5))
            })
            .collect();
        data.extend((0..40).map(|_| (rng.gen_range(-50.0..50.0), rng.gen_range(-100.0..100.0))));
        data
    }

    #[test]
    fn combinations() {
        assert!((log_combinations(5, 2) - 10f64.log10()).abs() < 1e-12);
        assert_eq!(log_combinations(3, 0), 0.0);
        assert!((log_combinations(10, 7) - 120f64.log10()).abs() < 1e-12);
    }

    #[test]
    fn a_contrario_finds_line_and_threshold() {
        let mut rng = Pcg64::seed_from_u64(0);
        let data = data(&mut rng);
        let mut consensus = AcRansac::point_to_line(Pcg64::seed_from_u64(1), 100.0, 200.0, 1.0)
            .max_iterations(200);
        let result = consensus.estimate(&SlopeEstimator, &data).unwrap();
        assert!((result.model.0 - 2.0).abs() < 0.05);
        assert!(result.log_nfa < 0.0);
        assert!(result.threshold < 5.0);
        let true_inliers = result.inliers.iter().filter(|&&ix| ix < 80).count();
        assert!(true_inliers >= 70);
        assert!(result.inliers.len() - true_inliers <= 10);
    }

    #[test]
    fn a_contrario_is_deterministic() {
        let mut rng = Pcg64::seed_from_u64(0);
        let data = data(&mut rng);
        let run = || {
            AcRansac::point_to_line(Pcg64::seed_from_u64(5), 100.0, 200.0, 1.0)
                .max_iterations(100)
                .estimate(&SlopeEstimator, &data)
                .unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.threshold, b.threshold);
    }

    #[test]
    fn a_contrario_respects_max_threshold() {
        let mut rng = Pcg64::seed_from_u64(2);
        let data = data(&mut rng);
        let result = AcRansac::point_to_line(Pcg64::seed_from_u64(1), 100.0, 200.0, 1.0)
            .max_threshold(0.25)
            .estimate(&SlopeEstimator, &data);
        if let Some(result) = result {
            assert!(result.threshold <= 0.25);
        }
    }

    #[test]
    fn a_contrario_rejects_pure_noise() {
        let mut rng = Pcg64::seed_from_u64(9);
        let data: Vec<(f64, f64)> = (0..60)
            .map(|_| (rng.gen_range(-50.0..50.0), rng.gen_range(-100.0..100.0)))
            .collect();
        let result = AcRansac::point_to_line(Pcg64::seed_from_u64(1), 100.0, 200.0, 1.0)
            .max_iterations(200)
            .estimate(&SlopeEstimator, &data);
        assert!(result.is_none());
    }

    #[test]
    fn too_little_data() {
        let result = AcRansac::point_to_line(Pcg64::seed_from_u64(1), 10.0, 10.0, 1.0)
            .estimate(&SlopeEstimator, &[(1.0, 2.0)]);
        assert!(result.is_none());
    }

    #[test]
    fn max_consensus_counts_inliers() {
        let mut rng = Pcg64::seed_from_u64(0);
        let data = data(&mut rng);
        let (model, inliers) = MaxConsensus::new(Pcg64::seed_from_u64(3), 0.6)
            .max_iterations(50)
            .estimate(&SlopeEstimator, &data)
            .unwrap();
        assert!((model.0 - 2.0).abs() < 0.05);
        assert!(inliers.len() >= 80);
    }
}
