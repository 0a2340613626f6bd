use crate::{
    derive_seed, problem::Problem, MatchConstraint, Reconstruction, ResectionFailure, SfmSettings,
};
use cv_core::{
    nalgebra::{Point2, Point3},
    sample_consensus::{Estimator, Model},
    CameraIntrinsics, FeatureWorldMatch, PixelWorldMatch, ViewId, WorldToCamera,
};
use cv_geom::{
    resection::{Dlt6Points, EPnP, KeP3p, KneipP3p, LambdaTwist, ProjectiveDlt, Up2p},
    AcRansac, ResectionMethod,
};
use cv_optimize::PoseRefiner;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Linear calibration needs more support than a minimal pose solver.
const MIN_UNCALIBRATED_INLIERS: usize = 15;

/// A view localized against the landmarks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resection {
    pub view: ViewId,
    pub pose: WorldToCamera,
    /// Either the calibration the view already had, or the one estimated from the projection.
    pub intrinsics: CameraIntrinsics,
    /// Whether the intrinsics were known before the resection.
    pub calibrated: bool,
    pub inliers: usize,
    /// The a-contrario noise estimate in pixels, at most `max_noise_px`. It is raised to
    /// `min_threshold_px` when the view is registered.
    pub threshold: f64,
}

/// The outcome of one view of a batch, with the number of landmarks the view saw.
pub(crate) type BatchResult = (ViewId, usize, Result<Resection, ResectionFailure>);

/// A camera that only explains points in front of it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrientedCamera(WorldToCamera);

impl Model<FeatureWorldMatch> for OrientedCamera {
    fn residual(&self, data: &FeatureWorldMatch) -> f64 {
        if self.0.depth(data.1) > 0.0 {
            self.0.residual(data)
        } else {
            f64::INFINITY
        }
    }
}

/// Wraps a pose estimator so that its hypotheses are scored with a chirality check.
struct Oriented<'a, E>(&'a E);

impl<'a, E> Estimator<FeatureWorldMatch> for Oriented<'a, E>
where
    E: Estimator<FeatureWorldMatch, Model = WorldToCamera>,
{
    type Model = OrientedCamera;
    type ModelIter = Vec<OrientedCamera>;
    const MIN_SAMPLES: usize = E::MIN_SAMPLES;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        self.0.estimate(data).into_iter().map(OrientedCamera).collect()
    }
}

struct Robust {
    pose: WorldToCamera,
    inliers: Vec<usize>,
    threshold: f64,
}

fn robust<E>(
    estimator: &E,
    constraint: MatchConstraint,
    consensus: &mut AcRansac<Xoshiro256PlusPlus>,
    data: &[FeatureWorldMatch],
) -> Option<Robust>
where
    E: Estimator<FeatureWorldMatch, Model = WorldToCamera>,
{
    match constraint {
        MatchConstraint::Orientation => {
            consensus
                .estimate(&Oriented(estimator), data)
                .map(|result| Robust {
                    pose: result.model.0,
                    inliers: result.inliers,
                    threshold: result.threshold,
                })
        }
        MatchConstraint::Unconstrained => consensus.estimate(estimator, data).map(|result| Robust {
            pose: result.model,
            inliers: result.inliers,
            threshold: result.threshold,
        }),
    }
}

fn check_support(robust: &Robust, needed: usize) -> Result<(), ResectionFailure> {
    if robust.inliers.len() < needed {
        return Err(ResectionFailure::TooFewInliers {
            found: robust.inliers.len(),
            needed,
        });
    }
    Ok(())
}

impl Problem {
    /// The pixels of a view matched to the landmarks of its tracks.
    fn correspondences(
        &self,
        reconstruction: &Reconstruction,
        view: ViewId,
    ) -> Vec<(Point2<f64>, Point3<f64>)> {
        self.visibility
            .triangulated(view, reconstruction)
            .filter_map(|id| {
                let observation = self.tracks.get(id)?.get(view)?;
                let landmark = reconstruction.landmarks.get(&id)?;
                Some((observation.pixel, landmark.point))
            })
            .collect()
    }

    /// Localizes a view against the landmarks of the reconstruction.
    ///
    /// Views with known intrinsics are resected with the configured solver on bearings. Views
    /// without are resected with a projective DLT on pixels, which also yields their calibration.
    /// In both cases the pose is then polished on the inliers.
    pub(crate) fn resect(
        &self,
        reconstruction: &Reconstruction,
        view: ViewId,
        seed: u64,
    ) -> Result<Resection, ResectionFailure> {
        let settings = &self.settings;
        let (width, height) = self
            .views
            .get(&view)
            .map(|info| info.dimensions())
            .ok_or(ResectionFailure::NoConsensus)?;
        let correspondences = self.correspondences(reconstruction, view);
        let rng = Xoshiro256PlusPlus::seed_from_u64(seed);

        let calibration = self.intrinsics(reconstruction, view);
        let (pose, intrinsics, inliers, threshold) = match calibration {
            Some(intrinsics) => {
                let method = settings.resection_method.resolve(true);
                let needed = settings
                    .min_resection_inliers
                    .max((2.5 * method.min_samples(true) as f64).ceil() as usize);
                if correspondences.len() < needed {
                    return Err(ResectionFailure::TooFewCorrespondences {
                        found: correspondences.len(),
                        needed,
                    });
                }
                let data: Vec<FeatureWorldMatch> = correspondences
                    .iter()
                    .map(|&(pixel, point)| FeatureWorldMatch(intrinsics.bearing(pixel), point))
                    .collect();
                let mut consensus = AcRansac::point_to_point(rng, width, height, intrinsics.focal)
                    .max_iterations(settings.ac_ransac_iterations)
                    .max_threshold(settings.max_noise_px);
                let constraint = settings.match_constraint;
                let consensus = &mut consensus;
                let robust = match method {
                    ResectionMethod::P3pKe | ResectionMethod::Default => {
                        robust(&KeP3p::new(), constraint, consensus, &data)
                    }
                    ResectionMethod::P3pKneip => robust(&KneipP3p::new(), constraint, consensus, &data),
                    ResectionMethod::P3pNordberg => {
                        robust(&LambdaTwist::new(), constraint, consensus, &data)
                    }
                    ResectionMethod::Up2pKukelova => robust(&Up2p::new(), constraint, consensus, &data),
                    ResectionMethod::Epnp => robust(&EPnP::new(), constraint, consensus, &data),
                    ResectionMethod::Dlt6Points => robust(&Dlt6Points, constraint, consensus, &data),
                }
                .ok_or(ResectionFailure::NoConsensus)?;
                check_support(&robust, needed)?;
                (robust.pose, intrinsics, robust.inliers, robust.threshold)
            }
            None => {
                let needed = settings.min_resection_inliers.max(MIN_UNCALIBRATED_INLIERS);
                if correspondences.len() < needed {
                    return Err(ResectionFailure::TooFewCorrespondences {
                        found: correspondences.len(),
                        needed,
                    });
                }
                let data: Vec<PixelWorldMatch> = correspondences
                    .iter()
                    .map(|&(pixel, point)| PixelWorldMatch(pixel, point))
                    .collect();
                let result = AcRansac::point_to_point(rng, width, height, 1.0)
                    .max_iterations(settings.ac_ransac_iterations)
                    .max_threshold(settings.max_noise_px)
                    .estimate(&ProjectiveDlt, &data)
                    .ok_or(ResectionFailure::NoConsensus)?;
                let (calibration, pose) = result
                    .model
                    .decompose()
                    .ok_or(ResectionFailure::Decomposition)?;
                let robust = Robust {
                    pose,
                    inliers: result.inliers,
                    threshold: result.threshold,
                };
                check_support(&robust, needed)?;
                let focal = (calibration[(0, 0)] + calibration[(1, 1)]) / 2.0;
                if !(focal.is_finite() && focal > 0.0) {
                    return Err(ResectionFailure::Decomposition);
                }
                let principal_point = Point2::new(calibration[(0, 2)], calibration[(1, 2)]);
                let intrinsics = CameraIntrinsics::new(
                    settings.unknown_camera_type,
                    width as u32,
                    height as u32,
                    focal,
                    principal_point,
                );
                debug!(
                    "estimated focal {:.2} and principal point ({:.2}, {:.2}) for view {}",
                    focal, principal_point.x, principal_point.y, view
                );
                (robust.pose, intrinsics, robust.inliers, robust.threshold)
            }
        };

        let matches: Vec<PixelWorldMatch> = inliers
            .iter()
            .map(|&ix| PixelWorldMatch(correspondences[ix].0, correspondences[ix].1))
            .collect();
        let pose = PoseRefiner::new(intrinsics, pose, matches)
            .refine()
            .map_err(ResectionFailure::Refinement)?;
        debug!(
            "resected view {} with {} of {} inliers at {:.3} px",
            view,
            inliers.len(),
            correspondences.len(),
            threshold
        );
        Ok(Resection {
            view,
            pose,
            intrinsics,
            calibrated: calibration.is_some(),
            inliers: inliers.len(),
            threshold,
        })
    }

    /// Resects a batch of views against the same reconstruction.
    ///
    /// The generator of each view is seeded from `seed` and the view id, and the results come
    /// back in batch order.
    pub(crate) fn resect_batch(
        &self,
        reconstruction: &Reconstruction,
        batch: &[(ViewId, usize)],
        seed: u64,
    ) -> Vec<BatchResult> {
        let resect = |&(view, count): &(ViewId, usize)| -> BatchResult {
            (
                view,
                count,
                self.resect(reconstruction, view, derive_seed(seed, u64::from(view.0))),
            )
        };
        #[cfg(not(feature = "rayon"))]
        let results = batch.iter().map(resect).collect();
        #[cfg(feature = "rayon")]
        let results = batch.par_iter().map(resect).collect();
        results
    }

    /// Adds a resected view to the reconstruction.
    pub(crate) fn install(&self, reconstruction: &mut Reconstruction, resection: &Resection) -> bool {
        match self.registered_view(resection.view, resection.threshold) {
            Some(registered) => {
                reconstruction.register(resection.view, registered, resection.pose, resection.intrinsics);
                true
            }
            None => false,
        }
    }
}
