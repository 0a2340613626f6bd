use crate::{
    problem::Problem, refine, InitializationIssue, MatchConstraint, Reconstruction, RefineMode,
    Seed, SfmSettings,
};
use cv_core::{
    nalgebra::Point3,
    sample_consensus::{Estimator, Model},
    CameraIntrinsics, CameraToCamera, FeatureMatch, Pose, TrackId, ViewId, WorldToCamera,
};
use cv_geom::{
    essential::in_front, triangulation::triangulation_angle, AcRansac, EightPoint,
    EssentialMatrix, FivePoint, OrientedFivePoint,
};
use cv_optimize::RefineOptions;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// The relative pose of two calibrated views with its a-contrario inliers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelativePose {
    /// Maps the frame of the first view into the second. The translation has unit length.
    pub pose: CameraToCamera,
    pub inliers: Vec<usize>,
    /// The estimated noise level in pixels.
    pub threshold: f64,
}

impl RelativePose {
    /// Triangulates the inliers and returns the ray angle of each point in degrees.
    ///
    /// Points behind either camera are left out.
    pub fn inlier_angles(&self, settings: &SfmSettings, matches: &[FeatureMatch]) -> Vec<f64> {
        let first = WorldToCamera::identity();
        let second = WorldToCamera(self.pose.isometry());
        let (ca, cb) = (first.center(), second.center());
        self.inliers
            .iter()
            .filter_map(|&ix| {
                let FeatureMatch(a, b) = matches[ix];
                settings
                    .triangulation_method
                    .triangulate(&[(first, a), (second, b)])
            })
            .filter(|&p: &Point3<f64>| first.depth(p) > 0.0 && second.depth(p) > 0.0)
            .map(|p| triangulation_angle(&ca, &cb, &p).to_degrees())
            .collect()
    }
}

/// Estimates the relative pose of two views from bearing matches.
///
/// The a-contrario consensus works on the angular distance to the epipolar plane, scaled to
/// pixels with `focal`. Under [`MatchConstraint::Orientation`] hypotheses are scored with a
/// chirality check. Otherwise the essential matrix of the consensus is re-fit linearly to its
/// inliers when that does not lose any, and its decomposition is picked by chirality.
pub(crate) fn relative_pose(
    settings: &SfmSettings,
    matches: &[FeatureMatch],
    (width, height): (f64, f64),
    focal: f64,
    seed: u64,
) -> Option<RelativePose> {
    let rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut consensus = AcRansac::point_to_line(rng, width, height, focal)
        .max_iterations(settings.ac_ransac_iterations)
        .max_threshold(settings.max_noise_px);

    let (pose, inliers, threshold) = match settings.match_constraint {
        MatchConstraint::Orientation => {
            let result = consensus.estimate(&OrientedFivePoint::default(), matches)?;
            (result.model.0, result.inliers, result.threshold)
        }
        MatchConstraint::Unconstrained => {
            let result = consensus.estimate(&FivePoint::new(), matches)?;
            let essential = refit(result.model, matches, &result.inliers, result.threshold / focal);
            let pose = essential
                .pose_solver()
                .solve(result.inliers.iter().map(|&ix| matches[ix]))?;
            (pose, result.inliers, result.threshold)
        }
    };

    let translation = pose.isometry().translation.vector;
    let norm = translation.norm();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    let pose = CameraToCamera::from_parts(translation / norm, pose.isometry().rotation);
    // Matches the pose puts behind a camera cannot be triangulated.
    let inliers: Vec<usize> = inliers
        .into_iter()
        .filter(|&ix| in_front(pose, &matches[ix]))
        .collect();
    Some(RelativePose {
        pose,
        inliers,
        threshold,
    })
}

fn refit(
    essential: EssentialMatrix,
    matches: &[FeatureMatch],
    inliers: &[usize],
    angular_threshold: f64,
) -> EssentialMatrix {
    let count = |e: &EssentialMatrix| {
        matches
            .iter()
            .filter(|m| e.residual(m) <= angular_threshold)
            .count()
    };
    let linear = EightPoint::new()
        .from_matches(inliers.iter().map(|&ix| matches[ix]))
        .and_then(|e| e.recondition(1e-12, 1000));
    match linear {
        Some(linear) if count(&linear) >= count(&essential) => linear,
        _ => essential,
    }
}

/// Bearing matches of the tracks two views share, and those tracks.
fn shared_matches(
    problem: &Problem,
    reconstruction: &Reconstruction,
    a: ViewId,
    b: ViewId,
) -> Option<(Vec<TrackId>, Vec<FeatureMatch>)> {
    let ia = problem.intrinsics(reconstruction, a)?;
    let ib = problem.intrinsics(reconstruction, b)?;
    let mut tracks = Vec::new();
    let mut matches = Vec::new();
    for id in problem.visibility.shared(a, b) {
        if let Some(track) = problem.tracks.get(id) {
            if let (Some(oa), Some(ob)) = (track.get(a), track.get(b)) {
                tracks.push(id);
                matches.push(FeatureMatch(ia.bearing(oa.pixel), ib.bearing(ob.pixel)));
            }
        }
    }
    Some((tracks, matches))
}

fn seed_intrinsics(
    problem: &Problem,
    views: &[ViewId],
) -> Result<Vec<CameraIntrinsics>, InitializationIssue> {
    let empty = Reconstruction::new();
    views
        .iter()
        .map(|&view| {
            problem
                .intrinsics(&empty, view)
                .ok_or(InitializationIssue::Uncalibrated(view))
        })
        .collect()
}

impl Problem {
    /// Builds the initial reconstruction from a seed.
    pub(crate) fn initialize(&self, seed: Seed, rng_seed: u64) -> Result<Reconstruction, InitializationIssue> {
        match seed {
            Seed::Pair(a, b) => self.initialize_pair(a, b, rng_seed),
            #[cfg(feature = "triplet")]
            Seed::Triplet(a, b, c) => self.initialize_triplet([a, b, c], rng_seed),
            // Triplets are refused while preparing when the feature is off.
            #[cfg(not(feature = "triplet"))]
            Seed::Triplet(..) => Err(InitializationIssue::DegenerateRelativePose),
        }
    }

    /// Builds the initial reconstruction from two views.
    ///
    /// The first view is placed at the origin and the second one at unit distance.
    pub(crate) fn initialize_pair(
        &self,
        a: ViewId,
        b: ViewId,
        seed: u64,
    ) -> Result<Reconstruction, InitializationIssue> {
        let settings = &self.settings;
        let intrinsics = seed_intrinsics(self, &[a, b])?;
        let (_, matches) = shared_matches(self, &Reconstruction::new(), a, b)
            .ok_or(InitializationIssue::DegenerateRelativePose)?;
        let needed = settings.min_seed_landmarks.max(FivePoint::MIN_SAMPLES + 1);
        if matches.len() < needed {
            return Err(InitializationIssue::TooFewMatches {
                found: matches.len(),
                needed,
            });
        }

        let info = self
            .views
            .get(&a)
            .ok_or(InitializationIssue::DegenerateRelativePose)?;
        let focal = (intrinsics[0].focal + intrinsics[1].focal) / 2.0;
        let relative = relative_pose(settings, &matches, info.dimensions(), focal, seed)
            .ok_or(InitializationIssue::DegenerateRelativePose)?;
        debug!(
            "relative pose of {} and {} has {} of {} inliers at {:.3} px",
            a,
            b,
            relative.inliers.len(),
            matches.len(),
            relative.threshold
        );

        let mut reconstruction = Reconstruction::new();
        for (ix, (&view, pose)) in [a, b]
            .iter()
            .zip([WorldToCamera::identity(), WorldToCamera(relative.pose.isometry())])
            .enumerate()
        {
            let registered = self
                .registered_view(view, relative.threshold)
                .ok_or(InitializationIssue::DegenerateRelativePose)?;
            reconstruction.register(view, registered, pose, intrinsics[ix]);
        }
        reconstruction.anchor = reconstruction.views.get(&a).map(|r| r.pose);
        self.grow_seed(reconstruction)
    }

    /// Triangulates, refines and checks a freshly posed seed.
    fn grow_seed(&self, mut reconstruction: Reconstruction) -> Result<Reconstruction, InitializationIssue> {
        let settings = &self.settings;
        let report = self.triangulate(&mut reconstruction, settings.min_seed_angle_degrees);
        let needed = settings.min_seed_landmarks;
        if report.created < needed {
            return Err(InitializationIssue::TooFewLandmarks {
                found: report.created,
                needed,
            });
        }
        let mode = RefineMode::Custom(RefineOptions {
            poses: true,
            intrinsics: settings.refine_intrinsics_on_seed,
            structure: true,
        });
        refine(&mut reconstruction, settings, mode).map_err(InitializationIssue::Numeric)?;
        let found = reconstruction.landmarks.len();
        if found < needed {
            return Err(InitializationIssue::TooFewLandmarks { found, needed });
        }
        info!(
            "seeded {} views with {} landmarks at rms {:.4} px",
            reconstruction.views.len(),
            found,
            reconstruction.rms()
        );
        Ok(reconstruction)
    }

    /// Builds the initial reconstruction from three views.
    ///
    /// The poses come from a bounded consensus over the tracks seen by all three views. The
    /// threshold of the views is the largest inlier reprojection error.
    #[cfg(feature = "triplet")]
    pub(crate) fn initialize_triplet(
        &self,
        views: [ViewId; 3],
        seed: u64,
    ) -> Result<Reconstruction, InitializationIssue> {
        use cv_core::TripletMatch;
        use cv_geom::{MaxConsensus, TripletEstimator};

        let settings = &self.settings;
        let intrinsics = seed_intrinsics(self, &views)?;
        let [a, b, c] = views;
        let mut points = Vec::new();
        let mut matches = Vec::new();
        for id in self.visibility.shared(a, b) {
            let track = match self.tracks.get(id) {
                Some(track) => track,
                None => continue,
            };
            if let (Some(oa), Some(ob), Some(oc)) = (track.get(a), track.get(b), track.get(c)) {
                points.push([oa.pixel, ob.pixel, oc.pixel]);
                matches.push(TripletMatch([
                    intrinsics[0].bearing(oa.pixel),
                    intrinsics[1].bearing(ob.pixel),
                    intrinsics[2].bearing(oc.pixel),
                ]));
            }
        }
        let needed = settings.min_seed_landmarks.max(TripletEstimator::MIN_SAMPLES + 1);
        if matches.len() < needed {
            return Err(InitializationIssue::TooFewMatches {
                found: matches.len(),
                needed,
            });
        }

        let focal = intrinsics.iter().map(|i| i.focal).sum::<f64>() / 3.0;
        let rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let (poses, inliers) = MaxConsensus::new(rng, settings.max_noise_px / focal)
            .max_iterations(settings.max_trifocal_ransac_iterations)
            .estimate(&TripletEstimator::new(), &matches)
            .ok_or(InitializationIssue::DegenerateRelativePose)?;

        let mut threshold: f64 = 0.0;
        for &ix in &inliers {
            if let Some(point) = poses.triangulate(&matches[ix]) {
                for view in 0..3 {
                    threshold = threshold.max(intrinsics[view].reprojection_error(
                        poses.0[view],
                        point,
                        points[ix][view],
                    ));
                }
            }
        }
        if !threshold.is_finite() {
            threshold = settings.max_noise_px;
        }
        debug!(
            "triplet {} {} {} has {} of {} inliers at {:.3} px",
            a,
            b,
            c,
            inliers.len(),
            matches.len(),
            threshold
        );

        let mut reconstruction = Reconstruction::new();
        for (ix, &view) in views.iter().enumerate() {
            let registered = self
                .registered_view(view, threshold)
                .ok_or(InitializationIssue::DegenerateRelativePose)?;
            reconstruction.register(view, registered, poses.0[ix], intrinsics[ix]);
        }
        reconstruction.anchor = reconstruction.views.get(&a).map(|r| r.pose);
        self.grow_seed(reconstruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::Synthetic;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::Vector3;

    #[test]
    fn relative_pose_recovers_the_baseline_direction() {
        let synthetic = Synthetic::rig(&[0.0, 0.6], 120, 0.3, 21);
        let problem = synthetic.problem();
        for constraint in MatchConstraint::ALL {
            let settings = SfmSettings {
                match_constraint: constraint,
                ..SfmSettings::default()
            };
            let (_, matches) =
                shared_matches(&problem, &Reconstruction::new(), ViewId(1), ViewId(2)).unwrap();
            let relative = relative_pose(&settings, &matches, (640.0, 480.0), 500.0, 3).unwrap();
            let t = relative.pose.isometry().translation.vector;
            assert_relative_eq!(t, Vector3::new(-1.0, 0.0, 0.0), epsilon = 0.05);
            assert!(relative.inliers.len() >= 110);
            assert!(relative.threshold <= settings.max_noise_px);
            let angles = relative.inlier_angles(&settings, &matches);
            assert!(angles.iter().all(|&angle| angle > 3.0));
        }
    }

    #[test]
    fn pair_seed_is_registered_and_triangulated() {
        let synthetic = Synthetic::rig(&[0.0, 0.6], 100, 0.3, 5);
        let problem = synthetic.problem();
        let reconstruction = problem.initialize_pair(ViewId(1), ViewId(2), 9).unwrap();
        assert_eq!(reconstruction.views.len(), 2);
        assert!(reconstruction.landmarks.len() >= 80);
        assert!(reconstruction.rms() < 0.5);
        assert_eq!(reconstruction.pose(ViewId(1)), Some(WorldToCamera::identity()));
        let center = reconstruction.pose(ViewId(2)).unwrap().center();
        assert_relative_eq!(center.coords.norm(), 1.0, epsilon = 0.05);
    }

    #[test]
    fn narrow_baseline_yields_too_few_landmarks() {
        let synthetic = Synthetic::rig(&[0.0, 0.02], 100, 0.3, 5);
        let problem = synthetic.problem();
        match problem.initialize_pair(ViewId(1), ViewId(2), 9) {
            Err(InitializationIssue::TooFewLandmarks { .. })
            | Err(InitializationIssue::DegenerateRelativePose) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn too_few_shared_tracks_are_reported() {
        let synthetic = Synthetic::rig(&[0.0, 0.6], 12, 0.0, 5);
        let problem = synthetic.problem();
        assert_eq!(
            problem.initialize_pair(ViewId(1), ViewId(2), 9),
            Err(InitializationIssue::TooFewMatches {
                found: 12,
                needed: 30
            })
        );
    }

    #[cfg(feature = "triplet")]
    #[test]
    fn triplet_seed_registers_three_views() {
        let synthetic = Synthetic::rig(&[0.0, 0.5, 1.0], 100, 0.3, 8);
        let problem = synthetic.problem();
        let reconstruction = problem
            .initialize_triplet([ViewId(1), ViewId(2), ViewId(3)], 4)
            .unwrap();
        assert_eq!(reconstruction.views.len(), 3);
        assert!(reconstruction.landmarks.len() >= 80);
        assert!(reconstruction.rms() < 0.5);
    }
}
