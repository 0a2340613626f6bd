use crate::{Reconstruction, SfmSettings};
use cv_core::{IntrinsicId, PoseId, TrackId, ViewId};
use cv_optimize::{Bundle, BundleAdjuster, BundleObservation, OptimizeError, RefineOptions};
use log::*;
use std::collections::BTreeMap;

/// Which parameters a refinement may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineMode {
    /// Structure and motion, with the intrinsics frozen. Used after each resection batch.
    Incremental,
    /// Structure, motion and intrinsics. Used once the scheduler runs out of views.
    Final,
    Custom(RefineOptions),
}

impl RefineMode {
    pub fn options(self) -> RefineOptions {
        match self {
            RefineMode::Incremental => RefineOptions::STRUCTURE_AND_MOTION,
            RefineMode::Final => RefineOptions::ALL,
            RefineMode::Custom(options) => options,
        }
    }
}

/// The outcome of [`refine`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RefineReport {
    /// Bundle adjustments that were run.
    pub cycles: usize,
    pub removed_observations: usize,
    pub removed_landmarks: usize,
    /// RMS reprojection error in pixels before the first cycle.
    pub initial_rms: f64,
    pub final_rms: f64,
}

/// Bundle adjusts the reconstruction and prunes the observations it no longer explains.
///
/// The pose of [`Reconstruction::anchor`] is held constant. After each optimization, observations
/// outside the threshold of their view or behind it are removed, then landmarks whose rays are
/// narrower than `min_triangulation_angle_degrees` or that have fewer than two observations
/// left. The cycle repeats while something is removed, at most `max_refine_cycles` times.
///
/// The reconstruction is only changed when every optimization succeeds up to the failing one.
/// A failing optimization leaves the state of the previous cycle in place and returns the error.
pub fn refine(
    reconstruction: &mut Reconstruction,
    settings: &SfmSettings,
    mode: RefineMode,
) -> Result<RefineReport, OptimizeError> {
    let options = mode.options();
    let adjuster = BundleAdjuster::new().max_iterations(settings.bundle_max_iterations);
    let mut report = RefineReport {
        initial_rms: reconstruction.rms(),
        ..RefineReport::default()
    };
    for _ in 0..settings.max_refine_cycles.max(1) {
        let mut problem = BundleProblem::new(reconstruction);
        let bundle_report = adjuster.optimize(&mut problem.bundle, options)?;
        problem.write_back(reconstruction, options);
        report.cycles += 1;
        trace!(
            "refinement cycle {} from rms {} to {}",
            report.cycles,
            bundle_report.initial_rms(),
            bundle_report.final_rms()
        );

        let (observations, landmarks) = prune(reconstruction, settings.min_triangulation_angle_degrees);
        report.removed_observations += observations;
        report.removed_landmarks += landmarks;
        if observations == 0 && landmarks == 0 {
            break;
        }
    }
    report.final_rms = reconstruction.rms();
    debug!(
        "refined {:?} in {} cycles, rms {:.4} -> {:.4}, removed {} observations and {} landmarks",
        mode,
        report.cycles,
        report.initial_rms,
        report.final_rms,
        report.removed_observations,
        report.removed_landmarks
    );
    Ok(report)
}

/// Removes inconsistent observations and the landmarks that no longer hold up.
///
/// Returns the number of removed observations and landmarks.
pub fn prune(reconstruction: &mut Reconstruction, min_angle_degrees: f64) -> (usize, usize) {
    let mut rejected: Vec<(TrackId, Vec<ViewId>)> = Vec::new();
    for (&id, landmark) in &reconstruction.landmarks {
        let views: Vec<ViewId> = landmark
            .observations
            .iter()
            .filter(|(&view, observation)| {
                !reconstruction.is_consistent(view, landmark.point, observation.pixel)
            })
            .map(|(&view, _)| view)
            .collect();
        if !views.is_empty() {
            rejected.push((id, views));
        }
    }
    let mut observations = 0;
    for (id, views) in rejected {
        if let Some(landmark) = reconstruction.landmarks.get_mut(&id) {
            for view in views {
                landmark.observations.remove(&view);
                observations += 1;
            }
        }
    }

    let degenerate: Vec<TrackId> = reconstruction
        .landmarks
        .iter()
        .filter(|(_, landmark)| {
            landmark.observations.len() < 2
                || reconstruction.max_ray_angle(landmark.point, landmark.observations.keys())
                    < min_angle_degrees
        })
        .map(|(&id, _)| id)
        .collect();
    for id in &degenerate {
        if let Some(landmark) = reconstruction.landmarks.remove(id) {
            observations += landmark.observations.len();
        }
    }
    (observations, degenerate.len())
}

/// A bundle built from a reconstruction with the maps from its indices back to the ids.
struct BundleProblem {
    bundle: Bundle,
    poses: Vec<PoseId>,
    intrinsics: Vec<IntrinsicId>,
    points: Vec<TrackId>,
}

impl BundleProblem {
    fn new(reconstruction: &Reconstruction) -> Self {
        let poses: Vec<PoseId> = reconstruction.poses.keys().copied().collect();
        let intrinsics: Vec<IntrinsicId> = reconstruction.intrinsics.keys().copied().collect();
        let points: Vec<TrackId> = reconstruction.landmarks.keys().copied().collect();
        let pose_index: BTreeMap<PoseId, usize> = poses.iter().enumerate().map(|(ix, &id)| (id, ix)).collect();
        let intrinsic_index: BTreeMap<IntrinsicId, usize> =
            intrinsics.iter().enumerate().map(|(ix, &id)| (id, ix)).collect();

        let mut observations = Vec::with_capacity(reconstruction.observation_count());
        for (point, landmark) in reconstruction.landmarks.values().enumerate() {
            for (view, observation) in &landmark.observations {
                let registered = match reconstruction.views.get(view) {
                    Some(registered) => registered,
                    None => continue,
                };
                if let (Some(&pose), Some(&intrinsic)) = (
                    pose_index.get(&registered.pose),
                    intrinsic_index.get(&registered.intrinsic),
                ) {
                    observations.push(BundleObservation {
                        pose,
                        intrinsic,
                        point,
                        pixel: observation.pixel,
                    });
                }
            }
        }

        let bundle = Bundle {
            poses: reconstruction.poses.values().copied().collect(),
            fixed_poses: reconstruction
                .anchor
                .and_then(|anchor| pose_index.get(&anchor).copied())
                .into_iter()
                .collect(),
            intrinsics: reconstruction.intrinsics.values().copied().collect(),
            points: reconstruction.landmarks.values().map(|l| l.point).collect(),
            observations,
        };
        Self {
            bundle,
            poses,
            intrinsics,
            points,
        }
    }

    fn write_back(self, reconstruction: &mut Reconstruction, options: RefineOptions) {
        if options.poses {
            for (id, pose) in self.poses.iter().zip(self.bundle.poses) {
                reconstruction.poses.insert(*id, pose);
            }
        }
        if options.intrinsics {
            for (id, intrinsics) in self.intrinsics.iter().zip(self.bundle.intrinsics) {
                reconstruction.intrinsics.insert(*id, intrinsics);
            }
        }
        if options.structure {
            for (id, point) in self.points.iter().zip(self.bundle.points) {
                if let Some(landmark) = reconstruction.landmarks.get_mut(id) {
                    landmark.point = point;
                }
            }
        }
    }
}
