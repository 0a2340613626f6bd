use crate::{problem::Problem, Landmark, Observation, Reconstruction, Track};
use cv_core::{nalgebra::UnitVector3, TrackId, ViewId, WorldToCamera};
use cv_geom::TriangulationMethod;
use log::*;
use std::collections::BTreeMap;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// What a triangulation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriangulationReport {
    /// New landmarks.
    pub created: usize,
    /// Observations added to existing landmarks.
    pub extended: usize,
    /// Tracks with two or more registered views that did not pass the checks.
    pub rejected: usize,
}

enum Proposal {
    Create(TrackId, Landmark),
    Extend(TrackId, Vec<(ViewId, Observation)>),
    Reject,
    Skip,
}

/// Triangulates a point from the registered observations of a track.
///
/// Observations that reproject outside the threshold of their view, or that end up behind it,
/// are dropped. The landmark is kept if two or more observations remain and some pair of their
/// rays is at least `min_angle_degrees` apart.
pub(crate) fn triangulate_observations(
    reconstruction: &Reconstruction,
    method: TriangulationMethod,
    observations: &BTreeMap<ViewId, Observation>,
    min_angle_degrees: f64,
) -> Option<Landmark> {
    let posed: Vec<(WorldToCamera, UnitVector3<f64>)> = observations
        .iter()
        .filter_map(|(&view, observation)| {
            let (pose, intrinsics) = reconstruction.camera(view)?;
            Some((pose, intrinsics.bearing(observation.pixel)))
        })
        .collect();
    let point = method.triangulate(&posed)?;
    if !point.iter().all(|n| n.is_finite()) {
        return None;
    }
    let conforming: BTreeMap<ViewId, Observation> = observations
        .iter()
        .filter(|(&view, observation)| reconstruction.is_consistent(view, point, observation.pixel))
        .map(|(&view, &observation)| (view, observation))
        .collect();
    if conforming.len() < 2 || reconstruction.max_ray_angle(point, conforming.keys()) < min_angle_degrees {
        return None;
    }
    Some(Landmark {
        point,
        observations: conforming,
    })
}

impl Problem {
    /// Triangulates every track seen by two or more registered views that has no landmark, and
    /// extends existing landmarks with consistent observations from views registered since.
    pub(crate) fn triangulate(
        &self,
        reconstruction: &mut Reconstruction,
        min_angle_degrees: f64,
    ) -> TriangulationReport {
        let method = self.settings.triangulation_method;
        let snapshot = &*reconstruction;
        let propose = |(id, track): (TrackId, &Track)| -> Proposal {
            let registered: BTreeMap<ViewId, Observation> = track
                .iter()
                .filter(|&(view, _)| snapshot.is_registered(view))
                .map(|(view, &observation)| (view, observation))
                .collect();
            if registered.len() < 2 {
                return Proposal::Skip;
            }
            match snapshot.landmarks.get(&id) {
                Some(landmark) => {
                    let additions: Vec<(ViewId, Observation)> = registered
                        .into_iter()
                        .filter(|(view, observation)| {
                            !landmark.observations.contains_key(view)
                                && snapshot.is_consistent(*view, landmark.point, observation.pixel)
                        })
                        .collect();
                    Proposal::Extend(id, additions)
                }
                None => match triangulate_observations(snapshot, method, &registered, min_angle_degrees) {
                    Some(landmark) => Proposal::Create(id, landmark),
                    None => Proposal::Reject,
                },
            }
        };

        let tracks: Vec<(TrackId, &Track)> = self.tracks.iter().collect();
        #[cfg(not(feature = "rayon"))]
        let proposals: Vec<Proposal> = tracks.into_iter().map(propose).collect();
        #[cfg(feature = "rayon")]
        let proposals: Vec<Proposal> = tracks.into_par_iter().map(propose).collect();

        let mut report = TriangulationReport::default();
        for proposal in proposals {
            match proposal {
                Proposal::Create(id, landmark) => {
                    reconstruction.landmarks.insert(id, landmark);
                    report.created += 1;
                }
                Proposal::Extend(id, additions) => {
                    if let Some(landmark) = reconstruction.landmarks.get_mut(&id) {
                        report.extended += additions.len();
                        landmark.observations.extend(additions);
                    }
                }
                Proposal::Reject => report.rejected += 1,
                Proposal::Skip => {}
            }
        }
        debug!(
            "triangulation created {} landmarks, extended {} observations, rejected {} tracks",
            report.created, report.extended, report.rejected
        );
        report
    }
}
