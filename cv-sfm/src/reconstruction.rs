use average::{Estimate, Mean};
use cv_core::{
    nalgebra::{Point2, Point3},
    CameraIntrinsics, FeatureId, IntrinsicId, PoseId, TrackId, ViewId, WorldToCamera,
};
use cv_geom::triangulation::triangulation_angle;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A feature of a view: its index and its pixel location.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Observation {
    pub feature: FeatureId,
    pub pixel: Point2<f64>,
}

/// A triangulated track and the observations consistent with its point.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    pub point: Point3<f64>,
    pub observations: BTreeMap<ViewId, Observation>,
}

/// The calibration and pose groups of a registered view, and its a-contrario threshold.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RegisteredView {
    pub pose: PoseId,
    pub intrinsic: IntrinsicId,
    /// The reprojection tolerance of the view in pixels.
    pub threshold: f64,
}

/// The state of an incremental reconstruction.
///
/// Every landmark observation refers to a registered view and every registered view has a pose
/// and intrinsics.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub views: BTreeMap<ViewId, RegisteredView>,
    pub poses: BTreeMap<PoseId, WorldToCamera>,
    pub intrinsics: BTreeMap<IntrinsicId, CameraIntrinsics>,
    pub landmarks: BTreeMap<TrackId, Landmark>,
    /// The pose held constant during bundle adjustment.
    pub anchor: Option<PoseId>,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a view with its pose.
    ///
    /// The intrinsics are only inserted if the group has none yet, so views sharing a group keep
    /// the current estimate.
    pub fn register(
        &mut self,
        view: ViewId,
        registered: RegisteredView,
        pose: WorldToCamera,
        intrinsics: CameraIntrinsics,
    ) {
        self.views.insert(view, registered);
        self.poses.insert(registered.pose, pose);
        self.intrinsics
            .entry(registered.intrinsic)
            .or_insert(intrinsics);
    }

    pub fn is_registered(&self, view: ViewId) -> bool {
        self.views.contains_key(&view)
    }

    pub fn registered(&self) -> BTreeSet<ViewId> {
        self.views.keys().copied().collect()
    }

    /// The pose and intrinsics of a registered view.
    pub fn camera(&self, view: ViewId) -> Option<(WorldToCamera, &CameraIntrinsics)> {
        let registered = self.views.get(&view)?;
        Some((
            *self.poses.get(&registered.pose)?,
            self.intrinsics.get(&registered.intrinsic)?,
        ))
    }

    pub fn pose(&self, view: ViewId) -> Option<WorldToCamera> {
        self.camera(view).map(|(pose, _)| pose)
    }

    /// The threshold of a view, zero if it is not registered.
    pub fn threshold(&self, view: ViewId) -> f64 {
        self.views.get(&view).map_or(0.0, |v| v.threshold)
    }

    /// Pixel reprojection error of a point in a view, infinite if the view is not registered or
    /// the point is behind it.
    pub fn reprojection_error(&self, view: ViewId, point: Point3<f64>, pixel: Point2<f64>) -> f64 {
        self.camera(view)
            .map_or(f64::INFINITY, |(pose, intrinsics)| {
                intrinsics.reprojection_error(pose, point, pixel)
            })
    }

    /// Checks an observation against the threshold of its view, including chirality.
    pub fn is_consistent(&self, view: ViewId, point: Point3<f64>, pixel: Point2<f64>) -> bool {
        match self.camera(view) {
            Some((pose, intrinsics)) => {
                pose.depth(point) > 0.0
                    && intrinsics.reprojection_error(pose, point, pixel) <= self.threshold(view)
            }
            None => false,
        }
    }

    /// The widest angle in degrees between the rays of two observations of a point.
    pub fn max_ray_angle<'a>(
        &self,
        point: Point3<f64>,
        views: impl IntoIterator<Item = &'a ViewId>,
    ) -> f64 {
        let centers: Vec<Point3<f64>> = views
            .into_iter()
            .filter_map(|&view| self.pose(view))
            .map(WorldToCamera::center)
            .collect();
        let mut widest: f64 = 0.0;
        for (i, a) in centers.iter().enumerate() {
            for b in &centers[i + 1..] {
                widest = widest.max(triangulation_angle(a, b, &point));
            }
        }
        widest.to_degrees()
    }

    pub fn observation_count(&self) -> usize {
        self.landmarks.values().map(|l| l.observations.len()).sum()
    }

    /// Reprojection errors of every landmark observation, in landmark then view order.
    pub fn residuals(&self) -> Vec<f64> {
        self.landmarks
            .values()
            .flat_map(|landmark| {
                landmark
                    .observations
                    .iter()
                    .map(move |(&view, observation)| {
                        self.reprojection_error(view, landmark.point, observation.pixel)
                    })
            })
            .collect()
    }

    /// Root mean square of the reprojection errors, zero without observations.
    pub fn rms(&self) -> f64 {
        let squared: Mean = self.residuals().iter().map(|r| r * r).collect();
        if squared.is_empty() {
            0.0
        } else {
            squared.mean().sqrt()
        }
    }
}
