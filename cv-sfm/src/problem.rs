use crate::{
    Calibration, ConfigError, InputError, Reconstruction, RegisteredView, Scene, SfmError,
    SfmSettings, Tracks, VisibilityIndex,
};
use cv_core::{CameraIntrinsics, IntrinsicId, PoseId, ViewId};
use std::collections::{BTreeMap, BTreeSet};

/// A view with its calibration group resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ViewInfo {
    pub pose: PoseId,
    pub intrinsic: IntrinsicId,
    pub calibration: Calibration,
    pub width: u32,
    pub height: u32,
}

impl ViewInfo {
    pub fn dimensions(&self) -> (f64, f64) {
        (f64::from(self.width), f64::from(self.height))
    }
}

/// Everything the components read and never change during a reconstruction.
#[derive(Debug, Clone)]
pub(crate) struct Problem {
    pub settings: SfmSettings,
    pub tracks: Tracks,
    pub visibility: VisibilityIndex,
    pub views: BTreeMap<ViewId, ViewInfo>,
}

impl Problem {
    pub fn new(settings: SfmSettings, scene: &Scene, tracks: Tracks) -> Result<Self, SfmError> {
        let (assignment, calibrations) = scene.resolve_intrinsics()?;
        let mut views = BTreeMap::new();
        for (&id, view) in &scene.views {
            let intrinsic = assignment[&id];
            let calibration = *calibrations
                .get(&intrinsic)
                .ok_or(ConfigError::MissingIntrinsic { view: id, intrinsic })?;
            views.insert(
                id,
                ViewInfo {
                    pose: view.pose,
                    intrinsic,
                    calibration,
                    width: view.width,
                    height: view.height,
                },
            );
        }
        if let Some(view) = tracks.views().into_iter().find(|v| !views.contains_key(v)) {
            return Err(InputError::UnknownView(view).into());
        }
        let visibility = VisibilityIndex::new(&tracks);
        Ok(Self {
            settings,
            tracks,
            visibility,
            views,
        })
    }

    /// Views with at least one track.
    pub fn usable_views(&self) -> BTreeSet<ViewId> {
        self.visibility.views().collect()
    }

    /// Views that can seed a reconstruction: calibrated ones with tracks.
    pub fn is_seedable(&self, view: ViewId) -> bool {
        self.views
            .get(&view)
            .map_or(false, |info| info.calibration.known().is_some())
            && !self.visibility.tracks(view).is_empty()
    }

    /// The intrinsics of a view, preferring the current estimate of its group.
    pub fn intrinsics(&self, reconstruction: &Reconstruction, view: ViewId) -> Option<CameraIntrinsics> {
        let info = self.views.get(&view)?;
        reconstruction
            .intrinsics
            .get(&info.intrinsic)
            .copied()
            .or_else(|| info.calibration.known().copied())
    }

    pub fn registered_view(&self, view: ViewId, threshold: f64) -> Option<RegisteredView> {
        let info = self.views.get(&view)?;
        Some(RegisteredView {
            pose: info.pose,
            intrinsic: info.intrinsic,
            threshold: self.settings.clamp_threshold(threshold),
        })
    }
}
