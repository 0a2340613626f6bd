use crate::{ConfigError, Landmark};
use cv_core::{
    CameraIntrinsics, FeatureId, IntrinsicId, KeyPoint, PoseId, TrackId, ViewId, ViewPair,
    WorldToCamera,
};
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Supplies the ordered keypoints of each view.
///
/// Feature indices used by a [`MatchesProvider`] index into these slices.
pub trait FeaturesProvider {
    fn features(&self, view: ViewId) -> Option<&[KeyPoint]>;
}

impl FeaturesProvider for BTreeMap<ViewId, Vec<KeyPoint>> {
    fn features(&self, view: ViewId) -> Option<&[KeyPoint]> {
        self.get(&view).map(Vec::as_slice)
    }
}

/// Supplies the putative feature matches between pairs of views.
pub trait MatchesProvider {
    /// Every pair that has matches, in ascending order.
    fn pairs(&self) -> Vec<ViewPair>;

    /// The matches of a pair. The first index of each match belongs to `pair.first()`.
    fn matches(&self, pair: ViewPair) -> &[(FeatureId, FeatureId)];
}

/// Pairwise matches stored in memory.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairwiseMatches {
    matches: BTreeMap<ViewPair, Vec<(FeatureId, FeatureId)>>,
}

impl PairwiseMatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds matches between view `a` and view `b`, given as `(feature in a, feature in b)`.
    ///
    /// The matches are flipped if needed so that they are stored in the order of the
    /// canonical [`ViewPair`]. Matches of a view with itself are ignored.
    pub fn insert(
        &mut self,
        a: ViewId,
        b: ViewId,
        matches: impl IntoIterator<Item = (FeatureId, FeatureId)>,
    ) {
        let pair = ViewPair::new(a, b);
        if pair.is_degenerate() {
            return;
        }
        let flip = pair.first() != a;
        self.matches
            .entry(pair)
            .or_default()
            .extend(matches.into_iter().map(|(fa, fb)| if flip { (fb, fa) } else { (fa, fb) }));
    }

    pub fn len(&self) -> usize {
        self.matches.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MatchesProvider for PairwiseMatches {
    fn pairs(&self) -> Vec<ViewPair> {
        self.matches.keys().copied().collect()
    }

    fn matches(&self, pair: ViewPair) -> &[(FeatureId, FeatureId)] {
        self.matches.get(&pair).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A captured image. Its dimensions never change.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct View {
    pub pose: PoseId,
    /// `None` is an uncalibrated camera that belongs to no group.
    pub intrinsic: Option<IntrinsicId>,
    pub width: u32,
    pub height: u32,
}

impl View {
    pub fn new(pose: PoseId, intrinsic: Option<IntrinsicId>, width: u32, height: u32) -> Self {
        Self {
            pose,
            intrinsic,
            width,
            height,
        }
    }
}

/// The calibration of an intrinsic group.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Calibration {
    Known(CameraIntrinsics),
    /// Estimated when the only view of the group is resected.
    Unknown,
}

impl Calibration {
    pub fn known(&self) -> Option<&CameraIntrinsics> {
        match self {
            Calibration::Known(intrinsics) => Some(intrinsics),
            Calibration::Unknown => None,
        }
    }
}

/// The scene description: the input of a reconstruction and, once it succeeds, its output.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub views: BTreeMap<ViewId, View>,
    pub intrinsics: BTreeMap<IntrinsicId, Calibration>,
    /// Poses of the registered views.
    pub poses: BTreeMap<PoseId, WorldToCamera>,
    pub landmarks: BTreeMap<TrackId, Landmark>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&mut self, id: ViewId, view: View) {
        self.views.insert(id, view);
    }

    pub fn add_intrinsic(&mut self, id: IntrinsicId, calibration: Calibration) {
        self.intrinsics.insert(id, calibration);
    }

    /// The known calibration of a view.
    pub fn view_intrinsics(&self, view: ViewId) -> Option<&CameraIntrinsics> {
        let intrinsic = self.views.get(&view)?.intrinsic?;
        self.intrinsics.get(&intrinsic)?.known()
    }

    /// Gives every view a calibration group.
    ///
    /// Views without a group get a new unknown group. A group that is referenced but missing,
    /// or that is unknown and shared by several views, is an error.
    pub(crate) fn resolve_intrinsics(
        &self,
    ) -> Result<(BTreeMap<ViewId, IntrinsicId>, BTreeMap<IntrinsicId, Calibration>), ConfigError>
    {
        let mut calibrations = self.intrinsics.clone();
        let mut assignment = BTreeMap::new();
        let mut next = self
            .intrinsics
            .keys()
            .chain(self.views.values().filter_map(|view| view.intrinsic.as_ref()))
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0);
        let mut members: BTreeMap<IntrinsicId, usize> = BTreeMap::new();
        for (&view_id, view) in &self.views {
            let intrinsic = match view.intrinsic {
                Some(intrinsic) => {
                    if !calibrations.contains_key(&intrinsic) {
                        return Err(ConfigError::MissingIntrinsic {
                            view: view_id,
                            intrinsic,
                        });
                    }
                    intrinsic
                }
                None => {
                    let intrinsic = IntrinsicId(next);
                    next += 1;
                    calibrations.insert(intrinsic, Calibration::Unknown);
                    intrinsic
                }
            };
            *members.entry(intrinsic).or_default() += 1;
            assignment.insert(view_id, intrinsic);
        }
        for (&intrinsic, &views) in &members {
            if views > 1 && calibrations.get(&intrinsic) == Some(&Calibration::Unknown) {
                return Err(ConfigError::UnknownSharedIntrinsic { intrinsic, views });
            }
        }
        Ok((assignment, calibrations))
    }
}
