use crate::{Reconstruction, SfmSettings, VisibilityIndex};
use cv_core::ViewId;
use log::*;
use std::collections::{BTreeMap, BTreeSet};

/// Picks the views to resect next.
///
/// A view whose resection failed is held back until it sees more triangulated tracks than it
/// did at the failed attempt, so the same attempt is never repeated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResectionScheduler {
    blocked: BTreeMap<ViewId, usize>,
}

impl ResectionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next batch with the triangulated track count of each view.
    ///
    /// A view is selected if it sees at least `min_resection_tracks` landmarks and at least
    /// `resection_ratio` times as many as the best view. The batch is ordered by count
    /// descending, then by view id. An empty batch means no view can be resected anymore.
    pub fn candidates(
        &self,
        settings: &SfmSettings,
        visibility: &VisibilityIndex,
        reconstruction: &Reconstruction,
        remaining: &BTreeSet<ViewId>,
    ) -> Vec<(ViewId, usize)> {
        let mut counts: Vec<(ViewId, usize)> = remaining
            .iter()
            .map(|&view| (view, visibility.triangulated(view, reconstruction).count()))
            .filter(|&(view, count)| self.blocked.get(&view).map_or(true, |&at| count > at))
            .collect();
        let best = counts.iter().map(|&(_, count)| count).max().unwrap_or(0);
        let floor = (settings.resection_ratio * best as f64)
            .ceil()
            .max(settings.min_resection_tracks as f64);
        counts.retain(|&(_, count)| count as f64 >= floor);
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        trace!("resection candidates {:?}", counts);
        counts
    }

    /// Holds a view back until it sees more than `count` triangulated tracks.
    pub fn mark_failed(&mut self, view: ViewId, count: usize) {
        self.blocked.insert(view, count);
    }

    pub fn is_blocked(&self, view: ViewId) -> bool {
        self.blocked.contains_key(&view)
    }

    /// Forgets a view, once it is registered.
    pub fn clear(&mut self, view: ViewId) {
        self.blocked.remove(&view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Landmark, Observation, Track, Tracks};
    use cv_core::{
        nalgebra::{Point2, Point3},
        FeatureId, TrackId,
    };
    use maplit::btreemap;

    /// View 1 sees tracks 0..100, view 2 tracks 0..80, view 3 tracks 0..40 and view 4 tracks
    /// 0..20. Every track is also seen by view 9, which makes them tracks.
    fn scene() -> (VisibilityIndex, Reconstruction) {
        let observation = Observation {
            feature: FeatureId(0),
            pixel: Point2::origin(),
        };
        let limits = btreemap! { 1u32 => 100usize, 2 => 80, 3 => 40, 4 => 20 };
        let tracks: Tracks = (0..100)
            .map(|ix| {
                let mut track: Vec<(ViewId, Observation)> = limits
                    .iter()
                    .filter(|&(_, &limit)| ix < limit)
                    .map(|(&view, _)| (ViewId(view), observation))
                    .collect();
                track.push((ViewId(9), observation));
                track.into_iter().collect::<Track>()
            })
            .collect();
        let mut reconstruction = Reconstruction::new();
        for id in 0..100 {
            reconstruction.landmarks.insert(
                TrackId(id),
                Landmark {
                    point: Point3::origin(),
                    observations: BTreeMap::new(),
                },
            );
        }
        (VisibilityIndex::new(&tracks), reconstruction)
    }

    fn remaining() -> BTreeSet<ViewId> {
        [1, 2, 3, 4].iter().map(|&v| ViewId(v)).collect()
    }

    #[test]
    fn batch_holds_views_close_to_the_best() {
        let (visibility, reconstruction) = scene();
        let scheduler = ResectionScheduler::new();
        let batch = scheduler.candidates(&SfmSettings::default(), &visibility, &reconstruction, &remaining());
        assert_eq!(batch, vec![(ViewId(1), 100), (ViewId(2), 80)]);
    }

    #[test]
    fn absolute_floor_applies() {
        let (visibility, reconstruction) = scene();
        let settings = SfmSettings {
            resection_ratio: 0.1,
            ..SfmSettings::default()
        };
        let batch = ResectionScheduler::new().candidates(&settings, &visibility, &reconstruction, &remaining());
        let views: Vec<ViewId> = batch.iter().map(|&(view, _)| view).collect();
        assert_eq!(views, vec![ViewId(1), ViewId(2), ViewId(3)]);
    }

    #[test]
    fn failed_views_wait_for_more_tracks() {
        let (visibility, mut reconstruction) = scene();
        let mut scheduler = ResectionScheduler::new();
        scheduler.mark_failed(ViewId(1), 100);
        let batch = scheduler.candidates(&SfmSettings::default(), &visibility, &reconstruction, &remaining());
        assert_eq!(batch, vec![(ViewId(2), 80)]);

        scheduler.mark_failed(ViewId(2), 80);
        scheduler.mark_failed(ViewId(3), 40);
        scheduler.mark_failed(ViewId(4), 20);
        assert!(scheduler
            .candidates(&SfmSettings::default(), &visibility, &reconstruction, &remaining())
            .is_empty());

        // Losing landmarks never unblocks a view.
        reconstruction.landmarks.remove(&TrackId(0));
        assert!(scheduler
            .candidates(&SfmSettings::default(), &visibility, &reconstruction, &remaining())
            .is_empty());
    }

    #[test]
    fn nothing_is_scheduled_without_landmarks() {
        let (visibility, _) = scene();
        let batch = ResectionScheduler::new().candidates(
            &SfmSettings::default(),
            &visibility,
            &Reconstruction::new(),
            &remaining(),
        );
        assert!(batch.is_empty());
    }
}
