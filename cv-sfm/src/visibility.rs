use crate::{Reconstruction, Tracks};
use cv_core::{TrackId, ViewId};
use std::collections::{BTreeMap, BTreeSet};

/// For each view, the sorted ids of the tracks that observe it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityIndex {
    per_view: BTreeMap<ViewId, Vec<TrackId>>,
}

impl VisibilityIndex {
    pub fn new(tracks: &Tracks) -> Self {
        let mut per_view: BTreeMap<ViewId, Vec<TrackId>> = BTreeMap::new();
        // Tracks are iterated in ascending id order, so every list ends up sorted.
        for (id, track) in tracks.iter() {
            for view in track.views() {
                per_view.entry(view).or_default().push(id);
            }
        }
        Self { per_view }
    }

    /// Views seen by at least one track.
    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.per_view.keys().copied()
    }

    /// Tracks visible in a view.
    pub fn tracks(&self, view: ViewId) -> &[TrackId] {
        self.per_view.get(&view).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tracks visible in both views, in ascending order.
    ///
    /// The shorter list is scanned and each entry is searched in the longer one.
    pub fn shared(&self, a: ViewId, b: ViewId) -> Vec<TrackId> {
        let (a, b) = (self.tracks(a), self.tracks(b));
        let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        short
            .iter()
            .copied()
            .filter(|track| long.binary_search(track).is_ok())
            .collect()
    }

    /// Groups the views that are linked through shared tracks.
    ///
    /// Components are listed in the order of their smallest view.
    pub fn components(&self) -> Vec<BTreeSet<ViewId>> {
        let mut unvisited: BTreeSet<ViewId> = self.views().collect();
        let mut components = Vec::new();
        while let Some(start) = unvisited.pop_first() {
            let mut component = BTreeSet::from([start]);
            let mut stack = vec![start];
            while let Some(view) = stack.pop() {
                let linked: Vec<ViewId> = unvisited
                    .iter()
                    .copied()
                    .filter(|&other| !self.shared(view, other).is_empty())
                    .collect();
                for other in linked {
                    unvisited.remove(&other);
                    component.insert(other);
                    stack.push(other);
                }
            }
            components.push(component);
        }
        components
    }

    /// Tracks visible in a view that already have a landmark.
    pub fn triangulated<'a>(
        &'a self,
        view: ViewId,
        reconstruction: &'a Reconstruction,
    ) -> impl Iterator<Item = TrackId> + 'a {
        self.tracks(view)
            .iter()
            .copied()
            .filter(move |track| reconstruction.landmarks.contains_key(track))
    }
}
