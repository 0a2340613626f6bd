use crate::{FeaturesProvider, InputError, MatchesProvider, Observation};
use cv_core::{FeatureId, TrackId, ViewId, ViewPair};
use log::*;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Putative observations of one scene point, at most one per view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    observations: BTreeMap<ViewId, Observation>,
}

impl Track {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn get(&self, view: ViewId) -> Option<&Observation> {
        self.observations.get(&view)
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.observations.contains_key(&view)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ViewId, &Observation)> + '_ {
        self.observations.iter().map(|(&view, observation)| (view, observation))
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.observations.keys().copied()
    }
}

/// The tracks of a scene, indexed by [`TrackId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tracks {
    tracks: BTreeMap<TrackId, Track>,
}

impl Tracks {
    /// Fuses pairwise matches into tracks.
    ///
    /// Matched features are grouped with a union-find. A group that holds two features of the
    /// same view is discarded, and so are groups of a single feature. Track ids follow the order
    /// of the smallest `(view, feature)` of each group, so the result does not depend on the
    /// order of the pairs.
    ///
    /// Empty matches give empty tracks. Matches that refer to missing features are an error.
    pub fn build<F, M>(features: &F, matches: &M) -> Result<Self, InputError>
    where
        F: FeaturesProvider + Sync,
        M: MatchesProvider + Sync,
    {
        let pairs = matches.pairs();
        let edges_of = |&pair: &ViewPair| pair_edges(features, matches, pair);

        #[cfg(not(feature = "rayon"))]
        let edges: Vec<Vec<(Node, Node)>> = pairs.iter().map(edges_of).collect::<Result<_, _>>()?;
        #[cfg(feature = "rayon")]
        let edges: Vec<Vec<(Node, Node)>> = pairs.par_iter().map(edges_of).collect::<Result<_, _>>()?;

        let nodes: BTreeSet<Node> = edges
            .iter()
            .flatten()
            .flat_map(|&(a, b)| [a, b])
            .collect();
        let nodes: Vec<Node> = nodes.into_iter().collect();
        let index = |node: &Node| nodes.binary_search(node).unwrap_or_default();

        let mut sets = DisjointSets::new(nodes.len());
        for (a, b) in edges.iter().flatten() {
            sets.union(index(a), index(b));
        }

        // Nodes are visited in ascending order, so each component is discovered at its smallest
        // node and components are listed in the order of their smallest node.
        let mut components: Vec<Vec<usize>> = Vec::new();
        let mut component_of_root: BTreeMap<usize, usize> = BTreeMap::new();
        for ix in 0..nodes.len() {
            let root = sets.find(ix);
            let component = *component_of_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[component].push(ix);
        }

        let mut tracks = BTreeMap::new();
        let mut conflicting = 0;
        for component in components {
            if component.len() < 2 {
                continue;
            }
            let mut observations = BTreeMap::new();
            let mut unique = true;
            for &ix in &component {
                let node = nodes[ix];
                if observations.insert(node.view, node.observation).is_some() {
                    unique = false;
                    break;
                }
            }
            if !unique {
                conflicting += 1;
                continue;
            }
            let id = TrackId(tracks.len() as u32);
            tracks.insert(id, Track { observations });
        }
        info!(
            "built {} tracks from {} matched features, discarded {} conflicting groups",
            tracks.len(),
            nodes.len(),
            conflicting
        );
        Ok(Self { tracks })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, track: TrackId) -> Option<&Track> {
        self.tracks.get(&track)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &Track)> + '_ {
        self.tracks.iter().map(|(&id, track)| (id, track))
    }

    /// The views that appear in at least one track.
    pub fn views(&self) -> BTreeSet<ViewId> {
        self.tracks.values().flat_map(Track::views).collect()
    }
}

impl FromIterator<Track> for Tracks {
    fn from_iter<I: IntoIterator<Item = Track>>(iter: I) -> Self {
        Self {
            tracks: iter
                .into_iter()
                .enumerate()
                .map(|(ix, track)| (TrackId(ix as u32), track))
                .collect(),
        }
    }
}

impl FromIterator<(ViewId, Observation)> for Track {
    fn from_iter<I: IntoIterator<Item = (ViewId, Observation)>>(iter: I) -> Self {
        Self {
            observations: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Node {
    view: ViewId,
    observation: Observation,
}

impl Node {
    fn key(&self) -> (ViewId, FeatureId) {
        (self.view, self.observation.feature)
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

fn pair_edges<F, M>(features: &F, matches: &M, pair: ViewPair) -> Result<Vec<(Node, Node)>, InputError>
where
    F: FeaturesProvider,
    M: MatchesProvider,
{
    let node = |view: ViewId, feature: FeatureId| -> Result<Node, InputError> {
        let keypoints = features
            .features(view)
            .ok_or(InputError::MissingFeatures(view))?;
        let keypoint = keypoints
            .get(feature.index())
            .ok_or(InputError::FeatureOutOfRange {
                view,
                feature: feature.0,
                count: keypoints.len(),
            })?;
        Ok(Node {
            view,
            observation: Observation {
                feature,
                pixel: keypoint.0,
            },
        })
    };
    matches
        .matches(pair)
        .iter()
        .map(|&(a, b)| Ok((node(pair.first(), a)?, node(pair.second(), b)?)))
        .collect()
}

/// Union-find with path halving and union by size.
struct DisjointSets {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    fn find(&mut self, mut ix: usize) -> usize {
        while self.parent[ix] != ix {
            self.parent[ix] = self.parent[self.parent[ix]];
            ix = self.parent[ix];
        }
        ix
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        let (large, small) = if self.size[a] >= self.size[b] { (a, b) } else { (b, a) };
        self.parent[small] = large;
        self.size[large] += self.size[small];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PairwiseMatches;
    use cv_core::KeyPoint;
    use quickcheck_macros::quickcheck;

    const VIEWS: u32 = 4;
    const FEATURES: u32 = 6;

    fn features() -> BTreeMap<ViewId, Vec<KeyPoint>> {
        (0..VIEWS)
            .map(|view| {
                let keypoints = (0..FEATURES)
                    .map(|f| KeyPoint::new(f64::from(f), f64::from(view)))
                    .collect();
                (ViewId(view), keypoints)
            })
            .collect()
    }

    fn matches_from(raw: &[(u8, u8, u8, u8)]) -> PairwiseMatches {
        let mut matches = PairwiseMatches::new();
        for &(va, fa, vb, fb) in raw {
            let (va, vb) = (u32::from(va) % VIEWS, u32::from(vb) % VIEWS);
            let (fa, fb) = (u32::from(fa) % FEATURES, u32::from(fb) % FEATURES);
            matches.insert(ViewId(va), ViewId(vb), [(FeatureId(fa), FeatureId(fb))]);
        }
        matches
    }

    fn feature_of(tracks: &Tracks, view: ViewId, feature: FeatureId) -> Option<TrackId> {
        tracks
            .iter()
            .find(|(_, track)| track.get(view).map(|o| o.feature) == Some(feature))
            .map(|(id, _)| id)
    }

    #[test]
    fn chains_merge_and_conflicts_are_discarded() {
        let mut matches = PairwiseMatches::new();
        // 0:0 - 1:0 - 2:0 forms one track.
        matches.insert(ViewId(0), ViewId(1), [(FeatureId(0), FeatureId(0))]);
        matches.insert(ViewId(1), ViewId(2), [(FeatureId(0), FeatureId(0))]);
        // 0:1 - 1:1 - 0:2 sees view 0 twice.
        matches.insert(ViewId(0), ViewId(1), [(FeatureId(1), FeatureId(1))]);
        matches.insert(ViewId(1), ViewId(0), [(FeatureId(1), FeatureId(2))]);
        // 2:3 - 3:4 is a short track.
        matches.insert(ViewId(3), ViewId(2), [(FeatureId(4), FeatureId(3))]);

        let tracks = Tracks::build(&features(), &matches).unwrap();
        assert_eq!(tracks.len(), 2);
        let first = tracks.get(TrackId(0)).unwrap();
        assert_eq!(first.views().collect::<Vec<_>>(), vec![ViewId(0), ViewId(1), ViewId(2)]);
        assert_eq!(first.get(ViewId(2)).unwrap().pixel, KeyPoint::new(0.0, 2.0).0);
        let second = tracks.get(TrackId(1)).unwrap();
        assert_eq!(second.get(ViewId(3)).unwrap().feature, FeatureId(4));
        assert!(feature_of(&tracks, ViewId(0), FeatureId(1)).is_none());
    }

    #[test]
    fn empty_matches_give_empty_tracks() {
        let tracks = Tracks::build(&features(), &PairwiseMatches::new()).unwrap();
        assert!(tracks.is_empty());
        assert!(tracks.views().is_empty());
    }

    #[test]
    fn out_of_range_features_are_rejected() {
        let mut matches = PairwiseMatches::new();
        matches.insert(ViewId(0), ViewId(1), [(FeatureId(0), FeatureId(40))]);
        assert_eq!(
            Tracks::build(&features(), &matches),
            Err(InputError::FeatureOutOfRange {
                view: ViewId(1),
                feature: 40,
                count: FEATURES as usize
            })
        );
        let mut matches = PairwiseMatches::new();
        matches.insert(ViewId(0), ViewId(9), [(FeatureId(0), FeatureId(0))]);
        assert_eq!(
            Tracks::build(&features(), &matches),
            Err(InputError::MissingFeatures(ViewId(9)))
        );
    }

    #[quickcheck]
    fn tracks_are_consistent_with_matches(raw: Vec<(u8, u8, u8, u8)>) -> bool {
        let matches = matches_from(&raw);
        let tracks = match Tracks::build(&features(), &matches) {
            Ok(tracks) => tracks,
            Err(_) => return false,
        };
        let shapes_valid = tracks.iter().all(|(_, track)| track.len() >= 2);
        let matches_respected = matches.pairs().into_iter().all(|pair| {
            matches.matches(pair).iter().all(|&(a, b)| {
                let ta = feature_of(&tracks, pair.first(), a);
                let tb = feature_of(&tracks, pair.second(), b);
                // A match is either inside one track or both ends were discarded.
                ta == tb
            })
        });
        let ids_dense = tracks
            .iter()
            .enumerate()
            .all(|(ix, (id, _))| id == TrackId(ix as u32));
        shapes_valid && matches_respected && ids_dense
    }

    #[quickcheck]
    fn tracks_do_not_depend_on_insertion_order(raw: Vec<(u8, u8, u8, u8)>) -> bool {
        let reversed: Vec<_> = raw.iter().rev().copied().collect();
        Tracks::build(&features(), &matches_from(&raw)) == Tracks::build(&features(), &matches_from(&reversed))
    }
}
