use crate::{derive_seed, initializer::relative_pose, problem::Problem, ConfigError, SfmSettings};
use core::fmt;
use cv_core::{FeatureMatch, ViewId};
use itertools::Itertools;
use log::*;
use std::collections::BTreeMap;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The views an initial reconstruction is built from.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Seed {
    Pair(ViewId, ViewId),
    Triplet(ViewId, ViewId, ViewId),
}

impl Seed {
    pub fn views(self) -> Vec<ViewId> {
        match self {
            Seed::Pair(a, b) => vec![a, b],
            Seed::Triplet(a, b, c) => vec![a, b, c],
        }
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seed::Pair(a, b) => write!(f, "({}, {})", a, b),
            Seed::Triplet(a, b, c) => write!(f, "({}, {}, {})", a, b, c),
        }
    }
}

/// A view pair that passed every seed check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedCandidate {
    pub pair: (ViewId, ViewId),
    /// Number of views linked to the pair through shared tracks.
    pub component: usize,
    /// Tracks seen by both views.
    pub shared: usize,
    /// Relative pose inliers.
    pub inliers: usize,
    pub median_angle_degrees: f64,
    /// `inliers * median_angle_degrees`
    pub score: f64,
}

impl SeedCandidate {
    pub fn seed(&self) -> Seed {
        Seed::Pair(self.pair.0, self.pair.1)
    }
}

/// The ranked seed candidates and the number of pairs that were evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedRanking {
    pub candidates: Vec<SeedCandidate>,
    pub attempted: usize,
}

/// Checks the seed given in the settings against the views of the scene.
///
/// Returns `None` when the seed is to be chosen automatically. A triplet takes precedence over
/// a pair.
pub(crate) fn user_seed(
    settings: &SfmSettings,
    problem: &Problem,
) -> Result<Option<Seed>, ConfigError> {
    let seed = if settings.has_seed_triplet() {
        if cfg!(not(feature = "triplet")) {
            return Err(ConfigError::TripletDisabled);
        }
        let (a, b, c) = settings.seed_triplet;
        Seed::Triplet(a, b, c)
    } else if settings.has_seed_pair() {
        let (a, b) = settings.seed_pair;
        Seed::Pair(a, b)
    } else {
        return Ok(None);
    };

    let views = seed.views();
    for (ix, &view) in views.iter().enumerate() {
        if views[..ix].contains(&view) {
            return Err(ConfigError::DuplicateSeedView(view));
        }
        let info = problem
            .views
            .get(&view)
            .ok_or(ConfigError::UnknownSeedView(view))?;
        if info.calibration.known().is_none() {
            return Err(ConfigError::UncalibratedSeedView(view));
        }
    }
    Ok(Some(seed))
}

impl Problem {
    /// Scores every pair of seedable views and returns those that pass, best first.
    ///
    /// Pairs inside a larger group of linked views come before any pair of a smaller group,
    /// since a seed can only grow into the views it is linked to. Within a group, pairs are
    /// ordered by score.
    ///
    /// Each pair gets its own generator seeded from `seed` and the position of the pair, so the
    /// ranking does not depend on the order pairs are evaluated in.
    pub(crate) fn rank_seeds(&self, seed: u64) -> SeedRanking {
        let settings = &self.settings;
        let seedable: Vec<ViewId> = self
            .views
            .keys()
            .copied()
            .filter(|&view| self.is_seedable(view))
            .collect();
        let pairs: Vec<(usize, (ViewId, ViewId))> = seedable
            .iter()
            .copied()
            .tuple_combinations()
            .filter(|&(a, b)| self.visibility.shared(a, b).len() >= settings.min_shared_tracks)
            .enumerate()
            .collect();
        let attempted = pairs.len();

        let mut component_sizes: BTreeMap<ViewId, usize> = BTreeMap::new();
        for component in self.visibility.components() {
            for &view in &component {
                component_sizes.insert(view, component.len());
            }
        }

        let score = |&(ix, (a, b)): &(usize, (ViewId, ViewId))| {
            let component = component_sizes.get(&a).copied().unwrap_or(0);
            self.score_pair(a, b, component, derive_seed(seed, ix as u64))
        };
        #[cfg(not(feature = "rayon"))]
        let scored: Vec<Option<SeedCandidate>> = pairs.iter().map(score).collect();
        #[cfg(feature = "rayon")]
        let scored: Vec<Option<SeedCandidate>> = pairs.par_iter().map(score).collect();

        let mut candidates: Vec<SeedCandidate> = scored.into_iter().flatten().collect();
        candidates.sort_by(|a, b| {
            b.component
                .cmp(&a.component)
                .then(b.score.total_cmp(&a.score))
                .then(a.pair.cmp(&b.pair))
        });
        info!(
            "{} of {} view pairs are seed candidates",
            candidates.len(),
            attempted
        );
        SeedRanking {
            candidates,
            attempted,
        }
    }

    fn score_pair(
        &self,
        a: ViewId,
        b: ViewId,
        component: usize,
        seed: u64,
    ) -> Option<SeedCandidate> {
        let settings = &self.settings;
        let ia = self.views.get(&a)?.calibration.known().copied()?;
        let ib = self.views.get(&b)?.calibration.known().copied()?;
        let matches: Vec<FeatureMatch> = self
            .visibility
            .shared(a, b)
            .into_iter()
            .filter_map(|id| {
                let track = self.tracks.get(id)?;
                Some(FeatureMatch(
                    ia.bearing(track.get(a)?.pixel),
                    ib.bearing(track.get(b)?.pixel),
                ))
            })
            .collect();
        let shared = matches.len();
        if shared < settings.min_shared_tracks {
            trace!("pair {} {} shares only {} tracks", a, b, shared);
            return None;
        }

        let focal = (ia.focal + ib.focal) / 2.0;
        let dimensions = self.views.get(&a)?.dimensions();
        let relative = match relative_pose(settings, &matches, dimensions, focal, seed) {
            Some(relative) => relative,
            None => {
                trace!("pair {} {} has no relative pose", a, b);
                return None;
            }
        };
        let inliers = relative.inliers.len();
        let ratio = inliers as f64 / shared as f64;
        if ratio < settings.min_inlier_ratio {
            debug!(
                "only found {} of {} inliers for pair {} {}; rejecting pair",
                inliers, shared, a, b
            );
            return None;
        }

        let mut angles = relative.inlier_angles(settings, &matches);
        if angles.is_empty() {
            return None;
        }
        angles.sort_by(f64::total_cmp);
        let median = angles[angles.len() / 2];
        if median < settings.min_seed_angle_degrees || median > settings.max_seed_angle_degrees {
            debug!(
                "median angle {:.2} of pair {} {} is out of range; rejecting pair",
                median, a, b
            );
            return None;
        }
        let candidate = SeedCandidate {
            pair: (a, b),
            component,
            shared,
            inliers,
            median_angle_degrees: median,
            score: inliers as f64 * median,
        };
        debug!("seed candidate {:?}", candidate);
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{synthetic::Synthetic, PairwiseMatches};
    use cv_core::FeatureId;

    #[test]
    fn wider_baseline_ranks_first() {
        let synthetic = Synthetic::rig(&[0.0, 0.3, 0.9], 120, 0.2, 17);
        let problem = synthetic.problem();
        let ranking = problem.rank_seeds(1);
        assert_eq!(ranking.attempted, 3);
        let first = ranking.candidates.first().unwrap();
        assert_eq!(first.pair, (ViewId(1), ViewId(3)));
        assert!(ranking
            .candidates
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn larger_groups_of_linked_views_rank_first() {
        let mut synthetic = Synthetic::rig(&[0.0, 0.3, 0.6, 1.0, 2.0], 120, 0.2, 9);
        // Views 1 to 3 share the first half of the points, views 4 and 5 the second half.
        let mut matches = PairwiseMatches::new();
        for (a, b) in [(1, 2), (1, 3), (2, 3)] {
            matches.insert(ViewId(a), ViewId(b), (0..60).map(|k| (FeatureId(k), FeatureId(k))));
        }
        matches.insert(ViewId(4), ViewId(5), (60..120).map(|k| (FeatureId(k), FeatureId(k))));
        synthetic.matches = matches;

        let ranking = synthetic.problem().rank_seeds(3);
        let first = ranking.candidates.first().unwrap();
        let last = ranking.candidates.last().unwrap();
        assert_eq!((first.pair, first.component), ((ViewId(1), ViewId(3)), 3));
        assert_eq!((last.pair, last.component), ((ViewId(4), ViewId(5)), 2));
        assert!(last.score > first.score);
    }

    #[test]
    fn ranking_is_reproducible() {
        let synthetic = Synthetic::rig(&[0.0, 0.4, 0.8, 1.2], 80, 0.3, 2);
        let problem = synthetic.problem();
        assert_eq!(problem.rank_seeds(5), problem.rank_seeds(5));
    }

    #[test]
    fn too_few_shared_tracks_are_not_attempted() {
        let synthetic = Synthetic::rig(&[0.0, 0.5], 40, 0.0, 4);
        let problem = synthetic.problem();
        let ranking = problem.rank_seeds(0);
        assert_eq!(ranking.attempted, 0);
        assert!(ranking.candidates.is_empty());
    }

    #[test]
    fn user_seeds_are_validated() {
        let synthetic = Synthetic::rig(&[0.0, 0.5], 40, 0.0, 4);
        let problem = synthetic.problem();
        let mut settings = SfmSettings::default();
        assert_eq!(user_seed(&settings, &problem), Ok(None));

        settings.seed_pair = (ViewId(2), ViewId(1));
        assert_eq!(
            user_seed(&settings, &problem),
            Ok(Some(Seed::Pair(ViewId(2), ViewId(1))))
        );
        settings.seed_pair = (ViewId(2), ViewId(2));
        assert_eq!(
            user_seed(&settings, &problem),
            Err(ConfigError::DuplicateSeedView(ViewId(2)))
        );
        settings.seed_pair = (ViewId(1), ViewId(7));
        assert_eq!(
            user_seed(&settings, &problem),
            Err(ConfigError::UnknownSeedView(ViewId(7)))
        );
    }

    #[cfg(not(feature = "triplet"))]
    #[test]
    fn triplet_needs_the_feature() {
        let synthetic = Synthetic::rig(&[0.0, 0.5, 1.0], 40, 0.0, 4);
        let problem = synthetic.problem();
        let settings = SfmSettings {
            seed_triplet: (ViewId(1), ViewId(2), ViewId(3)),
            ..SfmSettings::default()
        };
        assert_eq!(
            user_seed(&settings, &problem),
            Err(ConfigError::TripletDisabled)
        );
    }

    #[test]
    fn seeds_display_their_views() {
        assert_eq!(Seed::Pair(ViewId(1), ViewId(3)).to_string(), "(1, 3)");
    }
}
