//! Sequential structure from motion.
//!
//! The [`SequentialEngine`] takes a [`Scene`] of views, a [`FeaturesProvider`] and a
//! [`MatchesProvider`], and grows a single reconstruction from a seed pair:
//!
//! 1. pairwise matches are fused into [`Tracks`];
//! 2. a seed pair (or a user triplet with the `triplet` feature) is chosen and triangulated;
//! 3. batches of views chosen by the [`ResectionScheduler`] are resected against the landmarks;
//! 4. newly visible tracks are triangulated and everything is bundle adjusted with [`refine`].
//!
//! The engine writes the poses, intrinsics and landmarks back into the scene and summarizes the
//! run in [`Statistics`], which can be rendered with [`write_html_report`].
//!
//! Every random choice is driven by generators seeded from [`SfmSettings::rng_seed`], and every
//! parallel stage collects its results in input order, so runs are reproducible regardless of
//! the number of threads.

mod engine;
mod error;
mod initializer;
mod problem;
mod reconstruction;
mod refiner;
mod report;
mod resector;
mod scene;
mod scheduler;
mod seed;
mod settings;
mod stats;
mod tracks;
mod triangulator;
mod visibility;

#[cfg(test)]
mod synthetic;

pub use engine::*;
pub use error::*;
pub use reconstruction::*;
pub use refiner::*;
pub use report::*;
pub use resector::Resection;
pub use scene::*;
pub use scheduler::*;
pub use seed::{Seed, SeedCandidate, SeedRanking};
pub use settings::*;
pub use stats::*;
pub use tracks::*;
pub use triangulator::TriangulationReport;
pub use visibility::*;

/// Derives the seed of the generator used by one step from the base seed.
///
/// This is the SplitMix64 finalizer, so neighbouring steps get unrelated streams.
pub(crate) fn derive_seed(base: u64, step: u64) -> u64 {
    let mut z = base ^ step.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
