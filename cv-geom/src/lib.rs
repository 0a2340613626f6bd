//! Geometric solvers used by the sequential reconstruction engine.
//!
//! ## Triangulation
//!
//! In this problem we know the pose of each camera and the bearing of the same feature
//! observed in each camera frame. We want to find the point of intersection from all cameras.
//! See [`triangulation`].
//!
//! ## Relative pose
//!
//! [`FivePoint`] estimates the relative pose of two calibrated cameras from five bearing matches,
//! and [`EightPoint`] fits an essential matrix linearly to eight or more.
//! The essential matrix helpers in [`essential`] decompose and disambiguate the solutions.
//!
//! ## Resection
//!
//! The [`resection`] module contains the minimal and linear absolute pose solvers
//! selectable through [`ResectionMethod`].
//!
//! ## Triplets
//!
//! [`TripletEstimator`] estimates the poses of three views at once from matches seen in all of
//! them.
//!
//! ## Consensus
//!
//! [`AcRansac`] is an a-contrario RANSAC that estimates the inlier threshold from the data, and
//! [`MaxConsensus`] is a bounded fixed-threshold RANSAC. Both implement
//! [`sample_consensus::Consensus`](cv_core::sample_consensus::Consensus) so that any
//! [`Estimator`](cv_core::sample_consensus::Estimator) in this crate can be used with them.

mod consensus;
mod eight_point;
pub mod essential;
mod five_point;
mod polynomial;
pub mod resection;
pub mod triangulation;
mod triplet;

pub use consensus::*;
pub use eight_point::*;
pub use essential::EssentialMatrix;
pub use five_point::*;
pub use resection::ResectionMethod;
pub use triangulation::TriangulationMethod;
pub use triplet::*;

use core::fmt;

/// Returned when a configuration enumeration is parsed from an unrecognized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}
