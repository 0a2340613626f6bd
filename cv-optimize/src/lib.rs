//! Non-linear refinement of reconstructions.
//!
//! [`BundleAdjuster`] jointly refines camera poses, intrinsics and world points by minimizing the
//! pixel reprojection error with a Levenberg-Marquardt loop that eliminates the points through
//! the Schur complement. [`PoseRefiner`] refines the pose of a single camera against fixed world
//! points and is solved with the `levenberg-marquardt` crate.

mod bundle;
mod pose;

pub use bundle::*;
pub use pose::*;

use cv_core::{
    nalgebra::{Rotation3, Vector3},
    Pose, WorldToCamera,
};
use std::ops::Add;
use thiserror::Error;

/// Failures of the optimizers. Running out of iterations is not one of them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizeError {
    #[error("the cost became non-finite ({cost})")]
    NonFiniteCost { cost: f64 },
    #[error("the optimized {what} has non-finite values")]
    NonFiniteParameters { what: &'static str },
    #[error("observation {observation} refers to a missing {what}")]
    InvalidIndex {
        observation: usize,
        what: &'static str,
    },
    #[error("no valid observation to optimize")]
    NoObservations,
}

/// A small motion of a camera.
///
/// The rotation is applied on the left, `R ← exp(ω) R`, and the translation is added,
/// `t ← t + δt`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Se3TangentSpace {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Se3TangentSpace {
    pub fn identity() -> Self {
        Self {
            rotation: Vector3::zeros(),
            translation: Vector3::zeros(),
        }
    }

    /// Reads `[ω, δt]` from a slice of six values.
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            rotation: Vector3::new(values[0], values[1], values[2]),
            translation: Vector3::new(values[3], values[4], values[5]),
        }
    }

    /// The tangent with a single non-zero component.
    pub fn axis(component: usize, step: f64) -> Self {
        let mut values = [0.0; 6];
        values[component] = step;
        Self::from_slice(&values)
    }

    /// Moves a pose along this tangent.
    #[must_use]
    pub fn apply(self, pose: WorldToCamera) -> WorldToCamera {
        let isometry = pose.isometry();
        let rotation = Rotation3::from_scaled_axis(self.rotation) * isometry.rotation;
        WorldToCamera::from_parts(isometry.translation.vector + self.translation, rotation)
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.iter().chain(self.translation.iter()).all(|n| n.is_finite())
    }
}

impl Add for Se3TangentSpace {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            translation: self.translation + rhs.translation,
            rotation: self.rotation + rhs.rotation,
        }
    }
}

/// Step used for central differences around `value`.
pub(crate) fn difference_step(value: f64) -> f64 {
    1e-6 * value.abs().max(1.0)
}
