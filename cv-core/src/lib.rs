//! # Core types for sequential structure from motion
//!
//! This crate holds the abstractions shared by every crate in the workspace: identifiers,
//! keypoints, bearing matches, poses, camera intrinsic models, and the triangulation traits.
//! It is intentionally small so that geometry solvers (`cv-geom`), the optimizer (`cv-optimize`)
//! and the reconstruction engine (`cv-sfm`) can agree on types without depending on each other.
//!
//! ## Frames
//!
//! Every camera frame uses the same convention: X points right, Y points down and Z points
//! forwards out of the optical center. A bearing is a unit vector in that frame. A
//! [`WorldToCamera`] pose maps a world point into the camera frame, so a point is in front of a
//! camera exactly when the Z coordinate of the transformed point is positive.
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!   @@@@@@@@@a@@@@@
//!           /
//!          O
//! ```
//!
//! Triangulation recovers `p` from the optical centers `O`, the poses, and the bearings through
//! `a` and `b`. Since the bearings come from noisy data they almost never intersect, which is why
//! several triangulation methods with different error models exist (see `cv-geom`).

mod camera;
mod ids;
mod keypoint;
mod matches;
mod pose;
mod triangulation;

pub use camera::*;
pub use ids::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use pose::*;
pub use sample_consensus;
pub use triangulation::*;
