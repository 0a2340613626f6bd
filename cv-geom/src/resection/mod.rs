//! Absolute pose (resection) solvers.
//!
//! Every solver estimates the [`WorldToCamera`] pose of a camera from bearings matched to known
//! world points, except [`ProjectiveDlt`] which estimates a full projection matrix from pixels when
//! the camera calibration is unknown.

mod dlt;
mod epnp;
mod ke;
mod kneip;
mod nordberg;
mod up2p;

pub use dlt::*;
pub use epnp::*;
pub use ke::*;
pub use kneip::*;
pub use nordberg::*;
pub use up2p::*;

use crate::UnknownVariant;
use core::fmt;
use core::str::FromStr;
use cv_core::{
    nalgebra::{Matrix3, Point3, Rotation3, Vector3},
    FeatureWorldMatch, Pose, WorldToCamera,
};

/// The minimal or linear solver used to hypothesize camera poses during resection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ResectionMethod {
    /// [`KeP3p`]
    P3pKe,
    /// [`KneipP3p`]
    P3pKneip,
    /// [`LambdaTwist`]
    P3pNordberg,
    /// [`Up2p`], only valid when the vertical direction of the camera is known.
    Up2pKukelova,
    /// [`EPnP`]
    Epnp,
    /// [`Dlt6Points`] with known intrinsics, [`ProjectiveDlt`] without.
    Dlt6Points,
    /// Picks a method depending on whether the intrinsics are known.
    Default,
}

impl ResectionMethod {
    pub const ALL: [ResectionMethod; 7] = [
        ResectionMethod::P3pKe,
        ResectionMethod::P3pKneip,
        ResectionMethod::P3pNordberg,
        ResectionMethod::Up2pKukelova,
        ResectionMethod::Epnp,
        ResectionMethod::Dlt6Points,
        ResectionMethod::Default,
    ];

    /// Resolves [`ResectionMethod::Default`] to a concrete method.
    ///
    /// Without known intrinsics only the DLT can estimate the calibration, so every method
    /// resolves to it in that case.
    pub fn resolve(self, intrinsics_known: bool) -> Self {
        match (self, intrinsics_known) {
            (_, false) => ResectionMethod::Dlt6Points,
            (ResectionMethod::Default, true) => ResectionMethod::P3pKe,
            (method, true) => method,
        }
    }

    /// Size of the minimal sample of the resolved method.
    pub fn min_samples(self, intrinsics_known: bool) -> usize {
        match self.resolve(intrinsics_known) {
            ResectionMethod::Up2pKukelova => 2,
            ResectionMethod::Epnp | ResectionMethod::Dlt6Points => 6,
            _ => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ResectionMethod::P3pKe => "P3P_KE",
            ResectionMethod::P3pKneip => "P3P_KNEIP",
            ResectionMethod::P3pNordberg => "P3P_NORDBERG",
            ResectionMethod::Up2pKukelova => "UP2P_KUKELOVA",
            ResectionMethod::Epnp => "EPNP",
            ResectionMethod::Dlt6Points => "DLT_6POINTS",
            ResectionMethod::Default => "DEFAULT",
        }
    }
}

impl Default for ResectionMethod {
    fn default() -> Self {
        ResectionMethod::Default
    }
}

impl fmt::Display for ResectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResectionMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant::new("resection method", s))
    }
}

/// Takes exactly three samples from the iterator.
fn three<I>(mut data: I) -> Option<[FeatureWorldMatch; 3]>
where
    I: Iterator<Item = FeatureWorldMatch>,
{
    Some([data.next()?, data.next()?, data.next()?])
}

/// Checks that every match lies in front of the camera, along its bearing.
pub(crate) fn in_front_of_camera(pose: WorldToCamera, data: &[FeatureWorldMatch]) -> bool {
    data.iter()
        .all(|&FeatureWorldMatch(bearing, point)| pose.transform(point).coords.dot(&bearing) > 0.0)
}

/// The translation that best aligns the rays of the bearings with the rotated world points.
///
/// Minimizes the sum of squared distances of `R X + t` to the bearing rays.
pub(crate) fn translation_for_rotation(
    rotation: &Rotation3<f64>,
    data: &[FeatureWorldMatch],
) -> Option<Vector3<f64>> {
    let mut lhs = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for &FeatureWorldMatch(bearing, point) in data {
        let rejection = Matrix3::identity() - bearing.into_inner() * bearing.transpose();
        lhs += rejection;
        rhs -= rejection * (rotation * point.coords);
    }
    lhs.try_inverse().map(|inverse| inverse * rhs)
}

/// The rotation closest to `matrix` in the Frobenius sense.
pub(crate) fn nearest_rotation(matrix: Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = matrix.try_svd(true, true, 1e-12, 1000)?;
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut correction = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        let (smallest, _) = svd.singular_values.argmin();
        correction[(smallest, smallest)] = -1.0;
    }
    Some(Rotation3::from_matrix_unchecked(u * correction * v_t))
}

/// Rigid transform (without scale) that maps `from` onto `to` in the least squares sense.
///
/// From the paper "Least-squares estimation of transformation parameters between two point
/// patterns" by Shinji Umeyama.
pub(crate) fn rigid_alignment(from: &[Point3<f64>], to: &[Point3<f64>]) -> Option<WorldToCamera> {
    if from.len() != to.len() || from.len() < 3 {
        return None;
    }
    let count = from.len() as f64;
    let from_mean = from.iter().fold(Vector3::zeros(), |s, p| s + p.coords) / count;
    let to_mean = to.iter().fold(Vector3::zeros(), |s, p| s + p.coords) / count;
    let covariance = from
        .iter()
        .zip(to)
        .fold(Matrix3::zeros(), |s, (a, b)| {
            s + (a.coords - from_mean) * (b.coords - to_mean).transpose()
        });
    let rotation = nearest_rotation(covariance.transpose())?;
    let translation = to_mean - rotation * from_mean;
    Some(WorldToCamera::from_parts(translation, rotation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse() {
        for method in ResectionMethod::ALL {
            assert_eq!(method.to_string().parse::<ResectionMethod>().unwrap(), method);
        }
        assert_eq!("p3p_ke".parse::<ResectionMethod>().unwrap(), ResectionMethod::P3pKe);
        assert!("P4P".parse::<ResectionMethod>().is_err());
    }

    #[test]
    fn default_depends_on_calibration() {
        assert_eq!(ResectionMethod::Default.resolve(true), ResectionMethod::P3pKe);
        assert_eq!(ResectionMethod::Default.resolve(false), ResectionMethod::Dlt6Points);
        assert_eq!(ResectionMethod::Epnp.resolve(false), ResectionMethod::Dlt6Points);
        assert_eq!(ResectionMethod::Up2pKukelova.min_samples(true), 2);
        assert_eq!(ResectionMethod::Default.min_samples(false), 6);
    }

    #[test]
    fn rigid_alignment_recovers_transform() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.5, -1.0, 2.0),
            Rotation3::from_euler_angles(0.3, -0.2, 0.9),
        );
        let from = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.5),
            Point3::new(0.0, 2.0, 0.0),
            Point3::new(-1.0, 0.3, 1.0),
        ];
        let to: Vec<_> = from.iter().map(|&p| pose.transform(p)).collect();
        let found = rigid_alignment(&from, &to).unwrap();
        assert!((found.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-9);
    }
}
