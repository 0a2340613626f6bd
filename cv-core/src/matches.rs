use nalgebra::{Point2, Point3, UnitVector3};

/// A pair of bearings, one from each of two cameras, that observe the same point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch(pub UnitVector3<f64>, pub UnitVector3<f64>);

/// A bearing observed by a camera matched to the world point it observes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureWorldMatch(pub UnitVector3<f64>, pub Point3<f64>);

/// An image point in pixels matched to a world point.
///
/// This is used when the calibration of the camera is unknown and the camera has to be
/// resected as a full projective camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelWorldMatch(pub Point2<f64>, pub Point3<f64>);

/// Three bearings observing the same point from three cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletMatch(pub [UnitVector3<f64>; 3]);
