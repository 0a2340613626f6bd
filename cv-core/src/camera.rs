use crate::{KeyPoint, Pose, WorldToCamera};
use core::fmt;
use core::str::FromStr;
use nalgebra::{Matrix3, Point2, Point3, UnitVector3, Vector2, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows conversion between the point on an image and the bearing of the ray that produced it.
pub trait CameraModel {
    /// Extracts a bearing from a pixel location in an image.
    ///
    /// The bearings X axis points right, Y axis points down, and Z axis points forwards.
    /// The image point uses the same coordiate frame. Its Y is down and its X is right.
    fn calibrate(&self, point: KeyPoint) -> UnitVector3<f64>;

    /// Extracts the pixel location in the image from the bearing.
    ///
    /// Since this might not be possible (if bearing is behind camera for pinhole camera),
    /// this operation is fallible.
    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint>;
}

/// The closed set of intrinsic model tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CameraKind {
    Pinhole,
    PinholeRadialK1,
    PinholeRadialK3,
    PinholeBrownT2,
    PinholeFisheye,
}

impl CameraKind {
    pub const ALL: [CameraKind; 5] = [
        CameraKind::Pinhole,
        CameraKind::PinholeRadialK1,
        CameraKind::PinholeRadialK3,
        CameraKind::PinholeBrownT2,
        CameraKind::PinholeFisheye,
    ];

    /// Lens distortion with all coefficients set to zero.
    pub fn zero_distortion(self) -> Distortion {
        match self {
            CameraKind::Pinhole => Distortion::None,
            CameraKind::PinholeRadialK1 => Distortion::RadialK1 { k1: 0.0 },
            CameraKind::PinholeRadialK3 => Distortion::RadialK3 {
                k1: 0.0,
                k2: 0.0,
                k3: 0.0,
            },
            CameraKind::PinholeBrownT2 => Distortion::BrownT2 {
                k1: 0.0,
                k2: 0.0,
                k3: 0.0,
                t1: 0.0,
                t2: 0.0,
            },
            CameraKind::PinholeFisheye => Distortion::Fisheye {
                k1: 0.0,
                k2: 0.0,
                k3: 0.0,
                k4: 0.0,
            },
        }
    }

    fn name(self) -> &'static str {
        match self {
            CameraKind::Pinhole => "PINHOLE",
            CameraKind::PinholeRadialK1 => "PINHOLE_RADIAL_K1",
            CameraKind::PinholeRadialK3 => "PINHOLE_RADIAL_K3",
            CameraKind::PinholeBrownT2 => "PINHOLE_BROWN_T2",
            CameraKind::PinholeFisheye => "PINHOLE_FISHEYE",
        }
    }
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a camera model name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCameraKindError(pub String);

impl fmt::Display for ParseCameraKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown camera model {:?}", self.0)
    }
}

impl std::error::Error for ParseCameraKindError {}

impl FromStr for CameraKind {
    type Err = ParseCameraKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CameraKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseCameraKindError(s.to_owned()))
    }
}

/// Lens distortion applied on the normalized image plane.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Distortion {
    None,
    RadialK1 {
        k1: f64,
    },
    RadialK3 {
        k1: f64,
        k2: f64,
        k3: f64,
    },
    /// Brown-Conrady with three radial and two tangential coefficients.
    BrownT2 {
        k1: f64,
        k2: f64,
        k3: f64,
        t1: f64,
        t2: f64,
    },
    /// Equidistant fisheye with four coefficients on the incidence angle.
    Fisheye {
        k1: f64,
        k2: f64,
        k3: f64,
        k4: f64,
    },
}

const UNDISTORT_ITERATIONS: usize = 20;
const UNDISTORT_EPSILON: f64 = 1e-14;

impl Distortion {
    pub fn kind(&self) -> CameraKind {
        match self {
            Distortion::None => CameraKind::Pinhole,
            Distortion::RadialK1 { .. } => CameraKind::PinholeRadialK1,
            Distortion::RadialK3 { .. } => CameraKind::PinholeRadialK3,
            Distortion::BrownT2 { .. } => CameraKind::PinholeBrownT2,
            Distortion::Fisheye { .. } => CameraKind::PinholeFisheye,
        }
    }

    pub fn coefficients(&self) -> Vec<f64> {
        match *self {
            Distortion::None => vec![],
            Distortion::RadialK1 { k1 } => vec![k1],
            Distortion::RadialK3 { k1, k2, k3 } => vec![k1, k2, k3],
            Distortion::BrownT2 { k1, k2, k3, t1, t2 } => vec![k1, k2, k3, t1, t2],
            Distortion::Fisheye { k1, k2, k3, k4 } => vec![k1, k2, k3, k4],
        }
    }

    pub fn coefficient_count(&self) -> usize {
        match self {
            Distortion::None => 0,
            Distortion::RadialK1 { .. } => 1,
            Distortion::RadialK3 { .. } => 3,
            Distortion::BrownT2 { .. } => 5,
            Distortion::Fisheye { .. } => 4,
        }
    }

    /// Overwrites the coefficients in the order returned by [`Distortion::coefficients`].
    ///
    /// Missing trailing values leave the current coefficient untouched.
    pub fn set_coefficients(&mut self, values: &[f64]) {
        let get = |ix: usize, old: f64| values.get(ix).copied().unwrap_or(old);
        *self = match *self {
            Distortion::None => Distortion::None,
            Distortion::RadialK1 { k1 } => Distortion::RadialK1 { k1: get(0, k1) },
            Distortion::RadialK3 { k1, k2, k3 } => Distortion::RadialK3 {
                k1: get(0, k1),
                k2: get(1, k2),
                k3: get(2, k3),
            },
            Distortion::BrownT2 { k1, k2, k3, t1, t2 } => Distortion::BrownT2 {
                k1: get(0, k1),
                k2: get(1, k2),
                k3: get(2, k3),
                t1: get(3, t1),
                t2: get(4, t2),
            },
            Distortion::Fisheye { k1, k2, k3, k4 } => Distortion::Fisheye {
                k1: get(0, k1),
                k2: get(1, k2),
                k3: get(2, k3),
                k4: get(3, k4),
            },
        };
    }

    /// Maps an ideal normalized point to its distorted location.
    pub fn distort(&self, p: Vector2<f64>) -> Vector2<f64> {
        let r2 = p.norm_squared();
        match *self {
            Distortion::None => p,
            Distortion::RadialK1 { k1 } => p * (1.0 + k1 * r2),
            Distortion::RadialK3 { k1, k2, k3 } => {
                p * (1.0 + r2 * (k1 + r2 * (k2 + r2 * k3)))
            }
            Distortion::BrownT2 { k1, k2, k3, t1, t2 } => {
                let radial = r2 * (k1 + r2 * (k2 + r2 * k3));
                let (x, y) = (p.x, p.y);
                let tx = t2 * (r2 + 2.0 * x * x) + 2.0 * t1 * x * y;
                let ty = t1 * (r2 + 2.0 * y * y) + 2.0 * t2 * x * y;
                Vector2::new(x + x * radial + tx, y + y * radial + ty)
            }
            Distortion::Fisheye { k1, k2, k3, k4 } => {
                let r = r2.sqrt();
                if r < 1e-10 {
                    return p;
                }
                let theta = r.atan();
                let t2 = theta * theta;
                let theta_d = theta * (1.0 + t2 * (k1 + t2 * (k2 + t2 * (k3 + t2 * k4))));
                p * (theta_d / r)
            }
        }
    }

    /// Inverts [`Distortion::distort`] iteratively.
    pub fn undistort(&self, p: Vector2<f64>) -> Vector2<f64> {
        match *self {
            Distortion::None => p,
            Distortion::Fisheye { k1, k2, k3, k4 } => {
                let theta_d = p.norm();
                if theta_d < 1e-10 {
                    return p;
                }
                // Newton on theta_d = theta * (1 + k1 theta^2 + ... + k4 theta^8).
                let mut theta = theta_d;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let t2 = theta * theta;
                    let f = theta * (1.0 + t2 * (k1 + t2 * (k2 + t2 * (k3 + t2 * k4)))) - theta_d;
                    let df = 1.0
                        + t2 * (3.0 * k1 + t2 * (5.0 * k2 + t2 * (7.0 * k3 + t2 * 9.0 * k4)));
                    let step = f / df;
                    theta -= step;
                    if step.abs() < UNDISTORT_EPSILON {
                        break;
                    }
                }
                p * (theta.tan() / theta_d)
            }
            _ => {
                let mut u = p;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let delta = self.distort(u) - p;
                    u -= delta;
                    if delta.norm_squared() < UNDISTORT_EPSILON * UNDISTORT_EPSILON {
                        break;
                    }
                }
                u
            }
        }
    }
}

/// A calibration group: focal length in pixels, principal point, and lens distortion.
///
/// The parameter vector used by bundle adjustment is `[focal, cx, cy, distortion...]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    pub principal_point: Point2<f64>,
    pub distortion: Distortion,
}

impl CameraIntrinsics {
    /// Creates intrinsics of the given kind with zero distortion.
    pub fn new(
        kind: CameraKind,
        width: u32,
        height: u32,
        focal: f64,
        principal_point: Point2<f64>,
    ) -> Self {
        Self {
            width,
            height,
            focal,
            principal_point,
            distortion: kind.zero_distortion(),
        }
    }

    /// Sets the distortion coefficients, keeping the model kind.
    #[must_use]
    pub fn distortion_coefficients(mut self, values: &[f64]) -> Self {
        self.distortion.set_coefficients(values);
        self
    }

    pub fn kind(&self) -> CameraKind {
        self.distortion.kind()
    }

    /// The calibration matrix without distortion.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal,
            0.0,
            self.principal_point.x,
            0.0,
            self.focal,
            self.principal_point.y,
            0.0,
            0.0,
            1.0,
        )
    }

    pub fn parameter_count(&self) -> usize {
        3 + self.distortion.coefficient_count()
    }

    pub fn parameters(&self) -> Vec<f64> {
        let mut params = vec![self.focal, self.principal_point.x, self.principal_point.y];
        params.extend(self.distortion.coefficients());
        params
    }

    /// Overwrites the parameters in the order returned by [`CameraIntrinsics::parameters`].
    pub fn set_parameters(&mut self, params: &[f64]) {
        if let [focal, cx, cy, rest @ ..] = params {
            self.focal = *focal;
            self.principal_point = Point2::new(*cx, *cy);
            self.distortion.set_coefficients(rest);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.parameters().iter().all(|p| p.is_finite()) && self.focal > 0.0
    }

    /// Image diagonal in pixels.
    pub fn diagonal(&self) -> f64 {
        f64::from(self.width).hypot(f64::from(self.height))
    }

    /// Image area in pixels.
    pub fn area(&self) -> f64 {
        f64::from(self.width) * f64::from(self.height)
    }

    /// Projects a point in the camera frame to a pixel, or `None` if it lies behind the camera.
    pub fn project(&self, camera_point: Point3<f64>) -> Option<Point2<f64>> {
        if camera_point.z <= 0.0 || !camera_point.z.is_finite() {
            return None;
        }
        let normalized = camera_point.xy().coords / camera_point.z;
        let distorted = self.distortion.distort(normalized);
        Some(self.principal_point + distorted * self.focal)
    }

    /// Pixel residual `projection - observed` of a world point seen through `pose`.
    pub fn residual(
        &self,
        pose: WorldToCamera,
        point: Point3<f64>,
        observed: Point2<f64>,
    ) -> Option<Vector2<f64>> {
        self.project(pose.transform(point)).map(|p| p - observed)
    }

    /// Pixel reprojection error of a world point seen through `pose`.
    ///
    /// Points behind the camera have an infinite error.
    pub fn reprojection_error(
        &self,
        pose: WorldToCamera,
        point: Point3<f64>,
        observed: Point2<f64>,
    ) -> f64 {
        self.residual(pose, point, observed)
            .map(|r| r.norm())
            .unwrap_or(f64::INFINITY)
    }

    /// Undistorted normalized image coordinates of a pixel.
    pub fn normalize(&self, pixel: Point2<f64>) -> Vector2<f64> {
        let distorted = (pixel - self.principal_point) / self.focal;
        self.distortion.undistort(distorted)
    }

    /// Bearing of the ray through a pixel.
    pub fn bearing(&self, pixel: Point2<f64>) -> UnitVector3<f64> {
        let normalized = self.normalize(pixel);
        UnitVector3::new_normalize(Vector3::new(normalized.x, normalized.y, 1.0))
    }
}

impl CameraModel for CameraIntrinsics {
    fn calibrate(&self, point: KeyPoint) -> UnitVector3<f64> {
        self.bearing(point.0)
    }

    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint> {
        self.project(Point3::from(bearing.into_inner())).map(KeyPoint)
    }
}
