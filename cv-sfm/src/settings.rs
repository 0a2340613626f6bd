use crate::ConfigError;
use core::fmt;
use core::str::FromStr;
use cv_core::{CameraKind, ViewId};
use cv_geom::{ResectionMethod, TriangulationMethod, UnknownVariant};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// How strictly correspondences are checked while a model is scored.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MatchConstraint {
    /// Only the epipolar or reprojection residual is used.
    Unconstrained,
    /// Correspondences must also lie in front of the cameras.
    Orientation,
}

impl MatchConstraint {
    pub const ALL: [MatchConstraint; 2] = [MatchConstraint::Unconstrained, MatchConstraint::Orientation];

    fn name(self) -> &'static str {
        match self {
            MatchConstraint::Unconstrained => "UNCONSTRAINED",
            MatchConstraint::Orientation => "ORIENTATION",
        }
    }
}

impl Default for MatchConstraint {
    fn default() -> Self {
        MatchConstraint::Orientation
    }
}

impl fmt::Display for MatchConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MatchConstraint {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant::new("match constraint", s))
    }
}

/// The settings for the sequential reconstruction.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SfmSettings {
    /// A forced initial pair. `(0, 0)` selects the pair automatically.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub seed_pair: (ViewId, ViewId),
    /// A forced initial triplet. `(0, 0, 0)` means no triplet, automatic triplet selection
    /// does not exist.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub seed_triplet: (ViewId, ViewId, ViewId),
    /// Whether models are scored with a chirality check.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub match_constraint: MatchConstraint,
    /// The model given to intrinsics that are declared unknown, once they are estimated.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_unknown_camera_type")
    )]
    pub unknown_camera_type: CameraKind,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_triangulation_method")
    )]
    pub triangulation_method: TriangulationMethod,
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub resection_method: ResectionMethod,
    /// The number of hypotheses drawn to estimate the poses of a seed triplet.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_trifocal_ransac_iterations")
    )]
    pub max_trifocal_ransac_iterations: usize,
    /// The minimum number of tracks two views must share to be a seed candidate.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_shared_tracks")
    )]
    pub min_shared_tracks: usize,
    /// The minimum median triangulation angle of a seed pair, and the minimum angle of a
    /// point triangulated from the seed.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_seed_angle_degrees")
    )]
    pub min_seed_angle_degrees: f64,
    /// Seed pairs with a wider median triangulation angle are rejected.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_seed_angle_degrees")
    )]
    pub max_seed_angle_degrees: f64,
    /// The minimum ratio of relative pose inliers to shared tracks of a seed pair.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_inlier_ratio")
    )]
    pub min_inlier_ratio: f64,
    /// The minimum number of landmarks that must survive initialization.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_seed_landmarks")
    )]
    pub min_seed_landmarks: usize,
    /// The minimum number of triangulated tracks a view needs to be scheduled for resection.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_resection_tracks")
    )]
    pub min_resection_tracks: usize,
    /// Views are scheduled together if they see at least this fraction of the triangulated
    /// tracks of the best candidate.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_resection_ratio")
    )]
    pub resection_ratio: f64,
    /// The minimum number of inliers of a resection.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_resection_inliers")
    )]
    pub min_resection_inliers: usize,
    /// Landmarks whose observation rays never span this angle are removed.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_triangulation_angle_degrees")
    )]
    pub min_triangulation_angle_degrees: f64,
    /// The upper bound of an a-contrario threshold, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_noise_px")
    )]
    pub max_noise_px: f64,
    /// The lower bound of a per-view threshold, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_threshold_px")
    )]
    pub min_threshold_px: f64,
    /// The number of hypotheses of each a-contrario consensus.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ac_ransac_iterations")
    )]
    pub ac_ransac_iterations: usize,
    /// The maximum number of optimize and prune cycles of one refinement.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_refine_cycles")
    )]
    pub max_refine_cycles: usize,
    /// The iteration limit of each bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_bundle_max_iterations")
    )]
    pub bundle_max_iterations: usize,
    /// The number of consecutive numeric failures after which the reconstruction fails.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_numeric_failures")
    )]
    pub max_numeric_failures: usize,
    /// Stopping with a smaller fraction of the usable views registered is recorded as a stall.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_registered_fraction")
    )]
    pub min_registered_fraction: f64,
    /// Refine the intrinsics of the seed views during initialization.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub refine_intrinsics_on_seed: bool,
    /// Once this many seconds have elapsed, no further resection batch is started.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub time_budget_secs: Option<f64>,
    /// Every random number generator of the reconstruction is derived from this seed.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub rng_seed: u64,
}

impl Default for SfmSettings {
    fn default() -> Self {
        Self {
            seed_pair: (ViewId(0), ViewId(0)),
            seed_triplet: (ViewId(0), ViewId(0), ViewId(0)),
            match_constraint: MatchConstraint::default(),
            unknown_camera_type: default_unknown_camera_type(),
            triangulation_method: default_triangulation_method(),
            resection_method: ResectionMethod::default(),
            max_trifocal_ransac_iterations: default_max_trifocal_ransac_iterations(),
            min_shared_tracks: default_min_shared_tracks(),
            min_seed_angle_degrees: default_min_seed_angle_degrees(),
            max_seed_angle_degrees: default_max_seed_angle_degrees(),
            min_inlier_ratio: default_min_inlier_ratio(),
            min_seed_landmarks: default_min_seed_landmarks(),
            min_resection_tracks: default_min_resection_tracks(),
            resection_ratio: default_resection_ratio(),
            min_resection_inliers: default_min_resection_inliers(),
            min_triangulation_angle_degrees: default_min_triangulation_angle_degrees(),
            max_noise_px: default_max_noise_px(),
            min_threshold_px: default_min_threshold_px(),
            ac_ransac_iterations: default_ac_ransac_iterations(),
            max_refine_cycles: default_max_refine_cycles(),
            bundle_max_iterations: default_bundle_max_iterations(),
            max_numeric_failures: default_max_numeric_failures(),
            min_registered_fraction: default_min_registered_fraction(),
            refine_intrinsics_on_seed: false,
            time_budget_secs: None,
            rng_seed: 0,
        }
    }
}

impl SfmSettings {
    /// Returns `true` if a seed pair was given.
    pub fn has_seed_pair(&self) -> bool {
        self.seed_pair != (ViewId(0), ViewId(0))
    }

    /// Returns `true` if a seed triplet was given.
    pub fn has_seed_triplet(&self) -> bool {
        self.seed_triplet != (ViewId(0), ViewId(0), ViewId(0))
    }

    /// Sets an option from its name and textual value.
    ///
    /// Only the enumerated options and the trifocal iteration count can be set this way.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "match_constraint" => self.match_constraint = value.parse()?,
            "unknown_camera_type" => self.unknown_camera_type = value.parse()?,
            "triangulation_method" => self.triangulation_method = value.parse()?,
            "resection_method" => self.resection_method = value.parse()?,
            "max_trifocal_ransac_iterations" => {
                self.max_trifocal_ransac_iterations =
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidOptionValue {
                            name: "max_trifocal_ransac_iterations",
                            value: value.to_owned(),
                        })?
            }
            _ => return Err(ConfigError::UnknownOption(name.to_owned())),
        }
        Ok(())
    }

    /// Checks that the numeric options are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("min_seed_angle_degrees", self.min_seed_angle_degrees),
            ("max_seed_angle_degrees", self.max_seed_angle_degrees),
            ("min_inlier_ratio", self.min_inlier_ratio),
            ("resection_ratio", self.resection_ratio),
            ("max_noise_px", self.max_noise_px),
            ("min_threshold_px", self.min_threshold_px),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        let non_negative = [
            (
                "min_triangulation_angle_degrees",
                self.min_triangulation_angle_degrees,
            ),
            ("min_registered_fraction", self.min_registered_fraction),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        let fractions = [
            ("min_inlier_ratio", self.min_inlier_ratio),
            ("resection_ratio", self.resection_ratio),
            ("min_registered_fraction", self.min_registered_fraction),
        ];
        for (name, value) in fractions {
            if value > 1.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if self.min_threshold_px > self.max_noise_px {
            return Err(ConfigError::InvalidThreshold {
                name: "min_threshold_px",
                value: self.min_threshold_px,
            });
        }
        if self.max_seed_angle_degrees <= self.min_seed_angle_degrees {
            return Err(ConfigError::InvalidThreshold {
                name: "max_seed_angle_degrees",
                value: self.max_seed_angle_degrees,
            });
        }
        if let Some(budget) = self.time_budget_secs {
            if !(budget.is_finite() && budget >= 0.0) {
                return Err(ConfigError::InvalidThreshold {
                    name: "time_budget_secs",
                    value: budget,
                });
            }
        }
        Ok(())
    }

    /// Clamps an estimated noise level into `[min_threshold_px, max_noise_px]`.
    pub fn clamp_threshold(&self, threshold: f64) -> f64 {
        threshold.max(self.min_threshold_px).min(self.max_noise_px)
    }
}

fn default_unknown_camera_type() -> CameraKind {
    CameraKind::PinholeRadialK3
}

fn default_triangulation_method() -> TriangulationMethod {
    TriangulationMethod::Default
}

fn default_max_trifocal_ransac_iterations() -> usize {
    100
}

fn default_min_shared_tracks() -> usize {
    50
}

fn default_min_seed_angle_degrees() -> f64 {
    3.0
}

fn default_max_seed_angle_degrees() -> f64 {
    60.0
}

fn default_min_inlier_ratio() -> f64 {
    0.6
}

fn default_min_seed_landmarks() -> usize {
    30
}

fn default_min_resection_tracks() -> usize {
    30
}

fn default_resection_ratio() -> f64 {
    0.75
}

fn default_min_resection_inliers() -> usize {
    12
}

fn default_min_triangulation_angle_degrees() -> f64 {
    2.0
}

fn default_max_noise_px() -> f64 {
    4.0
}

fn default_min_threshold_px() -> f64 {
    1.0
}

fn default_ac_ransac_iterations() -> usize {
    1024
}

fn default_max_refine_cycles() -> usize {
    3
}

fn default_bundle_max_iterations() -> usize {
    100
}

fn default_max_numeric_failures() -> usize {
    2
}

fn default_min_registered_fraction() -> f64 {
    1.0
}
