use crate::{Seed, Stage};
use cv_core::{IntrinsicId, ParseCameraKindError, PoseId, ViewId};
use cv_geom::UnknownVariant;
use cv_optimize::OptimizeError;
use thiserror::Error;

/// Everything that can stop a reconstruction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SfmError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
    #[error("no seed satisfied the quality thresholds ({attempted} candidates attempted)")]
    SeedFailure { attempted: usize },
    #[error("initialization from seed {seed} failed: {reason}")]
    InitializationFailure {
        seed: Seed,
        reason: InitializationIssue,
    },
    /// Only returned by [`SequentialEngine::step`](crate::SequentialEngine::step). A full run
    /// records the stall and finalizes the partial reconstruction.
    #[error("resection stalled with {registered} of {total} views registered")]
    ResectionStall { registered: usize, total: usize },
    #[error("numeric failure during {stage}: {source}")]
    NumericFailure { stage: Stage, source: OptimizeError },
    #[error("reconstruction was cancelled")]
    Cancelled,
    #[error("the engine must be prepared before it can step")]
    NotPrepared,
}

/// Problems with the settings or the scene description, found before any work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("seed view {0} is given more than once")]
    DuplicateSeedView(ViewId),
    #[error("seed view {0} is not part of the scene")]
    UnknownSeedView(ViewId),
    #[error("seed view {0} has unknown intrinsics")]
    UncalibratedSeedView(ViewId),
    #[error("unknown {kind} {value:?}")]
    UnknownEnumValue { kind: &'static str, value: String },
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("option {name} has invalid value {value:?}")]
    InvalidOptionValue { name: &'static str, value: String },
    #[error("intrinsic {intrinsic} is declared unknown but shared by {views} views")]
    UnknownSharedIntrinsic { intrinsic: IntrinsicId, views: usize },
    #[error("a seed triplet was given but the triplet feature is disabled")]
    TripletDisabled,
    #[error("{name} has invalid value {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("view {view} refers to intrinsic {intrinsic}, which is not part of the scene")]
    MissingIntrinsic { view: ViewId, intrinsic: IntrinsicId },
}

impl From<UnknownVariant> for ConfigError {
    fn from(UnknownVariant { kind, value }: UnknownVariant) -> Self {
        ConfigError::UnknownEnumValue { kind, value }
    }
}

impl From<ParseCameraKindError> for ConfigError {
    fn from(ParseCameraKindError(value): ParseCameraKindError) -> Self {
        ConfigError::UnknownEnumValue {
            kind: "camera model",
            value,
        }
    }
}

/// Problems with the features and matches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("the scene has no views")]
    NoViews,
    #[error("the matches produced no tracks")]
    EmptyTracks,
    #[error("matches refer to view {0}, which is not part of the scene")]
    UnknownView(ViewId),
    #[error("view {0} has matches but no features")]
    MissingFeatures(ViewId),
    #[error("feature {feature} of view {view} is out of range ({count} features)")]
    FeatureOutOfRange {
        view: ViewId,
        feature: u32,
        count: usize,
    },
    #[error("pose {pose} is shared by several views")]
    SharedPose { pose: PoseId },
    #[error("only {usable} views have tracks, at least 2 are needed")]
    InsufficientViews { usable: usize },
}

/// Why a seed could not be turned into an initial reconstruction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InitializationIssue {
    #[error("only {found} shared tracks, {needed} needed")]
    TooFewMatches { found: usize, needed: usize },
    #[error("the relative pose is degenerate")]
    DegenerateRelativePose,
    #[error("only {found} landmarks survived, {needed} needed")]
    TooFewLandmarks { found: usize, needed: usize },
    #[error("view {0} has unknown intrinsics")]
    Uncalibrated(ViewId),
    #[error("{0}")]
    Numeric(OptimizeError),
}

/// Why a view could not be resected. These failures are not fatal, the view stays in the
/// remaining set.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResectionFailure {
    #[error("only {found} correspondences, {needed} needed")]
    TooFewCorrespondences { found: usize, needed: usize },
    #[error("no model reached a meaningful consensus")]
    NoConsensus,
    #[error("only {found} inliers, {needed} needed")]
    TooFewInliers { found: usize, needed: usize },
    #[error("the projection matrix could not be decomposed")]
    Decomposition,
    #[error("pose refinement failed: {0}")]
    Refinement(OptimizeError),
}
