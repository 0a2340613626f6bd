use crate::{Reconstruction, Seed};
use average::{Estimate, Max, Mean};
use core::fmt;
use cv_core::ViewId;
use std::collections::BTreeMap;
use std::time::Duration;

/// Number of regular bins, each [`ResidualHistogram::BIN_WIDTH`] pixels wide.
const BINS: usize = 40;

/// Histogram of reprojection errors in pixels.
///
/// Bins cover `0.0..4.0` in steps of `0.1`, larger errors go into the overflow bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualHistogram {
    pub bins: [usize; BINS],
    pub overflow: usize,
}

impl Default for ResidualHistogram {
    fn default() -> Self {
        Self {
            bins: [0; BINS],
            overflow: 0,
        }
    }
}

impl ResidualHistogram {
    pub const BIN_WIDTH: f64 = 0.1;
    pub const UPPER_EDGE: f64 = BINS as f64 * Self::BIN_WIDTH;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, residual: f64) {
        let bin = (residual / Self::BIN_WIDTH).floor();
        if residual >= 0.0 && bin < BINS as f64 {
            self.bins[bin as usize] += 1;
        } else {
            self.overflow += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.bins.iter().sum::<usize>() + self.overflow
    }

    /// The `[low, high)` edges of each regular bin with its count.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64, usize)> + '_ {
        self.bins.iter().enumerate().map(|(ix, &count)| {
            (
                ix as f64 * Self::BIN_WIDTH,
                (ix + 1) as f64 * Self::BIN_WIDTH,
                count,
            )
        })
    }
}

impl Extend<f64> for ResidualHistogram {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for residual in iter {
            self.add(residual);
        }
    }
}

/// The states of the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineState {
    Init,
    SeedReady,
    Reconstructing,
    Finalizing,
    Done,
    Failed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Init => "INIT",
            EngineState::SeedReady => "SEED_READY",
            EngineState::Reconstructing => "RECONSTRUCTING",
            EngineState::Finalizing => "FINALIZING",
            EngineState::Done => "DONE",
            EngineState::Failed => "FAILED",
        })
    }
}

/// The parts of the pipeline that are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Tracks,
    SeedSelection,
    Initialization,
    Resection,
    Triangulation,
    Refinement,
    Finalization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Tracks => "track building",
            Stage::SeedSelection => "seed selection",
            Stage::Initialization => "initialization",
            Stage::Resection => "resection",
            Stage::Triangulation => "triangulation",
            Stage::Refinement => "refinement",
            Stage::Finalization => "finalization",
        })
    }
}

/// What happened in a recorded [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A seed candidate failed to initialize and the next one was tried.
    SeedRejected,
    /// A view could not be resected and stays in the remaining set.
    ResectionRejected,
    /// A batch was rolled back after a numeric failure.
    NumericRecovery,
    /// No view could be scheduled before every usable view was registered.
    ResectionStall,
    /// The time budget ran out and the reconstruction was finalized early.
    TimeBudgetExceeded,
    Cancelled,
    /// The error that moved the reconstruction to [`EngineState::Failed`].
    Fatal,
}

/// A recovery or notable decision of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub state: EngineState,
    pub kind: EventKind,
    pub message: String,
}

/// The summary of a reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub state: EngineState,
    pub seed: Option<Seed>,
    pub registered_views: usize,
    pub landmarks: usize,
    pub observations: usize,
    pub histogram: ResidualHistogram,
    pub rms: f64,
    pub mean_residual: f64,
    pub max_residual: f64,
    pub batches: usize,
    /// Usable views that did not get registered.
    pub unregistered: Vec<ViewId>,
    /// Views without any track.
    pub dropped: Vec<ViewId>,
    pub timings: BTreeMap<Stage, Duration>,
    pub events: Vec<Event>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            state: EngineState::Init,
            seed: None,
            registered_views: 0,
            landmarks: 0,
            observations: 0,
            histogram: ResidualHistogram::new(),
            rms: 0.0,
            mean_residual: 0.0,
            max_residual: 0.0,
            batches: 0,
            unregistered: Vec::new(),
            dropped: Vec::new(),
            timings: BTreeMap::new(),
            events: Vec::new(),
        }
    }
}

impl Statistics {
    /// Recomputes the counts and residual statistics from a reconstruction.
    pub fn measure(&mut self, reconstruction: &Reconstruction) {
        let residuals = reconstruction.residuals();
        let mut histogram = ResidualHistogram::new();
        histogram.extend(residuals.iter().copied());
        let mean: Mean = residuals.iter().copied().collect();
        let max: Max = residuals.iter().copied().collect();

        self.registered_views = reconstruction.views.len();
        self.landmarks = reconstruction.landmarks.len();
        self.observations = reconstruction.observation_count();
        self.histogram = histogram;
        self.rms = reconstruction.rms();
        self.mean_residual = if mean.is_empty() { 0.0 } else { mean.mean() };
        self.max_residual = if residuals.is_empty() { 0.0 } else { max.max() };
    }

    pub fn add_time(&mut self, stage: Stage, elapsed: Duration) {
        *self.timings.entry(stage).or_default() += elapsed;
    }

    pub fn record(&mut self, state: EngineState, kind: EventKind, message: String) {
        self.events.push(Event {
            state,
            kind,
            message,
        });
    }

    /// Events of one kind.
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(move |event| event.kind == kind)
    }

    pub fn total_time(&self) -> Duration {
        self.timings.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residuals_fall_in_their_bins() {
        let mut histogram = ResidualHistogram::new();
        histogram.extend([0.0, 0.05, 0.1, 0.25, 3.99, 4.0, 12.0, f64::INFINITY, -1.0]);
        assert_eq!(histogram.bins[0], 2);
        assert_eq!(histogram.bins[1], 1);
        assert_eq!(histogram.bins[2], 1);
        assert_eq!(histogram.bins[39], 1);
        assert_eq!(histogram.overflow, 4);
        assert_eq!(histogram.total(), 9);
        let edges: Vec<(f64, f64, usize)> = histogram.iter().collect();
        assert_eq!(edges.len(), 40);
        assert!((edges[39].1 - ResidualHistogram::UPPER_EDGE).abs() < 1e-12);
    }

    #[test]
    fn events_are_filtered_by_kind() {
        let mut stats = Statistics::default();
        stats.record(EngineState::Reconstructing, EventKind::ResectionRejected, "view 4".into());
        stats.record(EngineState::Reconstructing, EventKind::NumericRecovery, "batch".into());
        stats.add_time(Stage::Resection, Duration::from_millis(3));
        stats.add_time(Stage::Resection, Duration::from_millis(4));
        assert_eq!(stats.events_of(EventKind::NumericRecovery).count(), 1);
        assert_eq!(stats.timings[&Stage::Resection], Duration::from_millis(7));
        assert_eq!(stats.total_time(), Duration::from_millis(7));
    }

    #[test]
    fn empty_reconstruction_measures_zero() {
        let mut stats = Statistics::default();
        stats.measure(&Reconstruction::new());
        assert_eq!(stats.landmarks, 0);
        assert_eq!(stats.rms, 0.0);
        assert_eq!(stats.max_residual, 0.0);
        assert_eq!(stats.histogram.total(), 0);
    }
}
