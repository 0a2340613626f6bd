use crate::{
    derive_seed, problem::Problem, refine, seed::user_seed, write_html_report, Calibration,
    EngineState, EventKind, FeaturesProvider, InputError, MatchesProvider, Reconstruction,
    RefineMode, ResectionScheduler, Scene, Seed, SfmError, SfmSettings, Stage, Statistics, Tracks,
};
use cv_core::{PoseId, ViewId};
use log::*;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// The sequential reconstruction engine.
///
/// The engine is a state machine that moves from `INIT` through `SEED_READY`, `RECONSTRUCTING`
/// and `FINALIZING` to `DONE`, or to `FAILED` on a fatal error. [`SequentialEngine::run`] drives
/// it to the end, while [`SequentialEngine::prepare`] and [`SequentialEngine::step`] expose each
/// transition.
///
/// ```no_run
/// use cv_sfm::{PairwiseMatches, Scene, SequentialEngine, SfmSettings};
/// use std::collections::BTreeMap;
///
/// # let (scene, matches) = (Scene::new(), PairwiseMatches::new());
/// # let features: BTreeMap<cv_core::ViewId, Vec<cv_core::KeyPoint>> = BTreeMap::new();
/// let mut engine = SequentialEngine::new(SfmSettings::default(), scene);
/// match engine.run(&features, &matches) {
///     Ok(statistics) => println!("registered {} views", statistics.registered_views),
///     Err(e) => eprintln!("reconstruction failed: {}", e),
/// }
/// ```
#[derive(Debug)]
pub struct SequentialEngine {
    settings: SfmSettings,
    scene: Scene,
    state: EngineState,
    problem: Option<Arc<Problem>>,
    reconstruction: Reconstruction,
    /// Usable views that are not registered yet.
    remaining: BTreeSet<ViewId>,
    /// Views with at least one track.
    usable: BTreeSet<ViewId>,
    scheduler: ResectionScheduler,
    statistics: Statistics,
    cancel: Arc<AtomicBool>,
    /// Counts the generators handed out, each one gets a seed derived from it.
    step: u64,
    numeric_failures: usize,
    started: Option<Instant>,
    /// Seeds not tried yet, best first.
    seeds: VecDeque<Seed>,
    attempted: usize,
    user_seed: bool,
    failure: Option<SfmError>,
}

impl SequentialEngine {
    pub fn new(settings: SfmSettings, scene: Scene) -> Self {
        Self {
            settings,
            scene,
            state: EngineState::Init,
            problem: None,
            reconstruction: Reconstruction::new(),
            remaining: BTreeSet::new(),
            usable: BTreeSet::new(),
            scheduler: ResectionScheduler::new(),
            statistics: Statistics::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            step: 0,
            numeric_failures: 0,
            started: None,
            seeds: VecDeque::new(),
            attempted: 0,
            user_seed: false,
            failure: None,
        }
    }

    /// A flag that stops the reconstruction at the next transition once it is set.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &SfmSettings {
        &self.settings
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// The scene, which holds the poses, intrinsics and landmarks once the engine is done.
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn into_scene(self) -> Scene {
        self.scene
    }

    /// The reconstruction as it currently stands.
    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    /// Usable views that are not registered.
    pub fn remaining(&self) -> &BTreeSet<ViewId> {
        &self.remaining
    }

    /// The error that failed the reconstruction.
    pub fn failure(&self) -> Option<&SfmError> {
        self.failure.as_ref()
    }

    /// Writes the HTML report of the current statistics.
    pub fn write_report(&self, sink: impl Write) {
        write_html_report(sink, &self.statistics);
    }

    /// Runs the reconstruction to the end.
    ///
    /// A resection stall is not an error here, it is recorded and the partial reconstruction is
    /// finalized.
    pub fn run<F, M>(&mut self, features: &F, matches: &M) -> Result<&Statistics, SfmError>
    where
        F: FeaturesProvider + Sync,
        M: MatchesProvider + Sync,
    {
        self.prepare(features, matches)?;
        while !self.state.is_terminal() {
            match self.step() {
                Ok(_) | Err(SfmError::ResectionStall { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(&self.statistics),
        }
    }

    /// Builds the tracks and selects the seed candidates.
    ///
    /// Does nothing unless the engine is in `INIT`.
    pub fn prepare<F, M>(&mut self, features: &F, matches: &M) -> Result<(), SfmError>
    where
        F: FeaturesProvider + Sync,
        M: MatchesProvider + Sync,
    {
        if self.state != EngineState::Init {
            return Ok(());
        }
        self.started = Some(Instant::now());
        if let Err(e) = self.check_cancelled().and_then(|()| self.try_prepare(features, matches)) {
            return Err(self.fail(e));
        }
        self.transition(EngineState::SeedReady);
        Ok(())
    }

    fn try_prepare<F, M>(&mut self, features: &F, matches: &M) -> Result<(), SfmError>
    where
        F: FeaturesProvider + Sync,
        M: MatchesProvider + Sync,
    {
        self.settings.validate()?;
        if self.scene.views.is_empty() {
            return Err(InputError::NoViews.into());
        }
        let mut poses: BTreeMap<PoseId, ViewId> = BTreeMap::new();
        for (&id, view) in &self.scene.views {
            if poses.insert(view.pose, id).is_some() {
                return Err(InputError::SharedPose { pose: view.pose }.into());
            }
        }

        let start = Instant::now();
        let tracks = Tracks::build(features, matches)?;
        self.statistics.add_time(Stage::Tracks, start.elapsed());
        if tracks.is_empty() {
            return Err(InputError::EmptyTracks.into());
        }
        info!("built {} tracks", tracks.len());
        let problem = Problem::new(self.settings, &self.scene, tracks)?;

        self.usable = problem.usable_views();
        self.statistics.dropped = self
            .scene
            .views
            .keys()
            .copied()
            .filter(|view| !self.usable.contains(view))
            .collect();
        if !self.statistics.dropped.is_empty() {
            warn!("dropping views without tracks: {:?}", self.statistics.dropped);
        }
        if self.usable.len() < 2 {
            return Err(InputError::InsufficientViews {
                usable: self.usable.len(),
            }
            .into());
        }
        self.remaining = self.usable.clone();

        let start = Instant::now();
        match user_seed(&self.settings, &problem)? {
            Some(seed) => {
                info!("using seed {} from the settings", seed);
                self.user_seed = true;
                self.seeds = VecDeque::from(vec![seed]);
            }
            None => {
                let ranking = problem.rank_seeds(self.next_seed());
                self.attempted = ranking.attempted;
                self.seeds = ranking.candidates.iter().map(|c| c.seed()).collect();
            }
        }
        self.statistics.add_time(Stage::SeedSelection, start.elapsed());
        if self.seeds.is_empty() {
            return Err(SfmError::SeedFailure {
                attempted: self.attempted,
            });
        }
        self.problem = Some(Arc::new(problem));
        Ok(())
    }

    /// Performs one transition and returns the state it led to.
    ///
    /// From `SEED_READY` the seed candidates are initialized until one succeeds. From
    /// `RECONSTRUCTING` one batch of views is resected, triangulated and refined, or the engine
    /// moves on to `FINALIZING` when no view can be scheduled. From `FINALIZING` the whole
    /// reconstruction is refined and written back to the scene.
    ///
    /// A [`SfmError::ResectionStall`] is returned when the engine moves to `FINALIZING` with
    /// fewer views registered than required, the engine can keep stepping after it.
    pub fn step(&mut self) -> Result<EngineState, SfmError> {
        match self.state {
            EngineState::Init => return Err(SfmError::NotPrepared),
            EngineState::Done | EngineState::Failed => return Ok(self.state),
            _ => {}
        }
        if let Err(e) = self.check_cancelled() {
            return Err(self.fail(e));
        }
        let result = match self.state {
            EngineState::SeedReady => self.initialize(),
            EngineState::Reconstructing => self.reconstruct_batch(),
            EngineState::Finalizing => self.finalize(),
            _ => Ok(()),
        };
        match result {
            Ok(()) => Ok(self.state),
            Err(e @ SfmError::ResectionStall { .. }) => Err(e),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn initialize(&mut self) -> Result<(), SfmError> {
        let problem = self.problem()?;
        let start = Instant::now();
        while let Some(seed) = self.seeds.pop_front() {
            if self.user_seed {
                self.attempted += 1;
            }
            let rng_seed = self.next_seed();
            match problem.initialize(seed, rng_seed) {
                Ok(reconstruction) => {
                    for view in seed.views() {
                        self.remaining.remove(&view);
                    }
                    self.reconstruction = reconstruction;
                    self.statistics.seed = Some(seed);
                    self.statistics.add_time(Stage::Initialization, start.elapsed());
                    self.transition(EngineState::Reconstructing);
                    return Ok(());
                }
                Err(reason) if self.user_seed => {
                    return Err(SfmError::InitializationFailure { seed, reason });
                }
                Err(reason) => {
                    let message = format!("seed {} rejected: {}", seed, reason);
                    warn!("{}", message);
                    self.statistics
                        .record(self.state, EventKind::SeedRejected, message);
                }
            }
        }
        self.statistics.add_time(Stage::Initialization, start.elapsed());
        Err(SfmError::SeedFailure {
            attempted: self.attempted,
        })
    }

    fn reconstruct_batch(&mut self) -> Result<(), SfmError> {
        let problem = self.problem()?;
        let settings = self.settings;
        if let (Some(budget), Some(started)) = (settings.time_budget_secs, self.started) {
            if started.elapsed().as_secs_f64() > budget {
                let message = format!("time budget of {} s exceeded", budget);
                warn!("{}", message);
                self.statistics
                    .record(self.state, EventKind::TimeBudgetExceeded, message);
                self.transition(EngineState::Finalizing);
                return Ok(());
            }
        }

        let batch = self.scheduler.candidates(
            &settings,
            &problem.visibility,
            &self.reconstruction,
            &self.remaining,
        );
        if batch.is_empty() {
            let registered = self.reconstruction.views.len();
            let total = self.usable.len();
            self.transition(EngineState::Finalizing);
            if (registered as f64) < settings.min_registered_fraction * total as f64 {
                let message = format!(
                    "resection stalled with {} of {} views registered, unregistered {:?}",
                    registered, total, self.remaining
                );
                warn!("{}", message);
                self.statistics
                    .record(self.state, EventKind::ResectionStall, message);
                return Err(SfmError::ResectionStall { registered, total });
            }
            return Ok(());
        }

        let snapshot = (self.reconstruction.clone(), self.remaining.clone());
        let rng_seed = self.next_seed();
        let start = Instant::now();
        let results = problem.resect_batch(&self.reconstruction, &batch, rng_seed);
        let mut registered = Vec::new();
        for (view, count, result) in results {
            let failure = match result {
                Ok(resection) if problem.install(&mut self.reconstruction, &resection) => {
                    self.remaining.remove(&view);
                    self.scheduler.clear(view);
                    registered.push(view);
                    continue;
                }
                Ok(_) => "the view is not part of the scene".to_owned(),
                Err(failure) => failure.to_string(),
            };
            let message = format!("view {} with {} landmarks not resected: {}", view, count, failure);
            debug!("{}", message);
            self.statistics
                .record(self.state, EventKind::ResectionRejected, message);
            self.scheduler.mark_failed(view, count);
        }
        self.statistics.add_time(Stage::Resection, start.elapsed());
        self.statistics.batches += 1;
        if registered.is_empty() {
            info!("batch {} registered no view", self.statistics.batches);
            return Ok(());
        }

        let start = Instant::now();
        let report = problem.triangulate(
            &mut self.reconstruction,
            settings.min_triangulation_angle_degrees,
        );
        self.statistics.add_time(Stage::Triangulation, start.elapsed());

        let start = Instant::now();
        let refined = refine(&mut self.reconstruction, &settings, RefineMode::Incremental);
        self.statistics.add_time(Stage::Refinement, start.elapsed());
        match refined {
            Ok(_) => self.numeric_failures = 0,
            Err(source) => {
                self.reconstruction = snapshot.0;
                self.remaining = snapshot.1;
                for &(view, count) in &batch {
                    self.scheduler.mark_failed(view, count);
                }
                self.numeric_failures += 1;
                let message = format!(
                    "rolled back batch {} after a numeric failure: {}",
                    self.statistics.batches, source
                );
                warn!("{}", message);
                self.statistics
                    .record(self.state, EventKind::NumericRecovery, message);
                if self.numeric_failures >= settings.max_numeric_failures {
                    return Err(SfmError::NumericFailure {
                        stage: Stage::Refinement,
                        source,
                    });
                }
                return Ok(());
            }
        }
        info!(
            "batch {} registered {:?} and created {} landmarks, {} of {} views and {} landmarks at rms {:.4} px",
            self.statistics.batches,
            registered,
            report.created,
            self.reconstruction.views.len(),
            self.usable.len(),
            self.reconstruction.landmarks.len(),
            self.reconstruction.rms()
        );
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SfmError> {
        let start = Instant::now();
        let snapshot = self.reconstruction.clone();
        match refine(&mut self.reconstruction, &self.settings, RefineMode::Final) {
            Ok(report) => info!(
                "final refinement went from rms {:.4} to {:.4} px",
                report.initial_rms, report.final_rms
            ),
            Err(e) => {
                self.reconstruction = snapshot;
                let message = format!("final refinement failed and was undone: {}", e);
                warn!("{}", message);
                self.statistics
                    .record(self.state, EventKind::NumericRecovery, message);
            }
        }

        for (&view, registered) in &self.reconstruction.views {
            if let Some(&pose) = self.reconstruction.poses.get(&registered.pose) {
                self.scene.poses.insert(registered.pose, pose);
            }
            if let Some(scene_view) = self.scene.views.get_mut(&view) {
                scene_view.intrinsic = Some(registered.intrinsic);
            }
        }
        for (&id, &intrinsics) in &self.reconstruction.intrinsics {
            self.scene
                .intrinsics
                .insert(id, Calibration::Known(intrinsics));
        }
        self.scene.landmarks = self.reconstruction.landmarks.clone();

        self.statistics.measure(&self.reconstruction);
        self.statistics.unregistered = self.remaining.iter().copied().collect();
        self.statistics.add_time(Stage::Finalization, start.elapsed());
        self.transition(EngineState::Done);
        Ok(())
    }

    fn problem(&self) -> Result<Arc<Problem>, SfmError> {
        self.problem.clone().ok_or(SfmError::NotPrepared)
    }

    fn next_seed(&mut self) -> u64 {
        let seed = derive_seed(self.settings.rng_seed, self.step);
        self.step += 1;
        seed
    }

    fn check_cancelled(&mut self) -> Result<(), SfmError> {
        if self.cancel.load(Ordering::Relaxed) {
            self.statistics.record(
                self.state,
                EventKind::Cancelled,
                "reconstruction was cancelled".to_owned(),
            );
            return Err(SfmError::Cancelled);
        }
        Ok(())
    }

    fn transition(&mut self, state: EngineState) {
        info!("{} -> {}", self.state, state);
        self.state = state;
        self.statistics.state = state;
    }

    fn fail(&mut self, error: SfmError) -> SfmError {
        error!("reconstruction failed: {}", error);
        self.statistics
            .record(self.state, EventKind::Fatal, error.to_string());
        self.statistics.measure(&self.reconstruction);
        self.statistics.unregistered = self.remaining.iter().copied().collect();
        self.transition(EngineState::Failed);
        self.failure = Some(error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::Synthetic;

    #[test]
    fn stepping_before_preparing_is_refused() {
        let synthetic = Synthetic::rig(&[0.0, 0.5], 60, 0.0, 1);
        let mut engine = SequentialEngine::new(SfmSettings::default(), synthetic.scene);
        assert_eq!(engine.step(), Err(SfmError::NotPrepared));
        assert_eq!(engine.state(), EngineState::Init);
    }

    #[test]
    fn engine_walks_through_every_state() {
        let synthetic = Synthetic::rig(&[0.0, 0.4, 0.8], 120, 0.2, 4);
        let mut engine = SequentialEngine::new(SfmSettings::default(), synthetic.scene.clone());
        engine.prepare(&synthetic.features, &synthetic.matches).unwrap();
        assert_eq!(engine.state(), EngineState::SeedReady);
        let mut states = vec![engine.state()];
        while !engine.state().is_terminal() {
            states.push(engine.step().unwrap());
        }
        assert_eq!(states[1], EngineState::Reconstructing);
        assert_eq!(states.last(), Some(&EngineState::Done));
        assert_eq!(engine.statistics().registered_views, 3);
        assert!(engine.remaining().is_empty());
        assert_eq!(engine.scene().poses.len(), 3);
        assert_eq!(engine.step(), Ok(EngineState::Done));
    }

    #[test]
    fn cancellation_fails_the_next_step() {
        let synthetic = Synthetic::rig(&[0.0, 0.4, 0.8], 120, 0.2, 4);
        let mut engine = SequentialEngine::new(SfmSettings::default(), synthetic.scene.clone());
        engine.prepare(&synthetic.features, &synthetic.matches).unwrap();
        engine.cancellation_flag().store(true, Ordering::Relaxed);
        assert_eq!(engine.step(), Err(SfmError::Cancelled));
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(engine.statistics().events_of(EventKind::Cancelled).count(), 1);
        assert_eq!(engine.failure(), Some(&SfmError::Cancelled));
    }

    #[test]
    fn exhausted_time_budget_finalizes() {
        let synthetic = Synthetic::rig(&[0.0, 0.4, 0.8, 1.2], 120, 0.2, 4);
        let settings = SfmSettings {
            time_budget_secs: Some(0.0),
            ..SfmSettings::default()
        };
        let mut engine = SequentialEngine::new(settings, synthetic.scene.clone());
        let statistics = engine.run(&synthetic.features, &synthetic.matches).unwrap();
        assert_eq!(statistics.state, EngineState::Done);
        assert_eq!(statistics.registered_views, 2);
        assert_eq!(statistics.unregistered.len(), 2);
        assert_eq!(statistics.events_of(EventKind::TimeBudgetExceeded).count(), 1);
    }

    #[test]
    fn shared_poses_are_rejected() {
        let mut synthetic = Synthetic::rig(&[0.0, 0.5], 60, 0.0, 1);
        let view = synthetic.scene.views.get_mut(&ViewId(2)).unwrap();
        view.pose = PoseId(1);
        let mut engine = SequentialEngine::new(SfmSettings::default(), synthetic.scene.clone());
        assert_eq!(
            engine.run(&synthetic.features, &synthetic.matches).err(),
            Some(SfmError::Input(InputError::SharedPose { pose: PoseId(1) }))
        );
        assert_eq!(engine.state(), EngineState::Failed);
    }
}
