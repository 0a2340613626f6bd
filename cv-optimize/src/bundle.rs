use crate::{difference_step, OptimizeError, Se3TangentSpace};
use cv_core::{
    nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, MatrixXx3, Point2, Point3, Vector2, Vector3},
    CameraIntrinsics, Pose, WorldToCamera,
};
use average::Mean;
use log::*;
use std::collections::BTreeSet;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

const MIN_LAMBDA: f64 = 1e-7;
const MAX_LAMBDA: f64 = 1e16;

/// One pixel observation of a world point through a posed camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleObservation {
    /// Index into [`Bundle::poses`].
    pub pose: usize,
    /// Index into [`Bundle::intrinsics`].
    pub intrinsic: usize,
    /// Index into [`Bundle::points`].
    pub point: usize,
    pub pixel: Point2<f64>,
}

/// The parameters and observations of a bundle adjustment problem.
///
/// Poses listed in `fixed_poses` are held constant, which is how the gauge of the problem is
/// fixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    pub poses: Vec<WorldToCamera>,
    pub fixed_poses: BTreeSet<usize>,
    pub intrinsics: Vec<CameraIntrinsics>,
    pub points: Vec<Point3<f64>>,
    pub observations: Vec<BundleObservation>,
}

impl Bundle {
    /// Pixel residual of an observation, or `None` if the point is behind the camera.
    pub fn residual(&self, observation: &BundleObservation) -> Option<Vector2<f64>> {
        let pose = *self.poses.get(observation.pose)?;
        let intrinsics = self.intrinsics.get(observation.intrinsic)?;
        let point = *self.points.get(observation.point)?;
        intrinsics.residual(pose, point, observation.pixel)
    }

    /// Root mean square of the reprojection errors of the observations that project.
    pub fn rms(&self) -> Option<f64> {
        let mean: Mean = self
            .observations
            .iter()
            .filter_map(|observation| self.residual(observation))
            .map(|r| r.norm_squared())
            .collect();
        if mean.is_empty() {
            None
        } else {
            Some(mean.mean().sqrt())
        }
    }

    fn validate(&self) -> Result<(), OptimizeError> {
        for (ix, observation) in self.observations.iter().enumerate() {
            let missing = if observation.pose >= self.poses.len() {
                Some("pose")
            } else if observation.intrinsic >= self.intrinsics.len() {
                Some("intrinsic")
            } else if observation.point >= self.points.len() {
                Some("point")
            } else {
                None
            };
            if let Some(what) = missing {
                return Err(OptimizeError::InvalidIndex {
                    observation: ix,
                    what,
                });
            }
        }
        Ok(())
    }

    fn is_finite(&self) -> Result<(), OptimizeError> {
        if !self.poses.iter().all(|pose| pose.is_valid(1e-6)) {
            return Err(OptimizeError::NonFiniteParameters { what: "poses" });
        }
        if !self.intrinsics.iter().all(|intrinsics| intrinsics.is_finite()) {
            return Err(OptimizeError::NonFiniteParameters { what: "intrinsics" });
        }
        if !self.points.iter().all(|p| p.iter().all(|n| n.is_finite())) {
            return Err(OptimizeError::NonFiniteParameters { what: "points" });
        }
        Ok(())
    }
}

/// Which parameter groups bundle adjustment may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RefineOptions {
    pub poses: bool,
    pub intrinsics: bool,
    pub structure: bool,
}

impl RefineOptions {
    pub const ALL: Self = Self {
        poses: true,
        intrinsics: true,
        structure: true,
    };
    pub const STRUCTURE_AND_MOTION: Self = Self {
        poses: true,
        intrinsics: false,
        structure: true,
    };
    pub const STRUCTURE: Self = Self {
        poses: false,
        intrinsics: false,
        structure: true,
    };
    pub const MOTION: Self = Self {
        poses: true,
        intrinsics: false,
        structure: false,
    };

    pub fn is_empty(self) -> bool {
        !(self.poses || self.intrinsics || self.structure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The cost stopped decreasing.
    Converged,
    /// The iteration limit was reached first.
    MaxIterations,
    /// No parameter was free to move.
    NothingToRefine,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleReport {
    pub iterations: usize,
    /// Half the sum of squared pixel residuals before optimization.
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Observations included in the cost.
    pub observations: usize,
    /// Observations left out because their point was behind the camera at the start.
    pub excluded: usize,
    pub termination: Termination,
}

impl BundleReport {
    pub fn initial_rms(&self) -> f64 {
        (2.0 * self.initial_cost / self.observations as f64).sqrt()
    }

    pub fn final_rms(&self) -> f64 {
        (2.0 * self.final_cost / self.observations as f64).sqrt()
    }
}

/// Sparse Levenberg-Marquardt bundle adjustment.
///
/// The normal equations are reduced onto the camera parameters (poses and intrinsics) with the
/// Schur complement of the 3x3 point blocks, solved densely, and the point updates are then
/// back-substituted. Derivatives are taken with central differences, so every camera model in
/// `cv-core` is supported.
///
/// The damping loop is written out here instead of going through `levenberg_marquardt`, which
/// only accepts a dense Jacobian and solves its own dense system. [`crate::PoseRefiner`] uses
/// that crate for the single-pose problem.
///
/// With the `rayon` feature the observations are linearized in parallel. Reductions always run
/// sequentially in observation order, so results do not depend on the number of threads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleAdjuster {
    max_iterations: usize,
    function_tolerance: f64,
    gradient_tolerance: f64,
    initial_lambda: f64,
}

impl Default for BundleAdjuster {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            function_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
            initial_lambda: 1e-3,
        }
    }
}

impl BundleAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Stop when an accepted step decreases the cost by less than this fraction.
    #[must_use]
    pub fn function_tolerance(self, function_tolerance: f64) -> Self {
        Self {
            function_tolerance,
            ..self
        }
    }

    #[must_use]
    pub fn gradient_tolerance(self, gradient_tolerance: f64) -> Self {
        Self {
            gradient_tolerance,
            ..self
        }
    }

    #[must_use]
    pub fn initial_lambda(self, initial_lambda: f64) -> Self {
        Self {
            initial_lambda,
            ..self
        }
    }

    /// Refines the bundle in place.
    ///
    /// Observations whose point is behind the camera at the start are left out of the cost. A
    /// step that would move an included point behind its camera is rejected.
    pub fn optimize(
        &self,
        bundle: &mut Bundle,
        options: RefineOptions,
    ) -> Result<BundleReport, OptimizeError> {
        bundle.validate()?;
        let valid: Vec<bool> = bundle
            .observations
            .iter()
            .map(|observation| bundle.residual(observation).is_some())
            .collect();
        let observations = valid.iter().filter(|&&v| v).count();
        if observations == 0 {
            return Err(OptimizeError::NoObservations);
        }
        let cost = match total_cost(bundle, &valid) {
            Some(cost) if cost.is_finite() => cost,
            Some(cost) => return Err(OptimizeError::NonFiniteCost { cost }),
            None => return Err(OptimizeError::NoObservations),
        };
        let mut report = BundleReport {
            iterations: 0,
            initial_cost: cost,
            final_cost: cost,
            observations,
            excluded: valid.len() - observations,
            termination: Termination::MaxIterations,
        };

        let layout = Layout::new(bundle, options, &valid);
        if layout.is_empty() {
            report.termination = Termination::NothingToRefine;
            return Ok(report);
        }
        debug!(
            "bundle adjustment over {} camera parameters and {} points with {} observations",
            layout.camera_len,
            layout.free_points.iter().filter(|&&f| f).count(),
            observations
        );

        let mut cost = cost;
        let mut lambda = self.initial_lambda;
        'outer: for iteration in 0..self.max_iterations {
            report.iterations = iteration + 1;
            let linearizations = linearize_all(bundle, &layout, &valid);
            let normal = NormalEquations::accumulate(bundle, &layout, &linearizations);
            if normal.max_gradient() <= self.gradient_tolerance {
                report.termination = Termination::Converged;
                break;
            }
            loop {
                if lambda > MAX_LAMBDA {
                    report.termination = Termination::Converged;
                    break 'outer;
                }
                let candidate = normal
                    .solve(&layout, &linearizations, lambda)
                    .and_then(|step| step.apply(bundle, &layout));
                let evaluated = candidate.and_then(|candidate| {
                    total_cost(&candidate, &valid)
                        .filter(|c| c.is_finite())
                        .map(|c| (candidate, c))
                });
                match evaluated {
                    Some((candidate, new_cost)) if new_cost < cost => {
                        let improvement = cost - new_cost;
                        *bundle = candidate;
                        cost = new_cost;
                        lambda = (lambda * 0.1).max(MIN_LAMBDA);
                        if improvement <= self.function_tolerance * cost {
                            report.termination = Termination::Converged;
                            break 'outer;
                        }
                        break;
                    }
                    _ => lambda *= 10.0,
                }
            }
        }

        bundle.is_finite()?;
        report.final_cost = cost;
        trace!(
            "bundle adjustment went from rms {} to {} in {} iterations ({:?})",
            report.initial_rms(),
            report.final_rms(),
            report.iterations,
            report.termination
        );
        Ok(report)
    }
}

fn total_cost(bundle: &Bundle, valid: &[bool]) -> Option<f64> {
    let mut cost = 0.0;
    for (observation, _) in bundle.observations.iter().zip(valid).filter(|(_, &v)| v) {
        cost += 0.5 * bundle.residual(observation)?.norm_squared();
    }
    Some(cost)
}

/// Where the free parameters live in the reduced camera system.
struct Layout {
    pose_offsets: Vec<Option<usize>>,
    intrinsic_offsets: Vec<Option<usize>>,
    camera_len: usize,
    free_points: Vec<bool>,
}

impl Layout {
    /// Only parameters that are observed at least once become free.
    fn new(bundle: &Bundle, options: RefineOptions, valid: &[bool]) -> Self {
        let mut observed_poses = BTreeSet::new();
        let mut observed_intrinsics = BTreeSet::new();
        let mut free_points = vec![false; bundle.points.len()];
        for (observation, _) in bundle.observations.iter().zip(valid).filter(|(_, &v)| v) {
            observed_poses.insert(observation.pose);
            observed_intrinsics.insert(observation.intrinsic);
            free_points[observation.point] = options.structure;
        }

        let mut camera_len = 0;
        let mut pose_offsets = vec![None; bundle.poses.len()];
        if options.poses {
            for &pose in &observed_poses {
                if !bundle.fixed_poses.contains(&pose) {
                    pose_offsets[pose] = Some(camera_len);
                    camera_len += 6;
                }
            }
        }
        let mut intrinsic_offsets = vec![None; bundle.intrinsics.len()];
        if options.intrinsics {
            for &intrinsic in &observed_intrinsics {
                intrinsic_offsets[intrinsic] = Some(camera_len);
                camera_len += bundle.intrinsics[intrinsic].parameter_count();
            }
        }
        Self {
            pose_offsets,
            intrinsic_offsets,
            camera_len,
            free_points,
        }
    }

    fn is_empty(&self) -> bool {
        self.camera_len == 0 && !self.free_points.iter().any(|&f| f)
    }
}

/// First order expansion of one observation.
struct Linearization {
    residual: Vector2<f64>,
    point: usize,
    /// Global columns of the camera parameters touched by this observation.
    columns: Vec<usize>,
    camera: DMatrix<f64>,
    structure: Option<Matrix2x3<f64>>,
}

fn linearize_all(bundle: &Bundle, layout: &Layout, valid: &[bool]) -> Vec<Option<Linearization>> {
    let work = |(observation, &valid): (&BundleObservation, &bool)| {
        if valid {
            linearize(bundle, layout, observation)
        } else {
            None
        }
    };
    #[cfg(feature = "rayon")]
    {
        bundle
            .observations
            .par_iter()
            .zip(valid.par_iter())
            .map(work)
            .collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        bundle.observations.iter().zip(valid).map(work).collect()
    }
}

fn linearize(
    bundle: &Bundle,
    layout: &Layout,
    observation: &BundleObservation,
) -> Option<Linearization> {
    let pose = bundle.poses[observation.pose];
    let intrinsics = bundle.intrinsics[observation.intrinsic];
    let point = bundle.points[observation.point];
    let pixel = observation.pixel;
    let residual = intrinsics.residual(pose, point, pixel)?;

    let mut columns = Vec::new();
    let mut derivatives: Vec<Vector2<f64>> = Vec::new();
    if let Some(offset) = layout.pose_offsets[observation.pose] {
        let translation = pose.isometry().translation.vector;
        for component in 0..6 {
            let step = if component < 3 {
                1e-6
            } else {
                difference_step(translation[component - 3])
            };
            let moved = |step| {
                intrinsics.residual(Se3TangentSpace::axis(component, step).apply(pose), point, pixel)
            };
            columns.push(offset + component);
            derivatives.push((moved(step)? - moved(-step)?) / (2.0 * step));
        }
    }
    if let Some(offset) = layout.intrinsic_offsets[observation.intrinsic] {
        let parameters = intrinsics.parameters();
        for (component, &value) in parameters.iter().enumerate() {
            let step = difference_step(value);
            let moved = |delta: f64| {
                let mut shifted = parameters.clone();
                shifted[component] = value + delta;
                let mut camera = intrinsics;
                camera.set_parameters(&shifted);
                camera.residual(pose, point, pixel)
            };
            columns.push(offset + component);
            derivatives.push((moved(step)? - moved(-step)?) / (2.0 * step));
        }
    }
    let structure = if layout.free_points[observation.point] {
        let mut jacobian = Matrix2x3::zeros();
        for component in 0..3 {
            let step = difference_step(point[component]);
            let moved = |delta: f64| {
                let mut shifted = point;
                shifted[component] += delta;
                intrinsics.residual(pose, shifted, pixel)
            };
            jacobian.set_column(component, &((moved(step)? - moved(-step)?) / (2.0 * step)));
        }
        Some(jacobian)
    } else {
        None
    };

    let camera = DMatrix::from_fn(2, columns.len(), |r, c| derivatives[c][r]);
    Some(Linearization {
        residual,
        point: observation.point,
        columns,
        camera,
        structure,
    })
}

/// `JᵀJ` and `Jᵀr` split into the camera block, the point blocks and their coupling.
struct NormalEquations {
    camera: DMatrix<f64>,
    camera_gradient: DVector<f64>,
    points: Vec<Matrix3<f64>>,
    point_gradients: Vec<Vector3<f64>>,
    /// `J_cᵀ J_p` for each linearization that has both.
    coupling: Vec<Option<MatrixXx3<f64>>>,
    /// Linearizations observing each point.
    point_observations: Vec<Vec<usize>>,
}

impl NormalEquations {
    fn accumulate(
        bundle: &Bundle,
        layout: &Layout,
        linearizations: &[Option<Linearization>],
    ) -> Self {
        let mut camera = DMatrix::zeros(layout.camera_len, layout.camera_len);
        let mut camera_gradient = DVector::zeros(layout.camera_len);
        let mut points = vec![Matrix3::zeros(); bundle.points.len()];
        let mut point_gradients = vec![Vector3::zeros(); bundle.points.len()];
        let mut coupling = Vec::with_capacity(linearizations.len());
        let mut point_observations = vec![Vec::new(); bundle.points.len()];

        for (ix, linearization) in linearizations.iter().enumerate() {
            let linearization = match linearization {
                Some(linearization) => linearization,
                None => {
                    coupling.push(None);
                    continue;
                }
            };
            let cols = &linearization.columns;
            let jtj = linearization.camera.transpose() * &linearization.camera;
            let jtr = linearization.camera.transpose() * linearization.residual;
            for (r, &row) in cols.iter().enumerate() {
                camera_gradient[row] += jtr[r];
                for (c, &col) in cols.iter().enumerate() {
                    camera[(row, col)] += jtj[(r, c)];
                }
            }
            match linearization.structure {
                Some(structure) => {
                    points[linearization.point] += structure.transpose() * structure;
                    point_gradients[linearization.point] +=
                        structure.transpose() * linearization.residual;
                    point_observations[linearization.point].push(ix);
                    coupling.push(Some(linearization.camera.transpose() * structure));
                }
                None => coupling.push(None),
            }
        }
        Self {
            camera,
            camera_gradient,
            points,
            point_gradients,
            coupling,
            point_observations,
        }
    }

    fn max_gradient(&self) -> f64 {
        self.camera_gradient
            .iter()
            .chain(self.point_gradients.iter().flat_map(|g| g.iter()))
            .fold(0.0, |max, g| g.abs().max(max))
    }

    /// Solves the damped system `(JᵀJ + λ D) δ = -Jᵀr`.
    fn solve(
        &self,
        layout: &Layout,
        linearizations: &[Option<Linearization>],
        lambda: f64,
    ) -> Option<Step> {
        let mut schur = self.camera.clone();
        for i in 0..layout.camera_len {
            schur[(i, i)] += lambda * self.camera[(i, i)].max(1e-9);
        }
        let mut rhs = -&self.camera_gradient;

        let mut inverses = vec![None; self.points.len()];
        for (point, observations) in self.point_observations.iter().enumerate() {
            if observations.is_empty() {
                continue;
            }
            let mut damped = self.points[point];
            for i in 0..3 {
                damped[(i, i)] += lambda * self.points[point][(i, i)].max(1e-9);
            }
            let inverse = damped.try_inverse()?;
            for &a in observations {
                let columns_a = &linearizations[a].as_ref()?.columns;
                let coupling_a = self.coupling[a].as_ref()?;
                let weighted = coupling_a * inverse;
                let reduced = &weighted * self.point_gradients[point];
                for (r, &row) in columns_a.iter().enumerate() {
                    rhs[row] += reduced[r];
                }
                for &b in observations {
                    let columns_b = &linearizations[b].as_ref()?.columns;
                    let block = &weighted * self.coupling[b].as_ref()?.transpose();
                    for (r, &row) in columns_a.iter().enumerate() {
                        for (c, &col) in columns_b.iter().enumerate() {
                            schur[(row, col)] -= block[(r, c)];
                        }
                    }
                }
            }
            inverses[point] = Some(inverse);
        }

        let camera = if layout.camera_len == 0 {
            DVector::zeros(0)
        } else {
            let solution = match schur.clone().cholesky() {
                Some(cholesky) => cholesky.solve(&rhs),
                None => schur.lu().solve(&rhs)?,
            };
            if !solution.iter().all(|n| n.is_finite()) {
                return None;
            }
            solution
        };

        let mut points = vec![Vector3::zeros(); self.points.len()];
        for (point, inverse) in inverses.iter().enumerate() {
            let inverse = match inverse {
                Some(inverse) => inverse,
                None => continue,
            };
            let mut b = -self.point_gradients[point];
            for &a in &self.point_observations[point] {
                let columns = &linearizations[a].as_ref()?.columns;
                let local = DVector::from_iterator(columns.len(), columns.iter().map(|&c| camera[c]));
                b -= self.coupling[a].as_ref()?.transpose() * local;
            }
            points[point] = inverse * b;
        }
        Some(Step { camera, points })
    }
}

struct Step {
    camera: DVector<f64>,
    points: Vec<Vector3<f64>>,
}

impl Step {
    fn apply(&self, bundle: &Bundle, layout: &Layout) -> Option<Bundle> {
        let mut out = bundle.clone();
        for (pose, offset) in out.poses.iter_mut().zip(&layout.pose_offsets) {
            if let Some(offset) = *offset {
                let tangent = Se3TangentSpace::from_slice(&self.camera.as_slice()[offset..offset + 6]);
                if !tangent.is_finite() {
                    return None;
                }
                *pose = tangent.apply(*pose);
            }
        }
        for (intrinsics, offset) in out.intrinsics.iter_mut().zip(&layout.intrinsic_offsets) {
            if let Some(offset) = *offset {
                let count = intrinsics.parameter_count();
                let delta = &self.camera.as_slice()[offset..offset + count];
                let updated: Vec<f64> = intrinsics
                    .parameters()
                    .iter()
                    .zip(delta)
                    .map(|(p, d)| p + d)
                    .collect();
                intrinsics.set_parameters(&updated);
                if !intrinsics.is_finite() {
                    return None;
                }
            }
        }
        for ((point, delta), &free) in out.points.iter_mut().zip(&self.points).zip(&layout.free_points) {
            if free {
                *point += *delta;
            }
        }
        Some(out)
    }
}
