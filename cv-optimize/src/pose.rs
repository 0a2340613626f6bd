use crate::{difference_step, OptimizeError, Se3TangentSpace};
use cv_core::{
    nalgebra::{
        dimension::{Dynamic, U1},
        DMatrix, DVector, VecStorage,
    },
    CameraIntrinsics, PixelWorldMatch, Pose, WorldToCamera,
};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::*;

/// Residual given to a point that falls behind the camera, in pixels.
const BEHIND_CAMERA_PENALTY: f64 = 1e3;

/// Motion-only refinement of one camera against fixed world points.
///
/// The parameters are a tangent `[ω, δt]` around the initial pose, and the residuals are the
/// pixel reprojection errors of every match, two per match.
#[derive(Clone, Debug)]
pub struct PoseRefiner {
    intrinsics: CameraIntrinsics,
    matches: Vec<PixelWorldMatch>,
    origin: WorldToCamera,
    tangent: Se3TangentSpace,
    residuals: DVector<f64>,
}

impl PoseRefiner {
    pub fn new(intrinsics: CameraIntrinsics, pose: WorldToCamera, matches: Vec<PixelWorldMatch>) -> Self {
        let mut refiner = Self {
            intrinsics,
            matches,
            origin: pose,
            tangent: Se3TangentSpace::identity(),
            residuals: DVector::zeros(0),
        };
        refiner.residuals = refiner.compute_residuals(refiner.pose());
        refiner
    }

    /// The pose at the current parameters.
    pub fn pose(&self) -> WorldToCamera {
        self.tangent.apply(self.origin)
    }

    /// Runs Levenberg-Marquardt and returns the refined pose.
    ///
    /// The initial pose is returned unchanged if the optimization does not lower the cost.
    pub fn refine(self) -> Result<WorldToCamera, OptimizeError> {
        if self.matches.is_empty() {
            return Err(OptimizeError::NoObservations);
        }
        let initial = self.origin;
        let initial_cost = self.cost();
        if !initial_cost.is_finite() {
            return Err(OptimizeError::NonFiniteCost { cost: initial_cost });
        }
        let (refined, report) = LevenbergMarquardt::new().minimize(self);
        let pose = refined.pose();
        if !pose.is_valid(1e-6) {
            return Err(OptimizeError::NonFiniteParameters { what: "pose" });
        }
        let final_cost = refined.cost();
        trace!(
            "pose refinement went from cost {} to {} ({:?})",
            initial_cost,
            final_cost,
            report.termination
        );
        if final_cost.is_finite() && final_cost <= initial_cost {
            Ok(pose)
        } else {
            Ok(initial)
        }
    }

    fn cost(&self) -> f64 {
        0.5 * self.residuals.norm_squared()
    }

    fn compute_residuals(&self, pose: WorldToCamera) -> DVector<f64> {
        let mut residuals = DVector::zeros(2 * self.matches.len());
        for (ix, &PixelWorldMatch(pixel, point)) in self.matches.iter().enumerate() {
            let residual = self
                .intrinsics
                .residual(pose, point, pixel)
                .unwrap_or_else(|| [BEHIND_CAMERA_PENALTY; 2].into());
            residuals[2 * ix] = residual.x;
            residuals[2 * ix + 1] = residual.y;
        }
        residuals
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for PoseRefiner {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.tangent = Se3TangentSpace::from_slice(params.as_slice());
        self.residuals = self.compute_residuals(self.pose());
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_iterator(
            6,
            self.tangent
                .rotation
                .iter()
                .chain(self.tangent.translation.iter())
                .copied(),
        )
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals.clone())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let params = self.params();
        let translation = self.pose().isometry().translation.vector;
        let mut jacobian = DMatrix::zeros(2 * self.matches.len(), 6);
        for component in 0..6 {
            let step = if component < 3 {
                1e-6
            } else {
                difference_step(translation[component - 3])
            };
            let moved = |delta: f64| {
                let mut shifted = params.clone();
                shifted[component] += delta;
                self.compute_residuals(Se3TangentSpace::from_slice(shifted.as_slice()).apply(self.origin))
            };
            jacobian.set_column(component, &((moved(step) - moved(-step)) / (2.0 * step)));
        }
        Some(jacobian)
    }
}
