use super::{in_front_of_camera, rigid_alignment};
use cv_core::{
    nalgebra::{Matrix3, Matrix4, Point3, SMatrix, SVector, Vector3, Vector4},
    sample_consensus::{Estimator, Model},
    FeatureWorldMatch, Pose, WorldToCamera,
};

type Vector12 = SVector<f64, 12>;

/// Pairs of control points in the order used by the distance constraints.
const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Efficient PnP from "EPnP: An Accurate O(n) Solution to the PnP Problem" by Vincent Lepetit,
/// Francesc Moreno-Noguer and Pascal Fua, IJCV 2009.
///
/// World points are expressed as barycentric combinations of four control points. The camera
/// coordinates of the control points lie in the nullspace of a 12 column linear system, and the
/// combination of nullspace vectors is fixed by preserving the distances between control points.
/// Solutions with one to four nullspace vectors are refined with Gauss-Newton, and the one with
/// the smallest angular error is kept.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EPnP {
    epsilon: f64,
    max_iterations: usize,
    gauss_newton_iterations: usize,
}

impl EPnP {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimates a pose from four or more matches.
    pub fn solve(&self, data: &[FeatureWorldMatch]) -> Option<WorldToCamera> {
        if data.len() < 4 {
            return None;
        }
        let world: Vec<Point3<f64>> = data.iter().map(|m| m.1).collect();
        let controls = control_points(&world, self.epsilon, self.max_iterations)?;
        let alphas = barycentric(&world, &controls)?;

        let mut normal = SMatrix::<f64, 12, 12>::zeros();
        for (&FeatureWorldMatch(bearing, _), alpha) in data.iter().zip(&alphas) {
            // Rows of the bearing cross product constraint b × (Σ αj cj) = 0.
            let skew = bearing.into_inner().cross_matrix();
            let mut rows = SMatrix::<f64, 3, 12>::zeros();
            for j in 0..4 {
                rows.fixed_columns_mut::<3>(3 * j).copy_from(&(skew * alpha[j]));
            }
            normal += rows.transpose() * rows;
        }
        let eigen = normal.try_symmetric_eigen(self.epsilon, self.max_iterations)?;
        let mut order: [usize; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        order.sort_unstable_by_key(|&ix| float_ord::FloatOrd(eigen.eigenvalues[ix]));
        let kernel: [Vector12; 4] = [0, 1, 2, 3].map(|k| eigen.eigenvectors.column(order[k]).into_owned());

        let (l, rho) = distance_system(&kernel, &controls);
        let candidates = [
            betas_one(&l, &rho),
            betas_four(&l, &rho),
            betas_two(&l, &rho),
            betas_three(&l, &rho),
        ];

        candidates
            .iter()
            .flatten()
            .map(|&betas| gauss_newton(&l, &rho, betas, self.gauss_newton_iterations))
            .filter_map(|betas| pose_from_betas(&kernel, &betas, &alphas, &world))
            .filter(|pose| in_front_of_camera(*pose, data))
            .map(|pose| {
                let error = data.iter().map(|m| pose.residual(m)).sum::<f64>();
                (error, pose)
            })
            .min_by_key(|&(error, _)| float_ord::FloatOrd(error))
            .map(|(_, pose)| pose)
    }
}

impl Default for EPnP {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
            gauss_newton_iterations: 5,
        }
    }
}

impl Estimator<FeatureWorldMatch> for EPnP {
    type Model = WorldToCamera;
    type ModelIter = Option<WorldToCamera>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        let data: Vec<FeatureWorldMatch> = data.collect();
        self.solve(&data)
    }
}

/// The centroid and the centroid displaced along each principal axis.
fn control_points(
    world: &[Point3<f64>],
    epsilon: f64,
    max_iterations: usize,
) -> Option<[Point3<f64>; 4]> {
    let count = world.len() as f64;
    let centroid = world.iter().fold(Vector3::zeros(), |s, p| s + p.coords) / count;
    let covariance = world.iter().fold(Matrix3::zeros(), |s, p| {
        let d = p.coords - centroid;
        s + d * d.transpose()
    }) / count;
    let eigen = covariance.try_symmetric_eigen(epsilon, max_iterations)?;
    let axis = |k: usize| {
        Point3::from(centroid + eigen.eigenvectors.column(k) * eigen.eigenvalues[k].max(0.0).sqrt())
    };
    Some([Point3::from(centroid), axis(0), axis(1), axis(2)])
}

fn barycentric(world: &[Point3<f64>], controls: &[Point3<f64>; 4]) -> Option<Vec<Vector4<f64>>> {
    let basis = Matrix3::from_columns(&[
        controls[1] - controls[0],
        controls[2] - controls[0],
        controls[3] - controls[0],
    ]);
    let inverse = basis.try_inverse()?;
    Some(
        world
            .iter()
            .map(|p| {
                let a = inverse * (p - controls[0]);
                Vector4::new(1.0 - a.x - a.y - a.z, a.x, a.y, a.z)
            })
            .collect(),
    )
}

/// Monomials of the betas in the order `[b11, b12, b22, b13, b23, b33, b14, b24, b34, b44]`.
const MONOMIAL_PAIRS: [(usize, usize); 10] = [
    (0, 0),
    (0, 1),
    (1, 1),
    (0, 2),
    (1, 2),
    (2, 2),
    (0, 3),
    (1, 3),
    (2, 3),
    (3, 3),
];

/// `L β = ρ` where `ρ` holds the squared distances between the world control points.
fn distance_system(
    kernel: &[Vector12; 4],
    controls: &[Point3<f64>; 4],
) -> (SMatrix<f64, 6, 10>, SVector<f64, 6>) {
    let mut l = SMatrix::<f64, 6, 10>::zeros();
    let mut rho = SVector::<f64, 6>::zeros();
    for (row, &(i, j)) in PAIRS.iter().enumerate() {
        let differences: [Vector3<f64>; 4] = [0, 1, 2, 3].map(|k| {
            kernel[k].fixed_rows::<3>(3 * i).into_owned() - kernel[k].fixed_rows::<3>(3 * j)
        });
        for (column, &(a, b)) in MONOMIAL_PAIRS.iter().enumerate() {
            let dot = differences[a].dot(&differences[b]);
            l[(row, column)] = if a == b { dot } else { 2.0 * dot };
        }
        rho[row] = (controls[i] - controls[j]).norm_squared();
    }
    (l, rho)
}

fn least_squares<const C: usize>(
    l: &SMatrix<f64, 6, C>,
    rho: &SVector<f64, 6>,
) -> Option<SVector<f64, C>> {
    let normal = l.transpose() * l;
    normal.cholesky().map(|cholesky| cholesky.solve(&(l.transpose() * rho)))
}

fn select<const C: usize>(l: &SMatrix<f64, 6, 10>, columns: [usize; C]) -> SMatrix<f64, 6, C> {
    SMatrix::<f64, 6, C>::from_fn(|r, c| l[(r, columns[c])])
}

/// A single nullspace vector, the scale follows directly from `b11`.
fn betas_one(l: &SMatrix<f64, 6, 10>, rho: &SVector<f64, 6>) -> Option<Vector4<f64>> {
    let b = least_squares(&select(l, [0]), rho)?;
    Some(Vector4::new(b[0].abs().sqrt(), 0.0, 0.0, 0.0))
}

/// Four nullspace vectors, linearized with `[b11, b12, b13, b14]`.
fn betas_four(l: &SMatrix<f64, 6, 10>, rho: &SVector<f64, 6>) -> Option<Vector4<f64>> {
    let b = least_squares(&select(l, [0, 1, 3, 6]), rho)?;
    let sign = if b[0] < 0.0 { -1.0 } else { 1.0 };
    let b1 = (sign * b[0]).sqrt();
    if b1 == 0.0 {
        return None;
    }
    Some(Vector4::new(b1, sign * b[1] / b1, sign * b[2] / b1, sign * b[3] / b1))
}

/// Two nullspace vectors, linearized with `[b11, b12, b22]`.
fn betas_two(l: &SMatrix<f64, 6, 10>, rho: &SVector<f64, 6>) -> Option<Vector4<f64>> {
    let b = least_squares(&select(l, [0, 1, 2]), rho)?;
    let (b1, b2) = if b[0] < 0.0 {
        ((-b[0]).sqrt(), if b[2] < 0.0 { (-b[2]).sqrt() } else { 0.0 })
    } else {
        (b[0].sqrt(), if b[2] > 0.0 { b[2].sqrt() } else { 0.0 })
    };
    let b1 = if b[1] < 0.0 { -b1 } else { b1 };
    Some(Vector4::new(b1, b2, 0.0, 0.0))
}

/// Three nullspace vectors, linearized with `[b11, b12, b22, b13, b23]`.
fn betas_three(l: &SMatrix<f64, 6, 10>, rho: &SVector<f64, 6>) -> Option<Vector4<f64>> {
    let b = least_squares(&select(l, [0, 1, 2, 3, 4]), rho)?;
    let (b1, b2) = if b[0] < 0.0 {
        ((-b[0]).sqrt(), if b[2] < 0.0 { (-b[2]).sqrt() } else { 0.0 })
    } else {
        (b[0].sqrt(), if b[2] > 0.0 { b[2].sqrt() } else { 0.0 })
    };
    let b1 = if b[1] < 0.0 { -b1 } else { b1 };
    if b1 == 0.0 {
        return None;
    }
    Some(Vector4::new(b1, b2, b[3] / b1, 0.0))
}

/// Refines the betas on the full quadratic distance constraints.
fn gauss_newton(
    l: &SMatrix<f64, 6, 10>,
    rho: &SVector<f64, 6>,
    mut betas: Vector4<f64>,
    iterations: usize,
) -> Vector4<f64> {
    for _ in 0..iterations {
        let mut jacobian = SMatrix::<f64, 6, 4>::zeros();
        let mut residual = SVector::<f64, 6>::zeros();
        for row in 0..6 {
            let mut value = 0.0;
            for (column, &(a, b)) in MONOMIAL_PAIRS.iter().enumerate() {
                let coefficient = l[(row, column)];
                value += coefficient * betas[a] * betas[b];
                jacobian[(row, a)] += coefficient * betas[b];
                jacobian[(row, b)] += coefficient * betas[a];
            }
            residual[row] = value - rho[row];
        }
        let normal: Matrix4<f64> = jacobian.transpose() * jacobian;
        let step = match normal.try_inverse() {
            Some(inverse) => inverse * (jacobian.transpose() * residual),
            None => break,
        };
        if !step.iter().all(|n| n.is_finite()) {
            break;
        }
        betas -= step;
    }
    betas
}

fn pose_from_betas(
    kernel: &[Vector12; 4],
    betas: &Vector4<f64>,
    alphas: &[Vector4<f64>],
    world: &[Point3<f64>],
) -> Option<WorldToCamera> {
    let controls: Vector12 = kernel
        .iter()
        .zip(betas.iter())
        .fold(Vector12::zeros(), |s, (v, &b)| s + v * b);
    let control = |j: usize| controls.fixed_rows::<3>(3 * j).into_owned();
    let mut camera: Vec<Point3<f64>> = alphas
        .iter()
        .map(|a| Point3::from((0..4).fold(Vector3::zeros(), |s, j| s + control(j) * a[j])))
        .collect();
    // The nullspace has no sign, keep the points in front of the camera.
    let mean_depth = camera.iter().map(|p| p.z).sum::<f64>();
    if mean_depth < 0.0 {
        camera.iter_mut().for_each(|p| p.coords = -p.coords);
    }
    rigid_alignment(world, &camera).filter(|pose| pose.is_valid(1e-6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Rotation3, UnitVector3};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn problem(rng: &mut Pcg64, count: usize, noise: f64) -> (WorldToCamera, Vec<FeatureWorldMatch>) {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.4, -0.3, 1.0),
            Rotation3::from_euler_angles(0.2, -0.4, 0.1),
        );
        let data = (0..count)
            .map(|_| {
                let camera = Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(4.0..8.0),
                );
                let bearing = camera.coords
                    + Vector3::new(rng.gen_range(-noise..=noise), rng.gen_range(-noise..=noise), 0.0);
                FeatureWorldMatch(
                    UnitVector3::new_normalize(bearing),
                    pose.inverse().transform(camera),
                )
            })
            .collect();
        (pose, data)
    }

    #[test]
    fn exact_data_gives_exact_pose() {
        let mut rng = Pcg64::seed_from_u64(8);
        for count in [6, 10, 50] {
            let (pose, data) = problem(&mut rng, count, 0.0);
            let found = EPnP::new().solve(&data).unwrap();
            assert!(
                (found.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-6,
                "{} points",
                count
            );
        }
    }

    #[test]
    fn noisy_data_stays_close() {
        let mut rng = Pcg64::seed_from_u64(2);
        let (pose, data) = problem(&mut rng, 100, 0.005);
        let found = EPnP::new().solve(&data).unwrap();
        assert!((found.0.translation.vector - pose.0.translation.vector).norm() < 0.1);
        assert!(found.0.rotation.angle_to(&pose.0.rotation) < 0.02);
    }
}
