use crate::essential::{EssentialMatrix, OrientedPose};
use arrayvec::ArrayVec;
use cv_core::{
    nalgebra::{Matrix3, SMatrix, SVector},
    sample_consensus::Estimator,
    FeatureMatch,
};

type Polynomial = [f64; 20];

/// Exponents of `x`, `y` and `z` for every monomial of degree at most three.
///
/// The first ten are the cubic monomials eliminated by Gauss-Jordan. The last ten form the basis
/// of the quotient ring in which the action matrix is expressed.
const MONOMIALS: [[u8; 3]; 20] = [
    [3, 0, 0],
    [2, 1, 0],
    [1, 2, 0],
    [0, 3, 0],
    [2, 0, 1],
    [1, 1, 1],
    [0, 2, 1],
    [1, 0, 2],
    [0, 1, 2],
    [0, 0, 3],
    [2, 0, 0],
    [1, 1, 0],
    [0, 2, 0],
    [1, 0, 1],
    [0, 1, 1],
    [0, 0, 2],
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
    [0, 0, 0],
];

fn monomial_index(exponents: [u8; 3]) -> Option<usize> {
    MONOMIALS.iter().position(|&m| m == exponents)
}

/// Products of degree above three never happen: every entry of `E` is linear.
fn multiply(a: &Polynomial, b: &Polynomial) -> Polynomial {
    let mut out = [0.0; 20];
    for (i, &ca) in a.iter().enumerate().filter(|(_, c)| **c != 0.0) {
        for (j, &cb) in b.iter().enumerate().filter(|(_, c)| **c != 0.0) {
            let exponents = [
                MONOMIALS[i][0] + MONOMIALS[j][0],
                MONOMIALS[i][1] + MONOMIALS[j][1],
                MONOMIALS[i][2] + MONOMIALS[j][2],
            ];
            if let Some(k) = monomial_index(exponents) {
                out[k] += ca * cb;
            }
        }
    }
    out
}

fn add(a: &Polynomial, b: &Polynomial) -> Polynomial {
    let mut out = *a;
    out.iter_mut().zip(b).for_each(|(o, b)| *o += b);
    out
}

fn scale(a: &Polynomial, s: f64) -> Polynomial {
    let mut out = *a;
    out.iter_mut().for_each(|o| *o *= s);
    out
}

type PolyMatrix = [[Polynomial; 3]; 3];

fn poly_mul(a: &PolyMatrix, b: &PolyMatrix) -> PolyMatrix {
    let mut out = [[[0.0; 20]; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            for k in 0..3 {
                out[r][c] = add(&out[r][c], &multiply(&a[r][k], &b[k][c]));
            }
        }
    }
    out
}

fn poly_transpose(a: &PolyMatrix) -> PolyMatrix {
    let mut out = *a;
    for r in 0..3 {
        for c in 0..3 {
            out[r][c] = a[c][r];
        }
    }
    out
}

/// The relative pose solver of Stewénius, Engels and Nistér from the paper
/// "Recent developments on direct relative orientation".
///
/// Works with five or more bearing matches and returns up to ten essential matrices. With more
/// than five matches the nullspace is taken in the least squares sense.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct FivePoint {
    epsilon: f64,
    max_iterations: usize,
}

impl FivePoint {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the eigen and SVD solvers.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations of the eigen and SVD solvers.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Returns every essential matrix compatible with the matches.
    pub fn from_matches<I>(&self, data: I) -> ArrayVec<EssentialMatrix, 10>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        let mut solutions = ArrayVec::new();
        let basis = match self.nullspace(data) {
            Some(basis) => basis,
            None => return solutions,
        };

        // Every entry of E = x X + y Y + z Z + W as a polynomial.
        let mut e: PolyMatrix = [[[0.0; 20]; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                let ix = 3 * r + c;
                e[r][c][16] = basis[0][ix];
                e[r][c][17] = basis[1][ix];
                e[r][c][18] = basis[2][ix];
                e[r][c][19] = basis[3][ix];
            }
        }

        let mut constraints = SMatrix::<f64, 10, 20>::zeros();
        // det(E) = 0
        let minor = |a: usize, b: usize, c: usize, d: usize| {
            add(
                &multiply(&e[1][a], &e[2][b]),
                &scale(&multiply(&e[1][c], &e[2][d]), -1.0),
            )
        };
        let det = add(
            &add(
                &multiply(&e[0][0], &minor(1, 2, 2, 1)),
                &scale(&multiply(&e[0][1], &minor(0, 2, 2, 0)), -1.0),
            ),
            &multiply(&e[0][2], &minor(0, 1, 1, 0)),
        );
        constraints.row_mut(0).copy_from_slice(&det);

        // 2 E Eᵀ E - tr(E Eᵀ) E = 0
        let eet = poly_mul(&e, &poly_transpose(&e));
        let trace = add(&add(&eet[0][0], &eet[1][1]), &eet[2][2]);
        let eete = poly_mul(&eet, &e);
        for r in 0..3 {
            for c in 0..3 {
                let row = add(
                    &scale(&eete[r][c], 2.0),
                    &scale(&multiply(&trace, &e[r][c]), -1.0),
                );
                constraints.row_mut(1 + 3 * r + c).copy_from_slice(&row);
            }
        }

        let cubic = constraints.fixed_columns::<10>(0).into_owned();
        let rest = constraints.fixed_columns::<10>(10).into_owned();
        let reduced = match cubic.full_piv_lu().solve(&rest) {
            Some(reduced) => reduced,
            None => return solutions,
        };

        // Multiplication by x in the basis [xx, xy, yy, xz, yz, zz, x, y, z, 1].
        let mut action = SMatrix::<f64, 10, 10>::zeros();
        for j in 0..10 {
            let [a, b, c] = MONOMIALS[10 + j];
            let k = match monomial_index([a + 1, b, c]) {
                Some(k) => k,
                None => return solutions,
            };
            if k < 10 {
                action.set_row(j, &(-reduced.row(k)));
            } else {
                action[(j, k - 10)] = 1.0;
            }
        }

        for eigenvalue in action.complex_eigenvalues().iter() {
            if eigenvalue.im.abs() > 1e-8 * (1.0 + eigenvalue.re.abs()) {
                continue;
            }
            let shifted = action - SMatrix::<f64, 10, 10>::identity() * eigenvalue.re;
            let svd = match shifted.try_svd(false, true, self.epsilon, self.max_iterations) {
                Some(svd) => svd,
                None => continue,
            };
            let v_t = match svd.v_t {
                Some(v_t) => v_t,
                None => continue,
            };
            let (ix, _) = svd.singular_values.argmin();
            let monomials = v_t.row(ix);
            if monomials[9].abs() < 1e-12 {
                continue;
            }
            let (x, y, z) = (
                monomials[6] / monomials[9],
                monomials[7] / monomials[9],
                monomials[8] / monomials[9],
            );
            let flat = basis[0] * x + basis[1] * y + basis[2] * z + basis[3];
            let essential = Matrix3::from_row_slice(flat.as_slice());
            let norm = essential.norm();
            if norm.is_finite() && norm > 0.0 && !solutions.is_full() {
                solutions.push(EssentialMatrix(essential / norm));
            }
        }
        solutions
    }

    /// The four vectors spanning the (approximate) right nullspace of the epipolar constraints.
    fn nullspace<I>(&self, data: I) -> Option<[SVector<f64, 9>; 4]>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        let mut count = 0;
        for FeatureMatch(a, b) in data {
            let mut row = SVector::<f64, 9>::zeros();
            for i in 0..3 {
                for j in 0..3 {
                    row[3 * i + j] = b[i] * a[j];
                }
            }
            normal += row * row.transpose();
            count += 1;
        }
        if count < Self::MIN_SAMPLES {
            return None;
        }
        let eigen = normal.try_symmetric_eigen(self.epsilon, self.max_iterations)?;
        let mut order: [usize; 9] = [0, 1, 2, 3, 4, 5, 6, 7, 8];
        order.sort_unstable_by_key(|&ix| float_ord::FloatOrd(eigen.eigenvalues[ix]));
        Some([
            eigen.eigenvectors.column(order[0]).into_owned(),
            eigen.eigenvectors.column(order[1]).into_owned(),
            eigen.eigenvectors.column(order[2]).into_owned(),
            eigen.eigenvectors.column(order[3]).into_owned(),
        ])
    }
}

impl Default for FivePoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch> for FivePoint {
    type Model = EssentialMatrix;
    type ModelIter = ArrayVec<EssentialMatrix, 10>;
    const MIN_SAMPLES: usize = 5;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(data)
    }
}

/// Five point relative pose that returns poses instead of essential matrices.
///
/// Each essential matrix is decomposed and only the pose that places every sampled match in
/// front of both cameras is kept. The resulting [`OrientedPose`] models reject matches with
/// the wrong chirality.
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct OrientedFivePoint(pub FivePoint);

impl Estimator<FeatureMatch> for OrientedFivePoint {
    type Model = OrientedPose;
    type ModelIter = ArrayVec<OrientedPose, 10>;
    const MIN_SAMPLES: usize = 5;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.0
            .from_matches(data.clone())
            .iter()
            .filter_map(|essential| {
                essential
                    .pose_solver()
                    .epsilon(self.0.epsilon)
                    .max_iterations(self.0.max_iterations)
                    .solve_unanimous(data.clone())
            })
            .map(OrientedPose)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::{
        nalgebra::{Point3, Rotation3, UnitVector3, Vector3},
        sample_consensus::Model,
        CameraToCamera, Pose,
    };
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn scene(rng: &mut Pcg64, count: usize) -> (CameraToCamera, Vec<FeatureMatch>) {
        let pose = CameraToCamera::from_parts(
            Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-0.2..0.2), 0.1).normalize(),
            Rotation3::from_euler_angles(
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.1..0.1),
            ),
        );
        let matches = (0..count)
            .map(|_| {
                let p = Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(4.0..8.0),
                );
                FeatureMatch(
                    UnitVector3::new_normalize(p.coords),
                    UnitVector3::new_normalize(pose.transform(p).coords),
                )
            })
            .collect();
        (pose, matches)
    }

    #[test]
    fn one_solution_matches_ground_truth() {
        let mut rng = Pcg64::seed_from_u64(3);
        for _ in 0..20 {
            let (pose, matches) = scene(&mut rng, 5);
            let truth = EssentialMatrix::from(pose);
            let truth = truth.0 / truth.0.norm();
            let solutions = FivePoint::new().from_matches(matches.iter().copied());
            assert!(!solutions.is_empty());
            let best = solutions
                .iter()
                .map(|e| (e.0 - truth).norm().min((e.0 + truth).norm()))
                .fold(f64::INFINITY, f64::min);
            assert!(best < 1e-5, "closest solution is {} away", best);
        }
    }

    #[test]
    fn every_solution_satisfies_sample() {
        let mut rng = Pcg64::seed_from_u64(7);
        let (_, matches) = scene(&mut rng, 5);
        for essential in FivePoint::new().from_matches(matches.iter().copied()) {
            for m in &matches {
                assert!(essential.residual(m) < 1e-6);
            }
        }
    }

    #[test]
    fn oriented_recovers_pose() {
        let mut rng = Pcg64::seed_from_u64(11);
        let (pose, matches) = scene(&mut rng, 5);
        let poses = OrientedFivePoint::default().estimate(matches.iter().copied());
        let found = poses.iter().any(|p| {
            (p.0 .0.rotation.matrix() - pose.0.rotation.matrix()).norm() < 1e-6
                && (p.0 .0.translation.vector - pose.0.translation.vector).norm() < 1e-6
        });
        assert!(found);
    }

    #[test]
    fn too_few_matches_give_nothing() {
        let mut rng = Pcg64::seed_from_u64(1);
        let (_, matches) = scene(&mut rng, 4);
        assert!(FivePoint::new().from_matches(matches.into_iter()).is_empty());
    }
}
