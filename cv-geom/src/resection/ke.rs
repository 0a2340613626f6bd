use super::{in_front_of_camera, nearest_rotation, three, translation_for_rotation};
use crate::polynomial::{add, multiply, real_roots};
use arrayvec::ArrayVec;
use cv_core::{
    nalgebra::Vector3,
    sample_consensus::{Estimator, Model},
    FeatureWorldMatch, Pose, WorldToCamera,
};

/// A polynomial in `cos θ` and `sin θ` of degree at most four, `coefficients[i][j]` multiplies
/// `cᶦ sʲ`.
#[derive(Copy, Clone, Debug, Default)]
struct Trigonometric([[f64; 5]; 5]);

impl Trigonometric {
    /// `constant + cos_term c + sin_term s`
    fn linear(constant: f64, cos_term: f64, sin_term: f64) -> Self {
        let mut out = Self::default();
        out.0[0][0] = constant;
        out.0[1][0] = cos_term;
        out.0[0][1] = sin_term;
        out
    }

    fn mul(&self, other: &Self) -> Self {
        let mut out = Self::default();
        for i in 0..5 {
            for j in 0..5 - i {
                if self.0[i][j] == 0.0 {
                    continue;
                }
                for k in 0..5 - i - j {
                    for l in 0..5 - i - j - k {
                        out.0[i + k][j + l] += self.0[i][j] * other.0[k][l];
                    }
                }
            }
        }
        out
    }

    fn sub(&self, other: &Self) -> Self {
        let mut out = *self;
        for i in 0..5 {
            for j in 0..5 {
                out.0[i][j] -= other.0[i][j];
            }
        }
        out
    }

    fn plus(&self, other: &Self) -> Self {
        let mut out = *self;
        for i in 0..5 {
            for j in 0..5 {
                out.0[i][j] += other.0[i][j];
            }
        }
        out
    }

    fn evaluate(&self, c: f64, s: f64) -> f64 {
        let mut sum = 0.0;
        for i in 0..5 {
            for j in 0..5 - i {
                sum += self.0[i][j] * c.powi(i as i32) * s.powi(j as i32);
            }
        }
        sum
    }

    /// Substitutes `c = (1 - t²) / (1 + t²)` and `s = 2t / (1 + t²)` and clears the denominator,
    /// giving a polynomial of degree eight in `t = tan(θ / 2)`, highest degree first.
    fn half_angle(&self) -> Vec<f64> {
        let power = |base: &[f64], exponent: usize| {
            (0..exponent).fold(vec![1.0], |acc, _| multiply(&acc, base))
        };
        let mut out = vec![0.0];
        for i in 0..5 {
            for j in 0..5 - i {
                let coefficient = self.0[i][j];
                if coefficient == 0.0 {
                    continue;
                }
                let term = multiply(
                    &multiply(&power(&[-1.0, 0.0, 1.0], i), &power(&[2.0, 0.0], j)),
                    &power(&[1.0, 0.0, 1.0], 4 - i - j),
                );
                let scaled: Vec<f64> = term.iter().map(|t| t * coefficient).collect();
                out = add(&out, &scaled);
            }
        }
        out
    }
}

/// Rotation first P3P, after "An Efficient Algebraic Solution to the Perspective-Three-Point
/// Problem" by Tong Ke and Stergios Roumeliotis, CVPR 2017.
///
/// The rotation is found before the depths. For each pair of points, the world segment between
/// them must rotate into the plane spanned by their two bearings. This gives three constraints
/// on the rotation that do not involve the translation. The rotation is parametrized by two
/// angles so that the first constraint always holds. The second angle is then eliminated, which
/// leaves a single polynomial in the first one. The translation follows linearly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeP3p;

impl KeP3p {
    pub fn new() -> Self {
        Self
    }

    pub fn solve(&self, samples: [FeatureWorldMatch; 3]) -> ArrayVec<WorldToCamera, 4> {
        let mut poses = ArrayVec::new();
        let points = samples.map(|FeatureWorldMatch(_, p)| p.coords);
        let bearings = samples.map(|FeatureWorldMatch(b, _)| b.into_inner());

        let frames = (
            (points[0] - points[1]).try_normalize(1e-12),
            bearings[0].cross(&bearings[1]).try_normalize(1e-12),
        );
        let (k1, k3) = match frames {
            (Some(k1), Some(k3)) => (k1, k3),
            _ => return poses,
        };
        if (points[0] - points[2]).cross(&(points[1] - points[2])).norm() < 1e-12 {
            return poses;
        }

        // The rotation maps k1 to cos θ b1 + sin θ f2, which is always orthogonal to k3.
        let b1 = bearings[0];
        let f2 = k3.cross(&b1);

        // Orthonormal world basis with k1 first.
        let e1 = k1;
        let helper = if k1.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let e2 = k1.cross(&helper).normalize();
        let e3 = e1.cross(&e2);

        // Each remaining constraint becomes A cos φ + B sin φ + D = 0.
        let constraint = |v: Vector3<f64>, u: Vector3<f64>| {
            let (p, q, r) = (u.dot(&e1), u.dot(&e2), u.dot(&e3));
            let (vk, vb, vf) = (v.dot(&k3), v.dot(&b1), v.dot(&f2));
            (
                Trigonometric::linear(q * vk, -r * vf, r * vb),
                Trigonometric::linear(-r * vk, -q * vf, q * vb),
                Trigonometric::linear(0.0, p * vb, p * vf),
            )
        };
        let (a1, b1_coeff, d1) = constraint(bearings[0].cross(&bearings[2]), points[0] - points[2]);
        let (a2, b2_coeff, d2) = constraint(bearings[1].cross(&bearings[2]), points[1] - points[2]);

        // cos φ and sin φ by Cramer's rule, then cos² φ + sin² φ = 1.
        let cos_numerator = d2.mul(&b1_coeff).sub(&d1.mul(&b2_coeff));
        let sin_numerator = a2.mul(&d1).sub(&a1.mul(&d2));
        let determinant = a1.mul(&b2_coeff).sub(&a2.mul(&b1_coeff));
        let unit = cos_numerator
            .mul(&cos_numerator)
            .plus(&sin_numerator.mul(&sin_numerator))
            .sub(&determinant.mul(&determinant));

        for t in real_roots(&unit.half_angle()) {
            let denominator = 1.0 + t * t;
            let (c, s) = ((1.0 - t * t) / denominator, 2.0 * t / denominator);
            let det = determinant.evaluate(c, s);
            if det.abs() < 1e-14 {
                continue;
            }
            let cos_phi = cos_numerator.evaluate(c, s) / det;
            let sin_phi = sin_numerator.evaluate(c, s) / det;
            let norm = cos_phi.hypot(sin_phi);
            if (norm - 1.0).abs() > 1e-3 {
                continue;
            }
            let (cos_phi, sin_phi) = (cos_phi / norm, sin_phi / norm);

            let c1 = c * b1 + s * f2;
            let h = -c * f2 + s * b1;
            let c2 = cos_phi * k3 + sin_phi * h;
            let c3 = cos_phi * h - sin_phi * k3;
            let matrix = c1 * e1.transpose() + c2 * e2.transpose() + c3 * e3.transpose();

            let rotation = match nearest_rotation(matrix) {
                Some(rotation) => rotation,
                None => continue,
            };
            let translation = match translation_for_rotation(&rotation, &samples) {
                Some(translation) => translation,
                None => continue,
            };
            let pose = WorldToCamera::from_parts(translation, rotation);
            let consistent = samples.iter().all(|sample| pose.residual(sample) < 1e-4);
            if consistent && in_front_of_camera(pose, &samples) && !poses.is_full() {
                poses.push(pose);
            }
        }
        poses
    }
}

impl Estimator<FeatureWorldMatch> for KeP3p {
    type Model = WorldToCamera;
    type ModelIter = ArrayVec<WorldToCamera, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        three(data).map(|s| self.solve(s)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Point3, Rotation3, UnitVector3};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn random_problem(rng: &mut Pcg64) -> (WorldToCamera, [FeatureWorldMatch; 3]) {
        let pose = WorldToCamera::from_parts(
            Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
            Rotation3::from_euler_angles(
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-3.0..3.0),
            ),
        );
        let samples = [0; 3].map(|_| {
            let camera = Point3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.0..6.0),
            );
            FeatureWorldMatch(
                UnitVector3::new_normalize(camera.coords),
                pose.inverse().transform(camera),
            )
        });
        (pose, samples)
    }

    #[test]
    fn random_configurations_are_solved() {
        let mut rng = Pcg64::seed_from_u64(12);
        for _ in 0..20 {
            let (pose, samples) = random_problem(&mut rng);
            let poses = KeP3p::new().solve(samples);
            assert!(!poses.is_empty());
            assert!(poses
                .iter()
                .any(|p| (p.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-6));
        }
    }

    #[test]
    fn solutions_reproject_sample() {
        let mut rng = Pcg64::seed_from_u64(5);
        let (_, samples) = random_problem(&mut rng);
        for pose in KeP3p::new().solve(samples) {
            for sample in &samples {
                assert!(pose.residual(sample) < 1e-6);
            }
        }
    }
}
