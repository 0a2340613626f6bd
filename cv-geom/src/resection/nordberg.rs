// Copyright (c) 2018 Michael Persson
// Adapted to openMVG by Romain Janvier and Pierre Moulon
// Adapted to Rust by Matthieu Pizenberg

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::{in_front_of_camera, three};
use arrayvec::ArrayVec;
use cv_core::{
    nalgebra::{Matrix3, Rotation3, Vector3},
    sample_consensus::Estimator,
    FeatureWorldMatch, Pose, WorldToCamera,
};

/// Lambda Twist P3P from "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P)
/// Solver" by Mikael Persson and Klas Nordberg, ECCV 2018.
///
/// Solves `λi yi = R xi + t` for the three depths `λi` by diagonalizing a pencil of the two
/// quadratic distance constraints, then recovers `R` and `t` from the depths. Returns up to
/// four poses, all of which place the three points in front of the camera.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaTwist {
    gauss_newton_iterations: usize,
    rotation_convergence_iterations: usize,
    rotation_convergence_epsilon: f64,
}

impl LambdaTwist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterations of Gauss-Newton used to polish the depths. Rarely useful above two.
    ///
    /// Default is `5`.
    #[must_use]
    pub fn gauss_newton_iterations(self, gauss_newton_iterations: usize) -> Self {
        Self {
            gauss_newton_iterations,
            ..self
        }
    }

    /// Iterations spent converging the recovered matrix onto a proper rotation.
    #[must_use]
    pub fn rotation_convergence_iterations(self, rotation_convergence_iterations: usize) -> Self {
        Self {
            rotation_convergence_iterations,
            ..self
        }
    }

    pub fn solve(&self, samples: [FeatureWorldMatch; 3]) -> ArrayVec<WorldToCamera, 4> {
        let mut poses = ArrayVec::new();
        let points = samples.map(|FeatureWorldMatch(_, point)| point);
        let bearings = samples.map(|FeatureWorldMatch(bearing, _)| bearing.into_inner());

        let d12 = points[0] - points[1];
        let d13 = points[0] - points[2];
        let d23 = points[1] - points[2];
        let normal = d12.cross(&d13);

        // Squared side lengths of the world triangle and cosines between the bearings.
        let system = DepthSystem {
            a12: d12.norm_squared(),
            a13: d13.norm_squared(),
            a23: d23.norm_squared(),
            b12: -2.0 * bearings[0].dot(&bearings[1]),
            b13: -2.0 * bearings[2].dot(&bearings[0]),
            b23: -2.0 * bearings[1].dot(&bearings[2]),
        };

        #[rustfmt::skip]
        let world_frame = Matrix3::new(
            d12.x, d13.x, normal.x,
            d12.y, d13.y, normal.y,
            d12.z, d13.z, normal.z,
        );
        let world_frame_inverse = match world_frame.try_inverse() {
            Some(inverse) => inverse,
            None => return poses,
        };

        for depths in system.depth_candidates() {
            let depths = system.refine(depths, self.gauss_newton_iterations);
            let rays = [
                depths.x * bearings[0],
                depths.y * bearings[1],
                depths.z * bearings[2],
            ];
            let e1 = rays[0] - rays[1];
            let e2 = rays[0] - rays[2];
            let e3 = e1.cross(&e2);
            #[rustfmt::skip]
            let camera_frame = Matrix3::new(
                e1.x, e2.x, e3.x,
                e1.y, e2.y, e3.y,
                e1.z, e2.z, e3.z,
            );
            let rotation = Rotation3::from_matrix_eps(
                &(camera_frame * world_frame_inverse),
                self.rotation_convergence_epsilon,
                self.rotation_convergence_iterations,
                Rotation3::identity(),
            );
            let translation = rays[0] - rotation * points[0].coords;
            let pose = WorldToCamera::from_parts(translation, rotation);
            if pose.is_valid(1e-6) && in_front_of_camera(pose, &samples) && !poses.is_full() {
                poses.push(pose);
            }
        }
        poses
    }
}

impl Default for LambdaTwist {
    fn default() -> Self {
        Self {
            gauss_newton_iterations: 5,
            rotation_convergence_iterations: 100,
            rotation_convergence_epsilon: 1e-12,
        }
    }
}

impl Estimator<FeatureWorldMatch> for LambdaTwist {
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

/// The three equations `λi² + λj² + bij λi λj = aij`.
#[derive(Copy, Clone, Debug)]
struct DepthSystem {
    a12: f64,
    a13: f64,
    a23: f64,
    b12: f64,
    b13: f64,
    b23: f64,
}

impl DepthSystem {
    /// Up to four positive depth triplets, from the sharpest root of the cubic of equation (10).
    fn depth_candidates(&self) -> ArrayVec<Vector3<f64>, 4> {
        let &Self {
            a12,
            a13,
            a23,
            b12,
            b13,
            b23,
        } = self;
        let (c12, c13, c23) = (-b12 / 2.0, -b13 / 2.0, -b23 / 2.0);
        let blob = c12 * c23 * c13 - 1.0;
        let s12 = 1.0 - c12 * c12;
        let s13 = 1.0 - c13 * c13;
        let s23 = 1.0 - c23 * c23;

        let p3 = a13 * (a23 * s13 - a13 * s23);
        let p2 = 2.0 * blob * a23 * a13 + a13 * (2.0 * a12 + a13) * s23 + a23 * (a23 - a12) * s13;
        let p1 = a23 * (a13 - a23) * s12 - a12 * a12 * s23 - 2.0 * a12 * (blob * a23 + a13 * s23);
        let p0 = a12 * (a12 * s23 - a23 * s12);
        let gamma = sharpest_cubic_root(p2 / p3, p1 / p3, p0 / p3);

        #[rustfmt::skip]
        let d0 = Matrix3::new(
            a23 * (1.0 - gamma), -(a23 * c12),            a23 * c13 * gamma,
            -(a23 * c12),        a23 - a12 + a13 * gamma, -c23 * (a13 * gamma - a12),
            a23 * c13 * gamma,   -c23 * (a13 * gamma - a12), gamma * (a13 - a23) - a12,
        );
        let (vectors, values) = singular_eigen(d0);

        let mut candidates = ArrayVec::new();
        let ratio = (-values[1] / values[0]).max(0.0).sqrt();
        for ratio in [ratio, -ratio] {
            // Equation (15): λ1 = w0 λ2 + w1 λ3 on each line of the degenerate conic.
            let w2 = 1.0 / (ratio * vectors.m12 - vectors.m11);
            let w0 = w2 * (vectors.m21 - ratio * vectors.m22);
            let w1 = w2 * (vectors.m31 - ratio * vectors.m32);
            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
            let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);
            let (tau1, tau2) = match quadratic_roots(b, c) {
                Some(roots) => roots,
                None => continue,
            };
            for tau in [tau1, tau2] {
                // Equation (16), with τ = λ3 / λ2.
                if tau <= 0.0 {
                    continue;
                }
                let squared = a23 / (tau * (b23 + tau) + 1.0);
                if squared <= 0.0 {
                    continue;
                }
                let l2 = squared.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 && !candidates.is_full() {
                    candidates.push(Vector3::new(l1, l2, l3));
                }
            }
        }
        candidates
    }

    fn residuals(&self, l: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            l.x * l.x + l.y * l.y + self.b12 * l.x * l.y - self.a12,
            l.x * l.x + l.z * l.z + self.b13 * l.x * l.z - self.a13,
            l.y * l.y + l.z * l.z + self.b23 * l.y * l.z - self.a23,
        )
    }

    /// Gauss-Newton on the three depth equations, stopping as soon as a step does not help.
    fn refine(&self, mut depths: Vector3<f64>, iterations: usize) -> Vector3<f64> {
        let l1_norm = |v: &Vector3<f64>| v.x.abs() + v.y.abs() + v.z.abs();
        let mut residuals = self.residuals(&depths);
        for _ in 0..iterations {
            if l1_norm(&residuals) < 1e-10 {
                break;
            }
            let (l1, l2, l3) = (depths.x, depths.y, depths.z);
            #[rustfmt::skip]
            let jacobian = Matrix3::new(
                2.0 * l1 + self.b12 * l2, 2.0 * l2 + self.b12 * l1, 0.0,
                2.0 * l1 + self.b13 * l3, 0.0,                      2.0 * l3 + self.b13 * l1,
                0.0,                      2.0 * l2 + self.b23 * l3, 2.0 * l3 + self.b23 * l2,
            );
            let step = match jacobian.try_inverse() {
                Some(inverse) => inverse * residuals,
                None => break,
            };
            let next = depths - step;
            let next_residuals = self.residuals(&next);
            if l1_norm(&next_residuals) > l1_norm(&residuals) {
                break;
            }
            depths = next;
            residuals = next_residuals;
        }
        depths
    }
}

/// Real roots of `r² + b r + c`, computed without cancellation.
fn quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = discriminant.sqrt();
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// One root of `r³ + b r² + c r + d` where the derivative is as large as possible.
///
/// Newton iterations start from the outermost root of a second order approximation around the
/// stationary points, or from the inflection point when the cubic is monotonic.
#[allow(clippy::many_single_char_names)]
fn sharpest_cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let cubic = |r: f64| ((r + b) * r + c) * r + d;
    let slope = |r: f64| (3.0 * r + 2.0 * b) * r + c;

    let mut r = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k1 = cubic(t1);
        if k1 > 0.0 {
            t1 - (-k1 / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            t2 + (-cubic(t2) / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let r = -b / 3.0;
        if slope(r).abs() < 1e-4 {
            r + 1.0
        } else {
            r
        }
    };

    for iteration in 0..50 {
        let value = cubic(r);
        if iteration >= 7 && value.abs() <= 1e-13 {
            break;
        }
        r -= value / slope(r);
    }
    r
}

/// Eigen decomposition of a symmetric matrix with one zero eigenvalue.
///
/// Returns the eigenvectors as columns, the one of the zero eigenvalue last, and the two non-zero
/// eigenvalues sorted by decreasing magnitude.
fn singular_eigen(x: Matrix3<f64>) -> (Matrix3<f64>, [f64; 2]) {
    let null = x.column(0).cross(&x.column(1)).normalize();

    let x12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -x12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (mut e1, mut e2) = quadratic_roots(b, c).unwrap_or((0.5 * b, 0.5 * b));
    if e1.abs() < e2.abs() {
        core::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let vector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + x12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        Vector3::new(a1, a2, 1.0).normalize()
    };

    (
        Matrix3::from_columns(&[vector(e1), vector(e2), null]),
        [e1, e2],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use arrsac::Arrsac;
    use cv_core::{
        nalgebra::{Point3, UnitVector3},
        sample_consensus::Consensus,
    };
    use rand::{rngs::SmallRng, SeedableRng};

    fn samples(pose: WorldToCamera, camera_points: &[Point3<f64>]) -> Vec<FeatureWorldMatch> {
        camera_points
            .iter()
            .map(|&p| {
                FeatureWorldMatch(
                    UnitVector3::new_normalize(p.coords),
                    pose.inverse().transform(p),
                )
            })
            .collect()
    }

    fn camera_points() -> Vec<Point3<f64>> {
        vec![
            Point3::new(-0.228_125, -0.061_458_334, 1.0),
            Point3::new(0.418_75, -0.581_25, 2.0),
            Point3::new(1.128_125, 0.878_125, 3.0),
            Point3::new(-0.528_125, 0.178_125, 2.5),
            Point3::new(-0.923_424, -0.235_125, 2.8),
        ]
    }

    #[test]
    fn minimal_sample_contains_truth() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, 0.2, 0.3),
            Rotation3::from_euler_angles(0.1, 0.2, 0.3),
        );
        let data = samples(pose, &camera_points());
        let poses = LambdaTwist::new().estimate(data.iter().copied());
        assert!(poses
            .iter()
            .any(|p| (p.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-6));
    }

    #[test]
    fn arrsac_picks_single_model() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, 0.2, 0.3),
            Rotation3::from_euler_angles(0.1, 0.2, 0.3),
        );
        let data = samples(pose, &camera_points());
        let mut arrsac = Arrsac::new(0.01, SmallRng::seed_from_u64(0));
        let found = arrsac.model(&LambdaTwist::new(), data.iter().copied()).unwrap();
        assert_relative_eq!(found.0.rotation, pose.0.rotation, epsilon = 1e-6);
        assert_relative_eq!(found.0.translation, pose.0.translation, epsilon = 1e-6);
    }

    #[test]
    fn collinear_points_give_nothing() {
        let data: Vec<_> = (0..3)
            .map(|i| {
                let p = Point3::new(i as f64, 0.0, 3.0);
                FeatureWorldMatch(UnitVector3::new_normalize(p.coords), p)
            })
            .collect();
        assert!(LambdaTwist::new().estimate(data.into_iter()).is_empty());
    }
}
