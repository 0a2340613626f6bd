use super::nearest_rotation;
use cv_core::{
    nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Point3, SMatrix, SVector, Vector3},
    sample_consensus::{Estimator, Model},
    FeatureWorldMatch, PixelWorldMatch, Pose, WorldToCamera,
};

/// A 3x4 projection matrix `P = K [R | t]` mapping homogeneous world points to pixels.
///
/// Matrices produced by [`ProjectiveDlt`] are scaled so that the third coordinate of a projected
/// point is its depth, which is positive in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionMatrix(pub Matrix3x4<f64>);

impl ProjectionMatrix {
    pub fn from_parts(calibration: &Matrix3<f64>, pose: WorldToCamera) -> Self {
        let isometry = pose.isometry();
        let mut extrinsics = Matrix3x4::zeros();
        extrinsics
            .fixed_columns_mut::<3>(0)
            .copy_from(isometry.rotation.matrix());
        extrinsics
            .column_mut(3)
            .copy_from(&isometry.translation.vector);
        Self(calibration * extrinsics)
    }

    /// Projects a world point, returning `None` when it is not in front of the camera.
    pub fn project(&self, point: Point3<f64>) -> Option<Point2<f64>> {
        let projected = self.0 * point.to_homogeneous();
        if projected.z <= 0.0 || !projected.z.is_finite() {
            return None;
        }
        Some(Point2::new(projected.x / projected.z, projected.y / projected.z))
    }

    /// Splits the matrix into an upper triangular calibration with a positive diagonal and
    /// `K[2, 2] = 1`, and the pose of the camera.
    pub fn decompose(&self) -> Option<(Matrix3<f64>, WorldToCamera)> {
        let mut projection = self.0;
        if projection.fixed_columns::<3>(0).determinant() < 0.0 {
            projection = -projection;
        }
        let left: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
        let (mut calibration, mut rotation) = rq(&left);
        // Move the signs into the rotation so that the focal lengths are positive.
        for i in 0..3 {
            if calibration[(i, i)] < 0.0 {
                calibration.column_mut(i).neg_mut();
                rotation.row_mut(i).neg_mut();
            }
        }
        if rotation.determinant() <= 0.0 {
            return None;
        }
        let translation = calibration.try_inverse()? * projection.column(3);
        let scale = calibration[(2, 2)];
        if scale.abs() < 1e-300 {
            return None;
        }
        calibration /= scale;
        let rotation = nearest_rotation(rotation)?;
        let pose = WorldToCamera::from_parts(translation, rotation);
        Some((calibration, pose)).filter(|(k, pose)| {
            k.iter().all(|n| n.is_finite()) && pose.is_valid(1e-6)
        })
    }
}

/// Pixel distance between the observation and the projection of the world point.
impl Model<PixelWorldMatch> for ProjectionMatrix {
    fn residual(&self, data: &PixelWorldMatch) -> f64 {
        let &PixelWorldMatch(pixel, point) = data;
        self.project(point)
            .map(|projected| (projected - pixel).norm())
            .unwrap_or(f64::INFINITY)
    }
}

/// RQ decomposition of a 3x3 matrix into an upper triangular and an orthogonal matrix.
fn rq(matrix: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    #[rustfmt::skip]
    let flip = Matrix3::new(
        0.0, 0.0, 1.0,
        0.0, 1.0, 0.0,
        1.0, 0.0, 0.0,
    );
    let qr = (flip * matrix).transpose().qr();
    let upper = flip * qr.r().transpose() * flip;
    let orthogonal = flip * qr.q().transpose();
    (upper, orthogonal)
}

/// Solves `x ~ P X` for the 3x4 matrix `P` with the normalized direct linear transform.
///
/// Both the image and the world points are translated to their centroid and scaled before the
/// system is solved, which keeps it well conditioned.
fn direct_linear_transform(
    image: &[Point2<f64>],
    world: &[Point3<f64>],
) -> Option<Matrix3x4<f64>> {
    let count = image.len();
    if count < 6 || world.len() != count {
        return None;
    }
    let n = count as f64;
    let image_centroid = image.iter().fold(SVector::<f64, 2>::zeros(), |s, p| s + p.coords) / n;
    let image_spread = image.iter().map(|p| (p.coords - image_centroid).norm()).sum::<f64>() / n;
    let world_centroid = world.iter().fold(Vector3::zeros(), |s, p| s + p.coords) / n;
    let world_spread = world.iter().map(|p| (p.coords - world_centroid).norm()).sum::<f64>() / n;
    if image_spread < 1e-12 || world_spread < 1e-12 {
        return None;
    }
    let image_scale = core::f64::consts::SQRT_2 / image_spread;
    let world_scale = 3f64.sqrt() / world_spread;

    let mut normal = SMatrix::<f64, 12, 12>::zeros();
    for (x, p) in image.iter().zip(world) {
        let u = (x.coords - image_centroid) * image_scale;
        let h = ((p.coords - world_centroid) * world_scale).push(1.0);
        let mut first = SVector::<f64, 12>::zeros();
        let mut second = SVector::<f64, 12>::zeros();
        first.fixed_rows_mut::<4>(0).copy_from(&h);
        first.fixed_rows_mut::<4>(8).copy_from(&(-u.x * h));
        second.fixed_rows_mut::<4>(4).copy_from(&h);
        second.fixed_rows_mut::<4>(8).copy_from(&(-u.y * h));
        normal += first * first.transpose() + second * second.transpose();
    }
    let eigen = normal.try_symmetric_eigen(1e-12, 1000)?;
    let (smallest, _) = eigen.eigenvalues.argmin();
    let solution = eigen.eigenvectors.column(smallest);
    let normalized = Matrix3x4::from_row_slice(solution.as_slice());

    #[rustfmt::skip]
    let image_inverse = Matrix3::new(
        1.0 / image_scale, 0.0, image_centroid.x,
        0.0, 1.0 / image_scale, image_centroid.y,
        0.0, 0.0, 1.0,
    );
    let mut world_transform = Matrix4::identity() * world_scale;
    world_transform[(3, 3)] = 1.0;
    world_transform
        .fixed_slice_mut::<3, 1>(0, 3)
        .copy_from(&(-world_scale * world_centroid));
    Some(image_inverse * normalized * world_transform)
}

/// Orients and scales the projection so that the third row gives metric depths.
fn normalize_projection(mut projection: Matrix3x4<f64>) -> Option<Matrix3x4<f64>> {
    if projection.fixed_columns::<3>(0).determinant() < 0.0 {
        projection = -projection;
    }
    let depth_scale = projection.fixed_slice::<1, 3>(2, 0).norm();
    if depth_scale < 1e-300 || !depth_scale.is_finite() {
        return None;
    }
    Some(projection / depth_scale)
}

/// Full projective camera resection from six or more pixel to world matches.
///
/// Used when the calibration of the camera is not known. The calibration and pose are recovered
/// with [`ProjectionMatrix::decompose`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectiveDlt;

impl ProjectiveDlt {
    pub fn solve(&self, data: &[PixelWorldMatch]) -> Option<ProjectionMatrix> {
        let image: Vec<Point2<f64>> = data.iter().map(|m| m.0).collect();
        let world: Vec<Point3<f64>> = data.iter().map(|m| m.1).collect();
        direct_linear_transform(&image, &world)
            .and_then(normalize_projection)
            .map(ProjectionMatrix)
    }
}

impl Estimator<PixelWorldMatch> for ProjectiveDlt {
    type Model = ProjectionMatrix;
    type ModelIter = Option<ProjectionMatrix>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PixelWorldMatch> + Clone,
    {
        let data: Vec<PixelWorldMatch> = data.collect();
        self.solve(&data)
    }
}

/// Calibrated resection with the direct linear transform on normalized image coordinates.
///
/// The linear estimate of `[R | t]` is projected onto the closest rotation. Bearings must point
/// forwards (positive Z) since they are converted to the normalized image plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Dlt6Points;

impl Dlt6Points {
    pub fn solve(&self, data: &[FeatureWorldMatch]) -> Option<WorldToCamera> {
        let mut image = Vec::with_capacity(data.len());
        let mut world = Vec::with_capacity(data.len());
        for &FeatureWorldMatch(bearing, point) in data {
            if bearing.z <= 1e-12 {
                return None;
            }
            image.push(Point2::new(bearing.x / bearing.z, bearing.y / bearing.z));
            world.push(point);
        }
        let projection = normalize_projection(direct_linear_transform(&image, &world)?)?;
        let left: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
        let rotation = nearest_rotation(left)?;
        let scale = (rotation.matrix().transpose() * left).trace() / 3.0;
        if scale <= 0.0 {
            return None;
        }
        let translation: Vector3<f64> = projection.column(3) / scale;
        Some(WorldToCamera::from_parts(translation, rotation))
    }
}

impl Estimator<FeatureWorldMatch> for Dlt6Points {
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

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Rotation3, UnitVector3};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn pose() -> WorldToCamera {
        WorldToCamera::from_parts(
            Vector3::new(-0.2, 0.1, 0.8),
            Rotation3::from_euler_angles(-0.1, 0.3, 0.05),
        )
    }

    fn camera_points(rng: &mut Pcg64, count: usize) -> Vec<Point3<f64>> {
        (0..count)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(3.0..7.0),
                )
            })
            .collect()
    }

    #[test]
    fn calibrated_pose_is_recovered() {
        let mut rng = Pcg64::seed_from_u64(6);
        let pose = pose();
        let data: Vec<_> = camera_points(&mut rng, 12)
            .into_iter()
            .map(|c| FeatureWorldMatch(UnitVector3::new_normalize(c.coords), pose.inverse().transform(c)))
            .collect();
        let found = Dlt6Points.solve(&data).unwrap();
        assert!((found.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-6);
    }

    #[test]
    fn projection_decomposes_into_calibration_and_pose() {
        let mut rng = Pcg64::seed_from_u64(1);
        let pose = pose();
        #[rustfmt::skip]
        let calibration = Matrix3::new(
            800.0, 0.0, 320.0,
            0.0, 800.0, 240.0,
            0.0, 0.0, 1.0,
        );
        let truth = ProjectionMatrix::from_parts(&calibration, pose);
        let data: Vec<_> = camera_points(&mut rng, 20)
            .into_iter()
            .map(|c| {
                let world = pose.inverse().transform(c);
                PixelWorldMatch(truth.project(world).unwrap(), world)
            })
            .collect();
        let estimated = ProjectiveDlt.solve(&data).unwrap();
        for m in &data {
            assert!(estimated.residual(m) < 1e-6);
        }
        let (k, found) = estimated.decompose().unwrap();
        assert!((k - calibration).norm() < 1e-4, "{}", k);
        assert!((found.0.to_homogeneous() - pose.0.to_homogeneous()).norm() < 1e-6);
    }

    #[test]
    fn points_behind_have_infinite_residual() {
        let truth = ProjectionMatrix::from_parts(&Matrix3::identity(), WorldToCamera::identity());
        let behind = PixelWorldMatch(Point2::new(0.0, 0.0), Point3::new(0.0, 0.0, -2.0));
        assert!(truth.residual(&behind).is_infinite());
    }
}
