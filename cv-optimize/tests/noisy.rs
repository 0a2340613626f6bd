use cv_core::{
    nalgebra::{Point2, Point3, Rotation3, Vector3},
    CameraIntrinsics, CameraKind, Pose, WorldToCamera,
};
use cv_optimize::{Bundle, BundleAdjuster, BundleObservation, RefineOptions, Termination};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

const NOISE_PX: f64 = 0.5;

fn noisy_bundle(seed: u64) -> Bundle {
    let mut rng = Pcg64::seed_from_u64(seed);
    let intrinsics =
        CameraIntrinsics::new(CameraKind::Pinhole, 1024, 768, 800.0, Point2::new(512.0, 384.0));
    let poses: Vec<WorldToCamera> = (0..5)
        .map(|ix| {
            WorldToCamera::from_parts(
                Vector3::new(-0.4 * ix as f64, 0.0, 0.0),
                Rotation3::from_euler_angles(0.0, 0.03 * ix as f64, 0.0),
            )
        })
        .collect();
    let points: Vec<Point3<f64>> = (0..150)
        .map(|_| {
            Point3::new(
                rng.gen_range(-2.0..3.5),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(6.0..10.0),
            )
        })
        .collect();
    let mut observations = vec![];
    for (point, &world) in points.iter().enumerate() {
        for (pose, &camera) in poses.iter().enumerate() {
            if let Some(mut pixel) = intrinsics.project(camera.transform(world)) {
                pixel.x += rng.gen_range(-NOISE_PX..NOISE_PX);
                pixel.y += rng.gen_range(-NOISE_PX..NOISE_PX);
                observations.push(BundleObservation {
                    pose,
                    intrinsic: 0,
                    point,
                    pixel,
                });
            }
        }
    }
    // Start the structure away from the truth.
    let points = points
        .into_iter()
        .map(|p| p + Vector3::new(0.03, -0.02, 0.1))
        .collect();
    Bundle {
        poses,
        fixed_poses: [0, 4].into_iter().collect(),
        intrinsics: vec![intrinsics],
        points,
        observations,
    }
}

#[test]
fn noise_level_is_reached() {
    let mut bundle = noisy_bundle(0);
    let report = BundleAdjuster::new()
        .optimize(&mut bundle, RefineOptions::STRUCTURE_AND_MOTION)
        .unwrap();
    assert_eq!(report.termination, Termination::Converged);
    // Uniform noise in [-a, a] has a standard deviation of a / sqrt(3) per axis.
    let expected = NOISE_PX * (2.0f64 / 3.0).sqrt();
    assert!(report.final_rms() < expected, "rms {}", report.final_rms());
    assert!(report.initial_rms() > report.final_rms());
}

#[test]
fn optimization_is_deterministic() {
    let mut a = noisy_bundle(1);
    let mut b = noisy_bundle(1);
    let adjuster = BundleAdjuster::new();
    adjuster.optimize(&mut a, RefineOptions::ALL).unwrap();
    adjuster.optimize(&mut b, RefineOptions::ALL).unwrap();
    assert_eq!(a, b);
}
