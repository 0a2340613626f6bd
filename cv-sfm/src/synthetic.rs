//! Small synthetic scenes for the unit tests.

use crate::{
    problem::Problem, Calibration, PairwiseMatches, Reconstruction, Scene, SfmSettings, Tracks,
    View,
};
use cv_core::{
    nalgebra::{Point2, Point3, Rotation3, Vector2, Vector3},
    CameraIntrinsics, CameraKind, FeatureId, IntrinsicId, KeyPoint, Pose, PoseId, ViewId,
    WorldToCamera,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::BTreeMap;

pub(crate) struct Synthetic {
    pub intrinsics: CameraIntrinsics,
    pub poses: Vec<WorldToCamera>,
    pub points: Vec<Point3<f64>>,
    pub scene: Scene,
    pub features: BTreeMap<ViewId, Vec<KeyPoint>>,
    pub matches: PairwiseMatches,
}

impl Synthetic {
    /// Cameras on the X axis looking down +Z, numbered from view 1. Every point is seen by
    /// every camera, and feature `k` of each view observes point `k`.
    pub fn rig(offsets: &[f64], points: usize, noise: f64, seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let intrinsics =
            CameraIntrinsics::new(CameraKind::Pinhole, 640, 480, 500.0, Point2::new(320.0, 240.0));
        let poses: Vec<WorldToCamera> = offsets
            .iter()
            .map(|&x| WorldToCamera::from_parts(Vector3::new(-x, 0.0, 0.0), Rotation3::identity()))
            .collect();
        let middle = (offsets[0] + offsets[offsets.len() - 1]) / 2.0;
        let points: Vec<Point3<f64>> = (0..points)
            .map(|_| {
                Point3::new(
                    middle + rng.gen_range(-1.0..1.0),
                    rng.gen_range(-0.8..0.8),
                    rng.gen_range(4.0..6.0),
                )
            })
            .collect();

        let mut scene = Scene::new();
        scene.add_intrinsic(IntrinsicId(0), Calibration::Known(intrinsics));
        let mut features = BTreeMap::new();
        for (ix, &pose) in poses.iter().enumerate() {
            let view = ViewId(ix as u32 + 1);
            scene.add_view(view, View::new(PoseId(view.0), Some(IntrinsicId(0)), 640, 480));
            let keypoints = points
                .iter()
                .map(|&point| {
                    let pixel = intrinsics
                        .project(pose.transform(point))
                        .unwrap_or_else(Point2::origin);
                    let jitter = if noise > 0.0 {
                        Vector2::new(rng.gen_range(-noise..noise), rng.gen_range(-noise..noise))
                    } else {
                        Vector2::zeros()
                    };
                    KeyPoint(pixel + jitter)
                })
                .collect();
            features.insert(view, keypoints);
        }

        let mut matches = PairwiseMatches::new();
        for a in 1..=poses.len() as u32 {
            for b in a + 1..=poses.len() as u32 {
                matches.insert(
                    ViewId(a),
                    ViewId(b),
                    (0..points.len() as u32).map(|k| (FeatureId(k), FeatureId(k))),
                );
            }
        }

        Self {
            intrinsics,
            poses,
            points,
            scene,
            features,
            matches,
        }
    }

    pub fn problem(&self) -> Problem {
        self.problem_with(SfmSettings::default())
    }

    pub fn problem_with(&self, settings: SfmSettings) -> Problem {
        let tracks = Tracks::build(&self.features, &self.matches).expect("synthetic tracks");
        Problem::new(settings, &self.scene, tracks).expect("synthetic problem")
    }

    /// A reconstruction with the given views registered at their true poses.
    pub fn ground_truth(&self, problem: &Problem, views: &[u32]) -> Reconstruction {
        let mut reconstruction = Reconstruction::new();
        for &view in views {
            self.register_truth(problem, &mut reconstruction, view);
        }
        reconstruction.anchor = views.first().map(|&view| PoseId(view));
        reconstruction
    }

    pub fn register_truth(&self, problem: &Problem, reconstruction: &mut Reconstruction, view: u32) {
        let registered = problem
            .registered_view(ViewId(view), 1.0)
            .expect("synthetic view");
        reconstruction.register(
            ViewId(view),
            registered,
            self.poses[view as usize - 1],
            self.intrinsics,
        );
    }
}
