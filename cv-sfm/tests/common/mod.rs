//! A synthetic scene generator shared by the integration tests.
//!
//! Cameras share one pinhole calibration unless marked uncalibrated. Points are drawn in boxes
//! and projected into the views chosen for them, and every pair of views that sees a point gets
//! the match of its two features.

#![allow(dead_code)]

use cv_core::{
    nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3},
    CameraIntrinsics, CameraKind, FeatureId, IntrinsicId, KeyPoint, Pose, PoseId, ViewId,
    WorldToCamera,
};
use cv_sfm::{
    Calibration, PairwiseMatches, Reconstruction, Scene, SequentialEngine, SfmSettings, View,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::{BTreeMap, BTreeSet};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FOCAL: f64 = 500.0;

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(
        CameraKind::Pinhole,
        WIDTH,
        HEIGHT,
        FOCAL,
        Point2::new(f64::from(WIDTH) / 2.0, f64::from(HEIGHT) / 2.0),
    )
}

/// A camera at `(x, 0, 0)` looking down +Z.
pub fn camera_at(x: f64) -> WorldToCamera {
    WorldToCamera::from_parts(Vector3::new(-x, 0.0, 0.0), Rotation3::identity())
}

pub struct Generated {
    pub scene: Scene,
    pub features: BTreeMap<ViewId, Vec<KeyPoint>>,
    pub matches: PairwiseMatches,
    pub poses: BTreeMap<ViewId, WorldToCamera>,
    pub points: Vec<Point3<f64>>,
}

impl Generated {
    pub fn engine(&self, settings: SfmSettings) -> SequentialEngine {
        SequentialEngine::new(settings, self.scene.clone())
    }
}

pub struct SceneBuilder {
    rng: Pcg64,
    noise: f64,
    outliers: f64,
    poses: BTreeMap<ViewId, WorldToCamera>,
    uncalibrated: BTreeSet<ViewId>,
    features: BTreeMap<ViewId, Vec<KeyPoint>>,
    /// The feature of each view that observes each point.
    observations: Vec<BTreeMap<ViewId, FeatureId>>,
    points: Vec<Point3<f64>>,
    random_matches: Vec<(ViewId, ViewId)>,
}

impl SceneBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
            noise: 0.0,
            outliers: 0.0,
            poses: BTreeMap::new(),
            uncalibrated: BTreeSet::new(),
            features: BTreeMap::new(),
            observations: Vec::new(),
            points: Vec::new(),
            random_matches: Vec::new(),
        }
    }

    /// Uniform pixel noise in `[-noise, noise)` on both axes.
    pub fn noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// The fraction of matches replaced by matches of two unrelated random features.
    pub fn outliers(mut self, fraction: f64) -> Self {
        self.outliers = fraction;
        self
    }

    pub fn camera(mut self, view: u32, pose: WorldToCamera) -> Self {
        self.poses.insert(ViewId(view), pose);
        self.features.entry(ViewId(view)).or_default();
        self
    }

    /// Cameras `first..` on the X axis at the given positions.
    pub fn cameras_at(mut self, first: u32, xs: &[f64]) -> Self {
        for (ix, &x) in xs.iter().enumerate() {
            self = self.camera(first + ix as u32, camera_at(x));
        }
        self
    }

    pub fn uncalibrated(mut self, view: u32) -> Self {
        self.uncalibrated.insert(ViewId(view));
        self
    }

    /// Adds points drawn uniformly in the box `[min, max)`, seen by `views`.
    ///
    /// Points that would fall outside an image are drawn again.
    pub fn points(mut self, count: usize, min: [f64; 3], max: [f64; 3], views: &[u32]) -> Self {
        let intrinsics = intrinsics();
        let mut added = 0;
        while added < count {
            let point = Point3::new(
                self.rng.gen_range(min[0]..max[0]),
                self.rng.gen_range(min[1]..max[1]),
                self.rng.gen_range(min[2]..max[2]),
            );
            let pixels: Option<Vec<Point2<f64>>> = views
                .iter()
                .map(|&view| {
                    let pose = self.poses[&ViewId(view)];
                    intrinsics
                        .project(pose.transform(point))
                        .filter(|p| p.x >= 0.0 && p.y >= 0.0 && p.x < f64::from(WIDTH) && p.y < f64::from(HEIGHT))
                })
                .collect();
            let pixels = match pixels {
                Some(pixels) => pixels,
                None => continue,
            };
            let mut observed = BTreeMap::new();
            for (&view, pixel) in views.iter().zip(pixels) {
                let pixel = self.jitter(pixel);
                observed.insert(ViewId(view), self.push_feature(ViewId(view), pixel));
            }
            self.observations.push(observed);
            self.points.push(point);
            added += 1;
        }
        self
    }

    /// Adds `count` random features to each view of the pair and matches them one to one.
    pub fn random_matches(mut self, a: u32, b: u32, count: usize) -> Self {
        for _ in 0..count {
            self.random_matches.push((ViewId(a), ViewId(b)));
        }
        self
    }

    pub fn build(mut self) -> Generated {
        let intrinsics = intrinsics();
        let mut scene = Scene::new();
        scene.add_intrinsic(IntrinsicId(0), Calibration::Known(intrinsics));
        for &view in self.poses.keys() {
            let intrinsic = if self.uncalibrated.contains(&view) {
                None
            } else {
                Some(IntrinsicId(0))
            };
            scene.add_view(view, View::new(PoseId(view.0), intrinsic, WIDTH, HEIGHT));
        }

        let mut pairs: BTreeMap<(ViewId, ViewId), Vec<(FeatureId, FeatureId)>> = BTreeMap::new();
        let observations = std::mem::take(&mut self.observations);
        for observed in &observations {
            let views: Vec<(ViewId, FeatureId)> = observed.iter().map(|(&v, &f)| (v, f)).collect();
            for (i, &(a, fa)) in views.iter().enumerate() {
                for &(b, fb) in &views[i + 1..] {
                    let m = if self.rng.gen_bool(self.outliers) {
                        let pa = self.random_pixel();
                        let pb = self.random_pixel();
                        (self.push_feature(a, pa), self.push_feature(b, pb))
                    } else {
                        (fa, fb)
                    };
                    pairs.entry((a, b)).or_default().push(m);
                }
            }
        }
        for (a, b) in std::mem::take(&mut self.random_matches) {
            let pa = self.random_pixel();
            let pb = self.random_pixel();
            let m = (self.push_feature(a, pa), self.push_feature(b, pb));
            pairs.entry((a, b)).or_default().push(m);
        }
        let mut matches = PairwiseMatches::new();
        for ((a, b), list) in pairs {
            matches.insert(a, b, list);
        }

        Generated {
            scene,
            features: self.features,
            matches,
            poses: self.poses,
            points: self.points,
        }
    }

    fn jitter(&mut self, pixel: Point2<f64>) -> Point2<f64> {
        if self.noise > 0.0 {
            Point2::new(
                pixel.x + self.rng.gen_range(-self.noise..self.noise),
                pixel.y + self.rng.gen_range(-self.noise..self.noise),
            )
        } else {
            pixel
        }
    }

    fn random_pixel(&mut self) -> Point2<f64> {
        Point2::new(
            self.rng.gen_range(0.0..f64::from(WIDTH)),
            self.rng.gen_range(0.0..f64::from(HEIGHT)),
        )
    }

    fn push_feature(&mut self, view: ViewId, pixel: Point2<f64>) -> FeatureId {
        let features = self.features.entry(view).or_default();
        features.push(KeyPoint(pixel));
        FeatureId(features.len() as u32 - 1)
    }
}

/// Two views, a hundred points and a half unit baseline.
pub fn two_views(seed: u64) -> Generated {
    SceneBuilder::new(seed)
        .noise(0.3)
        .cameras_at(1, &[0.0, 0.5])
        .points(100, [-1.0, -0.8, 4.0], [1.5, 0.8, 6.0], &[1, 2])
        .build()
}

/// Five views on a line. Views 1 to 3 see a dense group of points, views 2 to 5 a smaller
/// group further along.
pub fn five_views(seed: u64, outliers: f64) -> Generated {
    SceneBuilder::new(seed)
        .noise(0.3)
        .outliers(outliers)
        .cameras_at(1, &[0.0, 0.5, 1.0, 1.5, 2.0])
        .points(200, [-0.5, -0.8, 4.0], [1.5, 0.8, 6.0], &[1, 2, 3])
        .points(80, [1.0, -0.8, 4.0], [2.5, 0.8, 6.0], &[2, 3, 4, 5])
        .build()
}

/// Views that are registered in `reconstruction`.
pub fn registered(reconstruction: &Reconstruction) -> BTreeSet<ViewId> {
    reconstruction.views.keys().copied().collect()
}

/// Checks the invariants every finished reconstruction holds.
pub fn assert_consistent(engine: &SequentialEngine) {
    let reconstruction = engine.reconstruction();
    for (view, registered) in &reconstruction.views {
        let pose = reconstruction.poses[&registered.pose];
        let rotation: Matrix3<f64> = *pose.isometry().rotation.matrix();
        assert!(
            (rotation.transpose() * rotation - Matrix3::identity()).norm() < 1e-6,
            "rotation of view {} is not orthonormal",
            view
        );
        assert!(pose.isometry().translation.vector.iter().all(|n| n.is_finite()));
        assert!(registered.threshold >= 1.0 && registered.threshold <= 4.0);
    }

    for (track, landmark) in &reconstruction.landmarks {
        assert!(landmark.observations.len() >= 2, "landmark {} is too short", track);
        for (&view, observation) in &landmark.observations {
            assert!(reconstruction.is_registered(view), "landmark {} sees unregistered view {}", track, view);
            let (pose, _) = reconstruction.camera(view).unwrap();
            assert!(pose.depth(landmark.point) > 0.0, "landmark {} is behind view {}", track, view);
            let error = reconstruction.reprojection_error(view, landmark.point, observation.pixel);
            assert!(
                error <= reconstruction.threshold(view),
                "landmark {} has error {} in view {}",
                track,
                error,
                view
            );
        }
    }

    let registered = registered(reconstruction);
    let remaining = engine.remaining();
    assert!(registered.is_disjoint(remaining));
    let all: BTreeSet<ViewId> = engine
        .scene()
        .views
        .keys()
        .copied()
        .filter(|view| !engine.statistics().dropped.contains(view))
        .collect();
    let union: BTreeSet<ViewId> = registered.union(remaining).copied().collect();
    assert_eq!(union, all);
}
