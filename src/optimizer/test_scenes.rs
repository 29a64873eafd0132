//! Synthetic maps shared by the optimizer tests.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::Rng;

use crate::atlas::map::{KeyFrameId, Keypoint, LandmarkId, Map};
use crate::camera::{CameraKernel, CameraModel, Projector};
use crate::geometry::SE3;

pub fn camera() -> CameraModel {
    CameraModel::pinhole(400.0, 400.0, 320.0, 240.0)
}

pub fn kernel() -> CameraKernel {
    camera().resolve().unwrap()
}

/// Sensor poses along +x, cameras looking down +z with a slow yaw drift.
pub fn trajectory(n: usize, origin: Vector3<f64>) -> Vec<SE3> {
    (0..n)
        .map(|i| {
            let i = i as f64;
            SE3::from_scaled_axis(
                Vector3::new(0.0, 0.02 * i, 0.0),
                origin + Vector3::new(0.2 * i, 0.02 * i, 0.0),
            )
        })
        .collect()
}

/// Points spread over a slab 4-6 m in front of the trajectory.
pub fn point_cloud(n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|k| {
            let k = k as f64;
            Vector3::new(-1.0 + 0.27 * k % 3.0, -0.6 + 0.37 * (k * 1.7 % 3.3), 4.0 + 0.5 * (k % 5.0))
        })
        .collect()
}

pub fn project(pose: &SE3, extrinsics: &SE3, point: &Vector3<f64>) -> Vector2<f64> {
    let p_c = pose.compose(extrinsics).inverse().transform_point(point);
    kernel().project(&p_c).unwrap()
}

pub fn jitter(rng: &mut StdRng, sigma: f64) -> Vector3<f64> {
    Vector3::new(
        rng.gen_range(-sigma..=sigma),
        rng.gen_range(-sigma..=sigma),
        rng.gen_range(-sigma..=sigma),
    )
}

pub struct Scene {
    pub map: Map,
    pub kf_ids: Vec<KeyFrameId>,
    pub landmarks: Vec<LandmarkId>,
    pub true_poses: Vec<SE3>,
    pub true_points: Vec<Vector3<f64>>,
}

/// Every keyframe observes every point at feature index = point index.
/// Landmarks are referenced to the first keyframe.
pub fn observed_scene(agent: u32, num_kfs: usize, num_points: usize, pixel_noise: f64, rng: &mut StdRng) -> Scene {
    let true_poses = trajectory(num_kfs, Vector3::zeros());
    let true_points = point_cloud(num_points);
    let mut map = Map::new(agent);

    let kf_ids: Vec<KeyFrameId> = true_poses
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let keypoints = true_points
                .iter()
                .map(|p| {
                    let uv = project(pose, &SE3::identity(), p);
                    let noise = if pixel_noise > 0.0 {
                        Vector2::new(rng.gen_range(-pixel_noise..=pixel_noise), rng.gen_range(-pixel_noise..=pixel_noise))
                    } else {
                        Vector2::zeros()
                    };
                    Keypoint::new(uv.x + noise.x, uv.y + noise.y, 0)
                })
                .collect();
            map.create_keyframe(agent, i as u64 * 100_000_000, *pose, SE3::identity(), camera(), keypoints)
        })
        .collect();

    let landmarks = true_points
        .iter()
        .enumerate()
        .map(|(j, p)| {
            let lm = map.create_landmark(*p, Some(kf_ids[0]));
            for kf_id in &kf_ids {
                map.associate(*kf_id, j, lm);
            }
            lm
        })
        .collect();

    Scene { map, kf_ids, landmarks, true_poses, true_points }
}

/// Perturbs every keyframe but the anchor, and every landmark.
pub fn perturb(map: &mut Map, rotation: f64, translation: f64, point: f64, rng: &mut StdRng) {
    let anchor = map.anchor_id();
    for kf in map.keyframes_mut().filter(|kf| kf.id != anchor) {
        let delta = SE3::from_scaled_axis(jitter(rng, rotation), jitter(rng, translation));
        kf.pose = kf.pose.compose(&delta);
    }
    for lm in map.landmarks_mut() {
        lm.position += jitter(rng, point);
    }
}
