use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::{Matrix6, Vector3};
use tracing::{error, info, warn};

use covins_optim::atlas::{Atlas, KeyFrameId, Keypoint, LandmarkId, LoopConstraint, Map};
use covins_optim::camera::{CameraModel, Projector};
use covins_optim::config::OptimizerConfig;
use covins_optim::error::OptimizerError;
use covins_optim::geometry::{rotation_to_ypr, SE3};
use covins_optim::logger::init_logger;
use covins_optim::optimizer::{CsvDiagnosticsSink, GlobalBAParams, LocalLandmark, Optimizer};

const MAP_ID: u32 = 0;
const KFS_PER_AGENT: usize = 8;
const NUM_POINTS: usize = 40;

/// Usage: covins-optim-demo [config.yaml] [diagnostics_dir]
fn main() -> Result<()> {
    init_logger();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => OptimizerConfig::from_yaml_file(&path).with_context(|| format!("loading {path}"))?,
        None => OptimizerConfig::default(),
    };
    let mut optimizer = Optimizer::new(config);
    if let Some(dir) = args.next() {
        optimizer = optimizer.with_diagnostics(Arc::new(CsvDiagnosticsSink::new(&dir)?));
    }

    let scene = Scene::build()?;
    let mut atlas = Atlas::new();
    atlas.insert_map(scene.map);
    info!("Synthetic map: {} keyframes per agent, {} points", KFS_PER_AGENT, NUM_POINTS);

    if let Err(err) = run(&atlas, &optimizer, &scene.agent0, &scene.agent1) {
        match err.downcast_ref::<OptimizerError>() {
            Some(fatal) if fatal.is_fatal() => {
                error!("Map is corrupt, aborting: {fatal}");
                std::process::exit(1);
            }
            _ => return Err(err),
        }
    }
    Ok(())
}

fn run(atlas: &Atlas, optimizer: &Optimizer, agent0: &[KeyFrameId], agent1: &[KeyFrameId]) -> Result<()> {
    // Global BA
    let params = GlobalBAParams { visual_only: true, ..GlobalBAParams::from_config(optimizer.config()) };
    let gba = atlas
        .with_map_exclusive(MAP_ID, |map| optimizer.global_bundle_adjustment(map, &params))
        .context("map missing")??;
    info!(
        "GBA: {} landmarks, {} outliers removed, cost {:.4} -> {:.4}",
        gba.included_landmarks, gba.outliers_removed, gba.summary.initial_cost, gba.summary.final_cost
    );

    // Loop closure between the ends of agent 0's trajectory
    let first = agent0[0];
    let last = agent0[KFS_PER_AGENT - 1];
    let truth = truth_poses(0);
    let measurement = truth[0].between(&truth[KFS_PER_AGENT - 1]);
    let relative_yaw = rotation_to_ypr(&measurement.rotation).x;
    atlas.with_map_exclusive(MAP_ID, |map| {
        map.add_loop_constraint(LoopConstraint::new(first, last, measurement, relative_yaw, Matrix6::identity() * 1e-4));
    });

    let pgo = atlas
        .with_map_exclusive(MAP_ID, |map| optimizer.pose_graph_optimization(map, None))
        .context("map missing")??;
    info!(
        "PGO: {} loop, {} sequential edges, cost {:.4} -> {:.4}",
        pgo.loop_edges, pgo.sequential_edges, pgo.summary.initial_cost, pgo.summary.final_cost
    );

    let pgo4 = atlas
        .with_map_exclusive(MAP_ID, |map| optimizer.pose_graph_optimization_4dof(map))
        .context("map missing")??;
    info!("4-DOF PGO: cost {:.4} -> {:.4}", pgo4.summary.initial_cost, pgo4.summary.final_cost);

    // Two-view registration between the agents
    let (kf1, kf2) = (agent0[2], agent1[2]);
    let (mut matches, mut t_12) = atlas
        .with_map(MAP_ID, |map| -> Result<_> {
            let kf1_ref = map.get_keyframe(kf1).context("kf1 missing")?;
            let kf2_ref = map.get_keyframe(kf2).context("kf2 missing")?;
            let matches: Vec<Option<LandmarkId>> = (0..kf1_ref.num_features()).map(|i| kf1_ref.landmark(i)).collect();
            Ok((matches, kf1_ref.camera_pose().between(&kf2_ref.camera_pose())))
        })
        .context("map missing")??;
    let inliers = atlas
        .with_map(MAP_ID, |map| optimizer.optimize_relative_pose(map, kf1, kf2, &mut matches, &mut t_12))
        .context("map missing")??;
    if inliers == 0 {
        warn!("Two-view refinement rejected");
    } else {
        info!("Two-view refinement: {inliers} inliers");
    }

    // Window BA over three keyframes of each agent
    let query = &agent0[..3];
    let candidate = &agent1[..3];
    let lba = atlas
        .with_map_exclusive(MAP_ID, |map| -> Result<_> {
            let landmarks = merge_window(map, query, candidate)?;
            let t_q0 = map.get_keyframe(query[0]).context("query anchor missing")?.pose;
            let t_c0 = map.get_keyframe(candidate[0]).context("candidate anchor missing")?.pose;
            Ok(optimizer.local_bundle_adjustment(map, &landmarks, query, candidate, &t_q0.between(&t_c0))?)
        })
        .context("map missing")??;
    info!(
        "Window BA: translation {:?}, covariance trace {:.3e}",
        lba.t_s1s2.translation.as_slice(),
        lba.covariance.trace()
    );
    Ok(())
}

struct Scene {
    map: Map,
    agent0: Vec<KeyFrameId>,
    agent1: Vec<KeyFrameId>,
}

impl Scene {
    /// Two agents flying side by side over one point cloud, both with drifted
    /// poses and landmarks referenced to agent 0's first keyframe.
    fn build() -> Result<Self> {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0);
        let kernel = camera.resolve()?;
        let points = point_cloud();
        let mut map = Map::new(MAP_ID);

        let mut agents = Vec::new();
        for agent in 0..2u32 {
            let mut ids = Vec::new();
            for (i, pose) in truth_poses(agent).iter().enumerate() {
                let keypoints = points
                    .iter()
                    .map(|p| -> Result<Keypoint> {
                        let p_c = pose.inverse().transform_point(p);
                        let uv = kernel.project(&p_c).context("point behind camera")?;
                        Ok(Keypoint::new(uv.x, uv.y, 0))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let drift = SE3::from_scaled_axis(
                    Vector3::new(0.0, 0.0, 0.003 * i as f64),
                    Vector3::new(0.01 * i as f64, -0.005 * i as f64, 0.0),
                );
                let drifted = if agent == 0 && i == 0 { *pose } else { pose.compose(&drift) };
                ids.push(map.create_keyframe(agent, i as u64 * 50_000_000, drifted, SE3::identity(), camera.clone(), keypoints));
            }
            agents.push(ids);
        }

        for (j, p) in points.iter().enumerate() {
            let lm = map.create_landmark(p + Vector3::new(0.01, -0.01, 0.02), Some(agents[0][0]));
            for id in agents.iter().flatten() {
                map.associate(*id, j, lm);
            }
        }

        let agent1 = agents.pop().context("agent 1")?;
        let agent0 = agents.pop().context("agent 0")?;
        Ok(Self { map, agent0, agent1 })
    }
}

fn truth_poses(agent: u32) -> Vec<SE3> {
    let offset = Vector3::new(0.0, 0.4 * agent as f64, 0.0);
    (0..KFS_PER_AGENT)
        .map(|i| {
            let i = i as f64;
            SE3::from_scaled_axis(Vector3::new(0.0, 0.02 * i, 0.0), offset + Vector3::new(0.2 * i, 0.0, 0.0))
        })
        .collect()
}

fn point_cloud() -> Vec<Vector3<f64>> {
    (0..NUM_POINTS)
        .map(|k| {
            let k = k as f64;
            Vector3::new(-1.0 + 0.31 * k % 3.5, -0.8 + 0.23 * (k * 1.3 % 7.0), 4.0 + 0.4 * (k % 6.0))
        })
        .collect()
}

/// Copies the keypoints of the window keyframes into their additional
/// keypoints and expresses the shared landmarks in the query anchor frame.
fn merge_window(map: &mut Map, query: &[KeyFrameId], candidate: &[KeyFrameId]) -> Result<Vec<LocalLandmark>> {
    for id in query.iter().chain(candidate) {
        let kf = map.get_keyframe_mut(*id).context("window keyframe missing")?;
        kf.additional_keypoints = kf.keypoints.clone();
    }
    let to_local = map.get_keyframe(query[0]).context("query anchor missing")?.pose.inverse();
    let landmarks = map
        .landmarks()
        .filter(|lm| !lm.is_invalid)
        .filter_map(|lm| {
            let observations: Vec<(KeyFrameId, usize)> = query
                .iter()
                .chain(candidate)
                .filter_map(|id| Some((*id, lm.observation(*id)?)))
                .collect();
            (observations.len() >= 2).then(|| LocalLandmark { position: to_local.transform_point(&lm.position), observations })
        })
        .collect();
    Ok(landmarks)
}
