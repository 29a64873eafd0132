//! Map - container for the keyframes, landmarks and loop constraints of one
//! (possibly merged, multi-agent) map.
//!
//! Keyframe ↔ landmark associations are bidirectional: a keyframe feature slot
//! names a landmark, and the landmark lists the keyframe with the feature
//! index. All mutation goes through `associate`/`erase_observation` so the two
//! sides never disagree.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::geometry::SE3;

use super::keyframe::{KeyFrame, Keypoint};
use super::landmark::Landmark;
use super::loop_constraint::LoopConstraint;
use super::types::{KeyFrameId, LandmarkId};

/// Entities removed by [`Map::clean`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed_keyframes: usize,
    pub removed_landmarks: usize,
}

pub struct Map {
    /// Agent that created the map. Its first keyframe is the gauge anchor.
    map_id: u32,

    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    landmarks: BTreeMap<LandmarkId, Landmark>,
    loop_constraints: Vec<LoopConstraint>,

    next_landmark_id: u64,

    /// Most recent keyframe of each agent (tail of its temporal chain).
    last_keyframe: HashMap<u32, KeyFrameId>,
}

impl Map {
    pub fn new(map_id: u32) -> Self {
        Self {
            map_id,
            keyframes: BTreeMap::new(),
            landmarks: BTreeMap::new(),
            loop_constraints: Vec::new(),
            next_landmark_id: 0,
            last_keyframe: HashMap::new(),
        }
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    /// The keyframe whose pose fixes the gauge of every optimization.
    pub fn anchor_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.map_id, 0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Creates the next keyframe of `agent` and links it to the agent's
    /// previous keyframe.
    pub fn create_keyframe(
        &mut self,
        agent: u32,
        timestamp_ns: u64,
        pose: SE3,
        extrinsics: SE3,
        camera: CameraModel,
        keypoints: Vec<Keypoint>,
    ) -> KeyFrameId {
        let prev = self.last_keyframe.get(&agent).copied();
        let seq = prev.map_or(0, |p| p.seq + 1);
        let id = KeyFrameId::new(agent, seq);

        let mut kf = KeyFrame::new(id, timestamp_ns, pose, extrinsics, camera, keypoints);
        kf.predecessor = prev;
        if let Some(prev_kf) = prev.and_then(|p| self.keyframes.get_mut(&p)) {
            prev_kf.successor = Some(id);
        }

        self.keyframes.insert(id, kf);
        self.last_keyframe.insert(agent, id);
        id
    }

    /// Inserts a fully-built keyframe (e.g. from another map) as is. Chain
    /// links are taken from the keyframe.
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        let id = kf.id;
        let is_newest = self
            .last_keyframe
            .get(&id.agent)
            .map_or(true, |last| last.seq < id.seq);
        if is_newest {
            self.last_keyframe.insert(id.agent, id);
        }
        self.keyframes.insert(id, kf);
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// Keyframes in id order: by agent, then by sequence index.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframes_mut(&mut self) -> impl Iterator<Item = &mut KeyFrame> {
        self.keyframes.values_mut()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// The keyframe exists and is not flagged invalid.
    pub fn is_valid_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.get(&id).is_some_and(|kf| !kf.is_invalid)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_landmark(&mut self, position: Vector3<f64>, reference_kf: Option<KeyFrameId>) -> LandmarkId {
        let id = LandmarkId::new(self.next_landmark_id);
        self.next_landmark_id += 1;
        self.landmarks.insert(id, Landmark::new(id, position, reference_kf));
        id
    }

    pub fn get_landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn get_landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn landmarks_mut(&mut self) -> impl Iterator<Item = &mut Landmark> {
        self.landmarks.values_mut()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Binds feature `feature_idx` of `kf_id` to `lm_id` on both sides.
    ///
    /// Returns false if either entity is unknown or the index is out of range.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, lm_id: LandmarkId) -> bool {
        let in_range = self
            .keyframes
            .get(&kf_id)
            .is_some_and(|kf| feature_idx < kf.num_features());
        if !in_range {
            return false;
        }
        let Some(lm) = self.landmarks.get_mut(&lm_id) else {
            return false;
        };
        lm.add_observation(kf_id, feature_idx);
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_landmark(feature_idx, lm_id);
        }
        true
    }

    /// Removes one observation from both the keyframe and the landmark.
    ///
    /// Returns the landmark that was bound to the feature, if any.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<LandmarkId> {
        let lm_id = self.keyframes.get_mut(&kf_id)?.erase_landmark(feature_idx)?;
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.erase_observation(kf_id);
        }
        Some(lm_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop constraints
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_loop_constraint(&mut self, constraint: LoopConstraint) {
        self.loop_constraints.push(constraint);
    }

    pub fn loop_constraints(&self) -> &[LoopConstraint] {
        &self.loop_constraints
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes degenerate entities: invalid keyframes, and landmarks that are
    /// invalid or no longer observed. Removed keyframes are unlinked from the
    /// chain; their neighbours are joined.
    pub fn clean(&mut self) -> CleanReport {
        let mut report = CleanReport::default();

        let invalid_kfs: Vec<KeyFrameId> = self
            .keyframes
            .values()
            .filter(|kf| kf.is_invalid)
            .map(|kf| kf.id)
            .collect();
        for kf_id in invalid_kfs {
            self.remove_keyframe(kf_id);
            report.removed_keyframes += 1;
        }

        let degenerate: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| lm.is_invalid || lm.observations.is_empty())
            .map(|lm| lm.id)
            .collect();
        for lm_id in degenerate {
            self.remove_landmark(lm_id);
            report.removed_landmarks += 1;
        }

        report
    }

    /// Removes a landmark and every keyframe binding to it.
    pub fn remove_landmark(&mut self, lm_id: LandmarkId) -> Option<Landmark> {
        let lm = self.landmarks.remove(&lm_id)?;
        for (&kf_id, &feature_idx) in &lm.observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_landmark(feature_idx);
            }
        }
        Some(lm)
    }

    /// Removes a keyframe, its landmark observations and its chain links.
    pub fn remove_keyframe(&mut self, kf_id: KeyFrameId) -> Option<KeyFrame> {
        let kf = self.keyframes.remove(&kf_id)?;

        for (_, lm_id) in kf.landmark_bindings() {
            if let Some(lm) = self.landmarks.get_mut(&lm_id) {
                lm.erase_observation(kf_id);
            }
        }

        if let Some(pred) = kf.predecessor.and_then(|p| self.keyframes.get_mut(&p)) {
            pred.successor = kf.successor;
        }
        if let Some(succ) = kf.successor.and_then(|s| self.keyframes.get_mut(&s)) {
            succ.predecessor = kf.predecessor;
        }
        if self.last_keyframe.get(&kf_id.agent) == Some(&kf_id) {
            match kf.predecessor {
                Some(pred) => self.last_keyframe.insert(kf_id.agent, pred),
                None => self.last_keyframe.remove(&kf_id.agent),
            };
        }

        Some(kf)
    }
}
