//! Landmark - a 3D point observed by keyframes.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::types::{KeyFrameId, LandmarkId};

#[derive(Clone)]
pub struct Landmark {
    pub id: LandmarkId,

    /// Position in world frame.
    pub position: Vector3<f64>,

    /// Keyframe the landmark is anchored to when a pose correction moves the
    /// map. Usually the first observer.
    pub reference_kf: Option<KeyFrameId>,

    /// Observing keyframe → feature index in that keyframe.
    pub observations: BTreeMap<KeyFrameId, usize>,

    pub is_invalid: bool,
    pub is_optimized: bool,
    pub is_gba_optimized: bool,
}

impl Landmark {
    pub fn new(id: LandmarkId, position: Vector3<f64>, reference_kf: Option<KeyFrameId>) -> Self {
        Self {
            id,
            position,
            reference_kf,
            observations: BTreeMap::new(),
            is_invalid: false,
            is_optimized: false,
            is_gba_optimized: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn observation(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}

impl std::fmt::Debug for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landmark")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("reference_kf", &self.reference_kf)
            .field("num_observations", &self.observations.len())
            .field("is_invalid", &self.is_invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observations() {
        let mut lm = Landmark::new(LandmarkId::new(0), Vector3::new(1.0, 2.0, 3.0), None);
        let kf1 = KeyFrameId::new(0, 1);
        let kf2 = KeyFrameId::new(0, 2);

        lm.add_observation(kf1, 10);
        lm.add_observation(kf2, 20);
        assert_eq!(lm.num_observations(), 2);
        assert_eq!(lm.observation(kf2), Some(20));

        assert!(lm.erase_observation(kf1));
        assert!(!lm.erase_observation(kf1));
        assert_eq!(lm.num_observations(), 1);
    }
}
