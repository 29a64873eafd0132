//! Core ID types for the Atlas map structures.

/// Unique identifier for a KeyFrame within the collaborative map.
///
/// Every agent numbers its keyframes sequentially from 0, so an id is the pair
/// (agent, sequence index). Ordering groups keyframes by agent and then by
/// sequence, which is the order the optimizers visit them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId {
    pub agent: u32,
    pub seq: u64,
}

impl KeyFrameId {
    pub fn new(agent: u32, seq: u64) -> Self {
        Self { agent, seq }
    }

    /// First keyframe of an agent's trajectory.
    pub fn is_first_of_agent(&self) -> bool {
        self.seq == 0
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}.{}", self.seq, self.agent)
    }
}

/// Unique identifier for a Landmark within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        assert_eq!(KeyFrameId::new(1, 42), KeyFrameId::new(1, 42));
        assert_ne!(KeyFrameId::new(1, 42), KeyFrameId::new(2, 42));
    }

    #[test]
    fn test_keyframe_id_ordering_groups_agents() {
        let mut ids = vec![
            KeyFrameId::new(1, 0),
            KeyFrameId::new(0, 5),
            KeyFrameId::new(0, 1),
        ];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId::new(0, 1), KeyFrameId::new(0, 5), KeyFrameId::new(1, 0)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", KeyFrameId::new(2, 17)), "KF17.2");
        assert_eq!(format!("{}", LandmarkId::new(123)), "LM123");
    }
}
