//! Atlas - the collection of agent maps held by the backend.
//!
//! Each map sits behind its own `RwLock`. Front-end bookkeeping takes read
//! locks; an optimization takes the write lock for its whole run so that the
//! snapshot, the solve and the write-back see one consistent map.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::map::Map;

pub type SharedMap = Arc<RwLock<Map>>;

#[derive(Default)]
pub struct Atlas {
    maps: BTreeMap<u32, SharedMap>,
}

impl Atlas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a map under its own id, replacing any previous map with that id.
    pub fn insert_map(&mut self, map: Map) -> SharedMap {
        let shared = Arc::new(RwLock::new(map));
        let id = shared.read().map_id();
        self.maps.insert(id, Arc::clone(&shared));
        shared
    }

    pub fn remove_map(&mut self, map_id: u32) -> Option<SharedMap> {
        self.maps.remove(&map_id)
    }

    pub fn map(&self, map_id: u32) -> Option<SharedMap> {
        self.maps.get(&map_id).cloned()
    }

    pub fn map_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.maps.keys().copied()
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    /// Runs `f` with exclusive access to a map. Returns `None` if the map is
    /// unknown.
    pub fn with_map_exclusive<R>(&self, map_id: u32, f: impl FnOnce(&mut Map) -> R) -> Option<R> {
        let shared = self.maps.get(&map_id)?;
        let mut guard = shared.write();
        Some(f(&mut guard))
    }

    /// Runs `f` with shared access to a map.
    pub fn with_map<R>(&self, map_id: u32, f: impl FnOnce(&Map) -> R) -> Option<R> {
        let shared = self.maps.get(&map_id)?;
        let guard = shared.read();
        Some(f(&guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_access() {
        let mut atlas = Atlas::new();
        atlas.insert_map(Map::new(3));
        atlas.insert_map(Map::new(1));

        assert_eq!(atlas.num_maps(), 2);
        assert_eq!(atlas.map_ids().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(atlas.with_map(3, |m| m.map_id()), Some(3));
        assert_eq!(atlas.with_map(7, |m| m.map_id()), None);
    }

    #[test]
    fn test_exclusive_access_mutates() {
        let mut atlas = Atlas::new();
        atlas.insert_map(Map::new(0));
        let lm = atlas
            .with_map_exclusive(0, |m| m.create_landmark(nalgebra::Vector3::zeros(), None))
            .unwrap();
        assert_eq!(atlas.with_map(0, |m| m.get_landmark(lm).is_some()), Some(true));
    }

    #[test]
    fn test_exclusive_section_blocks_readers() {
        let mut atlas = Atlas::new();
        let shared = atlas.insert_map(Map::new(0));
        atlas.with_map_exclusive(0, |_| {
            assert!(shared.try_read().is_none());
        });
        assert!(shared.try_read().is_some());
    }
}
