use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::world::location::LocationVector;

/// Process-unique object identifier. Never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const FIRST_OBJECT_ID: u32 = 1001;

/// Monotonic id source shared by every spawner in the process.
#[derive(Debug)]
pub struct ObjectIdAllocator {
    next: AtomicU32,
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(FIRST_OBJECT_ID),
        }
    }

    pub fn allocate(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// An entity registered in the world: players, NPCs, hardlines, doors and the
/// rest of the object-type table. Specialised behaviour lives with the owner
/// (for players, the game session); the world registry only needs the shared
/// attributes.
#[derive(Debug, Clone)]
pub struct GameObject {
    pub id: ObjectId,
    pub object_type: u16,
    pub name: String,
    pub position: LocationVector,
    pub district: u8,
    pub visible: bool,
    pub state_flags: u32,
    pub scale: f32,
    properties: HashMap<String, String>,
}

impl GameObject {
    pub fn new(id: ObjectId, object_type: u16, district: u8, position: LocationVector) -> Self {
        Self {
            id,
            object_type,
            name: String::new(),
            position,
            district,
            visible: true,
            state_flags: 0,
            scale: 1.0,
            properties: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_state_flag(&mut self, flag: u32) {
        self.state_flags |= flag;
    }

    pub fn remove_state_flag(&mut self, flag: u32) {
        self.state_flags &= !flag;
    }

    pub fn has_state_flag(&self, flag: u32) -> bool {
        self.state_flags & flag != 0
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn remove_property(&mut self, key: &str) -> bool {
        self.properties.remove(key).is_some()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic_from_first_id() {
        let allocator = ObjectIdAllocator::new();
        let first = allocator.allocate();
        assert_eq!(first, ObjectId(FIRST_OBJECT_ID));
        let mut prev = first;
        for _ in 0..64 {
            let next = allocator.allocate();
            assert!(next.0 > prev.0);
            prev = next;
        }
    }

    #[test]
    fn state_flags_toggle() {
        let mut object = GameObject::new(
            ObjectId(1),
            crate::net::messages::OBJECT_TYPE_PLAYER,
            1,
            LocationVector::default(),
        );
        object.add_state_flag(crate::net::messages::PLAYER_STATE_COMBAT);
        object.add_state_flag(crate::net::messages::PLAYER_STATE_RUNNING);
        assert!(object.has_state_flag(crate::net::messages::PLAYER_STATE_COMBAT));
        object.remove_state_flag(crate::net::messages::PLAYER_STATE_COMBAT);
        assert!(!object.has_state_flag(crate::net::messages::PLAYER_STATE_COMBAT));
        assert!(object.has_state_flag(crate::net::messages::PLAYER_STATE_RUNNING));
    }

    #[test]
    fn property_map_crud() {
        let mut object = GameObject::new(
            ObjectId(2),
            crate::net::messages::OBJECT_TYPE_NPC,
            1,
            LocationVector::default(),
        );
        object.set_property("faction", "zion");
        assert_eq!(object.property("faction"), Some("zion"));
        assert!(object.has_property("faction"));
        assert!(object.remove_property("faction"));
        assert!(!object.remove_property("faction"));
        assert_eq!(object.property("faction"), None);
    }
}
