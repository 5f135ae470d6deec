use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::entities::object::{GameObject, ObjectId};
use crate::net::messages;
use crate::world::location::LocationVector;
use crate::world::navmesh::NavMeshService;

pub const DEFAULT_INTEREST_RANGE: f64 = 250.0;
const SPAWN_SAMPLE_RADIUS: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct DistrictData {
    pub id: u8,
    pub name: String,
    pub nav_file: Option<String>,
    pub adjacent: Vec<u8>,
    pub hardlines: Vec<LocationVector>,
    pub spawn_points: Vec<LocationVector>,
}

impl DistrictData {
    pub fn named(id: u8, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            nav_file: None,
            adjacent: Vec::new(),
            hardlines: Vec::new(),
            spawn_points: Vec::new(),
        }
    }
}

/// The twelve districts of the wire contract.
pub fn builtin_districts() -> Vec<DistrictData> {
    vec![
        DistrictData::named(messages::DISTRICT_RICHLAND, "Richland"),
        DistrictData::named(messages::DISTRICT_DOWNTOWN, "Downtown"),
        DistrictData::named(messages::DISTRICT_WESTVIEW, "Westview"),
        DistrictData::named(messages::DISTRICT_INTERNATIONAL, "International"),
        DistrictData::named(messages::DISTRICT_UENO, "Ueno"),
        DistrictData::named(messages::DISTRICT_STAMOS, "Stamos"),
        DistrictData::named(messages::DISTRICT_TABOR, "Tabor"),
        DistrictData::named(messages::DISTRICT_EDGEWATER, "Edgewater"),
        DistrictData::named(messages::DISTRICT_GRACY, "Gracy"),
        DistrictData::named(messages::DISTRICT_HISTORIC, "Historic"),
        DistrictData::named(messages::DISTRICT_CENTER, "Center"),
        DistrictData::named(messages::DISTRICT_KEDEMOTH, "Kedemoth"),
    ]
}

#[derive(Debug, Default)]
struct ObjectRegistry {
    objects: HashMap<ObjectId, GameObject>,
    district_objects: HashMap<u8, Vec<ObjectId>>,
}

impl ObjectRegistry {
    fn detach_from_district(&mut self, id: ObjectId, district: u8) {
        if let Some(ids) = self.district_objects.get_mut(&district) {
            ids.retain(|&entry| entry != id);
            if ids.is_empty() {
                self.district_objects.remove(&district);
            }
        }
    }
}

/// Authoritative object registry, partitioned by district. The registry lock
/// guards the object map and the district index together so the partition
/// invariant holds at every release of the lock.
#[derive(Debug)]
pub struct WorldManager {
    districts: BTreeMap<u8, DistrictData>,
    navmesh: NavMeshService,
    registry: Mutex<ObjectRegistry>,
}

impl WorldManager {
    pub fn new(districts: Vec<DistrictData>, navmesh: NavMeshService) -> Self {
        Self {
            districts: districts.into_iter().map(|d| (d.id, d)).collect(),
            navmesh,
            registry: Mutex::new(ObjectRegistry::default()),
        }
    }

    pub fn district(&self, id: u8) -> Option<&DistrictData> {
        self.districts.get(&id)
    }

    pub fn districts(&self) -> impl Iterator<Item = &DistrictData> {
        self.districts.values()
    }

    pub fn navmesh(&self) -> &NavMeshService {
        &self.navmesh
    }

    pub fn add_object(&self, object: GameObject) -> Result<(), String> {
        let mut registry = self.lock_registry();
        if registry.objects.contains_key(&object.id) {
            return Err(format!("object id {} already registered", object.id));
        }
        registry
            .district_objects
            .entry(object.district)
            .or_default()
            .push(object.id);
        registry.objects.insert(object.id, object);
        Ok(())
    }

    pub fn remove_object(&self, id: ObjectId) -> Option<GameObject> {
        let mut registry = self.lock_registry();
        let object = registry.objects.remove(&id)?;
        registry.detach_from_district(id, object.district);
        Some(object)
    }

    pub fn get_object(&self, id: ObjectId) -> Option<GameObject> {
        self.lock_registry().objects.get(&id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock_registry().objects.len()
    }

    /// In-place mutation of a registered object. The closure must not change
    /// the district; use `update_object_position` for moves.
    pub fn update_object(&self, id: ObjectId, mutate: impl FnOnce(&mut GameObject)) -> bool {
        let mut registry = self.lock_registry();
        match registry.objects.get_mut(&id) {
            Some(object) => {
                let district = object.district;
                mutate(object);
                object.district = district;
                true
            }
            None => false,
        }
    }

    /// Moves an object, migrating the district index when it changes
    /// district. Returns false for an unknown id.
    pub fn update_object_position(
        &self,
        id: ObjectId,
        position: LocationVector,
        district: u8,
    ) -> bool {
        let mut registry = self.lock_registry();
        let Some(object) = registry.objects.get_mut(&id) else {
            return false;
        };
        let old_district = object.district;
        object.position = position;
        object.district = district;
        if old_district != district {
            registry.detach_from_district(id, old_district);
            registry
                .district_objects
                .entry(district)
                .or_default()
                .push(id);
        }
        true
    }

    pub fn objects_in_district(&self, district: u8) -> Vec<GameObject> {
        let registry = self.lock_registry();
        registry
            .district_objects
            .get(&district)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| registry.objects.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn objects_in_range(
        &self,
        position: &LocationVector,
        range: f64,
        district: u8,
    ) -> Vec<GameObject> {
        let registry = self.lock_registry();
        let Some(ids) = registry.district_objects.get(&district) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| registry.objects.get(id))
            .filter(|object| position.distance(&object.position) <= range)
            .cloned()
            .collect()
    }

    pub fn nearest_object(
        &self,
        position: &LocationVector,
        object_type: u16,
        district: u8,
        max_range: f64,
    ) -> Option<GameObject> {
        let registry = self.lock_registry();
        let ids = registry.district_objects.get(&district)?;
        ids.iter()
            .filter_map(|id| registry.objects.get(id))
            .filter(|object| object.object_type == object_type)
            .map(|object| (position.distance_sq(&object.position), object))
            .filter(|(dist_sq, _)| *dist_sq <= max_range * max_range)
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, object)| object.clone())
    }

    /// The objects a viewer at `position` should currently know about:
    /// visible, same district, within range, excluding the viewer itself.
    pub fn interest_set(
        &self,
        position: &LocationVector,
        district: u8,
        range: f64,
        viewer: ObjectId,
    ) -> Vec<GameObject> {
        self.objects_in_range(position, range, district)
            .into_iter()
            .filter(|object| object.visible && object.id != viewer)
            .collect()
    }

    pub fn find_path(
        &self,
        start: &LocationVector,
        end: &LocationVector,
        district: u8,
    ) -> Vec<LocationVector> {
        self.navmesh.find_path(district, start, end)
    }

    pub fn has_line_of_sight(
        &self,
        start: &LocationVector,
        end: &LocationVector,
        district: u8,
    ) -> bool {
        self.navmesh.has_line_of_sight(district, start, end)
    }

    pub fn is_position_valid(&self, position: &LocationVector, district: u8) -> bool {
        self.navmesh.is_position_valid(district, position)
    }

    pub fn closest_valid_position(
        &self,
        position: &LocationVector,
        district: u8,
        max_distance: f64,
    ) -> LocationVector {
        self.navmesh
            .closest_valid_position(district, position, max_distance)
    }

    /// Declared spawn list first, otherwise a navmesh sample around the first
    /// hardline or the origin.
    pub fn random_spawn_position(&self, district: u8) -> LocationVector {
        if let Some(data) = self.districts.get(&district) {
            if !data.spawn_points.is_empty() {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..data.spawn_points.len());
                return data.spawn_points[idx];
            }
            let center = data
                .hardlines
                .first()
                .copied()
                .unwrap_or_default();
            return self
                .navmesh
                .random_point(district, &center, SPAWN_SAMPLE_RADIUS);
        }
        LocationVector::default()
    }

    /// Partition invariant: an id is in `objects` iff it appears in exactly
    /// one district bucket, the bucket of its own district.
    pub fn partition_consistent(&self) -> bool {
        let registry = self.lock_registry();
        let mut indexed = 0usize;
        for (district, ids) in &registry.district_objects {
            for id in ids {
                indexed += 1;
                match registry.objects.get(id) {
                    Some(object) if object.district == *district => {}
                    _ => return false,
                }
            }
        }
        indexed == registry.objects.len()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, ObjectRegistry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::object::ObjectIdAllocator;
    use crate::net::messages::{OBJECT_TYPE_HARDLINE, OBJECT_TYPE_NPC, OBJECT_TYPE_PLAYER};

    fn manager() -> (WorldManager, ObjectIdAllocator) {
        (
            WorldManager::new(builtin_districts(), NavMeshService::new()),
            ObjectIdAllocator::new(),
        )
    }

    fn spawn(
        manager: &WorldManager,
        allocator: &ObjectIdAllocator,
        object_type: u16,
        district: u8,
        x: f64,
        y: f64,
    ) -> ObjectId {
        let id = allocator.allocate();
        manager
            .add_object(GameObject::new(
                id,
                object_type,
                district,
                LocationVector::new(x, y, 0.0),
            ))
            .expect("add object");
        id
    }

    #[test]
    fn duplicate_object_id_is_rejected() {
        let (manager, allocator) = manager();
        let id = spawn(&manager, &allocator, OBJECT_TYPE_NPC, 1, 0.0, 0.0);
        let err = manager
            .add_object(GameObject::new(id, OBJECT_TYPE_NPC, 1, LocationVector::default()))
            .unwrap_err();
        assert!(err.contains("already registered"));
    }

    #[test]
    fn partition_tracks_adds_moves_and_removes() {
        let (manager, allocator) = manager();
        let a = spawn(&manager, &allocator, OBJECT_TYPE_PLAYER, 1, 0.0, 0.0);
        let b = spawn(&manager, &allocator, OBJECT_TYPE_NPC, 1, 5.0, 0.0);
        let c = spawn(&manager, &allocator, OBJECT_TYPE_NPC, 2, 0.0, 0.0);
        assert!(manager.partition_consistent());
        assert_eq!(manager.objects_in_district(1).len(), 2);
        assert_eq!(manager.objects_in_district(2).len(), 1);

        assert!(manager.update_object_position(a, LocationVector::new(1.0, 1.0, 0.0), 2));
        assert!(manager.partition_consistent());
        assert_eq!(manager.objects_in_district(1).len(), 1);
        assert_eq!(manager.objects_in_district(2).len(), 2);

        assert!(manager.remove_object(b).is_some());
        assert!(manager.remove_object(c).is_some());
        assert!(manager.partition_consistent());
        assert_eq!(manager.object_count(), 1);
    }

    #[test]
    fn range_query_is_district_scoped() {
        let (manager, allocator) = manager();
        let center = LocationVector::new(0.0, 0.0, 0.0);
        spawn(&manager, &allocator, OBJECT_TYPE_NPC, 1, 3.0, 0.0);
        spawn(&manager, &allocator, OBJECT_TYPE_NPC, 1, 30.0, 0.0);
        spawn(&manager, &allocator, OBJECT_TYPE_NPC, 2, 1.0, 0.0);

        let near = manager.objects_in_range(&center, 10.0, 1);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].position.x, 3.0);
    }

    #[test]
    fn nearest_object_filters_by_type_and_range() {
        let (manager, allocator) = manager();
        let center = LocationVector::new(0.0, 0.0, 0.0);
        spawn(&manager, &allocator, OBJECT_TYPE_NPC, 1, 4.0, 0.0);
        let hardline = spawn(&manager, &allocator, OBJECT_TYPE_HARDLINE, 1, 8.0, 0.0);
        spawn(&manager, &allocator, OBJECT_TYPE_HARDLINE, 1, 20.0, 0.0);

        let found = manager
            .nearest_object(&center, OBJECT_TYPE_HARDLINE, 1, 100.0)
            .expect("hardline");
        assert_eq!(found.id, hardline);
        assert!(manager
            .nearest_object(&center, OBJECT_TYPE_HARDLINE, 1, 5.0)
            .is_none());
        assert!(manager
            .nearest_object(&center, OBJECT_TYPE_HARDLINE, 2, 100.0)
            .is_none());
    }

    #[test]
    fn interest_set_excludes_viewer_and_invisible() {
        let (manager, allocator) = manager();
        let viewer = spawn(&manager, &allocator, OBJECT_TYPE_PLAYER, 1, 0.0, 0.0);
        let other = spawn(&manager, &allocator, OBJECT_TYPE_PLAYER, 1, 2.0, 0.0);
        let hidden = allocator.allocate();
        let mut ghost = GameObject::new(
            hidden,
            OBJECT_TYPE_NPC,
            1,
            LocationVector::new(1.0, 0.0, 0.0),
        );
        ghost.visible = false;
        manager.add_object(ghost).expect("add ghost");

        let center = LocationVector::new(0.0, 0.0, 0.0);
        let interest = manager.interest_set(&center, 1, 10.0, viewer);
        assert_eq!(interest.len(), 1);
        assert_eq!(interest[0].id, other);
    }

    #[test]
    fn spawn_position_prefers_declared_points() {
        let mut districts = builtin_districts();
        districts[0]
            .spawn_points
            .push(LocationVector::new(7.0, 7.0, 0.0));
        let manager = WorldManager::new(districts, NavMeshService::new());
        let spawn = manager.random_spawn_position(messages::DISTRICT_RICHLAND);
        assert_eq!(spawn.x, 7.0);
        assert_eq!(spawn.y, 7.0);
    }
}
