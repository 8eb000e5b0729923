//! Grid of entity cylinders for AOI and proximity queries

use super::geometry::{Cylinder, QueryRegion, TileExtent};
use super::{CellGrid, SpatialError};
use crate::game::registry::Entity;
use hashbrown::HashMap;

#[derive(Debug, Default)]
pub struct EntityLocator {
    grid: CellGrid<Entity>,
    /// Current volume of each tracked entity, used by the fine pass
    volumes: HashMap<Entity, Cylinder>,
}

impl EntityLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called before any entity is placed
    pub fn set_grid_size(&mut self, tile_extent: TileExtent) -> Result<(), SpatialError> {
        self.grid.set_grid_size(tile_extent)
    }

    /// Place or move `entity`. Safe to call every tick.
    pub fn set_location(&mut self, entity: Entity, cylinder: Cylinder) -> Result<(), SpatialError> {
        match self.grid.set(entity, &cylinder.bounding_box()) {
            Ok(()) => {
                self.volumes.insert(entity, cylinder);
                Ok(())
            }
            Err(e) => {
                self.volumes.remove(&entity);
                Err(e)
            }
        }
    }

    pub fn remove(&mut self, entity: Entity) -> bool {
        self.volumes.remove(&entity);
        self.grid.remove(&entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.grid.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Every entity in a cell `region` touches. De-duplicated and sorted.
    pub fn get_entities_coarse(&self, region: impl Into<QueryRegion>) -> Vec<Entity> {
        let region = region.into();
        let mut entities = Vec::new();
        self.grid.for_each_in(&region.bounding_box(), |entity| entities.push(entity));
        entities.sort_unstable();
        entities.dedup();
        entities
    }

    /// Entities whose cylinder actually intersects `region`. Sorted.
    pub fn get_entities_fine(&self, region: impl Into<QueryRegion>) -> Vec<Entity> {
        let region = region.into();
        let mut entities = self.get_entities_coarse(region);
        entities.retain(|entity| {
            self.volumes
                .get(entity)
                .is_some_and(|volume| region.intersects_cylinder(volume))
        });
        entities
    }

    pub fn volume_of(&self, entity: Entity) -> Option<&Cylinder> {
        self.volumes.get(&entity)
    }

    pub(crate) fn grid(&self) -> &CellGrid<Entity> {
        &self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::registry::World;
    use crate::game::spatial::geometry::{BoundingBox, ChunkExtent};
    use crate::util::vec3::Vec3;

    fn locator() -> EntityLocator {
        let mut locator = EntityLocator::new();
        locator.set_grid_size(TileExtent::new(0, 0, 0, 64, 64, 1)).unwrap();
        locator
    }

    #[test]
    fn test_fine_filters_coarse() {
        let mut world = World::new();
        let mut locator = locator();
        let near = world.create();
        let far_same_cell = world.create();
        let elsewhere = world.create();

        locator.set_location(near, Cylinder::new(Vec3::new(20.0, 20.0, 0.0), 4.0, 8.0)).unwrap();
        locator.set_location(far_same_cell, Cylinder::new(Vec3::new(100.0, 100.0, 0.0), 4.0, 8.0)).unwrap();
        locator.set_location(elsewhere, Cylinder::new(Vec3::new(1000.0, 1000.0, 0.0), 4.0, 8.0)).unwrap();

        let query = Cylinder::new(Vec3::new(10.0, 10.0, 0.0), 20.0, 8.0);
        let coarse = locator.get_entities_coarse(query);
        assert!(coarse.contains(&near));
        assert!(coarse.contains(&far_same_cell));
        assert!(!coarse.contains(&elsewhere));

        assert_eq!(locator.get_entities_fine(query), vec![near]);
    }

    #[test]
    fn test_coarse_deduplicates_multi_cell_entities() {
        let mut world = World::new();
        let mut locator = locator();
        let entity = world.create();
        // Straddles four cells
        locator.set_location(entity, Cylinder::new(Vec3::new(128.0, 128.0, 0.0), 10.0, 8.0)).unwrap();
        assert_eq!(locator.grid().membership_count(&entity), 4);

        let whole_map = TileExtent::new(0, 0, 0, 64, 64, 1);
        assert_eq!(locator.get_entities_coarse(whole_map), vec![entity]);
    }

    #[test]
    fn test_box_and_chunk_regions() {
        let mut world = World::new();
        let mut locator = locator();
        let entity = world.create();
        locator.set_location(entity, Cylinder::new(Vec3::new(600.0, 40.0, 0.0), 4.0, 8.0)).unwrap();

        // Chunk 1 covers x in [512, 1024)
        assert_eq!(locator.get_entities_fine(ChunkExtent::new(1, 0, 0, 1, 1, 1)), vec![entity]);
        assert!(locator.get_entities_fine(ChunkExtent::new(0, 0, 0, 1, 1, 1)).is_empty());

        let bounds = BoundingBox::new(Vec3::new(590.0, 30.0, 0.0), Vec3::new(597.0, 50.0, 10.0));
        assert_eq!(locator.get_entities_fine(bounds), vec![entity]);
    }

    #[test]
    fn test_out_of_bounds_rejected_and_untracked() {
        let mut world = World::new();
        let mut locator = locator();
        let entity = world.create();
        locator.set_location(entity, Cylinder::new(Vec3::new(20.0, 20.0, 0.0), 4.0, 8.0)).unwrap();

        let result = locator.set_location(entity, Cylinder::new(Vec3::new(-20.0, 20.0, 0.0), 4.0, 8.0));
        assert!(result.is_err());
        assert!(!locator.contains(entity));
        assert!(locator.volume_of(entity).is_none());
    }

    #[test]
    fn test_remove() {
        let mut world = World::new();
        let mut locator = locator();
        let entity = world.create();
        locator.set_location(entity, Cylinder::new(Vec3::new(20.0, 20.0, 0.0), 4.0, 8.0)).unwrap();
        assert!(locator.remove(entity));
        assert!(locator.is_empty());
        assert!(locator.get_entities_coarse(TileExtent::new(0, 0, 0, 64, 64, 1)).is_empty());
    }
}
