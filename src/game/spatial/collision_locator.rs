//! Grid of collision boxes for movement resolution and raycasts
//!
//! Objects are stored in a slab and referenced from the grid by slab index.
//! Each object is either a tile layer or an entity.

use super::geometry::{BoundingBox, QueryRegion, Ray, TileExtent, TilePosition};
use super::{CellGrid, SpatialError};
use crate::game::constants::world::MAX_TILE_LAYERS;
use crate::game::registry::Entity;
use crate::util::vec3::Vec3;
use bitvec::prelude::*;
use hashbrown::HashMap;
use std::ops::BitOr;

type CollisionId = u32;

/// What a collision volume belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionObject {
    TileLayer { tile: TilePosition, layer_index: u8 },
    Entity(Entity),
}

impl CollisionObject {
    pub fn mask(&self) -> CollisionMask {
        match self {
            CollisionObject::TileLayer { .. } => CollisionMask::TILE_LAYER,
            CollisionObject::Entity(_) => CollisionMask::ENTITY,
        }
    }

    pub fn entity(&self) -> Option<Entity> {
        match self {
            CollisionObject::Entity(entity) => Some(*entity),
            CollisionObject::TileLayer { .. } => None,
        }
    }
}

/// Bit set of collision object types a query is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollisionMask(u8);

impl CollisionMask {
    pub const NONE: CollisionMask = CollisionMask(0);
    pub const TILE_LAYER: CollisionMask = CollisionMask(1 << 0);
    pub const ENTITY: CollisionMask = CollisionMask(1 << 1);
    pub const ALL: CollisionMask = CollisionMask(u8::MAX);

    #[inline]
    pub fn intersects(&self, other: CollisionMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CollisionMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        CollisionMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionInfo {
    pub object: CollisionObject,
    pub volume: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub object: CollisionObject,
    /// Segment parameter in `[0, 1]` of the entry point
    pub t: f32,
    pub point: Vec3,
}

/// Which objects a raycast considers
#[derive(Debug, Clone, Copy)]
pub struct RaycastFilter<'a> {
    pub mask: CollisionMask,
    /// Skip volumes the ray starts inside of
    pub ignore_inside: bool,
    pub excluded: &'a [Entity],
}

impl Default for RaycastFilter<'_> {
    fn default() -> Self {
        Self {
            mask: CollisionMask::ALL,
            ignore_inside: false,
            excluded: &[],
        }
    }
}

impl<'a> RaycastFilter<'a> {
    pub fn new(mask: CollisionMask) -> Self {
        Self { mask, ..Default::default() }
    }

    pub fn ignoring_inside(mut self) -> Self {
        self.ignore_inside = true;
        self
    }

    pub fn excluding(mut self, excluded: &'a [Entity]) -> Self {
        self.excluded = excluded;
        self
    }

    fn accepts(&self, object: &CollisionObject) -> bool {
        if !self.mask.intersects(object.mask()) {
            return false;
        }
        match object.entity() {
            Some(entity) => !self.excluded.contains(&entity),
            None => true,
        }
    }
}

enum RayEvent {
    EnterCell(f32),
    Hit(RaycastHit),
}

#[derive(Debug, Default)]
pub struct CollisionLocator {
    grid: CellGrid<CollisionId>,
    objects: Vec<Option<CollisionInfo>>,
    free_ids: Vec<CollisionId>,
    ids: HashMap<CollisionObject, CollisionId>,
}

impl CollisionLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_grid_size(&mut self, tile_extent: TileExtent) -> Result<(), SpatialError> {
        self.grid.set_grid_size(tile_extent)
    }

    pub fn world_bounds(&self) -> &BoundingBox {
        self.grid.world_bounds()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn volume_of(&self, object: &CollisionObject) -> Option<BoundingBox> {
        let id = *self.ids.get(object)?;
        self.objects[id as usize].map(|info| info.volume)
    }

    /// Track (or move) an object's volume. Out-of-bounds volumes are rejected
    /// and the object stops being tracked.
    pub fn set(&mut self, object: CollisionObject, volume: BoundingBox) -> Result<(), SpatialError> {
        let id = match self.ids.get(&object) {
            Some(id) => *id,
            None => self.allocate_id(),
        };

        if let Err(e) = self.grid.set(id, &volume) {
            self.release(object, id);
            return Err(e);
        }

        self.objects[id as usize] = Some(CollisionInfo { object, volume });
        self.ids.insert(object, id);
        Ok(())
    }

    pub fn remove(&mut self, object: &CollisionObject) -> bool {
        match self.ids.get(object).copied() {
            Some(id) => {
                self.grid.remove(&id);
                self.release(*object, id);
                true
            }
            None => false,
        }
    }

    pub fn update_tile_layer(
        &mut self,
        tile: TilePosition,
        layer_index: u8,
        volume: BoundingBox,
    ) -> Result<(), SpatialError> {
        self.set(CollisionObject::TileLayer { tile, layer_index }, volume)
    }

    pub fn remove_tile_layer(&mut self, tile: TilePosition, layer_index: u8) -> bool {
        self.remove(&CollisionObject::TileLayer { tile, layer_index })
    }

    /// Remove every layer volume registered for `tile`
    pub fn clear_tile(&mut self, tile: TilePosition) {
        for layer_index in 0..MAX_TILE_LAYERS as u8 {
            self.remove_tile_layer(tile, layer_index);
        }
    }

    pub fn update_entity(&mut self, entity: Entity, volume: BoundingBox) -> Result<(), SpatialError> {
        self.set(CollisionObject::Entity(entity), volume)
    }

    pub fn remove_entity(&mut self, entity: Entity) -> bool {
        self.remove(&CollisionObject::Entity(entity))
    }

    fn allocate_id(&mut self) -> CollisionId {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.objects.push(None);
                (self.objects.len() - 1) as CollisionId
            }
        }
    }

    fn release(&mut self, object: CollisionObject, id: CollisionId) {
        self.ids.remove(&object);
        self.objects[id as usize] = None;
        self.free_ids.push(id);
    }

    /// Everything in a cell `region` touches, filtered by type
    pub fn get_collisions_broad(&self, region: impl Into<QueryRegion>, mask: CollisionMask) -> Vec<CollisionInfo> {
        let region = region.into();
        let mut seen = bitvec![0; self.objects.len()];
        let mut collisions = Vec::new();

        self.grid.for_each_in(&region.bounding_box(), |id| {
            let index = id as usize;
            if seen[index] {
                return;
            }
            seen.set(index, true);
            if let Some(info) = &self.objects[index] {
                if mask.intersects(info.object.mask()) {
                    collisions.push(*info);
                }
            }
        });

        collisions
    }

    /// Volumes that actually intersect `region`, filtered by type
    pub fn get_collisions(&self, region: impl Into<QueryRegion>, mask: CollisionMask) -> Vec<CollisionInfo> {
        let region = region.into();
        let mut collisions = self.get_collisions_broad(region, mask);
        collisions.retain(|info| region.intersects_box(&info.volume));
        collisions
    }

    fn walk_ray(&self, ray: &Ray, filter: &RaycastFilter<'_>, mut visit: impl FnMut(RayEvent) -> bool) {
        let mut tested = bitvec![0; self.objects.len()];

        self.grid.traverse_ray(ray, |cell, t_entry| {
            if !visit(RayEvent::EnterCell(t_entry)) {
                return false;
            }

            for id in cell {
                let index = *id as usize;
                if tested[index] {
                    continue;
                }
                tested.set(index, true);

                let Some(info) = &self.objects[index] else {
                    continue;
                };
                if !filter.accepts(&info.object) {
                    continue;
                }
                if filter.ignore_inside && info.volume.contains_point(ray.start) {
                    continue;
                }
                if let Some(t) = info.volume.intersect_ray(ray) {
                    let hit = RaycastHit {
                        object: info.object,
                        t,
                        point: ray.point_at(t),
                    };
                    if !visit(RayEvent::Hit(hit)) {
                        return false;
                    }
                }
            }
            true
        });
    }

    /// True if the segment hits anything accepted by `filter`
    pub fn raycast_any(&self, ray: &Ray, filter: &RaycastFilter<'_>) -> bool {
        let mut found = false;
        self.walk_ray(ray, filter, |event| match event {
            RayEvent::EnterCell(_) => true,
            RayEvent::Hit(_) => {
                found = true;
                false
            }
        });
        found
    }

    /// Nearest hit along the segment.
    ///
    /// A hit found in one cell may be farther than a hit in a cell visited
    /// later (volumes span cells), so the walk continues until the next cell
    /// starts beyond the best `t` so far.
    pub fn raycast_first(&self, ray: &Ray, filter: &RaycastFilter<'_>) -> Option<RaycastHit> {
        let mut best: Option<RaycastHit> = None;
        self.walk_ray(ray, filter, |event| match event {
            RayEvent::EnterCell(t_entry) => best.map_or(true, |hit| t_entry <= hit.t),
            RayEvent::Hit(hit) => {
                if best.map_or(true, |current| hit.t < current.t) {
                    best = Some(hit);
                }
                true
            }
        });
        best
    }

    /// Every hit along the segment, nearest first
    pub fn raycast_all(&self, ray: &Ray, filter: &RaycastFilter<'_>) -> Vec<RaycastHit> {
        let mut hits = Vec::new();
        self.walk_ray(ray, filter, |event| {
            if let RayEvent::Hit(hit) = event {
                hits.push(hit);
            }
            true
        });
        hits.sort_by(|a, b| a.t.total_cmp(&b.t));
        hits
    }
}
