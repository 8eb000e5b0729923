//! Uniform grid spatial partitioning
//!
//! The world is split into fixed-size cells in positive space. Each cell holds
//! the ids of everything whose volume intersects it. `EntityLocator` tracks
//! entity cylinders (AOI, entity queries), `CollisionLocator` tracks collision
//! boxes for tile layers and entities (movement, raycasts).

pub mod collision_locator;
pub mod entity_locator;
pub mod geometry;

pub use collision_locator::{CollisionInfo, CollisionLocator, CollisionMask, CollisionObject, RaycastHit};
pub use entity_locator::EntityLocator;
pub use geometry::{BoundingBox, ChunkExtent, Cylinder, QueryRegion, Ray, TileExtent, TilePosition};

use crate::game::constants::world::{CELL_EXTENT_EPSILON, CELL_WIDTH_TILES, TILE_WORLD_HEIGHT, TILE_WORLD_WIDTH};
use crate::util::vec3::Vec3;
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::hash::Hash;
use tracing::error;

// ============================================================================
// Grid Constants
// ============================================================================

/// Cell width (x and y) in world units
pub const CELL_WORLD_WIDTH: f32 = CELL_WIDTH_TILES as f32 * TILE_WORLD_WIDTH;

/// Cell height (z) in world units, one tile level per cell
pub const CELL_WORLD_HEIGHT: f32 = TILE_WORLD_HEIGHT;

/// Inline capacity of each cell's occupant list
const CELL_INLINE_CAPACITY: usize = 4;

/// Initial capacity for the occupant membership map
const OCCUPANCY_INITIAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    #[error("Volume {0:?} is outside the grid bounds {1:?}")]
    OutOfBounds(BoundingBox, BoundingBox),
    #[error("Grid has not been sized")]
    NotSized,
    #[error("Grid cannot be resized while it has {0} occupants")]
    ResizeWhileOccupied(usize),
}

/// Range of grid cells
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellExtent {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub x_length: i32,
    pub y_length: i32,
    pub z_length: i32,
}

impl CellExtent {
    pub fn is_empty(&self) -> bool {
        self.x_length <= 0 || self.y_length <= 0 || self.z_length <= 0
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        x >= self.x
            && x < self.x + self.x_length
            && y >= self.y
            && y < self.y + self.y_length
            && z >= self.z
            && z < self.z + self.z_length
    }

    pub fn intersection(&self, other: &CellExtent) -> CellExtent {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let z = self.z.max(other.z);
        CellExtent {
            x,
            y,
            z,
            x_length: ((self.x + self.x_length).min(other.x + other.x_length) - x).max(0),
            y_length: ((self.y + self.y_length).min(other.y + other.y_length) - y).max(0),
            z_length: ((self.z + self.z_length).min(other.z + other.z_length) - z).max(0),
        }
    }

    pub fn cell_count(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.x_length * self.y_length * self.z_length) as usize
        }
    }
}

/// Cell storage shared by both locators
///
/// Tracks which cells every occupant is in, so an update can clear the old
/// memberships before adding the new ones.
#[derive(Debug)]
pub struct CellGrid<Id> {
    /// Cells covered by the grid, origin at (0, 0, 0)
    grid_extent: CellExtent,
    /// World-space volume covered by the grid
    world_bounds: BoundingBox,
    cells: Vec<SmallVec<[Id; CELL_INLINE_CAPACITY]>>,
    /// Current cell extent of each tracked occupant
    occupancy: HashMap<Id, CellExtent>,
    sized: bool,
}

impl<Id: Copy + Eq + Hash> CellGrid<Id> {
    pub fn new() -> Self {
        Self {
            grid_extent: CellExtent::default(),
            world_bounds: BoundingBox::default(),
            cells: Vec::new(),
            occupancy: HashMap::with_capacity(OCCUPANCY_INITIAL_CAPACITY),
            sized: false,
        }
    }

    /// Size the grid to cover `tile_extent`, which must start at the origin.
    pub fn set_grid_size(&mut self, tile_extent: TileExtent) -> Result<(), SpatialError> {
        if !self.occupancy.is_empty() {
            return Err(SpatialError::ResizeWhileOccupied(self.occupancy.len()));
        }

        let world_bounds = tile_extent.world_bounds();
        let x_length = (world_bounds.max.x / CELL_WORLD_WIDTH).ceil().max(1.0) as i32;
        let y_length = (world_bounds.max.y / CELL_WORLD_WIDTH).ceil().max(1.0) as i32;
        let z_length = (world_bounds.max.z / CELL_WORLD_HEIGHT).ceil().max(1.0) as i32;

        self.grid_extent = CellExtent { x: 0, y: 0, z: 0, x_length, y_length, z_length };
        self.world_bounds = BoundingBox::new(Vec3::ZERO, world_bounds.max);
        self.cells = vec![SmallVec::new(); self.grid_extent.cell_count()];
        self.sized = true;
        Ok(())
    }

    #[inline]
    pub fn world_bounds(&self) -> &BoundingBox {
        &self.world_bounds
    }

    #[inline]
    pub fn grid_extent(&self) -> &CellExtent {
        &self.grid_extent
    }

    #[inline]
    pub fn is_sized(&self) -> bool {
        self.sized
    }

    pub fn len(&self) -> usize {
        self.occupancy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.occupancy.contains_key(id)
    }

    /// Cells intersected by `volume`. Not clipped to the grid.
    ///
    /// The max edge is pulled in by an epsilon so a volume ending exactly on a
    /// cell boundary does not also occupy the next cell.
    pub fn cell_extent_of(volume: &BoundingBox) -> CellExtent {
        let min_x = (volume.min.x / CELL_WORLD_WIDTH).floor() as i32;
        let min_y = (volume.min.y / CELL_WORLD_WIDTH).floor() as i32;
        let min_z = (volume.min.z / CELL_WORLD_HEIGHT).floor() as i32;
        let max_x = ((volume.max.x - CELL_EXTENT_EPSILON) / CELL_WORLD_WIDTH).floor() as i32;
        let max_y = ((volume.max.y - CELL_EXTENT_EPSILON) / CELL_WORLD_WIDTH).floor() as i32;
        let max_z = ((volume.max.z - CELL_EXTENT_EPSILON) / CELL_WORLD_HEIGHT).floor() as i32;

        CellExtent {
            x: min_x,
            y: min_y,
            z: min_z,
            x_length: (max_x - min_x + 1).max(1),
            y_length: (max_y - min_y + 1).max(1),
            z_length: (max_z - min_z + 1).max(1),
        }
    }

    #[inline]
    fn linear_index(&self, x: i32, y: i32, z: i32) -> usize {
        let extent = &self.grid_extent;
        ((z * extent.y_length + y) * extent.x_length + x) as usize
    }

    /// Place (or move) `id` so it occupies exactly the cells `volume` covers.
    ///
    /// Out-of-bounds volumes are logged and rejected, and the occupant is no
    /// longer tracked.
    pub fn set(&mut self, id: Id, volume: &BoundingBox) -> Result<(), SpatialError> {
        if !self.sized {
            return Err(SpatialError::NotSized);
        }

        if !self.world_bounds.contains(volume) {
            error!(
                "Spatial volume {:?} outside grid bounds {:?}, not tracking it",
                volume, self.world_bounds
            );
            self.remove(&id);
            return Err(SpatialError::OutOfBounds(*volume, self.world_bounds));
        }

        let new_extent = Self::cell_extent_of(volume).intersection(&self.grid_extent);
        if let Some(old_extent) = self.occupancy.get(&id).copied() {
            if old_extent == new_extent {
                return Ok(());
            }
            self.clear_cells(id, &old_extent);
        }

        self.fill_cells(id, &new_extent);
        self.occupancy.insert(id, new_extent);
        Ok(())
    }

    /// Clear every cell membership of `id`. Returns false if it wasn't tracked.
    pub fn remove(&mut self, id: &Id) -> bool {
        match self.occupancy.remove(id) {
            Some(extent) => {
                self.clear_cells(*id, &extent);
                true
            }
            None => false,
        }
    }

    fn clear_cells(&mut self, id: Id, extent: &CellExtent) {
        for z in extent.z..extent.z + extent.z_length {
            for y in extent.y..extent.y + extent.y_length {
                for x in extent.x..extent.x + extent.x_length {
                    let index = self.linear_index(x, y, z);
                    let cell = &mut self.cells[index];
                    if let Some(position) = cell.iter().position(|occupant| *occupant == id) {
                        cell.swap_remove(position);
                    }
                }
            }
        }
    }

    fn fill_cells(&mut self, id: Id, extent: &CellExtent) {
        for z in extent.z..extent.z + extent.z_length {
            for y in extent.y..extent.y + extent.y_length {
                for x in extent.x..extent.x + extent.x_length {
                    let index = self.linear_index(x, y, z);
                    self.cells[index].push(id);
                }
            }
        }
    }

    /// Call `visit` with the occupants of every cell `region` covers, after
    /// clipping to the grid. Occupants spanning several cells are visited once
    /// per cell.
    pub fn for_each_in(&self, region: &BoundingBox, mut visit: impl FnMut(Id)) {
        let extent = Self::cell_extent_of(region).intersection(&self.grid_extent);
        if extent.is_empty() {
            return;
        }

        for z in extent.z..extent.z + extent.z_length {
            for y in extent.y..extent.y + extent.y_length {
                for x in extent.x..extent.x + extent.x_length {
                    for occupant in &self.cells[self.linear_index(x, y, z)] {
                        visit(*occupant);
                    }
                }
            }
        }
    }

    /// Cells the occupant is currently registered in
    pub fn cells_of(&self, id: &Id) -> Option<CellExtent> {
        self.occupancy.get(id).copied()
    }

    /// Number of membership entries for `id` across all cells
    pub fn membership_count(&self, id: &Id) -> usize {
        self.cells
            .iter()
            .map(|cell| cell.iter().filter(|occupant| *occupant == id).count())
            .sum()
    }

    /// Walk the cells a segment passes through, in traversal order.
    ///
    /// `visit` gets each cell's occupants and the segment parameter at which
    /// the segment enters that cell. Returning false stops the walk.
    pub fn traverse_ray(&self, ray: &Ray, mut visit: impl FnMut(&[Id], f32) -> bool) {
        // Clip the segment to the grid first so traversal starts inside it
        let t_start = if self.world_bounds.contains(&BoundingBox::new(ray.start, ray.start)) {
            0.0
        } else {
            match self.world_bounds.intersect_ray(ray) {
                Some(t) => t,
                None => return,
            }
        };

        let direction = ray.direction();
        let entry = ray.point_at(t_start);
        let cell_sizes = [CELL_WORLD_WIDTH, CELL_WORLD_WIDTH, CELL_WORLD_HEIGHT];
        let lengths = [
            self.grid_extent.x_length,
            self.grid_extent.y_length,
            self.grid_extent.z_length,
        ];

        let mut cell = [0i32; 3];
        let mut step = [0i32; 3];
        let mut t_max = [f32::INFINITY; 3];
        let mut t_delta = [f32::INFINITY; 3];

        for axis in 0..3 {
            let size = cell_sizes[axis];
            let dir = direction.axis(axis);
            cell[axis] = ((entry.axis(axis) / size).floor() as i32).clamp(0, lengths[axis] - 1);

            if dir > 0.0 {
                step[axis] = 1;
                t_max[axis] = ((cell[axis] + 1) as f32 * size - ray.start.axis(axis)) / dir;
                t_delta[axis] = size / dir;
            } else if dir < 0.0 {
                step[axis] = -1;
                t_max[axis] = (cell[axis] as f32 * size - ray.start.axis(axis)) / dir;
                t_delta[axis] = -size / dir;
            }
        }

        let mut t_entry = t_start;
        loop {
            let index = self.linear_index(cell[0], cell[1], cell[2]);
            if !visit(&self.cells[index], t_entry) {
                return;
            }

            // Advance along the axis whose boundary comes first
            let axis = if t_max[0] <= t_max[1] && t_max[0] <= t_max[2] {
                0
            } else if t_max[1] <= t_max[2] {
                1
            } else {
                2
            };

            if t_max[axis] > 1.0 {
                return;
            }

            cell[axis] += step[axis];
            if cell[axis] < 0 || cell[axis] >= lengths[axis] {
                return;
            }
            t_entry = t_max[axis];
            t_max[axis] += t_delta[axis];
        }
    }
}

impl<Id: Copy + Eq + Hash> Default for CellGrid<Id> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized_grid() -> CellGrid<u32> {
        let mut grid = CellGrid::new();
        // 16x16 tiles = 4x4 cells of 128 units, one level
        grid.set_grid_size(TileExtent::new(0, 0, 0, 16, 16, 1)).unwrap();
        grid
    }

    fn cube(min: Vec3, size: f32) -> BoundingBox {
        BoundingBox::new(min, min + Vec3::new(size, size, size))
    }

    #[test]
    fn test_grid_size() {
        let grid = sized_grid();
        assert_eq!(grid.grid_extent().x_length, 4);
        assert_eq!(grid.grid_extent().y_length, 4);
        assert_eq!(grid.grid_extent().z_length, 1);
        assert_eq!(grid.world_bounds().max, Vec3::new(512.0, 512.0, 32.0));
    }

    #[test]
    fn test_unsized_grid_rejects() {
        let mut grid: CellGrid<u32> = CellGrid::new();
        let result = grid.set(1, &cube(Vec3::ZERO, 1.0));
        assert_eq!(result, Err(SpatialError::NotSized));
    }

    #[test]
    fn test_resize_with_occupants_rejected() {
        let mut grid = sized_grid();
        grid.set(1, &cube(Vec3::ZERO, 1.0)).unwrap();
        assert!(matches!(
            grid.set_grid_size(TileExtent::new(0, 0, 0, 32, 32, 1)),
            Err(SpatialError::ResizeWhileOccupied(1))
        ));
    }

    #[test]
    fn test_cell_boundary_epsilon() {
        // Ends exactly on the boundary between cell 0 and cell 1
        let volume = BoundingBox::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(128.0, 10.0, 10.0));
        let extent = CellGrid::<u32>::cell_extent_of(&volume);
        assert_eq!(extent.x, 0);
        assert_eq!(extent.x_length, 1);

        let straddling = BoundingBox::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(130.0, 10.0, 10.0));
        assert_eq!(CellGrid::<u32>::cell_extent_of(&straddling).x_length, 2);
    }

    #[test]
    fn test_set_moves_memberships() {
        let mut grid = sized_grid();
        grid.set(7, &cube(Vec3::new(120.0, 10.0, 0.0), 16.0)).unwrap();
        assert_eq!(grid.membership_count(&7), 2);

        grid.set(7, &cube(Vec3::new(300.0, 300.0, 0.0), 16.0)).unwrap();
        assert_eq!(grid.membership_count(&7), 1);
        assert_eq!(
            grid.cells_of(&7),
            Some(CellExtent { x: 2, y: 2, z: 0, x_length: 1, y_length: 1, z_length: 1 })
        );
    }

    #[test]
    fn test_set_twice_is_idempotent() {
        let mut grid = sized_grid();
        let volume = cube(Vec3::new(120.0, 120.0, 0.0), 16.0);
        grid.set(3, &volume).unwrap();
        grid.set(3, &volume).unwrap();
        assert_eq!(grid.membership_count(&3), 4);
    }

    #[test]
    fn test_out_of_bounds_untracks() {
        let mut grid = sized_grid();
        grid.set(1, &cube(Vec3::new(10.0, 10.0, 0.0), 4.0)).unwrap();
        let result = grid.set(1, &cube(Vec3::new(510.0, 10.0, 0.0), 4.0));
        assert!(matches!(result, Err(SpatialError::OutOfBounds(_, _))));
        assert!(!grid.contains(&1));
        assert_eq!(grid.membership_count(&1), 0);
    }

    #[test]
    fn test_remove() {
        let mut grid = sized_grid();
        grid.set(1, &cube(Vec3::new(10.0, 10.0, 0.0), 4.0)).unwrap();
        assert!(grid.remove(&1));
        assert!(!grid.remove(&1));
        assert_eq!(grid.membership_count(&1), 0);
    }

    #[test]
    fn test_query_clipped_to_bounds() {
        let mut grid = sized_grid();
        grid.set(1, &cube(Vec3::new(1.0, 1.0, 0.0), 4.0)).unwrap();
        let huge = BoundingBox::new(Vec3::new(-1000.0, -1000.0, -1000.0), Vec3::new(1000.0, 1000.0, 1000.0));
        let mut found = Vec::new();
        grid.for_each_in(&huge, |id| found.push(id));
        assert_eq!(found, vec![1]);
    }

    #[test]
    fn test_traverse_ray_visits_in_order() {
        let grid = sized_grid();
        let ray = Ray::new(Vec3::new(10.0, 10.0, 5.0), Vec3::new(500.0, 10.0, 5.0));
        let mut entries = Vec::new();
        grid.traverse_ray(&ray, |_, t| {
            entries.push(t);
            true
        });
        assert_eq!(entries.len(), 4);
        assert!(entries.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_traverse_ray_outside_grid() {
        let grid = sized_grid();
        let ray = Ray::new(Vec3::new(-100.0, -100.0, 5.0), Vec3::new(-10.0, -10.0, 5.0));
        let mut visited = 0;
        grid.traverse_ray(&ray, |_, _| {
            visited += 1;
            true
        });
        assert_eq!(visited, 0);
    }
}
