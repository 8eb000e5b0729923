//! Volumes, extents and exact intersection tests used by the locators
//!
//! All overlap tests are strict: two volumes that only share a face do not
//! intersect. This keeps a volume resting exactly on a tile boundary out of
//! the neighbouring tile.

use crate::game::constants::world::{CHUNK_WIDTH, TILE_WORLD_HEIGHT, TILE_WORLD_WIDTH};
use crate::util::vec3::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in world space
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// True if `min <= max` on every axis
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    /// Inclusive containment, used for grid bounds checks
    #[inline]
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.min.z >= self.min.z
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
            && other.max.z <= self.max.z
    }

    /// Strict containment of a point (on-face points are outside)
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x > self.min.x
            && point.x < self.max.x
            && point.y > self.min.y
            && point.y < self.max.y
            && point.z > self.min.z
            && point.z < self.max.z
    }

    pub fn intersects_cylinder(&self, cylinder: &Cylinder) -> bool {
        cylinder.intersects_box(self)
    }

    /// Slab test. Returns the segment parameter in `[0, 1]` at which the ray
    /// enters the box, or 0 if the ray starts inside it.
    pub fn intersect_ray(&self, ray: &Ray) -> Option<f32> {
        let direction = ray.direction();
        let mut t_enter = 0.0f32;
        let mut t_exit = 1.0f32;

        for axis in 0..3 {
            let start = ray.start.axis(axis);
            let dir = direction.axis(axis);
            let min = self.min.axis(axis);
            let max = self.max.axis(axis);

            if dir.abs() < f32::EPSILON {
                // Parallel to this slab, must already be within it
                if start <= min || start >= max {
                    return None;
                }
                continue;
            }

            let inv = 1.0 / dir;
            let mut t0 = (min - start) * inv;
            let mut t1 = (max - start) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_enter = t_enter.max(t0);
            t_exit = t_exit.min(t1);
            if t_enter >= t_exit {
                return None;
            }
        }

        Some(t_enter)
    }
}

/// Upright cylinder. `center` is the center of the bottom face.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    pub center: Vec3,
    pub radius: f32,
    pub height: f32,
}

impl Cylinder {
    pub const fn new(center: Vec3, radius: f32, height: f32) -> Self {
        Self { center, radius, height }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox {
            min: Vec3::new(
                self.center.x - self.radius,
                self.center.y - self.radius,
                self.center.z,
            ),
            max: Vec3::new(
                self.center.x + self.radius,
                self.center.y + self.radius,
                self.center.z + self.height,
            ),
        }
    }

    #[inline]
    fn overlaps_z(&self, min_z: f32, max_z: f32) -> bool {
        self.center.z < max_z && self.center.z + self.height > min_z
    }

    pub fn intersects(&self, other: &Cylinder) -> bool {
        let reach = self.radius + other.radius;
        self.center.distance_sq_xy_to(other.center) < reach * reach
            && self.overlaps_z(other.center.z, other.center.z + other.height)
    }

    pub fn intersects_box(&self, bounds: &BoundingBox) -> bool {
        if !self.overlaps_z(bounds.min.z, bounds.max.z) {
            return false;
        }

        // Closest point on the box's XY rectangle to the cylinder axis
        let closest_x = self.center.x.clamp(bounds.min.x, bounds.max.x);
        let closest_y = self.center.y.clamp(bounds.min.y, bounds.max.y);
        let dx = self.center.x - closest_x;
        let dy = self.center.y - closest_y;
        dx * dx + dy * dy < self.radius * self.radius
    }
}

/// Line segment from `start` to `end`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub start: Vec3,
    pub end: Vec3,
}

impl Ray {
    pub const fn new(start: Vec3, end: Vec3) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn direction(&self) -> Vec3 {
        self.end - self.start
    }

    #[inline]
    pub fn point_at(&self, t: f32) -> Vec3 {
        self.start + self.direction() * t
    }
}

/// Integer tile coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl TilePosition {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Tile containing a world position
    pub fn from_world(position: Vec3) -> Self {
        Self {
            x: (position.x / TILE_WORLD_WIDTH).floor() as i32,
            y: (position.y / TILE_WORLD_WIDTH).floor() as i32,
            z: (position.z / TILE_WORLD_HEIGHT).floor() as i32,
        }
    }

    /// World-space box covering this tile
    pub fn world_bounds(&self) -> BoundingBox {
        TileExtent::new(self.x, self.y, self.z, 1, 1, 1).world_bounds()
    }
}

/// Rectangular range of tiles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileExtent {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub x_length: i32,
    pub y_length: i32,
    pub z_length: i32,
}

impl TileExtent {
    pub const fn new(x: i32, y: i32, z: i32, x_length: i32, y_length: i32, z_length: i32) -> Self {
        Self { x, y, z, x_length, y_length, z_length }
    }

    pub fn is_empty(&self) -> bool {
        self.x_length <= 0 || self.y_length <= 0 || self.z_length <= 0
    }

    pub fn contains(&self, position: TilePosition) -> bool {
        position.x >= self.x
            && position.x < self.x + self.x_length
            && position.y >= self.y
            && position.y < self.y + self.y_length
            && position.z >= self.z
            && position.z < self.z + self.z_length
    }

    /// Overlapping part of two extents (may be empty)
    pub fn intersection(&self, other: &TileExtent) -> TileExtent {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let z = self.z.max(other.z);
        let x_end = (self.x + self.x_length).min(other.x + other.x_length);
        let y_end = (self.y + self.y_length).min(other.y + other.y_length);
        let z_end = (self.z + self.z_length).min(other.z + other.z_length);
        TileExtent {
            x,
            y,
            z,
            x_length: (x_end - x).max(0),
            y_length: (y_end - y).max(0),
            z_length: (z_end - z).max(0),
        }
    }

    pub fn world_bounds(&self) -> BoundingBox {
        BoundingBox {
            min: Vec3::new(
                self.x as f32 * TILE_WORLD_WIDTH,
                self.y as f32 * TILE_WORLD_WIDTH,
                self.z as f32 * TILE_WORLD_HEIGHT,
            ),
            max: Vec3::new(
                (self.x + self.x_length) as f32 * TILE_WORLD_WIDTH,
                (self.y + self.y_length) as f32 * TILE_WORLD_WIDTH,
                (self.z + self.z_length) as f32 * TILE_WORLD_HEIGHT,
            ),
        }
    }

    /// Every tile position in the extent, z-major then y then x
    pub fn positions(&self) -> impl Iterator<Item = TilePosition> + '_ {
        let (x, y, z) = (self.x, self.y, self.z);
        let (xl, yl, zl) = (self.x_length.max(0), self.y_length.max(0), self.z_length.max(0));
        (z..z + zl).flat_map(move |tz| {
            (y..y + yl).flat_map(move |ty| (x..x + xl).map(move |tx| TilePosition::new(tx, ty, tz)))
        })
    }
}

/// Rectangular range of chunks. Chunks span the full height of the map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkExtent {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub x_length: i32,
    pub y_length: i32,
    pub z_length: i32,
}

impl ChunkExtent {
    pub const fn new(x: i32, y: i32, z: i32, x_length: i32, y_length: i32, z_length: i32) -> Self {
        Self { x, y, z, x_length, y_length, z_length }
    }

    /// Square extent of `radius` chunks around the chunk containing `tile`
    pub fn around_tile(tile: TilePosition, radius: i32) -> Self {
        let width = CHUNK_WIDTH as i32;
        Self {
            x: tile.x.div_euclid(width) - radius,
            y: tile.y.div_euclid(width) - radius,
            z: tile.z,
            x_length: radius * 2 + 1,
            y_length: radius * 2 + 1,
            z_length: 1,
        }
    }

    pub fn contains(&self, chunk_x: i32, chunk_y: i32) -> bool {
        chunk_x >= self.x
            && chunk_x < self.x + self.x_length
            && chunk_y >= self.y
            && chunk_y < self.y + self.y_length
    }

    pub fn to_tile_extent(&self) -> TileExtent {
        let width = CHUNK_WIDTH as i32;
        TileExtent {
            x: self.x * width,
            y: self.y * width,
            z: self.z,
            x_length: self.x_length * width,
            y_length: self.y_length * width,
            z_length: self.z_length,
        }
    }

    /// Every (chunk_x, chunk_y) pair in the extent
    pub fn chunks(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let (x, xl) = (self.x, self.x_length.max(0));
        (self.y..self.y + self.y_length.max(0)).flat_map(move |cy| (x..x + xl).map(move |cx| (cx, cy)))
    }
}

/// Region accepted by locator queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryRegion {
    Cylinder(Cylinder),
    Box(BoundingBox),
    Tiles(TileExtent),
    Chunks(ChunkExtent),
}

impl QueryRegion {
    /// World-space bounds used for the coarse pass
    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            QueryRegion::Cylinder(cylinder) => cylinder.bounding_box(),
            QueryRegion::Box(bounds) => *bounds,
            QueryRegion::Tiles(extent) => extent.world_bounds(),
            QueryRegion::Chunks(extent) => extent.to_tile_extent().world_bounds(),
        }
    }

    /// Exact test against a box volume
    pub fn intersects_box(&self, volume: &BoundingBox) -> bool {
        match self {
            QueryRegion::Cylinder(cylinder) => cylinder.intersects_box(volume),
            other => other.bounding_box().intersects(volume),
        }
    }

    /// Exact test against a cylinder volume
    pub fn intersects_cylinder(&self, volume: &Cylinder) -> bool {
        match self {
            QueryRegion::Cylinder(cylinder) => cylinder.intersects(volume),
            other => volume.intersects_box(&other.bounding_box()),
        }
    }
}

impl From<Cylinder> for QueryRegion {
    fn from(value: Cylinder) -> Self {
        QueryRegion::Cylinder(value)
    }
}

impl From<BoundingBox> for QueryRegion {
    fn from(value: BoundingBox) -> Self {
        QueryRegion::Box(value)
    }
}

impl From<TileExtent> for QueryRegion {
    fn from(value: TileExtent) -> Self {
        QueryRegion::Tiles(value)
    }
}

impl From<ChunkExtent> for QueryRegion {
    fn from(value: ChunkExtent) -> Self {
        QueryRegion::Chunks(value)
    }
}
