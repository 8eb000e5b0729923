//! Area of Interest (AOI) tracking
//!
//! Each tick every client's AOI is recomputed from the entity locator and
//! diffed against what the client already knows. Entered entities are sent
//! in full, exited ones deleted, and the rest only when they moved.

use std::cell::RefCell;

use crate::game::constants::aoi::{DEFAULT_RADIUS, HALF_HEIGHT};
use crate::game::registry::Entity;
use crate::game::spatial::{Cylinder, EntityLocator};
use crate::util::vec3::Vec3;

thread_local! {
    /// Reused candidate buffer, one per rayon worker
    static CANDIDATE_BUFFER: RefCell<Vec<Entity>> = RefCell::new(Vec::with_capacity(256));
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AoiConfig {
    pub radius: f32,
}

impl Default for AoiConfig {
    fn default() -> Self {
        Self { radius: DEFAULT_RADIUS }
    }
}

impl AoiConfig {
    #[inline]
    fn radius_sq(&self) -> f32 {
        self.radius * self.radius
    }

    /// Query cylinder around a viewer standing at `position`
    pub fn query_volume(&self, position: Vec3) -> Cylinder {
        Cylinder::new(
            Vec3::new(position.x, position.y, position.z - HALF_HEIGHT),
            self.radius,
            HALF_HEIGHT * 2.0,
        )
    }
}

/// Change in a client's AOI between two ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AoiDelta {
    pub entered: Vec<Entity>,
    pub exited: Vec<Entity>,
    /// In range on both ticks
    pub retained: Vec<Entity>,
}

/// Entities other than `viewer` within the AOI radius of `position`. Sorted.
///
/// The locator query is cell-accurate; the squared-distance check against
/// each candidate's center makes the result exact.
pub fn visible_entities(
    config: &AoiConfig,
    viewer: Entity,
    position: Vec3,
    locator: &EntityLocator,
) -> Vec<Entity> {
    let radius_sq = config.radius_sq();
    CANDIDATE_BUFFER.with(|buffer_cell| {
        let mut candidates = buffer_cell.borrow_mut();
        candidates.clear();
        candidates.extend(locator.get_entities_fine(config.query_volume(position)));
        candidates
            .iter()
            .copied()
            .filter(|&entity| entity != viewer)
            .filter(|&entity| {
                locator
                    .volume_of(entity)
                    .is_some_and(|volume| volume.center.distance_sq_xy_to(position) <= radius_sq)
            })
            .collect()
    })
}

/// Merge two sorted entity lists into entered/exited/retained
pub fn diff_sorted(previous: &[Entity], current: &[Entity]) -> AoiDelta {
    let mut delta = AoiDelta::default();
    let (mut i, mut j) = (0, 0);
    while i < previous.len() && j < current.len() {
        match previous[i].cmp(&current[j]) {
            std::cmp::Ordering::Less => {
                delta.exited.push(previous[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                delta.entered.push(current[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                delta.retained.push(current[j]);
                i += 1;
                j += 1;
            }
        }
    }
    delta.exited.extend_from_slice(&previous[i..]);
    delta.entered.extend_from_slice(&current[j..]);
    delta
}
