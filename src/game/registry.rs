//! Entity registry
//!
//! Entities are `(index, generation)` handles. Indices are recycled through a
//! free list, and the generation is bumped on every destroy so stale handles
//! never resolve to a new entity. Components live in sparse-set stores, one
//! per component type, all owned by `World`.

use crate::game::components::{
    ClientSimData, Collision, Input, InputHistory, Position, PreviousPosition, Velocity,
};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel in the sparse array for "no component"
const EMPTY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Reserved handle that never resolves
    pub const NULL: Entity = Entity { index: u32::MAX, generation: 0 };

    pub const fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Hands out entity handles and tracks which are alive
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: Vec<u32>,
    alive_count: usize,
}

impl EntityAllocator {
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;
        if let Some(index) = self.free.pop() {
            self.alive[index as usize] = true;
            return Entity {
                index,
                generation: self.generations[index as usize],
            };
        }

        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.alive.push(true);
        Entity { index, generation: 0 }
    }

    /// Returns false if the handle was already dead
    pub fn free(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let index = entity.index as usize;
        self.alive[index] = false;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free.push(entity.index);
        self.alive_count -= 1;
        true
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        let index = entity.index as usize;
        index < self.alive.len() && self.alive[index] && self.generations[index] == entity.generation
    }

    pub fn len(&self) -> usize {
        self.alive_count
    }

    pub fn is_empty(&self) -> bool {
        self.alive_count == 0
    }
}

/// Sparse-set component storage
///
/// `sparse[entity.index]` points into the dense arrays. Removal swaps the
/// last dense element into the hole, so iteration order is not stable.
#[derive(Debug, Clone)]
pub struct ComponentStore<T> {
    sparse: Vec<u32>,
    entities: Vec<Entity>,
    values: Vec<T>,
}

impl<T> ComponentStore<T> {
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            entities: Vec::new(),
            values: Vec::new(),
        }
    }

    #[inline]
    fn dense_index(&self, entity: Entity) -> Option<usize> {
        let slot = *self.sparse.get(entity.index as usize)?;
        if slot == EMPTY {
            return None;
        }
        let slot = slot as usize;
        (self.entities[slot] == entity).then_some(slot)
    }

    /// Attach (or replace) the component. Returns the previous value.
    pub fn insert(&mut self, entity: Entity, value: T) -> Option<T> {
        if let Some(slot) = self.dense_index(entity) {
            return Some(std::mem::replace(&mut self.values[slot], value));
        }

        // A stale handle for the same index may still own the slot
        self.remove_index(entity.index);

        let index = entity.index as usize;
        if index >= self.sparse.len() {
            self.sparse.resize(index + 1, EMPTY);
        }
        self.sparse[index] = self.entities.len() as u32;
        self.entities.push(entity);
        self.values.push(value);
        None
    }

    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        let slot = self.dense_index(entity)?;
        Some(self.remove_slot(slot))
    }

    fn remove_index(&mut self, index: u32) {
        if let Some(&slot) = self.sparse.get(index as usize) {
            if slot != EMPTY {
                self.remove_slot(slot as usize);
            }
        }
    }

    fn remove_slot(&mut self, slot: usize) -> T {
        let removed = self.entities[slot];
        let last = self.entities.len() - 1;
        if slot != last {
            let moved = self.entities[last];
            self.sparse[moved.index as usize] = slot as u32;
        }
        self.sparse[removed.index as usize] = EMPTY;
        self.entities.swap_remove(slot);
        self.values.swap_remove(slot)
    }

    #[inline]
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.dense_index(entity).map(|slot| &self.values[slot])
    }

    #[inline]
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        self.dense_index(entity).map(move |slot| &mut self.values[slot])
    }

    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.dense_index(entity).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.entities.iter().copied().zip(self.values.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Entity, &mut T)> + '_ {
        self.entities.iter().copied().zip(self.values.iter_mut())
    }

    pub fn clear(&mut self) {
        self.sparse.clear();
        self.entities.clear();
        self.values.clear();
    }
}

impl<T> Default for ComponentStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process entity registry and component stores
#[derive(Debug, Default)]
pub struct World {
    allocator: EntityAllocator,
    pub positions: ComponentStore<Position>,
    pub previous_positions: ComponentStore<PreviousPosition>,
    pub velocities: ComponentStore<Velocity>,
    pub inputs: ComponentStore<Input>,
    pub input_histories: ComponentStore<InputHistory>,
    pub collisions: ComponentStore<Collision>,
    /// Server only: per-connection state for client entities
    pub client_sims: ComponentStore<ClientSimData>,
    /// Entities whose movement state changed this tick. Cleared once per tick
    /// after every client has been updated.
    pub movement_dirty: FxHashSet<Entity>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Entity {
        self.allocator.allocate()
    }

    /// Destroy the entity and drop every component attached to it
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.allocator.free(entity) {
            return false;
        }
        self.positions.remove(entity);
        self.previous_positions.remove(entity);
        self.velocities.remove(entity);
        self.inputs.remove(entity);
        self.input_histories.remove(entity);
        self.collisions.remove(entity);
        self.client_sims.remove(entity);
        self.movement_dirty.remove(&entity);
        true
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.allocator.len()
    }

    /// Entities with every movement component (input, position, velocity)
    pub fn movers(&self) -> Vec<Entity> {
        self.inputs
            .entities()
            .iter()
            .copied()
            .filter(|entity| self.positions.contains(*entity) && self.velocities.contains(*entity))
            .collect()
    }
}
