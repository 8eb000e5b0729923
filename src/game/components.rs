//! Component types stored in the `World`

use crate::game::constants::movement::{PLAYER_HEIGHT, PLAYER_RADIUS};
use crate::game::constants::sync::INPUT_HISTORY_LENGTH;
use crate::game::registry::Entity;
use crate::game::spatial::{BoundingBox, ChunkExtent, Cylinder};
use crate::net::NetworkId;
use crate::util::circular_buffer::CircularBuffer;
use crate::util::vec3::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position(pub Vec3);

/// Position at the start of this tick's movement step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviousPosition(pub Vec3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity(pub Vec3);

/// Movement keys, one pair per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InputType {
    XUp = 0,
    XDown = 1,
    YUp = 2,
    YDown = 3,
    ZUp = 4,
    ZDown = 5,
}

impl InputType {
    pub const COUNT: usize = 6;

    pub const ALL: [InputType; Self::COUNT] = [
        InputType::XUp,
        InputType::XDown,
        InputType::YUp,
        InputType::YDown,
        InputType::ZUp,
        InputType::ZDown,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputState {
    #[default]
    Released,
    Pressed,
}

/// Key states for one entity. `Default` is the neutral (all released) state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Input {
    pub states: [InputState; InputType::COUNT],
}

impl Input {
    #[inline]
    pub fn get(&self, input_type: InputType) -> InputState {
        self.states[input_type as usize]
    }

    #[inline]
    pub fn set(&mut self, input_type: InputType, state: InputState) {
        self.states[input_type as usize] = state;
    }

    #[inline]
    pub fn is_pressed(&self, input_type: InputType) -> bool {
        self.get(input_type) == InputState::Pressed
    }

    pub fn is_neutral(&self) -> bool {
        self.states.iter().all(|state| *state == InputState::Released)
    }

    /// Keys whose state differs from `other`, with this input's state
    pub fn changes_from(&self, other: &Input) -> impl Iterator<Item = (InputType, InputState)> + '_ {
        let other = *other;
        InputType::ALL
            .into_iter()
            .filter(move |input_type| self.get(*input_type) != other.get(*input_type))
            .map(move |input_type| (input_type, self.get(input_type)))
    }
}

/// Inputs of the last `INPUT_HISTORY_LENGTH` ticks, index 0 = current tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputHistory(pub CircularBuffer<Input, INPUT_HISTORY_LENGTH>);

/// Collision shape and the derived world-space volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collision {
    /// Bounds relative to the entity's position
    pub model_bounds: BoundingBox,
    /// Radius of the upright cylinder used for entity queries
    pub radius: f32,
    pub height: f32,
    /// `model_bounds` moved to the current position
    pub world_bounds: BoundingBox,
}

impl Collision {
    pub fn new(radius: f32, height: f32, position: Vec3) -> Self {
        let model_bounds = BoundingBox::new(
            Vec3::new(-radius, -radius, 0.0),
            Vec3::new(radius, radius, height),
        );
        Self {
            model_bounds,
            radius,
            height,
            world_bounds: model_bounds.translated(position),
        }
    }

    pub fn player(position: Vec3) -> Self {
        Self::new(PLAYER_RADIUS, PLAYER_HEIGHT, position)
    }

    pub fn update_world_bounds(&mut self, position: Vec3) {
        self.world_bounds = self.model_bounds.translated(position);
    }

    /// Cylinder registered in the entity locator
    pub fn cylinder(&self, position: Vec3) -> Cylinder {
        Cylinder::new(position, self.radius, self.height)
    }
}

/// Server-side state of a connected client's entity
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSimData {
    pub network_id: NetworkId,
    /// Entities the client currently knows about, sorted
    pub entities_in_aoi: Vec<Entity>,
    /// Chunks already streamed to the client (3x3 around its last chunk)
    pub streamed_chunks: Option<ChunkExtent>,
    /// An input from this client was dropped; resend its own state
    pub input_was_dropped: bool,
}

impl ClientSimData {
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            entities_in_aoi: Vec::new(),
            streamed_chunks: None,
            input_was_dropped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_input_is_neutral() {
        let mut input = Input::default();
        assert!(input.is_neutral());
        input.set(InputType::YDown, InputState::Pressed);
        assert!(!input.is_neutral());
        assert!(input.is_pressed(InputType::YDown));
        assert!(!input.is_pressed(InputType::YUp));
    }

    #[test]
    fn test_changes_from() {
        let old = Input::default();
        let mut new = old;
        new.set(InputType::XUp, InputState::Pressed);
        new.set(InputType::ZDown, InputState::Pressed);
        let changes: Vec<_> = new.changes_from(&old).collect();
        assert_eq!(
            changes,
            vec![
                (InputType::XUp, InputState::Pressed),
                (InputType::ZDown, InputState::Pressed)
            ]
        );
        assert_eq!(old.changes_from(&old).count(), 0);
    }

    #[test]
    fn test_collision_follows_position() {
        let mut collision = Collision::new(4.0, 10.0, Vec3::ZERO);
        collision.update_world_bounds(Vec3::new(100.0, 50.0, 0.0));
        assert_eq!(collision.world_bounds.min, Vec3::new(96.0, 46.0, 0.0));
        assert_eq!(collision.world_bounds.max, Vec3::new(104.0, 54.0, 10.0));
    }
}
