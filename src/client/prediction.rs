//! Client-side prediction of the player entity
//!
//! The player moves locally every tick using its own input. When the server
//! reports where the player really was at an earlier tick, that state becomes
//! the new base and the ticks since are replayed from the input history. If
//! the server saw a different input than we recorded, the history is
//! corrected first so the replay uses what the server used.

use crate::client::connection::PlayerUpdate;
use crate::game::components::PreviousPosition;
use crate::game::constants::sync::INPUT_HISTORY_LENGTH;
use crate::game::movement;
use crate::game::registry::{Entity, World};
use crate::game::spatial::CollisionLocator;
use crate::game::{SimError, Tick};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionOutcome {
    /// Latest authoritative tick applied this tick
    pub corrected_from: Option<Tick>,
    pub mispredicted: bool,
}

/// Run the player's movement for `current_tick`, reconciling with any
/// authoritative `updates` first. `updates` must be in arrival order.
///
/// The player's input history must already hold this tick's input at index 0.
pub fn predict(
    world: &mut World,
    player: Entity,
    updates: &[PlayerUpdate],
    current_tick: Tick,
    last_update_tick: &mut Option<Tick>,
    locator: &CollisionLocator,
) -> Result<PredictionOutcome, SimError> {
    let World {
        positions,
        previous_positions,
        velocities,
        inputs,
        input_histories,
        collisions,
        ..
    } = world;
    let position = positions
        .get_mut(player)
        .ok_or(SimError::MissingComponent(player, "Position"))?;
    let velocity = velocities
        .get_mut(player)
        .ok_or(SimError::MissingComponent(player, "Velocity"))?;
    let input = inputs
        .get_mut(player)
        .ok_or(SimError::MissingComponent(player, "Input"))?;
    let history = &mut input_histories
        .get_mut(player)
        .ok_or(SimError::MissingComponent(player, "InputHistory"))?
        .0;
    let collision = collisions
        .get_mut(player)
        .ok_or(SimError::MissingComponent(player, "Collision"))?;

    previous_positions.insert(player, PreviousPosition(position.0));
    let mut outcome = PredictionOutcome::default();

    for update in updates {
        if let Some(previous_tick) = *last_update_tick {
            if update.tick.wrapping_sub(previous_tick) as i32 <= 0 {
                return Err(SimError::UpdateOutOfOrder {
                    tick: update.tick,
                    previous_tick,
                });
            }
        }
        let offset = current_tick.wrapping_sub(update.tick) as i32;
        if offset < 0 {
            return Err(SimError::UpdateFromFuture {
                tick: update.tick,
                current_tick,
            });
        }
        let offset = offset as usize;
        if offset >= INPUT_HISTORY_LENGTH {
            return Err(SimError::HistoryTooShort {
                update_tick: update.tick,
                current_tick,
                offset: offset as u32,
                history_length: INPUT_HISTORY_LENGTH,
            });
        }

        position.0 = update.state.position;
        velocity.0 = update.state.velocity;

        if history[offset] != update.state.input {
            for ticks_ago in 0..=offset {
                if let Some(recorded) = history.get_mut(ticks_ago) {
                    *recorded = update.state.input;
                }
            }
            *input = update.state.input;
            previous_positions.insert(player, PreviousPosition(update.state.position));
            outcome.mispredicted = true;
        }

        *last_update_tick = Some(update.tick);
        outcome.corrected_from = Some(update.tick);
    }

    // Rebuild the ticks between the authoritative state and now
    if let Some(base_tick) = outcome.corrected_from {
        let offset = current_tick.wrapping_sub(base_tick) as usize;
        for ticks_ago in (1..offset).rev() {
            let replay_input = history[ticks_ago];
            movement::step(&replay_input, position, velocity, collision, locator);
        }
    }

    let current_input = history[0];
    movement::step(&current_input, position, velocity, collision, locator);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::components::{Collision, Input, InputHistory, InputState, InputType, Position, Velocity};
    use crate::game::constants::movement::{RUN_SPEED, TIMESTEP};
    use crate::game::spatial::TileExtent;
    use crate::net::protocol::MovementState;
    use crate::util::vec3::Vec3;

    const STEP: f32 = RUN_SPEED * TIMESTEP;

    fn right() -> Input {
        let mut input = Input::default();
        input.set(InputType::XUp, InputState::Pressed);
        input
    }

    fn locator() -> CollisionLocator {
        let mut locator = CollisionLocator::new();
        locator.set_grid_size(TileExtent::new(0, 0, 0, 64, 64, 1)).unwrap();
        locator
    }

    /// Player at `x` having pressed `input` for the whole history
    fn world_with_player(x: f32, input: Input) -> (World, Entity) {
        let mut world = World::new();
        let player = world.create();
        let position = Vec3::new(x, 100.0, 0.0);
        let mut history = InputHistory::default();
        for _ in 0..INPUT_HISTORY_LENGTH {
            history.0.push(input);
        }
        world.positions.insert(player, Position(position));
        world.velocities.insert(player, Velocity::default());
        world.inputs.insert(player, input);
        world.input_histories.insert(player, history);
        world.collisions.insert(player, Collision::player(position));
        (world, player)
    }

    fn update(tick: Tick, x: f32, input: Input) -> PlayerUpdate {
        PlayerUpdate {
            tick,
            state: MovementState {
                entity: Entity::from_raw(0, 0),
                position: Vec3::new(x, 100.0, 0.0),
                velocity: Vec3::new(if input.is_pressed(InputType::XUp) { RUN_SPEED } else { 0.0 }, 0.0, 0.0),
                input,
            },
        }
    }

    fn x_of(world: &World, player: Entity) -> f32 {
        world.positions.get(player).unwrap().0.x
    }

    #[test]
    fn test_plain_prediction_steps_once() {
        let (mut world, player) = world_with_player(100.0, right());
        let mut last = None;
        let outcome = predict(&mut world, player, &[], 100, &mut last, &locator()).unwrap();
        assert_eq!(outcome, PredictionOutcome::default());
        assert!((x_of(&world, player) - (100.0 + STEP)).abs() < 1e-4);
        assert_eq!(world.previous_positions.get(player).unwrap().0.x, 100.0);
    }

    #[test]
    fn test_matching_update_replays_to_same_position() {
        // Predicted through tick 99; the server confirms tick 98
        let base = 100.0;
        let (mut world, player) = world_with_player(base + 9.0 * STEP, right());
        let mut last = None;
        let outcome = predict(
            &mut world,
            player,
            &[update(98, base + 8.0 * STEP, right())],
            100,
            &mut last,
            &locator(),
        )
        .unwrap();
        assert!(!outcome.mispredicted);
        assert_eq!(last, Some(98));
        assert!((x_of(&world, player) - (base + 10.0 * STEP)).abs() < 1e-3);
    }

    #[test]
    fn test_mismatched_input_corrects_history() {
        let base = 100.0;
        let (mut world, player) = world_with_player(base + 9.0 * STEP, right());
        let mut last = None;
        let outcome = predict(
            &mut world,
            player,
            &[update(98, base + 8.0 * STEP, Input::default())],
            100,
            &mut last,
            &locator(),
        )
        .unwrap();
        assert!(outcome.mispredicted);

        let history = &world.input_histories.get(player).unwrap().0;
        assert!((0..=2).all(|i| history[i].is_neutral()));
        assert_eq!(history[3], right());
        assert!(world.inputs.get(player).unwrap().is_neutral());
        assert_eq!(world.previous_positions.get(player).unwrap().0.x, base + 8.0 * STEP);
        // Released from tick 98 on: no movement after the corrected base
        assert!((x_of(&world, player) - (base + 8.0 * STEP)).abs() < 1e-3);
    }

    #[test]
    fn test_replay_matches_forward_simulation() {
        let locator = locator();
        let (mut world, player) = world_with_player(300.0, right());
        // Alternate inputs in the history
        {
            let history = &mut world.input_histories.get_mut(player).unwrap().0;
            for i in 0..INPUT_HISTORY_LENGTH {
                if i % 3 == 0 {
                    history[i] = Input::default();
                }
            }
        }
        let history = world.input_histories.get(player).unwrap().0.clone();

        let corrected = update(90, 200.0, history[10]);
        let mut last = None;
        predict(&mut world, player, &[corrected], 100, &mut last, &locator).unwrap();

        // Forward from the corrected state through ticks 91..=100
        let mut position = Position(corrected.state.position);
        let mut velocity = Velocity(corrected.state.velocity);
        let mut collision = Collision::player(position.0);
        for ticks_ago in (0..10).rev() {
            movement::step(&history[ticks_ago], &mut position, &mut velocity, &mut collision, &locator);
        }
        assert!(world.positions.get(player).unwrap().0.approx_eq(position.0, 1e-4));
    }

    #[test]
    fn test_out_of_order_and_future_updates_are_fatal() {
        let (mut world, player) = world_with_player(100.0, right());
        let mut last = Some(95);
        let err = predict(&mut world, player, &[update(95, 100.0, right())], 100, &mut last, &locator());
        assert!(matches!(err, Err(SimError::UpdateOutOfOrder { tick: 95, previous_tick: 95 })));

        let mut last = None;
        let err = predict(&mut world, player, &[update(101, 100.0, right())], 100, &mut last, &locator());
        assert!(matches!(err, Err(SimError::UpdateFromFuture { .. })));
    }

    #[test]
    fn test_history_too_short_is_fatal() {
        let (mut world, player) = world_with_player(100.0, right());
        let mut last = None;
        let stale = 100 - INPUT_HISTORY_LENGTH as Tick;
        let err = predict(&mut world, player, &[update(stale, 100.0, right())], 100, &mut last, &locator());
        assert!(matches!(err, Err(SimError::HistoryTooShort { offset: 20, .. })));
    }
}
