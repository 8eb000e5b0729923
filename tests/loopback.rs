//! Server and client talking over an in-memory peer, with both loops driven
//! by hand so every tick is deterministic.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use worldsim::client::Client;
use worldsim::client::connection::ServerConnection;
use worldsim::config::ServerConfig;
use worldsim::game::components::{Input, InputState, InputType};
use worldsim::game::constants::movement::{RUN_SPEED, TIMESTEP};
use worldsim::game::spatial::TilePosition;
use worldsim::game::tile_map::{sprites, TileLayer, TileLayerType};
use worldsim::metrics::Metrics;
use worldsim::net::peer::MemoryPeer;
use worldsim::server::network::ServerNetwork;
use worldsim::server::simulation::ServerSimulation;
use worldsim::server::Server;

const TIMEOUT: Duration = Duration::from_secs(2);
const STEP: f32 = RUN_SPEED * TIMESTEP;

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct Harness {
    server: Server,
    server_metrics: Arc<Metrics>,
    client: Client,
    client_metrics: Arc<Metrics>,
}

impl Harness {
    /// Server that has already run `warmup` ticks, with one client connected
    fn new(warmup: u32) -> Self {
        let config = ServerConfig {
            world_width_tiles: 64,
            world_height_tiles: 64,
            crate_count: 0,
            ..ServerConfig::default()
        };
        let server_metrics = Arc::new(Metrics::new());
        let simulation =
            ServerSimulation::with_rng(&config, server_metrics.clone(), StdRng::seed_from_u64(3)).unwrap();
        let network = ServerNetwork::new(&config, server_metrics.clone());
        let mut server = Server::from_parts(network, simulation);
        for _ in 0..warmup {
            server.simulation.tick(&mut server.network).unwrap();
        }

        let (server_end, client_end) = MemoryPeer::pair();
        server.network.add_peer(Arc::new(server_end)).unwrap();
        step_server(&mut server, 1);

        let client_metrics = Arc::new(Metrics::new());
        let connection = ServerConnection::new(Arc::new(client_end), TIMEOUT).unwrap();
        let client = Client::from_connection(connection, client_metrics.clone(), TIMEOUT).unwrap();

        Self {
            server,
            server_metrics,
            client,
            client_metrics,
        }
    }

    fn wait_for_confirmation(&self) {
        let latest = self.server.simulation.latest_processed();
        wait_until(|| self.client.connection.latest_confirmed() == latest);
    }

    /// Send what the client queued and wait for the server to read it
    fn flush_client(&self) {
        let before = self.server_metrics.messages_received.load(Ordering::Relaxed);
        let stats = self
            .client
            .connection
            .send_pending(self.client.simulation.current_tick)
            .unwrap();
        let expected = before + stats.messages as u64;
        wait_until(|| self.server_metrics.messages_received.load(Ordering::Relaxed) >= expected);
    }

    fn client_ticks(&mut self, count: u32, input: Input) {
        for _ in 0..count {
            self.client.simulation.tick(&self.client.connection, input).unwrap();
        }
    }

    fn server_entity_x(&self) -> f32 {
        let (_, &entity) = self.server.simulation.clients.iter().next().unwrap();
        self.server.simulation.world.positions.get(entity).unwrap().0.x
    }
}

fn step_server(server: &mut Server, ticks: u32) {
    for _ in 0..ticks {
        server.simulation.tick(&mut server.network).unwrap();
    }
    server.network.send_all(server.simulation.latest_processed()).unwrap();
}

#[test]
fn test_connect_streams_map() {
    let mut h = Harness::new(5);
    let sim = &h.client.simulation;
    // Spawned on tick 5, running ahead by the target lead
    assert_eq!(sim.current_tick, 8);
    assert_eq!(sim.tile_map.extent(), h.server.simulation.tile_map.extent());

    h.wait_for_confirmation();
    h.client_ticks(1, Input::default());

    let player_tile = TilePosition::from_world(h.client.simulation.player_position().unwrap().0);
    assert!(h.client.simulation.changed_tiles.contains(&player_tile));
    assert_eq!(
        h.client.simulation.tile_map.get(player_tile),
        h.server.simulation.tile_map.get(player_tile)
    );
    // Border walls near the player arrive with their collision
    assert!(!h.client.simulation.collision_locator.is_empty());
}

#[test]
fn test_predicted_movement_matches_server() {
    let mut h = Harness::new(5);
    h.wait_for_confirmation();

    // Walk toward the middle of the map so no wall gets in the way
    let start_x = h.client.simulation.player_position().unwrap().0.x;
    let center_x = h.server.simulation.tile_map.extent().world_bounds().center().x;
    let (direction, sign) = if start_x < center_x {
        (InputType::XUp, 1.0)
    } else {
        (InputType::XDown, -1.0)
    };
    let mut input = Input::default();
    input.set(direction, InputState::Pressed);

    // Client tick 8 carries the key press
    h.client_ticks(1, input);
    h.flush_client();
    h.client_ticks(7, input);

    // Server runs ticks 6..=12
    step_server(&mut h.server, 7);
    assert!((h.server_entity_x() - (start_x + sign * 5.0 * STEP)).abs() < 1e-3);

    h.wait_for_confirmation();
    h.client_ticks(1, input);

    let predicted_x = h.client.simulation.player_position().unwrap().0.x;
    assert!((predicted_x - (start_x + sign * 9.0 * STEP)).abs() < 1e-3);
    assert_eq!(h.client_metrics.mispredictions.load(Ordering::Relaxed), 0);
}

#[test]
fn test_late_input_is_corrected() {
    let mut h = Harness::new(5);
    h.wait_for_confirmation();
    let start_x = h.client.simulation.player_position().unwrap().0.x;
    let center_x = h.server.simulation.tile_map.extent().world_bounds().center().x;
    let direction = if start_x < center_x { InputType::XUp } else { InputType::XDown };
    let mut input = Input::default();
    input.set(direction, InputState::Pressed);

    // Press on tick 8 but hold the message back until the server is past it
    h.client_ticks(8, input);
    step_server(&mut h.server, 5);
    h.flush_client();

    // Server tick 11 resets the dropped input and reports the neutral state
    step_server(&mut h.server, 1);
    assert_eq!(h.server_metrics.inputs_dropped.load(Ordering::Relaxed), 1);
    assert!((h.server_entity_x() - start_x).abs() < 1e-3);

    h.wait_for_confirmation();
    h.client_ticks(1, input);
    assert_eq!(h.client_metrics.mispredictions.load(Ordering::Relaxed), 1);

    // Everything from tick 11 on is replayed with the server's input
    let sim = &h.client.simulation;
    assert!((sim.player_position().unwrap().0.x - start_x).abs() < 1e-3);
    let history = &sim.world.input_histories.get(sim.player).unwrap().0;
    assert!((0..=5).all(|ticks_ago| history[ticks_ago].is_neutral()));
    assert_eq!(history[6], input);
}

#[test]
fn test_tile_request_round_trip() {
    let mut h = Harness::new(5);
    h.wait_for_confirmation();
    h.client_ticks(1, Input::default());

    let player_tile = TilePosition::from_world(h.client.simulation.player_position().unwrap().0);
    let layers = vec![
        TileLayer::new(TileLayerType::Floor, sprites::GRASS),
        TileLayer::new(TileLayerType::Object, sprites::CRATE),
    ];
    let target = TilePosition::new(player_tile.x, player_tile.y + 1, player_tile.z);
    h.client
        .simulation
        .request_tile_update(&h.client.connection, target, layers.clone())
        .unwrap();
    h.flush_client();

    step_server(&mut h.server, 1);
    h.wait_for_confirmation();
    h.client_ticks(1, Input::default());

    let tile = h.client.simulation.tile_map.get(target).unwrap();
    assert_eq!(tile.layers.to_vec(), layers);
    assert_eq!(h.client.simulation.changed_tiles, vec![target]);
}
