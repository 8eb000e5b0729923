//! Client side of the wire session
//!
//! A receive thread decodes server batches, applies the tick adjustment
//! bookkeeping, and routes messages into per-system channels. Confirmation
//! of a batch's ticks is published only after its messages are routed, so
//! anything at or before `latest_confirmed` is already in a channel.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::game::constants::net::RECEIVE_POLL_MS;
use crate::game::registry::Entity;
use crate::game::spatial::TilePosition;
use crate::game::tile_map::{ChunkSnapshot, TileLayer};
use crate::game::Tick;
use crate::net::framing::{decompress_payload, split_messages, ServerHeader};
use crate::net::peer::{Peer, TcpPeer};
use crate::net::protocol::{ClientMessage, ConnectionResponse, Heartbeat, MovementState, ServerMessage};
use crate::net::receiver::BatchReceiver;
use crate::net::sender::{send_client_batches, MessageQueue, SendStats};
use crate::net::tick_sync::TickAdjustmentReceiver;
use crate::net::NetworkError;

/// Authoritative state of this client's own entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerUpdate {
    pub tick: Tick,
    pub state: MovementState,
}

/// Authoritative states of other entities on one tick
#[derive(Debug, Clone, PartialEq)]
pub struct NpcUpdate {
    pub tick: Tick,
    pub states: Vec<MovementState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifetimeEvent {
    Init(Vec<MovementState>),
    Delete(Vec<Entity>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TileChange {
    Chunk(ChunkSnapshot),
    Tile { tile: TilePosition, layers: Vec<TileLayer> },
}

struct RouteSenders {
    response: Sender<ConnectionResponse>,
    player: Sender<PlayerUpdate>,
    npcs: Sender<NpcUpdate>,
    lifetime: Sender<LifetimeEvent>,
    tiles: Sender<TileChange>,
}

/// Receiving ends the client simulation drains each tick
#[derive(Debug)]
pub struct ClientChannels {
    pub player: Receiver<PlayerUpdate>,
    pub npcs: Receiver<NpcUpdate>,
    pub lifetime: Receiver<LifetimeEvent>,
    pub tiles: Receiver<TileChange>,
}

/// State shared between the receive thread and the simulation thread
struct SharedState {
    adjustment: TickAdjustmentReceiver,
    latest_confirmed: AtomicU32,
    client_tick: AtomicU32,
    shutdown: AtomicBool,
    error: Mutex<Option<NetworkError>>,
}

pub struct ServerConnection {
    peer: Arc<dyn Peer>,
    shared: Arc<SharedState>,
    outbound: MessageQueue,
    response: Receiver<ConnectionResponse>,
    pub channels: ClientChannels,
    receive_thread: Option<JoinHandle<()>>,
}

impl ServerConnection {
    pub fn connect(config: &ClientConfig) -> Result<Self, NetworkError> {
        info!("Connecting to {}", config.server_address);
        let peer = TcpPeer::connect(config.server_address, config.connection_timeout)?;
        Self::new(Arc::new(peer), config.connection_timeout)
    }

    /// Start the receive thread over an already-connected peer
    pub fn new(peer: Arc<dyn Peer>, timeout: Duration) -> Result<Self, NetworkError> {
        let (response_tx, response) = unbounded();
        let (player_tx, player) = unbounded();
        let (npcs_tx, npcs) = unbounded();
        let (lifetime_tx, lifetime) = unbounded();
        let (tiles_tx, tiles) = unbounded();
        let senders = RouteSenders {
            response: response_tx,
            player: player_tx,
            npcs: npcs_tx,
            lifetime: lifetime_tx,
            tiles: tiles_tx,
        };

        let shared = Arc::new(SharedState {
            adjustment: TickAdjustmentReceiver::new(),
            latest_confirmed: AtomicU32::new(0),
            client_tick: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let thread_peer = peer.clone();
        let thread_shared = shared.clone();
        let receive_thread = std::thread::Builder::new()
            .name("server-recv".to_string())
            .spawn(move || receive_loop(thread_peer, thread_shared, senders, timeout))?;

        Ok(Self {
            peer,
            shared,
            outbound: MessageQueue::new(),
            response,
            channels: ClientChannels { player, npcs, lifetime, tiles },
            receive_thread: Some(receive_thread),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Block until the server assigns our entity
    pub fn wait_for_response(&self, timeout: Duration) -> Result<ConnectionResponse, NetworkError> {
        match self.response.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(NetworkError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.take_error().unwrap_or(NetworkError::Disconnected)),
        }
    }

    /// Latest server tick whose messages have all been received
    pub fn latest_confirmed(&self) -> Tick {
        self.shared.latest_confirmed.load(Ordering::Acquire)
    }

    /// Tick the client simulation is on, for diff diagnostics
    pub fn set_client_tick(&self, tick: Tick) {
        self.shared.client_tick.store(tick, Ordering::Release);
    }

    /// Tick adjustment received since the last call. Outgoing batches
    /// report the matching iteration from now on.
    pub fn take_adjustment(&self) -> i32 {
        self.shared.adjustment.take_pending()
    }

    /// Mean of recent `server tick - client tick` samples
    pub fn mean_tick_diff(&self) -> Option<i32> {
        self.shared.adjustment.mean_diff()
    }

    /// Error that ended the receive thread, if any
    pub fn take_error(&self) -> Option<NetworkError> {
        self.shared.error.lock().take()
    }

    pub fn queue(&self, message: &ClientMessage) -> Result<(), NetworkError> {
        self.outbound.push(message.encode()?);
        Ok(())
    }

    /// Send queued messages, or a heartbeat if there are none
    pub fn send_pending(&self, client_tick: Tick) -> Result<SendStats, NetworkError> {
        let mut messages = self.outbound.drain();
        if messages.is_empty() {
            messages.push(ClientMessage::Heartbeat(Heartbeat { tick: client_tick }).encode()?);
        }
        send_client_batches(self.peer.as_ref(), messages, self.shared.adjustment.iteration())
    }

    pub fn close(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.peer.close();
        if let Some(handle) = self.receive_thread.take() {
            if handle.join().is_err() {
                warn!("Server receive thread panicked");
            }
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(peer: Arc<dyn Peer>, shared: Arc<SharedState>, senders: RouteSenders, timeout: Duration) {
    let mut receiver = BatchReceiver::<ServerHeader>::new(peer, timeout, Duration::from_millis(RECEIVE_POLL_MS));
    let mut player: Option<Entity> = None;

    while !shared.shutdown.load(Ordering::Acquire) && receiver.is_connected() {
        match receiver.receive() {
            Ok(Some(batch)) => {
                let header = batch.header;
                if let Err(e) = handle_batch(header, batch.payload, &shared, &senders, &mut player) {
                    warn!("Dropping server connection: {}", e);
                    *shared.error.lock() = Some(e);
                    receiver.disconnect();
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Server receive ended: {}", e);
                *shared.error.lock() = Some(e);
                break;
            }
        }
    }
    receiver.disconnect();
    info!("Disconnected from server");
}

fn handle_batch(
    header: ServerHeader,
    payload: &[u8],
    shared: &SharedState,
    senders: &RouteSenders,
    player: &mut Option<Entity>,
) -> Result<(), NetworkError> {
    shared
        .adjustment
        .receive(header.tick_adjustment, header.adjustment_iteration)?;

    let raw = decompress_payload(payload, header.compressed)?;
    let client_tick = shared.client_tick.load(Ordering::Acquire);
    for (message_type, bytes) in split_messages(&raw, header.message_count)? {
        let message = ServerMessage::decode(message_type, bytes)?;
        if let Some(tick) = message.tick() {
            shared.adjustment.record_diff(tick.wrapping_sub(client_tick) as i32);
        }
        route(message, shared, senders, player);
    }

    shared
        .latest_confirmed
        .fetch_add(header.confirmed_tick_count as u32, Ordering::AcqRel);
    Ok(())
}

fn route(message: ServerMessage, shared: &SharedState, senders: &RouteSenders, player: &mut Option<Entity>) {
    // The simulation may already be gone during shutdown
    match message {
        ServerMessage::ExplicitConfirmation => {}
        ServerMessage::ConnectionResponse(response) => {
            *player = Some(response.entity);
            shared
                .latest_confirmed
                .store(response.tick.wrapping_sub(1), Ordering::Release);
            let _ = senders.response.send(response);
        }
        ServerMessage::MovementUpdate(update) => {
            let (own, others): (Vec<MovementState>, Vec<MovementState>) = update
                .states
                .into_iter()
                .partition(|state| Some(state.entity) == *player);
            for state in own {
                let _ = senders.player.send(PlayerUpdate { tick: update.tick, state });
            }
            if !others.is_empty() {
                let _ = senders.npcs.send(NpcUpdate { tick: update.tick, states: others });
            }
        }
        ServerMessage::EntityInit(init) => {
            let _ = senders.lifetime.send(LifetimeEvent::Init(init.states));
        }
        ServerMessage::EntityDelete(delete) => {
            let _ = senders.lifetime.send(LifetimeEvent::Delete(delete.entities));
        }
        ServerMessage::ChunkUpdate(chunk) => {
            let _ = senders.tiles.send(TileChange::Chunk(chunk.snapshot));
        }
        ServerMessage::TileUpdate(update) => {
            let _ = senders.tiles.send(TileChange::Tile {
                tile: update.tile,
                layers: update.layers,
            });
        }
    }
}
