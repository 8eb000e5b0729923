//! Server-side state of one client connection
//!
//! The session's receive thread decodes client batches, feeds tick diffs to
//! the adjustment protocol and sorts inputs by tick. The simulation thread
//! drains the sorted inputs and queues outbound messages, which the network
//! task sends once per network tick.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::game::components::{Input, InputState, InputType};
use crate::game::constants::net::RECEIVE_POLL_MS;
use crate::game::constants::sync::SEQUENCER_WINDOW;
use crate::game::spatial::TilePosition;
use crate::game::tile_map::TileLayer;
use crate::game::Tick;
use crate::metrics::Metrics;
use crate::net::framing::{decompress_payload, split_messages, ClientHeader};
use crate::net::input_sequencer::SyncTickSorter;
use crate::net::peer::Peer;
use crate::net::protocol::{ClientMessage, ServerMessage};
use crate::net::receiver::BatchReceiver;
use crate::net::sender::{
    confirmation_count, ensure_confirmation, send_server_batches, AdjustmentInfo, MessageQueue, SendStats,
};
use crate::net::tick_sync::TickAdjustmentSender;
use crate::net::{NetworkError, NetworkId};

/// Input change parked in the sequencer until its tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCommand {
    Replace(Input),
    Change(InputType, InputState),
}

impl InputCommand {
    pub fn apply(&self, input: &mut Input) {
        match *self {
            InputCommand::Replace(new_input) => *input = new_input,
            InputCommand::Change(input_type, state) => input.set(input_type, state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEditRequest {
    pub network_id: NetworkId,
    pub tile: TilePosition,
    pub layers: Vec<TileLayer>,
}

/// Connection lifecycle, in the order it happened
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(Arc<ClientSession>),
    Disconnected(NetworkId),
}

/// Where the receive thread reports what it can't handle itself
#[derive(Debug, Clone)]
pub struct SessionChannels {
    pub events: Sender<ConnectionEvent>,
    pub dropped_inputs: Sender<NetworkId>,
    pub tile_requests: Sender<TileEditRequest>,
}

pub struct ClientSession {
    network_id: NetworkId,
    peer: Arc<dyn Peer>,
    pub inputs: SyncTickSorter<InputCommand, SEQUENCER_WINDOW>,
    tick_adjustment: TickAdjustmentSender,
    outbound: MessageQueue,
    /// Latest tick the client has been told is complete
    last_confirmed: AtomicU32,
    /// Set once the simulation has spawned the client's entity
    started: AtomicBool,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("network_id", &self.network_id)
            .field("connected", &self.peer.is_connected())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// What one network tick sent to a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSend {
    pub stats: SendStats,
    pub adjustment: i8,
}

impl ClientSession {
    pub fn new(network_id: NetworkId, peer: Arc<dyn Peer>, current_tick: Tick) -> Self {
        Self {
            network_id,
            peer,
            inputs: SyncTickSorter::new(current_tick),
            tick_adjustment: TickAdjustmentSender::new(),
            outbound: MessageQueue::new(),
            last_confirmed: AtomicU32::new(current_tick.wrapping_sub(1)),
            started: AtomicBool::new(false),
            receive_thread: Mutex::new(None),
        }
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Called by the simulation when it spawns the client's entity at `tick`.
    /// Ticks before it are never confirmed to this client.
    pub fn start(&self, tick: Tick) {
        self.inputs.set_current_tick(tick);
        self.last_confirmed.store(tick.wrapping_sub(1), Ordering::Release);
        self.started.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.peer.close();
    }

    pub fn queue(&self, message: &ServerMessage) -> Result<(), NetworkError> {
        self.outbound.push(message.encode()?);
        Ok(())
    }

    pub fn queue_encoded(&self, messages: impl IntoIterator<Item = crate::net::protocol::EncodedMessage>) {
        for message in messages {
            self.outbound.push(message);
        }
    }

    /// Send everything queued, confirming ticks up to `latest_processed`.
    /// Returns `None` if there was nothing to send.
    pub fn send_queued(&self, latest_processed: Tick) -> Result<Option<SessionSend>, NetworkError> {
        let mut messages = self.outbound.drain();
        let last_confirmed = self.last_confirmed.load(Ordering::Acquire);
        let count = confirmation_count(latest_processed, last_confirmed);
        if messages.is_empty() && count == 0 {
            return Ok(None);
        }

        ensure_confirmation(&mut messages, latest_processed)?;
        let (adjustment, iteration) = self.tick_adjustment.take_adjustment()?;
        if adjustment != 0 {
            debug!(
                "Client {}: tick adjustment {} (iteration {})",
                self.network_id, adjustment, iteration
            );
        }

        let stats = send_server_batches(
            self.peer.as_ref(),
            messages,
            AdjustmentInfo { adjustment, iteration },
            count,
        )?;
        self.last_confirmed
            .store(last_confirmed.wrapping_add(count as u32), Ordering::Release);
        Ok(Some(SessionSend { stats, adjustment }))
    }

    /// Decode one client batch and route its messages
    fn handle_batch(
        &self,
        header: ClientHeader,
        payload: &[u8],
        channels: &SessionChannels,
        metrics: &Metrics,
    ) -> Result<(), NetworkError> {
        let raw = decompress_payload(payload, header.compressed)?;
        let messages = split_messages(&raw, header.message_count)?;

        for (message_type, bytes) in messages {
            let message = ClientMessage::decode(message_type, bytes)?;
            let tick = message.tick();
            let diff = tick.wrapping_sub(self.inputs.current_tick()) as i32;
            if !self.tick_adjustment.record(diff, header.adjustment_iteration) {
                trace!(
                    "Client {}: discarded diff from adjustment iteration {}",
                    self.network_id,
                    header.adjustment_iteration
                );
            }

            match message {
                ClientMessage::Heartbeat(_) => {}
                ClientMessage::ClientInput(m) => {
                    self.push_input(InputCommand::Replace(m.input), tick, channels);
                }
                ClientMessage::InputChangeRequest(m) => {
                    self.push_input(InputCommand::Change(m.input_type, m.state), tick, channels);
                }
                ClientMessage::TileUpdateRequest(m) => {
                    let _ = channels.tile_requests.send(TileEditRequest {
                        network_id: self.network_id,
                        tile: m.tile,
                        layers: m.layers,
                    });
                }
            }
            Metrics::add(&metrics.messages_received, 1);
        }
        Ok(())
    }

    fn push_input(&self, command: InputCommand, tick: Tick, channels: &SessionChannels) {
        let result = self.inputs.push(command, tick);
        if !result.is_valid() {
            warn!(
                "Client {}: dropped input for tick {} ({:?}, diff {})",
                self.network_id, tick, result.status, result.diff
            );
            let _ = channels.dropped_inputs.send(self.network_id);
        }
    }

    pub fn join_receive_thread(&self) {
        if let Some(handle) = self.receive_thread.lock().take() {
            if handle.join().is_err() {
                warn!("Receive thread for client {} panicked", self.network_id);
            }
        }
    }
}

/// Start the session's receive thread. It exits when the peer disconnects,
/// times out, or sends something that desyncs the protocol.
pub fn spawn_receive_thread(
    session: Arc<ClientSession>,
    channels: SessionChannels,
    metrics: Arc<Metrics>,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetworkError> {
    let thread_session = session.clone();
    let handle = std::thread::Builder::new()
        .name(format!("client-{}-recv", session.network_id))
        .spawn(move || {
            let session = thread_session;
            let mut receiver = BatchReceiver::<ClientHeader>::new(
                session.peer.clone(),
                timeout,
                Duration::from_millis(RECEIVE_POLL_MS),
            );

            while !shutdown.load(Ordering::Acquire) && receiver.is_connected() {
                match receiver.receive() {
                    Ok(Some(batch)) => {
                        Metrics::add(&metrics.bytes_received, batch.wire_size() as u64);
                        let header = batch.header;
                        if let Err(e) = session.handle_batch(header, batch.payload, &channels, &metrics) {
                            if e.is_desync() {
                                Metrics::add(&metrics.desync_disconnects, 1);
                            }
                            warn!("Client {}: {}, closing connection", session.network_id, e);
                            receiver.disconnect();
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("Client {}: receive ended: {}", session.network_id, e);
                        break;
                    }
                }
            }

            session.close();
            info!("Client {} disconnected", session.network_id);
            let _ = channels.events.send(ConnectionEvent::Disconnected(session.network_id));
        })?;
    *session.receive_thread.lock() = Some(handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::{BatchHeader, FrameReader, ServerHeader};
    use crate::net::peer::MemoryPeer;
    use crate::net::protocol::{ClientInput, EncodedMessage, Heartbeat, MessageType};
    use crate::net::sender::send_client_batches;
    use crossbeam_channel::{unbounded, Receiver};

    struct Harness {
        session: Arc<ClientSession>,
        remote: MemoryPeer,
        events: Receiver<ConnectionEvent>,
        dropped: Receiver<NetworkId>,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
    }

    fn harness(current_tick: Tick) -> Harness {
        let (local, remote) = MemoryPeer::pair();
        let session = Arc::new(ClientSession::new(7, Arc::new(local), current_tick));
        let (events_tx, events) = unbounded();
        let (dropped_tx, dropped) = unbounded();
        let (tile_tx, _tile_rx) = unbounded();
        let metrics = Arc::new(Metrics::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_receive_thread(
            session.clone(),
            SessionChannels {
                events: events_tx,
                dropped_inputs: dropped_tx,
                tile_requests: tile_tx,
            },
            metrics.clone(),
            Duration::from_secs(5),
            shutdown.clone(),
        )
        .unwrap();
        Harness { session, remote, events, dropped, metrics, shutdown }
    }

    fn client_input(tick: Tick) -> EncodedMessage {
        let mut input = Input::default();
        input.set(InputType::XUp, InputState::Pressed);
        ClientMessage::ClientInput(ClientInput { tick, input }).encode().unwrap()
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_inputs_sorted_by_tick() {
        let h = harness(10);
        h.session.start(10);
        send_client_batches(&h.remote, vec![client_input(11), client_input(10)], 0).unwrap();

        let deadline = std::time::Instant::now() + WAIT;
        while h.metrics.messages_received.load(Ordering::Relaxed) < 2 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(h.session.inputs.drain_and_advance().len(), 1);
        assert_eq!(h.session.inputs.drain_and_advance().len(), 1);
        assert!(h.dropped.is_empty());
        h.shutdown.store(true, Ordering::Release);
        h.session.join_receive_thread();
    }

    #[test]
    fn test_late_input_reported_as_dropped() {
        let h = harness(55);
        h.session.start(55);
        send_client_batches(&h.remote, vec![client_input(50)], 0).unwrap();
        assert_eq!(h.dropped.recv_timeout(WAIT).unwrap(), 7);
        h.shutdown.store(true, Ordering::Release);
        h.session.join_receive_thread();
    }

    #[test]
    fn test_garbage_closes_connection() {
        let h = harness(0);
        let header = ClientHeader {
            adjustment_iteration: 0,
            message_count: 1,
            batch_size: 3,
            compressed: false,
        };
        let bytes = crate::net::framing::frame_batch(&header, &[250, 0, 0]);
        h.remote.send(&bytes).unwrap();
        assert!(matches!(h.events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Disconnected(7)));
        assert!(!h.session.is_connected());
        h.session.join_receive_thread();
    }

    #[test]
    fn test_send_queued_confirms_and_appends_confirmation() {
        let (local, remote) = MemoryPeer::pair();
        let session = ClientSession::new(1, Arc::new(local), 20);
        session.start(20);
        assert!(session.send_queued(19).unwrap().is_none());

        let heartbeat = ClientMessage::Heartbeat(Heartbeat { tick: 0 }).encode().unwrap();
        // Any server-side message without the latest tick
        session.queue_encoded([EncodedMessage { tick: Some(5), ..heartbeat }]);
        let sent = session.send_queued(21).unwrap().unwrap();
        assert_eq!(sent.stats.messages, 2);

        let mut buffer = [0u8; 256];
        let n = remote.receive(&mut buffer, WAIT).unwrap();
        let header = ServerHeader::read_from(&mut FrameReader::new(&buffer[..n])).unwrap();
        assert_eq!(header.confirmed_tick_count, 2);
        assert_eq!(header.message_count(), 2);
        let payload = &buffer[ServerHeader::SIZE..n];
        let messages = split_messages(payload, 2).unwrap();
        assert_eq!(messages[1].0, MessageType::ExplicitConfirmation);

        // Nothing new: nothing sent
        assert!(session.send_queued(21).unwrap().is_none());
    }

    #[test]
    fn test_input_command_apply() {
        let mut input = Input::default();
        InputCommand::Change(InputType::YDown, InputState::Pressed).apply(&mut input);
        assert!(input.is_pressed(InputType::YDown));
        InputCommand::Replace(Input::default()).apply(&mut input);
        assert!(input.is_neutral());
    }
}
