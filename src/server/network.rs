//! Connection management for the server
//!
//! An accept thread turns incoming TCP connections into sessions, each with
//! its own receive thread. Everything the simulation needs from them arrives
//! through channels polled once per tick.

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::session::{spawn_receive_thread, ClientSession, ConnectionEvent, SessionChannels, TileEditRequest};
use crate::config::ServerConfig;
use crate::game::constants::net::RECEIVE_POLL_MS;
use crate::game::{SimError, Tick};
use crate::metrics::Metrics;
use crate::net::peer::{Peer, TcpPeer};
use crate::net::{NetworkError, NetworkId};

/// Everything needed to start a session, shared with the accept thread
#[derive(Clone)]
struct SessionSpawner {
    channels: SessionChannels,
    metrics: Arc<Metrics>,
    next_id: Arc<AtomicU32>,
    active: Arc<AtomicUsize>,
    current_tick: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
    max_clients: usize,
    timeout: Duration,
}

impl SessionSpawner {
    fn spawn(&self, peer: Arc<dyn Peer>) -> Result<NetworkId, NetworkError> {
        if self.active.load(Ordering::Acquire) >= self.max_clients {
            peer.close();
            return Err(NetworkError::Disconnected);
        }

        let network_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ClientSession::new(
            network_id,
            peer,
            self.current_tick.load(Ordering::Acquire),
        ));
        self.active.fetch_add(1, Ordering::AcqRel);
        Metrics::add(&self.metrics.connections_total, 1);

        // Connected goes out before the receive thread can report a disconnect
        let _ = self.channels.events.send(ConnectionEvent::Connected(session.clone()));
        if let Err(e) = spawn_receive_thread(
            session.clone(),
            self.channels.clone(),
            self.metrics.clone(),
            self.timeout,
            self.shutdown.clone(),
        ) {
            session.close();
            let _ = self.channels.events.send(ConnectionEvent::Disconnected(network_id));
            return Err(e);
        }
        Ok(network_id)
    }
}

pub struct ServerNetwork {
    spawner: SessionSpawner,
    events: Receiver<ConnectionEvent>,
    dropped_inputs: Receiver<NetworkId>,
    tile_requests: Receiver<TileEditRequest>,
    /// Sessions the simulation has seen connect
    sessions: HashMap<NetworkId, Arc<ClientSession>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerNetwork {
    pub fn new(config: &ServerConfig, metrics: Arc<Metrics>) -> Self {
        let (events_tx, events) = unbounded();
        let (dropped_tx, dropped_inputs): (Sender<NetworkId>, _) = unbounded();
        let (tile_tx, tile_requests) = unbounded();
        Self {
            spawner: SessionSpawner {
                channels: SessionChannels {
                    events: events_tx,
                    dropped_inputs: dropped_tx,
                    tile_requests: tile_tx,
                },
                metrics,
                next_id: Arc::new(AtomicU32::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                current_tick: Arc::new(AtomicU32::new(0)),
                shutdown: Arc::new(AtomicBool::new(false)),
                max_clients: config.max_clients,
                timeout: config.connection_timeout,
            },
            events,
            dropped_inputs,
            tile_requests,
            sessions: HashMap::new(),
            accept_thread: None,
        }
    }

    /// Bind the listener and start accepting connections
    pub fn listen(&mut self, address: SocketAddr) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_address = listener.local_addr()?;
        info!("Listening for clients on {}", local_address);

        let spawner = self.spawner.clone();
        let handle = std::thread::Builder::new()
            .name("accept".to_string())
            .spawn(move || accept_loop(listener, spawner))?;
        self.accept_thread = Some(handle);
        Ok(local_address)
    }

    /// Start a session over an already-connected peer
    pub fn add_peer(&self, peer: Arc<dyn Peer>) -> Result<NetworkId, NetworkError> {
        self.spawner.spawn(peer)
    }

    /// Tick the simulation is on, used to seed new sessions
    pub fn set_current_tick(&self, tick: Tick) {
        self.spawner.current_tick.store(tick, Ordering::Release);
    }

    /// Drain connection events, updating the session map
    pub fn poll_connection_events(&mut self) -> Vec<ConnectionEvent> {
        let events: Vec<ConnectionEvent> = self.events.try_iter().collect();
        for event in &events {
            match event {
                ConnectionEvent::Connected(session) => {
                    self.sessions.insert(session.network_id(), session.clone());
                }
                ConnectionEvent::Disconnected(network_id) => {
                    if let Some(session) = self.sessions.remove(network_id) {
                        session.join_receive_thread();
                    }
                    self.spawner.active.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        self.spawner
            .metrics
            .connections_active
            .store(self.sessions.len() as u64, Ordering::Relaxed);
        events
    }

    pub fn poll_dropped_inputs(&self) -> Vec<NetworkId> {
        self.dropped_inputs.try_iter().collect()
    }

    pub fn poll_tile_requests(&self) -> Vec<TileEditRequest> {
        self.tile_requests.try_iter().collect()
    }

    pub fn session(&self, network_id: NetworkId) -> Option<&Arc<ClientSession>> {
        self.sessions.get(&network_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send every started session's queued messages, confirming ticks up to
    /// `latest_processed`. A session whose send fails is closed, unless the
    /// batch could not be framed within the wire limits at all.
    pub fn send_all(&self, latest_processed: Tick) -> Result<(), SimError> {
        let metrics = &self.spawner.metrics;
        for session in self.sessions.values() {
            if !session.is_started() || !session.is_connected() {
                continue;
            }
            match session.send_queued(latest_processed) {
                Ok(Some(sent)) => {
                    Metrics::add(&metrics.messages_sent, sent.stats.messages as u64);
                    Metrics::add(&metrics.bytes_sent, sent.stats.bytes as u64);
                    Metrics::add(&metrics.batches_sent, sent.stats.batches as u64);
                    Metrics::add(&metrics.batches_compressed, sent.stats.compressed_batches as u64);
                    if sent.adjustment != 0 {
                        Metrics::add(&metrics.tick_adjustments_sent, 1);
                    }
                }
                Ok(None) => {}
                Err(e @ (NetworkError::BatchTooLarge(..) | NetworkError::MessageTooLarge(..))) => {
                    return Err(SimError::OversizedBatch {
                        network_id: session.network_id(),
                        source: e,
                    });
                }
                Err(e) => {
                    if e.is_desync() {
                        Metrics::add(&metrics.desync_disconnects, 1);
                    }
                    warn!("Send to client {} failed: {}, closing connection", session.network_id(), e);
                    session.close();
                }
            }
        }
        Ok(())
    }

    /// Close every connection and wait for the network threads
    pub fn shutdown(&mut self) {
        self.spawner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
        self.poll_connection_events();
        for session in self.sessions.values() {
            session.close();
        }
        for (_, session) in self.sessions.drain() {
            session.join_receive_thread();
        }
        info!("Network shut down");
    }
}

impl Drop for ServerNetwork {
    fn drop(&mut self) {
        if !self.spawner.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn accept_loop(listener: TcpListener, spawner: SessionSpawner) {
    while !spawner.shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, address)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Failed to configure connection from {}: {}", address, e);
                    continue;
                }
                let peer = match TcpPeer::new(stream) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("Failed to set up connection from {}: {}", address, e);
                        continue;
                    }
                };
                match spawner.spawn(Arc::new(peer)) {
                    Ok(network_id) => info!("Client {} connected from {}", network_id, address),
                    Err(_) => warn!("Refusing connection from {}: server full", address),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(RECEIVE_POLL_MS));
            }
            Err(e) => {
                debug!("Accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(RECEIVE_POLL_MS));
            }
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::MemoryPeer;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::Instant;

    fn config(max_clients: usize) -> ServerConfig {
        ServerConfig {
            max_clients,
            ..ServerConfig::default()
        }
    }

    fn wait_for_events(network: &mut ServerNetwork, count: usize) -> Vec<ConnectionEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(network.poll_connection_events());
            std::thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn test_memory_peer_connect_and_disconnect() {
        let mut network = ServerNetwork::new(&config(4), Arc::new(Metrics::new()));
        let (server_end, client_end) = MemoryPeer::pair();
        let id = network.add_peer(Arc::new(server_end)).unwrap();

        let events = wait_for_events(&mut network, 1);
        assert!(matches!(events[0], ConnectionEvent::Connected(ref s) if s.network_id() == id));
        assert_eq!(network.session_count(), 1);

        client_end.close();
        let events = wait_for_events(&mut network, 1);
        assert!(matches!(events[0], ConnectionEvent::Disconnected(n) if n == id));
        assert_eq!(network.session_count(), 0);
        network.shutdown();
    }

    #[test]
    fn test_max_clients_enforced() {
        let network = ServerNetwork::new(&config(1), Arc::new(Metrics::new()));
        let (first, _keep_first) = MemoryPeer::pair();
        let (second, _keep_second) = MemoryPeer::pair();
        assert!(network.add_peer(Arc::new(first)).is_ok());
        assert!(network.add_peer(Arc::new(second)).is_err());
    }

    #[test]
    fn test_tcp_accept() {
        let metrics = Arc::new(Metrics::new());
        let mut network = ServerNetwork::new(&config(4), metrics.clone());
        let address = network
            .listen(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .unwrap();

        let _stream = TcpStream::connect(address).unwrap();
        let events = wait_for_events(&mut network, 1);
        assert!(matches!(events[0], ConnectionEvent::Connected(_)));
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 1);
        network.shutdown();
    }
}
