//! Inbound batch composition
//!
//! Reads a header, then exactly the payload bytes it announces. Payloads
//! below the small-message threshold land in a fixed buffer; larger ones are
//! composed across receive calls in a pooled buffer, which is returned to
//! the pool on the call after the batch was handed out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::framing::{BatchHeader, FrameReader};
use super::peer::Peer;
use super::NetworkError;
use crate::game::constants::net::{LARGE_BUFFER_POOL_SIZE, SMALL_MESSAGE_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Disconnected,
    ConnectedIdle,
    ReceivingHeader { received: usize },
    ReceivingSmall { received: usize },
    ReceivingLarge { composition_index: usize },
}

/// Recycles large-message buffers
#[derive(Debug, Default)]
struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    fn acquire(&mut self, size: usize) -> Vec<u8> {
        let mut buffer = self.free.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(size, 0);
        buffer
    }

    fn release(&mut self, buffer: Vec<u8>) {
        if self.free.len() < LARGE_BUFFER_POOL_SIZE {
            self.free.push(buffer);
        }
    }
}

/// A complete batch, borrowed from the receiver until the next call
#[derive(Debug)]
pub struct ReceivedBatch<'a, H> {
    pub header: H,
    pub payload: &'a [u8],
}

impl<H: BatchHeader> ReceivedBatch<'_, H> {
    pub fn wire_size(&self) -> usize {
        H::SIZE + self.payload.len()
    }
}

pub struct BatchReceiver<H: BatchHeader> {
    peer: Option<Arc<dyn Peer>>,
    state: ReceiveState,
    header_bytes: Vec<u8>,
    header: Option<H>,
    small_buffer: Vec<u8>,
    large_buffer: Option<Vec<u8>>,
    pool: BufferPool,
    release_pending: bool,
    timeout: Duration,
    poll_interval: Duration,
    last_received: Instant,
}

impl<H: BatchHeader + Copy> BatchReceiver<H> {
    pub fn new(peer: Arc<dyn Peer>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            peer: Some(peer),
            state: ReceiveState::ConnectedIdle,
            header_bytes: vec![0; H::SIZE],
            header: None,
            small_buffer: vec![0; SMALL_MESSAGE_THRESHOLD],
            large_buffer: None,
            pool: BufferPool::default(),
            release_pending: false,
            timeout,
            poll_interval,
            last_received: Instant::now(),
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Also enforces the receive timeout, dropping a silent peer
    pub fn is_connected(&mut self) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };
        if !peer.is_connected() {
            self.disconnect();
            return false;
        }
        if self.last_received.elapsed() > self.timeout {
            warn!("No data received for {:?}, dropping connection", self.timeout);
            self.disconnect();
            return false;
        }
        true
    }

    pub fn disconnect(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        self.state = ReceiveState::Disconnected;
        self.header = None;
        if let Some(buffer) = self.large_buffer.take() {
            self.pool.release(buffer);
        }
    }

    fn read(&mut self, peer: &dyn Peer, target: Target, from: usize, to: usize) -> Result<usize, NetworkError> {
        let buffer = match target {
            Target::Header => &mut self.header_bytes[from..to],
            Target::Small => &mut self.small_buffer[from..to],
            Target::Large => match self.large_buffer.as_mut() {
                Some(buffer) => &mut buffer[from..to],
                None => return Err(NetworkError::MalformedFrame("large buffer missing")),
            },
        };
        match peer.receive(buffer, self.poll_interval) {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.last_received = Instant::now();
                Ok(n)
            }
            Err(e) => {
                debug!("Receive failed: {}", e);
                self.disconnect();
                Err(e)
            }
        }
    }

    fn idle_result<T>(&mut self) -> Result<Option<T>, NetworkError> {
        if self.last_received.elapsed() > self.timeout {
            warn!("No data received for {:?}, dropping connection", self.timeout);
            self.disconnect();
            return Err(NetworkError::Timeout(self.timeout));
        }
        Ok(None)
    }

    /// Make progress on the current batch. Returns `Ok(None)` if the peer
    /// had nothing more to give within the poll interval.
    pub fn receive(&mut self) -> Result<Option<ReceivedBatch<'_, H>>, NetworkError> {
        if self.release_pending {
            if let Some(buffer) = self.large_buffer.take() {
                self.pool.release(buffer);
            }
            self.release_pending = false;
        }

        let Some(peer) = self.peer.clone() else {
            return Err(NetworkError::Disconnected);
        };

        loop {
            match self.state {
                ReceiveState::Disconnected => return Err(NetworkError::Disconnected),
                ReceiveState::ConnectedIdle => {
                    self.state = ReceiveState::ReceivingHeader { received: 0 };
                }
                ReceiveState::ReceivingHeader { received } => {
                    let n = self.read(peer.as_ref(), Target::Header, received, H::SIZE)?;
                    if n == 0 {
                        return self.idle_result();
                    }
                    let received = received + n;
                    if received < H::SIZE {
                        self.state = ReceiveState::ReceivingHeader { received };
                        continue;
                    }

                    let header = H::read_from(&mut FrameReader::new(&self.header_bytes))?;
                    let size = header.batch_size();
                    self.header = Some(header);
                    if size == 0 {
                        self.state = ReceiveState::ConnectedIdle;
                        return Ok(Some(ReceivedBatch { header, payload: &[] }));
                    } else if size < SMALL_MESSAGE_THRESHOLD {
                        self.state = ReceiveState::ReceivingSmall { received: 0 };
                    } else {
                        self.large_buffer = Some(self.pool.acquire(size));
                        self.state = ReceiveState::ReceivingLarge { composition_index: 0 };
                    }
                }
                ReceiveState::ReceivingSmall { received } => {
                    let Some(header) = self.header else {
                        return Err(NetworkError::MalformedFrame("payload without header"));
                    };
                    let size = header.batch_size();
                    let n = self.read(peer.as_ref(), Target::Small, received, size)?;
                    if n == 0 {
                        return self.idle_result();
                    }
                    let received = received + n;
                    if received < size {
                        self.state = ReceiveState::ReceivingSmall { received };
                        continue;
                    }
                    self.state = ReceiveState::ConnectedIdle;
                    return Ok(Some(ReceivedBatch {
                        header,
                        payload: &self.small_buffer[..size],
                    }));
                }
                ReceiveState::ReceivingLarge { composition_index } => {
                    let Some(header) = self.header else {
                        return Err(NetworkError::MalformedFrame("payload without header"));
                    };
                    let size = header.batch_size();
                    let n = self.read(peer.as_ref(), Target::Large, composition_index, size)?;
                    if n == 0 {
                        return self.idle_result();
                    }
                    let composition_index = composition_index + n;
                    if composition_index < size {
                        self.state = ReceiveState::ReceivingLarge { composition_index };
                        continue;
                    }
                    self.state = ReceiveState::ConnectedIdle;
                    self.release_pending = true;
                    let payload = match &self.large_buffer {
                        Some(buffer) => &buffer[..size],
                        None => return Err(NetworkError::MalformedFrame("large buffer missing")),
                    };
                    return Ok(Some(ReceivedBatch { header, payload }));
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Target {
    Header,
    Small,
    Large,
}
