//! Socket abstraction used by the wire sessions
//!
//! `send` blocks until the bytes are handed off, `receive` blocks for at most
//! `timeout` and returns `Ok(0)` if nothing arrived. Send and receive may be
//! called concurrently from different threads.

use super::NetworkError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub trait Peer: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), NetworkError>;

    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, NetworkError>;

    fn is_connected(&self) -> bool;

    fn close(&self);
}

// ============================================================================
// TCP
// ============================================================================

/// Peer over a TCP stream. Reads and writes use separate handles so the
/// receive thread never blocks a send.
#[derive(Debug)]
pub struct TcpPeer {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    address: Option<SocketAddr>,
    connected: AtomicBool,
}

impl TcpPeer {
    pub fn new(stream: TcpStream) -> Result<Self, NetworkError> {
        stream.set_nodelay(true)?;
        let address = stream.peer_addr().ok();
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            address,
            connected: AtomicBool::new(true),
        })
    }

    pub fn connect(address: SocketAddr, timeout: Duration) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        Self::new(stream)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }
}

impl Peer for TcpPeer {
    fn send(&self, bytes: &[u8]) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(bytes) {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }
        let mut reader = self.reader.lock();
        // A zero timeout means "block forever" to set_read_timeout
        reader.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match reader.read(buffer) {
            Ok(0) => {
                self.close();
                Err(NetworkError::Disconnected)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) => {
                self.close();
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("Closing TCP peer {:?}", self.address);
            // Unblocks a receive in progress on the other handle
            let _ = self.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// One end of an in-process byte stream, for tests and loopback setups
#[derive(Debug)]
pub struct MemoryPeer {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
    /// Bytes received but not yet handed to the caller
    pending: Mutex<VecDeque<u8>>,
    connected: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Two connected ends
    pub fn pair() -> (MemoryPeer, MemoryPeer) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        (
            MemoryPeer {
                outbound: a_tx,
                inbound: b_rx,
                pending: Mutex::new(VecDeque::new()),
                connected: connected.clone(),
            },
            MemoryPeer {
                outbound: b_tx,
                inbound: a_rx,
                pending: Mutex::new(VecDeque::new()),
                connected,
            },
        )
    }
}

impl Peer for MemoryPeer {
    fn send(&self, bytes: &[u8]) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }
        self.outbound
            .send(bytes.to_vec())
            .map_err(|_| NetworkError::Disconnected)
    }

    fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, NetworkError> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            if !self.is_connected() {
                return Err(NetworkError::Disconnected);
            }
            match self.inbound.recv_timeout(timeout) {
                Ok(bytes) => pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    self.close();
                    return Err(NetworkError::Disconnected);
                }
            }
        }

        let count = buffer.len().min(pending.len());
        for (slot, byte) in buffer.iter_mut().zip(pending.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}
