//! Outbound batching
//!
//! Messages are queued with their tick as they are produced. Once per network
//! tick the queue is drained, split into batches that fit the header limits,
//! framed, and handed to the peer in wire-sized chunks.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::framing::{
    build_payload, frame_batch, framed_size, BatchHeader, BatchPayload, ClientHeader, ServerHeader,
};
use super::peer::Peer;
use super::protocol::{EncodedMessage, ServerMessage};
use super::NetworkError;
use crate::game::constants::net::{MAX_BATCH_SIZE, MAX_WIRE_SIZE};
use crate::game::Tick;

/// Thread-safe queue of encoded messages waiting for the next send
#[derive(Debug, Clone)]
pub struct MessageQueue {
    tx: Sender<EncodedMessage>,
    rx: Receiver<EncodedMessage>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: EncodedMessage) {
        // Both ends live in self, so the channel can't be disconnected
        let _ = self.tx.send(message);
    }

    pub fn drain(&self) -> Vec<EncodedMessage> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    pub batches: usize,
    pub compressed_batches: usize,
    pub messages: usize,
    pub bytes: usize,
}

/// Group messages into batches of at most 255 messages whose uncompressed
/// payload fits the header's size field. A message too large for any batch
/// gets a batch of its own and may still fit once compressed.
pub fn split_batches(messages: Vec<EncodedMessage>) -> Vec<Vec<EncodedMessage>> {
    let mut batches = Vec::new();
    let mut current: Vec<EncodedMessage> = Vec::new();
    let mut current_size = 0;

    for message in messages {
        let size = framed_size(&message);
        let full = current.len() == u8::MAX as usize || current_size + size > MAX_BATCH_SIZE;
        if full && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(message);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Hand bytes to the peer in chunks no larger than the wire limit
pub fn send_in_chunks(peer: &dyn Peer, bytes: &[u8]) -> Result<(), NetworkError> {
    for chunk in bytes.chunks(MAX_WIRE_SIZE) {
        peer.send(chunk)?;
    }
    Ok(())
}

fn send_batches<H: BatchHeader>(
    peer: &dyn Peer,
    messages: Vec<EncodedMessage>,
    header_for: impl Fn(bool, &BatchPayload) -> H,
) -> Result<SendStats, NetworkError> {
    let mut stats = SendStats::default();
    let batches = split_batches(messages);
    let count = batches.len();
    for (i, batch) in batches.into_iter().enumerate() {
        let payload = build_payload(&batch)?;
        let header = header_for(i + 1 == count, &payload);
        let bytes = frame_batch(&header, &payload.bytes);
        send_in_chunks(peer, &bytes)?;

        stats.batches += 1;
        stats.messages += batch.len();
        stats.bytes += bytes.len();
        if payload.compressed {
            stats.compressed_batches += 1;
        }
    }
    Ok(stats)
}

/// Adjustment fields for a server batch header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdjustmentInfo {
    pub adjustment: i8,
    pub iteration: u8,
}

/// Send server messages. The tick adjustment and confirmation ride on the
/// final batch; earlier batches repeat the client's current iteration with
/// a zero adjustment.
pub fn send_server_batches(
    peer: &dyn Peer,
    messages: Vec<EncodedMessage>,
    adjustment: AdjustmentInfo,
    confirmed_tick_count: u8,
) -> Result<SendStats, NetworkError> {
    let previous_iteration = if adjustment.adjustment != 0 {
        adjustment.iteration.wrapping_sub(1)
    } else {
        adjustment.iteration
    };
    send_batches(peer, messages, |is_last, payload| {
        let (tick_adjustment, adjustment_iteration, confirmed) = if is_last {
            (adjustment.adjustment, adjustment.iteration, confirmed_tick_count)
        } else {
            (0, previous_iteration, 0)
        };
        ServerHeader {
            tick_adjustment,
            adjustment_iteration,
            message_count: payload.message_count,
            confirmed_tick_count: confirmed,
            batch_size: payload.bytes.len() as u16,
            compressed: payload.compressed,
        }
    })
}

pub fn send_client_batches(
    peer: &dyn Peer,
    messages: Vec<EncodedMessage>,
    adjustment_iteration: u8,
) -> Result<SendStats, NetworkError> {
    send_batches(peer, messages, |_, payload| ClientHeader {
        adjustment_iteration,
        message_count: payload.message_count,
        batch_size: payload.bytes.len() as u16,
        compressed: payload.compressed,
    })
}

/// Ticks to confirm in the next batch, saturated to the header field
pub fn confirmation_count(latest_processed: Tick, last_confirmed: Tick) -> u8 {
    latest_processed
        .wrapping_sub(last_confirmed)
        .min(u8::MAX as u32) as u8
}

/// Append an explicit confirmation unless a message already carries the
/// latest processed tick, so quiet ticks still produce a batch
pub fn ensure_confirmation(
    messages: &mut Vec<EncodedMessage>,
    latest_processed: Tick,
) -> Result<(), NetworkError> {
    if !messages.iter().any(|m| m.tick == Some(latest_processed)) {
        messages.push(ServerMessage::ExplicitConfirmation.encode()?);
    }
    Ok(())
}
