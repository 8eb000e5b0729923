//! Batch framing
//!
//! A batch on the wire is `[header][payload]`, where the payload is a run of
//! `[u8 type][u16 length][message bytes]` records, optionally lz4 compressed
//! as a whole. All fixed-width fields are little-endian.

use std::borrow::Cow;

use super::protocol::{EncodedMessage, MessageType};
use super::NetworkError;
use crate::game::constants::net::{
    COMPRESSED_FLAG, COMPRESSION_THRESHOLD, MAX_BATCH_SIZE, MAX_MESSAGE_SIZE,
};

/// Bytes preceding each message inside a batch payload
pub const MESSAGE_HEADER_SIZE: usize = 3;

// ============================================================================
// Primitive readers/writers
// ============================================================================

/// Appends little-endian fields to a byte buffer
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Cursor over a received byte slice
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn read(&mut self, n: usize) -> Result<&'a [u8], NetworkError> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(NetworkError::MalformedFrame("truncated"))?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, NetworkError> {
        Ok(self.read(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, NetworkError> {
        Ok(i8::from_le_bytes([self.read_u8()?]))
    }

    pub fn read_u16(&mut self) -> Result<u16, NetworkError> {
        let b = self.read(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Fixed header in front of every batch
pub trait BatchHeader: Sized {
    const SIZE: usize;

    fn write_to(&self, frame: &mut FrameBuilder);

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self, NetworkError>;

    /// Payload bytes that follow the header on the wire
    fn batch_size(&self) -> usize;

    fn is_compressed(&self) -> bool;

    fn message_count(&self) -> u8;
}

fn encode_size(size: usize, compressed: bool) -> u16 {
    let mut field = size as u16 & !COMPRESSED_FLAG;
    if compressed {
        field |= COMPRESSED_FLAG;
    }
    field
}

/// Server -> client batch header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerHeader {
    pub tick_adjustment: i8,
    pub adjustment_iteration: u8,
    pub message_count: u8,
    /// Ticks completed since the previous batch's confirmation
    pub confirmed_tick_count: u8,
    pub batch_size: u16,
    pub compressed: bool,
}

impl BatchHeader for ServerHeader {
    const SIZE: usize = 6;

    fn write_to(&self, frame: &mut FrameBuilder) {
        frame
            .write_i8(self.tick_adjustment)
            .write_u8(self.adjustment_iteration)
            .write_u8(self.message_count)
            .write_u8(self.confirmed_tick_count)
            .write_u16(encode_size(self.batch_size as usize, self.compressed));
    }

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self, NetworkError> {
        let tick_adjustment = reader.read_i8()?;
        let adjustment_iteration = reader.read_u8()?;
        let message_count = reader.read_u8()?;
        let confirmed_tick_count = reader.read_u8()?;
        let size = reader.read_u16()?;
        Ok(Self {
            tick_adjustment,
            adjustment_iteration,
            message_count,
            confirmed_tick_count,
            batch_size: size & !COMPRESSED_FLAG,
            compressed: size & COMPRESSED_FLAG != 0,
        })
    }

    fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn message_count(&self) -> u8 {
        self.message_count
    }
}

/// Client -> server batch header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeader {
    /// Latest adjustment iteration the client has applied
    pub adjustment_iteration: u8,
    pub message_count: u8,
    pub batch_size: u16,
    pub compressed: bool,
}

impl BatchHeader for ClientHeader {
    const SIZE: usize = 4;

    fn write_to(&self, frame: &mut FrameBuilder) {
        frame
            .write_u8(self.adjustment_iteration)
            .write_u8(self.message_count)
            .write_u16(encode_size(self.batch_size as usize, self.compressed));
    }

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self, NetworkError> {
        let adjustment_iteration = reader.read_u8()?;
        let message_count = reader.read_u8()?;
        let size = reader.read_u16()?;
        Ok(Self {
            adjustment_iteration,
            message_count,
            batch_size: size & !COMPRESSED_FLAG,
            compressed: size & COMPRESSED_FLAG != 0,
        })
    }

    fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn message_count(&self) -> u8 {
        self.message_count
    }
}

// ============================================================================
// Batch payloads
// ============================================================================

/// Wire size of a message once placed in a batch
pub fn framed_size(message: &EncodedMessage) -> usize {
    MESSAGE_HEADER_SIZE + message.payload.len()
}

/// Batch payload, ready to follow a header
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub message_count: u8,
}

/// Concatenate messages into a batch payload, compressing it if it is large.
///
/// A payload that doesn't fit the header's size field even after compression
/// is returned as `BatchTooLarge`; callers split batches so this never
/// happens with the configured limits.
pub fn build_payload(messages: &[EncodedMessage]) -> Result<BatchPayload, NetworkError> {
    let message_count = u8::try_from(messages.len())
        .map_err(|_| NetworkError::MalformedFrame("more than 255 messages in one batch"))?;

    let total: usize = messages.iter().map(framed_size).sum();
    let mut frame = FrameBuilder::with_capacity(total);
    for message in messages {
        if message.payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge(message.payload.len(), MAX_MESSAGE_SIZE));
        }
        frame
            .write_u8(message.message_type as u8)
            .write_u16(message.payload.len() as u16)
            .write(&message.payload);
    }
    let raw = frame.build();

    let (bytes, compressed) = if raw.len() >= COMPRESSION_THRESHOLD {
        let packed = lz4_flex::compress_prepend_size(&raw);
        if packed.len() < raw.len() {
            (packed, true)
        } else {
            (raw, false)
        }
    } else {
        (raw, false)
    };

    if bytes.len() > MAX_BATCH_SIZE {
        return Err(NetworkError::BatchTooLarge(bytes.len(), MAX_BATCH_SIZE));
    }

    Ok(BatchPayload {
        bytes,
        compressed,
        message_count,
    })
}

/// Header followed by payload, as handed to the peer
pub fn frame_batch<H: BatchHeader>(header: &H, payload: &[u8]) -> Vec<u8> {
    let mut frame = FrameBuilder::with_capacity(H::SIZE + payload.len());
    header.write_to(&mut frame);
    frame.write(payload);
    frame.build()
}

/// Undo batch compression. Uncompressed payloads are borrowed as-is.
pub fn decompress_payload(payload: &[u8], compressed: bool) -> Result<Cow<'_, [u8]>, NetworkError> {
    if !compressed {
        return Ok(Cow::Borrowed(payload));
    }
    lz4_flex::decompress_size_prepended(payload)
        .map(Cow::Owned)
        .map_err(|e| NetworkError::Decompression(e.to_string()))
}

/// Split a decompressed payload into `(type, message bytes)` records
pub fn split_messages(
    payload: &[u8],
    expected_count: u8,
) -> Result<Vec<(MessageType, &[u8])>, NetworkError> {
    let mut reader = FrameReader::new(payload);
    let mut messages = Vec::with_capacity(expected_count as usize);
    while reader.has_remaining() {
        let message_type = MessageType::try_from(reader.read_u8()?)?;
        let length = reader.read_u16()? as usize;
        messages.push((message_type, reader.read(length)?));
    }
    if messages.len() != expected_count as usize {
        return Err(NetworkError::MalformedFrame("message count does not match header"));
    }
    Ok(messages)
}
