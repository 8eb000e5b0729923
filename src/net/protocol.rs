//! Message types exchanged between client and server
//!
//! Every message travels inside a batch as `[u8 type][u16 length][payload]`.
//! Payloads are bincode-encoded with the legacy (fixed-int) config.

use serde::{Deserialize, Serialize};

use super::NetworkError;
use crate::game::components::{Input, InputState, InputType};
use crate::game::registry::Entity;
use crate::game::spatial::{TileExtent, TilePosition};
use crate::game::tile_map::{ChunkSnapshot, TileLayer};
use crate::game::Tick;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ExplicitConfirmation = 0,
    ConnectionResponse = 1,
    MovementUpdate = 2,
    EntityInit = 3,
    EntityDelete = 4,
    ChunkUpdate = 5,
    TileUpdate = 6,
    Heartbeat = 16,
    ClientInput = 17,
    InputChangeRequest = 18,
    TileUpdateRequest = 19,
}

impl TryFrom<u8> for MessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::ExplicitConfirmation,
            1 => MessageType::ConnectionResponse,
            2 => MessageType::MovementUpdate,
            3 => MessageType::EntityInit,
            4 => MessageType::EntityDelete,
            5 => MessageType::ChunkUpdate,
            6 => MessageType::TileUpdate,
            16 => MessageType::Heartbeat,
            17 => MessageType::ClientInput,
            18 => MessageType::InputChangeRequest,
            19 => MessageType::TileUpdateRequest,
            other => return Err(NetworkError::UnknownMessageType(other)),
        })
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Sent once, as the first message of a connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub entity: Entity,
    pub position: Vec3,
    pub tick: Tick,
    /// Size of the server's tile map
    pub map_extent: TileExtent,
}

/// Authoritative movement state of one entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementState {
    pub entity: Entity,
    pub position: Vec3,
    pub velocity: Vec3,
    pub input: Input,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementUpdate {
    pub tick: Tick,
    pub states: Vec<MovementState>,
}

/// Entities that entered the client's AOI, in full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInit {
    pub tick: Tick,
    pub states: Vec<MovementState>,
}

/// Entities that left the client's AOI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelete {
    pub tick: Tick,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkUpdate {
    pub tick: Tick,
    pub snapshot: ChunkSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileUpdate {
    pub tick: Tick,
    pub tile: TilePosition,
    pub layers: Vec<TileLayer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Zero-payload marker so the latest processed tick always gets confirmed
    ExplicitConfirmation,
    ConnectionResponse(ConnectionResponse),
    MovementUpdate(MovementUpdate),
    EntityInit(EntityInit),
    EntityDelete(EntityDelete),
    ChunkUpdate(ChunkUpdate),
    TileUpdate(TileUpdate),
}

// ============================================================================
// Client -> Server
// ============================================================================

/// Sent every network tick the client has nothing else to send
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub tick: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientInput {
    pub tick: Tick,
    pub input: Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputChangeRequest {
    pub tick: Tick,
    pub input_type: InputType,
    pub state: InputState,
}

/// Replace a tile's layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileUpdateRequest {
    pub tick: Tick,
    pub tile: TilePosition,
    pub layers: Vec<TileLayer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Heartbeat(Heartbeat),
    ClientInput(ClientInput),
    InputChangeRequest(InputChangeRequest),
    TileUpdateRequest(TileUpdateRequest),
}

// ============================================================================
// Encoding
// ============================================================================

/// A message encoded and ready to be copied into a batch
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub message_type: MessageType,
    /// Tick the message describes, if any. Used for confirmation bookkeeping.
    pub tick: Option<Tick>,
    pub payload: Vec<u8>,
}

/// Encode a payload using bincode's legacy config (fixed-size integers)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| NetworkError::Encode(e.to_string()))
}

/// Decode a payload, rejecting trailing bytes
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, NetworkError> {
    let (message, read) = bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map_err(|e| NetworkError::Decode(e.to_string()))?;
    if read != data.len() {
        return Err(NetworkError::Decode(format!(
            "{} trailing bytes after payload",
            data.len() - read
        )));
    }
    Ok(message)
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::ExplicitConfirmation => MessageType::ExplicitConfirmation,
            ServerMessage::ConnectionResponse(_) => MessageType::ConnectionResponse,
            ServerMessage::MovementUpdate(_) => MessageType::MovementUpdate,
            ServerMessage::EntityInit(_) => MessageType::EntityInit,
            ServerMessage::EntityDelete(_) => MessageType::EntityDelete,
            ServerMessage::ChunkUpdate(_) => MessageType::ChunkUpdate,
            ServerMessage::TileUpdate(_) => MessageType::TileUpdate,
        }
    }

    pub fn tick(&self) -> Option<Tick> {
        match self {
            ServerMessage::ExplicitConfirmation => None,
            ServerMessage::ConnectionResponse(m) => Some(m.tick),
            ServerMessage::MovementUpdate(m) => Some(m.tick),
            ServerMessage::EntityInit(m) => Some(m.tick),
            ServerMessage::EntityDelete(m) => Some(m.tick),
            ServerMessage::ChunkUpdate(m) => Some(m.tick),
            ServerMessage::TileUpdate(m) => Some(m.tick),
        }
    }

    pub fn encode(&self) -> Result<EncodedMessage, NetworkError> {
        let payload = match self {
            ServerMessage::ExplicitConfirmation => Vec::new(),
            ServerMessage::ConnectionResponse(m) => encode(m)?,
            ServerMessage::MovementUpdate(m) => encode(m)?,
            ServerMessage::EntityInit(m) => encode(m)?,
            ServerMessage::EntityDelete(m) => encode(m)?,
            ServerMessage::ChunkUpdate(m) => encode(m)?,
            ServerMessage::TileUpdate(m) => encode(m)?,
        };
        Ok(EncodedMessage {
            message_type: self.message_type(),
            tick: self.tick(),
            payload,
        })
    }

    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, NetworkError> {
        Ok(match message_type {
            MessageType::ExplicitConfirmation => {
                if !payload.is_empty() {
                    return Err(NetworkError::MalformedFrame("confirmation with payload"));
                }
                ServerMessage::ExplicitConfirmation
            }
            MessageType::ConnectionResponse => ServerMessage::ConnectionResponse(decode(payload)?),
            MessageType::MovementUpdate => ServerMessage::MovementUpdate(decode(payload)?),
            MessageType::EntityInit => ServerMessage::EntityInit(decode(payload)?),
            MessageType::EntityDelete => ServerMessage::EntityDelete(decode(payload)?),
            MessageType::ChunkUpdate => ServerMessage::ChunkUpdate(decode(payload)?),
            MessageType::TileUpdate => ServerMessage::TileUpdate(decode(payload)?),
            other => return Err(NetworkError::UnknownMessageType(other as u8)),
        })
    }
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Heartbeat(_) => MessageType::Heartbeat,
            ClientMessage::ClientInput(_) => MessageType::ClientInput,
            ClientMessage::InputChangeRequest(_) => MessageType::InputChangeRequest,
            ClientMessage::TileUpdateRequest(_) => MessageType::TileUpdateRequest,
        }
    }

    pub fn tick(&self) -> Tick {
        match self {
            ClientMessage::Heartbeat(m) => m.tick,
            ClientMessage::ClientInput(m) => m.tick,
            ClientMessage::InputChangeRequest(m) => m.tick,
            ClientMessage::TileUpdateRequest(m) => m.tick,
        }
    }

    pub fn encode(&self) -> Result<EncodedMessage, NetworkError> {
        let payload = match self {
            ClientMessage::Heartbeat(m) => encode(m)?,
            ClientMessage::ClientInput(m) => encode(m)?,
            ClientMessage::InputChangeRequest(m) => encode(m)?,
            ClientMessage::TileUpdateRequest(m) => encode(m)?,
        };
        Ok(EncodedMessage {
            message_type: self.message_type(),
            tick: Some(self.tick()),
            payload,
        })
    }

    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, NetworkError> {
        Ok(match message_type {
            MessageType::Heartbeat => ClientMessage::Heartbeat(decode(payload)?),
            MessageType::ClientInput => ClientMessage::ClientInput(decode(payload)?),
            MessageType::InputChangeRequest => ClientMessage::InputChangeRequest(decode(payload)?),
            MessageType::TileUpdateRequest => ClientMessage::TileUpdateRequest(decode(payload)?),
            other => return Err(NetworkError::UnknownMessageType(other as u8)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tile_map::{PaletteEntry, TileLayerType};

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::MovementUpdate);
        assert_eq!(MessageType::try_from(19).unwrap(), MessageType::TileUpdateRequest);
        assert!(matches!(MessageType::try_from(200), Err(NetworkError::UnknownMessageType(200))));
    }

    #[test]
    fn test_server_batch_messages_decode_field_for_field() {
        let entity = Entity::from_raw(4, 1);
        let mut input = Input::default();
        input.set(InputType::XUp, InputState::Pressed);

        let messages = vec![
            ServerMessage::ConnectionResponse(ConnectionResponse {
                entity,
                position: Vec3::new(32.0, 64.0, 0.0),
                tick: 120,
                map_extent: TileExtent::new(0, 0, 0, 64, 64, 1),
            }),
            ServerMessage::MovementUpdate(MovementUpdate {
                tick: 121,
                states: vec![MovementState {
                    entity,
                    position: Vec3::new(33.0, 64.0, 0.0),
                    velocity: Vec3::new(30.0, 0.0, 0.0),
                    input,
                }],
            }),
            ServerMessage::ChunkUpdate(ChunkUpdate {
                tick: 121,
                snapshot: ChunkSnapshot {
                    chunk_x: 1,
                    chunk_y: 2,
                    chunk_z: 0,
                    palette: vec![PaletteEntry { layer_type: TileLayerType::Wall, sprite_id: 2 }],
                    layer_counts: vec![1, 0],
                    indices: vec![0],
                },
            }),
            ServerMessage::ExplicitConfirmation,
        ];

        for message in messages {
            let encoded = message.encode().unwrap();
            assert_eq!(encoded.tick, message.tick());
            let decoded = ServerMessage::decode(encoded.message_type, &encoded.payload).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_confirmation_has_empty_payload() {
        let encoded = ServerMessage::ExplicitConfirmation.encode().unwrap();
        assert!(encoded.payload.is_empty());
        assert!(ServerMessage::decode(MessageType::ExplicitConfirmation, &[1]).is_err());
    }

    #[test]
    fn test_client_message_tick() {
        let message = ClientMessage::InputChangeRequest(InputChangeRequest {
            tick: 77,
            input_type: InputType::ZDown,
            state: InputState::Pressed,
        });
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.tick, Some(77));
        assert_eq!(ClientMessage::decode(encoded.message_type, &encoded.payload).unwrap(), message);
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let encoded = ClientMessage::Heartbeat(Heartbeat { tick: 1 }).encode().unwrap();
        assert!(ServerMessage::decode(encoded.message_type, &encoded.payload).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut payload = encode(&Heartbeat { tick: 5 }).unwrap();
        payload.push(0);
        assert!(decode::<Heartbeat>(&payload).is_err());
    }
}
