//! Client -> Server event parsing.

use super::{ClientEvent, MAX_FRAME_LEN};
use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Payload of `join_house`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinHouse {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// Payload of `register` and `login`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of `placePixel`.
///
/// Coordinates are signed so out-of-range requests decode and can be
/// rejected with a proper error; the color stays a string for the same
/// reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPlacement {
    pub x: i64,
    pub y: i64,
    pub color: String,
}

/// Parsed client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    JoinHouse(JoinHouse),
    /// Target room id.
    MoveRoom(String),
    /// Pet action (`feed` or `play`).
    InteractPet(String),
    SendKiss,
    Register(Credentials),
    Login(Credentials),
    PlacePixel(PixelPlacement),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientPacket {
    /// Parse a client event from a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.trim().is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        if text.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }

        let envelope: Envelope = serde_json::from_str(text)?;
        let event = ClientEvent::from_name(&envelope.event)
            .ok_or_else(|| ProtocolError::UnknownEvent(envelope.event.clone()))?;
        let data = envelope.data;

        match event {
            ClientEvent::JoinHouse => Ok(ClientPacket::JoinHouse(payload(event, data)?)),
            ClientEvent::MoveRoom => Ok(ClientPacket::MoveRoom(payload(event, data)?)),
            ClientEvent::InteractPet => Ok(ClientPacket::InteractPet(payload(event, data)?)),
            // Any payload is ignored
            ClientEvent::SendKiss => Ok(ClientPacket::SendKiss),
            ClientEvent::Register => Ok(ClientPacket::Register(payload(event, data)?)),
            ClientEvent::Login => Ok(ClientPacket::Login(payload(event, data)?)),
            ClientEvent::PlacePixel => Ok(ClientPacket::PlacePixel(payload(event, data)?)),
        }
    }

    /// The event this packet was parsed from.
    pub fn event(&self) -> ClientEvent {
        match self {
            ClientPacket::JoinHouse(_) => ClientEvent::JoinHouse,
            ClientPacket::MoveRoom(_) => ClientEvent::MoveRoom,
            ClientPacket::InteractPet(_) => ClientEvent::InteractPet,
            ClientPacket::SendKiss => ClientEvent::SendKiss,
            ClientPacket::Register(_) => ClientEvent::Register,
            ClientPacket::Login(_) => ClientEvent::Login,
            ClientPacket::PlacePixel(_) => ClientEvent::PlacePixel,
        }
    }

    /// Encode this packet as a text frame (used by clients and tests).
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ClientPacket::JoinHouse(join) => serde_json::to_value(join)?,
            ClientPacket::MoveRoom(room) => Value::String(room.clone()),
            ClientPacket::InteractPet(action) => Value::String(action.clone()),
            ClientPacket::SendKiss => Value::Null,
            ClientPacket::Register(creds) | ClientPacket::Login(creds) => {
                serde_json::to_value(creds)?
            }
            ClientPacket::PlacePixel(placement) => serde_json::to_value(placement)?,
        };
        let frame = OutgoingEnvelope {
            event: self.event().name(),
            data,
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope {
    event: &'static str,
    data: Value,
}

fn payload<T: DeserializeOwned>(event: ClientEvent, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.name(),
        reason: e.to_string(),
    })
}
