//! Server -> Client event building.

use crate::{Color, ProtocolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A player as shown in `game_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: String,
    pub name: String,
    pub avatar: String,
    pub room: String,
    pub action: String,
}

/// The house pet as shown in `game_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub hunger: u8,
    pub happiness: u8,
}

/// Full house snapshot carried by `game_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseSnapshot {
    /// Players keyed by session id.
    pub players: BTreeMap<String, PlayerView>,
    pub pet: PetView,
    pub love_meter: u8,
}

/// Kinds of `special_effect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Kiss,
}

/// Payload of `special_effect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialEffect {
    #[serde(rename = "type")]
    pub kind: EffectKind,
    /// Display name of the sender.
    pub from: String,
}

/// One painted canvas cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelRecord {
    pub x: u16,
    pub y: u16,
    pub color: Color,
    pub placed_by: String,
    /// Milliseconds since the Unix epoch.
    pub placed_at: u64,
}

/// Payload of `loginSuccess`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSuccess {
    pub username: String,
    pub pixel_credits: u32,
}

/// Payload of `updatePixelCredits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelCredits {
    pub pixel_credits: u32,
}

/// Payload of `session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u64,
}

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerPacket {
    /// Greeting carrying the session id assigned to this connection.
    #[serde(rename = "session")]
    Session(SessionInfo),
    #[serde(rename = "game_update")]
    GameUpdate(HouseSnapshot),
    #[serde(rename = "notification")]
    Notification(String),
    #[serde(rename = "special_effect")]
    SpecialEffect(SpecialEffect),
    #[serde(rename = "authSuccess")]
    AuthSuccess(String),
    #[serde(rename = "authError")]
    AuthError(String),
    #[serde(rename = "loginSuccess")]
    LoginSuccess(LoginSuccess),
    #[serde(rename = "allPixels")]
    AllPixels(Vec<PixelRecord>),
    #[serde(rename = "pixelPlaced")]
    PixelPlaced(PixelRecord),
    #[serde(rename = "updatePixelCredits")]
    UpdatePixelCredits(PixelCredits),
    #[serde(rename = "pixelError")]
    PixelError(String),
    /// Generic failure not tied to a feature.
    #[serde(rename = "error")]
    Error(String),
}

impl ServerPacket {
    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame (used by clients and tests).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerPacket::Session(_) => "session",
            ServerPacket::GameUpdate(_) => "game_update",
            ServerPacket::Notification(_) => "notification",
            ServerPacket::SpecialEffect(_) => "special_effect",
            ServerPacket::AuthSuccess(_) => "authSuccess",
            ServerPacket::AuthError(_) => "authError",
            ServerPacket::LoginSuccess(_) => "loginSuccess",
            ServerPacket::AllPixels(_) => "allPixels",
            ServerPacket::PixelPlaced(_) => "pixelPlaced",
            ServerPacket::UpdatePixelCredits(_) => "updatePixelCredits",
            ServerPacket::PixelError(_) => "pixelError",
            ServerPacket::Error(_) => "error",
        }
    }
}
