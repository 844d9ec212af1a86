//! Event definitions for the hearth protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. This module contains both
//! client->server and server->client event types.

mod client;
mod server;

pub use client::*;
pub use server::*;

/// Maximum accepted size of a client frame in bytes.
pub const MAX_FRAME_LEN: usize = 4096;

/// Names of client -> server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Enter the house with a name and avatar.
    JoinHouse,
    /// Move to another room.
    MoveRoom,
    /// Feed or play with the pet.
    InteractPet,
    /// Send a kiss to everyone else in the house.
    SendKiss,
    /// Create a canvas account.
    Register,
    /// Log in to a canvas account.
    Login,
    /// Paint one pixel.
    PlacePixel,
}

impl ClientEvent {
    pub const ALL: [ClientEvent; 7] = [
        ClientEvent::JoinHouse,
        ClientEvent::MoveRoom,
        ClientEvent::InteractPet,
        ClientEvent::SendKiss,
        ClientEvent::Register,
        ClientEvent::Login,
        ClientEvent::PlacePixel,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ClientEvent::JoinHouse => "join_house",
            ClientEvent::MoveRoom => "move_room",
            ClientEvent::InteractPet => "interact_pet",
            ClientEvent::SendKiss => "send_kiss",
            ClientEvent::Register => "register",
            ClientEvent::Login => "login",
            ClientEvent::PlacePixel => "placePixel",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }
}
