//! Shared house: players moving between rooms, a pet and the love meter.

use crate::config::HouseConfig;
use crate::error::WorldError;
use crate::server::client::SessionId;
use protocol::packets::{HouseSnapshot, PetView, PlayerView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Upper bound of every meter.
pub const METER_MAX: u8 = 100;

const MAX_AVATAR_CHARS: usize = 16;
const DEFAULT_AVATAR: &str = "🙂";

/// The four rooms of the house.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Bedroom,
    Kitchen,
    Living,
    Garden,
}

impl Room {
    pub const ALL: [Room; 4] = [Room::Bedroom, Room::Kitchen, Room::Living, Room::Garden];

    /// Room id on the wire.
    pub const fn id(self) -> &'static str {
        match self {
            Room::Bedroom => "bedroom",
            Room::Kitchen => "kitchen",
            Room::Living => "living",
            Room::Garden => "garden",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Room::Bedroom => "bedroom",
            Room::Kitchen => "kitchen",
            Room::Living => "living room",
            Room::Garden => "garden",
        }
    }
}

impl FromStr for Room {
    type Err = WorldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Room::ALL
            .into_iter()
            .find(|room| room.id() == s)
            .ok_or_else(|| WorldError::UnknownRoom(s.to_string()))
    }
}

/// Species of the house pet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PetKind {
    #[default]
    Cat,
    Dog,
}

impl PetKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            PetKind::Cat => "cat",
            PetKind::Dog => "dog",
        }
    }
}

/// What a player can do with the pet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PetAction {
    Feed,
    Play,
}

impl FromStr for PetAction {
    type Err = WorldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feed" => Ok(PetAction::Feed),
            "play" => Ok(PetAction::Play),
            other => Err(WorldError::InvalidInput(format!("Unknown pet action: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: SessionId,
    pub name: String,
    pub avatar: String,
    pub room: Room,
    /// Free-text status shown in the player's room.
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pet {
    pub name: String,
    pub kind: PetKind,
    pub hunger: u8,
    pub happiness: u8,
}

/// Authoritative house state.
#[derive(Debug)]
pub struct HouseWorld {
    config: HouseConfig,
    players: BTreeMap<SessionId, Player>,
    pub pet: Pet,
    pub love_meter: u8,
}

impl HouseWorld {
    pub fn new(config: &HouseConfig) -> Self {
        Self {
            players: BTreeMap::new(),
            pet: Pet {
                name: config.pet_name.clone(),
                kind: config.pet_kind,
                hunger: config.initial_hunger.min(METER_MAX),
                happiness: config.initial_happiness.min(METER_MAX),
            },
            love_meter: config.initial_love.min(METER_MAX),
            config: config.clone(),
        }
    }

    pub fn player(&self, session: SessionId) -> Option<&Player> {
        self.players.get(&session)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Create the session's player in the bedroom, or refresh its name and
    /// avatar when it already joined.
    pub fn join(&mut self, session: SessionId, name: &str, avatar: &str) -> Result<&Player, WorldError> {
        let name: String = name.trim().chars().take(self.config.max_name_length).collect();
        if name.is_empty() {
            return Err(WorldError::InvalidInput("Please enter a name".into()));
        }
        let avatar: String = avatar.trim().chars().take(MAX_AVATAR_CHARS).collect();
        let avatar = if avatar.is_empty() {
            DEFAULT_AVATAR.to_string()
        } else {
            avatar
        };

        let player = self.players.entry(session).or_insert_with(|| Player {
            id: session,
            name: String::new(),
            avatar: String::new(),
            room: Room::Bedroom,
            action: "Just arrived".to_string(),
        });
        player.name = name;
        player.avatar = avatar;
        Ok(&*player)
    }

    /// Move a player. An unknown room leaves the player where it was.
    pub fn move_room(&mut self, session: SessionId, room_id: &str) -> Result<Room, WorldError> {
        let player = self.players.get_mut(&session).ok_or(WorldError::NotJoined)?;
        let room: Room = room_id.parse()?;
        player.room = room;
        player.action = format!("In the {}", room.label());
        Ok(room)
    }

    /// Feed raises hunger; play raises happiness and costs a little hunger.
    pub fn interact_pet(&mut self, session: SessionId, action: &str) -> Result<PetAction, WorldError> {
        let player = self.players.get_mut(&session).ok_or(WorldError::NotJoined)?;
        let action: PetAction = action.parse()?;
        match action {
            PetAction::Feed => {
                self.pet.hunger = raise(self.pet.hunger, self.config.feed_amount);
                player.action = format!("Feeding {}", self.pet.name);
            }
            PetAction::Play => {
                self.pet.happiness = raise(self.pet.happiness, self.config.play_amount);
                self.pet.hunger = self.pet.hunger.saturating_sub(self.config.play_hunger_cost);
                player.action = format!("Playing with {}", self.pet.name);
            }
        }
        Ok(action)
    }

    /// Raise the love meter. Returns the sender's display name.
    pub fn send_kiss(&mut self, session: SessionId) -> Result<String, WorldError> {
        let player = self.players.get(&session).ok_or(WorldError::NotJoined)?;
        self.love_meter = raise(self.love_meter, self.config.kiss_amount);
        Ok(player.name.clone())
    }

    pub fn leave(&mut self, session: SessionId) -> Option<Player> {
        self.players.remove(&session)
    }

    /// Ambient decay, clamped at zero. Returns whether anything changed.
    pub fn decay(&mut self) -> bool {
        let before = (self.pet.hunger, self.pet.happiness, self.love_meter);
        self.pet.hunger = self.pet.hunger.saturating_sub(self.config.hunger_decay);
        self.pet.happiness = self.pet.happiness.saturating_sub(self.config.happiness_decay);
        self.love_meter = self.love_meter.saturating_sub(self.config.love_decay);
        before != (self.pet.hunger, self.pet.happiness, self.love_meter)
    }

    pub fn snapshot(&self) -> HouseSnapshot {
        let players = self
            .players
            .values()
            .map(|p| {
                (
                    p.id.to_string(),
                    PlayerView {
                        id: p.id.to_string(),
                        name: p.name.clone(),
                        avatar: p.avatar.clone(),
                        room: p.room.id().to_string(),
                        action: p.action.clone(),
                    },
                )
            })
            .collect();
        HouseSnapshot {
            players,
            pet: PetView {
                name: self.pet.name.clone(),
                kind: self.pet.kind.as_str().to_string(),
                hunger: self.pet.hunger,
                happiness: self.pet.happiness,
            },
            love_meter: self.love_meter,
        }
    }
}

fn raise(value: u8, amount: u8) -> u8 {
    value.saturating_add(amount).min(METER_MAX)
}
