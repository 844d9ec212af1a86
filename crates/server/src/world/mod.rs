//! World state shapes.
//!
//! A world is either a shared house or a pixel canvas, chosen when the world
//! is created. Both are driven through the same session lifecycle in
//! [`crate::server::game::GameState`].

pub mod canvas;
pub mod house;

pub use canvas::CanvasWorld;
pub use house::HouseWorld;

use crate::config::WorldKind;

/// Authoritative state of one world.
#[derive(Debug)]
pub enum WorldState {
    House(HouseWorld),
    Canvas(CanvasWorld),
}

impl WorldState {
    pub fn kind(&self) -> WorldKind {
        match self {
            WorldState::House(_) => WorldKind::House,
            WorldState::Canvas(_) => WorldKind::Canvas,
        }
    }
}
