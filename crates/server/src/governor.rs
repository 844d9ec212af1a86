//! Per-session limits: stroke coalescing and the pet interaction cooldown.

use crate::error::WorldError;
use crate::server::client::SessionId;
use crate::world::canvas::Pixel;
use protocol::Color;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Last accepted placement of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stroke {
    x: u16,
    y: u16,
    color: Color,
}

/// Admission checks that sit in front of world mutations.
#[derive(Debug)]
pub struct Governor {
    cooldown: Duration,
    coalesce: bool,
    last_interaction: HashMap<SessionId, Instant>,
    strokes: HashMap<SessionId, Stroke>,
}

impl Governor {
    pub fn new(cooldown: Duration, coalesce: bool) -> Self {
        Self {
            cooldown,
            coalesce,
            last_interaction: HashMap::new(),
            strokes: HashMap::new(),
        }
    }

    /// Enforce the pet interaction cooldown. Records the attempt when allowed.
    pub fn check_interaction(&mut self, session: SessionId, now: Instant) -> Result<(), WorldError> {
        if self.cooldown.is_zero() {
            return Ok(());
        }
        if let Some(last) = self.last_interaction.get(&session) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                return Err(WorldError::Cooldown {
                    remaining_ms: remaining.as_millis().max(1) as u64,
                });
            }
        }
        self.last_interaction.insert(session, now);
        Ok(())
    }

    /// A drag gesture resending the cell it just painted: same session, same
    /// coordinate, same color, and the cell still holds that stroke.
    pub fn is_repeat_stroke(
        &self,
        session: SessionId,
        x: u16,
        y: u16,
        color: Color,
        current: Option<&Pixel>,
        username: &str,
    ) -> bool {
        self.coalesce
            && self.strokes.get(&session) == Some(&Stroke { x, y, color })
            && current.is_some_and(|pixel| pixel.color == color && pixel.placed_by == username)
    }

    pub fn record_stroke(&mut self, session: SessionId, x: u16, y: u16, color: Color) {
        self.strokes.insert(session, Stroke { x, y, color });
    }

    /// Drop all per-session state.
    pub fn forget(&mut self, session: SessionId) {
        self.last_interaction.remove(&session);
        self.strokes.remove(&session);
    }
}
