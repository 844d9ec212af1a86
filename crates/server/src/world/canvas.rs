//! Pixel canvas: a bounded last-write-wins grid paid for with credits.

use crate::config::{AuthConfig, CanvasConfig};
use crate::error::WorldError;
use crate::governor::Governor;
use crate::identity::{IdentityRecord, IdentityStore};
use crate::server::client::SessionId;
use protocol::Color;
use protocol::packets::{PixelPlacement, PixelRecord};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Contents of one painted cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixel {
    pub color: Color,
    pub placed_by: String,
    pub placed_at: u64,
}

/// The grid. Holds at most one pixel per coordinate.
#[derive(Debug)]
pub struct Canvas {
    width: u16,
    height: u16,
    pixels: HashMap<(u16, u16), Pixel>,
    dirty: bool,
}

impl Canvas {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: HashMap::new(),
            dirty: false,
        }
    }

    /// Rebuild from persisted records, dropping any that no longer fit.
    pub fn from_records(width: u16, height: u16, records: Vec<PixelRecord>) -> Self {
        let mut canvas = Self::new(width, height);
        for record in records {
            if record.x >= width || record.y >= height {
                warn!(
                    "Dropping persisted pixel ({}, {}) outside {}x{}",
                    record.x, record.y, width, height
                );
                continue;
            }
            canvas.pixels.insert(
                (record.x, record.y),
                Pixel {
                    color: record.color,
                    placed_by: record.placed_by,
                    placed_at: record.placed_at,
                },
            );
        }
        canvas
    }

    pub fn check_bounds(&self, x: i64, y: i64) -> Result<(u16, u16), WorldError> {
        if (0..i64::from(self.width)).contains(&x) && (0..i64::from(self.height)).contains(&y) {
            Ok((x as u16, y as u16))
        } else {
            Err(WorldError::OutOfBounds { x, y })
        }
    }

    pub fn get(&self, x: u16, y: u16) -> Option<&Pixel> {
        self.pixels.get(&(x, y))
    }

    /// Overwrite a cell. No history is kept.
    pub fn put(&mut self, x: u16, y: u16, color: Color, placed_by: String, placed_at: u64) -> PixelRecord {
        self.dirty = true;
        self.pixels.insert(
            (x, y),
            Pixel {
                color,
                placed_by: placed_by.clone(),
                placed_at,
            },
        );
        PixelRecord {
            x,
            y,
            color,
            placed_by,
            placed_at,
        }
    }

    /// Every painted cell, row by row.
    pub fn records(&self) -> Vec<PixelRecord> {
        let mut records: Vec<PixelRecord> = self
            .pixels
            .iter()
            .map(|(&(x, y), pixel)| PixelRecord {
                x,
                y,
                color: pixel.color,
                placed_by: pixel.placed_by.clone(),
                placed_at: pixel.placed_at,
            })
            .collect();
        records.sort_by_key(|r| (r.y, r.x));
        records
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Outcome of an accepted `placePixel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The cell changed and a credit was spent.
    Placed {
        record: PixelRecord,
        credits_remaining: u32,
    },
    /// Repeat of the session's previous stroke; nothing changed.
    Coalesced { credits: u32 },
}

/// Canvas world state: the grid plus the accounts that paint on it.
#[derive(Debug)]
pub struct CanvasWorld {
    pub canvas: Canvas,
    pub identities: IdentityStore,
    config: CanvasConfig,
}

impl CanvasWorld {
    pub fn new(config: &CanvasConfig, auth: &AuthConfig) -> Self {
        Self::restore(config, auth, Vec::new(), Vec::new())
    }

    pub fn restore(
        config: &CanvasConfig,
        auth: &AuthConfig,
        identities: Vec<IdentityRecord>,
        pixels: Vec<PixelRecord>,
    ) -> Self {
        Self {
            canvas: Canvas::from_records(config.width, config.height, pixels),
            identities: IdentityStore::from_records(auth.clone(), identities),
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    /// Validate, charge and paint as one step.
    ///
    /// Checks run cheapest first and none of them mutates: bounds, color,
    /// authentication, stroke coalescing, then the credit floor. Only when
    /// the charge succeeds is the cell written.
    pub fn place_pixel(
        &mut self,
        governor: &mut Governor,
        session: SessionId,
        identity: Option<&str>,
        placement: &PixelPlacement,
        now_ms: u64,
    ) -> Result<Placement, WorldError> {
        let (x, y) = self.canvas.check_bounds(placement.x, placement.y)?;
        let color: Color = placement
            .color
            .parse()
            .map_err(|_| WorldError::InvalidInput(format!("Invalid color: {}", placement.color)))?;
        let key = identity.ok_or(WorldError::NotAuthenticated)?;
        let record = self.identities.get(key).ok_or(WorldError::NotAuthenticated)?;
        let username = record.username.clone();

        if governor.is_repeat_stroke(session, x, y, color, self.canvas.get(x, y), &username) {
            return Ok(Placement::Coalesced {
                credits: record.pixel_credits,
            });
        }

        let credits_remaining = self.identities.charge(key, self.config.placement_cost)?;
        let record = self.canvas.put(x, y, color, username, now_ms);
        governor.record_stroke(session, x, y, color);
        Ok(Placement::Placed {
            record,
            credits_remaining,
        })
    }
}
