//! Server configuration.

use crate::world::house::PetKind;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "HEARTH_CONFIG";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_worlds")]
    pub worlds: Vec<WorldConfig>,
    #[serde(default)]
    pub house: HouseConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from `config.toml` (or `$HEARTH_CONFIG`), writing
    /// the defaults there when the file does not exist yet.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        Self::load_from(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            info!("No {} found, creating default config", path.display());
            let default_config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&default_config)?)?;
            default_config
        };
        Self::validate(&config)?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worlds.is_empty() {
            bail!("at least one [[worlds]] entry is required");
        }
        let mut names = HashSet::new();
        for world in &self.worlds {
            if world.name.is_empty()
                || !world
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                bail!("invalid world name {:?}", world.name);
            }
            if !names.insert(world.name.as_str()) {
                bail!("duplicate world name {:?}", world.name);
            }
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            bail!("canvas dimensions must be positive");
        }
        if self.auth.pbkdf2_iterations == 0 {
            bail!("auth.pbkdf2_iterations must be positive");
        }
        if self.auth.max_username_length == 0 {
            bail!("auth.max_username_length must be positive");
        }
        if self.auth.max_pending_hashes == 0 {
            bail!("auth.max_pending_hashes must be positive");
        }
        for (field, value) in [
            ("initial_hunger", self.house.initial_hunger),
            ("initial_happiness", self.house.initial_happiness),
            ("initial_love", self.house.initial_love),
        ] {
            if value > 100 {
                bail!("house.{} must be within 0..=100", field);
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            worlds: default_worlds(),
            house: HouseConfig::default(),
            canvas: CanvasConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Server networking and general settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections per IP limit.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: usize,
    /// Events buffered per world before slow sessions start lagging.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// File with one banned IP address per line.
    #[serde(default = "default_ban_list")]
    pub ban_list: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            max_connections: default_max_connections(),
            ip_limit: default_ip_limit(),
            broadcast_capacity: default_broadcast_capacity(),
            ban_list: default_ban_list(),
        }
    }
}

fn default_port() -> u16 {
    3001
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_connections() -> usize {
    500
}
fn default_ip_limit() -> usize {
    20
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_ban_list() -> String {
    "banlist.txt".to_string()
}

/// Which state shape a world carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorldKind {
    House,
    Canvas,
}

impl std::fmt::Display for WorldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorldKind::House => f.write_str("house"),
            WorldKind::Canvas => f.write_str("canvas"),
        }
    }
}

/// One served world, reachable at `/ws/{name}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldConfig {
    pub name: String,
    pub kind: WorldKind,
}

fn default_worlds() -> Vec<WorldConfig> {
    vec![
        WorldConfig {
            name: "house".to_string(),
            kind: WorldKind::House,
        },
        WorldConfig {
            name: "canvas".to_string(),
            kind: WorldKind::Canvas,
        },
    ]
}

/// House world balance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HouseConfig {
    #[serde(default = "default_pet_name")]
    pub pet_name: String,
    #[serde(default)]
    pub pet_kind: PetKind,
    #[serde(default = "default_pet_stat")]
    pub initial_hunger: u8,
    #[serde(default = "default_pet_stat")]
    pub initial_happiness: u8,
    #[serde(default = "default_initial_love")]
    pub initial_love: u8,
    /// Hunger gained per feed.
    #[serde(default = "default_interaction_amount")]
    pub feed_amount: u8,
    /// Happiness gained per play.
    #[serde(default = "default_interaction_amount")]
    pub play_amount: u8,
    /// Hunger lost per play.
    #[serde(default = "default_play_hunger_cost")]
    pub play_hunger_cost: u8,
    /// Love gained per kiss.
    #[serde(default = "default_kiss_amount")]
    pub kiss_amount: u8,
    /// Seconds between ambient decay ticks.
    #[serde(default = "default_decay_interval")]
    pub decay_interval_secs: u64,
    #[serde(default = "default_hunger_decay")]
    pub hunger_decay: u8,
    #[serde(default = "default_small_decay")]
    pub happiness_decay: u8,
    #[serde(default = "default_small_decay")]
    pub love_decay: u8,
    /// Minimum delay between pet interactions of one session (0 = off).
    #[serde(default)]
    pub interaction_cooldown_ms: u64,
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

impl Default for HouseConfig {
    fn default() -> Self {
        Self {
            pet_name: default_pet_name(),
            pet_kind: PetKind::default(),
            initial_hunger: default_pet_stat(),
            initial_happiness: default_pet_stat(),
            initial_love: default_initial_love(),
            feed_amount: default_interaction_amount(),
            play_amount: default_interaction_amount(),
            play_hunger_cost: default_play_hunger_cost(),
            kiss_amount: default_kiss_amount(),
            decay_interval_secs: default_decay_interval(),
            hunger_decay: default_hunger_decay(),
            happiness_decay: default_small_decay(),
            love_decay: default_small_decay(),
            interaction_cooldown_ms: 0,
            max_name_length: default_max_name_length(),
        }
    }
}

fn default_pet_name() -> String {
    "Michi".to_string()
}
fn default_pet_stat() -> u8 {
    80
}
fn default_initial_love() -> u8 {
    50
}
fn default_interaction_amount() -> u8 {
    10
}
fn default_play_hunger_cost() -> u8 {
    5
}
fn default_kiss_amount() -> u8 {
    5
}
fn default_decay_interval() -> u64 {
    30
}
fn default_hunger_decay() -> u8 {
    2
}
fn default_small_decay() -> u8 {
    1
}
fn default_max_name_length() -> usize {
    24
}

/// Pixel canvas rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CanvasConfig {
    #[serde(default = "default_canvas_width")]
    pub width: u16,
    #[serde(default = "default_canvas_height")]
    pub height: u16,
    /// Credits given to a new account.
    #[serde(default = "default_starting_credits")]
    pub starting_credits: u32,
    /// Credits consumed per accepted placement.
    #[serde(default = "default_placement_cost")]
    pub placement_cost: u32,
    /// Credits granted on every successful login.
    #[serde(default)]
    pub login_grant: u32,
    /// Credits granted per tick to every logged-in account.
    #[serde(default)]
    pub regen_amount: u32,
    /// Grants never raise a balance above this.
    #[serde(default = "default_starting_credits")]
    pub credit_cap: u32,
    /// Seconds between canvas ticks (regen and persistence flush).
    #[serde(default = "default_canvas_tick")]
    pub tick_interval_secs: u64,
    /// Collapse repeated strokes on an unchanged cell.
    #[serde(default = "default_coalesce")]
    pub coalesce_repeats: bool,
    /// Directory for persisted accounts and pixels (empty = memory only).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_canvas_width(),
            height: default_canvas_height(),
            starting_credits: default_starting_credits(),
            placement_cost: default_placement_cost(),
            login_grant: 0,
            regen_amount: 0,
            credit_cap: default_starting_credits(),
            tick_interval_secs: default_canvas_tick(),
            coalesce_repeats: default_coalesce(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_canvas_width() -> u16 {
    80
}
fn default_canvas_height() -> u16 {
    60
}
fn default_starting_credits() -> u32 {
    100
}
fn default_placement_cost() -> u32 {
    1
}
fn default_canvas_tick() -> u64 {
    5
}
fn default_coalesce() -> bool {
    true
}
fn default_data_dir() -> String {
    "data".to_string()
}

/// Account and credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// PBKDF2-HMAC-SHA256 rounds for new password hashes.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
    #[serde(default = "default_max_username_length")]
    pub max_username_length: usize,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Register and login requests hashing at once, per world.
    #[serde(default = "default_max_pending_hashes")]
    pub max_pending_hashes: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: default_pbkdf2_iterations(),
            max_username_length: default_max_username_length(),
            min_password_length: default_min_password_length(),
            max_pending_hashes: default_max_pending_hashes(),
        }
    }
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}
fn default_max_username_length() -> usize {
    32
}
fn default_min_password_length() -> usize {
    1
}
fn default_max_pending_hashes() -> usize {
    16
}
