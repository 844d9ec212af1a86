//! World state, event dispatch and the tick loop.
//!
//! Each world is one `GameState` behind a write lock. Every inbound event is
//! applied while holding that lock and every resulting broadcast is queued on
//! the world's channel before the lock is released, so all sessions observe
//! mutations in the order they were applied.

use super::client::SessionId;
use super::registry::ConnectionRegistry;
use crate::config::{Config, WorldKind};
use crate::error::{ErrorKind, WorldError};
use crate::governor::Governor;
use crate::identity::{IdentityRecord, PasswordHash, Reservation};
use crate::persist::{self, Persister};
use crate::world::canvas::{CanvasWorld, Placement, now_ms};
use crate::world::house::{HouseWorld, PetAction};
use crate::world::WorldState;
use protocol::packets::{
    ClientEvent, ClientPacket, Credentials, EffectKind, LoginSuccess, PixelCredits, PixelPlacement,
    PixelRecord, ServerPacket, SessionInfo, SpecialEffect,
};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Who receives an outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(SessionId),
    Only(SessionId),
    Many(Vec<SessionId>),
}

impl Audience {
    pub fn includes(&self, id: SessionId) -> bool {
        match self {
            Audience::All => true,
            Audience::AllExcept(excluded) => *excluded != id,
            Audience::Only(target) => *target == id,
            Audience::Many(targets) => targets.contains(&id),
        }
    }
}

/// An encoded event on a world's broadcast channel.
///
/// The frame is encoded once and shared by every connection task.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    /// State version the event was derived from.
    pub version: u64,
    pub text: Arc<str>,
}

/// Credential work that must run off the world lock.
pub enum Deferred {
    Register {
        session: SessionId,
        reservation: Reservation,
        password: String,
        iterations: NonZeroU32,
    },
    Login {
        session: SessionId,
        key: String,
        credential: PasswordHash,
        password: String,
    },
}

impl Deferred {
    /// Run the hash. Blocks the calling thread.
    pub fn resolve(self) -> Resolved {
        match self {
            Deferred::Register {
                session,
                reservation,
                password,
                iterations,
            } => Resolved::Registered {
                session,
                reservation,
                credential: PasswordHash::new(&password, iterations),
            },
            Deferred::Login {
                session,
                key,
                credential,
                password,
            } => Resolved::LoginChecked {
                session,
                verified: credential.verify(&password),
                key,
            },
        }
    }

    /// Run the hash on the blocking pool.
    pub async fn resolve_blocking(self) -> Resolved {
        let fallback = self.failure();
        match tokio::task::spawn_blocking(move || self.resolve()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Credential task failed: {}", e);
                fallback
            }
        }
    }

    fn failure(&self) -> Resolved {
        match self {
            Deferred::Register {
                session,
                reservation,
                ..
            } => Resolved::Failed {
                session: *session,
                event: ClientEvent::Register,
                reservation: Some(reservation.clone()),
            },
            Deferred::Login { session, .. } => Resolved::Failed {
                session: *session,
                event: ClientEvent::Login,
                reservation: None,
            },
        }
    }
}

/// Result of [`Deferred`] work, applied back under the lock.
#[derive(Debug)]
pub enum Resolved {
    Registered {
        session: SessionId,
        reservation: Reservation,
        credential: PasswordHash,
    },
    LoginChecked {
        session: SessionId,
        key: String,
        verified: bool,
    },
    Failed {
        session: SessionId,
        event: ClientEvent,
        reservation: Option<Reservation>,
    },
}

impl Resolved {
    /// The session that asked for the work.
    pub fn session(&self) -> SessionId {
        match self {
            Resolved::Registered { session, .. }
            | Resolved::LoginChecked { session, .. }
            | Resolved::Failed { session, .. } => *session,
        }
    }
}

#[derive(Debug)]
struct PersistPaths {
    identities: PathBuf,
    pixels: PathBuf,
}

/// State of one world.
pub struct GameState {
    pub name: String,
    pub world: WorldState,
    pub registry: ConnectionRegistry,
    governor: Governor,
    tx: broadcast::Sender<Outbound>,
    persister: Persister,
    paths: Option<PersistPaths>,
    tick_interval: Duration,
    /// Deferred credential work handed out and not yet completed.
    pending_credentials: usize,
    max_pending_credentials: usize,
    /// Bumped on every applied mutation.
    version: u64,
    pub tick_count: u64,
    // Average tick duration in milliseconds (exponential moving average).
    pub update_time_avg: f64,
}

impl GameState {
    /// Create a world, reloading persisted canvas data when available.
    pub fn new(
        name: &str,
        kind: WorldKind,
        config: &Config,
        persister: Persister,
    ) -> anyhow::Result<Self> {
        let (tx, _) = broadcast::channel(config.server.broadcast_capacity.max(16));
        let mut paths = None;

        let (world, governor, tick_interval) = match kind {
            WorldKind::House => (
                WorldState::House(HouseWorld::new(&config.house)),
                Governor::new(
                    Duration::from_millis(config.house.interaction_cooldown_ms),
                    false,
                ),
                Duration::from_secs(config.house.decay_interval_secs.max(1)),
            ),
            WorldKind::Canvas => {
                let dir = &config.canvas.data_dir;
                let (identities, pixels) = if !dir.is_empty() && persister.is_enabled() {
                    let dir = Path::new(dir);
                    let world_paths = PersistPaths {
                        identities: dir.join(format!("{}.identities.json", name)),
                        pixels: dir.join(format!("{}.pixels.json", name)),
                    };
                    let identities: Vec<IdentityRecord> =
                        persist::load_json(&world_paths.identities)?.unwrap_or_default();
                    let pixels: Vec<PixelRecord> =
                        persist::load_json(&world_paths.pixels)?.unwrap_or_default();
                    paths = Some(world_paths);
                    (identities, pixels)
                } else {
                    (Vec::new(), Vec::new())
                };

                let canvas = CanvasWorld::restore(&config.canvas, &config.auth, identities, pixels);
                info!(
                    "World {}: restored {} accounts and {} pixels",
                    name,
                    canvas.identities.len(),
                    canvas.canvas.len()
                );
                (
                    WorldState::Canvas(canvas),
                    Governor::new(Duration::ZERO, config.canvas.coalesce_repeats),
                    Duration::from_secs(config.canvas.tick_interval_secs.max(1)),
                )
            }
        };

        Ok(Self {
            name: name.to_string(),
            world,
            registry: ConnectionRegistry::new(),
            governor,
            tx,
            persister,
            paths,
            tick_interval,
            pending_credentials: 0,
            max_pending_credentials: config.auth.max_pending_hashes.max(1),
            version: 0,
            tick_count: 0,
            update_time_avg: 0.0,
        })
    }

    pub fn kind(&self) -> WorldKind {
        self.world.kind()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Receive every event of this world. Connection tasks filter by
    /// [`Audience`].
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    /// Register a new session and hand it its greeting (and the full grid on
    /// canvas worlds).
    pub fn connect(&mut self, addr: SocketAddr) -> SessionId {
        let id = self.registry.register(addr);
        self.send(Audience::Only(id), ServerPacket::Session(SessionInfo { id: id.0 }));
        if let WorldState::Canvas(canvas) = &self.world {
            let pixels = canvas.canvas.records();
            self.send(Audience::Only(id), ServerPacket::AllPixels(pixels));
        }
        id
    }

    /// Tear down a session: its player leaves the house and its gesture
    /// state is dropped.
    pub fn disconnect(&mut self, id: SessionId) {
        if self.registry.unregister(id).is_none() {
            return;
        }
        self.governor.forget(id);

        if let WorldState::House(house) = &mut self.world {
            if let Some(player) = house.leave(id) {
                let snapshot = house.snapshot();
                self.version += 1;
                info!("{} left house {}", player.name, self.name);
                self.send(
                    Audience::All,
                    ServerPacket::Notification(format!("{} left the house", player.name)),
                );
                self.send(Audience::All, ServerPacket::GameUpdate(snapshot));
            }
        }
    }

    /// Handle one text frame from a session.
    pub fn handle_text(&mut self, id: SessionId, text: &str) -> Option<Deferred> {
        match ClientPacket::parse(text) {
            Ok(packet) => self.handle_packet(id, packet),
            Err(e) => {
                warn!("Bad frame from session {}: {}", id, e);
                self.send(Audience::Only(id), ServerPacket::Error(format!("Bad request: {}", e)));
                None
            }
        }
    }

    /// Handle a parsed event. Credential checks come back as [`Deferred`]
    /// work for the caller to run and feed to [`GameState::complete`].
    pub fn handle_packet(&mut self, id: SessionId, packet: ClientPacket) -> Option<Deferred> {
        if self.registry.lookup(id).is_err() {
            warn!("Event from unknown session {}", id);
            return None;
        }
        debug!("Session {} sent {:?}", id, packet);

        let event = packet.event();
        match self.dispatch(id, packet) {
            Ok(deferred) => deferred,
            Err(e) => {
                self.reject(id, event, &e);
                None
            }
        }
    }

    fn dispatch(&mut self, id: SessionId, packet: ClientPacket) -> Result<Option<Deferred>, WorldError> {
        match packet {
            ClientPacket::JoinHouse(join) => self.join_house(id, &join.name, &join.avatar)?,
            ClientPacket::MoveRoom(room) => self.move_room(id, &room)?,
            ClientPacket::InteractPet(action) => self.interact_pet(id, &action)?,
            ClientPacket::SendKiss => self.send_kiss(id)?,
            ClientPacket::Register(creds) => {
                self.check_credential_slot(id)?;
                let deferred = self.begin_register(id, creds)?;
                return Ok(Some(self.track_credential(deferred)));
            }
            ClientPacket::Login(creds) => {
                self.check_credential_slot(id)?;
                let deferred = self.begin_login(id, creds)?;
                return Ok(Some(self.track_credential(deferred)));
            }
            ClientPacket::PlacePixel(placement) => self.place_pixel(id, &placement)?,
        }
        Ok(None)
    }

    fn house_mut(&mut self, event: ClientEvent) -> Result<&mut HouseWorld, WorldError> {
        match &mut self.world {
            WorldState::House(house) => Ok(house),
            WorldState::Canvas(_) => Err(WorldError::Unsupported(event.name())),
        }
    }

    fn canvas_mut(&mut self, event: ClientEvent) -> Result<&mut CanvasWorld, WorldError> {
        match &mut self.world {
            WorldState::Canvas(canvas) => Ok(canvas),
            WorldState::House(_) => Err(WorldError::Unsupported(event.name())),
        }
    }

    fn join_house(&mut self, id: SessionId, name: &str, avatar: &str) -> Result<(), WorldError> {
        let (newcomer, name, snapshot) = {
            let house = self.house_mut(ClientEvent::JoinHouse)?;
            let newcomer = house.player(id).is_none();
            let name = house.join(id, name, avatar)?.name.clone();
            (newcomer, name, house.snapshot())
        };
        self.version += 1;
        info!("Session {} joined house {} as {:?}", id, self.name, name);

        // The joiner gets the snapshot first, then everyone else sees it
        self.send(Audience::Only(id), ServerPacket::GameUpdate(snapshot.clone()));
        self.send(Audience::AllExcept(id), ServerPacket::GameUpdate(snapshot));
        if newcomer {
            self.send(
                Audience::All,
                ServerPacket::Notification(format!("{} entered the house", name)),
            );
        }
        Ok(())
    }

    fn move_room(&mut self, id: SessionId, room: &str) -> Result<(), WorldError> {
        let snapshot = {
            let house = self.house_mut(ClientEvent::MoveRoom)?;
            house.move_room(id, room)?;
            house.snapshot()
        };
        self.version += 1;
        self.send(Audience::All, ServerPacket::GameUpdate(snapshot));
        Ok(())
    }

    fn interact_pet(&mut self, id: SessionId, action: &str) -> Result<(), WorldError> {
        {
            let house = self.house_mut(ClientEvent::InteractPet)?;
            if house.player(id).is_none() {
                return Err(WorldError::NotJoined);
            }
            action.parse::<PetAction>()?;
        }
        self.governor.check_interaction(id, std::time::Instant::now())?;

        let (message, snapshot) = {
            let house = self.house_mut(ClientEvent::InteractPet)?;
            let action = house.interact_pet(id, action)?;
            let who = house.player(id).map(|p| p.name.clone()).unwrap_or_default();
            let message = match action {
                PetAction::Feed => format!("{} fed {}", who, house.pet.name),
                PetAction::Play => format!("{} played with {}", who, house.pet.name),
            };
            (message, house.snapshot())
        };
        self.version += 1;
        self.send(Audience::All, ServerPacket::GameUpdate(snapshot));
        self.send(Audience::All, ServerPacket::Notification(message));
        Ok(())
    }

    fn send_kiss(&mut self, id: SessionId) -> Result<(), WorldError> {
        let (from, snapshot) = {
            let house = self.house_mut(ClientEvent::SendKiss)?;
            let from = house.send_kiss(id)?;
            (from, house.snapshot())
        };
        self.version += 1;
        self.send(
            Audience::AllExcept(id),
            ServerPacket::SpecialEffect(SpecialEffect {
                kind: EffectKind::Kiss,
                from,
            }),
        );
        self.send(Audience::All, ServerPacket::GameUpdate(snapshot));
        Ok(())
    }

    /// One hash in flight per session, and a bounded number per world.
    fn check_credential_slot(&self, id: SessionId) -> Result<(), WorldError> {
        let busy = self.registry.lookup(id)?.credential_pending;
        if busy || self.pending_credentials >= self.max_pending_credentials {
            return Err(WorldError::CredentialBusy);
        }
        Ok(())
    }

    fn track_credential(&mut self, deferred: Deferred) -> Deferred {
        let session = match &deferred {
            Deferred::Register { session, .. } | Deferred::Login { session, .. } => *session,
        };
        if let Ok(entry) = self.registry.lookup_mut(session) {
            entry.credential_pending = true;
        }
        self.pending_credentials += 1;
        deferred
    }

    fn begin_register(&mut self, id: SessionId, creds: Credentials) -> Result<Deferred, WorldError> {
        let canvas = self.canvas_mut(ClientEvent::Register)?;
        let iterations = canvas.identities.iterations();
        let reservation = canvas.identities.reserve(&creds.username, &creds.password)?;
        Ok(Deferred::Register {
            session: id,
            reservation,
            password: creds.password,
            iterations,
        })
    }

    fn begin_login(&mut self, id: SessionId, creds: Credentials) -> Result<Deferred, WorldError> {
        let canvas = self.canvas_mut(ClientEvent::Login)?;
        if creds.password.is_empty() {
            return Err(WorldError::InvalidInput("Password cannot be empty".into()));
        }
        let (key, credential) = canvas.identities.credential(&creds.username)?;
        Ok(Deferred::Login {
            session: id,
            key,
            credential,
            password: creds.password,
        })
    }

    /// Apply the outcome of deferred credential work.
    pub fn complete(&mut self, resolved: Resolved) {
        self.pending_credentials = self.pending_credentials.saturating_sub(1);
        if let Ok(session) = self.registry.lookup_mut(resolved.session()) {
            session.credential_pending = false;
        }

        match resolved {
            Resolved::Registered {
                session,
                reservation,
                credential,
            } => {
                let result = match &mut self.world {
                    WorldState::Canvas(canvas) => {
                        let starting = canvas.config().starting_credits;
                        canvas
                            .identities
                            .commit(reservation, credential, starting)
                            .map(|record| record.username.clone())
                    }
                    WorldState::House(_) => Err(WorldError::Internal),
                };
                match result {
                    Ok(username) => {
                        self.version += 1;
                        info!("Registered account {:?} in world {}", username, self.name);
                        self.persist_dirty();
                        self.send(
                            Audience::Only(session),
                            ServerPacket::AuthSuccess(format!(
                                "Account {} created, you can log in now",
                                username
                            )),
                        );
                    }
                    Err(e) => self.reject(session, ClientEvent::Register, &e),
                }
            }
            Resolved::LoginChecked {
                session,
                key,
                verified,
            } => {
                if !verified {
                    warn!("Failed login for {:?} from session {}", key, session);
                    self.reject(session, ClientEvent::Login, &WorldError::BadCredential);
                    return;
                }
                if self.registry.lookup(session).is_err() {
                    debug!("Session {} left before its login completed", session);
                    return;
                }
                let account = match &mut self.world {
                    WorldState::Canvas(canvas) => {
                        let grant = canvas.config().login_grant;
                        let cap = canvas.config().credit_cap;
                        if grant > 0 {
                            canvas.identities.grant(&key, grant, cap);
                        }
                        canvas
                            .identities
                            .get(&key)
                            .map(|record| (record.username.clone(), record.pixel_credits))
                    }
                    WorldState::House(_) => None,
                };
                let Some((username, pixel_credits)) = account else {
                    self.reject(session, ClientEvent::Login, &WorldError::Internal);
                    return;
                };
                if let Err(e) = self.registry.attach_identity(session, key) {
                    self.reject(session, ClientEvent::Login, &e);
                    return;
                }
                self.version += 1;
                info!("Session {} logged in as {:?}", session, username);
                self.send(
                    Audience::Only(session),
                    ServerPacket::LoginSuccess(LoginSuccess {
                        username,
                        pixel_credits,
                    }),
                );
            }
            Resolved::Failed {
                session,
                event,
                reservation,
            } => {
                if let (Some(reservation), WorldState::Canvas(canvas)) = (reservation, &mut self.world) {
                    canvas.identities.release(&reservation);
                }
                self.reject(session, event, &WorldError::Internal);
            }
        }
    }

    fn place_pixel(&mut self, id: SessionId, placement: &PixelPlacement) -> Result<(), WorldError> {
        let identity = self.registry.identity_of(id).map(str::to_owned);
        let WorldState::Canvas(canvas) = &mut self.world else {
            return Err(WorldError::Unsupported(ClientEvent::PlacePixel.name()));
        };
        let outcome = canvas.place_pixel(
            &mut self.governor,
            id,
            identity.as_deref(),
            placement,
            now_ms(),
        )?;

        match (outcome, identity) {
            (
                Placement::Placed {
                    record,
                    credits_remaining,
                },
                Some(key),
            ) => {
                self.version += 1;
                self.broadcast_pixel(record);
                self.send(
                    Audience::Many(self.registry.sessions_of(&key)),
                    ServerPacket::UpdatePixelCredits(PixelCredits {
                        pixel_credits: credits_remaining,
                    }),
                );
            }
            (Placement::Coalesced { .. }, _) => {
                debug!("Coalesced repeat stroke from session {}", id);
            }
            (Placement::Placed { .. }, None) => return Err(WorldError::Internal),
        }
        Ok(())
    }

    fn broadcast_pixel(&self, record: PixelRecord) {
        self.send(Audience::All, ServerPacket::PixelPlaced(record));
    }

    /// Re-send the current snapshot to a session that missed events.
    pub fn resync(&mut self, id: SessionId) {
        let Ok(session) = self.registry.lookup(id) else {
            return;
        };
        let identity = session.identity.clone();
        match &self.world {
            WorldState::House(house) => {
                if house.player(id).is_some() {
                    self.send(Audience::Only(id), ServerPacket::GameUpdate(house.snapshot()));
                }
            }
            WorldState::Canvas(canvas) => {
                self.send(Audience::Only(id), ServerPacket::AllPixels(canvas.canvas.records()));
                if let Some(pixel_credits) = identity.and_then(|key| canvas.identities.credits(&key)) {
                    self.send(
                        Audience::Only(id),
                        ServerPacket::UpdatePixelCredits(PixelCredits { pixel_credits }),
                    );
                }
            }
        }
    }

    /// Periodic work: pet decay (house) or credit regeneration and
    /// persistence (canvas).
    pub fn tick(&mut self) {
        self.tick_count += 1;
        match &mut self.world {
            WorldState::House(house) => {
                // Nobody home, nothing decays
                if house.players().next().is_none() {
                    return;
                }
                if house.decay() {
                    let snapshot = house.snapshot();
                    self.version += 1;
                    self.send(Audience::All, ServerPacket::GameUpdate(snapshot));
                }
            }
            WorldState::Canvas(canvas) => {
                let regen = canvas.config().regen_amount;
                if regen > 0 {
                    let cap = canvas.config().credit_cap;
                    let mut updates = Vec::new();
                    for key in self.registry.online_identities() {
                        let before = canvas.identities.credits(&key);
                        let after = canvas.identities.grant(&key, regen, cap);
                        if let Some(after) = after.filter(|after| Some(*after) != before) {
                            updates.push((key, after));
                        }
                    }
                    if !updates.is_empty() {
                        self.version += 1;
                    }
                    for (key, pixel_credits) in updates {
                        self.send(
                            Audience::Many(self.registry.sessions_of(&key)),
                            ServerPacket::UpdatePixelCredits(PixelCredits { pixel_credits }),
                        );
                    }
                }
                self.persist_dirty();
            }
        }
    }

    /// Queue writes for whatever changed. Called on tick and at shutdown.
    pub fn persist_dirty(&mut self) {
        let (Some(paths), WorldState::Canvas(canvas)) = (&self.paths, &mut self.world) else {
            return;
        };
        // A failed write is queued again with the current contents
        if canvas.identities.take_dirty() | self.persister.take_failed(&paths.identities) {
            if let Err(e) = self.persister.save(&paths.identities, &canvas.identities.records()) {
                error!("World {}: failed to queue account save: {:#}", self.name, e);
            }
        }
        if canvas.canvas.take_dirty() | self.persister.take_failed(&paths.pixels) {
            if let Err(e) = self.persister.save(&paths.pixels, &canvas.canvas.records()) {
                error!("World {}: failed to queue pixel save: {:#}", self.name, e);
            }
        }
    }

    /// Report a rejected request to its sender on the feature's error event.
    fn reject(&self, id: SessionId, event: ClientEvent, err: &WorldError) {
        if err.kind() == ErrorKind::Internal {
            error!("Internal error handling {} from session {}", event.name(), id);
        } else {
            debug!("Rejected {} from session {}: {}", event.name(), id, err);
        }
        let message = err.to_string();
        let packet = match event {
            ClientEvent::JoinHouse
            | ClientEvent::MoveRoom
            | ClientEvent::InteractPet
            | ClientEvent::SendKiss => ServerPacket::Notification(message),
            ClientEvent::Register | ClientEvent::Login => ServerPacket::AuthError(message),
            ClientEvent::PlacePixel => ServerPacket::PixelError(message),
        };
        self.send(Audience::Only(id), packet);
    }

    fn send(&self, audience: Audience, packet: ServerPacket) {
        match packet.to_text() {
            Ok(text) => {
                // No receivers just means nobody is connected
                let _ = self.tx.send(Outbound {
                    audience,
                    version: self.version,
                    text: text.into(),
                });
            }
            Err(e) => error!("Failed to encode {}: {}", packet.name(), e),
        }
    }
}

/// Drive a world's periodic tick.
pub async fn run_world_loop(state: Arc<RwLock<GameState>>) {
    let (name, period) = {
        let game = state.read().await;
        (game.name.clone(), game.tick_interval())
    };
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("World {} ticking every {:?}", name, period);

    loop {
        ticker.tick().await;

        let mut game = state.write().await;
        let tick_start = std::time::Instant::now();
        game.tick();
        let tick_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
        game.update_time_avg = game.update_time_avg * 0.5 + tick_ms * 0.5;

        if tick_ms > 50.0 {
            warn!(
                "Slow tick #{} in world {}: {:.3}ms - {} sessions",
                game.tick_count,
                name,
                tick_ms,
                game.registry.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::house::Room;
    use protocol::Color;
    use protocol::packets::{HouseSnapshot, JoinHouse};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.canvas.data_dir = String::new();
        config.auth.pbkdf2_iterations = 1_000;
        config
    }

    fn world(kind: WorldKind) -> GameState {
        GameState::new("test", kind, &test_config(), Persister::disabled()).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    /// What one client would have received so far.
    struct Inbox {
        id: SessionId,
        rx: broadcast::Receiver<Outbound>,
    }

    impl Inbox {
        fn connect(state: &mut GameState) -> Self {
            let rx = state.subscribe();
            let id = state.connect(addr());
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerPacket> {
            let mut packets = Vec::new();
            while let Ok(out) = self.rx.try_recv() {
                if out.audience.includes(self.id) {
                    packets.push(ServerPacket::parse(&out.text).unwrap());
                }
            }
            packets
        }

        fn last_update(&mut self) -> Option<HouseSnapshot> {
            self.drain().into_iter().rev().find_map(|p| match p {
                ServerPacket::GameUpdate(snapshot) => Some(snapshot),
                _ => None,
            })
        }
    }

    fn join(state: &mut GameState, id: SessionId, name: &str) {
        let packet = ClientPacket::JoinHouse(JoinHouse {
            name: name.into(),
            avatar: "🙂".into(),
        });
        assert!(state.handle_packet(id, packet).is_none());
    }

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    fn register(state: &mut GameState, id: SessionId, username: &str, password: &str) {
        let deferred = state
            .handle_packet(id, ClientPacket::Register(creds(username, password)))
            .expect("registration should be deferred");
        state.complete(deferred.resolve());
    }

    fn login(state: &mut GameState, id: SessionId, username: &str, password: &str) {
        let deferred = state
            .handle_packet(id, ClientPacket::Login(creds(username, password)))
            .expect("login should be deferred");
        state.complete(deferred.resolve());
    }

    fn place(state: &mut GameState, id: SessionId, x: i64, y: i64, color: &str) {
        let packet = ClientPacket::PlacePixel(PixelPlacement {
            x,
            y,
            color: color.into(),
        });
        assert!(state.handle_packet(id, packet).is_none());
    }

    #[test]
    fn test_connect_greets_with_session_id() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        assert_eq!(
            bob.drain(),
            vec![ServerPacket::Session(SessionInfo { id: bob.id.0 })]
        );
    }

    #[test]
    fn test_join_sends_one_snapshot_to_joiner_and_notifies_others() {
        let mut state = world(WorldKind::House);
        let mut ana = Inbox::connect(&mut state);
        join(&mut state, ana.id, "Ana");
        ana.drain();

        let mut bob = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");

        let bob_packets = bob.drain();
        let updates = bob_packets
            .iter()
            .filter(|p| matches!(p, ServerPacket::GameUpdate(_)))
            .count();
        assert_eq!(updates, 1);

        let ana_packets = ana.drain();
        assert!(ana_packets.contains(&ServerPacket::Notification("Bob entered the house".into())));
        let snapshot = ana_packets
            .iter()
            .find_map(|p| match p {
                ServerPacket::GameUpdate(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.players[&bob.id.to_string()].room, "bedroom");
    }

    #[test]
    fn test_bob_moves_to_kitchen() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        state.handle_packet(bob.id, ClientPacket::MoveRoom("kitchen".into()));

        let snapshot = bob.last_update().unwrap();
        let me = &snapshot.players[&bob.id.to_string()];
        assert_eq!(me.room, "kitchen");
        assert!(!snapshot.players.values().any(|p| p.name == "Bob" && p.room == "bedroom"));
    }

    #[test]
    fn test_unknown_room_is_reported_to_sender_only() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        let mut ana = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        join(&mut state, ana.id, "Ana");
        bob.drain();
        ana.drain();
        let version = state.version();

        state.handle_packet(bob.id, ClientPacket::MoveRoom("attic".into()));
        assert_eq!(
            bob.drain(),
            vec![ServerPacket::Notification("Unknown room: attic".into())]
        );
        assert!(ana.drain().is_empty());
        assert_eq!(state.version(), version);
        let WorldState::House(house) = &state.world else {
            panic!("house world expected");
        };
        assert_eq!(house.player(bob.id).unwrap().room, Room::Bedroom);
    }

    #[test]
    fn test_actions_before_join_are_rejected() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        bob.drain();
        state.handle_packet(bob.id, ClientPacket::SendKiss);
        assert_eq!(
            bob.drain(),
            vec![ServerPacket::Notification("Join the house first".into())]
        );
    }

    #[test]
    fn test_feed_clamps_and_broadcasts() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        if let WorldState::House(house) = &mut state.world {
            house.pet.hunger = 95;
        }
        state.handle_packet(bob.id, ClientPacket::InteractPet("feed".into()));

        let packets = bob.drain();
        assert!(packets.contains(&ServerPacket::Notification("Bob fed Michi".into())));
        let snapshot = packets
            .into_iter()
            .rev()
            .find_map(|p| match p {
                ServerPacket::GameUpdate(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.pet.hunger, 100);
        assert_eq!(snapshot.players[&bob.id.to_string()].action, "Feeding Michi");
    }

    #[test]
    fn test_interaction_cooldown_when_configured() {
        let mut config = test_config();
        config.house.interaction_cooldown_ms = 60_000;
        let mut state =
            GameState::new("test", WorldKind::House, &config, Persister::disabled()).unwrap();
        let mut bob = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        state.handle_packet(bob.id, ClientPacket::InteractPet("play".into()));
        bob.drain();

        state.handle_packet(bob.id, ClientPacket::InteractPet("play".into()));
        let packets = bob.drain();
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0], ServerPacket::Notification(m) if m.starts_with("Slow down")));
    }

    #[test]
    fn test_kiss_goes_to_everyone_but_sender() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        let mut ana = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        join(&mut state, ana.id, "Ana");
        bob.drain();
        ana.drain();

        state.handle_packet(bob.id, ClientPacket::SendKiss);

        let kiss = ServerPacket::SpecialEffect(SpecialEffect {
            kind: EffectKind::Kiss,
            from: "Bob".into(),
        });
        let ana_packets = ana.drain();
        assert_eq!(ana_packets[0], kiss);
        let bob_packets = bob.drain();
        assert!(!bob_packets.contains(&kiss));
        match bob_packets.last() {
            Some(ServerPacket::GameUpdate(snapshot)) => assert_eq!(snapshot.love_meter, 55),
            other => panic!("expected game_update, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_removes_player() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        let mut ana = Inbox::connect(&mut state);
        join(&mut state, bob.id, "Bob");
        join(&mut state, ana.id, "Ana");
        ana.drain();

        state.disconnect(bob.id);
        let packets = ana.drain();
        assert_eq!(packets[0], ServerPacket::Notification("Bob left the house".into()));
        match &packets[1] {
            ServerPacket::GameUpdate(snapshot) => {
                assert!(!snapshot.players.contains_key(&bob.id.to_string()));
            }
            other => panic!("expected game_update, got {:?}", other),
        }
        assert_eq!(state.registry.len(), 1);

        // Events from a dead session are ignored
        assert!(state.handle_packet(bob.id, ClientPacket::SendKiss).is_none());
        assert!(ana.drain().is_empty());
        bob.drain();
    }

    #[test]
    fn test_decay_tick_broadcasts_only_on_change() {
        let mut state = world(WorldKind::House);

        // Empty house does not decay
        state.tick();
        if let WorldState::House(house) = &state.world {
            assert_eq!(house.pet.hunger, 80);
        }

        // Connected but not joined is still nobody home
        let mut bob = Inbox::connect(&mut state);
        bob.drain();
        state.tick();
        assert!(bob.drain().is_empty());
        if let WorldState::House(house) = &state.world {
            assert_eq!(house.pet.hunger, 80);
        }

        join(&mut state, bob.id, "Bob");
        bob.drain();
        state.tick();
        match bob.drain().as_slice() {
            [ServerPacket::GameUpdate(snapshot)] => {
                assert_eq!(snapshot.pet.hunger, 78);
                assert_eq!(snapshot.pet.happiness, 79);
                assert_eq!(snapshot.love_meter, 49);
            }
            other => panic!("expected one game_update, got {:?}", other),
        }

        if let WorldState::House(house) = &mut state.world {
            house.pet.hunger = 0;
            house.pet.happiness = 0;
            house.love_meter = 0;
        }
        state.tick();
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_malformed_frame_gets_generic_error() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        bob.drain();
        assert!(state.handle_text(bob.id, "{oops").is_none());
        assert!(matches!(bob.drain().as_slice(), [ServerPacket::Error(_)]));
    }

    #[test]
    fn test_canvas_events_rejected_in_house_world() {
        let mut state = world(WorldKind::House);
        let mut bob = Inbox::connect(&mut state);
        bob.drain();
        place(&mut state, bob.id, 1, 1, "#ffffff");
        assert_eq!(
            bob.drain(),
            vec![ServerPacket::PixelError("placePixel is not available in this world".into())]
        );
        assert!(state.handle_packet(bob.id, ClientPacket::Login(creds("a", "b"))).is_none());
        assert!(matches!(bob.drain().as_slice(), [ServerPacket::AuthError(_)]));
    }

    #[test]
    fn test_canvas_connect_sends_all_pixels() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        let packets = s1.drain();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1], ServerPacket::AllPixels(Vec::new()));
    }

    #[test]
    fn test_ana_scenario() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        s1.drain();

        register(&mut state, s1.id, "ana", "secret");
        assert!(matches!(s1.drain().as_slice(), [ServerPacket::AuthSuccess(_)]));

        login(&mut state, s1.id, "ana", "secret");
        assert_eq!(
            s1.drain(),
            vec![ServerPacket::LoginSuccess(LoginSuccess {
                username: "ana".into(),
                pixel_credits: 100,
            })]
        );

        place(&mut state, s1.id, 5, 5, "#ff0000");
        let packets = s1.drain();
        assert!(matches!(&packets[0], ServerPacket::PixelPlaced(r) if r.color == Color::new(255, 0, 0)));
        assert_eq!(
            packets[1],
            ServerPacket::UpdatePixelCredits(PixelCredits { pixel_credits: 99 })
        );

        // A second session paints over the same cell
        let mut s2 = Inbox::connect(&mut state);
        register(&mut state, s2.id, "bea", "pw");
        login(&mut state, s2.id, "bea", "pw");
        place(&mut state, s2.id, 5, 5, "#00ff00");
        s2.drain();
        let seen_by_ana = s1.drain();
        assert!(matches!(
            seen_by_ana.as_slice(),
            [ServerPacket::PixelPlaced(r)] if r.placed_by == "bea"
        ));

        let mut s3 = Inbox::connect(&mut state);
        match &s3.drain()[1] {
            ServerPacket::AllPixels(pixels) => {
                assert_eq!(pixels.len(), 1);
                assert_eq!((pixels[0].x, pixels[0].y), (5, 5));
                assert_eq!(pixels[0].color, Color::new(0, 255, 0));
            }
            other => panic!("expected allPixels, got {:?}", other),
        }
    }

    #[test]
    fn test_credits_shared_across_sessions_of_one_account() {
        let mut config = test_config();
        config.canvas.starting_credits = 2;
        let mut state =
            GameState::new("test", WorldKind::Canvas, &config, Persister::disabled()).unwrap();
        let mut s1 = Inbox::connect(&mut state);
        let mut s2 = Inbox::connect(&mut state);
        register(&mut state, s1.id, "ana", "secret");
        login(&mut state, s1.id, "ana", "secret");
        login(&mut state, s2.id, "ana", "secret");
        s1.drain();
        s2.drain();

        place(&mut state, s1.id, 0, 0, "#000000");
        place(&mut state, s2.id, 1, 0, "#000000");
        place(&mut state, s1.id, 2, 0, "#000000");

        let s2_packets = s2.drain();
        assert!(s2_packets.contains(&ServerPacket::UpdatePixelCredits(PixelCredits {
            pixel_credits: 1
        })));
        assert!(s2_packets.contains(&ServerPacket::UpdatePixelCredits(PixelCredits {
            pixel_credits: 0
        })));
        assert_eq!(
            s1.drain().last(),
            Some(&ServerPacket::PixelError("You have no pixel credits left".into()))
        );
        let WorldState::Canvas(canvas) = &state.world else {
            panic!("canvas world expected");
        };
        assert_eq!(canvas.canvas.len(), 2);
        assert_eq!(canvas.identities.credits("ana"), Some(0));
    }

    #[test]
    fn test_concurrent_register_same_username() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        let mut s2 = Inbox::connect(&mut state);
        s1.drain();
        s2.drain();

        let first = state.handle_packet(s1.id, ClientPacket::Register(creds("ana", "one")));
        let second = state.handle_packet(s2.id, ClientPacket::Register(creds("ana", "two")));
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(
            s2.drain(),
            vec![ServerPacket::AuthError("That username is already taken".into())]
        );

        state.complete(first.unwrap().resolve());
        assert!(matches!(s1.drain().as_slice(), [ServerPacket::AuthSuccess(_)]));
    }

    #[test]
    fn test_failed_hash_releases_username() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        s1.drain();
        let deferred = state
            .handle_packet(s1.id, ClientPacket::Register(creds("ana", "one")))
            .unwrap();
        state.complete(deferred.failure());
        assert_eq!(
            s1.drain(),
            vec![ServerPacket::AuthError("Something went wrong, please try again".into())]
        );
        assert!(state
            .handle_packet(s1.id, ClientPacket::Register(creds("ana", "one")))
            .is_some());
    }

    #[test]
    fn test_second_credential_request_waits_for_first() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        register(&mut state, s1.id, "ana", "secret");
        s1.drain();

        let first = state
            .handle_packet(s1.id, ClientPacket::Login(creds("ana", "secret")))
            .unwrap();
        assert!(state
            .handle_packet(s1.id, ClientPacket::Login(creds("ana", "secret")))
            .is_none());
        assert!(state
            .handle_packet(s1.id, ClientPacket::Register(creds("bea", "pw")))
            .is_none());
        assert_eq!(
            s1.drain(),
            vec![
                ServerPacket::AuthError("Still checking your last request, please wait".into()),
                ServerPacket::AuthError("Still checking your last request, please wait".into()),
            ]
        );

        state.complete(first.resolve());
        assert!(matches!(s1.drain().as_slice(), [ServerPacket::LoginSuccess(_)]));
        // The slot is free again, even after a wrong password
        login(&mut state, s1.id, "ana", "wrong");
        login(&mut state, s1.id, "ana", "secret");
        assert!(matches!(
            s1.drain().as_slice(),
            [ServerPacket::AuthError(_), ServerPacket::LoginSuccess(_)]
        ));
    }

    #[test]
    fn test_credential_work_is_capped_per_world() {
        let mut config = test_config();
        config.auth.max_pending_hashes = 2;
        let mut state =
            GameState::new("test", WorldKind::Canvas, &config, Persister::disabled()).unwrap();
        let mut sessions: Vec<Inbox> = (0..3).map(|_| Inbox::connect(&mut state)).collect();
        for inbox in &mut sessions {
            inbox.drain();
        }

        let first = state
            .handle_packet(sessions[0].id, ClientPacket::Register(creds("ana", "pw")))
            .unwrap();
        let second = state
            .handle_packet(sessions[1].id, ClientPacket::Register(creds("bea", "pw")))
            .unwrap();
        assert!(state
            .handle_packet(sessions[2].id, ClientPacket::Register(creds("cleo", "pw")))
            .is_none());
        assert_eq!(
            sessions[2].drain(),
            vec![ServerPacket::AuthError("Still checking your last request, please wait".into())]
        );

        // A failed hash gives its slot back too
        state.complete(first.failure());
        let third = state
            .handle_packet(sessions[2].id, ClientPacket::Register(creds("cleo", "pw")))
            .unwrap();
        state.complete(second.resolve());
        state.complete(third.resolve());
        assert!(matches!(sessions[1].drain().as_slice(), [ServerPacket::AuthSuccess(_)]));
        assert!(matches!(sessions[2].drain().as_slice(), [ServerPacket::AuthSuccess(_)]));
        assert_eq!(state.pending_credentials, 0);
    }

    #[test]
    fn test_login_failures() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        register(&mut state, s1.id, "ana", "secret");
        s1.drain();

        login(&mut state, s1.id, "ana", "wrong");
        assert_eq!(s1.drain(), vec![ServerPacket::AuthError("Wrong password".into())]);

        assert!(state
            .handle_packet(s1.id, ClientPacket::Login(creds("nobody", "pw")))
            .is_none());
        assert_eq!(
            s1.drain(),
            vec![ServerPacket::AuthError("No account with that username".into())]
        );
        assert_eq!(state.registry.identity_of(s1.id), None);
    }

    #[test]
    fn test_placement_requires_login_and_bounds() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        s1.drain();
        place(&mut state, s1.id, 1, 1, "#ff0000");
        assert_eq!(
            s1.drain(),
            vec![ServerPacket::PixelError("Please log in before painting".into())]
        );
        place(&mut state, s1.id, 80, 1, "#ff0000");
        assert_eq!(
            s1.drain(),
            vec![ServerPacket::PixelError("Pixel (80, 1) is outside the canvas".into())]
        );
    }

    #[test]
    fn test_login_grant_and_regen() {
        let mut config = test_config();
        config.canvas.starting_credits = 10;
        config.canvas.login_grant = 5;
        config.canvas.regen_amount = 3;
        config.canvas.credit_cap = 20;
        let mut state =
            GameState::new("test", WorldKind::Canvas, &config, Persister::disabled()).unwrap();
        let mut s1 = Inbox::connect(&mut state);
        register(&mut state, s1.id, "ana", "secret");
        login(&mut state, s1.id, "ana", "secret");
        assert!(s1.drain().contains(&ServerPacket::LoginSuccess(LoginSuccess {
            username: "ana".into(),
            pixel_credits: 15,
        })));

        state.tick();
        state.tick();
        assert_eq!(
            s1.drain(),
            vec![
                ServerPacket::UpdatePixelCredits(PixelCredits { pixel_credits: 18 }),
                ServerPacket::UpdatePixelCredits(PixelCredits { pixel_credits: 20 }),
            ]
        );
        state.tick();
        assert!(s1.drain().is_empty());
    }

    #[test]
    fn test_resync_replays_current_snapshot() {
        let mut state = world(WorldKind::Canvas);
        let mut s1 = Inbox::connect(&mut state);
        register(&mut state, s1.id, "ana", "secret");
        login(&mut state, s1.id, "ana", "secret");
        place(&mut state, s1.id, 3, 4, "#123456");
        s1.drain();

        state.resync(s1.id);
        match s1.drain().as_slice() {
            [ServerPacket::AllPixels(pixels), ServerPacket::UpdatePixelCredits(credits)] => {
                assert_eq!(pixels.len(), 1);
                assert_eq!(credits.pixel_credits, 99);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canvas_survives_restart() {
        let dir = std::env::temp_dir().join(format!("hearth-restart-{}", std::process::id()));
        let mut config = test_config();
        config.canvas.data_dir = dir.to_string_lossy().into_owned();

        let persister = Persister::spawn();
        let mut state =
            GameState::new("canvas", WorldKind::Canvas, &config, persister.clone()).unwrap();
        let s1 = state.connect(addr());
        register(&mut state, s1, "ana", "secret");
        login(&mut state, s1, "ana", "secret");
        place(&mut state, s1, 7, 8, "#abcdef");
        state.tick();
        persister.flushed().await;
        drop(state);

        let mut state = GameState::new("canvas", WorldKind::Canvas, &config, persister).unwrap();
        let WorldState::Canvas(canvas) = &state.world else {
            panic!("canvas world expected");
        };
        assert_eq!(canvas.identities.credits("ana"), Some(99));
        assert_eq!(canvas.canvas.get(7, 8).map(|p| p.color), Some(Color::new(0xab, 0xcd, 0xef)));

        // Accounts come back usable
        let s2 = state.connect(addr());
        login(&mut state, s2, "ANA", "secret");
        assert_eq!(state.registry.identity_of(s2), Some("ana"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_failed_pixel_save_is_retried() {
        let dir = std::env::temp_dir().join(format!("hearth-retry-{}", rand::random::<u64>()));
        let mut config = test_config();
        config.canvas.data_dir = dir.to_string_lossy().into_owned();
        // A directory in place of the temporary file makes the pixel write fail
        let obstacle = dir.join("canvas.pixels.json.tmp");
        std::fs::create_dir_all(&obstacle).unwrap();

        let persister = Persister::spawn();
        let mut state =
            GameState::new("canvas", WorldKind::Canvas, &config, persister.clone()).unwrap();
        let s1 = state.connect(addr());
        register(&mut state, s1, "ana", "secret");
        login(&mut state, s1, "ana", "secret");
        place(&mut state, s1, 2, 3, "#00ff00");
        state.tick();
        persister.flushed().await;
        let pixels = dir.join("canvas.pixels.json");
        assert!(!pixels.exists());

        // Nothing new was painted, the next tick still writes the pixel
        std::fs::remove_dir_all(&obstacle).unwrap();
        state.tick();
        persister.flushed().await;
        let saved: Vec<PixelRecord> = persist::load_json(&pixels).unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!((saved[0].x, saved[0].y), (2, 3));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_versions_never_go_backwards() {
        let mut state = world(WorldKind::House);
        let mut rx = state.subscribe();
        let bob = state.connect(addr());
        join(&mut state, bob, "Bob");
        for room in ["kitchen", "garden", "attic", "living"] {
            state.handle_packet(bob, ClientPacket::MoveRoom(room.into()));
        }
        state.handle_packet(bob, ClientPacket::SendKiss);

        let mut last = 0;
        while let Ok(out) = rx.try_recv() {
            assert!(out.version >= last);
            last = out.version;
        }
        assert_eq!(last, state.version());
    }
}
