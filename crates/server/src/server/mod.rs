//! WebSocket server: admission, routing and per-connection loops.

use crate::config::Config;
use crate::persist::Persister;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path as WorldPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use protocol::packets::ServerPacket;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

pub mod client;
pub mod game;
pub mod registry;

pub use client::{Session, SessionId};
pub use game::{Audience, Deferred, GameState, Outbound, Resolved, run_world_loop};
pub use registry::ConnectionRegistry;

/// Largest WebSocket message accepted before the socket is dropped.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Connection tracking state (shared across connection handlers).
#[derive(Debug, Default)]
struct ConnectionState {
    /// Number of connections per IP address.
    ip_connections: HashMap<IpAddr, usize>,
    total_connections: usize,
    ban_list: HashSet<IpAddr>,
}

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Banned,
    Full,
}

impl ConnectionState {
    /// Load ban list from file. One IP per line, `#` starts a comment.
    fn load_ban_list(&mut self, path: &Path) {
        if !path.exists() {
            info!("No ban list file found at {:?}", path);
            return;
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let mut count = 0;
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Ok(ip) = line.parse::<IpAddr>() {
                        self.ban_list.insert(ip);
                        count += 1;
                    } else {
                        warn!("Invalid IP in ban list: {}", line);
                    }
                }
                info!("Loaded {} IP bans from {:?}", count, path);
            }
            Err(e) => {
                warn!("Failed to load ban list from {:?}: {}", path, e);
            }
        }
    }

    fn try_add_connection(&mut self, ip: IpAddr, max_total: usize, max_per_ip: usize) -> Result<(), Refusal> {
        if self.ban_list.contains(&ip) {
            return Err(Refusal::Banned);
        }
        if self.total_connections >= max_total {
            return Err(Refusal::Full);
        }
        let current = self.ip_connections.get(&ip).copied().unwrap_or(0);
        if current >= max_per_ip {
            return Err(Refusal::Full);
        }

        *self.ip_connections.entry(ip).or_insert(0) += 1;
        self.total_connections += 1;
        Ok(())
    }

    fn remove_connection(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_connections.get_mut(&ip) {
            if *count > 0 {
                *count -= 1;
                self.total_connections = self.total_connections.saturating_sub(1);
            }
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }
}

/// An admitted connection. Releases its slot when dropped, whether or not
/// the upgrade went through.
struct ConnectionSlot {
    connections: Arc<Mutex<ConnectionState>>,
    ip: IpAddr,
}

impl ConnectionSlot {
    fn acquire(
        connections: &Arc<Mutex<ConnectionState>>,
        ip: IpAddr,
        max_total: usize,
        max_per_ip: usize,
    ) -> Result<Self, Refusal> {
        let mut state = connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.try_add_connection(ip, max_total, max_per_ip)?;
        Ok(Self {
            connections: Arc::clone(connections),
            ip,
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut state = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.remove_connection(self.ip);
    }
}

type Worlds = HashMap<String, Arc<RwLock<GameState>>>;

#[derive(Clone)]
struct AppState {
    worlds: Arc<Worlds>,
    connections: Arc<Mutex<ConnectionState>>,
    max_connections: usize,
    ip_limit: usize,
}

/// Create every configured world.
pub fn build_worlds(config: &Config, persister: &Persister) -> anyhow::Result<Worlds> {
    let mut worlds = HashMap::new();
    for world in &config.worlds {
        let state = GameState::new(&world.name, world.kind, config, persister.clone())?;
        worlds.insert(world.name.clone(), Arc::new(RwLock::new(state)));
    }
    Ok(worlds)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{world}", get(websocket_handler))
        .route("/health", get(health))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct WorldHealth {
    name: String,
    kind: String,
    sessions: usize,
    version: u64,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    worlds: Vec<WorldHealth>,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let mut worlds = Vec::with_capacity(state.worlds.len());
    for game in state.worlds.values() {
        let game = game.read().await;
        worlds.push(WorldHealth {
            name: game.name.clone(),
            kind: game.kind().to_string(),
            sessions: game.registry.len(),
            version: game.version(),
        });
    }
    worlds.sort_by(|a, b| a.name.cmp(&b.name));
    let connections = state
        .connections
        .lock()
        .map(|c| c.total_connections)
        .unwrap_or_else(|poisoned| poisoned.into_inner().total_connections);
    Json(Health {
        status: "ok",
        connections,
        worlds,
    })
}

/// Admit a WebSocket connection into the named world.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    WorldPath(world): WorldPath<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Some(game) = state.worlds.get(&world).cloned() else {
        debug!("Connection from {} asked for unknown world {:?}", addr, world);
        return (StatusCode::NOT_FOUND, format!("No world named {}", world)).into_response();
    };

    let slot = match ConnectionSlot::acquire(
        &state.connections,
        addr.ip(),
        state.max_connections,
        state.ip_limit,
    ) {
        Ok(slot) => slot,
        Err(Refusal::Banned) => {
            warn!("Connection rejected (IP banned): {}", addr);
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(Refusal::Full) => {
            warn!("Connection rejected (limit reached): {}", addr);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            if let Err(e) = handle_connection(socket, addr, game).await {
                error!("Connection error from {}: {:#}", addr, e);
            }
        })
        .into_response()
}

/// Run one session until either side closes.
async fn handle_connection(
    socket: WebSocket,
    addr: SocketAddr,
    game: Arc<RwLock<GameState>>,
) -> anyhow::Result<()> {
    let (mut write, mut read) = socket.split();

    // Subscribe before connecting so the greeting is not missed
    let (id, world, mut rx) = {
        let mut state = game.write().await;
        let rx = state.subscribe();
        (state.connect(addr), state.name.clone(), rx)
    };
    info!("Session {} connected to {} from {}", id, world, addr);

    let result = async {
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let deferred = game.write().await.handle_text(id, text.as_str());
                            if let Some(deferred) = deferred {
                                let game = Arc::clone(&game);
                                tokio::spawn(async move {
                                    let resolved = deferred.resolve_blocking().await;
                                    game.write().await.complete(resolved);
                                });
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let reply = ServerPacket::Error("Only text frames are supported".into()).to_text()?;
                            write.send(Message::Text(reply.into())).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Session {} closed", id);
                            break;
                        }
                        // Ping and pong are answered by axum
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("WebSocket error from session {}: {}", id, e);
                            break;
                        }
                    }
                }
                out = rx.recv() => {
                    match out {
                        Ok(out) => {
                            if !out.audience.includes(id) {
                                continue;
                            }
                            if let Err(e) = write.send(Message::Text(out.text.to_string().into())).await {
                                debug!("Failed to send to session {}: {}", id, e);
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Session {} fell {} events behind, resyncing", id, skipped);
                            game.write().await.resync(id);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    game.write().await.disconnect(id);
    info!("Session {} disconnected from {}", id, world);
    result
}

/// Serve on `listener` until `shutdown` resolves, then flush durable state.
pub async fn serve_with_shutdown<F>(listener: TcpListener, config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let persister = if config.canvas.data_dir.is_empty() {
        Persister::disabled()
    } else {
        Persister::spawn()
    };
    let worlds = build_worlds(&config, &persister)?;

    let loops: Vec<_> = worlds
        .values()
        .map(|game| tokio::spawn(run_world_loop(Arc::clone(game))))
        .collect();

    let mut connections = ConnectionState::default();
    connections.load_ban_list(Path::new(&config.server.ban_list));

    let worlds = Arc::new(worlds);
    let state = AppState {
        worlds: Arc::clone(&worlds),
        connections: Arc::new(Mutex::new(connections)),
        max_connections: config.server.max_connections,
        ip_limit: config.server.ip_limit,
    };

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    for handle in loops {
        handle.abort();
    }
    // Second pass picks up writes that failed during the first
    for _ in 0..2 {
        for game in worlds.values() {
            game.write().await.persist_dirty();
        }
        persister.flushed().await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Run the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);
    for world in &config.worlds {
        info!("  {} world: ws://{}/ws/{}", world.kind, addr, world.name);
    }

    serve_with_shutdown(listener, config, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_per_ip_and_total_limits() {
        let mut state = ConnectionState::default();
        assert_eq!(state.try_add_connection(ip("10.0.0.1"), 3, 2), Ok(()));
        assert_eq!(state.try_add_connection(ip("10.0.0.1"), 3, 2), Ok(()));
        assert_eq!(state.try_add_connection(ip("10.0.0.1"), 3, 2), Err(Refusal::Full));
        assert_eq!(state.try_add_connection(ip("10.0.0.2"), 3, 2), Ok(()));
        assert_eq!(state.try_add_connection(ip("10.0.0.3"), 3, 2), Err(Refusal::Full));

        state.remove_connection(ip("10.0.0.1"));
        assert_eq!(state.try_add_connection(ip("10.0.0.3"), 3, 2), Ok(()));
    }

    #[test]
    fn test_banned_ip_refused() {
        let mut state = ConnectionState::default();
        state.ban_list.insert(ip("10.0.0.9"));
        assert_eq!(state.try_add_connection(ip("10.0.0.9"), 10, 10), Err(Refusal::Banned));
        assert_eq!(state.total_connections, 0);
    }

    #[test]
    fn test_slot_released_on_drop() {
        let connections = Arc::new(Mutex::new(ConnectionState::default()));
        let slot = ConnectionSlot::acquire(&connections, ip("10.0.0.1"), 1, 1).unwrap();
        assert!(ConnectionSlot::acquire(&connections, ip("10.0.0.2"), 1, 1).is_err());
        drop(slot);
        assert!(ConnectionSlot::acquire(&connections, ip("10.0.0.2"), 1, 1).is_ok());
        assert!(connections.lock().unwrap().ip_connections.get(&ip("10.0.0.1")).is_none());
    }

    #[test]
    fn test_ban_list_file() {
        let dir = std::env::temp_dir().join(format!("hearth-ban-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("banlist.txt");
        std::fs::write(&path, "# comment\n10.0.0.7\n\nnot-an-ip\n::1\n").unwrap();

        let mut state = ConnectionState::default();
        state.load_ban_list(&path);
        assert_eq!(state.ban_list.len(), 2);
        assert!(state.ban_list.contains(&ip("::1")));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
