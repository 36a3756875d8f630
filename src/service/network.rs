//! # Network Manager
//!
//! The client's public face: owns the lifecycle state machine, the connection
//! manager and the packet router, and runs the relay-to-game-server handoff.
//!
//! Every public request first checks that the current [`ConnectionState`] allows
//! it. A rejected call publishes a [`NetworkEvent::Error`], leaves the state alone
//! and sends nothing. Methods return `bool` instead of `Result`: failures are
//! reported to the consumer through the event queue only.
//!
//! ## Lifecycle
//! ```text
//! Initial ─connect─▶ ConnectingToConnectServer ─▶ ConnectedToConnectServer
//!   ─list─▶ RequestingServerList ─▶ ReceivedServerList
//!   ─server─▶ RequestingConnectionInfo ─▶ ReceivedConnectionInfo
//!   ─handoff─▶ ConnectingToGameServer ─▶ ConnectedToGameServer
//!   ─login─▶ Authenticating ─▶ SelectingCharacter ─select─▶ InGame
//! (any) ─loss/disconnect─▶ Disconnected
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ClientSettings, ProtocolVersion};
use crate::core::builder::{self, LoginRequest};
use crate::error::constants::{
    ERR_CONNECTION_LOST, ERR_CONNECT_FAILED, ERR_GAME_SERVER_CONNECT_FAILED, ERR_NOT_CONNECTED,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{HandlerContext, PacketRouter, RoutingMode};
use crate::protocol::events::{event_queue, EventPublisher, EventQueue, NetworkEvent, ServerInfo};
use crate::protocol::state::ConnectionState;
use crate::service::connection::{ConnectionManager, PacketSink};
use crate::transport::cipher::CipherPipeline;
use crate::utils::metrics::Metrics;

use ConnectionState::*;

/// Generation value meaning "no connection attached"
const DETACHED: u64 = 0;

/// Held from a walk request until its acknowledgement arrives
#[derive(Debug, Default)]
pub struct InteractionLock {
    held: AtomicBool,
}

impl InteractionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock. Returns false if it is already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock. Returns whether it was held.
    pub fn release(&self) -> bool {
        self.held.swap(false, Ordering::AcqRel)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

struct Inner {
    this: Weak<Inner>,
    settings: ClientSettings,
    state: Mutex<ConnectionState>,
    events: EventPublisher,
    connection: ConnectionManager,
    router: PacketRouter,
    metrics: Arc<Metrics>,
    servers: RwLock<Arc<[ServerInfo]>>,
    movement_lock: InteractionLock,
    pending_character: Mutex<Option<String>>,
    /// Generation whose packets reach the router
    attached: AtomicU64,
    /// Serializes connect, handoff and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    /// Cancels every receive loop when the manager shuts down
    shutdown: CancellationToken,
    started: Instant,
}

/// Client network manager. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    /// Build a manager and the consumer queue its events go to.
    ///
    /// # Errors
    /// Fails if the handler tables contain a duplicate registration.
    pub fn new(
        settings: ClientSettings,
        cipher: Arc<dyn CipherPipeline>,
    ) -> Result<(Self, EventQueue)> {
        let metrics = Arc::new(Metrics::new());
        let router = PacketRouter::new(settings.game.protocol_version, Arc::clone(&metrics))?
            .with_suppressed(&settings.routing.suppressed_packets);
        Ok(Self::with_router(settings, cipher, router, metrics))
    }

    /// Build a manager around a caller-provided router
    pub fn with_router(
        settings: ClientSettings,
        cipher: Arc<dyn CipherPipeline>,
        router: PacketRouter,
        metrics: Arc<Metrics>,
    ) -> (Self, EventQueue) {
        let (events, queue) = event_queue();
        let connection =
            ConnectionManager::new(cipher, settings.timeouts.clone(), Arc::clone(&metrics));

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            settings,
            state: Mutex::new(Initial),
            events,
            connection,
            router,
            metrics,
            servers: RwLock::new(Arc::from(Vec::new())),
            movement_lock: InteractionLock::new(),
            pending_character: Mutex::new(None),
            attached: AtomicU64::new(DETACHED),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        });

        (Self { inner }, queue)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Last server list received from the relay server
    pub fn server_list(&self) -> Arc<[ServerInfo]> {
        let servers = self.inner.servers.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&servers)
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.inner.router.routing_mode()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_movement_locked(&self) -> bool {
        self.inner.movement_lock.is_held()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Open the relay connection configured in the settings.
    ///
    /// Allowed from `Initial` and `Disconnected`.
    #[instrument(skip(self), fields(host = %self.inner.settings.connect_server.host, port = self.inner.settings.connect_server.port))]
    pub async fn connect_to_connect_server(&self) -> bool {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if !inner.transition(&[Initial, Disconnected], ConnectingToConnectServer) {
            inner.reject("connect to connect server");
            return false;
        }

        // A previous cycle's connection is gone before the new one opens
        inner.detach();
        inner.connection.disconnect().await;
        inner.router.set_routing_mode(RoutingMode::Relay);

        let host = inner.settings.connect_server.host.clone();
        let port = inner.settings.connect_server.port;
        if !inner.connection.connect(&host, port, false, &inner.shutdown).await {
            inner.fail_connect(format!("{ERR_CONNECT_FAILED} ({host}:{port})"));
            return false;
        }

        // Advance before the receive loop starts so a loss it detects lands last
        inner.advance(ConnectedToConnectServer);
        if let Err(e) = inner.attach() {
            inner.fail_connect(format!("{ERR_CONNECT_FAILED}: {e}"));
            return false;
        }
        true
    }

    /// Ask the relay server for the game server list
    pub fn request_server_list(&self) -> bool {
        self.inner.perform(
            "request server list",
            &[ConnectedToConnectServer, ReceivedServerList],
            Some(RequestingServerList),
            |buf| Ok(builder::server_list_request(buf)),
        )
    }

    /// Ask the relay server where game server `server_id` lives.
    ///
    /// The reply starts the handoff on its own.
    pub fn request_game_server_connection(&self, server_id: u16) -> bool {
        if self.inner.current_state() != ReceivedServerList {
            self.inner.reject("request game server connection");
            return false;
        }
        let servers = self.server_list();
        if !servers.is_empty() && !servers.iter().any(|s| s.id == server_id) {
            warn!(server_id, "Requested server is not in the server list");
            self.inner
                .events
                .error(format!("Unknown game server {server_id}"));
            return false;
        }

        self.inner.perform(
            "request game server connection",
            &[ReceivedServerList],
            Some(RequestingConnectionInfo),
            |buf| Ok(builder::connection_info_request(buf, server_id)),
        )
    }

    /// Hand off from the relay connection to the game server at `host:port`.
    ///
    /// The relay connection is detached and fully disconnected before the game
    /// connection opens, so the router never sees both.
    #[instrument(skip(self))]
    pub async fn switch_to_game_server(&self, host: &str, port: u16) -> bool {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if !inner.transition(
            &[RequestingConnectionInfo, ReceivedConnectionInfo],
            ReceivedConnectionInfo,
        ) {
            inner.reject("switch to game server");
            return false;
        }

        inner.detach();
        inner.connection.disconnect().await;
        inner.advance(ConnectingToGameServer);
        inner.router.set_routing_mode(RoutingMode::Gameplay);

        let use_encryption = inner.settings.game.use_encryption;
        if !inner
            .connection
            .connect(host, port, use_encryption, &inner.shutdown)
            .await
        {
            inner.fail_connect(format!("{ERR_GAME_SERVER_CONNECT_FAILED} ({host}:{port})"));
            return false;
        }
        inner.advance(ConnectedToGameServer);
        if let Err(e) = inner.attach() {
            inner.fail_connect(format!("{ERR_GAME_SERVER_CONNECT_FAILED}: {e}"));
            return false;
        }

        info!(host, port, "Handoff to game server complete");
        true
    }

    /// Send account credentials to the game server
    pub fn send_login_request(&self, username: &str, password: &str) -> bool {
        let game = &self.inner.settings.game;
        let request = LoginRequest {
            username,
            password,
            tick_count: self.inner.tick_count(),
            client_version: game.client_version_bytes(),
            client_serial: game.client_serial.as_bytes(),
        };
        self.inner.perform(
            "send login request",
            &[ConnectedToGameServer],
            Some(Authenticating),
            |buf| builder::login_request(buf, &request),
        )
    }

    /// Ask for the account's characters again (after a character was deleted or created)
    pub fn request_character_list(&self) -> bool {
        self.inner.perform(
            "request character list",
            &[SelectingCharacter],
            None,
            |buf| Ok(builder::character_list_request(buf)),
        )
    }

    /// Enter the world with `name`. The state moves to `InGame` when the server confirms.
    pub fn send_select_character_request(&self, name: &str) -> bool {
        let sent = self.inner.perform(
            "select character",
            &[SelectingCharacter],
            None,
            |buf| builder::select_character_request(buf, name),
        );
        if sent {
            *self.inner.pending() = Some(name.to_string());
        }
        sent
    }

    /// Tell the game server the client has finished loading the current map
    pub fn send_client_ready(&self) -> bool {
        self.inner.perform("send client ready", &[InGame], None, |buf| {
            Ok(builder::client_ready(buf))
        })
    }

    /// Public chat as the selected character
    pub fn send_chat_message(&self, message: &str) -> bool {
        let sender = self.inner.pending_character().unwrap_or_default();
        self.inner.perform("send chat message", &[InGame], None, |buf| {
            builder::chat_message(buf, &sender, message)
        })
    }

    pub fn send_whisper(&self, receiver: &str, message: &str) -> bool {
        self.inner.perform("send whisper", &[InGame], None, |buf| {
            builder::whisper_message(buf, receiver, message)
        })
    }

    /// Walk from `source` along `steps` (directions 0..=7).
    ///
    /// Takes the movement lock; a second walk before the acknowledgement is rejected.
    pub fn send_walk_request(&self, source: (u8, u8), steps: &[u8]) -> bool {
        let inner = &self.inner;
        let state = inner.current_state();
        if state != InGame {
            inner.reject("send walk request");
            return false;
        }
        if !inner.movement_lock.try_acquire() {
            warn!("Walk requested while a previous walk is unacknowledged");
            inner.events.error("Movement already in progress");
            return false;
        }

        let version = inner.protocol_version();
        let sent = inner.perform("send walk request", &[InGame], None, |buf| {
            builder::walk_request(buf, version, source, steps)
        });
        if !sent {
            inner.movement_lock.release();
        }
        sent
    }

    pub fn send_pickup_item_request(&self, item_id: u16) -> bool {
        let version = self.inner.protocol_version();
        self.inner.perform("pick up item", &[InGame], None, |buf| {
            Ok(builder::pickup_item_request(buf, version, item_id))
        })
    }

    /// Leave the game; `kind` 0 quits, 1 returns to character select, 2 to server select
    pub fn send_logout_request(&self, kind: u8) -> bool {
        self.inner.perform(
            "send logout request",
            &[SelectingCharacter, InGame],
            None,
            |buf| Ok(builder::logout_request(buf, kind)),
        )
    }

    /// Tear down whatever connection is active and move to `Disconnected`.
    /// Safe to call from any state, any number of times.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.detach();
        inner.connection.disconnect().await;
        inner.reset_session();
        inner.advance(Disconnected);
    }

    /// Disconnect and stop every receive loop this manager started
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect().await;
        self.inner.metrics.log_metrics();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Option<String>> {
        self.pending_character
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Set the state unconditionally. The change event is queued under the state
    /// lock so concurrent transitions reach the consumer in order.
    fn advance(&self, next: ConnectionState) {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, next);
        if previous != next {
            self.notify(previous, next);
        }
    }

    fn notify(&self, previous: ConnectionState, current: ConnectionState) {
        info!(from = %previous, to = %current, "Connection state changed");
        self.events
            .publish(NetworkEvent::StateChanged { previous, current });
    }

    fn reject(&self, action: &'static str) {
        let state = self.current_state();
        let error = ProtocolError::InvalidState { action, state };
        warn!(action, state = %state, "Rejected action in current state");
        self.events.error(error.to_string());
    }

    /// Guard, build, advance, send. Nothing is mutated or sent unless every
    /// earlier step succeeded.
    fn perform<F>(
        &self,
        action: &'static str,
        allowed: &[ConnectionState],
        next: Option<ConnectionState>,
        build: F,
    ) -> bool
    where
        F: FnOnce(&mut BytesMut) -> Result<usize>,
    {
        if !allowed.contains(&self.current_state()) {
            self.reject(action);
            return false;
        }

        let mut buf = BytesMut::new();
        if let Err(e) = build(&mut buf) {
            warn!(action, error = %e, "Could not encode request");
            self.events.error(format!("Could not {action}: {e}"));
            return false;
        }

        let Some(sender) = self.connection.sender() else {
            warn!(action, "No active connection");
            self.events.error(ERR_NOT_CONNECTED);
            return false;
        };

        // Advanced before sending so the reply never arrives ahead of the state
        let previous = match next {
            Some(next) => match self.transition_from(allowed, next) {
                Some(previous) => Some((previous, next)),
                None => {
                    self.reject(action);
                    return false;
                }
            },
            None => None,
        };

        let frame: Bytes = buf.freeze();
        debug!(action, len = frame.len(), generation = sender.generation(), "Sending request");
        if let Err(e) = sender.send(frame) {
            error!(action, error = %e, "Send failed");
            if let Some((previous, next)) = previous {
                self.transition(&[next], previous);
            }
            self.events.error(format!("Could not {action}: {e}"));
            return false;
        }
        true
    }

    /// Move to `next` if the current state is in `allowed`, returning the state left
    fn transition_from(
        &self,
        allowed: &[ConnectionState],
        next: ConnectionState,
    ) -> Option<ConnectionState> {
        let mut state = self.lock_state();
        if !allowed.contains(&*state) {
            return None;
        }
        let previous = std::mem::replace(&mut *state, next);
        if previous != next {
            self.notify(previous, next);
        }
        Some(previous)
    }

    /// Route packets of the active connection and start its receive loop
    fn attach(&self) -> Result<()> {
        let generation = self.connection.generation().ok_or(ProtocolError::NotConnected)?;
        self.attached.store(generation, Ordering::Release);
        let sink = ManagerSink {
            inner: self.this.clone(),
        };
        if let Err(e) = self.connection.start_receiving(&self.shutdown, sink) {
            self.detach();
            self.connection.cleanup_generation(generation);
            return Err(e);
        }
        debug!(generation, "Connection attached");
        Ok(())
    }

    /// Stop routing packets from any connection
    fn detach(&self) {
        let previous = self.attached.swap(DETACHED, Ordering::AcqRel);
        if previous != DETACHED {
            debug!(generation = previous, "Connection detached");
        }
    }

    fn is_attached(&self, generation: u64) -> bool {
        generation != DETACHED && self.attached.load(Ordering::Acquire) == generation
    }

    fn fail_connect(&self, message: String) {
        error!(error = %message, "Connect failed");
        self.detach();
        self.events.error(message);
        self.advance(Disconnected);
    }

    fn reset_session(&self) {
        self.movement_lock.release();
        *self.pending() = None;
    }

    /// The attached connection's receive loop ended on its own
    fn connection_lost(&self, generation: u64, reason: Option<ProtocolError>) {
        if !self.is_attached(generation) {
            debug!(generation, "Ignoring loss of a detached connection");
            return;
        }
        self.detach();
        self.connection.cleanup_generation(generation);
        self.reset_session();

        let message = match reason {
            Some(e) => format!("{ERR_CONNECTION_LOST}: {e}"),
            None => ERR_CONNECTION_LOST.to_string(),
        };
        warn!(generation, error = %message, "Connection lost");
        self.events.error(message);
        self.advance(Disconnected);
    }

    /// Milliseconds since the manager was created, truncated to 32 bits
    fn tick_count(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
}

impl HandlerContext for Inner {
    fn events(&self) -> &EventPublisher {
        &self.events
    }

    fn state(&self) -> ConnectionState {
        self.current_state()
    }

    fn transition(&self, allowed: &[ConnectionState], next: ConnectionState) -> bool {
        self.transition_from(allowed, next).is_some()
    }

    fn store_server_list(&self, servers: Arc<[ServerInfo]>) {
        let mut cached = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        *cached = servers;
    }

    fn begin_game_server_handoff(&self, host: String, port: u16) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No async runtime available for the game server handoff");
            self.events.error(ERR_GAME_SERVER_CONNECT_FAILED);
            return;
        };
        if !self.transition(
            &[RequestingConnectionInfo, ReceivedConnectionInfo],
            ReceivedConnectionInfo,
        ) {
            warn!(state = %self.current_state(), "Ignoring connection info outside the handoff phase");
            return;
        }
        // Relay packets and a relay hang-up are no longer ours to handle
        self.detach();

        // The handoff disconnects the connection whose receive loop is calling us,
        // so it must run on its own task.
        runtime.spawn(async move {
            let manager = NetworkManager { inner };
            manager.switch_to_game_server(&host, port).await;
        });
    }

    fn pending_character(&self) -> Option<String> {
        self.pending().clone()
    }

    fn release_movement_lock(&self) {
        if self.movement_lock.release() {
            debug!("Movement lock released");
        }
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.settings.game.protocol_version
    }
}

/// Receive-loop sink; holds the manager weakly so a running loop does not keep it alive
struct ManagerSink {
    inner: Weak<Inner>,
}

impl PacketSink for ManagerSink {
    fn on_packet(&mut self, generation: u64, packet: Bytes) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.is_attached(generation) {
            debug!(generation, "Dropping packet from a detached connection");
            return;
        }
        inner.router.route(&*inner, &packet);
    }

    fn on_closed(&mut self, generation: u64, reason: Option<ProtocolError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connection_lost(generation, reason);
        }
    }
}
