//! # Packet Router
//!
//! Parses inbound frame headers under the active [`RoutingMode`], resolves a handler
//! from an immutable [`HandlerTable`] and invokes it. Nothing a handler does can
//! escape the router: errors and panics are logged with the offending code and
//! sub-code and the receive loop carries on.
//!
//! Lookup order for a frame with code `c` and optional sub-code `s`:
//! 1. `(c, s)` on the suppression list of the current mode: drop silently
//! 2. exact `(c, s)` handler
//! 3. if `s` was present, the whole-main-code handler `(c, NO_SUB_CODE)`
//! 4. otherwise log as unhandled

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::config::{ProtocolVersion, SuppressedPacket};
use crate::core::packet::{parse_header, PacketHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::events::{EventPublisher, ServerInfo};
use crate::protocol::handlers;
use crate::protocol::state::ConnectionState;
use crate::utils::metrics::Metrics;

/// Sub-code slot value meaning "this entry matches the whole main code"
pub const NO_SUB_CODE: u8 = 0xFF;

/// Relay-server main codes that carry a sub-code
const RELAY_SUB_CODE_CODES: &[u8] = &[0x00, 0xF4];

/// Gameplay-server main codes that carry a sub-code
const GAMEPLAY_SUB_CODE_CODES: &[u8] = &[0xF1, 0xF3, 0xBF];

/// Which server's header and handler rules are active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Relay,
    Gameplay,
}

impl RoutingMode {
    /// Whether `code` is polymorphic (followed by a sub-code) in this mode
    #[inline]
    pub fn has_sub_code(self, code: u8) -> bool {
        match self {
            RoutingMode::Relay => RELAY_SUB_CODE_CODES.contains(&code),
            RoutingMode::Gameplay => GAMEPLAY_SUB_CODE_CODES.contains(&code),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RoutingMode::Relay => 0,
            RoutingMode::Gameplay => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            RoutingMode::Relay
        } else {
            RoutingMode::Gameplay
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Relay => f.write_str("relay"),
            RoutingMode::Gameplay => f.write_str("gameplay"),
        }
    }
}

/// Handler lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub code: u8,
    pub sub_code: u8,
}

impl HandlerKey {
    pub const fn new(code: u8, sub_code: u8) -> Self {
        Self { code, sub_code }
    }

    /// Key matching every frame with this main code
    pub const fn main(code: u8) -> Self {
        Self::new(code, NO_SUB_CODE)
    }

    pub fn from_parts(code: u8, sub_code: Option<u8>) -> Self {
        Self::new(code, sub_code.unwrap_or(NO_SUB_CODE))
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_code == NO_SUB_CODE {
            write!(f, "0x{:02X}", self.code)
        } else {
            write!(f, "0x{:02X}/0x{:02X}", self.code, self.sub_code)
        }
    }
}

/// A complete inbound frame with its parsed header
#[derive(Debug, Clone, Copy)]
pub struct InboundPacket<'a> {
    pub header: PacketHeader,
    pub data: &'a [u8],
}

impl<'a> InboundPacket<'a> {
    /// Bytes after the header
    pub fn body(&self) -> &'a [u8] {
        self.data.get(self.header.body_offset()..).unwrap_or_default()
    }

    /// Body, failing if it is shorter than `len`
    pub fn body_at_least(&self, len: usize) -> Result<&'a [u8]> {
        let body = self.body();
        if body.len() < len {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected at least {len} body bytes, got {}",
                body.len()
            )));
        }
        Ok(body)
    }
}

/// Services a handler may use while processing a frame.
///
/// Implemented by the network manager; handlers never touch connections or
/// consumer data directly.
pub trait HandlerContext: Send + Sync {
    /// Consumer queue
    fn events(&self) -> &EventPublisher;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Move to `next` if the current state is one of `allowed`. Returns false otherwise.
    fn transition(&self, allowed: &[ConnectionState], next: ConnectionState) -> bool;

    /// Replace the cached game server list
    fn store_server_list(&self, servers: Arc<[ServerInfo]>);

    /// Start the relay-to-game-server handoff. Must not block on it.
    fn begin_game_server_handoff(&self, host: String, port: u16);

    /// Character name sent with the last select request
    fn pending_character(&self) -> Option<String>;

    /// Release the movement/interaction lock held by an outstanding move
    fn release_movement_lock(&self);

    fn protocol_version(&self) -> ProtocolVersion;
}

/// Handler function signature
pub type HandlerFn = dyn Fn(&dyn HandlerContext, &InboundPacket<'_>) -> Result<()> + Send + Sync;

/// Handler category, deciding the recovery step after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Standard,
    /// Movement acknowledgements; a failure still releases the movement lock
    Movement,
}

/// One registration: key, category and function
pub struct HandlerEntry {
    pub key: HandlerKey,
    pub kind: HandlerKind,
    pub name: &'static str,
    handler: Box<HandlerFn>,
}

impl HandlerEntry {
    pub fn new<F>(code: u8, sub_code: Option<u8>, name: &'static str, handler: F) -> Self
    where
        F: Fn(&dyn HandlerContext, &InboundPacket<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key: HandlerKey::from_parts(code, sub_code),
            kind: HandlerKind::Standard,
            name,
            handler: Box::new(handler),
        }
    }

    /// Mark as a movement handler
    pub fn movement(mut self) -> Self {
        self.kind = HandlerKind::Movement;
        self
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// A group of related handlers contributed to a table
pub trait HandlerModule {
    fn name(&self) -> &'static str;
    fn handlers(&self) -> Vec<HandlerEntry>;
}

/// Immutable key → handler map, built once
#[derive(Debug, Default)]
pub struct HandlerTable {
    entries: HashMap<HandlerKey, HandlerEntry>,
}

impl HandlerTable {
    /// Build from explicit entries.
    ///
    /// # Errors
    /// Returns `ProtocolError::DuplicateHandler` on the first key registered twice.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = HandlerEntry>,
    {
        let mut table = HashMap::new();
        for entry in entries {
            let key = entry.key;
            if let Some(existing) = table.get(&key) {
                let existing: &HandlerEntry = existing;
                error!(
                    key = %key,
                    existing = existing.name,
                    duplicate = entry.name,
                    "Duplicate handler registration"
                );
                return Err(ProtocolError::DuplicateHandler {
                    code: key.code,
                    sub_code: key.sub_code,
                });
            }
            table.insert(key, entry);
        }
        Ok(Self { entries: table })
    }

    /// Concatenate the entries of every module.
    pub fn from_modules(modules: &[&dyn HandlerModule]) -> Result<Self> {
        let entries = modules.iter().flat_map(|module| {
            let handlers = module.handlers();
            debug!(module = module.name(), count = handlers.len(), "Registering handler module");
            handlers
        });
        Self::from_entries(entries)
    }

    pub fn get(&self, key: &HandlerKey) -> Option<&HandlerEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What happened to a routed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(HandlerKey),
    Suppressed,
    Unhandled,
    Failed(HandlerKey),
    Unparsable,
}

/// Stateful dispatcher for inbound frames
pub struct PacketRouter {
    mode: AtomicU8,
    relay: HandlerTable,
    gameplay: HandlerTable,
    suppressed: HashSet<(RoutingMode, HandlerKey)>,
    metrics: Arc<Metrics>,
}

impl PacketRouter {
    /// Router with the built-in relay and gameplay handlers, starting in relay mode.
    pub fn new(version: ProtocolVersion, metrics: Arc<Metrics>) -> Result<Self> {
        let relay = HandlerTable::from_entries(handlers::relay::handlers())?;
        let gameplay = handlers::gameplay_table(version)?;
        debug!(
            relay = relay.len(),
            gameplay = gameplay.len(),
            "Packet router handler tables built"
        );
        Ok(Self::with_tables(relay, gameplay, metrics))
    }

    /// Router over caller-provided tables
    pub fn with_tables(relay: HandlerTable, gameplay: HandlerTable, metrics: Arc<Metrics>) -> Self {
        Self {
            mode: AtomicU8::new(RoutingMode::Relay.to_u8()),
            relay,
            gameplay,
            suppressed: HashSet::new(),
            metrics,
        }
    }

    /// Add suppression entries
    pub fn with_suppressed(mut self, packets: &[SuppressedPacket]) -> Self {
        self.suppressed.extend(
            packets
                .iter()
                .map(|p| (p.mode, HandlerKey::new(p.code, p.key_sub_code()))),
        );
        self
    }

    pub fn routing_mode(&self) -> RoutingMode {
        RoutingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_routing_mode(&self, mode: RoutingMode) {
        let previous = RoutingMode::from_u8(self.mode.swap(mode.to_u8(), Ordering::AcqRel));
        if previous != mode {
            debug!(from = %previous, to = %mode, "Routing mode switched");
        }
    }

    fn table(&self, mode: RoutingMode) -> &HandlerTable {
        match mode {
            RoutingMode::Relay => &self.relay,
            RoutingMode::Gameplay => &self.gameplay,
        }
    }

    /// Parse a header with the active mode's sub-code rules
    pub fn parse_header(&self, packet: &[u8]) -> Result<PacketHeader> {
        let mode = self.routing_mode();
        parse_header(packet, |code| mode.has_sub_code(code))
    }

    /// Parse and dispatch one complete frame. Never fails.
    pub fn route(&self, ctx: &dyn HandlerContext, packet: &[u8]) -> DispatchOutcome {
        self.metrics.packet_received(packet.len() as u64);

        let header = match self.parse_header(packet) {
            Ok(header) => header,
            Err(e) => {
                self.metrics.unparsable_header();
                warn!(error = %e, len = packet.len(), first = ?packet.first(), "Dropping unparsable packet");
                return DispatchOutcome::Unparsable;
            }
        };

        self.dispatch(ctx, &InboundPacket { header, data: packet })
    }

    /// Resolve and invoke the handler for an already-parsed frame
    pub fn dispatch(&self, ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> DispatchOutcome {
        let mode = self.routing_mode();
        let code = packet.header.code;
        let sub_code = packet.header.sub_code;
        let key = HandlerKey::from_parts(code, sub_code);

        if self.suppressed.contains(&(mode, key)) {
            self.metrics.suppressed_packet();
            return DispatchOutcome::Suppressed;
        }

        let table = self.table(mode);
        let entry = table.get(&key).or_else(|| {
            sub_code.and_then(|_| table.get(&HandlerKey::main(code)))
        });

        let Some(entry) = entry else {
            self.metrics.unhandled_packet();
            warn!(mode = %mode, key = %key, len = packet.data.len(), "Unhandled packet");
            return DispatchOutcome::Unhandled;
        };

        trace!(mode = %mode, key = %key, handler = entry.name, "Dispatching packet");
        match invoke(entry, ctx, packet) {
            Ok(()) => DispatchOutcome::Handled(entry.key),
            Err(e) => {
                self.metrics.handler_failure();
                error!(
                    code = %format!("0x{code:02X}"),
                    sub_code = %sub_code.map_or_else(|| "-".to_string(), |s| format!("0x{s:02X}")),
                    handler = entry.name,
                    error = %e,
                    "Packet handler failed"
                );
                if entry.kind == HandlerKind::Movement {
                    recover_movement(ctx);
                }
                DispatchOutcome::Failed(entry.key)
            }
        }
    }
}

impl fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRouter")
            .field("mode", &self.routing_mode())
            .field("relay_handlers", &self.relay.len())
            .field("gameplay_handlers", &self.gameplay.len())
            .field("suppressed", &self.suppressed.len())
            .finish()
    }
}

fn invoke(entry: &HandlerEntry, ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let message = match catch_unwind(AssertUnwindSafe(|| (entry.handler)(ctx, packet))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };
    Err(ProtocolError::Handler {
        code: entry.key.code,
        sub_code: entry.key.sub_code,
        message,
    })
}

fn recover_movement(ctx: &dyn HandlerContext) {
    // The lock owner may already be gone; releasing must not take the loop down
    if catch_unwind(AssertUnwindSafe(|| ctx.release_movement_lock())).is_err() {
        warn!("Movement lock release panicked during handler recovery");
    } else {
        debug!("Movement lock released after handler failure");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
