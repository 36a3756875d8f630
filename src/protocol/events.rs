//! # Consumer Event Queue
//!
//! Everything the network side wants the embedding application to know crosses
//! exactly one boundary: a single-consumer queue of [`NetworkEvent`] values.
//! The network task only ever *enqueues*; the application drains the queue once per
//! tick (for a game, once per frame) on its own thread.
//!
//! Session data (selected character, map, position, chat) is never written from the
//! network task. Handlers emit [`SessionUpdate`] messages and the consumer applies
//! them to its own [`SessionState`] while draining, so there is no shared mutable
//! state between the two sides.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::state::ConnectionState;

/// Chat lines kept in [`SessionState::chat_log`]
pub const CHAT_LOG_CAPACITY: usize = 100;

/// One game server entry from the relay server's list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u16,
    /// Population in percent, 0–100
    pub load: u8,
}

/// One character slot from the character list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterSummary {
    pub slot: u8,
    pub name: String,
    pub level: u16,
    pub class: u8,
}

/// Result of a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    InvalidPassword,
    AccountNotFound,
    AccountAlreadyConnected,
    ServerFull,
    AccountBlocked,
    WrongClientVersion,
    Other(u8),
}

impl LoginOutcome {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => LoginOutcome::Success,
            0x00 => LoginOutcome::InvalidPassword,
            0x02 => LoginOutcome::AccountNotFound,
            0x03 => LoginOutcome::AccountAlreadyConnected,
            0x04 => LoginOutcome::ServerFull,
            0x05 => LoginOutcome::AccountBlocked,
            0x06 => LoginOutcome::WrongClientVersion,
            other => LoginOutcome::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == LoginOutcome::Success
    }
}

/// A change to consumer-owned session data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    CharacterEntered {
        name: String,
        map_id: u16,
        position: (u8, u8),
    },
    PositionChanged {
        position: (u8, u8),
    },
    MapChanged {
        map_id: u16,
        position: (u8, u8),
    },
    ChatReceived {
        sender: String,
        message: String,
        whisper: bool,
    },
    ItemPickupResult {
        success: bool,
    },
    Reset,
}

/// Notification published to the consumer queue
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Error(String),
    ServerListReceived(Arc<[ServerInfo]>),
    CharacterListReceived(Vec<CharacterSummary>),
    LoginResult(LoginOutcome),
    Session(SessionUpdate),
}

/// A received chat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub sender: String,
    pub message: String,
    pub whisper: bool,
}

/// Session data owned by the consumer
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub character_name: Option<String>,
    pub map_id: u16,
    pub position: (u8, u8),
    pub chat_log: VecDeque<ChatLine>,
    pub last_pickup_succeeded: Option<bool>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one update
    pub fn apply(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::CharacterEntered {
                name,
                map_id,
                position,
            } => {
                self.character_name = Some(name.clone());
                self.map_id = *map_id;
                self.position = *position;
            }
            SessionUpdate::PositionChanged { position } => self.position = *position,
            SessionUpdate::MapChanged { map_id, position } => {
                self.map_id = *map_id;
                self.position = *position;
            }
            SessionUpdate::ChatReceived {
                sender,
                message,
                whisper,
            } => {
                if self.chat_log.len() == CHAT_LOG_CAPACITY {
                    self.chat_log.pop_front();
                }
                self.chat_log.push_back(ChatLine {
                    sender: sender.clone(),
                    message: message.clone(),
                    whisper: *whisper,
                });
            }
            SessionUpdate::ItemPickupResult { success } => {
                self.last_pickup_succeeded = Some(*success)
            }
            SessionUpdate::Reset => *self = Self::default(),
        }
    }
}

/// Producer half, cloned into every network-side component
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl EventPublisher {
    /// Enqueue an event. Never blocks and never calls consumer code.
    pub fn publish(&self, event: NetworkEvent) {
        trace!(?event, "Queueing network event");
        if self.tx.send(event).is_err() {
            debug!("Event queue consumer dropped, event discarded");
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(NetworkEvent::Error(message.into()));
    }

    pub fn session(&self, update: SessionUpdate) {
        self.publish(NetworkEvent::Session(update));
    }
}

/// Consumer half, drained by the application once per tick
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl EventQueue {
    /// Take every event queued so far without waiting
    pub fn drain(&mut self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drain, applying session updates to `session` before handing each event to `f`.
    ///
    /// Returns the number of events processed.
    pub fn drain_into<F>(&mut self, session: &mut SessionState, mut f: F) -> usize
    where
        F: FnMut(&NetworkEvent),
    {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            match &event {
                NetworkEvent::Session(update) => session.apply(update),
                NetworkEvent::StateChanged {
                    current: ConnectionState::Disconnected,
                    ..
                } => session.apply(&SessionUpdate::Reset),
                _ => {}
            }
            f(&event);
            count += 1;
        }
        count
    }

    /// Wait for the next event; for consumers that run on an async runtime.
    pub async fn recv(&mut self) -> Option<NetworkEvent> {
        self.rx.recv().await
    }
}

/// Create a connected publisher/queue pair
pub fn event_queue() -> (EventPublisher, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventPublisher { tx }, EventQueue { rx })
}
