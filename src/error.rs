//! # Error Types
//!
//! Error handling for the client network core.
//!
//! Internal layers (codec, builder, connection manager) propagate these with `?`.
//! The public [`NetworkManager`](crate::service::network::NetworkManager) surface
//! never hands them to the caller directly: failures are turned into a
//! human-readable [`NetworkEvent::Error`](crate::protocol::events::NetworkEvent)
//! and published on the consumer queue.
//!
//! ## Error Categories
//! - **Transport**: resolution failures, socket errors, cancellation, timeouts
//! - **Framing**: unknown frame markers, truncated headers, bad length fields
//! - **Dispatch**: duplicate handler registrations, handler failures, malformed bodies
//! - **State**: actions requested from a state that does not allow them
//! - **Configuration**: invalid or unreadable settings

use std::io;
use thiserror::Error;

use crate::protocol::state::ConnectionState;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_LOST: &str = "Connection to server lost";
    pub const ERR_NOT_CONNECTED: &str = "Not connected to a server";
    pub const ERR_CONNECT_FAILED: &str = "Could not connect to server";

    /// Handoff errors
    pub const ERR_GAME_SERVER_CONNECT_FAILED: &str = "Could not connect to game server";
}

/// Primary error type for all client network operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not resolve address: {0}")]
    AddressResolution(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),

    #[error("Unknown frame marker: 0x{0:02X}")]
    UnknownFrameMarker(u8),

    #[error("Duplicate handler registration for code 0x{code:02X} sub-code 0x{sub_code:02X}")]
    DuplicateHandler { code: u8, sub_code: u8 },

    #[error("Handler for 0x{code:02X}/0x{sub_code:02X} failed: {message}")]
    Handler {
        code: u8,
        sub_code: u8,
        message: String,
    },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Action '{action}' is not allowed in state {state}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },

    #[error("{field} too long: {actual} bytes (maximum {max})")]
    MessageTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
