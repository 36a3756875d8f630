//! # Client Services
//!
//! - **Connection**: owns the single active transport and its receive loop
//! - **Network**: the lifecycle state machine and the public request API

pub mod connection;
pub mod network;

pub use connection::{ConnectionManager, PacketSender, PacketSink};
pub use network::{InteractionLock, NetworkManager};
