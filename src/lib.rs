//! # mu-client-net
//!
//! Async network core for a MU-style game client.
//!
//! The client talks to two servers in sequence. A relay (connect) server hands out
//! the game server list and the address of the chosen server; the client then drops
//! the relay connection and opens a connection to the game server, optionally
//! wrapped in an external cipher pipeline.
//!
//! ## Layers
//! - [`core`]: frame headers, the stream codec and outbound packet builders
//! - [`protocol`]: lifecycle states, the packet router, handlers and the event queue
//! - [`transport`]: the duplex-pipe contract cipher implementations plug into
//! - [`service`]: the connection manager and the public [`NetworkManager`]
//! - [`config`], [`error`], [`utils`]: settings, error types, logging and metrics
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use mu_client_net::{ClientSettings, NetworkEvent, NetworkManager, Passthrough};
//!
//! # async fn run() -> mu_client_net::Result<()> {
//! let (manager, mut events) = NetworkManager::new(ClientSettings::default(), Arc::new(Passthrough))?;
//! manager.connect_to_connect_server().await;
//! manager.request_server_list();
//!
//! // Once per frame
//! for event in events.drain() {
//!     if let NetworkEvent::ServerListReceived(servers) = event {
//!         if let Some(first) = servers.first() {
//!             manager.request_game_server_connection(first.id);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClientSettings, ProtocolVersion};
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{PacketRouter, RoutingMode};
pub use protocol::events::{EventQueue, NetworkEvent, SessionState, SessionUpdate};
pub use protocol::state::ConnectionState;
pub use service::network::NetworkManager;
pub use transport::cipher::{CipherPipeline, Passthrough};
