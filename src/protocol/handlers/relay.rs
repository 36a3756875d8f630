//! Relay (connect) server handlers.
//!
//! ```text
//! 0x00/0x01  hello                C1 04 00 01
//! 0xF4/0x06  server list          C2 len F4 06 count(u16 BE) { id(u16 LE) load(u8) pad(u8) }*
//! 0xF4/0x03  connection info      C1 16 F4 03 host(16, NUL padded) port(u16 LE)
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, InboundPacket};
use crate::protocol::events::{NetworkEvent, ServerInfo};
use crate::protocol::handlers::read_fixed_str;
use crate::protocol::state::ConnectionState;

const SERVER_ENTRY_SIZE: usize = 4;
const HOST_FIELD_SIZE: usize = 16;

/// The three relay-phase registrations
pub fn handlers() -> Vec<HandlerEntry> {
    vec![
        HandlerEntry::new(0x00, Some(0x01), "relay_hello", handle_hello),
        HandlerEntry::new(0xF4, Some(0x06), "server_list", handle_server_list),
        HandlerEntry::new(0xF4, Some(0x03), "connection_info", handle_connection_info),
    ]
}

fn handle_hello(ctx: &dyn HandlerContext, _packet: &InboundPacket<'_>) -> Result<()> {
    debug!(state = %ctx.state(), "Relay server hello received");
    Ok(())
}

fn handle_server_list(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(2)?;
    let count = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let entries = &body[2..];
    if entries.len() < count * SERVER_ENTRY_SIZE {
        return Err(ProtocolError::MalformedPacket(format!(
            "server list announces {count} entries but carries {} bytes",
            entries.len()
        )));
    }

    let servers: Arc<[ServerInfo]> = entries
        .chunks_exact(SERVER_ENTRY_SIZE)
        .take(count)
        .map(|entry| ServerInfo {
            id: u16::from_le_bytes([entry[0], entry[1]]),
            load: entry[2],
        })
        .collect();

    let accepted = ctx.transition(
        &[
            ConnectionState::ConnectedToConnectServer,
            ConnectionState::RequestingServerList,
            ConnectionState::ReceivedServerList,
        ],
        ConnectionState::ReceivedServerList,
    );
    if !accepted {
        warn!(state = %ctx.state(), "Ignoring server list outside the relay listing phase");
        return Ok(());
    }

    info!(servers = servers.len(), "Server list received");
    ctx.store_server_list(Arc::clone(&servers));
    ctx.events().publish(NetworkEvent::ServerListReceived(servers));
    Ok(())
}

fn handle_connection_info(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(HOST_FIELD_SIZE + 2)?;
    let host = read_fixed_str(&body[..HOST_FIELD_SIZE]);
    let port = u16::from_le_bytes([body[HOST_FIELD_SIZE], body[HOST_FIELD_SIZE + 1]]);
    if host.is_empty() || port == 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "invalid game server endpoint '{host}:{port}'"
        )));
    }

    info!(host = %host, port, "Game server connection info received");
    ctx.begin_game_server_handoff(host, port);
    Ok(())
}
