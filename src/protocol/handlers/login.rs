//! Game server join and login results.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, HandlerModule, InboundPacket};
use crate::protocol::events::{LoginOutcome, NetworkEvent};
use crate::protocol::state::ConnectionState;

pub struct LoginHandlers;

impl HandlerModule for LoginHandlers {
    fn name(&self) -> &'static str {
        "login"
    }

    fn handlers(&self) -> Vec<HandlerEntry> {
        vec![
            HandlerEntry::new(0xF1, Some(0x00), "game_server_hello", handle_join_result),
            HandlerEntry::new(0xF1, Some(0x01), "login_result", handle_login_result),
        ]
    }
}

/// `C1 0C F1 00 result player_id(u16 BE) version(5)`
fn handle_join_result(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(3)?;
    let player_id = u16::from_be_bytes([body[1], body[2]]) & 0x7FFF;
    debug!(player_id, success = body[0] == 0x01, state = %ctx.state(), "Game server hello");
    Ok(())
}

/// `C1 05 F1 01 result`
fn handle_login_result(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(1)?;
    let outcome = LoginOutcome::from_code(body[0]);

    // Success moves on to character selection; any failure returns to the retry point
    let next = if outcome.is_success() {
        ConnectionState::SelectingCharacter
    } else {
        ConnectionState::ConnectedToGameServer
    };
    if !ctx.transition(&[ConnectionState::Authenticating], next) {
        warn!(state = %ctx.state(), ?outcome, "Login result received while not authenticating");
        return Ok(());
    }

    info!(?outcome, "Login result");
    ctx.events().publish(NetworkEvent::LoginResult(outcome));
    Ok(())
}
