//! Character list and world entry.

use tracing::{info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, HandlerModule, InboundPacket};
use crate::protocol::events::{CharacterSummary, NetworkEvent, SessionUpdate};
use crate::protocol::handlers::read_fixed_str;
use crate::protocol::state::ConnectionState;

/// Bytes before the first character entry: unlock flags, move count, count, vault extension
const LIST_PREFIX: usize = 4;
const CHARACTER_ENTRY_SIZE: usize = 34;

pub struct CharacterHandlers;

impl HandlerModule for CharacterHandlers {
    fn name(&self) -> &'static str {
        "character"
    }

    fn handlers(&self) -> Vec<HandlerEntry> {
        vec![
            HandlerEntry::new(0xF3, Some(0x00), "character_list", handle_character_list),
            HandlerEntry::new(0xF3, Some(0x03), "character_information", handle_character_information),
        ]
    }
}

/// Entry: `slot(1) name(10) pad(1) level(u16 LE) status(1) appearance(18) guild(1)`
fn parse_character(entry: &[u8]) -> CharacterSummary {
    CharacterSummary {
        slot: entry[0],
        name: read_fixed_str(&entry[1..11]),
        level: u16::from_le_bytes([entry[12], entry[13]]),
        class: entry[15] >> 4,
    }
}

fn handle_character_list(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(LIST_PREFIX)?;
    let count = usize::from(body[2]);
    let entries = &body[LIST_PREFIX..];
    if entries.len() < count * CHARACTER_ENTRY_SIZE {
        return Err(ProtocolError::MalformedPacket(format!(
            "character list announces {count} entries but carries {} bytes",
            entries.len()
        )));
    }

    if ctx.state() != ConnectionState::SelectingCharacter {
        warn!(state = %ctx.state(), "Ignoring character list outside character selection");
        return Ok(());
    }

    let characters: Vec<CharacterSummary> = entries
        .chunks_exact(CHARACTER_ENTRY_SIZE)
        .take(count)
        .map(parse_character)
        .collect();

    info!(characters = characters.len(), "Character list received");
    ctx.events()
        .publish(NetworkEvent::CharacterListReceived(characters));
    Ok(())
}

/// `C3 len F3 03 x y map(u16 LE) ...`: the selected character entered the world
fn handle_character_information(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(4)?;
    let position = (body[0], body[1]);
    let map_id = u16::from_le_bytes([body[2], body[3]]);

    if !ctx.transition(&[ConnectionState::SelectingCharacter], ConnectionState::InGame) {
        warn!(state = %ctx.state(), "Character information outside character selection");
        return Ok(());
    }

    let name = ctx.pending_character().unwrap_or_default();
    info!(character = %name, map_id, x = position.0, y = position.1, "Entered game world");
    ctx.events().session(SessionUpdate::CharacterEntered {
        name,
        map_id,
        position,
    });
    Ok(())
}
