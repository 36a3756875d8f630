//! Inbound packet handlers.
//!
//! The relay server speaks only three messages, registered directly from
//! [`relay::handlers`]. Gameplay handlers are grouped into modules that each expose
//! their `(code, sub-code, function)` entries; [`gameplay_table`] concatenates them
//! and refuses to start on a duplicate key.

pub mod character;
pub mod chat;
pub mod item;
pub mod login;
pub mod movement;
pub mod relay;

use crate::config::ProtocolVersion;
use crate::error::Result;
use crate::protocol::dispatcher::{HandlerModule, HandlerTable};

/// Build the gameplay handler table for a protocol generation
pub fn gameplay_table(version: ProtocolVersion) -> Result<HandlerTable> {
    let login = login::LoginHandlers;
    let character = character::CharacterHandlers;
    let chat = chat::ChatHandlers;
    let movement = movement::MovementHandlers::new(version);
    let item = item::ItemHandlers;

    HandlerTable::from_modules(&[&login, &character, &chat, &movement, &item])
}

/// Decode a NUL-padded fixed-width text field
pub(crate) fn read_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
