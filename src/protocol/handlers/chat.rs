//! Public chat and whispers.

use tracing::debug;

use crate::core::builder::NAME_LENGTH;
use crate::error::Result;
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, HandlerModule, InboundPacket};
use crate::protocol::events::SessionUpdate;
use crate::protocol::handlers::read_fixed_str;

pub struct ChatHandlers;

impl HandlerModule for ChatHandlers {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn handlers(&self) -> Vec<HandlerEntry> {
        vec![
            HandlerEntry::new(0x00, None, "chat_message", |ctx, packet| {
                handle_chat(ctx, packet, false)
            }),
            HandlerEntry::new(0x02, None, "whisper_message", |ctx, packet| {
                handle_chat(ctx, packet, true)
            }),
        ]
    }
}

/// `C1 len code sender(10) message`
fn handle_chat(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>, whisper: bool) -> Result<()> {
    let body = packet.body_at_least(NAME_LENGTH)?;
    let sender = read_fixed_str(&body[..NAME_LENGTH]);
    let message = read_fixed_str(&body[NAME_LENGTH..]);
    debug!(sender = %sender, whisper, "Chat message received");
    ctx.events().session(SessionUpdate::ChatReceived {
        sender,
        message,
        whisper,
    });
    Ok(())
}
