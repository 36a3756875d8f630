//! Item pickup results.

use tracing::debug;

use crate::core::builder::game::PICKUP_ITEM;
use crate::error::Result;
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, HandlerModule, InboundPacket};
use crate::protocol::events::SessionUpdate;

/// Result byte meaning the pickup was refused
const PICKUP_FAILED: u8 = 0xFF;

pub struct ItemHandlers;

impl HandlerModule for ItemHandlers {
    fn name(&self) -> &'static str {
        "item"
    }

    fn handlers(&self) -> Vec<HandlerEntry> {
        vec![HandlerEntry::new(PICKUP_ITEM, None, "pickup_result", handle_pickup_result)]
    }
}

/// `C3 len 22 slot_or_result ...`
fn handle_pickup_result(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(1)?;
    let success = body[0] != PICKUP_FAILED;
    debug!(success, slot = body[0], "Item pickup result");
    ctx.events().session(SessionUpdate::ItemPickupResult { success });
    Ok(())
}
