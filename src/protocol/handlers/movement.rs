//! Movement acknowledgements.
//!
//! Both handlers are movement-class: a walk request holds the interaction lock
//! until one of them runs, and the router releases the lock even when they fail.

use tracing::trace;

use crate::config::ProtocolVersion;
use crate::error::Result;
use crate::protocol::dispatcher::{HandlerContext, HandlerEntry, HandlerModule, InboundPacket};
use crate::protocol::events::SessionUpdate;

/// Teleport and map change notification
pub const MAP_CHANGED_CODE: u8 = 0x1C;

pub struct MovementHandlers {
    version: ProtocolVersion,
}

impl MovementHandlers {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }
}

impl HandlerModule for MovementHandlers {
    fn name(&self) -> &'static str {
        "movement"
    }

    fn handlers(&self) -> Vec<HandlerEntry> {
        vec![
            HandlerEntry::new(self.version.walk_code(), None, "walk_ack", handle_walk_ack).movement(),
            HandlerEntry::new(MAP_CHANGED_CODE, None, "map_changed", handle_map_changed).movement(),
        ]
    }
}

/// `C1 06 code x y direction`
fn handle_walk_ack(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(3)?;
    let position = (body[0], body[1]);
    trace!(x = position.0, y = position.1, direction = body[2], "Walk acknowledged");
    ctx.release_movement_lock();
    ctx.events().session(SessionUpdate::PositionChanged { position });
    Ok(())
}

/// `C3 len 1C is_map_change map(u16 LE) x y rotation`
fn handle_map_changed(ctx: &dyn HandlerContext, packet: &InboundPacket<'_>) -> Result<()> {
    let body = packet.body_at_least(5)?;
    let map_id = u16::from_le_bytes([body[1], body[2]]);
    let position = (body[3], body[4]);
    let update = if body[0] != 0 {
        SessionUpdate::MapChanged { map_id, position }
    } else {
        SessionUpdate::PositionChanged { position }
    };
    ctx.release_movement_lock();
    ctx.events().session(update);
    Ok(())
}
