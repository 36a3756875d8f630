//! # Packet Builder
//!
//! Stateless encoders for every outbound request. Each function appends exactly one
//! frame to the caller's buffer and returns the number of bytes it wrote, so several
//! requests can be batched into one write.
//!
//! Fixed-size requests reserve their known length up front. Variable-size requests
//! (chat, whisper) size the frame from the UTF-8 byte count of the message body.

use bytes::BytesMut;

use crate::config::ProtocolVersion;
use crate::core::packet::{write_header, MARKER_C1, MARKER_C3};
use crate::error::{ProtocolError, Result};

/// Key applied to the login credentials, `byte[i] ^= key[i % 3]`
pub const XOR3_KEY: [u8; 3] = [0xFC, 0xCF, 0xAB];

/// Width of the NUL-padded account and character name fields
pub const NAME_LENGTH: usize = 10;
/// Width of the NUL-padded password field
pub const PASSWORD_LENGTH: usize = 20;
/// Width of the client serial field
pub const SERIAL_LENGTH: usize = 16;
/// Most direction steps a single walk request can carry
pub const MAX_WALK_STEPS: usize = 15;
/// Filler nibble for an odd step count
pub const NO_STEP: u8 = 0x0F;
/// Largest valid direction value
pub const MAX_DIRECTION: u8 = 7;

const CHAT_HEADER_LENGTH: usize = 3 + NAME_LENGTH;
const MAX_SHORT_FRAME: usize = u8::MAX as usize;

/// Relay server codes
pub mod relay {
    pub const SERVER_LIST: (u8, u8) = (0xF4, 0x06);
    pub const CONNECTION_INFO: (u8, u8) = (0xF4, 0x03);
}

/// Gameplay server codes
pub mod game {
    pub const CHAT: u8 = 0x00;
    pub const WHISPER: u8 = 0x02;
    pub const LOGIN: (u8, u8) = (0xF1, 0x01);
    pub const LOGOUT: (u8, u8) = (0xF1, 0x02);
    pub const CHARACTER_LIST: (u8, u8) = (0xF3, 0x00);
    pub const SELECT_CHARACTER: (u8, u8) = (0xF3, 0x03);
    pub const CLIENT_READY: (u8, u8) = (0xF3, 0x12);
    pub const PICKUP_ITEM: u8 = 0x22;
}

/// Append a zeroed frame of `len` bytes and return it for population.
fn reserve_frame(buf: &mut BytesMut, len: usize) -> &mut [u8] {
    let start = buf.len();
    buf.resize(start + len, 0);
    &mut buf[start..]
}

/// Copy `value` into a fixed-width NUL-padded field.
fn write_fixed(field: &mut [u8], value: &[u8], name: &'static str) -> Result<()> {
    if value.len() > field.len() {
        return Err(ProtocolError::MessageTooLong {
            field: name,
            max: field.len(),
            actual: value.len(),
        });
    }
    field[..value.len()].copy_from_slice(value);
    Ok(())
}

/// XOR-mask `data` in place with [`XOR3_KEY`]. Applying it twice restores the input.
#[inline]
pub fn xor3(data: &mut [u8]) {
    xor3_with(data, &XOR3_KEY);
}

/// XOR-mask `data` in place with an arbitrary 3-byte key.
#[inline]
pub fn xor3_with(data: &mut [u8], key: &[u8; 3]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 3];
    }
}

/// Pack direction steps two per byte, high nibble first; an odd tail gets [`NO_STEP`].
pub fn pack_steps(steps: &[u8]) -> Vec<u8> {
    steps
        .chunks(2)
        .map(|pair| {
            let high = pair[0] & 0x0F;
            let low = pair.get(1).map_or(NO_STEP, |step| step & 0x0F);
            (high << 4) | low
        })
        .collect()
}

/// `C1 04 F4 06`: ask the relay server for the game server list.
pub fn server_list_request(buf: &mut BytesMut) -> usize {
    let frame = reserve_frame(buf, 4);
    let (code, sub) = relay::SERVER_LIST;
    write_header(frame, MARKER_C1, code, Some(sub));
    frame.len()
}

/// `C1 06 F4 03 id(u16 LE)`: ask the relay server where a game server lives.
pub fn connection_info_request(buf: &mut BytesMut, server_id: u16) -> usize {
    let frame = reserve_frame(buf, 6);
    let (code, sub) = relay::CONNECTION_INFO;
    let offset = write_header(frame, MARKER_C1, code, Some(sub));
    frame[offset..offset + 2].copy_from_slice(&server_id.to_le_bytes());
    frame.len()
}

/// Login credentials and client identification.
#[derive(Debug, Clone)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub tick_count: u32,
    pub client_version: [u8; 5],
    pub client_serial: &'a [u8],
}

/// `C3 3B F1 01`: account login.
///
/// ```text
/// [4..14)  username, NUL padded, XOR3 masked
/// [14..34) password, NUL padded, XOR3 masked
/// [34..38) tick count, u32 BE
/// [38..43) client version
/// [43..59) client serial
/// ```
///
/// The plaintext is copied first and masked in place; the padding bytes are
/// masked with the rest of the field.
pub fn login_request(buf: &mut BytesMut, request: &LoginRequest<'_>) -> Result<usize> {
    const LENGTH: usize = 4 + NAME_LENGTH + PASSWORD_LENGTH + 4 + 5 + SERIAL_LENGTH;
    const USER: usize = 4;
    const PASS: usize = USER + NAME_LENGTH;
    const TICK: usize = PASS + PASSWORD_LENGTH;
    const VERSION: usize = TICK + 4;
    const SERIAL: usize = VERSION + 5;

    // Validate before touching the buffer so a rejected request writes nothing
    for (value, max, field) in [
        (request.username.as_bytes(), NAME_LENGTH, "username"),
        (request.password.as_bytes(), PASSWORD_LENGTH, "password"),
        (request.client_serial, SERIAL_LENGTH, "client serial"),
    ] {
        if value.len() > max {
            return Err(ProtocolError::MessageTooLong {
                field,
                max,
                actual: value.len(),
            });
        }
    }

    let frame = reserve_frame(buf, LENGTH);
    let (code, sub) = game::LOGIN;
    write_header(frame, MARKER_C3, code, Some(sub));

    let user = &mut frame[USER..PASS];
    write_fixed(user, request.username.as_bytes(), "username")?;
    xor3(user);

    let pass = &mut frame[PASS..TICK];
    write_fixed(pass, request.password.as_bytes(), "password")?;
    xor3(pass);

    frame[TICK..VERSION].copy_from_slice(&request.tick_count.to_be_bytes());
    frame[VERSION..SERIAL].copy_from_slice(&request.client_version);
    write_fixed(
        &mut frame[SERIAL..LENGTH],
        request.client_serial,
        "client serial",
    )?;

    Ok(LENGTH)
}

/// `C1 05 F1 02 kind`: leave the game (0 = quit, 1 = switch character, 2 = server select).
pub fn logout_request(buf: &mut BytesMut, kind: u8) -> usize {
    let frame = reserve_frame(buf, 5);
    let (code, sub) = game::LOGOUT;
    let offset = write_header(frame, MARKER_C1, code, Some(sub));
    frame[offset] = kind;
    frame.len()
}

/// `C1 04 F3 00`: request the account's character list.
pub fn character_list_request(buf: &mut BytesMut) -> usize {
    let frame = reserve_frame(buf, 4);
    let (code, sub) = game::CHARACTER_LIST;
    write_header(frame, MARKER_C1, code, Some(sub));
    frame.len()
}

/// `C1 0E F3 03 name(10)`: enter the world with the named character.
pub fn select_character_request(buf: &mut BytesMut, name: &str) -> Result<usize> {
    if name.len() > NAME_LENGTH {
        return Err(ProtocolError::MessageTooLong {
            field: "character name",
            max: NAME_LENGTH,
            actual: name.len(),
        });
    }
    let frame = reserve_frame(buf, 4 + NAME_LENGTH);
    let (code, sub) = game::SELECT_CHARACTER;
    let offset = write_header(frame, MARKER_C1, code, Some(sub));
    write_fixed(&mut frame[offset..], name.as_bytes(), "character name")?;
    Ok(frame.len())
}

/// `C1 04 F3 12`: the client finished loading the map and is ready for world data.
pub fn client_ready(buf: &mut BytesMut) -> usize {
    let frame = reserve_frame(buf, 4);
    let (code, sub) = game::CLIENT_READY;
    write_header(frame, MARKER_C1, code, Some(sub));
    frame.len()
}

fn chat_frame(
    buf: &mut BytesMut,
    code: u8,
    name: &str,
    message: &str,
    field: &'static str,
) -> Result<usize> {
    let body = message.as_bytes();
    let length = CHAT_HEADER_LENGTH + body.len();
    if length > MAX_SHORT_FRAME {
        return Err(ProtocolError::MessageTooLong {
            field: "chat message",
            max: MAX_SHORT_FRAME - CHAT_HEADER_LENGTH,
            actual: body.len(),
        });
    }
    if name.len() > NAME_LENGTH {
        return Err(ProtocolError::MessageTooLong {
            field,
            max: NAME_LENGTH,
            actual: name.len(),
        });
    }

    let frame = reserve_frame(buf, length);
    let offset = write_header(frame, MARKER_C1, code, None);
    write_fixed(&mut frame[offset..offset + NAME_LENGTH], name.as_bytes(), field)?;
    frame[CHAT_HEADER_LENGTH..].copy_from_slice(body);
    Ok(length)
}

/// `C1 len 00 sender(10) message`: public chat.
pub fn chat_message(buf: &mut BytesMut, sender: &str, message: &str) -> Result<usize> {
    chat_frame(buf, game::CHAT, sender, message, "sender name")
}

/// `C1 len 02 receiver(10) message`: private message.
pub fn whisper_message(buf: &mut BytesMut, receiver: &str, message: &str) -> Result<usize> {
    chat_frame(buf, game::WHISPER, receiver, message, "receiver name")
}

/// Walk request.
///
/// ```text
/// [3] source x  [4] source y  [5] rotation (first step)  [6] step count
/// [7..] steps, two per byte, high nibble first, 0x0F fills an odd tail
/// ```
pub fn walk_request(
    buf: &mut BytesMut,
    version: ProtocolVersion,
    source: (u8, u8),
    steps: &[u8],
) -> Result<usize> {
    if steps.len() > MAX_WALK_STEPS {
        return Err(ProtocolError::MessageTooLong {
            field: "walk path",
            max: MAX_WALK_STEPS,
            actual: steps.len(),
        });
    }
    if let Some(bad) = steps.iter().find(|&&step| step > MAX_DIRECTION) {
        return Err(ProtocolError::MalformedPacket(format!(
            "invalid walk direction {bad}"
        )));
    }

    let packed = pack_steps(steps);
    let frame = reserve_frame(buf, 7 + packed.len());
    let offset = write_header(frame, MARKER_C1, version.walk_code(), None);
    frame[offset] = source.0;
    frame[offset + 1] = source.1;
    frame[offset + 2] = steps.first().copied().unwrap_or_default();
    frame[offset + 3] = steps.len() as u8;
    frame[offset + 4..].copy_from_slice(&packed);
    Ok(frame.len())
}

/// Pick up a dropped item.
///
/// ```text
/// Season 6: C1 05 22 id(u16 BE)
/// 0.75:     C3 06 22 00 id(u16 BE)
/// ```
pub fn pickup_item_request(buf: &mut BytesMut, version: ProtocolVersion, item_id: u16) -> usize {
    let id = item_id.to_be_bytes();
    match version {
        ProtocolVersion::Season6 => {
            let frame = reserve_frame(buf, 5);
            let offset = write_header(frame, MARKER_C1, game::PICKUP_ITEM, None);
            frame[offset..offset + 2].copy_from_slice(&id);
            frame.len()
        }
        ProtocolVersion::V075 => {
            let frame = reserve_frame(buf, 6);
            let offset = write_header(frame, MARKER_C3, game::PICKUP_ITEM, None);
            frame[offset + 1..offset + 3].copy_from_slice(&id);
            frame.len()
        }
    }
}
