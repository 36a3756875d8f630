use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::declared_length;
use crate::error::{ProtocolError, Result};

/// Frames C1–C4 packets out of a (decrypted) byte stream.
///
/// Decoded items are the complete frames, header included, so the router can parse
/// the header itself. Encoding passes already-built frames through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((kind, length)) = declared_length(src)? else {
            return Ok(None);
        };

        // A frame must at least reach its main code byte
        if length <= kind.code_offset() {
            return Err(ProtocolError::InvalidFrameLength(length));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
