use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, Message as _};
use tracing::debug;

use crate::dialect;
use crate::error::{DecodeError, EncodeError};
use crate::message::{Message, Payload, UnknownPayload};

pub const STX: u8 = 0xFD;
/// Start marker, length, incompat and compat flags, sequence, system, component, 24-bit id.
pub const HEADER_LEN: usize = 10;
pub const CHECKSUM_LEN: usize = 2;
pub const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// Serialises a message into one MAVLink 2 frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mav = dialect::to_mav(&msg.payload)?;
    let header = MavHeader {
        system_id: msg.system_id,
        component_id: msg.component_id,
        sequence: msg.sequence,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + 64 + CHECKSUM_LEN);
    mavlink::write_v2_msg(&mut out, header, &mav).map_err(|e| EncodeError::Write(format!("{e:?}")))?;
    Ok(out)
}

/// Decodes the frame at the start of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    decode_frame(bytes).map(|(msg, _)| msg)
}

/// Like [`decode`], also returning how many bytes the frame occupied.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
    let Some(&first) = bytes.first() else {
        return Err(DecodeError::Truncated { needed: HEADER_LEN, available: 0 });
    };
    if first != STX {
        return Err(DecodeError::BadMagic(first));
    }
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated { needed: HEADER_LEN, available: bytes.len() });
    }

    let len = bytes[1] as usize;
    let total = frame_len(len, bytes[2]);
    if bytes.len() < total {
        return Err(DecodeError::Truncated { needed: total, available: bytes.len() });
    }

    let msg_id = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], 0]);
    let body_end = HEADER_LEN + len;
    let received = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
    let mismatch = DecodeError::ChecksumMismatch { msg_id, received };

    // The reader skips frames whose CRC (with the per-message CRC_EXTRA) fails,
    // which on a single-frame slice surfaces as end of input.
    let mut reader = PeekReader::new(&bytes[..total]);
    let (header, mav) = match mavlink::read_v2_msg::<MavMessage, _>(&mut reader) {
        Ok(read) => read,
        Err(MessageReadError::Io(_)) => return Err(mismatch),
        Err(MessageReadError::Parse(e)) => {
            debug!(msg_id, error = %e, "codec: checksum held but payload does not parse");
            return Err(DecodeError::Malformed { msg_id });
        }
    };
    if mav.message_id() != msg_id || header.sequence != bytes[4] || header.system_id != bytes[5] {
        return Err(mismatch);
    }

    let payload = dialect::from_mav(&mav)
        .unwrap_or_else(|| Payload::Unknown(UnknownPayload::from_frame(msg_id, &bytes[HEADER_LEN..body_end])));
    let msg = Message {
        sequence: header.sequence,
        system_id: header.system_id,
        component_id: header.component_id,
        payload,
    };
    Ok((msg, total))
}

/// Bytes occupied by a frame declaring `payload_len`, including any signature.
pub fn frame_len(payload_len: usize, incompat_flags: u8) -> usize {
    let signature = if incompat_flags & INCOMPAT_SIGNED != 0 { SIGNATURE_LEN } else { 0 };
    HEADER_LEN + payload_len + CHECKSUM_LEN + signature
}
