//! The length-framed control message codec.
//!
//! ```text
//! offset  size  field
//! 0       1     magic byte 1 ('G')
//! 1       1     magic byte 2 ('L')
//! 2       1     type byte ('D' discovery | 'F' file request)
//! 3       1     reserved / separator = 0x00
//! 4       2     total length, big-endian
//! 6       8     unique_peer_id
//! 14      3     device_type
//! 17      1     reserved / separator = 0x00
//! 18      1     hostname length N (1..=255)
//! 19      N     hostname bytes
//! 19+N    ...   type-specific payload
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};

use crate::config::Identity;

const MAGIC: [u8; 2] = [b'G', b'L'];
const TYPE_DISCOVERY: u8 = b'D';
const TYPE_FILE_REQUEST: u8 = b'F';

/// Fixed offsets into the header, named so the encoder/parser agree on
/// them instead of repeating magic numbers.
const OFF_TYPE: usize = 2;
const OFF_SEP1: usize = 3;
const OFF_TOTAL_LEN: usize = 4;
const OFF_PEER_ID: usize = 6;
const OFF_DEVICE_TYPE: usize = 14;
const OFF_SEP2: usize = 17;
const OFF_HOSTNAME_LEN: usize = 18;
const OFF_HOSTNAME: usize = 19;

/// The six bytes a caller must have in hand before `parse` can even tell
/// whether the rest of the frame is there — see `peek_len`.
pub const HEADER_PEEK_LEN: usize = 6;
/// Minimum total_length a well-formed frame can declare: the header
/// alone, with no hostname or payload.
const MIN_TOTAL_LEN: u16 = 6;

/// In-memory representation of a control message. `Invalid` is a
/// sentinel value, not an error — a message that failed validation still
/// has to be "discarded" by its caller, and returning it as data (rather
/// than raising an error) is what lets the discovery loops treat it as a
/// plain continue-condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Discovery { identity: Identity },
    FileRequest {
        identity: Identity,
        transfer_port: u16,
        file_name: String,
        file_size: u64,
    },
    Invalid,
}

/// The only condition `parse` treats as a real error: not enough bytes
/// have arrived yet to know whether the frame is even well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated;

impl std::fmt::Display for Truncated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer shorter than the frame's declared total length")
    }
}
impl std::error::Error for Truncated {}

/// Reads just enough of `buf` to learn the frame's declared total length,
/// without validating anything else. Returns `None` if fewer than
/// [`HEADER_PEEK_LEN`] bytes are available — the caller should wait for
/// more data (TCP) or treat the datagram as garbage (UDP, where a short
/// read means a short read and no more is coming).
pub fn peek_len(buf: &[u8]) -> Option<u16> {
    if buf.len() < HEADER_PEEK_LEN {
        return None;
    }
    Some(u16::from_be_bytes([buf[4], buf[5]]))
}

/// Parses a received frame into a [`ControlMessage`].
///
/// Returns `Err(Truncated)` only when `buf` doesn't yet contain the number
/// of bytes the header itself claims the frame occupies. Every other
/// validation failure (bad magic, bad type, length too short, hostname
/// length out of range, non-printable device type, malformed file-request
/// payload) yields `Ok(ControlMessage::Invalid)` — these are
/// all the same "drop and continue" outcome, not propagated errors.
pub fn parse(buf: &[u8]) -> Result<ControlMessage, Truncated> {
    let total_len = match peek_len(buf) {
        Some(n) => n,
        None => return Err(Truncated),
    };

    if buf[0] != MAGIC[0] || buf[1] != MAGIC[1] || buf[OFF_SEP1] != 0 {
        return Ok(ControlMessage::Invalid);
    }
    let msg_type = buf[OFF_TYPE];
    if msg_type != TYPE_DISCOVERY && msg_type != TYPE_FILE_REQUEST {
        return Ok(ControlMessage::Invalid);
    }
    if total_len < MIN_TOTAL_LEN {
        return Ok(ControlMessage::Invalid);
    }
    if (buf.len() as u64) < total_len as u64 {
        return Err(Truncated);
    }
    let buf = &buf[..total_len as usize];

    if buf.len() < OFF_HOSTNAME || buf[OFF_SEP2] != 0 {
        return Ok(ControlMessage::Invalid);
    }

    let mut cursor = &buf[OFF_PEER_ID..];
    let mut unique_peer_id = [0u8; 8];
    unique_peer_id.copy_from_slice(&cursor[..8]);
    cursor = &cursor[8..];

    let mut device_type = [0u8; 3];
    device_type.copy_from_slice(&cursor[..3]);
    if !device_type.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Ok(ControlMessage::Invalid);
    }

    let hostname_len = buf[OFF_HOSTNAME_LEN] as usize;
    if hostname_len == 0 {
        return Ok(ControlMessage::Invalid);
    }
    if buf.len() < OFF_HOSTNAME + hostname_len {
        return Ok(ControlMessage::Invalid);
    }
    let hostname = match std::str::from_utf8(&buf[OFF_HOSTNAME..OFF_HOSTNAME + hostname_len]) {
        Ok(s) => s.to_string(),
        Err(_) => return Ok(ControlMessage::Invalid),
    };

    let identity = Identity {
        unique_peer_id,
        device_type,
        hostname,
    };

    let payload = &buf[OFF_HOSTNAME + hostname_len..];

    match msg_type {
        TYPE_DISCOVERY => Ok(ControlMessage::Discovery { identity }),
        TYPE_FILE_REQUEST => parse_file_request(identity, payload),
        _ => unreachable!("msg_type already validated above"),
    }
}

fn parse_file_request(identity: Identity, mut payload: &[u8]) -> Result<ControlMessage, Truncated> {
    if payload.len() < 12 {
        return Ok(ControlMessage::Invalid);
    }
    let transfer_port = match payload.read_u16::<BigEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(ControlMessage::Invalid),
    };
    let file_size = match payload.read_u64::<BigEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(ControlMessage::Invalid),
    };
    let name_len = match payload.read_u16::<BigEndian>() {
        Ok(v) => v as usize,
        Err(_) => return Ok(ControlMessage::Invalid),
    };
    if name_len == 0 || payload.len() < name_len {
        return Ok(ControlMessage::Invalid);
    }
    let file_name = match std::str::from_utf8(&payload[..name_len]) {
        Ok(s) => s.to_string(),
        Err(_) => return Ok(ControlMessage::Invalid),
    };
    if file_name.contains('/') || file_name.contains('\\') {
        return Ok(ControlMessage::Invalid);
    }

    Ok(ControlMessage::FileRequest {
        identity,
        transfer_port,
        file_name,
        file_size,
    })
}

/// Encodes a discovery message carrying `identity`.
pub fn encode_discovery(identity: &Identity) -> Vec<u8> {
    encode(identity, TYPE_DISCOVERY, &[])
}

/// Encodes a file-request message carrying `identity`.
pub fn encode_file_request(
    identity: &Identity,
    transfer_port: u16,
    file_name: &str,
    file_size: u64,
) -> Vec<u8> {
    let mut payload = BytesMut::with_capacity(12 + file_name.len());
    payload.put_u16(transfer_port);
    payload.put_u64(file_size);
    payload.put_u16(file_name.len() as u16);
    payload.put_slice(file_name.as_bytes());
    encode(identity, TYPE_FILE_REQUEST, &payload)
}

fn encode(identity: &Identity, msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let hostname_bytes = identity.hostname.as_bytes();
    debug_assert!(!hostname_bytes.is_empty() && hostname_bytes.len() <= 255);

    let total_len = OFF_HOSTNAME + hostname_bytes.len() + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_slice(&MAGIC);
    buf.put_u8(msg_type);
    buf.put_u8(0); // separator
    buf.put_u16(total_len as u16);
    buf.put_slice(&identity.unique_peer_id);
    buf.put_slice(&identity.device_type);
    buf.put_u8(0); // separator
    buf.put_u8(hostname_bytes.len() as u8);
    buf.put_slice(hostname_bytes);
    buf.put_slice(payload);

    debug_assert_eq!(buf.len(), total_len);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            unique_peer_id: [1, 2, 3, 4, 5, 6, 7, 8],
            device_type: *b"DSK",
            hostname: "alpha".to_string(),
        }
    }

    #[test]
    fn discovery_round_trips() {
        let id = identity();
        let bytes = encode_discovery(&id);
        let msg = parse(&bytes).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Discovery {
                identity: id.clone()
            }
        );
    }

    #[test]
    fn file_request_round_trips() {
        let id = identity();
        let bytes = encode_file_request(&id, 5000, "hello.txt", 5);
        let msg = parse(&bytes).unwrap();
        assert_eq!(
            msg,
            ControlMessage::FileRequest {
                identity: id,
                transfer_port: 5000,
                file_name: "hello.txt".to_string(),
                file_size: 5,
            }
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode_discovery(&identity());
        bytes[0] = b'X';
        assert_eq!(parse(&bytes).unwrap(), ControlMessage::Invalid);
    }

    #[test]
    fn rejects_zero_hostname_length() {
        let mut bytes = encode_discovery(&identity());
        bytes[OFF_HOSTNAME_LEN] = 0;
        assert_eq!(parse(&bytes).unwrap(), ControlMessage::Invalid);
    }

    #[test]
    fn truncated_total_length_is_an_error() {
        let bytes = encode_discovery(&identity());
        let short = &bytes[..bytes.len() - 1];
        assert_eq!(parse(short), Err(Truncated));
    }

    #[test]
    fn too_short_for_header_peek_is_an_error() {
        assert_eq!(parse(&[b'G', b'L', b'D']), Err(Truncated));
    }

    #[test]
    fn rejects_file_name_with_path_separator() {
        let id = identity();
        let bytes = encode_file_request(&id, 0, "../etc/passwd", 4);
        assert_eq!(parse(&bytes).unwrap(), ControlMessage::Invalid);
    }

    #[test]
    fn encode_is_deterministic() {
        let id = identity();
        assert_eq!(encode_discovery(&id), encode_discovery(&id));
    }
}
