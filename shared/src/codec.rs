//! Typed application packets and their byte layout.
//!
//! Frame format: `[kind: u32][body]`. All numbers are big-endian. Fixed-size bodies
//! carry no length; variable-size bodies carry an explicit length so that decoding
//! never reads past the end of the datagram.
//!
//! ```text
//! Ack             state: i32
//! MouseMove       x: f64, y: f64
//! KeyStroke       keycode: u8
//! Chat            len: u32, utf8[len]
//! GameStateDelta  base: u32, target: u32, is_full: u8, len: u32, changes[len]
//! ClassIdMapping  class_id: i32, name_len: i32, utf8[name_len]
//! Welcome         peer_id: u32
//! ```
//!
//! The `changes` blob of a delta is `count: u32` followed by `count` entries of
//! `field_id: u32, op: u8` and, for `op == 0` (set), `len: u32, bytes[len]`.

use crate::gamestate::{FieldChange, GameStateDiff};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const FIELD_SET: u8 = 0;
const FIELD_REMOVE: u8 = 1;

/// Bytes taken by the fixed part of a `GameStateDelta` frame, kind included.
pub const DELTA_HEADER_LEN: usize = 17;

/// Errors returned by [`decode`]. Each one means "drop this datagram", never more.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown packet kind {0}")]
    UnknownKind(u32),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Packet discriminant as written in the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ack = 0,
    MouseMove = 1,
    KeyStroke = 2,
    Chat = 3,
    GameStateDelta = 4,
    ClassIdMapping = 5,
    Welcome = 6,
}

impl TryFrom<u32> for PacketKind {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketKind::Ack,
            1 => PacketKind::MouseMove,
            2 => PacketKind::KeyStroke,
            3 => PacketKind::Chat,
            4 => PacketKind::GameStateDelta,
            5 => PacketKind::ClassIdMapping,
            6 => PacketKind::Welcome,
            other => return Err(DecodeError::UnknownKind(other)),
        })
    }
}

/// Application packet exchanged between client and server.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Snapshot acknowledgement; `state <= 0` asks for a full resync
    Ack { state: i32 },
    MouseMove { x: f64, y: f64 },
    KeyStroke { keycode: u8 },
    Chat { message: String },
    GameStateDelta(GameStateDiff),
    /// Maps a numeric class id used by replicated state to its name
    ClassIdMapping { class_id: i32, name: String },
    /// Last packet of the server handshake, carrying the id assigned to the client
    Welcome { peer_id: u32 },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::MouseMove { .. } => PacketKind::MouseMove,
            Packet::KeyStroke { .. } => PacketKind::KeyStroke,
            Packet::Chat { .. } => PacketKind::Chat,
            Packet::GameStateDelta(_) => PacketKind::GameStateDelta,
            Packet::ClassIdMapping { .. } => PacketKind::ClassIdMapping,
            Packet::Welcome { .. } => PacketKind::Welcome,
        }
    }

    pub fn encode(&self) -> Bytes {
        encode(self)
    }

    /// Size of the encoded frame in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Packet::Ack { .. } | Packet::Welcome { .. } => 4,
            Packet::MouseMove { .. } => 16,
            Packet::KeyStroke { .. } => 1,
            Packet::Chat { message } => 4 + message.len(),
            Packet::GameStateDelta(diff) => DELTA_HEADER_LEN - 4 + changes_len(&diff.changes),
            Packet::ClassIdMapping { name, .. } => 8 + name.len(),
        }
    }
}

pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    buf.put_u32(packet.kind() as u32);

    match packet {
        Packet::Ack { state } => buf.put_i32(*state),
        Packet::MouseMove { x, y } => {
            buf.put_f64(*x);
            buf.put_f64(*y);
        }
        Packet::KeyStroke { keycode } => buf.put_u8(*keycode),
        Packet::Chat { message } => {
            buf.put_u32(message.len() as u32);
            buf.put_slice(message.as_bytes());
        }
        Packet::GameStateDelta(diff) => {
            buf.put_u32(diff.base_snapshot_id);
            buf.put_u32(diff.target_snapshot_id);
            buf.put_u8(diff.is_full as u8);
            buf.put_u32(changes_len(&diff.changes) as u32);
            put_changes(&mut buf, &diff.changes);
        }
        Packet::ClassIdMapping { class_id, name } => {
            buf.put_i32(*class_id);
            buf.put_i32(name.len() as i32);
            buf.put_slice(name.as_bytes());
        }
        Packet::Welcome { peer_id } => buf.put_u32(*peer_id),
    }

    buf.freeze()
}

pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    let mut buf = data;
    let kind = PacketKind::try_from(read_u32(&mut buf)?)?;

    let packet = match kind {
        PacketKind::Ack => Packet::Ack {
            state: read_i32(&mut buf)?,
        },
        PacketKind::MouseMove => {
            ensure(&buf, 16)?;
            Packet::MouseMove {
                x: buf.get_f64(),
                y: buf.get_f64(),
            }
        }
        PacketKind::KeyStroke => {
            ensure(&buf, 1)?;
            Packet::KeyStroke {
                keycode: buf.get_u8(),
            }
        }
        PacketKind::Chat => {
            let len = read_u32(&mut buf)? as usize;
            Packet::Chat {
                message: read_string(&mut buf, len)?,
            }
        }
        PacketKind::GameStateDelta => {
            ensure(&buf, DELTA_HEADER_LEN - 4)?;
            let base_snapshot_id = buf.get_u32();
            let target_snapshot_id = buf.get_u32();
            let is_full = match buf.get_u8() {
                0 => false,
                1 => true,
                _ => return Err(DecodeError::Malformed("full-snapshot flag")),
            };
            let len = buf.get_u32() as usize;
            ensure(&buf, len)?;
            let changes = decode_changes(&buf[..len])?;
            buf.advance(len);
            Packet::GameStateDelta(GameStateDiff {
                base_snapshot_id,
                target_snapshot_id,
                is_full,
                changes,
            })
        }
        PacketKind::ClassIdMapping => {
            let class_id = read_i32(&mut buf)?;
            let len = read_i32(&mut buf)?;
            let len = usize::try_from(len).map_err(|_| DecodeError::Malformed("negative length"))?;
            Packet::ClassIdMapping {
                class_id,
                name: read_string(&mut buf, len)?,
            }
        }
        PacketKind::Welcome => Packet::Welcome {
            peer_id: read_u32(&mut buf)?,
        },
    };

    if buf.has_remaining() {
        return Err(DecodeError::Malformed("trailing bytes"));
    }
    Ok(packet)
}

/// Encoded size of a field-change blob.
pub(crate) fn changes_len(changes: &[FieldChange]) -> usize {
    4 + changes
        .iter()
        .map(|change| match change {
            FieldChange::Set { bytes, .. } => 9 + bytes.len(),
            FieldChange::Remove { .. } => 5,
        })
        .sum::<usize>()
}

fn put_changes(buf: &mut BytesMut, changes: &[FieldChange]) {
    buf.put_u32(changes.len() as u32);
    for change in changes {
        match change {
            FieldChange::Set { field_id, bytes } => {
                buf.put_u32(*field_id);
                buf.put_u8(FIELD_SET);
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            FieldChange::Remove { field_id } => {
                buf.put_u32(*field_id);
                buf.put_u8(FIELD_REMOVE);
            }
        }
    }
}

// The blob length was already checked against the frame, so a short read in here
// means the blob is inconsistent with itself rather than cut off.
fn decode_changes(mut blob: &[u8]) -> Result<Vec<FieldChange>, DecodeError> {
    let malformed = |_| DecodeError::Malformed("field-change blob");

    let count = read_u32(&mut blob).map_err(malformed)? as usize;
    // each entry takes at least five bytes
    if count > blob.len() / 5 {
        return Err(DecodeError::Malformed("field-change count"));
    }

    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        ensure(&blob, 5).map_err(malformed)?;
        let field_id = blob.get_u32();
        match blob.get_u8() {
            FIELD_SET => {
                let len = read_u32(&mut blob).map_err(malformed)? as usize;
                ensure(&blob, len).map_err(malformed)?;
                changes.push(FieldChange::Set {
                    field_id,
                    bytes: Bytes::copy_from_slice(&blob[..len]),
                });
                blob.advance(len);
            }
            FIELD_REMOVE => changes.push(FieldChange::Remove { field_id }),
            _ => return Err(DecodeError::Malformed("field-change op")),
        }
    }

    if blob.has_remaining() {
        return Err(DecodeError::Malformed("field-change blob"));
    }
    Ok(changes)
}

fn ensure(buf: &[u8], len: usize) -> Result<(), DecodeError> {
    if buf.len() < len {
        Err(DecodeError::Truncated)
    } else {
        Ok(())
    }
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn read_string(buf: &mut &[u8], len: usize) -> Result<String, DecodeError> {
    ensure(buf, len)?;
    let text = std::str::from_utf8(&buf[..len]).map_err(|_| DecodeError::InvalidUtf8)?;
    let text = text.to_owned();
    buf.advance(len);
    Ok(text)
}
