//! Transport frames: the header in front of every datagram.
//!
//! Frame format: `[type: u8][fields]`, big-endian. `Reliable` and `Unreliable` carry
//! one application frame (see [`crate::codec`]) as their payload, or one fragment of it
//! when the frame does not fit in a single datagram; every other type is connection
//! control.
//!
//! Fragmented payloads use their own frame types, with a
//! `group: u32, index: u16, count: u16` header after the sequence number (reliable) or
//! directly after the type (unreliable).

use crate::codec::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

const CONNECT: u8 = 0;
const ACCEPT: u8 = 1;
const REFUSE: u8 = 2;
const VERIFY: u8 = 3;
const RELIABLE: u8 = 4;
const UNRELIABLE: u8 = 5;
const ACK: u8 = 6;
const PING: u8 = 7;
const DISCONNECT: u8 = 8;
const DISCONNECT_ACK: u8 = 9;
const RELIABLE_FRAGMENT: u8 = 10;
const UNRELIABLE_FRAGMENT: u8 = 11;

/// Delivery class for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Retransmitted until acknowledged; the connection is dropped if that never happens
    Reliable,
    /// Sent once, may be lost
    Unreliable,
}

/// Position of one piece of a payload split across several datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Shared by all pieces of one payload
    pub group: u32,
    pub index: u16,
    pub count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client asks for a connection; the token identifies this attempt
    Connect { token: u64 },
    Accept { token: u64 },
    Refuse { token: u64 },
    /// Client confirms it saw `Accept`
    Verify,
    Reliable {
        seq: u32,
        fragment: Option<Fragment>,
        payload: Bytes,
    },
    Unreliable {
        fragment: Option<Fragment>,
        payload: Bytes,
    },
    Ack { seq: u32 },
    Ping,
    Disconnect,
    DisconnectAck,
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Frame::Connect { token } => {
                buf.put_u8(CONNECT);
                buf.put_u64(*token);
            }
            Frame::Accept { token } => {
                buf.put_u8(ACCEPT);
                buf.put_u64(*token);
            }
            Frame::Refuse { token } => {
                buf.put_u8(REFUSE);
                buf.put_u64(*token);
            }
            Frame::Verify => buf.put_u8(VERIFY),
            Frame::Reliable {
                seq,
                fragment,
                payload,
            } => {
                buf.reserve(payload.len());
                match fragment {
                    Some(fragment) => {
                        buf.put_u8(RELIABLE_FRAGMENT);
                        buf.put_u32(*seq);
                        put_fragment(&mut buf, fragment);
                    }
                    None => {
                        buf.put_u8(RELIABLE);
                        buf.put_u32(*seq);
                    }
                }
                buf.put_slice(payload);
            }
            Frame::Unreliable { fragment, payload } => {
                buf.reserve(payload.len());
                match fragment {
                    Some(fragment) => {
                        buf.put_u8(UNRELIABLE_FRAGMENT);
                        put_fragment(&mut buf, fragment);
                    }
                    None => buf.put_u8(UNRELIABLE),
                }
                buf.put_slice(payload);
            }
            Frame::Ack { seq } => {
                buf.put_u8(ACK);
                buf.put_u32(*seq);
            }
            Frame::Ping => buf.put_u8(PING),
            Frame::Disconnect => buf.put_u8(DISCONNECT),
            Frame::DisconnectAck => buf.put_u8(DISCONNECT_ACK),
        }
        buf.freeze()
    }

    pub fn decode(mut datagram: Bytes) -> Result<Frame, DecodeError> {
        if !datagram.has_remaining() {
            return Err(DecodeError::Truncated);
        }

        let frame = match datagram.get_u8() {
            CONNECT => Frame::Connect {
                token: read_token(&mut datagram)?,
            },
            ACCEPT => Frame::Accept {
                token: read_token(&mut datagram)?,
            },
            REFUSE => Frame::Refuse {
                token: read_token(&mut datagram)?,
            },
            VERIFY => Frame::Verify,
            RELIABLE => {
                let seq = read_seq(&mut datagram)?;
                Frame::Reliable {
                    seq,
                    fragment: None,
                    payload: datagram,
                }
            }
            RELIABLE_FRAGMENT => {
                let seq = read_seq(&mut datagram)?;
                let fragment = read_fragment(&mut datagram)?;
                Frame::Reliable {
                    seq,
                    fragment: Some(fragment),
                    payload: datagram,
                }
            }
            UNRELIABLE => Frame::Unreliable {
                fragment: None,
                payload: datagram,
            },
            UNRELIABLE_FRAGMENT => {
                let fragment = read_fragment(&mut datagram)?;
                Frame::Unreliable {
                    fragment: Some(fragment),
                    payload: datagram,
                }
            }
            ACK => Frame::Ack {
                seq: read_seq(&mut datagram)?,
            },
            PING => Frame::Ping,
            DISCONNECT => Frame::Disconnect,
            DISCONNECT_ACK => Frame::DisconnectAck,
            other => return Err(DecodeError::UnknownKind(other as u32)),
        };
        Ok(frame)
    }

    /// Connect token carried by the datagram, without decoding the rest
    pub fn peek_connect(datagram: &[u8]) -> Option<u64> {
        match datagram {
            [CONNECT, token @ ..] if token.len() == 8 => {
                let mut token = token;
                Some(token.get_u64())
            }
            _ => None,
        }
    }
}

fn read_token(buf: &mut Bytes) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u64())
}

fn read_seq(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u32())
}

fn put_fragment(buf: &mut BytesMut, fragment: &Fragment) {
    buf.put_u32(fragment.group);
    buf.put_u16(fragment.index);
    buf.put_u16(fragment.count);
}

fn read_fragment(buf: &mut Bytes) -> Result<Fragment, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    let fragment = Fragment {
        group: buf.get_u32(),
        index: buf.get_u16(),
        count: buf.get_u16(),
    };
    if fragment.index >= fragment.count {
        return Err(DecodeError::Malformed("fragment index"));
    }
    Ok(fragment)
}

/// Where outgoing datagrams go.
///
/// Sends must not block: the simulation thread calls this directly.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.try_send_to(datagram, addr).map(|_| ())
    }
}
