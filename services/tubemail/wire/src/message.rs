//! Typed messages carried inside blocks.
//!
//! Every block starts with a one-byte tag selecting the message kind; the rest
//! of the block is the kind-specific payload:
//!
//! ```text
//! +-----+-------+------------------------------------------+
//! | tag | kind  | payload                                  |
//! +-----+-------+------------------------------------------+
//! | 0   | hello | 4-byte magic                             |
//! | 1   | iam   | JSON {"id": <128 hex>, "port": u16}      |
//! | 2   | neigh | JSON {"id": <128 hex>, "port": u16,      |
//! |     |       |       "host": <IP literal>}              |
//! | 3   | data  | opaque bytes                             |
//! +-----+-------+------------------------------------------+
//! ```
//!
//! Validation happens on both sides: typed fields make it impossible to pack
//! an invalid message, and unpacking rejects unknown fields, malformed ids,
//! out-of-range ports and host names.

use crate::{PeerId, WireError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Payload of the hello message
pub const HELLO_MAGIC: [u8; 4] = [0xf0, 0x9f, 0x8d, 0xbe];

/// Message kinds as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Protocol greeting
    Hello = 0x00,
    /// Identity and listen port of the sender
    Iam = 0x01,
    /// Gossip about another member of the mesh
    Neigh = 0x02,
    /// Application payload
    Data = 0x03,
}

impl MessageKind {
    /// Wire tag of this kind
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageKind::Hello),
            0x01 => Ok(MessageKind::Iam),
            0x02 => Ok(MessageKind::Neigh),
            0x03 => Ok(MessageKind::Data),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Hello => "hello",
            MessageKind::Iam => "iam",
            MessageKind::Neigh => "neigh",
            MessageKind::Data => "data",
        };
        f.write_str(name)
    }
}

/// Identity announcement sent during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Iam {
    /// Sender identity
    pub id: PeerId,
    /// Port the sender listens on
    pub port: u16,
}

/// Gossip about a member the sender is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NeighAnnounce {
    /// Identity of the announced member
    pub id: PeerId,
    /// Listen port of the announced member
    pub port: u16,
    /// Address the sender sees the member at
    #[serde(deserialize_with = "ip_literal")]
    pub host: IpAddr,
}

fn ip_literal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IpAddr, D::Error> {
    let host = String::deserialize(deserializer)?;
    host.parse()
        .map_err(|_| serde::de::Error::custom(WireError::InvalidHost(host)))
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Greeting carrying [`HELLO_MAGIC`]
    Hello,
    /// Identity announcement
    Iam(Iam),
    /// Member gossip
    Neigh(NeighAnnounce),
    /// Opaque application payload
    Data(Bytes),
}

type Unpack = fn(Bytes) -> Result<Message, WireError>;

/// Unpackers indexed by wire tag
static REGISTRY: [Unpack; 4] = [unpack_hello, unpack_iam, unpack_neigh, unpack_data];

fn unpack_hello(payload: Bytes) -> Result<Message, WireError> {
    if payload[..] != HELLO_MAGIC[..] {
        return Err(WireError::Magic);
    }
    Ok(Message::Hello)
}

fn unpack_iam(payload: Bytes) -> Result<Message, WireError> {
    Ok(Message::Iam(serde_json::from_slice(&payload)?))
}

fn unpack_neigh(payload: Bytes) -> Result<Message, WireError> {
    Ok(Message::Neigh(serde_json::from_slice(&payload)?))
}

fn unpack_data(payload: Bytes) -> Result<Message, WireError> {
    Ok(Message::Data(payload))
}

impl Message {
    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello => MessageKind::Hello,
            Message::Iam(_) => MessageKind::Iam,
            Message::Neigh(_) => MessageKind::Neigh,
            Message::Data(_) => MessageKind::Data,
        }
    }

    /// Pack into block fragments: the tag byte followed by the payload.
    ///
    /// The fragments are meant to be handed to the framer as one block, which
    /// avoids copying large data payloads.
    pub fn pack(&self) -> Result<[Bytes; 2], WireError> {
        let payload = match self {
            Message::Hello => Bytes::from_static(&HELLO_MAGIC),
            Message::Iam(iam) => Bytes::from(serde_json::to_vec(iam)?),
            Message::Neigh(neigh) => Bytes::from(serde_json::to_vec(neigh)?),
            Message::Data(data) => data.clone(),
        };
        Ok([Bytes::copy_from_slice(&[self.kind().tag()]), payload])
    }

    /// Unpack one block
    pub fn unpack(mut block: Bytes) -> Result<Self, WireError> {
        if block.is_empty() {
            return Err(WireError::Empty);
        }

        let tag = block[0];
        let unpack = REGISTRY
            .get(tag as usize)
            .ok_or(WireError::Type(tag))?;
        unpack(block.split_off(1))
    }
}
