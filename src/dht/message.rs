/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! DHT datagram codec.
//!
//! Every RPC datagram is `1 B type || 16 B transaction id || body`,
//! all integers big-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::{rngs::OsRng, RngCore};

use super::{
    node_id::{NodeId, NODE_ID_SIZE},
    record::PeerAnnouncement,
};
use crate::{Error, Result};

/// Transaction id length
pub const TXID_SIZE: usize = 16;

/// Maximum datagram we are willing to parse
pub const MAX_DATAGRAM_SIZE: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TxId(pub [u8; TXID_SIZE]);

impl TxId {
    pub fn random() -> Self {
        let mut id = [0u8; TXID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }
}

/// RPC type byte on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum RpcType {
    Ping = 0x01,
    Pong = 0x02,
    FindNode = 0x03,
    Nodes = 0x04,
    Store = 0x05,
    StoreAck = 0x06,
    FindValue = 0x07,
    Value = 0x08,
}

/// A contact as carried in NODES replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Parsed RPC body.
#[derive(Clone, Debug)]
pub enum RpcBody {
    Ping { sender: NodeId, sender_port: u16 },
    Pong { responder: NodeId },
    FindNode { target: NodeId },
    Nodes { contacts: Vec<ContactInfo> },
    Store { key: NodeId, record: PeerAnnouncement },
    StoreAck,
    FindValue { key: NodeId },
    ValueNodes { contacts: Vec<ContactInfo> },
    ValueRecord { record: PeerAnnouncement },
}

impl RpcBody {
    fn rpc_type(&self) -> RpcType {
        match self {
            Self::Ping { .. } => RpcType::Ping,
            Self::Pong { .. } => RpcType::Pong,
            Self::FindNode { .. } => RpcType::FindNode,
            Self::Nodes { .. } => RpcType::Nodes,
            Self::Store { .. } => RpcType::Store,
            Self::StoreAck => RpcType::StoreAck,
            Self::FindValue { .. } => RpcType::FindValue,
            Self::ValueNodes { .. } | Self::ValueRecord { .. } => RpcType::Value,
        }
    }

    /// Whether this body is a reply (completes a pending transaction).
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Pong { .. } |
                Self::Nodes { .. } |
                Self::StoreAck |
                Self::ValueNodes { .. } |
                Self::ValueRecord { .. }
        )
    }
}

pub fn encode(txid: &TxId, body: &RpcBody) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(body.rpc_type() as u8);
    out.extend_from_slice(&txid.0);

    match body {
        RpcBody::Ping { sender, sender_port } => {
            out.extend_from_slice(sender.as_bytes());
            out.extend_from_slice(&sender_port.to_be_bytes());
        }
        RpcBody::Pong { responder } => out.extend_from_slice(responder.as_bytes()),
        RpcBody::FindNode { target } => out.extend_from_slice(target.as_bytes()),
        RpcBody::Nodes { contacts } | RpcBody::ValueNodes { contacts } => {
            if matches!(body, RpcBody::ValueNodes { .. }) {
                out.push(0);
            }
            write_contacts(&mut out, contacts);
        }
        RpcBody::Store { key, record } => {
            out.extend_from_slice(key.as_bytes());
            record.encode(&mut out);
        }
        RpcBody::StoreAck => {}
        RpcBody::FindValue { key } => out.extend_from_slice(key.as_bytes()),
        RpcBody::ValueRecord { record } => {
            out.push(1);
            record.encode(&mut out);
        }
    }

    out
}

pub fn decode(datagram: &[u8]) -> Result<(TxId, RpcBody)> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::MalformedPacket("oversized datagram".to_string()))
    }

    let mut reader = ByteReader::new(datagram);
    let type_byte = reader.take_u8()?;

    let mut txid = [0u8; TXID_SIZE];
    txid.copy_from_slice(reader.take(TXID_SIZE)?);
    let txid = TxId(txid);

    let body = match type_byte {
        t if t == RpcType::Ping as u8 => RpcBody::Ping {
            sender: reader.take_node_id()?,
            sender_port: reader.take_u16()?,
        },
        t if t == RpcType::Pong as u8 => RpcBody::Pong { responder: reader.take_node_id()? },
        t if t == RpcType::FindNode as u8 => {
            RpcBody::FindNode { target: reader.take_node_id()? }
        }
        t if t == RpcType::Nodes as u8 => RpcBody::Nodes { contacts: read_contacts(&mut reader)? },
        t if t == RpcType::Store as u8 => RpcBody::Store {
            key: reader.take_node_id()?,
            record: PeerAnnouncement::decode(&mut reader)?,
        },
        t if t == RpcType::StoreAck as u8 => RpcBody::StoreAck,
        t if t == RpcType::FindValue as u8 => {
            RpcBody::FindValue { key: reader.take_node_id()? }
        }
        t if t == RpcType::Value as u8 => match reader.take_u8()? {
            0 => RpcBody::ValueNodes { contacts: read_contacts(&mut reader)? },
            1 => RpcBody::ValueRecord { record: PeerAnnouncement::decode(&mut reader)? },
            _ => return Err(Error::MalformedPacket("bad value tag".to_string())),
        },
        t => return Err(Error::UnknownMessageType(t)),
    };

    Ok((txid, body))
}

fn write_contacts(out: &mut Vec<u8>, contacts: &[ContactInfo]) {
    out.push(contacts.len() as u8);
    for contact in contacts {
        out.extend_from_slice(contact.id.as_bytes());
        write_addr(out, &contact.addr.ip());
        out.extend_from_slice(&contact.addr.port().to_be_bytes());
    }
}

fn read_contacts(reader: &mut ByteReader) -> Result<Vec<ContactInfo>> {
    let count = reader.take_u8()? as usize;
    let mut contacts = Vec::with_capacity(count);
    for _ in 0..count {
        let id = reader.take_node_id()?;
        let ip = read_addr(reader)?;
        let port = reader.take_u16()?;
        contacts.push(ContactInfo { id, addr: SocketAddr::new(ip, port) });
    }
    Ok(contacts)
}

/// `1 B family (4|6) || address bytes`, shared with the announcement
/// record codec.
pub(crate) fn write_addr(out: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

pub(crate) fn read_addr(reader: &mut ByteReader) -> Result<IpAddr> {
    match reader.take_u8()? {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(reader.take(4)?);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(reader.take(16)?);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(Error::MalformedPacket("bad address family".to_string())),
    }
}

/// Bounds-checked big-endian slice reader.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::MalformedPacket("truncated message".to_string()))
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn take_node_id(&mut self) -> Result<NodeId> {
        NodeId::from_bytes(self.take(NODE_ID_SIZE)?)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrip() {
        let txid = TxId::random();
        let body = RpcBody::Ping { sender: NodeId::random(), sender_port: 51821 };

        let bytes = encode(&txid, &body);
        let (txid2, body2) = decode(&bytes).unwrap();

        assert_eq!(txid, txid2);
        match (body, body2) {
            (
                RpcBody::Ping { sender: a, sender_port: pa },
                RpcBody::Ping { sender: b, sender_port: pb },
            ) => {
                assert_eq!(a, b);
                assert_eq!(pa, pb);
            }
            _ => panic!("wrong body"),
        }
    }

    #[test]
    fn nodes_roundtrip_mixed_families() {
        let contacts = vec![
            ContactInfo { id: NodeId::random(), addr: "10.0.0.1:51821".parse().unwrap() },
            ContactInfo { id: NodeId::random(), addr: "[::1]:4000".parse().unwrap() },
        ];

        let bytes = encode(&TxId::random(), &RpcBody::Nodes { contacts: contacts.clone() });
        let (_, body) = decode(&bytes).unwrap();

        match body {
            RpcBody::Nodes { contacts: parsed } => assert_eq!(parsed, contacts),
            _ => panic!("wrong body"),
        }
    }

    #[test]
    fn rejects_unknown_type_and_truncation() {
        let mut bytes = encode(&TxId::random(), &RpcBody::StoreAck);
        bytes[0] = 0x7f;
        assert!(matches!(decode(&bytes), Err(Error::UnknownMessageType(0x7f))));

        assert!(decode(&[0x01, 0x00]).is_err());
    }
}
