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

//! Onion cells and layered sealing.
//!
//! Every cell on the wire is exactly 514 bytes: a 2-byte meaningful
//! length followed by a 512-byte body padded with random bytes. The
//! body starts with a command byte. RELAY payloads are wrapped in one
//! AES-256-GCM layer per remaining hop (`12 B nonce || ciphertext+tag`
//! each, innermost layer for the exit), so the relay plaintext is a
//! fixed 427 bytes regardless of hop count traversed.

use std::net::SocketAddr;

use rand::{rngs::OsRng, RngCore};

use crate::{
    crypto::{aead, kdf::hkdf_derive},
    dht::message::{read_addr, write_addr, ByteReader},
    link::LinkPtr,
    Error, Result,
};

/// Wire size of every cell
pub const CELL_SIZE: usize = 514;

/// Cell body (command byte + payload area)
pub const CELL_BODY_SIZE: usize = 512;

/// Payload area after the command byte
pub const CELL_PAYLOAD_SIZE: usize = CELL_BODY_SIZE - 1;

/// Circuits are always three hops
pub const CIRCUIT_HOPS: usize = 3;

/// Per-layer cost: GCM nonce plus tag
pub const LAYER_OVERHEAD: usize = aead::NONCE_SIZE + aead::TAG_SIZE;

/// Relay plaintext after all layers are stripped
pub const RELAY_PLAINTEXT_SIZE: usize = CELL_PAYLOAD_SIZE - CIRCUIT_HOPS * LAYER_OVERHEAD;

/// Data bytes carried by one relay plaintext
pub const MAX_RELAY_DATA: usize = RELAY_PLAINTEXT_SIZE - 3;

/// HKDF salt for hop key derivation
pub const ONION_SALT: &[u8] = b"ANONET_ONION_V1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCmd {
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
}

impl TryFrom<u8> for CellCmd {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Create),
            2 => Ok(Self::Created),
            3 => Ok(Self::Relay),
            4 => Ok(Self::Destroy),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// A parsed onion cell.
#[derive(Clone, Debug)]
pub struct Cell {
    pub cmd: CellCmd,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(cmd: CellCmd, payload: Vec<u8>) -> Self {
        Self { cmd, payload }
    }

    /// Fixed-size wire form, random-padded.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        if self.payload.len() > CELL_PAYLOAD_SIZE {
            return Err(Error::MalformedPacket("cell payload too large".to_string()))
        }

        let meaningful = 1 + self.payload.len();
        let mut out = vec![0u8; CELL_SIZE];
        out[0..2].copy_from_slice(&(meaningful as u16).to_be_bytes());
        out[2] = self.cmd as u8;
        out[3..3 + self.payload.len()].copy_from_slice(&self.payload);
        OsRng.fill_bytes(&mut out[3 + self.payload.len()..]);
        Ok(out)
    }

    pub fn from_wire(data: &[u8]) -> Result<Self> {
        if data.len() != CELL_SIZE {
            return Err(Error::MalformedPacket("bad cell size".to_string()))
        }

        let meaningful = u16::from_be_bytes([data[0], data[1]]) as usize;
        if meaningful == 0 || meaningful > CELL_BODY_SIZE {
            return Err(Error::MalformedPacket("bad cell length".to_string()))
        }

        let cmd = CellCmd::try_from(data[2])?;
        Ok(Self { cmd, payload: data[3..2 + meaningful].to_vec() })
    }

    pub async fn send(link: &LinkPtr, cell: &Cell) -> Result<()> {
        link.send(&cell.to_wire()?).await
    }

    pub async fn recv(link: &LinkPtr) -> Result<Cell> {
        Cell::from_wire(&link.recv().await?)
    }
}

/// Commands inside a fully stripped relay plaintext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCmd {
    Extend = 1,
    Extended = 2,
    Data = 3,
    Begin = 4,
    Opened = 5,
}

impl TryFrom<u8> for RelayCmd {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Extend),
            2 => Ok(Self::Extended),
            3 => Ok(Self::Data),
            4 => Ok(Self::Begin),
            5 => Ok(Self::Opened),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// `1 B command || 2 B length || data || random padding`, fixed size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPayload {
    pub cmd: RelayCmd,
    pub data: Vec<u8>,
}

impl RelayPayload {
    pub fn new(cmd: RelayCmd, data: Vec<u8>) -> Self {
        Self { cmd, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_RELAY_DATA {
            return Err(Error::MalformedPacket("relay data too large".to_string()))
        }

        let mut out = vec![0u8; RELAY_PLAINTEXT_SIZE];
        out[0] = self.cmd as u8;
        out[1..3].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        out[3..3 + self.data.len()].copy_from_slice(&self.data);
        OsRng.fill_bytes(&mut out[3 + self.data.len()..]);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != RELAY_PLAINTEXT_SIZE {
            return Err(Error::MalformedPacket("bad relay plaintext size".to_string()))
        }

        let cmd = RelayCmd::try_from(data[0])?;
        let len = u16::from_be_bytes([data[1], data[2]]) as usize;
        if len > MAX_RELAY_DATA {
            return Err(Error::MalformedPacket("bad relay data length".to_string()))
        }

        Ok(Self { cmd, data: data[3..3 + len].to_vec() })
    }
}

/// Add one onion layer: fresh random nonce, then seal.
pub fn wrap_layer(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; aead::NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let mut out = nonce.to_vec();
    out.extend_from_slice(&aead::encrypt(key, &nonce, plaintext)?);
    Ok(out)
}

/// Strip one onion layer. Fails when the authenticator does not check
/// out; callers drop such cells silently.
pub fn strip_layer(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < LAYER_OVERHEAD {
        return Err(Error::MalformedPacket("layer too short".to_string()))
    }

    let mut nonce = [0u8; aead::NONCE_SIZE];
    nonce.copy_from_slice(&data[..aead::NONCE_SIZE]);
    aead::decrypt(key, &nonce, &data[aead::NONCE_SIZE..])
}

/// Per-hop key: HKDF over the CREATE exchange's shared secret, labeled
/// with the hop's position.
pub fn derive_hop_key(shared_secret: &[u8], hop_index: u8) -> Result<[u8; 32]> {
    let info = format!("ONION_HOP_{hop_index}");
    let mut key = [0u8; 32];
    hkdf_derive(ONION_SALT, shared_secret, info.as_bytes(), &mut key)?;
    Ok(key)
}

// ==================================
// Control payload encoding helpers
// ==================================

/// CREATE: `1 B hop index || 1 B key length || SEC1 ephemeral key`
pub fn encode_create(hop_index: u8, ephemeral_sec1: &[u8]) -> Vec<u8> {
    let mut out = vec![hop_index, ephemeral_sec1.len() as u8];
    out.extend_from_slice(ephemeral_sec1);
    out
}

pub fn decode_create(payload: &[u8]) -> Result<(u8, Vec<u8>)> {
    let mut reader = ByteReader::new(payload);
    let hop_index = reader.take_u8()?;
    let key_len = reader.take_u8()? as usize;
    Ok((hop_index, reader.take(key_len)?.to_vec()))
}

/// CREATED: `1 B key length || SEC1 ephemeral key`
pub fn encode_created(ephemeral_sec1: &[u8]) -> Vec<u8> {
    let mut out = vec![ephemeral_sec1.len() as u8];
    out.extend_from_slice(ephemeral_sec1);
    out
}

pub fn decode_created(payload: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(payload);
    let key_len = reader.take_u8()? as usize;
    Ok(reader.take(key_len)?.to_vec())
}

/// EXTEND: next hop address, then the CREATE payload to hand it.
pub fn encode_extend(next: &SocketAddr, create_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + create_payload.len());
    write_addr(&mut out, &next.ip());
    out.extend_from_slice(&next.port().to_be_bytes());
    out.extend_from_slice(create_payload);
    out
}

pub fn decode_extend(data: &[u8]) -> Result<(SocketAddr, Vec<u8>)> {
    let mut reader = ByteReader::new(data);
    let ip = read_addr(&mut reader)?;
    let port = reader.take_u16()?;
    let create_payload = reader.take(reader.remaining())?.to_vec();
    Ok((SocketAddr::new(ip, port), create_payload))
}

/// BEGIN: the destination the exit should attach to.
pub fn encode_begin(dest: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    write_addr(&mut out, &dest.ip());
    out.extend_from_slice(&dest.port().to_be_bytes());
    out
}

pub fn decode_begin(data: &[u8]) -> Result<SocketAddr> {
    let mut reader = ByteReader::new(data);
    let ip = read_addr(&mut reader)?;
    let port = reader.take_u16()?;
    Ok(SocketAddr::new(ip, port))
}

// =======================
// Stream (re)fragmenting
// =======================

/// Cut a length-framed message into relay-sized chunks.
pub fn fragment(message: &[u8]) -> Vec<Vec<u8>> {
    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);

    framed.chunks(MAX_RELAY_DATA).map(|c| c.to_vec()).collect()
}

/// Rebuild length-framed messages from sequential chunks.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns a message once complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        self.buf.extend_from_slice(chunk);

        if self.buf.len() < 4 {
            return Ok(None)
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return Ok(None)
        }
        if self.buf.len() > 4 + len {
            return Err(Error::MalformedPacket("stream framing desync".to_string()))
        }

        let message = self.buf.split_off(4);
        self.buf.clear();
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_line_up() {
        // Three layers over the relay plaintext exactly fill the
        // payload area.
        assert_eq!(RELAY_PLAINTEXT_SIZE + CIRCUIT_HOPS * LAYER_OVERHEAD, CELL_PAYLOAD_SIZE);
        assert_eq!(CELL_SIZE, 2 + CELL_BODY_SIZE);
    }

    #[test]
    fn cell_roundtrip_is_fixed_size() {
        let cell = Cell::new(CellCmd::Relay, vec![7u8; 100]);
        let wire = cell.to_wire().unwrap();
        assert_eq!(wire.len(), CELL_SIZE);

        let parsed = Cell::from_wire(&wire).unwrap();
        assert_eq!(parsed.cmd, CellCmd::Relay);
        assert_eq!(parsed.payload, cell.payload);
    }

    #[test]
    fn triple_layering_roundtrip() {
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        let k3 = [3u8; 32];

        let plain = RelayPayload::new(RelayCmd::Data, b"through the onion".to_vec())
            .encode()
            .unwrap();

        let once = wrap_layer(&k3, &plain).unwrap();
        let twice = wrap_layer(&k2, &once).unwrap();
        let thrice = wrap_layer(&k1, &twice).unwrap();
        assert_eq!(thrice.len(), CELL_PAYLOAD_SIZE);

        let after_guard = strip_layer(&k1, &thrice).unwrap();
        let after_middle = strip_layer(&k2, &after_guard).unwrap();
        let after_exit = strip_layer(&k3, &after_middle).unwrap();

        let payload = RelayPayload::decode(&after_exit).unwrap();
        assert_eq!(payload.cmd, RelayCmd::Data);
        assert_eq!(payload.data, b"through the onion");

        // A hop with the wrong key cannot strip.
        assert!(strip_layer(&k2, &thrice).is_err());
    }

    #[test]
    fn hop_keys_are_position_separated() {
        let a = derive_hop_key(b"shared", 1).unwrap();
        let b = derive_hop_key(b"shared", 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, derive_hop_key(b"shared", 1).unwrap());
    }

    #[test]
    fn fragment_reassemble_roundtrip() {
        let message = vec![0xabu8; 3 * MAX_RELAY_DATA + 17];
        let chunks = fragment(&message);
        assert!(chunks.len() == 4);

        let mut reassembler = Reassembler::new();
        let mut out = None;
        for chunk in &chunks {
            out = reassembler.push(chunk).unwrap();
        }
        assert_eq!(out.unwrap(), message);

        // Next message reuses the reassembler.
        let chunks = fragment(b"tiny");
        assert_eq!(reassembler.push(&chunks[0]).unwrap().unwrap(), b"tiny");
    }

    #[test]
    fn extend_encoding_roundtrip() {
        let addr: SocketAddr = "192.0.2.4:51823".parse().unwrap();
        let create = encode_create(2, &[0x04; 65]);

        let (parsed_addr, parsed_create) = decode_extend(&encode_extend(&addr, &create)).unwrap();
        assert_eq!(parsed_addr, addr);
        assert_eq!(parsed_create, create);

        let (hop, key) = decode_create(&parsed_create).unwrap();
        assert_eq!(hop, 2);
        assert_eq!(key.len(), 65);
    }
}
