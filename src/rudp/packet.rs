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

use crate::{Error, Result};

/// `4 B seq || 4 B ack || 1 B flags || 2 B window`
pub const HEADER_SIZE: usize = 11;

/// Largest payload carried by one packet
pub const MAX_PAYLOAD_SIZE: usize = 1389;

pub const FLAG_SYN: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x02;
pub const FLAG_FIN: u8 = 0x04;
pub const FLAG_DATA: u8 = 0x08;
pub const FLAG_RST: u8 = 0x10;

const KNOWN_FLAGS: u8 = FLAG_SYN | FLAG_ACK | FLAG_FIN | FLAG_DATA | FLAG_RST;

/// Reliable-UDP packet header. All integers network byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

impl Header {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.flags);
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<(Header, &[u8])> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket("short rudp packet".to_string()))
        }

        let seq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let ack = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let flags = data[8];
        let window = u16::from_be_bytes([data[9], data[10]]);

        if flags == 0 || flags & !KNOWN_FLAGS != 0 {
            return Err(Error::MalformedPacket("bad rudp flags".to_string()))
        }

        let payload = &data[HEADER_SIZE..];
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedPacket("oversized rudp payload".to_string()))
        }

        Ok((Header { seq, ack, flags, window }, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header { seq: 7, ack: 3, flags: FLAG_DATA, window: 32 };
        let bytes = header.encode(b"payload");

        let (decoded, payload) = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
        assert_eq!(bytes.len(), HEADER_SIZE + 7);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Header::decode(&[1, 2, 3]).is_err());

        // Unknown flag bit set
        let mut bytes = Header { seq: 0, ack: 0, flags: FLAG_SYN, window: 0 }.encode(&[]);
        bytes[8] = 0xe0;
        assert!(Header::decode(&bytes).is_err());
    }
}
