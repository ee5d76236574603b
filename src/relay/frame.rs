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

//! Relay wire frames.
//!
//! TCP stream of length-prefixed frames:
//! `4 B total length || 1 B type || 2 B session-id length || session id
//! || 4 B payload length || payload`, capped at 64 KiB.

use smol::io::{AsyncReadExt, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on one frame, including the inner header
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Room left for DATA payloads after the frame overhead
pub const MAX_DATA_PAYLOAD: usize = MAX_FRAME_SIZE - 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    HelloAck = 0x02,
    Request = 0x03,
    Accept = 0x04,
    Reject = 0x05,
    Data = 0x06,
    Close = 0x07,
    Ping = 0x08,
    Pong = 0x09,
    Error = 0x0a,
    AuthChallenge = 0x0b,
    AuthResponse = 0x0c,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::Request),
            0x04 => Ok(Self::Accept),
            0x05 => Ok(Self::Reject),
            0x06 => Ok(Self::Data),
            0x07 => Ok(Self::Close),
            0x08 => Ok(Self::Ping),
            0x09 => Ok(Self::Pong),
            0x0a => Ok(Self::Error),
            0x0b => Ok(Self::AuthChallenge),
            0x0c => Ok(Self::AuthResponse),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, session_id: &str, payload: Vec<u8>) -> Self {
        Self { frame_type, session_id: session_id.to_string(), payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let sid = self.session_id.as_bytes();
        let inner_len = 1 + 2 + sid.len() + 4 + self.payload.len();

        let mut out = Vec::with_capacity(4 + inner_len);
        out.extend_from_slice(&(inner_len as u32).to_be_bytes());
        out.push(self.frame_type as u8);
        out.extend_from_slice(&(sid.len() as u16).to_be_bytes());
        out.extend_from_slice(sid);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(inner: &[u8]) -> Result<Self> {
        if inner.len() < 7 {
            return Err(Error::MalformedPacket("short relay frame".to_string()))
        }

        let frame_type = FrameType::try_from(inner[0])?;
        let sid_len = u16::from_be_bytes([inner[1], inner[2]]) as usize;

        if inner.len() < 3 + sid_len + 4 {
            return Err(Error::MalformedPacket("truncated session id".to_string()))
        }
        let session_id = std::str::from_utf8(&inner[3..3 + sid_len])
            .map_err(|_| Error::MalformedPacket("session id not UTF-8".to_string()))?
            .to_string();

        let off = 3 + sid_len;
        let payload_len =
            u32::from_be_bytes([inner[off], inner[off + 1], inner[off + 2], inner[off + 3]])
                as usize;
        if inner.len() != off + 4 + payload_len {
            return Err(Error::MalformedPacket("bad payload length".to_string()))
        }

        Ok(Self { frame_type, session_id, payload: inner[off + 4..].to_vec() })
    }
}

/// Read one frame off a TCP stream.
pub async fn read_frame<R: smol::io::AsyncRead + Unpin>(stream: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(Error::MalformedPacket(format!("frame length {len} out of range")))
    }

    let mut inner = vec![0u8; len];
    stream.read_exact(&mut inner).await?;
    Frame::decode(&inner)
}

/// Write one frame to a TCP stream.
pub async fn write_frame<W: smol::io::AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &Frame,
) -> Result<()> {
    stream.write_all(&frame.encode()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(FrameType::Data, "00aabbccddeeff11", b"opaque bytes".to_vec());
        let encoded = frame.encode();

        let total = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(total + 4, encoded.len());

        let decoded = Frame::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_bad_type_and_lengths() {
        let mut encoded = Frame::new(FrameType::Ping, "", vec![]).encode();
        encoded[4] = 0x7f;
        assert!(Frame::decode(&encoded[4..]).is_err());

        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn stream_roundtrip() {
        smol::block_on(async {
            let frame = Frame::new(FrameType::Accept, "1122334455667788", vec![7; 100]);

            let mut buf: Vec<u8> = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();

            let mut cursor = &buf[..];
            let decoded = read_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded, frame);
        });
    }
}
