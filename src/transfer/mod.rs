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

//! File transfer over an established secure channel.
//!
//! METADATA announces name and size, CHUNK messages carry 1024-byte
//! pieces at explicit offsets, COMPLETE carries the sender's SHA-256.
//! The receiver preallocates the file, writes chunks at
//! `index * 1024`, and accepts completion only when its own digest
//! matches the declared one.

use std::path::{Path, PathBuf};

use log::{debug, info};
use sha2::{Digest, Sha256};
use smol::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{
    dht::message::ByteReader,
    event::{Event, EventBusPtr},
    session::SecureChannel,
    Error, Result,
};

/// Nominal chunk size
pub const CHUNK_SIZE: usize = 1024;

/// ACK index used for non-chunk acknowledgements
const CONTROL_ACK: u64 = u64::MAX;

/// Progress events are published every this many chunks.
const PROGRESS_EVERY: u64 = 64;

const MSG_METADATA: u8 = 1;
const MSG_CHUNK: u8 = 2;
const MSG_COMPLETE: u8 = 3;
const MSG_ACK: u8 = 4;
const MSG_ERROR: u8 = 5;

/// Messages of the transfer protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferMessage {
    Metadata { filename: String, size: u64 },
    Chunk { index: u64, data: Vec<u8> },
    Complete { sha256_hex: String },
    Ack { index: u64 },
    Error { message: String },
}

impl TransferMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_SIZE + 16);
        match self {
            Self::Metadata { filename, size } => {
                out.push(MSG_METADATA);
                let name = filename.as_bytes();
                out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                out.extend_from_slice(name);
                out.extend_from_slice(&size.to_be_bytes());
            }
            Self::Chunk { index, data } => {
                out.push(MSG_CHUNK);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
            Self::Complete { sha256_hex } => {
                out.push(MSG_COMPLETE);
                let hex = sha256_hex.as_bytes();
                out.extend_from_slice(&(hex.len() as u16).to_be_bytes());
                out.extend_from_slice(hex);
            }
            Self::Ack { index } => {
                out.push(MSG_ACK);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Self::Error { message } => {
                out.push(MSG_ERROR);
                let text = message.as_bytes();
                out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                out.extend_from_slice(text);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let take_string = |reader: &mut ByteReader| -> Result<String> {
            let len = reader.take_u16()? as usize;
            Ok(std::str::from_utf8(reader.take(len)?)
                .map_err(|_| Error::MalformedPacket("transfer text not UTF-8".to_string()))?
                .to_string())
        };

        match reader.take_u8()? {
            MSG_METADATA => {
                let filename = take_string(&mut reader)?;
                let size = reader.take_u64()?;
                Ok(Self::Metadata { filename, size })
            }
            MSG_CHUNK => {
                let index = reader.take_u64()?;
                let len = reader.take_u16()? as usize;
                Ok(Self::Chunk { index, data: reader.take(len)?.to_vec() })
            }
            MSG_COMPLETE => Ok(Self::Complete { sha256_hex: take_string(&mut reader)? }),
            MSG_ACK => Ok(Self::Ack { index: reader.take_u64()? }),
            MSG_ERROR => Ok(Self::Error { message: take_string(&mut reader)? }),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

async fn expect_control_ack(channel: &mut SecureChannel) -> Result<()> {
    match TransferMessage::decode(&channel.recv().await?)? {
        TransferMessage::Ack { index: CONTROL_ACK } => Ok(()),
        TransferMessage::Error { message } => Err(Error::TransportFailed(message)),
        _ => Err(Error::MalformedPacket("expected transfer ack".to_string())),
    }
}

/// Stream a local file to the peer.
pub async fn send_file(
    channel: &mut SecureChannel,
    path: &Path,
    events: &EventBusPtr,
) -> Result<()> {
    let mut file = smol::fs::File::open(path)
        .await
        .map_err(|e| Error::Storage(format!("{path:?}: {e}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| Error::Storage(format!("{path:?}: {e}")))?
        .len();

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Storage("path has no file name".to_string()))?;

    info!(target: "transfer::send_file()", "Sending {filename} ({size} bytes)");
    channel
        .send(&TransferMessage::Metadata { filename: filename.clone(), size }.encode())
        .await?;
    expect_control_ack(channel).await?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut index = 0u64;
    let mut written = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break
        }

        hasher.update(&buf[..n]);
        channel
            .send(&TransferMessage::Chunk { index, data: buf[..n].to_vec() }.encode())
            .await?;

        index += 1;
        written += n as u64;
        if index % PROGRESS_EVERY == 0 {
            events
                .publish(Event::TransferProgress {
                    filename: filename.clone(),
                    written,
                    total: size,
                })
                .await;
        }
    }

    let digest = hex::encode(hasher.finalize());
    channel.send(&TransferMessage::Complete { sha256_hex: digest }.encode()).await?;
    expect_control_ack(channel).await?;

    events.publish(Event::TransferComplete { filename }).await;
    Ok(())
}

/// Receive one file into `target_dir`. Returns the written path.
pub async fn recv_file(
    channel: &mut SecureChannel,
    target_dir: &Path,
    events: &EventBusPtr,
) -> Result<PathBuf> {
    let (filename, size) = match TransferMessage::decode(&channel.recv().await?)? {
        TransferMessage::Metadata { filename, size } => (filename, size),
        _ => return Err(Error::MalformedPacket("expected METADATA".to_string())),
    };

    // Only the final path component; nobody writes outside target_dir.
    let safe_name = Path::new(&filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::MalformedPacket("bad transfer filename".to_string()))?;
    let target = target_dir.join(&safe_name);

    smol::fs::create_dir_all(target_dir)
        .await
        .map_err(|e| Error::Storage(format!("{target_dir:?}: {e}")))?;
    let mut file = smol::fs::File::create(&target)
        .await
        .map_err(|e| Error::Storage(format!("{target:?}: {e}")))?;
    file.set_len(size).await.map_err(|e| Error::Storage(format!("{target:?}: {e}")))?;

    info!(target: "transfer::recv_file()", "Receiving {safe_name} ({size} bytes)");
    channel.send(&TransferMessage::Ack { index: CONTROL_ACK }.encode()).await?;

    let mut received = 0u64;
    loop {
        match TransferMessage::decode(&channel.recv().await?)? {
            TransferMessage::Chunk { index, data } => {
                file.seek(std::io::SeekFrom::Start(index * CHUNK_SIZE as u64)).await?;
                file.write_all(&data).await?;

                received += data.len() as u64;
                if (index + 1) % PROGRESS_EVERY == 0 {
                    events
                        .publish(Event::TransferProgress {
                            filename: safe_name.clone(),
                            written: received,
                            total: size,
                        })
                        .await;
                }
            }

            TransferMessage::Complete { sha256_hex } => {
                file.flush().await?;
                drop(file);

                let digest = hash_file(&target).await?;
                if digest != sha256_hex.to_lowercase() {
                    channel
                        .send(
                            &TransferMessage::Error {
                                message: "digest mismatch".to_string(),
                            }
                            .encode(),
                        )
                        .await?;
                    return Err(Error::Crypto("file digest mismatch".to_string()))
                }

                channel.send(&TransferMessage::Ack { index: CONTROL_ACK }.encode()).await?;
                events.publish(Event::TransferComplete { filename: safe_name.clone() }).await;
                debug!(target: "transfer::recv_file()", "Digest verified for {safe_name}");
                return Ok(target)
            }

            TransferMessage::Error { message } => return Err(Error::TransportFailed(message)),

            _ => return Err(Error::MalformedPacket("unexpected transfer message".to_string())),
        }
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let mut file = smol::fs::File::open(path)
        .await
        .map_err(|e| Error::Storage(format!("{path:?}: {e}")))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrips() {
        let messages = vec![
            TransferMessage::Metadata { filename: "photo.png".to_string(), size: 123456 },
            TransferMessage::Chunk { index: 42, data: vec![9u8; CHUNK_SIZE] },
            TransferMessage::Complete { sha256_hex: "ab".repeat(32) },
            TransferMessage::Ack { index: CONTROL_ACK },
            TransferMessage::Error { message: "disk full".to_string() },
        ];

        for message in messages {
            let decoded = TransferMessage::decode(&message.encode()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn rejects_unknown_message() {
        assert!(TransferMessage::decode(&[0x77]).is_err());
        assert!(TransferMessage::decode(&[]).is_err());
    }
}
