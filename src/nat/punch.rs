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

//! UDP hole punching.
//!
//! Both sides learn each other's (external IP, port candidates) from
//! the DHT announcement, then spray `ANONET_PUNCH` datagrams at every
//! candidate at 100 ms intervals for 5 s, followed by a 5 s
//! receive-only window. The first matching PUNCH or PUNCH_ACK from the
//! expected peer completes the punch; its observed source address is
//! the one to connect to.

use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use log::debug;
use rand::{rngs::OsRng, RngCore};

use crate::{crypto::Fingerprint, rudp::RudpSocketPtr, Error, Result};

pub const PUNCH_PREFIX: &str = "ANONET_PUNCH";
pub const PUNCH_ACK_PREFIX: &str = "ANONET_PUNCH_ACK";

const SPRAY_INTERVAL_MS: u64 = 100;
const ACTIVE_BUDGET: Duration = Duration::from_secs(5);
const PASSIVE_BUDGET: Duration = Duration::from_secs(5);

/// A parsed punch datagram.
pub struct PunchPacket {
    pub is_ack: bool,
    pub fingerprint: Fingerprint,
    pub nonce: String,
}

impl PunchPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let mut parts = text.split('|');

        let is_ack = match parts.next()? {
            PUNCH_ACK_PREFIX => true,
            PUNCH_PREFIX => false,
            _ => return None,
        };

        let fingerprint = Fingerprint::from_hex(parts.next()?).ok()?;
        let nonce = parts.next()?.to_string();
        if parts.next().is_some() {
            return None
        }

        Some(Self { is_ack, fingerprint, nonce })
    }

    pub fn encode(is_ack: bool, fingerprint: &Fingerprint, nonce: &str) -> Vec<u8> {
        let prefix = if is_ack { PUNCH_ACK_PREFIX } else { PUNCH_PREFIX };
        format!("{prefix}|{fingerprint}|{nonce}").into_bytes()
    }
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Punch a path to `peer`. Returns the verified source address to run
/// the reliable transport against.
pub async fn hole_punch(
    socket: &RudpSocketPtr,
    own_fingerprint: &Fingerprint,
    peer: &Fingerprint,
    peer_ip: IpAddr,
    port_candidates: &[u16],
) -> Result<SocketAddr> {
    let sub = socket.subscribe_raw().await;
    let nonce = fresh_nonce();
    let probe = PunchPacket::encode(false, own_fingerprint, &nonce);

    let targets: Vec<SocketAddr> =
        port_candidates.iter().map(|port| SocketAddr::new(peer_ip, *port)).collect();
    debug!(target: "nat::punch()", "Punching {peer} at {} candidates", targets.len());

    let result = async {
        // Active phase: spray all candidates, polling for a match
        // between rounds.
        let active_deadline = Instant::now() + ACTIVE_BUDGET;
        while Instant::now() < active_deadline {
            for target in &targets {
                let _ = socket.send_raw(*target, &probe).await;
            }

            // The poll deadline also paces the spray rounds.
            let poll = sub.receive_with_timeout(Duration::from_millis(SPRAY_INTERVAL_MS)).await;
            if let Ok((from, data)) = poll {
                if let Some(addr) =
                    match_packet(socket, own_fingerprint, peer, &nonce, from, &data).await
                {
                    return Ok(addr)
                }
            }
        }

        // Passive phase: receive only.
        let passive_deadline = Instant::now() + PASSIVE_BUDGET;
        while Instant::now() < passive_deadline {
            let remaining = passive_deadline.saturating_duration_since(Instant::now());
            let Ok((from, data)) = sub.receive_with_timeout(remaining).await else { break };
            if let Some(addr) =
                match_packet(socket, own_fingerprint, peer, &nonce, from, &data).await
            {
                return Ok(addr)
            }
        }

        Err(Error::HolePunchFailed)
    }
    .await;

    sub.unsubscribe().await;
    result
}

/// Check one raw datagram against the expected peer; acks the source
/// on a match.
async fn match_packet(
    socket: &RudpSocketPtr,
    own_fingerprint: &Fingerprint,
    peer: &Fingerprint,
    nonce: &str,
    from: SocketAddr,
    data: &[u8],
) -> Option<SocketAddr> {
    let packet = PunchPacket::parse(data)?;
    if packet.fingerprint != *peer {
        debug!(target: "nat::punch()", "Punch from unexpected identity at {from}");
        return None
    }

    // Always confirm towards the observed source so the peer's side
    // completes too.
    let ack = PunchPacket::encode(true, own_fingerprint, nonce);
    let _ = socket.send_raw(from, &ack).await;

    debug!(target: "nat::punch()", "Punch to {peer} completed via {from}");
    Some(from)
}

/// Long-lived responder: answers every well-formed PUNCH with a
/// PUNCH_ACK so idle nodes are reachable. Runs until stopped.
pub async fn punch_responder(socket: RudpSocketPtr, own_fingerprint: Fingerprint) -> Result<()> {
    let sub = socket.subscribe_raw().await;

    loop {
        let (from, data) = sub.receive().await?;
        let Some(packet) = PunchPacket::parse(&data) else { continue };
        if packet.is_ack {
            continue
        }

        let ack = PunchPacket::encode(true, &own_fingerprint, &packet.nonce);
        let _ = socket.send_raw(from, &ack).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punch_packet_roundtrip() {
        let fp = Fingerprint([0x11; 32]);
        let bytes = PunchPacket::encode(false, &fp, "00ff00ff00ff00ff");

        let parsed = PunchPacket::parse(&bytes).unwrap();
        assert!(!parsed.is_ack);
        assert_eq!(parsed.fingerprint, fp);
        assert_eq!(parsed.nonce, "00ff00ff00ff00ff");

        let ack = PunchPacket::encode(true, &fp, &parsed.nonce);
        assert!(PunchPacket::parse(&ack).unwrap().is_ack);
    }

    #[test]
    fn rejects_malformed() {
        assert!(PunchPacket::parse(b"ANONET_DISCOVERY|junk").is_none());
        assert!(PunchPacket::parse(b"ANONET_PUNCH|nothex|nonce").is_none());
        assert!(PunchPacket::parse(b"ANONET_PUNCH").is_none());
    }
}
