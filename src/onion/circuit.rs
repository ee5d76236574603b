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

//! Initiator-side circuit construction and use.
//!
//! Three nested CREATE exchanges (the outer two tunneled as EXTEND
//! through the already-keyed prefix of the circuit) leave the
//! initiator holding K1..K3. Application messages are length-framed,
//! cut into relay chunks and wrapped exit-first so that each hop
//! strips exactly one layer.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::{debug, info};
use p256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use rand::rngs::OsRng;

use super::cell::{
    self, decode_created, derive_hop_key, encode_begin, encode_create, encode_extend,
    fragment, strip_layer, wrap_layer, Cell, CellCmd, Reassembler, RelayCmd, RelayPayload,
    CIRCUIT_HOPS,
};
use crate::{
    link::{Link, LinkPtr},
    system::io_timeout,
    Error, Result,
};

/// Per-exchange deadline during construction
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Circuits are torn down after this long.
pub const CIRCUIT_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// An established 3-hop circuit. Implements [`Link`], so a
/// `SecureChannel` runs over it unchanged.
pub struct Circuit {
    guard_link: LinkPtr,
    /// K1 (guard), K2 (middle), K3 (exit)
    hop_keys: [[u8; 32]; CIRCUIT_HOPS],
    created_at: Instant,
    reassembler: smol::lock::Mutex<Reassembler>,
}

impl Circuit {
    /// Build hop keys over an existing carrier to the guard.
    /// `middle` and `exit` are the onion addresses of the remaining
    /// relays, deduplicated by the caller.
    pub async fn build(guard_link: LinkPtr, middle: SocketAddr, exit: SocketAddr) -> Result<Self> {
        // Hop 1: plain CREATE to the guard.
        let (ephemeral, public) = fresh_ephemeral();
        Cell::send(&guard_link, &Cell::new(CellCmd::Create, encode_create(1, &public))).await?;

        let created = io_timeout(CREATE_TIMEOUT, Cell::recv(&guard_link)).await?;
        if created.cmd != CellCmd::Created {
            return Err(Error::CircuitFailed("guard did not answer CREATE".to_string()))
        }
        let k1 = finish_exchange(ephemeral, &decode_created(&created.payload)?, 1)?;
        debug!(target: "onion::circuit", "Keyed hop 1");

        let mut circuit = Self {
            guard_link,
            hop_keys: [k1, [0u8; 32], [0u8; 32]],
            created_at: Instant::now(),
            reassembler: smol::lock::Mutex::new(Reassembler::new()),
        };

        // Hops 2 and 3: EXTEND tunneled through the keyed prefix.
        circuit.hop_keys[1] = circuit.extend(2, middle).await?;
        debug!(target: "onion::circuit", "Keyed hop 2");
        circuit.hop_keys[2] = circuit.extend(3, exit).await?;
        info!(target: "onion::circuit", "Circuit established via exit {exit}");

        Ok(circuit)
    }

    /// One EXTEND exchange for hop `index` (2 or 3), wrapped in the
    /// `index - 1` layers established so far.
    async fn extend(&self, index: u8, addr: SocketAddr) -> Result<[u8; 32]> {
        let (ephemeral, public) = fresh_ephemeral();
        let extend = RelayPayload::new(
            RelayCmd::Extend,
            encode_extend(&addr, &encode_create(index, &public)),
        );

        self.send_relay_prefix(&extend, (index - 1) as usize).await?;

        let reply = io_timeout(CREATE_TIMEOUT, self.recv_relay_prefix((index - 1) as usize))
            .await?;
        if reply.cmd != RelayCmd::Extended {
            return Err(Error::CircuitFailed(format!("hop {index} did not extend")))
        }

        finish_exchange(ephemeral, &decode_created(&reply.data)?, index)
    }

    /// Wrap a relay payload in the first `layers` hop keys (outermost
    /// last) and send it.
    async fn send_relay_prefix(&self, payload: &RelayPayload, layers: usize) -> Result<()> {
        let mut bytes = payload.encode()?;
        for key in self.hop_keys[..layers].iter().rev() {
            bytes = wrap_layer(key, &bytes)?;
        }
        Cell::send(&self.guard_link, &Cell::new(CellCmd::Relay, bytes)).await
    }

    /// Receive one relay cell and strip the first `layers` hop keys.
    async fn recv_relay_prefix(&self, layers: usize) -> Result<RelayPayload> {
        loop {
            let cell = Cell::recv(&self.guard_link).await?;
            match cell.cmd {
                CellCmd::Relay => {}
                CellCmd::Destroy => return Err(Error::CircuitFailed("destroyed".to_string())),
                _ => continue,
            }

            let mut bytes = cell.payload;
            let mut ok = true;
            for key in self.hop_keys[..layers].iter() {
                match strip_layer(key, &bytes) {
                    Ok(stripped) => bytes = stripped,
                    Err(_) => {
                        // Unverifiable cells are dropped silently.
                        ok = false;
                        break
                    }
                }
            }
            if !ok {
                continue
            }

            return RelayPayload::decode(&bytes)
        }
    }

    /// Tell the exit to attach to the destination. Waits for the
    /// exit's confirmation.
    pub async fn begin(&self, destination: SocketAddr) -> Result<()> {
        let payload = RelayPayload::new(RelayCmd::Begin, encode_begin(&destination));
        self.send_relay_prefix(&payload, CIRCUIT_HOPS).await?;

        let reply =
            io_timeout(CREATE_TIMEOUT, self.recv_relay_prefix(CIRCUIT_HOPS)).await?;
        if reply.cmd != RelayCmd::Opened {
            return Err(Error::CircuitFailed("exit could not reach destination".to_string()))
        }
        Ok(())
    }

    /// Remaining time before the circuit should be torn down.
    pub fn expired(&self) -> bool {
        self.created_at.elapsed() >= CIRCUIT_LIFETIME
    }

    /// Send DESTROY down the circuit and close the carrier.
    pub async fn destroy(&self) -> Result<()> {
        let _ = Cell::send(&self.guard_link, &Cell::new(CellCmd::Destroy, vec![])).await;
        self.guard_link.close().await
    }
}

fn fresh_ephemeral() -> (EphemeralSecret, Vec<u8>) {
    let secret = EphemeralSecret::random(&mut OsRng);
    let public = PublicKey::from(&secret).to_encoded_point(false).as_bytes().to_vec();
    (secret, public)
}

fn finish_exchange(
    ephemeral: EphemeralSecret,
    peer_public_sec1: &[u8],
    hop_index: u8,
) -> Result<[u8; 32]> {
    let peer = PublicKey::from_sec1_bytes(peer_public_sec1)
        .map_err(|_| Error::CircuitFailed("bad hop ephemeral key".to_string()))?;
    let shared = ephemeral.diffie_hellman(&peer);
    derive_hop_key(shared.raw_secret_bytes().as_ref(), hop_index)
}

#[async_trait]
impl Link for Circuit {
    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.expired() {
            let _ = self.destroy().await;
            return Err(Error::CircuitFailed("lifetime elapsed".to_string()))
        }

        for chunk in fragment(data) {
            let payload = RelayPayload::new(RelayCmd::Data, chunk);
            self.send_relay_prefix(&payload, CIRCUIT_HOPS).await?;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        if self.expired() {
            let _ = self.destroy().await;
            return Err(Error::CircuitFailed("lifetime elapsed".to_string()))
        }

        loop {
            let payload = self.recv_relay_prefix(CIRCUIT_HOPS).await?;
            if payload.cmd != RelayCmd::Data {
                continue
            }

            if let Some(message) = self.reassembler.lock().await.push(&payload.data)? {
                return Ok(message)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.destroy().await
    }

    fn max_message_size(&self) -> usize {
        // Stream framing reassembles arbitrary messages; cap at
        // something sane for a single record.
        cell::MAX_RELAY_DATA * 256
    }
}
