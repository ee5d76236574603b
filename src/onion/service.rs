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

//! Relay-side circuit service: one instance per inbound circuit.
//!
//! A hop derives its single key from the CREATE exchange and then
//! mechanically strips (forward) or adds (backward) one layer per
//! cell. A hop that has extended knows only its predecessor and
//! successor addresses; only the exit ever learns the destination.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::debug;
use p256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use rand::rngs::OsRng;

use super::cell::{
    decode_begin, decode_create, decode_extend, derive_hop_key, encode_created, fragment,
    strip_layer, wrap_layer, Cell, CellCmd, Reassembler, RelayCmd, RelayPayload,
};
use crate::{
    link::LinkPtr,
    system::io_timeout,
    Error, Result,
};

const EXTEND_TIMEOUT: Duration = Duration::from_secs(10);

/// How a hop reaches the next element of a circuit.
#[async_trait]
pub trait HopDialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> Result<LinkPtr>;
}

/// Observable per-circuit counters, used by operators and tests.
#[derive(Default)]
pub struct HopStats {
    /// Layer decryptions attempted on forward cells
    pub decrypts: AtomicU64,
    /// Set only on the exit: where BEGIN pointed
    pub begin_target: Mutex<Option<SocketAddr>>,
    /// Set on non-exit hops: where EXTEND pointed
    pub extended_to: Mutex<Option<SocketAddr>>,
}

enum Successor {
    None,
    /// Next circuit hop; speaks cells
    Hop(LinkPtr),
    /// Final destination; speaks raw link messages
    Destination(LinkPtr),
}

/// Serve one circuit position until the predecessor goes away or the
/// circuit is destroyed. `first_cell` is the raw first message the
/// accept loop already read (it must be CREATE).
pub async fn serve_circuit(
    link: LinkPtr,
    first_cell: Vec<u8>,
    dialer: Arc<dyn HopDialer>,
    stats: Arc<HopStats>,
) -> Result<()> {
    let create = Cell::from_wire(&first_cell)?;
    if create.cmd != CellCmd::Create {
        return Err(Error::CircuitFailed("circuit must start with CREATE".to_string()))
    }

    // Key exchange for this hop.
    let (hop_index, their_public) = decode_create(&create.payload)?;
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let our_public = PublicKey::from(&ephemeral).to_encoded_point(false).as_bytes().to_vec();

    let peer = PublicKey::from_sec1_bytes(&their_public)
        .map_err(|_| Error::CircuitFailed("bad CREATE key".to_string()))?;
    let key = derive_hop_key(ephemeral.diffie_hellman(&peer).raw_secret_bytes().as_ref(), hop_index)?;

    Cell::send(&link, &Cell::new(CellCmd::Created, encode_created(&our_public))).await?;
    debug!(target: "onion::service", "Hop {hop_index} keyed");

    let mut successor = Successor::None;
    let mut backward: Option<smol::Task<()>> = None;
    let mut to_destination = Reassembler::new();

    let result = loop {
        let cell = match link.recv().await {
            Ok(raw) => match Cell::from_wire(&raw) {
                Ok(cell) => cell,
                Err(_) => continue,
            },
            Err(_) => break Ok(()),
        };

        match cell.cmd {
            CellCmd::Relay => {
                stats.decrypts.fetch_add(1, Ordering::SeqCst);
                let Ok(stripped) = strip_layer(&key, &cell.payload) else {
                    // Failed authenticator: drop the cell silently.
                    continue
                };

                // With a successor in place this hop only shovels
                // bytes; the stripped payload is parsed exactly once,
                // while the circuit is still being built.
                let control = match &successor {
                    Successor::Hop(next) => {
                        let _ = Cell::send(next, &Cell::new(CellCmd::Relay, stripped)).await;
                        None
                    }

                    Successor::Destination(next) => {
                        let Ok(payload) = RelayPayload::decode(&stripped) else { continue };
                        if payload.cmd == RelayCmd::Data {
                            match to_destination.push(&payload.data) {
                                Ok(Some(message)) => {
                                    let _ = next.send(&message).await;
                                }
                                Ok(None) => {}
                                Err(_) => to_destination = Reassembler::new(),
                            }
                        }
                        None
                    }

                    Successor::None => RelayPayload::decode(&stripped).ok(),
                };

                let Some(payload) = control else { continue };
                match payload.cmd {
                    RelayCmd::Extend => {
                        match extend_circuit(&link, &key, &payload.data, &dialer).await {
                            Ok((next, addr)) => {
                                *stats.extended_to.lock().unwrap() = Some(addr);
                                backward = Some(spawn_hop_backward(link.clone(), next.clone(), key));
                                successor = Successor::Hop(next);
                            }
                            Err(e) => debug!(target: "onion::service", "Extend failed: {e}"),
                        }
                    }
                    RelayCmd::Begin => {
                        match open_destination(&link, &key, &payload.data, &dialer).await {
                            Ok((next, addr)) => {
                                *stats.begin_target.lock().unwrap() = Some(addr);
                                backward = Some(spawn_exit_backward(link.clone(), next.clone(), key));
                                successor = Successor::Destination(next);
                            }
                            Err(e) => debug!(target: "onion::service", "Begin failed: {e}"),
                        }
                    }
                    _ => {}
                }
            }

            CellCmd::Destroy => {
                if let Successor::Hop(next) = &successor {
                    let _ = Cell::send(next, &Cell::new(CellCmd::Destroy, vec![])).await;
                }
                break Ok(())
            }

            // A second CREATE on a keyed circuit is a protocol error.
            CellCmd::Create | CellCmd::Created => {
                break Err(Error::CircuitFailed("unexpected control cell".to_string()))
            }
        }
    };

    if let Some(task) = backward {
        task.cancel().await;
    }
    match &successor {
        Successor::Hop(next) | Successor::Destination(next) => {
            let _ = next.close().await;
        }
        Successor::None => {}
    }

    result
}

/// Dial the next hop and run its CREATE exchange on behalf of the
/// initiator, reporting EXTENDED back down the circuit.
async fn extend_circuit(
    link: &LinkPtr,
    key: &[u8; 32],
    extend_data: &[u8],
    dialer: &Arc<dyn HopDialer>,
) -> Result<(LinkPtr, SocketAddr)> {
    let (addr, create_payload) = decode_extend(extend_data)?;
    let next = dialer.dial(addr).await?;

    Cell::send(&next, &Cell::new(CellCmd::Create, create_payload)).await?;
    let created = io_timeout(EXTEND_TIMEOUT, Cell::recv(&next)).await?;
    if created.cmd != CellCmd::Created {
        return Err(Error::CircuitFailed("next hop did not answer CREATE".to_string()))
    }

    let reply = RelayPayload::new(RelayCmd::Extended, created.payload).encode()?;
    Cell::send(link, &Cell::new(CellCmd::Relay, wrap_layer(key, &reply)?)).await?;

    Ok((next, addr))
}

/// Exit only: attach to the destination and confirm with OPENED.
async fn open_destination(
    link: &LinkPtr,
    key: &[u8; 32],
    begin_data: &[u8],
    dialer: &Arc<dyn HopDialer>,
) -> Result<(LinkPtr, SocketAddr)> {
    let addr = decode_begin(begin_data)?;
    let next = dialer.dial(addr).await?;

    let reply = RelayPayload::new(RelayCmd::Opened, vec![]).encode()?;
    Cell::send(link, &Cell::new(CellCmd::Relay, wrap_layer(key, &reply)?)).await?;

    Ok((next, addr))
}

/// Backward pump for a mid-circuit hop: add our layer to every cell
/// the successor sends.
fn spawn_hop_backward(link: LinkPtr, next: LinkPtr, key: [u8; 32]) -> smol::Task<()> {
    smol::spawn(async move {
        loop {
            let Ok(raw) = next.recv().await else { break };
            let Ok(cell) = Cell::from_wire(&raw) else { continue };

            match cell.cmd {
                CellCmd::Relay => {
                    let Ok(wrapped) = wrap_layer(&key, &cell.payload) else { continue };
                    if Cell::send(&link, &Cell::new(CellCmd::Relay, wrapped)).await.is_err() {
                        break
                    }
                }
                CellCmd::Destroy => {
                    let _ = Cell::send(&link, &Cell::new(CellCmd::Destroy, vec![])).await;
                    break
                }
                _ => {}
            }
        }
    })
}

/// Backward pump for the exit: frame and seal destination traffic.
fn spawn_exit_backward(link: LinkPtr, next: LinkPtr, key: [u8; 32]) -> smol::Task<()> {
    smol::spawn(async move {
        loop {
            let Ok(message) = next.recv().await else { break };

            for chunk in fragment(&message) {
                let Ok(payload) = RelayPayload::new(RelayCmd::Data, chunk).encode() else {
                    continue
                };
                let Ok(wrapped) = wrap_layer(&key, &payload) else { continue };
                if Cell::send(&link, &Cell::new(CellCmd::Relay, wrapped)).await.is_err() {
                    break
                }
            }
        }
    })
}
