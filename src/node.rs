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

//! Node orchestration.
//!
//! Owns the identity, the DHT, the transport socket and the event
//! bus, and implements the connection ladder: resolve the peer in the
//! DHT, try a hole-punched direct path, fall back to a relay, or wrap
//! the whole thing in a 3-hop circuit.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use smol::lock::Mutex;

use crate::{
    dht::{node_id::NodeId, Dht, DhtPtr, DhtSettings, PeerAnnouncement},
    event::{Event, EventBus, EventBusPtr, Route},
    identity::Identity,
    link::LinkPtr,
    nat,
    onion::{self, service::HopStats, Circuit},
    relay::RelayClient,
    rudp::{RudpSocket, RudpSocketPtr},
    session::{self, SecureChannel},
    settings::Settings,
    store::{Contact, ContactStore},
    system::{io_timeout, ExecutorPtr, StoppableTask, StoppableTaskPtr},
    util::time::Timestamp,
    Error, Result,
};

/// First-frame deadline on inbound carriers.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

pub type NodePtr = Arc<Node>;

pub struct Node {
    settings: Settings,
    identity: Identity,
    dht: DhtPtr,
    transport: RudpSocketPtr,
    events: EventBusPtr,
    contacts: Option<Arc<dyn ContactStore>>,
    /// STUN result, cached for the socket's lifetime
    external_ip: Mutex<Option<IpAddr>>,
    /// Per-circuit counters for circuits this node relayed
    hop_stats: Mutex<Vec<Arc<HopStats>>>,
    executor: std::sync::Mutex<Option<ExecutorPtr>>,
    tasks: std::sync::Mutex<Vec<StoppableTaskPtr>>,
}

impl Node {
    /// Bind the sockets and assemble the node.
    pub async fn new(
        settings: Settings,
        identity: Identity,
        contacts: Option<Arc<dyn ContactStore>>,
    ) -> Result<NodePtr> {
        let node_id = NodeId::from_fingerprint(&identity.fingerprint());
        let dht = Dht::new(node_id, settings.dht_port, DhtSettings::default()).await?;
        let transport = RudpSocket::bind(settings.transport_port).await?;

        info!(
            target: "node",
            "Node {} up (dht {}, transport {})", identity.username(), dht.port(), transport.port()
        );

        Ok(Arc::new(Self {
            settings,
            identity,
            dht,
            transport,
            events: EventBus::new(),
            contacts,
            external_ip: Mutex::new(None),
            hop_stats: Mutex::new(vec![]),
            executor: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(vec![]),
        }))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn events(&self) -> &EventBusPtr {
        &self.events
    }

    pub fn dht(&self) -> &DhtPtr {
        &self.dht
    }

    pub fn transport(&self) -> &RudpSocketPtr {
        &self.transport
    }

    pub async fn hop_stats(&self) -> Vec<Arc<HopStats>> {
        self.hop_stats.lock().await.clone()
    }

    /// Probe the external address, start the receive tasks, bootstrap
    /// the DHT and answer hole punches from then on.
    pub async fn start(self: &Arc<Self>, executor: &ExecutorPtr) -> Result<()> {
        *self.executor.lock().unwrap() = Some(executor.clone());

        // The probe shares the transport socket, so it must finish
        // before the dispatcher starts eating datagrams.
        if self.settings.localnet {
            *self.external_ip.lock().await = Some(IpAddr::from([127, 0, 0, 1]));
        } else {
            match nat::probe_external_addr(self.transport.raw_socket(), &self.settings.stun_servers)
                .await
            {
                Ok(addr) => *self.external_ip.lock().await = Some(addr.ip()),
                Err(e) => warn!(target: "node", "External address probe failed: {e}"),
            }
        }

        self.dht.start(executor);
        self.transport.start(executor);

        let responder_task = StoppableTask::new();
        responder_task.clone().start(
            nat::punch_responder(self.transport.clone(), self.identity.fingerprint()),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "node", "Punch responder died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );
        self.tasks.lock().unwrap().push(responder_task);

        if !self.settings.bootstrap.is_empty() {
            self.dht.bootstrap(&self.settings.bootstrap).await;
        }

        Ok(())
    }

    /// Graceful shutdown: close live connections within the 5 s
    /// budget, then stop every task.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }

        self.transport.stop().await;
        self.dht.stop().await;
        info!(target: "node", "Node stopped");
    }

    // =============
    // Announcement
    // =============

    /// Sign and publish a fresh announcement. Returns how many of the
    /// K closest nodes acknowledged the store.
    pub async fn announce(self: &Arc<Self>) -> Result<usize> {
        let ip = (*self.external_ip.lock().await)
            .ok_or_else(|| Error::TransportFailed("external address unknown".to_string()))?;

        let candidates = nat::port_candidates(self.transport.port());
        let record = PeerAnnouncement::new_signed(&self.identity, ip, candidates)?;

        let acks = self.dht.publish(&record).await?;
        info!(target: "node::announce()", "Announced {} ({acks} acks)", self.identity.username());
        Ok(acks)
    }

    /// Republish on the normative 30-minute cadence until stopped.
    pub fn start_announcing(self: &Arc<Self>, executor: &ExecutorPtr) {
        let this = self.clone();
        let interval = this.dht.settings.republish_secs;

        let task = StoppableTask::new();
        task.clone().start(
            async move {
                loop {
                    if let Err(e) = this.announce().await {
                        warn!(target: "node", "Announce failed: {e}");
                    }
                    crate::system::sleep(interval).await;
                }
            },
            |_| async {},
            Error::DetachedTaskStopped,
            executor,
        );
        self.tasks.lock().unwrap().push(task);
    }

    /// Resolve a username to its signed announcement.
    pub async fn resolve(self: &Arc<Self>, username: &str) -> Result<PeerAnnouncement> {
        let key = NodeId::hash_key(username.as_bytes());
        let record = self
            .dht
            .lookup_value(&key)
            .await
            .map_err(|_| Error::PeerNotFound(username.to_string()))?;

        if record.username != username {
            return Err(Error::PeerNotFound(username.to_string()))
        }

        self.events
            .publish(Event::PeerResolved {
                username: username.to_string(),
                fingerprint: record.fingerprint,
            })
            .await;
        Ok(record)
    }

    // ===========
    // Connecting
    // ===========

    /// Establish an authenticated channel to a username, over the
    /// preferred route. A failed direct path falls back to the relay
    /// when one is configured (the symmetric-NAT case).
    pub async fn connect(self: &Arc<Self>, username: &str, route: Route) -> Result<SecureChannel> {
        let announcement = self.resolve(username).await?;

        let channel = match route {
            Route::Direct => match self.connect_direct(&announcement).await {
                Ok(channel) => channel,
                Err(e) if !self.settings.relays.is_empty() => {
                    info!(target: "node::connect()", "Direct path failed ({e}), trying relay");
                    self.connect_relayed(&announcement).await?
                }
                Err(e) => return Err(e),
            },
            Route::Relayed => self.connect_relayed(&announcement).await?,
            Route::Onion => self.connect_onion(&announcement).await?,
        };

        self.note_peer(&announcement).await;
        self.events
            .publish(Event::ChannelEstablished { peer: channel.peer(), route })
            .await;
        Ok(channel)
    }

    async fn connect_direct(self: &Arc<Self>, peer: &PeerAnnouncement) -> Result<SecureChannel> {
        let own = self.identity.fingerprint();
        let addr = match nat::hole_punch(
            &self.transport,
            &own,
            &peer.fingerprint,
            peer.address,
            &peer.port_candidates,
        )
        .await
        {
            Ok(addr) => {
                self.events
                    .publish(Event::PunchSucceeded { peer: peer.fingerprint, addr })
                    .await;
                addr
            }
            Err(e) => {
                self.events.publish(Event::PunchFailed { peer: peer.fingerprint }).await;
                return Err(e)
            }
        };

        let conn = self.transport.connect(addr).await?;
        let link: LinkPtr = conn;
        session::initiate(link, &self.identity, Some(peer.fingerprint)).await
    }

    async fn connect_relayed(self: &Arc<Self>, peer: &PeerAnnouncement) -> Result<SecureChannel> {
        let executor = self.executor()?;
        let mut last_err = Error::ConnectFailed("no relay configured".to_string());

        for relay_addr in &self.settings.relays {
            let client = match RelayClient::connect(*relay_addr, &self.identity).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = e;
                    continue
                }
            };
            client.start(&executor);

            match client.request(&peer.fingerprint).await {
                Ok(link) => {
                    self.events
                        .publish(Event::RelayPaired {
                            session_id: client.session_id().to_string(),
                            peer: peer.fingerprint,
                        })
                        .await;
                    let link: LinkPtr = Arc::new(link);
                    return session::initiate(link, &self.identity, Some(peer.fingerprint)).await
                }
                Err(e) => {
                    client.stop().await;
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn connect_onion(self: &Arc<Self>, peer: &PeerAnnouncement) -> Result<SecureChannel> {
        let mut relays = self.settings.onion_relays.clone();
        relays.dedup();
        if relays.len() < 3 {
            return Err(Error::CircuitFailed("need three distinct onion relays".to_string()))
        }
        let (guard, middle, exit) = (relays[0], relays[1], relays[2]);

        let guard_link: LinkPtr = self.transport.connect(guard).await?;
        let circuit = Circuit::build(guard_link, middle, exit).await?;
        self.events.publish(Event::CircuitBuilt { exit }).await;

        let destination = SocketAddr::new(peer.address, peer.port_candidates[0]);
        circuit.begin(destination).await?;

        session::initiate(Arc::new(circuit), &self.identity, Some(peer.fingerprint)).await
    }

    // ==========
    // Accepting
    // ==========

    /// Serve inbound carriers until an authenticated session arrives.
    /// CREATE cells spin up circuit service instead of a session, so a
    /// relay node simply never returns from this in practice.
    pub async fn accept(self: &Arc<Self>) -> Result<SecureChannel> {
        loop {
            let conn = self.transport.accept().await?;
            let link: LinkPtr = conn;

            let first = match io_timeout(ACCEPT_TIMEOUT, link.recv()).await {
                Ok(first) => first,
                Err(e) => {
                    debug!(target: "node::accept()", "Inbound carrier was silent: {e}");
                    continue
                }
            };

            // Onion circuits open with a fixed-size CREATE cell;
            // everything else is a session handshake.
            if first.len() == onion::CELL_SIZE {
                self.serve_circuit(link, first);
                continue
            }

            match session::respond_with_first(link, &self.identity, &first, None).await {
                Ok(channel) => {
                    self.events
                        .publish(Event::ChannelEstablished {
                            peer: channel.peer(),
                            route: Route::Direct,
                        })
                        .await;
                    return Ok(channel)
                }
                Err(e) => debug!(target: "node::accept()", "Inbound handshake failed: {e}"),
            }
        }
    }

    fn serve_circuit(self: &Arc<Self>, link: LinkPtr, first: Vec<u8>) {
        let Ok(executor) = self.executor() else { return };

        let stats = Arc::new(HopStats::default());
        let dialer: Arc<dyn onion::HopDialer> =
            Arc::new(TransportDialer { transport: self.transport.clone() });

        let this = self.clone();
        let stats_ = stats.clone();
        executor
            .spawn(async move {
                this.hop_stats.lock().await.push(stats_.clone());
                if let Err(e) = onion::serve_circuit(link, first, dialer, stats_).await {
                    debug!(target: "node", "Circuit service ended: {e}");
                }
                this.events.publish(Event::CircuitDestroyed).await;
            })
            .detach();
    }

    fn executor(&self) -> Result<ExecutorPtr> {
        self.executor.lock().unwrap().clone().ok_or(Error::NodeStopped)
    }

    /// Remember a peer we successfully authenticated with.
    async fn note_peer(&self, announcement: &PeerAnnouncement) {
        let Some(contacts) = &self.contacts else { return };
        let now = Timestamp::current_time();

        let result = match contacts.lookup_by_fingerprint(&announcement.fingerprint) {
            Ok(Some(_)) => contacts.update_last_seen(&announcement.fingerprint, now),
            Ok(None) => contacts.upsert(&Contact {
                display_name: announcement
                    .username
                    .split('#')
                    .next()
                    .unwrap_or(&announcement.username)
                    .to_string(),
                username: announcement.username.clone(),
                fingerprint: announcement.fingerprint,
                public_key_der: announcement.public_key_der.clone(),
                added_at: now,
                last_seen: Some(now),
                favorite: false,
                notes: String::new(),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(target: "node", "Contact store update failed: {e}");
        }
    }
}

struct TransportDialer {
    transport: RudpSocketPtr,
}

#[async_trait]
impl onion::HopDialer for TransportDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<LinkPtr> {
        let conn = self.transport.connect(addr).await?;
        Ok(conn)
    }
}

/// DHT key a username's announcement lives under, for callers that
/// only hold the username string.
pub fn username_key(username: &str) -> NodeId {
    NodeId::hash_key(username.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_key_is_sha1_of_username() {
        let a = username_key("alice#00FF00FF");
        let b = username_key("alice#00FF00FF");
        let c = username_key("alice#00FF00FE");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
