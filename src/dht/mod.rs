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

//! Kademlia-style DHT used for peer announcement and lookup.
//!
//! Runs over its own UDP socket. Datagrams are independent
//! request/response pairs keyed by a 16-byte transaction id with a 5 s
//! deadline. Contacts live in 160 k-buckets; announcements are signed
//! records stored on the K nodes closest to `SHA-1(username)`.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use smol::lock::Mutex;

use crate::{
    system::{io_timeout, ExecutorPtr, StoppableTask, StoppableTaskPtr},
    util::time::Timestamp,
    Error, Result,
};

/// K-buckets and the routing table
pub mod bucket;
pub use bucket::{DhtContact, RoutingTable, K};

/// Datagram codec
pub mod message;
use message::{ContactInfo, RpcBody, TxId};

/// 160-bit identifiers
pub mod node_id;
pub use node_id::NodeId;

/// Signed peer announcements
pub mod record;
pub use record::PeerAnnouncement;

/// Iterative node/value lookup
pub mod lookup;

pub type DhtPtr = Arc<Dht>;

/// Tunables. The defaults are normative for this network.
#[derive(Clone, Debug)]
pub struct DhtSettings {
    /// Replication factor / bucket size
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Per-RPC deadline
    pub request_timeout: Duration,
    /// Stored records expire after this many seconds
    pub record_expiry_secs: u64,
    /// Buckets idle longer than this get a refresh lookup
    pub bucket_refresh_secs: u64,
    /// Own announcement republish cadence, seconds
    pub republish_secs: u64,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            k: K,
            alpha: 3,
            request_timeout: Duration::from_secs(5),
            record_expiry_secs: 2 * 60 * 60,
            bucket_refresh_secs: 60 * 60,
            republish_secs: 30 * 60,
        }
    }
}

struct StoredRecord {
    record: PeerAnnouncement,
    stored_at: Timestamp,
}

/// Decaying misbehavior score per source address.
struct StrikeEntry {
    score: f64,
    updated: Timestamp,
}

const STRIKE_LIMIT: f64 = 16.0;
const STRIKE_HALF_LIFE_MS: f64 = 60.0 * 60.0 * 1000.0;

/// DHT node state.
pub struct Dht {
    pub settings: DhtSettings,
    socket: smol::net::UdpSocket,
    port: u16,
    table: RoutingTable,
    storage: Mutex<HashMap<NodeId, StoredRecord>>,
    pending: Mutex<HashMap<TxId, smol::channel::Sender<RpcBody>>>,
    strikes: Mutex<HashMap<IpAddr, StrikeEntry>>,
    tasks: std::sync::Mutex<Vec<StoppableTaskPtr>>,
}

impl Dht {
    /// Bind the DHT socket and build the node state. When the preferred
    /// port is taken, up to nine offset ports are tried before giving
    /// up. Port 0 binds an ephemeral port.
    pub async fn new(local_id: NodeId, preferred_port: u16, settings: DhtSettings) -> Result<DhtPtr> {
        let socket = bind_with_offset(preferred_port).await?;
        let port = socket
            .local_addr()
            .map_err(|e| Error::BindFailed(e.to_string()))?
            .port();

        info!(target: "dht", "DHT node {local_id} listening on UDP port {port}");

        Ok(Arc::new(Self {
            settings,
            socket,
            port,
            table: RoutingTable::new(local_id),
            storage: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            strikes: Mutex::new(HashMap::new()),
            tasks: std::sync::Mutex::new(vec![]),
        }))
    }

    pub fn local_id(&self) -> NodeId {
        self.table.local_id()
    }

    /// Bound UDP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Spawn the receive loop and the maintenance loop.
    pub fn start(self: &Arc<Self>, executor: &ExecutorPtr) {
        let listen_task = StoppableTask::new();
        listen_task.clone().start(
            self.clone().listen(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "dht", "Receive loop died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );

        let maintenance_task = StoppableTask::new();
        maintenance_task.clone().start(
            self.clone().maintenance(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "dht", "Maintenance loop died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(listen_task);
        tasks.push(maintenance_task);
    }

    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
    }

    /// Insert bootstrap peers, then walk towards our own ID to
    /// populate the surrounding buckets.
    pub async fn bootstrap(self: &Arc<Self>, peers: &[SocketAddr]) {
        for addr in peers {
            match self.ping(*addr).await {
                Ok(id) => debug!(target: "dht::bootstrap()", "Seeded contact {id} at {addr}"),
                Err(e) => debug!(target: "dht::bootstrap()", "Bootstrap peer {addr} unreachable: {e}"),
            }
        }

        let _ = self.lookup_nodes(&self.local_id()).await;
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.table.contact_count().await > 0
    }

    // =====================
    // RPC client operations
    // =====================

    async fn request(&self, addr: SocketAddr, body: RpcBody) -> Result<RpcBody> {
        let txid = TxId::random();
        let (reply_send, reply_recv) = smol::channel::bounded(1);
        self.pending.lock().await.insert(txid, reply_send);

        let datagram = message::encode(&txid, &body);
        let send_res = self.socket.send_to(&datagram, addr).await;

        let reply = match send_res {
            Ok(_) => {
                io_timeout(self.settings.request_timeout, async { Ok(reply_recv.recv().await?) })
                    .await
            }
            Err(e) => Err(e.into()),
        };

        self.pending.lock().await.remove(&txid);
        reply
    }

    /// PING an address, learning (and bucketing) its node ID.
    pub async fn ping(self: &Arc<Self>, addr: SocketAddr) -> Result<NodeId> {
        let body = RpcBody::Ping { sender: self.local_id(), sender_port: self.port };
        match self.request(addr, body).await? {
            RpcBody::Pong { responder } => {
                self.clone().touch_contact(DhtContact::new(responder, addr)).await;
                Ok(responder)
            }
            _ => Err(Error::MalformedPacket("expected PONG".to_string())),
        }
    }

    pub async fn find_node_rpc(
        &self,
        contact: &ContactInfo,
        target: &NodeId,
    ) -> Result<Vec<ContactInfo>> {
        match self.request(contact.addr, RpcBody::FindNode { target: *target }).await? {
            RpcBody::Nodes { contacts } => Ok(contacts),
            _ => Err(Error::MalformedPacket("expected NODES".to_string())),
        }
    }

    pub async fn find_value_rpc(&self, contact: &ContactInfo, key: &NodeId) -> Result<RpcBody> {
        let reply = self.request(contact.addr, RpcBody::FindValue { key: *key }).await?;
        match reply {
            RpcBody::ValueNodes { .. } | RpcBody::ValueRecord { .. } => Ok(reply),
            _ => Err(Error::MalformedPacket("expected VALUE".to_string())),
        }
    }

    pub async fn store_rpc(&self, contact: &ContactInfo, record: &PeerAnnouncement) -> Result<()> {
        let body = RpcBody::Store { key: record.key(), record: record.clone() };
        match self.request(contact.addr, body).await? {
            RpcBody::StoreAck => Ok(()),
            _ => Err(Error::MalformedPacket("expected STORE ack".to_string())),
        }
    }

    /// Publish an announcement to the K closest nodes. A store that
    /// reaches no other node still keeps the record locally, so a
    /// lone node can bootstrap a network.
    pub async fn publish(self: &Arc<Self>, record: &PeerAnnouncement) -> Result<usize> {
        record.verify()?;
        let key = record.key();

        self.store_local(key, record.clone()).await;

        let targets = self.lookup_nodes(&key).await;
        let stores = targets.iter().map(|contact| self.store_rpc(contact, record));
        let acks =
            futures::future::join_all(stores).await.into_iter().filter(|r| r.is_ok()).count();

        debug!(target: "dht::publish()", "Announcement stored on {acks}/{} nodes", targets.len());
        Ok(acks)
    }

    // ==================
    // Server-side state
    // ==================

    async fn store_local(&self, key: NodeId, record: PeerAnnouncement) {
        self.storage
            .lock()
            .await
            .insert(key, StoredRecord { record, stored_at: Timestamp::current_time() });
    }

    /// Record incoming traffic from a contact, probing the bucket head
    /// on overflow as the eviction rule requires. The probe is detached
    /// so the receive loop keeps draining the socket it depends on.
    async fn touch_contact(self: Arc<Self>, contact: DhtContact) {
        let Some(candidate) = self.table.update(contact.clone()).await else { return };

        // Bucket is full: ping the least recently seen contact. Alive
        // keeps its seat, dead is replaced by the newcomer.
        debug!(target: "dht", "Bucket full, probing {}", candidate.id);
        let this = self.clone();
        smol::spawn(async move {
            let body = RpcBody::Ping { sender: this.local_id(), sender_port: this.port };
            match this.request(candidate.addr, body).await {
                Ok(RpcBody::Pong { .. }) => this.table.confirm_alive(&candidate.id).await,
                _ => this.table.confirm_dead(&candidate.id, contact).await,
            }
        })
        .detach();
    }

    async fn listen(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; message::MAX_DATAGRAM_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;

            if self.is_banned(peer.ip()).await {
                continue
            }

            if let Err(e) = self.clone().handle_datagram(&buf[..n], peer).await {
                debug!(target: "dht", "Dropping datagram from {peer}: {e}");
                self.strike(peer.ip()).await;
            }
        }
    }

    async fn handle_datagram(self: Arc<Self>, data: &[u8], peer: SocketAddr) -> Result<()> {
        let (txid, body) = message::decode(data)?;

        if body.is_reply() {
            if let Some(waiter) = self.pending.lock().await.remove(&txid) {
                let _ = waiter.send(body).await;
            }
            return Ok(())
        }

        let reply = match body {
            RpcBody::Ping { sender, sender_port } => {
                let contact = DhtContact::new(sender, SocketAddr::new(peer.ip(), sender_port));
                self.clone().touch_contact(contact).await;
                RpcBody::Pong { responder: self.local_id() }
            }

            RpcBody::FindNode { target } => RpcBody::Nodes {
                contacts: self.closest_contacts(&target).await,
            },

            RpcBody::Store { key, record } => {
                record.verify()?;
                if !record.is_fresh() {
                    return Err(Error::MalformedPacket("announcement outside window".to_string()))
                }
                if key != record.key() {
                    return Err(Error::MalformedPacket("store key mismatch".to_string()))
                }
                self.store_local(key, record).await;
                RpcBody::StoreAck
            }

            RpcBody::FindValue { key } => {
                let stored = self.storage.lock().await.get(&key).map(|s| s.record.clone());
                match stored {
                    Some(record) if record.is_fresh() => RpcBody::ValueRecord { record },
                    _ => RpcBody::ValueNodes { contacts: self.closest_contacts(&key).await },
                }
            }

            _ => return Err(Error::MalformedPacket("reply type as request".to_string())),
        };

        self.socket.send_to(&message::encode(&txid, &reply), peer).await?;
        Ok(())
    }

    async fn closest_contacts(&self, target: &NodeId) -> Vec<ContactInfo> {
        self.table
            .closest(target, self.settings.k)
            .await
            .into_iter()
            .map(|c| ContactInfo { id: c.id, addr: c.addr })
            .collect()
    }

    async fn maintenance(self: Arc<Self>) -> Result<()> {
        loop {
            crate::system::sleep(60).await;

            // Expire stored records.
            let expiry_ms = self.settings.record_expiry_secs * 1000;
            self.storage.lock().await.retain(|_, stored| stored.stored_at.elapsed() < expiry_ms);

            // Refresh buckets that have been quiet for an hour.
            let refresh_ms = self.settings.bucket_refresh_secs * 1000;
            for index in self.table.stale_buckets(refresh_ms).await {
                let target = self.local_id().random_in_bucket(index);
                debug!(target: "dht", "Refreshing bucket {index}");
                let _ = self.lookup_nodes(&target).await;
                self.table.mark_refreshed(index).await;
            }
        }
    }

    // ===============
    // Strike tracking
    // ===============

    async fn strike(&self, ip: IpAddr) {
        let mut strikes = self.strikes.lock().await;
        let entry = strikes
            .entry(ip)
            .or_insert(StrikeEntry { score: 0.0, updated: Timestamp::current_time() });

        entry.score = decayed_score(entry) + 1.0;
        entry.updated = Timestamp::current_time();

        if entry.score > STRIKE_LIMIT {
            warn!(target: "dht", "Source {ip} exceeded strike limit");
        }
    }

    async fn is_banned(&self, ip: IpAddr) -> bool {
        let strikes = self.strikes.lock().await;
        strikes.get(&ip).map(|e| decayed_score(e) > STRIKE_LIMIT).unwrap_or(false)
    }
}

fn decayed_score(entry: &StrikeEntry) -> f64 {
    let halvings = entry.updated.elapsed() as f64 / STRIKE_HALF_LIFE_MS;
    entry.score * 0.5f64.powf(halvings)
}

async fn bind_with_offset(preferred_port: u16) -> Result<smol::net::UdpSocket> {
    let mut last_err = None;

    for offset in 0..10u16 {
        let port = if preferred_port == 0 { 0 } else { preferred_port + offset };
        match smol::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
            Ok(socket) => {
                if offset > 0 {
                    warn!(target: "dht", "Preferred port taken, bound {port} instead");
                }
                return Ok(socket)
            }
            Err(e) => last_err = Some(e),
        }

        if preferred_port == 0 {
            break
        }
    }

    Err(Error::BindFailed(
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "no port available".to_string()),
    ))
}
