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

//! Reliable UDP transport.
//!
//! One UDP socket carries hole-punch probes and any number of
//! reliable connections, demultiplexed by source address. The socket's
//! receive task routes punch text datagrams to a publisher (the NAT
//! traversal code subscribes) and everything else to per-connection
//! state machines.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, info, warn};
use smol::lock::Mutex;

use crate::{
    system::{io_timeout, ExecutorPtr, Publisher, PublisherPtr, StoppableTask, StoppableTaskPtr, Subscription},
    Error, Result,
};

/// Per-connection state machine
pub mod connection;
pub use connection::{Connection, ConnectionPtr, DEFAULT_WINDOW};

/// Header codec
pub mod packet;
pub use packet::MAX_PAYLOAD_SIZE;

use connection::{ConnEvent, State};
use packet::{Header, FLAG_SYN, HEADER_SIZE};

/// Prefix shared by hole-punch datagrams
const PUNCH_MAGIC: &[u8] = b"ANONET_PUNCH";

/// A raw datagram that is not RUDP traffic (hole-punch text).
pub type RawDatagram = (SocketAddr, Vec<u8>);

pub type RudpSocketPtr = Arc<RudpSocket>;

/// Shared UDP socket with connection dispatch.
pub struct RudpSocket {
    socket: smol::net::UdpSocket,
    port: u16,
    conns: Mutex<HashMap<SocketAddr, ConnectionPtr>>,
    accept_queue: (smol::channel::Sender<ConnectionPtr>, smol::channel::Receiver<ConnectionPtr>),
    punch_publisher: PublisherPtr<RawDatagram>,
    executor: std::sync::Mutex<Option<ExecutorPtr>>,
    tasks: std::sync::Mutex<Vec<StoppableTaskPtr>>,
}

impl RudpSocket {
    /// Bind the transport socket. When the preferred port is taken, up
    /// to nine offset ports are tried. Port 0 binds ephemerally.
    pub async fn bind(preferred_port: u16) -> Result<RudpSocketPtr> {
        let mut last_err = None;
        let mut socket = None;

        for offset in 0..10u16 {
            let port = if preferred_port == 0 { 0 } else { preferred_port + offset };
            match smol::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
                Ok(s) => {
                    if offset > 0 {
                        warn!(target: "rudp", "Preferred port taken, bound {port} instead");
                    }
                    socket = Some(s);
                    break
                }
                Err(e) => last_err = Some(e),
            }

            if preferred_port == 0 {
                break
            }
        }

        let Some(socket) = socket else {
            return Err(Error::BindFailed(
                last_err.map(|e| e.to_string()).unwrap_or_else(|| "no port".to_string()),
            ))
        };

        let port =
            socket.local_addr().map_err(|e| Error::BindFailed(e.to_string()))?.port();
        info!(target: "rudp", "Transport socket bound on UDP port {port}");

        Ok(Arc::new(Self {
            socket,
            port,
            conns: Mutex::new(HashMap::new()),
            accept_queue: smol::channel::unbounded(),
            punch_publisher: Publisher::new(),
            executor: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(vec![]),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Raw socket access for code (STUN probe) that runs before the
    /// dispatcher starts.
    pub fn raw_socket(&self) -> &smol::net::UdpSocket {
        &self.socket
    }

    /// Send a raw datagram bypassing connection state (punch probes).
    pub async fn send_raw(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    /// Subscribe to non-RUDP datagrams (punch traffic).
    pub async fn subscribe_raw(&self) -> Subscription<RawDatagram> {
        self.punch_publisher.clone().subscribe().await
    }

    /// Spawn the dispatcher.
    pub fn start(self: &Arc<Self>, executor: &ExecutorPtr) {
        *self.executor.lock().unwrap() = Some(executor.clone());

        let task = StoppableTask::new();
        task.clone().start(
            self.clone().listen(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "rudp", "Dispatcher died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );
        self.tasks.lock().unwrap().push(task);
    }

    /// Close every connection (best effort, bounded) and stop the
    /// dispatcher.
    pub async fn stop(&self) {
        let conns: Vec<ConnectionPtr> =
            self.conns.lock().await.drain().map(|(_, conn)| conn).collect();
        let goodbyes = conns.iter().map(|c| c.close());
        let graceful = io_timeout(Duration::from_secs(5), async {
            futures::future::join_all(goodbyes).await;
            Ok(())
        })
        .await;

        if graceful.is_err() {
            for conn in &conns {
                conn.reset().await;
            }
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
    }

    /// Open a connection to a (punched) remote address.
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<ConnectionPtr> {
        if self.conns.lock().await.contains_key(&remote) {
            return Err(Error::ConnectFailed(format!("connection to {remote} already exists")))
        }

        let conn = Connection::new(self.socket.clone(), remote, State::SynSent);
        self.conns.lock().await.insert(remote, conn.clone());
        self.spawn_connection_tasks(&conn);

        match conn.connect().await {
            Ok(()) => Ok(conn),
            Err(e) => {
                self.conns.lock().await.remove(&remote);
                Err(e)
            }
        }
    }

    /// Wait for the next inbound connection to finish its handshake.
    pub async fn accept(&self) -> Result<ConnectionPtr> {
        Ok(self.accept_queue.1.recv().await?)
    }

    /// Drop a connection from the dispatch table.
    pub async fn detach(&self, remote: SocketAddr) {
        self.conns.lock().await.remove(&remote);
    }

    fn spawn_connection_tasks(self: &Arc<Self>, conn: &ConnectionPtr) {
        let Some(executor) = self.executor.lock().unwrap().clone() else {
            // Dispatcher not started yet; retransmits start with it.
            return
        };

        let task = StoppableTask::new();
        task.clone().start(
            conn.clone().retransmit_loop(),
            |_| async {},
            Error::DetachedTaskStopped,
            &executor,
        );
        self.tasks.lock().unwrap().push(task);
    }

    async fn listen(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; HEADER_SIZE + MAX_PAYLOAD_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let data = &buf[..n];

            if data.starts_with(PUNCH_MAGIC) {
                self.punch_publisher.notify((peer, data.to_vec())).await;
                continue
            }

            let (header, payload) = match Header::decode(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(target: "rudp", "Dropping malformed datagram from {peer}: {e}");
                    continue
                }
            };

            let conn = {
                let mut conns = self.conns.lock().await;
                match conns.get(&peer) {
                    Some(conn) => conn.clone(),
                    None => {
                        if !header.has(FLAG_SYN) || header.has(packet::FLAG_ACK) {
                            // Stray packet for a connection we do not
                            // hold. A reset tells the sender to stop.
                            if !header.has(packet::FLAG_RST) {
                                let rst = Header {
                                    seq: 0,
                                    ack: 0,
                                    flags: packet::FLAG_RST,
                                    window: 0,
                                }
                                .encode(&[]);
                                let _ = self.socket.send_to(&rst, peer).await;
                            }
                            continue
                        }
                        let conn =
                            Connection::new(self.socket.clone(), peer, State::SynReceived);
                        conns.insert(peer, conn.clone());
                        drop(conns);
                        self.spawn_connection_tasks(&conn);
                        conn
                    }
                }
            };

            match conn.handle_packet(header, payload).await {
                Ok(Some(ConnEvent::Established)) => {
                    debug!(target: "rudp", "Accepted connection from {peer}");
                    let _ = self.accept_queue.0.send(conn).await;
                }
                Ok(None) => {}
                Err(e) => debug!(target: "rudp", "Packet from {peer}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (ExecutorPtr, smol::channel::Sender<()>) {
        let executor: ExecutorPtr = Arc::new(smol::Executor::new());
        let (signal, shutdown) = smol::channel::unbounded::<()>();
        for _ in 0..2 {
            let ex = executor.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || smol::block_on(ex.run(shutdown.recv())));
        }
        (executor, signal)
    }

    #[test]
    fn connect_accept_roundtrip() {
        let (executor, _signal) = harness();

        smol::block_on(async {
            let server = RudpSocket::bind(0).await.unwrap();
            let client = RudpSocket::bind(0).await.unwrap();
            server.start(&executor);
            client.start(&executor);

            let server_addr = SocketAddr::from(([127, 0, 0, 1], server.port()));

            let conn_out = client.connect(server_addr).await.unwrap();
            let conn_in = server.accept().await.unwrap();

            conn_out.send_data(b"over the punched path").await.unwrap();
            assert_eq!(conn_in.recv_data().await.unwrap(), b"over the punched path");

            conn_in.send_data(b"echo").await.unwrap();
            assert_eq!(conn_out.recv_data().await.unwrap(), b"echo");

            conn_out.close().await.unwrap();
            client.stop().await;
            server.stop().await;
        });
    }

    #[test]
    fn raw_datagrams_reach_subscriber() {
        let (executor, _signal) = harness();

        smol::block_on(async {
            let a = RudpSocket::bind(0).await.unwrap();
            let b = RudpSocket::bind(0).await.unwrap();
            a.start(&executor);
            b.start(&executor);

            let sub = b.subscribe_raw().await;
            let b_addr = SocketAddr::from(([127, 0, 0, 1], b.port()));
            a.send_raw(b_addr, b"ANONET_PUNCH|test|00").await.unwrap();

            let (from, data) = sub.receive().await.unwrap();
            assert_eq!(from.port(), a.port());
            assert!(data.starts_with(b"ANONET_PUNCH"));

            a.stop().await;
            b.stop().await;
        });
    }
}
