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

//! Full 3-hop circuit over real sockets: construction, BEGIN to a
//! destination, a payload in each direction, and the privacy
//! invariant that no hop sees both ends.

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use async_trait::async_trait;

use anonet::{
    link::{Link, LinkPtr},
    onion::{serve_circuit, Circuit, HopDialer, HopStats},
    rudp::{RudpSocket, RudpSocketPtr},
    system::ExecutorPtr,
    Result,
};

mod harness;

struct SocketDialer {
    socket: RudpSocketPtr,
}

#[async_trait]
impl HopDialer for SocketDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<LinkPtr> {
        let conn = self.socket.connect(addr).await?;
        Ok(conn)
    }
}

/// One onion relay: accept circuits on its transport socket forever.
async fn spawn_hop(ex: &ExecutorPtr) -> Result<(SocketAddr, Arc<HopStats>)> {
    let socket = RudpSocket::bind(0).await?;
    socket.start(ex);
    let addr: SocketAddr = format!("127.0.0.1:{}", socket.port()).parse().unwrap();
    let stats = Arc::new(HopStats::default());

    let stats_ = stats.clone();
    let socket_ = socket.clone();
    ex.spawn(async move {
        loop {
            let Ok(conn) = socket_.accept().await else { break };
            let link: LinkPtr = conn;
            let Ok(first) = link.recv().await else { continue };

            let dialer: Arc<dyn HopDialer> = Arc::new(SocketDialer { socket: socket_.clone() });
            let _ = serve_circuit(link, first, dialer, stats_.clone()).await;
        }
    })
    .detach();

    Ok((addr, stats))
}

#[test]
fn three_hop_circuit_end_to_end() {
    harness::run(|ex| async move {
        let (guard_addr, guard_stats) = spawn_hop(&ex).await.unwrap();
        let (middle_addr, middle_stats) = spawn_hop(&ex).await.unwrap();
        let (exit_addr, exit_stats) = spawn_hop(&ex).await.unwrap();

        // Destination node, reachable only by the exit.
        let dest_socket = RudpSocket::bind(0).await.unwrap();
        dest_socket.start(&ex);
        let dest_addr: SocketAddr =
            format!("127.0.0.1:{}", dest_socket.port()).parse().unwrap();

        // Initiator dials the guard and builds the circuit.
        let initiator = RudpSocket::bind(0).await.unwrap();
        initiator.start(&ex);

        let guard_link: LinkPtr = initiator.connect(guard_addr).await.unwrap();
        let circuit = Circuit::build(guard_link, middle_addr, exit_addr).await.unwrap();

        circuit.begin(dest_addr).await.unwrap();
        let dest_conn = dest_socket.accept().await.unwrap();

        // Forward payload.
        let decrypts_before = [
            guard_stats.decrypts.load(Ordering::SeqCst),
            middle_stats.decrypts.load(Ordering::SeqCst),
            exit_stats.decrypts.load(Ordering::SeqCst),
        ];

        circuit.send(b"hi").await.unwrap();
        let delivered = dest_conn.recv_data().await.unwrap();
        assert_eq!(delivered, b"hi", "exit must deliver the initiator's plaintext");

        // Exactly one layer decryption per hop for the single cell.
        let decrypts_after = [
            guard_stats.decrypts.load(Ordering::SeqCst),
            middle_stats.decrypts.load(Ordering::SeqCst),
            exit_stats.decrypts.load(Ordering::SeqCst),
        ];
        for (before, after) in decrypts_before.iter().zip(decrypts_after.iter()) {
            assert_eq!(after - before, 1);
        }

        // Backward payload.
        dest_conn.send_data(b"yo").await.unwrap();
        assert_eq!(circuit.recv().await.unwrap(), b"yo");

        // Privacy: only the exit learned the destination, and the
        // exit never extended anywhere (it is the last hop).
        assert!(guard_stats.begin_target.lock().unwrap().is_none());
        assert!(middle_stats.begin_target.lock().unwrap().is_none());
        assert_eq!(*exit_stats.begin_target.lock().unwrap(), Some(dest_addr));

        assert_eq!(*guard_stats.extended_to.lock().unwrap(), Some(middle_addr));
        assert_eq!(*middle_stats.extended_to.lock().unwrap(), Some(exit_addr));
        assert!(exit_stats.extended_to.lock().unwrap().is_none());

        circuit.destroy().await.unwrap();
        initiator.stop().await;
        dest_socket.stop().await;
    });
}
