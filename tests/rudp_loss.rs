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

//! Reliable-UDP delivery through a lossy link: a UDP forwarder
//! between the two sockets drops 30 % of datagrams in each direction,
//! and a 100 KiB payload must still arrive byte-identical.

use std::net::SocketAddr;

use rand::{Rng, SeedableRng};
use smol::lock::Mutex;

use anonet::{
    rudp::{RudpSocket, MAX_PAYLOAD_SIZE},
    system::ExecutorPtr,
    Result,
};

mod harness;

const LOSS_PERCENT: u32 = 30;
const PAYLOAD_LEN: usize = 100 * 1024;

/// Two-party UDP forwarder that drops a deterministic 30 % of
/// datagrams. The first peer to send through it is "side A".
async fn lossy_forwarder(ex: &ExecutorPtr, b_addr: SocketAddr) -> Result<SocketAddr> {
    let socket = smol::net::UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;

    let task = async move {
        let rng = Mutex::new(rand::rngs::StdRng::seed_from_u64(0xA0A0));
        let mut a_addr: Option<SocketAddr> = None;
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE + 64];

        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else { break };

            if from != b_addr && a_addr.is_none() {
                a_addr = Some(from);
            }

            if rng.lock().await.gen_range(0..100) < LOSS_PERCENT {
                continue
            }

            let target = if from == b_addr { a_addr } else { Some(b_addr) };
            if let Some(target) = target {
                let _ = socket.send_to(&buf[..n], target).await;
            }
        }
    };
    ex.spawn(task).detach();

    Ok(addr)
}

#[test]
fn lossy_link_delivers_in_order() {
    harness::run(|ex| async move {
        let sender = RudpSocket::bind(0).await.unwrap();
        let receiver = RudpSocket::bind(0).await.unwrap();
        sender.start(&ex);
        receiver.start(&ex);

        let receiver_addr: SocketAddr =
            format!("127.0.0.1:{}", receiver.port()).parse().unwrap();
        let proxy_addr = lossy_forwarder(&ex, receiver_addr).await.unwrap();

        // Deterministic payload.
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|_| rng.gen()).collect();

        let conn_out = sender.connect(proxy_addr).await.unwrap();
        let conn_in = receiver.accept().await.unwrap();

        let payload_ = payload.clone();
        let send_task = ex.spawn(async move {
            for chunk in payload_.chunks(MAX_PAYLOAD_SIZE) {
                conn_out.send_data(chunk).await.unwrap();
            }
            conn_out.close().await.unwrap();
        });

        let mut received = Vec::with_capacity(PAYLOAD_LEN);
        while received.len() < PAYLOAD_LEN {
            let chunk = conn_in.recv_data().await.unwrap();
            received.extend_from_slice(&chunk);
        }

        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload, "delivery must be byte-identical and in order");

        send_task.await;
        sender.stop().await;
        receiver.stop().await;
    });
}
