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

//! Relay attach, pairing and opaque forwarding of 1 MiB.

use std::net::SocketAddr;

use rand::{Rng, SeedableRng};

use anonet::{
    identity::Identity,
    link::Link,
    relay::{RelayClient, RelayServer},
    Error,
};

mod harness;

const TRANSFER_LEN: usize = 1024 * 1024;
const FRAME_CHUNK: usize = 32 * 1024;

#[test]
fn pairing_and_opaque_forwarding() {
    harness::run(|ex| async move {
        let server = RelayServer::bind(0).await.unwrap();
        server.start(&ex);
        let relay_addr: SocketAddr = format!("127.0.0.1:{}", server.port()).parse().unwrap();

        let (alice, _) = Identity::generate("alice").unwrap();
        let (bob, _) = Identity::generate("bob").unwrap();

        let client_a = RelayClient::connect(relay_addr, &alice).await.unwrap();
        let client_b = RelayClient::connect(relay_addr, &bob).await.unwrap();
        client_a.start(&ex);
        client_b.start(&ex);

        assert_ne!(client_a.session_id(), client_b.session_id());

        // Pairing against an unattached peer is rejected.
        let (stranger, _) = Identity::generate("stranger").unwrap();
        match client_a.request(&stranger.fingerprint()).await {
            Err(Error::RelayRejected(_)) => {}
            Err(e) => panic!("expected rejection, got {e}"),
            Ok(_) => panic!("expected rejection, got a pairing"),
        }

        // Pair A with B; both sides learn the peer fingerprint.
        let wait_b = ex.spawn({
            let client_b = client_b.clone();
            async move { client_b.wait_pair().await }
        });
        let link_a = client_a.request(&bob.fingerprint()).await.unwrap();
        let link_b = wait_b.await.unwrap();

        assert_eq!(link_a.peer(), bob.fingerprint());
        assert_eq!(link_b.peer(), alice.fingerprint());

        // 1 MiB of random bytes, forwarded verbatim.
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let payload: Vec<u8> = (0..TRANSFER_LEN).map(|_| rng.gen()).collect();

        let payload_ = payload.clone();
        let send_task = ex.spawn(async move {
            for chunk in payload_.chunks(FRAME_CHUNK) {
                link_a.send(chunk).await.unwrap();
            }
        });

        let mut received = Vec::with_capacity(TRANSFER_LEN);
        while received.len() < TRANSFER_LEN {
            received.extend_from_slice(&link_b.recv().await.unwrap());
        }
        send_task.await;

        assert_eq!(received, payload);

        client_a.stop().await;
        client_b.stop().await;
        server.stop().await;
    });
}
