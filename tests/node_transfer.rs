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

//! The whole ladder on localhost: announce via DHT, resolve, hole
//! punch, reliable UDP, authenticated session, file transfer with
//! digest verification.

use std::net::SocketAddr;

use rand::{Rng, SeedableRng};

use anonet::{
    event::Route,
    identity::Identity,
    transfer, Node, Settings,
};

mod harness;

#[test]
fn announce_resolve_punch_transfer() {
    harness::run(|ex| async move {
        let tmp = std::env::temp_dir().join(format!("anonet-e2e-{}", rand::random::<u32>()));
        std::fs::create_dir_all(&tmp).unwrap();

        // Receiver node comes up first and announces itself.
        let (recv_identity, _) = Identity::generate("receiver").unwrap();
        let receiver =
            Node::new(Settings::localnet(), recv_identity.clone(), None).await.unwrap();
        receiver.start(&ex).await.unwrap();
        receiver.announce().await.unwrap();

        let receiver_dht: SocketAddr =
            format!("127.0.0.1:{}", receiver.dht().port()).parse().unwrap();

        // Sender bootstraps off the receiver's DHT address only.
        let (send_identity, _) = Identity::generate("sender").unwrap();
        let mut sender_settings = Settings::localnet();
        sender_settings.bootstrap = vec![receiver_dht];
        let sender = Node::new(sender_settings, send_identity, None).await.unwrap();
        sender.start(&ex).await.unwrap();

        // Receiver side: accept the session and take one file.
        let out_dir = tmp.join("inbox");
        let receiver_ = receiver.clone();
        let out_dir_ = out_dir.clone();
        let recv_task = ex.spawn(async move {
            let mut channel = receiver_.accept().await.unwrap();
            let path = transfer::recv_file(&mut channel, &out_dir_, receiver_.events())
                .await
                .unwrap();
            channel.close().await.unwrap();
            path
        });

        // Sender resolves the username and pushes a file.
        let mut rng = rand::rngs::StdRng::seed_from_u64(31337);
        let content: Vec<u8> = (0..300 * 1024).map(|_| rng.gen()).collect();
        let source = tmp.join("payload.bin");
        std::fs::write(&source, &content).unwrap();

        let username = recv_identity.username();
        let mut channel = sender.connect(&username, Route::Direct).await.unwrap();
        assert_eq!(channel.peer(), recv_identity.fingerprint());

        transfer::send_file(&mut channel, &source, sender.events()).await.unwrap();
        channel.close().await.unwrap();

        let written = recv_task.await;
        assert_eq!(written, out_dir.join("payload.bin"));
        assert_eq!(std::fs::read(&written).unwrap(), content);

        sender.stop().await;
        receiver.stop().await;
        std::fs::remove_dir_all(&tmp).unwrap();
    });
}
