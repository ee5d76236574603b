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

//! Three in-memory DHT nodes: one stores an announcement, another
//! (knowing only the middle node) resolves it by username.

use std::{net::SocketAddr, sync::Arc};

use anonet::{
    dht::{node_id::NodeId, Dht, DhtSettings, PeerAnnouncement},
    identity::Identity,
    system::{msleep, ExecutorPtr},
    Result,
};

mod harness;

async fn dht_roundtrip(ex: ExecutorPtr) -> Result<()> {
    let mut nodes = vec![];
    for _ in 0..3 {
        let dht = Dht::new(NodeId::random(), 0, DhtSettings::default()).await?;
        dht.start(&ex);
        nodes.push(dht);
    }

    let addr_of =
        |dht: &Arc<Dht>| -> SocketAddr { format!("127.0.0.1:{}", dht.port()).parse().unwrap() };
    let hub_addr = addr_of(&nodes[1]);

    // Node 0 and node 2 each know only node 1.
    nodes[0].bootstrap(&[hub_addr]).await;
    nodes[2].bootstrap(&[hub_addr]).await;
    msleep(200).await;

    // Node 0 publishes its announcement.
    let (identity, _) = Identity::generate("seeder").unwrap();
    let announcement = PeerAnnouncement::new_signed(
        &identity,
        "127.0.0.1".parse().unwrap(),
        vec![51823, 51824],
    )?;
    let acks = nodes[0].publish(&announcement).await?;
    assert!(acks >= 1, "expected the record to reach at least one other node");

    // Node 2 resolves by username only.
    let key = NodeId::hash_key(identity.username().as_bytes());
    let found = nodes[2].lookup_value(&key).await?;

    assert_eq!(found, announcement);
    assert!(found.verify().is_ok());
    assert!(found.is_fresh());

    // An unknown username converges to not-found.
    let missing = NodeId::hash_key(b"nobody#00000000");
    assert!(nodes[2].lookup_value(&missing).await.is_err());

    for dht in &nodes {
        dht.stop().await;
    }
    Ok(())
}

#[test]
fn dht_store_and_lookup() {
    harness::run(|ex| async move { dht_roundtrip(ex).await.unwrap() });
}
