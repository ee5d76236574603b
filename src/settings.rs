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

use std::net::SocketAddr;

use crate::nat::stun::DEFAULT_STUN_SERVERS;

/// LAN discovery beacon (external collaborator, exported so both sides
/// agree on the number)
pub const DEFAULT_BEACON_PORT: u16 = 51820;

/// DHT datagrams. The original source shared one port between the
/// beacon and the DHT; the listeners are deliberately apart here.
pub const DEFAULT_DHT_PORT: u16 = 51821;

/// TCP relay
pub const DEFAULT_RELAY_PORT: u16 = 51822;

/// RUDP, hole punch and onion traffic
pub const DEFAULT_TRANSPORT_PORT: u16 = 51823;

/// Node configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub dht_port: u16,
    pub transport_port: u16,
    /// Known community nodes (DHT addresses) to bootstrap from
    pub bootstrap: Vec<SocketAddr>,
    /// TCP relay endpoints, tried in order for the fallback path
    pub relays: Vec<SocketAddr>,
    /// UDP (transport) addresses of relays that serve onion circuits
    pub onion_relays: Vec<SocketAddr>,
    pub stun_servers: Vec<String>,
    /// Skip the external probe and announce 127.0.0.1 (tests, LANs)
    pub localnet: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dht_port: DEFAULT_DHT_PORT,
            transport_port: DEFAULT_TRANSPORT_PORT,
            bootstrap: vec![],
            relays: vec![],
            onion_relays: vec![],
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            localnet: false,
        }
    }
}

impl Settings {
    /// Ephemeral-port settings for tests and localnet runs.
    pub fn localnet() -> Self {
        Self { dht_port: 0, transport_port: 0, localnet: true, ..Default::default() }
    }
}
