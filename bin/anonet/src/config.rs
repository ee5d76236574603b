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

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use log::warn;
use serde::Deserialize;

use anonet::{settings, Error, Result, Settings};

/// `~/.anonet/config.toml`. Every field optional; missing values use
/// the built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Display name used the first time an identity is created
    pub name: Option<String>,
    pub dht_port: Option<u16>,
    pub transport_port: Option<u16>,
    /// `host:port` DHT addresses of community bootstrap nodes
    pub bootstrap: Vec<String>,
    /// `host:port` TCP relay endpoints
    pub relays: Vec<String>,
    /// `host:port` UDP onion addresses of known relays
    pub onion_relays: Vec<String>,
    pub stun_servers: Vec<String>,
    pub localnet: bool,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default())
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("{path:?}: {e}")))?;
        toml::from_str(&contents).map_err(|e| Error::Storage(format!("{path:?}: {e}")))
    }

    pub fn into_settings(self) -> Settings {
        let mut settings = Settings {
            dht_port: self.dht_port.unwrap_or(settings::DEFAULT_DHT_PORT),
            transport_port: self.transport_port.unwrap_or(settings::DEFAULT_TRANSPORT_PORT),
            bootstrap: resolve_all(&self.bootstrap),
            relays: resolve_all(&self.relays),
            onion_relays: resolve_all(&self.onion_relays),
            localnet: self.localnet,
            ..Default::default()
        };

        if !self.stun_servers.is_empty() {
            settings.stun_servers = self.stun_servers;
        }
        settings
    }
}

fn resolve_all(entries: &[String]) -> Vec<SocketAddr> {
    let mut out = vec![];
    for entry in entries {
        match entry.to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => out.push(addr),
                None => warn!("No address for {entry}"),
            },
            Err(e) => warn!("Skipping malformed endpoint {entry}: {e}"),
        }
    }
    out
}
