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

//! Minimal classic STUN (RFC 5389) binding probe.
//!
//! Only what the external-address probe needs: a binding request with
//! the fixed magic cookie and a parser for XOR-MAPPED-ADDRESS /
//! MAPPED-ADDRESS (IPv4) in the response.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use log::debug;
use rand::{rngs::OsRng, RngCore};

use crate::{system::io_timeout, Error, Result};

pub const STUN_MAGIC: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;

/// Public binding servers tried in order.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_RETRIES: usize = 3;

/// 20-byte binding request with a fresh 96-bit transaction id.
pub fn build_binding_request() -> ([u8; 12], [u8; 20]) {
    let mut txid = [0u8; 12];
    OsRng.fill_bytes(&mut txid);

    let mut packet = [0u8; 20];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length: no attributes.
    packet[2..4].copy_from_slice(&0u16.to_be_bytes());
    packet[4..8].copy_from_slice(&STUN_MAGIC.to_be_bytes());
    packet[8..20].copy_from_slice(&txid);

    (txid, packet)
}

/// Extract the reflexive IPv4 address from a binding response.
pub fn parse_binding_response(data: &[u8], txid: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(Error::MalformedPacket("short stun message".to_string()))
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if msg_type != BINDING_RESPONSE || magic != STUN_MAGIC || &data[8..20] != txid {
        return Err(Error::MalformedPacket("unexpected stun response".to_string()))
    }
    if data.len() < 20 + msg_len {
        return Err(Error::MalformedPacket("truncated stun attributes".to_string()))
    }

    let mut pos = 20;
    let end = 20 + msg_len;
    let mut fallback = None;

    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > end {
            break
        }
        let value = &data[pos..pos + attr_len];
        // Attributes are padded to 32-bit boundaries.
        pos += (attr_len + 3) & !3;

        if attr_len < 8 || value[1] != FAMILY_IPV4 {
            continue
        }

        let port = u16::from_be_bytes([value[2], value[3]]);
        let raw_ip = [value[4], value[5], value[6], value[7]];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                let port = port ^ (STUN_MAGIC >> 16) as u16;
                let ip_bits = u32::from_be_bytes(raw_ip) ^ STUN_MAGIC;
                let ip = IpAddr::V4(Ipv4Addr::from(ip_bits));
                return Ok(SocketAddr::new(ip, port))
            }
            ATTR_MAPPED_ADDRESS => {
                fallback = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw_ip)), port));
            }
            _ => {}
        }
    }

    fallback.ok_or_else(|| Error::MalformedPacket("no mapped address attribute".to_string()))
}

/// Learn our external address by asking the built-in server list
/// through `socket`, which must be the transport socket so the mapping
/// matches the ports we later announce. 3 s deadline, 3 tries per
/// server.
pub async fn probe_external_addr(
    socket: &smol::net::UdpSocket,
    servers: &[String],
) -> Result<SocketAddr> {
    for server in servers {
        let Ok(resolved) = resolve_v4(server).await else {
            debug!(target: "nat::stun", "Cannot resolve {server}");
            continue
        };

        for attempt in 0..PROBE_RETRIES {
            match binding_roundtrip(socket, resolved).await {
                Ok(addr) => {
                    debug!(target: "nat::stun", "External address {addr} via {server}");
                    return Ok(addr)
                }
                Err(e) => {
                    debug!(target: "nat::stun", "{server} attempt {}: {e}", attempt + 1)
                }
            }
        }
    }

    Err(Error::TransportFailed("all STUN servers failed".to_string()))
}

async fn binding_roundtrip(
    socket: &smol::net::UdpSocket,
    server: SocketAddr,
) -> Result<SocketAddr> {
    let (txid, request) = build_binding_request();
    socket.send_to(&request, server).await?;

    io_timeout(PROBE_TIMEOUT, async {
        let mut buf = vec![0u8; 512];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue
            }
            return parse_binding_response(&buf[..n], &txid)
        }
    })
    .await
}

async fn resolve_v4(server: &str) -> Result<SocketAddr> {
    let server = server.to_string();
    let addrs = smol::unblock(move || server.to_socket_addrs().map(|a| a.collect::<Vec<_>>()))
        .await?;

    addrs
        .into_iter()
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::ConnectFailed("no IPv4 address for STUN server".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a response the way a server would.
    fn fake_response(txid: &[u8; 12], addr: SocketAddr, xored: bool) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else { panic!("ipv4 only") };

        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&12u16.to_be_bytes());
        out.extend_from_slice(&STUN_MAGIC.to_be_bytes());
        out.extend_from_slice(txid);

        let attr = if xored { ATTR_XOR_MAPPED_ADDRESS } else { ATTR_MAPPED_ADDRESS };
        out.extend_from_slice(&attr.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.push(0);
        out.push(FAMILY_IPV4);

        let (port, ip) = if xored {
            (v4.port() ^ (STUN_MAGIC >> 16) as u16, u32::from(*v4.ip()) ^ STUN_MAGIC)
        } else {
            (v4.port(), u32::from(*v4.ip()))
        };
        out.extend_from_slice(&port.to_be_bytes());
        out.extend_from_slice(&ip.to_be_bytes());
        out
    }

    #[test]
    fn parses_xor_mapped_address() {
        let (txid, _) = build_binding_request();
        let external: SocketAddr = "198.51.100.7:40123".parse().unwrap();

        let response = fake_response(&txid, external, true);
        assert_eq!(parse_binding_response(&response, &txid).unwrap(), external);

        let response = fake_response(&txid, external, false);
        assert_eq!(parse_binding_response(&response, &txid).unwrap(), external);
    }

    #[test]
    fn rejects_wrong_transaction() {
        let (txid, _) = build_binding_request();
        let response = fake_response(&txid, "198.51.100.7:40123".parse().unwrap(), true);

        let wrong = [9u8; 12];
        assert!(parse_binding_response(&response, &wrong).is_err());
    }

    #[test]
    fn request_has_magic_cookie() {
        let (_, packet) = build_binding_request();
        assert_eq!(&packet[4..8], &STUN_MAGIC.to_be_bytes());
        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), BINDING_REQUEST);
    }
}
