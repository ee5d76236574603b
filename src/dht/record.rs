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

use std::net::IpAddr;

use super::{
    message::{read_addr, write_addr, ByteReader},
    node_id::NodeId,
};
use crate::{
    crypto::{keys as crypto_keys, Fingerprint},
    identity::Identity,
    util::time::Timestamp,
    Error, Result,
};

/// An announcement must advertise between 1 and 4 hole-punch ports.
pub const MAX_PORT_CANDIDATES: usize = 4;

/// Records older or newer than this are rejected on receive (±24 h).
pub const ACCEPTANCE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Signed record placed in the DHT under `SHA-1(username)`,
/// advertising where an identity can currently be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub username: String,
    pub fingerprint: Fingerprint,
    pub public_key_der: Vec<u8>,
    /// External address learned from the STUN probe
    pub address: IpAddr,
    /// Ordered UDP hole-punch candidates, 1..=4
    pub port_candidates: Vec<u16>,
    pub timestamp: Timestamp,
    /// DER ECDSA signature over the canonical serialization
    pub signature: Vec<u8>,
}

impl PeerAnnouncement {
    /// Build and sign an announcement for our own identity.
    pub fn new_signed(
        identity: &Identity,
        address: IpAddr,
        port_candidates: Vec<u16>,
    ) -> Result<Self> {
        if port_candidates.is_empty() || port_candidates.len() > MAX_PORT_CANDIDATES {
            return Err(Error::MalformedPacket("bad port candidate count".to_string()))
        }

        let mut announcement = Self {
            username: identity.username(),
            fingerprint: identity.fingerprint(),
            public_key_der: identity.keypair().public_der()?,
            address,
            port_candidates,
            timestamp: Timestamp::current_time(),
            signature: vec![],
        };

        announcement.signature = identity.keypair().sign(&announcement.canonical_bytes());
        Ok(announcement)
    }

    /// DHT key this record lives under.
    pub fn key(&self) -> NodeId {
        NodeId::hash_key(self.username.as_bytes())
    }

    /// The byte sequence covered by the signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);

        let username = self.username.as_bytes();
        out.extend_from_slice(&(username.len() as u16).to_be_bytes());
        out.extend_from_slice(username);

        out.extend_from_slice(self.fingerprint.as_bytes());

        out.extend_from_slice(&(self.public_key_der.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.public_key_der);

        write_addr(&mut out, &self.address);

        out.push(self.port_candidates.len() as u8);
        for port in &self.port_candidates {
            out.extend_from_slice(&port.to_be_bytes());
        }

        out.extend_from_slice(&self.timestamp.inner().to_be_bytes());
        out
    }

    /// Structural and cryptographic validity: the fingerprint matches
    /// the carried key, the candidate count is sane and the signature
    /// verifies. Freshness is checked separately on receive.
    pub fn verify(&self) -> Result<()> {
        if self.port_candidates.is_empty() || self.port_candidates.len() > MAX_PORT_CANDIDATES {
            return Err(Error::MalformedPacket("bad port candidate count".to_string()))
        }

        if Fingerprint::of_der(&self.public_key_der) != self.fingerprint {
            return Err(Error::AuthFailed("announcement fingerprint mismatch".to_string()))
        }

        let public = crypto_keys::public_from_der(&self.public_key_der)?;
        crypto_keys::verify(&public, &self.canonical_bytes(), &self.signature)
    }

    /// Whether the timestamp falls inside the ±24 h acceptance window.
    pub fn is_fresh(&self) -> bool {
        self.timestamp.abs_diff(&Timestamp::current_time()) <= ACCEPTANCE_WINDOW_MS
    }

    /// Wire form: canonical bytes followed by the signature.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.canonical_bytes());
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
    }

    pub(crate) fn decode(reader: &mut ByteReader) -> Result<Self> {
        let username_len = reader.take_u16()? as usize;
        let username = std::str::from_utf8(reader.take(username_len)?)
            .map_err(|_| Error::MalformedPacket("username not UTF-8".to_string()))?
            .to_string();

        let fingerprint = Fingerprint::from_bytes(reader.take(32)?)?;

        let der_len = reader.take_u16()? as usize;
        let public_key_der = reader.take(der_len)?.to_vec();

        let address = read_addr(reader)?;

        let port_count = reader.take_u8()? as usize;
        if port_count == 0 || port_count > MAX_PORT_CANDIDATES {
            return Err(Error::MalformedPacket("bad port candidate count".to_string()))
        }
        let mut port_candidates = Vec::with_capacity(port_count);
        for _ in 0..port_count {
            port_candidates.push(reader.take_u16()?);
        }

        let timestamp = Timestamp::from_millis(reader.take_u64()?);

        let sig_len = reader.take_u16()? as usize;
        let signature = reader.take(sig_len)?.to_vec();

        Ok(Self {
            username,
            fingerprint,
            public_key_der,
            address,
            port_candidates,
            timestamp,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::message::ByteReader;

    fn announcement() -> PeerAnnouncement {
        let (identity, _) = Identity::generate("carol").unwrap();
        PeerAnnouncement::new_signed(
            &identity,
            "203.0.113.9".parse().unwrap(),
            vec![51823, 51824, 1194],
        )
        .unwrap()
    }

    #[test]
    fn signed_announcement_verifies() {
        let ann = announcement();
        assert!(ann.verify().is_ok());
        assert!(ann.is_fresh());
    }

    #[test]
    fn any_field_flip_breaks_verification() {
        let ann = announcement();

        let mut tampered = ann.clone();
        tampered.username.push('x');
        assert!(tampered.verify().is_err());

        let mut tampered = ann.clone();
        tampered.port_candidates[0] ^= 1;
        assert!(tampered.verify().is_err());

        let mut tampered = ann.clone();
        tampered.timestamp = Timestamp::from_millis(tampered.timestamp.inner() + 1);
        assert!(tampered.verify().is_err());

        let mut tampered = ann;
        tampered.address = "203.0.113.10".parse().unwrap();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn stale_record_is_not_fresh() {
        let mut ann = announcement();
        ann.timestamp = Timestamp::from_millis(
            Timestamp::current_time().inner() - ACCEPTANCE_WINDOW_MS - 1000,
        );
        assert!(!ann.is_fresh());
    }

    #[test]
    fn wire_roundtrip() {
        let ann = announcement();
        let mut bytes = Vec::new();
        ann.encode(&mut bytes);

        let mut reader = ByteReader::new(&bytes);
        let decoded = PeerAnnouncement::decode(&mut reader).unwrap();

        assert_eq!(decoded, ann);
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.key(), ann.key());
    }
}
