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

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// AES-256-GCM sealing
pub mod aead;

/// HKDF-SHA256 derivations
pub mod kdf;

/// P-256 keypairs, ECDSA signatures, DER encodings
pub mod keys;
pub use keys::Keypair;

/// Number of bytes in a fingerprint (SHA-256 output)
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 digest of a DER-encoded long-term public key.
///
/// Displayed as uppercase hex; the first four bytes form the
/// discriminator appended to usernames.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Compute the fingerprint of a DER-encoded public key.
    pub fn of_der(public_key_der: &[u8]) -> Self {
        let digest = Sha256::digest(public_key_der);
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FINGERPRINT_SIZE {
            return Err(Error::MalformedPacket("bad fingerprint length".to_string()))
        }
        let mut inner = [0u8; FINGERPRINT_SIZE];
        inner.copy_from_slice(bytes);
        Ok(Self(inner))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| Error::MalformedPacket("bad fingerprint hex".into()))?;
        Self::from_bytes(&bytes)
    }

    /// First 8 hex characters, used to disambiguate usernames.
    pub fn discriminator(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.discriminator())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminator_is_first_four_bytes() {
        let fp = Fingerprint([0xAB; 32]);
        assert_eq!(fp.discriminator(), "ABABABAB");
        assert_eq!(fp.to_string().len(), 64);
    }
}
