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

use zeroize::Zeroize;

use crate::{
    crypto::{aead, kdf::hkdf_derive},
    Result,
};

/// HKDF salt binding keys to this protocol revision
pub const SESSION_SALT: &[u8] = b"ANONET_SESSION_V1";

const ENC_KEY_INFO: &[u8] = b"ANONET_ENC_KEY";
const NONCE_BASE_INFO: &[u8] = b"ANONET_NONCE_BASE";

/// Symmetric material for one authenticated channel: a 32-byte AES key
/// and a 12-byte nonce base. Immutable after derivation, zeroed on drop.
pub struct SessionKeys {
    key: [u8; aead::KEY_SIZE],
    nonce_base: [u8; aead::NONCE_SIZE],
}

impl SessionKeys {
    /// Derive the channel keys from an ECDH shared secret and the
    /// ordered concatenation of both ephemeral public keys.
    pub fn derive(shared_secret: &[u8], combined_publics: &[u8]) -> Result<Self> {
        let mut key = [0u8; aead::KEY_SIZE];
        let mut nonce_base = [0u8; aead::NONCE_SIZE];

        let key_info = [ENC_KEY_INFO, combined_publics].concat();
        hkdf_derive(SESSION_SALT, shared_secret, &key_info, &mut key)?;

        let nonce_info = [NONCE_BASE_INFO, combined_publics].concat();
        hkdf_derive(SESSION_SALT, shared_secret, &nonce_info, &mut nonce_base)?;

        Ok(Self { key, nonce_base })
    }

    pub fn key(&self) -> &[u8; aead::KEY_SIZE] {
        &self.key
    }

    /// Record nonce: the nonce base with the big-endian sequence number
    /// XORed into the low 8 bytes.
    pub fn compute_nonce(&self, seq: u64) -> [u8; aead::NONCE_SIZE] {
        let mut nonce = self.nonce_base;
        let seq_bytes = seq.to_be_bytes();
        for (n, s) in nonce[4..].iter_mut().zip(seq_bytes.iter()) {
            *n ^= s;
        }
        nonce
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce_base.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_varies_with_sequence() {
        let keys = SessionKeys::derive(b"shared", b"combined").unwrap();

        assert_eq!(keys.compute_nonce(0), keys.compute_nonce(0));
        assert_ne!(keys.compute_nonce(0), keys.compute_nonce(1));
        assert_ne!(keys.compute_nonce(1), keys.compute_nonce(1 << 40));
    }

    #[test]
    fn both_sides_agree() {
        let a = SessionKeys::derive(b"shared", b"combined").unwrap();
        let b = SessionKeys::derive(b"shared", b"combined").unwrap();

        assert_eq!(a.key(), b.key());
        for n in [0u64, 1, 7, u32::MAX as u64, 1 << 63] {
            assert_eq!(a.compute_nonce(n), b.compute_nonce(n));
        }
    }
}
