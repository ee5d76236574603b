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

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};

use crate::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Seal a plaintext with AES-256-GCM. The returned ciphertext carries
/// the 16-byte authentication tag appended.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Crypto("AEAD seal failed".to_string()))
}

/// Open a sealed ciphertext. Fails if the tag does not verify.
pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("AEAD open failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];

        let ct = encrypt(&key, &nonce, b"datagram").unwrap();
        assert_eq!(ct.len(), 8 + TAG_SIZE);
        assert_eq!(decrypt(&key, &nonce, &ct).unwrap(), b"datagram");
    }

    #[test]
    fn tamper_fails_open() {
        let key = [7u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];

        let mut ct = encrypt(&key, &nonce, b"datagram").unwrap();
        ct[0] ^= 1;
        assert!(decrypt(&key, &nonce, &ct).is_err());
    }
}
