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

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use p256::SecretKey;
use sha2::Sha512;

use crate::{Error, Result};

/// P-256 group order n, big-endian.
const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63,
    0x25, 0x51,
];

/// Map a 64-byte BIP-39 seed onto a valid P-256 scalar:
/// `scalar = (seed mod (n-1)) + 1`, retried with
/// `HMAC-SHA512(seed, "retry")` should the derivation ever
/// fail to produce a usable scalar.
pub fn secret_key_from_seed(seed: &[u8]) -> Result<SecretKey> {
    let order = BigUint::from_bytes_be(&CURVE_ORDER);
    let order_minus_one = &order - 1u8;

    let mut material = seed.to_vec();
    for _ in 0..8 {
        let scalar = (BigUint::from_bytes_be(&material) % &order_minus_one) + 1u8;

        let scalar_bytes = scalar.to_bytes_be();
        let mut padded = [0u8; 32];
        padded[32 - scalar_bytes.len()..].copy_from_slice(&scalar_bytes);

        match SecretKey::from_slice(&padded) {
            Ok(secret) => return Ok(secret),
            Err(_) => material = rehash(&material)?,
        }
    }

    Err(Error::KeyDerivationFailed("scalar derivation exhausted retries".to_string()))
}

fn rehash(material: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha512>::new_from_slice(material)
        .map_err(|_| Error::KeyDerivationFailed("HMAC init".to_string()))?;
    mac.update(b"retry");
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_in_range_and_deterministic() {
        let seed = [0x5au8; 64];

        let a = secret_key_from_seed(&seed).unwrap();
        let b = secret_key_from_seed(&seed).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());

        // Never the zero scalar
        assert_ne!(a.to_bytes().as_slice(), &[0u8; 32]);
    }

    #[test]
    fn distinct_seeds_distinct_scalars() {
        let a = secret_key_from_seed(&[1u8; 64]).unwrap();
        let b = secret_key_from_seed(&[2u8; 64]).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }
}
