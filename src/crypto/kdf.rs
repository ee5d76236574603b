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

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{Error, Result};

/// HKDF-SHA256 extract-and-expand into a caller-provided buffer.
pub fn hkdf_derive(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, okm)
        .map_err(|_| Error::KeyDerivationFailed("HKDF output too long".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_label_separated() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let mut c = [0u8; 32];

        hkdf_derive(b"salt", b"ikm", b"label-1", &mut a).unwrap();
        hkdf_derive(b"salt", b"ikm", b"label-1", &mut b).unwrap();
        hkdf_derive(b"salt", b"ikm", b"label-2", &mut c).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
