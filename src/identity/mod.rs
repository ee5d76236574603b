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

use bip39::{Language, Mnemonic, MnemonicType, Seed};

use crate::{
    crypto::{Fingerprint, Keypair},
    Error, Result,
};

/// Deterministic seed-to-scalar derivation
pub mod mnemonic;
use mnemonic::secret_key_from_seed;

/// A long-term identity derived from a 12-word mnemonic.
///
/// The keypair never rotates for a given mnemonic; the fingerprint is
/// the stable network-wide identifier and the discriminator suffix
/// disambiguates display names.
#[derive(Clone)]
pub struct Identity {
    name: String,
    keypair: Keypair,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Create a fresh identity. Returns the identity and the mnemonic
    /// phrase the user must back up.
    pub fn generate(name: &str) -> Result<(Self, String)> {
        let mnemonic = Mnemonic::new(MnemonicType::Words12, Language::English);
        let phrase = mnemonic.phrase().to_string();
        let identity = Self::from_mnemonic(name, &phrase)?;
        Ok((identity, phrase))
    }

    /// Recover an identity from its mnemonic phrase.
    pub fn from_mnemonic(name: &str, phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::from_phrase(phrase, Language::English)
            .map_err(|e| Error::Crypto(format!("invalid mnemonic: {e}")))?;

        let seed = Seed::new(&mnemonic, "");
        let secret = secret_key_from_seed(seed.as_bytes())?;
        let keypair = Keypair::from_secret(secret);
        let fingerprint = keypair.fingerprint()?;

        Ok(Self { name: name.to_string(), keypair, fingerprint })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Display name in `name#DISCRIMINATOR` form. This is also the
    /// string hashed into the DHT announcement key.
    pub fn username(&self) -> String {
        format!("{}#{}", self.name, self.fingerprint.discriminator())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Identity({})", self.username())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE_PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derivation_is_deterministic() {
        let a = Identity::from_mnemonic("alice", REFERENCE_PHRASE).unwrap();
        let b = Identity::from_mnemonic("alice", REFERENCE_PHRASE).unwrap();

        assert_eq!(a.keypair().public_der().unwrap(), b.keypair().public_der().unwrap());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.username(), b.username());
    }

    #[test]
    fn different_mnemonics_differ() {
        let (x, phrase) = Identity::generate("bob").unwrap();
        let y = Identity::from_mnemonic("bob", &phrase).unwrap();
        let z = Identity::from_mnemonic("bob", REFERENCE_PHRASE).unwrap();

        assert_eq!(x.fingerprint(), y.fingerprint());
        assert_ne!(x.fingerprint(), z.fingerprint());
    }

    #[test]
    fn rejects_bad_phrase() {
        assert!(Identity::from_mnemonic("eve", "notaword ".repeat(12).trim()).is_err());
    }

    #[test]
    fn username_carries_discriminator() {
        let identity = Identity::from_mnemonic("alice", REFERENCE_PHRASE).unwrap();
        let username = identity.username();
        let (name, disc) = username.split_once('#').unwrap();
        assert_eq!(name, "alice");
        assert_eq!(disc.len(), 8);
        assert_eq!(disc, identity.fingerprint().discriminator());
    }
}
