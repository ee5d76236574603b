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

use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    pkcs8::{DecodePublicKey, EncodePublicKey},
    PublicKey, SecretKey,
};
use rand::rngs::OsRng;

use super::Fingerprint;
use crate::{Error, Result};

/// A long-term P-256 keypair.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    pub fn random() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// DER (SubjectPublicKeyInfo) encoding of the public key.
    pub fn public_der(&self) -> Result<Vec<u8>> {
        public_to_der(&self.public)
    }

    /// SHA-256 over the DER encoding of the public key.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::of_der(&self.public_der()?))
    }

    /// ECDSA-SHA256 signature in DER form.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(self.secret.clone());
        let signature: Signature = signing_key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

/// Verify a DER ECDSA-SHA256 signature against a public key.
pub fn verify(public: &PublicKey, message: &[u8], signature_der: &[u8]) -> Result<()> {
    let signature =
        Signature::from_der(signature_der).map_err(|_| Error::SignatureVerifyFailed)?;
    let verifying_key = VerifyingKey::from(public);
    verifying_key.verify(message, &signature).map_err(|_| Error::SignatureVerifyFailed)
}

/// Parse a DER (SubjectPublicKeyInfo) public key.
pub fn public_from_der(der: &[u8]) -> Result<PublicKey> {
    PublicKey::from_public_key_der(der)
        .map_err(|e| Error::Crypto(format!("bad public key DER: {e}")))
}

/// DER-encode a public key.
pub fn public_to_der(public: &PublicKey) -> Result<Vec<u8>> {
    Ok(public
        .to_public_key_der()
        .map_err(|e| Error::Crypto(format!("public key DER encoding: {e}")))?
        .as_bytes()
        .to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keypair = Keypair::random();
        let sig = keypair.sign(b"announce");

        assert!(verify(keypair.public(), b"announce", &sig).is_ok());
        assert!(verify(keypair.public(), b"announce2", &sig).is_err());

        let other = Keypair::random();
        assert!(verify(other.public(), b"announce", &sig).is_err());
    }

    #[test]
    fn der_roundtrip_preserves_fingerprint() {
        let keypair = Keypair::random();
        let der = keypair.public_der().unwrap();
        let parsed = public_from_der(&der).unwrap();

        assert_eq!(&parsed, keypair.public());
        assert_eq!(Fingerprint::of_der(&der), keypair.fingerprint().unwrap());
    }
}
