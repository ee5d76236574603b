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

//! Authenticated session establishment.
//!
//! A 1-RTT exchange of signed ephemeral keys over an already-connected
//! carrier. Each side signs its ephemeral P-256 public key with its
//! long-term identity key; the ECDH shared secret feeds HKDF to produce
//! the channel's AES key and nonce base. The ephemeral private key and
//! the raw shared secret are destroyed as soon as the keys are derived.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use p256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::{
    crypto::{keys as crypto_keys, Fingerprint},
    identity::Identity,
    link::LinkPtr,
    system::io_timeout,
    Error, Result,
};

/// AEAD record framing over a carrier
pub mod channel;
pub use channel::{Role, SecureChannel};

/// Channel key material
pub mod keys;
pub use keys::SessionKeys;

const AUTH_INIT_PREFIX: &str = "ANONET_AUTH_INIT";
const AUTH_RESP_PREFIX: &str = "ANONET_AUTH_RESP";
const AUTH_DONE_PREFIX: &str = "ANONET_AUTH_DONE";

/// Budget for the whole authentication exchange, per message.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A signed ephemeral key as carried in the AUTH_INIT/AUTH_RESP cells.
pub struct SignedEphemeralKey {
    /// Sender's claimed fingerprint
    pub fingerprint: Fingerprint,
    /// Ephemeral public key, uncompressed SEC1
    pub ephemeral: Vec<u8>,
    /// DER ECDSA signature by the identity key over `ephemeral`
    pub signature: Vec<u8>,
    /// Sender's long-term public key, DER
    pub identity_der: Vec<u8>,
}

impl SignedEphemeralKey {
    fn encode(&self, prefix: &str) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            prefix,
            self.fingerprint,
            BASE64.encode(&self.ephemeral),
            BASE64.encode(&self.signature),
            BASE64.encode(&self.identity_der),
        )
        .into_bytes()
    }

    fn decode(data: &[u8], prefix: &str) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::MalformedPacket("auth cell not UTF-8".to_string()))?;

        let mut parts = text.split('|');
        if parts.next() != Some(prefix) {
            return Err(Error::MalformedPacket(format!("expected {prefix} cell")))
        }

        let fingerprint = Fingerprint::from_hex(
            parts.next().ok_or_else(|| Error::MalformedPacket("missing fingerprint".into()))?,
        )?;

        let mut field = |name: &str| -> Result<Vec<u8>> {
            let b64 =
                parts.next().ok_or_else(|| Error::MalformedPacket(format!("missing {name}")))?;
            BASE64.decode(b64).map_err(|_| Error::MalformedPacket(format!("bad {name} base64")))
        };

        let ephemeral = field("ephemeral key")?;
        let signature = field("signature")?;
        let identity_der = field("identity key")?;

        Ok(Self { fingerprint, ephemeral, signature, identity_der })
    }

    /// Check internal consistency: the fingerprint must match the
    /// carried identity key and the signature must verify.
    fn verify(&self) -> Result<PublicKey> {
        if Fingerprint::of_der(&self.identity_der) != self.fingerprint {
            return Err(Error::AuthFailed("fingerprint does not match identity key".to_string()))
        }

        let identity_public = crypto_keys::public_from_der(&self.identity_der)?;
        crypto_keys::verify(&identity_public, &self.ephemeral, &self.signature)
            .map_err(|_| Error::AuthFailed("bad ephemeral key signature".to_string()))?;

        PublicKey::from_sec1_bytes(&self.ephemeral)
            .map_err(|_| Error::AuthFailed("bad ephemeral key encoding".to_string()))
    }
}

fn signed_ephemeral(identity: &Identity) -> Result<(EphemeralSecret, SignedEphemeralKey)> {
    let ephemeral_secret = EphemeralSecret::random(&mut OsRng);
    let ephemeral =
        PublicKey::from(&ephemeral_secret).to_encoded_point(false).as_bytes().to_vec();

    let signature = identity.keypair().sign(&ephemeral);
    let signed = SignedEphemeralKey {
        fingerprint: identity.fingerprint(),
        ephemeral,
        signature,
        identity_der: identity.keypair().public_der()?,
    };

    Ok((ephemeral_secret, signed))
}

/// Derive channel keys and destroy the secrets involved.
fn derive_session_keys(
    ephemeral_secret: EphemeralSecret,
    our_ephemeral: &[u8],
    their_ephemeral_public: &PublicKey,
    their_ephemeral: &[u8],
) -> Result<SessionKeys> {
    let shared = ephemeral_secret.diffie_hellman(their_ephemeral_public);

    let mut z = [0u8; 32];
    z.copy_from_slice(shared.raw_secret_bytes().as_ref());

    let combined = if our_ephemeral <= their_ephemeral {
        [our_ephemeral, their_ephemeral].concat()
    } else {
        [their_ephemeral, our_ephemeral].concat()
    };

    let session_keys = SessionKeys::derive(&z, &combined);
    z.zeroize();
    // `ephemeral_secret` and `shared` drop here and are wiped by p256.
    session_keys
}

/// Run the handshake as the connecting side.
///
/// When `expected_peer` is given (from the announcement or the contact
/// store) an identity mismatch fails authentication before any key is
/// derived.
pub async fn initiate(
    link: LinkPtr,
    identity: &Identity,
    expected_peer: Option<Fingerprint>,
) -> Result<SecureChannel> {
    debug!(target: "session::initiate()", "Sending AUTH_INIT");

    let (ephemeral_secret, ours) = signed_ephemeral(identity)?;
    link.send(&ours.encode(AUTH_INIT_PREFIX)).await?;

    let reply = io_timeout(AUTH_TIMEOUT, link.recv()).await?;
    let theirs = SignedEphemeralKey::decode(&reply, AUTH_RESP_PREFIX)?;
    let their_public = theirs.verify()?;

    if let Some(expected) = expected_peer {
        if theirs.fingerprint != expected {
            return Err(Error::FingerprintMismatch)
        }
    }

    let done = format!("{}|{}", AUTH_DONE_PREFIX, identity.fingerprint());
    link.send(done.as_bytes()).await?;

    let keys =
        derive_session_keys(ephemeral_secret, &ours.ephemeral, &their_public, &theirs.ephemeral)?;

    debug!(target: "session::initiate()", "Channel established with {}", theirs.fingerprint);
    Ok(SecureChannel::new(link, keys, Role::Initiator, theirs.fingerprint))
}

/// Run the handshake as the accepting side, with the AUTH_INIT cell
/// already read off the carrier by the caller's dispatch loop.
pub async fn respond_with_first(
    link: LinkPtr,
    identity: &Identity,
    first_cell: &[u8],
    expected_peer: Option<Fingerprint>,
) -> Result<SecureChannel> {
    let theirs = SignedEphemeralKey::decode(first_cell, AUTH_INIT_PREFIX)?;
    let their_public = theirs.verify()?;

    if let Some(expected) = expected_peer {
        if theirs.fingerprint != expected {
            return Err(Error::FingerprintMismatch)
        }
    }

    debug!(target: "session::respond()", "Sending AUTH_RESP to {}", theirs.fingerprint);
    let (ephemeral_secret, ours) = signed_ephemeral(identity)?;
    link.send(&ours.encode(AUTH_RESP_PREFIX)).await?;

    let done = io_timeout(AUTH_TIMEOUT, link.recv()).await?;
    let done_text = std::str::from_utf8(&done)
        .map_err(|_| Error::MalformedPacket("auth cell not UTF-8".to_string()))?;
    let confirmed = done_text
        .strip_prefix(AUTH_DONE_PREFIX)
        .and_then(|s| s.strip_prefix('|'))
        .and_then(|fp| Fingerprint::from_hex(fp).ok())
        .map(|fp| fp == theirs.fingerprint)
        .unwrap_or(false);
    if !confirmed {
        return Err(Error::AuthFailed("bad AUTH_DONE".to_string()))
    }

    let keys =
        derive_session_keys(ephemeral_secret, &ours.ephemeral, &their_public, &theirs.ephemeral)?;

    Ok(SecureChannel::new(link, keys, Role::Responder, theirs.fingerprint))
}

/// Run the handshake as the accepting side.
pub async fn respond(
    link: LinkPtr,
    identity: &Identity,
    expected_peer: Option<Fingerprint>,
) -> Result<SecureChannel> {
    let first = io_timeout(AUTH_TIMEOUT, link.recv()).await?;
    respond_with_first(link, identity, &first, expected_peer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_util::pipe;

    fn test_identity(name: &str) -> Identity {
        let (identity, _) = Identity::generate(name).unwrap();
        identity
    }

    #[test]
    fn handshake_derives_matching_channels() {
        smol::block_on(async {
            let alice = test_identity("alice");
            let bob = test_identity("bob");
            let (link_a, link_b) = pipe();

            let bob_fp = bob.fingerprint();
            let alice_fp = alice.fingerprint();

            let bob_task = smol::spawn({
                let bob = bob.clone();
                async move { respond(link_b, &bob, Some(alice_fp)).await }
            });

            let mut chan_a = initiate(link_a, &alice, Some(bob_fp)).await.unwrap();
            let mut chan_b = bob_task.await.unwrap();

            assert_eq!(chan_a.peer(), bob_fp);
            assert_eq!(chan_b.peer(), alice_fp);

            chan_a.send(b"hello bob").await.unwrap();
            assert_eq!(chan_b.recv().await.unwrap(), b"hello bob");

            chan_b.send(b"hello alice").await.unwrap();
            assert_eq!(chan_a.recv().await.unwrap(), b"hello alice");
        });
    }

    #[test]
    fn wrong_peer_fingerprint_fails() {
        smol::block_on(async {
            let alice = test_identity("alice");
            let bob = test_identity("bob");
            let mallory = test_identity("mallory");
            let (link_a, link_b) = pipe();

            let bob_task = smol::spawn({
                let bob = bob.clone();
                async move { respond(link_b, &bob, None).await }
            });

            // Alice expects mallory but bob answers.
            let res = initiate(link_a, &alice, Some(mallory.fingerprint())).await;
            assert!(matches!(res, Err(Error::FingerprintMismatch)));
            drop(bob_task);
        });
    }

    #[test]
    fn tampered_signature_fails() {
        smol::block_on(async {
            let alice = test_identity("alice");
            let bob = test_identity("bob");

            let (_, mut signed) = signed_ephemeral(&alice).unwrap();
            signed.signature[4] ^= 1;
            let encoded = signed.encode(AUTH_INIT_PREFIX);

            let parsed = SignedEphemeralKey::decode(&encoded, AUTH_INIT_PREFIX).unwrap();
            assert!(parsed.verify().is_err());

            // Untampered passes.
            let (_, signed) = signed_ephemeral(&bob).unwrap();
            let encoded = signed.encode(AUTH_INIT_PREFIX);
            let parsed = SignedEphemeralKey::decode(&encoded, AUTH_INIT_PREFIX).unwrap();
            assert!(parsed.verify().is_ok());
        });
    }
}
