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

use log::debug;

use super::keys::SessionKeys;
use crate::{
    crypto::{aead, Fingerprint},
    link::LinkPtr,
    Error, Result,
};

/// How far ahead of the expected sequence a record may arrive before it
/// is rejected as out-of-window.
const SEQ_WINDOW: u64 = 1000;

/// The responder's sequence counters start in the upper half of the
/// sequence space so the two directions never produce the same nonce.
const RESPONDER_SEQ_BASE: u64 = 1 << 63;

/// Which side of the handshake we were on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// An AEAD-protected bidirectional byte sequence between two
/// authenticated identities, carried over any [`crate::link::Link`].
///
/// Each outbound record is `8 B big-endian sequence || ciphertext+tag`.
/// A failed tag check surfaces as a crypto error but leaves the channel
/// usable; callers decide whether to tear down.
pub struct SecureChannel {
    link: LinkPtr,
    keys: SessionKeys,
    peer: Fingerprint,
    send_seq: u64,
    recv_expected: u64,
}

impl SecureChannel {
    pub fn new(link: LinkPtr, keys: SessionKeys, role: Role, peer: Fingerprint) -> Self {
        let (send_seq, recv_expected) = match role {
            Role::Initiator => (0, RESPONDER_SEQ_BASE),
            Role::Responder => (RESPONDER_SEQ_BASE, 0),
        };

        Self { link, keys, peer, send_seq, recv_expected }
    }

    /// Fingerprint of the authenticated remote identity.
    pub fn peer(&self) -> Fingerprint {
        self.peer
    }

    /// Encrypt a plaintext into a wire record, advancing the send
    /// counter.
    pub fn seal_record(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let seq = self.send_seq;
        let nonce = self.keys.compute_nonce(seq);
        let ciphertext = aead::encrypt(self.keys.key(), &nonce, plaintext)?;

        self.send_seq += 1;

        let mut record = Vec::with_capacity(8 + ciphertext.len());
        record.extend_from_slice(&seq.to_be_bytes());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypt a wire record, enforcing the replay and lookahead rules.
    pub fn open_record(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        if record.len() < 8 + aead::TAG_SIZE {
            return Err(Error::MalformedPacket("record too short".to_string()))
        }

        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&record[..8]);
        let seq = u64::from_be_bytes(seq_bytes);

        if seq < self.recv_expected {
            debug!(target: "session::channel", "Replayed record seq {seq}");
            return Err(Error::RecordReplayed)
        }
        if seq > self.recv_expected + SEQ_WINDOW {
            return Err(Error::SequenceOutOfWindow)
        }

        let nonce = self.keys.compute_nonce(seq);
        let plaintext = aead::decrypt(self.keys.key(), &nonce, &record[8..])?;

        self.recv_expected = seq + 1;
        Ok(plaintext)
    }

    /// Seal and transmit one application message.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        let record = self.seal_record(plaintext)?;
        self.link.send(&record).await
    }

    /// Receive and open the next application message.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let record = self.link.recv().await?;
        self.open_record(&record)
    }

    /// Largest plaintext that fits in one record on this carrier.
    pub fn max_plaintext_size(&self) -> usize {
        self.link.max_message_size().saturating_sub(8 + aead::TAG_SIZE)
    }

    /// Close the carrier. Key material is zeroed when the channel drops.
    pub async fn close(self) -> Result<()> {
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_util::pipe;

    fn channel_pair() -> (SecureChannel, SecureChannel) {
        let (link_a, link_b) = pipe();
        let keys_a = SessionKeys::derive(b"Z", b"combined").unwrap();
        let keys_b = SessionKeys::derive(b"Z", b"combined").unwrap();
        let peer = Fingerprint([9u8; 32]);

        (
            SecureChannel::new(link_a, keys_a, Role::Initiator, peer),
            SecureChannel::new(link_b, keys_b, Role::Responder, peer),
        )
    }

    #[test]
    fn roundtrip_and_replay_rejection() {
        let (mut alice, mut bob) = channel_pair();

        let record = alice.seal_record(b"x").unwrap();
        assert_eq!(bob.open_record(&record).unwrap(), b"x");

        // Second decrypt of the same record is a replay and must not
        // advance the receive counter.
        assert!(matches!(bob.open_record(&record), Err(Error::RecordReplayed)));

        let next = alice.seal_record(b"y").unwrap();
        assert_eq!(bob.open_record(&next).unwrap(), b"y");
    }

    #[test]
    fn rejects_far_ahead_sequence() {
        let (mut alice, mut bob) = channel_pair();

        for _ in 0..SEQ_WINDOW + 2 {
            let _ = alice.seal_record(b"skip").unwrap();
        }
        let record = alice.seal_record(b"late").unwrap();
        assert!(matches!(bob.open_record(&record), Err(Error::SequenceOutOfWindow)));
    }

    #[test]
    fn tampered_record_fails_but_channel_survives() {
        let (mut alice, mut bob) = channel_pair();

        let mut record = alice.seal_record(b"first").unwrap();
        *record.last_mut().unwrap() ^= 0xff;
        assert!(matches!(bob.open_record(&record), Err(Error::Crypto(_))));

        let record = alice.seal_record(b"second").unwrap();
        assert_eq!(bob.open_record(&record).unwrap(), b"second");
    }

    #[test]
    fn duplex_over_pipe() {
        smol::block_on(async {
            let (mut alice, mut bob) = channel_pair();

            alice.send(b"ping").await.unwrap();
            assert_eq!(bob.recv().await.unwrap(), b"ping");

            bob.send(b"pong").await.unwrap();
            assert_eq!(alice.recv().await.unwrap(), b"pong");
        });
    }
}
