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

use rand::{rngs::OsRng, RngCore};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{crypto::Fingerprint, Error, Result};

/// Number of bytes in a node ID (160 bits)
pub const NODE_ID_SIZE: usize = 20;

/// Number of bits in a node ID, and so the number of k-buckets
pub const NODE_ID_BITS: usize = NODE_ID_SIZE * 8;

/// 160-bit identifier for both nodes and record keys. XOR distance on
/// the raw bytes is the routing metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_SIZE]);

impl NodeId {
    /// Node ID of an identity: SHA-256 of the fingerprint, truncated.
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        let digest = Sha256::digest(fingerprint.as_bytes());
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest[..NODE_ID_SIZE]);
        Self(id)
    }

    /// Record key of a username: its SHA-1 digest.
    pub fn hash_key(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn random() -> Self {
        let mut id = [0u8; NODE_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_ID_SIZE {
            return Err(Error::MalformedPacket("bad node id length".to_string()))
        }
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// XOR distance to another ID. Comparing the resulting arrays
    /// lexicographically yields the Kademlia total order.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_SIZE] {
        let mut dist = [0u8; NODE_ID_SIZE];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the first differing bit from the most significant end,
    /// which is the bucket owning `other`. `None` when the IDs are
    /// equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        for byte in 0..NODE_ID_SIZE {
            let diff = self.0[byte] ^ other.0[byte];
            if diff != 0 {
                return Some(byte * 8 + diff.leading_zeros() as usize)
            }
        }
        None
    }

    /// A random ID falling into bucket `index` of `self`'s table:
    /// shares the first `index` bits, differs at bit `index`.
    pub fn random_in_bucket(&self, index: usize) -> Self {
        let mut id = self.0;
        let mut tail = [0u8; NODE_ID_SIZE];
        OsRng.fill_bytes(&mut tail);

        // Randomize every bit after `index`.
        for bit in index + 1..NODE_ID_BITS {
            let (byte, mask) = (bit / 8, 0x80u8 >> (bit % 8));
            if tail[byte] & mask != 0 {
                id[byte] ^= mask;
            }
        }

        // Flip bit `index` so the ID lands in the wanted bucket.
        id[index / 8] ^= 0x80u8 >> (index % 8);
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let x = NodeId::random();
        let y = NodeId::random();

        assert_eq!(x.distance(&y), y.distance(&x));
        assert_eq!(x.distance(&x), [0u8; NODE_ID_SIZE]);
    }

    #[test]
    fn bucket_index_is_first_differing_bit() {
        let a = NodeId([0u8; NODE_ID_SIZE]);

        let mut b = [0u8; NODE_ID_SIZE];
        b[0] = 0x80;
        assert_eq!(a.bucket_index(&NodeId(b)), Some(0));

        let mut c = [0u8; NODE_ID_SIZE];
        c[2] = 0x01;
        assert_eq!(a.bucket_index(&NodeId(c)), Some(23));

        assert_eq!(a.bucket_index(&a), None);
    }

    #[test]
    fn random_in_bucket_lands_in_bucket() {
        let local = NodeId::random();
        for index in [0usize, 7, 63, 159] {
            let id = local.random_in_bucket(index);
            assert_eq!(local.bucket_index(&id), Some(index));
        }
    }
}
