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

//! NAT traversal: external-address probing and UDP hole punching.

/// Hole punch exchange
pub mod punch;
pub use punch::{hole_punch, punch_responder};

/// External address probe
pub mod stun;
pub use stun::probe_external_addr;

use crate::{dht::record::MAX_PORT_CANDIDATES, settings::DEFAULT_TRANSPORT_PORT};

/// Default transport port, always worth trying as a candidate.
pub const WELL_KNOWN_TRANSPORT_PORT: u16 = DEFAULT_TRANSPORT_PORT;

/// The ordered candidate set advertised in announcements: the bound
/// port first, the well-known port, then ±1 around the primary.
pub fn port_candidates(primary: u16) -> Vec<u16> {
    let mut candidates = vec![primary, WELL_KNOWN_TRANSPORT_PORT];
    if primary < u16::MAX {
        candidates.push(primary + 1);
    }
    if primary > 1 {
        candidates.push(primary - 1);
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|p| seen.insert(*p));
    candidates.truncate(MAX_PORT_CANDIDATES);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_start_with_primary_and_cap_at_four() {
        let candidates = port_candidates(40000);
        assert_eq!(candidates[0], 40000);
        assert!(candidates.contains(&WELL_KNOWN_TRANSPORT_PORT));
        assert!(candidates.contains(&40001));
        assert!(candidates.len() <= MAX_PORT_CANDIDATES);
    }

    #[test]
    fn candidates_deduplicate_on_well_known_port() {
        let candidates = port_candidates(WELL_KNOWN_TRANSPORT_PORT);
        assert_eq!(candidates[0], WELL_KNOWN_TRANSPORT_PORT);
        let unique: std::collections::HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }
}
