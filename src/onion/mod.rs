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

//! 3-hop onion overlay.
//!
//! Built on the same carriers as everything else: cells travel over
//! reliable-UDP connections or relay pairings. No single hop learns
//! both the initiator's address and the destination.

/// Fixed-size cells and layered sealing
pub mod cell;
pub use cell::{Cell, CellCmd, CELL_SIZE};

/// Initiator-side circuits
pub mod circuit;
pub use circuit::{Circuit, CIRCUIT_LIFETIME};

/// Relay-side circuit service
pub mod service;
pub use service::{serve_circuit, HopDialer, HopStats};
