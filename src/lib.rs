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

//! AnoNet: anonymous peer-to-peer file transfer.
//!
//! Identities are P-256 keypairs derived from a 12-word mnemonic.
//! Peers announce themselves in a Kademlia-style DHT, reach each other
//! with UDP hole punching over a reliable-UDP transport (falling back
//! to a TCP relay), optionally wrap the carrier in a 3-hop onion
//! circuit, and run every application byte through an authenticated
//! AEAD channel.

/// Crypto primitives
pub mod crypto;

/// Distributed hash table
pub mod dht;

/// Error handling
pub mod error;
pub use error::{Error, Result};

/// Typed event fan-out
pub mod event;

/// Mnemonic-derived identities
pub mod identity;

/// Carrier abstraction shared by all transports
pub mod link;

/// NAT traversal
pub mod nat;

/// Node orchestration
pub mod node;
pub use node::{Node, NodePtr};

/// Onion overlay
pub mod onion;

/// TCP relay
pub mod relay;

/// Reliable UDP transport
pub mod rudp;

/// Authenticated sessions
pub mod session;

/// Node configuration
pub mod settings;
pub use settings::Settings;

/// Persistence interfaces
pub mod store;

/// Executor, tasks, pubsub, timers
pub mod system;

/// File transfer protocol
pub mod transfer;

/// Various utilities
pub mod util;
