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

//! Persistence interfaces.
//!
//! The core consumes only these small traits; the flat-file
//! implementations live alongside them and keep everything under
//! `~/.anonet/`. Every fault surfaces as the single storage error
//! kind and never crosses the network boundary.

use crate::{crypto::Fingerprint, util::time::Timestamp, Result};

/// Flat-file implementations
pub mod file;
pub use file::{FileContactStore, FileIdentityStore};

/// What the identity backup holds: enough to re-derive everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredIdentity {
    pub name: String,
    pub mnemonic: String,
}

/// A known peer as persisted in the contact list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub display_name: String,
    pub username: String,
    pub fingerprint: Fingerprint,
    pub public_key_der: Vec<u8>,
    pub added_at: Timestamp,
    pub last_seen: Option<Timestamp>,
    pub favorite: bool,
    pub notes: String,
}

/// Identity backup persistence.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>>;
    fn save(&self, identity: &StoredIdentity) -> Result<()>;
}

/// Contact list persistence.
pub trait ContactStore: Send + Sync {
    fn lookup_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Contact>>;
    fn update_last_seen(&self, fingerprint: &Fingerprint, when: Timestamp) -> Result<()>;
    fn upsert(&self, contact: &Contact) -> Result<()>;
    fn all(&self) -> Result<Vec<Contact>>;
}
