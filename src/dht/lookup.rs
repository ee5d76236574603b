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

//! Iterative lookup.
//!
//! Keeps a shortlist ordered by XOR distance to the target and fires
//! up to α queries at the closest unqueried contacts per round. A
//! FIND_VALUE lookup returns as soon as any responder yields a valid
//! signed announcement inside the acceptance window.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use super::{
    message::{ContactInfo, RpcBody},
    node_id::{NodeId, NODE_ID_SIZE},
    record::PeerAnnouncement,
    Dht,
};
use crate::{Error, Result};

enum LookupMode {
    Nodes,
    Value,
}

enum QueryOutcome {
    Contacts(Vec<ContactInfo>),
    Record(PeerAnnouncement),
    Unreachable,
}

impl Dht {
    /// Converge on the K contacts closest to `target`.
    pub async fn lookup_nodes(self: &std::sync::Arc<Self>, target: &NodeId) -> Vec<ContactInfo> {
        match self.iterative(target, LookupMode::Nodes).await {
            Ok(LookupOutput::Nodes(contacts)) => contacts,
            _ => vec![],
        }
    }

    /// Resolve a record key. Fails with `ValueNotFound` only after the
    /// lookup fully converges without a valid record.
    pub async fn lookup_value(self: &std::sync::Arc<Self>, key: &NodeId) -> Result<PeerAnnouncement> {
        match self.iterative(key, LookupMode::Value).await? {
            LookupOutput::Record(record) => Ok(record),
            LookupOutput::Nodes(_) => Err(Error::ValueNotFound),
        }
    }

    async fn iterative(
        self: &std::sync::Arc<Self>,
        target: &NodeId,
        mode: LookupMode,
    ) -> Result<LookupOutput> {
        let mut shortlist: BTreeMap<[u8; NODE_ID_SIZE], ContactInfo> = BTreeMap::new();
        let mut queried: HashSet<NodeId> = HashSet::new();
        queried.insert(self.local_id());

        for contact in self.table.closest(target, self.settings.k).await {
            shortlist
                .insert(contact.id.distance(target), ContactInfo { id: contact.id, addr: contact.addr });
        }

        loop {
            let batch: Vec<ContactInfo> = shortlist
                .values()
                .filter(|c| !queried.contains(&c.id))
                .take(self.settings.alpha)
                .cloned()
                .collect();

            if batch.is_empty() {
                break
            }

            for contact in &batch {
                queried.insert(contact.id);
            }

            let queries = batch.iter().map(|contact| self.query_one(contact, target, &mode));
            for outcome in futures::future::join_all(queries).await {
                match outcome {
                    QueryOutcome::Record(record) => return Ok(LookupOutput::Record(record)),
                    QueryOutcome::Contacts(contacts) => {
                        for contact in contacts {
                            if contact.id == self.local_id() {
                                continue
                            }
                            shortlist.entry(contact.id.distance(target)).or_insert(contact);
                        }
                    }
                    QueryOutcome::Unreachable => {}
                }
            }
        }

        let closest: Vec<ContactInfo> =
            shortlist.into_values().take(self.settings.k).collect();
        debug!(target: "dht::lookup()", "Lookup converged with {} contacts", closest.len());
        Ok(LookupOutput::Nodes(closest))
    }

    async fn query_one(
        self: &std::sync::Arc<Self>,
        contact: &ContactInfo,
        target: &NodeId,
        mode: &LookupMode,
    ) -> QueryOutcome {
        match mode {
            LookupMode::Nodes => match self.find_node_rpc(contact, target).await {
                Ok(contacts) => QueryOutcome::Contacts(contacts),
                Err(_) => QueryOutcome::Unreachable,
            },
            LookupMode::Value => match self.find_value_rpc(contact, target).await {
                Ok(RpcBody::ValueRecord { record }) => {
                    // A bad record from one responder must not abort the
                    // whole lookup; it just counts against the source.
                    if record.verify().is_ok() && record.is_fresh() && record.key() == *target {
                        QueryOutcome::Record(record)
                    } else {
                        debug!(
                            target: "dht::lookup()",
                            "Discarding invalid record from {}", contact.addr
                        );
                        self.strike(contact.addr.ip()).await;
                        QueryOutcome::Contacts(vec![])
                    }
                }
                Ok(RpcBody::ValueNodes { contacts }) => QueryOutcome::Contacts(contacts),
                _ => QueryOutcome::Unreachable,
            },
        }
    }
}

enum LookupOutput {
    Nodes(Vec<ContactInfo>),
    Record(PeerAnnouncement),
}
