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

use std::{net::SocketAddr, sync::Arc};

use crate::{
    crypto::Fingerprint,
    system::{Publisher, PublisherPtr, Subscription},
    Result,
};

pub type EventBusPtr = Arc<EventBus>;

/// Network events observable by the application layer.
///
/// Components publish these instead of invoking registered callbacks;
/// any number of observers can subscribe, optionally filtered by kind.
#[derive(Clone, Debug)]
pub enum Event {
    /// A peer announcement was resolved from the DHT
    PeerResolved { username: String, fingerprint: Fingerprint },
    /// A hole punch round trip completed
    PunchSucceeded { peer: Fingerprint, addr: SocketAddr },
    /// The hole punch budget elapsed without a matching packet
    PunchFailed { peer: Fingerprint },
    /// An authenticated channel is up
    ChannelEstablished { peer: Fingerprint, route: Route },
    /// An authenticated channel went away
    ChannelClosed { peer: Fingerprint },
    /// File transfer progress, in bytes
    TransferProgress { filename: String, written: u64, total: u64 },
    /// File transfer finished and the digest checked out
    TransferComplete { filename: String },
    /// The relay accepted a pairing
    RelayPaired { session_id: String, peer: Fingerprint },
    /// A 3-hop circuit finished construction
    CircuitBuilt { exit: SocketAddr },
    /// A circuit was torn down
    CircuitDestroyed,
}

/// How a channel to a peer is carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relayed,
    Onion,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Relayed => write!(f, "relayed"),
            Self::Onion => write!(f, "onion"),
        }
    }
}

/// Discriminant used for subscription filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    PeerResolved,
    PunchSucceeded,
    PunchFailed,
    ChannelEstablished,
    ChannelClosed,
    TransferProgress,
    TransferComplete,
    RelayPaired,
    CircuitBuilt,
    CircuitDestroyed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PeerResolved { .. } => EventKind::PeerResolved,
            Self::PunchSucceeded { .. } => EventKind::PunchSucceeded,
            Self::PunchFailed { .. } => EventKind::PunchFailed,
            Self::ChannelEstablished { .. } => EventKind::ChannelEstablished,
            Self::ChannelClosed { .. } => EventKind::ChannelClosed,
            Self::TransferProgress { .. } => EventKind::TransferProgress,
            Self::TransferComplete { .. } => EventKind::TransferComplete,
            Self::RelayPaired { .. } => EventKind::RelayPaired,
            Self::CircuitBuilt { .. } => EventKind::CircuitBuilt,
            Self::CircuitDestroyed => EventKind::CircuitDestroyed,
        }
    }
}

/// Event fan-out shared by all node components.
pub struct EventBus {
    publisher: PublisherPtr<Event>,
}

impl EventBus {
    pub fn new() -> EventBusPtr {
        Arc::new(Self { publisher: Publisher::new() })
    }

    pub async fn publish(&self, event: Event) {
        self.publisher.notify(event).await;
    }

    /// Subscribe to all events, or only to one kind if `filter` is given.
    pub async fn subscribe(&self, filter: Option<EventKind>) -> EventSubscription {
        EventSubscription { sub: self.publisher.clone().subscribe().await, filter }
    }
}

/// A (possibly filtered) stream of events.
pub struct EventSubscription {
    sub: Subscription<Event>,
    filter: Option<EventKind>,
}

impl EventSubscription {
    /// Wait for the next matching event.
    pub async fn receive(&self) -> Result<Event> {
        loop {
            let event = self.sub.receive().await?;
            match self.filter {
                Some(kind) if event.kind() != kind => continue,
                _ => return Ok(event),
            }
        }
    }

    pub async fn unsubscribe(&self) {
        self.sub.unsubscribe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_subscription() {
        smol::block_on(async {
            let bus = EventBus::new();
            let sub = bus.subscribe(Some(EventKind::CircuitDestroyed)).await;

            bus.publish(Event::TransferComplete { filename: "x".into() }).await;
            bus.publish(Event::CircuitDestroyed).await;

            let event = sub.receive().await.unwrap();
            assert_eq!(event.kind(), EventKind::CircuitDestroyed);
        });
    }
}
