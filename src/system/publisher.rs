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

use std::{collections::HashMap, sync::Arc, time::Duration};

use smol::lock::Mutex;

use super::io_timeout;
use crate::Result;

pub type PublisherPtr<T> = Arc<Publisher<T>>;

/// Subscription ID, unique per publisher
pub type SubscriptionId = u64;

/// Multi-subscriber fan-out of cloneable values. Subscribers each get
/// their own unbounded queue; a slow subscriber never blocks `notify`.
pub struct Publisher<T> {
    subs: Mutex<HashMap<SubscriptionId, smol::channel::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    pub fn new() -> PublisherPtr<T> {
        Arc::new(Self { subs: Mutex::new(HashMap::new()) })
    }

    pub async fn subscribe(self: Arc<Self>) -> Subscription<T> {
        let id = rand::random::<SubscriptionId>();
        let (sender, recv_queue) = smol::channel::unbounded();
        self.subs.lock().await.insert(id, sender);
        Subscription { id, recv_queue, parent: self.clone() }
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.lock().await.remove(&id);
    }

    pub async fn notify(&self, value: T) {
        let mut closed = vec![];

        for (id, sub) in self.subs.lock().await.iter() {
            if sub.send(value.clone()).await.is_err() {
                closed.push(*id);
            }
        }

        for id in closed {
            self.unsubscribe(id).await;
        }
    }
}

/// Receiving end handed out by [`Publisher::subscribe`]
pub struct Subscription<T> {
    id: SubscriptionId,
    recv_queue: smol::channel::Receiver<T>,
    parent: PublisherPtr<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub async fn receive(&self) -> Result<T> {
        Ok(self.recv_queue.recv().await?)
    }

    pub async fn receive_with_timeout(&self, duration: Duration) -> Result<T> {
        io_timeout(duration, self.receive()).await
    }

    pub async fn unsubscribe(&self) {
        self.parent.unsubscribe(self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_fanout() {
        smol::block_on(async {
            let publisher: PublisherPtr<u32> = Publisher::new();
            let sub_a = publisher.clone().subscribe().await;
            let sub_b = publisher.clone().subscribe().await;

            publisher.notify(7).await;

            assert_eq!(sub_a.receive().await.unwrap(), 7);
            assert_eq!(sub_b.receive().await.unwrap(), 7);

            sub_b.unsubscribe().await;
            publisher.notify(9).await;
            assert_eq!(sub_a.receive().await.unwrap(), 9);
        });
    }
}
