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

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

pub type LinkPtr = Arc<dyn Link>;

/// A message-oriented bidirectional carrier between two endpoints.
///
/// Reliable-UDP connections, relay pairings and onion circuits all
/// implement this, so the session layer and everything above it is
/// carrier-agnostic. Message boundaries are preserved; ordering is
/// FIFO per direction.
#[async_trait]
pub trait Link: Send + Sync {
    /// Queue one message for the peer.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Wait for the next message from the peer.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Close the carrier, flushing any goodbye the transport requires.
    async fn close(&self) -> Result<()>;

    /// Largest message this carrier accepts in one `send`.
    fn max_message_size(&self) -> usize;
}

#[cfg(test)]
pub mod test_util {
    //! In-process link pair used by unit tests.

    use super::*;

    pub struct PipeLink {
        tx: smol::channel::Sender<Vec<u8>>,
        rx: smol::channel::Receiver<Vec<u8>>,
    }

    /// Two connected in-memory links.
    pub fn pipe() -> (Arc<PipeLink>, Arc<PipeLink>) {
        let (a_tx, b_rx) = smol::channel::unbounded();
        let (b_tx, a_rx) = smol::channel::unbounded();
        (Arc::new(PipeLink { tx: a_tx, rx: a_rx }), Arc::new(PipeLink { tx: b_tx, rx: b_rx }))
    }

    #[async_trait]
    impl Link for PipeLink {
        async fn send(&self, data: &[u8]) -> Result<()> {
            Ok(self.tx.send(data.to_vec()).await?)
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            Ok(self.rx.recv().await?)
        }

        async fn close(&self) -> Result<()> {
            self.tx.close();
            self.rx.close();
            Ok(())
        }

        fn max_message_size(&self) -> usize {
            usize::MAX
        }
    }
}
